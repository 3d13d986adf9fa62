//! Shared Types Module
//!
//! Strongly-typed domain records. Rows are mapped into these once at the
//! storage boundary; every status is a closed enum.

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum using
/// the given snake_case names.
macro_rules! string_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = $crate::types::ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(Self::$variant),)+
                    other => Err($crate::types::ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

pub(crate) use string_enum;

pub mod asset;
pub mod resource;
pub mod sweep;
pub mod units;
pub mod wallet;
pub mod withdrawal;

use chrono::{DateTime, Utc};

// Re-exports for convenience
pub use asset::Asset;
pub use resource::{
    AlertMarks, DepletionForecast, FrozenStake, PoolSnapshot, ResourceBalance, ResourceKind,
    ResourcePool, ResourceStatus, ResourceUsageEntry, Thresholds,
};
pub use sweep::{QueueType, SweepQueueEntry, SweepRecord, SweepRecordStatus, SweepStatus};
pub use units::{parse_amount, sun_to_display, sun_to_trx_string, trx_to_sun, SUN_PER_TRX};
pub use wallet::{DepositAddress, MasterWallet};
pub use withdrawal::{
    BatchItem, BatchStatus, ItemOutcome, WhitelistEntry, WithdrawalBatch, WithdrawalPolicy,
    WithdrawalPriority, WithdrawalRequest, WithdrawalStatus,
};

/// Failed to parse a stored enum value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Generate a prefixed record identifier
pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

/// Convert stored unix seconds into a UTC timestamp
pub fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}
