//! Asset identifiers
//!
//! Stored as `"TRX"` or `"TRC20:<contract address>"`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ParseEnumError;

/// Asset moved by a sweep or withdrawal
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Asset {
    /// Native coin
    Trx,
    /// Token contract
    Trc20(String),
}

impl Asset {
    /// Token transfers burn energy; native transfers only bandwidth
    pub fn consumes_energy(&self) -> bool {
        matches!(self, Asset::Trc20(_))
    }

    pub fn contract(&self) -> Option<&str> {
        match self {
            Asset::Trx => None,
            Asset::Trc20(contract) => Some(contract),
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Asset::Trx => write!(f, "TRX"),
            Asset::Trc20(contract) => write!(f, "TRC20:{}", contract),
        }
    }
}

impl FromStr for Asset {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("trx") {
            return Ok(Asset::Trx);
        }
        match s.split_once(':') {
            Some((kind, contract)) if kind.eq_ignore_ascii_case("trc20") && !contract.is_empty() => {
                Ok(Asset::Trc20(contract.to_string()))
            }
            _ => Err(ParseEnumError {
                kind: "asset",
                value: s.to_string(),
            }),
        }
    }
}
