//! Unit Conversion Utilities
//!
//! Helpers for TRX unit conversions and formatting. Amounts are carried as
//! integer base units (sun for TRX, token base units for TRC20).

/// Sun per TRX
pub const SUN_PER_TRX: u64 = 1_000_000;

/// Convert sun to TRX string (e.g., "1.500000")
pub fn sun_to_trx_string(sun: u64) -> String {
    format!("{}.{:06}", sun / SUN_PER_TRX, sun % SUN_PER_TRX)
}

/// Convert sun to human-readable string
/// e.g., 1500000 -> "1,500,000 sun (1.500000 TRX)"
pub fn sun_to_display(sun: u64) -> String {
    format!("{} sun ({} TRX)", format_with_commas(sun), sun_to_trx_string(sun))
}

/// Convert TRX to sun with proper rounding
pub fn trx_to_sun(trx: f64) -> u64 {
    (trx * SUN_PER_TRX as f64).round() as u64
}

/// Format number with thousands separators
fn format_with_commas(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    let chars: Vec<char> = s.chars().collect();

    for (i, c) in chars.iter().enumerate() {
        if i > 0 && (chars.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }

    result
}

/// Parse a base-unit amount from string
pub fn parse_amount(s: &str) -> Option<u64> {
    s.trim().replace([',', '_'], "").parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sun_to_trx() {
        assert_eq!(sun_to_trx_string(0), "0.000000");
        assert_eq!(sun_to_trx_string(1), "0.000001");
        assert_eq!(sun_to_trx_string(1_500_000), "1.500000");
    }

    #[test]
    fn test_trx_to_sun() {
        assert_eq!(trx_to_sun(0.0), 0);
        assert_eq!(trx_to_sun(0.000001), 1);
        assert_eq!(trx_to_sun(12.5), 12_500_000);
    }

    #[test]
    fn test_display_format() {
        let display = sun_to_display(1_000_000);
        assert!(display.contains("1,000,000"));
        assert!(display.contains("1.000000 TRX"));
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("1,000,000"), Some(1_000_000));
        assert_eq!(parse_amount("1_000"), Some(1000));
        assert_eq!(parse_amount("nope"), None);
    }
}
