//! IR code handling
//!
//! Turns the code tokens of an inbound command into the decimal command
//! string understood by the IR transmitter firmware.
//!
//! ```text
//! ["power", "1A2B3C4D"] ──► [AliasTable] ──► ["E0E040BF", "1A2B3C4D"]
//!                                                   │
//!                                            (base 16 → base 10)
//!                                                   ▼
//!                                       "3772793023;439041101"
//! ```

pub mod alias;
pub mod error;
pub mod resolver;

pub use alias::AliasTable;
pub use error::{AliasError, CodeError};
pub use resolver::CodeResolver;

/// Separator between decimal codes in the command string
pub const CODE_SEPARATOR: &str = ";";

/// Parses a hexadecimal IR code
///
/// Accepts either case, surrounding whitespace and an optional `0x` prefix.
pub fn parse_hex(value: &str) -> Option<u64> {
    let trimmed = value.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    u64::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_prefixed_hex() {
        assert_eq!(parse_hex("E0E040BF"), Some(3_772_793_023));
        assert_eq!(parse_hex("e0e040bf"), Some(3_772_793_023));
        assert_eq!(parse_hex("0x1A2B3C4D"), Some(439_041_101));
        assert_eq!(parse_hex(" 0XFF "), Some(255));
    }

    #[test]
    fn rejects_non_hex() {
        assert_eq!(parse_hex("ZZZZ"), None);
        assert_eq!(parse_hex(""), None);
        assert_eq!(parse_hex("0x"), None);
        assert_eq!(parse_hex("+12"), None);
        assert_eq!(parse_hex("1_000"), None);
    }

    #[test]
    fn rejects_overflow() {
        assert_eq!(parse_hex("FFFFFFFFFFFFFFFF"), Some(u64::MAX));
        assert_eq!(parse_hex("10000000000000000"), None);
    }
}
