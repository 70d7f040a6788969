//! Money Conversion Module
//!
//! Every amount inside the ledger is an integer count of minor units (cents
//! for USD). Floating point never touches money. Conversion to a decimal
//! string happens only at the HTTP boundary, through this module.
//!
//! ```rust
//! use escrow_ledger::money::format_amount;
//!
//! assert_eq!(format_amount(10_000, "usd"), "100.00");
//! assert_eq!(format_amount(500, "jpy"), "500");
//! ```

use rust_decimal::Decimal;

/// Amount in minor units of its currency
pub type Amount = u64;

/// Currencies whose minor unit equals the major unit
const ZERO_DECIMAL_CURRENCIES: &[&str] = &[
    "bif", "clp", "djf", "gnf", "jpy", "kmf", "krw", "mga", "pyg", "rwf", "ugx", "vnd", "vuv",
    "xaf", "xof", "xpf",
];

/// Number of minor-unit digits for a currency code (case-insensitive)
pub fn minor_digits(currency: &str) -> u32 {
    let code = currency.to_ascii_lowercase();
    if ZERO_DECIMAL_CURRENCIES.contains(&code.as_str()) {
        0
    } else {
        2
    }
}

/// Render a minor-unit amount as a decimal string for clients
pub fn format_amount(amount: Amount, currency: &str) -> String {
    Decimal::from_i128_with_scale(amount as i128, minor_digits(currency)).to_string()
}

/// Normalize a currency code for storage and comparison
pub fn normalize_currency(currency: &str) -> String {
    currency.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_two_decimals() {
        assert_eq!(format_amount(10_000, "usd"), "100.00");
        assert_eq!(format_amount(9_000, "USD"), "90.00");
        assert_eq!(format_amount(5, "eur"), "0.05");
        assert_eq!(format_amount(0, "usd"), "0.00");
    }

    #[test]
    fn test_format_zero_decimal_currency() {
        assert_eq!(format_amount(1500, "jpy"), "1500");
        assert_eq!(minor_digits("KRW"), 0);
    }

    #[test]
    fn test_normalize_currency() {
        assert_eq!(normalize_currency(" USD "), "usd");
    }
}
