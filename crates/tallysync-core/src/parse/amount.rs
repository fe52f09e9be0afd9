//! Amount and quantity normalization.

use std::str::FromStr;

use rust_decimal::Decimal;

const CURRENCY_TOKENS: [&str; 9] = ["Rs.", "Rs", "INR", "USD", "₹", "$", "€", "£", "¥"];

/// Parses a locale-formatted amount into a signed decimal.
///
/// Blank input is zero. `None` means the text could not be read as a number
/// after stripping decoration; callers book zero and flag the record.
///
/// - thousands separators, whitespace and currency symbols/codes are dropped
/// - `(1,000.00)` and a trailing `Dr` are negative, a trailing `Cr` positive
/// - forex text like `$ 10.00 @ ₹ 83.00/$ = ₹ 830.00` yields the value after `=`
///
/// ```
/// use rust_decimal::Decimal;
/// use tallysync_core::parse::parse_amount;
///
/// assert_eq!(parse_amount("₹ 1,25,000.50"), Some(Decimal::new(12500050, 2)));
/// assert_eq!(parse_amount("(500)"), Some(Decimal::new(-500, 0)));
/// assert_eq!(parse_amount("N/A"), None);
/// ```
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let mut s = raw.trim();
    if s.is_empty() {
        return Some(Decimal::ZERO);
    }

    if let Some((_, base)) = s.rsplit_once('=') {
        s = base.trim();
    }

    let mut forced_sign: Option<bool> = None;
    let lower = s.to_ascii_lowercase();
    if lower.ends_with("dr") {
        forced_sign = Some(false);
        s = s[..s.len() - 2].trim_end();
    } else if lower.ends_with("cr") {
        forced_sign = Some(true);
        s = s[..s.len() - 2].trim_end();
    }

    let mut negative = false;
    if s.starts_with('(') && s.ends_with(')') && s.len() >= 2 {
        negative = true;
        s = &s[1..s.len() - 1];
    }

    let mut cleaned = s.replace('\u{2212}', "-");
    for token in CURRENCY_TOKENS {
        cleaned = cleaned.replace(token, "");
    }
    let cleaned: String = cleaned
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',' && *c != '_')
        .collect();
    let cleaned = cleaned.trim_end_matches('/');

    if cleaned.is_empty() {
        return None;
    }

    let value = Decimal::from_str(cleaned)
        .or_else(|_| Decimal::from_scientific(cleaned))
        .ok()?;

    let value = match forced_sign {
        Some(true) => value.abs(),
        Some(false) => -value.abs(),
        None if negative => -value,
        None => value,
    };
    Some(value)
}

/// Leading number and unit of a Tally quantity such as `"12.500 kg"`.
///
/// Compound quantities (`"2 Box = 24 Nos"`) keep only the first part.
pub fn parse_quantity(raw: &str) -> Option<(Decimal, Option<String>)> {
    let s = raw.split('=').next()?.trim();
    if s.is_empty() {
        return None;
    }
    let split = s
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || matches!(c, '.' | '-' | ',' | '+')))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    let number: String = s[..split].chars().filter(|c| *c != ',').collect();
    let value = Decimal::from_str(&number).ok()?;
    let unit = s[split..].trim();
    Some((value, (!unit.is_empty()).then(|| unit.to_string())))
}
