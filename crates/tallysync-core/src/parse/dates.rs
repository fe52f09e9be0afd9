//! Date normalization.
//!
//! Accepted encodings, all resolving to one `NaiveDate`:
//! - `YYYYMMDD` tokens, as used by the XML interface
//! - ISO dates, optionally followed by a time part
//! - Tally display dates such as `1-Apr-2024` or `01-Apr-24`
//! - `DD/MM/YYYY` from spreadsheet exports
//! - spreadsheet serial numbers, counted from 1899-12-30

use chrono::{Duration, NaiveDate};

/// Largest serial spreadsheets accept (9999-12-31).
const MAX_SERIAL: f64 = 2_958_465.0;

fn serial_epoch() -> NaiveDate {
    // 1900-01-01 minus two days. Serials below 61 land one day off the
    // spreadsheet's own calendar, which is kept for compatibility with
    // values already stored by the dashboard.
    NaiveDate::from_ymd_opt(1899, 12, 30).unwrap_or(NaiveDate::MIN)
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if s.len() == 8 && s.bytes().all(|b| b.is_ascii_digit()) {
        return NaiveDate::parse_from_str(s, "%Y%m%d").ok();
    }

    if s.len() >= 10 && s.as_bytes()[4] == b'-' && s.is_char_boundary(10) {
        if let Ok(date) = NaiveDate::parse_from_str(&s[..10], "%Y-%m-%d") {
            return Some(date);
        }
    }

    // Two-digit years first: %Y would read "24" as the year 24
    for format in ["%d-%b-%y", "%d-%b-%Y", "%d/%m/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(s, format) {
            return Some(date);
        }
    }

    from_serial(s)
}

fn from_serial(s: &str) -> Option<NaiveDate> {
    let serial: f64 = s.parse().ok()?;
    if !serial.is_finite() || !(1.0..=MAX_SERIAL).contains(&serial) {
        return None;
    }
    serial_epoch().checked_add_signed(Duration::days(serial.floor() as i64))
}

/// Formats a date the way request envelopes expect it.
pub fn to_tally_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_all_encodings_agree() {
        let expected = ymd(2024, 4, 1);
        assert_eq!(parse_date("20240401"), Some(expected));
        assert_eq!(parse_date("2024-04-01"), Some(expected));
        assert_eq!(parse_date("2024-04-01T00:00:00.000Z"), Some(expected));
        assert_eq!(parse_date("45383"), Some(expected));
        assert_eq!(parse_date("45383.75"), Some(expected));
        assert_eq!(parse_date("1-Apr-2024"), Some(expected));
        assert_eq!(parse_date("01-Apr-24"), Some(expected));
        assert_eq!(parse_date("01/04/2024"), Some(expected));
    }

    #[test]
    fn test_serial_epoch_compatibility() {
        assert_eq!(parse_date("1"), Some(ymd(1899, 12, 31)));
        assert_eq!(parse_date("61"), Some(ymd(1900, 3, 1)));
        assert_eq!(parse_date("43831"), Some(ymd(2020, 1, 1)));
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!(parse_date(""), None);
        assert_eq!(parse_date("20241301"), None);
        assert_eq!(parse_date("yesterday"), None);
        assert_eq!(parse_date("0"), None);
        assert_eq!(parse_date("-5"), None);
        assert_eq!(parse_date("NaN"), None);
    }

    #[test]
    fn test_to_tally_date() {
        assert_eq!(to_tally_date(ymd(2024, 3, 9)), "20240309");
    }
}
