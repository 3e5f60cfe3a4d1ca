//! Version date normalization to `YYYY-MM-DD`.

use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid version date '{input}': {reason}")]
pub struct InvalidDate {
    pub input: String,
    pub reason: &'static str,
}

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

fn invalid(input: &str, reason: &'static str) -> InvalidDate {
    InvalidDate {
        input: input.to_string(),
        reason,
    }
}

fn digits(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_digit())
}

fn checked(input: &str, year: i32, month: u32, day: u32) -> Result<String, InvalidDate> {
    NaiveDate::from_ymd_opt(year, month, day)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .ok_or_else(|| invalid(input, "no such calendar date"))
}

/// Accepts `YYYY-MM-DD`, `YYYY-MM`, `YYYY` and `D[D] Mon[.] YYYY`.
/// Partial dates are completed with the first month or day.
pub fn normalize_date(raw: &str) -> Result<String, InvalidDate> {
    let input = raw.trim();
    let parts: Vec<&str> = input.split('-').collect();

    match parts.as_slice() {
        [y, m, d] if digits(y, 4) && digits(m, 2) && digits(d, 2) => checked(
            input,
            y.parse().unwrap_or(0),
            m.parse().unwrap_or(0),
            d.parse().unwrap_or(0),
        ),
        [y, m] if digits(y, 4) && digits(m, 2) => {
            let month: u32 = m.parse().unwrap_or(0);
            if !(1..=12).contains(&month) {
                return Err(invalid(input, "month must be 01-12"));
            }
            Ok(format!("{}-{}-01", y, m))
        }
        [y] if digits(y, 4) => {
            let year: i32 = y.parse().unwrap_or(0);
            if !(1000..=9999).contains(&year) {
                return Err(invalid(input, "year must be 1000-9999"));
            }
            Ok(format!("{}-01-01", y))
        }
        _ => day_month_year(input),
    }
}

/// `15 Mar. 1993`, `26 Jan 1990`.
fn day_month_year(input: &str) -> Result<String, InvalidDate> {
    let shape = || invalid(input, "expected YYYY, YYYY-MM, YYYY-MM-DD or 'D Mon YYYY'");
    let tokens: Vec<&str> = input.split_whitespace().collect();
    let [day, month, year] = tokens.as_slice() else {
        return Err(shape());
    };
    if day.is_empty() || day.len() > 2 || !day.bytes().all(|b| b.is_ascii_digit()) {
        return Err(shape());
    }
    let month = month.strip_suffix('.').unwrap_or(*month);
    if month.len() != 3 || !month.bytes().all(|b| b.is_ascii_alphabetic()) || !digits(year, 4) {
        return Err(shape());
    }

    let month_no = MONTHS
        .iter()
        .position(|m| m.eq_ignore_ascii_case(month))
        .ok_or_else(|| invalid(input, "unknown month abbreviation"))?;
    let day: u32 = day.parse().unwrap_or(0);
    if !(1..=31).contains(&day) {
        return Err(invalid(input, "day must be 1-31"));
    }
    checked(input, year.parse().unwrap_or(0), month_no as u32 + 1, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepted_shapes() {
        assert_eq!(normalize_date("1999").unwrap(), "1999-01-01");
        assert_eq!(normalize_date("1999-05").unwrap(), "1999-05-01");
        assert_eq!(normalize_date("1999-05-20").unwrap(), "1999-05-20");
        assert_eq!(normalize_date("20 May. 1999").unwrap(), "1999-05-20");
        assert_eq!(normalize_date("5 mar 1993").unwrap(), "1993-03-05");
        assert_eq!(normalize_date("  2001-02-03 \n").unwrap(), "2001-02-03");
    }

    #[test]
    fn test_rejected_values() {
        for bad in [
            "1999-13-40",
            "1999-02-30",
            "1999-13",
            "0999",
            "32 Jan 1999",
            "31 Feb 1999",
            "20 Mai 1999",
            "May 20 1999",
            "1999/05/20",
            "",
        ] {
            assert!(normalize_date(bad).is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_error_names_input() {
        let err = normalize_date("1999-13-40").unwrap_err();
        assert_eq!(err.input, "1999-13-40");
        assert!(err.to_string().contains("1999-13-40"));
    }
}
