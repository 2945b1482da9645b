//! Inclusive month range over time-partitioned page identifiers.
//!
//! Archive pages are identified by URLs ending in `YYYY/MM`. Keys of that
//! shape compare lexicographically in chronological order, so filtering is a
//! plain string comparison against the bounds.

use std::fmt;

use crate::error::AppError;

/// A validated `YYYY/MM` month key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Month(String);

impl Month {
    pub const LEN: usize = 7;

    /// Parse a `YYYY/MM` string. The separator at offset 4 must be `/`.
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let bytes = raw.as_bytes();
        if bytes.len() != Self::LEN || bytes[4] != b'/' {
            return Err(AppError::ValidationError(format!(
                "invalid month '{raw}': expected YYYY/MM"
            )));
        }
        let digits_ok = bytes[..4]
            .iter()
            .chain(&bytes[5..])
            .all(|b| b.is_ascii_digit());
        if !digits_ok {
            return Err(AppError::ValidationError(format!(
                "invalid month '{raw}': year and month must be digits"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Inclusive `[start, end]` bounds; a missing side is unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonthRange {
    pub start: Option<Month>,
    pub end: Option<Month>,
}

impl MonthRange {
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Validate optional raw bounds.
    pub fn parse(start: Option<&str>, end: Option<&str>) -> Result<Self, AppError> {
        Ok(Self {
            start: start.map(Month::parse).transpose()?,
            end: end.map(Month::parse).transpose()?,
        })
    }

    /// Whether the time key of `page_id` falls inside the range.
    pub fn contains(&self, page_id: &str) -> bool {
        let key = partition_key(page_id);
        if let Some(start) = &self.start
            && key < start.as_str()
        {
            return false;
        }
        if let Some(end) = &self.end
            && key > end.as_str()
        {
            return false;
        }
        true
    }
}

/// Time key of a page identifier: its last seven characters.
pub fn partition_key(page_id: &str) -> &str {
    page_id
        .char_indices()
        .rev()
        .nth(Month::LEN - 1)
        .map_or(page_id, |(i, _)| &page_id[i..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive(month: &str) -> String {
        format!("https://api.chess.com/pub/player/a/games/{month}")
    }

    #[test]
    fn partition_key_takes_trailing_month() {
        assert_eq!(partition_key(&archive("2022/11")), "2022/11");
        assert_eq!(partition_key("2022/11"), "2022/11");
        assert_eq!(partition_key("short"), "short");
    }

    #[test]
    fn bounds_are_inclusive() {
        let range = MonthRange::parse(Some("2022/10"), Some("2022/12")).unwrap();
        assert!(range.contains(&archive("2022/10")));
        assert!(range.contains(&archive("2022/11")));
        assert!(range.contains(&archive("2022/12")));
        assert!(!range.contains(&archive("2022/09")));
        assert!(!range.contains(&archive("2023/01")));
    }

    #[test]
    fn single_month_range_keeps_only_that_month() {
        let range = MonthRange::parse(Some("2022/11"), Some("2022/11")).unwrap();
        let kept: Vec<_> = ["2022/10", "2022/11", "2022/12"]
            .iter()
            .filter(|m| range.contains(&archive(m)))
            .collect();
        assert_eq!(kept, vec![&"2022/11"]);
    }

    #[test]
    fn missing_bounds_are_unbounded() {
        let only_start = MonthRange::parse(Some("2022/11"), None).unwrap();
        assert!(only_start.contains(&archive("2099/01")));
        assert!(!only_start.contains(&archive("2022/10")));

        let only_end = MonthRange::parse(None, Some("2022/11")).unwrap();
        assert!(only_end.contains(&archive("2001/01")));
        assert!(!only_end.contains(&archive("2022/12")));

        assert!(MonthRange::unbounded().contains(&archive("1999/12")));
    }

    #[test]
    fn separator_at_offset_four_is_required() {
        for bad in ["2022-11", "2022.11", "202211X", "20221/1"] {
            let err = MonthRange::parse(Some(bad), None).unwrap_err();
            assert!(matches!(err, AppError::ValidationError(_)), "{bad}");
        }
        let err = MonthRange::parse(None, Some("2022_12")).unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
    }

    #[test]
    fn malformed_shapes_are_rejected() {
        for bad in ["", "2022/1", "2022/011", "abcd/ef", "22/11/01"] {
            assert!(Month::parse(bad).is_err(), "{bad}");
        }
        assert_eq!(Month::parse("2022/11").unwrap().as_str(), "2022/11");
    }
}
