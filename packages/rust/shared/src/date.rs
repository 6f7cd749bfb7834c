//! Run-date resolution. Every artifact is keyed by a `YYYY-MM-DD` date.

use chrono::{FixedOffset, NaiveDate, Utc};

use crate::error::{MarketBriefError, Result};

/// Format used for date keys in file names and topic ids.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Today's date in the given offset.
pub fn today_in(offset: FixedOffset) -> NaiveDate {
    Utc::now().with_timezone(&offset).date_naive()
}

/// Parse an explicit `--date` argument, or fall back to today in `offset`.
pub fn resolve_date(arg: Option<&str>, offset: FixedOffset) -> Result<NaiveDate> {
    match arg {
        Some(raw) => NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).map_err(|e| {
            MarketBriefError::validation(format!("invalid date '{raw}' (expected YYYY-MM-DD): {e}"))
        }),
        None => Ok(today_in(offset)),
    }
}

/// Render a date key.
pub fn date_key(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}
