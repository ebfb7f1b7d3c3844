use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::{format_description::FormatItem, macros::format_description, Date};

use crate::time::Timestamp;

/// Every report entry's storage key starts with this.
pub const KEY_PREFIX: &str = "dailyReport_";

/// Shown in place of a preview when the report body has no content line.
pub const EMPTY_PREVIEW: &str = "Nessun contenuto";

const ISO_DATE: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");

/// Storage address of a report: `dailyReport_<userId>_<millis>`. The key
/// doubles as the ownership token, so the embedded user id is
/// authoritative. User ids contain underscores themselves, which is why
/// parsing splits the timestamp off from the right.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportKey {
    user_id: String,
    created: Timestamp,
}

impl ReportKey {
    pub fn new(user_id: &str, created: Timestamp) -> Self {
        Self {
            user_id: user_id.into(),
            created,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn created(&self) -> Timestamp {
        self.created
    }
}

impl FromStr for ReportKey {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(KEY_PREFIX)
            .ok_or("missing report key prefix")?;

        let (user_id, millis) = rest
            .rsplit_once('_')
            .ok_or("no timestamp in report key")?;

        if user_id.is_empty() {
            return Err("empty user id in report key");
        }

        if !user_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
        {
            return Err("invalid character in report key");
        }

        let created = millis
            .parse()
            .map_err(|_| "invalid timestamp in report key")?;

        Ok(Self {
            user_id: user_id.into(),
            created,
        })
    }
}

impl fmt::Display for ReportKey {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            fmt,
            "{KEY_PREFIX}{}_{}",
            self.user_id,
            self.created.as_millis()
        )
    }
}

/// What actually sits in storage under a report key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportData {
    pub date: String,
    pub text: String,
    pub user_id: String,
}

/// A report as handed to API callers: the stored fields plus the key and
/// the list-view preview line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub key: String,
    pub date: String,
    pub text: String,
    pub user_id: String,
    pub preview: String,
}

impl Report {
    pub fn from_stored(key: &ReportKey, data: ReportData) -> Self {
        let preview = data
            .text
            .split('\n')
            .nth(2)
            .filter(|line| !line.is_empty())
            .unwrap_or(EMPTY_PREVIEW)
            .to_string();

        Self {
            key: key.to_string(),
            date: data.date,
            text: data.text,
            user_id: data.user_id,
            preview,
        }
    }
}

/// The calendar-date part of an ISO date string, i.e. everything before
/// a `T`, if any.
pub fn date_part(date: &str) -> &str {
    date.split('T').next().unwrap_or(date)
}

/// Compare dates while ignoring time and timezone.
pub fn same_day(a: &str, b: &str) -> bool {
    date_part(a) == date_part(b)
}

pub fn parse_date(date: &str) -> Result<Date, time::error::Parse> {
    Date::parse(date_part(date), ISO_DATE)
}
