use std::fmt;
use std::str::FromStr;

use log::error;
use serde::{Deserialize, Serialize};

/// Milliseconds since the unix epoch. Report keys embed one as their
/// creation marker, so the resolution matters.
#[derive(Debug, Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn now() -> Result<Self, ()> {
        use std::time::SystemTime;

        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|duration| duration.as_millis() as i64)
            .map(Self)
            .map_err(|e| {
                error!("couldn't get time: {e:?}");
            })
    }

    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub fn as_millis(self) -> i64 {
        self.0
    }
}

impl FromStr for Timestamp {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return write!(fmt, "<epoch>");
        }

        use ::time::{format_description::well_known::Rfc3339, OffsetDateTime};

        let formatted = OffsetDateTime::from_unix_timestamp(self.0 / 1000)
            .ok()
            .and_then(|when| when.format(&Rfc3339).ok());

        match formatted {
            Some(s) => write!(fmt, "{}", s),
            None => write!(fmt, "{}", self.0),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrips_through_str() {
        let ts: Timestamp = "1714651200123".parse().unwrap();
        assert_eq!(ts.as_millis(), 1_714_651_200_123);
        assert_eq!(ts, Timestamp::from_millis(1_714_651_200_123));
    }

    #[test]
    fn displays_epoch_placeholder() {
        assert_eq!(Timestamp::from_millis(0).to_string(), "<epoch>");
    }

    #[test]
    fn displays_rfc3339() {
        let ts = Timestamp::from_millis(1_714_651_200_000);
        assert_eq!(ts.to_string(), "2024-05-02T12:00:00Z");
    }
}
