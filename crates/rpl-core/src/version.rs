use chrono::{DateTime, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Fixed-width, so tags sort lexically in time order.
pub const TAG_TIME_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Builds of the same commit within one second get `-02` .. `-99`.
pub const MAX_TAG_SEQUENCE: u32 = 99;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReleaseVersion {
    pub commit_short: String,
    pub timestamp: DateTime<Utc>,
    /// 0 for the first build in a given second.
    pub sequence: u32,
    pub tag: String,
}

impl ReleaseVersion {
    /// Derive the canonical release identifier for `commit` built at `at`.
    ///
    /// Sub-second precision is dropped so identical inputs always give the same tag.
    pub fn derive(commit: &str, at: DateTime<Utc>, short_len: usize) -> Result<Self, CoreError> {
        let commit = commit.trim();
        if commit.is_empty() || !commit.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)) {
            return Err(CoreError::InvalidCommit(commit.to_string()));
        }
        let commit_short: String = commit.chars().take(short_len.max(1)).collect();
        let timestamp = at.with_nanosecond(0).unwrap_or(at);
        Ok(Self::assemble(commit_short, timestamp, 0))
    }

    /// Same release identity with a disambiguating build sequence.
    pub fn with_sequence(&self, sequence: u32) -> Result<Self, CoreError> {
        if sequence > MAX_TAG_SEQUENCE {
            return Err(CoreError::SequenceExhausted(self.base_tag()));
        }
        Ok(Self::assemble(self.commit_short.clone(), self.timestamp, sequence))
    }

    /// First tag for this commit/second that `is_taken` does not report as used.
    pub fn next_free(&self, is_taken: impl Fn(&str) -> bool) -> Result<Self, CoreError> {
        if !is_taken(&self.tag) {
            return Ok(self.clone());
        }
        for seq in 2..=MAX_TAG_SEQUENCE {
            let candidate = self.with_sequence(seq)?;
            if !is_taken(&candidate.tag) {
                return Ok(candidate);
            }
        }
        Err(CoreError::SequenceExhausted(self.base_tag()))
    }

    /// Parse `v<commit>-<YYYYMMDD>-<HHMMSS>[-NN]`.
    pub fn parse(tag: &str) -> Result<Self, CoreError> {
        let invalid = || CoreError::InvalidTag(tag.to_string());
        let rest = tag.strip_prefix('v').ok_or_else(invalid)?;
        let parts: Vec<&str> = rest.split('-').collect();
        let (commit, date, time, sequence) = match parts.as_slice() {
            [c, d, t] => (*c, *d, *t, 0),
            [c, d, t, s] => {
                if s.len() != 2 {
                    return Err(invalid());
                }
                let seq: u32 = s.parse().map_err(|_| invalid())?;
                if !(2..=MAX_TAG_SEQUENCE).contains(&seq) {
                    return Err(invalid());
                }
                (*c, *d, *t, seq)
            }
            _ => return Err(invalid()),
        };
        if commit.is_empty() || !commit.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)) {
            return Err(invalid());
        }
        if date.len() != 8 || time.len() != 6 {
            return Err(invalid());
        }
        let naive = NaiveDateTime::parse_from_str(&format!("{date}-{time}"), TAG_TIME_FORMAT)
            .map_err(|_| invalid())?;
        let timestamp = Utc.from_utc_datetime(&naive);
        let version = Self::assemble(commit.to_string(), timestamp, sequence);
        if version.tag != tag {
            return Err(invalid());
        }
        Ok(version)
    }

    fn base_tag(&self) -> String {
        format!("v{}-{}", self.commit_short, self.timestamp.format(TAG_TIME_FORMAT))
    }

    fn assemble(commit_short: String, timestamp: DateTime<Utc>, sequence: u32) -> Self {
        let base = format!("v{}-{}", commit_short, timestamp.format(TAG_TIME_FORMAT));
        let tag = if sequence == 0 { base } else { format!("{base}-{sequence:02}") };
        Self { commit_short, timestamp, sequence, tag }
    }

    /// Whether `full_commit` names the commit this version was derived from.
    pub fn matches_commit(&self, full_commit: &str) -> bool {
        full_commit.starts_with(&self.commit_short)
    }
}

impl std::fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.tag)
    }
}
