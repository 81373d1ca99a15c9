//! Work definitions for the scheduler.
//!
//! This module defines the values that flow through the stream:
//!
//! - `WorkItem`: one "is this URL reachable" request for a monitor
//! - `CheckResult`: the outcome of executing that request once
//! - `CheckStatus`: Up/Down classification of a check
//! - `Location`: the region a worker pool runs in

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stream::EntryId;

/// Stream field carrying the monitor identifier.
pub const FIELD_MONITOR_ID: &str = "id";

/// Stream field carrying the target URL.
pub const FIELD_URL: &str = "url";

/// A unit of work appended to the stream.
///
/// Immutable once appended. On the wire it is a flat mapping of
/// `{ id, url }`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItem {
    /// Identifier of the monitor this check belongs to.
    pub monitor_id: String,
    /// Target URL to probe.
    pub url: String,
}

impl WorkItem {
    pub fn new(monitor_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            monitor_id: monitor_id.into(),
            url: url.into(),
        }
    }

    /// Field/value pairs written to the stream.
    pub fn to_fields(&self) -> [(&'static str, &str); 2] {
        [
            (FIELD_MONITOR_ID, self.monitor_id.as_str()),
            (FIELD_URL, self.url.as_str()),
        ]
    }

    /// Rebuilds a work item from stream fields.
    ///
    /// Returns a description of the problem when a field is missing or
    /// empty, so the caller can dead-letter the entry.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, String> {
        let monitor_id = fields
            .get(FIELD_MONITOR_ID)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| format!("missing field '{}'", FIELD_MONITOR_ID))?;
        let url = fields
            .get(FIELD_URL)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| format!("missing field '{}'", FIELD_URL))?;

        Ok(Self::new(monitor_id.as_str(), url.as_str()))
    }
}

/// Classification of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckStatus {
    Up,
    Down,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Up => "Up",
            CheckStatus::Down => "Down",
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Region a worker pool checks from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Location {
    Usa,
    India,
}

impl Location {
    pub fn as_str(&self) -> &'static str {
        match self {
            Location::Usa => "USA",
            Location::India => "INDIA",
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Location {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "USA" => Ok(Location::Usa),
            "INDIA" => Ok(Location::India),
            other => Err(format!("unknown location '{}'", other)),
        }
    }
}

/// The persisted outcome of one check of one work item.
///
/// Re-processed entries produce additional results for the same
/// `entry_id`; that duplication is the price of at-least-once delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Monitor the check belongs to.
    pub monitor_id: String,
    /// Stream entry that carried the work item.
    pub entry_id: EntryId,
    /// Up/Down classification.
    pub status: CheckStatus,
    /// Wall-clock duration of the probe.
    pub latency_ms: Option<u64>,
    /// When the check finished.
    pub checked_at: DateTime<Utc>,
    /// Region the check ran from.
    pub location: Location,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_work_item_from_fields() {
        let item = WorkItem::from_fields(&fields(&[("id", "m1"), ("url", "https://a.test")]))
            .expect("fields are complete");
        assert_eq!(item, WorkItem::new("m1", "https://a.test"));
    }

    #[test]
    fn test_work_item_missing_fields_are_rejected() {
        let err = WorkItem::from_fields(&fields(&[("id", "m1")])).unwrap_err();
        assert!(err.contains("url"));

        let err = WorkItem::from_fields(&fields(&[("id", ""), ("url", "https://a.test")]))
            .unwrap_err();
        assert!(err.contains("id"));
    }

    #[test]
    fn test_to_fields_uses_wire_names() {
        let item = WorkItem::new("m7", "https://b.test");
        let pairs = item.to_fields();
        assert_eq!(pairs[0], ("id", "m7"));
        assert_eq!(pairs[1], ("url", "https://b.test"));
    }

    #[test]
    fn test_location_parsing_and_display() {
        assert_eq!("india".parse::<Location>().unwrap(), Location::India);
        assert_eq!("USA".parse::<Location>().unwrap(), Location::Usa);
        assert!("mars".parse::<Location>().is_err());
        assert_eq!(Location::India.to_string(), "INDIA");
        assert_eq!(
            serde_json::to_string(&Location::Usa).unwrap(),
            "\"USA\""
        );
    }
}
