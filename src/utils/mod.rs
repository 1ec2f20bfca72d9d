//! Utility functions and helpers

pub mod fs;

/// Time helpers shared by the engine, phase runner, and task store
pub mod time {
    use chrono::{DateTime, Utc};

    /// Get current UTC timestamp
    pub fn now() -> DateTime<Utc> {
        Utc::now()
    }

    /// Format a timestamp as a compact UTC stamp: `YYYYMMDDTHHMMSSZ`
    ///
    /// Used for report-history rotation and previous-response snapshots.
    pub fn compact_stamp(timestamp: DateTime<Utc>) -> String {
        timestamp.format("%Y%m%dT%H%M%SZ").to_string()
    }
}

/// Text helpers
pub mod text {
    /// Take an excerpt of at most `max_chars` characters from the tail of `s`.
    ///
    /// Task failures carry the last agent message; full movement outputs can
    /// run to tens of kilobytes, so only the tail is persisted.
    pub fn tail_excerpt(s: &str, max_chars: usize) -> String {
        let count = s.chars().count();
        if count <= max_chars {
            return s.to_string();
        }
        let skipped: String = s.chars().skip(count - max_chars).collect();
        format!("...{}", skipped)
    }
}
