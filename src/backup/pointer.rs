//! Latest-snapshot pointer: one small mutable record on the remote tier for
//! O(1) discovery of the newest snapshot.
//!
//! Stored as a single delimited line, `filename|versionToken|isoTimestamp`,
//! at `<prefix>/latest.txt`. Written strictly after the snapshot blob push is
//! acknowledged, so it never names a partially-written snapshot. A failed
//! pointer write is logged and tolerated; recovery falls back to listing the
//! snapshot prefix.

use chrono::{DateTime, Utc};

use crate::backup::remote::{RemoteError, RemoteRepo};

pub const POINTER_FILE: &str = "latest.txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestPointer {
    pub snapshot_path: String,
    pub version_token: String,
    pub written_at: DateTime<Utc>,
}

impl LatestPointer {
    pub fn format(&self) -> String {
        format!(
            "{}|{}|{}",
            self.snapshot_path,
            self.version_token,
            self.written_at.to_rfc3339()
        )
    }

    /// Parse a pointer line; None for anything malformed.
    pub fn parse(raw: &str) -> Option<Self> {
        let line = raw.trim();
        let mut parts = line.splitn(3, '|');
        let snapshot_path = parts.next()?.trim();
        let version_token = parts.next()?.trim();
        let written_at = parts.next()?.trim();
        if snapshot_path.is_empty() || version_token.is_empty() {
            return None;
        }
        let written_at = DateTime::parse_from_rfc3339(written_at).ok()?;
        Some(Self {
            snapshot_path: snapshot_path.to_string(),
            version_token: version_token.to_string(),
            written_at: written_at.with_timezone(&Utc),
        })
    }
}

fn pointer_path(prefix: &str) -> String {
    format!("{}/{POINTER_FILE}", prefix.trim_end_matches('/'))
}

/// Read the pointer record. Absence is Ok(None); a malformed record is also
/// treated as absent so recovery can fall back to listing.
pub fn read(repo: &RemoteRepo, prefix: &str) -> Result<Option<LatestPointer>, RemoteError> {
    let path = pointer_path(prefix);
    match repo.get(&path) {
        Ok((bytes, _token)) => {
            let text = String::from_utf8_lossy(&bytes);
            let parsed = LatestPointer::parse(&text);
            if parsed.is_none() {
                tracing::warn!(path, "malformed latest pointer, ignoring");
            }
            Ok(parsed)
        }
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

/// Overwrite the pointer after a successful snapshot push. Errors propagate
/// so the caller can log them; pointer failure never fails the push.
pub fn write(
    repo: &RemoteRepo,
    prefix: &str,
    snapshot_name: &str,
    version_token: &str,
) -> Result<(), RemoteError> {
    let pointer = LatestPointer {
        snapshot_path: snapshot_name.to_string(),
        version_token: version_token.to_string(),
        written_at: Utc::now(),
    };
    let path = pointer_path(prefix);
    let message = format!("Update latest pointer to {snapshot_name}");
    repo.put(&path, pointer.format().as_bytes(), &message, None)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parse_roundtrip() {
        let pointer = LatestPointer {
            snapshot_path: "botforge_20250101_120000.db".to_string(),
            version_token: "abc123".to_string(),
            written_at: "2025-01-01T12:00:00Z".parse().unwrap(),
        };
        let line = pointer.format();
        assert_eq!(line, "botforge_20250101_120000.db|abc123|2025-01-01T12:00:00+00:00");
        assert_eq!(LatestPointer::parse(&line).unwrap(), pointer);
    }

    #[test]
    fn parse_tolerates_trailing_newline() {
        let parsed =
            LatestPointer::parse("x.db|token|2025-06-01T00:00:00Z\n").unwrap();
        assert_eq!(parsed.snapshot_path, "x.db");
        assert_eq!(parsed.version_token, "token");
    }

    #[test]
    fn parse_rejects_malformed_lines() {
        assert!(LatestPointer::parse("").is_none());
        assert!(LatestPointer::parse("just-a-filename").is_none());
        assert!(LatestPointer::parse("a|b").is_none());
        assert!(LatestPointer::parse("|token|2025-06-01T00:00:00Z").is_none());
        assert!(LatestPointer::parse("x.db|token|not-a-timestamp").is_none());
    }
}
