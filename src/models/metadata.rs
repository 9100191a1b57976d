//! Per-object expiry policy, persisted as JSON next to each blob.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Days an upload lives when no `Max-Days` directive is given.
pub const DEFAULT_MAX_DAYS: i64 = 14;

/// `MaxDownloads` value meaning "no download limit".
pub const UNLIMITED_DOWNLOADS: i64 = -1;

/// Expiry policy of one stored object.
///
/// Serialized with the field names `ContentType`, `Downloads`,
/// `MaxDownloads` and `MaxDate`; external tooling reads these records
/// directly, so the names are part of the on-disk format.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Metadata {
    /// Content type given (or guessed) at upload time.
    pub content_type: String,

    /// Completed downloads so far. Only ever incremented.
    pub downloads: u64,

    /// Download limit; `-1` (or any value `<= 0`) means unlimited.
    pub max_downloads: i64,

    /// Instant after which the object is expired.
    pub max_date: DateTime<Utc>,
}

/// Optional policy overrides supplied with an upload.
#[derive(Debug, Clone, Default)]
pub struct UploadDirectives {
    pub max_downloads: Option<String>,
    pub max_days: Option<String>,
}

impl Metadata {
    /// Derive the policy for a fresh upload.
    ///
    /// Directive values that are missing, non-numeric or out of range are
    /// ignored and the default applies.
    pub fn for_upload(
        content_type: impl Into<String>,
        directives: &UploadDirectives,
        now: DateTime<Utc>,
    ) -> Self {
        let default_max_date = now + TimeDelta::days(DEFAULT_MAX_DAYS);

        let max_downloads = parse_directive(directives.max_downloads.as_deref())
            .unwrap_or(UNLIMITED_DOWNLOADS);

        let max_date = parse_directive(directives.max_days.as_deref())
            .and_then(TimeDelta::try_days)
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(default_max_date);

        Self {
            content_type: content_type.into(),
            downloads: 0,
            max_downloads,
            max_date,
        }
    }

    pub fn is_past_max_date(&self, now: DateTime<Utc>) -> bool {
        now > self.max_date
    }

    /// True once a limited object has used up its downloads.
    pub fn downloads_exhausted(&self) -> bool {
        self.max_downloads > 0 && self.downloads >= self.max_downloads as u64
    }
}

fn parse_directive(value: Option<&str>) -> Option<i64> {
    value.and_then(|v| v.parse::<i64>().ok())
}
