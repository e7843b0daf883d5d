use bytes::Bytes;

/// Maximum number of MIME types a single offer or source may carry.
pub const MAX_MIME_TYPES: usize = 25;
/// Maximum size of a single MIME payload, in bytes (50 MiB).
pub const MAX_DATA_SIZE: u64 = 52_428_800;
/// Maximum length of a generated snippet, in bytes.
pub const SNIPPET_SIZE: usize = 80;
/// Fallback pipe read granularity when the kernel buffer size can't be queried.
pub const DEFAULT_READ_SIZE: usize = 65_536;
/// Thumbnail target dimensions (fit-contain).
pub const THUMBNAIL_WIDTH: u32 = 320;
pub const THUMBNAIL_HEIGHT: u32 = 100;

/// MIME type aliases that count as plain UTF-8 text outright.
pub const UTF8_TEXT_ALIASES: [&str; 2] = ["UTF8_STRING", "text/plain;charset=utf-8"];

/// The five canonical aliases a detected text payload is republished under.
pub const CANONICAL_TEXT_TYPES: [&str; 5] = [
    "TEXT",
    "STRING",
    "UTF8_STRING",
    "text/plain",
    "text/plain;charset=utf-8",
];

/// MIME types that look like text/* but are known not to be useful text.
pub const BAD_TEXT_TYPES: [&str; 3] = [
    "text/_moz_htmlinfo",
    "text/ico",
    "text/_moz_htmlcontext",
];

/// A password-manager hint MIME type; its presence on an offer signals the
/// engine may refuse to persist the entry to history.
pub const PASSWORD_HINT_MIME: &str = "x-kde-passwordManagerHint";

/// One MIME-typed payload. `length` is kept alongside `bytes` to mirror the
/// wire/storage representation even though `Bytes::len()` is authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimePayload {
    pub mime_type: String,
    pub bytes: Bytes,
}

impl MimePayload {
    pub fn new(mime_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn length(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// One row of `clipboard_history`, without its payload rows.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub id: i64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub snippet: String,
    pub thumbnail: Option<Bytes>,
    pub hash: String,
}

/// Which compositor buffer an offer concerns. Primary selection is tracked
/// but never served by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionKind {
    #[default]
    Unset,
    Selection,
    Primary,
}

/// Search-kind tag for `find_matching_entries`, modeled as one variant
/// parameterizing a single search entry point rather than one call site per
/// kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    Content,
    MimeType,
    Glob,
}
