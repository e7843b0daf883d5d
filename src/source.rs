//! In-memory staging for one outgoing selection.

use bytes::Bytes;

use crate::classifier::{get_snippet, get_thumbnail, guess_mime_types};
use crate::hash::data_hash;
use crate::model::MimePayload;

#[derive(Debug, Default)]
pub struct SourceBuffer {
    pub payloads: Vec<MimePayload>,
    pub snippet: String,
    pub thumbnail: Option<Bytes>,
    pub data_hash: String,
    /// Serve the current selection once, then clear it.
    pub offer_once: bool,
    /// Set true by the transport's `cancelled` callback; cleared only by a
    /// reconcile, never by the callback itself.
    pub expired: bool,
}

impl SourceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset to an `init`-state buffer.
    pub fn clear(&mut self) {
        self.payloads.clear();
        self.snippet.clear();
        self.thumbnail = None;
        self.data_hash.clear();
        self.offer_once = false;
        self.expired = false;
    }

    /// Populate from a list of already-drained, valid payloads: republish
    /// text under its canonical aliases, then compute snippet, thumbnail and
    /// hash.
    pub fn fill_from_payloads(&mut self, raw: Vec<MimePayload>) {
        self.clear();
        if raw.is_empty() {
            return;
        }
        self.payloads = guess_mime_types(&raw);
        self.snippet = get_snippet(&self.payloads);
        self.thumbnail = get_thumbnail(&self.payloads).unwrap_or_else(|e| {
            log::warn!("thumbnail generation failed: {e}");
            None
        });
        self.data_hash = data_hash(&self.payloads);
    }

    /// Populate directly from already-classified payloads (e.g. a history
    /// row's content rows, which already carry the stored alias set and
    /// don't need re-guessing).
    pub fn fill_from_stored(&mut self, payloads: Vec<MimePayload>, snippet: String, thumbnail: Option<Bytes>, hash: String) {
        self.clear();
        self.payloads = payloads;
        self.snippet = snippet;
        self.thumbnail = thumbnail;
        self.data_hash = hash;
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    pub fn payload_for(&self, mime_type: &str) -> Option<&MimePayload> {
        self.payloads.iter().find(|p| p.mime_type == mime_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_resets_to_init_state() {
        let mut src = SourceBuffer::new();
        src.fill_from_payloads(vec![MimePayload::new("UTF8_STRING", Bytes::from_static(b"hi"))]);
        assert!(!src.is_empty());
        src.clear();
        assert!(src.is_empty());
        assert!(src.snippet.is_empty());
        assert!(src.data_hash.is_empty());
        assert!(!src.expired);
        assert!(!src.offer_once);
    }

    #[test]
    fn fill_from_payloads_populates_every_field() {
        let mut src = SourceBuffer::new();
        src.fill_from_payloads(vec![MimePayload::new(
            "UTF8_STRING",
            Bytes::from_static(b"hello\nworld"),
        )]);
        assert_eq!(src.payloads.len(), 5);
        assert_eq!(src.snippet, "hello\\world");
        assert!(!src.data_hash.is_empty());
        assert!(src.thumbnail.is_none());
    }
}
