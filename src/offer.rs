//! In-memory staging for one incoming selection.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::warn;

use crate::model::{MimePayload, SelectionKind, MAX_DATA_SIZE, MAX_MIME_TYPES};

/// 100ms: default per-read poll timeout.
pub const WAIT_SHORT: Duration = Duration::from_millis(100);
/// 2000ms: used for `image/png` and `image/jpeg`, which tend to arrive slower.
pub const WAIT_LONG: Duration = Duration::from_millis(2000);
/// 8000ms: armed after the first non-empty read, to tolerate slow producers.
pub const WAIT_LONGEST: Duration = Duration::from_millis(8000);

#[derive(Debug)]
pub struct OfferBuffer {
    /// Advertised MIME types, in arrival order, capped at MAX_MIME_TYPES.
    pub mime_types: Vec<String>,
    /// Drained bytes per type; `None` until drained, aligned with `mime_types`.
    pub payloads: Vec<Option<Bytes>>,
    /// `invalid[i]` is true iff draining `mime_types[i]` failed, timed out, or
    /// yielded zero bytes.
    pub invalid: Vec<bool>,
    pub expired: bool,
    pub selection_kind: SelectionKind,
    /// True once this offer has latched a password-manager hint MIME type.
    pub password: bool,
}

impl Default for OfferBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl OfferBuffer {
    pub fn new() -> Self {
        Self {
            mime_types: Vec::new(),
            payloads: Vec::new(),
            invalid: Vec::new(),
            expired: false,
            selection_kind: SelectionKind::Unset,
            password: false,
        }
    }

    /// Record one advertised MIME type. Returns false (and logs) once the
    /// 25-type cap is hit; the 26th+ type is dropped, not stored.
    pub fn add_mime_type(&mut self, mime_type: &str) -> bool {
        if self.mime_types.len() >= MAX_MIME_TYPES {
            warn!("offer advertised more than {MAX_MIME_TYPES} MIME types, dropping {mime_type}");
            return false;
        }
        if mime_type == crate::model::PASSWORD_HINT_MIME {
            self.password = true;
        }
        self.mime_types.push(mime_type.to_string());
        self.payloads.push(None);
        self.invalid.push(false);
        true
    }

    /// Recreate this buffer logically: clear payload slots and free type
    /// strings, as a new `data_offer` event arrives.
    pub fn clear(&mut self) {
        self.mime_types.clear();
        self.payloads.clear();
        self.invalid.clear();
        self.expired = false;
        self.password = false;
        self.selection_kind = SelectionKind::Unset;
    }

    /// Valid (payload, type) pairs, in advertised order, for syncing into a
    /// `SourceBuffer`.
    pub fn valid_payloads(&self) -> Vec<MimePayload> {
        self.mime_types
            .iter()
            .zip(self.payloads.iter())
            .zip(self.invalid.iter())
            .filter_map(|((ty, bytes), invalid)| {
                if *invalid {
                    None
                } else {
                    bytes.clone().map(|b| MimePayload::new(ty.clone(), b))
                }
            })
            .collect()
    }
}

/// Query the kernel's buffer size for a pipe (`F_GETPIPE_SZ`); this is both
/// the read granularity and the initial payload allocation. Returns `None`
/// if the kernel refuses the query, so the caller can fall back to
/// `DEFAULT_READ_SIZE`.
pub fn pipe_buffer_size(fd: RawFd) -> Option<usize> {
    let size = unsafe { libc::fcntl(fd, libc::F_GETPIPE_SZ) };
    if size > 0 { Some(size as usize) } else { None }
}

/// Pick the poll timeout for the *first* read of a given MIME type: long for
/// image/png and image/jpeg, short for everything else.
pub fn initial_wait(mime_type: &str) -> Duration {
    if mime_type == "image/png" || mime_type == "image/jpeg" {
        WAIT_LONG
    } else {
        WAIT_SHORT
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    Ok(Bytes),
    TooLarge,
    Empty,
}

/// Drain one already-opened, already-requested pipe read end:
/// poll with `initial_wait`, read up to `read_size` bytes per
/// wakeup, switch to `WAIT_LONGEST` after any non-empty read, stop when a
/// short read signals EOF-of-burst, bail out (marking this payload invalid)
/// if the buffer would exceed `MAX_DATA_SIZE`.
pub fn drain_pipe(read_fd: &OwnedFd, mime_type: &str, read_size: usize) -> DrainOutcome {
    let mut buf = BytesMut::new();
    let mut wait = initial_wait(mime_type);
    let fd = read_fd.as_raw_fd();

    loop {
        if !poll_readable(fd, wait) {
            break;
        }

        let mut chunk = vec![0u8; read_size];
        let n = unsafe {
            let ret = libc::read(fd, chunk.as_mut_ptr() as *mut libc::c_void, read_size);
            if ret < 0 { 0 } else { ret as usize }
        };

        if n == 0 {
            break;
        }

        buf.extend_from_slice(&chunk[..n]);
        wait = WAIT_LONGEST;

        if buf.len() as u64 > MAX_DATA_SIZE {
            return DrainOutcome::TooLarge;
        }
        if n < read_size {
            break;
        }
    }

    if buf.is_empty() {
        DrainOutcome::Empty
    } else {
        DrainOutcome::Ok(buf.freeze())
    }
}

fn poll_readable(fd: i32, timeout: Duration) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
    let ret = unsafe { libc::poll(&mut pfd, 1, millis) };
    ret > 0 && (pfd.revents & libc::POLLIN) != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::FromRawFd;

    fn make_pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn drains_full_payload_written_before_read() {
        let (reader, writer) = make_pipe();
        {
            let mut w = std::fs::File::from(writer);
            w.write_all(b"hello world").unwrap();
        }
        match drain_pipe(&reader, "text/plain", 64) {
            DrainOutcome::Ok(bytes) => assert_eq!(bytes.as_ref(), b"hello world"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn empty_pipe_reports_empty() {
        let (reader, writer) = make_pipe();
        drop(writer);
        assert_eq!(drain_pipe(&reader, "text/plain", 64), DrainOutcome::Empty);
    }

    #[test]
    fn offer_buffer_caps_at_max_mime_types() {
        let mut ofr = OfferBuffer::new();
        for i in 0..30 {
            ofr.add_mime_type(&format!("text/x-{i}"));
        }
        assert_eq!(ofr.mime_types.len(), MAX_MIME_TYPES);
    }

    #[test]
    fn offer_buffer_flags_password_hint() {
        let mut ofr = OfferBuffer::new();
        ofr.add_mime_type("x-kde-passwordManagerHint");
        assert!(ofr.password);
    }

    #[test]
    fn video_types_are_accepted_like_any_other_type() {
        let mut ofr = OfferBuffer::new();
        assert!(ofr.add_mime_type("video/mp4"));
        assert_eq!(ofr.mime_types, vec!["video/mp4".to_string()]);
    }
}
