//! Clipboard engine: the central state machine. Owns the transport
//! connection, reconciles the observed selection with the store, and
//! guarantees that at all times either another client owns the selection or
//! the daemon serves the most recent history entry.

use std::os::fd::{AsRawFd, RawFd};

use log::{info, warn};

use crate::error::Result;
use crate::model::{DEFAULT_READ_SIZE, SelectionKind};
use crate::offer::{self, DrainOutcome, OfferBuffer};
use crate::source::SourceBuffer;
use crate::store::Store;
use crate::transport::{IncomingOffer, Transport, TransportEvent};

/// Engine state exposed for diagnostics and tests; the engine itself only
/// tracks `serving` plus the staging buffers, matching the `Clipboard`
/// clipboard entity.
pub struct Engine {
    transport: Transport,
    offer: OfferBuffer,
    source: SourceBuffer,
    pending_offer: Option<IncomingOffer>,
    source_cancelled: bool,
    selection_cleared: bool,
    revoked: bool,
    /// Fallback read granularity when a pipe's kernel buffer size can't be
    /// queried.
    read_size: usize,
    /// True when the last ownership transition made the daemon the
    /// selection owner.
    pub serving: bool,
    /// The history id of the entry currently being served, if any. Only
    /// meaningful while `serving` is true; retention must never delete this
    /// row out from under an active selection (§8 testable property 7).
    served_id: Option<i64>,
}

impl Engine {
    /// Acquire a transport connection, bind the seat and data-control
    /// manager, and create empty offer/source buffers.
    pub fn init() -> Result<Self> {
        let transport = Transport::connect()?;
        Ok(Self {
            transport,
            offer: OfferBuffer::new(),
            source: SourceBuffer::new(),
            pending_offer: None,
            source_cancelled: false,
            selection_cleared: false,
            revoked: false,
            read_size: DEFAULT_READ_SIZE,
            serving: false,
            served_id: None,
        })
    }

    /// The history id of the entry currently being served, if the engine is
    /// in the SERVING state; `None` otherwise. Consulted by the retention
    /// scheduler so it never deletes the entry the daemon is actively
    /// serving.
    pub fn served_id(&self) -> Option<i64> {
        self.serving.then_some(self.served_id).flatten()
    }

    /// Arm selection and data-offer callbacks on the device. The transport's
    /// `Dispatch` impls are registered for the lifetime of the connection at
    /// `init`; `watch` flushes anything already queued so the first
    /// roundtrip sees it.
    pub fn watch(&mut self) -> Result<()> {
        self.transport.dispatch_pending()
    }

    /// Read-only access to the currently materialized source buffer, for
    /// callers (e.g. `kapc paste`) that just want to inspect the live
    /// selection without running the full daemon reconcile.
    pub fn source(&self) -> &SourceBuffer {
        &self.source
    }

    /// Read-only access to the raw offer buffer (e.g. to check the
    /// password-manager-hint flag after `capture_live_selection`).
    pub fn offer(&self) -> &OfferBuffer {
        &self.offer
    }

    /// Roundtrip, pump any queued transport events, and attempt to drain a
    /// latched offer into the source buffer in one call. Used both by
    /// `startup` and by `kapc paste` to read the live selection.
    pub fn capture_live_selection(&mut self) -> Result<bool> {
        self.transport.roundtrip()?;
        self.pump();
        Ok(self.get_selection())
    }

    /// Run once at startup: roundtrip, then either adopt an already-latched
    /// foreign offer or reload the most recent history entry and re-serve
    /// it.
    pub fn startup(&mut self, store: &mut Store) -> Result<()> {
        self.watch()?;

        if self.capture_live_selection()? {
            if self.offer.password {
                warn!("refusing to persist startup entry carrying a password-manager hint");
            } else {
                let id = store.insert_entry(&self.source)?;
                info!("stored entry {id} observed at startup");
            }
            self.serving = false;
            return Ok(());
        }

        if store.get_total_entries()? > 0 {
            if let Some(&id) = store.get_latest_entries(1, 0)?.first() {
                store.get_entry(id, &mut self.source)?;
                self.set_selection()?;
                self.served_id = Some(id);
                info!("re-serving most recent history entry {id} at startup");
            }
        }
        Ok(())
    }

    /// The Wayland display's fd, polled alongside the signal and timer fds
    /// in the daemon's event loop.
    pub fn as_raw_fd(&self) -> RawFd {
        self.transport.as_raw_fd()
    }

    pub fn flush(&self) -> Result<()> {
        self.transport.flush()
    }

    /// Call when `poll` reports the display fd is readable.
    pub fn read_events(&mut self) -> Result<()> {
        self.transport.read_events()
    }

    /// Drain every translated transport event into the engine's pending
    /// flags, without discarding any of them.
    pub fn pump(&mut self) {
        while let Some(event) = self.transport.next_event() {
            match event {
                TransportEvent::NewOffer(offer) => self.pending_offer = Some(offer),
                TransportEvent::SelectionCleared => self.selection_cleared = true,
                TransportEvent::SourceCancelled => self.source_cancelled = true,
                TransportEvent::Revoked => self.revoked = true,
            }
        }
    }

    /// True once the transport reports the data-control device itself was
    /// revoked; the caller must end the event loop.
    pub fn take_revoked(&mut self) -> bool {
        std::mem::take(&mut self.revoked)
    }

    /// True if a reconcile is due: a new offer is staged, our source was
    /// cancelled, or the compositor cleared the selection outright.
    pub fn needs_reconcile(&self) -> bool {
        self.pending_offer.is_some() || self.source_cancelled || self.selection_cleared
    }

    /// Drain the pending OfferBuffer into a fully materialized SourceBuffer.
    /// Returns false when no offer is present, or when every payload failed
    /// to drain.
    pub fn get_selection(&mut self) -> bool {
        let Some(incoming) = self.pending_offer.take() else {
            return false;
        };

        self.offer.clear();
        self.offer.selection_kind = SelectionKind::Selection;
        for mime_type in &incoming.mime_types {
            self.offer.add_mime_type(mime_type);
        }

        let mime_types = self.offer.mime_types.clone();
        for (i, mime_type) in mime_types.iter().enumerate() {
            match self.transport.request_payload(&incoming, mime_type) {
                Ok(fd) => {
                    let read_size =
                        offer::pipe_buffer_size(fd.as_raw_fd()).unwrap_or(self.read_size);
                    match offer::drain_pipe(&fd, mime_type, read_size) {
                        DrainOutcome::Ok(bytes) => self.offer.payloads[i] = Some(bytes),
                        DrainOutcome::TooLarge => {
                            self.offer.invalid[i] = true;
                            warn!("payload for {mime_type} exceeded the size cap, discarding");
                        }
                        DrainOutcome::Empty => {
                            self.offer.invalid[i] = true;
                            warn!("payload for {mime_type} drained zero bytes, discarding");
                        }
                    }
                }
                Err(e) => {
                    self.offer.invalid[i] = true;
                    warn!("failed to request {mime_type} from offer: {e}");
                }
            }
        }

        let valid = self.offer.valid_payloads();
        if valid.is_empty() {
            self.source.clear();
            return false;
        }
        self.source.fill_from_payloads(valid);
        true
    }

    /// Construct a fresh source on the transport, advertise every MIME type
    /// held by the source buffer, and install it as the selection.
    pub fn set_selection(&mut self) -> Result<()> {
        self.transport
            .set_selection(&self.source.payloads, self.source.offer_once)?;
        self.serving = true;
        Ok(())
    }

    /// Clear the selection on the transport.
    pub fn clear_selection(&mut self) {
        self.transport.clear_selection();
        self.serving = false;
        self.served_id = None;
    }

    /// Full get/set/insert reconcile, run whenever `needs_reconcile` is
    /// true. If a new foreign offer is staged, drain and store it,
    /// re-serving only if the engine was previously SERVING; otherwise, if
    /// we still hold a source, reclaim ownership to preserve the invariant
    /// that either a foreign client owns the selection or we serve the
    /// latest entry.
    pub fn reconcile(&mut self, store: &mut Store) -> Result<()> {
        self.source_cancelled = false;
        self.selection_cleared = false;
        let was_serving = self.serving;

        if self.get_selection() {
            let mut inserted_id = None;
            if self.offer.password {
                warn!("refusing to persist entry carrying a password-manager hint");
            } else {
                let id = store.insert_entry(&self.source)?;
                info!("stored entry {id} ({:?})", self.source.snippet);
                inserted_id = Some(id);
            }
            self.serving = false;
            self.served_id = None;
            if was_serving {
                self.set_selection()?;
                self.served_id = inserted_id;
            }
        } else if !self.source.is_empty() {
            self.set_selection()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // Engine integration requires a live Wayland display and data-control
    // manager, so it is exercised at the daemon level (manual testing) and
    // via the pure-function unit tests in `offer`, `source`, `classifier`,
    // `hash`, and `store`. Nothing here is mockable without reimplementing
    // the wire protocol.
}
