//! Wayland data-control glue. Binds `ext-data-control-v1`,
//! falling back to `wlr-data-control-v1` when the compositor doesn't expose
//! the newer protocol, and translates its events into [`TransportEvent`]s
//! the engine drains one at a time.

use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};

use log::{debug, info, warn};
use wayland_client::backend::ObjectId;
use wayland_client::globals::{GlobalListContents, registry_queue_init};
use wayland_client::protocol::{wl_registry, wl_seat::WlSeat};
use wayland_client::{Connection, Dispatch, EventQueue, Proxy, QueueHandle, delegate_noop};
use wayland_protocols::ext::data_control::v1::client::{
    ext_data_control_device_v1::{self, ExtDataControlDeviceV1},
    ext_data_control_manager_v1::ExtDataControlManagerV1,
    ext_data_control_offer_v1::{self, ExtDataControlOfferV1},
    ext_data_control_source_v1::{self, ExtDataControlSourceV1},
};
use wayland_protocols_wlr::data_control::v1::client::{
    zwlr_data_control_device_v1::{self, ZwlrDataControlDeviceV1},
    zwlr_data_control_manager_v1::ZwlrDataControlManagerV1,
    zwlr_data_control_offer_v1::{self, ZwlrDataControlOfferV1},
    zwlr_data_control_source_v1::{self, ZwlrDataControlSourceV1},
};

use crate::error::{KapricaError, Result};
use crate::model::MimePayload;

#[derive(Debug, Clone)]
enum DataControlManager {
    Wlr(ZwlrDataControlManagerV1),
    Ext(ExtDataControlManagerV1),
}

#[derive(Debug, Clone)]
enum DataControlDevice {
    Wlr(ZwlrDataControlDeviceV1),
    Ext(ExtDataControlDeviceV1),
}

#[derive(Debug, Clone)]
enum DataControlSource {
    Wlr(ZwlrDataControlSourceV1),
    Ext(ExtDataControlSourceV1),
}

#[derive(Debug, Clone)]
enum DataControlOffer {
    Wlr(ZwlrDataControlOfferV1),
    Ext(ExtDataControlOfferV1),
}

impl DataControlManager {
    fn create_data_source(&self, qh: &QueueHandle<TransportState>) -> DataControlSource {
        match self {
            Self::Wlr(m) => DataControlSource::Wlr(m.create_data_source(qh, ())),
            Self::Ext(m) => DataControlSource::Ext(m.create_data_source(qh, ())),
        }
    }

    fn get_data_device(&self, seat: &WlSeat, qh: &QueueHandle<TransportState>) -> DataControlDevice {
        match self {
            Self::Wlr(m) => DataControlDevice::Wlr(m.get_data_device(seat, qh, ())),
            Self::Ext(m) => DataControlDevice::Ext(m.get_data_device(seat, qh, ())),
        }
    }
}

impl DataControlDevice {
    fn set_selection(&self, source: Option<&DataControlSource>) {
        match (self, source) {
            (Self::Wlr(d), Some(DataControlSource::Wlr(s))) => d.set_selection(Some(s)),
            (Self::Wlr(d), None) => d.set_selection(None),
            (Self::Ext(d), Some(DataControlSource::Ext(s))) => d.set_selection(Some(s)),
            (Self::Ext(d), None) => d.set_selection(None),
            _ => warn!("mismatched data-control protocol between device and source"),
        }
    }
}

impl DataControlSource {
    fn destroy(&self) {
        match self {
            Self::Wlr(s) => s.destroy(),
            Self::Ext(s) => s.destroy(),
        }
    }

    fn offer(&self, mime_type: &str) {
        match self {
            Self::Wlr(s) => s.offer(mime_type.to_string()),
            Self::Ext(s) => s.offer(mime_type.to_string()),
        }
    }

    fn id(&self) -> ObjectId {
        match self {
            Self::Wlr(s) => s.id(),
            Self::Ext(s) => s.id(),
        }
    }
}

impl DataControlOffer {
    fn receive(&self, mime_type: &str, fd: std::os::fd::BorrowedFd<'_>) {
        match self {
            Self::Wlr(o) => o.receive(mime_type.to_string(), fd),
            Self::Ext(o) => o.receive(mime_type.to_string(), fd),
        }
    }

    fn destroy(&self) {
        match self {
            Self::Wlr(o) => o.destroy(),
            Self::Ext(o) => o.destroy(),
        }
    }

    fn id(&self) -> ObjectId {
        match self {
            Self::Wlr(o) => o.id(),
            Self::Ext(o) => o.id(),
        }
    }
}

/// One finalized offer, ready to be drained MIME type by MIME type.
pub struct IncomingOffer {
    offer: DataControlOffer,
    pub mime_types: Vec<String>,
}

impl IncomingOffer {
    /// Open a pipe, ask the compositor to write `mime_type`'s bytes into it,
    /// flush so the request actually reaches the compositor, and return the
    /// read end for the caller to drain.
    fn request(&self, mime_type: &str, conn: &Connection) -> Result<OwnedFd> {
        let (reader, writer) = make_pipe()?;
        self.offer.receive(mime_type, writer.as_fd());
        drop(writer);
        conn.flush()?;
        Ok(reader)
    }
}

impl Drop for IncomingOffer {
    fn drop(&mut self) {
        self.offer.destroy();
    }
}

fn make_pipe() -> Result<(OwnedFd, OwnedFd)> {
    use std::os::fd::FromRawFd;
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(KapricaError::Io(std::io::Error::last_os_error()));
    }
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

/// Events the engine consumes, one per `drain_events` call.
pub enum TransportEvent {
    /// A new external selection has arrived; its offer is ready to drain.
    NewOffer(IncomingOffer),
    /// The compositor cleared the selection outright.
    SelectionCleared,
    /// Our own outgoing source was cancelled (a new owner took the
    /// selection, or we replaced it ourselves).
    SourceCancelled,
    /// The data-control device itself was revoked (e.g. the seat went
    /// away); the transport must be reconnected.
    Revoked,
}

/// Per-queue dispatch target. Holds only wire-level bookkeeping; the engine
/// owns all clipboard-domain state.
struct TransportState {
    pending_mime_types: HashMap<ObjectId, Vec<String>>,
    pending_offers: HashMap<ObjectId, DataControlOffer>,
    events: std::collections::VecDeque<TransportEvent>,
    current_offer_id: Option<ObjectId>,
    /// Payloads of the selection we currently own, served on `Send` events.
    serving: Vec<MimePayload>,
    current_source_id: Option<ObjectId>,
    /// Set right after we call `set_selection` ourselves, to avoid reading
    /// back and re-taking ownership of our own just-set selection, which
    /// would deadlock the single dispatch thread (mirrors the upstream
    /// backend's `suppress_next_selection_read`).
    suppress_next_selection: bool,
    /// A clone of the device handle, kept here so the `send` callback can
    /// clear the selection itself for one-shot sources.
    device: Option<DataControlDevice>,
    /// Set when the current source should be cleared after its first
    /// successful send.
    offer_once: bool,
}

impl TransportState {
    fn new() -> Self {
        Self {
            pending_mime_types: HashMap::new(),
            pending_offers: HashMap::new(),
            events: std::collections::VecDeque::new(),
            current_offer_id: None,
            serving: Vec::new(),
            current_source_id: None,
            suppress_next_selection: false,
            device: None,
            offer_once: false,
        }
    }

    fn track_mime_type(&mut self, offer_id: &ObjectId, mime_type: String) {
        if let Some(list) = self.pending_mime_types.get_mut(offer_id) {
            list.push(mime_type);
        }
    }

    fn finalize_selection(&mut self, offer_id: ObjectId) {
        let Some(mime_types) = self.pending_mime_types.remove(&offer_id) else {
            return;
        };
        let Some(offer) = self.pending_offers.remove(&offer_id) else {
            return;
        };
        self.pending_mime_types.clear();
        self.pending_offers.clear();

        if self.suppress_next_selection {
            debug!("suppressing read of our own just-set selection");
            offer.destroy();
            self.current_offer_id = Some(offer_id);
            return;
        }
        if self.current_offer_id.as_ref() == Some(&offer_id) {
            offer.destroy();
            return;
        }

        self.current_offer_id = Some(offer_id);
        self.events
            .push_back(TransportEvent::NewOffer(IncomingOffer { offer, mime_types }));
    }
}

pub struct Transport {
    connection: Connection,
    event_queue: EventQueue<TransportState>,
    qh: QueueHandle<TransportState>,
    state: TransportState,
    manager: DataControlManager,
    device: DataControlDevice,
    current_source: Option<DataControlSource>,
}

impl Transport {
    /// Connect, bind a seat and a data-control manager (ext preferred, wlr
    /// as fallback), and obtain a device. Fails fast if either is missing;
    /// startup failures are fatal.
    pub fn connect() -> Result<Self> {
        let connection = Connection::connect_to_env()
            .map_err(|_| KapricaError::TransportUnavailable)?;
        let (globals, mut event_queue) = registry_queue_init::<TransportState>(&connection)
            .map_err(|_| KapricaError::TransportUnavailable)?;
        let qh = event_queue.handle();
        let mut state = TransportState::new();

        let seat = globals
            .bind::<WlSeat, _, _>(&qh, 1..=9, ())
            .map_err(|_| KapricaError::TransportUnavailable)?;

        let manager = if let Ok(m) = globals.bind::<ExtDataControlManagerV1, _, _>(&qh, 1..=1, ()) {
            info!("using ext_data_control_manager_v1");
            DataControlManager::Ext(m)
        } else if let Ok(m) = globals.bind::<ZwlrDataControlManagerV1, _, _>(&qh, 2..=2, ()) {
            info!("using zwlr_data_control_manager_v1 (ext protocol unavailable)");
            DataControlManager::Wlr(m)
        } else {
            return Err(KapricaError::TransportUnavailable);
        };

        let device = manager.get_data_device(&seat, &qh);
        event_queue.roundtrip(&mut state).map_err(|e| KapricaError::Other(e.to_string()))?;

        Ok(Self {
            connection,
            event_queue,
            qh,
            state,
            manager,
            device,
            current_source: None,
        })
    }

    /// The Wayland display's fd, polled alongside the signal and timer fds
    /// in the daemon's single-threaded loop.
    pub fn as_raw_fd(&self) -> RawFd {
        self.connection.as_fd().as_raw_fd()
    }

    pub fn flush(&self) -> Result<()> {
        self.connection.flush()?;
        Ok(())
    }

    /// Block until a full request/response cycle completes. Used once at
    /// startup to learn whether a foreign offer is already latched before
    /// the poll loop begins.
    pub fn roundtrip(&mut self) -> Result<()> {
        self.event_queue
            .roundtrip(&mut self.state)
            .map_err(|e| KapricaError::Other(e.to_string()))?;
        Ok(())
    }

    /// Dispatch whatever is already buffered, without blocking on the socket.
    pub fn dispatch_pending(&mut self) -> Result<()> {
        self.event_queue
            .dispatch_pending(&mut self.state)
            .map_err(|e| KapricaError::Other(e.to_string()))?;
        Ok(())
    }

    /// Call when `poll` reports the display fd is readable: reads one batch
    /// of wire events and dispatches them.
    pub fn read_events(&mut self) -> Result<()> {
        if let Some(guard) = self.event_queue.prepare_read() {
            guard.read().map_err(|e| KapricaError::Other(e.to_string()))?;
        }
        self.dispatch_pending()
    }

    /// Drain the next translated event, if any.
    pub fn next_event(&mut self) -> Option<TransportEvent> {
        self.state.events.pop_front()
    }

    /// Request `mime_type`'s bytes from `offer` and return the read end of
    /// the pipe, ready to be drained.
    pub fn request_payload(&self, offer: &IncomingOffer, mime_type: &str) -> Result<OwnedFd> {
        offer.request(mime_type, &self.connection)
    }

    /// Take ownership of the selection, offering every payload's MIME type
    /// and arming the suppress-next-read guard.
    /// `offer_once` mirrors `SourceBuffer::offer_once`: when set, the
    /// selection is cleared from inside the `send` callback right after the
    /// first successful write.
    pub fn set_selection(&mut self, payloads: &[MimePayload], offer_once: bool) -> Result<()> {
        if let Some(prev) = self.current_source.take() {
            prev.destroy();
        }
        let source = self.manager.create_data_source(&self.qh);
        for payload in payloads {
            source.offer(&payload.mime_type);
        }
        self.device.set_selection(Some(&source));
        self.state.current_source_id = Some(source.id());
        self.state.serving = payloads.to_vec();
        self.state.suppress_next_selection = true;
        self.state.device = Some(self.device.clone());
        self.state.offer_once = offer_once;
        self.current_source = Some(source);
        self.flush()
    }

    pub fn clear_selection(&mut self) {
        if let Some(prev) = self.current_source.take() {
            prev.destroy();
        }
        self.device.set_selection(None);
        self.state.current_source_id = None;
        self.state.serving.clear();
        self.state.current_offer_id = None;
        self.state.offer_once = false;
    }

    /// True while the daemon/CLI still owns the selection; a one-shot
    /// source flips this to false as soon as it has served its single
    /// consumer.
    pub fn is_serving(&self) -> bool {
        self.state.current_source_id.is_some()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(source) = self.current_source.take() {
            source.destroy();
        }
        let _ = self.connection.flush();
    }
}

// ===================== Dispatch implementations =====================

delegate_noop!(TransportState: ignore ZwlrDataControlManagerV1);
delegate_noop!(TransportState: ignore ExtDataControlManagerV1);
delegate_noop!(TransportState: ignore WlSeat);

impl Dispatch<wl_registry::WlRegistry, GlobalListContents> for TransportState {
    fn event(
        _: &mut Self,
        _: &wl_registry::WlRegistry,
        _: wl_registry::Event,
        _: &GlobalListContents,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
    }
}

impl Dispatch<ZwlrDataControlDeviceV1, ()> for TransportState {
    fn event(
        state: &mut Self,
        _: &ZwlrDataControlDeviceV1,
        event: zwlr_data_control_device_v1::Event,
        (): &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        match event {
            zwlr_data_control_device_v1::Event::DataOffer { id } => {
                state.pending_mime_types.insert(id.id(), Vec::new());
                state.pending_offers.insert(id.id(), DataControlOffer::Wlr(id));
            }
            zwlr_data_control_device_v1::Event::Selection { id } => match id {
                Some(offer) => state.finalize_selection(offer.id()),
                None => {
                    state.current_offer_id = None;
                    state.events.push_back(TransportEvent::SelectionCleared);
                }
            },
            zwlr_data_control_device_v1::Event::PrimarySelection { .. } => {}
            _ => {}
        }
    }

    fn event_created_child(
        opcode: u16,
        qhandle: &QueueHandle<Self>,
    ) -> std::sync::Arc<dyn wayland_client::backend::ObjectData> {
        match opcode {
            0 => qhandle.make_data::<ZwlrDataControlOfferV1, ()>(()),
            _ => panic!("unknown child object for opcode {opcode}"),
        }
    }
}

impl Dispatch<ZwlrDataControlOfferV1, ()> for TransportState {
    fn event(
        state: &mut Self,
        offer: &ZwlrDataControlOfferV1,
        event: zwlr_data_control_offer_v1::Event,
        (): &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let zwlr_data_control_offer_v1::Event::Offer { mime_type } = event {
            state.track_mime_type(&offer.id(), mime_type);
        }
    }
}

impl Dispatch<ZwlrDataControlSourceV1, ()> for TransportState {
    fn event(
        state: &mut Self,
        source: &ZwlrDataControlSourceV1,
        event: zwlr_data_control_source_v1::Event,
        (): &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        dispatch_source_event(state, &source.id(), event.into());
    }
}

impl Dispatch<ExtDataControlDeviceV1, ()> for TransportState {
    fn event(
        state: &mut Self,
        _: &ExtDataControlDeviceV1,
        event: ext_data_control_device_v1::Event,
        (): &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        match event {
            ext_data_control_device_v1::Event::DataOffer { id } => {
                state.pending_mime_types.insert(id.id(), Vec::new());
                state.pending_offers.insert(id.id(), DataControlOffer::Ext(id));
            }
            ext_data_control_device_v1::Event::Selection { id } => match id {
                Some(offer) => state.finalize_selection(offer.id()),
                None => {
                    state.current_offer_id = None;
                    state.events.push_back(TransportEvent::SelectionCleared);
                }
            },
            ext_data_control_device_v1::Event::PrimarySelection { .. } => {}
            ext_data_control_device_v1::Event::Finished => {
                warn!("data-control device revoked by compositor");
                state.events.push_back(TransportEvent::Revoked);
            }
            _ => {}
        }
    }

    fn event_created_child(
        opcode: u16,
        qhandle: &QueueHandle<Self>,
    ) -> std::sync::Arc<dyn wayland_client::backend::ObjectData> {
        match opcode {
            0 => qhandle.make_data::<ExtDataControlOfferV1, ()>(()),
            _ => panic!("unknown child object for opcode {opcode}"),
        }
    }
}

impl Dispatch<ExtDataControlOfferV1, ()> for TransportState {
    fn event(
        state: &mut Self,
        offer: &ExtDataControlOfferV1,
        event: ext_data_control_offer_v1::Event,
        (): &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let ext_data_control_offer_v1::Event::Offer { mime_type } = event {
            state.track_mime_type(&offer.id(), mime_type);
        }
    }
}

impl Dispatch<ExtDataControlSourceV1, ()> for TransportState {
    fn event(
        state: &mut Self,
        source: &ExtDataControlSourceV1,
        event: ext_data_control_source_v1::Event,
        (): &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        dispatch_source_event(state, &source.id(), event.into());
    }
}

/// The two protocols' source events carry identical semantics; normalize to
/// one small enum so both `Dispatch` impls can share the handling logic.
enum SourceEvent {
    Send { mime_type: String, fd: OwnedFd },
    Cancelled,
    Other,
}

impl From<zwlr_data_control_source_v1::Event> for SourceEvent {
    fn from(event: zwlr_data_control_source_v1::Event) -> Self {
        match event {
            zwlr_data_control_source_v1::Event::Send { mime_type, fd } => {
                SourceEvent::Send { mime_type, fd }
            }
            zwlr_data_control_source_v1::Event::Cancelled => SourceEvent::Cancelled,
            _ => SourceEvent::Other,
        }
    }
}

impl From<ext_data_control_source_v1::Event> for SourceEvent {
    fn from(event: ext_data_control_source_v1::Event) -> Self {
        match event {
            ext_data_control_source_v1::Event::Send { mime_type, fd } => {
                SourceEvent::Send { mime_type, fd }
            }
            ext_data_control_source_v1::Event::Cancelled => SourceEvent::Cancelled,
            _ => SourceEvent::Other,
        }
    }
}

fn dispatch_source_event(state: &mut TransportState, source_id: &ObjectId, event: SourceEvent) {
    match event {
        SourceEvent::Send { mime_type, fd } => write_send_payload(state, &mime_type, fd),
        SourceEvent::Cancelled => {
            if state.current_source_id.as_ref() == Some(source_id) {
                state.current_source_id = None;
                state.serving.clear();
                state.suppress_next_selection = false;
                state.events.push_back(TransportEvent::SourceCancelled);
            }
        }
        SourceEvent::Other => {}
    }
}

fn write_send_payload(state: &mut TransportState, mime_type: &str, fd: OwnedFd) {
    use std::io::Write;
    let Some(payload) = state.serving.iter().find(|p| p.mime_type == mime_type).cloned() else {
        warn!("no data staged for mime type {mime_type}, closing pipe");
        return;
    };
    let mut file = std::fs::File::from(fd);
    let wrote_ok = match file.write_all(&payload.bytes) {
        Ok(()) => true,
        Err(e) => {
            warn!("failed writing selection data for {mime_type}: {e}");
            false
        }
    };

    if wrote_ok && state.offer_once {
        if let Some(device) = state.device.take() {
            device.set_selection(None);
        }
        state.current_source_id = None;
        state.serving.clear();
        state.offer_once = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn write_send_payload_writes_matching_mime_type() {
        let mut state = TransportState::new();
        state.serving = vec![MimePayload::new(
            "UTF8_STRING",
            Bytes::from_static(b"hello"),
        )];
        let (reader, writer) = make_pipe().unwrap();

        write_send_payload(&mut state, "UTF8_STRING", writer);

        use std::io::Read;
        let mut out = Vec::new();
        std::fs::File::from(reader).read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn write_send_payload_ignores_unstaged_mime_type() {
        let mut state = TransportState::new();
        let (reader, writer) = make_pipe().unwrap();
        write_send_payload(&mut state, "text/plain", writer);
        drop(reader);
    }
}
