//! Protocol-level primitives: client identities, serials, the per-client
//! event outbox, and the protocol error taxonomy.
//!
//! The engines never serialize wire bytes. Every compositor-to-client event
//! is pushed as a typed [`ClientEvent`] into the owning client's outbox; the
//! wire transport (an external collaborator) drains the outbox and encodes.
//! This keeps every protocol rule local and testable.

use crate::buffer::{BufferEvent, BufferId};
use crate::input::SeatEvent;
use crate::output::OutputEvent;
use crate::output_config::{ConfigurationId, OutputConfigEvent};
use crate::shell::{PopupEvent, PopupId, ToplevelEvent, ToplevelId};
use crate::surface::SurfaceId;
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

/// Identifier of a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u32);

/// A wire serial. Serials are u32 counters that wrap; ordering is defined by
/// wrapping distance, matching the Wayland convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Serial(pub u32);

impl Serial {
    /// `self` was issued at the same time as `other` or later.
    pub fn is_no_older_than(self, other: Serial) -> bool {
        self.0.wrapping_sub(other.0) < (1 << 31)
    }
}

/// The single monotonic serial source for input and configure events.
#[derive(Debug, Default)]
pub struct SerialCounter {
    last: u32,
}

impl SerialCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_serial(&mut self) -> Serial {
        self.last = self.last.wrapping_add(1);
        Serial(self.last)
    }

    pub fn last_serial(&self) -> Serial {
        Serial(self.last)
    }
}

/// A compositor-to-client event, queued on the owning client's outbox.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Seat(SeatEvent),
    Toplevel(ToplevelId, ToplevelEvent),
    Popup(PopupId, PopupEvent),
    Output(OutputEvent),
    OutputConfig(ConfigurationId, OutputConfigEvent),
    Buffer(BufferId, BufferEvent),
    FrameDone {
        surface: SurfaceId,
        callback: u32,
        time_ms: u32,
    },
    /// Terminal: the client violated the protocol. The transport sends the
    /// code and closes the connection.
    Error { code: u32, message: String },
}

/// A client violated the protocol. The error is sent to the offending client
/// and its connection is closed; the compositor continues unaffected.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("surface already has role \"{existing}\", cannot assign \"{requested}\"")]
    RoleTaken {
        existing: &'static str,
        requested: &'static str,
    },
    #[error("xdg_surface role object was already constructed")]
    RoleAlreadyConstructed,
    #[error("ack_configure with serial {0} that was never sent")]
    UnknownConfigureSerial(u32),
    #[error("popup requires a parent surface")]
    MissingPopupParent,
    #[error("positioner is incomplete: size and anchor rectangle are required")]
    InvalidPositioner,
    #[error("popup grab does not point at the topmost popup")]
    NotTopmostPopup,
    #[error("popup positioner changed without a reposition request")]
    StaleRepositionToken,
    #[error("invalid size: {0}x{1}")]
    InvalidSize(i32, i32),
    #[error("invalid buffer scale {0}")]
    InvalidScale(i32),
    #[error("invalid resize edge {0}")]
    InvalidResizeEdge(u32),
    #[error("output configuration was already tested or applied")]
    ConfigurationProcessed,
    #[error("output configuration already carries changes for this head")]
    DuplicateHeadChange,
    #[error("buffer (offset {offset}, stride {stride}, {width}x{height}) exceeds pool of {pool_size} bytes")]
    BufferOutOfBounds {
        offset: i32,
        stride: i32,
        width: i32,
        height: i32,
        pool_size: usize,
    },
    #[error("shm pool size {0} is invalid")]
    InvalidPoolSize(i32),
    #[error("unsupported buffer format {0:#x}")]
    UnsupportedFormat(u32),
    #[error("surface has no xdg role")]
    NotAnXdgSurface,
}

impl ProtocolError {
    /// Numeric code carried on the wire alongside the connection close.
    pub fn code(&self) -> u32 {
        match self {
            ProtocolError::RoleTaken { .. } => 0,
            ProtocolError::RoleAlreadyConstructed => 1,
            ProtocolError::UnknownConfigureSerial(_) => 2,
            ProtocolError::MissingPopupParent => 3,
            ProtocolError::InvalidPositioner => 4,
            ProtocolError::NotTopmostPopup => 5,
            ProtocolError::StaleRepositionToken => 6,
            ProtocolError::InvalidSize(..) => 7,
            ProtocolError::InvalidScale(_) => 15,
            ProtocolError::InvalidResizeEdge(_) => 8,
            ProtocolError::ConfigurationProcessed => 9,
            ProtocolError::DuplicateHeadChange => 10,
            ProtocolError::BufferOutOfBounds { .. } => 11,
            ProtocolError::InvalidPoolSize(_) => 12,
            ProtocolError::UnsupportedFormat(_) => 13,
            ProtocolError::NotAnXdgSurface => 14,
        }
    }
}

/// Per-client connection record. Engines keep their own per-client slots;
/// this registry owns only identity, liveness and the outbox.
#[derive(Debug, Default)]
pub struct ClientRecord {
    pub outbox: VecDeque<ClientEvent>,
    pub alive: bool,
}

/// Registry of connected clients.
#[derive(Debug, Default)]
pub struct Clients {
    map: HashMap<ClientId, ClientRecord>,
    next_id: u32,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly accepted connection.
    pub fn connect(&mut self) -> ClientId {
        self.next_id += 1;
        let id = ClientId(self.next_id);
        self.map.insert(
            id,
            ClientRecord {
                outbox: VecDeque::new(),
                alive: true,
            },
        );
        tracing::debug!(client = id.0, "client connected");
        id
    }

    pub fn is_alive(&self, client: ClientId) -> bool {
        self.map.get(&client).map(|c| c.alive).unwrap_or(false)
    }

    /// Queue an event for a client. Events for departed clients are dropped;
    /// the cascade that destroys their objects is already underway.
    pub fn send(&mut self, client: ClientId, event: ClientEvent) {
        match self.map.get_mut(&client) {
            Some(record) if record.alive => record.outbox.push_back(event),
            _ => tracing::trace!(client = client.0, "dropping event for departed client"),
        }
    }

    /// Queue the terminal protocol error and mark the connection for close.
    pub fn post_error(&mut self, client: ClientId, error: &ProtocolError) {
        tracing::warn!(client = client.0, code = error.code(), %error, "protocol error");
        if let Some(record) = self.map.get_mut(&client) {
            if record.alive {
                record.outbox.push_back(ClientEvent::Error {
                    code: error.code(),
                    message: error.to_string(),
                });
                record.alive = false;
            }
        }
    }

    /// Mark a client gone (peer disconnect). Object destruction cascades are
    /// driven by the caller.
    pub fn disconnect(&mut self, client: ClientId) {
        if let Some(record) = self.map.get_mut(&client) {
            record.alive = false;
        }
        tracing::debug!(client = client.0, "client disconnected");
    }

    /// Drop the record entirely once the cascade has finished.
    pub fn remove(&mut self, client: ClientId) {
        self.map.remove(&client);
    }

    /// Drain the queued events for a client, in order.
    pub fn drain(&mut self, client: ClientId) -> Vec<ClientEvent> {
        match self.map.get_mut(&client) {
            Some(record) => record.outbox.drain(..).collect(),
            None => Vec::new(),
        }
    }

    pub fn ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<_> = self.map.keys().copied().collect();
        ids.sort();
        ids
    }
}

/// A broken internal invariant. These indicate implementation bugs, not
/// client misbehavior; the process aborts after the log line is flushed.
pub(crate) fn fatal_invariant(msg: &str) -> ! {
    tracing::error!(target: "vela::fatal", "{msg}");
    panic!("fatal invariant violated: {msg}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_wrapping_order() {
        let a = Serial(u32::MAX);
        let b = Serial(2);
        assert!(b.is_no_older_than(a));
        assert!(!a.is_no_older_than(b));
        assert!(a.is_no_older_than(a));
    }

    #[test]
    fn serial_counter_monotonic() {
        let mut counter = SerialCounter::new();
        let a = counter.next_serial();
        let b = counter.next_serial();
        assert!(b.is_no_older_than(a));
        assert_ne!(a, b);
        assert_eq!(counter.last_serial(), b);
    }

    #[test]
    fn outbox_order_and_error_close() {
        let mut clients = Clients::new();
        let id = clients.connect();
        assert!(clients.is_alive(id));

        clients.send(
            id,
            ClientEvent::FrameDone {
                surface: SurfaceId(1),
                callback: 7,
                time_ms: 16,
            },
        );
        clients.post_error(id, &ProtocolError::MissingPopupParent);
        assert!(!clients.is_alive(id));

        // Events after the error are dropped.
        clients.send(
            id,
            ClientEvent::FrameDone {
                surface: SurfaceId(1),
                callback: 8,
                time_ms: 32,
            },
        );

        let drained = clients.drain(id);
        assert_eq!(drained.len(), 2);
        assert!(matches!(drained[0], ClientEvent::FrameDone { callback: 7, .. }));
        assert!(matches!(drained[1], ClientEvent::Error { .. }));
    }
}
