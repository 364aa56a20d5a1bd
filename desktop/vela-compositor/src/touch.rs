//! Per-seat touch state: per-slot focus tracking.
//!
//! A touch-down hit-tests like the pointer; motion and up for that slot go
//! to the recorded focus without re-hit-testing. Cancel clears every slot.

use crate::geometry::Point;
use crate::input::SeatEvent;
use crate::protocol::{ClientEvent, Clients, Serial};
use crate::surface::{SurfaceEngine, SurfaceId};
use std::collections::HashMap;

/// Events delivered on a wl_touch.
#[derive(Debug, Clone)]
pub enum TouchEvent {
    Down {
        serial: Serial,
        time_ms: u32,
        surface: SurfaceId,
        slot: u32,
        /// Surface-local position.
        position: Point<f64>,
    },
    Up {
        serial: Serial,
        time_ms: u32,
        slot: u32,
    },
    Motion {
        time_ms: u32,
        slot: u32,
        position: Point<f64>,
    },
    Frame,
    Cancel,
}

#[derive(Debug, Clone, Copy)]
pub struct TouchSlot {
    pub surface: SurfaceId,
    pub origin: Point<f64>,
}

#[derive(Debug, Default)]
pub struct TouchState {
    slots: HashMap<u32, TouchSlot>,
}

impl TouchState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(&self, slot: u32) -> Option<&TouchSlot> {
        self.slots.get(&slot)
    }

    pub fn active_slots(&self) -> usize {
        self.slots.len()
    }

    fn send_to(
        clients: &mut Clients,
        surfaces: &SurfaceEngine,
        surface: SurfaceId,
        event: TouchEvent,
    ) {
        if let Some(record) = surfaces.get(surface) {
            clients.send(record.client, ClientEvent::Seat(SeatEvent::Touch(event)));
        }
    }

    /// Record the slot focus decided by the caller's hit test and deliver
    /// the down event.
    pub fn down(
        &mut self,
        slot: u32,
        focus: TouchSlot,
        global: Point<f64>,
        serial: Serial,
        time_ms: u32,
        clients: &mut Clients,
        surfaces: &SurfaceEngine,
    ) {
        self.slots.insert(slot, focus);
        let position = Point::new(global.x - focus.origin.x, global.y - focus.origin.y);
        Self::send_to(
            clients,
            surfaces,
            focus.surface,
            TouchEvent::Down {
                serial,
                time_ms,
                surface: focus.surface,
                slot,
                position,
            },
        );
    }

    /// Motion relative to the slot's recorded focus.
    pub fn motion(
        &self,
        slot: u32,
        global: Point<f64>,
        time_ms: u32,
        clients: &mut Clients,
        surfaces: &SurfaceEngine,
    ) {
        if let Some(focus) = self.slots.get(&slot) {
            let position = Point::new(global.x - focus.origin.x, global.y - focus.origin.y);
            Self::send_to(
                clients,
                surfaces,
                focus.surface,
                TouchEvent::Motion {
                    time_ms,
                    slot,
                    position,
                },
            );
        }
    }

    pub fn up(
        &mut self,
        slot: u32,
        serial: Serial,
        time_ms: u32,
        clients: &mut Clients,
        surfaces: &SurfaceEngine,
    ) {
        if let Some(focus) = self.slots.remove(&slot) {
            Self::send_to(
                clients,
                surfaces,
                focus.surface,
                TouchEvent::Up { serial, time_ms, slot },
            );
        }
    }

    /// End-of-event grouping, sent to every surface with an active slot.
    pub fn frame(&self, clients: &mut Clients, surfaces: &SurfaceEngine) {
        let mut notified: Vec<SurfaceId> = Vec::new();
        for focus in self.slots.values() {
            if !notified.contains(&focus.surface) {
                notified.push(focus.surface);
                Self::send_to(clients, surfaces, focus.surface, TouchEvent::Frame);
            }
        }
    }

    /// The backend cancelled the touch sequence: clear every slot with a
    /// cancel event.
    pub fn cancel(&mut self, clients: &mut Clients, surfaces: &SurfaceEngine) {
        let mut notified: Vec<SurfaceId> = Vec::new();
        for focus in self.slots.values() {
            if !notified.contains(&focus.surface) {
                notified.push(focus.surface);
                Self::send_to(clients, surfaces, focus.surface, TouchEvent::Cancel);
            }
        }
        self.slots.clear();
    }

    /// Drop slots pointing at a destroyed surface.
    pub fn surface_destroyed(&mut self, surface: SurfaceId) {
        self.slots.retain(|_, focus| focus.surface != surface);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientId, SerialCounter};

    fn fixture() -> (Clients, SurfaceEngine, ClientId, SurfaceId) {
        let mut clients = Clients::new();
        let client = clients.connect();
        let mut surfaces = SurfaceEngine::new();
        surfaces.bind_client(client);
        let surface = surfaces.create_surface(client);
        (clients, surfaces, client, surface)
    }

    #[test]
    fn motion_uses_slot_focus_not_rehit() {
        let (mut clients, surfaces, client, surface) = fixture();
        let mut serials = SerialCounter::new();
        let mut touch = TouchState::new();

        touch.down(
            0,
            TouchSlot { surface, origin: Point::new(100.0, 100.0) },
            Point::new(110.0, 120.0),
            serials.next_serial(),
            1,
            &mut clients,
            &surfaces,
        );
        // Even a far-away motion stays addressed to the slot focus.
        touch.motion(0, Point::new(500.0, 500.0), 2, &mut clients, &surfaces);

        let events = clients.drain(client);
        assert!(matches!(
            events[0],
            ClientEvent::Seat(SeatEvent::Touch(TouchEvent::Down { position, .. }))
                if position == Point::new(10.0, 20.0)
        ));
        assert!(matches!(
            events[1],
            ClientEvent::Seat(SeatEvent::Touch(TouchEvent::Motion { position, .. }))
                if position == Point::new(400.0, 400.0)
        ));
    }

    #[test]
    fn cancel_clears_all_slots() {
        let (mut clients, surfaces, client, surface) = fixture();
        let mut serials = SerialCounter::new();
        let mut touch = TouchState::new();
        touch.down(
            0,
            TouchSlot { surface, origin: Point::new(0.0, 0.0) },
            Point::new(1.0, 1.0),
            serials.next_serial(),
            1,
            &mut clients,
            &surfaces,
        );
        touch.down(
            1,
            TouchSlot { surface, origin: Point::new(0.0, 0.0) },
            Point::new(2.0, 2.0),
            serials.next_serial(),
            1,
            &mut clients,
            &surfaces,
        );
        clients.drain(client);

        touch.cancel(&mut clients, &surfaces);
        assert_eq!(touch.active_slots(), 0);
        let events = clients.drain(client);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            ClientEvent::Seat(SeatEvent::Touch(TouchEvent::Cancel))
        ));
    }
}
