//! Per-seat pointer state: global position, focus tracking, button and
//! axis delivery, grabs and the cursor image tag.
//!
//! Hit-testing itself happens at the state level (it needs the window
//! stack); this module owns the resulting focus and event emission. While a
//! grab is active no hit-testing happens at all: every event goes to the
//! grab holder.

use crate::geometry::Point;
use crate::input::{AxisAmount, AxisSource, ButtonState, SeatEvent};
use crate::protocol::{ClientEvent, Clients, Serial};
use crate::surface::{SurfaceEngine, SurfaceId};

/// What the pointer looks like. Theming is a renderer concern; the core
/// stores only this tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorImage {
    Hidden,
    /// A name from the cursor theme.
    Named(String),
    /// A client-supplied cursor surface.
    Surface {
        surface: SurfaceId,
        hotspot: Point<i32>,
    },
}

impl Default for CursorImage {
    fn default() -> Self {
        CursorImage::Named("left_ptr".into())
    }
}

/// Who currently receives pointer events instead of the hit-test winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerGrab {
    /// An interactive move/resize driven by window mechanics.
    Interactive,
    /// An xdg_popup grab chain.
    Popup,
}

/// Events delivered on a wl_pointer.
#[derive(Debug, Clone)]
pub enum PointerEvent {
    Enter {
        serial: Serial,
        surface: SurfaceId,
        /// Surface-local position.
        position: Point<f64>,
    },
    Leave { serial: Serial, surface: SurfaceId },
    Motion {
        time_ms: u32,
        /// Surface-local position.
        position: Point<f64>,
    },
    Button {
        serial: Serial,
        time_ms: u32,
        button: u32,
        state: ButtonState,
    },
    Axis {
        time_ms: u32,
        source: AxisSource,
        horizontal: AxisAmount,
        vertical: AxisAmount,
    },
    Frame,
}

/// The surface under the pointer and where its origin sits in global
/// space, for global→surface-local conversion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointerFocus {
    pub surface: SurfaceId,
    pub origin: Point<f64>,
}

impl PointerFocus {
    pub fn local(&self, global: Point<f64>) -> Point<f64> {
        Point::new(global.x - self.origin.x, global.y - self.origin.y)
    }
}

#[derive(Debug, Default)]
pub struct PointerState {
    /// Global position in logical coordinates.
    pub position: Point<f64>,
    pub focus: Option<PointerFocus>,
    pub grab: Option<PointerGrab>,
    /// Held buttons (evdev codes).
    pressed: Vec<u32>,
    /// Serial of the most recent button press, for validating move/resize
    /// and popup-grab requests.
    pub last_press_serial: Option<Serial>,
    pub cursor: CursorImage,
}

impl PointerState {
    pub fn new() -> Self {
        Self {
            cursor: CursorImage::default(),
            ..Self::default()
        }
    }

    pub fn pressed_buttons(&self) -> &[u32] {
        &self.pressed
    }

    fn send_to(
        clients: &mut Clients,
        surfaces: &SurfaceEngine,
        surface: SurfaceId,
        event: PointerEvent,
    ) {
        if let Some(record) = surfaces.get(surface) {
            clients.send(record.client, ClientEvent::Seat(SeatEvent::Pointer(event)));
        }
    }

    /// Replace the pointer focus, emitting the leave/enter pair. During a
    /// grab the focus is pinned by the grab logic; callers do not re-enter
    /// here on motion.
    pub fn set_focus(
        &mut self,
        new_focus: Option<PointerFocus>,
        serial: Serial,
        clients: &mut Clients,
        surfaces: &SurfaceEngine,
    ) {
        let same = match (&self.focus, &new_focus) {
            (Some(a), Some(b)) => a.surface == b.surface,
            (None, None) => true,
            _ => false,
        };
        if same {
            // Keep the origin fresh; the window may have moved.
            self.focus = new_focus;
            return;
        }
        if let Some(old) = self.focus.take() {
            Self::send_to(
                clients,
                surfaces,
                old.surface,
                PointerEvent::Leave {
                    serial,
                    surface: old.surface,
                },
            );
            Self::send_to(clients, surfaces, old.surface, PointerEvent::Frame);
        }
        self.focus = new_focus;
        if let Some(new) = &self.focus {
            Self::send_to(
                clients,
                surfaces,
                new.surface,
                PointerEvent::Enter {
                    serial,
                    surface: new.surface,
                    position: new.local(self.position),
                },
            );
            Self::send_to(clients, surfaces, new.surface, PointerEvent::Frame);
        }
    }

    /// Deliver motion to the current focus with surface-local coordinates.
    pub fn motion(&self, time_ms: u32, clients: &mut Clients, surfaces: &SurfaceEngine) {
        if let Some(focus) = &self.focus {
            Self::send_to(
                clients,
                surfaces,
                focus.surface,
                PointerEvent::Motion {
                    time_ms,
                    position: focus.local(self.position),
                },
            );
            Self::send_to(clients, surfaces, focus.surface, PointerEvent::Frame);
        }
    }

    /// Update the held-button set without delivering anything; used while a
    /// grab consumes the events.
    pub fn track_button(&mut self, button: u32, state: ButtonState, serial: Serial) {
        match state {
            ButtonState::Pressed => {
                if !self.pressed.contains(&button) {
                    self.pressed.push(button);
                }
                self.last_press_serial = Some(serial);
            }
            ButtonState::Released => self.pressed.retain(|b| *b != button),
        }
    }

    /// Deliver a button to the current focus, tracking held buttons and the
    /// last press serial.
    pub fn button(
        &mut self,
        button: u32,
        state: ButtonState,
        time_ms: u32,
        serial: Serial,
        clients: &mut Clients,
        surfaces: &SurfaceEngine,
    ) {
        self.track_button(button, state, serial);
        if let Some(focus) = &self.focus {
            Self::send_to(
                clients,
                surfaces,
                focus.surface,
                PointerEvent::Button {
                    serial,
                    time_ms,
                    button,
                    state,
                },
            );
            Self::send_to(clients, surfaces, focus.surface, PointerEvent::Frame);
        }
    }

    /// Deliver scroll with both continuous and discrete components.
    pub fn axis(
        &self,
        time_ms: u32,
        source: AxisSource,
        horizontal: AxisAmount,
        vertical: AxisAmount,
        clients: &mut Clients,
        surfaces: &SurfaceEngine,
    ) {
        if let Some(focus) = &self.focus {
            Self::send_to(
                clients,
                surfaces,
                focus.surface,
                PointerEvent::Axis {
                    time_ms,
                    source,
                    horizontal,
                    vertical,
                },
            );
            Self::send_to(clients, surfaces, focus.surface, PointerEvent::Frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientId, SerialCounter};

    fn fixture() -> (Clients, SurfaceEngine, ClientId, SurfaceId, SurfaceId) {
        let mut clients = Clients::new();
        let client = clients.connect();
        let mut surfaces = SurfaceEngine::new();
        surfaces.bind_client(client);
        let a = surfaces.create_surface(client);
        let b = surfaces.create_surface(client);
        (clients, surfaces, client, a, b)
    }

    fn pointer_events(events: Vec<ClientEvent>) -> Vec<PointerEvent> {
        events
            .into_iter()
            .filter_map(|e| match e {
                ClientEvent::Seat(SeatEvent::Pointer(p)) => Some(p),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn focus_change_emits_leave_then_enter() {
        let (mut clients, surfaces, client, a, b) = fixture();
        let mut serials = SerialCounter::new();
        let mut pointer = PointerState::new();
        pointer.position = Point::new(150.0, 120.0);

        pointer.set_focus(
            Some(PointerFocus { surface: a, origin: Point::new(100.0, 100.0) }),
            serials.next_serial(),
            &mut clients,
            &surfaces,
        );
        let events = pointer_events(clients.drain(client));
        assert!(matches!(
            events[0],
            PointerEvent::Enter { surface, position, .. }
                if surface == a && position == Point::new(50.0, 20.0)
        ));

        pointer.set_focus(
            Some(PointerFocus { surface: b, origin: Point::new(0.0, 0.0) }),
            serials.next_serial(),
            &mut clients,
            &surfaces,
        );
        let events = pointer_events(clients.drain(client));
        assert!(matches!(events[0], PointerEvent::Leave { surface, .. } if surface == a));
        assert!(events.iter().any(|e| matches!(e, PointerEvent::Enter { surface, .. } if *surface == b)));
    }

    #[test]
    fn button_press_records_serial() {
        let (mut clients, surfaces, _, a, _) = fixture();
        let mut serials = SerialCounter::new();
        let mut pointer = PointerState::new();
        pointer.focus = Some(PointerFocus { surface: a, origin: Point::new(0.0, 0.0) });

        let serial = serials.next_serial();
        pointer.button(0x110, ButtonState::Pressed, 5, serial, &mut clients, &surfaces);
        assert_eq!(pointer.last_press_serial, Some(serial));
        assert_eq!(pointer.pressed_buttons(), &[0x110]);

        pointer.button(0x110, ButtonState::Released, 6, serials.next_serial(), &mut clients, &surfaces);
        assert!(pointer.pressed_buttons().is_empty());
    }
}
