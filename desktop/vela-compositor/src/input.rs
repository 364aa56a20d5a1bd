//! Input handling: the backend-agnostic event model, seat capability
//! lifecycle, and the routing of events into the keyboard, pointer and
//! touch paths.
//!
//! Device acquisition (libinput behind the session interface) is an
//! external collaborator; its events arrive here as [`InputEvent`] values
//! and are processed by [`process_input_event`] against the whole desktop
//! state, free-function style.

use crate::config::KeyboardConfig;
use crate::interactive::GrabKind;
use crate::keyboard::{KeyboardEvent, KeyboardState, RepeatDecision};
use crate::pointer::{PointerFocus, PointerGrab, PointerState};
use crate::protocol::{ClientEvent, ClientId, Clients};
use crate::spine::TimerReschedule;
use crate::state::DesktopState;
use crate::touch::{TouchSlot, TouchState};
use crate::geometry::Point;
use std::collections::HashMap;

bitflags::bitflags! {
    /// Capabilities a device (or the whole seat) offers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct DeviceCaps: u32 {
        const KEYBOARD = 1;
        const POINTER = 2;
        const TOUCH = 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

/// An attached input device as reported by the backend.
#[derive(Debug, Clone)]
pub struct InputDevice {
    pub id: DeviceId,
    pub name: String,
    pub caps: DeviceCaps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Pressed,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonState {
    Pressed,
    Released,
}

/// Where a scroll came from, per libinput's source tagging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisSource {
    Wheel,
    Finger,
    Continuous,
    WheelTilt,
}

/// One axis of a scroll event: continuous motion plus the optional
/// discrete component in 1/120 steps.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AxisAmount {
    pub absolute: f64,
    pub v120: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GestureKind {
    Pinch,
    Swipe,
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GesturePhase {
    Begin,
    Update,
    End,
}

/// A low-level input event, already translated out of the backend's types.
#[derive(Debug, Clone)]
pub enum InputEvent {
    DeviceAdded { device: InputDevice },
    DeviceRemoved { device: DeviceId },
    Key {
        time_ms: u32,
        key: u32,
        state: KeyState,
    },
    PointerMotion {
        time_ms: u32,
        delta: Point<f64>,
    },
    PointerMotionAbsolute {
        time_ms: u32,
        /// Already mapped into global logical coordinates.
        position: Point<f64>,
    },
    PointerButton {
        time_ms: u32,
        button: u32,
        state: ButtonState,
    },
    PointerAxis {
        time_ms: u32,
        source: AxisSource,
        horizontal: AxisAmount,
        vertical: AxisAmount,
    },
    TouchDown {
        time_ms: u32,
        slot: u32,
        position: Point<f64>,
    },
    TouchMotion {
        time_ms: u32,
        slot: u32,
        position: Point<f64>,
    },
    TouchUp { time_ms: u32, slot: u32 },
    TouchFrame,
    TouchCancel,
    Gesture {
        kind: GestureKind,
        phase: GesturePhase,
        fingers: u32,
    },
}

/// Events delivered on a wl_seat and its capability objects.
#[derive(Debug, Clone)]
pub enum SeatEvent {
    Capabilities { caps: DeviceCaps },
    Keyboard(KeyboardEvent),
    Pointer(crate::pointer::PointerEvent),
    Touch(crate::touch::TouchEvent),
}

/// A logical grouping of input capabilities for one user. A capability
/// handle exists iff a device of that kind is attached.
pub struct Seat {
    pub name: String,
    devices: HashMap<DeviceId, DeviceCaps>,
    pub keyboard: Option<KeyboardState>,
    pub pointer: Option<PointerState>,
    pub touch: Option<TouchState>,
}

impl Seat {
    fn new(name: String) -> Self {
        Self {
            name,
            devices: HashMap::new(),
            keyboard: None,
            pointer: None,
            touch: None,
        }
    }

    pub fn capabilities(&self) -> DeviceCaps {
        let mut caps = DeviceCaps::empty();
        if self.keyboard.is_some() {
            caps |= DeviceCaps::KEYBOARD;
        }
        if self.pointer.is_some() {
            caps |= DeviceCaps::POINTER;
        }
        if self.touch.is_some() {
            caps |= DeviceCaps::TOUCH;
        }
        caps
    }

    fn device_union(&self) -> DeviceCaps {
        self.devices
            .values()
            .fold(DeviceCaps::empty(), |acc, caps| acc | *caps)
    }
}

/// What a device removal tore down; the caller releases timers.
#[derive(Debug, Default)]
pub struct RemovedCapabilities {
    pub keyboard_removed: bool,
    pub pointer_removed: bool,
    pub touch_removed: bool,
    pub repeat_timer: Option<crate::spine::TimerHandle>,
}

/// The input engine: one seat, its capability handles and the clients bound
/// to the seat global.
pub struct InputEngine {
    pub seat: Seat,
    bound_clients: Vec<ClientId>,
}

impl InputEngine {
    pub fn new(seat_name: &str) -> Self {
        Self {
            seat: Seat::new(seat_name.to_string()),
            bound_clients: Vec::new(),
        }
    }

    /// Bind a client to the seat global: it learns the current capability
    /// set, and keyboard parameters if a keyboard exists.
    pub fn bind_seat_client(&mut self, client: ClientId, clients: &mut Clients) {
        if !self.bound_clients.contains(&client) {
            self.bound_clients.push(client);
        }
        clients.send(
            client,
            ClientEvent::Seat(SeatEvent::Capabilities {
                caps: self.seat.capabilities(),
            }),
        );
        if let Some(keyboard) = &self.seat.keyboard {
            clients.send(
                client,
                ClientEvent::Seat(SeatEvent::Keyboard(KeyboardEvent::Keymap {
                    file: keyboard.keymap_file(),
                })),
            );
            clients.send(
                client,
                ClientEvent::Seat(SeatEvent::Keyboard(KeyboardEvent::RepeatInfo {
                    rate: keyboard.repeat_rate,
                    delay_ms: keyboard.repeat_delay.as_millis() as i32,
                })),
            );
        }
    }

    pub fn bound_clients(&self) -> &[ClientId] {
        &self.bound_clients
    }

    fn advertise_capabilities(&self, clients: &mut Clients) {
        let caps = self.seat.capabilities();
        for client in &self.bound_clients {
            clients.send(*client, ClientEvent::Seat(SeatEvent::Capabilities { caps }));
        }
    }

    /// Broadcast a keyboard event to every bound seat client (keymap and
    /// repeat-info travel to everyone, not just the focus).
    pub fn broadcast_keyboard(&self, event: KeyboardEvent, clients: &mut Clients) {
        for client in &self.bound_clients {
            clients.send(*client, ClientEvent::Seat(SeatEvent::Keyboard(event.clone())));
        }
    }

    /// A device appeared. New capabilities construct their handles and are
    /// advertised to every bound seat client.
    pub fn device_added(
        &mut self,
        device: InputDevice,
        keyboard_config: &KeyboardConfig,
        clients: &mut Clients,
    ) -> anyhow::Result<()> {
        tracing::info!(device = %device.name, caps = ?device.caps, "input device added");
        self.seat.devices.insert(device.id, device.caps);
        let mut changed = false;

        if device.caps.contains(DeviceCaps::KEYBOARD) && self.seat.keyboard.is_none() {
            let keyboard = KeyboardState::new(keyboard_config)?;
            let keymap = keyboard.keymap_file();
            let rate = keyboard.repeat_rate;
            let delay_ms = keyboard.repeat_delay.as_millis() as i32;
            self.seat.keyboard = Some(keyboard);
            self.broadcast_keyboard(KeyboardEvent::Keymap { file: keymap }, clients);
            self.broadcast_keyboard(KeyboardEvent::RepeatInfo { rate, delay_ms }, clients);
            changed = true;
        }
        if device.caps.contains(DeviceCaps::POINTER) && self.seat.pointer.is_none() {
            self.seat.pointer = Some(PointerState::new());
            changed = true;
        }
        if device.caps.contains(DeviceCaps::TOUCH) && self.seat.touch.is_none() {
            self.seat.touch = Some(TouchState::new());
            changed = true;
        }
        if changed {
            self.advertise_capabilities(clients);
        }
        Ok(())
    }

    /// A device went away. A capability is withdrawn only when no other
    /// attached device still offers it.
    pub fn device_removed(&mut self, device: DeviceId, clients: &mut Clients) -> RemovedCapabilities {
        let mut removed = RemovedCapabilities::default();
        if self.seat.devices.remove(&device).is_none() {
            return removed;
        }
        let remaining = self.seat.device_union();

        if !remaining.contains(DeviceCaps::KEYBOARD) {
            if let Some(mut keyboard) = self.seat.keyboard.take() {
                removed.keyboard_removed = true;
                removed.repeat_timer = keyboard.repeat_timer.take();
            }
        }
        if !remaining.contains(DeviceCaps::POINTER) && self.seat.pointer.is_some() {
            self.seat.pointer = None;
            removed.pointer_removed = true;
        }
        if !remaining.contains(DeviceCaps::TOUCH) && self.seat.touch.is_some() {
            self.seat.touch = None;
            removed.touch_removed = true;
        }
        if removed.keyboard_removed || removed.pointer_removed || removed.touch_removed {
            self.advertise_capabilities(clients);
        }
        removed
    }
}

/// Process one input event against the desktop state. This is the single
/// entry point the backends feed.
pub fn process_input_event(state: &mut DesktopState, event: InputEvent) {
    match event {
        InputEvent::DeviceAdded { device } => {
            let keyboard_config = state.config.keyboard.clone();
            if let Err(err) = state
                .input
                .device_added(device, &keyboard_config, &mut state.clients)
            {
                tracing::error!(%err, "failed to initialise device");
            }
        }
        InputEvent::DeviceRemoved { device } => handle_device_removed(state, device),
        InputEvent::Key { time_ms, key, state: key_state } => {
            handle_key(state, time_ms, key, key_state)
        }
        InputEvent::PointerMotion { time_ms, delta } => {
            let factor = 1.0 + state.config.pointer.accel_speed.clamp(-0.9, 1.0);
            let position = match &state.input.seat.pointer {
                Some(pointer) => Point::new(
                    pointer.position.x + delta.x * factor,
                    pointer.position.y + delta.y * factor,
                ),
                None => return,
            };
            handle_pointer_position(state, time_ms, position);
        }
        InputEvent::PointerMotionAbsolute { time_ms, position } => {
            handle_pointer_position(state, time_ms, position)
        }
        InputEvent::PointerButton { time_ms, button, state: button_state } => {
            handle_pointer_button(state, time_ms, button, button_state)
        }
        InputEvent::PointerAxis { time_ms, source, horizontal, vertical } => {
            let natural = state.config.pointer.natural_scroll;
            let flip = |amount: AxisAmount| {
                if natural {
                    AxisAmount {
                        absolute: -amount.absolute,
                        v120: amount.v120.map(|v| -v),
                    }
                } else {
                    amount
                }
            };
            let DesktopState { input, clients, surfaces, .. } = state;
            if let Some(pointer) = &input.seat.pointer {
                pointer.axis(time_ms, source, flip(horizontal), flip(vertical), clients, surfaces);
            }
        }
        InputEvent::TouchDown { time_ms, slot, position } => {
            let serial = state.serials.next_serial();
            let hit = state
                .mechanics
                .surface_under(position, &state.shell, &state.surfaces);
            let DesktopState { input, clients, surfaces, .. } = state;
            if let (Some(touch), Some((surface, origin))) = (&mut input.seat.touch, hit) {
                touch.down(
                    slot,
                    TouchSlot { surface, origin },
                    position,
                    serial,
                    time_ms,
                    clients,
                    surfaces,
                );
            }
        }
        InputEvent::TouchMotion { time_ms, slot, position } => {
            let DesktopState { input, clients, surfaces, .. } = state;
            if let Some(touch) = &input.seat.touch {
                touch.motion(slot, position, time_ms, clients, surfaces);
            }
        }
        InputEvent::TouchUp { time_ms, slot } => {
            let serial = state.serials.next_serial();
            let DesktopState { input, clients, surfaces, .. } = state;
            if let Some(touch) = &mut input.seat.touch {
                touch.up(slot, serial, time_ms, clients, surfaces);
            }
        }
        InputEvent::TouchFrame => {
            let DesktopState { input, clients, surfaces, .. } = state;
            if let Some(touch) = &input.seat.touch {
                touch.frame(clients, surfaces);
            }
        }
        InputEvent::TouchCancel => {
            let DesktopState { input, clients, surfaces, .. } = state;
            if let Some(touch) = &mut input.seat.touch {
                touch.cancel(clients, surfaces);
            }
        }
        InputEvent::Gesture { kind, phase, fingers } => {
            // Client forwarding is reserved for a later iteration.
            tracing::debug!(?kind, ?phase, fingers, "gesture event");
        }
    }
}

fn handle_device_removed(state: &mut DesktopState, device: DeviceId) {
    let removed = state.input.device_removed(device, &mut state.clients);
    if let Some(timer) = removed.repeat_timer {
        state.spine.cancel_timer(timer);
    }
    if removed.pointer_removed {
        // Seat lost its pointer: any interactive grab dies with it.
        state.mechanics.grab_cancel();
    }
}

fn handle_key(state: &mut DesktopState, time_ms: u32, key: u32, key_state: KeyState) {
    let decision = {
        let DesktopState { input, serials, clients, surfaces, .. } = state;
        let keyboard = match &mut input.seat.keyboard {
            Some(keyboard) => keyboard,
            None => return,
        };
        keyboard.handle_key(key, key_state, time_ms, serials, clients, surfaces)
    };

    match decision {
        RepeatDecision::Keep => {}
        RepeatDecision::Stop => cancel_key_repeat(state),
        RepeatDecision::Start(_) => {
            cancel_key_repeat(state);
            schedule_key_repeat(state);
        }
    }
}

fn cancel_key_repeat(state: &mut DesktopState) {
    if let Some(keyboard) = &mut state.input.seat.keyboard {
        if let Some(timer) = keyboard.repeat_timer.take() {
            state.spine.cancel_timer(timer);
        }
    }
}

fn schedule_key_repeat(state: &mut DesktopState) {
    let (delay, interval, generation) = match &state.input.seat.keyboard {
        Some(keyboard) => (
            keyboard.repeat_delay,
            keyboard.repeat_interval,
            keyboard.repeat_generation(),
        ),
        None => return,
    };
    let timer = state.spine.register_timer(delay, move |state: &mut DesktopState| {
        let time_ms = state.elapsed_ms();
        let DesktopState { input, serials, clients, surfaces, .. } = state;
        let keyboard = match &mut input.seat.keyboard {
            Some(keyboard) => keyboard,
            None => return TimerReschedule::Stop,
        };
        // A cancel happened after this timer was armed.
        if keyboard.repeat_generation() != generation {
            return TimerReschedule::Stop;
        }
        if keyboard.repeat_tick(time_ms, serials, clients, surfaces) {
            TimerReschedule::After(interval)
        } else {
            TimerReschedule::Stop
        }
    });
    match timer {
        Ok(handle) => {
            if let Some(keyboard) = &mut state.input.seat.keyboard {
                keyboard.repeat_timer = Some(handle);
            }
        }
        Err(err) => tracing::error!(%err, "failed to arm key-repeat timer"),
    }
}

fn handle_pointer_position(state: &mut DesktopState, time_ms: u32, position: Point<f64>) {
    let bounds = state.outputs.union_rect();
    let clamped = Point::new(
        position
            .x
            .clamp(bounds.loc.x as f64, (bounds.right().max(bounds.loc.x + 1) - 1) as f64),
        position
            .y
            .clamp(bounds.loc.y as f64, (bounds.bottom().max(bounds.loc.y + 1) - 1) as f64),
    );

    let grab = state.input.seat.pointer.as_ref().and_then(|p| p.grab);
    match grab {
        Some(PointerGrab::Interactive) => {
            if let Some(pointer) = &mut state.input.seat.pointer {
                pointer.position = clamped;
            }
            let DesktopState { mechanics, outputs, policy, config, .. } = state;
            mechanics.grab_motion(clamped, policy.as_ref(), &config.tiling, outputs);
        }
        Some(PointerGrab::Popup) => {
            // Exclusive capture: focus moves only between the grab chain's
            // popup surfaces; no hit-testing against the rest of the space.
            let chain_hit = popup_chain_hit(state, clamped);
            let serial = state.serials.next_serial();
            let DesktopState { input, clients, surfaces, .. } = state;
            if let Some(pointer) = &mut input.seat.pointer {
                pointer.position = clamped;
                pointer.set_focus(chain_hit, serial, clients, surfaces);
                pointer.motion(time_ms, clients, surfaces);
            }
        }
        None => {
            let hit = state
                .mechanics
                .surface_under(clamped, &state.shell, &state.surfaces);
            let serial = state.serials.next_serial();
            let DesktopState { input, clients, surfaces, .. } = state;
            if let Some(pointer) = &mut input.seat.pointer {
                pointer.position = clamped;
                let focus = hit.map(|(surface, origin)| PointerFocus { surface, origin });
                pointer.set_focus(focus, serial, clients, surfaces);
                pointer.motion(time_ms, clients, surfaces);
            }
        }
    }
}

/// Hit-test restricted to the popup grab chain's surfaces.
fn popup_chain_hit(state: &DesktopState, position: Point<f64>) -> Option<PointerFocus> {
    for popup_id in state.shell.grab_chain().iter().rev() {
        if let Some(popup) = state.shell.popup(*popup_id) {
            let origin = popup.rect.loc.to_f64();
            let local = Point::new(position.x - origin.x, position.y - origin.y);
            if let Some(surface) = state.surfaces.get(popup.surface) {
                if surface.current.accepts_input(local.to_i32_round()) {
                    return Some(PointerFocus {
                        surface: popup.surface,
                        origin,
                    });
                }
            }
        }
    }
    None
}

fn handle_pointer_button(
    state: &mut DesktopState,
    time_ms: u32,
    button: u32,
    button_state: ButtonState,
) {
    let button = if state.config.pointer.left_handed {
        match button {
            0x110 => 0x111, // BTN_LEFT -> BTN_RIGHT
            0x111 => 0x110, // BTN_RIGHT -> BTN_LEFT
            other => other,
        }
    } else {
        button
    };
    let grab = state.input.seat.pointer.as_ref().and_then(|p| p.grab);
    match grab {
        Some(PointerGrab::Interactive) => {
            // The grab consumes the event: buttons are tracked but not
            // delivered to any client.
            let serial = state.serials.next_serial();
            if let Some(pointer) = &mut state.input.seat.pointer {
                pointer.track_button(button, button_state, serial);
            }
            let none_held = state
                .input
                .seat
                .pointer
                .as_ref()
                .map(|pointer| pointer.pressed_buttons().is_empty())
                .unwrap_or(true);
            if button_state == ButtonState::Released && none_held {
                let DesktopState { mechanics, shell, outputs, serials, clients, .. } = state;
                mechanics.grab_release(shell, outputs, serials, clients);
                if let Some(pointer) = &mut state.input.seat.pointer {
                    pointer.grab = None;
                }
            }
        }
        Some(PointerGrab::Popup) => {
            if button_state == ButtonState::Pressed {
                let position = state
                    .input
                    .seat
                    .pointer
                    .as_ref()
                    .map(|p| p.position)
                    .unwrap_or_default();
                match chain_index_under(state, position) {
                    Some(index) => {
                        // Press inside a chain popup dismisses everything
                        // stacked above it, then delivers normally.
                        let chain = state.shell.grab_chain().to_vec();
                        if let Some(above) = chain.get(index + 1) {
                            let above = *above;
                            state.shell.dismiss_from(above, &mut state.clients);
                        }
                        deliver_button(state, time_ms, button, button_state);
                    }
                    None => {
                        // Press outside the chain dismisses it entirely and
                        // releases the grab.
                        if let Some(bottom) = state.shell.grab_chain().first().copied() {
                            state.shell.dismiss_from(bottom, &mut state.clients);
                        }
                        if let Some(pointer) = &mut state.input.seat.pointer {
                            pointer.grab = None;
                        }
                    }
                }
            } else {
                deliver_button(state, time_ms, button, button_state);
            }
        }
        None => {
            deliver_button(state, time_ms, button, button_state);
            if button_state == ButtonState::Pressed && state.policy.focus_on_click() {
                click_to_focus(state);
            }
        }
    }
}

fn deliver_button(state: &mut DesktopState, time_ms: u32, button: u32, button_state: ButtonState) {
    let serial = state.serials.next_serial();
    let DesktopState { input, clients, surfaces, .. } = state;
    if let Some(pointer) = &mut input.seat.pointer {
        pointer.button(button, button_state, time_ms, serial, clients, surfaces);
    }
}

fn chain_index_under(state: &DesktopState, position: Point<f64>) -> Option<usize> {
    for (index, popup_id) in state.shell.grab_chain().iter().enumerate().rev() {
        if let Some(popup) = state.shell.popup(*popup_id) {
            if popup.rect.contains_f64(position) {
                return Some(index);
            }
        }
    }
    None
}

/// Default click-to-focus: the window under the pointer takes keyboard
/// focus and is raised.
fn click_to_focus(state: &mut DesktopState) {
    let position = match &state.input.seat.pointer {
        Some(pointer) => pointer.position,
        None => return,
    };
    let hit = state
        .mechanics
        .surface_under(position, &state.shell, &state.surfaces);
    let surface = match hit {
        Some((surface, _)) => surface,
        None => return,
    };
    let window = state
        .mechanics
        .stacking()
        .iter()
        .rev()
        .copied()
        .find(|id| {
            state
                .mechanics
                .window(*id)
                .map(|w| w.surface == surface)
                .unwrap_or(false)
        });
    let window = match window {
        Some(window) => window,
        None => return,
    };
    if state.mechanics.focused == Some(window) {
        return;
    }
    let repeat_cancelled = {
        let DesktopState { mechanics, shell, input, surfaces, outputs, serials, clients, .. } = state;
        mechanics.enforce_focus_window(
            Some(window),
            shell,
            input.seat.keyboard.as_mut(),
            surfaces,
            outputs,
            serials,
            clients,
        )
    };
    if repeat_cancelled {
        cancel_key_repeat(state);
    }
}

/// Begin an interactive grab in response to a toplevel move/resize request.
/// The request serial must match a recent button press on this seat.
pub fn begin_toplevel_grab(
    state: &mut DesktopState,
    toplevel: crate::shell::ToplevelId,
    kind: GrabKind,
    request_serial: crate::protocol::Serial,
) -> bool {
    let (press_serial, position, held) = match &state.input.seat.pointer {
        Some(pointer) => (
            pointer.last_press_serial,
            pointer.position,
            !pointer.pressed_buttons().is_empty(),
        ),
        None => return false,
    };
    let valid = held && press_serial == Some(request_serial);
    if !valid {
        tracing::debug!(toplevel = toplevel.0, "ignoring grab request with stale serial");
        return false;
    }
    let started = {
        let DesktopState { mechanics, shell, outputs, serials, clients, .. } = state;
        mechanics.begin_interactive(toplevel, kind, position, shell, outputs, serials, clients)
    };
    if started {
        if let Some(pointer) = &mut state.input.seat.pointer {
            pointer.grab = Some(PointerGrab::Interactive);
        }
    }
    started
}

/// Take a popup grab in response to an xdg_popup.grab request.
pub fn begin_popup_grab(
    state: &mut DesktopState,
    popup: crate::shell::PopupId,
    request_serial: crate::protocol::Serial,
) -> Result<(), crate::protocol::ProtocolError> {
    let press_serial = state
        .input
        .seat
        .pointer
        .as_ref()
        .and_then(|p| p.last_press_serial);
    // Keyboard-driven popups exist; require a matching press only when one
    // was seen at all.
    if let Some(press) = press_serial {
        if !request_serial.is_no_older_than(press) {
            // Stale grab: dismiss the popup rather than error.
            state.shell.dismiss_from(popup, &mut state.clients);
            return Ok(());
        }
    }
    state.shell.grab_popup(popup)?;
    if let Some(pointer) = &mut state.input.seat.pointer {
        pointer.grab = Some(PointerGrab::Popup);
    }
    Ok(())
}
