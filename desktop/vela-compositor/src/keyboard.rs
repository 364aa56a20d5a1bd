//! Per-seat keyboard state: the compiled XKB keymap, modifier tracking,
//! key repeat and keyboard focus.
//!
//! Keycodes arrive in evdev space and are shifted by 8 into XKB space. The
//! keymap is served to clients as a sealed memfd; recompilation (layout
//! setting changed) produces a fresh fd which is re-broadcast.

use crate::buffer::create_sealed_memfd;
use crate::config::KeyboardConfig;
use crate::input::KeyState;
use crate::protocol::{ClientEvent, Clients, Serial, SerialCounter};
use crate::spine::TimerHandle;
use crate::surface::{SurfaceEngine, SurfaceId};
use anyhow::Context as _;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;
use xkbcommon::xkb;

/// Offset between evdev keycodes and XKB keycodes.
const EVDEV_OFFSET: u32 = 8;

/// The compiled keymap, as the file clients mmap.
#[derive(Debug)]
pub struct KeymapFile {
    pub fd: OwnedFd,
    /// Size including the trailing NUL.
    pub size: u32,
}

impl KeymapFile {
    fn new(keymap_string: &str) -> anyhow::Result<Self> {
        let mut bytes = keymap_string.as_bytes().to_vec();
        bytes.push(0);
        let fd = create_sealed_memfd("vela-keymap", &bytes)
            .context("failed to create keymap memfd")?;
        Ok(Self {
            fd,
            size: bytes.len() as u32,
        })
    }
}

/// Serialized modifier and layout masks, as sent on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModifiersState {
    pub depressed: u32,
    pub latched: u32,
    pub locked: u32,
    pub layout: u32,
}

/// Events delivered on a wl_keyboard.
#[derive(Debug, Clone)]
pub enum KeyboardEvent {
    Keymap { file: Arc<KeymapFile> },
    RepeatInfo { rate: i32, delay_ms: i32 },
    Enter {
        serial: Serial,
        surface: SurfaceId,
        /// Evdev keycodes currently held.
        keys: Vec<u32>,
        modifiers: ModifiersState,
    },
    Leave { serial: Serial, surface: SurfaceId },
    Key {
        serial: Serial,
        time_ms: u32,
        key: u32,
        state: KeyState,
    },
    Modifiers {
        serial: Serial,
        modifiers: ModifiersState,
    },
}

/// What the caller must do about the repeat timer after a key event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatDecision {
    /// Leave any running repeat alone.
    Keep,
    /// (Re)start repeat for this key after the delay.
    Start(u32),
    /// Cancel the running repeat.
    Stop,
}

pub struct KeyboardState {
    context: xkb::Context,
    keymap: xkb::Keymap,
    state: xkb::State,
    keymap_file: Arc<KeymapFile>,
    pub focus: Option<SurfaceId>,
    /// Held keys, evdev codes, press order.
    pressed: Vec<u32>,
    /// Held keys whose press event was never delivered (no focus at press
    /// time). Only these are replayed into an enter event; keys already
    /// delivered to a previous focus are not re-announced.
    undelivered: Vec<u32>,
    modifiers: ModifiersState,
    pub repeat_delay: Duration,
    pub repeat_interval: Duration,
    pub repeat_rate: i32,
    /// The key currently driving the repeat timer.
    pub repeating_key: Option<u32>,
    /// Registration of the live repeat timer, owned here so focus changes
    /// can cancel it.
    pub repeat_timer: Option<TimerHandle>,
    /// Bumped on every cancel so a stale timer callback can recognise
    /// itself.
    repeat_generation: u64,
}

impl KeyboardState {
    pub fn new(config: &KeyboardConfig) -> anyhow::Result<Self> {
        let context = xkb::Context::new(xkb::CONTEXT_NO_FLAGS);
        let keymap = Self::compile(&context, config)?;
        let state = xkb::State::new(&keymap);
        let keymap_file = Arc::new(KeymapFile::new(&keymap.get_as_string(xkb::KEYMAP_FORMAT_TEXT_V1))?);
        let rate = config.repeat_rate.max(1) as i32;
        Ok(Self {
            context,
            keymap,
            state,
            keymap_file,
            focus: None,
            pressed: Vec::new(),
            undelivered: Vec::new(),
            modifiers: ModifiersState::default(),
            repeat_delay: Duration::from_millis(config.repeat_delay as u64),
            repeat_interval: Duration::from_millis((1000 / rate as u64).max(1)),
            repeat_rate: rate,
            repeating_key: None,
            repeat_timer: None,
            repeat_generation: 0,
        })
    }

    fn compile(context: &xkb::Context, config: &KeyboardConfig) -> anyhow::Result<xkb::Keymap> {
        let options = if config.options.is_empty() {
            None
        } else {
            Some(config.options.clone())
        };
        xkb::Keymap::new_from_names(
            context,
            &config.rules,
            &config.model,
            &config.layout,
            &config.variant,
            options,
            xkb::KEYMAP_COMPILE_NO_FLAGS,
        )
        .with_context(|| {
            format!(
                "failed to compile keymap {}/{}/{}",
                config.rules, config.model, config.layout
            )
        })
    }

    /// Recompile after a setting change. Modifier state restarts from
    /// scratch; the fresh fd must be re-broadcast by the caller.
    pub fn rebuild(&mut self, config: &KeyboardConfig) -> anyhow::Result<Arc<KeymapFile>> {
        let keymap = Self::compile(&self.context, config)?;
        let state = xkb::State::new(&keymap);
        let file = Arc::new(KeymapFile::new(&keymap.get_as_string(xkb::KEYMAP_FORMAT_TEXT_V1))?);
        self.keymap = keymap;
        self.state = state;
        self.keymap_file = file.clone();
        let rate = config.repeat_rate.max(1) as i32;
        self.repeat_delay = Duration::from_millis(config.repeat_delay as u64);
        self.repeat_interval = Duration::from_millis((1000 / rate as u64).max(1));
        self.repeat_rate = rate;
        tracing::info!(layout = %config.layout, "keymap recompiled");
        Ok(file)
    }

    pub fn keymap_file(&self) -> Arc<KeymapFile> {
        self.keymap_file.clone()
    }

    pub fn modifiers(&self) -> ModifiersState {
        self.modifiers
    }

    pub fn pressed_keys(&self) -> &[u32] {
        &self.pressed
    }

    pub fn repeat_generation(&self) -> u64 {
        self.repeat_generation
    }

    fn send_to_focus(&self, clients: &mut Clients, surfaces: &SurfaceEngine, event: KeyboardEvent) {
        if let Some(focus) = self.focus {
            if let Some(surface) = surfaces.get(focus) {
                clients.send(
                    surface.client,
                    ClientEvent::Seat(crate::input::SeatEvent::Keyboard(event)),
                );
            }
        }
    }

    /// Process a key event: update XKB state, broadcast modifier changes,
    /// deliver the key, and decide what happens to the repeat timer.
    pub fn handle_key(
        &mut self,
        key: u32,
        key_state: KeyState,
        time_ms: u32,
        serials: &mut SerialCounter,
        clients: &mut Clients,
        surfaces: &SurfaceEngine,
    ) -> RepeatDecision {
        let direction = match key_state {
            KeyState::Pressed => xkb::KeyDirection::Down,
            KeyState::Released => xkb::KeyDirection::Up,
        };
        match key_state {
            KeyState::Pressed => {
                if !self.pressed.contains(&key) {
                    self.pressed.push(key);
                }
                if self.focus.is_none() && !self.undelivered.contains(&key) {
                    self.undelivered.push(key);
                }
            }
            KeyState::Released => {
                self.pressed.retain(|k| *k != key);
                self.undelivered.retain(|k| *k != key);
            }
        }
        self.state
            .update_key(xkb::Keycode::from(key + EVDEV_OFFSET), direction);

        let serial = serials.next_serial();
        if self.refresh_modifiers() {
            let modifiers = self.modifiers;
            self.send_to_focus(clients, surfaces, KeyboardEvent::Modifiers { serial, modifiers });
        }
        self.send_to_focus(
            clients,
            surfaces,
            KeyboardEvent::Key {
                serial,
                time_ms,
                key,
                state: key_state,
            },
        );

        match key_state {
            KeyState::Pressed if self.key_repeats(key) => {
                // A new repeatable press supersedes any running repeat.
                self.repeating_key = Some(key);
                self.repeat_generation += 1;
                RepeatDecision::Start(key)
            }
            KeyState::Pressed => RepeatDecision::Keep,
            KeyState::Released if self.repeating_key == Some(key) => {
                self.repeating_key = None;
                self.repeat_generation += 1;
                RepeatDecision::Stop
            }
            KeyState::Released => RepeatDecision::Keep,
        }
    }

    fn refresh_modifiers(&mut self) -> bool {
        let next = ModifiersState {
            depressed: self.state.serialize_mods(xkb::STATE_MODS_DEPRESSED),
            latched: self.state.serialize_mods(xkb::STATE_MODS_LATCHED),
            locked: self.state.serialize_mods(xkb::STATE_MODS_LOCKED),
            layout: self.state.serialize_layout(xkb::STATE_LAYOUT_EFFECTIVE),
        };
        let changed = next != self.modifiers;
        self.modifiers = next;
        changed
    }

    pub fn key_repeats(&self, key: u32) -> bool {
        self.keymap
            .key_repeats(xkb::Keycode::from(key + EVDEV_OFFSET))
    }

    /// One repeat firing: a synthetic press with a fresh serial. Returns
    /// false when repeat should stop (no key, no focus).
    pub fn repeat_tick(
        &mut self,
        time_ms: u32,
        serials: &mut SerialCounter,
        clients: &mut Clients,
        surfaces: &SurfaceEngine,
    ) -> bool {
        let key = match self.repeating_key {
            Some(key) => key,
            None => return false,
        };
        if self.focus.is_none() {
            return false;
        }
        let serial = serials.next_serial();
        self.send_to_focus(
            clients,
            surfaces,
            KeyboardEvent::Key {
                serial,
                time_ms,
                key,
                state: KeyState::Pressed,
            },
        );
        true
    }

    /// Move keyboard focus. Leave precedes enter and both carry the same
    /// serial; the enter carries the held keys and current modifiers.
    /// Repeat never survives a focus change: the returned flag tells the
    /// caller to cancel the timer.
    pub fn set_focus(
        &mut self,
        new_focus: Option<SurfaceId>,
        serial: Serial,
        clients: &mut Clients,
        surfaces: &SurfaceEngine,
    ) -> bool {
        if self.focus == new_focus {
            return false;
        }
        if let Some(old) = self.focus {
            if let Some(surface) = surfaces.get(old) {
                clients.send(
                    surface.client,
                    ClientEvent::Seat(crate::input::SeatEvent::Keyboard(KeyboardEvent::Leave {
                        serial,
                        surface: old,
                    })),
                );
            }
        }
        self.focus = new_focus;
        if let Some(new) = new_focus {
            if let Some(surface) = surfaces.get(new) {
                let modifiers = self.modifiers;
                let keys = std::mem::take(&mut self.undelivered);
                clients.send(
                    surface.client,
                    ClientEvent::Seat(crate::input::SeatEvent::Keyboard(KeyboardEvent::Enter {
                        serial,
                        surface: new,
                        keys,
                        modifiers,
                    })),
                );
            }
        }
        let had_repeat = self.repeating_key.take().is_some();
        if had_repeat {
            self.repeat_generation += 1;
        }
        had_repeat
    }
}
