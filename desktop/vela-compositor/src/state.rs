//! The authoritative compositor aggregate and the cross-engine
//! orchestration that ties the engines together.
//!
//! `DesktopState` is the single mutable aggregate passed into every spine
//! callback. It is partitioned into engine sub-aggregates so orchestration
//! functions can borrow them independently; auxiliary threads never touch
//! it and communicate through spine posts instead.

use crate::buffer::{BufferId, Buffers};
use crate::config::CompositorConfig;
use crate::geometry::{Point, Rectangle, Region, Size};
use crate::input::InputEngine;
use crate::mechanics::{EdgeSnapPolicy, LayoutPolicy, PendingGeometry, WindowMechanics, WindowShell};
use crate::output::{Mode, NullOutputBackend, OutputBackend, OutputEngine, OutputId, PowerState};
use crate::output_config::ConfigurationId;
use crate::pointer::PointerGrab;
use crate::positioner::Positioner;
use crate::protocol::{ClientEvent, ClientId, Clients, ProtocolError, Serial, SerialCounter};
use crate::renderer::{NullRenderer, RenderElement, Renderer, ShmTextureSource};
use crate::services::ServiceEvent;
use crate::shell::ShellEngine;
use crate::shell::{PopupId, PopupParent, ToplevelId, ToplevelStateSet, XdgRole};
use crate::spine::SpineHandle;
use crate::surface::{CommitOutcome, SurfaceEngine, SurfaceId, SurfaceRole};
use std::time::Instant;

/// The core compositor state. Only the spine's loop thread ever holds it.
pub struct DesktopState {
    pub config: CompositorConfig,
    pub serials: SerialCounter,
    pub clients: Clients,
    pub buffers: Buffers,
    pub surfaces: SurfaceEngine,
    pub shell: ShellEngine,
    pub input: InputEngine,
    pub outputs: OutputEngine,
    pub mechanics: WindowMechanics,
    pub renderer: Box<dyn Renderer>,
    pub output_backend: Box<dyn OutputBackend>,
    pub policy: Box<dyn LayoutPolicy>,
    pub spine: SpineHandle<DesktopState>,
    /// Frame callbacks accumulated by commits, fired at the next present.
    frame_callbacks: Vec<(SurfaceId, u32)>,
    /// Consecutive failed render passes; resets on success, escalates to
    /// shutdown when the renderer is clearly gone.
    render_failures: u32,
    pub start_time: Instant,
}

impl DesktopState {
    pub fn new(config: CompositorConfig, spine: SpineHandle<DesktopState>) -> Self {
        Self {
            config,
            serials: SerialCounter::new(),
            clients: Clients::new(),
            buffers: Buffers::new(),
            surfaces: SurfaceEngine::new(),
            shell: ShellEngine::new(),
            input: InputEngine::new("seat0"),
            outputs: OutputEngine::new(),
            mechanics: WindowMechanics::new(),
            renderer: Box::new(NullRenderer::new(Size::new(1920, 1080))),
            output_backend: Box::new(NullOutputBackend { atomic: true, ..Default::default() }),
            policy: Box::new(EdgeSnapPolicy),
            spine,
            frame_callbacks: Vec::new(),
            render_failures: 0,
            start_time: Instant::now(),
        }
    }

    /// Milliseconds since compositor start, the timestamp base for
    /// synthetic events.
    pub fn elapsed_ms(&self) -> u32 {
        self.start_time.elapsed().as_millis() as u32
    }

    // ---- client and global binding --------------------------------------

    pub fn connect_client(&mut self) -> ClientId {
        self.clients.connect()
    }

    /// Client bound the compositor global: its surface slot exists from
    /// here on.
    pub fn bind_compositor(&mut self, client: ClientId) {
        self.surfaces.bind_client(client);
    }

    /// Client bound the xdg_wm_base global.
    pub fn bind_shell(&mut self, client: ClientId) {
        self.shell.bind_client(client);
    }

    pub fn bind_seat(&mut self, client: ClientId) {
        self.input.bind_seat_client(client, &mut self.clients);
    }

    pub fn bind_output_manager(&mut self, client: ClientId) {
        self.outputs.bind_manager(client, &mut self.clients);
    }

    /// Add an output from the display backend, applying any configured
    /// per-output overrides.
    pub fn add_output(
        &mut self,
        name: &str,
        description: &str,
        physical_size_mm: Size<i32>,
        modes: Vec<Mode>,
    ) -> OutputId {
        let entry = self.config.output_entry(name).cloned();
        let position = entry
            .as_ref()
            .and_then(|e| e.position)
            .map(|(x, y)| Point::new(x, y))
            .unwrap_or_else(|| Point::new(self.outputs.union_rect().right().max(0), 0));
        let scale = entry
            .as_ref()
            .and_then(|e| e.scale)
            .unwrap_or(if self.config.outputs.default_scale > 0.0 {
                self.config.outputs.default_scale
            } else {
                1.0
            });
        self.outputs.add_output(
            name.to_string(),
            description.to_string(),
            physical_size_mm,
            modes,
            position,
            scale,
            &mut self.clients,
        )
    }
}

// ---- commit pipeline orchestration --------------------------------------

/// Commit a surface: the full seven-step pipeline of the surface engine
/// plus role dispatch, texture update and synchronized-child cascade.
pub fn commit_surface(state: &mut DesktopState, surface: SurfaceId) -> Result<(), ProtocolError> {
    state.surfaces.begin_commit(surface)?;
    let outcome = state.surfaces.apply_commit(surface, &state.buffers);
    if outcome.stashed {
        return Ok(());
    }
    apply_commit_effects(state, surface, outcome);

    // A parent commit applies the state its synchronized children cached.
    let children = state
        .surfaces
        .get(surface)
        .map(|s| s.children.clone())
        .unwrap_or_default();
    for child in children {
        apply_cached_recursive(state, child);
    }
    Ok(())
}

fn apply_cached_recursive(state: &mut DesktopState, surface: SurfaceId) {
    if let Some(outcome) = state.surfaces.apply_cached(surface, &state.buffers) {
        apply_commit_effects(state, surface, outcome);
    }
    let children = state
        .surfaces
        .get(surface)
        .map(|s| s.children.clone())
        .unwrap_or_default();
    for child in children {
        apply_cached_recursive(state, child);
    }
}

fn apply_commit_effects(state: &mut DesktopState, surface: SurfaceId, outcome: CommitOutcome) {
    if let Some(replaced) = outcome.replaced_buffer {
        state.buffers.release(replaced, &mut state.clients);
    }

    // Role-specific commit logic, dispatched on the role tag.
    let role = match state.surfaces.role(surface) {
        Some(SurfaceRole::Toplevel(id)) => Some(XdgRole::Toplevel(*id)),
        Some(SurfaceRole::Popup(id)) => Some(XdgRole::Popup(*id)),
        _ => None,
    };
    match role {
        Some(XdgRole::Toplevel(toplevel)) => toplevel_commit(state, surface, toplevel),
        Some(XdgRole::Popup(popup)) => popup_commit(state, surface, popup),
        None => {}
    }

    state.surfaces.finish_commit(surface);
    update_texture(state, surface, &outcome);

    for callback in &outcome.frame_callbacks {
        state.frame_callbacks.push((surface, *callback));
    }
    if !outcome.damage_empty {
        state.outputs.damage_all();
    }
}

fn toplevel_commit(state: &mut DesktopState, surface: SurfaceId, toplevel: ToplevelId) {
    let has_buffer = state
        .surfaces
        .get(surface)
        .map(|s| s.current.buffer.is_some())
        .unwrap_or(false);
    let window = state.mechanics.by_toplevel(toplevel);

    match (window, has_buffer) {
        (None, false) => {
            // Initial commit without a buffer: propose a state and let the
            // client pick its own size.
            let already_configured = state
                .shell
                .xdg_surface(surface)
                .map(|x| x.last_sent.is_some())
                .unwrap_or(false);
            if !already_configured {
                let bounds = state.outputs.union_rect().size;
                let DesktopState { shell, serials, clients, .. } = state;
                shell.send_configure(
                    toplevel,
                    Size::default(),
                    ToplevelStateSet::empty(),
                    bounds,
                    serials,
                    clients,
                );
            }
        }
        (None, true) => map_new_toplevel(state, surface, toplevel),
        (Some(id), true) => {
            if let Some(window) = state.mechanics.window_mut(id) {
                window.mapped = true;
            }
        }
        (Some(id), false) => {
            // Null attach on a mapped toplevel unmaps it.
            if let Some(window) = state.mechanics.window_mut(id) {
                if window.mapped {
                    window.mapped = false;
                    state.outputs.damage_all();
                }
            }
        }
    }
}

/// First commit with content: the window enters the space, the policy
/// collaborator picks a rectangle, and the target geometry goes out as a
/// configure that also activates the window.
fn map_new_toplevel(state: &mut DesktopState, surface: SurfaceId, toplevel: ToplevelId) {
    let area = state.outputs.union_rect();
    let others = state.mechanics.mapped_rects(0, None);
    let app_id = state.shell.toplevel(toplevel).and_then(|t| t.app_id.clone());
    let target = state
        .policy
        .initial_rect(app_id.as_deref(), area, &others, &state.config.tiling);

    let committed_size = state
        .shell
        .effective_window_geometry(surface, &state.surfaces)
        .size;
    let window = state
        .mechanics
        .add_window(WindowShell::Toplevel(toplevel), surface, 0);
    if let Some(record) = state.mechanics.window_mut(window) {
        record.geometry = Rectangle::new(target.loc, committed_size);
        record.mapped = true;
    }
    tracing::info!(
        toplevel = toplevel.0,
        app_id = app_id.as_deref().unwrap_or("-"),
        "toplevel mapped"
    );

    // Deactivate the previously focused toplevel.
    let previous = state.mechanics.focused;
    if let Some(previous) = previous {
        if let Some(record) = state.mechanics.window(previous) {
            if let WindowShell::Toplevel(prev_toplevel) = record.shell {
                let size = record.geometry.size;
                let bounds = area.size;
                let DesktopState { shell, serials, clients, .. } = state;
                if let Some(t) = shell.toplevel(prev_toplevel) {
                    let states = t.states - ToplevelStateSet::ACTIVATED;
                    shell.send_configure(prev_toplevel, size, states, bounds, serials, clients);
                }
            }
        }
    }

    let serial = {
        let DesktopState { shell, serials, clients, .. } = state;
        shell.send_configure(
            toplevel,
            target.size,
            ToplevelStateSet::ACTIVATED,
            area.size,
            serials,
            clients,
        )
    };
    if let Some(serial) = serial {
        if let Some(record) = state.mechanics.window_mut(window) {
            record.pending = Some(PendingGeometry { serial, rect: target });
        }
    }
    state.mechanics.focused = Some(window);
    state.mechanics.raise(window);
    set_keyboard_focus(state, Some(surface));
    state.outputs.damage_all();
}

fn popup_commit(state: &mut DesktopState, surface: SurfaceId, popup: PopupId) {
    let already_configured = state
        .shell
        .xdg_surface(surface)
        .map(|x| x.last_sent.is_some())
        .unwrap_or(false);
    if !already_configured {
        if let Some(rect) = resolve_popup_geometry(state, popup) {
            let DesktopState { shell, serials, clients, .. } = state;
            shell.send_popup_configure(popup, rect, serials, clients);
        }
    }
}

/// Popup placement: a pure function of positioner, parent geometry and
/// output geometry.
pub fn resolve_popup_geometry(state: &DesktopState, popup: PopupId) -> Option<Rectangle<i32>> {
    let record = state.shell.popup(popup)?;
    let parent_rect = match record.parent {
        PopupParent::Toplevel(toplevel) => state
            .mechanics
            .by_toplevel(toplevel)
            .and_then(|w| state.mechanics.window(w))
            .map(|w| w.geometry)
            .unwrap_or_default(),
        PopupParent::Popup(parent) => state
            .shell
            .popup(parent)
            .map(|p| p.rect)
            .unwrap_or_default(),
    };
    Some(record.positioner.resolve(parent_rect, state.outputs.union_rect()))
}

/// Reposition request: fresh positioner, token confirmation, new configure.
pub fn reposition_popup(
    state: &mut DesktopState,
    popup: PopupId,
    positioner: Positioner,
    token: u32,
) -> Result<(), ProtocolError> {
    state
        .shell
        .reposition_popup(popup, positioner, token, &mut state.clients)?;
    if let Some(rect) = resolve_popup_geometry(state, popup) {
        let DesktopState { shell, serials, clients, .. } = state;
        shell.send_popup_configure(popup, rect, serials, clients);
    }
    Ok(())
}

fn update_texture(state: &mut DesktopState, surface: SurfaceId, outcome: &CommitOutcome) {
    match outcome.new_buffer {
        Some(Some(buffer)) => {
            let DesktopState { surfaces, buffers, renderer, .. } = state;
            if let Some(old) = surfaces.get_mut(surface).and_then(|s| s.texture.take()) {
                renderer.destroy_texture(old);
            }
            let record = match buffers.get(buffer) {
                Some(record) => record,
                None => return,
            };
            let data = match buffers.data(buffer) {
                Some(data) => data,
                None => {
                    tracing::warn!(surface = surface.0, "buffer pixels unavailable; surface unrenderable");
                    return;
                }
            };
            let source = ShmTextureSource {
                size: record.size(),
                stride: record.desc.stride,
                format: record.desc.format,
                data,
            };
            match renderer.create_texture_from_shm(source) {
                Ok(texture) => {
                    if let Some(s) = surfaces.get_mut(surface) {
                        s.texture = Some(texture);
                    }
                }
                Err(err) => {
                    // Resource shortage: skip this surface for the frame,
                    // keep the client alive.
                    tracing::warn!(%err, surface = surface.0, "texture upload failed");
                }
            }
        }
        Some(None) => {
            let DesktopState { surfaces, renderer, .. } = state;
            if let Some(old) = surfaces.get_mut(surface).and_then(|s| s.texture.take()) {
                renderer.destroy_texture(old);
            }
        }
        None => {}
    }
}

// ---- configure / focus / destruction ------------------------------------

/// Route an ack_configure from the wire: shell validates the serial, then
/// window mechanics promotes any pending geometry.
pub fn handle_ack_configure(
    state: &mut DesktopState,
    surface: SurfaceId,
    serial: Serial,
) -> Result<(), ProtocolError> {
    let acked = state.shell.ack_configure(surface, serial)?;
    if let Some(XdgRole::Toplevel(toplevel)) = acked.role {
        state.mechanics.on_ack_configure(toplevel, &acked);
    }
    Ok(())
}

/// Move keyboard focus (mechanics-driven or internal), cancelling any
/// running key repeat.
pub fn set_keyboard_focus(state: &mut DesktopState, surface: Option<SurfaceId>) {
    let serial = state.serials.next_serial();
    let cancelled = {
        let DesktopState { input, clients, surfaces, .. } = state;
        match &mut input.seat.keyboard {
            Some(keyboard) => keyboard.set_focus(surface, serial, clients, surfaces),
            None => false,
        }
    };
    if cancelled {
        if let Some(keyboard) = &mut state.input.seat.keyboard {
            if let Some(timer) = keyboard.repeat_timer.take() {
                state.spine.cancel_timer(timer);
            }
        }
    }
}

/// Externally decided focus change, by policy-domain identifier.
pub fn enforce_focus(state: &mut DesktopState, target: Option<&str>) {
    let cancelled = {
        let DesktopState {
            mechanics,
            shell,
            input,
            surfaces,
            outputs,
            serials,
            clients,
            ..
        } = state;
        mechanics.enforce_focus(
            target,
            shell,
            input.seat.keyboard.as_mut(),
            surfaces,
            outputs,
            serials,
            clients,
        )
    };
    if cancelled {
        if let Some(keyboard) = &mut state.input.seat.keyboard {
            if let Some(timer) = keyboard.repeat_timer.take() {
                state.spine.cancel_timer(timer);
            }
        }
    }
}

/// Destroy a wl_surface: shell role teardown, window removal, input focus
/// cleanup and resource release, in that order. Active grabs targeting the
/// surface are cancelled.
pub fn destroy_surface(state: &mut DesktopState, surface: SurfaceId) {
    // Input references go first, while the record still exists.
    let serial = state.serials.next_serial();
    {
        let DesktopState { input, clients, surfaces, .. } = state;
        if let Some(pointer) = &mut input.seat.pointer {
            if pointer.focus.map(|f| f.surface) == Some(surface) {
                pointer.set_focus(None, serial, clients, surfaces);
            }
        }
        if let Some(keyboard) = &mut input.seat.keyboard {
            if keyboard.focus == Some(surface) {
                keyboard.set_focus(None, serial, clients, surfaces);
            }
        }
        if let Some(touch) = &mut input.seat.touch {
            touch.surface_destroyed(surface);
        }
    }

    let role = state.shell.surface_destroyed(surface, &mut state.clients);
    if let Some(role) = role {
        let (_, grab_cancelled) = state.mechanics.role_destroyed(role);
        if grab_cancelled {
            if let Some(pointer) = &mut state.input.seat.pointer {
                pointer.grab = None;
            }
        }
    }
    // An emptied popup grab chain releases the pointer grab.
    if state.shell.grab_chain().is_empty() {
        if let Some(pointer) = &mut state.input.seat.pointer {
            if pointer.grab == Some(PointerGrab::Popup) {
                pointer.grab = None;
            }
        }
    }

    if let Some(destroyed) = state.surfaces.destroy_surface(surface) {
        if let Some(texture) = destroyed.texture {
            state.renderer.destroy_texture(texture);
        }
        if let Some(buffer) = destroyed.buffer {
            state.buffers.release(buffer, &mut state.clients);
        }
    }
    state.frame_callbacks.retain(|(s, _)| *s != surface);
    state.outputs.damage_all();
}

/// A client destroyed a buffer: every surface referencing it drops its
/// texture before the next frame.
pub fn handle_buffer_destroyed(state: &mut DesktopState, buffer: BufferId) {
    if !state.buffers.destroy_buffer(buffer) {
        return;
    }
    for (surface, texture) in state.surfaces.buffer_destroyed(buffer) {
        if let Some(texture) = texture {
            state.renderer.destroy_texture(texture);
        }
        tracing::trace!(surface = surface.0, "buffer destroyed under surface");
    }
}

/// Peer disconnect: cascade destruction of everything the client owned.
pub fn disconnect_client(state: &mut DesktopState, client: ClientId) {
    state.clients.disconnect(client);

    let roles = state.shell.remove_client(client, &mut state.clients);
    for role in roles {
        let (_, grab_cancelled) = state.mechanics.role_destroyed(role);
        if grab_cancelled {
            if let Some(pointer) = &mut state.input.seat.pointer {
                pointer.grab = None;
            }
        }
    }

    let owned = if state.surfaces.has_client(client) {
        state.surfaces.surfaces_of_client(client)
    } else {
        Vec::new()
    };
    for surface in owned {
        let DesktopState { input, clients, surfaces, serials, .. } = state;
        let serial = serials.next_serial();
        if let Some(pointer) = &mut input.seat.pointer {
            if pointer.focus.map(|f| f.surface) == Some(surface) {
                pointer.set_focus(None, serial, clients, surfaces);
            }
        }
        if let Some(keyboard) = &mut input.seat.keyboard {
            if keyboard.focus == Some(surface) {
                keyboard.set_focus(None, serial, clients, surfaces);
            }
        }
        if let Some(touch) = &mut input.seat.touch {
            touch.surface_destroyed(surface);
        }
        state.frame_callbacks.retain(|(s, _)| *s != surface);
    }
    for (_, destroyed) in state.surfaces.remove_client(client) {
        if let Some(texture) = destroyed.texture {
            state.renderer.destroy_texture(texture);
        }
    }
    for buffer in state.buffers.remove_client(client) {
        for (_, texture) in state.surfaces.buffer_destroyed(buffer) {
            if let Some(texture) = texture {
                state.renderer.destroy_texture(texture);
            }
        }
    }
    state.outputs.remove_client(client);
    state.outputs.damage_all();
}

/// Send a protocol error and run the disconnect cascade. The outbox record
/// survives so the transport can still flush the error event.
pub fn post_client_error(state: &mut DesktopState, client: ClientId, error: &ProtocolError) {
    state.clients.post_error(client, error);
    disconnect_client(state, client);
}

// ---- toplevel state requests ---------------------------------------------

fn send_state_configure(
    state: &mut DesktopState,
    toplevel: ToplevelId,
    rect: Rectangle<i32>,
    states: ToplevelStateSet,
) {
    let bounds = state.outputs.union_rect().size;
    let serial = {
        let DesktopState { shell, serials, clients, .. } = state;
        shell.send_configure(toplevel, rect.size, states, bounds, serials, clients)
    };
    if let (Some(serial), Some(window)) = (serial, state.mechanics.by_toplevel(toplevel)) {
        if let Some(record) = state.mechanics.window_mut(window) {
            record.pending = Some(PendingGeometry { serial, rect });
        }
    }
}

/// Maximize: the window fills the usable area; the previous geometry is
/// remembered for the way back.
pub fn request_maximize(state: &mut DesktopState, toplevel: ToplevelId) {
    let window = match state.mechanics.by_toplevel(toplevel) {
        Some(window) => window,
        None => return,
    };
    let gap = state.config.tiling.gap;
    let area = state.outputs.union_rect();
    let target = Rectangle::from_coords(
        area.loc.x + gap,
        area.loc.y + gap,
        (area.size.w - 2 * gap).max(1),
        (area.size.h - 2 * gap).max(1),
    );
    if let Some(record) = state.mechanics.window_mut(window) {
        if record.saved_geometry.is_none() {
            record.saved_geometry = Some(record.geometry);
        }
    }
    let states = state
        .shell
        .toplevel(toplevel)
        .map(|t| t.states | ToplevelStateSet::MAXIMIZED)
        .unwrap_or(ToplevelStateSet::MAXIMIZED);
    send_state_configure(state, toplevel, target, states);
}

pub fn request_unmaximize(state: &mut DesktopState, toplevel: ToplevelId) {
    let window = match state.mechanics.by_toplevel(toplevel) {
        Some(window) => window,
        None => return,
    };
    let saved = state
        .mechanics
        .window_mut(window)
        .and_then(|record| record.saved_geometry.take());
    let target = match saved {
        Some(rect) => rect,
        None => state
            .mechanics
            .window(window)
            .map(|record| record.geometry)
            .unwrap_or_default(),
    };
    let states = state
        .shell
        .toplevel(toplevel)
        .map(|t| t.states - ToplevelStateSet::MAXIMIZED)
        .unwrap_or_default();
    send_state_configure(state, toplevel, target, states);
}

/// Fullscreen onto a specific output, or whichever one holds the window.
pub fn request_fullscreen(state: &mut DesktopState, toplevel: ToplevelId, output: Option<OutputId>) {
    let window = match state.mechanics.by_toplevel(toplevel) {
        Some(window) => window,
        None => return,
    };
    let target = output
        .and_then(|id| state.outputs.get(id))
        .and_then(|o| o.logical_geometry())
        .unwrap_or_else(|| state.outputs.union_rect());
    if let Some(record) = state.mechanics.window_mut(window) {
        if record.saved_geometry.is_none() {
            record.saved_geometry = Some(record.geometry);
        }
    }
    let states = state
        .shell
        .toplevel(toplevel)
        .map(|t| t.states | ToplevelStateSet::FULLSCREEN)
        .unwrap_or(ToplevelStateSet::FULLSCREEN);
    send_state_configure(state, toplevel, target, states);
}

pub fn request_unfullscreen(state: &mut DesktopState, toplevel: ToplevelId) {
    let window = match state.mechanics.by_toplevel(toplevel) {
        Some(window) => window,
        None => return,
    };
    let saved = state
        .mechanics
        .window_mut(window)
        .and_then(|record| record.saved_geometry.take());
    let target = match saved {
        Some(rect) => rect,
        None => state
            .mechanics
            .window(window)
            .map(|record| record.geometry)
            .unwrap_or_default(),
    };
    let states = state
        .shell
        .toplevel(toplevel)
        .map(|t| t.states - ToplevelStateSet::FULLSCREEN)
        .unwrap_or_default();
    send_state_configure(state, toplevel, target, states);
}

/// Minimize: unmapped from the space and told it is suspended. Focus moves
/// away; un-minimizing is the policy collaborator's call.
pub fn request_minimize(state: &mut DesktopState, toplevel: ToplevelId) {
    let window = match state.mechanics.by_toplevel(toplevel) {
        Some(window) => window,
        None => return,
    };
    let was_focused = state.mechanics.focused == Some(window);
    let rect = match state.mechanics.window_mut(window) {
        Some(record) => {
            record.mapped = false;
            record.geometry
        }
        None => return,
    };
    if was_focused {
        state.mechanics.focused = None;
        set_keyboard_focus(state, None);
    }
    let states = state
        .shell
        .toplevel(toplevel)
        .map(|t| t.states | ToplevelStateSet::SUSPENDED)
        .unwrap_or(ToplevelStateSet::SUSPENDED);
    send_state_configure(state, toplevel, rect, states);
    state.outputs.damage_all();
}

/// Window-menu request. The menu itself is an outer shell surface; the
/// core only validates the triggering serial and records the anchor.
pub fn show_window_menu(
    state: &mut DesktopState,
    toplevel: ToplevelId,
    request_serial: Serial,
    position: Point<i32>,
) {
    let recent_press = state
        .input
        .seat
        .pointer
        .as_ref()
        .and_then(|p| p.last_press_serial);
    if recent_press != Some(request_serial) {
        tracing::debug!(toplevel = toplevel.0, "ignoring window-menu request with stale serial");
        return;
    }
    tracing::debug!(toplevel = toplevel.0, x = position.x, y = position.y, "window menu requested");
}

// ---- cursor image --------------------------------------------------------

/// A seat client set the pointer cursor: hidden, or a cursor-role surface
/// with a hotspot. Theming is the renderer's concern; only the tag lives
/// here.
pub fn set_pointer_cursor(
    state: &mut DesktopState,
    surface: Option<(SurfaceId, Point<i32>)>,
) -> Result<(), ProtocolError> {
    let image = match surface {
        Some((surface, hotspot)) => {
            state.surfaces.give_role(surface, SurfaceRole::Cursor)?;
            crate::pointer::CursorImage::Surface { surface, hotspot }
        }
        None => crate::pointer::CursorImage::Hidden,
    };
    if let Some(pointer) = &mut state.input.seat.pointer {
        pointer.cursor = image;
    }
    Ok(())
}

// ---- output hot-unplug ---------------------------------------------------

/// Display backend lost an output. The engine cascade runs, and windows
/// stranded outside the remaining area are pulled back in until the policy
/// collaborator delivers a proper relayout.
pub fn remove_output(state: &mut DesktopState, output: OutputId) {
    if !state.outputs.remove_output(output, &mut state.clients) {
        return;
    }
    let area = state.outputs.union_rect();
    if area.is_empty() {
        return;
    }
    for id in state.mechanics.stacking().to_vec() {
        if let Some(window) = state.mechanics.window_mut(id) {
            if !window.geometry.overlaps(&area) {
                window.geometry.loc = area.loc;
            }
        }
    }
    state.outputs.damage_all();
    tracing::info!(output = output.0, "output removed; windows need relayout");
}

// ---- output transactions from the wire ----------------------------------

/// Apply an output configuration, driving the display backend owned by the
/// state.
pub fn apply_output_configuration(
    state: &mut DesktopState,
    configuration: ConfigurationId,
) -> Result<crate::output_config::TransactionResult, ProtocolError> {
    let DesktopState { outputs, output_backend, clients, .. } = state;
    let result = outputs.apply_configuration(configuration, output_backend.as_mut(), clients)?;
    if result == crate::output_config::TransactionResult::Succeeded {
        state.outputs.damage_all();
    }
    Ok(result)
}

// ---- service-bus reactions ----------------------------------------------

/// React to a normalized service-bus event, on the loop thread.
pub fn handle_service_event(state: &mut DesktopState, event: ServiceEvent) {
    match event {
        ServiceEvent::UserActivityDetected => {
            state.mechanics.pointer_wake_allowed = true;
        }
        ServiceEvent::SystemPrepareForSleep(sleeping) => {
            let target = if sleeping { PowerState::Off } else { PowerState::On };
            tracing::info!(?target, "sleep transition: switching output power");
            let ids = state.outputs.ids();
            let DesktopState { outputs, output_backend, clients, .. } = state;
            for id in ids {
                if let Err(err) = outputs.set_power(id, target, output_backend.as_mut(), clients) {
                    tracing::warn!(%err, output = id.0, "power change failed");
                }
            }
        }
        ServiceEvent::SessionLocked => {
            state.mechanics.locked = true;
            let lock_surface = state.mechanics.lock_surface;
            set_keyboard_focus(state, lock_surface);
        }
        ServiceEvent::SessionUnlocked => {
            state.mechanics.locked = false;
        }
        ServiceEvent::SettingChanged(path) => handle_setting_changed(state, &path),
    }
}

fn handle_setting_changed(state: &mut DesktopState, path: &str) {
    let fresh = match CompositorConfig::load() {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(%err, "could not re-read configuration");
            return;
        }
    };
    if path.starts_with("keyboard") {
        state.config.keyboard = fresh.keyboard;
        let keyboard_config = state.config.keyboard.clone();
        let rebuilt = match &mut state.input.seat.keyboard {
            Some(keyboard) => match keyboard.rebuild(&keyboard_config) {
                Ok(file) => Some((file, keyboard.repeat_rate, keyboard.repeat_delay)),
                Err(err) => {
                    tracing::warn!(%err, "keymap rebuild failed; keeping the old keymap");
                    None
                }
            },
            None => None,
        };
        if let Some((file, rate, delay)) = rebuilt {
            state.input.broadcast_keyboard(
                crate::keyboard::KeyboardEvent::Keymap { file },
                &mut state.clients,
            );
            state.input.broadcast_keyboard(
                crate::keyboard::KeyboardEvent::RepeatInfo {
                    rate,
                    delay_ms: delay.as_millis() as i32,
                },
                &mut state.clients,
            );
        }
    } else if path.starts_with("tiling") {
        state.config.tiling = fresh.tiling;
    } else if path.starts_with("pointer") {
        state.config.pointer = fresh.pointer;
    } else {
        tracing::trace!(path, "setting not relevant to the core");
    }
}

// ---- render pass ---------------------------------------------------------

/// Render every output that needs it and fire the frame callbacks that
/// were waiting for a present.
pub fn render_outputs(state: &mut DesktopState) {
    let time_ms = state.elapsed_ms();

    // Element sources bottom-to-top: mapped windows, then popups.
    let mut sources: Vec<(SurfaceId, Point<i32>)> = Vec::new();
    for id in state.mechanics.stacking().to_vec() {
        if let Some(window) = state.mechanics.window(id) {
            if window.mapped {
                let origin = state
                    .mechanics
                    .surface_origin(window, &state.shell, &state.surfaces);
                sources.push((window.surface, origin));
            }
        }
    }
    let mut popups: Vec<_> = state
        .shell
        .popups()
        .filter(|p| !p.dismissed)
        .map(|p| (p.surface, p.rect.loc, p.id))
        .collect();
    popups.sort_by_key(|(_, _, id)| *id);
    for (surface, loc, _) in popups {
        sources.push((surface, loc));
    }

    let mut elements = Vec::new();
    for (surface_id, origin) in &sources {
        let texture = state.surfaces.get(*surface_id).and_then(|s| s.texture);
        let damage: Region = state.surfaces.take_damage(*surface_id);
        elements.push(RenderElement::Surface {
            surface: *surface_id,
            texture,
            position: *origin,
            damage,
        });
    }

    let targets: Vec<(OutputId, Rectangle<i32>, f64)> = state
        .outputs
        .outputs()
        .filter(|o| o.enabled && o.power.is_on() && o.needs_redraw)
        .filter_map(|o| o.logical_geometry().map(|g| (o.id, g, o.scale)))
        .collect();
    if targets.is_empty() {
        return;
    }

    let mut presented = false;
    let mut failed = false;
    for (id, rect, scale) in targets {
        match state.renderer.render_frame(&elements, rect, scale) {
            Ok(()) => {
                if let Err(err) = state.renderer.present_frame() {
                    tracing::warn!(%err, output = id.0, "present failed; skipping frame");
                    failed = true;
                } else {
                    presented = true;
                }
            }
            Err(err) => {
                // A renderer stall is a missed frame, not a crash.
                tracing::warn!(%err, output = id.0, "render failed; skipping frame");
                failed = true;
            }
        }
        if let Some(output) = state.outputs.get_mut(id) {
            output.needs_redraw = false;
        }
    }
    if failed {
        state.render_failures += 1;
        if state.render_failures >= 16 {
            tracing::error!("renderer keeps failing; shutting down");
            state.spine.request_shutdown();
        }
    } else {
        state.render_failures = 0;
    }

    if presented {
        for (surface, callback) in std::mem::take(&mut state.frame_callbacks) {
            if let Some(record) = state.surfaces.get(surface) {
                state.clients.send(
                    record.client,
                    ClientEvent::FrameDone {
                        surface,
                        callback,
                        time_ms,
                    },
                );
            }
        }
    }
}
