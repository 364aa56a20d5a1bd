//! Window mechanics: the managed-window space, layout application and
//! focus enforcement.
//!
//! Mechanics never decides where windows go or who gets focus; the policy
//! collaborator does. This module applies those decisions to live shell
//! objects: configures go out, geometry becomes current when the matching
//! serial is acked, stacking and focus flags are enforced.

use crate::config::TilingConfig;
use crate::geometry::{Point, Rectangle, Size};
use crate::keyboard::KeyboardState;
use crate::output::OutputEngine;
use crate::protocol::{Clients, Serial, SerialCounter};
use crate::shell::{
    AckedConfigure, ConfigurePayload, PopupId, ShellEngine, ToplevelId, ToplevelStateSet, XdgRole,
};
use crate::surface::{SurfaceEngine, SurfaceId};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowId(pub u64);

pub type WorkspaceId = u32;

/// The shell object a managed window wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowShell {
    Toplevel(ToplevelId),
    Popup(PopupId),
}

/// Geometry sent but not yet acknowledged.
#[derive(Debug, Clone, Copy)]
pub struct PendingGeometry {
    pub serial: Serial,
    pub rect: Rectangle<i32>,
}

/// The canonical window record: identity is stable for the lifetime of the
/// underlying shell object.
#[derive(Debug)]
pub struct ManagedWindow {
    pub id: WindowId,
    /// Identity used by the external policy collaborator.
    pub domain_id: String,
    pub shell: WindowShell,
    pub surface: SurfaceId,
    /// Currently applied geometry, global coordinates.
    pub geometry: Rectangle<i32>,
    pub pending: Option<PendingGeometry>,
    /// Geometry before a maximize/fullscreen, restored on the way back.
    pub saved_geometry: Option<Rectangle<i32>>,
    pub mapped: bool,
    pub workspace: WorkspaceId,
}

/// One window's slot in an externally computed layout.
#[derive(Debug, Clone)]
pub struct LayoutEntry {
    pub domain_id: String,
    pub rect: Rectangle<i32>,
    /// In tiling mode, marks the window the layout wants maximized.
    pub maximized: bool,
}

/// An externally computed layout for one workspace.
#[derive(Debug, Clone, Default)]
pub struct Layout {
    pub workspace: WorkspaceId,
    pub entries: Vec<LayoutEntry>,
    pub focused: Option<String>,
    pub tiling: bool,
}

/// The policy collaborator, consumed as a pure function of current state.
pub trait LayoutPolicy {
    /// Placement for a freshly mapped window.
    fn initial_rect(
        &self,
        app_id: Option<&str>,
        area: Rectangle<i32>,
        others: &[Rectangle<i32>],
        tiling: &TilingConfig,
    ) -> Rectangle<i32>;

    /// Snap target for an interactive move/resize, or `None` to keep the
    /// proposed rectangle.
    fn snap_target(
        &self,
        proposed: Rectangle<i32>,
        others: &[Rectangle<i32>],
        area: Rectangle<i32>,
        tiling: &TilingConfig,
    ) -> Option<Rectangle<i32>>;

    /// Whether a button press on an unfocused window takes keyboard focus.
    fn focus_on_click(&self) -> bool {
        true
    }
}

/// Default policy: centered placement, snapping against the workspace
/// edges. Real placement lives in the external collaborator.
#[derive(Debug, Default)]
pub struct EdgeSnapPolicy;

impl LayoutPolicy for EdgeSnapPolicy {
    fn initial_rect(
        &self,
        _app_id: Option<&str>,
        area: Rectangle<i32>,
        others: &[Rectangle<i32>],
        _tiling: &TilingConfig,
    ) -> Rectangle<i32> {
        let size = Size::new(
            (area.size.w * 3 / 5).max(1),
            (area.size.h * 3 / 5).max(1),
        );
        // Cascade a little off center per existing window.
        let step = (others.len() as i32 % 8) * 32;
        Rectangle::new(
            Point::new(
                area.loc.x + (area.size.w - size.w) / 2 + step,
                area.loc.y + (area.size.h - size.h) / 2 + step,
            ),
            size,
        )
    }

    fn snap_target(
        &self,
        proposed: Rectangle<i32>,
        _others: &[Rectangle<i32>],
        area: Rectangle<i32>,
        tiling: &TilingConfig,
    ) -> Option<Rectangle<i32>> {
        let threshold = tiling.snap_distance;
        let gap = tiling.gap;
        let mut snapped = proposed;
        if (snapped.loc.x - (area.loc.x + gap)).abs() <= threshold {
            snapped.loc.x = area.loc.x + gap;
        } else if ((area.right() - gap) - snapped.right()).abs() <= threshold {
            snapped.loc.x = area.right() - gap - snapped.size.w;
        }
        if (snapped.loc.y - (area.loc.y + gap)).abs() <= threshold {
            snapped.loc.y = area.loc.y + gap;
        } else if ((area.bottom() - gap) - snapped.bottom()).abs() <= threshold {
            snapped.loc.y = area.bottom() - gap - snapped.size.h;
        }
        (snapped != proposed).then_some(snapped)
    }
}

/// Window mechanics state: records, stacking, focus, the active grab.
#[derive(Default)]
pub struct WindowMechanics {
    windows: HashMap<WindowId, ManagedWindow>,
    by_domain: HashMap<String, WindowId>,
    by_toplevel: HashMap<ToplevelId, WindowId>,
    /// Bottom to top.
    stacking: Vec<WindowId>,
    pub focused: Option<WindowId>,
    pub grab: Option<crate::interactive::InteractiveGrab>,
    /// Session lock: only the lock surface receives focus.
    pub locked: bool,
    pub lock_surface: Option<SurfaceId>,
    /// Set by user-activity service events; allows pointer-wake focus
    /// transitions while idle.
    pub pointer_wake_allowed: bool,
    next_window: u64,
}

impl WindowMechanics {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- records --------------------------------------------------------

    /// Register a window for a shell object. Stacking places it on top;
    /// it is not mapped until a layout or initial placement applies.
    pub fn add_window(
        &mut self,
        shell: WindowShell,
        surface: SurfaceId,
        workspace: WorkspaceId,
    ) -> WindowId {
        self.next_window += 1;
        let id = WindowId(self.next_window);
        let domain_id = format!("window-{}", self.next_window);
        self.by_domain.insert(domain_id.clone(), id);
        if let WindowShell::Toplevel(toplevel) = shell {
            self.by_toplevel.insert(toplevel, id);
        }
        self.windows.insert(
            id,
            ManagedWindow {
                id,
                domain_id,
                shell,
                surface,
                geometry: Rectangle::default(),
                pending: None,
                saved_geometry: None,
                mapped: false,
                workspace,
            },
        );
        self.stacking.push(id);
        id
    }

    pub fn window(&self, id: WindowId) -> Option<&ManagedWindow> {
        self.windows.get(&id)
    }

    pub fn window_mut(&mut self, id: WindowId) -> Option<&mut ManagedWindow> {
        self.windows.get_mut(&id)
    }

    pub fn by_domain(&self, domain_id: &str) -> Option<WindowId> {
        self.by_domain.get(domain_id).copied()
    }

    pub fn by_toplevel(&self, toplevel: ToplevelId) -> Option<WindowId> {
        self.by_toplevel.get(&toplevel).copied()
    }

    /// Stacking order, bottom to top.
    pub fn stacking(&self) -> &[WindowId] {
        &self.stacking
    }

    pub fn raise(&mut self, id: WindowId) {
        if let Some(index) = self.stacking.iter().position(|w| *w == id) {
            let id = self.stacking.remove(index);
            self.stacking.push(id);
        }
    }

    pub fn windows_on_workspace(&self, workspace: WorkspaceId) -> Vec<WindowId> {
        self.stacking
            .iter()
            .filter(|id| {
                self.windows
                    .get(id)
                    .map(|w| w.workspace == workspace)
                    .unwrap_or(false)
            })
            .copied()
            .collect()
    }

    /// Geometries of mapped windows, excluding `except`.
    pub fn mapped_rects(&self, workspace: WorkspaceId, except: Option<WindowId>) -> Vec<Rectangle<i32>> {
        self.stacking
            .iter()
            .filter(|id| Some(**id) != except)
            .filter_map(|id| self.windows.get(id))
            .filter(|w| w.mapped && w.workspace == workspace)
            .map(|w| w.geometry)
            .collect()
    }

    pub fn remove_window(&mut self, id: WindowId) -> Option<ManagedWindow> {
        let window = self.windows.remove(&id)?;
        self.by_domain.remove(&window.domain_id);
        if let WindowShell::Toplevel(toplevel) = window.shell {
            self.by_toplevel.remove(&toplevel);
        }
        self.stacking.retain(|w| *w != id);
        if self.focused == Some(id) {
            self.focused = None;
        }
        Some(window)
    }

    // ---- layout application ---------------------------------------------

    /// Apply an externally computed layout. Unknown identifiers are skipped
    /// with a warning; unchanged geometry is left alone; windows absent
    /// from the layout are unmapped. Affected outputs are damaged.
    pub fn apply_layout(
        &mut self,
        layout: &Layout,
        shell: &mut ShellEngine,
        outputs: &mut OutputEngine,
        serials: &mut SerialCounter,
        clients: &mut Clients,
    ) {
        let bounds = outputs.union_rect().size;
        let mut seen: Vec<WindowId> = Vec::new();
        let mut touched = false;

        for entry in &layout.entries {
            let id = match self.by_domain.get(&entry.domain_id) {
                Some(id) => *id,
                None => {
                    tracing::warn!(domain = %entry.domain_id, "layout references unknown window");
                    continue;
                }
            };
            seen.push(id);
            let window = match self.windows.get_mut(&id) {
                Some(window) => window,
                None => continue,
            };
            let toplevel_id = match window.shell {
                WindowShell::Toplevel(toplevel) => toplevel,
                WindowShell::Popup(_) => continue,
            };
            if window.mapped && window.geometry == entry.rect {
                continue;
            }

            let mut states = shell
                .toplevel(toplevel_id)
                .map(|t| t.states)
                .unwrap_or_default();
            states.set(
                ToplevelStateSet::MAXIMIZED,
                layout.tiling && entry.maximized,
            );
            states.set(
                ToplevelStateSet::ACTIVATED,
                layout.focused.as_deref() == Some(entry.domain_id.as_str()),
            );

            if let Some(serial) =
                shell.send_configure(toplevel_id, entry.rect.size, states, bounds, serials, clients)
            {
                window.pending = Some(PendingGeometry {
                    serial,
                    rect: entry.rect,
                });
            }
            // Position changes apply immediately; size waits for the ack.
            window.geometry.loc = entry.rect.loc;
            window.mapped = true;
            touched = true;
        }

        // Windows on this workspace but not in the layout belong elsewhere
        // now.
        for id in self.windows_on_workspace(layout.workspace) {
            if !seen.contains(&id) {
                if let Some(window) = self.windows.get_mut(&id) {
                    if window.mapped && matches!(window.shell, WindowShell::Toplevel(_)) {
                        window.mapped = false;
                        touched = true;
                    }
                }
            }
        }

        if touched {
            outputs.damage_all();
        }
    }

    /// A configure was acked: geometry recorded against that serial (or an
    /// older one) becomes current.
    pub fn on_ack_configure(&mut self, toplevel: ToplevelId, acked: &AckedConfigure) {
        let id = match self.by_toplevel.get(&toplevel) {
            Some(id) => *id,
            None => return,
        };
        if let Some(window) = self.windows.get_mut(&id) {
            if let Some(pending) = window.pending {
                if acked.serial.is_no_older_than(pending.serial) {
                    window.geometry = pending.rect;
                    window.pending = None;
                    if let ConfigurePayload::Toplevel { size, .. } = acked.payload {
                        if !size.is_empty() {
                            window.geometry.size = size;
                        }
                    }
                }
            }
        }
    }

    // ---- focus enforcement ----------------------------------------------

    /// Apply an externally decided focus change: keyboard focus moves with
    /// paired leave/enter, the previous toplevel is deactivated, the new
    /// one is activated and raised. Returns true if a running key repeat
    /// was cancelled.
    #[allow(clippy::too_many_arguments)]
    pub fn enforce_focus(
        &mut self,
        target: Option<&str>,
        shell: &mut ShellEngine,
        keyboard: Option<&mut KeyboardState>,
        surfaces: &SurfaceEngine,
        outputs: &OutputEngine,
        serials: &mut SerialCounter,
        clients: &mut Clients,
    ) -> bool {
        let target_window = target.and_then(|domain| self.by_domain.get(domain)).copied();
        self.enforce_focus_window(target_window, shell, keyboard, surfaces, outputs, serials, clients)
    }

    pub(crate) fn enforce_focus_window(
        &mut self,
        target_window: Option<WindowId>,
        shell: &mut ShellEngine,
        keyboard: Option<&mut KeyboardState>,
        surfaces: &SurfaceEngine,
        outputs: &OutputEngine,
        serials: &mut SerialCounter,
        clients: &mut Clients,
    ) -> bool {
        let mut target_surface = target_window
            .and_then(|id| self.windows.get(&id))
            .map(|w| w.surface);
        // A locked session only ever focuses the lock surface.
        if self.locked && target_surface != self.lock_surface {
            target_surface = self.lock_surface;
        }

        let serial = serials.next_serial();
        let repeat_cancelled = match keyboard {
            Some(keyboard) => keyboard.set_focus(target_surface, serial, clients, surfaces),
            None => false,
        };

        let previous = self.focused;
        self.focused = target_window;
        let bounds = outputs.union_rect().size;

        if let Some(previous) = previous.filter(|p| Some(*p) != target_window) {
            if let Some(window) = self.windows.get(&previous) {
                if let WindowShell::Toplevel(toplevel_id) = window.shell {
                    let size = window.geometry.size;
                    if let Some(toplevel) = shell.toplevel(toplevel_id) {
                        let states = toplevel.states - ToplevelStateSet::ACTIVATED;
                        shell.send_configure(toplevel_id, size, states, bounds, serials, clients);
                    }
                }
            }
        }
        if let Some(target) = target_window.filter(|t| Some(*t) != previous) {
            self.raise(target);
            if let Some(window) = self.windows.get(&target) {
                if let WindowShell::Toplevel(toplevel_id) = window.shell {
                    let size = window.geometry.size;
                    if let Some(toplevel) = shell.toplevel(toplevel_id) {
                        let states = toplevel.states | ToplevelStateSet::ACTIVATED;
                        shell.send_configure(toplevel_id, size, states, bounds, serials, clients);
                    }
                }
            }
        }
        repeat_cancelled
    }

    // ---- hit testing ----------------------------------------------------

    /// Where a surface's top-left corner sits in global coordinates. The
    /// applied geometry positions the window-geometry rectangle, which may
    /// be inset in the surface (shadows).
    pub fn surface_origin(
        &self,
        window: &ManagedWindow,
        shell: &ShellEngine,
        surfaces: &SurfaceEngine,
    ) -> Point<i32> {
        let inset = shell
            .effective_window_geometry(window.surface, surfaces)
            .loc;
        Point::new(window.geometry.loc.x - inset.x, window.geometry.loc.y - inset.y)
    }

    /// Top-down hit test against the input regions of mapped surfaces.
    /// Popups sit above every toplevel. Returns the surface and its global
    /// origin.
    pub fn surface_under(
        &self,
        point: Point<f64>,
        shell: &ShellEngine,
        surfaces: &SurfaceEngine,
    ) -> Option<(SurfaceId, Point<f64>)> {
        // Popups first, newest on top.
        let mut popups: Vec<_> = shell.popups().filter(|p| !p.dismissed).collect();
        popups.sort_by_key(|p| std::cmp::Reverse(p.id));
        for popup in popups {
            let origin = popup.rect.loc.to_f64();
            let local = Point::new(point.x - origin.x, point.y - origin.y);
            if let Some(surface) = surfaces.get(popup.surface) {
                if surface.current.accepts_input(local.to_i32_round()) {
                    return Some((popup.surface, origin));
                }
            }
        }
        for id in self.stacking.iter().rev() {
            let window = match self.windows.get(id) {
                Some(window) if window.mapped => window,
                _ => continue,
            };
            let origin = self.surface_origin(window, shell, surfaces).to_f64();
            let local = Point::new(point.x - origin.x, point.y - origin.y);
            if let Some(surface) = surfaces.get(window.surface) {
                if surface.current.accepts_input(local.to_i32_round()) {
                    return Some((window.surface, origin));
                }
            }
        }
        None
    }

    // ---- cascades -------------------------------------------------------

    /// A shell role went away: drop its window. Returns the removed window
    /// and whether the active grab targeted it.
    pub fn role_destroyed(&mut self, role: XdgRole) -> (Option<ManagedWindow>, bool) {
        let id = match role {
            XdgRole::Toplevel(toplevel) => self.by_toplevel.get(&toplevel).copied(),
            XdgRole::Popup(_) => None,
        };
        let id = match id {
            Some(id) => id,
            None => return (None, false),
        };
        let grab_hit = self
            .grab
            .as_ref()
            .map(|grab| grab.window == id)
            .unwrap_or(false);
        if grab_hit {
            self.grab = None;
        }
        (self.remove_window(id), grab_hit)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::ClientId;

    pub(crate) struct Fixture {
        pub mechanics: WindowMechanics,
        pub shell: ShellEngine,
        pub surfaces: SurfaceEngine,
        pub outputs: OutputEngine,
        pub clients: Clients,
        pub serials: SerialCounter,
        pub client: ClientId,
    }

    pub(crate) fn fixture() -> Fixture {
        let mut clients = Clients::new();
        let client = clients.connect();
        let mut surfaces = SurfaceEngine::new();
        surfaces.bind_client(client);
        let mut shell = ShellEngine::new();
        shell.bind_client(client);
        let mut outputs = OutputEngine::new();
        outputs.add_output(
            "VIRT-1".into(),
            "virtual".into(),
            Size::new(520, 290),
            vec![crate::output::Mode {
                size: Size::new(1920, 1080),
                refresh_mhz: 60_000,
                preferred: true,
            }],
            Point::new(0, 0),
            1.0,
            &mut clients,
        );
        Fixture {
            mechanics: WindowMechanics::new(),
            shell,
            surfaces,
            outputs,
            clients,
            serials: SerialCounter::new(),
            client,
        }
    }

    pub(crate) fn managed_toplevel(f: &mut Fixture) -> (SurfaceId, ToplevelId, WindowId) {
        let surface = f.surfaces.create_surface(f.client);
        f.shell
            .get_xdg_surface(f.client, surface, &f.surfaces)
            .unwrap();
        let toplevel = f.shell.get_toplevel(surface, &mut f.surfaces).unwrap();
        let window = f
            .mechanics
            .add_window(WindowShell::Toplevel(toplevel), surface, 0);
        (surface, toplevel, window)
    }

    #[test]
    fn layout_applies_geometry_via_configure_and_ack() {
        let mut f = fixture();
        let (surface, toplevel, window) = managed_toplevel(&mut f);
        let domain = f.mechanics.window(window).unwrap().domain_id.clone();

        let layout = Layout {
            workspace: 0,
            entries: vec![LayoutEntry {
                domain_id: domain.clone(),
                rect: Rectangle::from_coords(100, 50, 800, 600),
                maximized: false,
            }],
            focused: Some(domain),
            tiling: false,
        };
        f.mechanics.apply_layout(
            &layout,
            &mut f.shell,
            &mut f.outputs,
            &mut f.serials,
            &mut f.clients,
        );

        let pending = f.mechanics.window(window).unwrap().pending.unwrap();
        assert_eq!(pending.rect, Rectangle::from_coords(100, 50, 800, 600));

        // The ack promotes the pending geometry.
        let acked = f.shell.ack_configure(surface, pending.serial).unwrap();
        f.mechanics.on_ack_configure(toplevel, &acked);
        let window_record = f.mechanics.window(window).unwrap();
        assert_eq!(window_record.geometry, Rectangle::from_coords(100, 50, 800, 600));
        assert!(window_record.pending.is_none());
    }

    #[test]
    fn layout_skips_unknown_and_unmaps_missing() {
        let mut f = fixture();
        let (_, _, window) = managed_toplevel(&mut f);
        {
            let record = f.mechanics.window_mut(window).unwrap();
            record.mapped = true;
        }

        let layout = Layout {
            workspace: 0,
            entries: vec![LayoutEntry {
                domain_id: "nonexistent".into(),
                rect: Rectangle::from_coords(0, 0, 100, 100),
                maximized: false,
            }],
            focused: None,
            tiling: false,
        };
        f.mechanics.apply_layout(
            &layout,
            &mut f.shell,
            &mut f.outputs,
            &mut f.serials,
            &mut f.clients,
        );
        // The managed window was not in the layout: unmapped.
        assert!(!f.mechanics.window(window).unwrap().mapped);
    }

    #[test]
    fn unchanged_geometry_sends_nothing() {
        let mut f = fixture();
        let (_, _, window) = managed_toplevel(&mut f);
        let rect = Rectangle::from_coords(0, 0, 640, 480);
        {
            let record = f.mechanics.window_mut(window).unwrap();
            record.geometry = rect;
            record.mapped = true;
        }
        let domain = f.mechanics.window(window).unwrap().domain_id.clone();
        f.clients.drain(f.client);

        let layout = Layout {
            workspace: 0,
            entries: vec![LayoutEntry {
                domain_id: domain,
                rect,
                maximized: false,
            }],
            focused: None,
            tiling: false,
        };
        f.mechanics.apply_layout(
            &layout,
            &mut f.shell,
            &mut f.outputs,
            &mut f.serials,
            &mut f.clients,
        );
        assert!(f.clients.drain(f.client).is_empty());
        assert!(f.mechanics.window(window).unwrap().pending.is_none());
    }

    #[test]
    fn focus_enforcement_activates_and_raises() {
        let mut f = fixture();
        let (_, t1, w1) = managed_toplevel(&mut f);
        let (_, t2, w2) = managed_toplevel(&mut f);
        for w in [w1, w2] {
            f.mechanics.window_mut(w).unwrap().mapped = true;
        }
        let d2 = f.mechanics.window(w2).unwrap().domain_id.clone();

        f.mechanics.enforce_focus(
            Some(&d2),
            &mut f.shell,
            None,
            &f.surfaces,
            &f.outputs,
            &mut f.serials,
            &mut f.clients,
        );
        assert_eq!(f.mechanics.focused, Some(w2));
        assert_eq!(f.mechanics.stacking().last(), Some(&w2));

        // Focus the other: w2 gets a deactivating configure, w1 an
        // activating one.
        let d1 = f.mechanics.window(w1).unwrap().domain_id.clone();
        f.clients.drain(f.client);
        f.mechanics.enforce_focus(
            Some(&d1),
            &mut f.shell,
            None,
            &f.surfaces,
            &f.outputs,
            &mut f.serials,
            &mut f.clients,
        );
        let configures: Vec<_> = f
            .clients
            .drain(f.client)
            .into_iter()
            .filter_map(|e| match e {
                crate::protocol::ClientEvent::Toplevel(
                    id,
                    crate::shell::ToplevelEvent::Configure { states, .. },
                ) => Some((id, states)),
                _ => None,
            })
            .collect();
        assert!(configures
            .iter()
            .any(|(id, states)| *id == t2 && !states.contains(ToplevelStateSet::ACTIVATED)));
        assert!(configures
            .iter()
            .any(|(id, states)| *id == t1 && states.contains(ToplevelStateSet::ACTIVATED)));
        assert_eq!(f.mechanics.stacking().last(), Some(&w1));
    }

    #[test]
    fn locked_session_redirects_focus_to_lock_surface() {
        let mut f = fixture();
        let (_, _, w1) = managed_toplevel(&mut f);
        f.mechanics.window_mut(w1).unwrap().mapped = true;
        let lock_surface = f.surfaces.create_surface(f.client);
        f.mechanics.locked = true;
        f.mechanics.lock_surface = Some(lock_surface);

        let mut keyboard =
            KeyboardState::new(&crate::config::KeyboardConfig::default()).unwrap();
        let d1 = f.mechanics.window(w1).unwrap().domain_id.clone();
        f.mechanics.enforce_focus(
            Some(&d1),
            &mut f.shell,
            Some(&mut keyboard),
            &f.surfaces,
            &f.outputs,
            &mut f.serials,
            &mut f.clients,
        );
        assert_eq!(keyboard.focus, Some(lock_surface));
    }

    #[test]
    fn hit_test_respects_stacking() {
        let mut f = fixture();
        let (s1, _, w1) = managed_toplevel(&mut f);
        let (s2, _, w2) = managed_toplevel(&mut f);
        for (w, rect) in [
            (w1, Rectangle::from_coords(0, 0, 400, 400)),
            (w2, Rectangle::from_coords(200, 200, 400, 400)),
        ] {
            let record = f.mechanics.window_mut(w).unwrap();
            record.geometry = rect;
            record.mapped = true;
        }
        // Give both surfaces content so they accept input.
        for s in [s1, s2] {
            f.surfaces.get_mut(s).unwrap().current.buffer_size = Size::new(400, 400);
        }

        // Overlap region goes to the top window (w2).
        let hit = f
            .mechanics
            .surface_under(Point::new(300.0, 300.0), &f.shell, &f.surfaces);
        assert_eq!(hit.map(|(s, _)| s), Some(s2));

        // Outside w2, inside w1.
        let hit = f
            .mechanics
            .surface_under(Point::new(50.0, 50.0), &f.shell, &f.surfaces);
        assert_eq!(hit.map(|(s, _)| s), Some(s1));

        let hit = f
            .mechanics
            .surface_under(Point::new(1000.0, 1000.0), &f.shell, &f.surfaces);
        assert!(hit.is_none());
    }
}
