//! Interactive move and resize grabs.
//!
//! A grab snapshots the window geometry and size constraints at the moment
//! the button went down; motion proposes rectangles, the policy
//! collaborator may snap them, and geometry moves in memory only. The final
//! configure goes out on release. Cancellation (surface death, seat
//! removal) drops the grab without a configure.

use crate::config::TilingConfig;
use crate::geometry::{Point, Rectangle, Size};
use crate::mechanics::{LayoutPolicy, WindowId, WindowMechanics, WindowShell};
use crate::output::OutputEngine;
use crate::protocol::{Clients, SerialCounter};
use crate::shell::{ResizeEdge, ShellEngine, ToplevelId, ToplevelStateSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrabKind {
    Move,
    Resize(ResizeEdge),
}

/// State of an active interactive grab. Exists only while the pointer grab
/// is installed.
#[derive(Debug, Clone, Copy)]
pub struct InteractiveGrab {
    pub window: WindowId,
    pub kind: GrabKind,
    pub start_pointer: Point<f64>,
    pub start_geometry: Rectangle<i32>,
    /// Size constraint snapshot taken when the grab began.
    pub min_size: Size<i32>,
    pub max_size: Size<i32>,
}

impl WindowMechanics {
    /// Begin a move or resize grab for a toplevel. The caller has already
    /// validated the request serial against a recent button press and
    /// installs the pointer grab on success.
    pub fn begin_interactive(
        &mut self,
        toplevel: ToplevelId,
        kind: GrabKind,
        pointer: Point<f64>,
        shell: &mut ShellEngine,
        outputs: &OutputEngine,
        serials: &mut SerialCounter,
        clients: &mut Clients,
    ) -> bool {
        if self.grab.is_some() {
            return false;
        }
        let window_id = match self.by_toplevel(toplevel) {
            Some(id) => id,
            None => return false,
        };
        let (geometry, mapped) = match self.window(window_id) {
            Some(window) => (window.geometry, window.mapped),
            None => return false,
        };
        if !mapped {
            return false;
        }
        let (min_size, max_size) = shell
            .toplevel(toplevel)
            .map(|t| (t.min_size, t.max_size))
            .unwrap_or_default();

        if let GrabKind::Resize(_) = kind {
            let bounds = outputs.union_rect().size;
            if let Some(t) = shell.toplevel(toplevel) {
                let states = t.states | ToplevelStateSet::RESIZING;
                shell.send_configure(toplevel, geometry.size, states, bounds, serials, clients);
            }
        }

        tracing::debug!(window = window_id.0, ?kind, "interactive grab started");
        self.grab = Some(InteractiveGrab {
            window: window_id,
            kind,
            start_pointer: pointer,
            start_geometry: geometry,
            min_size,
            max_size,
        });
        true
    }

    /// Pointer motion while the grab is held. Geometry changes in memory
    /// only; no configure is sent until release.
    pub fn grab_motion(
        &mut self,
        pointer: Point<f64>,
        policy: &dyn LayoutPolicy,
        tiling: &TilingConfig,
        outputs: &mut OutputEngine,
    ) {
        let grab = match self.grab {
            Some(grab) => grab,
            None => return,
        };
        let dx = (pointer.x - grab.start_pointer.x).round() as i32;
        let dy = (pointer.y - grab.start_pointer.y).round() as i32;

        let proposed = match grab.kind {
            GrabKind::Move => grab.start_geometry.translate(Point::new(dx, dy)),
            GrabKind::Resize(edge) => resize_rect(
                grab.start_geometry,
                edge,
                dx,
                dy,
                grab.min_size,
                grab.max_size,
            ),
        };

        let workspace = match self.window(grab.window) {
            Some(window) => window.workspace,
            None => return,
        };
        let others = self.mapped_rects(workspace, Some(grab.window));
        let area = outputs.union_rect();
        let target = policy
            .snap_target(proposed, &others, area, tiling)
            .unwrap_or(proposed);

        if let Some(window) = self.window_mut(grab.window) {
            if window.geometry != target {
                window.geometry = target;
                outputs.damage_all();
            }
        }
    }

    /// Button released: finalize geometry with a configure (possibly
    /// identical to the last one) and drop the grab.
    pub fn grab_release(
        &mut self,
        shell: &mut ShellEngine,
        outputs: &mut OutputEngine,
        serials: &mut SerialCounter,
        clients: &mut Clients,
    ) {
        let grab = match self.grab.take() {
            Some(grab) => grab,
            None => return,
        };
        let (geometry, shell_handle) = match self.window(grab.window) {
            Some(window) => (window.geometry, window.shell),
            None => return,
        };
        if let WindowShell::Toplevel(toplevel) = shell_handle {
            let bounds = outputs.union_rect().size;
            if let Some(t) = shell.toplevel(toplevel) {
                let states = t.states - ToplevelStateSet::RESIZING;
                if let Some(serial) =
                    shell.send_configure(toplevel, geometry.size, states, bounds, serials, clients)
                {
                    if let Some(window) = self.window_mut(grab.window) {
                        window.pending = Some(crate::mechanics::PendingGeometry {
                            serial,
                            rect: geometry,
                        });
                    }
                }
            }
        }
        outputs.damage_all();
        tracing::debug!(window = grab.window.0, "interactive grab finished");
    }

    /// Compositor-initiated cancellation (surface destroyed, seat removed).
    /// The pointer returns to normal focus resolution at the caller.
    pub fn grab_cancel(&mut self) -> Option<WindowId> {
        let grab = self.grab.take()?;
        tracing::debug!(window = grab.window.0, "interactive grab cancelled");
        Some(grab.window)
    }
}

/// Resize `start` so the edges named by `edge` track the pointer delta,
/// clamped to the size constraints with the opposite edges anchored.
fn resize_rect(
    start: Rectangle<i32>,
    edge: ResizeEdge,
    dx: i32,
    dy: i32,
    min: Size<i32>,
    max: Size<i32>,
) -> Rectangle<i32> {
    let mut rect = start;
    if edge.contains(ResizeEdge::RIGHT) {
        rect.size.w = start.size.w + dx;
    }
    if edge.contains(ResizeEdge::LEFT) {
        rect.size.w = start.size.w - dx;
    }
    if edge.contains(ResizeEdge::BOTTOM) {
        rect.size.h = start.size.h + dy;
    }
    if edge.contains(ResizeEdge::TOP) {
        rect.size.h = start.size.h - dy;
    }

    rect.size.w = clamp_extent(rect.size.w, min.w, max.w);
    rect.size.h = clamp_extent(rect.size.h, min.h, max.h);

    // Anchor the non-tracking edges.
    if edge.contains(ResizeEdge::LEFT) {
        rect.loc.x = start.right() - rect.size.w;
    }
    if edge.contains(ResizeEdge::TOP) {
        rect.loc.y = start.bottom() - rect.size.h;
    }
    rect
}

fn clamp_extent(value: i32, min: i32, max: i32) -> i32 {
    let mut out = value.max(min.max(1));
    if max > 0 {
        out = out.min(max);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mechanics::tests::{fixture, managed_toplevel};
    use crate::mechanics::EdgeSnapPolicy;

    fn start_grab(kind: GrabKind) -> (crate::mechanics::tests::Fixture, crate::shell::ToplevelId, WindowId) {
        let mut f = fixture();
        let (_, toplevel, window) = managed_toplevel(&mut f);
        {
            let record = f.mechanics.window_mut(window).unwrap();
            record.geometry = Rectangle::from_coords(100, 100, 400, 300);
            record.mapped = true;
        }
        let started = f.mechanics.begin_interactive(
            toplevel,
            kind,
            Point::new(250.0, 250.0),
            &mut f.shell,
            &f.outputs,
            &mut f.serials,
            &mut f.clients,
        );
        assert!(started);
        (f, toplevel, window)
    }

    #[test]
    fn move_tracks_pointer_without_configures() {
        let (mut f, _, window) = start_grab(GrabKind::Move);
        f.clients.drain(f.client);

        f.mechanics.grab_motion(
            Point::new(300.0, 280.0),
            &EdgeSnapPolicy,
            &TilingConfig::default(),
            &mut f.outputs,
        );
        assert_eq!(
            f.mechanics.window(window).unwrap().geometry,
            Rectangle::from_coords(150, 130, 400, 300)
        );
        // In-memory only: no configure during the drag.
        assert!(f.clients.drain(f.client).is_empty());
    }

    #[test]
    fn release_sends_final_configure() {
        let (mut f, toplevel, window) = start_grab(GrabKind::Move);
        f.mechanics.grab_motion(
            Point::new(350.0, 250.0),
            &EdgeSnapPolicy,
            &TilingConfig::default(),
            &mut f.outputs,
        );
        f.clients.drain(f.client);
        f.mechanics
            .grab_release(&mut f.shell, &mut f.outputs, &mut f.serials, &mut f.clients);
        assert!(f.mechanics.grab.is_none());

        let events = f.clients.drain(f.client);
        assert!(events.iter().any(|e| matches!(
            e,
            crate::protocol::ClientEvent::Toplevel(id, crate::shell::ToplevelEvent::Configure { .. }) if *id == toplevel
        )));
        assert!(f.mechanics.window(window).unwrap().pending.is_some());
    }

    #[test]
    fn resize_left_edge_anchors_right() {
        let (mut f, _, window) = start_grab(GrabKind::Resize(ResizeEdge::LEFT));
        f.mechanics.grab_motion(
            Point::new(200.0, 250.0),
            &EdgeSnapPolicy,
            &TilingConfig::default(),
            &mut f.outputs,
        );
        let geometry = f.mechanics.window(window).unwrap().geometry;
        // Dragged 50 right: window shrinks, right edge stays at 500.
        assert_eq!(geometry, Rectangle::from_coords(150, 100, 350, 300));
        assert_eq!(geometry.right(), 500);
    }

    #[test]
    fn resize_enforces_min_size_hints() {
        let mut f = fixture();
        let (_, toplevel, window) = managed_toplevel(&mut f);
        f.shell.set_min_size(toplevel, Size::new(300, 200)).unwrap();
        {
            let record = f.mechanics.window_mut(window).unwrap();
            record.geometry = Rectangle::from_coords(100, 100, 400, 300);
            record.mapped = true;
        }
        assert!(f.mechanics.begin_interactive(
            toplevel,
            GrabKind::Resize(ResizeEdge::RIGHT | ResizeEdge::BOTTOM),
            Point::new(500.0, 400.0),
            &mut f.shell,
            &f.outputs,
            &mut f.serials,
            &mut f.clients,
        ));
        f.mechanics.grab_motion(
            Point::new(100.0, 100.0),
            &EdgeSnapPolicy,
            &TilingConfig::default(),
            &mut f.outputs,
        );
        let geometry = f.mechanics.window(window).unwrap().geometry;
        assert_eq!(geometry.size, Size::new(300, 200));
    }

    #[test]
    fn resize_sets_resizing_state() {
        let (mut f, toplevel, _) = start_grab(GrabKind::Resize(ResizeEdge::RIGHT));
        let events = f.clients.drain(f.client);
        assert!(events.iter().any(|e| matches!(
            e,
            crate::protocol::ClientEvent::Toplevel(id, crate::shell::ToplevelEvent::Configure { states, .. })
                if *id == toplevel && states.contains(ToplevelStateSet::RESIZING)
        )));
    }

    #[test]
    fn snapping_pulls_to_workspace_edge() {
        let (mut f, _, window) = start_grab(GrabKind::Move);
        let tiling = TilingConfig {
            gap: 0,
            snap_distance: 16,
            ..TilingConfig::default()
        };
        // Drag so the window's left edge lands 10px from the output edge.
        f.mechanics.grab_motion(
            Point::new(160.0, 250.0),
            &EdgeSnapPolicy,
            &tiling,
            &mut f.outputs,
        );
        assert_eq!(f.mechanics.window(window).unwrap().geometry.loc.x, 0);
    }

    #[test]
    fn second_grab_is_refused_while_one_is_active() {
        let (mut f, toplevel, _) = start_grab(GrabKind::Move);
        let started = f.mechanics.begin_interactive(
            toplevel,
            GrabKind::Move,
            Point::new(0.0, 0.0),
            &mut f.shell,
            &f.outputs,
            &mut f.serials,
            &mut f.clients,
        );
        assert!(!started);
    }

    #[test]
    fn cancel_drops_grab_without_configure() {
        let (mut f, _, window) = start_grab(GrabKind::Move);
        f.clients.drain(f.client);
        let cancelled = f.mechanics.grab_cancel();
        assert_eq!(cancelled, Some(window));
        assert!(f.clients.drain(f.client).is_empty());
        assert!(f.mechanics.grab.is_none());
    }
}
