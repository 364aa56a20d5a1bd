//! The XDG shell engine: xdg-surface wrappers, toplevels, popups and the
//! configure/ack-configure serial protocol.
//!
//! The engine owns the shell-side records; the wl_surface role tags point
//! back here. Window placement decisions come from window mechanics; this
//! module enforces protocol rules and bookkeeping.

use crate::geometry::{Rectangle, Size};
use crate::positioner::Positioner;
use crate::protocol::{
    fatal_invariant, ClientEvent, ClientId, Clients, ProtocolError, Serial, SerialCounter,
};
use crate::surface::{SurfaceEngine, SurfaceId, SurfaceRole};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ToplevelId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PopupId(pub u64);

bitflags::bitflags! {
    /// Toplevel state flags carried in configure events.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct ToplevelStateSet: u32 {
        const MAXIMIZED = 1;
        const FULLSCREEN = 2;
        const RESIZING = 4;
        const ACTIVATED = 8;
        const SUSPENDED = 16;
    }
}

bitflags::bitflags! {
    /// Which edges of a toplevel track the pointer in an interactive resize.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct ResizeEdge: u32 {
        const TOP = 1;
        const BOTTOM = 2;
        const LEFT = 4;
        const RIGHT = 8;
    }
}

impl ResizeEdge {
    /// Wire values: none=0, top=1, bottom=2, left=4, top_left=5,
    /// bottom_left=6, right=8, top_right=9, bottom_right=10.
    pub fn from_wire(value: u32) -> Result<Self, ProtocolError> {
        let edge = ResizeEdge::from_bits(value).ok_or(ProtocolError::InvalidResizeEdge(value))?;
        if edge.contains(ResizeEdge::TOP) && edge.contains(ResizeEdge::BOTTOM)
            || edge.contains(ResizeEdge::LEFT) && edge.contains(ResizeEdge::RIGHT)
        {
            return Err(ProtocolError::InvalidResizeEdge(value));
        }
        Ok(edge)
    }
}

/// Whether the client or the compositor draws decorations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecorationMode {
    #[default]
    ClientSide,
    ServerSide,
}

/// Window-management features the compositor advertises to toplevels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WmCapability {
    WindowMenu,
    Maximize,
    Fullscreen,
    Minimize,
}

/// Events delivered on an xdg_toplevel.
#[derive(Debug, Clone)]
pub enum ToplevelEvent {
    ConfigureBounds { bounds: Size<i32> },
    WmCapabilities { capabilities: Vec<WmCapability> },
    Configure {
        serial: Serial,
        size: Size<i32>,
        states: ToplevelStateSet,
    },
    Close,
}

/// Events delivered on an xdg_popup.
#[derive(Debug, Clone)]
pub enum PopupEvent {
    Configure {
        serial: Serial,
        rect: Rectangle<i32>,
    },
    Repositioned { token: u32 },
    /// The popup was dismissed and should be destroyed by the client.
    Done,
}

/// Snapshot of a sent, not-yet-acked configure.
#[derive(Debug, Clone, Copy)]
pub enum ConfigurePayload {
    Toplevel {
        size: Size<i32>,
        states: ToplevelStateSet,
    },
    Popup { rect: Rectangle<i32> },
}

#[derive(Debug, Clone, Copy)]
struct SentConfigure {
    serial: Serial,
    payload: ConfigurePayload,
}

/// The configure a client just acknowledged.
#[derive(Debug, Clone, Copy)]
pub struct AckedConfigure {
    pub serial: Serial,
    pub payload: ConfigurePayload,
    pub role: Option<XdgRole>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XdgRole {
    Toplevel(ToplevelId),
    Popup(PopupId),
}

/// The xdg_surface wrapper around a wl_surface.
#[derive(Debug)]
pub struct XdgSurfaceState {
    pub surface: SurfaceId,
    pub client: ClientId,
    pub window_geometry: Option<Rectangle<i32>>,
    sent_configures: VecDeque<SentConfigure>,
    pub last_sent: Option<Serial>,
    pub last_acked: Option<Serial>,
    pub role: Option<XdgRole>,
}

#[derive(Debug)]
pub struct Toplevel {
    pub id: ToplevelId,
    pub surface: SurfaceId,
    pub client: ClientId,
    pub title: Option<String>,
    pub app_id: Option<String>,
    pub parent: Option<ToplevelId>,
    /// Zero components mean "unset".
    pub min_size: Size<i32>,
    pub max_size: Size<i32>,
    pub states: ToplevelStateSet,
    pub decoration: DecorationMode,
    pub modal: bool,
    /// Whether the initial bounds/capabilities preamble went out.
    preamble_sent: bool,
}

impl Toplevel {
    /// Clamp a proposed size to the client's min/max hints.
    pub fn clamp_size(&self, size: Size<i32>) -> Size<i32> {
        let mut out = size;
        if self.min_size.w > 0 {
            out.w = out.w.max(self.min_size.w);
        }
        if self.min_size.h > 0 {
            out.h = out.h.max(self.min_size.h);
        }
        if self.max_size.w > 0 {
            out.w = out.w.min(self.max_size.w);
        }
        if self.max_size.h > 0 {
            out.h = out.h.min(self.max_size.h);
        }
        out
    }
}

/// Who a popup is anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopupParent {
    Toplevel(ToplevelId),
    Popup(PopupId),
}

#[derive(Debug)]
pub struct Popup {
    pub id: PopupId,
    pub surface: SurfaceId,
    pub client: ClientId,
    pub parent: PopupParent,
    pub positioner: Positioner,
    /// Resolved geometry in global coordinates.
    pub rect: Rectangle<i32>,
    pub grabbed: bool,
    pub dismissed: bool,
}

/// Per-client shell slot.
#[derive(Debug, Default)]
pub struct ClientShell {
    pub xdg_surfaces: Vec<SurfaceId>,
}

#[derive(Debug, Default)]
pub struct ShellEngine {
    clients: HashMap<ClientId, ClientShell>,
    xdg: HashMap<SurfaceId, XdgSurfaceState>,
    toplevels: HashMap<ToplevelId, Toplevel>,
    popups: HashMap<PopupId, Popup>,
    /// Active popup grab chain, bottom to top.
    grab_chain: Vec<PopupId>,
    next_toplevel: u64,
    next_popup: u64,
}

impl ShellEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a client to the shell global, creating its slot. Idempotent.
    pub fn bind_client(&mut self, client: ClientId) {
        self.clients.entry(client).or_default();
    }

    pub fn client_slot(&self, client: ClientId) -> &ClientShell {
        match self.clients.get(&client) {
            Some(slot) => slot,
            None => fatal_invariant(&format!("no shell slot for client {}", client.0)),
        }
    }

    fn client_slot_mut(&mut self, client: ClientId) -> &mut ClientShell {
        match self.clients.get_mut(&client) {
            Some(slot) => slot,
            None => fatal_invariant(&format!("no shell slot for client {}", client.0)),
        }
    }

    // ---- xdg_surface ----------------------------------------------------

    /// Wrap a wl_surface in an xdg_surface. Fails if the surface already
    /// carries a non-xdg role or is already wrapped.
    pub fn get_xdg_surface(
        &mut self,
        client: ClientId,
        surface: SurfaceId,
        surfaces: &SurfaceEngine,
    ) -> Result<(), ProtocolError> {
        if let Some(role) = surfaces.role(surface) {
            return Err(ProtocolError::RoleTaken {
                existing: role.name(),
                requested: "xdg_surface",
            });
        }
        if self.xdg.contains_key(&surface) {
            return Err(ProtocolError::RoleAlreadyConstructed);
        }
        self.client_slot_mut(client).xdg_surfaces.push(surface);
        self.xdg.insert(
            surface,
            XdgSurfaceState {
                surface,
                client,
                window_geometry: None,
                sent_configures: VecDeque::new(),
                last_sent: None,
                last_acked: None,
                role: None,
            },
        );
        Ok(())
    }

    pub fn xdg_surface(&self, surface: SurfaceId) -> Option<&XdgSurfaceState> {
        self.xdg.get(&surface)
    }

    fn xdg_surface_mut(&mut self, surface: SurfaceId) -> Result<&mut XdgSurfaceState, ProtocolError> {
        self.xdg
            .get_mut(&surface)
            .ok_or(ProtocolError::NotAnXdgSurface)
    }

    /// The rectangle of the surface that is "the window". Defaults to the
    /// full surface extent when the client never set one.
    pub fn effective_window_geometry(
        &self,
        surface: SurfaceId,
        surfaces: &SurfaceEngine,
    ) -> Rectangle<i32> {
        if let Some(geometry) = self.xdg.get(&surface).and_then(|x| x.window_geometry) {
            return geometry;
        }
        surfaces
            .get(surface)
            .map(|s| s.current.bounds())
            .unwrap_or_default()
    }

    pub fn set_window_geometry(
        &mut self,
        surface: SurfaceId,
        rect: Rectangle<i32>,
    ) -> Result<(), ProtocolError> {
        if rect.size.w <= 0 || rect.size.h <= 0 {
            return Err(ProtocolError::InvalidSize(rect.size.w, rect.size.h));
        }
        self.xdg_surface_mut(surface)?.window_geometry = Some(rect);
        Ok(())
    }

    /// Client acknowledgment of a configure. The serial must have been
    /// sent; acking a serial also retires every older configure.
    pub fn ack_configure(
        &mut self,
        surface: SurfaceId,
        serial: Serial,
    ) -> Result<AckedConfigure, ProtocolError> {
        let xdg = self.xdg_surface_mut(surface)?;
        if !xdg.sent_configures.iter().any(|c| c.serial == serial) {
            return Err(ProtocolError::UnknownConfigureSerial(serial.0));
        }
        let mut acked = None;
        while let Some(sent) = xdg.sent_configures.pop_front() {
            let found = sent.serial == serial;
            acked = Some(sent);
            if found {
                break;
            }
        }
        xdg.last_acked = Some(serial);
        let sent = match acked {
            Some(sent) => sent,
            None => fatal_invariant("configure queue drained without a match"),
        };
        Ok(AckedConfigure {
            serial: sent.serial,
            payload: sent.payload,
            role: xdg.role,
        })
    }

    // ---- toplevels ------------------------------------------------------

    /// Turn an xdg_surface into a toplevel; sets the wl_surface role.
    pub fn get_toplevel(
        &mut self,
        surface: SurfaceId,
        surfaces: &mut SurfaceEngine,
    ) -> Result<ToplevelId, ProtocolError> {
        let client = {
            let xdg = self.xdg_surface_mut(surface)?;
            if xdg.role.is_some() {
                return Err(ProtocolError::RoleAlreadyConstructed);
            }
            xdg.client
        };
        self.next_toplevel += 1;
        let id = ToplevelId(self.next_toplevel);
        surfaces.give_role(surface, SurfaceRole::Toplevel(id))?;
        if let Some(xdg) = self.xdg.get_mut(&surface) {
            xdg.role = Some(XdgRole::Toplevel(id));
        }
        self.toplevels.insert(
            id,
            Toplevel {
                id,
                surface,
                client,
                title: None,
                app_id: None,
                parent: None,
                min_size: Size::default(),
                max_size: Size::default(),
                states: ToplevelStateSet::empty(),
                decoration: DecorationMode::default(),
                modal: false,
                preamble_sent: false,
            },
        );
        tracing::debug!(surface = surface.0, toplevel = id.0, "new toplevel");
        Ok(id)
    }

    pub fn toplevel(&self, id: ToplevelId) -> Option<&Toplevel> {
        self.toplevels.get(&id)
    }

    pub fn toplevel_mut(&mut self, id: ToplevelId) -> Option<&mut Toplevel> {
        self.toplevels.get_mut(&id)
    }

    pub fn toplevels(&self) -> impl Iterator<Item = &Toplevel> {
        self.toplevels.values()
    }

    pub fn set_title(&mut self, id: ToplevelId, title: String) {
        if let Some(toplevel) = self.toplevels.get_mut(&id) {
            toplevel.title = Some(title);
        }
    }

    pub fn set_app_id(&mut self, id: ToplevelId, app_id: String) {
        if let Some(toplevel) = self.toplevels.get_mut(&id) {
            toplevel.app_id = Some(app_id);
        }
    }

    pub fn set_parent(&mut self, id: ToplevelId, parent: Option<ToplevelId>) {
        // A parent loop would hang every descendant walk; drop the request.
        if let Some(parent_id) = parent {
            let mut cursor = Some(parent_id);
            while let Some(current) = cursor {
                if current == id {
                    tracing::warn!(toplevel = id.0, "ignoring cyclic set_parent");
                    return;
                }
                cursor = self.toplevels.get(&current).and_then(|t| t.parent);
            }
        }
        if let Some(toplevel) = self.toplevels.get_mut(&id) {
            toplevel.parent = parent;
        }
    }

    pub fn set_min_size(&mut self, id: ToplevelId, size: Size<i32>) -> Result<(), ProtocolError> {
        if size.w < 0 || size.h < 0 {
            return Err(ProtocolError::InvalidSize(size.w, size.h));
        }
        if let Some(toplevel) = self.toplevels.get_mut(&id) {
            toplevel.min_size = size;
        }
        Ok(())
    }

    pub fn set_max_size(&mut self, id: ToplevelId, size: Size<i32>) -> Result<(), ProtocolError> {
        if size.w < 0 || size.h < 0 {
            return Err(ProtocolError::InvalidSize(size.w, size.h));
        }
        if let Some(toplevel) = self.toplevels.get_mut(&id) {
            toplevel.max_size = size;
        }
        Ok(())
    }

    pub fn set_modal(&mut self, id: ToplevelId, modal: bool) {
        if let Some(toplevel) = self.toplevels.get_mut(&id) {
            toplevel.modal = modal;
        }
    }

    pub fn set_decoration(&mut self, id: ToplevelId, mode: DecorationMode) {
        if let Some(toplevel) = self.toplevels.get_mut(&id) {
            toplevel.decoration = mode;
        }
    }

    /// Send a configure proposing `size` and `states`. A size of (0, 0)
    /// lets the client pick. The first configure is preceded by the bounds
    /// and capabilities preamble.
    pub fn send_configure(
        &mut self,
        id: ToplevelId,
        size: Size<i32>,
        states: ToplevelStateSet,
        bounds: Size<i32>,
        serials: &mut SerialCounter,
        clients: &mut Clients,
    ) -> Option<Serial> {
        let toplevel = self.toplevels.get_mut(&id)?;
        let client = toplevel.client;
        let surface = toplevel.surface;
        if !toplevel.preamble_sent {
            toplevel.preamble_sent = true;
            clients.send(
                client,
                ClientEvent::Toplevel(id, ToplevelEvent::ConfigureBounds { bounds }),
            );
            clients.send(
                client,
                ClientEvent::Toplevel(
                    id,
                    ToplevelEvent::WmCapabilities {
                        capabilities: vec![
                            WmCapability::WindowMenu,
                            WmCapability::Maximize,
                            WmCapability::Fullscreen,
                            WmCapability::Minimize,
                        ],
                    },
                ),
            );
        }
        toplevel.states = states;
        let serial = serials.next_serial();
        if let Some(xdg) = self.xdg.get_mut(&surface) {
            xdg.sent_configures.push_back(SentConfigure {
                serial,
                payload: ConfigurePayload::Toplevel { size, states },
            });
            xdg.last_sent = Some(serial);
        }
        clients.send(
            client,
            ClientEvent::Toplevel(id, ToplevelEvent::Configure { serial, size, states }),
        );
        Some(serial)
    }

    pub fn send_close(&self, id: ToplevelId, clients: &mut Clients) {
        if let Some(toplevel) = self.toplevels.get(&id) {
            clients.send(toplevel.client, ClientEvent::Toplevel(id, ToplevelEvent::Close));
        }
    }

    /// Remove the toplevel record (client destroyed the role object). The
    /// wl_surface keeps its role tag for life.
    pub fn destroy_toplevel(&mut self, id: ToplevelId) -> Option<Toplevel> {
        let toplevel = self.toplevels.remove(&id)?;
        for other in self.toplevels.values_mut() {
            if other.parent == Some(id) {
                other.parent = toplevel.parent;
            }
        }
        if let Some(xdg) = self.xdg.get_mut(&toplevel.surface) {
            xdg.role = None;
            xdg.sent_configures.clear();
        }
        Some(toplevel)
    }

    // ---- popups ---------------------------------------------------------

    /// Turn an xdg_surface into a popup anchored to `parent`.
    pub fn get_popup(
        &mut self,
        surface: SurfaceId,
        parent: Option<PopupParent>,
        positioner: Positioner,
        surfaces: &mut SurfaceEngine,
    ) -> Result<PopupId, ProtocolError> {
        let parent = parent.ok_or(ProtocolError::MissingPopupParent)?;
        if !positioner.is_complete() {
            return Err(ProtocolError::InvalidPositioner);
        }
        let client = {
            let xdg = self.xdg_surface_mut(surface)?;
            if xdg.role.is_some() {
                return Err(ProtocolError::RoleAlreadyConstructed);
            }
            xdg.client
        };
        match parent {
            PopupParent::Toplevel(id) if self.toplevels.contains_key(&id) => {}
            PopupParent::Popup(id) if self.popups.contains_key(&id) => {}
            _ => return Err(ProtocolError::MissingPopupParent),
        }
        self.next_popup += 1;
        let id = PopupId(self.next_popup);
        surfaces.give_role(surface, SurfaceRole::Popup(id))?;
        if let Some(xdg) = self.xdg.get_mut(&surface) {
            xdg.role = Some(XdgRole::Popup(id));
        }
        self.popups.insert(
            id,
            Popup {
                id,
                surface,
                client,
                parent,
                positioner,
                rect: Rectangle::default(),
                grabbed: false,
                dismissed: false,
            },
        );
        tracing::debug!(surface = surface.0, popup = id.0, "new popup");
        Ok(id)
    }

    pub fn popup(&self, id: PopupId) -> Option<&Popup> {
        self.popups.get(&id)
    }

    pub fn popup_mut(&mut self, id: PopupId) -> Option<&mut Popup> {
        self.popups.get_mut(&id)
    }

    pub fn popups(&self) -> impl Iterator<Item = &Popup> {
        self.popups.values()
    }

    /// The surface the popup is anchored to.
    pub fn popup_parent_surface(&self, id: PopupId) -> Option<SurfaceId> {
        match self.popups.get(&id)?.parent {
            PopupParent::Toplevel(parent) => self.toplevels.get(&parent).map(|t| t.surface),
            PopupParent::Popup(parent) => self.popups.get(&parent).map(|p| p.surface),
        }
    }

    /// Take an explicit grab for a popup. Only the topmost popup of a chain
    /// may hold the grab.
    pub fn grab_popup(&mut self, id: PopupId) -> Result<(), ProtocolError> {
        let popup = self.popups.get(&id).ok_or(ProtocolError::NotAnXdgSurface)?;
        let chained_on_top = match (self.grab_chain.last(), popup.parent) {
            (None, PopupParent::Toplevel(_)) => true,
            // A nested grab requires the parent popup to hold the grab.
            (None, PopupParent::Popup(_)) => false,
            (Some(top), PopupParent::Popup(parent)) => *top == parent,
            (Some(_), PopupParent::Toplevel(_)) => false,
        };
        if !chained_on_top || self.grab_chain.contains(&id) {
            return Err(ProtocolError::NotTopmostPopup);
        }
        self.grab_chain.push(id);
        if let Some(popup) = self.popups.get_mut(&id) {
            popup.grabbed = true;
        }
        Ok(())
    }

    pub fn grab_chain(&self) -> &[PopupId] {
        &self.grab_chain
    }

    pub fn topmost_grab(&self) -> Option<PopupId> {
        self.grab_chain.last().copied()
    }

    /// Dismiss `id` and every popup stacked above it. Events go out topmost
    /// first. Returns the dismissed popups.
    pub fn dismiss_from(&mut self, id: PopupId, clients: &mut Clients) -> Vec<PopupId> {
        let index = match self.grab_chain.iter().position(|p| *p == id) {
            Some(index) => index,
            None => {
                // Not part of a grab chain: dismiss just this popup.
                self.dismiss_one(id, clients);
                return vec![id];
            }
        };
        let suffix: Vec<PopupId> = self.grab_chain.split_off(index);
        for popup in suffix.iter().rev() {
            self.dismiss_one(*popup, clients);
        }
        suffix
    }

    fn dismiss_one(&mut self, id: PopupId, clients: &mut Clients) {
        if let Some(popup) = self.popups.get_mut(&id) {
            if !popup.dismissed {
                popup.dismissed = true;
                popup.grabbed = false;
                clients.send(popup.client, ClientEvent::Popup(id, PopupEvent::Done));
            }
        }
    }

    /// Replace the positioner following a reposition request and confirm
    /// with the client's token. The caller re-resolves geometry afterwards.
    pub fn reposition_popup(
        &mut self,
        id: PopupId,
        positioner: Positioner,
        token: u32,
        clients: &mut Clients,
    ) -> Result<(), ProtocolError> {
        if !positioner.is_complete() {
            return Err(ProtocolError::InvalidPositioner);
        }
        let popup = self.popups.get_mut(&id).ok_or(ProtocolError::NotAnXdgSurface)?;
        popup.positioner = positioner;
        clients.send(
            popup.client,
            ClientEvent::Popup(id, PopupEvent::Repositioned { token }),
        );
        Ok(())
    }

    /// Send the popup its resolved geometry.
    pub fn send_popup_configure(
        &mut self,
        id: PopupId,
        rect: Rectangle<i32>,
        serials: &mut SerialCounter,
        clients: &mut Clients,
    ) -> Option<Serial> {
        let popup = self.popups.get_mut(&id)?;
        popup.rect = rect;
        let client = popup.client;
        let surface = popup.surface;
        let serial = serials.next_serial();
        if let Some(xdg) = self.xdg.get_mut(&surface) {
            xdg.sent_configures.push_back(SentConfigure {
                serial,
                payload: ConfigurePayload::Popup { rect },
            });
            xdg.last_sent = Some(serial);
        }
        clients.send(client, ClientEvent::Popup(id, PopupEvent::Configure { serial, rect }));
        Some(serial)
    }

    /// Client destroyed the popup object. Popups must be destroyed top
    /// down: destroying one with a grabbed child is a protocol error.
    pub fn destroy_popup(&mut self, id: PopupId) -> Result<Option<Popup>, ProtocolError> {
        if let Some(index) = self.grab_chain.iter().position(|p| *p == id) {
            if index != self.grab_chain.len() - 1 {
                return Err(ProtocolError::NotTopmostPopup);
            }
            self.grab_chain.pop();
        }
        let popup = self.popups.remove(&id);
        if let Some(popup) = &popup {
            if let Some(xdg) = self.xdg.get_mut(&popup.surface) {
                xdg.role = None;
                xdg.sent_configures.clear();
            }
        }
        Ok(popup)
    }

    // ---- cascades -------------------------------------------------------

    /// The wl_surface went away: drop the shell records hanging off it.
    /// Returns the roles torn down so mechanics can unmap.
    pub fn surface_destroyed(&mut self, surface: SurfaceId, clients: &mut Clients) -> Option<XdgRole> {
        let xdg = self.xdg.remove(&surface)?;
        if let Some(slot) = self.clients.get_mut(&xdg.client) {
            slot.xdg_surfaces.retain(|s| *s != surface);
        }
        match xdg.role {
            Some(XdgRole::Toplevel(id)) => {
                self.toplevels.remove(&id);
                Some(XdgRole::Toplevel(id))
            }
            Some(XdgRole::Popup(id)) => {
                self.dismiss_from(id, clients);
                self.popups.remove(&id);
                Some(XdgRole::Popup(id))
            }
            None => None,
        }
    }

    /// Tear down everything a departing client owned.
    pub fn remove_client(&mut self, client: ClientId, clients: &mut Clients) -> Vec<XdgRole> {
        let surfaces: Vec<SurfaceId> = self
            .clients
            .get(&client)
            .map(|slot| slot.xdg_surfaces.clone())
            .unwrap_or_default();
        let mut roles = Vec::new();
        for surface in surfaces {
            if let Some(role) = self.surface_destroyed(surface, clients) {
                roles.push(role);
            }
        }
        self.clients.remove(&client);
        roles
    }
}
