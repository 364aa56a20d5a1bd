//! The surface engine: per-client state, per-surface double-buffered state,
//! roles, subsurface trees and the commit pipeline.
//!
//! Surfaces are the fundamental drawable primitive. Everything a client
//! requests lands in pending state; nothing is visible until `commit`
//! atomically promotes pending to current. Role-specific commit behavior is
//! dispatched by the state-level orchestrator between [`SurfaceEngine::apply_commit`]
//! and [`SurfaceEngine::finish_commit`].

use crate::buffer::{BufferId, Buffers};
use crate::geometry::{Point, Rectangle, Region, Size, Transform};
use crate::protocol::{fatal_invariant, ClientId, ProtocolError};
use crate::renderer::TextureId;
use crate::shell::{PopupId, ToplevelId};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u64);

/// State of a subsurface role: parent link, commit mode and the state cached
/// while synchronized.
#[derive(Default)]
pub struct SubsurfaceState {
    pub parent: Option<SurfaceId>,
    pub sync: bool,
    pub position: Point<i32>,
    cached: Option<Box<PendingState>>,
}

impl std::fmt::Debug for SubsurfaceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubsurfaceState")
            .field("parent", &self.parent)
            .field("sync", &self.sync)
            .field("position", &self.position)
            .field("cached", &self.cached.is_some())
            .finish()
    }
}

/// The role of a surface. At most one role is ever set, and it never
/// changes for the surface's lifetime.
#[derive(Debug)]
pub enum SurfaceRole {
    Toplevel(ToplevelId),
    Popup(PopupId),
    Cursor,
    Subsurface(SubsurfaceState),
}

impl SurfaceRole {
    pub fn name(&self) -> &'static str {
        match self {
            SurfaceRole::Toplevel(_) => "xdg_toplevel",
            SurfaceRole::Popup(_) => "xdg_popup",
            SurfaceRole::Cursor => "cursor",
            SurfaceRole::Subsurface(_) => "subsurface",
        }
    }

    fn same_as(&self, other: &SurfaceRole) -> bool {
        match (self, other) {
            (SurfaceRole::Toplevel(a), SurfaceRole::Toplevel(b)) => a == b,
            (SurfaceRole::Popup(a), SurfaceRole::Popup(b)) => a == b,
            (SurfaceRole::Cursor, SurfaceRole::Cursor) => true,
            (SurfaceRole::Subsurface(a), SurfaceRole::Subsurface(b)) => a.parent == b.parent,
            _ => false,
        }
    }
}

/// What the client asked to do with the buffer since the last commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum BufferAssignment {
    #[default]
    Keep,
    Attach(BufferId),
    Detach,
}

/// Accumulated pending state, promoted to current on commit.
#[derive(Debug, Clone, Default)]
pub struct PendingState {
    buffer: BufferAssignment,
    damage_buffer: Region,
    damage_surface: Region,
    scale: Option<i32>,
    transform: Option<Transform>,
    opaque_region: Option<Option<Region>>,
    input_region: Option<Option<Region>>,
    frame_callbacks: Vec<u32>,
}

impl PendingState {
    fn is_empty(&self) -> bool {
        self.buffer == BufferAssignment::Keep
            && self.damage_buffer.is_empty()
            && self.damage_surface.is_empty()
            && self.scale.is_none()
            && self.transform.is_none()
            && self.opaque_region.is_none()
            && self.input_region.is_none()
            && self.frame_callbacks.is_empty()
    }

    /// Fold `newer` on top of `self` (used for the synchronized-subsurface
    /// cache, which may absorb several commits before the parent commits).
    fn absorb(&mut self, newer: PendingState) {
        if newer.buffer != BufferAssignment::Keep {
            self.buffer = newer.buffer;
        }
        self.damage_buffer.union(&newer.damage_buffer);
        self.damage_surface.union(&newer.damage_surface);
        if newer.scale.is_some() {
            self.scale = newer.scale;
        }
        if newer.transform.is_some() {
            self.transform = newer.transform;
        }
        if newer.opaque_region.is_some() {
            self.opaque_region = newer.opaque_region;
        }
        if newer.input_region.is_some() {
            self.input_region = newer.input_region;
        }
        self.frame_callbacks.extend(newer.frame_callbacks);
    }
}

/// The committed, current state of a surface.
#[derive(Debug, Clone)]
pub struct SurfaceData {
    pub buffer: Option<BufferId>,
    pub buffer_size: Size<i32>,
    pub scale: i32,
    pub transform: Transform,
    /// Accumulated damage in surface-local coordinates, drained by the
    /// renderer.
    pub damage: Region,
    pub opaque_region: Option<Region>,
    pub input_region: Option<Region>,
}

impl Default for SurfaceData {
    fn default() -> Self {
        Self {
            buffer: None,
            buffer_size: Size::default(),
            scale: 1,
            transform: Transform::Normal,
            damage: Region::new(),
            opaque_region: None,
            input_region: None,
        }
    }
}

impl SurfaceData {
    /// Size of the surface in surface-local coordinates: the buffer size
    /// after transform and scale.
    pub fn surface_size(&self) -> Size<i32> {
        let t = self.transform.transform_size(self.buffer_size);
        let scale = self.scale.max(1);
        Size::new((t.w + scale - 1) / scale, (t.h + scale - 1) / scale)
    }

    pub fn bounds(&self) -> Rectangle<i32> {
        Rectangle::new(Point::new(0, 0), self.surface_size())
    }

    /// Whether the given surface-local point accepts input. A missing input
    /// region means the whole surface does.
    pub fn accepts_input(&self, point: Point<i32>) -> bool {
        if !self.bounds().contains(point) {
            return false;
        }
        match &self.input_region {
            Some(region) => region.contains(point),
            None => true,
        }
    }
}

type PreCommitHook = Box<dyn FnMut(&mut Surface) -> Result<(), ProtocolError>>;
type SurfaceHook = Box<dyn FnMut(&mut Surface)>;

#[derive(Default)]
struct SurfaceHooks {
    pre_commit: Vec<PreCommitHook>,
    post_commit: Vec<SurfaceHook>,
    destruction: Vec<SurfaceHook>,
}

pub struct Surface {
    pub id: SurfaceId,
    pub client: ClientId,
    /// Subsurface children, bottom to top.
    pub children: Vec<SurfaceId>,
    role: Option<SurfaceRole>,
    pub current: SurfaceData,
    pending: PendingState,
    pub texture: Option<TextureId>,
    hooks: SurfaceHooks,
}

impl Surface {
    pub fn role(&self) -> Option<&SurfaceRole> {
        self.role.as_ref()
    }

    pub fn role_mut(&mut self) -> Option<&mut SurfaceRole> {
        self.role.as_mut()
    }

    pub fn subsurface(&self) -> Option<&SubsurfaceState> {
        match &self.role {
            Some(SurfaceRole::Subsurface(state)) => Some(state),
            _ => None,
        }
    }

    fn subsurface_mut(&mut self) -> Option<&mut SubsurfaceState> {
        match &mut self.role {
            Some(SurfaceRole::Subsurface(state)) => Some(state),
            _ => None,
        }
    }

    pub fn parent(&self) -> Option<SurfaceId> {
        self.subsurface().and_then(|s| s.parent)
    }
}

/// Per-client surface slot. Created when the client binds the compositor
/// global; its absence on any later request is an implementation bug.
#[derive(Debug, Default)]
pub struct ClientSurfaces {
    pub surfaces: Vec<SurfaceId>,
}

/// Result of promoting pending state on a commit.
#[derive(Debug, Default)]
pub struct CommitOutcome {
    /// The commit was cached (synchronized subsurface); nothing applied.
    pub stashed: bool,
    /// `Some(Some(_))`: a new buffer is current. `Some(None)`: detached.
    pub new_buffer: Option<Option<BufferId>>,
    /// Previous buffer, if it was replaced or detached; released by caller.
    pub replaced_buffer: Option<BufferId>,
    /// No new damage was accumulated by this commit.
    pub damage_empty: bool,
    pub frame_callbacks: Vec<u32>,
}

/// The surface engine: object registry and commit pipeline.
#[derive(Default)]
pub struct SurfaceEngine {
    surfaces: HashMap<SurfaceId, Surface>,
    clients: HashMap<ClientId, ClientSurfaces>,
    next_id: u64,
    next_callback: u32,
}

impl SurfaceEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a client to the surface-creation global, creating its state
    /// slot. Idempotent.
    pub fn bind_client(&mut self, client: ClientId) {
        self.clients.entry(client).or_default();
    }

    pub fn has_client(&self, client: ClientId) -> bool {
        self.clients.contains_key(&client)
    }

    /// The per-client slot. Missing slot on a bound client's request is a
    /// fatal invariant (spec: protocol abuse cannot reach here; the slot is
    /// created at bind time).
    pub fn client_slot(&self, client: ClientId) -> &ClientSurfaces {
        match self.clients.get(&client) {
            Some(slot) => slot,
            None => fatal_invariant(&format!("no surface slot for client {}", client.0)),
        }
    }

    fn client_slot_mut(&mut self, client: ClientId) -> &mut ClientSurfaces {
        match self.clients.get_mut(&client) {
            Some(slot) => slot,
            None => fatal_invariant(&format!("no surface slot for client {}", client.0)),
        }
    }

    pub fn create_surface(&mut self, client: ClientId) -> SurfaceId {
        self.next_id += 1;
        let id = SurfaceId(self.next_id);
        self.client_slot_mut(client).surfaces.push(id);
        self.surfaces.insert(
            id,
            Surface {
                id,
                client,
                children: Vec::new(),
                role: None,
                current: SurfaceData::default(),
                pending: PendingState::default(),
                texture: None,
                hooks: SurfaceHooks::default(),
            },
        );
        tracing::trace!(surface = id.0, client = client.0, "surface created");
        id
    }

    pub fn get(&self, id: SurfaceId) -> Option<&Surface> {
        self.surfaces.get(&id)
    }

    pub fn get_mut(&mut self, id: SurfaceId) -> Option<&mut Surface> {
        self.surfaces.get_mut(&id)
    }

    pub fn alive(&self, id: SurfaceId) -> bool {
        self.surfaces.contains_key(&id)
    }

    /// The surface record, which must exist: commit-time lookups hitting a
    /// missing record indicate an internal bug, not client misbehavior.
    fn surface_mut(&mut self, id: SurfaceId) -> &mut Surface {
        match self.surfaces.get_mut(&id) {
            Some(surface) => surface,
            None => fatal_invariant(&format!("surface {} has no state record", id.0)),
        }
    }

    // ---- pending state accumulation -------------------------------------

    /// Attach a buffer (pending). `None` detaches. An attached buffer with
    /// no pixels also detaches.
    pub fn attach(&mut self, id: SurfaceId, buffer: Option<BufferId>, buffers: &Buffers) {
        let assignment = match buffer {
            None => BufferAssignment::Detach,
            Some(buffer) => match buffers.size_of(buffer) {
                Some(size) if !size.is_empty() => BufferAssignment::Attach(buffer),
                _ => BufferAssignment::Detach,
            },
        };
        self.surface_mut(id).pending.buffer = assignment;
    }

    /// Accumulate damage in buffer coordinates (pending).
    pub fn damage_buffer(&mut self, id: SurfaceId, rect: Rectangle<i32>) {
        self.surface_mut(id).pending.damage_buffer.add(rect);
    }

    /// Accumulate damage in surface-local coordinates (pending).
    pub fn damage(&mut self, id: SurfaceId, rect: Rectangle<i32>) {
        self.surface_mut(id).pending.damage_surface.add(rect);
    }

    pub fn set_opaque_region(&mut self, id: SurfaceId, region: Option<Region>) {
        self.surface_mut(id).pending.opaque_region = Some(region);
    }

    pub fn set_input_region(&mut self, id: SurfaceId, region: Option<Region>) {
        self.surface_mut(id).pending.input_region = Some(region);
    }

    pub fn set_buffer_scale(&mut self, id: SurfaceId, scale: i32) -> Result<(), ProtocolError> {
        if scale < 1 {
            return Err(ProtocolError::InvalidScale(scale));
        }
        self.surface_mut(id).pending.scale = Some(scale);
        Ok(())
    }

    pub fn set_buffer_transform(&mut self, id: SurfaceId, transform: Transform) {
        self.surface_mut(id).pending.transform = Some(transform);
    }

    /// Request a frame callback, fired when the next frame containing this
    /// surface is presented.
    pub fn frame(&mut self, id: SurfaceId) -> u32 {
        self.next_callback += 1;
        let callback = self.next_callback;
        self.surface_mut(id).pending.frame_callbacks.push(callback);
        callback
    }

    // ---- roles ----------------------------------------------------------

    /// Assign a role. Fails if a different role is already set; succeeds
    /// idempotently for the same role.
    pub fn give_role(&mut self, id: SurfaceId, role: SurfaceRole) -> Result<(), ProtocolError> {
        let surface = self.surface_mut(id);
        match &surface.role {
            None => {
                surface.role = Some(role);
                Ok(())
            }
            Some(existing) if existing.same_as(&role) => Ok(()),
            Some(existing) => Err(ProtocolError::RoleTaken {
                existing: existing.name(),
                requested: role.name(),
            }),
        }
    }

    pub fn role(&self, id: SurfaceId) -> Option<&SurfaceRole> {
        self.surfaces.get(&id).and_then(|s| s.role())
    }

    // ---- subsurfaces ----------------------------------------------------

    /// Establish a subsurface relationship. The child takes the subsurface
    /// role; cycles are rejected as role errors.
    pub fn add_subsurface(
        &mut self,
        child: SurfaceId,
        parent: SurfaceId,
    ) -> Result<(), ProtocolError> {
        if child == parent || self.ancestors(parent).contains(&child) {
            return Err(ProtocolError::RoleTaken {
                existing: "ancestor",
                requested: "subsurface",
            });
        }
        self.give_role(
            child,
            SurfaceRole::Subsurface(SubsurfaceState {
                parent: Some(parent),
                // Subsurfaces start synchronized.
                sync: true,
                position: Point::new(0, 0),
                cached: None,
            }),
        )?;
        let parent_surface = self.surface_mut(parent);
        if !parent_surface.children.contains(&child) {
            parent_surface.children.push(child);
        }
        Ok(())
    }

    /// Dissolve the relationship (subsurface object destroyed). The child
    /// surface survives but is no longer composited with the parent.
    pub fn remove_subsurface(&mut self, child: SurfaceId) {
        let parent = match self.surfaces.get(&child).and_then(|s| s.parent()) {
            Some(parent) => parent,
            None => return,
        };
        if let Some(state) = self.surface_mut(child).subsurface_mut() {
            state.parent = None;
            state.cached = None;
        }
        if let Some(parent_surface) = self.surfaces.get_mut(&parent) {
            parent_surface.children.retain(|c| *c != child);
        }
    }

    pub fn set_subsurface_sync(&mut self, child: SurfaceId, sync: bool) {
        if let Some(state) = self.surface_mut(child).subsurface_mut() {
            state.sync = sync;
        }
    }

    pub fn set_subsurface_position(&mut self, child: SurfaceId, position: Point<i32>) {
        if let Some(state) = self.surface_mut(child).subsurface_mut() {
            state.position = position;
        }
    }

    /// Synchronized-mode resolution: a subsurface is effectively sync if its
    /// own flag is set or any ancestor subsurface is synchronized.
    pub fn effective_sync(&self, id: SurfaceId) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            match self.surfaces.get(&current).and_then(|s| s.subsurface()) {
                Some(state) => {
                    if state.sync {
                        return true;
                    }
                    cursor = state.parent;
                }
                None => return false,
            }
        }
        false
    }

    // ---- hooks ----------------------------------------------------------

    pub fn add_pre_commit_hook(&mut self, id: SurfaceId, hook: PreCommitHook) {
        self.surface_mut(id).hooks.pre_commit.push(hook);
    }

    pub fn add_post_commit_hook(&mut self, id: SurfaceId, hook: SurfaceHook) {
        self.surface_mut(id).hooks.post_commit.push(hook);
    }

    pub fn add_destruction_hook(&mut self, id: SurfaceId, hook: SurfaceHook) {
        self.surface_mut(id).hooks.destruction.push(hook);
    }

    // ---- commit pipeline ------------------------------------------------

    /// Step 1: pre-commit hooks, in registration order. Any may abort the
    /// commit with a client-visible protocol error.
    pub fn begin_commit(&mut self, id: SurfaceId) -> Result<(), ProtocolError> {
        let surface = self.surface_mut(id);
        let mut hooks = std::mem::take(&mut surface.hooks.pre_commit);
        let mut result = Ok(());
        for hook in &mut hooks {
            if let Err(err) = hook(surface) {
                result = Err(err);
                break;
            }
        }
        surface.hooks.pre_commit = hooks;
        result
    }

    /// Steps 2–4: promote pending state to current, translating damage into
    /// surface coordinates. For an effectively synchronized subsurface the
    /// pending state is stashed instead, to be applied when the parent
    /// commits.
    pub fn apply_commit(&mut self, id: SurfaceId, buffers: &Buffers) -> CommitOutcome {
        if self.effective_sync(id) {
            let surface = self.surface_mut(id);
            let pending = std::mem::take(&mut surface.pending);
            if let Some(state) = surface.subsurface_mut() {
                match &mut state.cached {
                    Some(cached) => cached.absorb(pending),
                    None => state.cached = Some(Box::new(pending)),
                }
            }
            return CommitOutcome {
                stashed: true,
                damage_empty: true,
                ..CommitOutcome::default()
            };
        }
        let pending = std::mem::take(&mut self.surface_mut(id).pending);
        self.promote(id, pending, buffers)
    }

    /// Apply the state cached while synchronized (parent committed).
    pub fn apply_cached(&mut self, id: SurfaceId, buffers: &Buffers) -> Option<CommitOutcome> {
        let cached = self.surface_mut(id).subsurface_mut()?.cached.take()?;
        Some(self.promote(id, *cached, buffers))
    }

    fn promote(&mut self, id: SurfaceId, pending: PendingState, buffers: &Buffers) -> CommitOutcome {
        let no_pending = pending.is_empty();
        let surface = self.surface_mut(id);
        let mut outcome = CommitOutcome::default();

        // Buffer, scale and transform first: damage translation below uses
        // the post-commit values.
        match pending.buffer {
            BufferAssignment::Keep => {}
            BufferAssignment::Attach(buffer) => {
                let old = surface.current.buffer;
                if old != Some(buffer) {
                    outcome.replaced_buffer = old;
                }
                surface.current.buffer = Some(buffer);
                surface.current.buffer_size =
                    buffers.size_of(buffer).unwrap_or_default();
                outcome.new_buffer = Some(Some(buffer));
            }
            BufferAssignment::Detach => {
                outcome.replaced_buffer = surface.current.buffer.take();
                surface.current.buffer_size = Size::default();
                outcome.new_buffer = Some(None);
            }
        }
        if let Some(scale) = pending.scale {
            surface.current.scale = scale;
        }
        if let Some(transform) = pending.transform {
            surface.current.transform = transform;
        }

        // Damage: buffer-coordinate damage is translated with the (possibly
        // new) scale and transform, then merged with surface-coordinate
        // damage and clipped to the surface extent.
        let mut new_damage = pending.damage_buffer.buffer_to_surface(
            surface.current.buffer_size,
            surface.current.transform,
            surface.current.scale,
        );
        new_damage.union(&pending.damage_surface);
        new_damage.clip_to(surface.current.bounds());
        outcome.damage_empty = new_damage.is_empty();
        surface.current.damage.union(&new_damage);

        if let Some(opaque) = pending.opaque_region {
            surface.current.opaque_region = opaque.map(|mut region| {
                region.clip_to(surface.current.bounds());
                region
            });
        }
        if let Some(input) = pending.input_region {
            surface.current.input_region = input;
        }
        outcome.frame_callbacks = pending.frame_callbacks;
        if no_pending {
            outcome.damage_empty = true;
        }
        outcome
    }

    /// Step 6: post-commit hooks, in registration order.
    pub fn finish_commit(&mut self, id: SurfaceId) {
        let surface = self.surface_mut(id);
        let mut hooks = std::mem::take(&mut surface.hooks.post_commit);
        for hook in &mut hooks {
            hook(surface);
        }
        surface.hooks.post_commit = hooks;
    }

    /// Drain accumulated damage for rendering.
    pub fn take_damage(&mut self, id: SurfaceId) -> Region {
        std::mem::take(&mut self.surface_mut(id).current.damage)
    }

    // ---- tree walks -----------------------------------------------------

    /// Pre-order walk downwards: the surface, then its subsurface children
    /// bottom-to-top, recursively.
    pub fn walk_down(&self, root: SurfaceId) -> Vec<SurfaceId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if let Some(surface) = self.surfaces.get(&id) {
                out.push(id);
                for child in surface.children.iter().rev() {
                    stack.push(*child);
                }
            }
        }
        out
    }

    /// Walk upwards: the surface, then each ancestor in order.
    pub fn walk_up(&self, leaf: SurfaceId) -> Vec<SurfaceId> {
        let mut out = vec![leaf];
        out.extend(self.ancestors(leaf));
        out
    }

    fn ancestors(&self, id: SurfaceId) -> Vec<SurfaceId> {
        let mut out = Vec::new();
        let mut cursor = self.surfaces.get(&id).and_then(|s| s.parent());
        while let Some(parent) = cursor {
            if out.contains(&parent) {
                break;
            }
            out.push(parent);
            cursor = self.surfaces.get(&parent).and_then(|s| s.parent());
        }
        out
    }

    // ---- destruction ----------------------------------------------------

    /// Destroy a surface: destruction hooks run first, then the record is
    /// unlinked from its parent and client slot. Returns the texture and
    /// buffer that were attached, for the caller to release.
    pub fn destroy_surface(&mut self, id: SurfaceId) -> Option<DestroyedSurface> {
        if !self.surfaces.contains_key(&id) {
            return None;
        }
        {
            let surface = self.surface_mut(id);
            let mut hooks = std::mem::take(&mut surface.hooks.destruction);
            for hook in &mut hooks {
                hook(surface);
            }
        }
        let parent = self.surfaces.get(&id).and_then(|s| s.parent());
        if let Some(parent) = parent {
            if let Some(parent_surface) = self.surfaces.get_mut(&parent) {
                parent_surface.children.retain(|c| *c != id);
            }
        }
        let surface = self.surfaces.remove(&id)?;
        // Orphan subsurface children; they become inert.
        for child in &surface.children {
            if let Some(child_surface) = self.surfaces.get_mut(child) {
                if let Some(state) = child_surface.subsurface_mut() {
                    state.parent = None;
                    state.cached = None;
                }
            }
        }
        if let Some(slot) = self.clients.get_mut(&surface.client) {
            slot.surfaces.retain(|s| *s != id);
        }
        tracing::trace!(surface = id.0, "surface destroyed");
        Some(DestroyedSurface {
            client: surface.client,
            buffer: surface.current.buffer,
            texture: surface.texture,
        })
    }

    /// A buffer was destroyed by its client: every surface referencing it
    /// drops the reference and its texture handle. Returns the affected
    /// surfaces with the textures to release.
    pub fn buffer_destroyed(&mut self, buffer: BufferId) -> Vec<(SurfaceId, Option<TextureId>)> {
        let mut affected = Vec::new();
        for surface in self.surfaces.values_mut() {
            let mut touched = false;
            if surface.current.buffer == Some(buffer) {
                surface.current.buffer = None;
                touched = true;
            }
            if surface.pending.buffer == BufferAssignment::Attach(buffer) {
                surface.pending.buffer = BufferAssignment::Keep;
                touched = true;
            }
            if touched {
                affected.push((surface.id, surface.texture.take()));
            }
        }
        affected
    }

    /// Tear down everything a departing client owned. Returns destruction
    /// records in child-before-parent order.
    pub fn remove_client(&mut self, client: ClientId) -> Vec<(SurfaceId, DestroyedSurface)> {
        let owned: Vec<SurfaceId> = self
            .clients
            .get(&client)
            .map(|slot| slot.surfaces.clone())
            .unwrap_or_default();
        let mut destroyed = Vec::new();
        for id in owned.into_iter().rev() {
            if let Some(record) = self.destroy_surface(id) {
                destroyed.push((id, record));
            }
        }
        self.clients.remove(&client);
        destroyed
    }

    pub fn surfaces_of_client(&self, client: ClientId) -> Vec<SurfaceId> {
        self.client_slot(client).surfaces.clone()
    }
}

/// What was attached to a destroyed surface.
#[derive(Debug)]
pub struct DestroyedSurface {
    pub client: ClientId,
    pub buffer: Option<BufferId>,
    pub texture: Option<TextureId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::create_sealed_memfd;

    fn engine_with_client() -> (SurfaceEngine, ClientId) {
        let mut engine = SurfaceEngine::new();
        let client = ClientId(1);
        engine.bind_client(client);
        (engine, client)
    }

    fn make_buffer(buffers: &mut Buffers, client: ClientId, w: i32, h: i32) -> BufferId {
        let size = (w * h * 4) as usize;
        let fd = create_sealed_memfd("test", &vec![0u8; size]).unwrap();
        let pool = buffers.create_pool(client, fd, size as i32).unwrap();
        buffers.create_buffer(client, pool, 0, w, h, w * 4, 0).unwrap()
    }

    #[test]
    fn role_is_set_once() {
        let (mut engine, client) = engine_with_client();
        let surface = engine.create_surface(client);

        engine
            .give_role(surface, SurfaceRole::Toplevel(ToplevelId(1)))
            .unwrap();
        // Idempotent for the same role.
        engine
            .give_role(surface, SurfaceRole::Toplevel(ToplevelId(1)))
            .unwrap();
        // A different role fails.
        let err = engine.give_role(surface, SurfaceRole::Cursor).unwrap_err();
        assert!(matches!(err, ProtocolError::RoleTaken { .. }));
    }

    #[test]
    fn commit_promotes_pending() {
        let (mut engine, client) = engine_with_client();
        let mut buffers = Buffers::new();
        let surface = engine.create_surface(client);
        let buffer = make_buffer(&mut buffers, client, 8, 8);

        engine.attach(surface, Some(buffer), &buffers);
        engine.damage_buffer(surface, Rectangle::from_coords(0, 0, 8, 8));
        assert!(engine.get(surface).unwrap().current.buffer.is_none());

        engine.begin_commit(surface).unwrap();
        let outcome = engine.apply_commit(surface, &buffers);
        engine.finish_commit(surface);

        assert_eq!(outcome.new_buffer, Some(Some(buffer)));
        assert!(!outcome.damage_empty);
        let current = &engine.get(surface).unwrap().current;
        assert_eq!(current.buffer, Some(buffer));
        assert_eq!(current.buffer_size, Size::new(8, 8));
    }

    #[test]
    fn commit_with_no_pending_state_is_empty() {
        let (mut engine, client) = engine_with_client();
        let buffers = Buffers::new();
        let surface = engine.create_surface(client);

        engine.begin_commit(surface).unwrap();
        let outcome = engine.apply_commit(surface, &buffers);
        assert!(outcome.damage_empty);
        assert!(outcome.new_buffer.is_none());
    }

    #[test]
    fn pre_commit_hook_aborts() {
        let (mut engine, client) = engine_with_client();
        let surface = engine.create_surface(client);
        engine.add_pre_commit_hook(
            surface,
            Box::new(|_| Err(ProtocolError::InvalidPositioner)),
        );
        assert!(engine.begin_commit(surface).is_err());
    }

    #[test]
    fn sync_subsurface_stashes_until_parent_commit() {
        let (mut engine, client) = engine_with_client();
        let mut buffers = Buffers::new();
        let parent = engine.create_surface(client);
        let child = engine.create_surface(client);
        engine.add_subsurface(child, parent).unwrap();

        let buffer = make_buffer(&mut buffers, client, 4, 4);
        engine.attach(child, Some(buffer), &buffers);
        engine.begin_commit(child).unwrap();
        let outcome = engine.apply_commit(child, &buffers);
        assert!(outcome.stashed);
        assert!(engine.get(child).unwrap().current.buffer.is_none());

        // Parent commit applies the cache.
        let cached = engine.apply_cached(child, &buffers).unwrap();
        assert_eq!(cached.new_buffer, Some(Some(buffer)));
        assert_eq!(engine.get(child).unwrap().current.buffer, Some(buffer));
    }

    #[test]
    fn desync_subsurface_commits_directly() {
        let (mut engine, client) = engine_with_client();
        let mut buffers = Buffers::new();
        let parent = engine.create_surface(client);
        let child = engine.create_surface(client);
        engine.add_subsurface(child, parent).unwrap();
        engine.set_subsurface_sync(child, false);

        let buffer = make_buffer(&mut buffers, client, 4, 4);
        engine.attach(child, Some(buffer), &buffers);
        let outcome = engine.apply_commit(child, &buffers);
        assert!(!outcome.stashed);
        assert_eq!(engine.get(child).unwrap().current.buffer, Some(buffer));
    }

    #[test]
    fn damage_translated_to_surface_coordinates() {
        let (mut engine, client) = engine_with_client();
        let mut buffers = Buffers::new();
        let surface = engine.create_surface(client);
        let buffer = make_buffer(&mut buffers, client, 16, 16);

        engine.attach(surface, Some(buffer), &buffers);
        engine.set_buffer_scale(surface, 2).unwrap();
        engine.damage_buffer(surface, Rectangle::from_coords(4, 4, 8, 8));
        engine.apply_commit(surface, &buffers);

        let current = &engine.get(surface).unwrap().current;
        assert_eq!(current.surface_size(), Size::new(8, 8));
        assert!(current.damage.contains(Point::new(2, 2)));
        assert!(!current.damage.contains(Point::new(7, 7)));
    }

    #[test]
    fn buffer_destruction_cascades() {
        let (mut engine, client) = engine_with_client();
        let mut buffers = Buffers::new();
        let surface = engine.create_surface(client);
        let buffer = make_buffer(&mut buffers, client, 4, 4);
        engine.attach(surface, Some(buffer), &buffers);
        engine.apply_commit(surface, &buffers);
        engine.get_mut(surface).unwrap().texture = Some(TextureId(9));

        let affected = engine.buffer_destroyed(buffer);
        assert_eq!(affected.len(), 1);
        assert_eq!(affected[0], (surface, Some(TextureId(9))));
        assert!(engine.get(surface).unwrap().current.buffer.is_none());
    }

    #[test]
    fn destruction_hooks_run() {
        use std::cell::Cell;
        use std::rc::Rc;
        let (mut engine, client) = engine_with_client();
        let surface = engine.create_surface(client);
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        engine.add_destruction_hook(surface, Box::new(move |_| flag.set(true)));
        engine.destroy_surface(surface);
        assert!(fired.get());
    }

    #[test]
    fn tree_walk_is_preorder() {
        let (mut engine, client) = engine_with_client();
        let root = engine.create_surface(client);
        let a = engine.create_surface(client);
        let b = engine.create_surface(client);
        let a1 = engine.create_surface(client);
        engine.add_subsurface(a, root).unwrap();
        engine.add_subsurface(b, root).unwrap();
        engine.add_subsurface(a1, a).unwrap();

        assert_eq!(engine.walk_down(root), vec![root, a, a1, b]);
        assert_eq!(engine.walk_up(a1), vec![a1, a, root]);
    }

    #[test]
    fn subsurface_cycles_rejected() {
        let (mut engine, client) = engine_with_client();
        let a = engine.create_surface(client);
        let b = engine.create_surface(client);
        engine.add_subsurface(b, a).unwrap();
        assert!(engine.add_subsurface(a, b).is_err());
    }

    #[test]
    #[should_panic]
    fn missing_client_slot_is_fatal() {
        let mut engine = SurfaceEngine::new();
        engine.create_surface(ClientId(99));
    }
}
