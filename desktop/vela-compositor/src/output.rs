//! The output engine: the set of logical outputs, the output-set serial,
//! head broadcasts to management clients, power handles and hot-plug.
//!
//! Multi-head configuration transactions live in `output_config.rs` as
//! further `impl OutputEngine` blocks.

use crate::geometry::{Point, Rectangle, Size, Transform};
use crate::output_config::{ConfigurationId, OutputConfiguration};
use crate::protocol::{ClientEvent, ClientId, Clients};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputId(pub u32);

/// A display mode. Refresh is in millihertz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode {
    pub size: Size<i32>,
    pub refresh_mhz: i32,
    pub preferred: bool,
}

impl Mode {
    /// Same timing, ignoring the preferred flag.
    pub fn same_timing(&self, other: &Mode) -> bool {
        self.size == other.size && self.refresh_mhz == other.refresh_mhz
    }
}

/// Output power state. The wire protocol exposes only on and off;
/// standby and suspend are compositor-internal substates of "not on".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerState {
    #[default]
    On,
    Standby,
    Suspend,
    Off,
}

impl PowerState {
    pub fn is_on(self) -> bool {
        matches!(self, PowerState::On)
    }
}

/// A physical or logical display.
#[derive(Debug, Clone)]
pub struct Output {
    pub id: OutputId,
    pub name: String,
    pub description: String,
    pub make: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
    pub physical_size_mm: Size<i32>,
    pub modes: Vec<Mode>,
    pub current_mode: Option<Mode>,
    /// Set when the current mode is not drawn from the supported set.
    pub custom_mode: bool,
    /// Position in global logical coordinates.
    pub position: Point<i32>,
    pub transform: Transform,
    pub scale: f64,
    pub enabled: bool,
    pub power: PowerState,
    pub adaptive_sync: bool,
    /// Cleared by the render pass.
    pub needs_redraw: bool,
}

impl Output {
    /// The output's rectangle in global logical coordinates.
    pub fn logical_geometry(&self) -> Option<Rectangle<i32>> {
        let mode = self.current_mode?;
        let size = self.transform.transform_size(mode.size);
        let scale = if self.scale > 0.0 { self.scale } else { 1.0 };
        Some(Rectangle::new(
            self.position,
            Size::new(
                (size.w as f64 / scale).round() as i32,
                (size.h as f64 / scale).round() as i32,
            ),
        ))
    }

    pub fn head_info(&self) -> HeadInfo {
        HeadInfo {
            output: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            make: self.make.clone(),
            model: self.model.clone(),
            serial_number: self.serial_number.clone(),
            physical_size_mm: self.physical_size_mm,
            enabled: self.enabled,
            current_mode: self.current_mode,
            position: self.position,
            transform: self.transform,
            scale: self.scale,
            adaptive_sync: self.adaptive_sync,
            modes: self.modes.clone(),
        }
    }
}

/// Everything the management protocol exposes about one head.
#[derive(Debug, Clone)]
pub struct HeadInfo {
    pub output: OutputId,
    pub name: String,
    pub description: String,
    pub make: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
    pub physical_size_mm: Size<i32>,
    pub enabled: bool,
    pub current_mode: Option<Mode>,
    pub position: Point<i32>,
    pub transform: Transform,
    pub scale: f64,
    pub adaptive_sync: bool,
    pub modes: Vec<Mode>,
}

/// Events delivered to output-management and power clients.
#[derive(Debug, Clone)]
pub enum OutputEvent {
    Head { info: HeadInfo },
    /// Ends a head burst; carries the output-set serial the burst describes.
    Done { serial: u64 },
    HeadFinished { output: OutputId },
    PowerMode { output: OutputId, on: bool },
    /// The power handle is defunct (duplicate handle or output removal).
    PowerFailed { output: OutputId },
}

/// A head's fully resolved target state, handed to the display backend.
#[derive(Debug, Clone)]
pub struct AppliedHeadChange {
    pub output: OutputId,
    pub enable: bool,
    pub mode: Option<Mode>,
    pub position: Point<i32>,
    pub transform: Transform,
    pub scale: f64,
    pub adaptive_sync: bool,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("output commit failed: {0}")]
    Commit(String),
    #[error("power change failed: {0}")]
    Power(String),
}

/// The display backend the engine drives. Prefer atomic batched commits;
/// the engine falls back to sequential commits with rollback otherwise.
pub trait OutputBackend {
    fn supports_atomic(&self) -> bool;

    fn commit_atomic(&mut self, changes: &[AppliedHeadChange]) -> Result<(), BackendError>;

    fn commit_single(&mut self, change: &AppliedHeadChange) -> Result<(), BackendError>;

    fn set_power(&mut self, output: OutputId, on: bool) -> Result<(), BackendError>;
}

/// Backend stub for tests and headless runs. Can be told to fail specific
/// heads to exercise the rollback path.
#[derive(Debug, Default)]
pub struct NullOutputBackend {
    pub atomic: bool,
    pub fail_outputs: Vec<OutputId>,
    pub commits: u64,
}

impl OutputBackend for NullOutputBackend {
    fn supports_atomic(&self) -> bool {
        self.atomic
    }

    fn commit_atomic(&mut self, changes: &[AppliedHeadChange]) -> Result<(), BackendError> {
        if changes.iter().any(|c| self.fail_outputs.contains(&c.output)) {
            return Err(BackendError::Commit("atomic commit rejected".into()));
        }
        self.commits += 1;
        Ok(())
    }

    fn commit_single(&mut self, change: &AppliedHeadChange) -> Result<(), BackendError> {
        if self.fail_outputs.contains(&change.output) {
            return Err(BackendError::Commit(format!(
                "head {} rejected",
                change.output.0
            )));
        }
        self.commits += 1;
        Ok(())
    }

    fn set_power(&mut self, _output: OutputId, _on: bool) -> Result<(), BackendError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct PowerHandle {
    client: ClientId,
}

/// The output engine.
#[derive(Debug, Default)]
pub struct OutputEngine {
    outputs: HashMap<OutputId, Output>,
    order: Vec<OutputId>,
    serial: u64,
    managers: Vec<ClientId>,
    power_handles: HashMap<OutputId, PowerHandle>,
    pub(crate) transactions: HashMap<ConfigurationId, OutputConfiguration>,
    next_output: u32,
    pub(crate) next_configuration: u64,
}

impl OutputEngine {
    pub fn new() -> Self {
        Self {
            serial: 1,
            ..Self::default()
        }
    }

    /// The strictly monotonic output-set serial.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub(crate) fn bump_serial(&mut self) -> u64 {
        self.serial += 1;
        self.serial
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Output> {
        self.order.iter().filter_map(|id| self.outputs.get(id))
    }

    pub fn get(&self, id: OutputId) -> Option<&Output> {
        self.outputs.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: OutputId) -> Option<&mut Output> {
        self.outputs.get_mut(&id)
    }

    pub fn ids(&self) -> Vec<OutputId> {
        self.order.clone()
    }

    /// Union of the enabled outputs' logical rectangles; the pointer is
    /// clamped to this.
    pub fn union_rect(&self) -> Rectangle<i32> {
        self.outputs()
            .filter(|o| o.enabled)
            .filter_map(|o| o.logical_geometry())
            .fold(Rectangle::default(), |acc, r| acc.merge(&r))
    }

    pub fn damage_all(&mut self) {
        for output in self.outputs.values_mut() {
            output.needs_redraw = true;
        }
    }

    // ---- hot-plug -------------------------------------------------------

    /// A display appeared. The preferred mode (or the first) becomes
    /// current and the head set is re-broadcast.
    #[allow(clippy::too_many_arguments)]
    pub fn add_output(
        &mut self,
        name: String,
        description: String,
        physical_size_mm: Size<i32>,
        modes: Vec<Mode>,
        position: Point<i32>,
        scale: f64,
        clients: &mut Clients,
    ) -> OutputId {
        self.next_output += 1;
        let id = OutputId(self.next_output);
        let current_mode = modes
            .iter()
            .find(|m| m.preferred)
            .or_else(|| modes.first())
            .copied();
        tracing::info!(output = id.0, %name, "output added");
        self.outputs.insert(
            id,
            Output {
                id,
                name,
                description,
                make: None,
                model: None,
                serial_number: None,
                physical_size_mm,
                modes,
                current_mode,
                custom_mode: false,
                position,
                transform: Transform::Normal,
                scale: if scale > 0.0 { scale } else { 1.0 },
                enabled: true,
                power: PowerState::On,
                adaptive_sync: false,
                needs_redraw: true,
            },
        );
        self.order.push(id);
        self.bump_serial();
        self.broadcast_heads(clients);
        id
    }

    /// A display went away. Cascades: head finished, power handle failed,
    /// serial bump, fresh broadcast. The caller relayouts the windows that
    /// lived there.
    pub fn remove_output(&mut self, id: OutputId, clients: &mut Clients) -> bool {
        if self.outputs.remove(&id).is_none() {
            return false;
        }
        self.order.retain(|o| *o != id);
        tracing::info!(output = id.0, "output removed");
        for manager in self.managers.clone() {
            clients.send(manager, ClientEvent::Output(OutputEvent::HeadFinished { output: id }));
        }
        if let Some(handle) = self.power_handles.remove(&id) {
            clients.send(
                handle.client,
                ClientEvent::Output(OutputEvent::PowerFailed { output: id }),
            );
        }
        self.bump_serial();
        self.broadcast_heads(clients);
        true
    }

    // ---- management clients ---------------------------------------------

    /// Bind a management client: it immediately receives the whole head set
    /// and the current serial.
    pub fn bind_manager(&mut self, client: ClientId, clients: &mut Clients) {
        if !self.managers.contains(&client) {
            self.managers.push(client);
        }
        self.send_heads_to(client, clients);
    }

    fn send_heads_to(&self, client: ClientId, clients: &mut Clients) {
        for output in self.outputs() {
            clients.send(
                client,
                ClientEvent::Output(OutputEvent::Head {
                    info: output.head_info(),
                }),
            );
        }
        clients.send(
            client,
            ClientEvent::Output(OutputEvent::Done { serial: self.serial }),
        );
    }

    /// Re-broadcast the head set and serial to every bound management
    /// client. Outstanding configurations created against older serials
    /// will cancel at apply time.
    pub(crate) fn broadcast_heads(&mut self, clients: &mut Clients) {
        for manager in self.managers.clone() {
            self.send_heads_to(manager, clients);
        }
    }

    // ---- power ----------------------------------------------------------

    /// Create a power-control handle for an output. At most one per output:
    /// a duplicate request fails the new handle and leaves the existing one
    /// alone. Every live handle gets a mode event on creation.
    pub fn create_power_handle(&mut self, id: OutputId, client: ClientId, clients: &mut Clients) -> bool {
        let output = match self.outputs.get(&id) {
            Some(output) => output,
            None => {
                clients.send(client, ClientEvent::Output(OutputEvent::PowerFailed { output: id }));
                return false;
            }
        };
        if self.power_handles.contains_key(&id) {
            clients.send(client, ClientEvent::Output(OutputEvent::PowerFailed { output: id }));
            return false;
        }
        let on = output.power.is_on();
        self.power_handles.insert(id, PowerHandle { client });
        clients.send(client, ClientEvent::Output(OutputEvent::PowerMode { output: id, on }));
        true
    }

    pub fn destroy_power_handle(&mut self, id: OutputId) {
        self.power_handles.remove(&id);
    }

    /// Change an output's power state, from the protocol or from the
    /// compositor itself (idle policy, sleep preparation). The bound power
    /// handle is notified either way.
    pub fn set_power(
        &mut self,
        id: OutputId,
        state: PowerState,
        backend: &mut dyn OutputBackend,
        clients: &mut Clients,
    ) -> Result<(), BackendError> {
        let output = match self.outputs.get_mut(&id) {
            Some(output) => output,
            None => return Ok(()),
        };
        if output.power == state {
            return Ok(());
        }
        backend.set_power(id, state.is_on())?;
        output.power = state;
        output.needs_redraw = state.is_on();
        if let Some(handle) = self.power_handles.get(&id) {
            clients.send(
                handle.client,
                ClientEvent::Output(OutputEvent::PowerMode {
                    output: id,
                    on: state.is_on(),
                }),
            );
        }
        Ok(())
    }

    /// Snapshot for transactional rollback.
    pub(crate) fn snapshot(&self, ids: &[OutputId]) -> Vec<Output> {
        ids.iter()
            .filter_map(|id| self.outputs.get(id).cloned())
            .collect()
    }

    pub(crate) fn restore(&mut self, snapshot: Vec<Output>) {
        for output in snapshot {
            self.outputs.insert(output.id, output);
        }
    }

    /// Drop a departing client's management binding and transactions.
    pub fn remove_client(&mut self, client: ClientId) {
        self.managers.retain(|c| *c != client);
        self.transactions.retain(|_, t| t.client != client);
        self.power_handles.retain(|_, h| h.client != client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_modes() -> Vec<Mode> {
        vec![
            Mode {
                size: Size::new(1920, 1080),
                refresh_mhz: 60_000,
                preferred: true,
            },
            Mode {
                size: Size::new(1280, 720),
                refresh_mhz: 60_000,
                preferred: false,
            },
        ]
    }

    fn add_test_output(engine: &mut OutputEngine, clients: &mut Clients, name: &str, x: i32) -> OutputId {
        engine.add_output(
            name.into(),
            format!("test output {name}"),
            Size::new(520, 290),
            test_modes(),
            Point::new(x, 0),
            1.0,
            clients,
        )
    }

    #[test]
    fn hotplug_bumps_serial_and_broadcasts() {
        let mut clients = Clients::new();
        let manager = clients.connect();
        let mut engine = OutputEngine::new();
        let before = engine.serial();
        engine.bind_manager(manager, &mut clients);
        clients.drain(manager);

        add_test_output(&mut engine, &mut clients, "DP-1", 0);
        assert!(engine.serial() > before);

        let events = clients.drain(manager);
        assert!(matches!(events[0], ClientEvent::Output(OutputEvent::Head { .. })));
        assert!(
            matches!(events.last(), Some(ClientEvent::Output(OutputEvent::Done { serial })) if *serial == engine.serial())
        );
    }

    #[test]
    fn preferred_mode_selected() {
        let mut clients = Clients::new();
        let mut engine = OutputEngine::new();
        let id = add_test_output(&mut engine, &mut clients, "DP-1", 0);
        let output = engine.get(id).unwrap();
        assert_eq!(output.current_mode.unwrap().size, Size::new(1920, 1080));
    }

    #[test]
    fn union_rect_spans_outputs() {
        let mut clients = Clients::new();
        let mut engine = OutputEngine::new();
        add_test_output(&mut engine, &mut clients, "DP-1", 0);
        add_test_output(&mut engine, &mut clients, "DP-2", 1920);
        assert_eq!(
            engine.union_rect(),
            Rectangle::from_coords(0, 0, 3840, 1080)
        );
    }

    #[test]
    fn power_handle_is_exclusive() {
        let mut clients = Clients::new();
        let a = clients.connect();
        let b = clients.connect();
        let mut engine = OutputEngine::new();
        let id = add_test_output(&mut engine, &mut clients, "DP-1", 0);

        assert!(engine.create_power_handle(id, a, &mut clients));
        assert!(!engine.create_power_handle(id, b, &mut clients));

        let events_a = clients.drain(a);
        assert!(matches!(
            events_a.last(),
            Some(ClientEvent::Output(OutputEvent::PowerMode { on: true, .. }))
        ));
        let events_b = clients.drain(b);
        assert!(matches!(
            events_b.last(),
            Some(ClientEvent::Output(OutputEvent::PowerFailed { .. }))
        ));
    }

    #[test]
    fn power_change_notifies_handle() {
        let mut clients = Clients::new();
        let holder = clients.connect();
        let mut engine = OutputEngine::new();
        let mut backend = NullOutputBackend::default();
        let id = add_test_output(&mut engine, &mut clients, "DP-1", 0);
        engine.create_power_handle(id, holder, &mut clients);
        clients.drain(holder);

        engine
            .set_power(id, PowerState::Off, &mut backend, &mut clients)
            .unwrap();
        let events = clients.drain(holder);
        assert!(matches!(
            events.last(),
            Some(ClientEvent::Output(OutputEvent::PowerMode { on: false, .. }))
        ));
    }

    #[test]
    fn output_removal_fails_power_handles() {
        let mut clients = Clients::new();
        let holder = clients.connect();
        let mut engine = OutputEngine::new();
        let id = add_test_output(&mut engine, &mut clients, "DP-1", 0);
        engine.create_power_handle(id, holder, &mut clients);
        clients.drain(holder);

        engine.remove_output(id, &mut clients);
        let events = clients.drain(holder);
        assert!(events
            .iter()
            .any(|e| matches!(e, ClientEvent::Output(OutputEvent::PowerFailed { .. }))));
    }
}
