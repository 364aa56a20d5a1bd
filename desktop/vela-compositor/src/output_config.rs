//! Multi-head output configuration transactions.
//!
//! A management client snapshots the head set at some serial, stages
//! per-head changes on a configuration object, then tests or applies it
//! exactly once. An apply against a stale serial cancels; validation
//! failures and backend failures fail without side effects (sequential
//! backend commits are rolled back to the pre-apply snapshot).

use crate::geometry::{Point, Transform};
use crate::output::{AppliedHeadChange, Mode, OutputBackend, OutputEngine, OutputId};
use crate::protocol::{ClientEvent, ClientId, Clients, ProtocolError};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigurationId(pub u64);

/// Outcome events delivered on the configuration object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputConfigEvent {
    Succeeded,
    Failed,
    /// The output set changed since the configuration was created; the
    /// client must fetch the new state and start over.
    Cancelled,
}

/// A proposed mode change.
#[derive(Debug, Clone, Copy)]
pub enum ModeChange {
    /// Must match a mode from the head's supported list.
    FromList(Mode),
    /// Explicitly custom timing.
    Custom(Mode),
}

/// Staged changes for one head. Absent fields keep their current value.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadChange {
    pub enable: Option<bool>,
    pub mode: Option<ModeChange>,
    pub position: Option<Point<i32>>,
    pub transform: Option<Transform>,
    pub scale: Option<f64>,
    pub adaptive_sync: Option<bool>,
}

/// A client-prepared multi-head change.
#[derive(Debug)]
pub struct OutputConfiguration {
    pub id: ConfigurationId,
    pub client: ClientId,
    /// The output-set serial the client saw when creating this.
    pub serial: u64,
    changes: HashMap<OutputId, HeadChange>,
    order: Vec<OutputId>,
    processed: bool,
}

/// Result of a test or apply, mirrored to the client as an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionResult {
    Succeeded,
    Failed,
    Cancelled,
}

impl OutputEngine {
    /// Create a configuration object against the serial the client saw.
    pub fn create_configuration(&mut self, client: ClientId, serial_seen: u64) -> ConfigurationId {
        self.next_configuration += 1;
        let id = ConfigurationId(self.next_configuration);
        self.transactions.insert(
            id,
            OutputConfiguration {
                id,
                client,
                serial: serial_seen,
                changes: HashMap::new(),
                order: Vec::new(),
                processed: false,
            },
        );
        id
    }

    /// Stage changes for one head. Each head may be configured once per
    /// transaction, and a processed transaction accepts nothing further.
    pub fn configure_head(
        &mut self,
        configuration: ConfigurationId,
        output: OutputId,
        change: HeadChange,
    ) -> Result<(), ProtocolError> {
        let transaction = self
            .transactions
            .get_mut(&configuration)
            .ok_or(ProtocolError::ConfigurationProcessed)?;
        if transaction.processed {
            return Err(ProtocolError::ConfigurationProcessed);
        }
        if transaction.changes.contains_key(&output) {
            return Err(ProtocolError::DuplicateHeadChange);
        }
        transaction.changes.insert(output, change);
        transaction.order.push(output);
        Ok(())
    }

    /// Validate without committing. Marks the transaction processed either
    /// way; the object is single-use.
    pub fn test_configuration(
        &mut self,
        configuration: ConfigurationId,
        clients: &mut Clients,
    ) -> Result<TransactionResult, ProtocolError> {
        let client = {
            let transaction = self
                .transactions
                .get_mut(&configuration)
                .ok_or(ProtocolError::ConfigurationProcessed)?;
            if transaction.processed {
                return Err(ProtocolError::ConfigurationProcessed);
            }
            transaction.processed = true;
            transaction.client
        };
        let transaction = match self.transactions.get(&configuration) {
            Some(t) => t,
            None => return Err(ProtocolError::ConfigurationProcessed),
        };
        let outcome = if transaction.serial != self.serial() {
            TransactionResult::Cancelled
        } else if self.validate(transaction).is_err() {
            TransactionResult::Failed
        } else {
            TransactionResult::Succeeded
        };
        clients.send(
            client,
            ClientEvent::OutputConfig(configuration, event_for(outcome)),
        );
        Ok(outcome)
    }

    /// Validate and commit. The serial gate runs first; validation next;
    /// then the backend. Sequential backends are rolled back on failure.
    pub fn apply_configuration(
        &mut self,
        configuration: ConfigurationId,
        backend: &mut dyn OutputBackend,
        clients: &mut Clients,
    ) -> Result<TransactionResult, ProtocolError> {
        let client = {
            let transaction = self
                .transactions
                .get_mut(&configuration)
                .ok_or(ProtocolError::ConfigurationProcessed)?;
            if transaction.processed {
                return Err(ProtocolError::ConfigurationProcessed);
            }
            transaction.processed = true;
            transaction.client
        };

        let outcome = self.try_apply(configuration, backend, clients);
        clients.send(
            client,
            ClientEvent::OutputConfig(configuration, event_for(outcome)),
        );
        if outcome == TransactionResult::Succeeded {
            // New serial and head set go to every bound management client,
            // cancelling their outstanding configurations at apply time.
            self.broadcast_heads(clients);
        }
        self.transactions.remove(&configuration);
        Ok(outcome)
    }

    fn try_apply(
        &mut self,
        configuration: ConfigurationId,
        backend: &mut dyn OutputBackend,
        _clients: &mut Clients,
    ) -> TransactionResult {
        let transaction = match self.transactions.get(&configuration) {
            Some(t) => t,
            None => return TransactionResult::Failed,
        };
        if transaction.serial != self.serial() {
            tracing::debug!(
                configuration = configuration.0,
                seen = transaction.serial,
                current = self.serial(),
                "configuration cancelled by serial mismatch"
            );
            return TransactionResult::Cancelled;
        }
        if self.validate(transaction).is_err() {
            return TransactionResult::Failed;
        }

        let resolved = self.resolve_changes(transaction);
        let affected: Vec<OutputId> = resolved.iter().map(|c| c.output).collect();
        let snapshot = self.snapshot(&affected);

        let committed = if backend.supports_atomic() {
            backend.commit_atomic(&resolved).is_ok()
        } else {
            let mut failed = false;
            for change in &resolved {
                if let Err(err) = backend.commit_single(change) {
                    tracing::warn!(%err, output = change.output.0, "sequential commit failed, rolling back");
                    failed = true;
                    break;
                }
            }
            !failed
        };
        if !committed {
            self.restore(snapshot);
            return TransactionResult::Failed;
        }

        for change in &resolved {
            if let Some(output) = self.get_mut(change.output) {
                output.enabled = change.enable;
                if let Some(mode) = change.mode {
                    output.custom_mode = !output.modes.iter().any(|m| m.same_timing(&mode));
                    output.current_mode = Some(mode);
                }
                output.position = change.position;
                output.transform = change.transform;
                output.scale = change.scale;
                output.adaptive_sync = change.adaptive_sync;
                output.needs_redraw = true;
            }
        }
        // An empty transaction is a valid no-op; the serial advances anyway.
        self.bump_serial();
        TransactionResult::Succeeded
    }

    fn validate(&self, transaction: &OutputConfiguration) -> Result<(), ()> {
        for (output_id, change) in &transaction.changes {
            let output = self.get(*output_id).ok_or(())?;
            if let Some(ModeChange::FromList(mode)) = change.mode {
                if !output.modes.iter().any(|m| m.same_timing(&mode)) {
                    tracing::debug!(output = output_id.0, "proposed mode not in supported set");
                    return Err(());
                }
            }
            if let Some(scale) = change.scale {
                if !(scale.is_finite() && scale > 0.0) {
                    return Err(());
                }
            }
        }
        Ok(())
    }

    fn resolve_changes(&self, transaction: &OutputConfiguration) -> Vec<AppliedHeadChange> {
        transaction
            .order
            .iter()
            .filter_map(|output_id| {
                let change = transaction.changes.get(output_id)?;
                let output = self.get(*output_id)?;
                Some(AppliedHeadChange {
                    output: *output_id,
                    enable: change.enable.unwrap_or(output.enabled),
                    mode: match change.mode {
                        Some(ModeChange::FromList(mode)) | Some(ModeChange::Custom(mode)) => {
                            Some(mode)
                        }
                        None => output.current_mode,
                    },
                    position: change.position.unwrap_or(output.position),
                    transform: change.transform.unwrap_or(output.transform),
                    scale: change.scale.unwrap_or(output.scale),
                    adaptive_sync: change.adaptive_sync.unwrap_or(output.adaptive_sync),
                })
            })
            .collect()
    }
}

fn event_for(result: TransactionResult) -> OutputConfigEvent {
    match result {
        TransactionResult::Succeeded => OutputConfigEvent::Succeeded,
        TransactionResult::Failed => OutputConfigEvent::Failed,
        TransactionResult::Cancelled => OutputConfigEvent::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Size;
    use crate::output::NullOutputBackend;

    fn setup() -> (OutputEngine, Clients, ClientId, OutputId, OutputId) {
        let mut clients = Clients::new();
        let manager = clients.connect();
        let mut engine = OutputEngine::new();
        let modes = vec![
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
        ];
        let a = engine.add_output(
            "DP-1".into(),
            "left head".into(),
            Size::new(520, 290),
            modes.clone(),
            Point::new(0, 0),
            1.0,
            &mut clients,
        );
        let b = engine.add_output(
            "DP-2".into(),
            "right head".into(),
            Size::new(520, 290),
            modes,
            Point::new(1920, 0),
            1.0,
            &mut clients,
        );
        engine.bind_manager(manager, &mut clients);
        clients.drain(manager);
        (engine, clients, manager, a, b)
    }

    #[test]
    fn apply_commits_and_advances_serial() {
        let (mut engine, mut clients, manager, a, _) = setup();
        let mut backend = NullOutputBackend { atomic: true, ..Default::default() };
        let serial = engine.serial();

        let config = engine.create_configuration(manager, serial);
        engine
            .configure_head(
                config,
                a,
                HeadChange {
                    position: Some(Point::new(100, 0)),
                    scale: Some(2.0),
                    ..HeadChange::default()
                },
            )
            .unwrap();
        let result = engine
            .apply_configuration(config, &mut backend, &mut clients)
            .unwrap();
        assert_eq!(result, TransactionResult::Succeeded);
        assert!(engine.serial() > serial);
        let output = engine.get(a).unwrap();
        assert_eq!(output.position, Point::new(100, 0));
        assert_eq!(output.scale, 2.0);
    }

    #[test]
    fn stale_serial_cancels() {
        let (mut engine, mut clients, manager, a, _) = setup();
        let mut backend = NullOutputBackend { atomic: true, ..Default::default() };
        let config = engine.create_configuration(manager, engine.serial());
        engine
            .configure_head(
                config,
                a,
                HeadChange {
                    position: Some(Point::new(5, 5)),
                    ..HeadChange::default()
                },
            )
            .unwrap();

        // A hotplug advances the serial before the apply lands.
        engine.add_output(
            "HDMI-1".into(),
            "hotplug".into(),
            Size::new(520, 290),
            vec![Mode {
                size: Size::new(1024, 768),
                refresh_mhz: 60_000,
                preferred: true,
            }],
            Point::new(3840, 0),
            1.0,
            &mut clients,
        );

        let before = engine.get(a).unwrap().position;
        let result = engine
            .apply_configuration(config, &mut backend, &mut clients)
            .unwrap();
        assert_eq!(result, TransactionResult::Cancelled);
        // Observable state unchanged by the cancelled apply.
        assert_eq!(engine.get(a).unwrap().position, before);
        assert_eq!(engine.ids().len(), 3);
    }

    #[test]
    fn unsupported_mode_fails_validation() {
        let (mut engine, mut clients, manager, a, _) = setup();
        let mut backend = NullOutputBackend { atomic: true, ..Default::default() };
        let config = engine.create_configuration(manager, engine.serial());
        engine
            .configure_head(
                config,
                a,
                HeadChange {
                    mode: Some(ModeChange::FromList(Mode {
                        size: Size::new(640, 480),
                        refresh_mhz: 59_000,
                        preferred: false,
                    })),
                    ..HeadChange::default()
                },
            )
            .unwrap();
        let result = engine
            .apply_configuration(config, &mut backend, &mut clients)
            .unwrap();
        assert_eq!(result, TransactionResult::Failed);
    }

    #[test]
    fn custom_mode_bypasses_the_list() {
        let (mut engine, mut clients, manager, a, _) = setup();
        let mut backend = NullOutputBackend { atomic: true, ..Default::default() };
        let config = engine.create_configuration(manager, engine.serial());
        let custom = Mode {
            size: Size::new(2048, 1152),
            refresh_mhz: 50_000,
            preferred: false,
        };
        engine
            .configure_head(
                config,
                a,
                HeadChange {
                    mode: Some(ModeChange::Custom(custom)),
                    ..HeadChange::default()
                },
            )
            .unwrap();
        let result = engine
            .apply_configuration(config, &mut backend, &mut clients)
            .unwrap();
        assert_eq!(result, TransactionResult::Succeeded);
        let output = engine.get(a).unwrap();
        assert!(output.custom_mode);
        assert!(output.current_mode.unwrap().same_timing(&custom));
    }

    #[test]
    fn sequential_backend_failure_rolls_back() {
        let (mut engine, mut clients, manager, a, b) = setup();
        let mut backend = NullOutputBackend {
            atomic: false,
            fail_outputs: vec![b],
            ..Default::default()
        };
        let serial = engine.serial();
        let config = engine.create_configuration(manager, serial);
        engine
            .configure_head(
                config,
                a,
                HeadChange {
                    position: Some(Point::new(500, 500)),
                    ..HeadChange::default()
                },
            )
            .unwrap();
        engine
            .configure_head(
                config,
                b,
                HeadChange {
                    position: Some(Point::new(900, 900)),
                    ..HeadChange::default()
                },
            )
            .unwrap();
        let result = engine
            .apply_configuration(config, &mut backend, &mut clients)
            .unwrap();
        assert_eq!(result, TransactionResult::Failed);
        // Neither head moved and the serial did not advance.
        assert_eq!(engine.get(a).unwrap().position, Point::new(0, 0));
        assert_eq!(engine.get(b).unwrap().position, Point::new(1920, 0));
        assert_eq!(engine.serial(), serial);
    }

    #[test]
    fn empty_transaction_applies_as_noop_but_advances_serial() {
        let (mut engine, mut clients, manager, _, _) = setup();
        let mut backend = NullOutputBackend { atomic: true, ..Default::default() };
        let serial = engine.serial();
        let config = engine.create_configuration(manager, serial);
        let result = engine
            .apply_configuration(config, &mut backend, &mut clients)
            .unwrap();
        assert_eq!(result, TransactionResult::Succeeded);
        assert_eq!(engine.serial(), serial + 1);
    }

    #[test]
    fn processed_transaction_accepts_nothing_further() {
        let (mut engine, mut clients, manager, a, _) = setup();
        let config = engine.create_configuration(manager, engine.serial());
        engine.test_configuration(config, &mut clients).unwrap();
        let err = engine.configure_head(config, a, HeadChange::default());
        assert!(matches!(err, Err(ProtocolError::ConfigurationProcessed)));
    }

    #[test]
    fn test_has_no_side_effects() {
        let (mut engine, mut clients, manager, a, _) = setup();
        let serial = engine.serial();
        let config = engine.create_configuration(manager, serial);
        engine
            .configure_head(
                config,
                a,
                HeadChange {
                    position: Some(Point::new(77, 0)),
                    ..HeadChange::default()
                },
            )
            .unwrap();
        let result = engine.test_configuration(config, &mut clients).unwrap();
        assert_eq!(result, TransactionResult::Succeeded);
        assert_eq!(engine.serial(), serial);
        assert_eq!(engine.get(a).unwrap().position, Point::new(0, 0));
    }
}
