//! Bridge between the service-bus clients (power, session, network,
//! secrets, policy) and the event spine.
//!
//! Service clients run their own async runtimes on auxiliary threads; their
//! notifications are normalized into [`ServiceEvent`] values and posted to
//! the spine, where they become ordinary callbacks on the loop thread. The
//! core never blocks on a service call.

use crate::spine::PostSender;
use crate::state::DesktopState;
use futures::{Stream, StreamExt};
use std::thread::JoinHandle;

/// Service-bus notifications the core reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    /// Resets idle logic elsewhere; in the core it only allows
    /// pointer-wake focus transitions.
    UserActivityDetected,
    /// true right before sleep, false on resume.
    SystemPrepareForSleep(bool),
    SessionLocked,
    SessionUnlocked,
    /// A settings path changed; only core-relevant paths are re-read.
    SettingChanged(String),
}

/// Pumps a stream of service events into the spine from its own thread.
pub struct ServiceBridge {
    thread: Option<JoinHandle<()>>,
}

impl ServiceBridge {
    /// Spawn the bridge thread. It runs a current-thread tokio runtime,
    /// forwards every event as a spine post, and exits when the stream ends
    /// or the spine goes away.
    pub fn spawn<S>(events: S, poster: PostSender<DesktopState>) -> anyhow::Result<Self>
    where
        S: Stream<Item = ServiceEvent> + Send + 'static,
    {
        let thread = std::thread::Builder::new()
            .name("vela-services".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        tracing::error!(%err, "service bridge could not start its runtime");
                        return;
                    }
                };
                runtime.block_on(async move {
                    futures::pin_mut!(events);
                    while let Some(event) = events.next().await {
                        tracing::debug!(?event, "service event");
                        let delivered = poster
                            .post(move |state: &mut DesktopState| {
                                crate::state::handle_service_event(state, event);
                            })
                            .is_ok();
                        if !delivered {
                            break;
                        }
                    }
                });
                tracing::debug!("service bridge drained");
            })?;
        Ok(Self {
            thread: Some(thread),
        })
    }

    /// Wait for the bridge thread to finish (stream ended).
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ServiceBridge {
    fn drop(&mut self) {
        // The thread exits on its own when the stream or spine ends; do not
        // block drop on it.
        if let Some(thread) = self.thread.take() {
            drop(thread);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompositorConfig;
    use crate::spine::EventSpine;
    use std::time::{Duration, Instant};

    #[test]
    fn events_reach_the_state_via_the_spine() {
        let mut spine = EventSpine::<DesktopState>::new().unwrap();
        let mut state = DesktopState::new(CompositorConfig::default(), spine.handle());

        let events = futures::stream::iter(vec![
            ServiceEvent::SessionLocked,
            ServiceEvent::UserActivityDetected,
        ]);
        let bridge = ServiceBridge::spawn(events, spine.handle().poster()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !(state.mechanics.locked && state.mechanics.pointer_wake_allowed)
            && Instant::now() < deadline
        {
            spine.dispatch(Duration::from_millis(20), &mut state).unwrap();
        }
        assert!(state.mechanics.locked);
        assert!(state.mechanics.pointer_wake_allowed);
        bridge.join();
    }
}
