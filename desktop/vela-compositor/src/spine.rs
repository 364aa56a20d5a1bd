//! The event spine: the single-threaded cooperative loop everything runs
//! on.
//!
//! Wraps a calloop event loop. Readable file descriptors, timers and
//! cross-thread posts all dispatch their callbacks serially on this thread;
//! no other thread ever touches compositor state. Callbacks exceeding the
//! soft budget are logged as scheduling offenses.

use calloop::channel;
use calloop::generic::Generic;
use calloop::timer::{TimeoutAction, Timer};
use calloop::{EventLoop, Interest, LoopHandle, LoopSignal, Mode, PostAction, RegistrationToken};
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Callbacks running longer than this stall input and rendering.
pub const CALLBACK_BUDGET: Duration = Duration::from_millis(8);

/// What a timer callback wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerReschedule {
    Stop,
    After(Duration),
}

type Post<T> = Box<dyn FnOnce(&mut T) + Send>;

/// Handle onto a registered timer, used for cancellation.
#[derive(Debug)]
pub struct TimerHandle(RegistrationToken);

/// Handle onto a registered readable source.
#[derive(Debug)]
pub struct SourceHandle(RegistrationToken);

/// Cloneable, `Send` entry point for other threads to schedule work on the
/// loop thread. Posts from one thread are delivered in order; there is no
/// order across threads.
pub struct PostSender<T>(channel::Sender<Post<T>>);

impl<T> Clone for PostSender<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> PostSender<T> {
    /// Queue `work` for the loop thread. Fails once the spine is gone.
    pub fn post(&self, work: impl FnOnce(&mut T) + Send + 'static) -> Result<(), ()> {
        self.0.send(Box::new(work)).map_err(|_| ())
    }
}

/// Handle used from within the loop thread to register sources and control
/// the loop.
pub struct SpineHandle<T: 'static> {
    handle: LoopHandle<'static, T>,
    signal: LoopSignal,
    running: Arc<AtomicBool>,
    post_sender: channel::Sender<Post<T>>,
}

impl<T: 'static> Clone for SpineHandle<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            signal: self.signal.clone(),
            running: self.running.clone(),
            post_sender: self.post_sender.clone(),
        }
    }
}

impl<T: 'static> SpineHandle<T> {
    /// Watch a file descriptor for readability. The callback must drain it
    /// with non-blocking reads.
    pub fn register_readable(
        &self,
        fd: OwnedFd,
        mut callback: impl FnMut(&mut T) + 'static,
    ) -> anyhow::Result<SourceHandle> {
        let source = Generic::new(fd, Interest::READ, Mode::Level);
        let token = self
            .handle
            .insert_source(source, move |_, _, data| {
                timed("fd-readable", || callback(data));
                Ok(PostAction::Continue)
            })
            .map_err(|err| anyhow::anyhow!("failed to register readable source: {err:?}"))?;
        Ok(SourceHandle(token))
    }

    pub fn unregister_readable(&self, source: SourceHandle) {
        self.handle.remove(source.0);
    }

    /// Arm a timer. The callback decides whether to re-arm.
    pub fn register_timer(
        &self,
        delay: Duration,
        mut callback: impl FnMut(&mut T) -> TimerReschedule + 'static,
    ) -> anyhow::Result<TimerHandle> {
        let timer = Timer::from_duration(delay);
        let token = self
            .handle
            .insert_source(timer, move |_deadline, _, data| {
                match timed("timer", || callback(data)) {
                    TimerReschedule::Stop => TimeoutAction::Drop,
                    TimerReschedule::After(next) => TimeoutAction::ToDuration(next),
                }
            })
            .map_err(|err| anyhow::anyhow!("failed to register timer: {err:?}"))?;
        Ok(TimerHandle(token))
    }

    pub fn cancel_timer(&self, timer: TimerHandle) {
        self.handle.remove(timer.0);
    }

    /// Entry point handed to auxiliary threads (service clients, audio, AI
    /// transport).
    pub fn poster(&self) -> PostSender<T> {
        PostSender(self.post_sender.clone())
    }

    /// Ask the loop to stop after the current callback completes.
    pub fn request_shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.signal.wakeup();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// The loop itself. Owns the calloop reactor; everything else holds
/// [`SpineHandle`]s.
pub struct EventSpine<T: 'static> {
    event_loop: EventLoop<'static, T>,
    handle: SpineHandle<T>,
}

impl<T: 'static> EventSpine<T> {
    pub fn new() -> anyhow::Result<Self> {
        let event_loop: EventLoop<'static, T> =
            EventLoop::try_new().map_err(|err| anyhow::anyhow!("event loop: {err}"))?;
        let (post_sender, post_channel) = channel::channel::<Post<T>>();
        let loop_handle = event_loop.handle();
        loop_handle
            .insert_source(post_channel, |event, _, data| {
                if let channel::Event::Msg(post) = event {
                    timed("cross-thread-post", || post(data));
                }
            })
            .map_err(|err| anyhow::anyhow!("failed to register post channel: {err:?}"))?;
        let handle = SpineHandle {
            handle: loop_handle,
            signal: event_loop.get_signal(),
            running: Arc::new(AtomicBool::new(true)),
            post_sender,
        };
        Ok(Self { event_loop, handle })
    }

    pub fn handle(&self) -> SpineHandle<T> {
        self.handle.clone()
    }

    /// Dispatch until [`SpineHandle::request_shutdown`]. Outstanding timers
    /// and sources are released when the spine drops, in no particular
    /// order.
    pub fn run_until_shutdown(&mut self, data: &mut T) -> anyhow::Result<()> {
        while self.handle.is_running() {
            self.event_loop
                .dispatch(None::<Duration>, data)
                .map_err(|err| anyhow::anyhow!("dispatch: {err}"))?;
        }
        tracing::info!("event spine stopped");
        Ok(())
    }

    /// One bounded dispatch iteration.
    pub fn dispatch(&mut self, timeout: Duration, data: &mut T) -> anyhow::Result<()> {
        self.event_loop
            .dispatch(Some(timeout), data)
            .map_err(|err| anyhow::anyhow!("dispatch: {err}"))?;
        Ok(())
    }

    /// Drain already-pending events without sleeping. Test pump.
    pub fn dispatch_pending(&mut self, data: &mut T) -> anyhow::Result<()> {
        self.dispatch(Duration::ZERO, data)
    }
}

fn timed<R>(what: &'static str, f: impl FnOnce() -> R) -> R {
    let start = Instant::now();
    let out = f();
    let elapsed = start.elapsed();
    if elapsed > CALLBACK_BUDGET {
        tracing::warn!(callback = what, ?elapsed, "callback exceeded the scheduling budget");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        ticks: u32,
        posts: Vec<u32>,
    }

    #[test]
    fn timer_fires_and_reschedules() {
        let mut spine = EventSpine::<Counter>::new().unwrap();
        let handle = spine.handle();
        let mut data = Counter::default();

        handle
            .register_timer(Duration::from_millis(1), |data| {
                data.ticks += 1;
                if data.ticks < 3 {
                    TimerReschedule::After(Duration::from_millis(1))
                } else {
                    TimerReschedule::Stop
                }
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while data.ticks < 3 && Instant::now() < deadline {
            spine.dispatch(Duration::from_millis(20), &mut data).unwrap();
        }
        assert_eq!(data.ticks, 3);

        // Stopped: no further firing.
        spine.dispatch(Duration::from_millis(10), &mut data).unwrap();
        assert_eq!(data.ticks, 3);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut spine = EventSpine::<Counter>::new().unwrap();
        let handle = spine.handle();
        let mut data = Counter::default();

        let timer = handle
            .register_timer(Duration::from_millis(1), |data| {
                data.ticks += 1;
                TimerReschedule::Stop
            })
            .unwrap();
        handle.cancel_timer(timer);

        spine.dispatch(Duration::from_millis(20), &mut data).unwrap();
        assert_eq!(data.ticks, 0);
    }

    #[test]
    fn posts_from_one_thread_arrive_in_order() {
        let mut spine = EventSpine::<Counter>::new().unwrap();
        let poster = spine.handle().poster();
        let mut data = Counter::default();

        let worker = std::thread::spawn(move || {
            for i in 0..5u32 {
                poster.post(move |data: &mut Counter| data.posts.push(i)).unwrap();
            }
        });
        worker.join().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while data.posts.len() < 5 && Instant::now() < deadline {
            spine.dispatch(Duration::from_millis(20), &mut data).unwrap();
        }
        assert_eq!(data.posts, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn readable_source_fires_on_data() {
        use std::io::Write;
        use std::os::unix::net::UnixStream;

        let mut spine = EventSpine::<Counter>::new().unwrap();
        let handle = spine.handle();
        let mut data = Counter::default();

        let (mut writer, reader) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();
        handle
            .register_readable(OwnedFd::from(reader), |data| data.ticks += 1)
            .unwrap();

        writer.write_all(b"x").unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while data.ticks == 0 && Instant::now() < deadline {
            spine.dispatch(Duration::from_millis(20), &mut data).unwrap();
        }
        assert!(data.ticks >= 1);
    }

    #[test]
    fn shutdown_stops_the_loop() {
        let mut spine = EventSpine::<Counter>::new().unwrap();
        let handle = spine.handle();
        let mut data = Counter::default();

        handle
            .register_timer(Duration::from_millis(1), move |_| {
                TimerReschedule::After(Duration::from_millis(1))
            })
            .unwrap();

        let stopper = handle.clone();
        handle
            .register_timer(Duration::from_millis(5), move |_| {
                stopper.request_shutdown();
                TimerReschedule::Stop
            })
            .unwrap();

        spine.run_until_shutdown(&mut data).unwrap();
        assert!(!handle.is_running());
    }
}
