//! Timers driving view timeouts.
//!
//! The engine arms one timer per (height, view) and ignores firings whose tag
//! no longer matches its current height and view, so a stale firing from a
//! superseded timer is harmless.

use {
    crate::types::HeightView,
    crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender},
    log::*,
    parking_lot::Mutex,
    std::{
        io,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread::{Builder, JoinHandle},
        time::{Duration, Instant, SystemTime},
    },
};

/// Scheduling primitive used by the engine.
pub trait Timer {
    /// Current wall-clock time.
    fn now(&self) -> SystemTime;

    /// Cancels any pending firing and schedules one firing tagged `hv` after
    /// `delay`. A zero delay fires immediately.
    fn reset(&mut self, hv: HeightView, delay: Duration);

    /// Pushes the pending firing out by `delay`. No-op if nothing is pending.
    fn extend(&mut self, delay: Duration);

    /// Cancels any pending firing.
    fn stop(&mut self);

    /// Tag of the most recent `reset`.
    fn height_view(&self) -> HeightView;
}

#[derive(Debug)]
struct TimerState {
    hv: HeightView,
    start: Instant,
    delay: Duration,
    armed: bool,
}

impl TimerState {
    fn deadline(&self) -> Option<Instant> {
        if !self.armed {
            return None;
        }
        self.start.checked_add(self.delay)
    }
}

/// Timer backed by a worker thread. Firings are delivered through a
/// single-slot channel obtained from [`ChannelTimer::fired`].
pub struct ChannelTimer {
    state: Arc<Mutex<TimerState>>,
    wake: Sender<()>,
    fired: Receiver<HeightView>,
    exit: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ChannelTimer {
    pub fn new() -> io::Result<Self> {
        let state = Arc::new(Mutex::new(TimerState {
            hv: HeightView::default(),
            start: Instant::now(),
            delay: Duration::ZERO,
            armed: false,
        }));
        let (wake, wake_receiver) = bounded(1);
        let (fired_sender, fired) = bounded(1);
        let exit = Arc::new(AtomicBool::new(false));

        let thread = {
            let state = state.clone();
            let exit = exit.clone();
            Builder::new()
                .name("dbftTimer".to_string())
                .spawn(move || Self::run(&state, &wake_receiver, &fired_sender, &exit))?
        };

        Ok(Self {
            state,
            wake,
            fired,
            exit,
            thread: Some(thread),
        })
    }

    /// Receiver of firing tags.
    pub fn fired(&self) -> Receiver<HeightView> {
        self.fired.clone()
    }

    fn run(
        state: &Mutex<TimerState>,
        wake: &Receiver<()>,
        fired: &Sender<HeightView>,
        exit: &AtomicBool,
    ) {
        loop {
            if exit.load(Ordering::Relaxed) {
                break;
            }
            let deadline = state.lock().deadline();
            let woken = match deadline {
                Some(deadline) => wake.recv_deadline(deadline),
                None => wake.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match woken {
                Ok(()) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    let mut state = state.lock();
                    let expired = state
                        .deadline()
                        .is_some_and(|deadline| deadline <= Instant::now());
                    if expired {
                        state.armed = false;
                        // Sent under the lock so a concurrent reset cannot be
                        // followed by a firing of the previous schedule.
                        if fired.try_send(state.hv).is_err() {
                            debug!("timer firing for {} dropped, slot full", state.hv);
                        }
                    }
                }
            }
        }
    }

    fn drain(&self) {
        while self.fired.try_recv().is_ok() {}
    }

    fn notify(&self) {
        // A full slot already guarantees the worker re-reads the state.
        let _ = self.wake.try_send(());
    }
}

impl Timer for ChannelTimer {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn reset(&mut self, hv: HeightView, delay: Duration) {
        {
            let mut state = self.state.lock();
            self.drain();
            state.hv = hv;
            state.start = Instant::now();
            state.delay = delay;
            state.armed = true;
        }
        self.notify();
    }

    fn extend(&mut self, delay: Duration) {
        {
            let mut state = self.state.lock();
            if !state.armed {
                return;
            }
            state.delay = state.delay.saturating_add(delay);
        }
        self.notify();
    }

    fn stop(&mut self) {
        {
            let mut state = self.state.lock();
            state.armed = false;
            self.drain();
        }
        self.notify();
    }

    fn height_view(&self) -> HeightView {
        self.state.lock().hv
    }
}

impl Drop for ChannelTimer {
    fn drop(&mut self) {
        self.exit.store(true, Ordering::Relaxed);
        self.notify();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("dbft timer thread panicked");
            }
        }
    }
}
