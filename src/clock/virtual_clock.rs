use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;

use super::{instant::Instant, Clock, StoppableTimer, Ticker};

/// Number of scheduler yields `VirtualClock::advance` spends draining
/// downstream work after firing due timers.
///
/// This crate's own processors never chain a further `tokio::spawn` off the
/// back of a single clock event -- a worker's `select!` loop reacts to one
/// channel message per iteration, inline -- so a handful of yields is
/// sufficient to reach a quiescent point for pipelines built from this
/// crate. It is documented here rather than replaced with a perfect
/// task-local waitgroup because nothing in this crate spawns the
/// unbounded-depth task chains that would require one.
const DRAIN_YIELDS: usize = 32;

enum Effect {
    Once(tokio::sync::oneshot::Sender<Instant>),
    Periodic {
        sender: tokio::sync::mpsc::UnboundedSender<Instant>,
        period: Duration,
        active: Arc<AtomicBool>,
    },
    Callback {
        active: Arc<AtomicBool>,
        f: Box<dyn FnOnce() + Send>,
    },
}

struct TimerEntry {
    id: u64,
    fire_at: Duration,
    effect: Effect,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        (self.fire_at, self.id) == (other.fire_at, other.id)
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so `BinaryHeap` (a max-heap) behaves as a min-heap on
        // `fire_at`, breaking ties on insertion order.
        (other.fire_at, other.id).cmp(&(self.fire_at, self.id))
    }
}

struct State {
    current: Duration,
    next_id: u64,
    heap: BinaryHeap<TimerEntry>,
}

impl State {
    fn schedule(&mut self, delay: Duration, effect: Effect) {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(TimerEntry {
            id,
            fire_at: self.current + delay,
            effect,
        });
    }
}

/// Manually-advanced [`Clock`] for deterministic tests. Maintains a current
/// time and a min-heap of pending timers, exactly the `StepTimer` shape:
/// `advance` pops and fires everything due, in fire-time order, then
/// updates `current`.
#[derive(Clone)]
pub struct VirtualClock {
    state: Arc<Mutex<State>>,
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualClock {
    pub fn new() -> Self {
        VirtualClock {
            state: Arc::new(Mutex::new(State {
                current: Duration::ZERO,
                next_id: 0,
                heap: BinaryHeap::new(),
            })),
        }
    }

    /// Number of timers (one-shot, ticker, or `after_func`) still pending.
    pub fn pending_timers(&self) -> usize {
        self.state.lock().heap.len()
    }

    /// Advance virtual time by `duration`, firing every timer whose fire
    /// time falls within the new `[old_current, old_current + duration]`
    /// window, in order, then yielding to the runtime so that tasks woken
    /// by those firings get a chance to run before `advance` returns.
    pub async fn advance(&self, duration: Duration) {
        self.fire_due(duration);
        for _ in 0..DRAIN_YIELDS {
            tokio::task::yield_now().await;
        }
    }

    fn fire_due(&self, duration: Duration) {
        let mut once_sends = Vec::new();
        let mut tick_sends = Vec::new();
        let mut callbacks: Vec<Box<dyn FnOnce() + Send>> = Vec::new();

        {
            let mut state = self.state.lock();
            state.current += duration;
            let now = state.current;
            loop {
                match state.heap.peek() {
                    Some(entry) if entry.fire_at <= now => {},
                    _ => break,
                }
                let entry = state.heap.pop().expect("peek just confirmed an entry");
                let fire_instant = Instant::from_duration_since_epoch(entry.fire_at);
                match entry.effect {
                    Effect::Once(tx) => once_sends.push((tx, fire_instant)),
                    Effect::Periodic {
                        sender,
                        period,
                        active,
                    } => {
                        if active.load(AtomicOrdering::SeqCst) {
                            tick_sends.push((sender.clone(), fire_instant));
                            // Reschedule from this tick's own fire time, not from
                            // `current`, so a single `advance` that skips past
                            // several periods still fires one tick per period
                            // rather than collapsing them onto the new `current`.
                            let id = state.next_id;
                            state.next_id += 1;
                            state.heap.push(TimerEntry {
                                id,
                                fire_at: entry.fire_at + period,
                                effect: Effect::Periodic {
                                    sender,
                                    period,
                                    active,
                                },
                            });
                        }
                    },
                    Effect::Callback { active, f } => {
                        if active
                            .compare_exchange(
                                true,
                                false,
                                AtomicOrdering::SeqCst,
                                AtomicOrdering::SeqCst,
                            )
                            .is_ok()
                        {
                            callbacks.push(f);
                        }
                    },
                }
            }
        }

        for (tx, instant) in once_sends {
            let _ = tx.send(instant);
        }
        for (sender, instant) in tick_sends {
            let _ = sender.send(instant);
        }
        for f in callbacks {
            f();
        }
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Instant {
        Instant::from_duration_since_epoch(self.state.lock().current)
    }

    fn after(&self, duration: Duration) -> Pin<Box<dyn Future<Output = Instant> + Send>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.state.lock().schedule(duration, Effect::Once(tx));
        Box::pin(async move { rx.await.expect("VirtualClock dropped before timer fired") })
    }

    fn ticker(&self, period: Duration) -> Ticker {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));
        self.state.lock().schedule(
            period,
            Effect::Periodic {
                sender: tx,
                period,
                active: active.clone(),
            },
        );
        Ticker::new(rx, move || active.store(false, AtomicOrdering::SeqCst))
    }

    fn after_func<F>(&self, duration: Duration, f: F) -> StoppableTimer
    where
        F: FnOnce() + Send + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        self.state.lock().schedule(
            duration,
            Effect::Callback {
                active: active.clone(),
                f: Box::new(f),
            },
        );
        StoppableTimer::new(active)
    }
}
