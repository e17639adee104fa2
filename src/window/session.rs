use std::{
    collections::HashMap,
    hash::Hash,
    marker::PhantomData,
    sync::Arc,
    time::Duration,
};

use tracing::Instrument;

use crate::{
    clock::{Clock, Instant, RealClock},
    metadata::{keys, window_type, Metadata},
    processor::{
        channel, recv_or_cancel, send_or_cancel, CancellationToken, Processor, Receiver, Sender,
        DEFAULT_CHANNEL_CAPACITY,
    },
    Result,
};

struct Session<T> {
    start: Instant,
    current_end: Instant,
    id: i64,
    members: Vec<T>,
}

/// Per-key session windows: a session stays open while items for the same
/// key keep arriving within `gap` of each other, and is considered closed
/// once `gap` elapses without one. There's no explicit close event --
/// closure is inferred by this processor itself, via the sweep tick.
///
/// A session's members are buffered, not forwarded as they arrive: an
/// item's `window_end` is only known once the session actually closes, so
/// emitting early would tag earlier members with a smaller `window_end`
/// than later ones in the same session. All members of a session are
/// forwarded together, in arrival order, once the sweep observes `gap` has
/// elapsed since the last arrival, each carrying the identical, final
/// `window_start`/`window_end`/`session_id`.
pub struct SessionWindow<T, K, C: Clock = RealClock> {
    name: String,
    key_fn: Arc<dyn Fn(&T) -> K + Send + Sync>,
    gap: Duration,
    capacity: usize,
    clock: C,
    _marker: PhantomData<fn(T)>,
}

impl<T: Send + 'static, K: Eq + Hash + Clone + Send + 'static> SessionWindow<T, K, RealClock> {
    pub fn new(gap: Duration, key_fn: impl Fn(&T) -> K + Send + Sync + 'static) -> Self {
        assert!(!gap.is_zero(), "gap must be positive");
        SessionWindow {
            name: "session_window".to_owned(),
            key_fn: Arc::new(key_fn),
            gap,
            capacity: DEFAULT_CHANNEL_CAPACITY,
            clock: RealClock::new(),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + 'static, K: Eq + Hash + Clone + Send + 'static, C: Clock> SessionWindow<T, K, C> {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_clock<C2: Clock>(self, clock: C2) -> SessionWindow<T, K, C2> {
        SessionWindow {
            name: self.name,
            key_fn: self.key_fn,
            gap: self.gap,
            capacity: self.capacity,
            clock,
            _marker: PhantomData,
        }
    }
}

impl<T: Send + 'static, K: Eq + Hash + Clone + Send + 'static, C: Clock> Processor<T, T>
    for SessionWindow<T, K, C>
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, cancel: CancellationToken, mut input: Receiver<T>) -> Receiver<T> {
        let (tx, rx): (Sender<T>, Receiver<T>) = channel(self.capacity);
        let clock = self.clock.clone();
        let key_fn = self.key_fn.clone();
        let gap = self.gap;
        let name = self.name.clone();
        let sweep_period = (gap / 4).max(Duration::from_millis(10));

        async fn emit_session<T>(
            tx: &Sender<T>,
            cancel: &CancellationToken,
            gap: Duration,
            session: Session<T>,
        ) -> bool {
            for member in session.members {
                let metadata = Metadata::empty()
                    .with(keys::WINDOW_START, session.start)
                    .with(keys::WINDOW_END, session.current_end)
                    .with(keys::WINDOW_TYPE, window_type::SESSION)
                    .with(keys::WINDOW_GAP, gap)
                    .with(keys::SESSION_ID, session.id);
                if !send_or_cancel(tx, Result::Value(member, metadata), cancel).await {
                    return false;
                }
            }
            true
        }

        tokio::spawn(
            async move {
                let mut sessions: HashMap<K, Session<T>> = HashMap::new();
                let mut next_id: i64 = 0;
                let mut sweeper = clock.ticker(sweep_period);

                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        result = input.recv() => {
                            let Some(result) = result else { break };
                            match result {
                                Result::Error(e, m) => {
                                    if !send_or_cancel(&tx, Result::Error(e, m), &cancel).await {
                                        return;
                                    }
                                }
                                Result::Value(v, _) => {
                                    let key = key_fn(&v);
                                    let now = clock.now();
                                    let expired = sessions.get(&key).map_or(true, |s| now > s.current_end);
                                    if expired {
                                        sessions.insert(
                                            key.clone(),
                                            Session {
                                                start: now,
                                                current_end: now + gap,
                                                id: next_id,
                                                members: Vec::new(),
                                            },
                                        );
                                        next_id += 1;
                                    } else {
                                        sessions.get_mut(&key).unwrap().current_end = now + gap;
                                    }
                                    sessions.get_mut(&key).unwrap().members.push(v);
                                }
                            }
                        }
                        _ = sweeper.recv() => {
                            let now = clock.now();
                            let closed: Vec<K> = sessions
                                .iter()
                                .filter(|(_, s)| now > s.current_end)
                                .map(|(k, _)| k.clone())
                                .collect();
                            for key in closed {
                                let session = sessions.remove(&key).unwrap();
                                if !emit_session(&tx, &cancel, gap, session).await {
                                    sweeper.stop();
                                    return;
                                }
                            }
                        }
                    }
                }
                sweeper.stop();

                for (_, session) in sessions.drain() {
                    if !emit_session(&tx, &cancel, gap, session).await {
                        break;
                    }
                }
            }
            .instrument(tracing::info_span!("processor", name = %name)),
        );

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;

    #[tokio::test]
    async fn every_member_of_a_session_carries_the_same_finalized_window_end() {
        let (tx, rx) = channel::<(&'static str, i32)>(8);
        let cancel = CancellationToken::new();
        let clock = VirtualClock::new();
        let window = SessionWindow::new(Duration::from_millis(100), |v: &(&'static str, i32)| v.0)
            .with_clock(clock.clone());
        let mut out = window.process(cancel.clone(), rx);

        tx.send(Result::success(("a", 1))).await.unwrap();
        tokio::task::yield_now().await;
        clock.advance(Duration::from_millis(50)).await;
        tx.send(Result::success(("a", 2))).await.unwrap();
        tokio::task::yield_now().await;

        // Nothing emits while the session is still open -- window_end isn't
        // final yet.
        assert!(out.try_recv().is_err());

        // Past the gap with no further arrivals, the sweep closes the
        // session and both members come out carrying the identical, final
        // window_end.
        clock.advance(Duration::from_millis(110)).await;

        let first = out.recv().await.unwrap();
        let second = out.recv().await.unwrap();
        assert_eq!(*first.value().unwrap(), ("a", 1));
        assert_eq!(*second.value().unwrap(), ("a", 2));

        let first_start = first.get_instant_metadata(keys::WINDOW_START).found().unwrap();
        let second_start = second.get_instant_metadata(keys::WINDOW_START).found().unwrap();
        let first_end = first.get_instant_metadata(keys::WINDOW_END).found().unwrap();
        let second_end = second.get_instant_metadata(keys::WINDOW_END).found().unwrap();
        let first_id = first.get_int_metadata(keys::SESSION_ID).found().unwrap();
        let second_id = second.get_int_metadata(keys::SESSION_ID).found().unwrap();

        assert_eq!(first_start, second_start, "same session, start never moves");
        assert_eq!(first_end, second_end, "finalized window_end is identical for every member");
        assert_eq!(first_id, second_id);

        drop(tx);
    }

    #[tokio::test]
    async fn starts_a_new_session_after_the_gap_elapses() {
        let (tx, rx) = channel::<(&'static str, i32)>(8);
        let cancel = CancellationToken::new();
        let clock = VirtualClock::new();
        let window = SessionWindow::new(Duration::from_millis(100), |v: &(&'static str, i32)| v.0)
            .with_clock(clock.clone());
        let mut out = window.process(cancel.clone(), rx);

        tx.send(Result::success(("a", 1))).await.unwrap();
        tokio::task::yield_now().await;
        clock.advance(Duration::from_millis(110)).await;
        let first = out.recv().await.unwrap();
        let first_id = first.get_int_metadata(keys::SESSION_ID).found().unwrap();

        tx.send(Result::success(("a", 2))).await.unwrap();
        tokio::task::yield_now().await;
        clock.advance(Duration::from_millis(110)).await;
        let second = out.recv().await.unwrap();
        let second_id = second.get_int_metadata(keys::SESSION_ID).found().unwrap();

        assert_ne!(first_id, second_id);
        drop(tx);
    }

    #[tokio::test]
    async fn distinct_keys_never_share_a_session() {
        let (tx, rx) = channel::<(&'static str, i32)>(8);
        let cancel = CancellationToken::new();
        let clock = VirtualClock::new();
        let window = SessionWindow::new(Duration::from_millis(100), |v: &(&'static str, i32)| v.0)
            .with_clock(clock.clone());
        let mut out = window.process(cancel.clone(), rx);

        tx.send(Result::success(("a", 1))).await.unwrap();
        tx.send(Result::success(("b", 1))).await.unwrap();
        tokio::task::yield_now().await;
        clock.advance(Duration::from_millis(110)).await;
        drop(tx);

        let a = out.recv().await.unwrap();
        let b = out.recv().await.unwrap();
        assert_ne!(
            a.get_int_metadata(keys::SESSION_ID).found().unwrap(),
            b.get_int_metadata(keys::SESSION_ID).found().unwrap()
        );
    }

    #[tokio::test]
    async fn input_closing_flushes_still_open_sessions() {
        let (tx, rx) = channel::<(&'static str, i32)>(8);
        let cancel = CancellationToken::new();
        let window = SessionWindow::new(Duration::from_millis(100), |v: &(&'static str, i32)| v.0);
        let mut out = window.process(cancel.clone(), rx);

        tx.send(Result::success(("a", 1))).await.unwrap();
        drop(tx);

        let first = out.recv().await.unwrap();
        assert_eq!(*first.value().unwrap(), ("a", 1));
    }
}
