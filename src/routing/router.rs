use std::sync::Arc;

use crate::{
    processor::{
        channel, recv_or_cancel, send_or_cancel, CancellationToken, Receiver, Sender,
        DEFAULT_CHANNEL_CAPACITY,
    },
    Result,
};

/// Whether a `Router` delivers each item to the first matching route only,
/// or to every route whose predicate matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterMode {
    FirstMatch,
    AllMatches,
}

/// Route each item to one or more of N named predicates' output channels,
/// plus a trailing default channel for anything that matches none of
/// them. An error Result carries no value to test predicates against: it
/// is delivered to every registered route under `AllMatches`, or to the
/// default channel under `FirstMatch`.
pub struct Router<T> {
    name: String,
    routes: Vec<Arc<dyn Fn(&T) -> bool + Send + Sync>>,
    mode: RouterMode,
    capacity: usize,
}

impl<T: Clone + Send + 'static> Router<T> {
    pub fn new(mode: RouterMode) -> Self {
        Router {
            name: "router".to_owned(),
            routes: Vec::new(),
            mode,
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Register a route; the position of `add_route` calls determines the
    /// output index in `process`'s returned `Vec` (the default channel is
    /// always the last element).
    pub fn add_route(mut self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.routes.push(Arc::new(predicate));
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns one channel per registered route (in registration order),
    /// plus a final default channel.
    pub fn process(&self, cancel: CancellationToken, mut input: Receiver<T>) -> Vec<Receiver<T>> {
        let route_count = self.routes.len();
        let mut senders: Vec<Sender<T>> = Vec::with_capacity(route_count + 1);
        let mut receivers: Vec<Receiver<T>> = Vec::with_capacity(route_count + 1);
        for _ in 0..=route_count {
            let (tx, rx) = channel(self.capacity);
            senders.push(tx);
            receivers.push(rx);
        }

        let routes = self.routes.clone();
        let mode = self.mode;
        let default_index = route_count;
        tokio::spawn(async move {
            while let Some(result) = recv_or_cancel(&mut input, &cancel).await {
                let matches: Vec<usize> = match &result {
                    // An error carries no value to test predicates against.
                    // Under AllMatches it still goes to every route (so no
                    // route silently misses error signals the way it would
                    // miss a value it didn't match); under FirstMatch there
                    // is no well-defined "first" route to pick, so it falls
                    // through to the default channel below.
                    Result::Error(..) if mode == RouterMode::AllMatches => (0..route_count).collect(),
                    Result::Error(..) => Vec::new(),
                    Result::Value(v, _) => routes
                        .iter()
                        .enumerate()
                        .filter(|(_, predicate)| predicate(v))
                        .map(|(i, _)| i)
                        .collect(),
                };

                let targets: Vec<usize> = if matches.is_empty() {
                    vec![default_index]
                } else {
                    match mode {
                        RouterMode::FirstMatch => vec![matches[0]],
                        RouterMode::AllMatches => matches,
                    }
                };

                let last = targets.len() - 1;
                let mut failed = false;
                for &index in &targets[..last] {
                    if !send_or_cancel(&senders[index], result.clone(), &cancel).await {
                        failed = true;
                        break;
                    }
                }
                if !failed {
                    failed = !send_or_cancel(&senders[targets[last]], result, &cancel).await;
                }
                if failed {
                    break;
                }
            }
        });

        receivers
    }
}
