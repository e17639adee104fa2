use std::sync::Arc;

use crate::{
    processor::{
        channel, recv_or_cancel, send_or_cancel, CancellationToken, Receiver, Sender,
        DEFAULT_CHANNEL_CAPACITY,
    },
    Result,
};

/// Exactly-first-match routing: each item goes to the first case whose
/// predicate matches, or to the trailing default case if none match.
/// Unlike `Router` there is no `AllMatches` mode -- a `Switch` models a
/// mutually exclusive set of cases, like a `match` expression over the
/// stream.
pub struct Switch<T> {
    name: String,
    cases: Vec<Arc<dyn Fn(&T) -> bool + Send + Sync>>,
    capacity: usize,
}

impl<T: Send + 'static> Switch<T> {
    pub fn new() -> Self {
        Switch {
            name: "switch".to_owned(),
            cases: Vec::new(),
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Registration order determines the output index in `process`'s
    /// returned `Vec` (the default channel is always the last element).
    pub fn case(mut self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.cases.push(Arc::new(predicate));
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

    pub fn process(&self, cancel: CancellationToken, mut input: Receiver<T>) -> Vec<Receiver<T>> {
        let case_count = self.cases.len();
        let mut senders: Vec<Sender<T>> = Vec::with_capacity(case_count + 1);
        let mut receivers: Vec<Receiver<T>> = Vec::with_capacity(case_count + 1);
        for _ in 0..=case_count {
            let (tx, rx) = channel(self.capacity);
            senders.push(tx);
            receivers.push(rx);
        }

        let cases = self.cases.clone();
        let default_index = case_count;
        tokio::spawn(async move {
            while let Some(result) = recv_or_cancel(&mut input, &cancel).await {
                let index = match &result {
                    // Errors carry no routable value; route deterministically
                    // to the default case.
                    Result::Error(..) => default_index,
                    Result::Value(v, _) => cases
                        .iter()
                        .position(|predicate| predicate(v))
                        .unwrap_or(default_index),
                };
                if !send_or_cancel(&senders[index], result, &cancel).await {
                    break;
                }
            }
        });

        receivers
    }
}

impl<T: Send + 'static> Default for Switch<T> {
    fn default() -> Self {
        Switch::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::channel;

    #[tokio::test]
    async fn routes_to_first_matching_case_or_default() {
        let (tx, rx) = channel::<i32>(8);
        let cancel = CancellationToken::new();
        let switch = Switch::new()
            .case(|v: &i32| *v < 0)
            .case(|v: &i32| *v == 0);
        let mut outs = switch.process(cancel.clone(), rx);

        for v in [-1, 0, 1] {
            tx.send(Result::success(v)).await.unwrap();
        }
        drop(tx);

        let negative = outs[0].recv().await.unwrap();
        assert_eq!(*negative.value().unwrap(), -1);
        let zero = outs[1].recv().await.unwrap();
        assert_eq!(*zero.value().unwrap(), 0);
        let default = outs[2].recv().await.unwrap();
        assert_eq!(*default.value().unwrap(), 1);
    }
}
