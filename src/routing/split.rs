use crate::{
    processor::{
        channel, recv_or_cancel, send_or_cancel, CancellationToken, Receiver, Sender,
        DEFAULT_CHANNEL_CAPACITY,
    },
    Result,
};

/// Binary specialization of `Router`: each success goes to `matched` if
/// `predicate` holds, otherwise to `unmatched`. Error Results always go to
/// `unmatched`.
///
/// Both outputs are fed by the same single dispatcher loop, so an
/// undrained output blocks delivery to the *other* output too -- both
/// must be drained for the stream to keep flowing, exactly as with
/// `FanOut`.
pub struct Split<T> {
    name: String,
    predicate: std::sync::Arc<dyn Fn(&T) -> bool + Send + Sync>,
    capacity: usize,
}

impl<T: Send + 'static> Split<T> {
    pub fn new(predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Split {
            name: "split".to_owned(),
            predicate: std::sync::Arc::new(predicate),
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
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

    /// Returns `(matched, unmatched)`.
    pub fn process(
        &self,
        cancel: CancellationToken,
        mut input: Receiver<T>,
    ) -> (Receiver<T>, Receiver<T>) {
        let (matched_tx, matched_rx): (Sender<T>, Receiver<T>) = channel(self.capacity);
        let (unmatched_tx, unmatched_rx): (Sender<T>, Receiver<T>) = channel(self.capacity);
        let predicate = self.predicate.clone();

        tokio::spawn(async move {
            while let Some(result) = recv_or_cancel(&mut input, &cancel).await {
                let goes_to_matched = match &result {
                    Result::Value(v, _) => predicate(v),
                    Result::Error(..) => false,
                };
                let target = if goes_to_matched { &matched_tx } else { &unmatched_tx };
                if !send_or_cancel(target, result, &cancel).await {
                    break;
                }
            }
        });

        (matched_rx, unmatched_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::channel;

    #[tokio::test]
    async fn splits_by_predicate_with_errors_going_unmatched() {
        let (tx, rx) = channel::<i32>(8);
        let cancel = CancellationToken::new();
        let split = Split::new(|v: &i32| *v % 2 == 0);
        let (mut matched, mut unmatched) = split.process(cancel.clone(), rx);

        tx.send(Result::success(2)).await.unwrap();
        tx.send(Result::success(3)).await.unwrap();
        tx.send(Result::error(
            4,
            anyhow::anyhow!("boom"),
            "test",
            crate::clock::VirtualClock::new().now(),
        ))
        .await
        .unwrap();
        drop(tx);

        let m = matched.recv().await.unwrap();
        assert_eq!(*m.value().unwrap(), 2);
        assert!(matched.recv().await.is_none());

        let u1 = unmatched.recv().await.unwrap();
        assert_eq!(*u1.value().unwrap(), 3);
        let u2 = unmatched.recv().await.unwrap();
        assert!(u2.is_error());
    }
}
