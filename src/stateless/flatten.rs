use tracing::Instrument;

use crate::{
    processor::{
        channel, recv_or_cancel, send_or_cancel, CancellationToken, Receiver, Sender,
        DEFAULT_CHANNEL_CAPACITY,
    },
    Processor, Result,
};

/// Inverse of `Chunk`: unpack each success `IntoIterator<Item = T>` into its
/// individual elements, each re-wrapped as its own success sharing the
/// input's metadata. An error Result passes through as a single re-typed
/// error element.
pub struct Flatten<I> {
    name: String,
    capacity: usize,
    _marker: std::marker::PhantomData<fn(I)>,
}

impl<I> Flatten<I>
where
    I: IntoIterator + Send + 'static,
    I::Item: Send + 'static,
{
    pub fn new() -> Self {
        Flatten {
            name: "flatten".to_owned(),
            capacity: DEFAULT_CHANNEL_CAPACITY,
            _marker: std::marker::PhantomData,
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
}

impl<I> Default for Flatten<I>
where
    I: IntoIterator + Send + 'static,
    I::Item: Send + 'static,
{
    fn default() -> Self {
        Flatten::new()
    }
}

impl<I> Processor<I, I::Item> for Flatten<I>
where
    I: IntoIterator + Send + 'static,
    I::Item: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, cancel: CancellationToken, mut input: Receiver<I>) -> Receiver<I::Item> {
        let (tx, rx): (Sender<I::Item>, Receiver<I::Item>) = channel(self.capacity);
        let name = self.name.clone();
        tokio::spawn(
            async move {
                while let Some(result) = recv_or_cancel(&mut input, &cancel).await {
                    match result {
                        Result::Error(e, m) => {
                            if !send_or_cancel(&tx, Result::Error(e.retype(), m), &cancel).await {
                                return;
                            }
                        },
                        Result::Value(items, m) => {
                            for item in items {
                                let out = Result::success(item).with_metadata_map(m.clone());
                                if !send_or_cancel(&tx, out, &cancel).await {
                                    return;
                                }
                            }
                        },
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
    use crate::processor::channel;

    #[tokio::test]
    async fn unpacks_each_collection_into_individual_elements() {
        let (tx, rx) = channel::<Vec<i32>>(8);
        let cancel = CancellationToken::new();
        let flatten = Flatten::new();
        let mut out = flatten.process(cancel.clone(), rx);

        tx.send(Result::success(vec![1, 2])).await.unwrap();
        tx.send(Result::success(vec![3])).await.unwrap();
        drop(tx);

        let mut seen = Vec::new();
        while let Some(r) = out.recv().await {
            seen.push(*r.value().unwrap());
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }
}
