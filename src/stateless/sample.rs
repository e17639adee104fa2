use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::Instrument;

use crate::{
    processor::{
        channel, recv_or_cancel, send_or_cancel, CancellationToken, Receiver, Sender,
        DEFAULT_CHANNEL_CAPACITY,
    },
    Processor, Result,
};

/// Keep each success independently with probability `rate` (`0.0..=1.0`).
/// Error Results always pass through. With `with_seed`, sampling is
/// reproducible across runs -- the same seed and the same sequence of
/// inputs always keep the same items.
pub struct Sample<T> {
    name: String,
    rate: f64,
    seed: Option<u64>,
    capacity: usize,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T: Send + 'static> Sample<T> {
    pub fn new(rate: f64) -> Self {
        assert!((0.0..=1.0).contains(&rate), "Sample rate must be in 0.0..=1.0");
        Sample {
            name: "sample".to_owned(),
            rate,
            seed: None,
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

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

impl<T: Send + 'static> Processor<T, T> for Sample<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, cancel: CancellationToken, mut input: Receiver<T>) -> Receiver<T> {
        let (tx, rx): (Sender<T>, Receiver<T>) = channel(self.capacity);
        let rate = self.rate;
        let seed = self.seed;
        let name = self.name.clone();
        tokio::spawn(
            async move {
                let mut rng = match seed {
                    Some(seed) => ChaCha8Rng::seed_from_u64(seed),
                    None => ChaCha8Rng::from_rng(&mut rand::rng()),
                };
                while let Some(result) = recv_or_cancel(&mut input, &cancel).await {
                    let keep = match &result {
                        Result::Error(..) => true,
                        Result::Value(..) => rng.random_bool(rate),
                    };
                    if !keep {
                        continue;
                    }
                    if !send_or_cancel(&tx, result, &cancel).await {
                        break;
                    }
                }
            }
            .instrument(tracing::info_span!("processor", name = %name)),
        );
        rx
    }
}
