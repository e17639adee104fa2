//! Property-based checks for invariants that should hold for *any* input,
//! not just the handful of cases a fixture test happens to pick.

use futures::FutureExt;
use proptest::prelude::*;

use flowline::{
    clock::{Clock, VirtualClock},
    processor::channel,
    stateless::{Chunk, Flatten},
    CancellationToken, Processor, Result,
};
use std::time::Duration;

proptest! {
    /// `Result::with_metadata` never mutates the Result it's called on, and
    /// the returned copy carries both the new key and everything the parent
    /// already had.
    #[test]
    fn with_metadata_leaves_the_parent_unchanged(
        base in any::<i32>(),
        prior in prop::collection::vec((".{1,8}", any::<i64>()), 0..5),
        new_key in ".{1,8}",
        new_val in any::<i64>(),
    ) {
        let mut parent = Result::success(base);
        for (k, v) in &prior {
            parent = parent.with_metadata(k.clone(), *v);
        }
        let parent_keys_before: Vec<String> =
            parent.metadata_keys().into_iter().map(str::to_owned).collect();

        let child = parent.with_metadata(new_key.clone(), new_val);

        let parent_keys_after: Vec<String> =
            parent.metadata_keys().into_iter().map(str::to_owned).collect();
        prop_assert_eq!(&parent_keys_before, &parent_keys_after);
        prop_assert_eq!(*parent.value().unwrap(), base);

        for (k, v) in &prior {
            prop_assert_eq!(child.get_int_metadata(k).found(), Some(*v));
        }
        prop_assert_eq!(child.get_int_metadata(&new_key).found(), Some(new_val));
        prop_assert_eq!(*child.value().unwrap(), base);
    }

    /// Chunking a stream into fixed-size groups and immediately flattening
    /// it back reproduces the original sequence, in order, regardless of
    /// how the input length divides the chunk size.
    #[test]
    fn chunk_then_flatten_round_trips(
        items in prop::collection::vec(any::<i32>(), 0..64),
        size in 1usize..9,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let seen = rt.block_on(async move {
            let (tx, rx) = channel::<i32>(items.len().max(1));
            let cancel = CancellationToken::new();
            let chunked = Chunk::new(size).process(cancel.clone(), rx);
            let mut flattened = Flatten::new().process(cancel.clone(), chunked);

            for &v in &items {
                tx.send(Result::success(v)).await.unwrap();
            }
            drop(tx);

            let mut seen = Vec::new();
            while let Some(r) = flattened.recv().await {
                seen.push(*r.value().unwrap());
            }
            seen
        });
        prop_assert_eq!(seen, items);
    }

    /// `map` composes: applying `f` then `g` equals applying their
    /// composition in one step.
    #[test]
    fn map_then_map_equals_composed_map(v in any::<i32>(), a in any::<i32>(), b in any::<i32>()) {
        let f = move |x: i32| x.wrapping_add(a);
        let g = move |x: i32| x.wrapping_mul(b);

        let stepwise = Result::success(v).map(f).map(g);
        let composed = Result::success(v).map(move |x| g(f(x)));

        prop_assert_eq!(*stepwise.value().unwrap(), *composed.value().unwrap());
    }

    /// Advancing a `VirtualClock` by `d` fires exactly `d / period` ticks of
    /// a ticker with that period, no more and no fewer.
    #[test]
    fn ticker_advance_fires_exactly_floor_d_over_period_ticks(
        period_ms in 1u64..200,
        advance_ms in 0u64..3000,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let count = rt.block_on(async move {
            let clock = VirtualClock::new();
            let mut ticker = clock.ticker(Duration::from_millis(period_ms));
            clock.advance(Duration::from_millis(advance_ms)).await;

            let mut count = 0u64;
            while let Some(Some(_)) = ticker.recv().now_or_never() {
                count += 1;
            }
            count
        });
        prop_assert_eq!(count, advance_ms / period_ms);
    }
}
