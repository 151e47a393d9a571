//! Ordered delivery over a bounded set of concurrent producers.
//!
//! [`OrderedPipeline`] runs an async `produce` step for up to `concurrency`
//! items at a time and hands the results to an async `consume` step strictly
//! in input order. A single driver owns all bookkeeping: completed results are
//! parked in per-index slots until every lower index has been consumed, and at
//! most one `consume` call is in flight at any moment.
//!
//! Everything runs inside the caller's task. The `produce` futures are polled
//! together through a `FuturesUnordered`, so they overlap while waiting on
//! I/O but are never spread across runtime worker threads. CPU-heavy work
//! belongs in `spawn_blocking` or a spawned task awaited from `produce`.
//!
//! The first failing callback aborts the run. Futures still in flight are
//! dropped, so anything they own is released before the error is returned.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;

use futures::StreamExt;
use futures::future::OptionFuture;
use futures::stream::FuturesUnordered;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Lifecycle of a single item as seen by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    /// Not produced yet (queued or in flight).
    Waiting,
    /// Produced and parked until its turn to be consumed.
    Fetched,
    /// Consumed.
    Delivered,
}

enum Slot<R> {
    Waiting,
    Fetched(R),
    Delivering,
    Delivered,
}

impl<R> Slot<R> {
    fn status(&self) -> SlotStatus {
        match self {
            Slot::Waiting => SlotStatus::Waiting,
            Slot::Fetched(_) | Slot::Delivering => SlotStatus::Fetched,
            Slot::Delivered => SlotStatus::Delivered,
        }
    }
}

/// Error returned by [`OrderedPipeline`] runs.
#[derive(Debug, thiserror::Error)]
pub enum OrderedPipelineError<E> {
    #[error("concurrency must be at least 1")]
    InvalidConcurrency,

    #[error("item {index} duplicates item {first}")]
    DuplicateItem { index: usize, first: usize },

    #[error("produce failed for item {index}: {source}")]
    Produce {
        index: usize,
        #[source]
        source: E,
    },

    #[error("consume failed for item {index}: {source}")]
    Consume {
        index: usize,
        #[source]
        source: E,
    },

    #[error("pipeline cancelled")]
    Cancelled,

    #[error("item {index} was never delivered")]
    Undelivered { index: usize },
}

impl<E> OrderedPipelineError<E> {
    /// Index of the item the error refers to, if any.
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::DuplicateItem { index, .. }
            | Self::Produce { index, .. }
            | Self::Consume { index, .. }
            | Self::Undelivered { index } => Some(*index),
            Self::InvalidConcurrency | Self::Cancelled => None,
        }
    }

    /// The callback error, when the run failed inside `produce` or `consume`.
    pub fn callback_error(&self) -> Option<&E> {
        match self {
            Self::Produce { source, .. } | Self::Consume { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Bounded-concurrency producer with strictly ordered, serialized delivery.
#[derive(Debug, Clone)]
pub struct OrderedPipeline {
    concurrency: usize,
    token: CancellationToken,
}

impl OrderedPipeline {
    /// Create a pipeline running at most `concurrency` produce calls at once.
    ///
    /// A zero concurrency is reported by [`run`](Self::run) as
    /// [`OrderedPipelineError::InvalidConcurrency`].
    pub fn new(concurrency: usize, token: CancellationToken) -> Self {
        Self { concurrency, token }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Like [`run`](Self::run), but first rejects inputs containing equal items.
    ///
    /// The check happens before any callback runs.
    pub async fn run_distinct<T, R, E, P, PF, C, CF>(
        &self,
        items: Vec<T>,
        produce: P,
        consume: C,
    ) -> Result<(), OrderedPipelineError<E>>
    where
        T: Eq + Hash,
        P: FnMut(T, usize, usize) -> PF,
        PF: Future<Output = Result<R, E>>,
        C: FnMut(R, usize, usize) -> CF,
        CF: Future<Output = Result<(), E>>,
    {
        if let Some((index, first)) = find_duplicate(&items) {
            return Err(OrderedPipelineError::DuplicateItem { index, first });
        }
        self.run(items, produce, consume).await
    }

    /// Produce every item and consume the results in input order.
    ///
    /// `produce(item, index, total)` is invoked exactly once per item, never
    /// with more than `concurrency` calls outstanding. `consume(result, index,
    /// total)` is invoked exactly once per item, in ascending index order, and
    /// only after the previous `consume` future has completed.
    ///
    /// # Errors
    ///
    /// The first `produce`/`consume` failure or a cancellation aborts the run.
    /// No result with a higher index than the failing one is consumed.
    pub async fn run<T, R, E, P, PF, C, CF>(
        &self,
        items: Vec<T>,
        mut produce: P,
        mut consume: C,
    ) -> Result<(), OrderedPipelineError<E>>
    where
        P: FnMut(T, usize, usize) -> PF,
        PF: Future<Output = Result<R, E>>,
        C: FnMut(R, usize, usize) -> CF,
        CF: Future<Output = Result<(), E>>,
    {
        if self.concurrency == 0 {
            return Err(OrderedPipelineError::InvalidConcurrency);
        }

        let total = items.len();
        if total == 0 {
            return Ok(());
        }
        debug!(total, concurrency = self.concurrency, "Starting ordered pipeline");

        let mut slots: Vec<Slot<R>> = std::iter::repeat_with(|| Slot::Waiting)
            .take(total)
            .collect();
        let mut pending = items.into_iter().enumerate();
        let mut in_flight = FuturesUnordered::new();
        let mut next_index = 0usize;
        let mut delivery: Option<Pin<Box<CF>>> = None;

        loop {
            while in_flight.len() < self.concurrency {
                let Some((index, item)) = pending.next() else {
                    break;
                };
                let fut = produce(item, index, total);
                in_flight.push(async move { (index, fut.await) });
            }

            if delivery.is_none()
                && next_index < total
                && matches!(slots[next_index], Slot::Fetched(_))
                && let Slot::Fetched(value) =
                    std::mem::replace(&mut slots[next_index], Slot::Delivering)
            {
                trace!(index = next_index, total, "Delivering item");
                delivery = Some(Box::pin(consume(value, next_index, total)));
            }

            if in_flight.is_empty() && delivery.is_none() {
                break;
            }

            tokio::select! {
                biased;

                _ = self.token.cancelled() => {
                    debug!(delivered = next_index, total, "Ordered pipeline cancelled");
                    return Err(OrderedPipelineError::Cancelled);
                }

                Some(result) = OptionFuture::from(delivery.as_mut()), if delivery.is_some() => {
                    delivery = None;
                    if let Err(source) = result {
                        return Err(OrderedPipelineError::Consume { index: next_index, source });
                    }
                    slots[next_index] = Slot::Delivered;
                    next_index += 1;
                }

                Some((index, result)) = in_flight.next(), if !in_flight.is_empty() => {
                    match result {
                        Ok(value) => {
                            trace!(index, total, "Item produced");
                            slots[index] = Slot::Fetched(value);
                        }
                        Err(source) => {
                            return Err(OrderedPipelineError::Produce { index, source });
                        }
                    }
                }
            }
        }

        if let Some(index) = slots
            .iter()
            .position(|slot| slot.status() != SlotStatus::Delivered)
        {
            return Err(OrderedPipelineError::Undelivered { index });
        }

        debug!(total, "Ordered pipeline finished");
        Ok(())
    }
}

/// Returns `(index, first)` for the first item equal to an earlier one.
fn find_duplicate<T: Eq + Hash>(items: &[T]) -> Option<(usize, usize)> {
    let mut seen = HashMap::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        if let Some(&first) = seen.get(item) {
            return Some((index, first));
        }
        seen.insert(item, index);
    }
    None
}
