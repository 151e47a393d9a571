use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Wake-up budget for idle workers.
///
/// Starts empty. A worker that finds no job consumes one permit before it
/// polls again; the notification watcher tops the budget back up to
/// `capacity` whenever new work may exist. Permits are consumed, never
/// returned, so this is a signal rather than a lock.
#[derive(Debug)]
pub struct PermitGate {
    semaphore: Semaphore,
    capacity: usize,
}

impl PermitGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Semaphore::new(0),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Refill the budget to `capacity`, returning how many permits were added.
    ///
    /// Assumes a single releaser; concurrent callers could overshoot.
    pub fn release_burst(&self) -> usize {
        let added = self.capacity.saturating_sub(self.available());
        if added > 0 {
            self.semaphore.add_permits(added);
        }
        trace!(added, available = self.available(), "Released permits");
        added
    }

    /// Consume one permit. Returns `false` if `token` was cancelled first.
    pub async fn acquire(&self, token: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = token.cancelled() => false,
            permit = self.semaphore.acquire() => match permit {
                Ok(permit) => {
                    permit.forget();
                    true
                }
                // the semaphore is never closed
                Err(_) => false,
            },
        }
    }
}
