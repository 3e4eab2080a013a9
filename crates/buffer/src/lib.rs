//! Bounded outbound-event buffer with backpressure and retry.
//!
//! Producers enqueue events that must eventually reach the relay network
//! (confirmations, failure notices, L1 commitment notices). The worker
//! drains the queue and retries failed publishes with exponential backoff
//! until the event's deadline passes; the database is already the source of
//! truth by the time anything lands here, so a dropped event is a counter
//! and an error log, never lost state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{debug, error, info, warn};

const DEFAULT_CHANNEL_CAPACITY: usize = 4096;
const ENQUEUE_TIMEOUT: Duration = Duration::from_millis(250);
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// An event the buffer can deliver.
pub trait BufferableEvent: Send + Sync + Clone + 'static {
    /// Short identifier for logging.
    fn describe(&self) -> String;

    /// Retry cut-off. `None` means retry forever.
    fn deadline(&self) -> Option<Instant>;
}

/// Delivery backend (the relay publisher in production, a mock in tests).
#[async_trait]
pub trait EventSink<T: BufferableEvent>: Send + Sync {
    async fn publish(&self, event: &T) -> Result<()>;

    fn sink_name(&self) -> &'static str {
        "unknown"
    }
}

/// Lock-free delivery counters.
#[derive(Debug, Default)]
pub struct BufferStats {
    pub enqueued: AtomicU64,
    pub published: AtomicU64,
    pub retries: AtomicU64,
    pub dropped: AtomicU64,
    pub rejected: AtomicU64,
}

impl BufferStats {
    pub fn snapshot(&self) -> (u64, u64, u64, u64, u64) {
        (
            self.enqueued.load(Ordering::Relaxed),
            self.published.load(Ordering::Relaxed),
            self.retries.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
            self.rejected.load(Ordering::Relaxed),
        )
    }
}

type QueuedEvent<T> = (T, OwnedSemaphorePermit);

#[derive(Clone)]
pub struct PublishBuffer<T: BufferableEvent> {
    sender: mpsc::Sender<QueuedEvent<T>>,
    backpressure: Arc<Semaphore>,
    stats: Arc<BufferStats>,
}

impl<T: BufferableEvent> PublishBuffer<T> {
    pub fn new(sink: Arc<dyn EventSink<T>>) -> Self {
        Self::with_capacity(sink, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(sink: Arc<dyn EventSink<T>>, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        let stats = Arc::new(BufferStats::default());
        let backpressure = Arc::new(Semaphore::new(capacity));

        let worker_stats = stats.clone();
        tokio::spawn(async move {
            run_worker(receiver, sink, worker_stats).await;
        });

        Self {
            sender,
            backpressure,
            stats,
        }
    }

    /// Enqueue an event. Applies backpressure: when the queue is full the
    /// call waits briefly, then rejects so producers never block unbounded.
    pub async fn enqueue(&self, event: T) -> Result<()> {
        let permit = match timeout(
            ENQUEUE_TIMEOUT,
            self.backpressure.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(anyhow!("publish buffer closed"));
            }
            Err(_) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!("publish buffer full, rejecting {}", event.describe());
                return Err(anyhow!("publish buffer full"));
            }
        };

        self.sender
            .send((event, permit))
            .await
            .map_err(|_| anyhow!("publish buffer closed"))?;
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> Arc<BufferStats> {
        self.stats.clone()
    }
}

async fn run_worker<T: BufferableEvent>(
    mut receiver: mpsc::Receiver<QueuedEvent<T>>,
    sink: Arc<dyn EventSink<T>>,
    stats: Arc<BufferStats>,
) {
    info!("Publish buffer worker started for sink {}", sink.sink_name());
    while let Some((event, permit)) = receiver.recv().await {
        deliver(&*sink, &event, &stats).await;
        drop(permit);
    }
    info!("Publish buffer worker stopped");
}

/// Publish one event, retrying with backoff until its deadline.
async fn deliver<T: BufferableEvent>(sink: &dyn EventSink<T>, event: &T, stats: &BufferStats) {
    let mut delay = INITIAL_RETRY_DELAY;
    loop {
        match sink.publish(event).await {
            Ok(()) => {
                stats.published.fetch_add(1, Ordering::Relaxed);
                debug!("published {}", event.describe());
                return;
            }
            Err(err) => {
                let expired = event
                    .deadline()
                    .map(|deadline| Instant::now() + delay >= deadline)
                    .unwrap_or(false);
                if expired {
                    stats.dropped.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "dropping {} after retry window elapsed: {}",
                        event.describe(),
                        err
                    );
                    return;
                }
                stats.retries.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "publish of {} failed, retrying in {:?}: {}",
                    event.describe(),
                    delay,
                    err
                );
                sleep(delay).await;
                delay = (delay * 2).min(MAX_RETRY_DELAY);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[derive(Clone)]
    struct TestEvent {
        name: String,
        deadline: Option<Instant>,
    }

    impl BufferableEvent for TestEvent {
        fn describe(&self) -> String {
            self.name.clone()
        }

        fn deadline(&self) -> Option<Instant> {
            self.deadline
        }
    }

    struct FlakySink {
        failures_before_success: AtomicU32,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl EventSink<TestEvent> for FlakySink {
        async fn publish(&self, _event: &TestEvent) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.failures_before_success.load(Ordering::SeqCst) > 0 {
                self.failures_before_success.fetch_sub(1, Ordering::SeqCst);
                Err(anyhow!("simulated outage"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let sink = Arc::new(FlakySink {
            failures_before_success: AtomicU32::new(2),
            attempts: AtomicU32::new(0),
        });
        let buffer = PublishBuffer::with_capacity(sink.clone(), 8);
        buffer
            .enqueue(TestEvent {
                name: "confirmation".into(),
                deadline: None,
            })
            .await
            .unwrap();

        // paused clock: advance through both backoff sleeps
        for _ in 0..8 {
            tokio::time::advance(Duration::from_secs(2)).await;
            tokio::task::yield_now().await;
        }

        assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
        let (_, published, retries, dropped, _) = buffer.stats().snapshot();
        assert_eq!(published, 1);
        assert_eq!(retries, 2);
        assert_eq!(dropped, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drops_after_deadline() {
        let sink = Arc::new(FlakySink {
            failures_before_success: AtomicU32::new(u32::MAX),
            attempts: AtomicU32::new(0),
        });
        let buffer = PublishBuffer::with_capacity(sink.clone(), 8);
        buffer
            .enqueue(TestEvent {
                name: "doomed".into(),
                deadline: Some(Instant::now() + Duration::from_secs(1)),
            })
            .await
            .unwrap();

        for _ in 0..8 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }

        let (_, published, _, dropped, _) = buffer.stats().snapshot();
        assert_eq!(published, 0);
        assert_eq!(dropped, 1);
    }
}
