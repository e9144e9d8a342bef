use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::Arc,
    time::Duration,
};

use metrics::counter;
use thiserror::Error;
use tokio::{
    sync::mpsc::{self, error::SendTimeoutError},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use invoice_sync_core::CanonicalEvent;
use invoice_sync_util::{RetryPolicy, SyncConfig};

use crate::dispatch::{EventRouter, LifecycleHandler};
use crate::sync::SyncError;

/// Producer side of the partitioned processing queue.
#[derive(Clone)]
pub struct QueueHandle {
    partitions: Arc<[mpsc::Sender<CanonicalEvent>]>,
    enqueue_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("partition {0} stayed full")]
    Full(usize),
    #[error("partition {0} is closed")]
    Closed(usize),
}

/// Result of enqueuing one delivery under a shared deadline.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BatchEnqueue {
    pub accepted: usize,
    pub dropped: usize,
}

/// Consumers, one per partition. Events sharing a partition key are applied
/// in arrival order by the same consumer.
pub struct PartitionWorkers<H> {
    receivers: Vec<mpsc::Receiver<CanonicalEvent>>,
    router: Arc<EventRouter<H>>,
    retry: RetryPolicy,
}

pub fn partitioned<H: LifecycleHandler>(
    router: Arc<EventRouter<H>>,
    config: &SyncConfig,
) -> (QueueHandle, PartitionWorkers<H>) {
    let count = config.partitions.max(1);
    let capacity = config.queue_capacity.max(1);
    let (senders, receivers): (Vec<_>, Vec<_>) =
        (0..count)
            .map(|_| mpsc::channel::<CanonicalEvent>(capacity))
            .unzip();

    let handle = QueueHandle {
        partitions: senders.into(),
        enqueue_timeout: config.enqueue_timeout,
    };
    let workers = PartitionWorkers {
        receivers,
        router,
        retry: config.retry.clone(),
    };
    (handle, workers)
}

impl QueueHandle {
    /// Waits at most the enqueue timeout for room in the event's partition.
    #[cfg(test)]
    pub(crate) async fn enqueue(&self, event: CanonicalEvent) -> Result<(), EnqueueError> {
        self.enqueue_until(event, Instant::now() + self.enqueue_timeout)
            .await
    }

    /// Enqueues a whole delivery. The enqueue timeout bounds the batch, so a
    /// full partition costs one timeout, not one per event.
    pub async fn enqueue_batch(&self, events: Vec<CanonicalEvent>) -> BatchEnqueue {
        let deadline = Instant::now() + self.enqueue_timeout;
        let mut report = BatchEnqueue::default();
        for event in events {
            match self.enqueue_until(event, deadline).await {
                Ok(()) => report.accepted += 1,
                Err(_) => report.dropped += 1,
            }
        }
        report
    }

    /// Dropped events are logged with their identity for reconciliation.
    async fn enqueue_until(
        &self,
        event: CanonicalEvent,
        deadline: Instant,
    ) -> Result<(), EnqueueError> {
        let partition = self.partition_for(event.partition_key());
        let sender = &self.partitions[partition];
        let remaining = deadline.saturating_duration_since(Instant::now());
        match sender.send_timeout(event, remaining).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let (event, failure) = match err {
                    SendTimeoutError::Timeout(event) => (event, EnqueueError::Full(partition)),
                    SendTimeoutError::Closed(event) => (event, EnqueueError::Closed(partition)),
                };
                counter!("queue_enqueue_failures_total").increment(1);
                error!(
                    stage = "queue",
                    tx_hash = %event.transaction_hash,
                    log_index = event.log_index,
                    provider = %event.provider,
                    event = %event.event_name,
                    partition,
                    error = %failure,
                    "event dropped before processing, left for reconciliation"
                );
                Err(failure)
            }
        }
    }

    fn partition_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions.len() as u64) as usize
    }
}

impl<H: LifecycleHandler> PartitionWorkers<H> {
    pub fn spawn(self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let Self {
            receivers,
            router,
            retry,
        } = self;
        receivers
            .into_iter()
            .enumerate()
            .map(|(partition, receiver)| {
                let consumer = PartitionConsumer {
                    partition,
                    receiver,
                    router: router.clone(),
                    retry: retry.clone(),
                };
                tokio::spawn(consumer.run(shutdown.clone()))
            })
            .collect()
    }
}

struct PartitionConsumer<H> {
    partition: usize,
    receiver: mpsc::Receiver<CanonicalEvent>,
    router: Arc<EventRouter<H>>,
    retry: RetryPolicy,
}

impl<H: LifecycleHandler> PartitionConsumer<H> {
    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = self.receiver.recv() => match next {
                    Some(event) => self.process(event, self.retry.attempts()).await,
                    None => break,
                },
            }
        }
        self.drain().await;
        debug!(stage = "queue", partition = self.partition, "partition consumer stopped");
    }

    /// Gives every event still buffered at shutdown one bounded attempt.
    /// New sends fail once the receiver is closed.
    async fn drain(&mut self) {
        self.receiver.close();
        let mut drained = 0usize;
        while let Some(event) = self.receiver.recv().await {
            self.process(event, 1).await;
            drained += 1;
        }
        if drained > 0 {
            debug!(
                stage = "queue",
                partition = self.partition,
                drained,
                "buffered events drained at shutdown"
            );
        }
    }

    async fn process(&self, event: CanonicalEvent, max_attempts: u32) {
        let timeout = self.retry.process_timeout;
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(timeout, self.router.route(&event)).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout(timeout)),
            };

            let err = match result {
                Ok(_) => return,
                Err(err) => err,
            };

            if !err.is_retryable() || attempt >= max_attempts {
                counter!("sync_abandoned_total").increment(1);
                error!(
                    stage = "queue",
                    tx_hash = %event.transaction_hash,
                    log_index = event.log_index,
                    provider = %event.provider,
                    event = %event.event_name,
                    attempts = attempt,
                    error = %err,
                    "event abandoned, left for reconciliation"
                );
                return;
            }

            let delay = self.retry.backoff(attempt);
            counter!("sync_retries_total").increment(1);
            warn!(
                stage = "queue",
                tx_hash = %event.transaction_hash,
                log_index = event.log_index,
                provider = %event.provider,
                event = %event.event_name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "apply failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use invoice_sync_core::EventName;

    use crate::sync::{SyncOutcome, Synchronizer};
    use crate::test_support::*;

    fn config(partitions: usize) -> SyncConfig {
        SyncConfig {
            partitions,
            queue_capacity: 16,
            enqueue_timeout: Duration::from_millis(50),
            retry: RetryPolicy {
                process_timeout: Duration::from_secs(2),
                max_attempts: 3,
                retry_base: Duration::from_millis(5),
            },
        }
    }

    /// Fails the first `failures` calls with a retryable error.
    #[derive(Default)]
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        seen: Mutex<Vec<u64>>,
    }

    impl Flaky {
        fn handle(&self, event: &CanonicalEvent) -> Result<SyncOutcome, SyncError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(SyncError::RecordNotFound {
                    token_id: "1".into(),
                });
            }
            self.seen.lock().expect("seen").push(event.block_number);
            Ok(SyncOutcome::Ignored)
        }
    }

    impl LifecycleHandler for Flaky {
        async fn on_minted(&self, e: &CanonicalEvent) -> Result<SyncOutcome, SyncError> {
            self.handle(e)
        }
        async fn on_funded(&self, e: &CanonicalEvent) -> Result<SyncOutcome, SyncError> {
            self.handle(e)
        }
        async fn on_repayment_deposited(
            &self,
            e: &CanonicalEvent,
        ) -> Result<SyncOutcome, SyncError> {
            self.handle(e)
        }
        async fn on_settled(&self, e: &CanonicalEvent) -> Result<SyncOutcome, SyncError> {
            self.handle(e)
        }
        async fn on_defaulted(&self, e: &CanonicalEvent) -> Result<SyncOutcome, SyncError> {
            self.handle(e)
        }
        async fn on_transferred(&self, e: &CanonicalEvent) -> Result<SyncOutcome, SyncError> {
            self.handle(e)
        }
        async fn on_unknown(&self, e: &CanonicalEvent) -> Result<SyncOutcome, SyncError> {
            self.handle(e)
        }
    }

    async fn wait_until<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn same_token_lands_in_same_partition() {
        let router = Arc::new(EventRouter::new(Flaky::default()));
        let (handle, _workers) = partitioned(router, &config(8));
        let a = handle.partition_for(funded("42", 1, 1, 0).partition_key());
        let b = handle.partition_for(repaid("42", 1, 9, 3).partition_key());
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn retryable_failures_are_retried_then_succeed() {
        let router = Arc::new(EventRouter::new(Flaky {
            failures: 2,
            ..Flaky::default()
        }));
        let (handle, workers) = partitioned(router.clone(), &config(2));
        let shutdown = CancellationToken::new();
        let tasks = workers.spawn(shutdown.clone());

        handle.enqueue(funded("1", 10, 5, 0)).await.expect("enqueue");
        let flaky = router.clone();
        wait_until(move || flaky.handler_seen() == vec![5]).await;
        assert_eq!(router.handler_calls(), 3);

        shutdown.cancel();
        for task in tasks {
            task.await.expect("consumer");
        }
    }

    #[tokio::test]
    async fn events_for_one_token_apply_in_order() {
        let router = Arc::new(EventRouter::new(Flaky::default()));
        let (handle, workers) = partitioned(router.clone(), &config(4));
        let shutdown = CancellationToken::new();
        let _tasks = workers.spawn(shutdown.clone());

        for block in 1..=20 {
            handle.enqueue(funded("8", 1, block, 0)).await.expect("enqueue");
        }
        let flaky = router.clone();
        wait_until(move || flaky.handler_seen().len() == 20).await;
        assert_eq!(router.handler_seen(), (1..=20).collect::<Vec<_>>());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn enqueue_fails_once_consumers_stopped() {
        let router = Arc::new(EventRouter::new(Flaky::default()));
        let (handle, workers) = partitioned(router, &config(1));
        drop(workers);

        let err = handle
            .enqueue(funded("1", 1, 1, 0))
            .await
            .expect_err("closed");
        assert!(matches!(err, EnqueueError::Closed(0)));
    }

    #[tokio::test]
    async fn one_deadline_covers_a_whole_delivery() {
        let router = Arc::new(EventRouter::new(Flaky::default()));
        let mut settings = config(1);
        settings.queue_capacity = 1;
        settings.enqueue_timeout = Duration::from_millis(100);
        let (handle, _workers) = partitioned(router, &settings);

        let events = (1..=6).map(|block| funded("3", 1, block, 0)).collect();
        let started = Instant::now();
        let report = handle.enqueue_batch(events).await;

        assert_eq!(report, BatchEnqueue { accepted: 1, dropped: 5 });
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn buffered_events_are_applied_after_shutdown() {
        let (_dir, database) = setup_db().await;
        let router = Arc::new(EventRouter::new(Synchronizer::new(
            database.clone(),
            fixed_clock(),
        )));
        let (handle, workers) = partitioned(router, &config(1));

        let events = [minted("64", 1, 0), funded("64", 100, 2, 0), funded("64", 200, 3, 0)];
        for event in &events {
            handle.enqueue(event.clone()).await.expect("enqueue");
        }

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        for task in workers.spawn(shutdown) {
            task.await.expect("consumer");
        }

        for event in &events {
            let entry = database
                .applied_events()
                .fetch(&event.transaction_hash, event.log_index)
                .await
                .expect("fetch");
            assert!(entry.is_some(), "event at block {} was lost", event.block_number);
        }
        assert!(matches!(
            handle.enqueue(funded("64", 1, 4, 0)).await,
            Err(EnqueueError::Closed(0))
        ));
    }

    #[tokio::test]
    async fn queued_funding_reaches_the_database() {
        let (_dir, database) = setup_db().await;
        let router = Arc::new(EventRouter::new(Synchronizer::new(
            database.clone(),
            fixed_clock(),
        )));
        let (handle, workers) = partitioned(router, &config(4));
        let shutdown = CancellationToken::new();
        let _tasks = workers.spawn(shutdown.clone());

        let mint = minted("77", 1, 0);
        let fund = funded("77", 250_000, 2, 0);
        assert_eq!(fund.event_name, EventName::Funded);
        handle.enqueue(mint).await.expect("enqueue mint");
        handle.enqueue(fund.clone()).await.expect("enqueue fund");

        for _ in 0..200 {
            let entry = database
                .applied_events()
                .fetch(&fund.transaction_hash, fund.log_index)
                .await
                .expect("fetch");
            if entry.is_some() {
                shutdown.cancel();
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("funding event was never applied");
    }

    impl EventRouter<Flaky> {
        fn handler_seen(&self) -> Vec<u64> {
            self.handler().seen.lock().expect("seen").clone()
        }

        fn handler_calls(&self) -> u32 {
            self.handler().calls.load(Ordering::SeqCst)
        }
    }
}
