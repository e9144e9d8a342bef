use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tokio::{
    sync::mpsc,
    time::{interval, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use invoice_sync_chain::{ChainError, ChainReader, LogFilter};
use invoice_sync_core::{LogContext, Normalizer, ProviderId, RawLog};
use invoice_sync_storage::{CheckpointError, CheckpointStatus, Database, ReconcileCheckpoint};
use invoice_sync_util::ReconcileConfig;

use crate::dispatch::{EventRouter, LifecycleHandler};
use crate::sync::{Clock, SyncError, SyncOutcome};

/// Handle used to request reconciliation runs.
#[derive(Clone)]
pub struct ReconcileService {
    sender: mpsc::Sender<ReconcileCommand>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconcileCommand {
    Range { from: u64, to: u64 },
    CatchUp,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileTriggerError {
    #[error("reconcile worker channel closed")]
    ChannelClosed,
    #[error("from_block {from} is after to_block {to}")]
    InvalidRange { from: u64, to: u64 },
}

impl ReconcileService {
    #[allow(clippy::too_many_arguments)]
    pub fn new<C, H>(
        database: Database,
        chain: C,
        router: Arc<EventRouter<H>>,
        normalizer: Arc<Normalizer>,
        contracts: Vec<String>,
        config: ReconcileConfig,
        clock: Clock,
        shutdown: CancellationToken,
    ) -> (Self, ReconcileWorker<C, H>)
    where
        C: ChainReader,
        H: LifecycleHandler,
    {
        let (sender, receiver) = mpsc::channel(8);
        let worker = ReconcileWorker {
            database,
            chain,
            router,
            normalizer,
            contracts,
            config,
            clock,
            shutdown,
            receiver,
        };
        (Self { sender }, worker)
    }

    /// Queues a replay of `[from, to]`.
    pub async fn trigger_range(&self, from: u64, to: u64) -> Result<(), ReconcileTriggerError> {
        if from > to {
            return Err(ReconcileTriggerError::InvalidRange { from, to });
        }
        self.send(ReconcileCommand::Range { from, to }).await
    }

    /// Queues a run from the checkpoint up to the confirmed head.
    pub async fn trigger_catch_up(&self) -> Result<(), ReconcileTriggerError> {
        self.send(ReconcileCommand::CatchUp).await
    }

    async fn send(&self, command: ReconcileCommand) -> Result<(), ReconcileTriggerError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| ReconcileTriggerError::ChannelClosed)
    }
}

/// Per-run counts by outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub applied: u64,
    pub duplicate: u64,
    pub rejected: u64,
    pub ignored: u64,
    pub undecodable: u64,
    pub failed: u64,
    pub last_block: Option<u64>,
    pub cancelled: bool,
}

impl BackfillReport {
    fn record(&mut self, result: &'static str) {
        match result {
            "applied" => self.applied += 1,
            "duplicate" => self.duplicate += 1,
            "rejected" => self.rejected += 1,
            "ignored" => self.ignored += 1,
            "undecodable" => self.undecodable += 1,
            _ => self.failed += 1,
        }
        counter!("reconcile_logs_total", "result" => result).increment(1);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("chain reader error: {0}")]
    Chain(#[from] ChainError),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("from_block {from} is after to_block {to}")]
    InvalidRange { from: u64, to: u64 },
    #[error("log {tx_hash}:{log_index} could not be replayed: {reason}")]
    Replay {
        tx_hash: String,
        log_index: String,
        reason: String,
    },
}

/// Why one log could not be replayed.
#[derive(Debug, thiserror::Error)]
enum ReplayError {
    #[error("timestamp of block {block} unavailable: {reason}")]
    Timestamp { block: u64, reason: String },
    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl ReplayError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Timestamp { .. } => true,
            Self::Sync(err) => err.is_retryable(),
        }
    }
}

/// Whether a run moves the stored checkpoint forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Range,
    CatchUp,
}

pub struct ReconcileWorker<C, H> {
    database: Database,
    chain: C,
    router: Arc<EventRouter<H>>,
    normalizer: Arc<Normalizer>,
    contracts: Vec<String>,
    config: ReconcileConfig,
    clock: Clock,
    shutdown: CancellationToken,
    receiver: mpsc::Receiver<ReconcileCommand>,
}

impl<C, H> ReconcileWorker<C, H>
where
    C: ChainReader,
    H: LifecycleHandler,
{
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(mut self) {
        let mut ticker = self.config.interval.map(|period| {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = next_tick(&mut ticker) => {
                    if let Err(err) = self.catch_up().await {
                        error!(stage = "reconcile", error = %err, "scheduled reconciliation failed");
                    }
                }
                command = self.receiver.recv() => {
                    let result = match command {
                        Some(ReconcileCommand::Range { from, to }) => self.backfill(from, to).await,
                        Some(ReconcileCommand::CatchUp) => self.catch_up().await,
                        None => break,
                    };
                    if let Err(err) = result {
                        error!(stage = "reconcile", error = %err, "requested reconciliation failed");
                    }
                }
            }
        }
        debug!(stage = "reconcile", "reconcile worker stopped");
    }

    /// Replays every log of `[from, to]` through the lifecycle router.
    /// Already applied logs are ledger duplicates, so overlapping runs are safe.
    pub async fn backfill(&self, from: u64, to: u64) -> Result<BackfillReport, ReconcileError> {
        if from > to {
            return Err(ReconcileError::InvalidRange { from, to });
        }
        self.run_range(from, to, RunMode::Range).await
    }

    /// Replays from the checkpoint (or the configured start block) up to
    /// `head - confirmations`.
    pub async fn catch_up(&self) -> Result<BackfillReport, ReconcileError> {
        let head = match self.chain.block_number().await {
            Ok(head) => head,
            Err(err) => {
                self.fail_run(None, &err.to_string()).await;
                return Err(err.into());
            }
        };
        let safe_head = head.saturating_sub(self.config.confirmations);
        let from = self
            .database
            .checkpoints()
            .fetch(self.network())
            .await?
            .and_then(|checkpoint| checkpoint.last_block)
            .map(|block| block.saturating_add(1))
            .unwrap_or(self.config.start_block);

        if from > safe_head {
            debug!(stage = "reconcile", from, safe_head, "nothing to reconcile");
            return Ok(BackfillReport::default());
        }
        self.run_range(from, safe_head, RunMode::CatchUp).await
    }

    async fn run_range(
        &self,
        from: u64,
        to: u64,
        mode: RunMode,
    ) -> Result<BackfillReport, ReconcileError> {
        let network = self.network().to_string();
        let existing = self.database.checkpoints().fetch(&network).await?;
        let mut checkpoint_block = existing.and_then(|checkpoint| checkpoint.last_block);
        let mut report = BackfillReport::default();
        let mut timestamps: HashMap<u64, DateTime<Utc>> = HashMap::new();
        let chunk_size = self.config.chunk_size.max(1);

        info!(stage = "reconcile", network = %network, from, to, ?mode, "reconciliation started");
        self.save_checkpoint(checkpoint_block, CheckpointStatus::Running, None)
            .await?;

        let mut start = from;
        loop {
            if self.shutdown.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let end = start.saturating_add(chunk_size - 1).min(to);
            let filter = LogFilter {
                from_block: start,
                to_block: end,
                addresses: self.contracts.clone(),
            };
            let mut logs = match self.chain.get_logs(&filter).await {
                Ok(logs) => logs,
                Err(err) => {
                    self.fail_run(checkpoint_block, &err.to_string()).await;
                    return Err(err.into());
                }
            };
            logs.sort_by_key(RawLog::position);

            // A log that keeps failing stops the run so the checkpoint never
            // moves past it.
            for log in &logs {
                match self.replay_with_retry(log, &mut timestamps).await {
                    Ok(result) => report.record(result),
                    Err(err) => {
                        report.record("failed");
                        let failure = ReconcileError::Replay {
                            tx_hash: log.transaction_hash.clone().unwrap_or_else(|| "-".into()),
                            log_index: log
                                .log_index
                                .map_or_else(|| "-".into(), |index| index.0.to_string()),
                            reason: err.to_string(),
                        };
                        self.fail_run(checkpoint_block, &failure.to_string()).await;
                        return Err(failure);
                    }
                }
            }

            report.last_block = Some(end);
            if mode == RunMode::CatchUp {
                checkpoint_block = Some(end);
            }
            self.save_checkpoint(checkpoint_block, CheckpointStatus::Running, None)
                .await?;
            debug!(stage = "reconcile", from = start, to = end, logs = logs.len(), "chunk reconciled");

            if end >= to {
                break;
            }
            start = end + 1;
        }

        let status = if report.cancelled { "cancelled" } else { "completed" };
        self.save_checkpoint(checkpoint_block, CheckpointStatus::Idle, None)
            .await?;
        counter!("reconcile_runs_total", "status" => status).increment(1);
        info!(
            stage = "reconcile",
            network = %network,
            status,
            applied = report.applied,
            duplicate = report.duplicate,
            rejected = report.rejected,
            ignored = report.ignored,
            undecodable = report.undecodable,
            failed = report.failed,
            "reconciliation finished"
        );
        Ok(report)
    }

    async fn replay_with_retry(
        &self,
        log: &RawLog,
        timestamps: &mut HashMap<u64, DateTime<Utc>>,
    ) -> Result<&'static str, ReplayError> {
        let policy = &self.config.retry;
        let mut attempt = 1;
        loop {
            let err = match self.replay(log, timestamps).await {
                Ok(result) => return Ok(result),
                Err(err) => err,
            };
            if !err.is_retryable() || attempt >= policy.attempts() {
                error!(
                    stage = "reconcile",
                    tx_hash = log.transaction_hash.as_deref().unwrap_or("-"),
                    log_index = ?log.log_index.map(|index| index.0),
                    provider = "rpc",
                    attempts = attempt,
                    error = %err,
                    "replayed log failed"
                );
                return Err(err);
            }
            let delay = policy.backoff(attempt);
            counter!("reconcile_retries_total").increment(1);
            warn!(
                stage = "reconcile",
                tx_hash = log.transaction_hash.as_deref().unwrap_or("-"),
                log_index = ?log.log_index.map(|index| index.0),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "replay failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn replay(
        &self,
        log: &RawLog,
        timestamps: &mut HashMap<u64, DateTime<Utc>>,
    ) -> Result<&'static str, ReplayError> {
        let tx_hash = log.transaction_hash.as_deref().unwrap_or("-");
        let log_index = log.log_index.map(|index| index.0);

        let block_timestamp = match (log.block_timestamp, log.block_number) {
            (None, Some(block)) if self.normalizer.decoder().watches(&log.address) => {
                Some(self.block_timestamp(block.0, timestamps).await?)
            }
            _ => None,
        };
        let ctx = LogContext {
            provider: ProviderId::Rpc,
            network: self.normalizer.network(),
            block_timestamp,
            received_at: self.now(),
        };

        // Undecodable logs are permanent defects of the log itself; retrying
        // cannot fix them, so they are counted and skipped.
        let event = match self.normalizer.decoder().decode(log, &ctx) {
            Ok(Some(event)) => event,
            Ok(None) => return Ok("ignored"),
            Err(err) => {
                warn!(stage = "reconcile", tx_hash, ?log_index, provider = "rpc", error = %err, "log could not be decoded");
                return Ok("undecodable");
            }
        };

        let timeout = self.config.retry.process_timeout;
        let outcome = match tokio::time::timeout(timeout, self.router.route(&event)).await {
            Ok(result) => result?,
            Err(_) => return Err(SyncError::Timeout(timeout).into()),
        };
        Ok(match outcome {
            SyncOutcome::Applied { .. } => "applied",
            SyncOutcome::Duplicate => "duplicate",
            SyncOutcome::Rejected { .. } => "rejected",
            SyncOutcome::Ignored => "ignored",
        })
    }

    async fn block_timestamp(
        &self,
        block: u64,
        cache: &mut HashMap<u64, DateTime<Utc>>,
    ) -> Result<DateTime<Utc>, ReplayError> {
        if let Some(timestamp) = cache.get(&block) {
            return Ok(*timestamp);
        }
        let unavailable = |reason: String| ReplayError::Timestamp { block, reason };
        let seconds = self
            .chain
            .block_timestamp(block)
            .await
            .map_err(|err| unavailable(err.to_string()))?
            .ok_or_else(|| unavailable("block not found".into()))?;
        let timestamp = i64::try_from(seconds)
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| unavailable(format!("{seconds} is out of range")))?;
        cache.insert(block, timestamp);
        Ok(timestamp)
    }

    async fn save_checkpoint(
        &self,
        last_block: Option<u64>,
        status: CheckpointStatus,
        error_message: Option<String>,
    ) -> Result<(), CheckpointError> {
        let now = self.now();
        self.database
            .checkpoints()
            .upsert(&ReconcileCheckpoint {
                network: self.network().to_string(),
                last_block,
                status,
                error_message,
                last_run_at: Some(now),
                updated_at: now,
            })
            .await
    }

    async fn fail_run(&self, last_block: Option<u64>, message: &str) {
        counter!("reconcile_runs_total", "status" => "error").increment(1);
        let last_block = match last_block {
            Some(block) => Some(block),
            None => self
                .database
                .checkpoints()
                .fetch(self.network())
                .await
                .ok()
                .flatten()
                .and_then(|checkpoint| checkpoint.last_block),
        };
        if let Err(err) = self
            .save_checkpoint(last_block, CheckpointStatus::Error, Some(message.to_string()))
            .await
        {
            warn!(stage = "reconcile", error = %err, "failed to record reconciliation error");
        }
    }

    fn network(&self) -> &str {
        self.normalizer.network()
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
