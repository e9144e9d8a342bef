use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use metrics::counter;
use sqlx::{Sqlite, Transaction};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use invoice_sync_core::lifecycle;
use invoice_sync_core::{
    CanonicalEvent, InvoiceLifecycleRecord, LedgerOutcome, LifecycleStatus, RejectReason,
    SideEffect, Transition,
};
use invoice_sync_storage::{
    Database, LedgerError, LifecycleError, NewAppliedEvent, NewInvoiceTransaction,
    OwnershipUpdate, StorageError,
};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Applies canonical events to invoice lifecycle records, one SQLite
/// transaction per event.
#[derive(Clone)]
pub struct Synchronizer {
    database: Database,
    clock: Clock,
}

/// Final result of one apply attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Applied {
        invoice_id: String,
        from: LifecycleStatus,
        to: LifecycleStatus,
    },
    /// The ledger already holds this `(tx_hash, log_index)`.
    Duplicate,
    Rejected {
        invoice_id: Option<String>,
        reason: RejectReason,
    },
    Ignored,
}

impl SyncOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::Duplicate => "duplicate",
            Self::Rejected { .. } => "rejected",
            Self::Ignored => "ignored",
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("lifecycle store error: {0}")]
    Lifecycle(#[from] LifecycleError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("no invoice record holds token {token_id} yet")]
    RecordNotFound { token_id: String },
    #[error("apply did not finish within {0:?}")]
    Timeout(Duration),
}

impl SyncError {
    /// Whether a later attempt of the same event can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(_) | Self::RecordNotFound { .. } | Self::Timeout(_) => true,
            Self::Ledger(err) => matches!(err, LedgerError::Database(_)),
            Self::Lifecycle(err) => !matches!(err, LifecycleError::Corrupt(_)),
            Self::Storage(err) => !matches!(err, StorageError::Migration(_)),
        }
    }
}

/// How an event finds the invoice record it mutates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolve {
    /// The draft reserved for the mint transaction, else the token's record,
    /// else a fresh record.
    MintTransaction,
    /// The record holding the token on the emitting contract. A missing record
    /// is a retryable error.
    Token,
    /// No record is touched; only the ledger row is written.
    LedgerOnly,
}

struct Target {
    record: InvoiceLifecycleRecord,
    persisted: bool,
}

impl Synchronizer {
    pub fn new(database: Database, clock: Clock) -> Self {
        Self { database, clock }
    }

    /// [`Synchronizer::apply_with`] using the lookup the router's handlers use.
    #[cfg(test)]
    pub async fn apply(&self, event: &CanonicalEvent) -> Result<SyncOutcome, SyncError> {
        use invoice_sync_core::EventName;

        let resolve = match event.event_name {
            EventName::Minted => Resolve::MintTransaction,
            EventName::Unknown => Resolve::LedgerOnly,
            _ => Resolve::Token,
        };
        self.apply_with(event, resolve).await
    }

    /// Records `event` in the applied-event ledger and, when it is new and
    /// legal, advances the invoice found through `resolve`. Ledger row,
    /// record and side tables commit together.
    pub async fn apply_with(
        &self,
        event: &CanonicalEvent,
        resolve: Resolve,
    ) -> Result<SyncOutcome, SyncError> {
        let result = self.apply_in_transaction(event, resolve).await;
        let label = match &result {
            Ok(outcome) => outcome.label(),
            Err(_) => "error",
        };
        counter!(
            "sync_outcomes_total",
            "event" => event.event_name.as_str(),
            "outcome" => label
        )
        .increment(1);
        result
    }

    async fn apply_in_transaction(
        &self,
        event: &CanonicalEvent,
        resolve: Resolve,
    ) -> Result<SyncOutcome, SyncError> {
        let now = self.now();
        let ledger = self.database.applied_events();
        let mut tx = self.database.begin().await?;

        let provisional = if resolve == Resolve::LedgerOnly {
            LedgerOutcome::IgnoredUnknown
        } else {
            LedgerOutcome::Applied
        };
        let inserted = ledger
            .insert_if_absent(
                &mut tx,
                &NewAppliedEvent {
                    tx_hash: &event.transaction_hash,
                    log_index: event.log_index,
                    provider: event.provider,
                    event_name: event.event_name,
                    block_number: event.block_number,
                    outcome: provisional,
                    invoice_id: None,
                    detail: None,
                    applied_at: now,
                },
            )
            .await?;
        if inserted.is_duplicate() {
            tx.rollback().await?;
            debug!(
                stage = "sync",
                tx_hash = %event.transaction_hash,
                log_index = event.log_index,
                provider = %event.provider,
                event = %event.event_name,
                "event already in ledger"
            );
            return Ok(SyncOutcome::Duplicate);
        }

        if resolve == Resolve::LedgerOnly {
            tx.commit().await?;
            return Ok(SyncOutcome::Ignored);
        }

        let Some(token_id) = event.token_id() else {
            return self
                .reject(tx, event, None, RejectReason::FieldMismatch(event.event_name))
                .await;
        };

        let Some(target) = self
            .load_target(&mut tx, event, token_id, resolve, now)
            .await?
        else {
            tx.rollback().await?;
            return Err(SyncError::RecordNotFound {
                token_id: token_id.to_string(),
            });
        };

        let expected_prior = if target.persisted {
            target.record.last_applied_event
        } else {
            None
        };

        match lifecycle::apply(&target.record, event, now) {
            Ok(transition) => {
                let lifecycle = self.database.lifecycle();
                lifecycle
                    .upsert(&mut tx, &transition.record, expected_prior)
                    .await?;
                let invoice_id = transition.record.invoice_id.as_str();
                self.write_side_effects(&mut tx, event, invoice_id, &transition, now)
                    .await?;
                ledger
                    .set_outcome(
                        &mut tx,
                        &event.transaction_hash,
                        event.log_index,
                        LedgerOutcome::Applied,
                        Some(invoice_id),
                        None,
                    )
                    .await?;
                tx.commit().await?;

                info!(
                    stage = "sync",
                    tx_hash = %event.transaction_hash,
                    log_index = event.log_index,
                    provider = %event.provider,
                    event = %event.event_name,
                    invoice_id,
                    from = %transition.from,
                    to = %transition.to,
                    "event applied"
                );
                Ok(SyncOutcome::Applied {
                    invoice_id: invoice_id.to_string(),
                    from: transition.from,
                    to: transition.to,
                })
            }
            Err(reason) => {
                let invoice_id = target.persisted.then_some(target.record.invoice_id.as_str());
                self.reject(tx, event, invoice_id, reason).await
            }
        }
    }

    async fn load_target(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        event: &CanonicalEvent,
        token_id: &str,
        resolve: Resolve,
        now: DateTime<Utc>,
    ) -> Result<Option<Target>, SyncError> {
        let lifecycle = self.database.lifecycle();
        let minting = resolve == Resolve::MintTransaction;

        if minting {
            if let Some(record) = lifecycle
                .fetch_by_mint_tx(tx, &event.transaction_hash)
                .await?
            {
                return Ok(Some(Target {
                    record,
                    persisted: true,
                }));
            }
        }

        if let Some(record) = lifecycle
            .fetch_by_token(tx, &event.contract_address, token_id)
            .await?
        {
            return Ok(Some(Target {
                record,
                persisted: true,
            }));
        }

        if minting {
            let record = InvoiceLifecycleRecord::draft(Uuid::new_v4().to_string(), now);
            return Ok(Some(Target {
                record,
                persisted: false,
            }));
        }

        Ok(None)
    }

    async fn write_side_effects(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        event: &CanonicalEvent,
        invoice_id: &str,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        for effect in &transition.side_effects {
            match effect {
                SideEffect::Ownership {
                    token_id,
                    contract_address,
                    owner_address,
                    position,
                } => {
                    self.database
                        .ownership()
                        .upsert(
                            tx,
                            &OwnershipUpdate {
                                token_id,
                                contract_address,
                                owner_address,
                                invoice_id,
                                position: *position,
                                updated_at: now,
                            },
                        )
                        .await?;
                }
                SideEffect::Transaction {
                    kind,
                    amount_cents,
                    counterparty,
                } => {
                    self.database
                        .transactions()
                        .insert(
                            tx,
                            &NewInvoiceTransaction {
                                invoice_id,
                                kind: *kind,
                                amount_cents: *amount_cents,
                                counterparty: counterparty.as_deref(),
                                tx_hash: &event.transaction_hash,
                                log_index: event.log_index,
                                block_number: event.block_number,
                                occurred_at: event.block_timestamp,
                            },
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn reject(
        &self,
        mut tx: Transaction<'_, Sqlite>,
        event: &CanonicalEvent,
        invoice_id: Option<&str>,
        reason: RejectReason,
    ) -> Result<SyncOutcome, SyncError> {
        let detail = reason.to_string();
        self.database
            .applied_events()
            .set_outcome(
                &mut tx,
                &event.transaction_hash,
                event.log_index,
                LedgerOutcome::RejectedInvalidTransition,
                invoice_id,
                Some(&detail),
            )
            .await?;
        tx.commit().await?;

        warn!(
            stage = "sync",
            tx_hash = %event.transaction_hash,
            log_index = event.log_index,
            provider = %event.provider,
            event = %event.event_name,
            invoice_id = invoice_id.unwrap_or("-"),
            reason = %detail,
            "event rejected"
        );
        Ok(SyncOutcome::Rejected {
            invoice_id: invoice_id.map(str::to_string),
            reason,
        })
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}
