use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Sqlite, SqlitePool, Transaction,
};
use thiserror::Error;
use uuid::Uuid;

use invoice_sync_core::{
    EventName, EventPosition, InvoiceLifecycleRecord, LedgerOutcome, LifecycleStatus, ProviderId,
    TransactionKind,
};

const UNIQUE_VIOLATION: &str = "2067";
const PRIMARY_KEY_VIOLATION: &str = "1555";

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    /// Pragmas are set per connection through the connect options.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Connect)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Begins a SQLite transaction.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }

    /// Returns a handle for invoice lifecycle records.
    pub fn lifecycle(&self) -> LifecycleRepository {
        LifecycleRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for the applied-event ledger.
    pub fn applied_events(&self) -> AppliedEventRepository {
        AppliedEventRepository {
            pool: self.pool.clone(),
        }
    }

    pub fn ownership(&self) -> OwnershipRepository {
        OwnershipRepository {
            pool: self.pool.clone(),
        }
    }

    pub fn transactions(&self) -> InvoiceTransactionRepository {
        InvoiceTransactionRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for reconciliation checkpoints.
    pub fn checkpoints(&self) -> CheckpointRepository {
        CheckpointRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => matches!(
            db_err.code().as_deref(),
            Some(UNIQUE_VIOLATION | PRIMARY_KEY_VIOLATION)
        ),
        _ => false,
    }
}

/// Repository for the `invoices` table.
#[derive(Clone)]
pub struct LifecycleRepository {
    pool: SqlitePool,
}

const INVOICE_COLUMNS: &str = "id, contract_address, token_id, lifecycle_status, owner_address, minted_at, \
     mint_tx_hash, funding_target_cents, funded_amount_cents, expected_repayment_cents, \
     repaid_amount_cents, distributed_yield_cents, settled_at, defaulted_at, \
     last_applied_event, last_lifecycle_event, last_ownership_event, updated_at";

impl LifecycleRepository {
    /// Loads the record holding `token_id` on `contract_address`.
    pub async fn fetch_by_token(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        contract_address: &str,
        token_id: &str,
    ) -> Result<Option<InvoiceLifecycleRecord>, LifecycleError> {
        let row = sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE contract_address = ? AND token_id = ?"
        ))
        .bind(contract_address.to_ascii_lowercase())
        .bind(token_id)
        .fetch_optional(&mut **tx)
        .await?;
        row.map(InvoiceRow::into_domain).transpose()
    }

    /// Loads the record whose mint was requested in `tx_hash`.
    pub async fn fetch_by_mint_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        tx_hash: &str,
    ) -> Result<Option<InvoiceLifecycleRecord>, LifecycleError> {
        let row = sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE mint_tx_hash = ? \
             ORDER BY created_at LIMIT 1"
        ))
        .bind(tx_hash)
        .fetch_optional(&mut **tx)
        .await?;
        row.map(InvoiceRow::into_domain).transpose()
    }

    /// Loads a record by invoice id outside of a transaction.
    pub async fn fetch(
        &self,
        invoice_id: &str,
    ) -> Result<Option<InvoiceLifecycleRecord>, LifecycleError> {
        let row = sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = ?"
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(InvoiceRow::into_domain).transpose()
    }

    /// Inserts or updates `record`, provided the stored `last_applied_event`
    /// still equals `expected_prior`. A mismatch means another writer got
    /// there first and surfaces as [`LifecycleError::Conflict`].
    pub async fn upsert(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        record: &InvoiceLifecycleRecord,
        expected_prior: Option<EventPosition>,
    ) -> Result<(), LifecycleError> {
        let now = to_rfc3339(record.updated_at);
        let result = sqlx::query(
            "INSERT INTO invoices \
             (id, contract_address, token_id, lifecycle_status, owner_address, minted_at, \
              mint_tx_hash, funding_target_cents, funded_amount_cents, expected_repayment_cents, \
              repaid_amount_cents, distributed_yield_cents, settled_at, defaulted_at, \
              last_applied_event, last_lifecycle_event, last_ownership_event, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
                 contract_address = excluded.contract_address, \
                 token_id = excluded.token_id, \
                 lifecycle_status = excluded.lifecycle_status, \
                 owner_address = excluded.owner_address, \
                 minted_at = excluded.minted_at, \
                 mint_tx_hash = excluded.mint_tx_hash, \
                 funding_target_cents = excluded.funding_target_cents, \
                 funded_amount_cents = excluded.funded_amount_cents, \
                 expected_repayment_cents = excluded.expected_repayment_cents, \
                 repaid_amount_cents = excluded.repaid_amount_cents, \
                 distributed_yield_cents = excluded.distributed_yield_cents, \
                 settled_at = excluded.settled_at, \
                 defaulted_at = excluded.defaulted_at, \
                 last_applied_event = excluded.last_applied_event, \
                 last_lifecycle_event = excluded.last_lifecycle_event, \
                 last_ownership_event = excluded.last_ownership_event, \
                 updated_at = excluded.updated_at \
             WHERE invoices.last_applied_event IS ?",
        )
        .bind(&record.invoice_id)
        .bind(&record.contract_address)
        .bind(&record.token_id)
        .bind(record.status.as_str())
        .bind(&record.owner_address)
        .bind(record.minted_at.map(to_rfc3339))
        .bind(&record.mint_tx_hash)
        .bind(record.funding_target_cents)
        .bind(record.funded_amount_cents)
        .bind(record.expected_repayment_cents)
        .bind(record.repaid_amount_cents)
        .bind(record.distributed_yield_cents)
        .bind(record.settled_at.map(to_rfc3339))
        .bind(record.defaulted_at.map(to_rfc3339))
        .bind(record.last_applied_event.map(EventPosition::to_key))
        .bind(record.last_lifecycle_event.map(EventPosition::to_key))
        .bind(record.last_ownership_event.map(EventPosition::to_key))
        .bind(&now)
        .bind(&now)
        .bind(expected_prior.map(EventPosition::to_key))
        .execute(&mut **tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                LifecycleError::TokenConflict(record.token_id.clone().unwrap_or_default())
            } else {
                LifecycleError::Database(err)
            }
        })?;

        if result.rows_affected() == 0 {
            return Err(LifecycleError::Conflict {
                invoice_id: record.invoice_id.clone(),
            });
        }
        Ok(())
    }

    /// Read-only status view consumed by the rest of the system.
    pub async fn fetch_status(
        &self,
        invoice_id: &str,
    ) -> Result<Option<LifecycleStatusView>, LifecycleError> {
        Ok(self.fetch(invoice_id).await?.map(|record| LifecycleStatusView {
            invoice_id: record.invoice_id,
            token_id: record.token_id,
            status: record.status,
            owner_address: record.owner_address,
            funded_amount_cents: record.funded_amount_cents,
            repaid_amount_cents: record.repaid_amount_cents,
            last_applied_event: record.last_applied_event,
            updated_at: record.updated_at,
        }))
    }
}

/// Current lifecycle status and last applied event of one invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleStatusView {
    pub invoice_id: String,
    pub token_id: Option<String>,
    pub status: LifecycleStatus,
    pub owner_address: Option<String>,
    pub funded_amount_cents: i64,
    pub repaid_amount_cents: i64,
    pub last_applied_event: Option<EventPosition>,
    pub updated_at: DateTime<Utc>,
}

/// Errors raised by the lifecycle repository.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invoice {invoice_id} was modified concurrently")]
    Conflict { invoice_id: String },
    #[error("token {0} of this contract is already attached to another invoice")]
    TokenConflict(String),
    #[error("stored invoice row is invalid: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, sqlx::FromRow)]
struct InvoiceRow {
    id: String,
    contract_address: Option<String>,
    token_id: Option<String>,
    lifecycle_status: String,
    owner_address: Option<String>,
    minted_at: Option<DateTime<Utc>>,
    mint_tx_hash: Option<String>,
    funding_target_cents: i64,
    funded_amount_cents: i64,
    expected_repayment_cents: i64,
    repaid_amount_cents: i64,
    distributed_yield_cents: i64,
    settled_at: Option<DateTime<Utc>>,
    defaulted_at: Option<DateTime<Utc>>,
    last_applied_event: Option<String>,
    last_lifecycle_event: Option<String>,
    last_ownership_event: Option<String>,
    updated_at: DateTime<Utc>,
}

impl InvoiceRow {
    fn into_domain(self) -> Result<InvoiceLifecycleRecord, LifecycleError> {
        let status = LifecycleStatus::from_str(&self.lifecycle_status).map_err(|_| {
            LifecycleError::Corrupt(format!("unknown lifecycle status {}", self.lifecycle_status))
        })?;
        Ok(InvoiceLifecycleRecord {
            last_applied_event: parse_position(self.last_applied_event.as_deref())?,
            last_lifecycle_event: parse_position(self.last_lifecycle_event.as_deref())?,
            last_ownership_event: parse_position(self.last_ownership_event.as_deref())?,
            invoice_id: self.id,
            contract_address: self.contract_address,
            token_id: self.token_id,
            status,
            owner_address: self.owner_address,
            minted_at: self.minted_at,
            mint_tx_hash: self.mint_tx_hash,
            funding_target_cents: self.funding_target_cents,
            funded_amount_cents: self.funded_amount_cents,
            expected_repayment_cents: self.expected_repayment_cents,
            repaid_amount_cents: self.repaid_amount_cents,
            distributed_yield_cents: self.distributed_yield_cents,
            settled_at: self.settled_at,
            defaulted_at: self.defaulted_at,
            updated_at: self.updated_at,
        })
    }
}

fn parse_position(value: Option<&str>) -> Result<Option<EventPosition>, LifecycleError> {
    value
        .map(|raw| {
            EventPosition::from_str(raw)
                .map_err(|_| LifecycleError::Corrupt(format!("invalid event position {raw}")))
        })
        .transpose()
}

/// Repository for the `applied_events` ledger.
#[derive(Clone)]
pub struct AppliedEventRepository {
    pool: SqlitePool,
}

impl AppliedEventRepository {
    /// Inserts the ledger row for `(tx_hash, log_index)` unless one exists.
    ///
    /// Inside a transaction this is the first write, so it also takes the
    /// SQLite write lock that serializes concurrent appliers.
    pub async fn insert_if_absent(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        entry: &NewAppliedEvent<'_>,
    ) -> Result<LedgerInsertOutcome, LedgerError> {
        let result = sqlx::query(
            "INSERT INTO applied_events \
             (tx_hash, log_index, provider, event_name, block_number, outcome, invoice_id, detail, applied_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.tx_hash)
        .bind(to_i64(entry.log_index)?)
        .bind(entry.provider.as_str())
        .bind(entry.event_name.as_str())
        .bind(to_i64(entry.block_number)?)
        .bind(entry.outcome.as_str())
        .bind(entry.invoice_id)
        .bind(entry.detail)
        .bind(to_rfc3339(entry.applied_at))
        .execute(&mut **tx)
        .await;

        match result {
            Ok(_) => Ok(LedgerInsertOutcome::Inserted),
            Err(err) if is_unique_violation(&err) => Ok(LedgerInsertOutcome::Duplicate),
            Err(err) => Err(LedgerError::Database(err)),
        }
    }

    /// Records the final outcome of a previously inserted ledger row.
    pub async fn set_outcome(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        tx_hash: &str,
        log_index: u64,
        outcome: LedgerOutcome,
        invoice_id: Option<&str>,
        detail: Option<&str>,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            "UPDATE applied_events SET outcome = ?, invoice_id = ?, detail = ? \
             WHERE tx_hash = ? AND log_index = ?",
        )
        .bind(outcome.as_str())
        .bind(invoice_id)
        .bind(detail)
        .bind(tx_hash)
        .bind(to_i64(log_index)?)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn fetch(
        &self,
        tx_hash: &str,
        log_index: u64,
    ) -> Result<Option<AppliedEventEntry>, LedgerError> {
        let row = sqlx::query_as::<_, AppliedEventRow>(
            "SELECT tx_hash, log_index, event_name, outcome, invoice_id, detail \
             FROM applied_events WHERE tx_hash = ? AND log_index = ?",
        )
        .bind(tx_hash)
        .bind(to_i64(log_index)?)
        .fetch_optional(&self.pool)
        .await?;
        row.map(AppliedEventRow::into_domain).transpose()
    }

    /// Number of ledger rows attributed to `invoice_id`.
    pub async fn count_for_invoice(&self, invoice_id: &str) -> Result<u64, LedgerError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM applied_events WHERE invoice_id = ?")
                .bind(invoice_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }
}

/// Data required to create a ledger row.
pub struct NewAppliedEvent<'a> {
    pub tx_hash: &'a str,
    pub log_index: u64,
    pub provider: ProviderId,
    pub event_name: EventName,
    pub block_number: u64,
    pub outcome: LedgerOutcome,
    pub invoice_id: Option<&'a str>,
    pub detail: Option<&'a str>,
    pub applied_at: DateTime<Utc>,
}

/// Result of attempting to insert into the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerInsertOutcome {
    Inserted,
    Duplicate,
}

impl LedgerInsertOutcome {
    pub fn is_duplicate(self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

/// One stored ledger row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedEventEntry {
    pub tx_hash: String,
    pub log_index: u64,
    pub event_name: String,
    pub outcome: LedgerOutcome,
    pub invoice_id: Option<String>,
    pub detail: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct AppliedEventRow {
    tx_hash: String,
    log_index: i64,
    event_name: String,
    outcome: String,
    invoice_id: Option<String>,
    detail: Option<String>,
}

impl AppliedEventRow {
    fn into_domain(self) -> Result<AppliedEventEntry, LedgerError> {
        let outcome = LedgerOutcome::from_str(&self.outcome)
            .map_err(|_| LedgerError::Corrupt(self.outcome.clone()))?;
        Ok(AppliedEventEntry {
            tx_hash: self.tx_hash,
            log_index: self.log_index.max(0) as u64,
            event_name: self.event_name,
            outcome,
            invoice_id: self.invoice_id,
            detail: self.detail,
        })
    }
}

/// Errors raised by the ledger repository.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("value {0} does not fit in a sqlite integer")]
    OutOfRange(u64),
    #[error("stored ledger outcome is invalid: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn to_i64(value: u64) -> Result<i64, LedgerError> {
    i64::try_from(value).map_err(|_| LedgerError::OutOfRange(value))
}

/// Repository for the `token_ownership` collaborator table.
#[derive(Clone)]
pub struct OwnershipRepository {
    pool: SqlitePool,
}

impl OwnershipRepository {
    /// Records the owner of a token. Older positions never overwrite newer ones.
    pub async fn upsert(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        update: &OwnershipUpdate<'_>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO token_ownership \
             (contract_address, token_id, owner_address, invoice_id, last_event, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(contract_address, token_id) DO UPDATE SET \
                 owner_address = excluded.owner_address, \
                 invoice_id = excluded.invoice_id, \
                 last_event = excluded.last_event, \
                 updated_at = excluded.updated_at \
             WHERE excluded.last_event > token_ownership.last_event",
        )
        .bind(update.contract_address.to_ascii_lowercase())
        .bind(update.token_id)
        .bind(update.owner_address)
        .bind(update.invoice_id)
        .bind(update.position.to_key())
        .bind(to_rfc3339(update.updated_at))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn fetch_owner(
        &self,
        contract_address: &str,
        token_id: &str,
    ) -> Result<Option<String>, StorageError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT owner_address FROM token_ownership WHERE contract_address = ? AND token_id = ?",
        )
        .bind(contract_address.to_ascii_lowercase())
        .bind(token_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(owner,)| owner))
    }
}

pub struct OwnershipUpdate<'a> {
    pub token_id: &'a str,
    pub contract_address: &'a str,
    pub owner_address: &'a str,
    pub invoice_id: &'a str,
    pub position: EventPosition,
    pub updated_at: DateTime<Utc>,
}

/// Repository for the `invoice_transactions` collaborator table.
#[derive(Clone)]
pub struct InvoiceTransactionRepository {
    pool: SqlitePool,
}

impl InvoiceTransactionRepository {
    /// Appends a funding, repayment or settlement row. Rows are keyed by
    /// `(tx_hash, log_index)` so a replay is a no-op.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        record: &NewInvoiceTransaction<'_>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO invoice_transactions \
             (id, invoice_id, kind, amount_cents, counterparty, tx_hash, log_index, block_number, occurred_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(tx_hash, log_index) DO NOTHING",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(record.invoice_id)
        .bind(record.kind.as_str())
        .bind(record.amount_cents)
        .bind(record.counterparty)
        .bind(record.tx_hash)
        .bind(record.log_index as i64)
        .bind(record.block_number as i64)
        .bind(to_rfc3339(record.occurred_at))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn list_for_invoice(
        &self,
        invoice_id: &str,
    ) -> Result<Vec<InvoiceTransactionRow>, StorageError> {
        let rows = sqlx::query_as::<_, InvoiceTransactionRow>(
            "SELECT kind, amount_cents, counterparty, tx_hash, log_index \
             FROM invoice_transactions WHERE invoice_id = ? \
             ORDER BY block_number, log_index",
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

pub struct NewInvoiceTransaction<'a> {
    pub invoice_id: &'a str,
    pub kind: TransactionKind,
    pub amount_cents: i64,
    pub counterparty: Option<&'a str>,
    pub tx_hash: &'a str,
    pub log_index: u64,
    pub block_number: u64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct InvoiceTransactionRow {
    pub kind: String,
    pub amount_cents: i64,
    pub counterparty: Option<String>,
    pub tx_hash: String,
    pub log_index: i64,
}

/// Repository for `reconcile_checkpoints`.
#[derive(Clone)]
pub struct CheckpointRepository {
    pool: SqlitePool,
}

impl CheckpointRepository {
    pub async fn fetch(&self, network: &str) -> Result<Option<ReconcileCheckpoint>, CheckpointError> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            "SELECT network, last_block, status, error_message, last_run_at, updated_at \
             FROM reconcile_checkpoints WHERE network = ?",
        )
        .bind(network)
        .fetch_optional(&self.pool)
        .await?;
        row.map(CheckpointRow::into_domain).transpose()
    }

    /// Inserts or replaces the checkpoint for its network.
    pub async fn upsert(&self, checkpoint: &ReconcileCheckpoint) -> Result<(), CheckpointError> {
        let last_block = checkpoint
            .last_block
            .map(|block| i64::try_from(block).map_err(|_| CheckpointError::OutOfRange(block)))
            .transpose()?;
        sqlx::query(
            "INSERT INTO reconcile_checkpoints \
             (network, last_block, status, error_message, last_run_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(network) DO UPDATE SET \
                 last_block = excluded.last_block, \
                 status = excluded.status, \
                 error_message = excluded.error_message, \
                 last_run_at = excluded.last_run_at, \
                 updated_at = excluded.updated_at",
        )
        .bind(&checkpoint.network)
        .bind(last_block)
        .bind(checkpoint.status.as_str())
        .bind(&checkpoint.error_message)
        .bind(checkpoint.last_run_at.map(to_rfc3339))
        .bind(to_rfc3339(checkpoint.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Reconciliation progress for one network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileCheckpoint {
    pub network: String,
    pub last_block: Option<u64>,
    pub status: CheckpointStatus,
    pub error_message: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStatus {
    Idle,
    Running,
    Error,
}

impl CheckpointStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Error => "error",
        }
    }
}

impl FromStr for CheckpointStatus {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "error" => Ok(Self::Error),
            _ => Err(()),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CheckpointRow {
    network: String,
    last_block: Option<i64>,
    status: String,
    error_message: Option<String>,
    last_run_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl CheckpointRow {
    fn into_domain(self) -> Result<ReconcileCheckpoint, CheckpointError> {
        let status = CheckpointStatus::from_str(&self.status)
            .map_err(|_| CheckpointError::Corrupt(self.status.clone()))?;
        Ok(ReconcileCheckpoint {
            network: self.network,
            last_block: self.last_block.map(|block| block.max(0) as u64),
            status,
            error_message: self.error_message,
            last_run_at: self.last_run_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("block {0} does not fit in a sqlite integer")]
    OutOfRange(u64),
    #[error("stored checkpoint status is invalid: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup_db() -> (TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("test.db").display());
        let db = Database::connect(&url).await.expect("connect");
        db.run_migrations().await.expect("migrations");
        (dir, db)
    }

    fn ts(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    fn ledger_entry(tx_hash: &str, log_index: u64) -> NewAppliedEvent<'_> {
        NewAppliedEvent {
            tx_hash,
            log_index,
            provider: ProviderId::Alchemy,
            event_name: EventName::Funded,
            block_number: 10,
            outcome: LedgerOutcome::Applied,
            invoice_id: None,
            detail: None,
            applied_at: ts("2024-01-01T00:00:00Z"),
        }
    }

    #[tokio::test]
    async fn migrations_apply() {
        let (_dir, db) = setup_db().await;
        let tables: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'")
                .fetch_one(db.pool())
                .await
                .expect("fetch tables");
        assert!(tables.0 >= 5, "expected core tables to be created");
    }

    #[tokio::test]
    async fn ledger_insert_returns_duplicate_on_conflict() {
        let (_dir, db) = setup_db().await;
        let repo = db.applied_events();

        let mut tx = db.begin().await.expect("begin");
        let first = repo
            .insert_if_absent(&mut tx, &ledger_entry("0xabc", 3))
            .await
            .expect("insert");
        assert_eq!(first, LedgerInsertOutcome::Inserted);
        tx.commit().await.expect("commit");

        let mut tx = db.begin().await.expect("begin");
        let second = repo
            .insert_if_absent(&mut tx, &ledger_entry("0xabc", 3))
            .await
            .expect("duplicate should be ok");
        assert!(second.is_duplicate());
        let other_index = repo
            .insert_if_absent(&mut tx, &ledger_entry("0xabc", 4))
            .await
            .expect("insert");
        assert_eq!(other_index, LedgerInsertOutcome::Inserted);
        repo.set_outcome(
            &mut tx,
            "0xabc",
            4,
            LedgerOutcome::RejectedInvalidTransition,
            Some("inv-1"),
            Some("illegal"),
        )
        .await
        .expect("set outcome");
        tx.commit().await.expect("commit");

        let stored = repo.fetch("0xabc", 4).await.expect("fetch").expect("row");
        assert_eq!(stored.outcome, LedgerOutcome::RejectedInvalidTransition);
        assert_eq!(stored.invoice_id.as_deref(), Some("inv-1"));
        assert_eq!(repo.count_for_invoice("inv-1").await.expect("count"), 1);
    }

    #[tokio::test]
    async fn upsert_enforces_expected_prior_event() {
        let (_dir, db) = setup_db().await;
        let repo = db.lifecycle();
        let mut record = InvoiceLifecycleRecord::draft("inv-1", ts("2024-01-01T00:00:00Z"));
        record.funding_target_cents = 1_000;

        let mut tx = db.begin().await.expect("begin");
        repo.upsert(&mut tx, &record, None).await.expect("insert draft");

        let mut listed = record.clone();
        listed.status = LifecycleStatus::Listed;
        listed.contract_address = Some("0xc0de".into());
        listed.token_id = Some("7".into());
        listed.mint_tx_hash = Some("0xmint".into());
        listed.last_applied_event = Some(EventPosition::new(5, 0, 0));
        repo.upsert(&mut tx, &listed, None).await.expect("update");

        let err = repo
            .upsert(&mut tx, &listed, None)
            .await
            .expect_err("stale expected prior");
        assert!(matches!(err, LifecycleError::Conflict { .. }));

        let by_token = repo
            .fetch_by_token(&mut tx, "0xC0DE", "7")
            .await
            .expect("fetch")
            .expect("present");
        assert_eq!(by_token, listed);
        assert!(repo
            .fetch_by_token(&mut tx, "0xbeef", "7")
            .await
            .expect("fetch")
            .is_none());
        let by_mint = repo
            .fetch_by_mint_tx(&mut tx, "0xmint")
            .await
            .expect("fetch")
            .expect("present");
        assert_eq!(by_mint.invoice_id, "inv-1");
        tx.commit().await.expect("commit");

        let view = repo.fetch_status("inv-1").await.expect("status").expect("view");
        assert_eq!(view.status, LifecycleStatus::Listed);
        assert_eq!(view.last_applied_event, Some(EventPosition::new(5, 0, 0)));
        assert!(repo.fetch_status("missing").await.expect("status").is_none());
    }

    #[tokio::test]
    async fn token_ids_are_unique_per_contract() {
        let (_dir, db) = setup_db().await;
        let repo = db.lifecycle();
        let minted = |id: &str, contract: &str| {
            let mut record = InvoiceLifecycleRecord::draft(id, ts("2024-01-01T00:00:00Z"));
            record.contract_address = Some(contract.into());
            record.token_id = Some("7".into());
            record
        };

        let mut tx = db.begin().await.expect("begin");
        repo.upsert(&mut tx, &minted("inv-1", "0xc0de"), None)
            .await
            .expect("first");
        repo.upsert(&mut tx, &minted("inv-2", "0xbeef"), None)
            .await
            .expect("same token on another contract");
        let err = repo
            .upsert(&mut tx, &minted("inv-3", "0xc0de"), None)
            .await
            .expect_err("conflict");
        assert!(matches!(err, LifecycleError::TokenConflict(token) if token == "7"));
    }

    #[tokio::test]
    async fn ownership_ignores_older_positions() {
        let (_dir, db) = setup_db().await;
        let record = InvoiceLifecycleRecord::draft("inv-1", ts("2024-01-01T00:00:00Z"));
        let mut tx = db.begin().await.expect("begin");
        db.lifecycle().upsert(&mut tx, &record, None).await.expect("insert");

        let repo = db.ownership();
        for (owner, block) in [("0xnew", 20), ("0xold", 10)] {
            repo.upsert(
                &mut tx,
                &OwnershipUpdate {
                    token_id: "7",
                    contract_address: "0xc0de",
                    owner_address: owner,
                    invoice_id: "inv-1",
                    position: EventPosition::new(block, 0, 0),
                    updated_at: ts("2024-01-01T00:00:00Z"),
                },
            )
            .await
            .expect("upsert");
        }
        tx.commit().await.expect("commit");

        assert_eq!(
            repo.fetch_owner("0xc0de", "7").await.expect("owner").as_deref(),
            Some("0xnew")
        );
        assert!(repo.fetch_owner("0xbeef", "7").await.expect("owner").is_none());
    }

    #[tokio::test]
    async fn transactions_are_keyed_by_log() {
        let (_dir, db) = setup_db().await;
        let record = InvoiceLifecycleRecord::draft("inv-1", ts("2024-01-01T00:00:00Z"));
        let mut tx = db.begin().await.expect("begin");
        db.lifecycle().upsert(&mut tx, &record, None).await.expect("insert");
        let row = NewInvoiceTransaction {
            invoice_id: "inv-1",
            kind: TransactionKind::Funding,
            amount_cents: 600_000,
            counterparty: Some("0xinvestor"),
            tx_hash: "0xfund",
            log_index: 1,
            block_number: 12,
            occurred_at: ts("2024-01-01T00:00:00Z"),
        };
        let repo = db.transactions();
        repo.insert(&mut tx, &row).await.expect("insert");
        repo.insert(&mut tx, &row).await.expect("replay");
        tx.commit().await.expect("commit");

        let rows = repo.list_for_invoice("inv-1").await.expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, "FUNDING");
        assert_eq!(rows[0].amount_cents, 600_000);
    }

    #[tokio::test]
    async fn checkpoint_round_trips() {
        let (_dir, db) = setup_db().await;
        let repo = db.checkpoints();
        assert!(repo.fetch("eth-mainnet").await.expect("fetch").is_none());

        let checkpoint = ReconcileCheckpoint {
            network: "eth-mainnet".into(),
            last_block: Some(1_999),
            status: CheckpointStatus::Error,
            error_message: Some("rpc timeout".into()),
            last_run_at: Some(ts("2024-01-01T00:00:00Z")),
            updated_at: ts("2024-01-01T00:00:01Z"),
        };
        repo.upsert(&checkpoint).await.expect("upsert");
        let stored = repo.fetch("eth-mainnet").await.expect("fetch").expect("row");
        assert_eq!(stored, checkpoint);
    }
}
