use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use url::Url;

use invoice_sync_chain::JsonRpcClient;
use invoice_sync_core::abi::EventSignature;
use invoice_sync_core::{CanonicalEvent, DecodedFields, EventName, Normalizer, ProviderId, RawLog};
use invoice_sync_storage::Database;
use invoice_sync_util::{ReconcileConfig, Secret, SyncConfig, WebhookSecrets};

use crate::dispatch::EventRouter;
use crate::queue;
use crate::reconcile::{ReconcileService, ReconcileWorker};
use crate::router::AppState;
use crate::signature::SignatureVerifier;
use crate::sync::{Clock, Synchronizer};
use crate::telemetry;

pub const CONTRACT: &str = "0x00000000000000000000000000000000000c0de1";
pub const ZERO: &str = "0x0000000000000000000000000000000000000000";
pub const ALICE: &str = "0x00000000000000000000000000000000000a11ce";
pub const BOB: &str = "0x0000000000000000000000000000000000000b0b";
pub const FIXED_NOW: &str = "2024-05-01T12:00:00Z";

pub async fn setup_db() -> (TempDir, Database) {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("sync.db").display());
    let database = Database::connect(&url).await.expect("connect");
    database.run_migrations().await.expect("migrations");
    (dir, database)
}

pub fn fixed_now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(FIXED_NOW)
        .expect("fixed time")
        .with_timezone(&Utc)
}

pub fn fixed_clock() -> Clock {
    let now = fixed_now();
    Arc::new(move || now)
}

pub fn tx_hash(block: u64, log: u64) -> String {
    format!("0x{:064x}", block * 1_000 + log)
}

pub fn block_time(block: u64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_714_000_000 + (block as i64) * 12, 0).expect("timestamp")
}

fn canonical(block: u64, log: u64, name: EventName, fields: DecodedFields) -> CanonicalEvent {
    CanonicalEvent {
        provider: ProviderId::Quicknode,
        event_name: name,
        network: "eth-mainnet".into(),
        block_number: block,
        block_hash: format!("0x{block:064x}"),
        block_timestamp: block_time(block),
        transaction_hash: tx_hash(block, log),
        transaction_index: 0,
        log_index: log,
        contract_address: CONTRACT.into(),
        decoded_fields: fields,
        received_at: fixed_now(),
    }
}

pub fn minted(token: &str, block: u64, log: u64) -> CanonicalEvent {
    canonical(
        block,
        log,
        EventName::Minted,
        DecodedFields::Transfer {
            from: ZERO.into(),
            to: ALICE.into(),
            token_id: token.into(),
        },
    )
}

pub fn transferred(token: &str, to: &str, block: u64, log: u64) -> CanonicalEvent {
    canonical(
        block,
        log,
        EventName::Transferred,
        DecodedFields::Transfer {
            from: ALICE.into(),
            to: to.into(),
            token_id: token.into(),
        },
    )
}

pub fn funded(token: &str, cents: i64, block: u64, log: u64) -> CanonicalEvent {
    canonical(
        block,
        log,
        EventName::Funded,
        DecodedFields::Funded {
            token_id: token.into(),
            investor: BOB.into(),
            amount_cents: cents,
            funding_target_cents: 1_000_000,
        },
    )
}

pub fn repaid(token: &str, cents: i64, block: u64, log: u64) -> CanonicalEvent {
    canonical(
        block,
        log,
        EventName::RepaymentDeposited,
        DecodedFields::RepaymentDeposited {
            token_id: token.into(),
            payer: ALICE.into(),
            amount_cents: cents,
        },
    )
}

pub fn settled(token: &str, block: u64, log: u64) -> CanonicalEvent {
    canonical(
        block,
        log,
        EventName::Settled,
        DecodedFields::Settled {
            token_id: token.into(),
            total_repaid_cents: 1_000_000,
            yield_cents: 25_000,
        },
    )
}

pub fn defaulted(token: &str, block: u64, log: u64) -> CanonicalEvent {
    canonical(
        block,
        log,
        EventName::Defaulted,
        DecodedFields::Defaulted {
            token_id: token.into(),
            outstanding_cents: 0,
        },
    )
}

pub fn unknown(block: u64, log: u64) -> CanonicalEvent {
    canonical(
        block,
        log,
        EventName::Unknown,
        DecodedFields::Unknown {
            topics: vec![format!("0x{:064x}", 0xdead_u64)],
            data: "0x".into(),
        },
    )
}

pub fn uint_topic(value: u128) -> String {
    format!("0x{value:064x}")
}

pub fn address_topic(address: &str) -> String {
    format!("0x{:0>64}", address.trim_start_matches("0x"))
}

/// Six token decimals, so one cent is 10^4 base units.
pub fn amount_word(cents: u128) -> String {
    format!("{:064x}", cents * 10_000)
}

fn rpc_log(topics: Vec<String>, data: String, block: u64, log: u64) -> Value {
    json!({
        "address": CONTRACT,
        "topics": topics,
        "data": data,
        "blockNumber": format!("{block:#x}"),
        "blockHash": format!("0x{block:064x}"),
        "transactionHash": tx_hash(block, log),
        "transactionIndex": "0x0",
        "logIndex": format!("{log:#x}"),
        "removed": false
    })
}

pub fn mint_log(token: u128, block: u64, log: u64) -> Value {
    rpc_log(
        vec![
            EventSignature::Transfer.topic(),
            address_topic(ZERO),
            address_topic(ALICE),
            uint_topic(token),
        ],
        "0x".into(),
        block,
        log,
    )
}

pub fn funded_log(token: u128, cents: u128, block: u64, log: u64) -> Value {
    rpc_log(
        vec![
            EventSignature::InvoiceFunded.topic(),
            uint_topic(token),
            address_topic(BOB),
        ],
        format!("0x{}{}", amount_word(cents), amount_word(1_000_000)),
        block,
        log,
    )
}

pub fn raw_log(value: Value) -> RawLog {
    serde_json::from_value(value).expect("raw log")
}

pub const ALCHEMY_SECRET: &[u8] = b"alchemy-secret";
pub const QUICKNODE_SECRET: &[u8] = b"quicknode-secret";

/// Application state wired to a real synchronizer and running queue
/// consumers. Consumers stop when the harness is dropped.
pub struct Harness {
    pub state: AppState,
    pub shutdown: CancellationToken,
    _reconcile_worker: Option<ReconcileWorker<JsonRpcClient, Synchronizer>>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub async fn app_state(database: &Database, admin_token: Option<&str>) -> Harness {
    build_harness(database, admin_token, false).await
}

/// Like [`app_state`], with a reconcile service whose worker is held but
/// never started, so triggers are accepted and left queued.
pub async fn app_state_with_reconcile(database: &Database, admin_token: Option<&str>) -> Harness {
    build_harness(database, admin_token, true).await
}

async fn build_harness(database: &Database, admin_token: Option<&str>, with_reconcile: bool) -> Harness {
    let metrics = telemetry::init_metrics().expect("metrics init");
    let normalizer = Arc::new(Normalizer::new(6, "eth-mainnet", [CONTRACT]));
    let router = Arc::new(EventRouter::new(Synchronizer::new(
        database.clone(),
        fixed_clock(),
    )));
    let shutdown = CancellationToken::new();
    let (queue, workers) = queue::partitioned(router.clone(), &SyncConfig::default());
    workers.spawn(shutdown.clone());

    let (reconcile, worker) = if with_reconcile {
        let endpoint = Url::parse("http://127.0.0.1:9/").expect("url");
        let chain = JsonRpcClient::new(endpoint, Duration::from_secs(1)).expect("client");
        let (service, worker) = ReconcileService::new(
            database.clone(),
            chain,
            router,
            normalizer.clone(),
            vec![CONTRACT.to_string()],
            ReconcileConfig::default(),
            fixed_clock(),
            shutdown.clone(),
        );
        (Some(service), Some(worker))
    } else {
        (None, None)
    };

    let verifier = SignatureVerifier::new(WebhookSecrets {
        alchemy: Some(Secret::new(ALCHEMY_SECRET.to_vec())),
        quicknode: Some(Secret::new(QUICKNODE_SECRET.to_vec())),
    });
    let state = AppState::new(
        metrics,
        database.clone(),
        normalizer,
        verifier,
        queue,
        reconcile,
        admin_token.map(|token| Secret::new(token.as_bytes().to_vec())),
    )
    .with_clock(fixed_clock());

    Harness {
        state,
        shutdown,
        _reconcile_worker: worker,
    }
}
