use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use metrics::{counter, histogram};
use serde_json::json;
use tracing::{debug, info, warn};

use invoice_sync_core::ProviderId;

use crate::problem::ProblemResponse;
use crate::router::AppState;

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Verifies, normalizes and enqueues one provider delivery. Once the
/// signature checks out the delivery is always acknowledged with 200;
/// processing happens on the partition consumers.
pub async fn handle(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProblemResponse> {
    let start = Instant::now();
    let Some((provider, header_name)) = push_provider(&provider) else {
        histogram!("webhook_ack_latency_seconds", "provider" => "unknown")
            .record(start.elapsed().as_secs_f64());
        return Err(ProblemResponse::new(
            StatusCode::NOT_FOUND,
            "unknown_provider",
            format!("no webhook receiver for provider '{provider}'"),
        ));
    };
    let label = provider.as_str();

    let signature = headers
        .get(header_name)
        .and_then(|value| value.to_str().ok());
    if !state.verifier().verify(provider, &body, signature) {
        counter!("webhook_invalid_signature_total", "provider" => label).increment(1);
        histogram!("webhook_ack_latency_seconds", "provider" => label)
            .record(start.elapsed().as_secs_f64());
        return Err(ProblemResponse::new(
            StatusCode::UNAUTHORIZED,
            "invalid_signature",
            "signature verification failed",
        ));
    }
    counter!("webhook_ingress_total", "provider" => label).increment(1);

    let response = match state.normalizer().normalize(provider, &body, state.now()) {
        Ok(batch) => {
            for skipped in &batch.undecodable {
                counter!("normalizer_errors_total", "provider" => label).increment(1);
                warn!(
                    stage = "normalizer",
                    provider = label,
                    tx_hash = skipped.transaction_hash.as_deref().unwrap_or("-"),
                    log_index = ?skipped.log_index,
                    error = %skipped.error,
                    "log could not be decoded, left for reconciliation"
                );
            }
            for event in &batch.events {
                counter!(
                    "normalizer_events_total",
                    "provider" => label,
                    "event" => event.event_name.as_str()
                )
                .increment(1);
                debug!(
                    stage = "normalizer",
                    provider = label,
                    event = event.event_name.as_str(),
                    tx_hash = %event.transaction_hash,
                    log_index = event.log_index,
                    "canonical event produced"
                );
            }

            let total = batch.events.len();
            let undecodable = batch.undecodable.len();
            // Enqueue failures are logged by the queue and left to reconciliation.
            let queued = state.queue().enqueue_batch(batch.events).await.accepted;
            info!(
                stage = "ingress",
                provider = label,
                events = total,
                queued,
                undecodable,
                body_len = body.len(),
                "webhook accepted"
            );
            Json(json!({
                "status": "accepted",
                "events": total,
                "queued": queued,
                "undecodable": undecodable
            }))
        }
        Err(err) => {
            counter!("normalizer_errors_total", "provider" => label).increment(1);
            warn!(
                stage = "normalizer",
                provider = label,
                error = %err,
                body_len = body.len(),
                "payload could not be normalized"
            );
            Json(json!({ "status": "ignored", "reason": err.to_string() }))
        }
    };

    histogram!("webhook_ack_latency_seconds", "provider" => label)
        .record(start.elapsed().as_secs_f64());
    Ok((StatusCode::OK, response).into_response())
}

/// Providers that push over HTTP, with the header carrying their signature.
fn push_provider(raw: &str) -> Option<(ProviderId, &'static str)> {
    let provider = raw.parse::<ProviderId>().ok()?;
    provider
        .signature_header()
        .map(|header| (provider, header))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use invoice_sync_core::{InvoiceLifecycleRecord, LifecycleStatus};
    use invoice_sync_storage::Database;

    use crate::router::app_router;
    use crate::signature::sign;
    use crate::test_support::*;

    fn signed_request(provider: &str, header: &str, secret: &[u8], body: &Value) -> Request<Body> {
        let bytes = serde_json::to_vec(body).expect("body");
        Request::builder()
            .method(Method::POST)
            .uri(format!("/webhooks/blockchain/{provider}"))
            .header("content-type", "application/json")
            .header(header, sign(secret, &bytes))
            .body(Body::from(bytes))
            .expect("request")
    }

    fn quicknode(body: &Value) -> Request<Body> {
        signed_request("quicknode", "x-quicknode-signature", QUICKNODE_SECRET, body)
    }

    fn block(number: u64, logs: Vec<Value>) -> Value {
        json!({
            "network": "eth-mainnet",
            "number": format!("{number:#x}"),
            "hash": format!("0x{number:064x}"),
            "timestamp": "0x66300000",
            "logs": logs
        })
    }

    async fn send(harness: &Harness, request: Request<Body>) -> (StatusCode, Value) {
        let response = app_router(harness.state.clone())
            .oneshot(request)
            .await
            .expect("response");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    async fn record_for_token(database: &Database, token: &str) -> Option<InvoiceLifecycleRecord> {
        let mut tx = database.begin().await.expect("begin");
        let record = database
            .lifecycle()
            .fetch_by_token(&mut tx, CONTRACT, token)
            .await
            .expect("fetch");
        tx.rollback().await.expect("rollback");
        record
    }

    async fn wait_for_ledger(database: &Database, tx_hash: &str, log_index: u64) {
        for _ in 0..300 {
            let entry = database
                .applied_events()
                .fetch(tx_hash, log_index)
                .await
                .expect("ledger");
            if entry.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("event {tx_hash}:{log_index} never reached the ledger");
    }

    #[tokio::test]
    async fn unknown_provider_is_not_found() {
        let (_dir, database) = setup_db().await;
        let harness = app_state(&database, None).await;

        let request = signed_request("infura", "x-infura-signature", b"k", &json!({}));
        let (status, body) = send(&harness, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["type"], "unknown_provider");

        let request = signed_request("rpc", "x-rpc-signature", b"k", &json!([]));
        let (status, _) = send(&harness, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bad_signature_is_unauthorized() {
        let (_dir, database) = setup_db().await;
        let harness = app_state(&database, None).await;

        let payload = block(100, vec![mint_log(7, 100, 0)]);
        let request = signed_request("quicknode", "x-quicknode-signature", b"wrong", &payload);
        let (status, body) = send(&harness, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["type"], "invalid_signature");

        let request = Request::builder()
            .method(Method::POST)
            .uri("/webhooks/blockchain/alchemy")
            .body(Body::from("{}"))
            .expect("request");
        let (status, _) = send(&harness, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn malformed_payload_is_acknowledged_and_ignored() {
        let (_dir, database) = setup_db().await;
        let harness = app_state(&database, None).await;

        let payload = json!({ "createdAt": "2024-05-01T12:00:00Z" });
        let request = signed_request("alchemy", "x-alchemy-signature", ALCHEMY_SECRET, &payload);
        let (status, body) = send(&harness, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ignored");
    }

    #[tokio::test]
    async fn multi_event_block_lands_every_event() {
        let (_dir, database) = setup_db().await;
        let harness = app_state(&database, None).await;

        let payload = block(
            100,
            vec![mint_log(1, 100, 0), mint_log(2, 100, 1), mint_log(3, 100, 2)],
        );
        let (status, body) = send(&harness, quicknode(&payload)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "accepted");
        assert_eq!(body["events"], 3);
        assert_eq!(body["queued"], 3);

        for log in 0..3 {
            wait_for_ledger(&database, &tx_hash(100, log), log).await;
        }
        for token in ["1", "2", "3"] {
            let record = record_for_token(&database, token).await.expect("record");
            assert_eq!(record.status, LifecycleStatus::Listed);
        }
    }

    #[tokio::test]
    async fn funding_across_deliveries_survives_redelivery() {
        let (_dir, database) = setup_db().await;
        let harness = app_state(&database, None).await;

        let deliveries = [
            block(100, vec![mint_log(7, 100, 0)]),
            block(101, vec![funded_log(7, 600_000, 101, 0)]),
            block(102, vec![funded_log(7, 400_000, 102, 3)]),
        ];
        for payload in &deliveries {
            let (status, _) = send(&harness, quicknode(payload)).await;
            assert_eq!(status, StatusCode::OK);
        }
        wait_for_ledger(&database, &tx_hash(102, 3), 3).await;

        let (status, body) = send(&harness, quicknode(&deliveries[2])).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["queued"], 1);

        tokio::time::sleep(Duration::from_millis(200)).await;

        let record = record_for_token(&database, "7").await.expect("record");
        assert_eq!(record.status, LifecycleStatus::FullyFunded);
        assert_eq!(record.funded_amount_cents, 1_000_000);
        assert_eq!(
            database
                .applied_events()
                .count_for_invoice(&record.invoice_id)
                .await
                .expect("count"),
            3
        );
    }

    #[tokio::test]
    async fn one_bad_log_does_not_drop_its_neighbours() {
        let (_dir, database) = setup_db().await;
        let harness = app_state(&database, None).await;

        let mut broken = funded_log(5, 100, 100, 1);
        broken["data"] = json!(format!("0x{}", amount_word(100)));
        let payload = block(100, vec![mint_log(5, 100, 0), broken]);
        let (status, body) = send(&harness, quicknode(&payload)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "accepted");
        assert_eq!(body["events"], 1);
        assert_eq!(body["undecodable"], 1);

        wait_for_ledger(&database, &tx_hash(100, 0), 0).await;
        let record = record_for_token(&database, "5").await.expect("record");
        assert_eq!(record.status, LifecycleStatus::Listed);
        assert!(database
            .applied_events()
            .fetch(&tx_hash(100, 1), 1)
            .await
            .expect("ledger")
            .is_none());
    }

    #[tokio::test]
    async fn logs_from_other_contracts_are_not_queued() {
        let (_dir, database) = setup_db().await;
        let harness = app_state(&database, None).await;

        let mut foreign = mint_log(6, 100, 0);
        foreign["address"] = json!("0x00000000000000000000000000000000deadbeef");
        let payload = block(100, vec![foreign, mint_log(6, 100, 1)]);
        let (status, body) = send(&harness, quicknode(&payload)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["events"], 1);

        wait_for_ledger(&database, &tx_hash(100, 1), 1).await;
        assert!(database
            .applied_events()
            .fetch(&tx_hash(100, 0), 0)
            .await
            .expect("ledger")
            .is_none());
        let record = record_for_token(&database, "6").await.expect("record");
        assert_eq!(record.mint_tx_hash.as_deref(), Some(tx_hash(100, 1).as_str()));
    }

    #[tokio::test]
    async fn alchemy_activity_is_accepted() {
        let (_dir, database) = setup_db().await;
        let harness = app_state(&database, None).await;

        let payload = json!({
            "createdAt": "2024-05-01T11:59:00Z",
            "event": {
                "network": "ETH_MAINNET",
                "activity": [
                    { "blockNum": "0x64", "hash": tx_hash(100, 0), "log": mint_log(9, 100, 0) },
                    { "blockNum": "0x64", "hash": "0xabc" }
                ]
            }
        });
        let request = signed_request("alchemy", "x-alchemy-signature", ALCHEMY_SECRET, &payload);
        let (status, body) = send(&harness, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["events"], 1);

        wait_for_ledger(&database, &tx_hash(100, 0), 0).await;
        assert!(record_for_token(&database, "9").await.is_some());
    }

    #[tokio::test]
    async fn health_check_needs_no_signature() {
        let (_dir, database) = setup_db().await;
        let harness = app_state(&database, None).await;

        let request = Request::builder()
            .method(Method::POST)
            .uri("/webhooks/blockchain/health")
            .body(Body::empty())
            .expect("request");
        let (status, body) = send(&harness, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }
}
