//! End-to-end exchange flows over the HTTP surface.
//!
//! Each test stands up the full router against a temp SQLite database and
//! drives it with real requests: user + bet placement, provider wallet
//! callbacks (signed), and settlement through the scanner + queue worker.
//! No network: the odds provider is a scripted stub.

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tower::ServiceExt;

use betvault_backend::api::{create_router, AppState};
use betvault_backend::bets::{BetRepository, PlacementService};
use betvault_backend::db::{self, DbHandle};
use betvault_backend::ledger::LedgerStore;
use betvault_backend::models::MarketType;
use betvault_backend::odds::{MarketResults, MatchState, OddsApi, OddsResult, SelectionOutcome};
use betvault_backend::provider::{CallbackService, SignatureVerifier};
use betvault_backend::queue::{JobQueue, QueueWorker};
use betvault_backend::settlement::{ResultDeclarer, SettlementJobHandler, SettlementScanner};

const MERCHANT: &str = "1000";
const SECRET: &str = "integration-secret";

struct Harness {
    app: Router,
    conn: DbHandle,
    bets: BetRepository,
    queue: JobQueue,
    _db: NamedTempFile,
}

async fn harness() -> Harness {
    let file = NamedTempFile::new().unwrap();
    let conn = db::open(file.path().to_str().unwrap()).unwrap();
    let ledger = LedgerStore::new(conn.clone()).await.unwrap();
    let bets = BetRepository::new(conn.clone()).await.unwrap();
    let queue = JobQueue::new(conn.clone(), 3, 2).await.unwrap();
    let placement = PlacementService::new(conn.clone(), queue.clone(), 60);
    let verifier = SignatureVerifier::new(MERCHANT, SECRET);
    let callbacks = CallbackService::new(ledger.clone(), verifier, "USD");

    let state = AppState {
        ledger,
        bets: bets.clone(),
        placement,
        callbacks,
        queue: queue.clone(),
        currency: "USD".to_string(),
    };
    Harness {
        app: create_router(state),
        conn,
        bets,
        queue,
        _db: file,
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn post_json(app: &Router, path: &str, body: &Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap();
    send(app, req).await
}

async fn get(app: &Router, path: &str) -> (StatusCode, Value) {
    let req = Request::builder()
        .uri(path)
        .body(Body::empty())
        .unwrap();
    send(app, req).await
}

/// Signed provider callback request, exactly as the wallet provider sends
/// it. Returning the request parts lets a test replay the identical bytes.
fn callback_request(body: &Value, nonce: &str) -> Request<Body> {
    let verifier = SignatureVerifier::new(MERCHANT, SECRET);
    let ts = "1711111111";
    let sig = verifier.sign(body, ts, nonce).unwrap();
    Request::builder()
        .method("POST")
        .uri("/api/provider/callback")
        .header("content-type", "application/json")
        .header("x-merchant-id", MERCHANT)
        .header("x-timestamp", ts)
        .header("x-nonce", nonce)
        .header("x-sign", sig)
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

async fn create_user(app: &Router, initial_balance: f64) -> String {
    let (status, body) = post_json(
        app,
        "/api/users",
        &json!({"initial_balance": initial_balance}),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["id"].as_str().unwrap().to_string()
}

fn place_bet_body(user_id: &str, stake: f64, odds: f64) -> Value {
    json!({
        "user_id": user_id,
        "match_id": "m-100",
        "event_type_id": "4",
        "market_id": "1.234",
        "selection_id": "sel-a",
        "market_type": "match_odds",
        "odds": odds,
        "stake": stake,
    })
}

/// Odds provider that reports the match finished with a fixed winner.
struct FinishedMatchOdds {
    winner: String,
}

#[async_trait]
impl OddsApi for FinishedMatchOdds {
    async fn match_state(&self, match_id: &str) -> anyhow::Result<MatchState> {
        Ok(MatchState {
            match_id: match_id.to_string(),
            status: Some("finished".to_string()),
            score_message: None,
        })
    }

    async fn market_results(
        &self,
        _match_id: &str,
        _market_type: MarketType,
    ) -> anyhow::Result<MarketResults> {
        Ok(MarketResults::MatchOdds {
            results: vec![
                OddsResult {
                    market_id: "1.234".to_string(),
                    selection_id: self.winner.clone(),
                    position: SelectionOutcome::Winner,
                },
                OddsResult {
                    market_id: "1.234".to_string(),
                    selection_id: "sel-b".to_string(),
                    position: SelectionOutcome::Loser,
                },
            ],
        })
    }
}

#[tokio::test]
async fn test_place_bet_debits_balance() {
    let h = harness().await;
    let user = create_user(&h.app, 1000.0).await;

    let (status, body) = post_json(&h.app, "/api/bets", &place_bet_body(&user, 200.0, 2.0)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["balance"], json!(800.0));
    assert_eq!(body["bet"]["status"], json!("matched"));
    assert_eq!(body["bet"]["stake"], json!(200.0));

    let (status, body) = get(&h.app, &format!("/api/users/{user}/balance")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance"], json!(800.0));
}

#[tokio::test]
async fn test_place_bet_insufficient_balance() {
    let h = harness().await;
    let user = create_user(&h.app, 100.0).await;

    let (status, body) = post_json(&h.app, "/api/bets", &place_bet_body(&user, 200.0, 2.0)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["error"], json!("Insufficient balance"));

    let (_, body) = get(&h.app, &format!("/api/users/{user}/balance")).await;
    assert_eq!(body["balance"], json!(100.0));
}

#[tokio::test]
async fn test_settlement_pays_winning_bet() {
    let h = harness().await;
    let user = create_user(&h.app, 1000.0).await;
    post_json(&h.app, "/api/bets", &place_bet_body(&user, 200.0, 2.0)).await;

    // Drive settlement: scanner sees the finished match and enqueues the
    // declare job; one worker pass applies it.
    let odds: Arc<dyn OddsApi> = Arc::new(FinishedMatchOdds {
        winner: "sel-a".to_string(),
    });
    let scanner = SettlementScanner::new(h.bets.clone(), odds, h.queue.clone(), 3600);
    let declarer = ResultDeclarer::new(h.conn.clone(), h.bets.clone());
    let enqueued = scanner.run_cycle().await.unwrap();
    assert_eq!(enqueued, 1);

    let handler = Arc::new(SettlementJobHandler::new(scanner, declarer));
    let worker = QueueWorker::new(h.queue.clone(), handler);
    let ran = worker
        .process_next(chrono::Utc::now().timestamp() + 1)
        .await
        .unwrap();
    assert!(ran);

    let (_, body) = get(&h.app, &format!("/api/users/{user}/balance")).await;
    assert_eq!(body["balance"], json!(1200.0));

    let (_, body) = get(&h.app, &format!("/api/bets?user_id={user}&status=won")).await;
    assert_eq!(body["count"], json!(1));
    assert_eq!(body["bets"][0]["payout"], json!(400.0));
    assert_eq!(body["bets"][0]["status"], json!("won"));
}

#[tokio::test]
async fn test_cancel_refunds_stake() {
    let h = harness().await;
    let user = create_user(&h.app, 1000.0).await;
    let (_, placed) = post_json(&h.app, "/api/bets", &place_bet_body(&user, 200.0, 2.0)).await;
    let bet_id = placed["bet"]["id"].as_str().unwrap().to_string();

    let (status, body) = post_json(
        &h.app,
        "/api/bets/cancel",
        &json!({"user_id": user, "bet_id": bet_id}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance"], json!(1000.0));
    assert_eq!(body["bet"]["status"], json!("cancelled"));

    // A second cancel conflicts instead of double-refunding.
    let (status, _) = post_json(
        &h.app,
        "/api/bets/cancel",
        &json!({"user_id": user, "bet_id": bet_id}),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_provider_bet_callback_insufficient_balance() {
    let h = harness().await;
    let user = create_user(&h.app, 50.0).await;

    let body = json!({
        "action": "bet",
        "player_id": user,
        "currency": "USD",
        "amount": 100.0,
        "transaction_id": "prov-1",
    });
    let (status, resp) = send(&h.app, callback_request(&body, "n-1")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(resp["success"], json!(false));
    assert_eq!(resp["error"], json!("Insufficient balance"));

    let (_, balance) = get(&h.app, &format!("/api/users/{user}/balance")).await;
    assert_eq!(balance["balance"], json!(50.0));
}

#[tokio::test]
async fn test_provider_bet_callback_is_idempotent() {
    let h = harness().await;
    let user = create_user(&h.app, 1000.0).await;

    let body = json!({
        "action": "bet",
        "player_id": user,
        "currency": "USD",
        "amount": 100.0,
        "transaction_id": "prov-X",
    });
    let (status, first) = send(&h.app, callback_request(&body, "n-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["balance"], json!(900.0));

    // Identical duplicate delivery: same balance, no second debit.
    let (status, second) = send(&h.app, callback_request(&body, "n-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["balance"], json!(900.0));
    assert_eq!(second["transaction_id"], first["transaction_id"]);

    let (_, txns) = get(&h.app, &format!("/api/users/{user}/transactions")).await;
    let bet_rows = txns["transactions"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|t| t["txn_type"] == json!("bet"))
        .count();
    assert_eq!(bet_rows, 1);
}

#[tokio::test]
async fn test_provider_rollback_reports_unknown_and_reverses_known() {
    let h = harness().await;
    let user = create_user(&h.app, 1000.0).await;

    let bet = json!({
        "action": "bet",
        "player_id": user,
        "currency": "USD",
        "amount": 100.0,
        "transaction_id": "prov-X",
    });
    send(&h.app, callback_request(&bet, "n-1")).await;

    let rollback = json!({
        "action": "rollback",
        "player_id": user,
        "currency": "USD",
        "rollback_transactions": ["prov-X", "prov-unknown"],
    });
    let (status, resp) = send(&h.app, callback_request(&rollback, "n-2")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resp["success"], json!(true));
    assert_eq!(resp["balance"], json!(1000.0));
    assert_eq!(resp["rolled_back"], json!(["prov-X"]));
    assert_eq!(resp["skipped"], json!(["prov-unknown"]));

    // Replay: still success, no further movement.
    let (status, resp) = send(&h.app, callback_request(&rollback, "n-2")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resp["balance"], json!(1000.0));
}

#[tokio::test]
async fn test_provider_callback_rejects_bad_signature() {
    let h = harness().await;
    let user = create_user(&h.app, 1000.0).await;

    let body = json!({
        "action": "bet",
        "player_id": user,
        "currency": "USD",
        "amount": 100.0,
        "transaction_id": "prov-1",
    });
    let mut req = callback_request(&body, "n-1");
    req.headers_mut()
        .insert("x-sign", hex::encode([0u8; 32]).parse().unwrap());
    let (status, resp) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(resp["success"], json!(false));

    let (_, balance) = get(&h.app, &format!("/api/users/{user}/balance")).await;
    assert_eq!(balance["balance"], json!(1000.0));
}

#[tokio::test]
async fn test_health_reports_queue_depth() {
    let h = harness().await;
    let user = create_user(&h.app, 1000.0).await;
    post_json(&h.app, "/api/bets", &place_bet_body(&user, 200.0, 2.0)).await;

    let (status, body) = get(&h.app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("healthy"));
    // Placement parked one delayed scan job.
    assert_eq!(body["queue"]["queued"], json!(1));
}

#[tokio::test]
async fn test_unknown_user_paths_return_404() {
    let h = harness().await;

    let (status, _) = get(&h.app, "/api/users/ghost/balance").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = get(&h.app, "/api/users/ghost/transactions").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = post_json(&h.app, "/api/bets", &place_bet_body("ghost", 10.0, 2.0)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], json!(false));
}
