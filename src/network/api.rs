//! HTTP Surface
//!
//! Bearer-token-authenticated JSON endpoints over axum. Handlers stay
//! thin: authenticate, parse ids, delegate to the component modules, map
//! errors through the taxonomy. Amounts are carried in integer
//! micro-units; ids travel as UUID strings.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::info;

use crate::anticheat::{AntiCheatMonitor, SuspiciousActivityRecord};
use crate::config::Config;
use crate::core::{DuelId, UserId};
use crate::duel::{DuelEngine, DuelPhase, DuelResult, DuelStatus, PayoutState};
use crate::ledger::{IntentStatus, PaymentLedger};
use crate::network::auth::{self, AuthError};
use crate::network::error::ApiError;
use crate::queue::{EntryStatus, Matchmaking};
use crate::settle::{SettlementProcessor, Treasury};
use crate::store::{Log, User, Users};

/// Shared application state behind every handler.
pub struct App<T: Treasury> {
    /// Engine configuration.
    pub config: Arc<Config>,
    /// User rows.
    pub users: Arc<Users>,
    /// Payment intent ledger.
    pub ledger: Arc<PaymentLedger>,
    /// Matchmaking queue.
    pub queue: Arc<Matchmaking>,
    /// Match state machine.
    pub engine: Arc<DuelEngine>,
    /// Claim & settlement processor.
    pub settlement: SettlementProcessor<T>,
    /// Anti-cheat suspicion log.
    pub suspicions: Arc<Log<SuspiciousActivityRecord>>,
    /// Anti-cheat monitor task.
    monitor_task: JoinHandle<()>,
}

impl<T: Treasury> App<T> {
    /// Wire the full engine around one shared store.
    pub fn build(config: Arc<Config>, treasury: T) -> Arc<Self> {
        let users = Arc::new(Users::new());
        let ledger = Arc::new(PaymentLedger::new(config.clone()));
        let (monitor_tx, suspicions, monitor_task) = AntiCheatMonitor::spawn(config.clone());
        let engine = Arc::new(DuelEngine::new(
            config.clone(),
            users.clone(),
            ledger.clone(),
            monitor_tx,
        ));
        let queue = Arc::new(Matchmaking::new(config.clone(), ledger.clone(), engine.clone()));
        let settlement = SettlementProcessor::new(
            config.clone(),
            users.clone(),
            engine.clone(),
            ledger.clone(),
            treasury,
        );

        Arc::new(Self {
            config,
            users,
            ledger,
            queue,
            engine,
            settlement,
            suspicions,
            monitor_task,
        })
    }

    /// Stop the monitor task on shutdown.
    pub fn shutdown(&self) {
        self.monitor_task.abort();
    }
}

/// Build the router over the app state.
pub fn router<T: Treasury>(app: Arc<App<T>>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/matchmaking/join", post(join::<T>))
        .route("/matchmaking/status/:user_id", get(queue_status::<T>))
        .route("/matchmaking/cancel/:user_id", delete(queue_cancel::<T>))
        .route("/match/ready", post(ready::<T>))
        .route("/match/state/:match_id", get(match_state::<T>))
        .route("/match/tap", post(tap::<T>))
        .route("/match/result/:match_id", get(match_result::<T>))
        .route("/match/heartbeat", post(heartbeat::<T>))
        .route("/claim", post(claim::<T>))
        .route("/claim/status/:match_id", get(claim_status::<T>))
        .route("/refund/claim-deposit", post(claim_deposit::<T>))
        .route("/payments/webhook", post(payments_webhook::<T>))
        .with_state(app)
}

/// Validate the bearer token and ensure the user row exists.
async fn authenticate<T: Treasury>(
    app: &App<T>,
    headers: &HeaderMap,
    now: DateTime<Utc>,
) -> Result<User, ApiError> {
    let token = auth::bearer_token(headers)?;
    let claims = auth::validate_token(token, &app.config.auth)?;
    let wallet = claims
        .wallet
        .clone()
        .ok_or(AuthError::MissingClaim("wallet".into()))?;
    Ok(app.users.ensure(claims.user_id(), &wallet, now).await)
}

fn parse_user_id(raw: &str) -> Result<UserId, ApiError> {
    UserId::from_uuid_str(raw).ok_or_else(|| ApiError::Validation("invalid user id".into()))
}

fn parse_duel_id(raw: &str) -> Result<DuelId, ApiError> {
    DuelId::from_uuid_str(raw).ok_or_else(|| ApiError::Validation("invalid match id".into()))
}

// =============================================================================
// REQUEST / RESPONSE SHAPES
// =============================================================================

/// Liveness body.
#[derive(Serialize)]
struct HealthzResponse {
    ok: bool,
}

/// `POST /matchmaking/join` body.
#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    /// Stake in micro-units; zero joins a free duel.
    pub stake_micros: u64,
    /// Confirmed payment reference funding the stake.
    pub payment_reference: Option<String>,
}

/// Queue entry as the client sees it.
#[derive(Debug, Serialize)]
pub struct QueueEntryResponse {
    /// The caller's user id.
    pub user_id: String,
    /// Entry status.
    pub status: EntryStatus,
    /// Duel id once matched.
    pub match_id: Option<String>,
    /// Opponent once matched.
    pub opponent: Option<String>,
    /// Entry expiry.
    pub expires_at: DateTime<Utc>,
}

/// `POST /match/ready` body.
#[derive(Debug, Deserialize)]
pub struct ReadyRequest {
    /// Target duel.
    pub match_id: String,
}

/// Ready acknowledgement.
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    /// Both players ready.
    pub both_ready: bool,
    /// Go instant persisted; poll `/match/state` for timing.
    pub armed: bool,
}

/// `GET /match/state/{id}` response. The go instant is the sole source of
/// timing truth; clients never compute it.
#[derive(Debug, Serialize)]
pub struct MatchStateResponse {
    /// Duel id.
    pub match_id: String,
    /// Derived phase.
    pub phase: DuelPhase,
    /// Server time at response.
    pub server_time: DateTime<Utc>,
    /// The authoritative go instant, once armed.
    pub go_instant: Option<DateTime<Utc>>,
    /// Milliseconds until the go instant, once armed.
    pub countdown_ms: Option<i64>,
    /// Version for optimistic re-reads.
    pub state_version: u64,
}

/// `POST /match/tap` body.
#[derive(Debug, Deserialize)]
pub struct TapRequest {
    /// Target duel.
    pub match_id: String,
    /// Client clock at tap, for anti-cheat skew analysis only.
    pub client_timestamp: i64,
}

/// Tap acknowledgement.
#[derive(Debug, Serialize)]
pub struct TapResponse {
    /// Tap landed before the go instant.
    pub false_start: bool,
    /// Server-computed reaction time.
    pub reaction_ms: Option<i64>,
    /// This tap completed the duel.
    pub resolved: bool,
}

/// Per-player slice of the result view.
#[derive(Debug, Serialize)]
pub struct PlayerResultResponse {
    /// Player id.
    pub user_id: String,
    /// Committed result.
    pub result: Option<DuelResult>,
    /// Valid reaction time.
    pub reaction_ms: Option<i64>,
    /// Player false-started.
    pub false_start: bool,
}

/// `GET /match/result/{id}` response.
#[derive(Debug, Serialize)]
pub struct MatchResultResponse {
    /// Duel id.
    pub match_id: String,
    /// Row status.
    pub status: DuelStatus,
    /// Winner, if any.
    pub winner: Option<String>,
    /// Both players' outcomes.
    pub players: Vec<PlayerResultResponse>,
    /// The caller's committed result.
    pub your_result: Option<DuelResult>,
    /// Claim deadline, once resolved.
    pub claim_deadline: Option<DateTime<Utc>>,
}

/// `POST /match/heartbeat` body.
#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    /// Target duel.
    pub match_id: String,
}

/// `POST /claim` body.
#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    /// Resolved duel to claim.
    pub match_id: String,
}

/// Claim receipt; the same shape answers replays, tagged already-claimed.
#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    /// Claimed duel.
    pub match_id: String,
    /// Transferred amount in micro-units.
    pub amount_micros: u64,
    /// External settlement reference.
    pub settlement_ref: String,
    /// True when the pot was already claimed earlier.
    pub already_claimed: bool,
}

/// `GET /claim/status/{id}` response.
#[derive(Debug, Serialize)]
pub struct ClaimStatusResponse {
    /// Claim lifecycle.
    pub claim_status: crate::duel::ClaimStatus,
    /// The caller's payout flag.
    pub payout_state: PayoutState,
    /// Claim deadline.
    pub claim_deadline: Option<DateTime<Utc>>,
    /// Settlement reference once paid.
    pub settlement_ref: Option<String>,
}

/// `POST /refund/claim-deposit` body.
#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    /// Refund-eligible payment reference.
    pub payment_reference: String,
}

/// Refund receipt.
#[derive(Debug, Serialize)]
pub struct RefundResponse {
    /// Refunded payment reference.
    pub payment_reference: String,
    /// Transferred amount in micro-units.
    pub amount_micros: u64,
    /// External settlement reference.
    pub settlement_ref: String,
    /// True when the deposit was already refunded earlier.
    pub already_claimed: bool,
}

/// Normalized provider status on the webhook.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Pending,
    Confirmed,
    Failed,
    Cancelled,
}

/// `POST /payments/webhook` body; delivered at-least-once by the provider.
#[derive(Debug, Deserialize)]
pub struct WebhookRequest {
    /// External idempotency reference.
    pub reference: String,
    /// Funding user id.
    pub user_id: String,
    /// Funded amount in micro-units.
    pub amount_micros: u64,
    /// Normalized provider status.
    pub status: WebhookStatus,
    /// External transaction id, present on confirmations.
    pub tx_id: Option<String>,
}

/// Webhook acknowledgement.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    /// Acknowledged reference.
    pub reference: String,
    /// Ledger status after applying the delivery.
    pub status: IntentStatus,
}

// =============================================================================
// HANDLERS
// =============================================================================

async fn healthz() -> Json<HealthzResponse> {
    Json(HealthzResponse { ok: true })
}

async fn join<T: Treasury>(
    State(app): State<Arc<App<T>>>,
    headers: HeaderMap,
    Json(req): Json<JoinRequest>,
) -> Result<Json<QueueEntryResponse>, ApiError> {
    let now = Utc::now();
    let caller = authenticate(&app, &headers, now).await?;

    let entry = app
        .queue
        .enqueue(caller.id, req.stake_micros, req.payment_reference.as_deref(), now)
        .await?;

    let opponent = match entry.duel {
        Some(duel_id) => app
            .engine
            .snapshot(&duel_id)
            .await
            .and_then(|d| d.opponent_of(&caller.id))
            .map(|u| u.to_uuid_string()),
        None => None,
    };

    Ok(Json(QueueEntryResponse {
        user_id: caller.id.to_uuid_string(),
        status: entry.status,
        match_id: entry.duel.map(|d| d.to_uuid_string()),
        opponent,
        expires_at: entry.expires_at,
    }))
}

async fn queue_status<T: Treasury>(
    State(app): State<Arc<App<T>>>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<QueueEntryResponse>, ApiError> {
    let now = Utc::now();
    let caller = authenticate(&app, &headers, now).await?;
    let target = parse_user_id(&user_id)?;
    if target != caller.id {
        return Err(ApiError::Forbidden("queue status is caller-only".into()));
    }

    let entry = app.queue.status(&caller.id).await?;
    let opponent = match entry.duel {
        Some(duel_id) => app
            .engine
            .snapshot(&duel_id)
            .await
            .and_then(|d| d.opponent_of(&caller.id))
            .map(|u| u.to_uuid_string()),
        None => None,
    };

    Ok(Json(QueueEntryResponse {
        user_id: caller.id.to_uuid_string(),
        status: entry.status,
        match_id: entry.duel.map(|d| d.to_uuid_string()),
        opponent,
        expires_at: entry.expires_at,
    }))
}

async fn queue_cancel<T: Treasury>(
    State(app): State<Arc<App<T>>>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<QueueEntryResponse>, ApiError> {
    let now = Utc::now();
    let caller = authenticate(&app, &headers, now).await?;
    let target = parse_user_id(&user_id)?;
    if target != caller.id {
        return Err(ApiError::Forbidden("queue cancel is caller-only".into()));
    }

    let entry = app.queue.cancel(&caller.id, now).await?;
    Ok(Json(QueueEntryResponse {
        user_id: caller.id.to_uuid_string(),
        status: entry.status,
        match_id: entry.duel.map(|d| d.to_uuid_string()),
        opponent: None,
        expires_at: entry.expires_at,
    }))
}

async fn ready<T: Treasury>(
    State(app): State<Arc<App<T>>>,
    headers: HeaderMap,
    Json(req): Json<ReadyRequest>,
) -> Result<Json<ReadyResponse>, ApiError> {
    let now = Utc::now();
    let caller = authenticate(&app, &headers, now).await?;
    let duel_id = parse_duel_id(&req.match_id)?;

    let ack = app.engine.mark_ready(&duel_id, &caller.id, now).await?;
    Ok(Json(ReadyResponse {
        both_ready: ack.both_ready,
        armed: ack.armed,
    }))
}

async fn match_state<T: Treasury>(
    State(app): State<Arc<App<T>>>,
    headers: HeaderMap,
    Path(match_id): Path<String>,
) -> Result<Json<MatchStateResponse>, ApiError> {
    let now = Utc::now();
    let caller = authenticate(&app, &headers, now).await?;
    let duel_id = parse_duel_id(&match_id)?;

    let duel = app
        .engine
        .snapshot(&duel_id)
        .await
        .ok_or_else(|| ApiError::NotFound("unknown match".into()))?;
    if duel.slot(&caller.id).is_none() {
        return Err(ApiError::Forbidden("not a participant in this duel".into()));
    }

    let countdown_ms = duel
        .go_instant
        .map(|go| (go - now).num_milliseconds().max(0));

    Ok(Json(MatchStateResponse {
        match_id: duel.id.to_uuid_string(),
        phase: duel.phase(now),
        server_time: now,
        go_instant: duel.go_instant,
        countdown_ms,
        state_version: duel.state_version.get(),
    }))
}

async fn tap<T: Treasury>(
    State(app): State<Arc<App<T>>>,
    headers: HeaderMap,
    Json(req): Json<TapRequest>,
) -> Result<Json<TapResponse>, ApiError> {
    let now = Utc::now();
    let caller = authenticate(&app, &headers, now).await?;
    let duel_id = parse_duel_id(&req.match_id)?;

    let ack = app
        .engine
        .tap(&duel_id, &caller.id, req.client_timestamp, now)
        .await?;
    Ok(Json(TapResponse {
        false_start: ack.false_start,
        reaction_ms: ack.reaction_ms,
        resolved: ack.resolved,
    }))
}

async fn match_result<T: Treasury>(
    State(app): State<Arc<App<T>>>,
    headers: HeaderMap,
    Path(match_id): Path<String>,
) -> Result<Json<MatchResultResponse>, ApiError> {
    let now = Utc::now();
    let caller = authenticate(&app, &headers, now).await?;
    let duel_id = parse_duel_id(&match_id)?;

    let duel = app
        .engine
        .snapshot(&duel_id)
        .await
        .ok_or_else(|| ApiError::NotFound("unknown match".into()))?;
    let slot = duel
        .slot(&caller.id)
        .ok_or_else(|| ApiError::Forbidden("not a participant in this duel".into()))?;

    let players = duel
        .players
        .iter()
        .map(|p| PlayerResultResponse {
            user_id: p.user.to_uuid_string(),
            result: p.result,
            reaction_ms: p.valid_reaction_ms(),
            false_start: p.tap.is_some_and(|t| t.false_start),
        })
        .collect();

    Ok(Json(MatchResultResponse {
        match_id: duel.id.to_uuid_string(),
        status: duel.status,
        winner: duel.winner.map(|w| w.to_uuid_string()),
        players,
        your_result: slot.result,
        claim_deadline: duel.claim_deadline,
    }))
}

async fn heartbeat<T: Treasury>(
    State(app): State<Arc<App<T>>>,
    headers: HeaderMap,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HealthzResponse>, ApiError> {
    let now = Utc::now();
    let caller = authenticate(&app, &headers, now).await?;
    let duel_id = parse_duel_id(&req.match_id)?;

    app.engine.heartbeat(&duel_id, &caller.id, now).await?;
    Ok(Json(HealthzResponse { ok: true }))
}

async fn claim<T: Treasury>(
    State(app): State<Arc<App<T>>>,
    headers: HeaderMap,
    Json(req): Json<ClaimRequest>,
) -> Result<Json<ClaimResponse>, ApiError> {
    let now = Utc::now();
    let caller = authenticate(&app, &headers, now).await?;
    let duel_id = parse_duel_id(&req.match_id)?;

    let receipt = app.settlement.claim(&duel_id, &caller.id, now).await?;
    Ok(Json(ClaimResponse {
        match_id: req.match_id,
        amount_micros: receipt.amount_micros,
        settlement_ref: receipt.settlement_ref,
        already_claimed: receipt.already_claimed,
    }))
}

async fn claim_status<T: Treasury>(
    State(app): State<Arc<App<T>>>,
    headers: HeaderMap,
    Path(match_id): Path<String>,
) -> Result<Json<ClaimStatusResponse>, ApiError> {
    let now = Utc::now();
    let caller = authenticate(&app, &headers, now).await?;
    let duel_id = parse_duel_id(&match_id)?;

    let view = app.settlement.claim_status(&duel_id, &caller.id).await?;
    Ok(Json(ClaimStatusResponse {
        claim_status: view.claim_status,
        payout_state: view.payout_state,
        claim_deadline: view.claim_deadline,
        settlement_ref: view.settlement_ref,
    }))
}

async fn claim_deposit<T: Treasury>(
    State(app): State<Arc<App<T>>>,
    headers: HeaderMap,
    Json(req): Json<RefundRequest>,
) -> Result<Json<RefundResponse>, ApiError> {
    let now = Utc::now();
    let caller = authenticate(&app, &headers, now).await?;

    let receipt = app
        .settlement
        .claim_deposit(&req.payment_reference, &caller.id, now)
        .await?;
    Ok(Json(RefundResponse {
        payment_reference: req.payment_reference,
        amount_micros: receipt.amount_micros,
        settlement_ref: receipt.settlement_ref,
        already_claimed: receipt.already_claimed,
    }))
}

async fn payments_webhook<T: Treasury>(
    State(app): State<Arc<App<T>>>,
    headers: HeaderMap,
    Json(req): Json<WebhookRequest>,
) -> Result<Json<WebhookResponse>, ApiError> {
    // The provider authenticates with the shared webhook secret, not a
    // user bearer token
    if let Some(expected) = &app.config.webhook_secret {
        let presented = headers
            .get("x-webhook-secret")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if presented != expected {
            return Err(ApiError::Forbidden("invalid webhook secret".into()));
        }
    }

    let now = Utc::now();
    let user = parse_user_id(&req.user_id)?;

    // Idempotent create, then the monotonic transition; duplicate
    // deliveries fall through as no-ops
    app.ledger.create(&req.reference, user, req.amount_micros, now).await;
    let intent = match req.status {
        WebhookStatus::Pending => app
            .ledger
            .get(&req.reference)
            .await
            .ok_or_else(|| ApiError::NotFound("unknown payment reference".into()))?,
        WebhookStatus::Confirmed => {
            let tx_id = req
                .tx_id
                .as_deref()
                .ok_or_else(|| ApiError::Validation("confirmation without tx_id".into()))?;
            app.ledger.confirm(&req.reference, tx_id, now).await?
        }
        WebhookStatus::Failed => app.ledger.fail(&req.reference, now).await?,
        WebhookStatus::Cancelled => app.ledger.cancel(&req.reference, now).await?,
    };

    info!("payment webhook {} -> {:?}", req.reference, intent.status);
    Ok(Json(WebhookResponse {
        reference: req.reference,
        status: intent.status,
    }))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::auth::TokenClaims;
    use crate::settle::treasury::testing::RecordingTreasury;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    const SECRET: &str = "test-secret-key-256-bits-long!!";

    fn test_app() -> Arc<App<Arc<RecordingTreasury>>> {
        let config = Config {
            auth: crate::network::auth::AuthConfig {
                secret: Some(SECRET.into()),
                ..Default::default()
            },
            webhook_secret: Some("hook-secret".into()),
            ..Default::default()
        };
        App::build(Arc::new(config), RecordingTreasury::new())
    }

    fn token_for(subject: &str) -> String {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let claims = TokenClaims {
            sub: subject.into(),
            wallet: Some(format!("0x{}", subject)),
            exp: now + 3600,
            iat: now,
            iss: None,
            aud: None,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn post_json(uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_healthz() {
        let router = router(test_app());
        let response = router
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_join_requires_bearer_token() {
        let router = router(test_app());
        let response = router
            .oneshot(post_json("/matchmaking/join", None, json!({"stake_micros": 0})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_two_joins_pair_over_http() {
        let router = router(test_app());

        let first = router
            .clone()
            .oneshot(post_json(
                "/matchmaking/join",
                Some(&token_for("alice")),
                json!({"stake_micros": 0}),
            ))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let first = body_json(first).await;
        assert_eq!(first["status"], "searching");

        let second = router
            .clone()
            .oneshot(post_json(
                "/matchmaking/join",
                Some(&token_for("bob")),
                json!({"stake_micros": 0}),
            ))
            .await
            .unwrap();
        let second = body_json(second).await;
        assert_eq!(second["status"], "matched");
        assert!(second["match_id"].is_string());
        assert_eq!(second["opponent"], first["user_id"]);

        // Alice sees the same match from her side
        let status_uri = format!("/matchmaking/status/{}", first["user_id"].as_str().unwrap());
        let status = router
            .oneshot(
                Request::builder()
                    .uri(&status_uri)
                    .header("authorization", format!("Bearer {}", token_for("alice")))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = body_json(status).await;
        assert_eq!(status["status"], "matched");
        assert_eq!(status["match_id"], second["match_id"]);
    }

    #[tokio::test]
    async fn test_queue_status_is_caller_only() {
        let router = router(test_app());

        router
            .clone()
            .oneshot(post_json(
                "/matchmaking/join",
                Some(&token_for("alice")),
                json!({"stake_micros": 0}),
            ))
            .await
            .unwrap();

        let alice_id = UserId::from_subject("alice").to_uuid_string();
        let response = router
            .oneshot(
                Request::builder()
                    .uri(format!("/matchmaking/status/{}", alice_id))
                    .header("authorization", format!("Bearer {}", token_for("mallory")))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_webhook_confirms_with_secret() {
        let router = router(test_app());
        let user_id = UserId::from_subject("alice").to_uuid_string();

        // Wrong secret rejected
        let response = router
            .clone()
            .oneshot(post_json(
                "/payments/webhook",
                None,
                json!({
                    "reference": "pay-1",
                    "user_id": user_id,
                    "amount_micros": 100_000,
                    "status": "confirmed",
                    "tx_id": "tx-1"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // Correct secret confirms; replay is a no-op success
        for _ in 0..2 {
            let request = Request::builder()
                .method("POST")
                .uri("/payments/webhook")
                .header("content-type", "application/json")
                .header("x-webhook-secret", "hook-secret")
                .body(Body::from(
                    json!({
                        "reference": "pay-1",
                        "user_id": user_id,
                        "amount_micros": 100_000,
                        "status": "confirmed",
                        "tx_id": "tx-1"
                    })
                    .to_string(),
                ))
                .unwrap();
            let response = router.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body = body_json(response).await;
            assert_eq!(body["status"], "confirmed");
        }
    }
}
