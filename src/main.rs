//! Risk control plane control surface.
//!
//! Bootstraps the position/P&L engine, risk evaluator, alert pipeline,
//! monitoring loop and halt controller, and ingestion facade behind an
//! axum HTTP+WS surface, assembling an `AppState` +
//! `Router` the same way a long-running service process does. `anyhow::Context`
//! carries errors through this bootstrap path; every typed operation below
//! that returns `RiskResult` instead.

mod auth;
mod config;
mod errors;
mod rate_limiter;
mod risk;
mod telemetry;
mod worker_pool;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    middleware as axum_mw,
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::auth::{auth_middleware, has_role, AuthError, JwtHandler, Role};
use crate::config::{RiskLimits, RuntimeConfig};
use crate::errors::RiskError;
use crate::rate_limiter::RateLimiterRegistry;
use crate::risk::{
    Alert, AlertPipeline, HaltController, HaltSource, IngestionFacade, IngressEvent, Opportunity,
    Position, PositionBook, RiskAssessment, RiskEvaluator,
};
use crate::risk::monitor::MonitoringLoop;
use crate::risk::store::{
    AlertSink, DegradedSink, MetricsSink, PositionStore, PrometheusMetricsSink, SqliteAlertStore,
    SqlitePositionStore,
};
use crate::worker_pool::PriorityPool;

#[derive(Parser)]
#[command(name = "riskctl", about = "Real-time cross-exchange risk control plane")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane (ingestion, monitoring, alerting, HTTP+WS control surface).
    Serve,
    /// Mint a bearer token for the control surface. Operators are provisioned
    /// out of band; this is the only "user management" this crate does.
    IssueToken {
        #[arg(long)]
        subject: Option<String>,
        #[arg(long, default_value = "viewer")]
        role: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve().await,
        Command::IssueToken { subject, role } => issue_token(subject, role),
    }
}

fn issue_token(subject: Option<String>, role: String) -> Result<()> {
    dotenv::dotenv().ok();
    let secret = jwt_secret();
    let handler = JwtHandler::new(secret);
    let role = Role::from_str(&role).ok_or_else(|| anyhow::anyhow!("unknown role '{role}'"))?;
    let subject = subject.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let (token, expires_in) = handler.generate_token(&subject, role)?;
    println!("subject:    {subject}");
    println!("role:       {}", role.as_str());
    println!("expires_in: {expires_in}s");
    println!("token:      {token}");
    Ok(())
}

fn jwt_secret() -> String {
    std::env::var("JWT_SECRET")
        .unwrap_or_else(|_| "dev-secret-change-in-production-minimum-32-characters".to_string())
}

/// Forwards the position book's storage-degraded notifications into the
/// alert pipeline without the position book depending on the alert
/// pipeline directly, avoiding a cyclic reference between the two modules.
struct AlertDegradedSink(Arc<AlertPipeline>);

impl DegradedSink for AlertDegradedSink {
    fn on_storage_degraded(&self, detail: &str) {
        let mut metadata = HashMap::new();
        metadata.insert("detail".to_string(), serde_json::Value::String(detail.to_string()));
        self.0.enqueue(
            crate::risk::Severity::Warning,
            "storage_degraded",
            detail.to_string(),
            metadata,
        );
    }
}

#[derive(Clone)]
struct AppState {
    positions: Arc<PositionBook>,
    evaluator: Arc<RiskEvaluator>,
    halt: Arc<HaltController>,
    alerts: Arc<AlertPipeline>,
    ingestion: Arc<IngestionFacade>,
    ingest_tx: mpsc::Sender<IngressEvent>,
    limits: Arc<ArcSwap<RiskLimits>>,
    rate_limiters: Arc<RateLimiterRegistry>,
}

async fn serve() -> Result<()> {
    telemetry::init_tracing();
    info!("risk control plane starting up");

    let runtime_config = RuntimeConfig::from_env().context("loading runtime configuration")?;
    let limits = Arc::new(ArcSwap::from_pointee(RiskLimits::from_env()));

    let metrics_addr: SocketAddr = runtime_config
        .metrics_addr
        .parse()
        .context("parsing METRICS_ADDR")?;
    if let Err(e) = telemetry::init_metrics_recorder(metrics_addr) {
        warn!(error = %e, "prometheus metrics recorder not installed, continuing without it");
    }

    let position_store = Arc::new(
        SqlitePositionStore::open(&runtime_config.position_store_path)
            .context("opening position store")?,
    );
    let alert_store = Arc::new(
        SqliteAlertStore::open(&runtime_config.alert_store_path).context("opening alert store")?,
    );

    let pool = Arc::new(PriorityPool::new(4));

    let alerts = Arc::new(AlertPipeline::new(
        pool.clone(),
        limits.load().max_alerts_per_hour,
        runtime_config.alert_buffer_size,
    ));
    alerts.add_sink(alert_store.clone() as Arc<dyn AlertSink>);

    let degraded: Arc<dyn DegradedSink> = Arc::new(AlertDegradedSink(alerts.clone()));
    let positions = Arc::new(PositionBook::new().with_persistence(
        position_store.clone() as Arc<dyn PositionStore>,
        degraded,
        pool.clone(),
    ));

    let rehydrated = position_store.scan_all().context("rehydrating positions at startup")?;
    info!(count = rehydrated.len(), "rehydrated positions from store");
    positions.rehydrate(rehydrated);

    let halt = Arc::new(HaltController::new());
    let evaluator = Arc::new(RiskEvaluator::new(
        limits.clone(),
        positions.clone(),
        halt.clone(),
        runtime_config.equity,
    ));

    let metrics_sink: Arc<dyn MetricsSink> =
        Arc::new(PrometheusMetricsSink::new(runtime_config.host_tag.clone()));
    let monitoring = Arc::new(MonitoringLoop::new(
        positions.clone(),
        evaluator.clone(),
        halt.clone(),
        alerts.clone(),
        limits.clone(),
        metrics_sink,
        runtime_config.monitoring_interval,
    ));
    let (monitoring_shutdown, _monitoring_stopping) = monitoring.shutdown_handle();
    let monitoring_handle = monitoring.clone().spawn();

    let ingestion = Arc::new(IngestionFacade::new(
        positions.clone(),
        alerts.clone(),
        runtime_config.dedupe_window,
    ));

    // A dedicated reader task drains inbound events -- the transport that
    // would feed it from a real trading engine is out of scope, so the HTTP
    // `/ingest` route below stands in as the thin interface producing
    // events onto this channel.
    let (ingest_tx, mut ingest_rx) = mpsc::channel::<IngressEvent>(4096);
    let ingestion_reader = ingestion.clone();
    let reader_handle = tokio::spawn(async move {
        while let Some(event) = ingest_rx.recv().await {
            if let Err(e) = ingestion_reader.apply(event) {
                warn!(error = %e, "ingestion event rejected");
            }
        }
    });

    let rate_limiters = Arc::new(RateLimiterRegistry::new(
        runtime_config.rate_limit_capacity,
        runtime_config.rate_limit_window,
    ));

    let jwt_handler = Arc::new(JwtHandler::new(jwt_secret()));

    let state = AppState {
        positions,
        evaluator,
        halt,
        alerts,
        ingestion,
        ingest_tx,
        limits,
        rate_limiters,
    };

    let protected = Router::new()
        .route("/risk/status", get(get_risk_status))
        .route("/positions", get(get_positions))
        .route("/pnl", get(get_pnl))
        .route("/alerts", get(get_alerts))
        .route("/alerts/:id/ack", post(ack_alert))
        .route("/control/halt", post(emergency_halt))
        .route("/control/resume", post(resume_trading))
        .route("/risk/limits", put(update_risk_limits))
        .route("/pretrade/evaluate", post(evaluate_pretrade))
        .route("/ingest", post(ingest_event))
        .route("/stream/positions", get(position_stream_handler))
        .route("/stream/alerts", get(alert_stream_handler))
        .route_layer(axum_mw::from_fn_with_state(jwt_handler.clone(), auth_middleware));

    let app = Router::new()
        .route("/healthz", get(health_check))
        .merge(protected)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state);

    let listen_addr: SocketAddr = runtime_config.listen_addr.parse().context("parsing LISTEN_ADDR")?;
    let listener = TcpListener::bind(listen_addr).await.context("binding control surface listener")?;
    info!(addr = %listen_addr, "control surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("control surface server error")?;

    // Shutdown order: stop ingestion -> drain alert queue (<=5s) -> stop
    // monitoring loop -> stop worker pool (draining) -> close sinks.
    info!("http surface stopped, draining background components");
    drop(reader_handle); // the channel already closed once `state` dropped with the router above

    if tokio::time::timeout(Duration::from_secs(5), pool.wait_idle()).await.is_err() {
        warn!("alert queue did not drain within 5s shutdown budget");
    }

    monitoring_shutdown.notify_one();
    if let Err(e) = monitoring_handle.await {
        error!(error = %e, "monitoring loop task panicked during shutdown");
    }

    pool.shutdown();
    let _ = tokio::time::timeout(Duration::from_secs(5), pool.wait_idle()).await;

    info!("risk control plane shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

async fn health_check() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct RiskStatusResponse {
    halt_state: Arc<crate::risk::monitor::HaltState>,
    total_pnl: f64,
    total_realized: f64,
    total_unrealized: f64,
    total_exposure: f64,
    var: crate::risk::var::VarEstimate,
    alerts_open: u64,
    risk_limits_generation: u64,
}

async fn get_risk_status(State(state): State<AppState>) -> Json<RiskStatusResponse> {
    let var = state.positions.value_at_risk(0.95, 30);
    Json(RiskStatusResponse {
        halt_state: state.halt.current(),
        total_pnl: state.positions.total_pnl(),
        total_realized: state.positions.total_realized(),
        total_unrealized: state.positions.total_unrealized(),
        total_exposure: state.positions.total_exposure(),
        var,
        alerts_open: state.alerts.open_count(),
        risk_limits_generation: state.limits.load().generation,
    })
}

async fn get_positions(State(state): State<AppState>) -> Json<Vec<Position>> {
    Json(state.positions.get_all_positions())
}

#[derive(Debug, Serialize)]
struct PnLResponse {
    realized: f64,
    unrealized: f64,
    total: f64,
}

async fn get_pnl(State(state): State<AppState>) -> Json<PnLResponse> {
    Json(PnLResponse {
        realized: state.positions.total_realized(),
        unrealized: state.positions.total_unrealized(),
        total: state.positions.total_pnl(),
    })
}

#[derive(Debug, Deserialize)]
struct AlertsQuery {
    severity_floor: Option<String>,
    limit: Option<usize>,
    since: Option<i64>,
}

async fn get_alerts(State(state): State<AppState>, Query(query): Query<AlertsQuery>) -> Json<Vec<Alert>> {
    let floor = query
        .severity_floor
        .as_deref()
        .and_then(severity_from_str);
    let limit = query.limit.unwrap_or(50);

    let mut alerts: Vec<Alert> = state.alerts.recent(usize::MAX);
    if let Some(floor) = floor {
        alerts.retain(|a| a.severity >= floor);
    }
    if let Some(since) = query.since {
        alerts.retain(|a| a.created_at >= since);
    }
    alerts.truncate(limit);
    Json(alerts)
}

fn severity_from_str(s: &str) -> Option<crate::risk::Severity> {
    use crate::risk::Severity::*;
    match s.to_lowercase().as_str() {
        "info" => Some(Info),
        "warning" => Some(Warning),
        "critical" => Some(Critical),
        "emergency" => Some(Emergency),
        _ => None,
    }
}

#[derive(Debug, Serialize)]
struct AckResponse {
    acknowledged: bool,
}

async fn ack_alert(State(state): State<AppState>, Path(id): Path<u64>) -> Json<AckResponse> {
    Json(AckResponse {
        acknowledged: state.alerts.ack(id),
    })
}

#[derive(Debug, Deserialize)]
struct HaltRequest {
    reason: String,
}

#[derive(Debug, Serialize)]
struct HaltResponse {
    halt_state: Arc<crate::risk::monitor::HaltState>,
}

/// `EmergencyHalt`/`ResumeTrading`/`UpdateRiskLimits` require at least the
/// `Trader` role; `UpdateRiskLimits` additionally requires `Admin`.
async fn emergency_halt(
    State(state): State<AppState>,
    req: axum::extract::Request,
) -> Result<Json<HaltResponse>, AuthError> {
    if !has_role(&req, Role::Trader) {
        return Err(AuthError::Forbidden);
    }
    let body: HaltRequest = parse_json_body(req).await?;
    state
        .halt
        .trigger_halt(body.reason.clone(), HaltSource::Manual);
    state.alerts.enqueue(
        crate::risk::Severity::Warning,
        "manual_halt",
        format!("manual halt requested: {}", body.reason),
        HashMap::new(),
    );
    Ok(Json(HaltResponse {
        halt_state: state.halt.current(),
    }))
}

#[derive(Debug, Deserialize, Default)]
struct ResumeRequest {
    #[serde(default)]
    force: bool,
}

async fn resume_trading(
    State(state): State<AppState>,
    req: axum::extract::Request,
) -> Result<Json<HaltResponse>, AuthError> {
    if !has_role(&req, Role::Trader) {
        return Err(AuthError::Forbidden);
    }
    let body: ResumeRequest = parse_json_body(req).await.unwrap_or_default();
    if body.force {
        state.halt.force_resume();
        state.alerts.enqueue(
            crate::risk::Severity::Critical,
            "resume_override",
            "operator forced resume while an emergency violation was active",
            HashMap::new(),
        );
    } else if !state.halt.resume() {
        state.alerts.enqueue(
            crate::risk::Severity::Warning,
            "manual_resume",
            "resume rejected: an emergency violation is still active",
            HashMap::new(),
        );
    }
    Ok(Json(HaltResponse {
        halt_state: state.halt.current(),
    }))
}

async fn update_risk_limits(
    State(state): State<AppState>,
    req: axum::extract::Request,
) -> Result<Json<RiskLimits>, AuthError> {
    if !has_role(&req, Role::Admin) {
        return Err(AuthError::Forbidden);
    }
    let body = body_text(req).await.map_err(|_| AuthError::InvalidToken)?;
    let previous_generation = state.limits.load().generation;
    let updated = RiskLimits::parse_update(&body)
        .map_err(|_| AuthError::InvalidToken)?
        .with_next_generation(previous_generation);
    state.alerts.set_max_alerts_per_hour(updated.max_alerts_per_hour);
    state.limits.store(Arc::new(updated.clone()));
    Ok(Json(updated))
}

async fn evaluate_pretrade(
    State(state): State<AppState>,
    Json(opportunity): Json<Opportunity>,
) -> Json<RiskAssessment> {
    Json(state.evaluator.evaluate(&opportunity))
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    accepted: bool,
}

/// Admitting an event here stands in for the outbound exchange call the
/// real trading engine integration would make to acknowledge it -- the rate
/// limiter gates outbound calls the evaluator or ingestion may need to issue.
async fn ingest_event(
    State(state): State<AppState>,
    Json(event): Json<IngressEvent>,
) -> Result<Json<IngestResponse>, (StatusCode, String)> {
    if let Some(venue) = event.venue() {
        if !state.rate_limiters.try_acquire(venue) {
            return Err((
                StatusCode::TOO_MANY_REQUESTS,
                format!("rate limit exceeded for venue '{venue}'"),
            ));
        }
    }
    state
        .ingest_tx
        .send(event)
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    Ok(Json(IngestResponse { accepted: true }))
}

async fn position_stream_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| position_stream_socket(socket, state))
}

async fn position_stream_socket(mut socket: WebSocket, state: AppState) {
    let mut rx = state.ingestion.subscribe_positions();
    loop {
        match rx.recv().await {
            Ok(update) => {
                let Ok(text) = serde_json::to_string(&update) else { continue };
                if socket.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                // A slow subscriber missed updates; signal a sequence gap so
                // the client can resync rather than silently dropping it.
                if socket
                    .send(Message::Text(r#"{"sequence_gap":true}"#.to_string()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn alert_stream_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| alert_stream_socket(socket, state))
}

async fn alert_stream_socket(mut socket: WebSocket, state: AppState) {
    let mut rx = state.alerts.subscribe();
    loop {
        match rx.recv().await {
            Ok(alert) => {
                let Ok(text) = serde_json::to_string(&alert) else { continue };
                if socket.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                if socket
                    .send(Message::Text(r#"{"sequence_gap":true}"#.to_string()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn body_text(req: axum::extract::Request) -> Result<String, RiskError> {
    let bytes = axum::body::to_bytes(req.into_body(), 1024 * 1024)
        .await
        .map_err(|e| RiskError::validation(format!("reading request body: {e}")))?;
    String::from_utf8(bytes.to_vec())
        .map_err(|e| RiskError::validation(format!("request body not utf-8: {e}")))
}

async fn parse_json_body<T: serde::de::DeserializeOwned>(
    req: axum::extract::Request,
) -> Result<T, AuthError> {
    let bytes = axum::body::to_bytes(req.into_body(), 1024 * 1024)
        .await
        .map_err(|_| AuthError::InvalidToken)?;
    serde_json::from_slice(&bytes).map_err(|_| AuthError::InvalidToken)
}
