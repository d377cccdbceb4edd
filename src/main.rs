use axum::{
    extract::Request,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::Response,
    response::{Html, IntoResponse, Redirect},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use digit_stats::deriv_api::ws_url;
use digit_stats::{DigitManager, StatsError, StreamEvent};
use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::sync::Arc;
use sysinfo::{Pid, System};
use time::Duration;
use tokio::sync::{broadcast, mpsc};
use tower::ServiceExt;
use tower_http::services::ServeDir;
use tower_sessions::{Expiry, MemoryStore, Session, SessionManagerLayer};

mod config;
use config::{load_relay_config, save_relay_config, RelayConfig, CONFIG_FILE};

mod firestore_manager;
use firestore_manager::{DigitCacheRecord, GlobalFirestore};

mod messages;
use messages::{BroadcastMessage, ClientCommand, ConnectionStatus, SymbolSnapshot};

mod tick_stream;
use tick_stream::TickStream;

const VERSION: &str = "0.1.0";

#[derive(Debug, Deserialize)]
pub struct LoginPayload {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
pub struct SystemResources {
    pub memory_used_mb: u64,
    pub total_memory_mb: u64,
    pub cpu_usage: f32,
    pub uptime_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    pub window: Option<usize>,
}

struct AppState {
    tx: broadcast::Sender<BroadcastMessage>,
    manager: Arc<DigitManager>,
    stream: Arc<TickStream>,
    firestore: Arc<tokio::sync::Mutex<GlobalFirestore>>,
    config: RelayConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if !std::path::Path::new(CONFIG_FILE).exists() {
        if let Err(e) = save_relay_config(&RelayConfig::default()) {
            warn!("⚠️ Could not write default config: {}", e);
        }
    }

    let config = load_relay_config();
    config.validate().map_err(|e| anyhow::anyhow!(e))?;

    let manager = Arc::new(DigitManager::new(config.tracker_options())?);
    let upstream_url = ws_url(&config.deriv.ws_url, &config.deriv.app_id);

    // Session setup
    let session_store = MemoryStore::default();
    let session_layer = SessionManagerLayer::new(session_store)
        .with_secure(false)
        .with_expiry(Expiry::OnInactivity(Duration::minutes(60)));

    let (tx, _) = broadcast::channel::<BroadcastMessage>(1024);

    // Initialize Firestore
    let mut firestore = GlobalFirestore::new();
    match env::var("FIRESTORE_PROJECT_ID") {
        Ok(project_id) if !project_id.is_empty() => {
            if let Err(e) = firestore.initialize(&project_id).await {
                warn!("⚠️ Firestore initialization warning: {}", e);
            }
        }
        _ => warn!("⚠️ FIRESTORE_PROJECT_ID not set in .env - digit cache disabled"),
    }
    let firestore = Arc::new(tokio::sync::Mutex::new(firestore));

    // Cached buffers first. History then appends what happened since the
    // cache was written, or replaces a buffer it cannot reach back to.
    let restored = restore_from_cache(&config, &manager, &firestore).await;
    info!("🔥 {} of {} symbols restored from cache", restored, config.deriv.symbols.len());
    for (symbol, result) in manager
        .initialize(
            &upstream_url,
            config.deriv.symbols.clone(),
            config.deriv.history_count,
        )
        .await
    {
        match result {
            Ok(kept) => info!("📊 {} holds {} digits after history", symbol, kept),
            Err(e) => warn!("⚠️ No history for {}: {}", symbol, e),
        }
    }

    let stream = Arc::new(TickStream::new(
        upstream_url,
        config.deriv.history_count,
        1024,
    ));
    // subscribe before starting so the first ticks are not missed
    let events = stream.subscribe();

    let state = Arc::new(AppState {
        tx,
        manager,
        stream,
        firestore,
        config,
    });

    tokio::spawn(run_digit_pipeline(state.clone(), events));
    state
        .stream
        .start(state.config.deriv.symbols.clone(), state.manager.last_epochs())
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    if state.config.cache.enabled && state.firestore.lock().await.is_enabled() {
        tokio::spawn(run_cache_mirror(state.clone()));
    }

    let app = Router::new()
        .route("/login", get(serve_login_html).post(login_handler))
        .route("/logout", get(logout_handler))
        .route("/ws", get(websocket_handler))
        .route("/api/digits", get(all_digits_handler))
        .route("/api/digits/:symbol", get(digit_snapshot_handler))
        .route("/api/digits/:symbol/reset", post(digit_reset_handler))
        .route("/api/digits/:symbol/state", get(digit_state_handler))
        .route("/api/stream/status", get(stream_status_handler))
        .route("/api/system/resources", get(system_resources_handler))
        .fallback(get(protected_file_handler))
        .layer(session_layer)
        .with_state(state.clone());

    let bind = state.config.server.bind.clone();
    info!("-----------------------------------------");
    info!("🚀 DIGIT RELAY v{} STARTING AT http://{}", VERSION, bind);
    info!("🔐 Authentication Enabled (User from .env)");
    info!("-----------------------------------------");

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = state.stream.stop().await {
        warn!("⚠️ {}", e);
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("❌ Failed to listen for shutdown signal: {}", e);
    }
    info!("🛑 Shutdown requested");
}

/// Restore trackers from the digit cache. Returns how many symbols it restored.
async fn restore_from_cache(
    config: &RelayConfig,
    manager: &DigitManager,
    firestore: &tokio::sync::Mutex<GlobalFirestore>,
) -> usize {
    let fs = firestore.lock().await;
    if !config.cache.enabled || !fs.is_enabled() {
        return 0;
    }

    let mut restored = 0;
    for symbol in &config.deriv.symbols {
        match fs.load_digits(symbol).await {
            Ok(Some(record)) => {
                match manager.restore(symbol, &record.to_state(), record.last_epoch()) {
                    Ok(()) => {
                        restored += 1;
                        info!(
                            "🔥 Restored {} digits for {} from cache ({})",
                            record.items.len(),
                            symbol,
                            record.updated_at
                        );
                    }
                    Err(e) => warn!("⚠️ Cached state for {} rejected: {}", symbol, e),
                }
            }
            Ok(None) => {}
            Err(e) => warn!("⚠️ Cache lookup failed for {}: {}", symbol, e),
        }
    }
    restored
}

/// Stream events -> trackers -> browsers
async fn run_digit_pipeline(state: Arc<AppState>, mut rx: broadcast::Receiver<StreamEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("⚠️ Digit pipeline lagged, {} ticks skipped", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match &event {
            StreamEvent::Connected { .. } | StreamEvent::ConnectionLost { .. } => {
                let status = state.stream.status().await;
                let message = match &event {
                    StreamEvent::ConnectionLost { reason } => reason.clone(),
                    _ => "connected".to_string(),
                };
                // snapshots are left as they are; only connectivity changes
                let _ = state
                    .tx
                    .send(BroadcastMessage::ConnectionStatus(ConnectionStatus {
                        connected: matches!(event, StreamEvent::Connected { .. }),
                        reconnects: status.reconnects,
                        message,
                    }));
            }
            StreamEvent::HistoryLoaded { symbol, .. } => {
                state.manager.apply_event(&event);
                if let Ok(snapshot) = state.manager.default_snapshot(symbol) {
                    let _ = state.tx.send(BroadcastMessage::Snapshot(SymbolSnapshot {
                        symbol: symbol.clone(),
                        snapshot,
                    }));
                }
            }
            StreamEvent::TickArrived { .. } => {
                if let Some(update) = state.manager.apply_event(&event) {
                    let _ = state.tx.send(BroadcastMessage::DigitUpdate(update));
                }
            }
        }
    }

    warn!("📭 Digit pipeline stopped: stream channel closed");
}

/// Periodically mirror every buffer to the digit cache
async fn run_cache_mirror(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(
        state.config.cache.interval_secs.max(1),
    ));

    loop {
        interval.tick().await;
        let updated_at = Utc::now().to_rfc3339();
        let fs = state.firestore.lock().await;
        let mut saved = 0;
        for (symbol, tracker_state, last_epoch) in state.manager.export_all_with_epochs() {
            let record = DigitCacheRecord::from_state(
                &symbol,
                &tracker_state,
                last_epoch,
                updated_at.clone(),
            );
            match fs.save_digits(&record).await {
                Ok(_) => saved += 1,
                Err(e) => warn!("⚠️ Cache save failed for {}: {}", symbol, e),
            }
        }
        info!("🔥 Mirrored {} digit buffers to Firestore", saved);
    }
}

// Auth Handlers
async fn serve_login_html() -> Html<String> {
    match fs::read_to_string("public/login.html") {
        Ok(content) => Html(content),
        Err(_) => Html("<h1>Login page not found</h1>".to_string()),
    }
}

async fn login_handler(session: Session, Json(payload): Json<LoginPayload>) -> Response {
    let env_user = env::var("APP_USER").unwrap_or_else(|_| "admin".to_string());
    let env_pass = env::var("APP_PASSWORD").unwrap_or_else(|_| "password".to_string());

    if payload.username == env_user && payload.password == env_pass {
        if let Err(e) = session.insert("user", "authenticated").await {
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
        return (StatusCode::OK, "OK").into_response();
    }

    (StatusCode::UNAUTHORIZED, "Invalid credentials").into_response()
}

async fn logout_handler(session: Session) -> Redirect {
    let _ = session.delete().await;
    Redirect::to("/login")
}

async fn is_authenticated(session: &Session) -> bool {
    session
        .get::<String>("user")
        .await
        .unwrap_or(None)
        .is_some()
}

async fn protected_file_handler(session: Session, req: Request) -> Response {
    if !is_authenticated(&session).await {
        return Redirect::to("/login").into_response();
    }
    let service = ServeDir::new("public");
    match service.oneshot(req).await {
        Ok(res) => res.into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {}", err)).into_response(),
    }
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    session: Session,
    State(state): State<Arc<AppState>>,
) -> Response {
    if !is_authenticated(&session).await {
        return Redirect::to("/login").into_response();
    }
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("🔌 New Browser connected");
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.tx.subscribe();
    // replies meant for this browser only
    let (reply_tx, mut reply_rx) = mpsc::channel::<BroadcastMessage>(32);

    let mut send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                msg = rx.recv() => match msg {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                reply = reply_rx.recv() => match reply {
                    Some(msg) => msg,
                    None => break,
                },
            };
            if let Ok(json) = serde_json::to_string(&msg) {
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
    });

    let state_clone = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(cmd) => {
                        for reply in handle_command(&state_clone, cmd).await {
                            if reply_tx.send(reply).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!("⚠️ JSON Parse Error: {}", e),
                }
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => { recv_task.abort(); info!("📤 Send task ended") },
        _ = (&mut recv_task) => { send_task.abort(); info!("📥 Receive task ended") },
    };
}

/// Clear `symbol` and push the empty histogram to every dashboard.
fn reset_and_broadcast(state: &AppState, symbol: &str) -> Result<(), StatsError> {
    state.manager.reset(symbol)?;
    let snapshot = state.manager.default_snapshot(symbol)?;
    info!("🧹 Statistics cleared for {}", symbol);
    let _ = state.tx.send(BroadcastMessage::Snapshot(SymbolSnapshot {
        symbol: symbol.to_string(),
        snapshot,
    }));
    Ok(())
}

async fn handle_command(state: &AppState, cmd: ClientCommand) -> Vec<BroadcastMessage> {
    match cmd.command.as_str() {
        "SNAPSHOT" => {
            let result = match cmd.window {
                Some(window) => state.manager.snapshot(&cmd.symbol, window),
                None => state.manager.default_snapshot(&cmd.symbol),
            };
            match result {
                Ok(snapshot) => vec![BroadcastMessage::Snapshot(SymbolSnapshot {
                    symbol: cmd.symbol,
                    snapshot,
                })],
                Err(e) => vec![BroadcastMessage::Error {
                    message: e.to_string(),
                }],
            }
        }
        "RESET" => match reset_and_broadcast(state, &cmd.symbol) {
            Ok(()) => Vec::new(),
            Err(e) => vec![BroadcastMessage::Error {
                message: e.to_string(),
            }],
        },
        "SYNC" => {
            let status = state.stream.status().await;
            let mut replies = vec![BroadcastMessage::ConnectionStatus(ConnectionStatus {
                connected: status.connected,
                reconnects: status.reconnects,
                message: status.errors.last().cloned().unwrap_or_default(),
            })];
            replies.extend(
                state
                    .manager
                    .all_snapshots()
                    .into_iter()
                    .map(|(symbol, snapshot)| {
                        BroadcastMessage::Snapshot(SymbolSnapshot { symbol, snapshot })
                    }),
            );
            replies
        }
        other => vec![BroadcastMessage::Error {
            message: format!("unknown command: {}", other),
        }],
    }
}

// ==================== Digit API Handlers ====================

fn stats_error_response(e: StatsError) -> Response {
    let status = match e {
        StatsError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        StatsError::UnknownSymbol(_) => StatusCode::NOT_FOUND,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
}

async fn all_digits_handler(State(state): State<Arc<AppState>>) -> Response {
    let snapshots: Vec<SymbolSnapshot> = state
        .manager
        .all_snapshots()
        .into_iter()
        .map(|(symbol, snapshot)| SymbolSnapshot { symbol, snapshot })
        .collect();
    Json(snapshots).into_response()
}

async fn digit_snapshot_handler(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<WindowQuery>,
) -> Response {
    let result = match query.window {
        Some(window) => state.manager.snapshot(&symbol, window),
        None => state.manager.default_snapshot(&symbol),
    };
    match result {
        Ok(snapshot) => Json(SymbolSnapshot { symbol, snapshot }).into_response(),
        Err(e) => stats_error_response(e),
    }
}

async fn digit_reset_handler(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Response {
    match reset_and_broadcast(&state, &symbol) {
        Ok(()) => Json(serde_json::json!({ "success": true, "symbol": symbol })).into_response(),
        Err(e) => stats_error_response(e),
    }
}

async fn digit_state_handler(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Response {
    match state.manager.export_state(&symbol) {
        Ok(tracker_state) => Json(tracker_state).into_response(),
        Err(e) => stats_error_response(e),
    }
}

async fn stream_status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.stream.status().await).into_response()
}

async fn system_resources_handler() -> Response {
    let mut sys = System::new_all();
    sys.refresh_all();
    let pid = Pid::from_u32(std::process::id());

    let memory_used_mb = if let Some(process) = sys.process(pid) {
        process.memory() / 1024 / 1024
    } else {
        0
    };

    Json(SystemResources {
        memory_used_mb,
        total_memory_mb: sys.total_memory() / 1024 / 1024,
        cpu_usage: sys.global_cpu_usage(),
        uptime_secs: System::uptime(),
    })
    .into_response()
}
