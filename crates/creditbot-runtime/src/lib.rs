mod audit;
mod collaborators;
mod compute;
mod kv;
mod looker;
mod orchestrator;
mod slack;
mod state_store;

pub use audit::{verify_audit_chain, AuditJsonl, AuditRecord};
pub use collaborators::{
    CollaboratorError, Collaborators, ComputeEngine, MessageSource, ReplySink, ReportResolver,
};
pub use compute::HttpComputeEngine;
pub use kv::{DirKv, HttpKv, KvBackend, KvError, MemoryKv, SqliteKv};
pub use looker::LookerClient;
pub use orchestrator::{Orchestrator, OrchestratorSettings, RunError, RunPhase};
pub use slack::SlackClient;
pub use state_store::{StateBackends, StateStore};

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use creditbot_config::{Config, Settings};
use creditbot_contracts::{
    ErrorBody, ErrorResponse, RunReport, StateStats, CONTRACT_VERSION, STATE_SNAPSHOT_SCHEMA,
};
use creditbot_kernel::{sha256_hex, QueryClassifier};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

const STATE_HTTP_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("client setup failed: {0}")]
    Collaborator(#[from] CollaboratorError),
    #[error("state backend setup failed: {0}")]
    Kv(#[from] KvError),
    #[error("audit log setup failed: {0}")]
    Audit(String),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error("server failed: {0}")]
    Serve(String),
}

/// Everything one invocation needs. Invocations are serialized through
/// `run_lock`, so the store is loaded fresh for each run.
pub struct Runtime {
    orchestrator: Orchestrator,
    state_key: String,
    backends: StateBackends,
    run_lock: Mutex<()>,
}

impl Runtime {
    pub fn new(orchestrator: Orchestrator, state_key: &str, backends: StateBackends) -> Self {
        Self {
            orchestrator,
            state_key: state_key.to_string(),
            backends,
            run_lock: Mutex::new(()),
        }
    }

    pub async fn from_settings(settings: &Settings) -> Result<Self, RuntimeError> {
        let cfg = &settings.config;
        let creds = &settings.credentials;

        let slack = Arc::new(SlackClient::new(
            &cfg.slack.api_base,
            &creds.slack_bot_token,
            &cfg.bot.channel_id,
            cfg.slack.timeout_ms,
        )?);
        let bot_user_id = match cfg.bot.bot_user_id.clone() {
            Some(id) => id,
            None => slack.resolve_bot_user_id().await?,
        };
        info!(bot_user_id = %bot_user_id, channel = %cfg.bot.channel_id, "slack identity resolved");

        let collaborators = Collaborators {
            source: slack.clone(),
            replies: slack,
            resolver: Arc::new(LookerClient::new(
                &cfg.bi.base_url,
                &creds.bi_client_id,
                &creds.bi_client_secret,
                cfg.bi.timeout_ms,
            )?),
            engine: Arc::new(HttpComputeEngine::new(
                &cfg.compute.endpoint,
                creds.compute_token.clone(),
                cfg.compute.timeout_ms,
            )?),
        };

        let settings_for_run = OrchestratorSettings {
            bot_name: cfg.bot.name.clone(),
            bot_user_id: Some(bot_user_id),
            operator_user_id: creds.operator_user_id.clone(),
            bi_domain: cfg.bi.domain.clone(),
            fetch_limit: cfg.bot.fetch_limit,
            max_entries: cfg.state.max_entries,
        };
        let classifier = QueryClassifier::new(&cfg.classifier.keyword, &cfg.classifier.qualifiers);
        let audit = AuditJsonl::new(
            &cfg.audit.jsonl_path,
            cfg.audit.immutable_mirror_path.as_deref(),
        )
        .await
        .map_err(RuntimeError::Audit)?;
        let orchestrator = Orchestrator::new(settings_for_run, classifier, collaborators)
            .with_audit(Arc::new(audit));

        Ok(Self::new(
            orchestrator,
            &cfg.state.key,
            state_backends(cfg, creds.state_token.clone())?,
        ))
    }

    pub async fn load_store(&self) -> StateStore {
        StateStore::load(&self.state_key, self.backends.clone()).await
    }

    pub async fn run_invocation(&self) -> Result<RunReport, RunError> {
        let _guard = self.run_lock.lock().await;
        let mut store = self.load_store().await;
        self.orchestrator.run_once(&mut store).await
    }

    pub async fn stats(&self) -> StateStats {
        let _guard = self.run_lock.lock().await;
        StateStore::inspect(&self.state_key, self.backends.clone())
            .await
            .stats()
    }
}

pub fn state_backends(cfg: &Config, token: Option<String>) -> Result<StateBackends, KvError> {
    let primary: Option<Arc<dyn KvBackend>> = match &cfg.state.primary {
        None => None,
        Some(primary) => match primary.kind.as_str() {
            "memory" => Some(Arc::new(MemoryKv::new())),
            "sqlite" => {
                let path = primary.sqlite_path.as_deref().unwrap_or_default();
                Some(Arc::new(SqliteKv::open(path)?))
            }
            "http" => {
                let endpoint = primary.endpoint.as_deref().unwrap_or_default();
                Some(Arc::new(HttpKv::new(endpoint, token, STATE_HTTP_TIMEOUT_MS)?))
            }
            other => {
                return Err(KvError::Io(format!("unsupported state.primary.type {other}")));
            }
        },
    };
    let fallback: Option<Arc<dyn KvBackend>> = cfg
        .state
        .fallback_dir
        .as_deref()
        .map(|dir| Arc::new(DirKv::new(dir)) as Arc<dyn KvBackend>);
    Ok(StateBackends { primary, fallback })
}

pub async fn serve(
    settings: Settings,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), RuntimeError> {
    let addr: SocketAddr = settings
        .config
        .server
        .listen_addr
        .parse()
        .map_err(|e| RuntimeError::Serve(format!("invalid listen_addr: {e}")))?;

    let runtime = Arc::new(Runtime::from_settings(&settings).await?);
    let app = build_app(runtime);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| RuntimeError::Serve(format!("bind failed: {e}")))?;
    info!(%addr, "control plane listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| RuntimeError::Serve(e.to_string()))
}

pub fn build_app(runtime: Arc<Runtime>) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/stats", get(stats))
        .route("/v1/runs", post(runs))
        .route("/v1/contracts", get(contracts))
        .with_state(runtime)
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn stats(State(runtime): State<Arc<Runtime>>) -> Json<StateStats> {
    Json(runtime.stats().await)
}

async fn runs(
    State(runtime): State<Arc<Runtime>>,
) -> Result<Json<RunReport>, (StatusCode, Json<ErrorResponse>)> {
    runtime.run_invocation().await.map(Json).map_err(|e| {
        (
            StatusCode::BAD_GATEWAY,
            Json(ErrorResponse {
                error: ErrorBody {
                    code: "run_failed".to_string(),
                    message: e.to_string(),
                },
            }),
        )
    })
}

async fn contracts() -> Json<Value> {
    let schema: Value = serde_json::from_str(STATE_SNAPSHOT_SCHEMA).unwrap_or(Value::Null);
    Json(json!({
        "version": CONTRACT_VERSION,
        "state_snapshot": {
            "schema": schema,
            "sha256": sha256_hex(STATE_SNAPSHOT_SCHEMA.as_bytes()),
        }
    }))
}
