use std::{future::Future, net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, Query, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    audit::{AuditSink, JsonLinesAuditSink, NoopAuditSink},
    registry::{Registry, RegistryStats, UserId},
    session::{AdmissionParams, SessionContext, run_connection},
};

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Runtime settings for [`Server`], usually built from the `serve` CLI flags.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Per-connection outbound queue size; frames beyond it are dropped.
    pub queue_capacity: usize,
    pub audit_log: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 3000)),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            audit_log: None,
        }
    }
}

pub struct Server {
    listener: TcpListener,
    ctx: SessionContext,
}

impl Server {
    /// Binds the listener and opens the audit log if one is configured.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;

        let audit: Arc<dyn AuditSink> = match &config.audit_log {
            Some(path) => {
                let sink = JsonLinesAuditSink::open(path).await?;
                info!(path = %sink.path().display(), "audit log enabled");
                Arc::new(sink)
            }
            None => Arc::new(NoopAuditSink),
        };

        Ok(Self::with_audit(listener, config.queue_capacity, audit))
    }

    pub fn new(listener: TcpListener) -> Self {
        Self::with_audit(listener, DEFAULT_QUEUE_CAPACITY, Arc::new(NoopAuditSink))
    }

    pub fn with_audit(
        listener: TcpListener,
        queue_capacity: usize,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            listener,
            ctx: SessionContext {
                registry: Arc::new(Registry::new()),
                audit,
                queue_capacity: queue_capacity.max(1),
                shutdown: CancellationToken::new(),
            },
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared registry, for introspection.
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.ctx.registry)
    }

    /// Serves until `shutdown` resolves, then closes every open session.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server { listener, ctx } = self;
        let sessions = ctx.shutdown.clone();

        axum::serve(listener, router(ctx))
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("server shutting down");
                sessions.cancel();
            })
            .await
            .context("server error")
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

pub fn router(ctx: SessionContext) -> Router {
    Router::new()
        .route("/ws", get(upgrade))
        .route("/ws/", get(upgrade))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/rooms/:room_id", get(room_members))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Upgrades unconditionally; a missing `userId` is answered on the socket
/// itself with the rejection payload. A query string that cannot be decoded
/// counts as missing the id.
async fn upgrade(
    ws: WebSocketUpgrade,
    query: Option<Query<Vec<(String, String)>>>,
    State(ctx): State<SessionContext>,
) -> impl IntoResponse {
    let params = match query {
        Some(Query(pairs)) => AdmissionParams::from_query(pairs),
        None => AdmissionParams::default(),
    };
    ws.on_upgrade(move |socket| async move {
        run_connection(socket, params, ctx).await;
    })
}

async fn health() -> &'static str {
    "ok"
}

async fn stats(State(ctx): State<SessionContext>) -> Json<RegistryStats> {
    Json(ctx.registry.stats().await)
}

#[derive(Debug, Serialize)]
struct RoomMembers {
    room: String,
    members: Vec<UserId>,
}

async fn room_members(
    Path(room_id): Path<String>,
    State(ctx): State<SessionContext>,
) -> Json<RoomMembers> {
    let members = ctx.registry.members(&room_id).await.into_iter().collect();
    Json(RoomMembers {
        room: room_id,
        members,
    })
}
