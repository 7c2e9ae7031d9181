//! Core server: accepts connections and hands each to its own task.
//!
//! Owns the room registry, router and admission limiter shared by every
//! connection, and coordinates shutdown.

use crate::config::ServerConfig;
use crate::rate_limit::RateLimiter;
use crate::registry::RoomRegistry;
use crate::router::Router;
use crate::session;
use sigrelay_core::{CloseCode, RelayError, RelayResult};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// How often expired rate-limit and offer records are dropped.
const GC_INTERVAL: Duration = Duration::from_secs(60);

/// State shared by all connection tasks.
pub struct ServerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Room registry.
    pub registry: Arc<RoomRegistry>,
    /// Envelope router over the registry.
    pub router: Router,
    /// Upgrade attempts per remote address.
    pub limiter: Mutex<RateLimiter>,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
}

impl ServerContext {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(RoomRegistry::new());
        let offer_window = config.dedupe_offers.then_some(config.offer_dedupe_window);
        let router = Router::new(registry.clone(), offer_window);
        let limiter = Mutex::new(RateLimiter::per_minute(config.upgrade_attempts_per_minute));
        Self {
            config,
            registry,
            router,
            limiter,
            next_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }
}

/// The signaling relay server.
pub struct SignalingServer {
    ctx: Arc<ServerContext>,
}

impl SignalingServer {
    /// Create a new server instance.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            ctx: Arc::new(ServerContext::new(config)),
        }
    }

    pub fn registry(&self) -> Arc<RoomRegistry> {
        self.ctx.registry.clone()
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> RelayResult<TcpListener> {
        let addr = self.ctx.config.bind_addr()?;
        TcpListener::bind(addr)
            .await
            .map_err(|e| RelayError::Other(format!("bind {addr} failed: {e}")))
    }

    /// Bind and serve until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> RelayResult<()>
    where
        F: Future<Output = ()>,
    {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` resolves, then close
    /// every connection with 1001 and wait out the grace period.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> RelayResult<()>
    where
        F: Future<Output = ()>,
    {
        let local: SocketAddr = listener.local_addr()?;
        info!(addr = %local, "signaling relay listening");

        let mut tasks = JoinSet::new();
        let mut gc = tokio::time::interval(GC_INTERVAL);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!(remote = %remote, "TCP connection accepted");
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(remote = %remote, error = %e, "failed to set TCP_NODELAY");
                        }
                        let ctx = self.ctx.clone();
                        tasks.spawn(session::handle_connection(stream, remote, ctx));
                    }
                    Err(e) => error!(error = %e, "TCP accept failed"),
                },
                _ = gc.tick() => {
                    let addresses = self.ctx.limiter.lock().await.gc();
                    let offers = self.ctx.router.gc().await;
                    if addresses + offers > 0 {
                        debug!(addresses, offers, "expired admission and offer records dropped");
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "connection task panicked");
                        }
                    }
                }
            }
        }

        drop(listener);
        self.ctx.begin_shutdown();
        let closing = self
            .ctx
            .registry
            .close_all(CloseCode::GoingAway, "server shutting down")
            .await;
        info!(connections = closing, "shutting down, closing connections");

        let grace = self.ctx.config.shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), "shutdown grace elapsed, aborting connections");
            tasks.shutdown().await;
        }

        info!("signaling relay stopped");
        Ok(())
    }
}
