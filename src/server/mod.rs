//! Server orchestration: accept loop, per-session setup, and the binary
//! entry point.
//!
//! A [`Server`] pairs a [`HostRuntime`] with the process-wide lock
//! registry and per-session policy (option caps, allow-list, auth,
//! global-lock wrapping). Each accepted transport runs its own handshake
//! and dispatch engine; sessions share the runtime and the lock manager
//! but own their handle tables. The binary is a thin wrapper over
//! [`run`].

pub mod cli;

use std::{collections::HashSet, sync::Arc};

use anyhow::Result;
use tokio::{net::TcpListener, sync::watch, task::JoinSet};
use tracing::{error, info, warn};

pub use cli::{AppConfig, Cli};

use crate::{
    coerce::{Coercer, ShmConfig},
    dispatch::Engine,
    handler::{InjectHook, ServerConfig, ServerHandler},
    lock::LockManager,
    logical::LogicalThreads,
    protocol::{OptionFlags, SessionOptions},
    runtime::{HostRuntime, Registry},
    session::{self, AuthPolicy, Responder, SessionError},
    transport::Transport,
};

/// Exit codes for the daemon binary.
pub mod exit_codes {
    /// Clean shutdown.
    pub const OK: i32 = 0;
    /// Unclassified internal fault.
    pub const INTERNAL: i32 = 1;
    /// The listen address could not be bound.
    pub const BIND_FAILED: i32 = 2;
    /// Authentication or TLS setup failed.
    pub const AUTH_SETUP: i32 = 3;
}

/// A running session on the server side.
pub struct SessionHandle {
    /// The session's dispatch engine.
    pub engine: Engine,
    /// The session's request handler (export table included).
    pub handler: Arc<ServerHandler>,
}

impl SessionHandle {
    /// Completes when the session closes.
    pub async fn closed(&self) { self.engine.closed().await }
}

/// Shared server state and per-session policy.
pub struct Server {
    runtime: Arc<dyn HostRuntime>,
    locks: Arc<LockManager>,
    caps: SessionOptions,
    identity: String,
    allow_list: Option<HashSet<String>>,
    auth: Option<AuthPolicy>,
    global_lock: bool,
    shm: Option<ShmConfig>,
    inject_hook: Option<InjectHook>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("identity", &self.identity)
            .field("caps", &self.caps)
            .field("global_lock", &self.global_lock)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// A server over the given runtime with default policy.
    #[must_use]
    pub fn new(runtime: Arc<dyn HostRuntime>) -> Self {
        Self {
            runtime,
            locks: Arc::new(LockManager::default()),
            caps: SessionOptions {
                num_workers: 8,
                flags: OptionFlags::all(),
            },
            identity: "janus-server".to_owned(),
            allow_list: None,
            auth: None,
            global_lock: false,
            shm: Some(ShmConfig::default()),
            inject_hook: None,
        }
    }

    /// Cap the options any session may negotiate.
    #[must_use]
    pub fn with_caps(mut self, caps: SessionOptions) -> Self {
        self.caps = caps;
        self
    }

    /// Announce this identity in HELLO_ACK.
    #[must_use]
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    /// Restrict client-visible classes to this set.
    #[must_use]
    pub fn with_allow_list(mut self, allow: HashSet<String>) -> Self {
        self.allow_list = Some(allow);
        self
    }

    /// Install an authentication policy.
    #[must_use]
    pub fn with_auth(mut self, auth: AuthPolicy) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Hold the process-wide lock for the duration of every request.
    #[must_use]
    pub fn with_global_lock(mut self, enabled: bool) -> Self {
        self.global_lock = enabled;
        self
    }

    /// Override the shared-memory configuration (`None` disables it).
    #[must_use]
    pub fn with_shm(mut self, shm: Option<ShmConfig>) -> Self {
        self.shm = shm;
        self
    }

    /// Install the source-injection hook.
    #[must_use]
    pub fn with_inject_hook(mut self, hook: InjectHook) -> Self {
        self.inject_hook = Some(hook);
        self
    }

    /// The process-wide lock registry, shareable with non-bridge code.
    #[must_use]
    pub fn locks(&self) -> Arc<LockManager> { Arc::clone(&self.locks) }

    /// Handshake and serve one transport.
    ///
    /// # Errors
    /// Returns the handshake failure; an established session only ends
    /// through its engine.
    pub async fn serve_transport(&self, transport: Transport) -> Result<SessionHandle, SessionError> {
        let mut caps = self.caps.clone();
        if self.shm.is_none() {
            caps.flags &= !OptionFlags::USE_SHM;
        }
        if self.allow_list.is_some() {
            caps.flags |= OptionFlags::ALLOW_LIST;
        }
        let responder = Responder {
            identity: self.identity.clone(),
            caps,
            auth: self.auth.clone(),
        };
        let established = session::respond(transport, &responder).await?;
        let options = established.options.clone();
        let use_shm = options.flags.contains(OptionFlags::USE_SHM);
        let coercer = match (&self.shm, use_shm) {
            (Some(cfg), true) => Coercer::with_shm(cfg.clone()),
            _ => Coercer::default(),
        };
        let engine = Engine::new(
            established.transport,
            options.num_workers,
            Arc::new(LogicalThreads::responder()),
        );
        let handler = ServerHandler::new(ServerConfig {
            runtime: Arc::clone(&self.runtime),
            locks: Arc::clone(&self.locks),
            options,
            coercer,
            allow_list: self.allow_list.clone(),
            global_lock: self.global_lock,
            inject_hook: self.inject_hook.clone(),
        });
        engine.start(Arc::clone(&handler) as Arc<dyn crate::dispatch::Handler>);
        Ok(SessionHandle { engine, handler })
    }

    /// Accept connections until a shutdown signal arrives.
    ///
    /// # Errors
    /// Propagates bind failures; per-connection failures are logged and
    /// absorbed.
    pub async fn listen(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        info!(%local, "janus listening");
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        let mut join_set = JoinSet::new();
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("shutdown signal received");
                    break;
                }
                res = listener.accept() => {
                    match res {
                        Ok((socket, peer)) => {
                            let server = Arc::clone(&self);
                            join_set.spawn(async move {
                                match Transport::tcp(socket, None) {
                                    Ok(transport) => match server.serve_transport(transport).await {
                                        Ok(handle) => handle.closed().await,
                                        Err(e) => warn!(%peer, "handshake failed: {e}"),
                                    },
                                    Err(e) => warn!(%peer, "transport setup failed: {e}"),
                                }
                            });
                        }
                        Err(e) => {
                            error!("accept error: {e}");
                        }
                    }
                }
            }
        }

        let _ = shutdown_tx.send(true);
        while let Some(res) = join_set.join_next().await {
            if let Err(e) = res {
                error!("session task error: {e}");
            }
        }
        Ok(())
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let Ok(mut term) = signal(SignalKind::terminate()) else {
            let _ = tokio::signal::ctrl_c().await;
            return;
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Build the server described by a resolved configuration.
///
/// # Errors
/// Fails on unreadable allow-list files and on TLS flags, which this
/// build delegates to an external terminator.
pub fn build_server(config: &AppConfig, runtime: Arc<dyn HostRuntime>) -> Result<Server> {
    if config.tls_key.is_some() || config.tls_cert.is_some() {
        anyhow::bail!(
            "TLS termination is not linked into this build; terminate TLS in front of janusd"
        );
    }
    let mut server = Server::new(runtime)
        .with_identity(config.identity.clone())
        .with_global_lock(config.global_lock)
        .with_caps(SessionOptions {
            num_workers: config.workers.max(1),
            flags: OptionFlags::all(),
        });
    if !config.shm {
        server = server.with_shm(None);
    }
    if let Some(path) = &config.allow_list {
        let allow = session::load_allow_list(path)?;
        info!(classes = allow.len(), "allow-list active");
        server = server.with_allow_list(allow);
    }
    Ok(server)
}

/// Run the daemon with a resolved configuration and runtime.
///
/// # Errors
/// Propagates bind and configuration failures; the caller maps them to
/// [`exit_codes`].
pub async fn run_with_config(config: AppConfig, runtime: Arc<dyn HostRuntime>) -> Result<()> {
    let server = Arc::new(build_server(&config, runtime)?);
    if config.stdio {
        let transport = Transport::from_stream(
            Box::new(tokio::io::stdin()),
            Box::new(tokio::io::stdout()),
            crate::transport::PeerInfo {
                address: "stdio".to_owned(),
                user_name: None,
                localhost: true,
            },
        );
        let handle = server.serve_transport(transport).await?;
        handle.closed().await;
        return Ok(());
    }
    let listener = TcpListener::bind(&config.bind)
        .await
        .map_err(|e| anyhow::anyhow!("cannot bind {}: {e}", config.bind))?;
    server.listen(listener).await
}

/// Parse the command line and run the daemon over an empty registry.
///
/// Embedders that export classes use [`run_with_config`] with their own
/// [`Registry`]; the bare daemon still serves named locks, futures, and
/// liveness probes.
///
/// # Errors
/// As [`run_with_config`], plus configuration-layer failures.
pub async fn run() -> Result<()> {
    let config =
        AppConfig::load_from_iter(std::env::args_os()).map_err(|e| anyhow::anyhow!("{e}"))?;
    let registry = Registry::builder()
        .build()
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    run_with_config(config, Arc::new(registry)).await
}
