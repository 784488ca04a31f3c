//! Server lifecycle.
//!
//! The controller owns the mutable [`ServerState`], binds the listener, runs
//! the proxy engine in a background task and publishes every phase change.

use std::net::SocketAddr;
use std::sync::Arc;

use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use hudsucker::Proxy;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use ferry_core::{Phase, ServerConfig, ServerState};

use crate::ca::ephemeral_authority;
use crate::error::{ProxyError, Result};
use crate::handler::FerryHandler;
use crate::interceptors::build_pipeline;
use crate::status::mark_process_start;

const SIGNAL_CAPACITY: usize = 16;

struct RunningEngine {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl RunningEngine {
    async fn close(self) -> Result<()> {
        tracing::debug!("Closing listener on {}", self.addr);
        // The engine may already have exited on its own.
        let _ = self.shutdown.send(());
        self.task
            .await
            .map_err(|e| ProxyError::Engine(e.to_string()))?
    }
}

/// Starts and stops the proxy, enforcing the phase rules.
pub struct LifecycleController {
    state: RwLock<ServerState>,
    signals: broadcast::Sender<Phase>,
    engine: Mutex<Option<RunningEngine>>,
    /// Held for the whole of `start()`; `stop()` waits on it so that an
    /// engine being launched is never missed.
    launching: tokio::sync::Mutex<()>,
}

impl LifecycleController {
    /// Creates a stopped controller for `config`.
    pub fn new(config: ServerConfig) -> Result<Self> {
        mark_process_start();
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Ok(Self {
            state: RwLock::new(ServerState::new(config)?),
            signals,
            engine: Mutex::new(None),
            launching: tokio::sync::Mutex::new(()),
        })
    }

    /// Receives every phase entered from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Phase> {
        self.signals.subscribe()
    }

    pub fn phase(&self) -> Phase {
        self.state.read().phase()
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> ServerState {
        self.state.read().clone()
    }

    /// Address of the running listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.engine.lock().as_ref().map(|engine| engine.addr)
    }

    /// Binds the listener and runs the engine.
    ///
    /// On failure the server stays `STARTING`; call [`stop`](Self::stop)
    /// before retrying.
    pub async fn start(&self) -> Result<SocketAddr> {
        let _launching = self.launching.lock().await;
        self.transition(Phase::Starting)?;

        let addr = self.launch().await.map_err(|e| {
            tracing::error!("Failed to start: {}", e);
            e
        })?;

        if let Err(e) = self.transition(Phase::Started) {
            // Stopped while launching; the engine must not outlive the phase.
            let engine = self.engine.lock().take();
            if let Some(engine) = engine {
                if let Err(close) = engine.close().await {
                    tracing::error!("Error while closing: {}", close);
                }
            }
            return Err(e);
        }
        tracing::info!("Listening on {}", self.state.read().url());
        Ok(addr)
    }

    /// Shuts the engine down gracefully and waits for it to finish.
    pub async fn stop(&self) -> Result<()> {
        self.transition(Phase::Stopping)?;

        let _launching = self.launching.lock().await;
        let engine = self.engine.lock().take();
        let result = match engine {
            Some(engine) => engine.close().await,
            None => Ok(()),
        };
        if let Err(e) = &result {
            tracing::error!("Error while closing: {}", e);
        }

        self.transition(Phase::Stopped)?;
        result
    }

    async fn launch(&self) -> Result<SocketAddr> {
        let (hostname, port) = {
            let state = self.state.read();
            (state.config().hostname.clone(), state.config().port)
        };

        let listener = TcpListener::bind((hostname.as_str(), port)).await?;
        let addr = listener.local_addr()?;

        let snapshot = {
            let mut state = self.state.write();
            state.record_port(addr.port());
            Arc::new(state.clone())
        };

        let pipeline = build_pipeline(snapshot)?;
        for (stage, name) in pipeline.registrations() {
            tracing::debug!("Registered {:?} interceptor {}", stage, name);
        }
        let handler = FerryHandler::new(Arc::new(pipeline));
        let authority = ephemeral_authority()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let proxy = Proxy::builder()
            .with_listener(listener)
            .with_ca(authority)
            .with_rustls_connector(default_provider())
            .with_http_handler(handler)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .build()
            .map_err(|e| ProxyError::Engine(e.to_string()))?;

        let task = tokio::spawn(async move {
            let result = proxy
                .start()
                .await
                .map_err(|e| ProxyError::Engine(e.to_string()));
            tracing::info!("Proxy server stopped");
            result
        });

        *self.engine.lock() = Some(RunningEngine {
            addr,
            shutdown: shutdown_tx,
            task,
        });
        Ok(addr)
    }

    fn transition(&self, to: Phase) -> Result<Phase> {
        let from = self.state.write().transition(to)?;
        tracing::info!("{} -> {}", from, to);
        // Nobody listening is fine.
        let _ = self.signals.send(to);
        Ok(from)
    }
}
