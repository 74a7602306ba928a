// ── Switch connection acceptor ──
//
// Listens for switch-control connections and gives each one its own
// `SwitchController`, wired to the shared topology cache and engine.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vrn_proto::SwitchCodec;

use crate::config::SwitchSettings;
use crate::controller::SwitchController;
use crate::error::CoreError;
use crate::sim::SimulationEngine;
use crate::store::TopologyCache;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// One accepted switch connection, ready to be run.
#[derive(Debug)]
pub struct SwitchConnection {
    pub peer: SocketAddr,
    pub controller: SwitchController,
    pub transport: Framed<TcpStream, SwitchCodec>,
}

impl SwitchConnection {
    pub async fn run(self, cancel: CancellationToken) {
        self.controller.run(self.transport, cancel).await;
    }
}

#[derive(Debug)]
pub struct ConnectionAcceptor {
    listener: TcpListener,
    cache: Arc<TopologyCache>,
    engine: Arc<SimulationEngine>,
    settings: SwitchSettings,
    external_id_key: String,
}

impl ConnectionAcceptor {
    /// Bind `settings.listen_addr`.
    pub async fn bind(
        settings: SwitchSettings,
        external_id_key: impl Into<String>,
        cache: Arc<TopologyCache>,
        engine: Arc<SimulationEngine>,
    ) -> Result<Self, CoreError> {
        let addr = settings.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| CoreError::Bind { addr, source })?;
        Ok(Self {
            listener,
            cache,
            engine,
            settings,
            external_id_key: external_id_key.into(),
        })
    }

    /// The bound address (useful when the configured port was 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Wait for the next switch and build its controller.
    pub async fn accept(&self) -> io::Result<SwitchConnection> {
        let (stream, peer) = self.listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "cannot disable Nagle on switch connection");
        }
        let controller = SwitchController::new(
            Arc::clone(&self.cache),
            Arc::clone(&self.engine),
            self.settings.clone(),
            self.external_id_key.clone(),
        );
        Ok(SwitchConnection {
            peer,
            controller,
            transport: Framed::new(stream, SwitchCodec::default()),
        })
    }

    /// Accept connections until `cancel` fires, then wait for every
    /// connection task to finish.
    pub async fn run(self, cancel: CancellationToken) {
        match self.local_addr() {
            Ok(addr) => info!(%addr, "accepting switch connections"),
            Err(e) => warn!(error = %e, "accepting switch connections on an unknown address"),
        }

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(done) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = done {
                        warn!(error = %e, "switch connection task failed");
                    }
                }
                accepted = self.accept() => match accepted {
                    Ok(conn) => {
                        info!(peer = %conn.peer, "switch connection accepted");
                        connections.spawn(conn.run(cancel.child_token()));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed, backing off");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        debug!(open = connections.len(), "acceptor stopping, draining switch connections");
        while let Some(done) = connections.join_next().await {
            if let Err(e) = done {
                warn!(error = %e, "switch connection task failed");
            }
        }
        info!("switch acceptor stopped");
    }
}
