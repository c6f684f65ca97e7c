use std::{future::Future, net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{info, warn};

use crate::{
    registry::RoomRegistry,
    session::{SessionConfig, run_session},
};

pub const DEFAULT_LISTEN: &str = "127.0.0.1:20000";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory received files are written into.
    pub storage_dir: PathBuf,
    /// Maximum history lines kept per room; `None` keeps everything.
    pub history_limit: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("."),
            history_limit: None,
        }
    }
}

pub struct Server {
    listener: TcpListener,
    registry: Arc<RoomRegistry>,
    sessions: Arc<SessionConfig>,
}

impl Server {
    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        Self {
            listener,
            registry: Arc::new(RoomRegistry::new(config.history_limit)),
            sessions: Arc::new(SessionConfig {
                storage_dir: config.storage_dir,
            }),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<RoomRegistry> {
        Arc::clone(&self.registry)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            registry,
            sessions,
        } = self;

        tokio::fs::create_dir_all(&sessions.storage_dir)
            .await
            .with_context(|| {
                format!(
                    "failed to create storage directory {}",
                    sessions.storage_dir.display()
                )
            })?;

        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &registry, &sessions);
                }
            }
        }

        Ok(())
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

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    registry: &Arc<RoomRegistry>,
    sessions: &Arc<SessionConfig>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, registry, sessions),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &Arc<RoomRegistry>,
    sessions: &Arc<SessionConfig>,
) {
    let registry = Arc::clone(registry);
    let sessions = Arc::clone(sessions);
    tokio::spawn(async move {
        info!(peer = %peer, "new connection");
        let (reader, writer) = stream.into_split();
        run_session(BufReader::new(reader), writer, registry, sessions, Some(peer)).await;
    });
}
