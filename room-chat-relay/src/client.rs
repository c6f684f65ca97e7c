use std::{
    net::SocketAddr,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, bail};
use tokio::{
    io::{AsyncBufRead, AsyncWriteExt, BufReader},
    net::{TcpStream, tcp::OwnedWriteHalf},
    sync::{Mutex, mpsc},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    codec::{read_line, write_line},
    transfer,
};

/// How long a replaced connection's receive loop gets to observe EOF before
/// it is aborted.
const RECEIVER_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A line relayed by the server: chat, history, or a system notice.
    Line(String),
    /// The server closed the active connection.
    ConnectionLost,
}

/// Owns the client's single connection to the relay.
///
/// Incoming lines are delivered on the receiver returned by [`ChatClient::new`]
/// for the lifetime of the client, across re-registrations. Sends take the
/// connection lock, so a file transfer never interleaves with a text line.
pub struct ChatClient {
    server: SocketAddr,
    username: String,
    events: mpsc::UnboundedSender<ClientEvent>,
    connection: Mutex<Option<Connection>>,
}

struct Connection {
    room: String,
    writer: OwnedWriteHalf,
    receiver: JoinHandle<()>,
    closing: Arc<AtomicBool>,
}

impl ChatClient {
    pub fn new(
        server: SocketAddr,
        username: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let client = Self {
            server,
            username: username.into(),
            events,
            connection: Mutex::new(None),
        };
        (client, receiver)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub async fn room(&self) -> Option<String> {
        let connection = self.connection.lock().await;
        connection.as_ref().map(|connection| connection.room.clone())
    }

    /// Opens a fresh connection registered in `room`, closing any previous one
    /// first.
    pub async fn register(&self, room: &str) -> Result<()> {
        let room = room.trim();
        if self.username.trim().is_empty() || room.is_empty() {
            bail!("username and room must not be empty");
        }

        let mut connection = self.connection.lock().await;
        if let Some(previous) = connection.take() {
            close_connection(previous).await;
        }

        let stream = TcpStream::connect(self.server)
            .await
            .with_context(|| format!("failed to connect to {}", self.server))?;
        let (reader, mut writer) = stream.into_split();

        write_line(&mut writer, self.username.trim()).await?;
        write_line(&mut writer, room).await?;

        let closing = Arc::new(AtomicBool::new(false));
        let receiver = tokio::spawn(receive_lines(
            BufReader::new(reader),
            self.events.clone(),
            Arc::clone(&closing),
        ));

        info!(username = %self.username, %room, server = %self.server, "registered");
        *connection = Some(Connection {
            room: room.to_string(),
            writer,
            receiver,
            closing,
        });
        Ok(())
    }

    pub async fn send_message(&self, text: &str) -> Result<()> {
        let mut connection = self.connection.lock().await;
        let connection = connection.as_mut().context("not registered in a room")?;
        write_line(&mut connection.writer, text)
            .await
            .context("failed to send message")?;
        Ok(())
    }

    /// Streams the file at `path` to the room. Returns the number of payload
    /// bytes sent.
    pub async fn send_file(&self, path: &Path) -> Result<u64> {
        let mut connection = self.connection.lock().await;
        let connection = connection.as_mut().context("not registered in a room")?;
        let sent = transfer::send_file(&mut connection.writer, path)
            .await
            .with_context(|| format!("failed to send {}", path.display()))?;
        info!(path = %path.display(), bytes = sent, "file sent");
        Ok(sent)
    }

    pub async fn disconnect(&self) {
        if let Some(connection) = self.connection.lock().await.take() {
            close_connection(connection).await;
        }
    }
}

async fn close_connection(connection: Connection) {
    let Connection {
        room,
        mut writer,
        mut receiver,
        closing,
    } = connection;

    closing.store(true, Ordering::SeqCst);
    if let Err(err) = writer.shutdown().await {
        warn!(error = ?err, "failed to shut down connection cleanly");
    }

    // The server answers our EOF by closing its side, which ends the receive
    // loop before a replacement connection starts delivering lines.
    if timeout(RECEIVER_SHUTDOWN_GRACE, &mut receiver).await.is_err() {
        debug!(%room, "receive loop did not observe close in time");
        receiver.abort();
    }
    debug!(%room, "connection closed");
}

async fn receive_lines<R>(
    mut reader: R,
    events: mpsc::UnboundedSender<ClientEvent>,
    closing: Arc<AtomicBool>,
) where
    R: AsyncBufRead + Unpin,
{
    loop {
        match read_line(&mut reader).await {
            Ok(Some(line)) => {
                if events.send(ClientEvent::Line(line)).is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(error = ?err, "failed to read from server");
                break;
            }
        }
    }

    if !closing.load(Ordering::SeqCst) {
        let _ = events.send(ClientEvent::ConnectionLost);
    }
}
