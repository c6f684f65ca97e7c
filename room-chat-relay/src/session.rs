//! Server side of one client connection.
//!
//! Each connection walks `AwaitingUsername -> AwaitingRoom -> Joined ->
//! Closed`. Outbound lines never touch the socket from here directly: they
//! are queued on the session's outbox and written by a dedicated writer task,
//! which is what lets the registry broadcast without awaiting slow peers.
//!
//! Once the registry drops a session (a newer registration took its username,
//! or it fell too far behind) the session stops at its next await point, even
//! in the middle of a file payload.

use std::{io, net::SocketAddr, path::PathBuf, sync::Arc};

use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    codec::{Frame, read_line, write_line},
    registry::{
        OUTBOX_CAPACITY, Outbound, Outbox, RemovalSignal, RoomRegistry, SessionHandle, SessionId,
    },
    transfer::{self, PendingFileTransfer, TransferError},
};

/// Settings shared by every session on a server.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Directory received files are written into.
    pub storage_dir: PathBuf,
}

enum SessionState {
    AwaitingUsername,
    AwaitingRoom { username: String },
    Joined(Membership),
    Closed,
}

/// A joined session. Dropping it removes the session from the registry, so
/// every path out of `Joined` runs the same cleanup exactly once.
struct Membership {
    registry: Arc<RoomRegistry>,
    id: SessionId,
    username: String,
    room: String,
    removed: RemovalSignal,
}

impl Drop for Membership {
    fn drop(&mut self) {
        if let Some(room) = self.registry.leave(self.id) {
            info!(username = %self.username, %room, "session left room");
        }
    }
}

/// Drives one connection until it closes, then releases its transport.
pub async fn run_session<R, W>(
    mut reader: R,
    writer: W,
    registry: Arc<RoomRegistry>,
    config: Arc<SessionConfig>,
    peer: Option<SocketAddr>,
) where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbox, inbox) = mpsc::channel(OUTBOX_CAPACITY);
    let writer_task = spawn_writer(inbox, writer);

    let mut session = Session {
        registry,
        config,
        peer,
        outbox: Some(outbox),
    };

    let mut state = SessionState::AwaitingUsername;
    loop {
        state = match state {
            SessionState::Closed => break,
            state => session.step(state, &mut reader).await,
        };
    }

    // The registry held the last outbox sender; once it is gone the writer
    // drains what is queued and shuts the transport down.
    drop(session);
    if let Err(err) = writer_task.await {
        warn!(?peer, error = ?err, "writer task failed");
    }
    debug!(?peer, "session closed");
}

struct Session {
    registry: Arc<RoomRegistry>,
    config: Arc<SessionConfig>,
    peer: Option<SocketAddr>,
    outbox: Option<Outbox>,
}

impl Session {
    async fn step<R>(&mut self, state: SessionState, reader: &mut R) -> SessionState
    where
        R: AsyncBufRead + Unpin,
    {
        match state {
            SessionState::AwaitingUsername => match self.read_registration_line(reader).await {
                Some(username) => SessionState::AwaitingRoom { username },
                None => SessionState::Closed,
            },
            SessionState::AwaitingRoom { username } => {
                match self.read_registration_line(reader).await {
                    Some(room) => self.join(username, room),
                    None => SessionState::Closed,
                }
            }
            SessionState::Joined(membership) => self.handle_next_frame(membership, reader).await,
            SessionState::Closed => SessionState::Closed,
        }
    }

    async fn read_registration_line<R>(&self, reader: &mut R) -> Option<String>
    where
        R: AsyncBufRead + Unpin,
    {
        match read_line(reader).await {
            Ok(Some(line)) if !line.trim().is_empty() => Some(line.trim().to_string()),
            Ok(_) => {
                debug!(peer = ?self.peer, "registration aborted");
                None
            }
            Err(err) => {
                warn!(peer = ?self.peer, error = ?err, "failed to read registration");
                None
            }
        }
    }

    fn join(&mut self, username: String, room: String) -> SessionState {
        let Some(outbox) = self.outbox.take() else {
            return SessionState::Closed;
        };

        let id = self.registry.next_session_id();
        let (handle, removed) = SessionHandle::new(id, username.clone(), outbox);
        let outcome = self.registry.join(handle, &room);
        for previous in &outcome.evicted_from {
            info!(%username, room = %previous, "evicted stale session");
        }
        info!(peer = ?self.peer, %username, %room, replayed = outcome.replayed, "client joined");

        SessionState::Joined(Membership {
            registry: Arc::clone(&self.registry),
            id,
            username,
            room,
            removed,
        })
    }

    async fn handle_next_frame<R>(
        &self,
        mut membership: Membership,
        reader: &mut R,
    ) -> SessionState
    where
        R: AsyncBufRead + Unpin,
    {
        let read = tokio::select! {
            biased;
            _ = &mut membership.removed => {
                info!(username = %membership.username, "session removed from its room");
                return SessionState::Closed;
            }
            read = read_line(reader) => read,
        };
        let line = match read {
            Ok(Some(line)) => line,
            Ok(None) => return SessionState::Closed,
            Err(err) => {
                warn!(username = %membership.username, error = ?err, "read failed");
                return SessionState::Closed;
            }
        };

        match Frame::parse(line) {
            Frame::Text(text) if text.is_empty() => SessionState::Joined(membership),
            Frame::Text(text) => {
                debug!(username = %membership.username, room = %membership.room, %text, "chat");
                let message = format!("{}: {}", membership.username, text);
                match self.registry.broadcast_as(membership.id, message) {
                    Some(_) => SessionState::Joined(membership),
                    None => SessionState::Closed,
                }
            }
            Frame::FileStart { file_name } => {
                match self.receive_file(&mut membership, &file_name, reader).await {
                    Ok(()) => SessionState::Joined(membership),
                    Err(TransferError::Cancelled) => {
                        info!(username = %membership.username, %file_name, "file transfer cancelled");
                        SessionState::Closed
                    }
                    Err(err) => {
                        warn!(
                            username = %membership.username,
                            %file_name,
                            error = %err,
                            "file transfer ended the session"
                        );
                        SessionState::Closed
                    }
                }
            }
        }
    }

    /// Runs the receiving half of a file transfer.
    ///
    /// Only failures that leave the stream unusable are returned. A size line
    /// that is not a number abandons the transfer but keeps the connection,
    /// and any payload bytes that follow will then be read as chat lines.
    /// A session removed from its room mid-transfer keeps nothing it received.
    async fn receive_file<R>(
        &self,
        membership: &mut Membership,
        file_name: &str,
        reader: &mut R,
    ) -> Result<(), TransferError>
    where
        R: AsyncBufRead + Unpin,
    {
        let id = membership.id;
        let announcement = format!("{} is sending a file: {file_name}", membership.username);
        if self.registry.broadcast_as(id, announcement).is_none() {
            return Err(TransferError::Cancelled);
        }

        let mut destination = None;
        let stored = tokio::select! {
            biased;
            _ = &mut membership.removed => Err(TransferError::Cancelled),
            stored = self.store_payload(
                &membership.username,
                file_name,
                reader,
                &mut destination,
            ) => stored,
        };

        let completed = match stored {
            Ok(completed) => completed,
            Err(err) => {
                if let Some(destination) = &destination {
                    transfer::remove_partial(destination).await;
                }
                return Err(err);
            }
        };
        if !completed {
            return Ok(());
        }

        if self
            .registry
            .broadcast_as(id, format!("File received: {file_name}"))
            .is_none()
        {
            if let Some(destination) = &destination {
                transfer::remove_partial(destination).await;
            }
            return Err(TransferError::Cancelled);
        }
        Ok(())
    }

    /// Reads the size line and payload. Returns whether a file was stored;
    /// `destination` is set once a file has been created for it.
    async fn store_payload<R>(
        &self,
        username: &str,
        file_name: &str,
        reader: &mut R,
        destination: &mut Option<PathBuf>,
    ) -> Result<bool, TransferError>
    where
        R: AsyncBufRead + Unpin,
    {
        let Some(size_line) = read_line(reader).await? else {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        };
        let declared = match transfer::parse_declared_size(&size_line) {
            Ok(declared) => declared,
            Err(err) => {
                warn!(%username, %file_name, error = %err, "abandoning file transfer");
                return Ok(false);
            }
        };

        let mut pending = PendingFileTransfer::new(file_name, declared);
        let path = match transfer::confine_to_root(&self.config.storage_dir, file_name) {
            Ok(path) => path,
            Err(err) => {
                warn!(%username, error = %err, "discarding file payload");
                transfer::discard(reader, &mut pending).await?;
                return Ok(false);
            }
        };

        let path = destination.insert(path);
        match transfer::receive_file(reader, path, &mut pending).await {
            Ok(received) => {
                info!(%username, %file_name, bytes = received, "file received");
                Ok(true)
            }
            Err(TransferError::Io(err)) if pending.bytes_received == 0 => {
                warn!(%username, %file_name, error = ?err, "cannot store file, discarding payload");
                *destination = None;
                transfer::discard(reader, &mut pending).await?;
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

fn spawn_writer<W>(mut inbox: mpsc::Receiver<Outbound>, mut writer: W) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(item) = inbox.recv().await {
            let delivered = match item {
                Outbound::Line(line) => write_line(&mut writer, &line).await,
                Outbound::History(lines) => write_history(&mut writer, &lines).await,
            };
            if let Err(err) = delivered {
                debug!(error = ?err, "failed to deliver line");
                return;
            }
        }
        if let Err(err) = writer.shutdown().await {
            debug!(error = ?err, "failed to shut down writer");
        }
    })
}

async fn write_history<W>(writer: &mut W, lines: &[String]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    for line in lines {
        write_line(writer, line).await?;
    }
    Ok(())
}
