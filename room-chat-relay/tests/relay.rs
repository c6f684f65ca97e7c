use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use anyhow::Result;
use room_chat_relay::{
    codec::{read_line, write_line},
    registry::RoomRegistry,
    server::{Server, ServerConfig},
};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(2);

struct TestServer {
    addr: SocketAddr,
    registry: Arc<RoomRegistry>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl TestServer {
    async fn start(storage_dir: &Path) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = Server::new(
            listener,
            ServerConfig {
                storage_dir: storage_dir.to_path_buf(),
                history_limit: None,
            },
        );
        let registry = server.registry();

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = server.run_until(shutdown).await;
        });

        Ok(Self {
            addr,
            registry,
            shutdown,
            task,
        })
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

struct Peer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Peer {
    async fn join(addr: SocketAddr, username: &str, room: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, mut writer) = stream.into_split();
        write_line(&mut writer, username).await?;
        write_line(&mut writer, room).await?;
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn send(&mut self, line: &str) -> Result<()> {
        write_line(&mut self.writer, line).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        Ok(timeout(READ_TIMEOUT, read_line(&mut self.reader)).await??)
    }

    async fn expect(&mut self, expected: &str) -> Result<()> {
        let line = self.recv().await?;
        assert_eq!(line.as_deref(), Some(expected));
        Ok(())
    }

    async fn assert_silent(&mut self) {
        let pending = timeout(Duration::from_millis(200), read_line(&mut self.reader)).await;
        assert!(pending.is_err(), "unexpected line: {pending:?}");
    }
}

#[tokio::test]
async fn joiner_receives_history_before_new_messages() -> Result<()> {
    let storage = tempfile::tempdir()?;
    let server = TestServer::start(storage.path()).await?;

    let mut alice = Peer::join(server.addr, "A", "general").await?;
    alice.send("hello").await?;
    alice.expect("A: hello").await?;
    assert_eq!(server.registry.history("general"), vec!["A: hello"]);

    let mut bob = Peer::join(server.addr, "B", "general").await?;
    bob.expect("A: hello").await?;
    bob.assert_silent().await;

    alice.send("welcome").await?;
    bob.expect("A: welcome").await?;
    alice.expect("A: welcome").await?;

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn rooms_are_isolated() -> Result<()> {
    let storage = tempfile::tempdir()?;
    let server = TestServer::start(storage.path()).await?;

    let mut alice = Peer::join(server.addr, "alice", "general").await?;
    let mut bob = Peer::join(server.addr, "bob", "random").await?;

    alice.send("only general").await?;
    alice.expect("alice: only general").await?;
    bob.send("only random").await?;
    bob.expect("bob: only random").await?;

    alice.assert_silent().await;
    assert_eq!(server.registry.rooms(), vec!["general", "random"]);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn reregistering_moves_user_and_notifies_prior_room_once() -> Result<()> {
    let storage = tempfile::tempdir()?;
    let server = TestServer::start(storage.path()).await?;

    let mut bob = Peer::join(server.addr, "bob", "general").await?;
    bob.send("here").await?;
    bob.expect("bob: here").await?;

    let mut old_alice = Peer::join(server.addr, "alice", "general").await?;
    old_alice.expect("bob: here").await?;
    old_alice.send("hi").await?;
    old_alice.expect("alice: hi").await?;
    bob.expect("alice: hi").await?;

    let mut new_alice = Peer::join(server.addr, "alice", "random").await?;
    new_alice.send("moved").await?;
    new_alice.expect("alice: moved").await?;

    bob.expect("alice has left the room.").await?;
    assert_eq!(server.registry.members("general"), vec!["bob"]);
    assert_eq!(server.registry.members("random"), vec!["alice"]);

    // The replaced connection is closed by the server and its later close
    // does not produce a second notice.
    assert_eq!(old_alice.recv().await?, None);
    old_alice.writer.shutdown().await?;
    bob.assert_silent().await;

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn replaced_sender_mid_transfer_stores_nothing() -> Result<()> {
    let storage = tempfile::tempdir()?;
    let server = TestServer::start(storage.path()).await?;
    let stored = storage.path().join("x.bin");

    let mut bob = Peer::join(server.addr, "bob", "general").await?;
    let mut old_alice = Peer::join(server.addr, "alice", "general").await?;
    old_alice.send("FILE:x.bin").await?;
    old_alice.send("10").await?;
    old_alice.writer.write_all(b"01234").await?;
    bob.expect("alice is sending a file: x.bin").await?;

    let mut new_alice = Peer::join(server.addr, "alice", "random").await?;
    bob.expect("alice has left the room.").await?;

    // The rest of the payload arrives after the session was replaced.
    let _ = old_alice.writer.write_all(b"56789").await;
    let _ = old_alice.send("after").await;

    timeout(READ_TIMEOUT, async {
        while stored.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    bob.assert_silent().await;
    assert!(!stored.exists());
    assert_eq!(
        server.registry.history("general"),
        vec!["alice is sending a file: x.bin", "alice has left the room."]
    );

    new_alice.send("moved").await?;
    new_alice.expect("alice: moved").await?;

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn disconnect_removes_member_and_empty_room() -> Result<()> {
    let storage = tempfile::tempdir()?;
    let server = TestServer::start(storage.path()).await?;

    let mut alice = Peer::join(server.addr, "alice", "general").await?;
    let mut bob = Peer::join(server.addr, "bob", "general").await?;
    bob.send("ping").await?;
    bob.expect("bob: ping").await?;
    alice.expect("bob: ping").await?;

    alice.writer.shutdown().await?;
    bob.expect("alice has left the room.").await?;

    bob.writer.shutdown().await?;
    assert_eq!(bob.recv().await?, None);
    timeout(READ_TIMEOUT, async {
        while !server.registry.rooms().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn file_transfer_reproduces_bytes_and_announces_completion() -> Result<()> {
    let storage = tempfile::tempdir()?;
    let server = TestServer::start(storage.path()).await?;

    let payload: Vec<u8> = (0..5000u32).map(|i| (i * 7 % 256) as u8).collect();
    let mut alice = Peer::join(server.addr, "alice", "general").await?;
    let mut bob = Peer::join(server.addr, "bob", "general").await?;

    alice.send("FILE:f.bin").await?;
    alice.send(&payload.len().to_string()).await?;
    alice.writer.write_all(&payload).await?;
    alice.send("Finished sending file: f.bin").await?;

    bob.expect("alice is sending a file: f.bin").await?;
    bob.expect("File received: f.bin").await?;
    bob.expect("alice: Finished sending file: f.bin").await?;

    let stored = tokio::fs::read(storage.path().join("f.bin")).await?;
    assert_eq!(stored.len(), payload.len());
    assert_eq!(stored, payload);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn zero_byte_file_still_announces_completion() -> Result<()> {
    let storage = tempfile::tempdir()?;
    let server = TestServer::start(storage.path()).await?;

    let mut alice = Peer::join(server.addr, "alice", "general").await?;
    alice.send("FILE:empty.txt").await?;
    alice.send("0").await?;

    alice.expect("alice is sending a file: empty.txt").await?;
    alice.expect("File received: empty.txt").await?;

    let metadata = tokio::fs::metadata(storage.path().join("empty.txt")).await?;
    assert_eq!(metadata.len(), 0);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn malformed_size_abandons_transfer_but_keeps_connection() -> Result<()> {
    let storage = tempfile::tempdir()?;
    let server = TestServer::start(storage.path()).await?;

    let mut alice = Peer::join(server.addr, "alice", "general").await?;
    alice.send("FILE:report.pdf").await?;
    alice.send("not-a-number").await?;
    alice.send("still here").await?;

    alice.expect("alice is sending a file: report.pdf").await?;
    alice.expect("alice: still here").await?;
    assert!(!storage.path().join("report.pdf").exists());

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn empty_room_line_aborts_registration() -> Result<()> {
    let storage = tempfile::tempdir()?;
    let server = TestServer::start(storage.path()).await?;

    let mut ghost = Peer::join(server.addr, "ghost", "").await?;
    assert_eq!(ghost.recv().await?, None);
    assert!(server.registry.rooms().is_empty());

    server.stop().await;
    Ok(())
}
