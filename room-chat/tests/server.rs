use std::{collections::BTreeSet, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use futures_util::{SinkExt, StreamExt};
use room_chat::{
    message::{EventKind, Notification, outgoing},
    registry::Registry,
    server::Server,
    session::REJECTION_PAYLOAD,
};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle, time::timeout};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Message, protocol::frame::coding::CloseCode},
};

const READ_TIMEOUT: Duration = Duration::from_secs(2);

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    registry: Arc<Registry>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let server = Server::new(listener);
        let addr = server.local_addr()?;
        let registry = server.registry();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = server.run_until(shutdown).await;
        });

        Ok(Self {
            addr,
            registry,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    async fn connect(&self, user_id: &str) -> Result<Client> {
        self.connect_url(&format!("ws://{}/ws?userId={user_id}", self.addr)).await
    }

    async fn connect_url(&self, url: &str) -> Result<Client> {
        let (socket, _response) = connect_async(url)
            .await
            .with_context(|| format!("failed to connect to {url}"))?;
        Ok(socket)
    }

    /// Polls until the room has exactly `expected` as members.
    async fn wait_for_members(&self, room_id: &str, expected: &[&str]) -> Result<()> {
        let expected: BTreeSet<String> = expected.iter().map(|user| user.to_string()).collect();
        timeout(READ_TIMEOUT, async {
            while self.registry.members(room_id).await != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .map_err(|_| anyhow!("room {room_id} never reached {expected:?}"))
    }

    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = timeout(READ_TIMEOUT, &mut self.task).await;
    }
}

async fn send(client: &mut Client, frame: String) -> Result<()> {
    client.send(Message::Text(frame)).await.context("send frame")
}

async fn next_message(client: &mut Client) -> Result<Message> {
    loop {
        let message = timeout(READ_TIMEOUT, client.next())
            .await
            .map_err(|_| anyhow!("timed out waiting for a frame"))?
            .context("stream ended")??;
        if !matches!(message, Message::Ping(_) | Message::Pong(_)) {
            return Ok(message);
        }
    }
}

async fn next_notification(client: &mut Client) -> Result<Notification> {
    match next_message(client).await? {
        Message::Text(text) => {
            serde_json::from_str(&text).with_context(|| format!("bad notification {text}"))
        }
        other => Err(anyhow!("expected a text frame, got {other:?}")),
    }
}

/// Asserts nothing arrives within a short window.
async fn assert_silent(client: &mut Client) {
    let outcome = timeout(Duration::from_millis(150), client.next()).await;
    assert!(outcome.is_err(), "unexpected frame: {outcome:?}");
}

#[tokio::test]
async fn room_members_receive_joins_and_messages() -> Result<()> {
    let server = TestServer::start().await?;
    let mut alice = server.connect("alice").await?;
    let mut bob = server.connect("bob").await?;

    send(&mut alice, outgoing::join("alice", "lobby")).await?;
    let joined = next_notification(&mut alice).await?;
    assert_eq!(joined.kind, EventKind::Join);
    assert_eq!(joined.content, "alice joined room lobby");

    send(&mut bob, outgoing::join("bob", "lobby")).await?;
    for client in [&mut alice, &mut bob] {
        let notification = next_notification(client).await?;
        assert_eq!(notification, Notification::joined("bob", "lobby"));
    }

    send(&mut alice, outgoing::chat("hi", "lobby")).await?;
    for client in [&mut alice, &mut bob] {
        assert_eq!(next_notification(client).await?, Notification::chat("hi"));
    }

    // The leaver is gone from the room before the notification goes out.
    send(&mut bob, outgoing::leave("bob", "lobby")).await?;
    assert_eq!(
        next_notification(&mut alice).await?,
        Notification::left("bob", "lobby")
    );
    assert_silent(&mut bob).await;
    server.wait_for_members("lobby", &["alice"]).await?;

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn repeated_join_is_not_announced_twice() -> Result<()> {
    let server = TestServer::start().await?;
    let mut alice = server.connect("alice").await?;

    send(&mut alice, outgoing::join("alice", "lobby")).await?;
    next_notification(&mut alice).await?;
    send(&mut alice, outgoing::join("alice", "lobby")).await?;
    assert_silent(&mut alice).await;

    send(&mut alice, outgoing::leave("alice", "attic")).await?;
    assert_silent(&mut alice).await;

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn malformed_frames_keep_the_session_open() -> Result<()> {
    let server = TestServer::start().await?;
    let mut alice = server.connect("alice").await?;

    alice.send(Message::Text("not json".into())).await?;
    alice
        .send(Message::Text(r#"{"type":"shout","content":{}}"#.into()))
        .await?;
    alice
        .send(Message::Text(r#"{"type":"join","content":{"roomId":"lobby"}}"#.into()))
        .await?;

    send(&mut alice, outgoing::join("alice", "lobby")).await?;
    assert_eq!(
        next_notification(&mut alice).await?,
        Notification::joined("alice", "lobby")
    );

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn disconnect_removes_membership_silently() -> Result<()> {
    let server = TestServer::start().await?;
    let mut alice = server.connect("alice").await?;
    let mut bob = server.connect("bob").await?;

    send(&mut alice, outgoing::join("alice", "lobby")).await?;
    next_notification(&mut alice).await?;
    send(&mut bob, outgoing::join("bob", "lobby")).await?;
    next_notification(&mut alice).await?;
    next_notification(&mut bob).await?;

    bob.close(None).await?;
    server.wait_for_members("lobby", &["alice"]).await?;
    assert_silent(&mut alice).await;
    assert!(server.registry.lookup("bob").await.is_none());

    alice.close(None).await?;
    timeout(READ_TIMEOUT, async {
        while server.registry.room_count().await != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .map_err(|_| anyhow!("empty room was never evicted"))?;

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn missing_user_id_is_rejected() -> Result<()> {
    let server = TestServer::start().await?;
    let url = format!("ws://{}/ws", server.addr);
    let mut anonymous = server.connect_url(&url).await?;

    assert_eq!(next_message(&mut anonymous).await?, Message::Text(REJECTION_PAYLOAD.into()));
    match next_message(&mut anonymous).await? {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Policy),
        other => panic!("expected a policy close, got {other:?}"),
    }
    assert_eq!(server.registry.user_count().await, 0);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn repeated_user_id_admits_the_first_value() -> Result<()> {
    let server = TestServer::start().await?;
    let url = format!("ws://{}/ws?userId=alice&userId=bob", server.addr);
    let mut alice = server.connect_url(&url).await?;

    send(&mut alice, outgoing::join("alice", "lobby")).await?;
    assert_eq!(
        next_notification(&mut alice).await?,
        Notification::joined("alice", "lobby")
    );
    assert!(server.registry.lookup("alice").await.is_some());
    assert!(server.registry.lookup("bob").await.is_none());

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn padded_user_id_is_kept_verbatim() -> Result<()> {
    let server = TestServer::start().await?;
    let url = format!("ws://{}/ws?userId=%20alice", server.addr);
    let mut padded = server.connect_url(&url).await?;

    send(&mut padded, outgoing::join(" alice", "lobby")).await?;
    assert_eq!(
        next_notification(&mut padded).await?,
        Notification::joined(" alice", "lobby")
    );
    assert!(server.registry.lookup(" alice").await.is_some());
    assert!(server.registry.lookup("alice").await.is_none());

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn blank_user_id_is_rejected() -> Result<()> {
    let server = TestServer::start().await?;
    let url = format!("ws://{}/ws?userId=%20%20", server.addr);
    let mut blank = server.connect_url(&url).await?;

    assert_eq!(next_message(&mut blank).await?, Message::Text(REJECTION_PAYLOAD.into()));
    assert_eq!(server.registry.user_count().await, 0);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn reconnect_replaces_the_previous_connection() -> Result<()> {
    let server = TestServer::start().await?;
    let mut first = server.connect("alice").await?;
    send(&mut first, outgoing::join("alice", "lobby")).await?;
    next_notification(&mut first).await?;

    let mut second = server.connect("alice").await?;
    match next_message(&mut first).await? {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Normal),
        other => panic!("expected the old connection to close, got {other:?}"),
    }

    send(&mut second, outgoing::chat("still here", "lobby")).await?;
    assert_eq!(next_notification(&mut second).await?, Notification::chat("still here"));
    server.wait_for_members("lobby", &["alice"]).await?;

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn shutdown_closes_open_sessions() -> Result<()> {
    let server = TestServer::start().await?;
    let mut alice = server.connect("alice").await?;
    send(&mut alice, outgoing::join("alice", "lobby")).await?;
    next_notification(&mut alice).await?;

    server.stop().await;
    match next_message(&mut alice).await {
        Ok(Message::Close(_)) | Err(_) => {}
        Ok(other) => panic!("expected the session to close, got {other:?}"),
    }
    Ok(())
}
