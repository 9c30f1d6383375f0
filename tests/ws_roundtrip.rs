use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use market_chat::config::ChatConfig;
use market_chat::directory::ListingRecord;
use market_chat::model::{
    Conversation, ConversationId, InsertOutcome, ListingId, Message, MessageId, NewMessage,
    OrderKey, ReadMarker, UserId,
};
use market_chat::server::{self, AppState, USER_HEADER};
use market_chat::sync::remote::{connect_conversation, RemoteConversation, RemoteEvent};
use market_chat::sync::{ClientFrame, ServerFrame};
use market_chat::{
    ChatError, ChatResult, ChatService, ChatStore, Database, DeliveryHub, RetryPolicy,
};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

fn user(id: &str) -> UserId {
    UserId::parse(id).unwrap()
}

fn seeded_db() -> Result<Database> {
    let db = Database::in_memory()?;
    db.initialize()?;
    db.upsert_listing(&ListingRecord {
        id: ListingId::parse("bike")?,
        owner_id: user("seller"),
        title: "Road bike".into(),
        category: None,
        images: vec![],
    })?;
    Ok(db)
}

/// Serve a fresh service on an ephemeral port with one open conversation.
async fn spawn_server() -> Result<(String, ChatService, ConversationId)> {
    let service = ChatService::new(seeded_db()?, &ChatConfig::default());
    serve(service).await
}

/// Like [`spawn_server`], but history reads go through a [`GatedStore`] and
/// the delivery hub buffers only `capacity` messages per conversation.
async fn spawn_gated_server(
    capacity: usize,
) -> Result<(String, ChatService, ConversationId, Arc<GatedStore>)> {
    let db = seeded_db()?;
    let store = Arc::new(GatedStore {
        inner: db.clone(),
        hold: AtomicBool::new(false),
        fail: AtomicBool::new(false),
    });
    let directory = Arc::new(db);
    let service = ChatService::from_parts(
        store.clone(),
        directory.clone(),
        directory,
        DeliveryHub::new(capacity),
    )
    .with_retry(RetryPolicy::no_retry());

    let (base, service, conversation) = serve(service).await?;
    Ok((base, service, conversation, store))
}

async fn serve(service: ChatService) -> Result<(String, ChatService, ConversationId)> {
    let conversation = service
        .start_conversation(&user("buyer"), &ListingId::parse("bike")?, None)
        .await?
        .conversation;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = AppState::new(service.clone());
    tokio::spawn(async move {
        let _ = server::serve_on(listener, state).await;
    });

    Ok((format!("ws://{addr}"), service, conversation.id))
}

/// Delegates to a [`Database`], except that history reads can be held back
/// or made to fail.
struct GatedStore {
    inner: Database,
    hold: AtomicBool,
    fail: AtomicBool,
}

impl ChatStore for GatedStore {
    fn find_conversation(
        &self,
        listing_id: &ListingId,
        buyer_id: &UserId,
        seller_id: &UserId,
    ) -> ChatResult<Option<Conversation>> {
        self.inner.find_conversation(listing_id, buyer_id, seller_id)
    }

    fn insert_conversation(&self, conversation: &Conversation) -> ChatResult<InsertOutcome> {
        self.inner.insert_conversation(conversation)
    }

    fn get_conversation(&self, id: ConversationId) -> ChatResult<Option<Conversation>> {
        self.inner.get_conversation(id)
    }

    fn conversations_for(&self, user_id: &UserId) -> ChatResult<Vec<Conversation>> {
        self.inner.conversations_for(user_id)
    }

    fn append_message(
        &self,
        input: &NewMessage,
        on_commit: &dyn Fn(&Message),
    ) -> ChatResult<Message> {
        self.inner.append_message(input, on_commit)
    }

    fn messages_after(
        &self,
        conversation_id: ConversationId,
        after: Option<OrderKey>,
        limit: usize,
    ) -> ChatResult<Vec<Message>> {
        while self.hold.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ChatError::StorageUnavailable("history offline".into()));
        }
        self.inner.messages_after(conversation_id, after, limit)
    }

    fn last_message(&self, conversation_id: ConversationId) -> ChatResult<Option<Message>> {
        self.inner.last_message(conversation_id)
    }

    fn set_read_marker(
        &self,
        conversation_id: ConversationId,
        user_id: &UserId,
        up_to: OrderKey,
    ) -> ChatResult<ReadMarker> {
        self.inner.set_read_marker(conversation_id, user_id, up_to)
    }

    fn unread_count(&self, conversation_id: ConversationId, user_id: &UserId) -> ChatResult<u64> {
        self.inner.unread_count(conversation_id, user_id)
    }
}

/// TCP forwarder in front of the server whose live connections can be cut.
struct Relay {
    base: String,
    links: Arc<Mutex<Vec<JoinHandle<()>>>>,
    accept: JoinHandle<()>,
}

impl Relay {
    async fn start(upstream_base: &str) -> Result<Self> {
        let upstream: SocketAddr = upstream_base.trim_start_matches("ws://").parse()?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let links: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::default();

        let tracked = links.clone();
        let accept = tokio::spawn(async move {
            while let Ok((mut inbound, _)) = listener.accept().await {
                let link = tokio::spawn(async move {
                    if let Ok(mut outbound) = TcpStream::connect(upstream).await {
                        let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                    }
                });
                tracked.lock().push(link);
            }
        });

        Ok(Self {
            base: format!("ws://{addr}"),
            links,
            accept,
        })
    }

    /// Drop every open connection. New ones are still accepted.
    fn cut(&self) {
        for link in self.links.lock().drain(..) {
            link.abort();
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.accept.abort();
        self.cut();
    }
}

async fn connect(base: &str, conversation: ConversationId, who: &str) -> Result<Client> {
    let mut request = format!("{base}/conversations/{conversation}/ws").into_client_request()?;
    request
        .headers_mut()
        .insert(USER_HEADER, HeaderValue::from_str(who)?);
    let (stream, _) = tokio_tungstenite::connect_async(request).await?;
    Ok(stream)
}

/// Wait for the server to end the connection, failing on any data frame.
async fn expect_closed(client: &mut Client) {
    loop {
        match timeout(Duration::from_secs(3), client.next())
            .await
            .expect("timed out waiting for close")
        {
            Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return,
            Some(Ok(WsMessage::Text(text))) => panic!("unexpected frame after failure: {text}"),
            Some(Ok(_)) => {}
        }
    }
}

async fn next_event(remote: &mut RemoteConversation) -> RemoteEvent {
    timeout(Duration::from_secs(5), remote.events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("remote conversation stopped")
}

async fn next_frame(client: &mut Client) -> ServerFrame {
    loop {
        let msg = timeout(Duration::from_secs(3), client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        if let WsMessage::Text(text) = msg {
            return serde_json::from_str(text.as_str()).expect("server frame");
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backlog_then_live_messages() -> Result<()> {
    let (base, service, conversation) = spawn_server().await?;
    let early = service
        .send_message(conversation, &user("buyer"), "sent before connecting", None)
        .await?;

    let mut seller = connect(&base, conversation, "seller").await?;
    match next_frame(&mut seller).await {
        ServerFrame::Message { message } => assert_eq!(message.id, early.id),
        other => panic!("expected backlog message, got {other:?}"),
    }

    let mut buyer = connect(&base, conversation, "buyer").await?;
    // The buyer's own replay.
    assert!(matches!(next_frame(&mut buyer).await, ServerFrame::Message { .. }));

    let client_id = MessageId::new();
    let frame = ClientFrame::Send {
        body: "Is it still available?".into(),
        client_message_id: Some(client_id),
    };
    buyer
        .send(WsMessage::Text(serde_json::to_string(&frame)?.into()))
        .await?;

    match next_frame(&mut seller).await {
        ServerFrame::Message { message } => {
            assert_eq!(message.id, client_id);
            assert_eq!(message.body, "Is it still available?");
            assert!(message.order_key > early.order_key);
        }
        other => panic!("expected live message, got {other:?}"),
    }

    // The sender gets both its own message and the ack, in either order.
    let mut acked = false;
    let mut echoed = false;
    while !(acked && echoed) {
        match next_frame(&mut buyer).await {
            ServerFrame::Ack { message_id, .. } => {
                assert_eq!(message_id, client_id);
                acked = true;
            }
            ServerFrame::Message { message } => {
                assert_eq!(message.id, client_id);
                echoed = true;
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    // CBOR binary frames are accepted too.
    let reply = ClientFrame::Send {
        body: "Yes, come by tomorrow".into(),
        client_message_id: None,
    };
    seller
        .send(WsMessage::Binary(serde_cbor::to_vec(&reply)?.into()))
        .await?;
    loop {
        if let ServerFrame::Message { message } = next_frame(&mut buyer).await {
            assert_eq!(message.body, "Yes, come by tomorrow");
            assert_eq!(message.sender_id, user("seller"));
            break;
        }
    }

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_frames_get_error_replies() -> Result<()> {
    let (base, _service, conversation) = spawn_server().await?;
    let mut buyer = connect(&base, conversation, "buyer").await?;

    buyer.send(WsMessage::Text("{\"type\":\"dance\"}".to_string().into())).await?;
    match next_frame(&mut buyer).await {
        ServerFrame::Error { code, .. } => assert_eq!(code, "bad_frame"),
        other => panic!("expected error frame, got {other:?}"),
    }

    let empty = ClientFrame::Send {
        body: "   ".into(),
        client_message_id: None,
    };
    buyer
        .send(WsMessage::Text(serde_json::to_string(&empty)?.into()))
        .await?;
    match next_frame(&mut buyer).await {
        ServerFrame::Error { code, .. } => assert_eq!(code, "empty_message"),
        other => panic!("expected error frame, got {other:?}"),
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn outsiders_cannot_upgrade() -> Result<()> {
    let (base, service, conversation) = spawn_server().await?;

    assert!(connect(&base, conversation, "mallory").await.is_err());
    assert!(connect(&base, ConversationId::new(), "buyer").await.is_err());
    assert_eq!(service.hub().active_channels(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_client_follows_and_sends() -> Result<()> {
    let (base, service, conversation) = spawn_server().await?;
    let first = service
        .send_message(conversation, &user("buyer"), "hello", None)
        .await?;

    // Resuming after the first message skips it.
    let mut remote = connect_conversation(
        &base,
        conversation,
        user("seller"),
        Some(first.order_key),
        RetryPolicy::immediate(3),
    )
    .await?;

    let second = service
        .send_message(conversation, &user("buyer"), "are you there?", None)
        .await?;
    match timeout(Duration::from_secs(3), remote.events.recv()).await? {
        Some(RemoteEvent::Message(message)) => assert_eq!(message.id, second.id),
        other => panic!("expected message event, got {other:?}"),
    }

    let sent_id = remote.send("yes, still here").await?;
    let mut acked = false;
    let mut echoed = false;
    while !(acked && echoed) {
        match timeout(Duration::from_secs(3), remote.events.recv()).await? {
            Some(RemoteEvent::Ack { message_id, .. }) => {
                assert_eq!(message_id, sent_id);
                acked = true;
            }
            Some(RemoteEvent::Message(message)) => {
                assert_eq!(message.id, sent_id);
                echoed = true;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    let page = service
        .list_messages(conversation, &user("buyer"), None, None)
        .await?;
    assert_eq!(page.messages.len(), 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_replay_closes_instead_of_skipping() -> Result<()> {
    let (base, service, conversation, store) = spawn_gated_server(256).await?;
    let first = service
        .send_message(conversation, &user("buyer"), "first", None)
        .await?;

    store.fail.store(true, Ordering::SeqCst);
    let mut seller = connect(&base, conversation, "seller").await?;
    match next_frame(&mut seller).await {
        ServerFrame::Error { code, .. } => assert_eq!(code, "storage_unavailable"),
        other => panic!("expected error frame, got {other:?}"),
    }
    expect_closed(&mut seller).await;

    // Nothing was delivered, so a fresh connection replays from the start.
    store.fail.store(false, Ordering::SeqCst);
    let second = service
        .send_message(conversation, &user("buyer"), "second", None)
        .await?;
    let mut seller = connect(&base, conversation, "seller").await?;
    for expected in [first.id, second.id] {
        match next_frame(&mut seller).await {
            ServerFrame::Message { message } => assert_eq!(message.id, expected),
            other => panic!("expected message, got {other:?}"),
        }
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lagging_socket_catches_up_without_duplicates() -> Result<()> {
    let (base, service, conversation, store) = spawn_gated_server(1).await?;

    // Hold the initial replay so live deliveries overflow the one-slot buffer.
    store.hold.store(true, Ordering::SeqCst);
    let mut seller = connect(&base, conversation, "seller").await?;
    let mut sent = Vec::new();
    for i in 0..6 {
        let message = service
            .send_message(conversation, &user("buyer"), &format!("burst {i}"), None)
            .await?;
        sent.push(message.id);
    }
    store.hold.store(false, Ordering::SeqCst);

    let last = service
        .send_message(conversation, &user("buyer"), "after the burst", None)
        .await?;
    sent.push(last.id);

    let mut received = Vec::new();
    while received.len() < sent.len() {
        match next_frame(&mut seller).await {
            ServerFrame::Message { message } => received.push(message.id),
            other => panic!("unexpected frame {other:?}"),
        }
    }
    assert_eq!(received, sent);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_client_resumes_after_disconnect() -> Result<()> {
    let (base, service, conversation) = spawn_server().await?;
    let relay = Relay::start(&base).await?;
    let mut remote = connect_conversation(
        &relay.base,
        conversation,
        user("seller"),
        None,
        RetryPolicy::immediate(50),
    )
    .await?;

    let first = service
        .send_message(conversation, &user("buyer"), "one", None)
        .await?;
    match next_event(&mut remote).await {
        RemoteEvent::Message(message) => assert_eq!(message.id, first.id),
        other => panic!("expected message event, got {other:?}"),
    }

    relay.cut();
    let reply = remote.send("still interested?").await?;
    let second = service
        .send_message(conversation, &user("buyer"), "two", None)
        .await?;
    let third = service
        .send_message(conversation, &user("buyer"), "three", None)
        .await?;

    let mut keys = Vec::new();
    let mut ids = Vec::new();
    let mut acked = false;
    while !(acked && ids.len() == 3) {
        match next_event(&mut remote).await {
            RemoteEvent::Message(message) => {
                keys.push(message.order_key);
                ids.push(message.id);
            }
            RemoteEvent::Ack { message_id, .. } => {
                assert_eq!(message_id, reply);
                acked = true;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
    let mut expected = vec![second.id, third.id, reply];
    expected.sort();
    ids.sort();
    assert_eq!(ids, expected);

    let page = service
        .list_messages(conversation, &user("buyer"), None, None)
        .await?;
    assert_eq!(page.messages.len(), 4);
    assert_eq!(page.messages.iter().filter(|m| m.id == reply).count(), 1);
    Ok(())
}
