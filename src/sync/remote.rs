use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use super::protocol::{ClientFrame, ServerFrame};
use crate::error::RetryPolicy;
use crate::model::{ConversationId, Message, MessageId, OrderKey, UserId};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Events surfaced to the owner of a [`RemoteConversation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEvent {
    Message(Message),
    Ack { message_id: MessageId, cursor: String },
    Error {
        code: String,
        message: String,
        message_id: Option<MessageId>,
    },
}

/// Client side of a conversation WebSocket.
///
/// Reconnects with backoff and resumes from the last order key it has seen,
/// so the owner sees every message once and in order. Sends stay queued
/// until the server answers them and are replayed after a reconnect.
pub struct RemoteConversation {
    pub events: mpsc::Receiver<RemoteEvent>,
    outbound: mpsc::Sender<ClientFrame>,
    handle: JoinHandle<()>,
}

impl RemoteConversation {
    /// Queue a message for sending. The client id is minted here so a resend
    /// after reconnecting is deduplicated by the server.
    pub async fn send(&self, body: impl Into<String>) -> Result<MessageId> {
        let id = MessageId::new();
        self.outbound
            .send(ClientFrame::Send {
                body: body.into(),
                client_message_id: Some(id),
            })
            .await
            .map_err(|_| anyhow!("remote conversation task has stopped"))?;
        Ok(id)
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for RemoteConversation {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct Session {
    base: Url,
    conversation_id: ConversationId,
    user_id: UserId,
    cursor: Option<OrderKey>,
    /// Sends written to a socket but not yet acked or rejected.
    unacked: VecDeque<ClientFrame>,
    policy: RetryPolicy,
}

/// Connect to `base_url` (e.g. `ws://127.0.0.1:3000`) and follow one
/// conversation. The first connection is made before returning so
/// authorization failures surface here.
pub async fn connect_conversation(
    base_url: &str,
    conversation_id: ConversationId,
    user_id: UserId,
    after: Option<OrderKey>,
    policy: RetryPolicy,
) -> Result<RemoteConversation> {
    let base = Url::parse(base_url).map_err(|e| anyhow!("invalid ws url: {e}"))?;
    let mut session = Session {
        base,
        conversation_id,
        user_id,
        cursor: after,
        unacked: VecDeque::new(),
        policy,
    };

    let stream = session.connect().await?;
    let (events_tx, events_rx) = mpsc::channel(256);
    let (outbound_tx, outbound_rx) = mpsc::channel(64);

    let handle = tokio::spawn(async move {
        session.run(stream, events_tx, outbound_rx).await;
    });

    Ok(RemoteConversation {
        events: events_rx,
        outbound: outbound_tx,
        handle,
    })
}

enum SessionEnd {
    /// Owner went away; stop for good.
    Finished,
    Disconnected,
}

impl Session {
    fn ws_url(&self) -> Url {
        let mut url = self.base.clone();
        url.set_path(&format!("/conversations/{}/ws", self.conversation_id));
        url.set_query(None);
        if let Some(cursor) = self.cursor {
            url.query_pairs_mut()
                .append_pair("after", &cursor.to_string());
        }
        url
    }

    async fn connect(&self) -> Result<WsStream> {
        let url = self.ws_url();
        let mut request = url
            .as_str()
            .into_client_request()
            .context("failed to build websocket request")?;
        request.headers_mut().insert(
            crate::server::USER_HEADER,
            HeaderValue::from_str(self.user_id.as_str()).context("user id is not a valid header")?,
        );

        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .with_context(|| format!("failed to connect to {url}"))?;
        Ok(stream)
    }

    async fn run(
        mut self,
        mut stream: WsStream,
        events: mpsc::Sender<RemoteEvent>,
        mut outbound: mpsc::Receiver<ClientFrame>,
    ) {
        loop {
            match self.pump(stream, &events, &mut outbound).await {
                SessionEnd::Finished => return,
                SessionEnd::Disconnected => {}
            }

            stream = match self.reconnect().await {
                Some(stream) => stream,
                None => return,
            };
        }
    }

    async fn reconnect(&self) -> Option<WsStream> {
        let mut delay = self.policy.initial_delay;
        for attempt in 1..=self.policy.max_attempts {
            tokio::time::sleep(delay).await;
            match self.connect().await {
                Ok(stream) => {
                    tracing::info!(
                        conversation_id = %self.conversation_id,
                        cursor = ?self.cursor,
                        "reconnected"
                    );
                    return Some(stream);
                }
                Err(err) => {
                    tracing::warn!(
                        conversation_id = %self.conversation_id,
                        attempt,
                        error = %err,
                        "reconnect failed"
                    );
                    delay = Duration::from_secs_f64(
                        (delay.as_secs_f64() * self.policy.backoff_multiplier)
                            .min(self.policy.max_delay.as_secs_f64()),
                    );
                }
            }
        }
        None
    }

    async fn pump(
        &mut self,
        stream: WsStream,
        events: &mpsc::Sender<RemoteEvent>,
        outbound: &mut mpsc::Receiver<ClientFrame>,
    ) -> SessionEnd {
        let (mut ws_tx, mut ws_rx) = stream.split();

        // Resend everything still unanswered; the server dedups by client id.
        for frame in &self.unacked {
            if let Err(end) = send_frame(&mut ws_tx, frame).await {
                return end;
            }
        }

        loop {
            tokio::select! {
                incoming = ws_rx.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        let Ok(frame) = serde_json::from_str::<ServerFrame>(text.as_str()) else {
                            continue;
                        };
                        if let Some(event) = self.accept(frame) {
                            if events.send(event).await.is_err() {
                                return SessionEnd::Finished;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => {
                        return SessionEnd::Disconnected;
                    }
                    Some(Ok(_)) => {}
                },
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        self.unacked.push_back(frame.clone());
                        if let Err(end) = send_frame(&mut ws_tx, &frame).await {
                            return end;
                        }
                    }
                    None => return SessionEnd::Finished,
                },
            }
        }
    }

    /// Drop anything at or before the cursor. Order keys grow strictly within
    /// a conversation, so this also drops replayed duplicates.
    fn accept(&mut self, frame: ServerFrame) -> Option<RemoteEvent> {
        match frame {
            ServerFrame::Message { message } => {
                if self.cursor.is_some_and(|c| message.order_key <= c) {
                    return None;
                }
                self.cursor = Some(message.order_key);
                Some(RemoteEvent::Message(message))
            }
            ServerFrame::Ack { message_id, cursor } => {
                self.settle(message_id);
                Some(RemoteEvent::Ack { message_id, cursor })
            }
            ServerFrame::Error {
                code,
                message,
                message_id,
            } => {
                if let Some(id) = message_id {
                    self.settle(id);
                }
                Some(RemoteEvent::Error {
                    code,
                    message,
                    message_id,
                })
            }
        }
    }

    fn settle(&mut self, message_id: MessageId) {
        self.unacked
            .retain(|frame| frame.message_id() != Some(message_id));
    }
}

async fn send_frame<S>(sink: &mut S, frame: &ClientFrame) -> std::result::Result<(), SessionEnd>
where
    S: Sink<WsMessage> + Unpin,
{
    let json = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(err) => {
            tracing::error!(error = %err, ?frame, "failed to encode client frame");
            return Ok(());
        }
    };
    sink.send(WsMessage::Text(json.into()))
        .await
        .map_err(|_| SessionEnd::Disconnected)
}
