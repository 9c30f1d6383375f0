use axum::{
    Json, Router,
    extract::ws::{close_code, CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade},
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use super::{ApiError, AppState, Caller};
use crate::error::ChatError;
use crate::model::{
    ConversationId, ConversationView, ListingId, Message, MessageId, MessagePage, OrderKey,
    ReadMarker, UserId,
};
use crate::sync::{ClientFrame, Delivery, ServerFrame, Subscription};

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/conversations",
            get(list_conversations).post(start_conversation),
        )
        .route("/conversations/{id}", get(open_conversation))
        .route(
            "/conversations/{id}/messages",
            get(list_messages).post(send_message),
        )
        .route("/conversations/{id}/read", post(mark_read))
        .route("/conversations/{id}/ws", get(conversation_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": crate::VERSION }))
}

/// Malformed ids are reported exactly like unknown ones.
fn conversation_id(raw: &str) -> ApiResult<ConversationId> {
    raw.parse().map_err(|_| ApiError::Chat(ChatError::Forbidden))
}

fn cursor(raw: Option<&str>) -> ApiResult<Option<OrderKey>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => Ok(Some(raw.parse()?)),
        None => Ok(None),
    }
}

#[derive(Debug, Deserialize)]
struct StartConversation {
    listing_id: String,
    #[serde(default)]
    counterpart_id: Option<String>,
}

async fn start_conversation(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(request): Json<StartConversation>,
) -> ApiResult<(StatusCode, Json<ConversationView>)> {
    let listing_id = ListingId::parse(&request.listing_id)?;
    let counterpart = request
        .counterpart_id
        .as_deref()
        .map(UserId::parse)
        .transpose()?;

    let resolution = state
        .service
        .start_conversation(&caller, &listing_id, counterpart.as_ref())
        .await?;
    let view = state
        .service
        .open_conversation(resolution.conversation.id, &caller)
        .await?;

    let status = if resolution.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(view)))
}

async fn list_conversations(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> ApiResult<Json<Vec<ConversationView>>> {
    Ok(Json(state.service.list_conversations(&caller).await?))
}

async fn open_conversation(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<ConversationView>> {
    let id = conversation_id(&id)?;
    Ok(Json(state.service.open_conversation(id, &caller).await?))
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    after: Option<String>,
    limit: Option<usize>,
}

async fn list_messages(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<MessagePage>> {
    let id = conversation_id(&id)?;
    let after = cursor(query.after.as_deref())?;
    let page = state
        .service
        .list_messages(id, &caller, after, query.limit)
        .await?;
    Ok(Json(page))
}

#[derive(Debug, Deserialize)]
struct SendMessage {
    body: String,
    #[serde(default)]
    client_message_id: Option<MessageId>,
}

async fn send_message(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    Json(request): Json<SendMessage>,
) -> ApiResult<(StatusCode, Json<Message>)> {
    let id = conversation_id(&id)?;
    let message = state
        .service
        .send_message(id, &caller, &request.body, request.client_message_id)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

#[derive(Debug, Deserialize)]
struct MarkRead {
    up_to: String,
}

async fn mark_read(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    Json(request): Json<MarkRead>,
) -> ApiResult<Json<ReadMarker>> {
    let id = conversation_id(&id)?;
    let up_to: OrderKey = request.up_to.parse()?;
    Ok(Json(state.service.mark_read(id, &caller, up_to).await?))
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    after: Option<String>,
}

/// Authorization and subscription happen before the upgrade so a refused
/// caller gets a plain HTTP error.
async fn conversation_ws(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let id = conversation_id(&id)?;
    let after = cursor(query.after.as_deref())?;
    let subscription = state.service.subscribe(id, &caller).await?;
    tracing::debug!(conversation_id = %id, %caller, ?after, "websocket subscriber attached");

    Ok(ws
        .on_upgrade(move |socket| stream_conversation(state, socket, caller, subscription, after))
        .into_response())
}

type WsSink = SplitSink<WebSocket, WsMessage>;

struct Feed {
    state: AppState,
    caller: UserId,
    conversation_id: ConversationId,
    /// Order key of the last message written to the socket.
    last_sent: Option<OrderKey>,
}

async fn stream_conversation(
    state: AppState,
    socket: WebSocket,
    caller: UserId,
    mut subscription: Subscription,
    after: Option<OrderKey>,
) {
    let (mut sink, mut incoming) = socket.split();
    let mut feed = Feed {
        conversation_id: subscription.conversation_id(),
        state,
        caller,
        last_sent: after,
    };

    // The subscription is already live, so nothing committed during the
    // replay is missed; duplicates are filtered by `last_sent`.
    if feed.catch_up(&mut sink).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            delivery = subscription.recv() => match delivery {
                Delivery::Message(message) => {
                    if feed.forward(&mut sink, &message).await.is_err() {
                        break;
                    }
                }
                Delivery::Lagged { skipped } => {
                    tracing::warn!(
                        conversation_id = %feed.conversation_id,
                        skipped,
                        "websocket subscriber lagged, catching up from the store"
                    );
                    if feed.catch_up(&mut sink).await.is_err() {
                        break;
                    }
                }
                Delivery::Closed => break,
            },
            frame = incoming.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    let frame = serde_json::from_str::<ClientFrame>(text.as_str())
                        .map_err(|err| err.to_string());
                    if feed.handle(&mut sink, frame).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Binary(bytes))) => {
                    let frame = serde_cbor::from_slice::<ClientFrame>(&bytes)
                        .map_err(|err| err.to_string());
                    if feed.handle(&mut sink, frame).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    tracing::debug!(conversation_id = %feed.conversation_id, "websocket subscriber detached");
}

/// Signals that the socket is gone.
struct Disconnected;

impl Feed {
    /// Replay everything committed after `last_sent`.
    ///
    /// A replay that fails part way closes the socket, and the client
    /// reconnects from its own cursor. Live messages are never forwarded past
    /// an unreplayed gap.
    async fn catch_up(&mut self, sink: &mut WsSink) -> Result<(), Disconnected> {
        let mut backlog =
            self.state
                .service
                .message_stream(self.conversation_id, self.caller.clone(), self.last_sent);

        while let Some(item) = backlog.next().await {
            match item {
                Ok(message) => self.forward(sink, &message).await?,
                Err(err) => {
                    tracing::warn!(
                        conversation_id = %self.conversation_id,
                        error = %err,
                        "backlog replay failed, closing websocket"
                    );
                    send(sink, &error_frame(&err, None)).await?;
                    let code = if err.is_retryable() {
                        close_code::AGAIN
                    } else {
                        close_code::POLICY
                    };
                    let _ = sink
                        .send(WsMessage::Close(Some(CloseFrame {
                            code,
                            reason: err.code().to_string().into(),
                        })))
                        .await;
                    return Err(Disconnected);
                }
            }
        }
        Ok(())
    }

    async fn forward(&mut self, sink: &mut WsSink, message: &Message) -> Result<(), Disconnected> {
        if self.last_sent.is_some_and(|last| message.order_key <= last) {
            return Ok(());
        }
        send(
            sink,
            &ServerFrame::Message {
                message: message.clone(),
            },
        )
        .await?;
        self.last_sent = Some(message.order_key);
        Ok(())
    }

    async fn handle(
        &mut self,
        sink: &mut WsSink,
        frame: Result<ClientFrame, String>,
    ) -> Result<(), Disconnected> {
        let reply = match frame {
            Ok(ClientFrame::Send {
                body,
                client_message_id,
            }) => match self
                .state
                .service
                .send_message(self.conversation_id, &self.caller, &body, client_message_id)
                .await
            {
                Ok(message) => ServerFrame::Ack {
                    message_id: message.id,
                    cursor: message.cursor(),
                },
                Err(err) => error_frame(&err, client_message_id),
            },
            Err(reason) => ServerFrame::Error {
                code: "bad_frame".to_string(),
                message: reason,
                message_id: None,
            },
        };
        send(sink, &reply).await
    }
}

fn error_frame(err: &ChatError, message_id: Option<MessageId>) -> ServerFrame {
    ServerFrame::Error {
        code: err.code().to_string(),
        message: if err.is_retryable() {
            "temporarily unavailable, try again".to_string()
        } else {
            err.to_string()
        },
        message_id,
    }
}

async fn send(sink: &mut WsSink, frame: &ServerFrame) -> Result<(), Disconnected> {
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(err) => {
            tracing::error!(error = %err, ?frame, "failed to encode server frame");
            return Ok(());
        }
    };
    sink.send(WsMessage::Text(text.into()))
        .await
        .map_err(|_| Disconnected)
}
