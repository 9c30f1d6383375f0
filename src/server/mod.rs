pub mod api;

use anyhow::{Context, Result};
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use colored::*;
use serde::Serialize;
use tokio::net::TcpListener;

use crate::chat::ChatService;
use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::model::UserId;
use crate::storage;

/// Header carrying the authenticated user id, set by the upstream auth layer.
pub const USER_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub service: ChatService,
}

impl AppState {
    pub fn new(service: ChatService) -> Self {
        Self { service }
    }
}

/// Open the configured database and serve until ctrl-c.
pub async fn serve(config: ChatConfig) -> Result<()> {
    let db = storage::open_database(&config.database_path).await?;
    let service = ChatService::new(db, &config);
    let addr = config.bind_address();

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    println!(
        "{} Chat server running at {}",
        "✓".green(),
        format!("http://{addr}").bright_blue()
    );

    serve_on(listener, AppState::new(service)).await
}

/// Serve on an already-bound listener.
pub async fn serve_on(listener: TcpListener, state: AppState) -> Result<()> {
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .context("server error")
}

/// The caller's identity, taken from [`USER_HEADER`].
#[derive(Debug, Clone)]
pub struct Caller(pub UserId);

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|raw| UserId::parse(raw).ok())
            .map(Caller)
            .ok_or(ApiError::Unauthenticated)
    }
}

#[derive(Debug)]
pub enum ApiError {
    Unauthenticated,
    Chat(ChatError),
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        ApiError::Chat(err)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::Chat(err) => match err {
                ChatError::InvalidParticipants(_)
                | ChatError::EmptyMessage
                | ChatError::InvalidCursor(_) => StatusCode::BAD_REQUEST,
                ChatError::Forbidden => StatusCode::FORBIDDEN,
                ChatError::ListingNotFound(_) => StatusCode::NOT_FOUND,
                ChatError::MessageTooLong { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                ChatError::StorageUnavailable(_) | ChatError::ChannelUnavailable(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
            },
        }
    }

    fn body(&self) -> ErrorBody {
        match self {
            ApiError::Unauthenticated => ErrorBody {
                code: "unauthenticated",
                message: format!("missing {USER_HEADER} header"),
            },
            // Internals of an outage stay in the logs.
            ApiError::Chat(err) if err.is_retryable() => ErrorBody {
                code: err.code(),
                message: "temporarily unavailable, try again".to_string(),
            },
            ApiError::Chat(err) => ErrorBody {
                code: err.code(),
                message: err.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Chat(err) = &self {
            if err.is_retryable() {
                tracing::error!(error = %err, "request failed after retries");
            }
        }
        (self.status(), Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[tokio::test]
    async fn caller_comes_from_header() {
        let (mut parts, _) = Request::builder()
            .header(USER_HEADER, " alice ")
            .body(())
            .unwrap()
            .into_parts();
        let Caller(user) = Caller::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(user.as_str(), "alice");
    }

    #[tokio::test]
    async fn missing_or_blank_header_is_rejected() {
        let (mut parts, _) = Request::builder().body(()).unwrap().into_parts();
        assert!(matches!(
            Caller::from_request_parts(&mut parts, &()).await,
            Err(ApiError::Unauthenticated)
        ));

        let (mut parts, _) = Request::builder()
            .header(USER_HEADER, "   ")
            .body(())
            .unwrap()
            .into_parts();
        assert!(matches!(
            Caller::from_request_parts(&mut parts, &()).await,
            Err(ApiError::Unauthenticated)
        ));
    }

    #[test]
    fn status_mapping() {
        let cases = [
            (ChatError::EmptyMessage, StatusCode::BAD_REQUEST),
            (ChatError::InvalidCursor("x".into()), StatusCode::BAD_REQUEST),
            (ChatError::Forbidden, StatusCode::FORBIDDEN),
            (ChatError::ListingNotFound("l".into()), StatusCode::NOT_FOUND),
            (ChatError::MessageTooLong { max: 10 }, StatusCode::PAYLOAD_TOO_LARGE),
            (
                ChatError::StorageUnavailable("locked".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
        assert_eq!(ApiError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn outage_details_are_hidden() {
        let body = ApiError::from(ChatError::StorageUnavailable("disk I/O error".into())).body();
        assert_eq!(body.code, "storage_unavailable");
        assert!(!body.message.contains("disk"));
    }
}
