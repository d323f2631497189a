//! Wire messages: one JSON object per line, tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::context::ServerContext;
use crate::handlers::{GetRequest, GetResponse, MSG_INVALID_REQUEST, SaveRequest, SaveResponse};
use crate::lifecycle::LifecycleHooks;
use crate::sessions::SessionResponse;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    SavePlayer(SaveRequest),
    GetPlayer(GetRequest),
    Login {
        #[serde(default)]
        identity: Option<String>,
        #[serde(default)]
        username: String,
    },
    Logout {
        #[serde(default)]
        identity: Option<String>,
    },
    Ping,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    SavePlayer(SaveResponse),
    GetPlayer(GetResponse),
    Session(SessionResponse),
    Pong { timestamp: i64 },
    ShuttingDown { timestamp: i64 },
    Error { message: String, timestamp: i64 },
}

impl Response {
    pub fn error(message: impl Into<String>, timestamp: i64) -> Self {
        Self::Error {
            message: message.into(),
            timestamp,
        }
    }
}

/// Route a decoded request to its handler.
pub fn dispatch(ctx: &ServerContext, request: Request) -> Response {
    match request {
        Request::SavePlayer(request) => {
            let record = request.record.clone();
            let response = ctx.handler().handle_save(request);
            if let (true, Some(record)) = (response.success, record) {
                ctx.sessions().player_saved(&record);
            }
            Response::SavePlayer(response)
        }
        Request::GetPlayer(request) => Response::GetPlayer(ctx.handler().handle_load(request)),
        Request::Login { identity, username } => {
            Response::Session(ctx.sessions().handle_login(identity.as_deref(), &username))
        }
        Request::Logout { identity } => {
            Response::Session(ctx.sessions().handle_logout(identity.as_deref()))
        }
        Request::Ping => Response::Pong {
            timestamp: ctx.clock().now_unix_ms(),
        },
        Request::Shutdown => {
            let now = ctx.clock().now_unix_ms();
            if !ctx.config().network.allow_remote_shutdown {
                tracing::warn!("ignored remote shutdown request");
                return Response::error("Remote shutdown disabled", now);
            }
            ctx.on_shutdown_requested();
            Response::ShuttingDown { timestamp: now }
        }
    }
}

/// Decode one request line and answer it. Undecodable input gets an error response.
pub fn handle_line(ctx: &ServerContext, line: &str) -> Response {
    match serde_json::from_str::<Request>(line) {
        Ok(request) => dispatch(ctx, request),
        Err(error) => {
            tracing::debug!(%error, "undecodable request");
            Response::error(MSG_INVALID_REQUEST, ctx.clock().now_unix_ms())
        }
    }
}

/// Encode a response as a single line, without the trailing newline.
pub fn encode(response: &Response) -> String {
    serde_json::to_string(response).unwrap_or_else(|error| {
        tracing::error!(%error, "failed to encode response");
        serde_json::json!({
            "type": "error",
            "message": format!("Server error: {error}"),
            "timestamp": 0,
        })
        .to_string()
    })
}
