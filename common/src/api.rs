//! Transport-neutral request dispatch for the push-mode HTTP surface.
//!
//! Platform servers translate their native request into [`InboundRequest`],
//! hand it to the control loop, and write back the [`OutboundResponse`].

use serde::Serialize;

use crate::{
    clock::{elapsed_ms, Millis},
    controller::NodeController,
    error::{ControlError, InvalidRequest},
    relay::RelayOutputs,
};

pub const ROUTE_RELAY: &str = "/relay";
pub const ROUTE_STATUS: &str = "/status";
/// How long a transport waits for the control loop before answering 503.
pub const REPLY_TIMEOUT_MS: u32 = 2_000;

const NOT_FOUND_TEXT: &str = "Relay node. Only gateway allowed.";
const RELAY_UNAUTHORIZED: &str = "Unauthorized: Gateway Only";
const CONTENT_TYPE_JSON: &str = "application/json";
const CONTENT_TYPE_TEXT: &str = "text/plain";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Other,
}

impl Method {
    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("GET") {
            Self::Get
        } else if raw.eq_ignore_ascii_case("POST") {
            Self::Post
        } else {
            Self::Other
        }
    }
}

#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub path: String,
    pub api_key: Option<String>,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl OutboundResponse {
    fn json<T: Serialize>(status: u16, payload: &T) -> Self {
        match serde_json::to_string(payload) {
            Ok(body) => Self {
                status,
                content_type: CONTENT_TYPE_JSON,
                body,
            },
            Err(err) => Self::error(500, &format!("serialization failed: {err}")),
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            content_type: CONTENT_TYPE_JSON,
            body: serde_json::json!({ "error": message }).to_string(),
        }
    }

    fn not_found() -> Self {
        Self {
            status: 404,
            content_type: CONTENT_TYPE_TEXT,
            body: NOT_FOUND_TEXT.to_string(),
        }
    }

    /// Reply used when the control loop cannot answer in time.
    pub fn unavailable() -> Self {
        Self::error(503, "Control loop unavailable")
    }
}

impl From<ControlError> for OutboundResponse {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::NotFound => Self::not_found(),
            other => Self::error(other.status_code(), &other.to_string()),
        }
    }
}

fn route_path(path: &str) -> &str {
    let path = path.split_once('?').map_or(path, |(route, _)| route);
    match path.strip_suffix('/') {
        Some(trimmed) if !trimmed.is_empty() => trimmed,
        _ => path,
    }
}

pub fn dispatch<O: RelayOutputs>(
    controller: &mut NodeController<O>,
    request: &InboundRequest,
    now_ms: Millis,
) -> OutboundResponse {
    match route_path(&request.path) {
        ROUTE_RELAY => handle_relay(controller, request, now_ms),
        ROUTE_STATUS => handle_status(controller, request, now_ms),
        _ => ControlError::NotFound.into(),
    }
}

/// Dispatches a request that waited in the control loop's queue. Requests
/// whose caller has already been told 503 are dropped without touching state.
pub fn dispatch_queued<O: RelayOutputs>(
    controller: &mut NodeController<O>,
    request: &InboundRequest,
    queued_at: Millis,
    now_ms: Millis,
) -> Option<OutboundResponse> {
    let waited_ms = elapsed_ms(now_ms, queued_at);
    if waited_ms >= REPLY_TIMEOUT_MS {
        log::warn!(
            "dropping {} request queued {waited_ms}ms ago",
            route_path(&request.path)
        );
        return None;
    }
    Some(dispatch(controller, request, now_ms))
}

fn handle_relay<O: RelayOutputs>(
    controller: &mut NodeController<O>,
    request: &InboundRequest,
    now_ms: Millis,
) -> OutboundResponse {
    let key = request.api_key.as_deref();
    if !controller.authenticate(key) {
        log::warn!("rejected relay command: missing or wrong api key");
        return OutboundResponse::error(401, RELAY_UNAUTHORIZED);
    }
    if request.method != Method::Post {
        return ControlError::from(InvalidRequest::MethodNotAllowed).into();
    }

    let result = controller
        .build_command(key, request.body.as_deref(), now_ms)
        .and_then(|event| controller.on_command(event));

    match result {
        Ok(reply) => OutboundResponse::json(200, &reply),
        Err(err) => err.into(),
    }
}

fn handle_status<O: RelayOutputs>(
    controller: &mut NodeController<O>,
    request: &InboundRequest,
    now_ms: Millis,
) -> OutboundResponse {
    match controller.on_status_query(request.api_key.as_deref(), now_ms) {
        Ok(status) => OutboundResponse::json(200, &status),
        Err(err) => {
            log::warn!("rejected status query: {err}");
            err.into()
        }
    }
}
