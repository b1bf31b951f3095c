//! Internal HTTP surface.
//!
//! | route | method | purpose |
//! |---|---|---|
//! | `/internal/parser-events` | POST | enqueue a worker batch |
//! | `/internal/parser-events/status` | GET | queue and consumer state |
//! | `/internal/parsers/control` | POST | start/stop/restart workers |
//! | `/internal/parsers/status` | GET | worker state and target coverage |
//! | `/healthz` | GET | liveness |
//!
//! Mutating routes require the `X-Parser-Token` header when a token is
//! configured.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::app::Coordinator;
use crate::intake::SubmitError;
use crate::supervisor::ControlAction;

/// Header carrying the shared secret.
pub const TOKEN_HEADER: &str = "x-parser-token";

pub const EVENTS_PATH: &str = "/internal/parser-events";
pub const EVENTS_STATUS_PATH: &str = "/internal/parser-events/status";
pub const CONTROL_PATH: &str = "/internal/parsers/control";
pub const PARSERS_STATUS_PATH: &str = "/internal/parsers/status";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Accept connections until `shutdown` resolves.
pub async fn serve(
    coordinator: Arc<Coordinator>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()>,
) -> std::io::Result<()> {
    tokio::pin!(shutdown);
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "http server listening");
    }

    loop {
        let stream = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
            _ = &mut shutdown => break,
        };
        let io = TokioIo::new(stream);
        let coordinator = coordinator.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let coordinator = coordinator.clone();
                async move { Ok::<_, Infallible>(handle(&coordinator, req).await) }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!(error = %e, "connection error");
            }
        });
    }

    info!("http server stopped");
    Ok(())
}

/// Route one request.
pub async fn handle<B>(coordinator: &Arc<Coordinator>, req: Request<B>) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes> + Send,
    B::Error: Into<BoxError>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (method, path.as_str()) {
        (Method::POST, EVENTS_PATH) => submit_event(coordinator, req).await,
        (Method::GET, EVENTS_STATUS_PATH) => {
            json_response(StatusCode::OK, &coordinator.intake().status())
        }
        (Method::POST, CONTROL_PATH) => control(coordinator, req).await,
        (Method::GET, PARSERS_STATUS_PATH) => match coordinator.parser_status().await {
            Ok(status) => json_response(StatusCode::OK, &status),
            Err(e) => {
                warn!(error = %e, "parser status failed");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "status_unavailable")
            }
        },
        (Method::GET, "/healthz") => text_response(StatusCode::OK, "OK"),
        (_, EVENTS_PATH | EVENTS_STATUS_PATH | CONTROL_PATH | PARSERS_STATUS_PATH | "/healthz") => {
            error_response(StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed")
        }
        _ => error_response(StatusCode::NOT_FOUND, "not_found"),
    }
}

async fn submit_event<B>(coordinator: &Coordinator, req: Request<B>) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes> + Send,
    B::Error: Into<BoxError>,
{
    if !authorized(coordinator.settings().token(), req.headers()) {
        return error_response(StatusCode::FORBIDDEN, "forbidden");
    }
    let body = match read_body(req, coordinator.settings().server.max_body_bytes).await {
        Ok(body) => body,
        Err(response) => return response,
    };
    let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid_json");
    };

    match coordinator.intake().submit(payload, Utc::now()) {
        Ok(queue_size) => json_response(
            StatusCode::OK,
            &json!({"ok": true, "status": "queued", "queue_size": queue_size}),
        ),
        Err(e) => {
            let status = match e {
                SubmitError::QueueFull => StatusCode::TOO_MANY_REQUESTS,
                SubmitError::Closed => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_REQUEST,
            };
            debug!(error = e.as_str(), "submission rejected");
            error_response(status, e.as_str())
        }
    }
}

async fn control<B>(coordinator: &Arc<Coordinator>, req: Request<B>) -> Response<Full<Bytes>>
where
    B: Body<Data = Bytes> + Send,
    B::Error: Into<BoxError>,
{
    if !authorized(coordinator.settings().token(), req.headers()) {
        return error_response(StatusCode::FORBIDDEN, "forbidden");
    }
    let body = match read_body(req, coordinator.settings().server.max_body_bytes).await {
        Ok(body) => body,
        Err(response) => return response,
    };
    let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid_json");
    };
    let action = payload
        .get("action")
        .and_then(Value::as_str)
        .and_then(|a| a.parse::<ControlAction>().ok());
    let Some(action) = action else {
        return error_response(StatusCode::BAD_REQUEST, "unknown_action");
    };

    info!(%action, "control action requested");
    let supervisor = coordinator.supervisor().clone();
    tokio::spawn(async move {
        if let Err(e) = supervisor.control(action).await {
            warn!(%action, error = %e, "control action failed");
        }
    });

    json_response(
        StatusCode::OK,
        &json!({"ok": true, "action": action.to_string()}),
    )
}

/// A configured token must match the header exactly.
fn authorized(token: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(expected) = token else {
        return true;
    };
    headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|given| given.trim() == expected)
}

async fn read_body<B>(req: Request<B>, limit: usize) -> Result<Bytes, Response<Full<Bytes>>>
where
    B: Body<Data = Bytes> + Send,
    B::Error: Into<BoxError>,
{
    match Limited::new(req.into_body(), limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => Err(error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            "payload_too_large",
        )),
        Err(e) => {
            debug!(error = %e, "failed to read request body");
            Err(error_response(StatusCode::BAD_REQUEST, "invalid_body"))
        }
    }
}

fn json_response(status: StatusCode, body: &impl Serialize) -> Response<Full<Bytes>> {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|_| br#"{"ok":false}"#.to_vec());
    let mut response = Response::new(Full::new(Bytes::from(bytes)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn error_response(status: StatusCode, error: &str) -> Response<Full<Bytes>> {
    json_response(status, &json!({"ok": false, "error": error}))
}

fn text_response(status: StatusCode, text: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(text.as_bytes())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}
