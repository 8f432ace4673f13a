//! Request logging.
//!
//! Successful requests are logged at debug (or info), 502/503 are logged as
//! high-volume errors at debug, and any other 5xx is logged at warn together
//! with the start of the response body. The failure line is written once the
//! body has been sent, so streaming responses are never held back.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::middleware::{from_fn_with_state, Next};
use axum::response::Response;
use axum::Router;
use bytes::Bytes;
use http::{HeaderMap, Method, Request, Uri};
use http_body::{Frame, SizeHint};

use crate::config::LoggingConfig;
use crate::http::middleware::source_ips::{SourceIps, SourceIpsError};
use crate::http::middleware::Middleware;
use crate::http::request::RequestIdExt;
use crate::http::websocket::is_ws_handshake;

/// Bytes of a failed response body included in the log line.
pub const MAX_LOGGED_BODY: usize = 4096;

/// Headers never written to logs.
const ALWAYS_EXCLUDED: &[&str] = &["cookie", "x-csrf-token", "authorization"];

struct Settings {
    info_level: bool,
    disable_success_log: bool,
    log_headers: bool,
    excluded: HashSet<String>,
    source_ips: Option<SourceIps>,
}

/// Logs each request's method, URI, status and duration.
#[derive(Clone)]
pub struct RequestLog {
    settings: Arc<Settings>,
}

impl RequestLog {
    pub fn new(config: &LoggingConfig) -> Result<Self, SourceIpsError> {
        let excluded = ALWAYS_EXCLUDED
            .iter()
            .map(|h| h.to_string())
            .chain(config.log_request_exclude_headers.iter().map(|h| h.to_ascii_lowercase()))
            .collect();
        let source_ips = if config.log_source_ips {
            Some(SourceIps::new(
                &config.log_source_ips_header,
                &config.log_source_ips_regex,
            )?)
        } else {
            None
        };
        Ok(Self {
            settings: Arc::new(Settings {
                info_level: config.log_request_at_info_level,
                disable_success_log: config.disable_request_success_log,
                log_headers: config.log_request_headers,
                excluded,
                source_ips,
            }),
        })
    }
}

impl Middleware for RequestLog {
    fn wrap(&self, router: Router) -> Router {
        router.layer(from_fn_with_state(Arc::clone(&self.settings), log_request))
    }
}

async fn log_request(State(settings): State<Arc<Settings>>, req: Request<Body>, next: Next) -> Response {
    let begin = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let request_id = req.request_id().unwrap_or_default().to_owned();
    let ws = is_ws_handshake(req.headers());
    // Captured before the handler runs, in case it rewrites them.
    let headers = if settings.log_headers {
        dump_headers(req.headers(), &settings.excluded)
    } else {
        String::new()
    };
    let source_ips = settings.source_ips.as_ref().map(|ips| {
        let remote = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        ips.get(req.headers(), remote)
    });

    let resp = next.run(req).await;
    let status = resp.status().as_u16();
    let duration = begin.elapsed();

    match status {
        100..=499 => {
            if settings.disable_success_log {
                return resp;
            }
            let source_ips = source_ips.as_deref();
            if settings.info_level {
                tracing::info!(%method, %uri, status, ?duration, ws, %request_id, %headers, source_ips, "HTTP request");
            } else {
                tracing::debug!(%method, %uri, status, ?duration, ws, %request_id, %headers, source_ips, "HTTP request");
            }
            resp
        }
        502 | 503 => {
            tracing::debug!(
                %method, %uri, status, ?duration, ws, %request_id, %headers,
                source_ips = source_ips.as_deref(),
                high_volume = true,
                "HTTP request failed"
            );
            resp
        }
        _ => {
            let log = FailureLog {
                method,
                uri,
                status,
                duration,
                ws,
                request_id,
                headers,
                source_ips,
                captured: Vec::new(),
                error: None,
            };
            resp.map(|inner| {
                Body::new(LoggedBody {
                    inner,
                    log: Some(log),
                })
            })
        }
    }
}

/// Everything the warn line for a failed request needs.
struct FailureLog {
    method: Method,
    uri: Uri,
    status: u16,
    duration: Duration,
    ws: bool,
    request_id: String,
    headers: String,
    source_ips: Option<String>,
    captured: Vec<u8>,
    error: Option<String>,
}

impl FailureLog {
    fn capture(&mut self, data: &[u8]) {
        let room = MAX_LOGGED_BODY.saturating_sub(self.captured.len());
        self.captured.extend_from_slice(&data[..data.len().min(room)]);
    }

    fn emit(self) {
        tracing::warn!(
            method = %self.method,
            uri = %self.uri,
            status = self.status,
            duration = ?self.duration,
            ws = self.ws,
            request_id = %self.request_id,
            headers = %self.headers,
            source_ips = self.source_ips.as_deref(),
            response = %String::from_utf8_lossy(&self.captured),
            error = self.error.as_deref(),
            "HTTP request failed"
        );
    }
}

/// Forwards a failed response unchanged while keeping its first bytes for
/// the log line, which is written at end of stream, on error or on drop.
struct LoggedBody {
    inner: Body,
    log: Option<FailureLog>,
}

impl http_body::Body for LoggedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, axum::Error>>> {
        let this = &mut *self;
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let (Some(data), Some(log)) = (frame.data_ref(), this.log.as_mut()) {
                    log.capture(data);
                }
            }
            Poll::Ready(Some(Err(e))) => {
                if let Some(mut log) = this.log.take() {
                    log.error = Some(e.to_string());
                    log.emit();
                }
            }
            Poll::Ready(None) => {
                if let Some(log) = this.log.take() {
                    log.emit();
                }
            }
            Poll::Pending => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for LoggedBody {
    fn drop(&mut self) {
        if let Some(log) = self.log.take() {
            log.emit();
        }
    }
}

/// Render headers as `Name: value; Name: value`, sorted by name.
fn dump_headers(headers: &HeaderMap, excluded: &HashSet<String>) -> String {
    let mut lines: Vec<String> = headers
        .iter()
        .filter(|(name, _)| !excluded.contains(name.as_str()))
        .map(|(name, value)| format!("{}: {}", name, String::from_utf8_lossy(value.as_bytes())))
        .collect();
    lines.sort();
    lines.join("; ")
}
