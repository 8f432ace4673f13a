//! Conversion between HTTP responses and gRPC statuses.
//!
//! # Responsibilities
//! - Attach a full [`HttpResponse`] to a `tonic::Status` as a structured detail
//! - Recover that response on the other side of the call
//! - Classify cancellations as "client closed request"
//!
//! # Design Decisions
//! - Details are a `google.rpc.Status` holding exactly one `Any`, the same
//!   shape every gRPC implementation understands
//! - The coarse gRPC code is a best-effort mirror of the HTTP code; the detail
//!   is the source of truth and is never lossy

use bytes::Bytes;
use prost::Message;
use prost_types::Any;
use tonic::{Code, Status};

use crate::tunnel::error::TunnelError;
use crate::tunnel::types::HttpResponse;

/// Non-standard code used when the client gave up on the request.
pub const STATUS_CLIENT_CLOSED_REQUEST: u16 = 499;

/// `google.rpc.Status`, the payload of `grpc-status-details-bin`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RpcStatus {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(message, repeated, tag = "3")]
    pub details: Vec<Any>,
}

/// Map an HTTP status code onto the closest gRPC code.
pub fn code_for_http_status(status: i32) -> Code {
    match status {
        400 => Code::InvalidArgument,
        401 => Code::Unauthenticated,
        403 => Code::PermissionDenied,
        404 => Code::NotFound,
        409 => Code::Aborted,
        429 => Code::ResourceExhausted,
        499 => Code::Cancelled,
        501 => Code::Unimplemented,
        503 => Code::Unavailable,
        504 => Code::DeadlineExceeded,
        500..=599 => Code::Internal,
        _ => Code::Unknown,
    }
}

/// Wrap an HTTP response in a gRPC error so it survives the call boundary.
pub fn error_from_http_response(resp: &HttpResponse) -> Status {
    let code = code_for_http_status(resp.code);
    let message = String::from_utf8_lossy(&resp.body).into_owned();

    let any = match Any::from_msg(resp) {
        Ok(any) => any,
        Err(e) => {
            tracing::error!(error = %e, "Failed to pack HTTP response into status detail");
            return Status::new(code, message);
        }
    };
    let details = RpcStatus {
        code: code as i32,
        message: message.clone(),
        details: vec![any],
    };
    Status::with_details(code, message, Bytes::from(details.encode_to_vec()))
}

/// Build a tunneled HTTP error from a code and message.
pub fn errorf(code: u16, message: impl Into<String>) -> Status {
    let message: String = message.into();
    error_from_http_response(&HttpResponse::new(code, message.into_bytes()))
}

/// Recover the HTTP response embedded by [`error_from_http_response`].
///
/// Returns `None` unless the status carries exactly one detail of the
/// expected type.
pub fn http_response_from_status(status: &Status) -> Option<HttpResponse> {
    if status.details().is_empty() {
        return None;
    }
    let rpc_status = match RpcStatus::decode(status.details()) {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!(error = %e, "Status details are not a google.rpc.Status");
            return None;
        }
    };
    if rpc_status.details.len() != 1 {
        return None;
    }
    match rpc_status.details[0].to_msg::<HttpResponse>() {
        Ok(resp) => Some(resp),
        Err(e) => {
            tracing::error!(error = %e, "Got error containing non-response");
            None
        }
    }
}

/// Recover an HTTP response from any tunnel error.
///
/// A cancellation anywhere in the chain becomes a 499 whose body is the
/// error's text. Otherwise the innermost status is inspected.
pub fn http_response_from_error(err: &TunnelError) -> Option<HttpResponse> {
    if err.is_canceled() {
        if let TunnelError::Status(status) = err.root() {
            if let Some(resp) = http_response_from_status(status) {
                return Some(resp);
            }
        }
        return Some(HttpResponse::new(
            STATUS_CLIENT_CLOSED_REQUEST,
            err.to_string().into_bytes(),
        ));
    }
    match err.root() {
        TunnelError::Status(status) => http_response_from_status(status),
        _ => None,
    }
}
