//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check TLS material is complete and unambiguous per protocol
//! - Check client certificate verification has a CA to verify against
//! - Check source IP extraction settings compile
//! - Validate value ranges (timeouts > 0, message sizes > 0)
//! - Reject combinations the multiplexer cannot serve
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use thiserror::Error;

use crate::config::schema::{ClientAuth, ListenerConfig, ServerConfig};
use crate::http::middleware::SourceIps;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{protocol}: TLS material given both as files and inline PEM")]
    ConflictingTlsMaterial { protocol: &'static str },

    #[error("{protocol}: TLS {missing} is missing")]
    IncompleteTls {
        protocol: &'static str,
        missing: &'static str,
    },

    #[error("{protocol}: client CA given both as a file and inline PEM")]
    ConflictingClientCa { protocol: &'static str },

    #[error("{protocol}: client_auth requires a client CA")]
    MissingClientCa { protocol: &'static str },

    #[error("logging: {0}")]
    SourceIps(String),

    #[error("route_http_to_grpc requires both HTTP and gRPC to be enabled")]
    MuxRequiresBoth,

    #[error("route_http_to_grpc cannot be combined with TLS on the HTTP listener")]
    MuxWithTls,

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("path prefix {0:?} must start with '/' and not end with '/'")]
    InvalidPathPrefix(String),
}

/// Check a configuration, collecting every problem found.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    validate_listener("http", &config.http, &mut errors);
    validate_listener("grpc", &config.grpc, &mut errors);

    if config.route_http_to_grpc {
        if !(config.http.enabled && config.grpc.enabled) {
            errors.push(ValidationError::MuxRequiresBoth);
        } else if config.http.tls.is_some() {
            errors.push(ValidationError::MuxWithTls);
        }
        if config.mux_classify_timeout_ms == 0 {
            errors.push(ValidationError::Zero {
                field: "mux_classify_timeout_ms",
            });
        }
    }

    let zero_checks = [
        (
            "graceful_shutdown_timeout_secs",
            config.graceful_shutdown_timeout_secs == 0,
        ),
        (
            "http_server.read_timeout_secs",
            config.http_server.read_timeout_secs == 0,
        ),
        (
            "http_server.write_timeout_secs",
            config.http_server.write_timeout_secs == 0,
        ),
        (
            "grpc_server.max_recv_msg_size",
            config.grpc_server.max_recv_msg_size == 0,
        ),
        (
            "grpc_server.max_send_msg_size",
            config.grpc_server.max_send_msg_size == 0,
        ),
        (
            "grpc_server.max_concurrent_streams",
            config.grpc_server.max_concurrent_streams == 0,
        ),
    ];
    let optional_zero_checks = [
        (
            "grpc_server.max_connection_idle_secs",
            config.grpc_server.max_connection_idle_secs,
        ),
        (
            "grpc_server.max_connection_age_secs",
            config.grpc_server.max_connection_age_secs,
        ),
    ];
    let zero_checks = zero_checks.into_iter().chain(
        optional_zero_checks
            .into_iter()
            .map(|(field, value)| (field, value == Some(0))),
    );
    for (field, is_zero) in zero_checks {
        if is_zero {
            errors.push(ValidationError::Zero { field });
        }
    }

    let logging = &config.logging;
    if logging.log_source_ips {
        if let Err(e) = SourceIps::new(&logging.log_source_ips_header, &logging.log_source_ips_regex) {
            errors.push(ValidationError::SourceIps(e.to_string()));
        }
    }

    let prefix = &config.http_server.path_prefix;
    if !prefix.is_empty() && (!prefix.starts_with('/') || prefix.ends_with('/')) {
        errors.push(ValidationError::InvalidPathPrefix(prefix.clone()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_listener(protocol: &'static str, listener: &ListenerConfig, errors: &mut Vec<ValidationError>) {
    let Some(tls) = &listener.tls else {
        return;
    };

    let has_files = tls.cert_path.is_some() || tls.key_path.is_some();
    let has_inline = tls.cert_pem.is_some() || tls.key_pem.is_some();
    if has_files && has_inline {
        errors.push(ValidationError::ConflictingTlsMaterial { protocol });
        return;
    }

    let (cert, key) = if has_inline {
        (tls.cert_pem.is_some(), tls.key_pem.is_some())
    } else {
        (tls.cert_path.is_some(), tls.key_path.is_some())
    };
    if !cert {
        errors.push(ValidationError::IncompleteTls {
            protocol,
            missing: "certificate",
        });
    }
    if !key {
        errors.push(ValidationError::IncompleteTls {
            protocol,
            missing: "private key",
        });
    }

    if tls.client_ca_path.is_some() && tls.client_ca_pem.is_some() {
        errors.push(ValidationError::ConflictingClientCa { protocol });
    } else if tls.client_auth != ClientAuth::NoClientCert && !tls.has_client_ca() {
        errors.push(ValidationError::MissingClientCa { protocol });
    }
}
