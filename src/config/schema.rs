//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the dual-protocol server.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listener.
    pub http: ListenerConfig,

    /// gRPC listener.
    pub grpc: ListenerConfig,

    /// Serve both protocols from the HTTP listener, classifying each
    /// connection by its first bytes.
    pub route_http_to_grpc: bool,

    /// How long the multiplexer waits for enough bytes to classify a
    /// connection, in milliseconds.
    pub mux_classify_timeout_ms: u64,

    /// Deadline for draining HTTP connections on shutdown, in seconds.
    pub graceful_shutdown_timeout_secs: u64,

    /// HTTP server behaviour.
    pub http_server: HttpServerConfig,

    /// gRPC server behaviour.
    pub grpc_server: GrpcServerConfig,

    /// Logging settings.
    pub logging: LoggingConfig,

    /// Prefix for every metric name. Empty means no prefix.
    pub metrics_namespace: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http: ListenerConfig::with_port(80),
            grpc: ListenerConfig::with_port(9095),
            route_http_to_grpc: false,
            mux_classify_timeout_ms: 10_000,
            graceful_shutdown_timeout_secs: 30,
            http_server: HttpServerConfig::default(),
            grpc_server: GrpcServerConfig::default(),
            logging: LoggingConfig::default(),
            metrics_namespace: String::new(),
        }
    }
}

impl ServerConfig {
    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_timeout_secs)
    }

    pub fn mux_classify_timeout(&self) -> Duration {
        Duration::from_millis(self.mux_classify_timeout_ms)
    }

    /// True when the multiplexer will own the HTTP listener.
    pub fn multiplexing(&self) -> bool {
        self.route_http_to_grpc && self.http.enabled && self.grpc.enabled
    }
}

/// Address family a listener binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Either family, whichever the address resolves to first.
    #[default]
    Tcp,
    Tcp4,
    Tcp6,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
        }
    }
}

/// Listener configuration for one protocol.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Whether this protocol is served at all.
    pub enabled: bool,

    /// Address family.
    pub network: Network,

    /// Host or IP to bind. Empty binds every interface.
    pub address: String,

    /// Port to bind. 0 picks an ephemeral port.
    pub port: u16,

    /// Maximum concurrent connections. 0 means unlimited.
    pub conn_limit: usize,

    /// Optional TLS material.
    pub tls: Option<TlsConfig>,
}

impl ListenerConfig {
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// `address:port`, with an empty address mapped to the unspecified
    /// address of the configured family.
    pub fn bind_address(&self) -> String {
        let host = match (self.address.as_str(), self.network) {
            ("", Network::Tcp6) => "::",
            ("", _) => "0.0.0.0",
            (host, _) => host,
        };
        if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{}", self.port)
        } else {
            format!("{host}:{}", self.port)
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            network: Network::Tcp,
            address: String::new(),
            port: 0,
            conn_limit: 0,
            tls: None,
        }
    }
}

/// TLS material, either as file paths or inline PEM. The two forms are
/// mutually exclusive.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM).
    pub cert_path: Option<PathBuf>,

    /// Path to private key file (PEM).
    pub key_path: Option<PathBuf>,

    /// Inline certificate chain (PEM).
    pub cert_pem: Option<String>,

    /// Inline private key (PEM).
    pub key_pem: Option<String>,

    /// Whether clients must present a certificate.
    pub client_auth: ClientAuth,

    /// CA bundle client certificates are verified against (PEM file).
    pub client_ca_path: Option<PathBuf>,

    /// Inline CA bundle client certificates are verified against.
    pub client_ca_pem: Option<String>,
}

impl TlsConfig {
    pub fn has_client_ca(&self) -> bool {
        self.client_ca_path.is_some() || self.client_ca_pem.is_some()
    }
}

/// Client certificate policy of a TLS listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuth {
    /// Never ask for a client certificate.
    #[default]
    NoClientCert,
    /// Verify a certificate when one is presented.
    VerifyClientCertIfGiven,
    /// Reject clients without a valid certificate.
    RequireAndVerifyClientCert,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpServerConfig {
    /// Time allowed to read request headers, in seconds.
    pub read_timeout_secs: u64,

    /// Time allowed to produce a response, in seconds.
    pub write_timeout_secs: u64,

    /// Close connections with no request in flight for this long, in
    /// seconds. 0 keeps them open.
    pub idle_timeout_secs: u64,

    /// Mount the user router under this path. Empty mounts at the root.
    pub path_prefix: String,

    /// Serve `{path_prefix}/metrics` when a Prometheus handle is supplied.
    pub register_instrumentation: bool,

    /// Skip the built-in tracing, logging and instrumentation middleware.
    pub do_not_add_default_http_middleware: bool,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: 30,
            write_timeout_secs: 30,
            idle_timeout_secs: 120,
            path_prefix: String::new(),
            register_instrumentation: true,
            do_not_add_default_http_middleware: false,
        }
    }
}

impl HttpServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

/// gRPC server settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GrpcServerConfig {
    /// Largest accepted request message, in bytes.
    pub max_recv_msg_size: usize,

    /// Largest response message, in bytes.
    pub max_send_msg_size: usize,

    /// Streams allowed per HTTP/2 connection.
    pub max_concurrent_streams: u32,

    /// Interval between HTTP/2 keepalive pings, in seconds.
    pub keepalive_time_secs: u64,

    /// Time to wait for a keepalive ack, in seconds.
    pub keepalive_timeout_secs: u64,

    /// Close connections without active streams for this long, in seconds.
    /// Unset keeps them open.
    pub max_connection_idle_secs: Option<u64>,

    /// Ask connections to go away once they are this old, in seconds.
    /// Unset lets them live forever.
    pub max_connection_age_secs: Option<u64>,

    /// Time a connection past its maximum age gets to finish outstanding
    /// streams before it is closed, in seconds. Unset waits for them.
    pub max_connection_age_grace_secs: Option<u64>,
}

impl Default for GrpcServerConfig {
    fn default() -> Self {
        Self {
            max_recv_msg_size: 4 * 1024 * 1024,
            max_send_msg_size: 4 * 1024 * 1024,
            max_concurrent_streams: 100,
            keepalive_time_secs: 2 * 60 * 60,
            keepalive_timeout_secs: 20,
            max_connection_idle_secs: None,
            max_connection_age_secs: None,
            max_connection_age_grace_secs: None,
        }
    }
}

impl GrpcServerConfig {
    pub fn keepalive_time(&self) -> Duration {
        Duration::from_secs(self.keepalive_time_secs)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout_secs)
    }

    pub fn max_connection_idle(&self) -> Option<Duration> {
        self.max_connection_idle_secs.map(Duration::from_secs)
    }

    pub fn max_connection_age(&self) -> Option<Duration> {
        self.max_connection_age_secs.map(Duration::from_secs)
    }

    pub fn max_connection_age_grace(&self) -> Option<Duration> {
        self.max_connection_age_grace_secs.map(Duration::from_secs)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    pub level: String,

    pub format: LogFormat,

    /// Log successful requests at info instead of debug.
    pub log_request_at_info_level: bool,

    /// Do not log successful requests at all.
    pub disable_request_success_log: bool,

    /// Include request headers in request log lines.
    pub log_request_headers: bool,

    /// Extra header names never logged, on top of credentials and cookies.
    pub log_request_exclude_headers: Vec<String>,

    /// Add the client addresses to request log lines.
    pub log_source_ips: bool,

    /// Header holding the client address. Empty uses `X-Forwarded-For`,
    /// `X-Real-IP` and `Forwarded`.
    pub log_source_ips_header: String,

    /// Regex whose first group captures the address in
    /// `log_source_ips_header`. Required together with the header.
    pub log_source_ips_regex: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            log_request_at_info_level: false,
            disable_request_success_log: false,
            log_request_headers: false,
            log_request_exclude_headers: Vec::new(),
            log_source_ips: false,
            log_source_ips_header: String::new(),
            log_source_ips_regex: String::new(),
        }
    }
}
