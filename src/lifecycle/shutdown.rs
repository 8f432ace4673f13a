//! Shutdown coordination.

use tokio_util::sync::CancellationToken;

/// Per-protocol drain signals shared by a server's tasks.
///
/// Firing a protocol's token stops its accept loops (and the multiplexer,
/// for HTTP) and asks its sub-server to finish in-flight work.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    http: CancellationToken,
    grpc: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token watched by the HTTP feeder, the multiplexer and the HTTP server.
    pub fn http(&self) -> CancellationToken {
        self.http.clone()
    }

    /// Token watched by the gRPC feeder and the gRPC server.
    pub fn grpc(&self) -> CancellationToken {
        self.grpc.clone()
    }

    pub fn drain_http(&self) {
        self.http.cancel();
    }

    pub fn drain_grpc(&self) {
        self.grpc.cancel();
    }
}
