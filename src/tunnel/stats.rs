//! Per-call notifications from the tunnel service.
//!
//! # Responsibilities
//! - Define the events a call goes through (begin, payload in/out, end)
//! - Recycle response body buffers once the reply is on the wire
//!
//! # Design Decisions
//! - The codec fires [`RpcStats::OutPayload`] right after serialization; that
//!   is the only point where the body is provably no longer referenced
//! - [`BufferRecycler`] is a decorator: the wrapped handler sees every event
//!   before the body is taken

use std::sync::Arc;

use crate::tunnel::pool::BufferPool;
use crate::tunnel::types::HttpResponse;

/// Events emitted during a tunneled call.
#[derive(Debug)]
pub enum RpcStats<'a> {
    /// The call was accepted by the service.
    Begin { method: &'a str },
    /// A request message was read off the wire.
    InPayload { method: &'a str, wire_length: usize },
    /// A response message has been serialized into the transport buffer.
    OutPayload {
        method: &'a str,
        payload: &'a mut HttpResponse,
        wire_length: usize,
    },
    /// The call finished, with the status it failed with if any.
    End {
        method: &'a str,
        error: Option<&'a tonic::Status>,
    },
}

/// Observer of tunnel call events.
pub trait StatsHandler: Send + Sync + 'static {
    fn handle_rpc(&self, stats: &mut RpcStats<'_>);
}

/// Decorator that returns response bodies to a [`BufferPool`].
pub struct BufferRecycler {
    inner: Option<Arc<dyn StatsHandler>>,
    pool: Arc<BufferPool>,
}

impl BufferRecycler {
    pub fn new(inner: Option<Arc<dyn StatsHandler>>, pool: Arc<BufferPool>) -> Self {
        Self { inner, pool }
    }
}

impl StatsHandler for BufferRecycler {
    fn handle_rpc(&self, stats: &mut RpcStats<'_>) {
        if let Some(inner) = &self.inner {
            inner.handle_rpc(stats);
        }
        if let RpcStats::OutPayload { payload, .. } = stats {
            self.pool.put(std::mem::take(&mut payload.body));
        }
    }
}
