//! gRPC codec for the tunnel service.
//!
//! Plain prost encoding, plus payload notifications so the response body can
//! be recycled as soon as it has been copied into the frame buffer.

use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Buf;
use prost::Message;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::Status;

use crate::tunnel::stats::{RpcStats, StatsHandler};
use crate::tunnel::types::{HttpRequest, HttpResponse};

/// Server-side codec decoding [`HttpRequest`] and encoding [`HttpResponse`].
#[derive(Clone)]
pub struct TunnelCodec {
    method: &'static str,
    stats: Arc<dyn StatsHandler>,
}

impl TunnelCodec {
    pub fn new(method: &'static str, stats: Arc<dyn StatsHandler>) -> Self {
        Self { method, stats }
    }
}

impl Codec for TunnelCodec {
    type Encode = HttpResponse;
    type Decode = HttpRequest;
    type Encoder = ResponseEncoder;
    type Decoder = RequestDecoder<HttpRequest>;

    fn encoder(&mut self) -> Self::Encoder {
        ResponseEncoder {
            method: self.method,
            stats: Arc::clone(&self.stats),
        }
    }

    fn decoder(&mut self) -> Self::Decoder {
        RequestDecoder {
            method: self.method,
            stats: Arc::clone(&self.stats),
            _message: PhantomData,
        }
    }
}

pub struct ResponseEncoder {
    method: &'static str,
    stats: Arc<dyn StatsHandler>,
}

impl Encoder for ResponseEncoder {
    type Item = HttpResponse;
    type Error = Status;

    fn encode(&mut self, mut item: Self::Item, buf: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        let wire_length = item.encoded_len();
        item.encode(buf)
            .map_err(|e| Status::internal(format!("encoding response: {e}")))?;

        self.stats.handle_rpc(&mut RpcStats::OutPayload {
            method: self.method,
            payload: &mut item,
            wire_length,
        });
        Ok(())
    }
}

pub struct RequestDecoder<M> {
    method: &'static str,
    stats: Arc<dyn StatsHandler>,
    _message: PhantomData<fn() -> M>,
}

impl<M: Message + Default> Decoder for RequestDecoder<M> {
    type Item = M;
    type Error = Status;

    fn decode(&mut self, buf: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let wire_length = buf.remaining();
        let item = M::decode(buf).map_err(|e| Status::internal(format!("decoding request: {e}")))?;

        self.stats.handle_rpc(&mut RpcStats::InPayload {
            method: self.method,
            wire_length,
        });
        Ok(Some(item))
    }
}
