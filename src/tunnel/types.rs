//! Wire messages for HTTP-over-gRPC.
//!
//! Field numbers match the `httpgrpc` protocol so that peers speaking the
//! original `httpgrpc.HTTP/Handle` service can interoperate.

use http::{HeaderMap, HeaderName, HeaderValue};

/// Fully-qualified gRPC service name.
pub const SERVICE_NAME: &str = "httpgrpc.HTTP";

/// Path of the single unary method.
pub const HANDLE_PATH: &str = "/httpgrpc.HTTP/Handle";

/// A single header with all of its values. Key casing is kept verbatim.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct Header {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, repeated, tag = "2")]
    pub values: Vec<String>,
}

/// An HTTP request carried inside a gRPC call.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct HttpRequest {
    #[prost(string, tag = "1")]
    pub method: String,
    #[prost(string, tag = "2")]
    pub url: String,
    #[prost(message, repeated, tag = "3")]
    pub headers: Vec<Header>,
    #[prost(bytes = "vec", tag = "4")]
    pub body: Vec<u8>,
}

/// An HTTP response carried inside a gRPC reply or a status detail.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct HttpResponse {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(message, repeated, tag = "2")]
    pub headers: Vec<Header>,
    #[prost(bytes = "vec", tag = "3")]
    pub body: Vec<u8>,
}

impl prost::Name for HttpResponse {
    const NAME: &'static str = "HTTPResponse";
    const PACKAGE: &'static str = "httpgrpc";
}

impl HttpResponse {
    /// Build a response with a plain body and no headers.
    pub fn new(code: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            code: i32::from(code),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// True for 5xx codes.
    pub fn is_server_error(&self) -> bool {
        self.code / 100 == 5
    }
}

/// Encode an [`http::HeaderMap`] as an ordered header list, one entry per
/// distinct name in first-seen order.
///
/// Names are written in canonical form (`Content-Type`), since peers may
/// look entries up case-sensitively. Values that are not valid UTF-8 are
/// skipped.
pub fn headers_from_map(map: &HeaderMap) -> Vec<Header> {
    let mut headers: Vec<Header> = Vec::with_capacity(map.keys_len());
    for key in map.keys() {
        let values = map
            .get_all(key)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_owned)
            .collect();
        headers.push(Header {
            key: canonical_header_key(key.as_str()),
            values,
        });
    }
    headers
}

/// Uppercase the first letter and every letter after a `-`, lowercase the
/// rest.
pub fn canonical_header_key(name: &str) -> String {
    let mut upper = true;
    name.chars()
        .map(|c| {
            let out = if upper { c.to_ascii_uppercase() } else { c.to_ascii_lowercase() };
            upper = c == '-';
            out
        })
        .collect()
}

/// Append an encoded header list onto a [`HeaderMap`].
///
/// Entries with an invalid name or value are dropped with a debug log line
/// rather than failing the whole request.
pub fn extend_map(map: &mut HeaderMap, headers: &[Header]) {
    for header in headers {
        let name = match HeaderName::from_bytes(header.key.as_bytes()) {
            Ok(name) => name,
            Err(_) => {
                tracing::debug!(header = %header.key, "Dropping header with invalid name");
                continue;
            }
        };
        for value in &header.values {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    map.append(name.clone(), value);
                }
                Err(_) => {
                    tracing::debug!(header = %header.key, "Dropping header with invalid value");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn header_key_casing_survives_the_wire() {
        let resp = HttpResponse {
            code: 200,
            headers: vec![Header {
                key: "X-Custom-Thing".into(),
                values: vec!["a".into(), "b".into()],
            }],
            body: b"ok".to_vec(),
        };
        let decoded = HttpResponse::decode(resp.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.headers[0].key, "X-Custom-Thing");
        assert_eq!(decoded.headers[0].values, vec!["a", "b"]);
    }

    #[test]
    fn multi_valued_headers_are_grouped() {
        let mut map = HeaderMap::new();
        map.append("set-cookie", HeaderValue::from_static("a=1"));
        map.append("set-cookie", HeaderValue::from_static("b=2"));
        map.insert("content-type", HeaderValue::from_static("text/plain"));

        let headers = headers_from_map(&map);
        assert_eq!(headers.len(), 2);
        let cookies = headers.iter().find(|h| h.key == "Set-Cookie").unwrap();
        assert_eq!(cookies.values, vec!["a=1", "b=2"]);

        let mut back = HeaderMap::new();
        extend_map(&mut back, &headers);
        assert_eq!(back, map);
    }

    #[test]
    fn header_names_are_canonical() {
        assert_eq!(canonical_header_key("content-type"), "Content-Type");
        assert_eq!(canonical_header_key("x-b3-traceid"), "X-B3-Traceid");
        assert_eq!(canonical_header_key("WWW-AUTHENTICATE"), "Www-Authenticate");
        assert_eq!(canonical_header_key("etag"), "Etag");

        let mut map = HeaderMap::new();
        map.insert("x-request-id", HeaderValue::from_static("abc"));
        assert_eq!(headers_from_map(&map)[0].key, "X-Request-Id");
    }

    #[test]
    fn invalid_header_names_are_dropped() {
        let mut map = HeaderMap::new();
        extend_map(
            &mut map,
            &[Header {
                key: "bad header".into(),
                values: vec!["x".into()],
            }],
        );
        assert!(map.is_empty());
    }
}
