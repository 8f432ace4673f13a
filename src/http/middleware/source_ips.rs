//! Client addresses for request logs.
//!
//! Behind a proxy the peer address is the proxy's. The original client is
//! taken from `X-Forwarded-For`, then `X-Real-IP`, then `Forwarded`; a custom
//! header can be named instead, together with a regex whose first group
//! captures the address.

use std::net::SocketAddr;

use http::HeaderMap;
use regex::Regex;
use thiserror::Error;

/// Matches the `for=` parameter of a `Forwarded` header.
const FORWARDED_FOR: &str = r#"(?i)(?:for=)([^(;|,| )]+)"#;

#[derive(Debug, Clone, Error)]
pub enum SourceIpsError {
    #[error("either both a header field and a regex have to be given or neither")]
    Incomplete,

    #[error("at least one regex group is required")]
    NoCaptureGroup,

    #[error("invalid source IP regex: {0}")]
    Regex(#[from] regex::Error),
}

/// Extracts the addresses a request came from.
#[derive(Debug, Clone)]
pub struct SourceIps {
    header: Option<String>,
    regex: Regex,
}

impl SourceIps {
    /// Empty `header` and `regex` select the standard proxy headers.
    pub fn new(header: &str, regex: &str) -> Result<Self, SourceIpsError> {
        match (header.is_empty(), regex.is_empty()) {
            (true, true) => Ok(Self {
                header: None,
                regex: Regex::new(FORWARDED_FOR)?,
            }),
            (false, false) => {
                let regex = Regex::new(regex)?;
                if regex.captures_len() < 2 {
                    return Err(SourceIpsError::NoCaptureGroup);
                }
                Ok(Self {
                    header: Some(header.to_ascii_lowercase()),
                    regex,
                })
            }
            _ => Err(SourceIpsError::Incomplete),
        }
    }

    /// `"<forwarded>, <peer>"` when a proxy reported a different client,
    /// otherwise just the peer IP.
    pub fn get(&self, headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
        let remote = remote.map(|addr| addr.ip().to_string()).unwrap_or_default();
        match self.forwarded(headers) {
            Some(forwarded) if !forwarded.is_empty() && forwarded != remote => {
                if remote.is_empty() {
                    forwarded
                } else {
                    format!("{forwarded}, {remote}")
                }
            }
            _ => remote,
        }
    }

    fn forwarded(&self, headers: &HeaderMap) -> Option<String> {
        if let Some(header) = &self.header {
            return self.first_group(header_str(headers, header)?);
        }
        if let Some(value) = header_str(headers, "x-forwarded-for") {
            return value.split(',').next().map(|first| first.trim().to_string());
        }
        if let Some(value) = header_str(headers, "x-real-ip") {
            return Some(value.trim().to_string());
        }
        header_str(headers, "forwarded")
            .and_then(|value| self.first_group(value))
            .map(|addr| addr.trim_matches('"').to_string())
    }

    fn first_group(&self, value: &str) -> Option<String> {
        self.regex
            .captures(value)
            .and_then(|captures| captures.get(1))
            .map(|m| m.as_str().to_string())
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
