use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header;
use tracing::{debug, warn};

use crate::api::TransportError;

/// Network seam for batch delivery. The payload arrives serialized; the
/// transport owns headers, compression and the request itself.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST the payload and resolve to the response status code. Errors are
    /// connection-level failures with no status at all.
    async fn send(&self, endpoint: &str, body: Vec<u8>) -> Result<u16, TransportError>;

    /// Fire-and-forget handoff for teardown paths. Returns whether the
    /// payload was accepted for sending; the response is never observed.
    fn send_detached(&self, endpoint: &str, body: Vec<u8>) -> bool;
}

/// reqwest-backed transport with optional gzip request bodies.
pub struct ReqwestTransport {
    client: reqwest::Client,
    gzip: bool,
}

impl ReqwestTransport {
    pub fn new(request_timeout: Duration, gzip: bool) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(format!("beacon-rust/{}", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()
            .expect("failed to construct reqwest client for batch delivery");

        ReqwestTransport { client, gzip }
    }

    fn encode(&self, body: Vec<u8>) -> Result<(Vec<u8>, bool), TransportError> {
        if !self.gzip {
            return Ok((body, false));
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&body)?;
        Ok((encoder.finish()?, true))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, endpoint: &str, body: Vec<u8>) -> Result<u16, TransportError> {
        let (payload, gzipped) = self.encode(body)?;
        let mut request = self.client.post(endpoint).body(payload);
        if gzipped {
            request = request.header(header::CONTENT_ENCODING, "gzip");
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(response.status().as_u16())
    }

    fn send_detached(&self, endpoint: &str, body: Vec<u8>) -> bool {
        let (payload, gzipped) = match self.encode(body) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("failed to encode detached payload: {e}");
                return false;
            }
        };
        // a runtime is required to hand the request off; without one there
        // is nobody to drive the future
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("no async runtime available, dropping detached send");
                return false;
            }
        };

        let client = self.client.clone();
        let endpoint = endpoint.to_string();
        handle.spawn(async move {
            let mut request = client.post(&endpoint).body(payload);
            if gzipped {
                request = request.header(header::CONTENT_ENCODING, "gzip");
            }
            if let Err(e) = request.send().await {
                debug!("detached send to {endpoint} failed: {e}");
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn gzip_encoding_round_trips() {
        let transport = ReqwestTransport::new(Duration::from_secs(5), true);
        let (encoded, gzipped) = transport.encode(b"{\"ok\":true}".to_vec()).unwrap();
        assert!(gzipped);

        let mut decoder = flate2::read::GzDecoder::new(encoded.as_slice());
        let mut decoded = String::new();
        decoder.read_to_string(&mut decoded).unwrap();
        assert_eq!(decoded, "{\"ok\":true}");
    }

    #[test]
    fn plain_bodies_pass_through() {
        let transport = ReqwestTransport::new(Duration::from_secs(5), false);
        let (encoded, gzipped) = transport.encode(b"payload".to_vec()).unwrap();
        assert!(!gzipped);
        assert_eq!(encoded, b"payload");
    }
}
