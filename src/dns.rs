use std::time::Duration;

use bytes::Bytes;
use http::{header, Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use tokio::time::timeout;

use crate::http_client::HttpsClient;

const DOH_CONTENT_TYPE: &str = "application/dns-message";

/// Upper bound on a single DoH exchange.
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// RFC 8484 client: raw DNS wire queries POSTed to a DoH endpoint.
#[derive(Clone)]
pub struct DohClient {
    client: HttpsClient,
    uri: Uri,
}

impl DohClient {
    pub fn new(client: HttpsClient, endpoint: &str) -> std::io::Result<Self> {
        let uri: Uri = endpoint.parse().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid DoH endpoint {}: {}", endpoint, e),
            )
        })?;
        if uri.scheme_str() != Some("https") {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("DoH endpoint must be https: {}", endpoint),
            ));
        }
        Ok(Self { client, uri })
    }

    /// Forward one wire-format DNS query, returning the wire-format
    /// response body.
    pub async fn query(&self, packet: &[u8]) -> std::io::Result<Vec<u8>> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(self.uri.clone())
            .header(header::CONTENT_TYPE, DOH_CONTENT_TYPE)
            .header(header::ACCEPT, DOH_CONTENT_TYPE)
            .header(header::CONTENT_LENGTH, packet.len())
            .body(Full::new(Bytes::copy_from_slice(packet)))
            .map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("failed to build DoH request: {}", e),
                )
            })?;

        let response = timeout(QUERY_TIMEOUT, self.client.request(request))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "DoH request timed out")
            })?
            .map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("DoH request failed: {}", e),
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("DoH endpoint returned {}", status),
            ));
        }

        let body = timeout(QUERY_TIMEOUT, response.into_body().collect())
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "DoH response timed out")
            })?
            .map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("failed to read DoH response: {}", e),
                )
            })?;

        Ok(body.to_bytes().to_vec())
    }
}
