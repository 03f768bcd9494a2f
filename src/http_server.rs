// Plain-TCP HTTP acceptor: hand-parsed requests, hand-formatted
// responses. WebSocket upgrades go to the tunnel dispatcher; a small
// key-gated JSON API covers the rest. TLS stays in front of us.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use log::{debug, error, info};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

use crate::tunnel::{run_tunnel, TunnelContext};
use crate::websocket::{create_websocket_key_response, decode_early_data, WsReader, WsWriter};

const MAX_REQUEST_HEADER: usize = 16384;
const MAX_HEADER_LINES: usize = 64;

pub async fn start_server(ctx: Arc<TunnelContext>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(ctx.config.listen_addr).await?;
    info!("listening on {}", ctx.config.listen_addr);
    run_listener(listener, ctx).await
}

pub async fn run_listener(
    listener: tokio::net::TcpListener,
    ctx: Arc<TunnelContext>,
) -> std::io::Result<()> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Accept failed: {e}");
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            error!("Failed to set TCP nodelay: {e}");
        }

        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = process_connection(stream, peer, ctx).await {
                debug!("{} finished with error: {:?}", peer, e);
            } else {
                debug!("{} finished", peer);
            }
        });
    }
}

struct ParsedRequest {
    method: String,
    path: String,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
    /// Bytes that arrived after the header block (a client may pipeline
    /// WebSocket frames behind the upgrade request).
    leftover: Vec<u8>,
}

async fn read_request(stream: &mut TcpStream) -> std::io::Result<ParsedRequest> {
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut tmp = [0u8; 2048];
    let header_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_REQUEST_HEADER {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "http request header too large",
            ));
        }
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-request",
            ));
        }
        buf.extend_from_slice(&tmp[..n]);
    };

    let leftover = buf[header_end + 4..].to_vec();
    let header_text = std::str::from_utf8(&buf[..header_end])
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "non-utf8 request"))?;

    let mut lines = header_text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "empty request"))?;

    let mut parts = request_line.split(' ');
    let method = parts
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    let target = parts.next().unwrap_or_default();
    let version = parts.next().unwrap_or_default();
    if method.is_empty() || target.is_empty() || !version.starts_with("HTTP/1.") {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid request line: {}", request_line),
        ));
    }

    let (path, query) = split_target(target);

    // don't use a fast hasher for unvalidated user data
    let mut headers = HashMap::new();
    for (count, line) in lines.enumerate() {
        if count >= MAX_HEADER_LINES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "http request has too many headers",
            ));
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid header line: {}", line),
            ));
        };
        headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    Ok(ParsedRequest {
        method,
        path,
        query,
        headers,
        leftover,
    })
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn split_target(target: &str) -> (String, HashMap<String, String>) {
    let (path, raw_query) = match target.split_once('?') {
        Some((path, raw_query)) => (path, raw_query),
        None => (target, ""),
    };
    let mut query = HashMap::new();
    for pair in raw_query.split('&').filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some((key, value)) => query.insert(key.to_string(), value.to_string()),
            None => query.insert(pair.to_string(), String::new()),
        };
    }
    (path.to_string(), query)
}

fn is_websocket_upgrade(request: &ParsedRequest) -> bool {
    request
        .headers
        .get("upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

fn http_response(status: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut response = format!(
        concat!(
            "HTTP/1.1 {}\r\n",
            "Content-Type: {}\r\n",
            "Content-Length: {}\r\n",
            "Connection: close\r\n",
            "\r\n"
        ),
        status,
        content_type,
        body.len(),
    )
    .into_bytes();
    response.extend_from_slice(body);
    response
}

fn json_response(status: &str, body: &serde_json::Value) -> Vec<u8> {
    http_response(status, "application/json", body.to_string().as_bytes())
}

/// API auth: `X-API-Key`, `Authorization: Bearer`, or `?key=` against
/// the configured secret. No configured secret means nobody gets in.
fn check_api_key(request: &ParsedRequest, configured: Option<&str>) -> Result<(), Vec<u8>> {
    let Some(configured) = configured else {
        return Err(json_response(
            "401 Unauthorized",
            &serde_json::json!({"error": "API_KEY not configured"}),
        ));
    };

    let presented = request
        .headers
        .get("x-api-key")
        .cloned()
        .or_else(|| {
            request
                .headers
                .get("authorization")
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|v| v.trim().to_string())
        })
        .or_else(|| request.query.get("key").cloned());

    match presented {
        Some(key) if key == configured => Ok(()),
        _ => Err(json_response(
            "401 Unauthorized",
            &serde_json::json!({"error": "Unauthorized"}),
        )),
    }
}

async fn process_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<TunnelContext>,
) -> std::io::Result<()> {
    let request = read_request(&mut stream).await?;

    if is_websocket_upgrade(&request) {
        return upgrade_websocket(stream, request, ctx).await;
    }

    let response = route_plain(&request, peer, &ctx).await;
    stream.write_all(&response).await?;
    stream.flush().await?;
    Ok(())
}

async fn route_plain(
    request: &ParsedRequest,
    peer: SocketAddr,
    ctx: &Arc<TunnelContext>,
) -> Vec<u8> {
    if request.method != "GET" {
        return http_response("404 Not Found", "text/plain", b"Not Found");
    }

    match request.path.as_str() {
        "/" => json_response(
            "200 OK",
            &serde_json::json!({
                "service": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
                "now": crate::auth::unix_now(),
                "remote": peer.to_string(),
            }),
        ),
        "/api/uuids" => match check_api_key(request, ctx.config.api_key.as_deref()) {
            Err(denied) => denied,
            Ok(()) => {
                let merged = ctx.auth.get_merged().await;
                json_response("200 OK", &serde_json::json!({ "uuids": merged }))
            }
        },
        "/api/uuids/refresh" => match check_api_key(request, ctx.config.api_key.as_deref()) {
            Err(denied) => denied,
            Ok(()) => {
                let merged = ctx.auth.refresh().await;
                json_response("200 OK", &serde_json::json!({ "count": merged.len() }))
            }
        },
        "/api/stats" => match check_api_key(request, ctx.config.api_key.as_deref()) {
            Err(denied) => denied,
            Ok(()) => json_response("200 OK", &ctx.server_stats.snapshot()),
        },
        _ => http_response("404 Not Found", "text/plain", b"Not Found"),
    }
}

async fn upgrade_websocket(
    mut stream: TcpStream,
    request: ParsedRequest,
    ctx: Arc<TunnelContext>,
) -> std::io::Result<()> {
    let Some(key) = request.headers.get("sec-websocket-key") else {
        let response = http_response("404 Not Found", "text/plain", b"Not Found");
        stream.write_all(&response).await?;
        return Ok(());
    };

    // 0-RTT early data rides in on the subprotocol header; a value that
    // does not decode aborts the connection before the upgrade.
    let protocol = request.headers.get("sec-websocket-protocol").cloned();
    let early_data = match protocol {
        Some(ref value) => Some(decode_early_data(value)?),
        None => None,
    };

    let mut response = String::with_capacity(256);
    response.push_str("HTTP/1.1 101 Switching Protocols\r\n");
    response.push_str("Upgrade: websocket\r\nConnection: Upgrade\r\n");
    response.push_str("Sec-WebSocket-Accept: ");
    response.push_str(&create_websocket_key_response(key));
    response.push_str("\r\n");
    if let Some(ref value) = protocol {
        response.push_str("Sec-WebSocket-Protocol: ");
        response.push_str(value);
        response.push_str("\r\n");
    }
    response.push_str("\r\n");
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;

    let (read_half, write_half) = stream.into_split();
    let reader = WsReader::new(PrefixedReader::new(request.leftover, read_half));
    let writer = WsWriter::new(write_half);
    run_tunnel(reader, writer, early_data, ctx).await
}

/// An AsyncRead that yields buffered bytes (read past the HTTP header)
/// before the underlying stream.
struct PrefixedReader<R> {
    prefix: Vec<u8>,
    offset: usize,
    inner: R,
}

impl<R> PrefixedReader<R> {
    fn new(prefix: Vec<u8>, inner: R) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<R> AsyncRead for PrefixedReader<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.offset < this.prefix.len() {
            let available = &this.prefix[this.offset..];
            let take = std::cmp::min(available.len(), buf.remaining());
            buf.put_slice(&available[..take]);
            this.offset += take;
            if this.offset == this.prefix.len() {
                this.prefix = Vec::new();
                this.offset = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}
