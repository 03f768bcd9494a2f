use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::address::{Address, NetLocation};

/// Outgoing socket writes are split into slices of this size to bound
/// individual write calls, matching the reference mux implementation.
pub const WRITE_CHUNK_SIZE: usize = 8192;

/// Open an outbound TCP connection. Hostnames resolve on tokio's
/// blocking pool; IP literals skip resolution entirely.
pub async fn connect(location: &NetLocation) -> std::io::Result<TcpStream> {
    let stream = match location.address() {
        Address::Hostname(host) => TcpStream::connect((host.as_str(), location.port())).await?,
        _ => TcpStream::connect(location.to_socket_addr()?).await?,
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}

pub async fn write_chunked<W>(writer: &mut W, data: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    for chunk in data.chunks(WRITE_CHUNK_SIZE) {
        writer.write_all(chunk).await?;
    }
    writer.flush().await?;
    Ok(())
}
