// Message-level RFC 6455 framing, server side. The tunnel consumes
// WebSocket messages as whole chunks (the UDP/DNS splitter depends on
// the message boundary), so this reads complete messages rather than
// presenting a coalesced byte stream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard ceiling on one message; anything larger is a protocol error.
const MAX_MESSAGE_SIZE: u64 = 16 * 1024 * 1024;

/// Control frames carry at most 125 payload bytes.
const MAX_CONTROL_SIZE: u64 = 125;

const OPCODE_CONTINUE: u8 = 0x0;
const OPCODE_TEXT: u8 = 0x1;
const OPCODE_BINARY: u8 = 0x2;
const OPCODE_CLOSE: u8 = 0x8;
const OPCODE_PING: u8 = 0x9;
const OPCODE_PONG: u8 = 0xa;

#[derive(Debug, PartialEq, Eq)]
pub enum WsMessage {
    /// Text frames are tolerated and handed over as bytes; the tunnel
    /// payload is opaque either way.
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Close,
}

pub struct WsReader<R> {
    stream: R,
    /// Accumulates a fragmented data message across frames.
    fragment: Option<Vec<u8>>,
}

impl<R> WsReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(stream: R) -> Self {
        Self {
            stream,
            fragment: None,
        }
    }

    /// Next complete message, or `None` on a clean close of the
    /// underlying stream between frames. Pongs are consumed silently.
    pub async fn read_message(&mut self) -> std::io::Result<Option<WsMessage>> {
        loop {
            let mut header = [0u8; 2];
            // EOF is only clean on a frame boundary.
            let n = self.stream.read(&mut header[..1]).await?;
            if n == 0 {
                return Ok(None);
            }
            self.stream.read_exact(&mut header[1..2]).await?;

            let fin = header[0] & 0x80 != 0;
            let opcode = header[0] & 0x0f;
            let masked = header[1] & 0x80 != 0;

            let mut length = (header[1] & 0x7f) as u64;
            if length == 126 {
                let mut ext = [0u8; 2];
                self.stream.read_exact(&mut ext).await?;
                length = u16::from_be_bytes(ext) as u64;
            } else if length == 127 {
                let mut ext = [0u8; 8];
                self.stream.read_exact(&mut ext).await?;
                length = u64::from_be_bytes(ext);
            }

            let is_control = opcode & 0x8 != 0;
            let limit = if is_control {
                MAX_CONTROL_SIZE
            } else {
                MAX_MESSAGE_SIZE
            };
            if length > limit {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("frame of {} bytes exceeds limit", length),
                ));
            }
            if is_control && !fin {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "fragmented control frame",
                ));
            }

            let mut mask = [0u8; 4];
            if masked {
                self.stream.read_exact(&mut mask).await?;
            }

            let mut payload = crate::util::allocate_vec(length as usize);
            self.stream.read_exact(&mut payload).await?;
            if masked {
                for (i, byte) in payload.iter_mut().enumerate() {
                    *byte ^= mask[i % 4];
                }
            }

            match opcode {
                OPCODE_BINARY | OPCODE_TEXT => {
                    if self.fragment.is_some() {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "new data frame inside a fragmented message",
                        ));
                    }
                    if fin {
                        return Ok(Some(WsMessage::Binary(payload)));
                    }
                    self.fragment = Some(payload);
                }
                OPCODE_CONTINUE => {
                    let Some(ref mut accumulated) = self.fragment else {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "continuation frame without a message",
                        ));
                    };
                    if accumulated.len() as u64 + length > MAX_MESSAGE_SIZE {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "fragmented message exceeds limit",
                        ));
                    }
                    accumulated.extend_from_slice(&payload);
                    if fin {
                        return Ok(Some(WsMessage::Binary(self.fragment.take().unwrap())));
                    }
                }
                OPCODE_CLOSE => return Ok(Some(WsMessage::Close)),
                OPCODE_PING => return Ok(Some(WsMessage::Ping(payload))),
                OPCODE_PONG => continue,
                other => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("unsupported frame opcode: {}", other),
                    ));
                }
            }
        }
    }
}

pub struct WsWriter<W> {
    stream: W,
}

impl<W> WsWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(stream: W) -> Self {
        Self { stream }
    }

    /// One payload, one binary message. Server frames are unmasked.
    pub async fn write_binary(&mut self, payload: &[u8]) -> std::io::Result<()> {
        self.write_frame(OPCODE_BINARY, payload).await
    }

    pub async fn write_pong(&mut self, payload: &[u8]) -> std::io::Result<()> {
        self.write_frame(OPCODE_PONG, payload).await
    }

    pub async fn write_close(&mut self) -> std::io::Result<()> {
        self.write_frame(OPCODE_CLOSE, &[]).await
    }

    async fn write_frame(&mut self, opcode: u8, payload: &[u8]) -> std::io::Result<()> {
        let mut header = [0u8; 10];
        header[0] = opcode | 0x80;
        let header_len = if payload.len() < 126 {
            header[1] = payload.len() as u8;
            2
        } else if payload.len() <= 65535 {
            header[1] = 0x7e;
            header[2..4].copy_from_slice(&(payload.len() as u16).to_be_bytes());
            4
        } else {
            header[1] = 0x7f;
            header[2..10].copy_from_slice(&(payload.len() as u64).to_be_bytes());
            10
        };
        self.stream.write_all(&header[..header_len]).await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.stream.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Client-side frame packer for tests: masked, as a browser or proxy
    /// client would send.
    fn pack_client_frame(opcode: u8, fin: bool, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(opcode | if fin { 0x80 } else { 0 });
        let mask = [0x11u8, 0x22, 0x33, 0x44];
        if payload.len() < 126 {
            out.push(0x80 | payload.len() as u8);
        } else if payload.len() <= 65535 {
            out.push(0x80 | 0x7e);
            out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        } else {
            out.push(0x80 | 0x7f);
            out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        }
        out.extend_from_slice(&mask);
        for (i, &b) in payload.iter().enumerate() {
            out.push(b ^ mask[i % 4]);
        }
        out
    }

    #[tokio::test]
    async fn test_read_masked_binary() {
        let bytes = pack_client_frame(OPCODE_BINARY, true, b"hello");
        let mut reader = WsReader::new(std::io::Cursor::new(bytes));
        assert_eq!(
            reader.read_message().await.unwrap().unwrap(),
            WsMessage::Binary(b"hello".to_vec())
        );
        assert!(reader.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_extended_length() {
        let payload = vec![0x5au8; 300];
        let bytes = pack_client_frame(OPCODE_BINARY, true, &payload);
        let mut reader = WsReader::new(std::io::Cursor::new(bytes));
        assert_eq!(
            reader.read_message().await.unwrap().unwrap(),
            WsMessage::Binary(payload)
        );
    }

    #[tokio::test]
    async fn test_read_fragmented_message() {
        let mut bytes = pack_client_frame(OPCODE_BINARY, false, b"hel");
        bytes.extend_from_slice(&pack_client_frame(OPCODE_CONTINUE, true, b"lo"));
        let mut reader = WsReader::new(std::io::Cursor::new(bytes));
        assert_eq!(
            reader.read_message().await.unwrap().unwrap(),
            WsMessage::Binary(b"hello".to_vec())
        );
    }

    #[tokio::test]
    async fn test_ping_and_close() {
        let mut bytes = pack_client_frame(OPCODE_PING, true, b"hi");
        bytes.extend_from_slice(&pack_client_frame(OPCODE_CLOSE, true, &[]));
        let mut reader = WsReader::new(std::io::Cursor::new(bytes));
        assert_eq!(
            reader.read_message().await.unwrap().unwrap(),
            WsMessage::Ping(b"hi".to_vec())
        );
        assert_eq!(
            reader.read_message().await.unwrap().unwrap(),
            WsMessage::Close
        );
    }

    #[tokio::test]
    async fn test_pong_is_discarded() {
        let mut bytes = pack_client_frame(OPCODE_PONG, true, &[]);
        bytes.extend_from_slice(&pack_client_frame(OPCODE_BINARY, true, b"x"));
        let mut reader = WsReader::new(std::io::Cursor::new(bytes));
        assert_eq!(
            reader.read_message().await.unwrap().unwrap(),
            WsMessage::Binary(b"x".to_vec())
        );
    }

    #[tokio::test]
    async fn test_stray_continuation_is_error() {
        let bytes = pack_client_frame(OPCODE_CONTINUE, true, b"x");
        let mut reader = WsReader::new(std::io::Cursor::new(bytes));
        assert!(reader.read_message().await.is_err());
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let (client, server) = tokio::io::duplex(1 << 20);
        let (client_read, _client_write) = tokio::io::split(client);
        let (_server_read, server_write) = tokio::io::split(server);

        let mut writer = WsWriter::new(server_write);
        let mut reader = WsReader::new(client_read);

        // Server frames are unmasked; make sure the reader accepts them
        // and lengths survive the 126 boundary.
        for size in [0usize, 1, 125, 126, 65535, 65536] {
            let payload = vec![0xc3u8; size];
            writer.write_binary(&payload).await.unwrap();
            assert_eq!(
                reader.read_message().await.unwrap().unwrap(),
                WsMessage::Binary(payload)
            );
        }
    }
}
