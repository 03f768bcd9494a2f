mod stream;

pub use stream::{WsMessage, WsReader, WsWriter};

use aws_lc_rs::digest::{digest, SHA1_FOR_LEGACY_USE_ONLY};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

/// RFC 6455 accept-key derivation for the 101 response.
pub fn create_websocket_key_response(key: &str) -> String {
    const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
    let mut input = key.as_bytes().to_vec();
    input.extend_from_slice(WS_GUID);
    let hash = digest(&SHA1_FOR_LEGACY_USE_ONLY, &input);
    BASE64.encode(hash.as_ref())
}

/// Decode the 0-RTT early data a client smuggles through the
/// `Sec-WebSocket-Protocol` header: base64 with the url-safe alphabet,
/// padding optional.
pub fn decode_early_data(value: &str) -> std::io::Result<Vec<u8>> {
    let normalized = value.replace('+', "-").replace('/', "_").replace('=', "");
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(normalized)
        .map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid early data: {}", e),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_key_rfc_example() {
        // The worked example from RFC 6455 §1.3.
        assert_eq!(
            create_websocket_key_response("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_decode_early_data_urlsafe() {
        assert_eq!(decode_early_data("aGVsbG8").unwrap(), b"hello");
        assert_eq!(decode_early_data("aGVsbG8=").unwrap(), b"hello");
        // Standard-alphabet input is normalized before decoding.
        assert_eq!(decode_early_data("-_-_").unwrap(), decode_early_data("+/+/").unwrap());
        assert!(decode_early_data("!!!").is_err());
    }
}
