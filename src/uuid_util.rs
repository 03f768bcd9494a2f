use std::fmt::Write;

/// Parse a UUID string (with or without dashes) into 16 bytes.
#[inline]
pub fn parse_uuid(uuid_str: &str) -> std::io::Result<[u8; 16]> {
    let mut bytes = [0u8; 16];
    let mut count = 0usize;
    let mut first_nibble: Option<u8> = None;
    for &c in uuid_str.as_bytes() {
        let hex = match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'f' => c - b'a' + 10,
            b'A'..=b'F' => c - b'A' + 10,
            b'-' => continue,
            _ => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Invalid uuid: {uuid_str}"),
                ));
            }
        };
        if let Some(first) = first_nibble.take() {
            if count == 16 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Invalid uuid: {uuid_str}"),
                ));
            }
            bytes[count] = (first << 4) | hex;
            count += 1;
        } else {
            first_nibble = Some(hex);
        }
    }
    if first_nibble.is_some() || count != 16 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Invalid uuid: {uuid_str}"),
        ));
    }
    Ok(bytes)
}

/// Render 16 bytes as the canonical lowercase hyphenated form.
#[inline]
pub fn format_uuid(bytes: &[u8; 16]) -> String {
    let mut s = String::with_capacity(36);
    for (i, &b) in bytes.iter().enumerate() {
        if i == 4 || i == 6 || i == 8 || i == 10 {
            s.push('-');
        }
        write!(s, "{:02x}", b).unwrap();
    }
    s
}

/// Normalize any accepted UUID spelling to the canonical lowercase
/// hyphenated form. Errors on strings that are not UUIDs at all.
#[inline]
pub fn normalize_uuid(uuid_str: &str) -> std::io::Result<String> {
    let bytes = parse_uuid(uuid_str)?;
    Ok(format_uuid(&bytes))
}

/// Cheap validity check without allocating.
#[inline]
pub fn is_valid_uuid(uuid_str: &str) -> bool {
    parse_uuid(uuid_str).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uuid_with_dashes() {
        let bytes = parse_uuid("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(bytes[0], 0x55);
        assert_eq!(bytes[15], 0x00);
    }

    #[test]
    fn test_parse_uuid_without_dashes() {
        let bytes = parse_uuid("550e8400e29b41d4a716446655440000").unwrap();
        assert_eq!(bytes[1], 0x0e);
    }

    #[test]
    fn test_parse_uuid_rejects_garbage() {
        assert!(parse_uuid("not-a-uuid").is_err());
        assert!(parse_uuid("").is_err());
        assert!(parse_uuid("550e8400e29b41d4a71644665544000").is_err());
        assert!(parse_uuid("550e8400e29b41d4a7164466554400001").is_err());
    }

    #[test]
    fn test_format_round_trip() {
        let s = "550e8400-e29b-41d4-a716-446655440000";
        assert_eq!(format_uuid(&parse_uuid(s).unwrap()), s);
    }

    #[test]
    fn test_normalize_uppercase_and_undashed() {
        assert_eq!(
            normalize_uuid("550E8400E29B41D4A716446655440000").unwrap(),
            "550e8400-e29b-41d4-a716-446655440000"
        );
    }
}
