pub use mailbox::Mailbox;

use crate::Bytes;

mod mailbox;

/// Formats bytes as 0x-prefixed lowercase hex.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Parses hex with or without a 0x prefix.
pub fn hex_to_bytes(s: &str) -> Result<Bytes, hex::FromHexError> {
    let trimmed = s.trim();
    let stripped = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if stripped.len() % 2 == 1 {
        return hex::decode(format!("0{stripped}")).map(Bytes::from);
    }
    hex::decode(stripped).map(Bytes::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_helpers() {
        assert_eq!(bytes_to_hex(&[0xde, 0xad]), "0xdead");
        assert_eq!(hex_to_bytes("0xdeadbeef").unwrap().to_vec(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(hex_to_bytes("abc").unwrap().to_vec(), vec![0x0a, 0xbc]);
        assert!(hex_to_bytes("0xzz").is_err());
    }
}
