//! Inbound API keys: `sk-{machineId}-{keyId}-{crc8}` where the trailing
//! checksum is the first 8 hex chars of HMAC-SHA256(machineId‖keyId) under
//! the server secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedApiKey {
    pub machine_id: String,
    pub key_id: String,
    pub is_new_format: bool,
}

fn checksum(machine_id: &str, key_id: &str, server_secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(server_secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(machine_id.as_bytes());
    mac.update(key_id.as_bytes());
    let digest = mac.finalize().into_bytes();
    let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
    hex[..8].to_string()
}

pub fn format_api_key(machine_id: &str, key_id: &str, server_secret: &str) -> String {
    format!(
        "sk-{machine_id}-{key_id}-{}",
        checksum(machine_id, key_id, server_secret)
    )
}

/// Parse and verify a bearer key. Machine ids may themselves contain dashes,
/// so the key is read from the right: checksum, then key id, then the rest.
/// Keys without an embedded machine id parse as legacy
/// (`is_new_format = false`).
pub fn parse_api_key(key: &str, server_secret: &str) -> Option<ParsedApiKey> {
    let rest = key.strip_prefix("sk-")?;
    let (head, crc) = rest.rsplit_once('-')?;
    let crc_shaped = crc.len() == 8 && crc.chars().all(|c| c.is_ascii_hexdigit());
    let Some((machine_id, key_id)) = head.rsplit_once('-') else {
        return Some(legacy(head));
    };
    if !crc_shaped {
        return Some(legacy(rest));
    }
    if checksum(machine_id, key_id, server_secret) != crc {
        return None;
    }
    Some(ParsedApiKey {
        machine_id: machine_id.to_string(),
        key_id: key_id.to_string(),
        is_new_format: true,
    })
}

fn legacy(key_id: &str) -> ParsedApiKey {
    ParsedApiKey {
        machine_id: String::new(),
        key_id: key_id.to_string(),
        is_new_format: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "unit-test-secret";

    #[test]
    fn format_then_parse_roundtrips() {
        for (machine, key) in [
            ("m1", "k1"),
            ("machine-with-dashes", "key9"),
            ("0f3a", "a1b2"),
        ] {
            let formatted = format_api_key(machine, key, SECRET);
            let parsed = parse_api_key(&formatted, SECRET).unwrap();
            assert_eq!(parsed.machine_id, machine);
            assert_eq!(parsed.key_id, key);
            assert!(parsed.is_new_format);
        }
    }

    #[test]
    fn tampered_checksum_is_rejected() {
        let mut key = format_api_key("m1", "k1", SECRET);
        let last = key.pop().unwrap();
        key.push(if last == '0' { '1' } else { '0' });
        assert!(parse_api_key(&key, SECRET).is_none());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let key = format_api_key("m1", "k1", SECRET);
        assert!(parse_api_key(&key, "other-secret").is_none());
    }

    #[test]
    fn legacy_single_segment_keys_parse_as_legacy() {
        let parsed = parse_api_key("sk-justonekey", SECRET);
        assert!(parsed.is_none());
        let parsed = parse_api_key("sk-abc-def", SECRET).unwrap();
        assert!(!parsed.is_new_format);
        assert!(parsed.machine_id.is_empty());
    }
}
