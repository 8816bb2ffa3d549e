//! User override parsing (§4.4 layer 6, §6.4, ambient A.3).
//!
//! The core never reads the environment itself — a collaborator extracts
//! the already-decided environment variable's value and hands the string to
//! [`parse_overrides`]. This keeps the transport core free of ambient
//! process state while still implementing the exact syntax §6.4 specifies.

/// Parsed user overrides; every field is `None` unless the corresponding key
/// was present and well-formed. Unknown keys and malformed `key=value`
/// pairs are silently ignored (§6.4).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserOverrides {
    pub max_chunk_bytes: Option<u32>,
    pub io_timeout_ms: Option<u32>,
    pub handshake_timeout_ms: Option<u32>,
    pub inactivity_timeout_ms: Option<u32>,
    pub overall_deadline_ms: Option<u32>,
    pub stabilize_ms: Option<u32>,
    pub disable_partial_read: Option<bool>,
    pub disable_partial_write: Option<bool>,
}

/// Parses a comma-separated `key=value` list into [`UserOverrides`] (§4.4,
/// §6.4). Recognised keys: `maxChunkBytes`, `ioTimeoutMs`,
/// `handshakeTimeoutMs`, `inactivityTimeoutMs`, `overallDeadlineMs`,
/// `stabilizeMs`, `disablePartialRead`, `disablePartialWrite`.
pub fn parse_overrides(raw: &str) -> UserOverrides {
    let mut out = UserOverrides::default();
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        match key {
            "maxChunkBytes" => out.max_chunk_bytes = value.parse().ok(),
            "ioTimeoutMs" => out.io_timeout_ms = value.parse().ok(),
            "handshakeTimeoutMs" => out.handshake_timeout_ms = value.parse().ok(),
            "inactivityTimeoutMs" => out.inactivity_timeout_ms = value.parse().ok(),
            "overallDeadlineMs" => out.overall_deadline_ms = value.parse().ok(),
            "stabilizeMs" => out.stabilize_ms = value.parse().ok(),
            "disablePartialRead" => out.disable_partial_read = parse_bool(value),
            "disablePartialWrite" => out.disable_partial_write = parse_bool(value),
            _ => {} // unrecognised key, ignored per §4.4
        }
    }
    out
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_recognised_keys() {
        let o = parse_overrides("maxChunkBytes=2097152,ioTimeoutMs=7000");
        assert_eq!(o.max_chunk_bytes, Some(2_097_152));
        assert_eq!(o.io_timeout_ms, Some(7000));
    }

    #[test]
    fn ignores_unknown_keys_and_malformed_pairs() {
        let o = parse_overrides("bogusKey=1,noEqualsSign,maxChunkBytes=,stabilizeMs=10");
        assert_eq!(o.max_chunk_bytes, None);
        assert_eq!(o.stabilize_ms, Some(10));
    }

    #[test]
    fn parses_bool_flags() {
        let o = parse_overrides("disablePartialRead=true,disablePartialWrite=0");
        assert_eq!(o.disable_partial_read, Some(true));
        assert_eq!(o.disable_partial_write, Some(false));
    }

    #[test]
    fn empty_string_yields_defaults() {
        assert_eq!(parse_overrides(""), UserOverrides::default());
    }
}
