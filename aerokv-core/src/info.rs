//! The text-based info protocol.
//!
//! Info requests ride in a proto frame of type 1: newline-terminated
//! command names out, `name\tvalue\n` lines back. The cluster tracker
//! uses it for discovery and health; task handles poll job status
//! through it.

use std::collections::HashMap;

use bytes::{BufMut, BytesMut};

use crate::error::{AerokvError, Result};
use crate::protocol::constants::msg_type;
use crate::protocol::ProtoFrame;

/// Builds an info request frame for the given command names.
pub fn build_request(commands: &[&str]) -> ProtoFrame {
    let mut payload = BytesMut::new();
    for command in commands {
        payload.put_slice(command.as_bytes());
        payload.put_u8(b'\n');
    }
    ProtoFrame {
        msg_type: msg_type::INFO,
        payload,
    }
}

/// Parses an info response payload into a name-to-value map.
///
/// Lines without a tab separator (bare acknowledgements) map to an
/// empty value. A value beginning with `ERROR:` or `FAIL:` is kept
/// verbatim; callers decide whether that is fatal for their command.
pub fn parse_response(payload: &[u8]) -> Result<HashMap<String, String>> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| AerokvError::Protocol(format!("info response is not UTF-8: {}", e)))?;
    let mut values = HashMap::new();
    for line in text.split('\n') {
        if line.is_empty() {
            continue;
        }
        match line.split_once('\t') {
            Some((name, value)) => values.insert(name.to_string(), value.to_string()),
            None => values.insert(line.to_string(), String::new()),
        };
    }
    Ok(values)
}

/// True if an info value signals a server-side error.
pub fn is_error_value(value: &str) -> bool {
    let upper = value.to_ascii_uppercase();
    upper.starts_with("ERROR") || upper.starts_with("FAIL")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_payload_is_newline_separated() {
        let frame = build_request(&["node", "peers-clear-std"]);
        assert_eq!(frame.msg_type, msg_type::INFO);
        assert_eq!(&frame.payload[..], b"node\npeers-clear-std\n");
    }

    #[test]
    fn response_parses_tab_pairs() {
        let values = parse_response(b"node\tBB9\npartition-generation\t42\n").unwrap();
        assert_eq!(values["node"], "BB9");
        assert_eq!(values["partition-generation"], "42");
    }

    #[test]
    fn bare_line_maps_to_empty_value() {
        let values = parse_response(b"ok\n").unwrap();
        assert_eq!(values["ok"], "");
    }

    #[test]
    fn error_values_detected() {
        assert!(is_error_value("ERROR:4:bad param"));
        assert!(is_error_value("FAIL:200:index not found"));
        assert!(!is_error_value("42"));
    }

    #[test]
    fn non_utf8_rejected() {
        assert!(matches!(
            parse_response(&[0xff, 0xfe]),
            Err(AerokvError::Protocol(_))
        ));
    }
}
