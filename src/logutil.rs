//! Logging utilities for sanitizing multi-line message text and raw MQTT payloads so logs stay single-line.
//! Escapes control characters that otherwise break log readability.

/// Longest raw payload preview written next to a parse failure.
pub const PAYLOAD_PREVIEW_BYTES: usize = 200;

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
///   Truncates very long strings (over `max_preview`) with an ellipsis to cap log noise.
pub fn escape_log(s: &str) -> String {
    const MAX_PREVIEW: usize = 300;
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Render a raw MQTT payload for a log line: lossy UTF-8, at most
/// [`PAYLOAD_PREVIEW_BYTES`] bytes of input, escaped, with `...` when cut.
pub fn truncate_payload(payload: &[u8]) -> String {
    if payload.len() <= PAYLOAD_PREVIEW_BYTES {
        return escape_log(&String::from_utf8_lossy(payload));
    }
    let head = String::from_utf8_lossy(&payload[..PAYLOAD_PREVIEW_BYTES]);
    let mut out = escape_log(&head);
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::{escape_log, truncate_payload, PAYLOAD_PREVIEW_BYTES};

    #[test]
    fn escapes_newlines_and_truncates() {
        let s = "Line1\nLine2\r\tEnd";
        let esc = escape_log(s);
        assert_eq!(esc, "Line1\\nLine2\\r\\tEnd");
    }

    #[test]
    fn payload_preview_is_capped() {
        let raw = vec![b'a'; PAYLOAD_PREVIEW_BYTES * 2];
        let preview = truncate_payload(&raw);
        assert!(preview.ends_with("..."));
        assert_eq!(preview.len(), PAYLOAD_PREVIEW_BYTES + 3);
    }

    #[test]
    fn payload_preview_survives_invalid_utf8() {
        let preview = truncate_payload(&[0xff, b'{', b'\n']);
        assert!(preview.contains("{\\n"));
    }
}
