//! Line framing.

use std::borrow::Cow;

/// Terminator appended to every outgoing line.
pub const LINE_TERMINATOR: &str = "\n";

/// Returns `line` with a terminator appended, unless it already ends with one.
pub fn ensure_terminated(line: &str) -> Cow<'_, str> {
    if line.ends_with(LINE_TERMINATOR) {
        Cow::Borrowed(line)
    } else {
        Cow::Owned(format!("{line}{LINE_TERMINATOR}"))
    }
}

/// Strips the delimiter from a raw line read off the wire.
///
/// Removes one trailing `\n`, then one trailing `\r`, then one leading `\r`
/// left over from a CRLF split. Nothing else is touched, so interior and
/// leading whitespace survive the round trip. Works on bytes so the length
/// of the content can be checked before it is decoded.
pub fn strip_terminator(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    line.strip_prefix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_terminated_appends_once() {
        assert_eq!(ensure_terminated("ping"), "ping\n");
        assert_eq!(ensure_terminated("ping\n"), "ping\n");
        assert!(matches!(ensure_terminated("ping\n"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_strip_terminator_variants() {
        assert_eq!(strip_terminator(b"ping\n"), b"ping");
        assert_eq!(strip_terminator(b"ping\r\n"), b"ping");
        assert_eq!(strip_terminator(b"\rping\n"), b"ping");
        assert_eq!(strip_terminator(b"ping"), b"ping");
    }

    #[test]
    fn test_strip_terminator_keeps_content_whitespace() {
        assert_eq!(strip_terminator(b"  two  words \n"), b"  two  words ");
        assert_eq!(strip_terminator(b"ping\n\n"), b"ping\n");
    }

    #[test]
    fn test_added_terminator_is_exactly_what_is_stripped() {
        for original in ["ping", "Echo: x", " padded ", ""] {
            let framed = ensure_terminated(original);
            assert_eq!(strip_terminator(framed.as_bytes()), original.as_bytes());
        }
    }
}
