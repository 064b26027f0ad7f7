//! Parsing of client lines into commands.

/// The line a client sends to end its session (matched case-insensitively).
pub const QUIT_COMMAND: &str = "quit";

/// A line received from a client, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// Empty line or a leftover CR/LF artifact; nothing to do
    Blank,

    /// End this session
    Quit,

    /// Any other text, answered with an echo
    Text(String),
}

impl ClientCommand {
    /// Classifies a line that has already had its terminator stripped.
    ///
    /// Every non-blank line other than `quit` is text, control characters
    /// and escape sequences included.
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim_matches(|c: char| c == '\r' || c == '\n');
        if trimmed.trim().is_empty() {
            return Self::Blank;
        }

        if trimmed.trim().eq_ignore_ascii_case(QUIT_COMMAND) {
            return Self::Quit;
        }

        Self::Text(trimmed.to_string())
    }
}
