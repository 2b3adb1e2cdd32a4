//! Pseudo-terminal request sent before each command

/// Terminal modes the executor knows how to request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalMode {
    /// Local echo of input characters
    Echo,
    /// Input baud rate
    InputSpeed,
    /// Output baud rate
    OutputSpeed,
}

/// Parameters of a `pty-req` channel request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    /// Value for `TERM`
    pub term: String,
    /// Width in characters
    pub cols: u32,
    /// Height in rows
    pub rows: u32,
    /// Encoded terminal modes, in request order
    pub modes: Vec<(TerminalMode, u32)>,
}

impl Default for PtyRequest {
    /// `xterm`, 80x40, echo off, 14400 baud both ways
    fn default() -> Self {
        Self {
            term: "xterm".to_string(),
            cols: 80,
            rows: 40,
            modes: vec![
                (TerminalMode::Echo, 0),
                (TerminalMode::InputSpeed, 14400),
                (TerminalMode::OutputSpeed, 14400),
            ],
        }
    }
}

impl PtyRequest {
    /// Set terminal type
    #[must_use]
    pub fn with_term(mut self, term: impl Into<String>) -> Self {
        self.term = term.into();
        self
    }

    /// Set terminal dimensions
    #[must_use]
    pub fn with_size(mut self, cols: u32, rows: u32) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }
}
