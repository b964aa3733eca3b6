//! Error taxonomy for grammar construction and parsing.

use thiserror::Error;

/// Errors raised by grammar construction, chart parsing and the drivers.
///
/// An unparsable sentence is not an error: extraction returns `None` instead.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("child pair ({left}, {right}) does not fit a {bits}-bit packed key space")]
    PackingOverflow { left: u32, right: u32, bits: u32 },
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),
    #[error("non-terminal index {index} out of range (grammar has {count})")]
    NonTerminalOutOfRange { index: u32, count: usize },
    #[error("terminal index {index} out of range (lexicon has {count})")]
    TerminalOutOfRange { index: u32, count: usize },
    #[error("invalid log probability {value} for rule {rule}")]
    InvalidProbability { rule: String, value: f32 },
    #[error("cannot parse an empty sentence")]
    EmptySentence,
    #[error("malformed constraining tree for sentence `{sentence}`: {reason}")]
    MalformedTree { sentence: String, reason: String },
    #[error("worker failed: {0}")]
    WorkerFailed(String),
    #[error("thread pool: {0}")]
    ThreadPool(String),
    #[error("unsupported strategy: {0}")]
    UnsupportedStrategy(String),
    #[error("tree syntax error at {position}: {message}")]
    TreeSyntax { position: usize, message: String },
}

/// Result type for parser operations.
pub type Result<T> = std::result::Result<T, ParseError>;
