//! Parser-specific error detail. Carries offset/path/message beyond
//! what the pipeline-wide `ErrorKind` needs, then collapses into it for the
//! orchestrator.

use crate::errors::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    MalformedXml,
    UnknownRoot,
    SchemaViolation,
    FieldConstraint,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub offset: usize,
    pub path: String,
    pub message: String,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, offset: usize, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            offset,
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} at offset {} ({}): {}",
            self.kind, self.offset, self.path, self.message
        )
    }
}

impl std::error::Error for ParseError {}

impl From<ParseError> for ErrorKind {
    fn from(e: ParseError) -> Self {
        match e.kind {
            ParseErrorKind::MalformedXml | ParseErrorKind::UnknownRoot => {
                ErrorKind::ParseMalformed(e.to_string())
            }
            ParseErrorKind::SchemaViolation | ParseErrorKind::FieldConstraint => {
                ErrorKind::ParseSchema(e.to_string())
            }
        }
    }
}
