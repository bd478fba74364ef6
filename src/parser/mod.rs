//! Decodes raw ingestion bytes into a validated, tagged DTO tree.
//! Pure and side-effect-free: no I/O, no persistence, no clock.

pub mod dto;
pub mod error;
mod xml;

pub use dto::*;
pub use error::{ParseError, ParseErrorKind};

/// Decode `bytes` into a `Parsed` tree or a classified `ParseError`.
pub fn parse(bytes: &[u8]) -> Result<Parsed, ParseError> {
    xml::parse(bytes)
}
