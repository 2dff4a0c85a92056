//! Identifier rules shared by work items, agents and clarification requests
//!
//! Identifiers end up as file names in the shared store, so they are limited
//! to characters that are safe on every filesystem.

use crate::{Error, Result};
use uuid::Uuid;

pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Validate an identifier of the given kind ("Work item id", "Agent id", ...)
pub fn validate_identifier(kind: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::validation(format!("{} cannot be empty", kind)));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::validation(format!(
            "{} cannot exceed {} characters",
            kind, MAX_IDENTIFIER_LEN
        )));
    }
    if value.starts_with('.') {
        return Err(Error::validation(format!("{} cannot start with '.'", kind)));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(Error::validation(format!(
            "{} can only contain alphanumeric characters, hyphens, underscores and dots",
            kind
        )));
    }
    Ok(())
}

/// Generate a fresh random identifier
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}
