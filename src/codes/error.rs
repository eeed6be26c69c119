//! Error definitions for alias loading and code resolution

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while turning a code token into its decimal form
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodeError {
    /// The token (after alias substitution) is not a hexadecimal number
    #[error("Invalid code format: token {token:?} resolved to {value:?}, which is not hexadecimal")]
    InvalidCodeFormat { token: String, value: String },
}

/// Errors raised while loading the alias table
#[derive(Debug, Error)]
pub enum AliasError {
    /// Reading the alias source failed
    #[error("Failed to read alias file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A CSV record did not have exactly two fields
    #[error("Malformed alias record on line {line}: expected `name,hex`")]
    MalformedRecord { line: usize },

    /// The TOML alias source could not be parsed
    #[error("Invalid alias table: {0}")]
    Toml(#[from] toml::de::Error),

    /// The same alias name appears more than once
    #[error("Duplicate alias: {name}")]
    DuplicateAlias { name: String },

    /// An alias maps to something that is not hexadecimal
    #[error("Alias {name} maps to invalid hexadecimal code {code:?}")]
    InvalidCode { name: String, code: String },
}
