//! Alias table mapping human readable names to hexadecimal IR codes
//!
//! The table is loaded once at startup and never changes afterwards. Two
//! source formats are understood:
//!
//! - two-column records (`power,E0E040BF`), one alias per line
//! - a flat TOML table (`power = "E0E040BF"`), selected by a `.toml` extension
//!
//! Duplicate names are rejected instead of silently overwriting earlier entries.

use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use super::error::AliasError;
use super::parse_hex;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasTable {
    entries: HashMap<String, String>,
}

impl AliasTable {
    /// Empty table, no aliasing is performed
    pub fn empty() -> Self {
        Self::default()
    }

    /// Loads aliases from a file, picking the format from the file extension
    pub async fn load(path: &Path) -> Result<Self, AliasError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| AliasError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

        let table = if is_toml {
            Self::from_toml(&content)?
        } else {
            Self::from_csv(&content)?
        };

        info!("Loaded {} aliases from {}", table.len(), path.display());
        Ok(table)
    }

    /// Parses two-column `name,hex` records
    pub fn from_csv(content: &str) -> Result<Self, AliasError> {
        let mut table = Self::empty();

        for (idx, raw_line) in content.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields = split_record(line);
            let [name, code] = fields.as_slice() else {
                return Err(AliasError::MalformedRecord { line: idx + 1 });
            };
            table.insert(name.clone(), code.clone())?;
        }

        Ok(table)
    }

    /// Parses a flat TOML table of string values
    pub fn from_toml(content: &str) -> Result<Self, AliasError> {
        let raw: HashMap<String, String> = toml::from_str(content)?;
        Self::from_map(raw)
    }

    /// Builds a table from an already parsed mapping, validating every code
    pub fn from_map(raw: HashMap<String, String>) -> Result<Self, AliasError> {
        let mut table = Self::empty();
        for (name, code) in raw {
            table.insert(name, code)?;
        }
        Ok(table)
    }

    /// Merges another table into this one, rejecting names present in both
    pub fn merge(mut self, other: AliasTable) -> Result<Self, AliasError> {
        for (name, code) in other.entries {
            self.insert(name, code)?;
        }
        Ok(self)
    }

    /// Hexadecimal code for an alias name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&mut self, name: String, code: String) -> Result<(), AliasError> {
        if parse_hex(&code).is_none() {
            return Err(AliasError::InvalidCode { name, code });
        }
        if self.entries.contains_key(&name) {
            return Err(AliasError::DuplicateAlias { name });
        }

        debug!("Alias {} -> {}", name, code);
        self.entries.insert(name, code);
        Ok(())
    }
}

/// Splits a comma separated record, honouring double quoted fields
fn split_record(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    fields.push(current.trim().to_string());

    fields
}
