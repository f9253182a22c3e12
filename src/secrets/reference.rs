//! Parsing of `prefix:identifier` secret references

use super::SecretError;
use std::fmt;

/// A parsed secret reference borrowing from the original string
///
/// The reference is split on the first `:` only, so identifiers may contain
/// further colons (`vault:kv/data:token` has prefix `vault`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecretReference<'a> {
    prefix: &'a str,
    identifier: &'a str,
}

impl<'a> SecretReference<'a> {
    /// Parse a reference, rejecting a missing separator or empty parts
    pub fn parse(reference: &'a str) -> Result<Self, SecretError> {
        match reference.split_once(':') {
            Some((prefix, identifier)) if !prefix.is_empty() && !identifier.is_empty() => {
                Ok(Self { prefix, identifier })
            }
            _ => Err(SecretError::InvalidReference {
                reference: reference.to_string(),
            }),
        }
    }

    pub fn prefix(&self) -> &'a str {
        self.prefix
    }

    pub fn identifier(&self) -> &'a str {
        self.identifier
    }
}

impl fmt::Display for SecretReference<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.prefix, self.identifier)
    }
}
