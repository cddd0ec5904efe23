//! Decoding of JSON query payloads.
//!
//! `ConvertTo-Json` emits a bare object when a pipeline yields one record
//! and an array when it yields several. [`OneOrMany`] absorbs that
//! ambiguity so callers always receive a `Vec`.

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::{DnsError, Result};

/// A JSON payload holding either a single record or a list of records.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    List(Vec<T>),
    Single(T),
}

impl<T> OneOrMany<T> {
    /// Flattens into a list.
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Self::Single(item) => vec![item],
            Self::List(items) => items,
        }
    }
}

/// Decodes a record list; empty output means no records.
pub fn records<T: DeserializeOwned>(output: &str, what: &'static str) -> Result<Vec<T>> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str::<OneOrMany<T>>(trimmed)
        .map(OneOrMany::into_vec)
        .map_err(|source| DnsError::Decode { what, source })
}
