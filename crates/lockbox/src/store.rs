//! The decrypted secret mapping
//!
//! A [`SecretStore`] is always the complete set of secrets. It knows nothing
//! about files or keys; [`crate::filestore::Filestore`] loads and saves it.

use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use zeroize::Zeroize;

/// Name to value mapping, serialized as `{"secrets": {...}}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretStore {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    secrets: BTreeMap<String, String>,
}

/// What [`SecretStore::set`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Inserted,
    Updated,
}

impl SecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// Look up a secret
    pub fn get(&self, name: &str) -> Result<&str> {
        self.secrets
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Insert or, with `force`, overwrite a secret.
    ///
    /// Without `force` an existing name is a [`Error::Conflict`] carrying the
    /// current value, and the store is left untouched.
    pub fn set(&mut self, name: &str, value: &str, force: bool) -> Result<SetOutcome> {
        if name.is_empty() {
            return Err(Error::InvalidKey("key cannot be empty".to_string()));
        }

        match self.secrets.get_mut(name) {
            Some(existing) if !force => Err(Error::Conflict {
                key: name.to_string(),
                existing: existing.clone(),
            }),
            Some(existing) => {
                existing.zeroize();
                *existing = value.to_string();
                Ok(SetOutcome::Updated)
            }
            None => {
                self.secrets.insert(name.to_string(), value.to_string());
                Ok(SetOutcome::Inserted)
            }
        }
    }

    /// Remove a secret, returning its value
    pub fn delete(&mut self, name: &str) -> Result<String> {
        self.secrets
            .remove(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Secrets in ascending name order, optionally restricted to names the
    /// pattern matches anywhere
    pub fn list<'a>(
        &'a self,
        filter: Option<&'a Regex>,
    ) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.secrets
            .iter()
            .filter(move |(name, _)| filter.map_or(true, |re| re.is_match(name)))
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

impl Drop for SecretStore {
    fn drop(&mut self) {
        for value in self.secrets.values_mut() {
            value.zeroize();
        }
    }
}
