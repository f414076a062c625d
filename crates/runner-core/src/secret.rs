//! Job-scoped secret storage.
//!
//! Secrets are fetched once per job (`GetSecretsPlaintext`) and held in
//! memory for the lifetime of the job; there is no pluggable backend here,
//! unlike the control-plane client or the execution runtime.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ResourceId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Secret {
    pub id: ResourceId,
    pub name: String,
    pub value: String,
    /// Internal secrets (synthetic variables the runner itself injects,
    /// e.g. a build-scoped access token) are not redaction candidates by
    /// virtue of being internal, but SHOULD still be registered with the
    /// scrubber; user secrets always are.
    pub is_internal: bool,
}

/// In-memory secret set for one job, loaded once during `PreExecuteJob`.
#[derive(Debug, Clone, Default)]
pub struct SecretStore {
    by_name: HashMap<String, Secret>,
}

impl SecretStore {
    pub fn new(secrets: Vec<Secret>) -> Self {
        let by_name = secrets.into_iter().map(|s| (s.name.clone(), s)).collect();
        Self { by_name }
    }

    pub fn get(&self, name: &str) -> Option<&Secret> {
        self.by_name.get(name)
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.by_name.get(name).map(|s| s.value.as_str())
    }

    /// Values eligible for log redaction: every non-internal secret.
    pub fn scrubbable_values(&self) -> impl Iterator<Item = &str> {
        self.by_name
            .values()
            .filter(|s| !s.is_internal)
            .map(|s| s.value.as_str())
    }

    /// Every secret as a `(name, value)` pair, for seeding variable
    /// interpolation contexts.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.by_name.values().map(|s| (s.name.as_str(), s.value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
