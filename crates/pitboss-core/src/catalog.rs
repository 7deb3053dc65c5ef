//! The Server's descriptor catalog.
//!
//! Descriptors are immutable once registered under an `(id, version)`.
//! Registering the same pair again with identical content is a no-op; with
//! different content it is a `Conflict`. A newer version of an id replaces
//! the older one for dispatch.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use tracing::{debug, info, warn};

use pitboss_contracts::{
    descriptor::FunctionDescriptor,
    error::{PitbossError, PitbossResult},
};

#[derive(Default)]
pub struct FunctionCatalog {
    inner: RwLock<HashMap<String, Arc<FunctionDescriptor>>>,
}

impl FunctionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one descriptor after validating it.
    pub fn insert(&self, descriptor: FunctionDescriptor) -> PitbossResult<()> {
        descriptor.validate()?;
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = map.get(&descriptor.id) {
            if existing.version == descriptor.version {
                if **existing == descriptor {
                    return Ok(());
                }
                return Err(PitbossError::Conflict {
                    reason: format!(
                        "descriptor '{}' version {} is already registered with different content",
                        descriptor.id, descriptor.version
                    ),
                });
            }
        }
        debug!(function_id = %descriptor.id, version = %descriptor.version, "descriptor registered");
        map.insert(descriptor.id.clone(), Arc::new(descriptor));
        Ok(())
    }

    pub fn get(&self, function_id: &str) -> Option<Arc<FunctionDescriptor>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(function_id)
            .cloned()
    }

    /// All descriptors ordered by id.
    pub fn list(&self) -> Vec<Arc<FunctionDescriptor>> {
        let mut out: Vec<_> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register every descriptor in a JSON document: either one descriptor
    /// object or an array of them.
    pub fn load_json(&self, json: &str) -> PitbossResult<usize> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| PitbossError::config(format!("descriptor document is not JSON: {e}")))?;
        let items = match value {
            Value::Array(items) => items,
            other => vec![other],
        };
        let mut count = 0;
        for item in items {
            let descriptor: FunctionDescriptor = serde_json::from_value(item)
                .map_err(|e| PitbossError::config(format!("malformed descriptor: {e}")))?;
            self.insert(descriptor)?;
            count += 1;
        }
        Ok(count)
    }

    /// Load every `*.json` file under `dir`, recursively. Directories named
    /// `ui` hold presentation documents and are skipped.
    pub fn load_dir(&self, dir: &Path) -> PitbossResult<usize> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            PitbossError::config(format!("failed to read descriptor dir '{}': {}", dir.display(), e))
        })?;

        let mut paths: Vec<_> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
        paths.sort();

        let mut count = 0;
        for path in paths {
            if path.is_dir() {
                if path.file_name().map_or(false, |n| n == "ui") {
                    continue;
                }
                count += self.load_dir(&path)?;
            } else if path.extension().map_or(false, |ext| ext == "json") {
                let contents = std::fs::read_to_string(&path).map_err(|e| {
                    PitbossError::config(format!("failed to read '{}': {}", path.display(), e))
                })?;
                count += self
                    .load_json(&contents)
                    .map_err(|e| e.with_context(path.display()))?;
            }
        }
        info!(dir = %dir.display(), count, "descriptors loaded");
        Ok(count)
    }

    /// Register the descriptors a provider manifest carries under its
    /// `functions` array. Entries that are not descriptors, or that conflict
    /// with a registered one, are skipped with a warning.
    pub fn register_manifest(&self, provider_id: &str, manifest: &Value) -> usize {
        let Some(functions) = manifest.get("functions").and_then(Value::as_array) else {
            return 0;
        };
        let mut count = 0;
        for entry in functions {
            match serde_json::from_value::<FunctionDescriptor>(entry.clone()) {
                Ok(descriptor) => match self.insert(descriptor) {
                    Ok(()) => count += 1,
                    Err(e) => warn!(provider_id, error = %e, "manifest descriptor rejected"),
                },
                Err(e) => warn!(provider_id, error = %e, "manifest entry is not a descriptor"),
            }
        }
        count
    }
}
