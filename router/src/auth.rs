//! API-key resolution.
//!
//! The user/organization/project relational model lives outside the core;
//! ingest only needs an opaque key resolved to the authenticated tuple.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Debug;

/// The authenticated scope an ingest key grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectAuth {
    /// Owning organization.
    pub organization_id: String,
    /// Target project.
    pub project_id: String,
    /// Deployment environment the key belongs to.
    pub environment: String,
}

/// Resolves opaque API keys to their project scope.
pub trait ApiKeyResolver: Debug + Send + Sync + 'static {
    /// The scope of a key, or `None` for unknown/revoked keys.
    fn resolve(&self, api_key: &str) -> Option<ProjectAuth>;
}

/// Static in-memory key table, loaded from configuration.
#[derive(Debug, Default)]
pub struct StaticApiKeys {
    keys: RwLock<HashMap<String, ProjectAuth>>,
}

impl StaticApiKeys {
    /// New empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a key.
    pub fn insert(&self, api_key: impl Into<String>, auth: ProjectAuth) {
        self.keys.write().insert(api_key.into(), auth);
    }

    /// Parses `key:organization:project:environment` entries, one per item.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a str>) -> Self {
        let table = Self::new();
        for entry in entries {
            let parts: Vec<&str> = entry.splitn(4, ':').collect();
            if let [key, organization, project, environment] = parts.as_slice() {
                table.insert(
                    *key,
                    ProjectAuth {
                        organization_id: (*organization).to_string(),
                        project_id: (*project).to_string(),
                        environment: (*environment).to_string(),
                    },
                );
            }
        }
        table
    }
}

impl ApiKeyResolver for StaticApiKeys {
    fn resolve(&self, api_key: &str) -> Option<ProjectAuth> {
        self.keys.read().get(api_key).cloned()
    }
}
