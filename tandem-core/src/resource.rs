//! Shared resources and the session-wide id mapping.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Session-scoped identifier of a shared resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A file inside a shared resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourcePath {
    pub resource: ResourceId,
    pub path: String,
}

impl ResourcePath {
    pub fn new(resource: ResourceId, path: impl Into<String>) -> Self {
        Self {
            resource,
            path: path.into(),
        }
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource, self.path)
    }
}

/// A named resource together with the files selected for sharing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTree {
    pub name: String,
    pub files: Vec<String>,
}

impl ResourceTree {
    pub fn new(
        name: impl Into<String>,
        files: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            files: files.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("resource `{name}` is already shared as {existing}")]
    NameConflict { name: String, existing: ResourceId },
    #[error("resource id {id} is already bound to `{existing}`")]
    IdConflict { id: ResourceId, existing: String },
}

/// Bidirectional mapping between resource names and session resource ids.
#[derive(Debug, Clone, Default)]
pub struct ResourceMapping {
    by_id: HashMap<ResourceId, (String, BTreeSet<String>)>,
    by_name: HashMap<String, ResourceId>,
}

impl ResourceMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `tree` to `id`. Re-adding an existing binding merges the file
    /// lists; rebinding a name or id to something else is an error.
    pub fn add(&mut self, id: ResourceId, tree: &ResourceTree) -> Result<(), ResourceError> {
        if let Some(existing) = self.by_name.get(&tree.name) {
            if *existing != id {
                return Err(ResourceError::NameConflict {
                    name: tree.name.clone(),
                    existing: existing.clone(),
                });
            }
        }
        if let Some((existing, _)) = self.by_id.get(&id) {
            if *existing != tree.name {
                return Err(ResourceError::IdConflict {
                    id,
                    existing: existing.clone(),
                });
            }
        }

        let entry = self
            .by_id
            .entry(id.clone())
            .or_insert_with(|| (tree.name.clone(), BTreeSet::new()));
        entry.1.extend(tree.files.iter().cloned());
        self.by_name.insert(tree.name.clone(), id);
        Ok(())
    }

    pub fn id_of(&self, name: &str) -> Option<&ResourceId> {
        self.by_name.get(name)
    }

    pub fn name_of(&self, id: &ResourceId) -> Option<&str> {
        self.by_id.get(id).map(|(name, _)| name.as_str())
    }

    pub fn tree(&self, id: &ResourceId) -> Option<ResourceTree> {
        self.by_id.get(id).map(|(name, files)| ResourceTree {
            name: name.clone(),
            files: files.iter().cloned().collect(),
        })
    }

    pub fn is_shared(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn ids(&self) -> Vec<ResourceId> {
        self.by_id.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
