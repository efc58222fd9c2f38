//! Persistent mapping from image references to image ids.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use graft_common::{GraftError, GraftResult};
use serde::{Deserialize, Serialize};

use crate::reference::Reference;

/// A reference together with the image id it points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    /// The reference.
    pub reference: Reference,
    /// The image id it resolves to.
    pub image_id: String,
}

/// Canonical on-disk shape of the tag map.
///
/// `BTreeMap` at both levels makes the serialised JSON byte-for-byte
/// canonical: repository names and references are emitted in ascending
/// lexicographic order.
#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Repositories {
    #[serde(rename = "Repositories", default)]
    repositories: BTreeMap<String, BTreeMap<String, String>>,
}

/// Persistent reference → image-id store with canonical JSON backing.
pub struct TagStore {
    path: PathBuf,
    inner: Mutex<Repositories>,
}

impl TagStore {
    /// Open the store backed by `path`, starting empty when the file is
    /// missing or empty.
    pub fn open(path: impl Into<PathBuf>) -> GraftResult<Self> {
        let path = path.into();
        let inner = match fs::read(&path) {
            Ok(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes)?,
            Ok(_) => Repositories::default(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Repositories::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            inner: Mutex::new(inner),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Repositories> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `reference` to `image_id`.
    ///
    /// A bare name is stored under an implicit `:latest` tag. Rebinding
    /// an existing reference to a different id requires `force`.
    pub fn add(&self, reference: &Reference, image_id: &str, force: bool) -> GraftResult<()> {
        let reference = reference.normalized();
        let key = reference.canonical();

        let mut inner = self.lock();
        let repository = inner
            .repositories
            .entry(reference.name().to_string())
            .or_default();

        if let Some(current) = repository.get(&key) {
            if current == image_id {
                return Ok(());
            }
            if !force {
                return Err(GraftError::Conflict {
                    reference: key,
                    current: current.clone(),
                });
            }
        }
        repository.insert(key.clone(), image_id.to_string());
        tracing::debug!(reference = %key, image_id, "Reference added");
        self.save(&inner)
    }

    /// Resolve a reference to its image id.
    ///
    /// Bare names resolve through the implicit `:latest` tag.
    pub fn get(&self, reference: &Reference) -> GraftResult<String> {
        let reference = reference.normalized();
        let inner = self.lock();
        inner
            .repositories
            .get(reference.name())
            .and_then(|repository| repository.get(&reference.canonical()))
            .cloned()
            .ok_or_else(|| GraftError::ReferenceNotFound {
                reference: reference.canonical(),
            })
    }

    /// Remove a reference binding.
    ///
    /// Deleting the last reference of a repository drops the repository
    /// entry as well.
    pub fn delete(&self, reference: &Reference) -> GraftResult<bool> {
        let reference = reference.normalized();
        let key = reference.canonical();

        let mut inner = self.lock();
        let emptied = {
            let Some(repository) = inner.repositories.get_mut(reference.name()) else {
                return Err(GraftError::ReferenceNotFound { reference: key });
            };
            if repository.remove(&key).is_none() {
                return Err(GraftError::ReferenceNotFound { reference: key });
            }
            repository.is_empty()
        };
        if emptied {
            inner.repositories.remove(reference.name());
        }
        tracing::debug!(reference = %key, "Reference deleted");
        self.save(&inner)?;
        Ok(true)
    }

    /// Every reference currently pointing at `image_id`, unordered.
    #[must_use]
    pub fn references(&self, image_id: &str) -> Vec<Reference> {
        let inner = self.lock();
        inner
            .repositories
            .values()
            .flat_map(|repository| repository.iter())
            .filter(|(_, id)| id.as_str() == image_id)
            .filter_map(|(key, _)| Reference::parse(key).ok())
            .collect()
    }

    /// Every (reference, image id) pair stored under a repository name.
    #[must_use]
    pub fn references_by_name(&self, name: &str) -> Vec<Association> {
        let inner = self.lock();
        inner
            .repositories
            .get(name)
            .map(|repository| {
                repository
                    .iter()
                    .filter_map(|(key, id)| {
                        Reference::parse(key).ok().map(|reference| Association {
                            reference,
                            image_id: id.clone(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The file backing this store.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist the full map: write a temp file next to the target, fsync,
    /// rename over it.
    fn save(&self, inner: &Repositories) -> GraftResult<()> {
        let bytes = serde_json::to_vec(inner)?;
        let staging = self.path.with_extension("tmp");
        let mut file = fs::File::create(&staging)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }
}
