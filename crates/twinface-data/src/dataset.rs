//! Dataset indexing: assigns dense ids to identities and images.
//!
//! Expects the LFW layout `<root>/<identity_name>/<image_file>`. Directory
//! and file names are sorted so ids are stable across runs on the same tree.

use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Dense identity id (`0..num_identities`).
pub type IdentityId = usize;
/// Dense image id (`0..num_images`), also the row of the image cache.
pub type ImageId = usize;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("dataset root not found: {0}")]
    RootNotFound(PathBuf),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no identities with images under {0}")]
    Empty(PathBuf),
}

/// A person and the ordered list of their images.
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: IdentityId,
    pub name: String,
    pub image_ids: Vec<ImageId>,
}

/// One indexed image file.
#[derive(Debug, Clone)]
pub struct ImageEntry {
    pub id: ImageId,
    pub path: PathBuf,
    pub identity: IdentityId,
}

/// Counts reported by `twinface stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetStats {
    pub identities: usize,
    pub images: usize,
    /// Identities that can produce positive pairs.
    pub identities_with_pairs: usize,
}

/// Bidirectional lookup tables over a scanned dataset.
///
/// Built once at startup and borrowed by every later stage.
#[derive(Debug, Clone, Default)]
pub struct DatasetIndex {
    identities: Vec<Identity>,
    images: Vec<ImageEntry>,
    name_to_identity: HashMap<String, IdentityId>,
    path_to_image: HashMap<PathBuf, ImageId>,
}

impl DatasetIndex {
    /// Scan `root`, keeping at most `subset` identities (in sorted order).
    ///
    /// Identity directories without any files are skipped so every identity
    /// owns at least one image.
    pub fn scan(root: &Path, subset: Option<usize>) -> Result<Self, DatasetError> {
        if !root.is_dir() {
            return Err(DatasetError::RootNotFound(root.to_path_buf()));
        }

        let mut dirs = sorted_entries(root, |p| p.is_dir())?;
        if let Some(limit) = subset {
            dirs.truncate(limit);
        }

        let mut groups = Vec::with_capacity(dirs.len());
        for dir in dirs {
            let files = sorted_entries(&dir, |p| p.is_file())?;
            if files.is_empty() {
                tracing::debug!(dir = %dir.display(), "skipping identity without images");
                continue;
            }
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            groups.push((name, files));
        }

        let index = Self::from_groups(groups);
        if index.identities.is_empty() {
            return Err(DatasetError::Empty(root.to_path_buf()));
        }

        tracing::info!(
            root = %root.display(),
            identities = index.num_identities(),
            images = index.num_images(),
            "indexed dataset"
        );

        Ok(index)
    }

    /// Build an index from already-grouped `(identity name, image paths)`.
    ///
    /// Ids are assigned in the order given.
    pub fn from_groups<I>(groups: I) -> Self
    where
        I: IntoIterator<Item = (String, Vec<PathBuf>)>,
    {
        let mut index = Self::default();

        for (name, paths) in groups {
            let identity_id = index.identities.len();
            let mut image_ids = Vec::with_capacity(paths.len());

            for path in paths {
                let image_id = index.images.len();
                index.path_to_image.insert(path.clone(), image_id);
                index.images.push(ImageEntry {
                    id: image_id,
                    path,
                    identity: identity_id,
                });
                image_ids.push(image_id);
            }

            index.name_to_identity.insert(name.clone(), identity_id);
            index.identities.push(Identity {
                id: identity_id,
                name,
                image_ids,
            });
        }

        index
    }

    pub fn num_identities(&self) -> usize {
        self.identities.len()
    }

    pub fn num_images(&self) -> usize {
        self.images.len()
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn images(&self) -> &[ImageEntry] {
        &self.images
    }

    pub fn identity(&self, id: IdentityId) -> Option<&Identity> {
        self.identities.get(id)
    }

    pub fn image(&self, id: ImageId) -> Option<&ImageEntry> {
        self.images.get(id)
    }

    pub fn identity_by_name(&self, name: &str) -> Option<IdentityId> {
        self.name_to_identity.get(name).copied()
    }

    pub fn image_by_path(&self, path: &Path) -> Option<ImageId> {
        self.path_to_image.get(path).copied()
    }

    /// Image ids owned by `identity`; empty for unknown ids.
    pub fn images_of(&self, identity: IdentityId) -> &[ImageId] {
        self.identities
            .get(identity)
            .map(|i| i.image_ids.as_slice())
            .unwrap_or(&[])
    }

    /// Identity that owns `image`.
    pub fn identity_of(&self, image: ImageId) -> Option<IdentityId> {
        self.images.get(image).map(|e| e.identity)
    }

    /// Name of the identity that owns `image`.
    pub fn name_of(&self, image: ImageId) -> Option<&str> {
        self.identity_of(image)
            .and_then(|id| self.identities.get(id))
            .map(|i| i.name.as_str())
    }

    /// Image paths ordered by image id.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.images.iter().map(|e| e.path.as_path())
    }

    pub fn stats(&self) -> DatasetStats {
        DatasetStats {
            identities: self.identities.len(),
            images: self.images.len(),
            identities_with_pairs: self
                .identities
                .iter()
                .filter(|i| i.image_ids.len() >= 2)
                .count(),
        }
    }
}

/// List the entries of `dir` matching `keep`, sorted by path.
fn sorted_entries(dir: &Path, keep: impl Fn(&Path) -> bool) -> Result<Vec<PathBuf>, DatasetError> {
    let read_err = |source| DatasetError::Read {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(read_err)? {
        let path = entry.map_err(read_err)?.path();
        if keep(&path) {
            entries.push(path);
        }
    }
    entries.sort();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_tree(layout: &[(&str, usize)]) -> TempDir {
        let tmp = TempDir::new().unwrap();
        for (name, count) in layout {
            let dir = tmp.path().join(name);
            fs::create_dir_all(&dir).unwrap();
            for i in 0..*count {
                fs::write(dir.join(format!("{name}_{i:04}.jpg")), b"x").unwrap();
            }
        }
        tmp
    }

    #[test]
    fn test_scan_assigns_sorted_dense_ids() {
        let tmp = make_tree(&[("Carol", 2), ("Alice", 3), ("Bob", 1)]);
        let index = DatasetIndex::scan(tmp.path(), None).unwrap();

        assert_eq!(index.num_identities(), 3);
        assert_eq!(index.num_images(), 6);
        assert_eq!(index.identity_by_name("Alice"), Some(0));
        assert_eq!(index.identity_by_name("Bob"), Some(1));
        assert_eq!(index.identity_by_name("Carol"), Some(2));
        assert_eq!(index.images_of(0), &[0, 1, 2]);
        assert_eq!(index.images_of(1), &[3]);
        assert_eq!(index.images_of(2), &[4, 5]);
    }

    #[test]
    fn test_lookup_tables_are_bidirectional() {
        let tmp = make_tree(&[("Alice", 2), ("Bob", 2)]);
        let index = DatasetIndex::scan(tmp.path(), None).unwrap();

        for entry in index.images() {
            assert_eq!(index.image_by_path(&entry.path), Some(entry.id));
            assert_eq!(index.image(entry.id).unwrap().path, entry.path);
        }
        for identity in index.identities() {
            assert_eq!(index.identity_by_name(&identity.name), Some(identity.id));
            for &img in &identity.image_ids {
                assert_eq!(index.identity_of(img), Some(identity.id));
            }
        }
        assert_eq!(index.name_of(3), Some("Bob"));
    }

    #[test]
    fn test_scan_subset_truncates_identities() {
        let tmp = make_tree(&[("A", 1), ("B", 2), ("C", 3)]);
        let index = DatasetIndex::scan(tmp.path(), Some(2)).unwrap();
        assert_eq!(index.num_identities(), 2);
        assert_eq!(index.num_images(), 3);
        assert!(index.identity_by_name("C").is_none());
    }

    #[test]
    fn test_scan_skips_empty_dirs_and_stray_files() {
        let tmp = make_tree(&[("A", 2), ("Empty", 0)]);
        fs::write(tmp.path().join("README.txt"), b"readme").unwrap();
        let index = DatasetIndex::scan(tmp.path(), None).unwrap();
        assert_eq!(index.num_identities(), 1);
        assert!(index.identity_by_name("Empty").is_none());
    }

    #[test]
    fn test_scan_missing_root() {
        let tmp = TempDir::new().unwrap();
        let err = DatasetIndex::scan(&tmp.path().join("nope"), None).unwrap_err();
        assert!(matches!(err, DatasetError::RootNotFound(_)));
    }

    #[test]
    fn test_scan_empty_root() {
        let tmp = TempDir::new().unwrap();
        let err = DatasetIndex::scan(tmp.path(), None).unwrap_err();
        assert!(matches!(err, DatasetError::Empty(_)));
    }

    #[test]
    fn test_stats() {
        let tmp = make_tree(&[("A", 3), ("B", 1), ("C", 2)]);
        let index = DatasetIndex::scan(tmp.path(), None).unwrap();
        assert_eq!(
            index.stats(),
            DatasetStats {
                identities: 3,
                images: 6,
                identities_with_pairs: 2,
            }
        );
    }
}
