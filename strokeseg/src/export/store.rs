//! Content-addressed artifact store.
//!
//! ```text
//! <root>/<checkpoint hash>/graph.onnx
//! <root>/<checkpoint hash>/engine-fp32.sse
//! <root>/<checkpoint hash>/engine-fp16.sse
//! ```

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use walkdir::WalkDir;

use crate::{
    config::Precision,
    error::{StrokeSegError, StrokeSegResult},
};

pub const GRAPH_FILE_NAME: &str = "graph.onnx";

pub fn engine_file_name(precision: Precision) -> String {
    format!("engine-{precision}.sse")
}

/// Artifacts keyed by (checkpoint hash, precision).
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Opens (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> StrokeSegResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StrokeSegError::io(&root, e))?;
        Ok(Self { root })
    }

    /// Opens the store under the user cache directory.
    ///
    /// # Errors
    ///
    /// Returns `Err(StrokeSegError::InvalidConfiguration)` when the platform
    /// has no cache directory.
    pub fn open_default() -> StrokeSegResult<Self> {
        let cache = dirs::cache_dir().ok_or_else(|| StrokeSegError::InvalidConfiguration {
            reason: "no user cache directory; pass an explicit artifact store".into(),
        })?;
        Self::open(cache.join("strokeseg").join("artifacts"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn graph_path(&self, source_hash: &str) -> PathBuf {
        self.root.join(source_hash).join(GRAPH_FILE_NAME)
    }

    pub fn engine_path(&self, source_hash: &str, precision: Precision) -> PathBuf {
        self.root
            .join(source_hash)
            .join(engine_file_name(precision))
    }

    pub fn find_graph(&self, source_hash: &str) -> Option<PathBuf> {
        Some(self.graph_path(source_hash)).filter(|p| p.is_file())
    }

    pub fn find_engine(&self, source_hash: &str, precision: Precision) -> Option<PathBuf> {
        Some(self.engine_path(source_hash, precision)).filter(|p| p.is_file())
    }

    /// Publishes `bytes` at `target` without ever exposing a partial file.
    ///
    /// If another writer published the same artifact first, its file is kept.
    ///
    /// # Errors
    ///
    /// Returns I/O errors from writing or linking.
    pub fn persist(&self, target: &Path, bytes: &[u8]) -> StrokeSegResult<PathBuf> {
        let parent = target.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent).map_err(|e| StrokeSegError::io(parent, e))?;

        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = parent.join(format!(".{name}.{}.tmp", std::process::id()));
        fs::write(&tmp, bytes).map_err(|e| StrokeSegError::io(&tmp, e))?;

        let linked = fs::hard_link(&tmp, target);
        if let Err(e) = fs::remove_file(&tmp) {
            tracing::warn!(path = %tmp.display(), error = %e, "failed to remove temporary artifact");
        }
        match linked {
            Ok(()) => {
                tracing::info!(path = %target.display(), bytes = bytes.len(), "artifact stored");
                Ok(target.to_path_buf())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                tracing::debug!(path = %target.display(), "artifact already stored by another writer");
                Ok(target.to_path_buf())
            }
            Err(e) => Err(StrokeSegError::io(target, e)),
        }
    }

    /// All stored artifact files.
    pub fn list(&self) -> Vec<PathBuf> {
        WalkDir::new(&self.root)
            .min_depth(2)
            .max_depth(2)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
            .map(|e| e.into_path())
            .collect()
    }

    /// Removes the artifacts of one checkpoint, or of all checkpoints when
    /// `source_hash` is `None`. Returns the number of files removed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a directory cannot be removed.
    pub fn cleanup(&self, source_hash: Option<&str>) -> StrokeSegResult<usize> {
        let dirs: Vec<PathBuf> = match source_hash {
            Some(hash) => vec![self.root.join(hash)],
            None => fs::read_dir(&self.root)
                .map_err(|e| StrokeSegError::io(&self.root, e))?
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect(),
        };

        let mut removed = 0;
        for dir in dirs.iter().filter(|d| d.is_dir()) {
            removed += WalkDir::new(dir)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file())
                .count();
            fs::remove_dir_all(dir).map_err(|e| StrokeSegError::io(dir, e))?;
        }

        tracing::info!(root = %self.root.display(), removed, "artifact store cleaned");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifacts_are_keyed_by_hash_and_precision() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();

        assert_ne!(
            store.engine_path("abc", Precision::Fp32),
            store.engine_path("abc", Precision::Fp16)
        );
        assert_ne!(store.graph_path("abc"), store.graph_path("abd"));
        assert!(store.find_graph("abc").is_none());

        store.persist(&store.graph_path("abc"), b"graph").unwrap();
        assert_eq!(store.find_graph("abc"), Some(store.graph_path("abc")));
        assert!(store.find_engine("abc", Precision::Fp16).is_none());
    }

    #[test]
    fn persist_keeps_the_first_copy() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let path = store.graph_path("abc");

        store.persist(&path, b"first").unwrap();
        store.persist(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"first");
        assert_eq!(store.list(), vec![path]);
    }

    #[test]
    fn cleanup_by_hash_or_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        store.persist(&store.graph_path("a"), b"g").unwrap();
        store
            .persist(&store.engine_path("a", Precision::Fp16), b"e")
            .unwrap();
        store.persist(&store.graph_path("b"), b"g").unwrap();

        assert_eq!(store.cleanup(Some("a")).unwrap(), 2);
        assert_eq!(store.list().len(), 1);
        assert_eq!(store.cleanup(Some("missing")).unwrap(), 0);
        assert_eq!(store.cleanup(None).unwrap(), 1);
        assert!(store.list().is_empty());
    }
}
