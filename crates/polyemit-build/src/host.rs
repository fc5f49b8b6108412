//! Cached file access shared by every pass
//!
//! Reads are memoized until a path is invalidated; the orchestrator
//! invalidates the changed files at the start of each pass, so unchanged
//! files keep both their text and their parsed [`SourceFile`].

use crate::compiler::{CompilerHost, SourceFile};
use crate::error::{BuildError, BuildResult};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

/// Memoizing file system
#[derive(Debug, Default)]
pub struct CachedFileSystem {
    contents: RwLock<HashMap<PathBuf, Option<Arc<str>>>>,
}

impl CachedFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a file, or `None` if it cannot be read
    pub fn read_file(&self, path: &Path) -> Option<Arc<str>> {
        if let Some(cached) = self
            .contents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
        {
            return cached.clone();
        }

        let content: Option<Arc<str>> = fs::read_to_string(path).ok().map(Arc::from);
        self.contents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf(), content.clone());
        content
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.read_file(path).is_some() || path.exists()
    }

    /// Write a file, creating missing parent folders
    pub fn write_file(&self, path: &Path, content: &str) -> BuildResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| BuildError::io(parent, e))?;
        }
        fs::write(path, content).map_err(|e| BuildError::io(path, e))?;

        self.contents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf(), Some(Arc::from(content)));
        Ok(())
    }

    pub fn invalidate(&self, path: &Path) {
        self.contents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
    }

    pub fn invalidate_all(&self) {
        self.contents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Parsed source files, keyed by path
#[derive(Debug, Default)]
pub struct SourceFileCache {
    files: RwLock<HashMap<PathBuf, Arc<SourceFile>>>,
}

impl SourceFileCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached source file, parsing it on first access
    pub fn get_or_parse(&self, path: &Path, fs: &CachedFileSystem) -> Option<Arc<SourceFile>> {
        if let Some(file) = self
            .files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
        {
            return Some(Arc::clone(file));
        }

        let text = fs.read_file(path)?;
        let file = Arc::new(SourceFile::new(path, text.as_ref()));
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf(), Arc::clone(&file));
        Some(file)
    }

    pub fn evict(&self, path: &Path) {
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
    }

    pub fn clear(&self) {
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// [`CompilerHost`] over the shared caches
pub struct CachingHost {
    fs: Arc<CachedFileSystem>,
    sources: Arc<SourceFileCache>,
    current_directory: PathBuf,
}

impl CachingHost {
    pub fn new(
        fs: Arc<CachedFileSystem>,
        sources: Arc<SourceFileCache>,
        current_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            fs,
            sources,
            current_directory: current_directory.into(),
        }
    }
}

impl CompilerHost for CachingHost {
    fn get_source_file(&self, path: &Path) -> Option<Arc<SourceFile>> {
        self.sources.get_or_parse(path, &self.fs)
    }

    fn file_exists(&self, path: &Path) -> bool {
        self.fs.exists(path)
    }

    fn read_file(&self, path: &Path) -> Option<String> {
        self.fs.read_file(path).map(|text| text.to_string())
    }

    fn current_directory(&self) -> &Path {
        &self.current_directory
    }
}
