//! On-disk project layouts for tests

use crate::tool::TOOL_MANIFEST_NAME;
use polyemit_config::{BuildSettings, DEFAULT_CONFIG_NAME};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// A project tree rooted at a caller-owned folder
#[derive(Debug, Clone)]
pub struct ProjectFixture {
    root: PathBuf,
}

impl ProjectFixture {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    /// Write a file, creating parent folders
    pub fn write(&self, relative: impl AsRef<Path>, text: &str) -> io::Result<PathBuf> {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, text)?;
        Ok(path)
    }

    pub fn read(&self, relative: impl AsRef<Path>) -> io::Result<String> {
        fs::read_to_string(self.path(relative))
    }

    pub fn exists(&self, relative: impl AsRef<Path>) -> bool {
        self.path(relative).exists()
    }

    /// Write `tsconfig.json` into `folder`
    pub fn config(&self, folder: impl AsRef<Path>, config: serde_json::Value) -> io::Result<PathBuf> {
        let text = serde_json::to_string_pretty(&config).map_err(io::Error::other)?;
        self.write(folder.as_ref().join(DEFAULT_CONFIG_NAME), &text)
    }

    /// Install a compiler manifest at the default tool path
    pub fn tool(&self, version: &str) -> io::Result<PathBuf> {
        let settings = BuildSettings::default();
        let manifest = serde_json::json!({ "name": "typescript", "version": version });
        self.write(settings.tool_path.join(TOOL_MANIFEST_NAME), &manifest.to_string())?;
        Ok(self.path(settings.tool_path))
    }

    /// Settings rooted at this fixture
    pub fn settings(&self) -> BuildSettings {
        BuildSettings::for_folder(&self.root)
    }

    /// Every file under `folder`, relative to it, sorted
    pub fn list(&self, folder: impl AsRef<Path>) -> Vec<PathBuf> {
        let base = self.path(folder);
        let mut files: Vec<PathBuf> = walkdir::WalkDir::new(&base)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.path().strip_prefix(&base).ok().map(Path::to_path_buf))
            .collect();
        files.sort();
        files
    }
}
