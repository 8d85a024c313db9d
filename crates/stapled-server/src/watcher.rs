//! Polled certificate directory

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

/// Reports file names that appeared or disappeared since the last check
#[derive(Debug)]
pub struct DirWatcher {
    folder: PathBuf,
    known: BTreeSet<String>,
}

impl DirWatcher {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            known: BTreeSet::new(),
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Returns `(added, removed)` file names, sorted
    ///
    /// The first call reports every existing file as added.
    pub fn check(&mut self) -> io::Result<(Vec<String>, Vec<String>)> {
        let mut current = BTreeSet::new();
        for entry in std::fs::read_dir(&self.folder)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                current.insert(name);
            }
        }

        let added = current.difference(&self.known).cloned().collect();
        let removed = self.known.difference(&current).cloned().collect();
        self.known = current;
        Ok((added, removed))
    }
}
