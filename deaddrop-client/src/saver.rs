use std::{
    fs, io,
    path::{Path, PathBuf},
};

use deaddrop_core::DEFAULT_DOWNLOAD_FILENAME;
use tracing::debug;

pub trait PayloadSaver: Send + Sync {
    fn save(&self, file_name: &str, payload: &[u8]) -> io::Result<PathBuf>;
}

/// Saves downloads into one directory, never overwriting an existing file.
#[derive(Debug, Clone)]
pub struct DirectorySaver {
    dir: PathBuf,
}

impl DirectorySaver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl PayloadSaver for DirectorySaver {
    fn save(&self, file_name: &str, payload: &[u8]) -> io::Result<PathBuf> {
        let name = local_file_name(file_name);
        fs::create_dir_all(&self.dir)?;

        let staging = StagingFile::create(self.dir.join(format!(".{name}.part")), payload)?;
        let target = free_path(&self.dir, &name);
        staging.commit(&target)?;
        debug!(path = %target.display(), bytes = payload.len(), "payload written");
        Ok(target)
    }
}

/// Partially written download; removed again unless committed.
struct StagingFile {
    path: PathBuf,
    committed: bool,
}

impl StagingFile {
    fn create(path: PathBuf, payload: &[u8]) -> io::Result<Self> {
        let staging = Self {
            path,
            committed: false,
        };
        fs::write(&staging.path, payload)?;
        Ok(staging)
    }

    fn commit(mut self, target: &Path) -> io::Result<()> {
        fs::rename(&self.path, target)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn local_file_name(file_name: &str) -> String {
    let name = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    match name {
        "" | "." | ".." => DEFAULT_DOWNLOAD_FILENAME.to_owned(),
        name => name.to_owned(),
    }
}

/// `name`, or `stem (n).ext` for the first `n` not taken yet.
fn free_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, extension) = match name.rsplit_once('.') {
        Some((stem, extension)) if !stem.is_empty() => (stem, Some(extension)),
        _ => (name, None),
    };
    (1_u32..)
        .map(|n| match extension {
            Some(extension) => dir.join(format!("{stem} ({n}).{extension}")),
            None => dir.join(format!("{stem} ({n})")),
        })
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}
