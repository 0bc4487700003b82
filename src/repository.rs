//! File repository: the committed files a host shares, plus staging for
//! in-flight uploads.
//!
//! Readers only ever see committed content. Uploads are written to a private
//! staging file and promoted with an atomic rename on commit; dropping a
//! [`PendingWrite`] without committing discards the staging file and leaves
//! the public copy and the catalog untouched.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Seek, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::checksum::{hash_file, to_hex, ContentHash, HashingWriter};
use crate::config::StorageConfig;
use crate::fs_enum::{ensure_dir_exists, enumerate_files};
use crate::protocol::MAX_NAME_LEN;

const STAGING_PREFIX: &str = ".lanshare-";
const STAGING_SUFFIX: &str = ".part";

// Characters no supported filesystem accepts in a file name
const RESERVED_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Catalog entry for one committed file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub name: String,
    pub hash: ContentHash,
    pub size: u64,
}

/// A committed file opened for reading
#[derive(Debug)]
pub struct StoredFile {
    pub record: FileRecord,
    pub file: File,
}

pub struct FileRepository {
    working_dir: PathBuf,
    staging_dir: PathBuf,
    catalog: RwLock<HashMap<String, FileRecord>>,
}

impl FileRepository {
    /// Open the repository, creating missing directories and hashing every
    /// file already present in the working directory.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        ensure_dir_exists(&config.working_dir)?;
        ensure_dir_exists(&config.staging_dir)?;

        let repo = Self {
            working_dir: config.working_dir.clone(),
            staging_dir: config.staging_dir.clone(),
            catalog: RwLock::new(HashMap::new()),
        };
        if on_same_device(&repo.working_dir, &repo.staging_dir) == Some(false) {
            tracing::warn!(
                working_dir = %repo.working_dir.display(),
                staging_dir = %repo.staging_dir.display(),
                "staging directory is on another filesystem; commits will copy before renaming"
            );
        }
        repo.remove_stale_staging(&repo.staging_dir);
        if repo.staging_dir != repo.working_dir {
            repo.remove_stale_staging(&repo.working_dir);
        }

        let mut catalog = HashMap::new();
        for entry in enumerate_files(&repo.working_dir, |n| {
            is_valid_name(n) && !is_staging_name(n)
        })? {
            let (hash, size) = hash_file(&entry.path)?;
            tracing::debug!(file = %entry.name, size, hash = %to_hex(&hash), "catalogued");
            catalog.insert(
                entry.name.clone(),
                FileRecord {
                    name: entry.name,
                    hash,
                    size,
                },
            );
        }
        tracing::info!(
            files = catalog.len(),
            dir = %repo.working_dir.display(),
            "repository opened"
        );
        *repo.catalog.write() = catalog;
        Ok(repo)
    }

    // Staging files left behind by a crash were never committed
    fn remove_stale_staging(&self, dir: &Path) {
        let stale = match enumerate_files(dir, is_staging_name) {
            Ok(stale) => stale,
            Err(e) => {
                tracing::warn!(error = %e, "could not scan staging directory");
                return;
            }
        };
        for entry in stale {
            match std::fs::remove_file(&entry.path) {
                Ok(()) => tracing::info!(path = %entry.path.display(), "removed stale staging file"),
                Err(e) => tracing::warn!(path = %entry.path.display(), error = %e, "could not remove stale staging file"),
            }
        }
    }

    /// Rename cannot cross filesystems, so copy the staged content into a
    /// temporary sibling of `public` and rename that over it instead.
    fn promote_by_copy(&self, staged: &mut NamedTempFile, public: &Path) -> Result<()> {
        staged.rewind().context("rewind staging file")?;
        let mut local = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .suffix(STAGING_SUFFIX)
            .tempfile_in(&self.working_dir)
            .with_context(|| format!("create commit file in {}", self.working_dir.display()))?;
        io::copy(staged, &mut local).context("copy staged content")?;
        local.as_file().sync_all().context("sync commit file")?;
        local
            .persist(public)
            .map_err(|e| e.error)
            .with_context(|| format!("commit {}", public.display()))?;
        Ok(())
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    fn public_path(&self, name: &str) -> PathBuf {
        self.working_dir.join(name)
    }

    /// Snapshot of every committed file, sorted by name.
    pub fn list(&self) -> Vec<FileRecord> {
        let mut files: Vec<FileRecord> = self.catalog.read().values().cloned().collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        files
    }

    pub fn record(&self, name: &str) -> Option<FileRecord> {
        self.catalog.read().get(name).cloned()
    }

    /// Catalog entry and an open handle on the committed content.
    pub fn get(&self, name: &str) -> Result<Option<StoredFile>> {
        let Some(record) = self.record(name) else {
            return Ok(None);
        };
        let path = self.public_path(name);
        let file = File::open(&path).with_context(|| format!("open {}", path.display()))?;
        Ok(Some(StoredFile { record, file }))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.catalog.read().contains_key(name)
    }

    pub fn file_count(&self) -> u32 {
        u32::try_from(self.catalog.read().len()).unwrap_or(u32::MAX)
    }

    pub fn is_valid_name(&self, name: &str) -> bool {
        is_valid_name(name)
    }

    /// Start a staged write of `name`, new or overwrite.
    ///
    /// The caller is expected to hold the write lock for `name` until the
    /// returned handle is committed or dropped.
    pub fn begin_write(&self, name: &str) -> Result<PendingWrite<'_>> {
        if !is_valid_name(name) {
            anyhow::bail!("invalid file name {:?}", name);
        }
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .suffix(STAGING_SUFFIX)
            .tempfile_in(&self.staging_dir)
            .with_context(|| format!("create staging file in {}", self.staging_dir.display()))?;
        tracing::debug!(
            file = name,
            staging = %staging.path().display(),
            overwrite = self.exists(name),
            "staged write started"
        );
        Ok(PendingWrite {
            repo: self,
            name: name.to_string(),
            staging: Some(HashingWriter::new(staging)),
        })
    }
}

fn is_staging_name(name: &str) -> bool {
    name.starts_with(STAGING_PREFIX) && name.ends_with(STAGING_SUFFIX)
}

#[cfg(unix)]
fn is_cross_device(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EXDEV)
}

#[cfg(windows)]
fn is_cross_device(e: &io::Error) -> bool {
    // ERROR_NOT_SAME_DEVICE
    e.raw_os_error() == Some(17)
}

#[cfg(not(any(unix, windows)))]
fn is_cross_device(_e: &io::Error) -> bool {
    false
}

#[cfg(unix)]
fn on_same_device(a: &Path, b: &Path) -> Option<bool> {
    use std::os::unix::fs::MetadataExt;
    let a = std::fs::metadata(a).ok()?;
    let b = std::fs::metadata(b).ok()?;
    Some(a.dev() == b.dev())
}

#[cfg(not(unix))]
fn on_same_device(_a: &Path, _b: &Path) -> Option<bool> {
    None
}

/// Non-empty, not blank, not a dot entry, within the wire limit and free of
/// control and filesystem-reserved characters.
pub fn is_valid_name(name: &str) -> bool {
    !name.trim().is_empty()
        && name != "."
        && name != ".."
        && name.len() <= MAX_NAME_LEN
        && !name
            .chars()
            .any(|c| c.is_control() || RESERVED_CHARS.contains(&c))
}

/// In-flight write to one repository file.
///
/// Content goes to a private staging file and is hashed as it is written.
/// [`commit`](PendingWrite::commit) atomically replaces the public copy and
/// updates the catalog; dropping the handle instead discards everything.
pub struct PendingWrite<'a> {
    repo: &'a FileRepository,
    name: String,
    staging: Option<HashingWriter<NamedTempFile>>,
}

impl PendingWrite<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn written(&self) -> u64 {
        self.staging.as_ref().map_or(0, |w| w.written())
    }

    fn staging_mut(&mut self) -> io::Result<&mut HashingWriter<NamedTempFile>> {
        self.staging
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "staged write already finished"))
    }

    /// Promote the staged content to the public path and record it.
    pub fn commit(mut self) -> Result<FileRecord> {
        let writer = self
            .staging
            .take()
            .context("staged write already finished")?;
        let (mut staged, hash, size) = writer.finish();
        staged.flush().context("flush staging file")?;
        staged.as_file().sync_all().context("sync staging file")?;

        let public = self.repo.public_path(&self.name);
        // Atomic replace: readers see either the old file or the new one
        match staged.persist(&public) {
            Ok(_) => {}
            Err(e) if is_cross_device(&e.error) => {
                let mut staged = e.file;
                self.repo.promote_by_copy(&mut staged, &public)?;
            }
            Err(e) => {
                return Err(e.error).with_context(|| format!("commit {}", public.display()))
            }
        }

        let record = FileRecord {
            name: self.name.clone(),
            hash,
            size,
        };
        self.repo
            .catalog
            .write()
            .insert(self.name.clone(), record.clone());
        tracing::debug!(file = %self.name, size, hash = %to_hex(&hash), "committed");
        Ok(record)
    }

    /// Discard the staged content. Same as dropping the handle.
    pub fn abort(self) {}
}

impl Write for PendingWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.staging_mut()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.staging_mut()?.flush()
    }
}

impl Drop for PendingWrite<'_> {
    fn drop(&mut self) {
        if let Some(writer) = self.staging.take() {
            let (staged, _, written) = writer.finish();
            tracing::debug!(file = %self.name, written, "discarding uncommitted write");
            if let Err(e) = staged.close() {
                tracing::warn!(file = %self.name, error = %e, "could not remove staging file");
            }
        }
    }
}
