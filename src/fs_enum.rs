use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
// Repository directory enumeration

/// Regular file found directly under the working directory
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    pub name: String,
}

/// Enumerate the files a repository serves.
///
/// The namespace is flat: only regular files directly under `root` count.
/// Subdirectories (including the staging area) and symlinks are skipped, as
/// are names that are not valid UTF-8 or fail `accept`.
pub fn enumerate_files<F>(root: &Path, accept: F) -> Result<Vec<FileEntry>>
where
    F: Fn(&str) -> bool,
{
    use walkdir::WalkDir;

    let mut entries = Vec::new();

    for entry in WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("scan {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = match entry.file_name().to_str() {
            Some(n) if accept(n) => n.to_string(),
            _ => {
                tracing::warn!(path = %entry.path().display(), "skipping file with unusable name");
                continue;
            }
        };
        entries.push(FileEntry {
            path: entry.path().to_path_buf(),
            name,
        });
    }

    Ok(entries)
}

/// Create directory with parent creation
pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path).with_context(|| format!("create {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn lists_only_top_level_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), b"bb").unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        fs::create_dir(dir.path().join(".staging")).unwrap();
        fs::write(dir.path().join(".staging").join("hidden.part"), b"x").unwrap();

        let entries = enumerate_files(dir.path(), |_| true).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
        assert_eq!(entries[1].path, dir.path().join("b.txt"));
    }

    #[test]
    fn rejected_names_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("keep"), b"").unwrap();
        fs::write(dir.path().join("drop"), b"").unwrap();
        let entries = enumerate_files(dir.path(), |n| n != "drop").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "keep");
    }

    #[test]
    fn ensure_dir_exists_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("x").join("y");
        ensure_dir_exists(&nested).unwrap();
        ensure_dir_exists(&nested).unwrap();
        assert!(nested.is_dir());
    }
}
