//! On-disk cache for remotely fetched instances.
//!
//! Layout: `<root>/<series uid>/<sop instance uid>.dcm`.
//!
//! Writes go to a hidden staging file in the series directory and are
//! renamed into place by [`StagedEntry::commit`]. Dropping an uncommitted
//! entry (cancellation, fetch failure) deletes the staging file, so a
//! partially written instance never appears under its final name.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

#[derive(Debug, Clone)]
pub struct SeriesCache {
    root: PathBuf,
}

impl SeriesCache {
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, series_instance_uid: &str, sop_instance_uid: &str) -> PathBuf {
        self.root
            .join(file_component(series_instance_uid))
            .join(format!("{}.dcm", file_component(sop_instance_uid)))
    }

    /// Path of a committed entry, if any.
    pub fn lookup(&self, series_instance_uid: &str, sop_instance_uid: &str) -> Option<PathBuf> {
        let path = self.path_for(series_instance_uid, sop_instance_uid);
        path.is_file().then_some(path)
    }

    /// Removes a committed entry. Returns whether one existed.
    pub fn evict(&self, series_instance_uid: &str, sop_instance_uid: &str) -> io::Result<bool> {
        match std::fs::remove_file(self.path_for(series_instance_uid, sop_instance_uid)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn stage(&self, series_instance_uid: &str, sop_instance_uid: &str) -> io::Result<StagedEntry> {
        let target = self.path_for(series_instance_uid, sop_instance_uid);
        let dir = target.parent().unwrap_or(&self.root);
        std::fs::create_dir_all(dir)?;
        let file = tempfile::Builder::new()
            .prefix(".staging-")
            .suffix(".part")
            .tempfile_in(dir)?;
        Ok(StagedEntry { file, target })
    }
}

/// An in-progress cache write.
#[derive(Debug)]
pub struct StagedEntry {
    file: NamedTempFile,
    target: PathBuf,
}

impl StagedEntry {
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Where the bytes are staged until [`Self::commit`].
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Flushes and atomically moves the entry to its final path.
    pub fn commit(mut self) -> io::Result<PathBuf> {
        self.file.flush()?;
        self.file.as_file().sync_all()?;
        self.file.persist(&self.target).map_err(|err| err.error)?;
        Ok(self.target)
    }
}

impl Write for StagedEntry {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn file_component(uid: &str) -> String {
    let cleaned: String = uid
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = std::fs::read_dir(dir)
            .map(|rd| {
                rd.filter_map(Result::ok)
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    #[test]
    fn commit_moves_entry_into_place() {
        let root = tempfile::tempdir().expect("tempdir");
        let cache = SeriesCache::open(root.path()).expect("cache");
        assert!(cache.lookup("1.2", "1.2.3").is_none());

        let mut entry = cache.stage("1.2", "1.2.3").expect("stage");
        entry.write_all(b"payload").expect("write");
        let path = entry.commit().expect("commit");

        assert_eq!(cache.lookup("1.2", "1.2.3"), Some(path.clone()));
        assert_eq!(std::fs::read(&path).expect("read"), b"payload");
        assert_eq!(entries(&root.path().join("1.2")), vec!["1.2.3.dcm"]);
    }

    #[test]
    fn dropped_entry_leaves_nothing_behind() {
        let root = tempfile::tempdir().expect("tempdir");
        let cache = SeriesCache::open(root.path()).expect("cache");

        let mut entry = cache.stage("1.2", "1.2.4").expect("stage");
        entry.write_all(b"half of it").expect("write");
        drop(entry);

        assert!(cache.lookup("1.2", "1.2.4").is_none());
        assert!(entries(&root.path().join("1.2")).is_empty());
    }

    #[test]
    fn staged_bytes_are_readable_before_commit() {
        let root = tempfile::tempdir().expect("tempdir");
        let cache = SeriesCache::open(root.path()).expect("cache");

        let mut entry = cache.stage("1.2", "1.2.5").expect("stage");
        entry.write_all(b"payload").expect("write");
        entry.flush().expect("flush");
        assert_ne!(entry.path(), entry.target());
        assert_eq!(std::fs::read(entry.path()).expect("read"), b"payload");
        assert!(cache.lookup("1.2", "1.2.5").is_none());
    }

    #[test]
    fn evict_removes_committed_entry() {
        let root = tempfile::tempdir().expect("tempdir");
        let cache = SeriesCache::open(root.path()).expect("cache");
        let mut entry = cache.stage("1.2", "1.2.6").expect("stage");
        entry.write_all(b"payload").expect("write");
        entry.commit().expect("commit");

        assert!(cache.evict("1.2", "1.2.6").expect("evict"));
        assert!(cache.lookup("1.2", "1.2.6").is_none());
        assert!(!cache.evict("1.2", "1.2.6").expect("evict again"));
    }

    #[test]
    fn uids_are_sanitised_for_paths() {
        let cache = SeriesCache {
            root: PathBuf::from("/cache"),
        };
        assert_eq!(
            cache.path_for("../evil", "a/b"),
            PathBuf::from("/cache/.._evil/a_b.dcm")
        );
        assert_eq!(cache.path_for("..", ""), PathBuf::from("/cache/_/_.dcm"));
    }
}
