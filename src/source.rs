//! Where a loader's units come from.
//!
//! Resolving a source (file picker, remote query) happens outside this
//! crate; a [`SourceDescriptor`] is the already-resolved result.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::error::LoaderError;

/// A remote series and the instances to fetch from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesLocator {
    /// Base address understood by the [`InstanceFetcher`].
    pub endpoint: String,
    pub study_instance_uid: Option<String>,
    pub series_instance_uid: String,
    pub instance_uids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDescriptor {
    LocalFiles(Vec<PathBuf>),
    Remote(SeriesLocator),
}

impl SourceDescriptor {
    /// All `.dcm` files directly inside `path`, sorted by path.
    pub fn from_directory(path: impl AsRef<Path>) -> Result<Self, LoaderError> {
        let path = path.as_ref();
        let entries = fs::read_dir(path).map_err(|err| {
            LoaderError::InvalidArgument(format!("cannot read {}: {err}", path.display()))
        })?;

        let mut paths: Vec<_> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
            })
            .collect();

        if paths.is_empty() {
            return Err(LoaderError::InvalidArgument(format!(
                "no .dcm files in {}",
                path.display()
            )));
        }
        paths.sort();
        Ok(Self::LocalFiles(paths))
    }

    pub fn len(&self) -> usize {
        match self {
            Self::LocalFiles(paths) => paths.len(),
            Self::Remote(locator) => locator.instance_uids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    /// Human-readable name of unit `index`, used in messages and failures.
    pub fn unit_label(&self, index: usize) -> String {
        match self {
            Self::LocalFiles(paths) => paths
                .get(index)
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            Self::Remote(locator) => locator
                .instance_uids
                .get(index)
                .cloned()
                .unwrap_or_default(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), LoaderError> {
        if self.is_empty() {
            return Err(LoaderError::InvalidArgument("source has no units".into()));
        }
        if let Self::Remote(locator) = self {
            if locator.series_instance_uid.is_empty() {
                return Err(LoaderError::InvalidArgument(
                    "remote source needs a series instance UID".into(),
                ));
            }
            if locator.instance_uids.iter().any(String::is_empty) {
                return Err(LoaderError::InvalidArgument("empty instance UID".into()));
            }
        }
        Ok(())
    }
}

/// Transport seam for remote series.
///
/// Implementations stream the Part 10 bytes of one instance into `sink`,
/// chunk by chunk. Once `cancel` fires every write to `sink` fails, so a
/// fetcher that propagates write errors stops at the next chunk even if it
/// never polls the token itself.
pub trait InstanceFetcher: Send + Sync {
    fn fetch(
        &self,
        locator: &SeriesLocator,
        sop_instance_uid: &str,
        sink: &mut dyn Write,
        cancel: &CancellationToken,
    ) -> io::Result<()>;
}

const CANCELLED_WRITE: &str = "load cancelled";

/// Writer that refuses further chunks once the token is cancelled.
pub(crate) struct CancelAwareWriter<'a, W> {
    inner: W,
    cancel: &'a CancellationToken,
    written: u64,
}

impl<'a, W: Write> CancelAwareWriter<'a, W> {
    pub(crate) fn new(inner: W, cancel: &'a CancellationToken) -> Self {
        Self {
            inner,
            cancel,
            written: 0,
        }
    }

    pub(crate) fn written(&self) -> u64 {
        self.written
    }
}

impl<W: Write> Write for CancelAwareWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::other(CANCELLED_WRITE));
        }
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_scan_keeps_only_dcm_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["b.dcm", "a.DCM", "notes.txt", "c"] {
            fs::write(dir.path().join(name), b"x").expect("write");
        }

        let source = SourceDescriptor::from_directory(dir.path()).expect("has dcm files");
        let SourceDescriptor::LocalFiles(paths) = &source else {
            panic!("directory scan yields local files");
        };
        let names: Vec<_> = paths
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .collect();
        assert_eq!(names, vec!["a.DCM", "b.dcm"]);
        assert_eq!(source.len(), 2);
        assert!(!source.is_remote());
    }

    #[test]
    fn empty_directory_is_invalid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = SourceDescriptor::from_directory(dir.path()).expect_err("no files");
        assert_eq!(err.as_label(), "invalid_argument");
    }

    #[test]
    fn validate_rejects_empty_sources() {
        assert!(SourceDescriptor::LocalFiles(vec![]).validate().is_err());
        let remote = SourceDescriptor::Remote(SeriesLocator {
            endpoint: "pacs".into(),
            study_instance_uid: None,
            series_instance_uid: String::new(),
            instance_uids: vec!["1".into()],
        });
        assert!(remote.validate().is_err());
        assert_eq!(remote.unit_label(0), "1");
        assert_eq!(remote.unit_label(5), "");
    }

    #[test]
    fn cancel_aware_writer_stops_after_cancel() {
        let token = CancellationToken::new();
        let mut buf = Vec::new();
        let mut writer = CancelAwareWriter::new(&mut buf, &token);
        writer.write_all(b"abc").expect("first chunk");
        token.cancel();
        let err = writer.write_all(b"def").expect_err("cancelled");
        assert_eq!(err.to_string(), CANCELLED_WRITE);
        assert_eq!(writer.written(), 3);
        assert_eq!(buf, b"abc");
    }
}
