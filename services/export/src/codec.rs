//! Directory archive encoding.
//!
//! The pipeline only needs two operations: pack a staging directory into one
//! compressed blob, and unpack such a blob into a target directory. Both are
//! blocking and are run on the blocking thread pool by their callers.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from archive encoding or decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Failed to archive {path}: {source}")]
    Compress { path: PathBuf, source: io::Error },

    #[error("Failed to extract archive into {path}: {source}")]
    Extract { path: PathBuf, source: io::Error },
}

/// Compress/extract a directory of staged files
pub trait ArchiveCodec: Send + Sync {
    /// Pack every file under `dir` into a single compressed archive
    fn compress_directory(&self, dir: &Path) -> Result<Vec<u8>, CodecError>;

    /// Unpack an archive produced by [`ArchiveCodec::compress_directory`] into `target`
    fn decompress_and_extract(
        &self,
        archive: &mut dyn Read,
        target: &Path,
    ) -> Result<(), CodecError>;
}

/// gzip-compressed tar archives
#[derive(Debug, Clone, Copy)]
pub struct TarGzCodec {
    level: Compression,
}

impl TarGzCodec {
    pub fn new() -> Self {
        Self {
            level: Compression::default(),
        }
    }

    /// Use a specific gzip level (0-9)
    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }

    fn append_tree<W: io::Write>(
        builder: &mut tar::Builder<W>,
        dir: &Path,
        prefix: &Path,
    ) -> io::Result<()> {
        let mut entries = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let path = entry.path();
            let name = prefix.join(entry.file_name());
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                builder.append_dir(&name, &path)?;
                Self::append_tree(builder, &path, &name)?;
            } else if file_type.is_file() {
                builder.append_path_with_name(&path, &name)?;
            }
        }

        Ok(())
    }
}

impl Default for TarGzCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveCodec for TarGzCodec {
    fn compress_directory(&self, dir: &Path) -> Result<Vec<u8>, CodecError> {
        let wrap = |source| CodecError::Compress {
            path: dir.to_path_buf(),
            source,
        };

        let encoder = GzEncoder::new(Vec::new(), self.level);
        let mut builder = tar::Builder::new(encoder);
        Self::append_tree(&mut builder, dir, Path::new("")).map_err(wrap)?;

        let encoder = builder.into_inner().map_err(wrap)?;
        encoder.finish().map_err(wrap)
    }

    fn decompress_and_extract(
        &self,
        archive: &mut dyn Read,
        target: &Path,
    ) -> Result<(), CodecError> {
        let wrap = |source| CodecError::Extract {
            path: target.to_path_buf(),
            source,
        };

        fs::create_dir_all(target).map_err(wrap)?;
        let mut archive = tar::Archive::new(GzDecoder::new(archive));
        archive.unpack(target).map_err(wrap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_compress_then_extract_restores_every_file() {
        let source = TempDir::new().unwrap();
        fs::write(source.path().join("metric-1"), b"{\"a\":1}").unwrap();
        fs::write(source.path().join("metric-2"), b"{\"a\":2}").unwrap();
        fs::create_dir(source.path().join("nested")).unwrap();
        fs::write(source.path().join("nested").join("metric-3"), b"{}").unwrap();

        let codec = TarGzCodec::new();
        let archive = codec.compress_directory(source.path()).unwrap();
        assert!(!archive.is_empty());

        let target = TempDir::new().unwrap();
        codec
            .decompress_and_extract(&mut archive.as_slice(), target.path())
            .unwrap();

        assert_eq!(file_names(target.path()), vec!["metric-1", "metric-2", "nested"]);
        assert_eq!(
            fs::read(target.path().join("metric-2")).unwrap(),
            b"{\"a\":2}".to_vec()
        );
        assert_eq!(
            fs::read(target.path().join("nested").join("metric-3")).unwrap(),
            b"{}".to_vec()
        );
    }

    #[test]
    fn test_empty_directory_still_produces_archive() {
        let source = TempDir::new().unwrap();
        let archive = TarGzCodec::with_level(1)
            .compress_directory(source.path())
            .unwrap();
        assert!(!archive.is_empty());
    }

    #[test]
    fn test_missing_directory_fails() {
        let source = TempDir::new().unwrap();
        let missing = source.path().join("gone");
        let result = TarGzCodec::new().compress_directory(&missing);
        assert!(matches!(result, Err(CodecError::Compress { .. })));
    }

    #[test]
    fn test_garbage_input_fails_to_extract() {
        let target = TempDir::new().unwrap();
        let result = TarGzCodec::new()
            .decompress_and_extract(&mut &b"not an archive"[..], target.path());
        assert!(matches!(result, Err(CodecError::Extract { .. })));
    }
}
