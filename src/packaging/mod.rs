//! Notebook archive packaging
//!
//! Each node's notebook directory is bundled into a gzip-compressed tarball
//! whose single top-level entry is the archive id. Workers unpack it with
//! `tar -zxvf <archive> --strip-components=1`, which puts the directory contents at the
//! unpack root, so the layout produced here must stay exactly like this.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, TimeZone};
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::graph::Node;

/// Timestamp layout shared by archive names, pipeline names and job names
pub const STAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Hex digits of the submission id folded into every stamp
const SUBMISSION_ID_LEN: usize = 8;

/// Errors that can occur while building an archive
#[derive(Error, Debug)]
pub enum PackagingError {
    #[error("Notebook not found: {0}")]
    SourceNotFound(PathBuf),

    #[error("Notebook '{0}' resolves outside the source root")]
    OutsideSourceRoot(String),

    #[error("Failed to read {path}: {source}")]
    ReadSource {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write archive {path}: {source}")]
    WriteArchive {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Packaging worker failed: {0}")]
    Worker(String),
}

/// Timestamp plus submission id, captured once per submission.
///
/// Two submissions started within the same second still get distinct
/// stamps, so their archive keys and engine names never collide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionStamp(String);

impl SubmissionStamp {
    pub fn now() -> Self {
        Self::new(&Local::now(), Uuid::new_v4())
    }

    pub fn new<Tz: TimeZone>(at: &DateTime<Tz>, submission_id: Uuid) -> Self
    where
        Tz::Offset: std::fmt::Display,
    {
        let id = submission_id.simple().to_string();
        Self(format!(
            "{}-{}",
            at.format(STAMP_FORMAT),
            &id[..SUBMISSION_ID_LEN]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Archive file name, also used as object key and as the archive's top-level entry.
///
/// Keyed by pipeline, step name and submission stamp so that no two nodes
/// share an object key, within a submission or across submissions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArchiveId(String);

impl ArchiveId {
    pub fn new(pipeline_name: &str, node_name: &str, stamp: &SubmissionStamp) -> Self {
        Self(format!(
            "{}-{}-{}.tar.gz",
            pipeline_name,
            node_name,
            stamp.as_str()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ArchiveId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A built archive waiting to be uploaded
#[derive(Debug, Clone)]
pub struct PackagedArchive {
    pub node_id: String,
    pub archive_id: ArchiveId,
    pub local_path: PathBuf,
    /// Hex SHA-256 of the archive file
    pub sha256: String,
}

/// Hex SHA-256 of a file's contents
pub fn file_sha256(path: &Path) -> Result<String, PackagingError> {
    let mut file = File::open(path).map_err(|source| PackagingError::ReadSource {
        path: path.to_path_buf(),
        source,
    })?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|source| PackagingError::ReadSource {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(hex::encode(hasher.finalize()))
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Write `source_dir` into `<out_dir>/<archive_id>` as a `.tar.gz`.
///
/// Entries are added in sorted order. Anything below `out_dir` is skipped so
/// a work directory nested in the notebook directory never archives itself.
pub fn build_archive(
    source_dir: &Path,
    archive_id: &ArchiveId,
    out_dir: &Path,
) -> Result<PathBuf, PackagingError> {
    let read_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| PackagingError::ReadSource { path, source }
    };

    let source_dir = source_dir.canonicalize().map_err(read_err(source_dir))?;
    let dest = out_dir.join(archive_id.as_str());
    let write_err = |source| PackagingError::WriteArchive {
        path: dest.clone(),
        source,
    };

    fs::create_dir_all(out_dir).map_err(write_err)?;
    let exclude = out_dir.canonicalize().map_err(write_err)?;

    let file = File::create(&dest).map_err(write_err)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

    let root = PathBuf::from(archive_id.as_str());
    builder
        .append_dir(&root, &source_dir)
        .map_err(read_err(&source_dir))?;
    append_tree(&mut builder, &source_dir, &root, &exclude)?;

    let encoder = builder.into_inner().map_err(write_err)?;
    let mut file = encoder.finish().map_err(write_err)?;
    file.flush().map_err(write_err)?;

    debug!(archive = %archive_id, source = %source_dir.display(), "archive written");
    Ok(dest)
}

fn append_tree<W: Write>(
    builder: &mut tar::Builder<W>,
    dir: &Path,
    prefix: &Path,
    exclude: &Path,
) -> Result<(), PackagingError> {
    let read_err = |source| PackagingError::ReadSource {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = fs::read_dir(dir)
        .map_err(read_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(read_err)?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        if path.starts_with(exclude) {
            continue;
        }
        let name = prefix.join(entry.file_name());
        let file_type = entry.file_type().map_err(read_err)?;

        if file_type.is_dir() {
            builder.append_dir(&name, &path).map_err(read_err)?;
            append_tree(builder, &path, &name, exclude)?;
        } else {
            builder
                .append_path_with_name(&path, &name)
                .map_err(|source| PackagingError::ReadSource { path, source })?;
        }
    }

    Ok(())
}

/// Builds one archive per node under a per-submission work directory
#[derive(Debug, Clone)]
pub struct Packager {
    source_root: PathBuf,
    out_dir: PathBuf,
}

impl Packager {
    pub fn new(source_root: impl Into<PathBuf>, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            out_dir: out_dir.into(),
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Directory holding the node's notebook; this whole directory is archived.
    ///
    /// The notebook must resolve, symlinks included, to a file below the
    /// source root. Absolute paths and `..` escapes are rejected.
    pub fn source_dir(&self, node: &Node) -> Result<PathBuf, PackagingError> {
        let notebook = self.source_root.join(&node.source_ref);
        if !notebook.is_file() {
            return Err(PackagingError::SourceNotFound(notebook));
        }

        let root = self
            .source_root
            .canonicalize()
            .map_err(|source| PackagingError::ReadSource {
                path: self.source_root.clone(),
                source,
            })?;
        let notebook = notebook
            .canonicalize()
            .map_err(|source| PackagingError::ReadSource {
                path: notebook.clone(),
                source,
            })?;
        if !notebook.starts_with(&root) {
            return Err(PackagingError::OutsideSourceRoot(node.source_ref.clone()));
        }

        Ok(notebook.parent().map(Path::to_path_buf).unwrap_or(root))
    }

    /// Package a node's notebook directory. Blocking.
    pub fn package(
        &self,
        pipeline_name: &str,
        node: &Node,
        stamp: &SubmissionStamp,
    ) -> Result<PackagedArchive, PackagingError> {
        let archive_id = ArchiveId::new(pipeline_name, node.name(), stamp);
        let source_dir = self.source_dir(node)?;
        debug!(
            node = %node.id,
            archive = %archive_id,
            source = %source_dir.display(),
            "creating archive"
        );
        let local_path = build_archive(&source_dir, &archive_id, &self.out_dir)?;
        let sha256 = file_sha256(&local_path)?;

        Ok(PackagedArchive {
            node_id: node.id.clone(),
            archive_id,
            local_path,
            sha256,
        })
    }
}
