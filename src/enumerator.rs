//! Candidate file discovery
//!
//! Walks a root directory (or checks an explicit list of paths) and sorts
//! what it finds into three bins: plain candidate files, directory-index
//! files and relational catalogs.

use std::fs;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobMatcher};
use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::common::error::{PathError, ScanError};
use crate::scanner::{ScanContext, ScanInput, ScanOptions};

/// File name of a directory index at a media root.
pub const DIRECTORY_INDEX_NAME: &str = "DICOMDIR";
/// Extension of relational catalog files.
pub const DATABASE_EXTENSION: &str = "sql";

/// How often the walk polls the cancel flag.
pub(crate) const CANCEL_CHECK_INTERVAL: usize = 64;

#[derive(Debug, Default)]
pub struct Discovery {
    pub files: Vec<PathBuf>,
    pub indexes: Vec<PathBuf>,
    pub databases: Vec<PathBuf>,
    /// The index was found at the root of a directory scan, so a plain
    /// walk of that directory can replace it.
    pub index_at_root: bool,
}

pub struct FileEnumerator {
    depth: usize,
    follow_symlinks: bool,
    pattern: Option<GlobMatcher>,
}

impl FileEnumerator {
    pub fn new(options: &ScanOptions) -> Result<Self, ScanError> {
        let pattern = match &options.file_pattern {
            Some(p) => Some(Glob::new(p)?.compile_matcher()),
            None => None,
        };
        Ok(Self {
            depth: options.scan_depth,
            follow_symlinks: options.follow_symlinks,
            pattern,
        })
    }

    /// Generic candidates exclude the index file itself and dotfiles the
    /// pattern does not name explicitly.
    pub fn is_candidate_name(&self, name: &str) -> bool {
        if name.eq_ignore_ascii_case(DIRECTORY_INDEX_NAME) {
            return false;
        }
        let pattern_ok = self.pattern.as_ref().map_or(true, |m| m.is_match(name));
        if name.starts_with('.') {
            return self.pattern.is_some() && pattern_ok;
        }
        pattern_ok
    }

    /// Discover everything under `input`. With `use_index` off, a
    /// directory index at the root is ignored and the directory is walked.
    pub(crate) fn enumerate(
        &self,
        ctx: &mut ScanContext<'_>,
        input: &ScanInput,
        use_index: bool,
    ) -> Result<Discovery, ScanError> {
        let mut discovery = Discovery::default();
        match input {
            ScanInput::Path(root) => {
                let metadata = root_metadata(root)?;
                if metadata.is_dir() {
                    if use_index {
                        if let Some(index) = find_index(root) {
                            debug!("Found directory index {}", index.display());
                            discovery.indexes.push(index);
                            discovery.index_at_root = true;
                            return Ok(discovery);
                        }
                    }
                    self.walk(ctx, root, &mut discovery);
                } else {
                    classify(root, use_index, &mut discovery);
                }
            }
            ScanInput::Files(paths) => {
                for path in paths {
                    if ctx.is_cancelled() {
                        break;
                    }
                    match fs::metadata(path) {
                        Ok(m) if m.is_dir() => {
                            let e = PathError::IsDirectory(path.clone());
                            ctx.warn(path, e.code(), e.to_string());
                        }
                        Ok(_) => classify(path, use_index, &mut discovery),
                        Err(err) => {
                            let e = PathError::from_io(path, err);
                            ctx.warn(path, e.code(), e.to_string());
                        }
                    }
                }
            }
        }

        debug!(
            "Discovered {} candidate files, {} indexes, {} databases",
            discovery.files.len(),
            discovery.indexes.len(),
            discovery.databases.len()
        );
        Ok(discovery)
    }

    fn walk(&self, ctx: &mut ScanContext<'_>, root: &Path, discovery: &mut Discovery) {
        if let Ok(real) = root.canonicalize() {
            ctx.catalog.mark_visited(real);
        }

        let mut walker = WalkDir::new(root)
            .follow_links(self.follow_symlinks)
            .max_depth(self.depth)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()))
            .into_iter();

        let mut count = 0usize;
        while let Some(entry) = walker.next() {
            count += 1;
            if count % CANCEL_CHECK_INTERVAL == 0 && ctx.is_cancelled() {
                return;
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    if let Some(ancestor) = err.loop_ancestor() {
                        debug!("Symlink loop back to {}", ancestor.display());
                        continue;
                    }
                    let path = err.path().map_or_else(|| root.to_path_buf(), Path::to_path_buf);
                    let e = match err.into_io_error() {
                        Some(io) => PathError::from_io(&path, io),
                        None => PathError::Malformed(path),
                    };
                    ctx.warn(e.path(), e.code(), e.to_string());
                    continue;
                }
            };
            if entry.depth() == 0 {
                continue;
            }

            let name = entry.file_name().to_string_lossy();
            if entry.file_type().is_dir() {
                if name.starts_with('.') {
                    walker.skip_current_dir();
                    continue;
                }
                if let Ok(real) = entry.path().canonicalize() {
                    if !ctx.catalog.mark_visited(real) {
                        debug!("Already visited {}", entry.path().display());
                        walker.skip_current_dir();
                    }
                }
                continue;
            }
            if !entry.file_type().is_file() {
                trace!("Skipping {}: not a regular file", entry.path().display());
                continue;
            }

            if self.is_candidate_name(&name) {
                discovery.files.push(entry.into_path());
            }
        }
    }
}

fn root_metadata(root: &Path) -> Result<fs::Metadata, PathError> {
    if root.as_os_str().is_empty() {
        return Err(PathError::Malformed(root.to_path_buf()));
    }
    fs::metadata(root).map_err(|e| PathError::from_io(root, e))
}

fn find_index(root: &Path) -> Option<PathBuf> {
    fs::read_dir(root)
        .ok()?
        .filter_map(Result::ok)
        .find(|entry| {
            entry.file_name().to_string_lossy().eq_ignore_ascii_case(DIRECTORY_INDEX_NAME)
                && entry.path().is_file()
        })
        .map(|entry| entry.path())
}

/// Sort one explicitly named file into its bin.
fn classify(path: &Path, use_index: bool, discovery: &mut Discovery) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let is_database = path
        .extension()
        .is_some_and(|ext| ext.to_string_lossy().eq_ignore_ascii_case(DATABASE_EXTENSION));

    if use_index && name.eq_ignore_ascii_case(DIRECTORY_INDEX_NAME) {
        discovery.indexes.push(path.to_path_buf());
    } else if is_database {
        discovery.databases.push(path.to_path_buf());
    } else {
        discovery.files.push(path.to_path_buf());
    }
}
