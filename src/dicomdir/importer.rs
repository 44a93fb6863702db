use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::reader::{read_directory_index, DirectoryRecord};
use crate::common::attributes::{trim_padding, AttributeSet};
use crate::common::error::{ErrorCode, IndexError, PathError, ScanError, SchemaError};
use crate::common::tags;
use crate::query::{matches_coarse, MatchMode};
use crate::scanner::{ScanContext, ScanFailure};
use crate::sorter::{accept_image, PendingSeries};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Root,
    Patient,
    Study,
    Series,
}

/// One open sibling chain. `summary` belongs to the record that owns the
/// chain.
#[derive(Debug)]
struct Frame {
    level: Level,
    next: u32,
    summary: AttributeSet,
}

/// Import every image referenced by the directory index at `path`.
pub(crate) fn import(ctx: &mut ScanContext<'_>, path: &Path) -> Result<(), ScanFailure> {
    info!("Importing directory index {}", path.display());
    let bytes = fs::read(path).map_err(|e| SchemaError::DirectoryIndexIo(path.to_path_buf(), e))?;
    let index = read_directory_index(&bytes).map_err(|source| SchemaError::DirectoryIndex {
        path: path.to_path_buf(),
        source,
    })?;
    let base = path.parent().unwrap_or_else(|| Path::new(""));

    let by_offset: HashMap<u32, usize> = index
        .records
        .iter()
        .enumerate()
        .map(|(i, record)| (record.offset, i))
        .collect();

    let root = match index.root_offset {
        0 => index.records.first().map_or(0, |record| record.offset),
        offset => offset,
    };
    if root != 0 && !by_offset.contains_key(&root) {
        return Err(SchemaError::DirectoryIndex {
            path: path.to_path_buf(),
            source: IndexError::BadRootOffset(root),
        }
        .into());
    }

    let query = ctx.query();
    let total = index.records.len().max(1) as f64;
    let mut visited = vec![false; index.records.len()];
    let mut seen = 0usize;
    let mut pending: Option<PendingSeries> = None;
    let mut stack = vec![Frame {
        level: Level::Root,
        next: root,
        summary: AttributeSet::new(),
    }];

    while let Some(frame) = stack.last_mut() {
        if ctx.is_cancelled() {
            return Ok(());
        }

        let offset = frame.next;
        if offset == 0 {
            let closed = stack.pop();
            if closed.is_some_and(|f| f.level == Level::Series) {
                if let Some(series) = pending.take() {
                    commit(ctx, series)?;
                }
            }
            continue;
        }

        let Some(&i) = by_offset.get(&offset) else {
            frame.next = 0;
            ctx.warn(
                path,
                ErrorCode::DirectoryIndex,
                format!("Dangling record offset {} in {}", offset, path.display()),
            );
            continue;
        };
        if visited[i] {
            frame.next = 0;
            ctx.warn(
                path,
                ErrorCode::DirectoryIndex,
                format!("Record at offset {} in {} is linked twice", offset, path.display()),
            );
            continue;
        }
        visited[i] = true;
        seen += 1;

        let record = &index.records[i];
        frame.next = record.next;
        let level = frame.level;
        ctx.progress(seen as f64 / total);

        match (level, record.kind.as_str()) {
            (Level::Root, "PATIENT") | (Level::Patient, "STUDY") => {
                let summary = summary_attributes(record);
                let accepted = query.map_or(true, |q| {
                    matches_coarse(&summary, q, &mut AttributeSet::new(), MatchMode::Exact)
                });
                if accepted {
                    stack.push(Frame {
                        level: if level == Level::Root { Level::Patient } else { Level::Study },
                        next: record.child,
                        summary,
                    });
                } else {
                    debug!("{} record at offset {} rejected by query", record.kind, offset);
                }
            }
            (Level::Study, "SERIES") => {
                let scope = |level: Level| {
                    stack
                        .iter()
                        .find(|f| f.level == level)
                        .map(|f| f.summary.clone())
                        .unwrap_or_default()
                };
                let series = PendingSeries::from_summaries(
                    scope(Level::Patient),
                    scope(Level::Study),
                    summary_attributes(record),
                    query,
                    MatchMode::Exact,
                );
                if series.rejected {
                    debug!("SERIES record at offset {} rejected by query", offset);
                } else {
                    pending = Some(series);
                    stack.push(Frame {
                        level: Level::Series,
                        next: record.child,
                        summary: AttributeSet::new(),
                    });
                }
            }
            (Level::Series, _) if record.attributes.contains(tags::REFERENCED_FILE_ID) => {
                if let Some(series) = pending.as_mut() {
                    add_image(ctx, base, record, series, query);
                }
            }
            (_, kind) => debug!("Skipping {} record at offset {}", kind, offset),
        }
    }

    debug!("Visited {} of {} directory records", seen, index.records.len());
    Ok(())
}

fn commit(ctx: &mut ScanContext<'_>, series: PendingSeries) -> Result<(), ScanError> {
    if let Some((patient, study, entry)) = series.into_entry(ctx.options.find_level) {
        ctx.catalog.commit_series(patient, study, entry)?;
    }
    Ok(())
}

fn add_image(
    ctx: &mut ScanContext<'_>,
    base: &Path,
    record: &DirectoryRecord,
    series: &mut PendingSeries,
    query: Option<&AttributeSet>,
) {
    let path = match resolve_file_id(base, record.attributes.text(tags::REFERENCED_FILE_ID)) {
        Ok(path) => path,
        Err(e) => {
            ctx.warn(e.path(), e.code(), e.to_string());
            return;
        }
    };

    let image = image_summary(record);
    let matched = accept_image(&image, query, &series.results, || ctx.extract(&path));
    series.push_image(path, image, matched);
}

/// Record attributes without the directory bookkeeping group.
fn summary_attributes(record: &DirectoryRecord) -> AttributeSet {
    record
        .attributes
        .iter()
        .filter(|(tag, _)| tag.group() != 0x0004)
        .map(|(tag, attr)| (tag, attr.clone()))
        .collect()
}

/// Image-level summary; the referenced SOP UIDs stand in for the file's own.
fn image_summary(record: &DirectoryRecord) -> AttributeSet {
    let mut image = summary_attributes(record);
    for (from, to) in [
        (tags::REFERENCED_SOP_CLASS_UID_IN_FILE, tags::SOP_CLASS_UID),
        (tags::REFERENCED_SOP_INSTANCE_UID_IN_FILE, tags::SOP_INSTANCE_UID),
    ] {
        if let Some(attr) = record.attributes.get(from) {
            if !image.contains(to) {
                image.insert(to, attr.clone());
            }
        }
    }
    image
}

/// Turn `\`-separated file-id components into a path below `base`,
/// retrying in lower case for media written by case-insensitive systems.
fn resolve_file_id(base: &Path, file_id: &str) -> Result<PathBuf, PathError> {
    let components: Vec<&str> = file_id.split('\\').map(trim_padding).collect();
    let malformed = components
        .iter()
        .any(|c| c.is_empty() || *c == "." || *c == ".." || c.contains('/'));
    if malformed {
        return Err(PathError::Malformed(base.join(file_id)));
    }

    let path: PathBuf = components.iter().fold(base.to_path_buf(), |p, c| p.join(c));
    if path.exists() {
        return Ok(path);
    }

    let lower: PathBuf = components
        .iter()
        .fold(base.to_path_buf(), |p, c| p.join(c.to_ascii_lowercase()));
    if lower.exists() {
        return Ok(lower);
    }
    Err(PathError::NotFound(path))
}
