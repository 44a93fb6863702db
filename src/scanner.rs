//! Scan orchestration: options, events, cancellation and progress.
//!
//! A scan runs synchronously on the calling thread. Relational catalogs are
//! imported first, then directory-index files, then the remaining candidate
//! files are decoded and sorted. Everything ends up in one `Catalog`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::catalog::Catalog;
use crate::common::attributes::AttributeSet;
use crate::common::error::{ErrorCode, ScanError, SchemaError};
use crate::decoder::{Decoder, DicomFileDecoder};
use crate::dicomdir;
use crate::enumerator::{Discovery, FileEnumerator};
use crate::extractor::RecordExtractor;
use crate::query::is_trivial;
use crate::relational;
use crate::sorter::HierarchicalSorter;

/// Granularity of query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FindLevel {
    /// A series is kept whole once any of its images matches.
    #[default]
    Series,
    /// Only the matching images of a series are kept.
    Image,
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Directory levels below the root to visit; 1 means the root's files only.
    pub scan_depth: usize,
    pub follow_symlinks: bool,
    /// Glob applied to file names.
    pub file_pattern: Option<String>,
    pub require_pixel_data: bool,
    pub query: Option<AttributeSet>,
    pub find_level: FindLevel,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            scan_depth: 1,
            follow_symlinks: true,
            file_pattern: None,
            require_pixel_data: true,
            query: None,
            find_level: FindLevel::Series,
        }
    }
}

impl ScanOptions {
    pub fn with_scan_depth(mut self, depth: usize) -> Self {
        self.scan_depth = depth;
        self
    }

    pub fn with_follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    pub fn with_file_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.file_pattern = Some(pattern.into());
        self
    }

    pub fn with_require_pixel_data(mut self, require: bool) -> Self {
        self.require_pixel_data = require;
        self
    }

    pub fn with_query(mut self, query: AttributeSet) -> Self {
        self.query = Some(query);
        self
    }

    pub fn with_find_level(mut self, level: FindLevel) -> Self {
        self.find_level = level;
        self
    }
}

/// What to scan.
#[derive(Debug, Clone)]
pub enum ScanInput {
    /// A directory, a single file, a directory-index file or a database.
    Path(PathBuf),
    /// An explicit list of files.
    Files(Vec<PathBuf>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    Started,
    Progress(f64),
    Warning {
        path: PathBuf,
        code: ErrorCode,
        message: String,
    },
    Finished,
}

/// Maps phase-local fractions onto one monotonic overall fraction and
/// drops updates smaller than one percent.
#[derive(Debug)]
pub(crate) struct ProgressReporter {
    last: f64,
    lo: f64,
    hi: f64,
}

impl ProgressReporter {
    const STEP: f64 = 0.01;

    pub fn new() -> Self {
        Self {
            last: 0.0,
            lo: 0.0,
            hi: 1.0,
        }
    }

    pub fn phase(&mut self, lo: f64, hi: f64) {
        self.lo = lo.clamp(0.0, 1.0);
        self.hi = hi.clamp(self.lo, 1.0);
    }

    /// Returns the overall fraction when it is worth reporting.
    pub fn update(&mut self, fraction: f64) -> Option<f64> {
        let overall = self.lo + fraction.clamp(0.0, 1.0) * (self.hi - self.lo);
        if overall >= 1.0 && self.last < 1.0 {
            self.last = 1.0;
            return Some(1.0);
        }
        if overall >= self.last + Self::STEP {
            self.last = overall;
            return Some(overall);
        }
        None
    }
}

/// State threaded through one scan.
pub(crate) struct ScanContext<'a> {
    pub catalog: Catalog,
    pub options: &'a ScanOptions,
    extractor: RecordExtractor<'a>,
    observer: &'a mut dyn FnMut(&ScanEvent),
    cancel: &'a AtomicBool,
    progress: ProgressReporter,
}

impl<'a> ScanContext<'a> {
    pub fn new(
        options: &'a ScanOptions,
        decoder: &'a dyn Decoder,
        observer: &'a mut dyn FnMut(&ScanEvent),
        cancel: &'a AtomicBool,
    ) -> Self {
        Self {
            catalog: Catalog::new(),
            options,
            extractor: RecordExtractor::new(decoder, options.require_pixel_data),
            observer,
            cancel,
            progress: ProgressReporter::new(),
        }
    }

    /// The active query, or `None` when it constrains nothing.
    pub fn query(&self) -> Option<&'a AttributeSet> {
        let options: &'a ScanOptions = self.options;
        options.query.as_ref().filter(|q| !is_trivial(q))
    }

    pub fn is_cancelled(&mut self) -> bool {
        if self.cancel.load(Ordering::Relaxed) {
            self.catalog.set_cancelled();
            true
        } else {
            false
        }
    }

    /// Relay a recoverable problem and record it in the sticky slot.
    pub fn warn(&mut self, path: &Path, code: ErrorCode, message: String) {
        warn!("{}", message);
        self.catalog.record_error(code, path);
        (self.observer)(&ScanEvent::Warning {
            path: path.to_path_buf(),
            code,
            message,
        });
    }

    pub fn phase(&mut self, lo: f64, hi: f64) {
        self.progress.phase(lo, hi);
    }

    pub fn progress(&mut self, fraction: f64) {
        if let Some(value) = self.progress.update(fraction) {
            (self.observer)(&ScanEvent::Progress(value));
        }
    }

    /// Decode one file through the record extractor. Files without the
    /// expected signature are skipped silently; other failures are warned.
    pub fn extract(&mut self, path: &Path) -> Option<AttributeSet> {
        match self.extractor.extract(path) {
            Ok(record) => record,
            Err(e) => {
                self.warn(path, e.code(), e.to_string());
                None
            }
        }
    }
}

/// Builds a `Catalog` from files, directory-index files and relational
/// catalogs.
pub struct CatalogScanner<D: Decoder = DicomFileDecoder> {
    options: ScanOptions,
    decoder: D,
    cancel: Arc<AtomicBool>,
}

impl CatalogScanner<DicomFileDecoder> {
    pub fn new(options: ScanOptions) -> Self {
        Self::with_decoder(options, DicomFileDecoder)
    }
}

impl<D: Decoder> CatalogScanner<D> {
    pub fn with_decoder(options: ScanOptions, decoder: D) -> Self {
        Self {
            options,
            decoder,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Flag that stops a running scan at its next check.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn scan(&self, input: &ScanInput) -> Result<Catalog, ScanError> {
        self.scan_with_observer(input, |_| {})
    }

    pub fn scan_with_observer<F>(&self, input: &ScanInput, mut observer: F) -> Result<Catalog, ScanError>
    where
        F: FnMut(&ScanEvent),
    {
        self.cancel.store(false, Ordering::Relaxed);
        info!("Starting catalog scan of {:?}", input);
        observer(&ScanEvent::Started);

        let mut ctx = ScanContext::new(&self.options, &self.decoder, &mut observer, &self.cancel);
        if let Err(e) = run_scan(&mut ctx, input) {
            error!("Catalog scan failed: {}", e);
            return Err(e);
        }

        if !ctx.catalog.was_cancelled() {
            ctx.phase(0.0, 1.0);
            ctx.progress(1.0);
        }
        let catalog = ctx.catalog;
        observer(&ScanEvent::Finished);

        info!(
            "Catalog scan finished: {} patients, {} studies, {} series, {} files{}",
            catalog.number_of_patients(),
            catalog.number_of_studies(),
            catalog.number_of_series(),
            catalog.number_of_files(),
            if catalog.was_cancelled() { " (cancelled)" } else { "" }
        );
        Ok(catalog)
    }
}

fn run_scan(ctx: &mut ScanContext<'_>, input: &ScanInput) -> Result<(), ScanError> {
    let enumerator = FileEnumerator::new(ctx.options)?;
    let mut discovery = enumerator.enumerate(ctx, input, true)?;
    if ctx.is_cancelled() {
        return Ok(());
    }

    let phases = (discovery.databases.len() + discovery.indexes.len() + 1) as f64;
    let mut phase = 0.0;

    for database in std::mem::take(&mut discovery.databases) {
        ctx.phase(phase / phases, (phase + 1.0) / phases);
        phase += 1.0;
        match relational::import(ctx, &database) {
            Ok(()) => {}
            Err(ScanFailure::Fatal(e)) => return Err(e),
            Err(ScanFailure::Schema(e)) => ctx.warn(&database, e.code(), e.to_string()),
        }
        if ctx.is_cancelled() {
            return Ok(());
        }
    }

    for index in std::mem::take(&mut discovery.indexes) {
        ctx.phase(phase / phases, (phase + 1.0) / phases);
        phase += 1.0;
        match dicomdir::import(ctx, &index) {
            Ok(()) => {}
            Err(ScanFailure::Fatal(e)) => return Err(e),
            Err(ScanFailure::Schema(e)) => {
                ctx.warn(&index, e.code(), e.to_string());
                if discovery.index_at_root {
                    debug!("Falling back to a plain directory scan");
                    let Discovery { files, .. } = enumerator.enumerate(ctx, input, false)?;
                    discovery.files.extend(files);
                }
            }
        }
        if ctx.is_cancelled() {
            return Ok(());
        }
    }

    ctx.phase(phase / phases, 1.0);
    sort_files(ctx, discovery.files)
}

fn sort_files(ctx: &mut ScanContext<'_>, files: Vec<PathBuf>) -> Result<(), ScanError> {
    let query = ctx.query();
    let total = files.len().max(1) as f64;
    let mut sorter = HierarchicalSorter::new();

    for (i, path) in files.into_iter().enumerate() {
        if ctx.is_cancelled() {
            return Ok(());
        }
        ctx.progress(i as f64 / total);
        if let Some(attrs) = ctx.extract(&path) {
            sorter.add_file(path, attrs, query);
        }
    }

    debug!("Sorted files into {} candidate series", sorter.number_of_open_series());
    sorter.commit(&mut ctx.catalog, ctx.options.find_level)
}

/// Failure of an importer pass: a schema problem falls back, anything
/// else aborts the scan.
#[derive(Debug)]
pub(crate) enum ScanFailure {
    Schema(SchemaError),
    Fatal(ScanError),
}

impl From<ScanError> for ScanFailure {
    fn from(e: ScanError) -> Self {
        ScanFailure::Fatal(e)
    }
}

impl From<SchemaError> for ScanFailure {
    fn from(e: SchemaError) -> Self {
        ScanFailure::Schema(e)
    }
}
