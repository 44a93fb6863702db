//! Hierarchical sorter: groups decoded files into series and orders them.
//!
//! Each level (patient, study, series) is compared by an identity key (ID or
//! UID) when both sides have one, and by an ordering key otherwise. Two
//! entries are the same only if their identity keys are equal, or both are
//! empty and the ordering keys are equal.

use std::cmp::Ordering;
use std::path::PathBuf;

use dicom_core::Tag;
use tracing::{debug, trace};

use crate::catalog::Catalog;
use crate::common::attributes::AttributeSet;
use crate::common::error::ScanError;
use crate::common::tags;
use crate::common::types::{ImageRecord, SeriesEntry, SeriesMetadata};
use crate::query::{matches_coarse, matches_full, matches_image, ImageMatch, MatchMode};
use crate::scanner::FindLevel;

/// Comparison key for one level of the hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelKey {
    identity: String,
    ordering: String,
    number: Option<i64>,
}

impl LevelKey {
    pub fn patient(attrs: &AttributeSet) -> Self {
        let id = attrs.text(tags::PATIENT_ID);
        let ordering = if id.is_empty() {
            attrs.text(tags::PATIENT_NAME)
        } else {
            id
        };
        Self {
            identity: id.to_string(),
            ordering: ordering.to_string(),
            number: None,
        }
    }

    pub fn study(attrs: &AttributeSet) -> Self {
        Self {
            identity: attrs.text(tags::STUDY_INSTANCE_UID).to_string(),
            ordering: format!(
                "{}{}",
                attrs.text(tags::STUDY_DATE),
                attrs.text(tags::STUDY_TIME)
            ),
            number: None,
        }
    }

    pub fn series(attrs: &AttributeSet) -> Self {
        Self {
            identity: attrs.text(tags::SERIES_INSTANCE_UID).to_string(),
            ordering: String::new(),
            number: attrs.int(tags::SERIES_NUMBER),
        }
    }

    pub fn compare(&self, other: &Self) -> Ordering {
        let both_identified = !self.identity.is_empty() && !other.identity.is_empty();
        if both_identified && self.identity == other.identity {
            return Ordering::Equal;
        }

        let by_order = self
            .ordering
            .cmp(&other.ordering)
            .then(self.number.cmp(&other.number));
        if by_order != Ordering::Equal {
            return by_order;
        }

        // ordering keys tie: only two unidentified entries are the same
        self.identity.cmp(&other.identity)
    }
}

/// Patient, study and series keys of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub patient: LevelKey,
    pub study: LevelKey,
    pub series: LevelKey,
}

impl SortKey {
    pub fn from_attributes(attrs: &AttributeSet) -> Self {
        Self {
            patient: LevelKey::patient(attrs),
            study: LevelKey::study(attrs),
            series: LevelKey::series(attrs),
        }
    }

    pub fn compare(&self, other: &Self) -> Ordering {
        self.compare_study(other)
            .then_with(|| self.series.compare(&other.series))
    }

    /// Patient and study levels only.
    pub fn compare_study(&self, other: &Self) -> Ordering {
        self.patient
            .compare(&other.patient)
            .then_with(|| self.study.compare(&other.study))
    }

    pub fn same_study(&self, other: &Self) -> bool {
        self.compare_study(other) == Ordering::Equal
    }
}

fn is_summary_tag(tag: Tag) -> bool {
    tags::PATIENT_TAGS.contains(&tag)
        || tags::STUDY_TAGS.contains(&tag)
        || tags::SERIES_TAGS.contains(&tag)
}

/// Per-image part of a decoded file: everything not in a summary record.
pub(crate) fn image_attributes(attrs: &AttributeSet) -> AttributeSet {
    attrs
        .iter()
        .filter(|(tag, _)| !is_summary_tag(*tag))
        .map(|(tag, attr)| (tag, attr.clone()))
        .collect()
}

#[derive(Debug)]
struct PendingImage {
    path: PathBuf,
    record: ImageRecord,
    attributes: AttributeSet,
    matched: bool,
}

/// A series under construction, shared by the file sorter and both
/// importers.
#[derive(Debug)]
pub(crate) struct PendingSeries {
    pub key: SortKey,
    pub patient: AttributeSet,
    pub study: AttributeSet,
    pub series: AttributeSet,
    /// Query attributes already verified against the summary records.
    pub results: AttributeSet,
    /// The summary records failed the query; no image can match.
    pub rejected: bool,
    images: Vec<PendingImage>,
}

impl PendingSeries {
    pub fn from_summaries(
        patient: AttributeSet,
        study: AttributeSet,
        series: AttributeSet,
        query: Option<&AttributeSet>,
        mode: MatchMode,
    ) -> Self {
        let mut results = AttributeSet::new();
        let rejected = match query {
            Some(q) => {
                !(matches_coarse(&patient, q, &mut results, mode)
                    && matches_coarse(&study, q, &mut results, mode)
                    && matches_coarse(&series, q, &mut results, mode))
            }
            None => false,
        };

        let mut key_source = patient.clone();
        key_source.merge(&study);
        key_source.merge(&series);

        Self {
            key: SortKey::from_attributes(&key_source),
            patient,
            study,
            series,
            results,
            rejected,
            images: Vec::new(),
        }
    }

    /// Seed a series from the first decoded file that belongs to it.
    pub fn from_file(attrs: &AttributeSet, query: Option<&AttributeSet>) -> Self {
        Self::from_summaries(
            attrs.select(tags::PATIENT_TAGS),
            attrs.select(tags::STUDY_TAGS),
            attrs.select(tags::SERIES_TAGS),
            query,
            MatchMode::Exact,
        )
    }

    pub fn has_match(&self) -> bool {
        self.images.iter().any(|image| image.matched)
    }

    /// Insert after every image with an equal or lower instance number.
    pub fn push_image(&mut self, path: PathBuf, attributes: AttributeSet, matched: bool) {
        let record = ImageRecord::from_attributes(&attributes);
        let at = self
            .images
            .partition_point(|image| image.record.instance_number <= record.instance_number);
        self.images.insert(
            at,
            PendingImage {
                path,
                record,
                attributes,
                matched,
            },
        );
    }

    /// Finish the series. Returns the patient and study summaries with the
    /// entry, or `None` when nothing in it satisfied the query.
    pub fn into_entry(self, find_level: FindLevel) -> Option<(AttributeSet, AttributeSet, SeriesEntry)> {
        if self.rejected || !self.has_match() {
            return None;
        }

        let images: Vec<PendingImage> = match find_level {
            FindLevel::Series => self.images,
            FindLevel::Image => self.images.into_iter().filter(|i| i.matched).collect(),
        };

        let mut shared = self.patient.clone();
        shared.merge(&self.study);
        shared.merge(&self.series);

        let mut files = Vec::with_capacity(images.len());
        let mut records = Vec::with_capacity(images.len());
        let mut per_image = Vec::with_capacity(images.len());
        for image in images {
            files.push(image.path);
            records.push(image.record);
            per_image.push(image.attributes);
        }

        let entry = SeriesEntry {
            uid: self.series.text(tags::SERIES_INSTANCE_UID).to_string(),
            number: self.series.int(tags::SERIES_NUMBER),
            files,
            images: records,
            metadata: SeriesMetadata {
                shared,
                images: per_image,
            },
        };
        Some((self.patient, self.study, entry))
    }
}

/// Decide whether one image satisfies the query. `full` is consulted only
/// when the image record and the known results cannot settle it; it returns
/// the fully decoded attributes, or `None` if they are unavailable.
pub(crate) fn accept_image<F>(
    image: &AttributeSet,
    query: Option<&AttributeSet>,
    known: &AttributeSet,
    full: F,
) -> bool
where
    F: FnOnce() -> Option<AttributeSet>,
{
    let Some(query) = query else {
        return true;
    };
    match matches_image(image, query, known) {
        ImageMatch::FullyMatched => true,
        ImageMatch::Rejected => false,
        ImageMatch::Undetermined => match full() {
            Some(attrs) => matches_full(&attrs, query, known),
            None => false,
        },
    }
}

/// Groups a stream of decoded files into ordered series.
#[derive(Debug, Default)]
pub struct HierarchicalSorter {
    open: Vec<PendingSeries>,
}

impl HierarchicalSorter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn number_of_open_series(&self) -> usize {
        self.open.len()
    }

    /// Add one decoded file.
    pub fn add_file(&mut self, path: PathBuf, attrs: AttributeSet, query: Option<&AttributeSet>) {
        let key = SortKey::from_attributes(&attrs);

        let index = match self
            .open
            .iter()
            .position(|s| s.key.compare(&key) == Ordering::Equal)
        {
            Some(index) => index,
            None => {
                let at = self.insertion_point(&key);
                trace!("New series at position {} for {}", at, path.display());
                self.open.insert(at, PendingSeries::from_file(&attrs, query));
                at
            }
        };

        let series = &mut self.open[index];
        if series.rejected {
            trace!("Skipping {}: series rejected by query", path.display());
            return;
        }

        let image = image_attributes(&attrs);
        let matched = accept_image(
            &image.select(tags::IMAGE_TAGS),
            query,
            &series.results,
            || Some(attrs),
        );
        series.push_image(path, image, matched);
    }

    /// Where a new series goes. Series of one study stay contiguous even
    /// when their study dates differ: a known study takes the series inside
    /// its own run, a new study goes before the first run that sorts after it.
    fn insertion_point(&self, key: &SortKey) -> usize {
        if let Some(start) = self.open.iter().position(|s| s.key.same_study(key)) {
            let run = self.run_length(start);
            return start
                + self.open[start..start + run]
                    .partition_point(|s| s.key.series.compare(&key.series) == Ordering::Less);
        }

        let mut at = 0;
        while at < self.open.len() {
            if self.open[at].key.compare_study(key) == Ordering::Greater {
                break;
            }
            at += self.run_length(at);
        }
        at
    }

    /// Number of open series from `start` on that share its study.
    fn run_length(&self, start: usize) -> usize {
        let head = &self.open[start].key;
        self.open[start..]
            .iter()
            .take_while(|s| s.key.same_study(head))
            .count()
    }

    /// Commit every series that satisfied the query, in key order.
    pub fn commit(self, catalog: &mut Catalog, find_level: FindLevel) -> Result<(), ScanError> {
        let total = self.open.len();
        let mut committed = 0usize;
        for pending in self.open {
            if let Some((patient, study, entry)) = pending.into_entry(find_level) {
                catalog.commit_series(patient, study, entry)?;
                committed += 1;
            }
        }
        debug!("Committed {} of {} series", committed, total);
        Ok(())
    }
}
