use std::ops::Range;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use dicom_core::Tag;
use serde::Serialize;

use super::attributes::AttributeSet;
use super::error::ErrorCode;
use super::tags;

/// Per-image fields needed to order and identify an image within its series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub instance_number: Option<i64>,
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    pub rows: u32,
    pub columns: u32,
}

impl ImageRecord {
    pub fn from_attributes(attrs: &AttributeSet) -> Self {
        Self {
            instance_number: attrs.int(tags::INSTANCE_NUMBER),
            sop_class_uid: attrs.text(tags::SOP_CLASS_UID).to_string(),
            sop_instance_uid: attrs.text(tags::SOP_INSTANCE_UID).to_string(),
            rows: dimension(attrs, tags::ROWS),
            columns: dimension(attrs, tags::COLUMNS),
        }
    }
}

/// Image dimension, 0 when absent or out of range.
fn dimension(attrs: &AttributeSet, tag: Tag) -> u32 {
    attrs.int(tag).and_then(|v| u32::try_from(v).ok()).unwrap_or(0)
}

/// Merged metadata of a series: the patient, study and series summary
/// attributes shared by every image, plus one slot per image.
#[derive(Debug, Clone, Default)]
pub struct SeriesMetadata {
    pub shared: AttributeSet,
    pub images: Vec<AttributeSet>,
}

impl SeriesMetadata {
    pub fn number_of_images(&self) -> usize {
        self.images.len()
    }

    /// Full attribute view of image `index`: its own attributes with the
    /// shared summary attributes filled in.
    pub fn image(&self, index: usize) -> Option<AttributeSet> {
        let mut view = self.images.get(index)?.clone();
        view.merge(&self.shared);
        Some(view)
    }
}

#[derive(Debug, Clone)]
pub struct SeriesEntry {
    pub uid: String,
    pub number: Option<i64>,
    pub files: Vec<PathBuf>,
    pub images: Vec<ImageRecord>,
    pub metadata: SeriesMetadata,
}

impl SeriesEntry {
    pub fn number_of_files(&self) -> usize {
        self.files.len()
    }

    pub fn modality(&self) -> &str {
        self.metadata.shared.text(tags::MODALITY)
    }

    pub fn description(&self) -> &str {
        self.metadata.shared.text(tags::SERIES_DESCRIPTION)
    }
}

#[derive(Debug, Clone)]
pub struct StudyEntry {
    pub uid: String,
    pub attributes: AttributeSet,
    pub patient: usize,
    /// Half-open range into the catalog's series list.
    pub series: Range<usize>,
}

impl StudyEntry {
    pub fn date(&self) -> &str {
        self.attributes.text(tags::STUDY_DATE)
    }

    pub fn time(&self) -> &str {
        self.attributes.text(tags::STUDY_TIME)
    }

    pub fn study_id(&self) -> &str {
        self.attributes.text(tags::STUDY_ID)
    }

    pub fn accession_number(&self) -> &str {
        self.attributes.text(tags::ACCESSION_NUMBER)
    }
}

#[derive(Debug, Clone)]
pub struct PatientEntry {
    pub attributes: AttributeSet,
    pub studies: Vec<usize>,
}

impl PatientEntry {
    pub fn patient_id(&self) -> &str {
        self.attributes.text(tags::PATIENT_ID)
    }

    pub fn name(&self) -> &str {
        self.attributes.text(tags::PATIENT_NAME)
    }

    pub fn birth_date(&self) -> &str {
        self.attributes.text(tags::PATIENT_BIRTH_DATE)
    }

    pub fn sex(&self) -> &str {
        self.attributes.text(tags::PATIENT_SEX)
    }
}

#[derive(Debug, Serialize)]
pub struct SeriesSummary {
    pub patient_id: String,
    pub patient_name: String,
    pub study_instance_uid: String,
    pub study_date: String,
    pub series_instance_uid: String,
    pub series_number: Option<i64>,
    pub modality: String,
    pub description: String,
    pub files: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct CatalogSummary {
    pub generated_at: DateTime<Utc>,
    pub total_patients: usize,
    pub total_studies: usize,
    pub total_series: usize,
    pub total_files: usize,
    pub cancelled: bool,
    pub error_code: Option<ErrorCode>,
    pub error_path: Option<String>,
    pub series: Vec<SeriesSummary>,
}
