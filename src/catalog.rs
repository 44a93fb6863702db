//! The in-memory catalog: patients, studies and series in three parallel
//! append-only lists.
//!
//! Series are appended in study order. A study owns the half-open range of
//! series indices appended while it was the most recent study, and a patient
//! owns the set of studies appended under it. `add_series` enforces this
//! monotonic layout; `commit_series` is the single acceptance routine used
//! by every ingestion path to decide which patient and study a finished
//! series belongs to.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, error};

use crate::common::attributes::AttributeSet;
use crate::common::error::{ErrorCode, ScanError};
use crate::common::tags;
use crate::common::types::{
    CatalogSummary, PatientEntry, SeriesEntry, SeriesSummary, StudyEntry,
};
use crate::sorter::LevelKey;

#[derive(Debug, Default)]
pub struct Catalog {
    patients: Vec<PatientEntry>,
    studies: Vec<StudyEntry>,
    series: Vec<SeriesEntry>,
    visited: HashSet<PathBuf>,
    error: Option<(ErrorCode, PathBuf)>,
    cancelled: bool,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn number_of_patients(&self) -> usize {
        self.patients.len()
    }

    pub fn number_of_studies(&self) -> usize {
        self.studies.len()
    }

    pub fn number_of_series(&self) -> usize {
        self.series.len()
    }

    pub fn number_of_files(&self) -> usize {
        self.series.iter().map(SeriesEntry::number_of_files).sum()
    }

    pub fn patient(&self, index: usize) -> Option<&PatientEntry> {
        self.patients.get(index)
    }

    pub fn study(&self, index: usize) -> Option<&StudyEntry> {
        self.studies.get(index)
    }

    pub fn series(&self, index: usize) -> Option<&SeriesEntry> {
        self.series.get(index)
    }

    pub fn patients(&self) -> &[PatientEntry] {
        &self.patients
    }

    pub fn studies(&self) -> &[StudyEntry] {
        &self.studies
    }

    pub fn all_series(&self) -> &[SeriesEntry] {
        &self.series
    }

    /// Patient record of the given study.
    pub fn patient_for_study(&self, study: usize) -> Option<&PatientEntry> {
        self.studies.get(study).and_then(|s| self.patients.get(s.patient))
    }

    /// Series belonging to the given study.
    pub fn series_for_study(&self, study: usize) -> &[SeriesEntry] {
        match self.studies.get(study) {
            Some(s) => &self.series[s.series.clone()],
            None => &[],
        }
    }

    pub fn studies_for_patient(&self, patient: usize) -> impl Iterator<Item = &StudyEntry> {
        self.patients
            .get(patient)
            .map(|p| p.studies.as_slice())
            .unwrap_or(&[])
            .iter()
            .filter_map(|&i| self.studies.get(i))
    }

    /// First recoverable error recorded during the scan.
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|(code, _)| *code)
    }

    /// Path that triggered the first recorded error.
    pub fn error_path(&self) -> Option<&Path> {
        self.error.as_ref().map(|(_, path)| path.as_path())
    }

    /// A cancelled scan leaves a partial catalog that should be discarded.
    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn summary(&self) -> CatalogSummary {
        let series = self
            .studies
            .iter()
            .flat_map(|study| {
                let patient = &self.patients[study.patient];
                self.series[study.series.clone()]
                    .iter()
                    .map(move |entry| SeriesSummary {
                        patient_id: patient.patient_id().to_string(),
                        patient_name: patient.name().to_string(),
                        study_instance_uid: study.uid.clone(),
                        study_date: study.date().to_string(),
                        series_instance_uid: entry.uid.clone(),
                        series_number: entry.number,
                        modality: entry.modality().to_string(),
                        description: entry.description().to_string(),
                        files: entry
                            .files
                            .iter()
                            .map(|p| p.display().to_string())
                            .collect(),
                    })
            })
            .collect();

        CatalogSummary {
            generated_at: Utc::now(),
            total_patients: self.patients.len(),
            total_studies: self.studies.len(),
            total_series: self.series.len(),
            total_files: self.number_of_files(),
            cancelled: self.cancelled,
            error_code: self.error_code(),
            error_path: self.error_path().map(|p| p.display().to_string()),
            series,
        }
    }

    /// Record an error in the sticky slot; the first one wins.
    pub(crate) fn record_error(&mut self, code: ErrorCode, path: &Path) {
        if self.error.is_none() {
            self.error = Some((code, path.to_path_buf()));
        }
    }

    /// Returns `false` if this real path has been visited before.
    pub(crate) fn mark_visited(&mut self, real_path: PathBuf) -> bool {
        self.visited.insert(real_path)
    }

    pub(crate) fn set_cancelled(&mut self) {
        self.cancelled = true;
    }

    /// Commit a finished series, reusing the current study when the study
    /// key matches the most recent study, and reusing any existing patient
    /// with a matching patient key.
    pub(crate) fn commit_series(
        &mut self,
        patient: AttributeSet,
        study: AttributeSet,
        series: SeriesEntry,
    ) -> Result<(), ScanError> {
        let patient_key = LevelKey::patient(&patient);
        let last_patient = self.studies.last().map(|s| s.patient);

        let patient_index = last_patient
            .filter(|&i| LevelKey::patient(&self.patients[i].attributes).compare(&patient_key) == Ordering::Equal)
            .or_else(|| {
                self.patients.iter().position(|p| {
                    LevelKey::patient(&p.attributes).compare(&patient_key) == Ordering::Equal
                })
            })
            .unwrap_or(self.patients.len());

        let study_key = LevelKey::study(&study);
        let study_index = match self.studies.last() {
            Some(last)
                if last.patient == patient_index
                    && LevelKey::study(&last.attributes).compare(&study_key) == Ordering::Equal =>
            {
                self.studies.len() - 1
            }
            _ => self.studies.len(),
        };

        self.add_series(patient_index, study_index, patient, study, series)
    }

    /// Append a series under the given patient and study indices.
    ///
    /// The study index must be either the most recent study or the next new
    /// one, and the patient index either an existing patient or the next new
    /// one. Anything else is a grouping bug and aborts the scan.
    pub(crate) fn add_series(
        &mut self,
        patient_index: usize,
        study_index: usize,
        patient: AttributeSet,
        study: AttributeSet,
        series: SeriesEntry,
    ) -> Result<(), ScanError> {
        let series_index = self.series.len();
        let n_studies = self.studies.len();
        let n_patients = self.patients.len();

        if patient_index > n_patients {
            error!("Patient index {} skips ahead of {} patients", patient_index, n_patients);
            return Err(ScanError::Logic(format!(
                "patient index {} is past the end of {} patients",
                patient_index, n_patients
            )));
        }

        if study_index + 1 == n_studies {
            let current = &self.studies[study_index];
            if current.patient != patient_index || current.series.end != series_index {
                return Err(ScanError::Logic(format!(
                    "study {} cannot be extended by series {} of patient {}",
                    study_index, series_index, patient_index
                )));
            }
        } else if study_index != n_studies {
            error!("Study index {} is not monotonic ({} studies)", study_index, n_studies);
            return Err(ScanError::Logic(format!(
                "study index {} out of order with {} studies",
                study_index, n_studies
            )));
        }

        if study_index == n_studies {
            self.studies.push(StudyEntry {
                uid: study.text(tags::STUDY_INSTANCE_UID).to_string(),
                attributes: study,
                patient: patient_index,
                series: series_index..series_index + 1,
            });
        } else {
            self.studies[study_index].series.end = series_index + 1;
        }

        if patient_index == n_patients {
            self.patients.push(PatientEntry {
                attributes: patient,
                studies: vec![study_index],
            });
        } else {
            let studies = &mut self.patients[patient_index].studies;
            if !studies.contains(&study_index) {
                studies.push(study_index);
            }
        }

        debug!(
            "Committed series {} ({} files) as study {} of patient {}",
            series.uid,
            series.files.len(),
            study_index,
            patient_index
        );
        self.series.push(series);
        Ok(())
    }
}
