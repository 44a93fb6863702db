//! Relational catalog import
//!
//! Reads the three-table Core Data schema (`ZSTUDY`, `ZSERIES`, `ZIMAGE`)
//! written by OsiriX-style viewers. The referenced images live next to the
//! database file in `DATABASE.noindex`. All three tables are read inside a
//! single transaction and joined in memory.

use std::fmt::Display;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, TimeZone};
use dicom_core::VR;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row};
use tracing::{debug, info, trace};

use crate::common::attributes::AttributeSet;
use crate::common::error::{ErrorCode, SchemaError};
use crate::common::tags;
use crate::enumerator::CANCEL_CHECK_INTERVAL;
use crate::query::MatchMode;
use crate::scanner::{ScanContext, ScanFailure};
use crate::sorter::{accept_image, PendingSeries};

/// Folder holding the files a catalog refers to.
pub const STORAGE_FOLDER: &str = "DATABASE.noindex";
/// Files are spread over numbered folders of this many files each.
const FILES_PER_FOLDER: i64 = 10_000;
/// 2001-01-01T00:00:00Z as a Unix timestamp.
const REFERENCE_EPOCH: i64 = 978_307_200;

const TABLES: [&str; 3] = ["ZSTUDY", "ZSERIES", "ZIMAGE"];

#[derive(Debug)]
struct StudyRow {
    pk: i64,
    patient: AttributeSet,
    study: AttributeSet,
}

#[derive(Debug)]
struct SeriesRow {
    pk: i64,
    study: i64,
    attributes: AttributeSet,
}

#[derive(Debug)]
struct ImageRow {
    pk: i64,
    series: i64,
    path: Option<PathBuf>,
    attributes: AttributeSet,
}

#[derive(Debug, Default)]
struct Tables {
    studies: Vec<StudyRow>,
    series: Vec<SeriesRow>,
    images: Vec<ImageRow>,
}

/// Child rows grouped by parent key. Rows keep their primary-key order
/// within one parent.
#[derive(Debug)]
struct ChildIndex {
    keys: Vec<(i64, usize)>,
}

impl ChildIndex {
    fn new(parents: impl Iterator<Item = i64>) -> Self {
        let mut keys: Vec<(i64, usize)> = parents.enumerate().map(|(row, parent)| (parent, row)).collect();
        keys.sort_by_key(|&(parent, _)| parent);
        Self { keys }
    }

    fn children(&self, parent: i64) -> impl Iterator<Item = usize> + '_ {
        let start = self.keys.partition_point(|&(p, _)| p < parent);
        self.keys[start..]
            .iter()
            .take_while(move |&&(p, _)| p == parent)
            .map(|&(_, row)| row)
    }
}

/// Unpack a nibble-encoded UID: high nibble first, 0 ends the UID,
/// 1 to 10 are the digits 0 to 9 and anything above is a dot.
pub fn unpack_uid(packed: &[u8]) -> String {
    let mut uid = String::with_capacity(packed.len() * 2);
    for byte in packed {
        for nibble in [byte >> 4, byte & 0x0F] {
            match nibble {
                0 => return uid,
                1..=10 => uid.push(char::from(b'0' + nibble - 1)),
                _ => uid.push('.'),
            }
        }
    }
    uid
}

/// Render a reference-epoch timestamp as DA and TM text in `tz`.
pub fn format_timestamp<Tz>(seconds: f64, tz: &Tz) -> Option<(String, String)>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    if !seconds.is_finite() {
        return None;
    }
    let whole = seconds.floor();
    let nanos = (((seconds - whole) * 1e6).round() as u32).min(999_999) * 1_000;
    let utc = DateTime::from_timestamp(REFERENCE_EPOCH.checked_add(whole as i64)?, nanos)?;
    let local = utc.with_timezone(tz);
    Some((
        local.format("%Y%m%d").to_string(),
        local.format("%H%M%S%.6f").to_string(),
    ))
}

/// Location of an image: an explicit path string wins, otherwise the
/// numbered-folder convention is rebuilt from the path number.
fn image_path(storage: &Path, path_string: &str, path_number: Option<i64>) -> Option<PathBuf> {
    if !path_string.is_empty() {
        let path = Path::new(path_string);
        return Some(if path.is_absolute() {
            path.to_path_buf()
        } else {
            storage.join(path)
        });
    }
    let number = path_number?;
    let folder = (number / FILES_PER_FOLDER + 1) * FILES_PER_FOLDER;
    Some(storage.join(folder.to_string()).join(format!("{number}.dcm")))
}

fn text_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<String> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) | ValueRef::Blob(t) => String::from_utf8_lossy(t).trim().to_string(),
    })
}

fn int_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<i64>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Integer(i) => Some(i),
        ValueRef::Real(f) => Some(f as i64),
        ValueRef::Text(t) => String::from_utf8_lossy(t).trim().parse().ok(),
        _ => None,
    })
}

fn real_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<f64>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Integer(i) => Some(i as f64),
        ValueRef::Real(f) => Some(f),
        ValueRef::Text(t) => String::from_utf8_lossy(t).trim().parse().ok(),
        _ => None,
    })
}

/// Text column or nibble-packed blob column holding a UID.
fn uid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<String> {
    match row.get_ref(idx)? {
        ValueRef::Blob(packed) => Ok(unpack_uid(packed)),
        _ => text_at(row, idx),
    }
}

fn put_text(attrs: &mut AttributeSet, tag: dicom_core::Tag, vr: VR, value: String) {
    if !value.is_empty() {
        attrs.insert_text(tag, vr, value);
    }
}

fn put_timestamp<Tz>(
    attrs: &mut AttributeSet,
    date_tag: dicom_core::Tag,
    time_tag: Option<dicom_core::Tag>,
    seconds: Option<f64>,
    tz: &Tz,
) where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    if let Some((date, time)) = seconds.and_then(|s| format_timestamp(s, tz)) {
        attrs.insert_text(date_tag, VR::DA, date);
        if let Some(time_tag) = time_tag {
            attrs.insert_text(time_tag, VR::TM, time);
        }
    }
}

fn read_tables<Tz>(conn: &Connection, storage: &Path, tz: &Tz) -> rusqlite::Result<Tables>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let tx = conn.unchecked_transaction()?;
    let mut tables = Tables::default();

    {
        let mut stmt = tx.prepare(
            "SELECT Z_PK, ZPATIENTID, ZNAME, ZDATEOFBIRTH, ZPATIENTSEX, ZSTUDYINSTANCEUID, ZDATE, \
             ZID, ZACCESSIONNUMBER, ZSTUDYNAME, ZMODALITY, ZREFERRINGPHYSICIAN \
             FROM ZSTUDY ORDER BY Z_PK",
        )?;
        let rows = stmt.query_map([], |row| {
            let mut patient = AttributeSet::new();
            put_text(&mut patient, tags::PATIENT_ID, VR::LO, text_at(row, 1)?);
            put_text(&mut patient, tags::PATIENT_NAME, VR::PN, text_at(row, 2)?);
            put_timestamp(&mut patient, tags::PATIENT_BIRTH_DATE, None, real_at(row, 3)?, tz);
            put_text(&mut patient, tags::PATIENT_SEX, VR::CS, text_at(row, 4)?);

            let mut study = AttributeSet::new();
            put_text(&mut study, tags::STUDY_INSTANCE_UID, VR::UI, uid_at(row, 5)?);
            put_timestamp(&mut study, tags::STUDY_DATE, Some(tags::STUDY_TIME), real_at(row, 6)?, tz);
            put_text(&mut study, tags::STUDY_ID, VR::SH, text_at(row, 7)?);
            put_text(&mut study, tags::ACCESSION_NUMBER, VR::SH, text_at(row, 8)?);
            put_text(&mut study, tags::STUDY_DESCRIPTION, VR::LO, text_at(row, 9)?);
            put_text(&mut study, tags::MODALITIES_IN_STUDY, VR::CS, text_at(row, 10)?);
            put_text(&mut study, tags::REFERRING_PHYSICIAN_NAME, VR::PN, text_at(row, 11)?);

            Ok(StudyRow {
                pk: row.get(0)?,
                patient,
                study,
            })
        })?;
        tables.studies = rows.collect::<rusqlite::Result<_>>()?;
    }

    {
        let mut stmt = tx.prepare(
            "SELECT Z_PK, ZSTUDY, ZSERIESDICOMUID, ZID, ZNAME, ZMODALITY, ZDATE \
             FROM ZSERIES ORDER BY Z_PK",
        )?;
        let rows = stmt.query_map([], |row| {
            let mut attributes = AttributeSet::new();
            put_text(&mut attributes, tags::SERIES_INSTANCE_UID, VR::UI, uid_at(row, 2)?);
            put_text(&mut attributes, tags::SERIES_NUMBER, VR::IS, text_at(row, 3)?);
            put_text(&mut attributes, tags::SERIES_DESCRIPTION, VR::LO, text_at(row, 4)?);
            put_text(&mut attributes, tags::MODALITY, VR::CS, text_at(row, 5)?);
            put_timestamp(&mut attributes, tags::SERIES_DATE, Some(tags::SERIES_TIME), real_at(row, 6)?, tz);

            Ok(SeriesRow {
                pk: row.get(0)?,
                study: int_at(row, 1)?.unwrap_or(0),
                attributes,
            })
        })?;
        tables.series = rows.collect::<rusqlite::Result<_>>()?;
    }

    {
        let mut stmt = tx.prepare(
            "SELECT Z_PK, ZSERIES, ZINSTANCENUMBER, ZCOMPRESSEDSOPINSTANCEUID, ZPATHNUMBER, \
             ZPATHSTRING, ZHEIGHT, ZWIDTH FROM ZIMAGE ORDER BY Z_PK",
        )?;
        let rows = stmt.query_map([], |row| {
            let mut attributes = AttributeSet::new();
            put_text(&mut attributes, tags::INSTANCE_NUMBER, VR::IS, text_at(row, 2)?);
            put_text(&mut attributes, tags::SOP_INSTANCE_UID, VR::UI, uid_at(row, 3)?);
            put_text(&mut attributes, tags::ROWS, VR::US, text_at(row, 6)?);
            put_text(&mut attributes, tags::COLUMNS, VR::US, text_at(row, 7)?);

            Ok(ImageRow {
                pk: row.get(0)?,
                series: int_at(row, 1)?.unwrap_or(0),
                path: image_path(storage, &text_at(row, 5)?, int_at(row, 4)?),
                attributes,
            })
        })?;
        tables.images = rows.collect::<rusqlite::Result<_>>()?;
    }

    tx.commit()?;
    Ok(tables)
}

fn check_tables(conn: &Connection, path: &Path) -> Result<(), SchemaError> {
    for table in TABLES {
        let found: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get(0),
            )
            .optional()
            .map_err(|source| SchemaError::Database {
                path: path.to_path_buf(),
                source,
            })?;
        if found.is_none() {
            return Err(SchemaError::MissingTable {
                path: path.to_path_buf(),
                table,
            });
        }
    }
    Ok(())
}

/// Import every series of the catalog at `path`.
pub(crate) fn import(ctx: &mut ScanContext<'_>, path: &Path) -> Result<(), ScanFailure> {
    import_in(ctx, path, &Local)
}

fn import_in<Tz>(ctx: &mut ScanContext<'_>, path: &Path, tz: &Tz) -> Result<(), ScanFailure>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    info!("Importing relational catalog {}", path.display());
    let database_error = |source| SchemaError::Database {
        path: path.to_path_buf(),
        source,
    };

    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(database_error)?;
    check_tables(&conn, path)?;

    let storage = path
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .join(STORAGE_FOLDER);
    let tables = read_tables(&conn, &storage, tz).map_err(database_error)?;
    debug!(
        "Read {} studies, {} series, {} images",
        tables.studies.len(),
        tables.series.len(),
        tables.images.len()
    );

    let series_index = ChildIndex::new(tables.series.iter().map(|s| s.study));
    let image_index = ChildIndex::new(tables.images.iter().map(|i| i.series));
    let query = ctx.query();
    let total = tables.series.len().max(1) as f64;
    let mut done = 0usize;

    for study in &tables.studies {
        for series_row in series_index.children(study.pk).map(|i| &tables.series[i]) {
            if ctx.is_cancelled() {
                return Ok(());
            }
            done += 1;
            ctx.progress(done as f64 / total);

            let mut pending = PendingSeries::from_summaries(
                study.patient.clone(),
                study.study.clone(),
                series_row.attributes.clone(),
                query,
                MatchMode::Loose,
            );
            if pending.rejected {
                trace!("Series row {} rejected by query", series_row.pk);
                continue;
            }

            let mut last_path: Option<&Path> = None;
            for (n, image) in image_index.children(series_row.pk).map(|i| &tables.images[i]).enumerate() {
                if (n + 1) % CANCEL_CHECK_INTERVAL == 0 && ctx.is_cancelled() {
                    return Ok(());
                }
                let Some(image_path) = image.path.as_deref() else {
                    ctx.warn(
                        path,
                        ErrorCode::MalformedPath,
                        format!("Image row {} in {} has no file location", image.pk, path.display()),
                    );
                    continue;
                };
                // frames of one multi-frame file share a path
                if last_path == Some(image_path) {
                    continue;
                }
                last_path = Some(image_path);

                let matched = accept_image(&image.attributes, query, &pending.results, || {
                    ctx.extract(image_path)
                });
                pending.push_image(image_path.to_path_buf(), image.attributes.clone(), matched);
            }

            if let Some((patient, study, entry)) = pending.into_entry(ctx.options.find_level) {
                ctx.catalog.commit_series(patient, study, entry)?;
            }
        }
    }
    Ok(())
}
