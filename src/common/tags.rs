//! Attribute tags read by the catalog engine
//!
//! Only the handful of attributes needed for grouping, ordering and the
//! summary records are named here; everything else travels through
//! `AttributeSet` untouched.

use dicom_core::Tag;

pub const SPECIFIC_CHARACTER_SET: Tag = Tag(0x0008, 0x0005);
pub const SOP_CLASS_UID: Tag = Tag(0x0008, 0x0016);
pub const SOP_INSTANCE_UID: Tag = Tag(0x0008, 0x0018);
pub const STUDY_DATE: Tag = Tag(0x0008, 0x0020);
pub const SERIES_DATE: Tag = Tag(0x0008, 0x0021);
pub const STUDY_TIME: Tag = Tag(0x0008, 0x0030);
pub const SERIES_TIME: Tag = Tag(0x0008, 0x0031);
pub const ACCESSION_NUMBER: Tag = Tag(0x0008, 0x0050);
pub const MODALITY: Tag = Tag(0x0008, 0x0060);
pub const MODALITIES_IN_STUDY: Tag = Tag(0x0008, 0x0061);
pub const REFERRING_PHYSICIAN_NAME: Tag = Tag(0x0008, 0x0090);
pub const STUDY_DESCRIPTION: Tag = Tag(0x0008, 0x1030);
pub const SERIES_DESCRIPTION: Tag = Tag(0x0008, 0x103E);

pub const PATIENT_NAME: Tag = Tag(0x0010, 0x0010);
pub const PATIENT_ID: Tag = Tag(0x0010, 0x0020);
pub const PATIENT_BIRTH_DATE: Tag = Tag(0x0010, 0x0030);
pub const PATIENT_SEX: Tag = Tag(0x0010, 0x0040);

pub const BODY_PART_EXAMINED: Tag = Tag(0x0018, 0x0015);
pub const PROTOCOL_NAME: Tag = Tag(0x0018, 0x1030);

pub const STUDY_INSTANCE_UID: Tag = Tag(0x0020, 0x000D);
pub const SERIES_INSTANCE_UID: Tag = Tag(0x0020, 0x000E);
pub const STUDY_ID: Tag = Tag(0x0020, 0x0010);
pub const SERIES_NUMBER: Tag = Tag(0x0020, 0x0011);
pub const INSTANCE_NUMBER: Tag = Tag(0x0020, 0x0013);

pub const NUMBER_OF_FRAMES: Tag = Tag(0x0028, 0x0008);
pub const ROWS: Tag = Tag(0x0028, 0x0010);
pub const COLUMNS: Tag = Tag(0x0028, 0x0011);

pub const FLOAT_PIXEL_DATA: Tag = Tag(0x7FE0, 0x0008);
pub const DOUBLE_FLOAT_PIXEL_DATA: Tag = Tag(0x7FE0, 0x0009);
pub const PIXEL_DATA: Tag = Tag(0x7FE0, 0x0010);

// Directory-index (media storage directory) attributes
pub const TRANSFER_SYNTAX_UID: Tag = Tag(0x0002, 0x0010);
pub const ROOT_DIRECTORY_FIRST_RECORD: Tag = Tag(0x0004, 0x1200);
pub const DIRECTORY_RECORD_SEQUENCE: Tag = Tag(0x0004, 0x1220);
pub const NEXT_DIRECTORY_RECORD: Tag = Tag(0x0004, 0x1400);
pub const LOWER_LEVEL_DIRECTORY_ENTITY: Tag = Tag(0x0004, 0x1420);
pub const DIRECTORY_RECORD_TYPE: Tag = Tag(0x0004, 0x1430);
pub const REFERENCED_FILE_ID: Tag = Tag(0x0004, 0x1500);
pub const REFERENCED_SOP_CLASS_UID_IN_FILE: Tag = Tag(0x0004, 0x1510);
pub const REFERENCED_SOP_INSTANCE_UID_IN_FILE: Tag = Tag(0x0004, 0x1511);

// Sequence item delimitation
pub const ITEM: Tag = Tag(0xFFFE, 0xE000);
pub const ITEM_DELIMITATION: Tag = Tag(0xFFFE, 0xE00D);
pub const SEQUENCE_DELIMITATION: Tag = Tag(0xFFFE, 0xE0DD);

/// Attributes copied into a patient summary record.
pub const PATIENT_TAGS: &[Tag] = &[
    SPECIFIC_CHARACTER_SET,
    PATIENT_NAME,
    PATIENT_ID,
    PATIENT_BIRTH_DATE,
    PATIENT_SEX,
];

/// Attributes copied into a study summary record.
pub const STUDY_TAGS: &[Tag] = &[
    STUDY_DATE,
    STUDY_TIME,
    ACCESSION_NUMBER,
    MODALITIES_IN_STUDY,
    REFERRING_PHYSICIAN_NAME,
    STUDY_DESCRIPTION,
    STUDY_INSTANCE_UID,
    STUDY_ID,
];

/// Attributes copied into a series summary record.
pub const SERIES_TAGS: &[Tag] = &[
    SERIES_DATE,
    SERIES_TIME,
    MODALITY,
    SERIES_DESCRIPTION,
    BODY_PART_EXAMINED,
    PROTOCOL_NAME,
    SERIES_INSTANCE_UID,
    SERIES_NUMBER,
];

/// Attributes that make up an image record.
pub const IMAGE_TAGS: &[Tag] = &[
    SOP_CLASS_UID,
    SOP_INSTANCE_UID,
    INSTANCE_NUMBER,
    NUMBER_OF_FRAMES,
    ROWS,
    COLUMNS,
];

/// Tags in a query that never constrain a match.
pub fn is_query_control(tag: Tag) -> bool {
    tag.group() == 0x0002 || tag == SPECIFIC_CHARACTER_SET
}
