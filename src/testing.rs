//! Fixtures shared by the unit tests.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dicom_core::{Tag, VR};

use crate::common::attributes::{AttrValue, AttributeSet};
use crate::common::error::DecodeError;
use crate::common::tags;
use crate::common::types::{ImageRecord, SeriesEntry, SeriesMetadata};
use crate::decoder::{DecodedFile, Decoder};

const MR_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4";
pub const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
pub const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

#[derive(Debug, Clone)]
enum MockFile {
    Decoded(DecodedFile),
    Broken,
}

/// Decoder answering from a map of paths; unknown paths are not DICOM.
/// Clones share one call counter.
#[derive(Debug, Clone, Default)]
pub struct MockDecoder {
    files: HashMap<PathBuf, MockFile>,
    calls: Arc<AtomicUsize>,
}

impl MockDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signature checks plus decodes made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn add(&mut self, path: &Path, attributes: AttributeSet) {
        self.files.insert(
            path.to_path_buf(),
            MockFile::Decoded(DecodedFile {
                attributes,
                pixel_data_found: true,
            }),
        );
    }

    pub fn add_without_pixels(&mut self, path: &Path, attributes: AttributeSet) {
        self.files.insert(
            path.to_path_buf(),
            MockFile::Decoded(DecodedFile {
                attributes,
                pixel_data_found: false,
            }),
        );
    }

    pub fn add_failure(&mut self, path: &Path) {
        self.files.insert(path.to_path_buf(), MockFile::Broken);
    }
}

impl Decoder for MockDecoder {
    fn accepts(&self, path: &Path) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.files.contains_key(path)
    }

    fn decode(&self, path: &Path) -> Result<DecodedFile, DecodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.files.get(path) {
            Some(MockFile::Decoded(file)) => Ok(file.clone()),
            Some(MockFile::Broken) => Err(DecodeError::Malformed {
                path: path.to_path_buf(),
                reason: "broken fixture".to_string(),
            }),
            None => Err(DecodeError::NotDicom(path.to_path_buf())),
        }
    }
}

/// Create an empty file and return its path.
pub fn touch(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, b"").unwrap();
    path
}

/// Attributes of one decoded image file. Empty UIDs are left out.
pub fn file_attrs(patient_id: &str, study_uid: &str, series_uid: &str, instance: i64) -> AttributeSet {
    let mut attrs = AttributeSet::new()
        .with(tags::PATIENT_ID, VR::LO, patient_id)
        .with(tags::PATIENT_NAME, VR::PN, format!("{patient_id}^TEST"))
        .with(tags::INSTANCE_NUMBER, VR::IS, instance.to_string())
        .with(tags::SOP_CLASS_UID, VR::UI, MR_IMAGE_STORAGE)
        .with(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            format!("2.25.{}.{}.{}", study_uid.len(), series_uid.len(), instance),
        );
    if !study_uid.is_empty() {
        attrs.insert_text(tags::STUDY_INSTANCE_UID, VR::UI, study_uid);
    }
    if !series_uid.is_empty() {
        attrs.insert_text(tags::SERIES_INSTANCE_UID, VR::UI, series_uid);
    }
    attrs
}

pub fn patient_attrs(id: &str, name: &str) -> AttributeSet {
    AttributeSet::new()
        .with(tags::PATIENT_ID, VR::LO, id)
        .with(tags::PATIENT_NAME, VR::PN, name)
}

pub fn study_attrs(uid: &str, date: &str) -> AttributeSet {
    let mut attrs = AttributeSet::new().with(tags::STUDY_INSTANCE_UID, VR::UI, uid);
    if !date.is_empty() {
        attrs.insert_text(tags::STUDY_DATE, VR::DA, date);
    }
    attrs
}

pub fn series_entry(uid: &str, files: &[&str]) -> SeriesEntry {
    let images: Vec<AttributeSet> = files.iter().map(|_| AttributeSet::new()).collect();
    SeriesEntry {
        uid: uid.to_string(),
        number: None,
        files: files.iter().map(PathBuf::from).collect(),
        images: images.iter().map(ImageRecord::from_attributes).collect(),
        metadata: SeriesMetadata {
            shared: AttributeSet::new().with(tags::SERIES_INSTANCE_UID, VR::UI, uid),
            images,
        },
    }
}

/// How a record links to its next sibling in a written index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextLink {
    Sibling,
    Offset(u32),
    Itself,
}

/// One record of a directory index to be written, with its children.
#[derive(Debug, Clone)]
pub struct IndexRecord {
    pub kind: &'static str,
    pub attrs: AttributeSet,
    pub children: Vec<IndexRecord>,
    pub next: NextLink,
}

pub fn index_record(kind: &'static str, attrs: AttributeSet, children: Vec<IndexRecord>) -> IndexRecord {
    IndexRecord {
        kind,
        attrs,
        children,
        next: NextLink::Sibling,
    }
}

/// Image leaf referencing `file_id` (components separated by `\`).
pub fn image_record(file_id: &str, sop_uid: &str, instance: i64) -> IndexRecord {
    index_record(
        "IMAGE",
        AttributeSet::new()
            .with(tags::REFERENCED_FILE_ID, VR::CS, file_id)
            .with(tags::REFERENCED_SOP_CLASS_UID_IN_FILE, VR::UI, MR_IMAGE_STORAGE)
            .with(tags::REFERENCED_SOP_INSTANCE_UID_IN_FILE, VR::UI, sop_uid)
            .with(tags::INSTANCE_NUMBER, VR::IS, instance.to_string()),
        Vec::new(),
    )
}

/// Byte-level writer for explicit VR little endian directory indexes.
#[derive(Debug, Clone)]
pub struct IndexWriter {
    pub transfer_syntax: &'static str,
    pub root_offset: Option<u32>,
}

impl Default for IndexWriter {
    fn default() -> Self {
        Self {
            transfer_syntax: EXPLICIT_VR_LE,
            root_offset: None,
        }
    }
}

struct Flat<'r> {
    record: &'r IndexRecord,
    next: Option<usize>,
    child: Option<usize>,
}

fn flatten<'r>(records: &'r [IndexRecord], out: &mut Vec<Flat<'r>>) -> Vec<usize> {
    let mut siblings = Vec::new();
    for record in records {
        let index = out.len();
        out.push(Flat {
            record,
            next: None,
            child: None,
        });
        let children = flatten(&record.children, out);
        out[index].child = children.first().copied();
        siblings.push(index);
    }
    for pair in siblings.windows(2) {
        out[pair[0]].next = Some(pair[1]);
    }
    siblings
}

fn is_long_vr(vr: VR) -> bool {
    matches!(
        vr,
        VR::OB | VR::OD | VR::OF | VR::OL | VR::OW | VR::SQ | VR::UC | VR::UR | VR::UT | VR::UN
    )
}

fn put_element(buf: &mut Vec<u8>, tag: Tag, vr: VR, value: &[u8]) {
    buf.extend_from_slice(&tag.group().to_le_bytes());
    buf.extend_from_slice(&tag.element().to_le_bytes());
    buf.extend_from_slice(vr.to_string().as_bytes());
    if is_long_vr(vr) {
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    } else {
        buf.extend_from_slice(&(value.len() as u16).to_le_bytes());
    }
    buf.extend_from_slice(value);
}

fn padded_text(vr: VR, text: &str) -> Vec<u8> {
    let mut bytes = text.as_bytes().to_vec();
    if bytes.len() % 2 == 1 {
        bytes.push(if vr == VR::UI { 0 } else { b' ' });
    }
    bytes
}

fn put_item(buf: &mut Vec<u8>, content: &[u8]) {
    buf.extend_from_slice(&tags::ITEM.group().to_le_bytes());
    buf.extend_from_slice(&tags::ITEM.element().to_le_bytes());
    buf.extend_from_slice(&(content.len() as u32).to_le_bytes());
    buf.extend_from_slice(content);
}

fn encode_dataset(attrs: &AttributeSet) -> Vec<u8> {
    let mut buf = Vec::new();
    for (tag, attr) in attrs.iter() {
        match &attr.value {
            AttrValue::Text(text) => put_element(&mut buf, tag, attr.vr, &padded_text(attr.vr, text)),
            AttrValue::Sequence(items) => {
                let mut seq = Vec::new();
                for item in items {
                    put_item(&mut seq, &encode_dataset(item));
                }
                put_element(&mut buf, tag, VR::SQ, &seq);
            }
        }
    }
    buf
}

impl IndexWriter {
    pub fn write(&self, roots: &[IndexRecord]) -> Vec<u8> {
        let mut flats = Vec::new();
        flatten(roots, &mut flats);
        let mut offsets = vec![0u32; flats.len()];

        let mut file = Vec::new();
        // every field has a fixed width, so the second pass only fills in offsets
        for _ in 0..2 {
            let items: Vec<Vec<u8>> = flats
                .iter()
                .enumerate()
                .map(|(i, flat)| {
                    let next = match flat.record.next {
                        NextLink::Sibling => flat.next.map_or(0, |n| offsets[n]),
                        NextLink::Offset(offset) => offset,
                        NextLink::Itself => offsets[i],
                    };
                    let child = flat.child.map_or(0, |c| offsets[c]);
                    let mut content = Vec::new();
                    put_element(&mut content, tags::NEXT_DIRECTORY_RECORD, VR::UL, &next.to_le_bytes());
                    put_element(&mut content, Tag(0x0004, 0x1410), VR::US, &0xFFFFu16.to_le_bytes());
                    put_element(&mut content, tags::LOWER_LEVEL_DIRECTORY_ENTITY, VR::UL, &child.to_le_bytes());
                    put_element(
                        &mut content,
                        tags::DIRECTORY_RECORD_TYPE,
                        VR::CS,
                        &padded_text(VR::CS, flat.record.kind),
                    );
                    content.extend(encode_dataset(&flat.record.attrs));
                    let mut item = Vec::new();
                    put_item(&mut item, &content);
                    item
                })
                .collect();

            let mut meta_body = Vec::new();
            put_element(&mut meta_body, Tag(0x0002, 0x0002), VR::UI, &padded_text(VR::UI, "1.2.840.10008.1.3.10"));
            put_element(&mut meta_body, Tag(0x0002, 0x0003), VR::UI, &padded_text(VR::UI, "2.25.1"));
            put_element(&mut meta_body, tags::TRANSFER_SYNTAX_UID, VR::UI, &padded_text(VR::UI, self.transfer_syntax));
            let mut meta = Vec::new();
            put_element(&mut meta, Tag(0x0002, 0x0000), VR::UL, &(meta_body.len() as u32).to_le_bytes());
            meta.extend(meta_body);

            let root = self
                .root_offset
                .unwrap_or_else(|| offsets.first().copied().unwrap_or(0));
            let mut prefix = Vec::new();
            put_element(&mut prefix, tags::ROOT_DIRECTORY_FIRST_RECORD, VR::UL, &root.to_le_bytes());
            put_element(&mut prefix, Tag(0x0004, 0x1202), VR::UL, &0u32.to_le_bytes());
            put_element(&mut prefix, Tag(0x0004, 0x1212), VR::US, &0u16.to_le_bytes());

            let sequence_start = 128 + 4 + meta.len() + prefix.len() + 12;
            let mut running = sequence_start;
            for (offset, item) in offsets.iter_mut().zip(&items) {
                *offset = running as u32;
                running += item.len();
            }

            let sequence: Vec<u8> = items.concat();
            file = vec![0u8; 128];
            file.extend_from_slice(b"DICM");
            file.extend(meta);
            file.extend(prefix);
            put_element(&mut file, tags::DIRECTORY_RECORD_SEQUENCE, VR::SQ, &sequence);
        }
        file
    }
}

pub fn write_directory_index(roots: &[IndexRecord]) -> Vec<u8> {
    IndexWriter::default().write(roots)
}
