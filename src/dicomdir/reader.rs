//! Offset-aware reader for directory-index files.
//!
//! dicom-object does not expose the byte position of sequence items, and
//! directory records point at each other by exactly that position. The
//! index is therefore read directly: the mandated explicit VR little endian
//! encoding is simple enough to walk element by element.

use dicom_core::{Tag, VR};
use tracing::trace;

use crate::common::attributes::{trim_padding, Attribute, AttributeSet};
use crate::common::error::IndexError;
use crate::common::tags;

const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
const UNDEFINED_LENGTH: u32 = 0xFFFF_FFFF;

/// One item of the directory record sequence.
#[derive(Debug, Clone)]
pub struct DirectoryRecord {
    /// Byte offset of the item tag from the start of the file.
    pub offset: u32,
    pub kind: String,
    pub next: u32,
    pub child: u32,
    pub attributes: AttributeSet,
}

impl DirectoryRecord {
    fn from_item(offset: usize, attributes: AttributeSet) -> Self {
        let link = |tag: Tag| {
            attributes
                .int(tag)
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(0)
        };
        Self {
            offset: offset as u32,
            kind: attributes.text(tags::DIRECTORY_RECORD_TYPE).to_ascii_uppercase(),
            next: link(tags::NEXT_DIRECTORY_RECORD),
            child: link(tags::LOWER_LEVEL_DIRECTORY_ENTITY),
            attributes,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DirectoryIndex {
    pub root_offset: u32,
    pub records: Vec<DirectoryRecord>,
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], IndexError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(IndexError::Truncated(self.pos))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, IndexError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, IndexError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn tag(&mut self) -> Result<Tag, IndexError> {
        let group = self.u16()?;
        let element = self.u16()?;
        Ok(Tag(group, element))
    }

    fn peek_tag(&self) -> Option<Tag> {
        let b = self.bytes.get(self.pos..self.pos + 4)?;
        Some(Tag(
            u16::from_le_bytes([b[0], b[1]]),
            u16::from_le_bytes([b[2], b[3]]),
        ))
    }

    /// Element header: tag, VR and value length.
    fn header(&mut self) -> Result<(Tag, VR, u32), IndexError> {
        let start = self.pos;
        let tag = self.tag()?;
        if tag.group() == 0xFFFE {
            return Err(IndexError::UnexpectedTag(tag.group(), tag.element(), start));
        }
        let code = self.take(2)?;
        let vr = VR::from_binary([code[0], code[1]]).unwrap_or(VR::UN);
        let length = if has_long_length(vr) {
            self.take(2)?;
            self.u32()?
        } else {
            u32::from(self.u16()?)
        };
        Ok((tag, vr, length))
    }

    fn value(&mut self, tag: Tag, vr: VR, length: u32) -> Result<Option<Attribute>, IndexError> {
        if vr == VR::SQ {
            let items = self.items(length)?;
            return Ok(Some(Attribute::sequence(
                items.into_iter().map(|(_, item)| item).collect(),
            )));
        }
        if length == UNDEFINED_LENGTH {
            return Err(IndexError::UnexpectedTag(tag.group(), tag.element(), self.pos));
        }

        let bytes = self.take(length as usize)?;
        Ok(decode_value(vr, bytes).map(|text| Attribute::text(vr, text)))
    }

    /// Items of a sequence, each with the offset of its item tag.
    fn items(&mut self, length: u32) -> Result<Vec<(usize, AttributeSet)>, IndexError> {
        let end = defined(length).map(|len| self.pos + len);
        let mut items = Vec::new();
        loop {
            match end {
                Some(end) if self.pos >= end => break,
                None if self.at_end() => return Err(IndexError::Truncated(self.pos)),
                _ => {}
            }

            let offset = self.pos;
            let tag = self.tag()?;
            let item_length = self.u32()?;
            match tag {
                tags::SEQUENCE_DELIMITATION => break,
                tags::ITEM => {
                    let item_end = defined(item_length).map(|len| self.pos + len);
                    let item = self.dataset(item_end)?;
                    items.push((offset, item));
                }
                other => {
                    return Err(IndexError::UnexpectedTag(other.group(), other.element(), offset))
                }
            }
        }
        Ok(items)
    }

    fn dataset(&mut self, end: Option<usize>) -> Result<AttributeSet, IndexError> {
        let mut set = AttributeSet::new();
        loop {
            match end {
                Some(end) if self.pos >= end => break,
                None if self.at_end() => return Err(IndexError::Truncated(self.pos)),
                None if self.peek_tag() == Some(tags::ITEM_DELIMITATION) => {
                    self.take(8)?;
                    break;
                }
                _ => {}
            }
            let (tag, vr, length) = self.header()?;
            if let Some(attr) = self.value(tag, vr, length)? {
                set.insert(tag, attr);
            }
        }
        Ok(set)
    }
}

fn defined(length: u32) -> Option<usize> {
    (length != UNDEFINED_LENGTH).then_some(length as usize)
}

fn has_long_length(vr: VR) -> bool {
    matches!(
        vr,
        VR::OB | VR::OD | VR::OF | VR::OL | VR::OW | VR::SQ | VR::UC | VR::UR | VR::UT | VR::UN
    )
}

/// Textual rendering of a primitive value, `None` for binary data.
fn decode_value(vr: VR, bytes: &[u8]) -> Option<String> {
    fn join<T: ToString>(values: impl Iterator<Item = T>) -> String {
        values.map(|v| v.to_string()).collect::<Vec<_>>().join("\\")
    }

    match vr {
        VR::UL => Some(join(
            bytes
                .chunks_exact(4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        )),
        VR::SL => Some(join(
            bytes
                .chunks_exact(4)
                .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        )),
        VR::US => Some(join(bytes.chunks_exact(2).map(|b| u16::from_le_bytes([b[0], b[1]])))),
        VR::SS => Some(join(bytes.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]])))),
        VR::FL => Some(join(
            bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        )),
        VR::FD => Some(join(bytes.chunks_exact(8).map(|b| {
            f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        }))),
        VR::OB | VR::OD | VR::OF | VR::OL | VR::OW | VR::UN | VR::AT => None,
        _ => Some(trim_padding(&String::from_utf8_lossy(bytes)).to_string()),
    }
}

/// Parse a whole directory-index file.
pub fn read_directory_index(bytes: &[u8]) -> Result<DirectoryIndex, IndexError> {
    let start = if bytes.len() >= 132 && &bytes[128..132] == b"DICM" {
        132
    } else if bytes.starts_with(b"DICM") {
        4
    } else {
        return Err(IndexError::NoSignature);
    };
    let mut reader = ByteReader { bytes, pos: start };

    let mut transfer_syntax = String::new();
    while reader.peek_tag().is_some_and(|tag| tag.group() == 0x0002) {
        let (tag, vr, length) = reader.header()?;
        let value = reader.take(length as usize)?;
        if tag == tags::TRANSFER_SYNTAX_UID {
            transfer_syntax = decode_value(vr, value).unwrap_or_default();
        }
    }
    if transfer_syntax != EXPLICIT_VR_LITTLE_ENDIAN {
        return Err(IndexError::TransferSyntax(transfer_syntax));
    }

    let mut index = DirectoryIndex::default();
    let mut found_sequence = false;
    while !reader.at_end() {
        let (tag, vr, length) = reader.header()?;
        if tag == tags::DIRECTORY_RECORD_SEQUENCE {
            index.records = reader
                .items(length)?
                .into_iter()
                .map(|(offset, item)| DirectoryRecord::from_item(offset, item))
                .collect();
            found_sequence = true;
            continue;
        }
        let value = reader.value(tag, vr, length)?;
        if tag == tags::ROOT_DIRECTORY_FIRST_RECORD {
            index.root_offset = value
                .and_then(|attr| attr.as_str().parse().ok())
                .unwrap_or(0);
        }
    }

    if !found_sequence {
        return Err(IndexError::NoRecords);
    }
    trace!("Read {} directory records", index.records.len());
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        image_record, index_record, patient_attrs, write_directory_index, IndexWriter, IMPLICIT_VR_LE,
    };

    #[test]
    fn test_offsets_and_links() {
        let bytes = write_directory_index(&[
            index_record(
                "PATIENT",
                patient_attrs("P1", "DOE^JANE"),
                vec![index_record("STUDY", AttributeSet::new(), vec![])],
            ),
            index_record("PATIENT", patient_attrs("P2", "ROE^RICHARD"), vec![]),
        ]);

        let index = read_directory_index(&bytes).unwrap();
        assert_eq!(index.records.len(), 3);
        let [p1, study, p2] = [&index.records[0], &index.records[1], &index.records[2]];

        assert_eq!(index.root_offset, p1.offset);
        assert_eq!(&bytes[p1.offset as usize..p1.offset as usize + 4], &[0xFE, 0xFF, 0x00, 0xE0]);
        assert_eq!(p1.kind, "PATIENT");
        assert_eq!(p1.child, study.offset);
        assert_eq!(p1.next, p2.offset);
        assert_eq!(study.next, 0);
        assert_eq!(p2.next, 0);
        assert_eq!(p2.attributes.text(tags::PATIENT_NAME), "ROE^RICHARD");
    }

    #[test]
    fn test_image_record_values() {
        let bytes = write_directory_index(&[image_record("IMG\\0001", "1.2.3.4", 7)]);
        let index = read_directory_index(&bytes).unwrap();
        let image = &index.records[0];
        assert_eq!(image.kind, "IMAGE");
        assert_eq!(image.attributes.text(tags::REFERENCED_FILE_ID), "IMG\\0001");
        assert_eq!(image.attributes.text(tags::REFERENCED_SOP_INSTANCE_UID_IN_FILE), "1.2.3.4");
        assert_eq!(image.attributes.int(tags::INSTANCE_NUMBER), Some(7));
    }

    #[test]
    fn test_nested_sequences_are_kept() {
        let inner = AttributeSet::new().with(tags::PATIENT_ID, dicom_core::VR::LO, "X");
        let mut attrs = AttributeSet::new();
        attrs.insert(Tag(0x0040, 0xA730), Attribute::sequence(vec![inner.clone(), inner]));
        let bytes = write_directory_index(&[index_record("SR DOCUMENT", attrs, vec![])]);

        let index = read_directory_index(&bytes).unwrap();
        let items = index.records[0]
            .attributes
            .get(Tag(0x0040, 0xA730))
            .and_then(|a| a.items())
            .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].text(tags::PATIENT_ID), "X");
    }

    #[test]
    fn test_rejects_other_encodings_and_garbage() {
        let writer = IndexWriter {
            transfer_syntax: IMPLICIT_VR_LE,
            root_offset: None,
        };
        let bytes = writer.write(&[]);
        assert!(matches!(
            read_directory_index(&bytes),
            Err(IndexError::TransferSyntax(ts)) if ts == IMPLICIT_VR_LE
        ));

        assert!(matches!(read_directory_index(b"not an index"), Err(IndexError::NoSignature)));

        let mut truncated = write_directory_index(&[image_record("A", "1.2", 1)]);
        truncated.truncate(truncated.len() - 6);
        assert!(matches!(read_directory_index(&truncated), Err(IndexError::Truncated(_))));
    }
}
