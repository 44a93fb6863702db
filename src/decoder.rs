//! DICOM file decoding behind a trait, so the scanner can be driven by
//! test doubles.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use dicom_core::header::Header;
use dicom_core::value::Value;
use dicom_core::VR;
use dicom_object::{open_file, InMemDicomObject};
use tracing::trace;

use crate::common::attributes::{Attribute, AttributeSet};
use crate::common::error::DecodeError;
use crate::common::tags;

/// Offset of the "DICM" magic after the 128-byte preamble.
const PREAMBLE_LEN: usize = 128;
const MAGIC: &[u8; 4] = b"DICM";

#[derive(Debug, Clone, Default)]
pub struct DecodedFile {
    pub attributes: AttributeSet,
    pub pixel_data_found: bool,
}

pub trait Decoder {
    /// Cheap signature check made before a full decode.
    fn accepts(&self, path: &Path) -> bool {
        has_dicom_signature(path).unwrap_or(false)
    }

    fn decode(&self, path: &Path) -> Result<DecodedFile, DecodeError>;
}

/// True when the file carries "DICM" after the preamble, or at the very
/// start for preamble-less files.
pub fn has_dicom_signature(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; PREAMBLE_LEN + 4];
    let mut filled = 0;
    while filled < buffer.len() {
        let n = file.read(&mut buffer[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    let header = &buffer[..filled];
    Ok(match header {
        [b'D', b'I', b'C', b'M', ..] => true,
        h if h.len() == PREAMBLE_LEN + 4 => &h[PREAMBLE_LEN..] == MAGIC,
        _ => false,
    })
}

/// Decoder backed by dicom-object.
#[derive(Debug, Clone, Copy, Default)]
pub struct DicomFileDecoder;

impl Decoder for DicomFileDecoder {
    fn decode(&self, path: &Path) -> Result<DecodedFile, DecodeError> {
        let obj = open_file(path).map_err(|source| DecodeError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;

        let pixel_data_found = [tags::PIXEL_DATA, tags::FLOAT_PIXEL_DATA, tags::DOUBLE_FLOAT_PIXEL_DATA]
            .iter()
            .any(|tag| obj.element(*tag).is_ok());

        let attributes = convert_dataset(&obj);
        trace!("Decoded {} attributes from {}", attributes.len(), path.display());

        Ok(DecodedFile {
            attributes,
            pixel_data_found,
        })
    }
}

fn convert_dataset(obj: &InMemDicomObject) -> AttributeSet {
    let mut set = AttributeSet::new();
    for element in obj.iter() {
        let tag = element.tag();
        let vr = element.vr();
        if tag.group() == 0x7FE0 || is_bulk_vr(vr) {
            continue;
        }
        match element.value() {
            Value::Primitive(p) => set.insert_text(tag, vr, p.to_str().into_owned()),
            Value::Sequence(seq) => {
                let items = seq.items().iter().map(convert_dataset).collect();
                set.insert(tag, Attribute::sequence(items));
            }
            Value::PixelSequence(_) => {}
        }
    }
    set
}

/// Binary value representations that carry no text worth matching.
fn is_bulk_vr(vr: VR) -> bool {
    matches!(
        vr,
        VR::OB | VR::OD | VR::OF | VR::OL | VR::OV | VR::OW | VR::UN
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_signature_after_preamble() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.dcm");
        let mut bytes = vec![0u8; 128];
        bytes.extend_from_slice(b"DICM");
        bytes.extend_from_slice(&[0x02, 0x00, 0x00, 0x00]);
        fs::write(&path, bytes).unwrap();
        assert!(has_dicom_signature(&path).unwrap());
        assert!(DicomFileDecoder.accepts(&path));
    }

    #[test]
    fn test_signature_rejects_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let short = dir.path().join("short.txt");
        fs::write(&short, b"hello").unwrap();
        assert!(!has_dicom_signature(&short).unwrap());

        let long = dir.path().join("long.bin");
        fs::write(&long, vec![0x41u8; 512]).unwrap();
        assert!(!has_dicom_signature(&long).unwrap());

        let bare = dir.path().join("bare.dcm");
        fs::write(&bare, b"DICM").unwrap();
        assert!(has_dicom_signature(&bare).unwrap());

        assert!(!DicomFileDecoder.accepts(&dir.path().join("missing")));
    }

    #[test]
    fn test_truncated_file_fails_to_decode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("truncated.dcm");
        let mut bytes = vec![0u8; 128];
        bytes.extend_from_slice(b"DICM");
        fs::write(&path, bytes).unwrap();

        let err = DicomFileDecoder.decode(&path).unwrap_err();
        assert_eq!(err.code(), crate::common::error::ErrorCode::UnreadableFile);
    }
}
