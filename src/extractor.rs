use std::path::Path;

use tracing::debug;

use crate::common::attributes::AttributeSet;
use crate::common::error::DecodeError;
use crate::decoder::Decoder;

/// Turns a candidate file into an attribute record, applying the
/// pixel-data policy on top of the decoder.
pub struct RecordExtractor<'a> {
    decoder: &'a dyn Decoder,
    require_pixel_data: bool,
}

impl<'a> RecordExtractor<'a> {
    pub fn new(decoder: &'a dyn Decoder, require_pixel_data: bool) -> Self {
        Self {
            decoder,
            require_pixel_data,
        }
    }

    /// `Ok(None)` means the file is not DICOM and is skipped without a warning.
    pub fn extract(&self, path: &Path) -> Result<Option<AttributeSet>, DecodeError> {
        if !self.decoder.accepts(path) {
            debug!("Skipping {}: no DICOM signature", path.display());
            return Ok(None);
        }

        let decoded = self.decoder.decode(path)?;
        if self.require_pixel_data && !decoded.pixel_data_found {
            return Err(DecodeError::MissingPixelData(path.to_path_buf()));
        }
        Ok(Some(decoded.attributes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::ErrorCode;
    use crate::testing::{file_attrs, MockDecoder};
    use std::path::PathBuf;

    #[test]
    fn test_extract_policies() {
        let mut decoder = MockDecoder::new();
        decoder.add(Path::new("/img"), file_attrs("P1", "ST1", "S1", 1));
        decoder.add_without_pixels(Path::new("/sr"), file_attrs("P1", "ST1", "S2", 1));
        decoder.add_failure(Path::new("/bad"));

        let strict = RecordExtractor::new(&decoder, true);
        assert!(strict.extract(Path::new("/img")).unwrap().is_some());
        assert!(strict.extract(&PathBuf::from("/unknown")).unwrap().is_none());
        assert_eq!(
            strict.extract(Path::new("/sr")).unwrap_err().code(),
            ErrorCode::MissingPixelData
        );
        assert_eq!(
            strict.extract(Path::new("/bad")).unwrap_err().code(),
            ErrorCode::UnreadableFile
        );

        let relaxed = RecordExtractor::new(&decoder, false);
        assert!(relaxed.extract(Path::new("/sr")).unwrap().is_some());
    }
}
