//! Catalogs DICOM files, directory indexes and OsiriX-style databases
//! into a Patient / Study / Series / Image hierarchy.

pub mod catalog;
pub mod common;
pub mod decoder;
pub mod dicomdir;
pub mod enumerator;
pub mod extractor;
pub mod query;
pub mod relational;
pub mod scanner;
pub mod sorter;

#[cfg(test)]
pub(crate) mod testing;

pub use catalog::Catalog;
pub use common::attributes::{Attribute, AttributeSet};
pub use common::error::{ErrorCode, ScanError};
pub use decoder::{Decoder, DicomFileDecoder};
pub use query::{build_query, parse_query_term};
pub use scanner::{CatalogScanner, FindLevel, ScanEvent, ScanInput, ScanOptions};
