//! Directory-index (DICOMDIR) ingestion.

mod importer;
pub mod reader;

pub(crate) use importer::import;
pub use reader::{read_directory_index, DirectoryIndex, DirectoryRecord};
