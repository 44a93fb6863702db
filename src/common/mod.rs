pub mod attributes;
pub mod error;
pub mod tags;
pub mod types;
