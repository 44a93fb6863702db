//! Tagged attribute records.
//!
//! An `AttributeSet` is the normalized form of everything the engine knows
//! about one file, one directory record or one database row: an ordered map
//! from tag to a VR-annotated value. Primitive values are kept as their
//! textual rendering (multi-valued attributes joined with `\`), which is all
//! the grouping and query logic needs.

use std::collections::BTreeMap;

use dicom_core::{Tag, VR};

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Text(String),
    Sequence(Vec<AttributeSet>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub vr: VR,
    pub value: AttrValue,
}

impl Attribute {
    pub fn text(vr: VR, value: impl Into<String>) -> Self {
        Self {
            vr,
            value: AttrValue::Text(value.into()),
        }
    }

    pub fn sequence(items: Vec<AttributeSet>) -> Self {
        Self {
            vr: VR::SQ,
            value: AttrValue::Sequence(items),
        }
    }

    /// Text value with padding removed, or `""` for sequences.
    pub fn as_str(&self) -> &str {
        match &self.value {
            AttrValue::Text(s) => trim_padding(s),
            AttrValue::Sequence(_) => "",
        }
    }

    pub fn items(&self) -> Option<&[AttributeSet]> {
        match &self.value {
            AttrValue::Sequence(items) => Some(items),
            AttrValue::Text(_) => None,
        }
    }

    /// An empty attribute carries no constraint when used in a query.
    pub fn is_empty(&self) -> bool {
        match &self.value {
            AttrValue::Text(s) => trim_padding(s).is_empty(),
            AttrValue::Sequence(items) => items.is_empty(),
        }
    }

    /// Individual values of a multi-valued attribute.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.as_str().split('\\').map(trim_padding)
    }
}

/// Strip the space/NUL padding used to reach even value lengths.
pub fn trim_padding(s: &str) -> &str {
    s.trim_matches(|c: char| c == ' ' || c == '\0')
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeSet {
    attrs: BTreeMap<Tag, Attribute>,
}

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tag: Tag, attr: Attribute) {
        self.attrs.insert(tag, attr);
    }

    pub fn insert_text(&mut self, tag: Tag, vr: VR, value: impl Into<String>) {
        self.attrs.insert(tag, Attribute::text(vr, value));
    }

    /// Builder form of `insert_text`.
    pub fn with(mut self, tag: Tag, vr: VR, value: impl Into<String>) -> Self {
        self.insert_text(tag, vr, value);
        self
    }

    pub fn remove(&mut self, tag: Tag) -> Option<Attribute> {
        self.attrs.remove(&tag)
    }

    pub fn get(&self, tag: Tag) -> Option<&Attribute> {
        self.attrs.get(&tag)
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.attrs.contains_key(&tag)
    }

    /// Trimmed text of an attribute, `""` when absent.
    pub fn text(&self, tag: Tag) -> &str {
        self.get(tag).map(Attribute::as_str).unwrap_or("")
    }

    /// First value of a numeric attribute (IS, US, UL, ...).
    pub fn int(&self, tag: Tag) -> Option<i64> {
        let first = self.get(tag)?.values().next()?;
        first.parse::<i64>().ok().or_else(|| {
            // IS values occasionally arrive as "12.0"
            first.parse::<f64>().ok().map(|v| v as i64)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (Tag, &Attribute)> {
        self.attrs.iter().map(|(tag, attr)| (*tag, attr))
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// Copy the listed tags from `other`, overwriting existing values.
    pub fn copy_from(&mut self, other: &AttributeSet, tags: &[Tag]) {
        for &tag in tags {
            if let Some(attr) = other.get(tag) {
                self.attrs.insert(tag, attr.clone());
            }
        }
    }

    /// New set holding only the listed tags.
    pub fn select(&self, tags: &[Tag]) -> AttributeSet {
        let mut out = AttributeSet::new();
        out.copy_from(self, tags);
        out
    }

    /// Copy of this set with the listed tags removed.
    pub fn without(&self, tags: &[Tag]) -> AttributeSet {
        let mut out = self.clone();
        for tag in tags {
            out.attrs.remove(tag);
        }
        out
    }

    /// Add every attribute of `other` that this set does not already hold.
    pub fn merge(&mut self, other: &AttributeSet) {
        for (tag, attr) in other.iter() {
            self.attrs.entry(tag).or_insert_with(|| attr.clone());
        }
    }
}

impl FromIterator<(Tag, Attribute)> for AttributeSet {
    fn from_iter<T: IntoIterator<Item = (Tag, Attribute)>>(iter: T) -> Self {
        Self {
            attrs: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::tags;

    #[test]
    fn test_text_and_int_accessors() {
        let set = AttributeSet::new()
            .with(tags::PATIENT_ID, VR::LO, "PAT01 ")
            .with(tags::INSTANCE_NUMBER, VR::IS, " 12")
            .with(tags::SERIES_NUMBER, VR::IS, "3.0")
            .with(tags::SOP_INSTANCE_UID, VR::UI, "1.2.3\0");

        assert_eq!(set.text(tags::PATIENT_ID), "PAT01");
        assert_eq!(set.text(tags::SOP_INSTANCE_UID), "1.2.3");
        assert_eq!(set.text(tags::MODALITY), "");
        assert_eq!(set.int(tags::INSTANCE_NUMBER), Some(12));
        assert_eq!(set.int(tags::SERIES_NUMBER), Some(3));
        assert_eq!(set.int(tags::MODALITY), None);
    }

    #[test]
    fn test_select_without_and_merge() {
        let full = AttributeSet::new()
            .with(tags::PATIENT_NAME, VR::PN, "DOE^JANE")
            .with(tags::MODALITY, VR::CS, "MR")
            .with(tags::ROWS, VR::US, "256");

        let patient = full.select(tags::PATIENT_TAGS);
        assert_eq!(patient.len(), 1);
        assert_eq!(patient.text(tags::PATIENT_NAME), "DOE^JANE");

        let rest = full.without(tags::PATIENT_TAGS);
        assert!(!rest.contains(tags::PATIENT_NAME));
        assert_eq!(rest.len(), 2);

        let mut merged = AttributeSet::new().with(tags::MODALITY, VR::CS, "CT");
        merged.merge(&full);
        assert_eq!(merged.text(tags::MODALITY), "CT");
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn test_multi_values_and_emptiness() {
        let attr = Attribute::text(VR::CS, "ORIGINAL\\PRIMARY\\AXIAL ");
        let values: Vec<&str> = attr.values().collect();
        assert_eq!(values, vec!["ORIGINAL", "PRIMARY", "AXIAL"]);

        assert!(Attribute::text(VR::LO, "  ").is_empty());
        assert!(Attribute::sequence(Vec::new()).is_empty());
        assert!(!Attribute::sequence(vec![AttributeSet::new()]).is_empty());
    }
}
