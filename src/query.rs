//! Attribute-level query matching.
//!
//! A query is an `AttributeSet` in which every non-empty attribute is a
//! constraint and every empty attribute is a wildcard. Matching happens in
//! two stages: a coarse pass over patient/study/series summary records that
//! records what it has already verified, and a per-image pass that decides
//! whether those known results plus the small image record settle the query
//! or whether the full file must be decoded.
//!
//! Text values support `*` (any run) and `?` (one character). A value list
//! separated by `\` matches if any member matches. DA/TM/DT constraints of
//! the form `lo-hi`, `lo-` or `-hi` are range matches. UIDs compare exactly
//! after padding is trimmed. Person names compare without regard to case.

use dicom_core::dictionary::{DataDictionary, VirtualVr};
use dicom_core::{Tag, VR};
use dicom_dictionary_std::StandardDataDictionary;
use tracing::trace;

use crate::common::attributes::{AttrValue, Attribute, AttributeSet};
use crate::common::tags::is_query_control;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Exact,
    /// Case-folded, punctuation-insensitive comparison for sources that
    /// store text lossily.
    Loose,
}

/// Outcome of checking one image against the remaining query constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageMatch {
    FullyMatched,
    Undetermined,
    Rejected,
}

#[derive(Debug, thiserror::Error)]
pub enum QueryTermError {
    #[error("Query term '{0}' is not of the form Keyword=Value")]
    Syntax(String),
    #[error("Unknown attribute keyword or tag '{0}'")]
    UnknownKey(String),
}

/// Compare one query attribute against one stored attribute.
pub fn value_matches(query: &Attribute, value: &Attribute, mode: MatchMode) -> bool {
    if query.is_empty() {
        return true;
    }

    match (&query.value, &value.value) {
        (AttrValue::Sequence(wanted), AttrValue::Sequence(items)) => wanted.iter().all(|q| {
            items
                .iter()
                .any(|item| matches_full(item, q, &AttributeSet::new()))
        }),
        (AttrValue::Text(_), AttrValue::Text(_)) => text_matches(query, value, mode),
        _ => false,
    }
}

fn text_matches(query: &Attribute, value: &Attribute, mode: MatchMode) -> bool {
    // the stored VR wins; a query built from a bare keyword may only carry LO
    let vr = if value.vr == VR::UN { query.vr } else { value.vr };

    match vr {
        VR::UI => query
            .values()
            .any(|q| value.values().any(|v| !q.is_empty() && q == v)),
        VR::DA | VR::TM | VR::DT => query.values().any(|q| {
            value.values().any(|v| {
                if q.contains('-') {
                    range_matches(q, v)
                } else {
                    wildcard_match(q, v)
                }
            })
        }),
        _ => {
            let fold = vr == VR::PN;
            query.values().any(|q| {
                value.values().any(|v| match mode {
                    MatchMode::Loose => wildcard_match(&loose_clean(q), &loose_clean(v)),
                    MatchMode::Exact if fold => {
                        wildcard_match(&q.to_ascii_uppercase(), &v.to_ascii_uppercase())
                    }
                    MatchMode::Exact => wildcard_match(q, v),
                })
            })
        }
    }
}

/// `*` and `?` glob over characters.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

fn range_matches(range: &str, value: &str) -> bool {
    let (lo, hi) = match range.split_once('-') {
        Some(bounds) => bounds,
        None => return false,
    };
    let lo = digits_only(lo);
    let hi = digits_only(hi);
    let v = digits_only(value);
    if v.is_empty() {
        return false;
    }

    let above = lo.is_empty() || v.as_str() >= lo.as_str();
    let below = hi.is_empty() || &v[..v.len().min(hi.len())] <= hi.as_str();
    above && below
}

fn digits_only(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Normalization used by `MatchMode::Loose`: upper case, `^` and `,` read as
/// spaces, other punctuation dropped, runs of spaces collapsed.
pub fn loose_clean(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_space = false;

    for c in s.chars() {
        let c = match c {
            '^' | ',' | '_' => ' ',
            '*' | '?' => c,
            c if c.is_ascii_punctuation() => continue,
            c => c.to_ascii_uppercase(),
        };
        if c.is_whitespace() {
            pending_space = !out.is_empty();
        } else {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            out.push(c);
        }
    }
    out
}

/// A constraint made only of `*` also accepts a missing attribute.
fn is_universal(query: &Attribute) -> bool {
    query.is_empty() || query.as_str().chars().all(|c| c == '*')
}

/// Coarse match of a summary record.
///
/// Every attribute of `record` that the query constrains is compared; the
/// verified values are added to `results`. Returns `false` at the first
/// mismatch. Query attributes absent from `record` are left for later.
pub fn matches_coarse(
    record: &AttributeSet,
    query: &AttributeSet,
    results: &mut AttributeSet,
    mode: MatchMode,
) -> bool {
    for (tag, attr) in record.iter() {
        if is_query_control(tag) {
            continue;
        }
        let Some(wanted) = query.get(tag) else {
            continue;
        };
        if wanted.is_empty() {
            continue;
        }
        if !value_matches(wanted, attr, mode) {
            trace!(
                "Query mismatch on ({:04X},{:04X}): wanted '{}', found '{}'",
                tag.group(),
                tag.element(),
                wanted.as_str(),
                attr.as_str()
            );
            return false;
        }
        results.insert(tag, attr.clone());
    }
    true
}

/// Decision after a full decode: every constraint not in `known` must be
/// present in `record` and match.
pub fn matches_full(record: &AttributeSet, query: &AttributeSet, known: &AttributeSet) -> bool {
    query.iter().all(|(tag, wanted)| {
        if is_query_control(tag) || wanted.is_empty() || known.contains(tag) {
            return true;
        }
        match record.get(tag) {
            Some(attr) => value_matches(wanted, attr, MatchMode::Exact),
            None => is_universal(wanted),
        }
    })
}

/// Per-image check that avoids a full decode when possible.
///
/// `known` holds the results of the coarse pass. Constraints not in `known`
/// are looked up in the image record; a mismatch there rejects the image.
/// Any constraint the image record cannot answer, and any non-empty
/// sequence constraint, leaves the outcome undetermined.
pub fn matches_image(image: &AttributeSet, query: &AttributeSet, known: &AttributeSet) -> ImageMatch {
    let mut settled = true;

    for (tag, wanted) in query.iter() {
        if is_query_control(tag) || wanted.is_empty() || known.contains(tag) {
            continue;
        }
        if wanted.items().is_some() {
            settled = false;
            continue;
        }
        match image.get(tag) {
            Some(attr) if value_matches(wanted, attr, MatchMode::Exact) => {}
            Some(_) => return ImageMatch::Rejected,
            None => settled = false,
        }
    }

    if settled {
        ImageMatch::FullyMatched
    } else {
        ImageMatch::Undetermined
    }
}

/// True when the query constrains nothing.
pub fn is_trivial(query: &AttributeSet) -> bool {
    query
        .iter()
        .all(|(tag, attr)| is_query_control(tag) || attr.is_empty())
}

/// Parse `Keyword=Value` (or `(gggg,eeee)=Value`) into a query attribute.
pub fn parse_query_term(term: &str) -> Result<(Tag, Attribute), QueryTermError> {
    let (key, value) = term
        .split_once('=')
        .ok_or_else(|| QueryTermError::Syntax(term.to_string()))?;
    let key = key.trim();

    let tag = StandardDataDictionary
        .parse_tag(key)
        .ok_or_else(|| QueryTermError::UnknownKey(key.to_string()))?;

    let vr = match StandardDataDictionary.by_tag(tag) {
        Some(entry) => match entry.vr {
            VirtualVr::Exact(vr) => vr,
            _ => VR::LO,
        },
        None => VR::LO,
    };

    Ok((tag, Attribute::text(vr, value.trim())))
}

/// Build a query from a list of `Keyword=Value` terms.
pub fn build_query<S: AsRef<str>>(terms: &[S]) -> Result<AttributeSet, QueryTermError> {
    let mut query = AttributeSet::new();
    for term in terms {
        let (tag, attr) = parse_query_term(term.as_ref())?;
        query.insert(tag, attr);
    }
    Ok(query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::tags;

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*", ""));
        assert!(wildcard_match("MR", "MR"));
        assert!(!wildcard_match("MR", "CT"));
        assert!(wildcard_match("DOE*", "DOE^JOHN"));
        assert!(wildcard_match("D?E*N", "DOE^JOHN"));
        assert!(wildcard_match("*JOHN", "DOE^JOHN"));
        assert!(!wildcard_match("*JANE", "DOE^JOHN"));
        assert!(!wildcard_match("DO", "DOE"));
    }

    #[test]
    fn test_uid_and_list_matching() {
        let value = Attribute::text(VR::UI, "1.2.840.1\0");
        assert!(value_matches(&Attribute::text(VR::UI, "1.2.840.1"), &value, MatchMode::Exact));
        assert!(value_matches(
            &Attribute::text(VR::UI, "1.2.3\\1.2.840.1"),
            &value,
            MatchMode::Exact
        ));
        // UIDs are never wildcard-matched
        assert!(!value_matches(&Attribute::text(VR::UI, "1.2.*"), &value, MatchMode::Exact));

        let image_type = Attribute::text(VR::CS, "ORIGINAL\\PRIMARY\\AXIAL");
        assert!(value_matches(&Attribute::text(VR::CS, "AXIAL"), &image_type, MatchMode::Exact));
        assert!(!value_matches(&Attribute::text(VR::CS, "LOCALIZER"), &image_type, MatchMode::Exact));
    }

    #[test]
    fn test_date_range_matching() {
        let date = Attribute::text(VR::DA, "20210615");
        let q = |s: &str| Attribute::text(VR::DA, s);
        assert!(value_matches(&q("20210101-20211231"), &date, MatchMode::Exact));
        assert!(value_matches(&q("20210615-"), &date, MatchMode::Exact));
        assert!(value_matches(&q("-20210615"), &date, MatchMode::Exact));
        assert!(!value_matches(&q("20220101-"), &date, MatchMode::Exact));
        assert!(value_matches(&q("2021*"), &date, MatchMode::Exact));

        let time = Attribute::text(VR::TM, "101530.25");
        assert!(value_matches(&Attribute::text(VR::TM, "1000-1100"), &time, MatchMode::Exact));
        assert!(!value_matches(&Attribute::text(VR::TM, "1100-"), &time, MatchMode::Exact));
    }

    #[test]
    fn test_person_name_case_and_loose_mode() {
        let name = Attribute::text(VR::PN, "Doe^John");
        assert!(value_matches(&Attribute::text(VR::PN, "DOE^JOHN"), &name, MatchMode::Exact));

        let mangled = Attribute::text(VR::LO, "doe, john");
        let wanted = Attribute::text(VR::LO, "DOE^JOHN");
        assert!(!value_matches(&wanted, &mangled, MatchMode::Exact));
        assert!(value_matches(&wanted, &mangled, MatchMode::Loose));

        assert_eq!(loose_clean("  O'Brien^ Pat,,Jr. "), "OBRIEN PAT JR");
    }

    #[test]
    fn test_coarse_short_circuit_and_results() {
        let query = AttributeSet::new()
            .with(tags::MODALITY, VR::CS, "MR")
            .with(tags::PATIENT_ID, VR::LO, "");
        let ct = AttributeSet::new()
            .with(tags::MODALITY, VR::CS, "CT")
            .with(tags::PATIENT_ID, VR::LO, "P1");
        let mr = AttributeSet::new()
            .with(tags::MODALITY, VR::CS, "MR")
            .with(tags::PATIENT_ID, VR::LO, "P1");

        let mut results = AttributeSet::new();
        assert!(!matches_coarse(&ct, &query, &mut results, MatchMode::Exact));

        let mut results = AttributeSet::new();
        assert!(matches_coarse(&mr, &query, &mut results, MatchMode::Exact));
        assert!(results.contains(tags::MODALITY));
        // wildcards are not recorded as results
        assert!(!results.contains(tags::PATIENT_ID));
    }

    #[test]
    fn test_image_tri_state() {
        let query = AttributeSet::new()
            .with(tags::MODALITY, VR::CS, "MR")
            .with(tags::INSTANCE_NUMBER, VR::IS, "5");
        let known = AttributeSet::new().with(tags::MODALITY, VR::CS, "MR");

        let five = AttributeSet::new().with(tags::INSTANCE_NUMBER, VR::IS, "5");
        let six = AttributeSet::new().with(tags::INSTANCE_NUMBER, VR::IS, "6");
        let bare = AttributeSet::new();

        assert_eq!(matches_image(&five, &query, &known), ImageMatch::FullyMatched);
        assert_eq!(matches_image(&six, &query, &known), ImageMatch::Rejected);
        assert_eq!(matches_image(&bare, &query, &known), ImageMatch::Undetermined);
        assert_eq!(
            matches_image(&five, &query, &AttributeSet::new()),
            ImageMatch::Undetermined
        );
    }

    #[test]
    fn test_sequence_constraint_is_never_settled_per_image() {
        let item = AttributeSet::new().with(tags::SOP_INSTANCE_UID, VR::UI, "1.2.3");
        let mut query = AttributeSet::new();
        query.insert(Tag(0x0008, 0x1140), Attribute::sequence(vec![item.clone()]));

        let mut image = AttributeSet::new();
        image.insert(Tag(0x0008, 0x1140), Attribute::sequence(vec![item]));

        assert_eq!(
            matches_image(&image, &query, &AttributeSet::new()),
            ImageMatch::Undetermined
        );
        assert!(matches_full(&image, &query, &AttributeSet::new()));
    }

    #[test]
    fn test_full_match_absent_attribute() {
        let record = AttributeSet::new().with(tags::MODALITY, VR::CS, "MR");
        let strict = AttributeSet::new().with(tags::BODY_PART_EXAMINED, VR::CS, "HEAD");
        let universal = AttributeSet::new().with(tags::BODY_PART_EXAMINED, VR::CS, "*");

        assert!(!matches_full(&record, &strict, &AttributeSet::new()));
        assert!(matches_full(&record, &universal, &AttributeSet::new()));
        let known = AttributeSet::new().with(tags::BODY_PART_EXAMINED, VR::CS, "HEAD");
        assert!(matches_full(&record, &strict, &known));
    }

    #[test]
    fn test_parse_query_term() {
        let (tag, attr) = parse_query_term("Modality=MR").unwrap();
        assert_eq!(tag, tags::MODALITY);
        assert_eq!(attr.vr, VR::CS);
        assert_eq!(attr.as_str(), "MR");

        let (tag, attr) = parse_query_term("PatientName=DOE*").unwrap();
        assert_eq!(tag, tags::PATIENT_NAME);
        assert_eq!(attr.vr, VR::PN);

        assert!(matches!(parse_query_term("Modality"), Err(QueryTermError::Syntax(_))));
        assert!(matches!(
            parse_query_term("NotAKeyword=1"),
            Err(QueryTermError::UnknownKey(_))
        ));

        let query = build_query(&["Modality=MR", "PatientID="]).unwrap();
        assert_eq!(query.len(), 2);
        assert!(!is_trivial(&query));
        assert!(is_trivial(&build_query(&["PatientID="]).unwrap()));
    }
}
