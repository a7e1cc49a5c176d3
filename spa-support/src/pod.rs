//! Minimal typed data-object ("POD") plumbing: `Format`, `PortInfo`,
//! `AllocParam`, `Props`, plus the copy/filter/build operations an external
//! typed-data-objects collaborator is responsible for. Real format
//! negotiation logic (codec capability intersection, etc.) lives outside
//! the core's contract — what's here is just enough structure for the core
//! to own, copy, compare, and filter formats without caring what they mean.

use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum PropValue {
    Int(i64),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
}

pub type PropMap = BTreeMap<u32, PropValue>;

/// A negotiable media format: a media type/subtype pair (resolved ids from
/// the type map) plus an open bag of codec-specific properties.
#[derive(Clone, Debug, PartialEq, Eq, Default, bincode::Encode, bincode::Decode)]
pub struct Format {
    pub media_type: u32,
    pub media_subtype: u32,
    pub props: PropMap,
}

impl Format {
    pub fn new(media_type: u32, media_subtype: u32) -> Self {
        Self {
            media_type,
            media_subtype,
            props: PropMap::new(),
        }
    }

    pub fn with_prop(mut self, key: u32, value: PropValue) -> Self {
        self.props.insert(key, value);
        self
    }

    /// `spa_format_filter`-equivalent: `self` acts as a filter over
    /// `candidate`. A filter key of `media_type`/`media_subtype` of `0`
    /// means "don't care"; any prop present in the filter must be present
    /// and equal in the candidate. Returns the candidate unchanged on
    /// match (the original returns an intersected form; without real codec
    /// semantics to intersect, the candidate itself is the richest
    /// available answer).
    pub fn filter(&self, candidate: &Format) -> Option<Format> {
        if self.media_type != 0 && self.media_type != candidate.media_type {
            return None;
        }
        if self.media_subtype != 0 && self.media_subtype != candidate.media_subtype {
            return None;
        }
        for (k, v) in &self.props {
            match candidate.props.get(k) {
                Some(cv) if cv == v => {}
                _ => return None,
            }
        }
        Some(candidate.clone())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default, bincode::Encode, bincode::Decode)]
pub struct AllocParam {
    pub param_type: u32,
    pub flags: u32,
    pub min_size: u32,
    pub max_size: u32,
    pub align: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Default, bincode::Encode, bincode::Decode)]
pub struct PortInfo {
    pub flags: u32,
    pub rate: u32,
    pub latency_ns: u64,
    pub extra: PropMap,
    pub params: Vec<AllocParam>,
}

#[derive(Clone, Debug, PartialEq, Eq, Default, bincode::Encode, bincode::Decode)]
pub struct Props {
    pub values: PropMap,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_matches_on_subset_of_props() {
        let filter = Format::new(1, 2).with_prop(10, PropValue::Int(44100));
        let candidate = Format::new(1, 2)
            .with_prop(10, PropValue::Int(44100))
            .with_prop(11, PropValue::Int(2));
        assert_eq!(filter.filter(&candidate), Some(candidate));
    }

    #[test]
    fn filter_rejects_mismatched_type() {
        let filter = Format::new(1, 2);
        let candidate = Format::new(1, 3);
        assert_eq!(filter.filter(&candidate), None);
    }

    #[test]
    fn filter_rejects_missing_prop() {
        let filter = Format::new(1, 2).with_prop(10, PropValue::Int(44100));
        let candidate = Format::new(1, 2);
        assert_eq!(filter.filter(&candidate), None);
    }
}
