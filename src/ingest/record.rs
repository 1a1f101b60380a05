//! Record parser for the tab-separated edge list.
//!
//! Column layout (0-based): 1 = first node, 3 = second node, 4 = first label,
//! 5 = second label, 6 = relation. Records need at least [`MIN_FIELDS`] fields.

use crate::error::{KgraphError, Result};

/// Minimum number of tab-separated fields in a usable record
pub const MIN_FIELDS: usize = 7;

/// One parsed line: two node sightings and the relation joining them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub first: String,
    pub first_label: String,
    pub second: String,
    pub second_label: String,
    pub relation: String,
}

/// Parse a raw line, explaining why it was rejected
pub fn try_parse_record(line: &str) -> Result<Record> {
    let line = line.trim_end_matches(['\r', '\n']);
    let fields: Vec<&str> = line.split('\t').collect();

    if fields.iter().all(|f| f.trim().is_empty()) {
        return Err(KgraphError::Parse("blank record".to_string()));
    }
    if fields.len() < MIN_FIELDS {
        return Err(KgraphError::Parse(format!(
            "expected at least {} fields, found {}",
            MIN_FIELDS,
            fields.len()
        )));
    }

    Ok(Record {
        first: fields[1].trim().to_string(),
        first_label: fields[4].trim().to_string(),
        second: fields[3].trim().to_string(),
        second_label: fields[5].trim().to_string(),
        relation: fields[6].trim().to_string(),
    })
}

/// Parse a raw line, or `None` when it should be skipped
pub fn parse_record(line: &str) -> Option<Record> {
    try_parse_record(line).ok()
}
