//! CSV rendering of per-position results

use super::{format_percent, PositionResult};
use crate::error::AnalysisError;
use std::collections::BTreeMap;

const HEADER: [&str; 7] = [
    "Position",
    "Reference",
    "Counts",
    "Frequencies",
    "Ambiguity",
    "MutationRepresentation",
    "Color",
];

/// Render results as CSV: header row, then one row per position
pub fn render_csv(positions: &[PositionResult]) -> Result<Vec<u8>, AnalysisError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(HEADER)
        .map_err(|e| AnalysisError::Export(e.to_string()))?;

    for p in positions {
        writer
            .write_record([
                p.position.to_string(),
                p.reference.clone(),
                render_map(&p.counts, |c| c.to_string()),
                render_map(&p.frequencies, |f| format_percent(*f)),
                p.ambiguity.label().to_string(),
                p.mutation_representation.clone(),
                p.color.label().to_string(),
            ])
            .map_err(|e| AnalysisError::Export(e.to_string()))?;
    }

    writer
        .into_inner()
        .map_err(|e| AnalysisError::Export(e.to_string()))
}

/// `{'A': 3, 'T': 1}`
fn render_map<V>(map: &BTreeMap<String, V>, value: impl Fn(&V) -> String) -> String {
    let entries: Vec<String> = map
        .iter()
        .map(|(key, v)| format!("'{}': {}", key, value(v)))
        .collect();
    format!("{{{}}}", entries.join(", "))
}
