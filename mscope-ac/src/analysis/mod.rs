//! Alignment analysis engine
//!
//! Pure computation: alignment bytes in, one [`PositionResult`] per column out.
//! For each column the residues are tallied, gaps optionally dropped, the
//! ambiguity symbol flags the column as low-confidence and is excluded from
//! the frequency denominator, and the column is tagged Green (conserved) or
//! Red (mutated) against the reference residue.

pub mod alignment;
pub mod export;

pub use alignment::Alignment;

use crate::error::AnalysisError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Default gap symbol
pub const GAP_SYMBOL: u8 = b'-';

/// Default ambiguity symbol
pub const AMBIGUITY_SYMBOL: u8 = b'X';

/// Columns between progress log lines
const PROGRESS_CHUNK: usize = 1000;

/// Conserved/mutated tag of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Color {
    Green,
    Red,
}

impl Color {
    pub fn label(self) -> &'static str {
        match self {
            Color::Green => "Green",
            Color::Red => "Red",
        }
    }
}

/// Whether the ambiguity symbol occurred in a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    #[serde(rename = "High-confidence")]
    High,
    #[serde(rename = "Low-confidence")]
    Low,
}

impl Confidence {
    pub fn label(self) -> &'static str {
        match self {
            Confidence::High => "High-confidence",
            Confidence::Low => "Low-confidence",
        }
    }
}

/// Statistics for one alignment column
///
/// This is the on-disk shape of one entry of the results artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PositionResult {
    /// 1-based column number
    pub position: u32,
    pub reference: String,
    pub counts: BTreeMap<String, u32>,
    /// Percent per residue, 2-decimal rounding, ambiguity symbol excluded
    pub frequencies: BTreeMap<String, f64>,
    pub ambiguity: Confidence,
    pub mutation_representation: String,
    pub color: Color,
}

/// Summary statistics stored on a registry record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryStats {
    pub total_positions: u32,
    pub mutation_count: u32,
    pub low_confidence_count: u32,
    pub mutated_positions: Vec<u32>,
    pub low_confidence_positions: Vec<u32>,
}

impl SummaryStats {
    pub fn from_results(positions: &[PositionResult]) -> Self {
        let mutated_positions: Vec<u32> = positions
            .iter()
            .filter(|p| p.color == Color::Red)
            .map(|p| p.position)
            .collect();
        let low_confidence_positions: Vec<u32> = positions
            .iter()
            .filter(|p| p.ambiguity == Confidence::Low)
            .map(|p| p.position)
            .collect();

        Self {
            total_positions: positions.len() as u32,
            mutation_count: mutated_positions.len() as u32,
            low_confidence_count: low_confidence_positions.len() as u32,
            mutated_positions,
            low_confidence_positions,
        }
    }

    pub fn conserved_count(&self) -> u32 {
        self.total_positions.saturating_sub(self.mutation_count)
    }
}

/// Engine options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisOptions {
    /// Count gap symbols as residues (default: excluded)
    pub include_gaps: bool,
    pub gap_symbol: u8,
    pub ambiguity_symbol: u8,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            include_gaps: false,
            gap_symbol: GAP_SYMBOL,
            ambiguity_symbol: AMBIGUITY_SYMBOL,
        }
    }
}

/// Everything one analysis run produces
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutput {
    pub positions: Vec<PositionResult>,
    pub summary: SummaryStats,
}

impl AnalysisOutput {
    /// Serialized results artifact
    pub fn results_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serialize_results(&self.positions)
    }

    /// Serialized export artifact (CSV)
    pub fn export_bytes(&self) -> Result<Vec<u8>, AnalysisError> {
        export::render_csv(&self.positions)
    }
}

/// Serialize per-position results into the results artifact format
pub fn serialize_results(positions: &[PositionResult]) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec_pretty(positions)
}

/// Parse a results artifact
pub fn parse_results(bytes: &[u8]) -> Result<Vec<PositionResult>, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Per-column variant statistics
#[derive(Debug, Clone, Default)]
pub struct AnalysisEngine {
    options: AnalysisOptions,
}

impl AnalysisEngine {
    pub fn new(options: AnalysisOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &AnalysisOptions {
        &self.options
    }

    /// Parse `source` as an alignment and analyze it
    pub fn analyze(&self, source: &[u8]) -> Result<AnalysisOutput, AnalysisError> {
        let alignment = Alignment::from_fasta(source)?;
        let positions = self.analyze_alignment(&alignment);
        let summary = SummaryStats::from_results(&positions);
        Ok(AnalysisOutput { positions, summary })
    }

    /// Analyze every column of an already-parsed alignment
    pub fn analyze_alignment(&self, alignment: &Alignment) -> Vec<PositionResult> {
        let length = alignment.len();
        info!(
            sequences = alignment.num_sequences(),
            positions = length,
            "Analyzing alignment"
        );

        let mut positions = Vec::with_capacity(length);
        for index in 0..length {
            if index % PROGRESS_CHUNK == 0 && index > 0 {
                debug!(
                    "Processing position {}/{} ({:.1}%)",
                    index + 1,
                    length,
                    (index + 1) as f64 / length as f64 * 100.0
                );
            }
            positions.push(self.analyze_column(alignment, index));
        }

        positions
    }

    fn analyze_column(&self, alignment: &Alignment, index: usize) -> PositionResult {
        let AnalysisOptions {
            include_gaps,
            gap_symbol,
            ambiguity_symbol,
        } = self.options;

        let mut counts: BTreeMap<u8, u32> = BTreeMap::new();
        for residue in alignment.column(index) {
            *counts.entry(residue).or_default() += 1;
        }
        if !include_gaps {
            counts.remove(&gap_symbol);
        }

        let has_ambiguity = counts.contains_key(&ambiguity_symbol);
        let total_non_ambiguous: u32 = counts
            .iter()
            .filter(|(residue, _)| **residue != ambiguity_symbol)
            .map(|(_, count)| *count)
            .sum();

        let frequencies: BTreeMap<u8, f64> = if total_non_ambiguous > 0 {
            counts
                .iter()
                .filter(|(residue, _)| **residue != ambiguity_symbol)
                .map(|(residue, count)| {
                    let pct = *count as f64 / total_non_ambiguous as f64 * 100.0;
                    (*residue, round2(pct))
                })
                .collect()
        } else {
            BTreeMap::new()
        };

        let reference = alignment.reference()[index];
        let position = (index + 1) as u32;

        // BTreeMap iteration gives ascending variant symbol order
        let variants: Vec<(u8, f64)> = frequencies
            .iter()
            .filter(|(residue, pct)| **residue != reference && **pct > 0.0)
            .map(|(residue, pct)| (*residue, *pct))
            .collect();

        let (color, mutation_representation) = if variants.is_empty() {
            let reference_pct = frequencies.get(&reference).copied().unwrap_or(100.0);
            (
                Color::Green,
                format!("{} ({}%)", reference as char, format_percent(reference_pct)),
            )
        } else {
            let fragments: Vec<String> = variants
                .iter()
                .map(|(variant, pct)| {
                    format!(
                        "{}{}{}({}%)",
                        reference as char,
                        position,
                        *variant as char,
                        format_percent(*pct)
                    )
                })
                .collect();
            (Color::Red, fragments.join(", "))
        };

        PositionResult {
            position,
            reference: symbol(reference),
            counts: counts.into_iter().map(|(r, c)| (symbol(r), c)).collect(),
            frequencies: frequencies.into_iter().map(|(r, f)| (symbol(r), f)).collect(),
            ambiguity: if has_ambiguity {
                Confidence::Low
            } else {
                Confidence::High
            },
            mutation_representation,
            color,
        }
    }
}

fn symbol(residue: u8) -> String {
    (residue as char).to_string()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Shortest representation with at least one decimal: `100.0`, `25.0`, `33.33`
pub fn format_percent(value: f64) -> String {
    format!("{:?}", value)
}
