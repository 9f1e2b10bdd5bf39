//! Alignment parsing
//!
//! An alignment is a rectangular set of sequences. The first sequence in
//! input order is the reference.

use crate::error::AnalysisError;
use bio::io::fasta;

/// A parsed, validated, rectangular alignment
#[derive(Debug, Clone)]
pub struct Alignment {
    ids: Vec<String>,
    sequences: Vec<Vec<u8>>,
    length: usize,
}

impl Alignment {
    /// Build from (id, residues) pairs, checking that every sequence has the same length
    pub fn new(records: Vec<(String, Vec<u8>)>) -> Result<Self, AnalysisError> {
        let Some((_, first)) = records.first() else {
            return Err(AnalysisError::EmptyAlignment);
        };
        let length = first.len();

        if let Some((id, seq)) = records.iter().find(|(_, seq)| seq.len() != length) {
            return Err(AnalysisError::UnsupportedFormat(format!(
                "sequence '{}' has length {}, expected {} (alignment is not rectangular)",
                id,
                seq.len(),
                length
            )));
        }

        let (ids, sequences) = records.into_iter().unzip();
        Ok(Self {
            ids,
            sequences,
            length,
        })
    }

    /// Parse a multi-record FASTA alignment
    pub fn from_fasta(bytes: &[u8]) -> Result<Self, AnalysisError> {
        let reader = fasta::Reader::new(bytes);
        let mut records = Vec::new();

        for result in reader.records() {
            let record = result.map_err(|e| AnalysisError::UnsupportedFormat(e.to_string()))?;
            record
                .check()
                .map_err(|e| AnalysisError::UnsupportedFormat(e.to_string()))?;
            records.push((record.id().to_string(), record.seq().to_vec()));
        }

        Self::new(records)
    }

    /// Number of columns
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn num_sequences(&self) -> usize {
        self.sequences.len()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// The reference sequence (first in input order)
    pub fn reference(&self) -> &[u8] {
        &self.sequences[0]
    }

    /// Residues at column `index` (0-based) across all sequences
    pub fn column(&self, index: usize) -> impl Iterator<Item = u8> + '_ {
        self.sequences.iter().map(move |seq| seq[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fasta() {
        let alignment = Alignment::from_fasta(b">ref\nACGT\n>s1\nACGA\n>s2\nAC-T\n").unwrap();
        assert_eq!(alignment.num_sequences(), 3);
        assert_eq!(alignment.len(), 4);
        assert_eq!(alignment.reference(), b"ACGT");
        assert_eq!(alignment.column(3).collect::<Vec<_>>(), b"TAT".to_vec());
        assert_eq!(alignment.ids()[1], "s1");
    }

    #[test]
    fn test_multiline_sequences_are_joined() {
        let alignment = Alignment::from_fasta(b">a\nAC\nGT\n>b\nACGT\n").unwrap();
        assert_eq!(alignment.len(), 4);
    }

    #[test]
    fn test_empty_input() {
        let err = Alignment::from_fasta(b"").unwrap_err();
        assert!(matches!(err, AnalysisError::EmptyAlignment));
    }

    #[test]
    fn test_not_fasta() {
        let err = Alignment::from_fasta(b"this is not an alignment\n").unwrap_err();
        assert!(matches!(err, AnalysisError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_ragged_alignment_rejected() {
        let err = Alignment::from_fasta(b">a\nACGT\n>b\nACG\n").unwrap_err();
        match err {
            AnalysisError::UnsupportedFormat(msg) => assert!(msg.contains("'b'")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
