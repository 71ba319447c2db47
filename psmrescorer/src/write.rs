//! Writing result tables and weight files, and reading weights back.

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use itertools::Itertools;
use thiserror::Error;

use psmrescore::psm::LabelClass;
use psmrescore::scores::ScoreSet;
use psmrescore::solver::WeightVector;

pub const RESULT_HEADER: &str = "PSMId\tscore\tq-value\tposterior_error_prob\tpeptide\tproteinIds";

/// Open a result file for writing, gzip-compressing when the path ends in
/// `.gz`. `-` writes to STDOUT.
pub fn open_output(path: &Path) -> io::Result<Box<dyn Write + Send>> {
    if path == Path::new("-") {
        Ok(Box::new(io::stdout()))
    } else {
        let handle = io::BufWriter::new(fs::File::create(path)?);
        if path.extension().map(|e| e == "gz").unwrap_or(false) {
            Ok(Box::new(GzEncoder::new(handle, Compression::best())))
        } else {
            Ok(Box::new(handle))
        }
    }
}

/// Write the entries of `collection` carrying `label` as a tab-separated
/// result table. Returns the number of rows written.
pub fn write_collection<W: Write>(
    writer: &mut W,
    collection: &ScoreSet,
    label: LabelClass,
) -> io::Result<usize> {
    writeln!(writer, "{RESULT_HEADER}")?;
    let mut written = 0usize;
    for entry in collection.iter().filter(|e| e.label == label) {
        writeln!(
            writer,
            "{}\t{:0.8}\t{:0.8}\t{:0.8e}\t{}\t{}",
            entry.psm.id,
            entry.score,
            entry.q,
            entry.pep,
            entry.psm.peptide,
            entry.psm.proteins.iter().join("\t")
        )?;
        written += 1;
    }
    writer.flush()?;
    Ok(written)
}

/// Write the per-fold directions: a header of feature names plus the `m0`
/// bias column, then per fold one line of normalized-space weights followed
/// by one line of raw-unit weights.
pub fn write_weights<W: Write>(
    writer: &mut W,
    feature_names: &[String],
    normalized: &[WeightVector],
    raw: &[WeightVector],
) -> io::Result<()> {
    writeln!(writer, "{}\tm0", feature_names.iter().join("\t"))?;
    for (norm, raw) in normalized.iter().zip(raw) {
        writeln!(
            writer,
            "{}",
            norm.values().iter().map(|v| format!("{v:0.6}")).join("\t")
        )?;
        writeln!(
            writer,
            "{}",
            raw.values().iter().map(|v| format!("{v:0.6}")).join("\t")
        )?;
    }
    writer.flush()
}

#[derive(Debug, Error)]
pub enum WeightFileError {
    #[error("An IO error occurred: {0}")]
    IOError(
        #[source]
        #[from]
        io::Error,
    ),
    #[error("No numeric weight line found")]
    NoWeightLines,
    #[error("Line {line}: weight value {value:?} is not numeric")]
    BadWeight { line: usize, value: String },
}

/// Read a bootstrap direction back from a weight file.
///
/// Lines whose first token is not numeric (headers, comments) are skipped.
/// The first numeric line holds normalized-space weights and the second
/// holds raw-unit weights; the raw line is the one a new run can be seeded
/// with, falling back to the first line for single-line files.
pub fn read_initial_weights<R: BufRead>(reader: R) -> Result<Vec<f64>, WeightFileError> {
    let mut numeric_lines: Vec<Vec<f64>> = Vec::new();
    for (ix, line) in reader.lines().enumerate() {
        let line = line?;
        let mut tokens = line.split('\t').map(str::trim).filter(|t| !t.is_empty());
        let Some(first) = tokens.next() else {
            continue;
        };
        let Ok(first_value) = first.parse::<f64>() else {
            continue;
        };
        let mut values = vec![first_value];
        for token in tokens {
            let value = token.parse::<f64>().map_err(|_| WeightFileError::BadWeight {
                line: ix + 1,
                value: token.to_string(),
            })?;
            values.push(value);
        }
        numeric_lines.push(values);
        if numeric_lines.len() == 2 {
            break;
        }
    }
    numeric_lines
        .pop()
        .ok_or(WeightFileError::NoWeightLines)
}

#[cfg(test)]
mod test {
    use super::*;
    use psmrescore::psm::{Psm, SpectrumId};
    use psmrescore::scores::ScoredPsm;
    use psmrescore::arena::FeatureArena;

    #[test]
    fn test_write_collection_filters_label() {
        let mut arena = FeatureArena::new(1);
        let mut set = ScoreSet::new();
        for (id, label) in [("t1", LabelClass::Target), ("d1", LabelClass::Decoy)] {
            let mut psm = Psm::new(id.into(), SpectrumId::new(0, 1), "K.PEP.K".into());
            psm.proteins = vec!["p1".into(), "p2".into()];
            let mut entry = ScoredPsm::new(psm.shared(), arena.acquire_from(&[0.0]), label);
            entry.score = 1.5;
            entry.q = 0.01;
            entry.pep = 1e-4;
            set.push(entry);
        }
        let mut buffer = Vec::new();
        let written = write_collection(&mut buffer, &set, LabelClass::Target).unwrap();
        assert_eq!(written, 1);
        let text = String::from_utf8(buffer).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), RESULT_HEADER);
        let row = lines.next().unwrap();
        assert!(row.starts_with("t1\t1.50000000\t0.01000000\t"));
        assert!(row.ends_with("K.PEP.K\tp1\tp2"));
        assert!(lines.next().is_none());
    }

    #[test]
    fn test_weight_round_trip_returns_raw_line() {
        let names = vec!["score".to_string(), "deltCn".to_string()];
        let normalized = vec![WeightVector::from_values(vec![1.25, -0.5, 0.125])];
        let raw = vec![WeightVector::from_values(vec![2.5, -1.0, 0.25])];
        let mut buffer = Vec::new();
        write_weights(&mut buffer, &names, &normalized, &raw).unwrap();
        let weights = read_initial_weights(io::Cursor::new(buffer)).unwrap();
        assert_eq!(weights, vec![2.5, -1.0, 0.25]);
    }

    #[test]
    fn test_read_weights_rejects_empty() {
        let err = read_initial_weights(io::Cursor::new("feature\tm0\n")).unwrap_err();
        assert!(matches!(err, WeightFileError::NoWeightLines));
    }

    #[test]
    fn test_read_weights_single_line_fallback() {
        let weights =
            read_initial_weights(io::Cursor::new("score\tm0\n0.5\t0.0\n")).unwrap();
        assert_eq!(weights, vec![0.5, 0.0]);
    }
}
