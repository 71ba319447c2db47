//! Reading tab-separated PSM feature tables, plain or gzip-compressed,
//! from a file or STDIN.
//!
//! The expected layout is a header line naming `SpecId`, `Label`, and
//! `ScanNr` columns (case-insensitive), optionally `ExpMass` and
//! `CalcMass`, then one column per feature, then optionally `Peptide`
//! followed by one or more protein columns. An optional `DefaultDirection`
//! row directly below the header seeds the learner with hand-picked
//! feature weights.

use std::fs;
use std::io::{self, BufRead};

use crossbeam_channel::Sender;
use flate2::bufread::MultiGzDecoder;
use thiserror::Error;
use tracing::{debug, warn};

use psmrescore::psm::{LabelClass, Psm, SpectrumId};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Error)]
pub enum InputError {
    #[error("An IO error occurred: {0}")]
    IOError(
        #[source]
        #[from]
        io::Error,
    ),
    #[error("The input has no header line")]
    MissingHeader,
    #[error("Required column {0:?} is missing from the header")]
    MissingColumn(&'static str),
    #[error("The header declares no feature columns")]
    NoFeatureColumns,
    #[error("Line {line}: cannot interpret label {value:?}, expected 1 or -1")]
    BadLabel { line: usize, value: String },
    #[error("Line {line}: column {column:?} holds non-numeric value {value:?}")]
    BadNumber {
        line: usize,
        column: String,
        value: String,
    },
    #[error("Line {line}: expected at least {expected} columns, found {found}")]
    ShortLine {
        line: usize,
        expected: usize,
        found: usize,
    },
    #[error("The receiving side hung up before the input was exhausted")]
    ChannelClosed,
}

/// One unit of parsed input, in the order the stream produces them: the
/// header first, then at most one default direction, then PSM rows.
#[derive(Debug, Clone)]
pub enum InputRecord {
    Header { feature_names: Vec<String> },
    DefaultDirection(Vec<f64>),
    Row {
        psm: Psm,
        label: LabelClass,
        features: Vec<f64>,
    },
}

/// Open a feature table for reading, transparently decompressing gzip
/// input. `-` reads from STDIN.
pub fn open_input(path: &str) -> io::Result<Box<dyn BufRead + Send>> {
    if path == "-" {
        let mut stream = io::BufReader::new(io::stdin());
        let compressed = stream.fill_buf()?.starts_with(&GZIP_MAGIC);
        debug!("Reading from STDIN (compressed? {compressed})");
        if compressed {
            Ok(Box::new(io::BufReader::new(MultiGzDecoder::new(stream))))
        } else {
            Ok(Box::new(stream))
        }
    } else {
        let mut stream = io::BufReader::new(fs::File::open(path)?);
        let compressed = stream.fill_buf()?.starts_with(&GZIP_MAGIC);
        debug!("Reading from {path} (compressed? {compressed})");
        if compressed {
            Ok(Box::new(io::BufReader::new(MultiGzDecoder::new(stream))))
        } else {
            Ok(Box::new(stream))
        }
    }
}

/// Where each recognized column lives in one input's header.
#[derive(Debug, Default, Clone)]
struct PinSchema {
    spec_id: usize,
    label: usize,
    scan: usize,
    exp_mass: Option<usize>,
    calc_mass: Option<usize>,
    features: Vec<(usize, String)>,
    peptide: Option<usize>,
    proteins_from: Option<usize>,
}

impl PinSchema {
    fn from_header(header: &str) -> Result<Self, InputError> {
        let mut schema = PinSchema::default();
        let mut seen_spec_id = false;
        let mut seen_label = false;
        let mut seen_scan = false;
        for (ix, cell) in header.split('\t').enumerate() {
            if schema.proteins_from.is_some() {
                continue;
            }
            match cell.trim().to_ascii_lowercase().as_str() {
                "specid" | "psmid" => {
                    schema.spec_id = ix;
                    seen_spec_id = true;
                }
                "label" => {
                    schema.label = ix;
                    seen_label = true;
                }
                "scannr" => {
                    schema.scan = ix;
                    seen_scan = true;
                }
                "expmass" => schema.exp_mass = Some(ix),
                "calcmass" => schema.calc_mass = Some(ix),
                "peptide" => schema.peptide = Some(ix),
                "proteins" | "proteinids" => schema.proteins_from = Some(ix),
                _ => {
                    if schema.peptide.is_some() {
                        // trailing unrecognized columns belong to proteins
                        schema.proteins_from = Some(ix);
                    } else {
                        schema.features.push((ix, cell.trim().to_string()));
                    }
                }
            }
        }
        if !seen_spec_id {
            return Err(InputError::MissingColumn("SpecId"));
        }
        if !seen_label {
            return Err(InputError::MissingColumn("Label"));
        }
        if !seen_scan {
            return Err(InputError::MissingColumn("ScanNr"));
        }
        if schema.features.is_empty() {
            return Err(InputError::NoFeatureColumns);
        }
        Ok(schema)
    }

    fn min_columns(&self) -> usize {
        self.features.last().map(|(ix, _)| ix + 1).unwrap_or(0)
    }

    fn feature_names(&self) -> Vec<String> {
        self.features.iter().map(|(_, name)| name.clone()).collect()
    }

    /// The default-direction row simply lists a weight under each feature
    /// column; anything unparseable counts as zero.
    fn parse_default_direction(&self, cells: &[&str]) -> Vec<f64> {
        self.features
            .iter()
            .map(|(ix, _)| {
                cells
                    .get(*ix)
                    .and_then(|cell| cell.trim().parse().ok())
                    .unwrap_or(0.0)
            })
            .collect()
    }

    fn parse_row(&self, line_no: usize, cells: &[&str]) -> Result<InputRecord, InputError> {
        if cells.len() < self.min_columns() {
            return Err(InputError::ShortLine {
                line: line_no,
                expected: self.min_columns(),
                found: cells.len(),
            });
        }
        let label = match cells[self.label].trim().trim_start_matches('+') {
            "1" => LabelClass::Target,
            "-1" => LabelClass::Decoy,
            value => {
                return Err(InputError::BadLabel {
                    line: line_no,
                    value: value.to_string(),
                })
            }
        };
        let scan: u32 = self.parse_cell(line_no, cells, self.scan, "ScanNr")?;
        let mut psm = Psm::new(
            cells[self.spec_id].trim().to_string(),
            SpectrumId::new(0, scan),
            self.peptide
                .and_then(|ix| cells.get(ix))
                .map(|cell| cell.trim().to_string())
                .unwrap_or_default(),
        );
        if let Some(ix) = self.exp_mass {
            psm.exp_mass = self.parse_cell(line_no, cells, ix, "ExpMass")?;
        }
        if let Some(ix) = self.calc_mass {
            psm.calc_mass = self.parse_cell(line_no, cells, ix, "CalcMass")?;
        }
        if let Some(from) = self.proteins_from {
            psm.proteins = cells[from.min(cells.len())..]
                .iter()
                .map(|cell| cell.trim().to_string())
                .filter(|cell| !cell.is_empty())
                .collect();
        }
        let mut features = Vec::with_capacity(self.features.len());
        for (ix, name) in self.features.iter() {
            let cell = cells[*ix].trim();
            let value: f64 = cell.parse().map_err(|_| InputError::BadNumber {
                line: line_no,
                column: name.clone(),
                value: cell.to_string(),
            })?;
            features.push(value);
        }
        Ok(InputRecord::Row {
            psm,
            label,
            features,
        })
    }

    fn parse_cell<T: std::str::FromStr>(
        &self,
        line_no: usize,
        cells: &[&str],
        ix: usize,
        column: &str,
    ) -> Result<T, InputError> {
        let cell = cells.get(ix).map(|c| c.trim()).unwrap_or_default();
        cell.parse().map_err(|_| InputError::BadNumber {
            line: line_no,
            column: column.to_string(),
            value: cell.to_string(),
        })
    }
}

/// Parse the stream line by line, pushing each record into `sender`.
/// Returns the number of lines skipped.
///
/// Parsing failures end the stream; the receiving side observes the
/// channel closing and picks the error up when it joins the reader.
pub fn stream_records<R: BufRead>(
    reader: R,
    sender: Sender<InputRecord>,
) -> Result<usize, InputError> {
    let mut lines = reader.lines();
    let header = lines.next().ok_or(InputError::MissingHeader)??;
    let schema = PinSchema::from_header(&header)?;
    debug!(
        "Input carries {} feature columns: {:?}",
        schema.features.len(),
        schema.feature_names()
    );
    sender
        .send(InputRecord::Header {
            feature_names: schema.feature_names(),
        })
        .map_err(|_| InputError::ChannelClosed)?;

    let mut line_no = 1usize;
    let mut skipped = 0usize;
    let mut first_data_row = true;
    for line in lines {
        let line = line?;
        line_no += 1;
        if line.trim().is_empty() {
            warn!("Line {line_no} is blank, skipping it");
            skipped += 1;
            continue;
        }
        let cells: Vec<&str> = line.split('\t').collect();
        let record = if first_data_row
            && cells
                .first()
                .map(|c| c.trim().eq_ignore_ascii_case("defaultdirection"))
                .unwrap_or(false)
        {
            InputRecord::DefaultDirection(schema.parse_default_direction(&cells))
        } else {
            schema.parse_row(line_no, &cells)?
        };
        first_data_row = false;
        sender.send(record).map_err(|_| InputError::ChannelClosed)?;
    }
    Ok(skipped)
}
