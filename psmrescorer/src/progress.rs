/// Running tallies of what the reader has fed into the dataset.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ProgressRecord {
    pub target_psms: usize,
    pub decoy_psms: usize,
    pub spectra: usize,
    pub skipped_lines: usize,
}

impl ProgressRecord {
    pub fn psms(&self) -> usize {
        self.target_psms + self.decoy_psms
    }
}
