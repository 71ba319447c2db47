mod driver;
mod progress;
mod reader;
mod write;

pub use driver::{PsmRescorer, PsmRescorerError};
pub use progress::ProgressRecord;
pub use reader::{InputError, InputRecord};
