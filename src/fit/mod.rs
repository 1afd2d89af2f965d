pub mod eft;
pub mod update;

pub use eft::{parse_eft, ParsedFit, ParsedFitItem};
pub use update::{create_fit_tables, preview_fit, update_fit, FitMetadata, FitPreview, FitUpdateOutcome, ResolvedItem};
