//! Pairwise overlap detection for competing documents.
//!
//! Every pair of submitted documents is compared for shared sentences,
//! near-identical images and equal metadata. Parses and results live in a
//! content-addressed cache so repeated runs only pay for new content.

pub mod core;
pub mod settings;

pub use crate::core::cache::ContentCache;
pub use crate::core::compare::{ComparisonService, CompareError, RunOutcome, RunState};
pub use crate::core::parser::{DocumentParser, ParserRegistry};
pub use crate::core::workers::Workers;
pub use settings::Settings;
