pub mod batch;
pub mod cache;
pub mod compare;
pub mod diff;
pub mod document;
pub mod hash;
pub mod image;
pub mod metadata;
pub mod parser;
pub mod perceptual;
pub mod pool;
pub mod progress;
pub mod report;
pub mod text;
pub mod variants;
pub mod workers;
