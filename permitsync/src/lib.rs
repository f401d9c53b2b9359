pub mod config;
pub mod matcher;
pub mod pdftext;
pub mod report;
pub mod status;
pub mod sync;
pub mod token_provider;

pub use config::{AppConfig, SetupFailure};
