pub mod crd;
pub mod error;

pub use error::AppError;

/// Comma-separated list of canonical label selectors which match the
/// Pulsar Operator's labelling scheme.
pub const PULSAR_OPERATOR_LABEL_SELECTORS: &str = "app=pulsar,pulsar.rs/controlled-by=pulsar-operator";
