use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use strum::Display;

// ----------------------------------------------------------------------------
// Verbosity
// ----------------------------------------------------------------------------

/// The output verbosity level. Renders lowercase, as RUST_LOG expects.
#[derive(Clone, Debug, Default, Deserialize, Display, Serialize, ValueEnum)]
#[strum(serialize_all = "lowercase")]
pub enum Verbosity {
    #[default]
    Info,
    Warn,
    Debug,
    Error,
}
