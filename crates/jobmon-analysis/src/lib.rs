//! Statistical analysis of job metric series.

pub mod changepoint;
pub mod detect;

pub use changepoint::non_parametric;
pub use detect::{ChangePoints, detect_change_points};
