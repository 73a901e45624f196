// Domain layer - Pure data model and algorithms
pub mod coordinates;
pub mod error;
pub mod history;
pub mod resample;
pub mod telemetry;
pub mod template;
