//! Host telemetry: periodic sensor sampling, bounded history, threshold alerts and
//! report projections, served over HTTP.

pub mod alerts;
pub mod config;
pub mod devices;
pub mod diagnostics;
pub mod error;
pub mod http;
pub mod metrics;
pub mod probes;
pub mod report;
pub mod sampler;
pub mod settings;
pub mod snapshot;
pub mod store;
