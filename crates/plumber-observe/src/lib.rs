//! Observability setup for Plumber: structured logging and optional
//! OpenTelemetry span export.

pub mod tracing_setup;
