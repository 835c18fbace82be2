//! Decoding pipeline for mobile game crash reports.
//!
//! A report comes in as a JSON payload wrapping the raw crash document of the
//! client's crash reporter. Native (ARM machine-code) crashes are resolved
//! into readable stack frames by fetching the matching debug symbols and
//! running them through an external symbolication tool; managed (JVM) crashes
//! are rendered directly. Either way, the result is a normalized document
//! ready for the analytics index.

pub mod caching;
pub mod config;
pub mod decoder;
pub mod download;
pub mod payload;
pub mod processing;
pub mod report;
pub mod symbols;
