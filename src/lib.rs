//! Vision Tagger
//!
//! This library provides the core of the vision-tagger tool, which scans
//! image folders, asks an OpenAI-compatible vision model for captions in
//! size-bounded batches, and keeps a CSV manifest of per-image review state
//! that survives across runs.

pub mod app_state;
pub mod config;
pub mod models;
pub mod services;
