//! Pooled server-side rendering for pre-built JavaScript bundles.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
