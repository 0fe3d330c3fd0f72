//! Node service library crate.
//!
//! # Purpose
//! Exposes the node configuration and the in-process demo cluster for use by the node
//! binary and integration tests.
pub mod config;
pub mod demo;
