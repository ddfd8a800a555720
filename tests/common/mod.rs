//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - A scratch batch tree with a ready-to-use configuration
//! - Helpers to stage, inspect and age batch files
//! - Command templates that record what they were asked to transfer

pub mod sandbox;

pub use sandbox::*;
