//! Shared test utilities for mailarchive integration tests.
//!
//! This module provides:
//! - `TestHarness` wiring a real `IngestionService` over temp storage
//! - `FakeProvider`, a scripted mailbox provider behind the connector factory
//! - Builders for raw messages and credentials

pub mod builders;
pub mod fake;
pub mod harness;

pub use builders::*;
pub use fake::{FakeFactory, FakeProvider, UID_VALIDITY};
pub use harness::{RanJob, TestHarness};
