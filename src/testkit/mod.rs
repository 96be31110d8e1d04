//! Test fixtures: scripted collectors and domain builders.
//!
//! Compiled into the crate so both unit tests and the integration suites
//! under `tests/` share the same mocks.

pub mod domain;
pub mod stream;
