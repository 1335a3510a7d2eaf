//! Shared engine integration tests.
//!
//! Tests channel and RPC behaviour through the public `Engine` API. Each
//! broker module runs these against its own endpoint.

pub mod engine_tests;
