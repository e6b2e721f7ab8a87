// tests/integration/main.rs

//! End-to-end tests of the runtime, operators, sinks and config loading.

mod error_handling;
mod resume;
mod runtime_fake_executor;
mod runtime_operators;
