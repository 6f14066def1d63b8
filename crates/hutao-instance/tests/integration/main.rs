//! Integration test entry point for hutao-instance.
//!
//! Run with: cargo test --test integration

mod listener;
mod negotiation;
