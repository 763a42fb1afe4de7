//! Internal tests module
//!
//! Multi-node scenarios and shared helpers with full access to crate
//! internals.

pub(crate) mod test_utils;
