//! Common test utilities for keyset-export integration tests

#[allow(dead_code)]
pub mod fixtures;
#[allow(dead_code)]
pub mod store;

#[allow(unused_imports)]
pub use fixtures::*;
#[allow(unused_imports)]
pub use store::*;
