#![allow(dead_code)]

pub mod mocks;
pub mod strategies;

pub use mocks::*;
pub use strategies::*;

use envflow::workflow::ExecutionContext;

/// Context rooted in a fresh temporary directory
pub fn temp_context() -> (tempfile::TempDir, ExecutionContext) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let ctx = ExecutionContext::new(dir.path());
    (dir, ctx)
}
