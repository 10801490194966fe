//! Property tests for the deduplication engine.
//!
//! Run with: `cargo test --test property`

mod engine_invariants;

/// Proptest case count, overridable via `PROPTEST_CASES`.
pub fn proptest_cases(default: u32) -> u32 {
    std::env::var("PROPTEST_CASES")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
        .max(1)
}
