//! Timing runs for the allocation paths
//!
//! Rough wall-clock measurements, not rigorous benchmarks: they print their
//! numbers and only assert that the cache drains cleanly afterwards.
