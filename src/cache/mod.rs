//! Caching utilities.
//!
//! - **`single_object`**: one-slot memoization with shared, cancellable computations.

pub mod single_object;
