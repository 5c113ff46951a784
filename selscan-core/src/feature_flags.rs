//! Information about the available feature flags
//!
//! # "f16"
//!
//! *Enabled by default*
//!
//! Enables the compact storage dtypes [crate::dtypes::f16] and [crate::dtypes::bf16]
//! (re-exported from the `half` crate). Both accumulate in `f32`. Without this
//! feature the host layer reports these dtype tags as unsupported.
//!
//! Example:
//! ```toml
//! selscan-core = { version = "...", default-features = false, features = ["f16"] }
//! ```
//!
//! # "parallel"
//!
//! *Enabled by default*
//!
//! Runs the independent (batch, channel) units of a pass on the rayon thread pool.
//! Results are bit-identical with and without this feature: every unit is computed
//! sequentially and cross-unit reductions happen in unit order.
//!
//! # "test-f16", "test-bf16", "test-f64"
//!
//! Switches the `TestDtype` used by the unit tests away from `f32`. The test
//! tolerances follow the selected dtype.
//!
//! ```bash
//! cargo test -p selscan-core --features test-bf16
//! ```

#[cfg(feature = "parallel")]
/// Whether units are scheduled on a thread pool. Configure with crate features.
pub const PARALLEL: bool = true;

#[cfg(not(feature = "parallel"))]
/// Whether units are scheduled on a thread pool. Configure with crate features.
pub const PARALLEL: bool = false;
