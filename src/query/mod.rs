//! Read planning
//!
//! Reads over an arbitrary date range are planned by [`QueryOptimizer`],
//! which maps the range onto the fewest stored buckets across the supported
//! summary tiers. Execution of the plan lives in the tiered store.
//!
//! ```text
//! [start, end]
//!      │
//!      ▼
//! ┌─────────────────┐
//! │ QueryOptimizer  │  per-tier aligned ranges
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  TieredStore    │  one backend read per range, merged
//! └─────────────────┘
//! ```

pub mod optimizer;

pub use optimizer::{query_count, QueryOptimizer, SlicePlan};
