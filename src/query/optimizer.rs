//! Query Optimizer - Range decomposition across summary tiers
//!
//! Every write updates one bucket in each supported tier, so a read over an
//! arbitrary range can be answered by summing a handful of buckets instead of
//! every fine-grained one. The optimizer decides which buckets.
//!
//! # Decomposition
//!
//! Starting at the most granular tier, the leading and trailing fragments of
//! the range that do not line up with the next coarser tier are read at the
//! current tier. The aligned middle is handed to the coarser tier, which
//! repeats the process:
//!
//! ```text
//!  Jan 30 23:50                                             Jul 1 00:55
//!      │                                                         │
//!  ┌───┴──┐┌──────┐┌───────────────────────────────────┐┌────────┴─┐
//!  │hourly││daily ││          monthly (Feb..Jun)       ││  hourly  │
//!  └──────┘└──────┘└───────────────────────────────────┘└──────────┘
//! ```
//!
//! When the leading and trailing fragments touch, the range is too narrow
//! to have a coarser middle and the two fragments are emitted as one range.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::ValidationError;
use crate::types::{DateRange, Direction, Period, Timestamp};

/// Ranges to read per tier, coarsest tier first, each set chronological
pub type SlicePlan = BTreeMap<Period, BTreeSet<DateRange>>;

/// Plans the minimal set of per-tier bucket reads for a range
#[derive(Debug, Clone)]
pub struct QueryOptimizer {
    /// Supported tiers, sorted coarsest first, without `Realtime`
    supported: Vec<Period>,
}

impl QueryOptimizer {
    /// Create an optimizer over the given tiers
    ///
    /// `Realtime` is ignored since it is never summarized. Fails when no tier
    /// remains, or when `Forever` is the only one: a single all-time bucket
    /// cannot answer a bounded range.
    pub fn new(supported: &[Period]) -> Result<Self, ValidationError> {
        let mut tiers: Vec<Period> = supported
            .iter()
            .copied()
            .filter(|p| *p != Period::Realtime)
            .collect();
        tiers.sort();
        tiers.dedup();

        if tiers.iter().all(|p| *p == Period::Forever) {
            return Err(ValidationError::NoSupportedPeriods);
        }
        Ok(Self { supported: tiers })
    }

    /// Supported tiers, coarsest first
    pub fn supported(&self) -> &[Period] {
        &self.supported
    }

    /// Decompose `[start, end]` into per-tier bucket ranges
    ///
    /// The range is first widened to the most granular tier's boundaries.
    /// Within one tier the returned ranges never overlap, and together they
    /// cover the widened range exactly once.
    pub fn optimal_slices(
        &self,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<SlicePlan, ValidationError> {
        DateRange::new(start, end)?;

        let mut plan = SlicePlan::new();
        let finest = Period::most_granular(&self.supported);
        self.optimize(start, end, finest, &mut plan);
        Ok(plan)
    }

    fn optimize(&self, start: Timestamp, end: Timestamp, tier: Option<Period>, plan: &mut SlicePlan) {
        let tier = match tier {
            Some(tier) if tier != Period::Forever && start <= end => tier,
            _ => return,
        };

        let next = tier
            .less_granular()
            .and_then(|p| p.closest_supported(&self.supported, Direction::Coarser));

        let start = DateRange::align(tier, start).start;
        let end = DateRange::align(tier, end).end;

        let next = match next {
            Some(next) => next,
            None => {
                plan.entry(tier).or_default().insert(DateRange { start, end });
                return;
            },
        };

        let mut middle_start = start;
        let mut middle_end = end;

        let leading = if DateRange::lies_on_boundary(start, next) {
            None
        } else {
            let slice = DateRange {
                start,
                end: DateRange::align(next, start).end.min(end),
            };
            middle_start = slice.end + 1;
            Some(slice)
        };

        let trailing = if DateRange::lies_on_boundary(end, next) {
            None
        } else {
            let slice = DateRange {
                start: DateRange::align(next, end).start.max(start),
                end,
            };
            middle_end = slice.start - 1;
            Some(slice)
        };

        match (leading, trailing) {
            (Some(lead), Some(trail)) if lead.end + 1 == trail.start => {
                plan.entry(tier).or_default().insert(DateRange {
                    start: lead.start,
                    end: trail.end,
                });
                return;
            },
            _ => {
                for slice in [leading, trailing].into_iter().flatten() {
                    plan.entry(tier).or_default().insert(slice);
                }
            },
        }

        self.optimize(middle_start, middle_end, Some(next), plan);
    }
}

/// Total number of backend reads a plan needs
pub fn query_count(plan: &SlicePlan) -> usize {
    plan.values().map(BTreeSet::len).sum()
}
