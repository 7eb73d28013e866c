//! Fractional sibling positions.
//!
//! Siblings are ordered by a real-number `position`. New nodes take the
//! midpoint of their neighbours, so inserts never touch other siblings. Each
//! midpoint halves the available gap; with the default gap of 1000 an `f64`
//! allows roughly fifty consecutive inserts into the same slot before the
//! midpoint collapses onto a bound, at which point the siblings need a
//! renumbering pass.

use crate::{Result, TreeError};

/// Spacing between positions handed out at the ends and by renumbering.
pub const DEFAULT_GAP: f64 = 1000.0;

/// Assigns positions between siblings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionAllocator {
    gap: f64,
}

impl Default for PositionAllocator {
    fn default() -> Self {
        Self { gap: DEFAULT_GAP }
    }
}

impl PositionAllocator {
    /// Create an allocator with a custom gap. Non-positive or non-finite gaps
    /// fall back to [`DEFAULT_GAP`].
    pub fn new(gap: f64) -> Self {
        if gap.is_finite() && gap > 0.0 {
            Self { gap }
        } else {
            tracing::warn!(gap, "invalid position gap, using default");
            Self::default()
        }
    }

    pub fn gap(&self) -> f64 {
        self.gap
    }

    /// Position strictly between `before` and `after`.
    ///
    /// - both absent: `gap`
    /// - only `after`: `after - gap`
    /// - only `before`: `before + gap`
    /// - both: the midpoint; `before >= after` (or a midpoint that collapses
    ///   onto a bound) is a [`TreeError::Consistency`].
    pub fn allocate_between(&self, before: Option<f64>, after: Option<f64>) -> Result<f64> {
        let position = match (before, after) {
            (None, None) => self.gap,
            (None, Some(a)) => a - self.gap,
            (Some(b), None) => b + self.gap,
            (Some(b), Some(a)) => {
                // NaN bounds compare as unordered and land here too.
                if b.partial_cmp(&a) != Some(std::cmp::Ordering::Less) {
                    return Err(TreeError::Consistency { before: b, after: a });
                }
                let mid = b + (a - b) / 2.0;
                if mid <= b || mid >= a {
                    return Err(TreeError::Consistency { before: b, after: a });
                }
                mid
            }
        };

        if !position.is_finite() {
            return Err(TreeError::Consistency {
                before: before.unwrap_or(f64::NAN),
                after: after.unwrap_or(f64::NAN),
            });
        }
        Ok(position)
    }

    /// Evenly spaced positions for `count` siblings: `gap, 2*gap, ...`.
    pub fn renumbered(&self, count: usize) -> impl Iterator<Item = f64> + '_ {
        (1..=count).map(move |i| i as f64 * self.gap)
    }
}
