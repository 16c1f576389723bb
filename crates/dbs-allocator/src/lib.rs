// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Generic algorithms for guest memory resource management.
//!
//! [IntervalTree](struct.IntervalTree.html) is an ordered map over non-overlapping `u64`
//! ranges, used to track guest frame ranges and physical frame ranges. [Constraint] describes
//! where a new range may be placed when searching for free space in such a map.

#![deny(missing_docs)]

mod interval_tree;
pub use interval_tree::{IntervalTree, Range};

/// Errors associated with interval maps.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The inserting range overlaps with an existing range.
    #[error("range [0x{0:x}, 0x{1:x}] overlaps with an existing range")]
    Overlap(u64, u64),
}

/// Simplify the `Result` type.
pub type Result<T> = std::result::Result<T, Error>;

/// Policy for resource allocation.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum AllocPolicy {
    /// Default allocation policy, which is the lowest suitable address.
    Default,
    /// Allocate from the first matched entry.
    FirstMatch,
}

/// Struct to describe resource allocation constraints.
#[derive(Copy, Clone, Debug)]
pub struct Constraint {
    /// Size to allocate.
    pub size: u64,
    /// Lower boundary for the allocated resource.
    pub min: u64,
    /// Upper boundary for the allocated resource.
    pub max: u64,
    /// Alignment for the allocated resource.
    pub align: u64,
    /// Resource allocation policy.
    pub policy: AllocPolicy,
}

impl Constraint {
    /// Create a new constraint object with default settings.
    pub fn new<T>(size: T) -> Self
    where
        u64: From<T>,
    {
        Constraint {
            size: u64::from(size),
            min: 0,
            max: std::u64::MAX,
            align: 1,
            policy: AllocPolicy::Default,
        }
    }

    /// Set the min constraint.
    pub fn min<T>(mut self, min: T) -> Self
    where
        u64: From<T>,
    {
        let min = u64::from(min);
        if min > self.max {
            panic!("Constraint: Constraint min is invalid because it is larger than max");
        }
        self.min = min;
        self
    }

    /// Set the max constraint.
    pub fn max<T>(mut self, max: T) -> Self
    where
        u64: From<T>,
    {
        let max = u64::from(max);
        if max < self.size {
            panic!("Constraint: Constraint max is invalid because it is smaller than size");
        }
        self.max = max;
        self
    }

    /// Set the alignment constraint, which must be a power of 2.
    pub fn align<T>(mut self, align: T) -> Self
    where
        u64: From<T>,
    {
        let align = u64::from(align);
        if !align.is_power_of_two() {
            panic!("Constraint: Constraint align must be a power of 2");
        }
        self.align = align;
        self
    }

    /// Set the allocation policy.
    pub fn policy(mut self, policy: AllocPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Round `base` up to the constraint alignment, returning `None` on overflow.
    pub fn align_up(&self, base: u64) -> Option<u64> {
        let mask = self.align - 1;
        base.checked_add(mask).map(|v| v & !mask)
    }

    /// Check whether `range` satisfies this constraint.
    pub fn fits(&self, range: &Range) -> bool {
        range.min >= self.min
            && range.max <= self.max
            && range.len() == Some(self.size)
            && range.min & (self.align - 1) == 0
    }
}
