use std::fmt;

use crate::error::{BuildError, InvariantViolation};

/// A canonical, disjoint union of block-index ranges.
///
/// Internally stored as a sorted `Vec` of half-open ranges `[a, b)`, merged
/// so that no two ranges touch or overlap. Every public constructor and
/// mutator re-canonicalizes before returning, so any `BlockSet` a caller
/// can observe already satisfies the sorted/disjoint/non-adjacent invariant.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockSet {
    ranges: Vec<(u64, u64)>,
}

impl BlockSet {
    pub fn empty() -> Self {
        BlockSet { ranges: Vec::new() }
    }

    pub fn single_range(a: u64, b: u64) -> Self {
        BlockSet::from_ranges(vec![(a, b)])
    }

    /// Build from a list of ranges, dropping empty ones and canonicalizing
    /// (sort, merge adjacent/overlapping).
    pub fn from_ranges(mut ranges: Vec<(u64, u64)>) -> Self {
        ranges.retain(|&(a, b)| a < b);
        canonicalize(&mut ranges);
        BlockSet { ranges }
    }

    /// Build from a flat list of block indices (as the source map-file
    /// parser accumulates them): consecutive runs collapse into ranges.
    pub fn from_blocks(mut blocks: Vec<u64>) -> Self {
        blocks.sort_unstable();
        blocks.dedup();
        let mut ranges = Vec::new();
        let mut iter = blocks.into_iter();
        if let Some(first) = iter.next() {
            let mut start = first;
            let mut end = first + 1;
            for b in iter {
                if b == end {
                    end += 1;
                } else {
                    ranges.push((start, end));
                    start = b;
                    end = b + 1;
                }
            }
            ranges.push((start, end));
        }
        BlockSet { ranges }
    }

    /// Parse the compact string form: leading count of integers that follow
    /// (always `2 * ranges.len()`), then `a,b` pairs: `"4,0,2,10,12"`.
    pub fn parse_compact(s: &str) -> Result<Self, BuildError> {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.is_empty() {
            return Err(InvariantViolation::InvalidRange(s.to_string()).into());
        }
        let count: usize = parts[0]
            .trim()
            .parse()
            .map_err(|_| InvariantViolation::InvalidRange(s.to_string()))?;
        let rest = &parts[1..];
        if rest.len() != count || count % 2 != 0 {
            return Err(InvariantViolation::InvalidRange(s.to_string()).into());
        }
        let mut ranges = Vec::with_capacity(count / 2);
        for pair in rest.chunks(2) {
            let a: u64 = pair[0]
                .trim()
                .parse()
                .map_err(|_| InvariantViolation::InvalidRange(s.to_string()))?;
            let b: u64 = pair[1]
                .trim()
                .parse()
                .map_err(|_| InvariantViolation::InvalidRange(s.to_string()))?;
            if a >= b {
                return Err(InvariantViolation::InvalidRange(s.to_string()).into());
            }
            ranges.push((a, b));
        }
        Ok(BlockSet::from_ranges(ranges))
    }

    pub fn to_compact_string(&self) -> String {
        let mut out = String::new();
        out.push_str(&(self.ranges.len() * 2).to_string());
        for &(a, b) in &self.ranges {
            out.push(',');
            out.push_str(&a.to_string());
            out.push(',');
            out.push_str(&b.to_string());
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn size(&self) -> u64 {
        self.ranges.iter().map(|&(a, b)| b - a).sum()
    }

    pub fn iter_pairs(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().copied()
    }

    pub fn union(&self, other: &BlockSet) -> BlockSet {
        let mut ranges = self.ranges.clone();
        ranges.extend(other.ranges.iter().copied());
        canonicalize(&mut ranges);
        BlockSet { ranges }
    }

    pub fn intersect(&self, other: &BlockSet) -> BlockSet {
        let mut out = Vec::new();
        let (mut i, mut j) = (0usize, 0usize);
        while i < self.ranges.len() && j < other.ranges.len() {
            let (a1, b1) = self.ranges[i];
            let (a2, b2) = other.ranges[j];
            let lo = a1.max(a2);
            let hi = b1.min(b2);
            if lo < hi {
                out.push((lo, hi));
            }
            if b1 < b2 {
                i += 1;
            } else {
                j += 1;
            }
        }
        // Pairwise-intersected ranges are already disjoint and sorted; no merge needed.
        BlockSet { ranges: out }
    }

    pub fn subtract(&self, other: &BlockSet) -> BlockSet {
        if other.is_empty() {
            return self.clone();
        }
        let mut out = Vec::new();
        for &(a, b) in &self.ranges {
            let mut cur = a;
            for &(oa, ob) in &other.ranges {
                if ob <= cur || oa >= b {
                    continue;
                }
                if oa > cur {
                    out.push((cur, oa.min(b)));
                }
                cur = cur.max(ob);
                if cur >= b {
                    break;
                }
            }
            if cur < b {
                out.push((cur, b));
            }
        }
        BlockSet { ranges: out }
    }

    /// Grow each range by `k` on each side, clamped at 0. Callers that need
    /// an upper clamp intersect the result with the valid block range
    /// themselves (see `Image::extended`).
    pub fn extend(&self, k: u64) -> BlockSet {
        let ranges = self
            .ranges
            .iter()
            .map(|&(a, b)| (a.saturating_sub(k), b + k))
            .collect();
        BlockSet::from_ranges(ranges)
    }

    /// The first `n` blocks of this set, in ascending order.
    pub fn first(&self, n: u64) -> BlockSet {
        let mut out = Vec::new();
        let mut remaining = n;
        for &(a, b) in &self.ranges {
            if remaining == 0 {
                break;
            }
            let len = b - a;
            if len <= remaining {
                out.push((a, b));
                remaining -= len;
            } else {
                out.push((a, a + remaining));
                remaining = 0;
            }
        }
        BlockSet { ranges: out }
    }

    /// All but the first `n` blocks of this set.
    pub fn skip(&self, n: u64) -> BlockSet {
        self.subtract(&self.first(n))
    }
}

impl fmt::Display for BlockSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_compact_string())
    }
}

fn canonicalize(ranges: &mut Vec<(u64, u64)>) {
    ranges.retain(|&(a, b)| a < b);
    ranges.sort_unstable();
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
    for &(a, b) in ranges.iter() {
        if let Some(last) = merged.last_mut() {
            if a <= last.1 {
                last.1 = last.1.max(b);
                continue;
            }
        }
        merged.push((a, b));
    }
    *ranges = merged;
}
