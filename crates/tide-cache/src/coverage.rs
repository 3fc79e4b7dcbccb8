//! Populated byte ranges of one block buffer.

use std::cmp::{max, min};

/// Sorted, disjoint, non-adjacent half-open ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Coverage(Vec<(u64, u64)>);

impl Coverage {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn full(len: u64) -> Self {
        if len == 0 {
            Self::new()
        } else {
            Self(vec![(0, len)])
        }
    }

    pub fn ranges(&self) -> &[(u64, u64)] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Mark `[l, r)` as populated, merging with touching ranges.
    pub fn insert(&mut self, l: u64, r: u64) {
        if l >= r {
            return;
        }
        let mut merged = Vec::with_capacity(self.0.len() + 1);
        let (mut nl, mut nr) = (l, r);
        let mut placed = false;
        for &(a, b) in &self.0 {
            if b < nl {
                merged.push((a, b));
            } else if a > nr {
                if !placed {
                    merged.push((nl, nr));
                    placed = true;
                }
                merged.push((a, b));
            } else {
                nl = min(nl, a);
                nr = max(nr, b);
            }
        }
        if !placed {
            merged.push((nl, nr));
        }
        self.0 = merged;
    }

    /// Uncovered sub-ranges of `[l, r)`.
    pub fn gaps(&self, l: u64, r: u64) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        let mut pos = l;
        for &(a, b) in &self.0 {
            if b <= pos {
                continue;
            }
            if a >= r {
                break;
            }
            if a > pos {
                out.push((pos, a));
            }
            pos = max(pos, b);
            if pos >= r {
                break;
            }
        }
        if pos < r {
            out.push((pos, r));
        }
        out
    }

    /// Populated sub-ranges of `[l, r)`.
    pub fn covered_within(&self, l: u64, r: u64) -> Vec<(u64, u64)> {
        self.0
            .iter()
            .filter(|&&(a, b)| b > l && a < r)
            .map(|&(a, b)| (max(a, l), min(b, r)))
            .collect()
    }

    pub fn is_covered(&self, l: u64, r: u64) -> bool {
        l >= r || self.0.iter().any(|&(a, b)| a <= l && b >= r)
    }

    pub fn covered_bytes(&self) -> u64 {
        self.0.iter().map(|(a, b)| b - a).sum()
    }

    /// Forget everything at or beyond `len`.
    pub fn truncate(&mut self, len: u64) {
        self.0.retain(|&(a, _)| a < len);
        if let Some(last) = self.0.last_mut() {
            last.1 = min(last.1, len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_merges_overlaps_and_neighbours() {
        let mut c = Coverage::new();
        c.insert(10, 20);
        c.insert(30, 40);
        c.insert(20, 25);
        assert_eq!(c.ranges(), &[(10, 25), (30, 40)]);
        c.insert(5, 35);
        assert_eq!(c.ranges(), &[(5, 40)]);
        c.insert(50, 50);
        assert_eq!(c.ranges(), &[(5, 40)]);
    }

    #[test]
    fn test_insert_before_existing() {
        let mut c = Coverage::new();
        c.insert(100, 200);
        c.insert(0, 10);
        assert_eq!(c.ranges(), &[(0, 10), (100, 200)]);
    }

    #[test]
    fn test_gaps() {
        let mut c = Coverage::new();
        c.insert(10, 20);
        c.insert(30, 40);
        assert_eq!(c.gaps(0, 50), vec![(0, 10), (20, 30), (40, 50)]);
        assert!(c.gaps(12, 18).is_empty());
        assert_eq!(c.gaps(15, 35), vec![(20, 30)]);
        assert_eq!(Coverage::new().gaps(3, 7), vec![(3, 7)]);
    }

    #[test]
    fn test_covered_within_and_is_covered() {
        let mut c = Coverage::new();
        c.insert(10, 20);
        c.insert(30, 40);
        assert_eq!(c.covered_within(15, 35), vec![(15, 20), (30, 35)]);
        assert!(c.is_covered(11, 19));
        assert!(!c.is_covered(15, 31));
        assert_eq!(c.covered_bytes(), 20);
    }

    #[test]
    fn test_truncate() {
        let mut c = Coverage::new();
        c.insert(0, 10);
        c.insert(20, 30);
        c.truncate(25);
        assert_eq!(c.ranges(), &[(0, 10), (20, 25)]);
        c.truncate(10);
        assert_eq!(c.ranges(), &[(0, 10)]);
        c.truncate(0);
        assert!(c.is_empty());
    }
}
