//! Interprocedural context keys
//!
//! A [`CallPath`] is the ordered list of call sites between the analysis
//! entry point and the current block. It is the context-sensitivity key of
//! the exploration: two visits of the same block only count as the same
//! visit when their call paths match. Pushing a call site that is already
//! on the path is rejected, which is the recursion guard that keeps the
//! walker finite on (mutually) recursive programs.

use crate::cfg::{AbbId, FunctionId};
use std::fmt;

/// One entry of a call path: the call block and the callee it enters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallSite {
    /// The call block in the caller.
    pub block: AbbId,
    /// The function the call enters.
    pub callee: FunctionId,
}

/// An ordered sequence of call sites, copied by value on branch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallPath {
    sites: Vec<CallSite>,
}

impl CallPath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend the path by one call site.
    ///
    /// Returns `false` and leaves the path untouched when the site already
    /// occurs on the path (the call would be recursive).
    #[must_use]
    pub fn push(&mut self, site: CallSite) -> bool {
        if self.sites.contains(&site) {
            return false;
        }
        self.sites.push(site);
        true
    }

    /// Would pushing `site` make this path recursive?
    pub fn is_recursive_with(&self, site: CallSite) -> bool {
        self.sites.contains(&site)
    }

    /// Drop the innermost call site and return it, if any.
    pub fn pop(&mut self) -> Option<CallSite> {
        self.sites.pop()
    }

    /// The innermost call site, if any.
    pub fn last(&self) -> Option<&CallSite> {
        self.sites.last()
    }

    pub fn depth(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CallSite> {
        self.sites.iter()
    }
}

impl fmt::Display for CallPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sites.is_empty() {
            return write!(f, "<entry>");
        }
        let mut first = true;
        for site in &self.sites {
            if !first {
                write!(f, " -> ")?;
            }
            write!(f, "{}@{}", site.callee.0, site.block.index())?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::FunctionId;
    use petgraph::graph::NodeIndex;

    fn site(block: u32, callee: usize) -> CallSite {
        CallSite {
            block: NodeIndex::new(block as usize),
            callee: FunctionId(callee),
        }
    }

    #[test]
    fn test_push_and_pop() {
        let mut path = CallPath::new();
        assert!(path.push(site(1, 0)));
        assert!(path.push(site(2, 1)));
        assert_eq!(path.depth(), 2);
        assert_eq!(path.pop(), Some(site(2, 1)));
        assert_eq!(path.depth(), 1);
    }

    #[test]
    fn test_recursion_is_rejected() {
        let mut path = CallPath::new();
        assert!(path.push(site(1, 0)));
        assert!(path.push(site(2, 1)));
        // Same call site again: recursive, rejected, path unchanged.
        assert!(!path.push(site(1, 0)));
        assert_eq!(path.depth(), 2);
        assert!(path.is_recursive_with(site(2, 1)));
    }

    #[test]
    fn test_same_block_different_callee_is_not_recursive() {
        // An indirect call block with two targets produces two distinct
        // call sites; following the second target is not recursion.
        let mut path = CallPath::new();
        assert!(path.push(site(1, 0)));
        assert!(path.push(site(1, 1)));
        assert_eq!(path.depth(), 2);
    }

    #[test]
    fn test_paths_compare_by_value() {
        let mut a = CallPath::new();
        let mut b = CallPath::new();
        assert!(a.push(site(1, 0)));
        assert!(b.push(site(1, 0)));
        assert_eq!(a, b);
        assert!(b.push(site(2, 1)));
        assert_ne!(a, b);
    }
}
