//! Flow-sensitive register types.
//!
//! The matrix keeps one view per op address: the type of every live
//! register on entry to that op. Views are shared between addresses until
//! one of them changes (copy-on-write), so straight-line code costs one
//! map per definition rather than one per op.
//!
//! At a join the view keeps only registers common to every incoming path
//! and records the union of their types.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use crate::ir::RegId;
use crate::types::Type;

type View = Rc<BTreeMap<RegId, Type>>;

#[derive(Debug, Clone)]
pub struct TypeMatrix {
    views: BTreeMap<i32, View>,
    /// (source, dest) edges that have flowed at least once
    edges: BTreeSet<(i32, i32)>,
    current: i32,
}

impl Default for TypeMatrix {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeMatrix {
    /// Address of the view before the first op.
    pub const ENTRY: i32 = -1;

    pub fn new() -> Self {
        let mut views = BTreeMap::new();
        views.insert(Self::ENTRY, View::default());
        Self {
            views,
            edges: BTreeSet::new(),
            current: Self::ENTRY,
        }
    }

    /// Make `addr` the source of subsequent flows.
    pub fn at(&mut self, addr: i32) {
        self.current = addr;
    }

    pub fn current(&self) -> i32 {
        self.current
    }

    pub fn is_reached(&self, addr: i32) -> bool {
        self.views.contains_key(&addr)
    }

    pub fn get(&self, reg: RegId, addr: i32) -> Option<&Type> {
        self.views.get(&addr).and_then(|v| v.get(&reg))
    }

    pub fn view(&self, addr: i32) -> Option<&BTreeMap<RegId, Type>> {
        self.views.get(&addr).map(|v| v.as_ref())
    }

    /// Propagate the current view to `dest`. Returns the registers whose
    /// recorded type at `dest` widened or that stopped being live there.
    ///
    /// A register missing from the source is dropped only when the edge is
    /// new; repeated flows along a known edge (several definitions by one
    /// op, or a later fixpoint pass) keep it.
    pub fn follow(&mut self, dest: i32) -> BTreeSet<RegId> {
        self.flow(dest, None)
    }

    fn flow(&mut self, dest: i32, exclude: Option<RegId>) -> BTreeSet<RegId> {
        let mut widened = BTreeSet::new();
        if dest == self.current {
            return widened;
        }
        let known_edge = !self.edges.insert((self.current, dest));
        let source = self.views.get(&self.current).cloned().unwrap_or_default();
        match self.views.get_mut(&dest) {
            None => {
                self.views.insert(dest, source);
            }
            Some(existing) => {
                let mut joined = BTreeMap::new();
                for (reg, ty) in existing.iter() {
                    if Some(*reg) == exclude {
                        joined.insert(*reg, ty.clone());
                        continue;
                    }
                    match source.get(reg) {
                        Some(incoming) => {
                            let union = ty.union(incoming);
                            if union != *ty {
                                widened.insert(*reg);
                            }
                            joined.insert(*reg, union);
                        }
                        None if known_edge => {
                            joined.insert(*reg, ty.clone());
                        }
                        None => {
                            widened.insert(*reg);
                        }
                    }
                }
                if joined != **existing {
                    *existing = Rc::new(joined);
                }
            }
        }
        widened
    }

    /// Flow to `dest` and define `reg` there with exactly `ty`. Returns the
    /// registers whose recorded type at `dest` changed.
    pub fn declare(&mut self, dest: i32, reg: RegId, ty: Type) -> BTreeSet<RegId> {
        let mut changed = self.flow(dest, Some(reg));
        if self.get(reg, dest) != Some(&ty) {
            let view = Rc::make_mut(self.views.entry(dest).or_default());
            view.insert(reg, ty);
            changed.insert(reg);
        }
        changed
    }

    /// Every reached address, in order.
    pub fn addresses(&self) -> impl Iterator<Item = i32> + '_ {
        self.views.keys().copied()
    }

    /// Flow to `dest` with `reg` known to be `ty` on this edge.
    ///
    /// On first arrival the type is recorded as is; at a join it is unioned
    /// with the type recorded from the other paths.
    pub fn merge(&mut self, dest: i32, reg: RegId, ty: Type) -> BTreeSet<RegId> {
        let fresh = !self.is_reached(dest);
        let mut widened = self.flow(dest, Some(reg));
        let view = Rc::make_mut(self.views.entry(dest).or_default());
        if fresh {
            view.insert(reg, ty);
        } else if let Some(prev) = view.get(&reg) {
            let union = prev.union(&ty);
            if union != *prev {
                widened.insert(reg);
                view.insert(reg, union);
            }
        }
        widened
    }

    /// Forget registers at or above `threshold` at `dest`.
    pub fn remove_registers(&mut self, dest: i32, threshold: RegId) {
        if !self.is_reached(dest) {
            self.flow(dest, None);
        }
        if let Some(view) = self.views.get_mut(&dest) {
            if view.keys().any(|reg| *reg >= threshold) {
                Rc::make_mut(view).retain(|reg, _| *reg < threshold);
            }
        }
    }

    /// Whether two addresses share one view.
    pub fn shares_view(&self, a: i32, b: i32) -> bool {
        match (self.views.get(&a), self.views.get(&b)) {
            (Some(x), Some(y)) => Rc::ptr_eq(x, y),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ty(s: &str) -> Type {
        s.parse().unwrap()
    }

    #[test]
    fn test_follow_shares_views() {
        let mut m = TypeMatrix::new();
        m.declare(TypeMatrix::ENTRY, 0, ty("Int64"));
        m.follow(0);
        m.at(0);
        m.follow(1);
        assert!(m.shares_view(0, 1));
        m.at(1);
        m.declare(2, 1, ty("String"));
        assert!(!m.shares_view(1, 2));
        assert_eq!(m.get(0, 2), Some(&ty("Int64")));
        assert_eq!(m.get(1, 1), None);
    }

    #[test]
    fn test_join_unions_common_registers() {
        let mut m = TypeMatrix::new();
        m.at(0);
        m.declare(1, 0, ty("Int64"));
        m.declare(1, 5, ty("Boolean"));
        assert_eq!(m.view(1).map(|v| v.len()), Some(2));
        m.at(2);
        m.declare(3, 0, ty("String"));
        m.at(3);
        let widened = m.follow(1);
        assert!(widened.contains(&0));
        assert!(widened.contains(&5));
        assert_eq!(m.get(0, 1), Some(&ty("Int64|String")));
        assert_eq!(m.get(5, 1), None);
    }

    #[test]
    fn test_merge_commutative_and_idempotent() {
        let join = |first: &str, second: &str| {
            let mut m = TypeMatrix::new();
            m.at(0);
            m.merge(9, 3, ty(first));
            m.at(1);
            m.merge(9, 3, ty(second));
            m.get(3, 9).cloned()
        };
        let pairs = [("Int64", "Null"), ("String", "Int8?"), ("Char", "Char"), ("Int32|String", "String")];
        for (a, b) in pairs {
            let ab = join(a, b);
            assert_eq!(ab, join(b, a));
            let union = ab.unwrap();
            assert!(ty(a).is_a(&union));
            assert!(ty(b).is_a(&union));
        }
        assert_eq!(join("Int64", "Int64"), Some(ty("Int64")));
    }

    #[test]
    fn test_merge_reports_widening_once() {
        let mut m = TypeMatrix::new();
        m.at(0);
        assert!(m.merge(5, 1, ty("Int64")).is_empty());
        m.at(1);
        assert_eq!(m.merge(5, 1, ty("Null")).into_iter().collect::<Vec<_>>(), vec![1]);
        assert!(m.merge(5, 1, ty("Null")).is_empty());
    }

    #[test]
    fn test_remove_registers() {
        let mut m = TypeMatrix::new();
        m.declare(TypeMatrix::ENTRY, 0, ty("Int64"));
        m.declare(TypeMatrix::ENTRY, 3, ty("Int64"));
        m.declare(TypeMatrix::ENTRY, -4, ty("Object"));
        m.follow(0);
        m.remove_registers(0, 2);
        assert!(m.get(0, 0).is_some());
        assert!(m.get(-4, 0).is_some());
        assert!(m.get(3, 0).is_none());
        assert!(m.get(3, TypeMatrix::ENTRY).is_some());
    }
}
