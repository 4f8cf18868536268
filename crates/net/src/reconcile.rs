//! Full-set reconciliation for discrete replicated entities.

use std::collections::BTreeSet;

/// What a receiver must change so its local set matches the remote one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation<T> {
    /// Present locally but absent remotely: destroy.
    pub to_remove: Vec<T>,
    /// Present remotely but absent locally: instantiate.
    pub to_add: Vec<T>,
}

impl<T> Reconciliation<T> {
    /// True when the sets already match.
    pub fn is_empty(&self) -> bool {
        self.to_remove.is_empty() && self.to_add.is_empty()
    }
}

/// Diff `local` against the authoritative `remote` set.
///
/// Members present on both sides are left alone.
pub fn reconcile<T: Ord + Clone>(local: &BTreeSet<T>, remote: &BTreeSet<T>) -> Reconciliation<T> {
    Reconciliation {
        to_remove: local.difference(remote).cloned().collect(),
        to_add: remote.difference(local).cloned().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colonysync_core::MarkerKey;

    #[test]
    fn test_phantoms_removed_and_missing_added() {
        let a = MarkerKey::new(5, 1);
        let b = MarkerKey::new(7, 2);
        let c = MarkerKey::new(9, 3);
        let local = BTreeSet::from([a, b]);
        let remote = BTreeSet::from([b, c]);

        let diff = reconcile(&local, &remote);
        assert_eq!(diff.to_remove, vec![a]);
        assert_eq!(diff.to_add, vec![c]);
    }

    #[test]
    fn test_same_cell_different_kind_is_distinct() {
        let local = BTreeSet::from([MarkerKey::new(5, 0)]);
        let remote = BTreeSet::from([MarkerKey::new(5, 1)]);
        let diff = reconcile(&local, &remote);
        assert_eq!(diff.to_remove.len(), 1);
        assert_eq!(diff.to_add.len(), 1);
    }

    #[test]
    fn test_matching_sets_need_nothing() {
        let set = BTreeSet::from([1, 2, 3]);
        assert!(reconcile(&set, &set).is_empty());
        assert!(reconcile(&BTreeSet::<i32>::new(), &BTreeSet::new()).is_empty());
    }
}
