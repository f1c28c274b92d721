//! Deciding whether an item may start, given the phases of its dependencies.

use std::collections::BTreeSet;

use crate::state::Phase;

/// Admission verdict for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blocking {
    /// Every dependency is completed (or there are none).
    Ready,
    /// These dependencies are not completed yet.
    Blocked(BTreeSet<u64>),
    /// This dependency failed; the item can never become ready.
    DependencyFailed(u64),
}

impl Blocking {
    pub fn is_ready(&self) -> bool {
        matches!(self, Blocking::Ready)
    }

    /// Dependencies still outstanding; empty unless `Blocked`.
    pub fn blocked_by(&self) -> BTreeSet<u64> {
        match self {
            Blocking::Blocked(set) => set.clone(),
            _ => BTreeSet::new(),
        }
    }
}

/// Resolve `depends_on` against the current phase of each dependency.
///
/// `phase_of` returns `None` for dependencies whose phase is unknown, which
/// count as not completed. A failed dependency wins over any blocked ones.
pub fn resolve_blocking<F>(depends_on: &BTreeSet<u64>, phase_of: F) -> Blocking
where
    F: Fn(u64) -> Option<Phase>,
{
    let mut blocked = BTreeSet::new();
    for &dep in depends_on {
        match phase_of(dep) {
            Some(Phase::Completed) => {}
            Some(Phase::Failed) => return Blocking::DependencyFailed(dep),
            _ => {
                blocked.insert(dep);
            }
        }
    }
    if blocked.is_empty() {
        Blocking::Ready
    } else {
        Blocking::Blocked(blocked)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(phases: &[(u64, Phase)]) -> impl Fn(u64) -> Option<Phase> {
        let map: HashMap<u64, Phase> = phases.iter().copied().collect();
        move |n| map.get(&n).copied()
    }

    #[test]
    fn test_no_dependencies_is_ready() {
        assert!(resolve_blocking(&BTreeSet::new(), |_| None).is_ready());
    }

    #[test]
    fn test_completed_dependencies_are_ready() {
        let deps = BTreeSet::from([1, 2]);
        let phases = lookup(&[(1, Phase::Completed), (2, Phase::Completed)]);
        assert_eq!(resolve_blocking(&deps, phases), Blocking::Ready);
    }

    #[test]
    fn test_incomplete_and_unknown_block() {
        let deps = BTreeSet::from([1, 2, 3]);
        let phases = lookup(&[(1, Phase::Completed), (2, Phase::Review)]);
        let verdict = resolve_blocking(&deps, phases);
        assert_eq!(verdict, Blocking::Blocked(BTreeSet::from([2, 3])));
        assert_eq!(verdict.blocked_by(), BTreeSet::from([2, 3]));
    }

    #[test]
    fn test_failed_dependency_propagates() {
        let deps = BTreeSet::from([1, 2]);
        let phases = lookup(&[(1, Phase::Planning), (2, Phase::Failed)]);
        assert_eq!(resolve_blocking(&deps, phases), Blocking::DependencyFailed(2));
    }
}
