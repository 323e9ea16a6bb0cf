//! Reconciliation primitives.
//!
//! This library provides helpers for reconciliation passes that converge
//! current state to desired state. Key concepts:
//!
//! - **Desired state**: What the node should look like (manifest + directory).
//! - **Current state**: What the node actually looks like (runtime + registry).
//! - **Plan**: The name-keyed additions and removals that close the gap.
//!
//! # Invariants
//!
//! - Resources are compared by name only; field drift is not detected
//! - Diffs are deterministic and preserve the order of their left input
//! - The index cursor is monotonic

use std::collections::HashSet;
use std::fmt;

use thiserror::Error;

/// A resource identified by a unique name.
pub trait Named {
    fn name(&self) -> &str;
}

impl<T: Named + ?Sized> Named for &T {
    fn name(&self) -> &str {
        (**self).name()
    }
}

impl Named for String {
    fn name(&self) -> &str {
        self.as_str()
    }
}

/// Items of `left` whose name does not appear in `right`.
///
/// Output order follows `left`.
pub fn diff<L, R>(left: &[L], right: &[R]) -> Vec<L>
where
    L: Named + Clone,
    R: Named,
{
    let present: HashSet<&str> = right.iter().map(Named::name).collect();
    left.iter()
        .filter(|item| !present.contains(item.name()))
        .cloned()
        .collect()
}

/// Additions and removals needed to converge `current` onto `desired`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan<D, C> {
    /// Desired items missing from current.
    pub added: Vec<D>,

    /// Current items missing from desired.
    pub removed: Vec<C>,
}

impl<D: Named + Clone, C: Named + Clone> Plan<D, C> {
    pub fn compute(desired: &[D], current: &[C]) -> Self {
        Self {
            added: diff(desired, current),
            removed: diff(current, desired),
        }
    }

    /// Returns true if nothing needs to change.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// What was being attempted when an item failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Stop,
    Register,
    Deregister,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Start => write!(f, "start"),
            Action::Stop => write!(f, "stop"),
            Action::Register => write!(f, "register"),
            Action::Deregister => write!(f, "deregister"),
        }
    }
}

/// A single failed add/remove.
#[derive(Debug, Error)]
#[error("{action} {kind} '{name}': {source}")]
pub struct ItemFailure {
    pub kind: &'static str,
    pub name: String,
    pub action: Action,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

/// One or more items in a reconciliation batch failed.
///
/// Other items in the same batch were still attempted.
#[derive(Debug, Default)]
pub struct AggregateError {
    failures: Vec<ItemFailure>,
}

impl AggregateError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        kind: &'static str,
        name: impl Into<String>,
        action: Action,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) {
        self.failures.push(ItemFailure {
            kind,
            name: name.into(),
            action,
            source: source.into(),
        });
    }

    pub fn failures(&self) -> &[ItemFailure] {
        &self.failures
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// `Ok(())` when nothing failed, otherwise `Err(self)`.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} item(s) failed to reconcile", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

/// Watch cursor for the directory long-poll.
///
/// Tracks the last index that was fully applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexCursor {
    index: u64,
}

impl IndexCursor {
    pub fn new(index: u64) -> Self {
        Self { index }
    }

    pub fn get(&self) -> u64 {
        self.index
    }

    /// Advance to `index`; lower values are ignored.
    ///
    /// Returns true if the cursor moved.
    pub fn advance(&mut self, index: u64) -> bool {
        if index > self.index {
            self.index = index;
            true
        } else {
            false
        }
    }

    /// Start over from zero, e.g. after the store's index went backwards.
    pub fn reset(&mut self) {
        self.index = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Item {
        name: String,
        image: String,
    }

    impl Named for Item {
        fn name(&self) -> &str {
            &self.name
        }
    }

    fn item(name: &str, image: &str) -> Item {
        Item {
            name: name.to_string(),
            image: image.to_string(),
        }
    }

    #[test]
    fn test_diff_by_name_only() {
        let left = vec![item("consul", "a"), item("proxy", "b")];
        let right = vec![item("consul", "different-image")];

        let result = diff(&left, &right);
        assert_eq!(result, vec![item("proxy", "b")]);
    }

    #[test]
    fn test_diff_preserves_left_order() {
        let left = vec![item("c", ""), item("a", ""), item("b", "")];
        let right: Vec<Item> = vec![];

        let names: Vec<_> = diff(&left, &right).into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_diff_across_types() {
        let desired = vec![item("consul", "x"), item("proxy", "y")];
        let running = vec!["consul".to_string()];

        assert_eq!(diff(&desired, &running), vec![item("proxy", "y")]);
        assert!(diff(&running, &desired).is_empty());
    }

    #[test]
    fn test_plan() {
        let desired = vec![item("consul", ""), item("proxy", "")];
        let current = vec![item("consul", ""), item("stale", "")];

        let plan = Plan::compute(&desired, &current);
        assert_eq!(plan.added, vec![item("proxy", "")]);
        assert_eq!(plan.removed, vec![item("stale", "")]);
        assert!(!plan.is_empty());

        assert!(Plan::compute(&desired, &desired).is_empty());
    }

    #[test]
    fn test_aggregate_error() {
        let mut errors = AggregateError::new();
        assert!(errors.is_empty());

        errors.push("container", "proxy", Action::Start, "docker run failed");
        errors.push("registry entry", "proxy", Action::Register, "HTTP 500");
        assert_eq!(errors.len(), 2);

        let message = errors.to_string();
        assert!(message.starts_with("2 item(s) failed to reconcile"));
        assert!(message.contains("start container 'proxy': docker run failed"));
        assert!(message.contains("register registry entry 'proxy': HTTP 500"));

        assert!(errors.into_result().is_err());
        assert!(AggregateError::new().into_result().is_ok());
    }

    #[test]
    fn test_index_cursor() {
        let mut cursor = IndexCursor::default();
        assert_eq!(cursor.get(), 0);

        assert!(cursor.advance(42));
        assert_eq!(cursor.get(), 42);

        assert!(!cursor.advance(42));
        assert!(!cursor.advance(7));
        assert_eq!(cursor.get(), 42);

        cursor.reset();
        assert!(cursor.advance(7));
        assert_eq!(cursor.get(), 7);
    }

    fn names() -> impl Strategy<Value = Vec<String>> {
        proptest::collection::vec("[a-e]{1,2}", 0..12)
    }

    proptest! {
        #[test]
        fn property_self_diff_is_empty(a in names()) {
            prop_assert!(diff(&a, &a).is_empty());
        }

        #[test]
        fn property_diff_is_idempotent(a in names(), b in names()) {
            let once = diff(&a, &b);
            prop_assert_eq!(diff(&once, &b), once);
        }

        #[test]
        fn property_order_does_not_change_membership(a in names(), b in names()) {
            let mut reversed = b.clone();
            reversed.reverse();

            let mut forward = diff(&a, &b);
            let mut backward = diff(&a, &reversed);
            forward.sort();
            backward.sort();
            prop_assert_eq!(forward, backward);
        }
    }
}
