//! Telegram user allow-list.

use std::collections::BTreeSet;

/// Set of permitted Telegram user ids. Empty means everyone is allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessPolicy {
    allowed: BTreeSet<i64>,
}

impl AccessPolicy {
    pub fn new(ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            allowed: ids.into_iter().collect(),
        }
    }

    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn is_unrestricted(&self) -> bool {
        self.allowed.is_empty()
    }

    pub fn is_allowed(&self, user_id: i64) -> bool {
        self.allowed.is_empty() || self.allowed.contains(&user_id)
    }

    /// Allowed ids in ascending order; empty for an unrestricted policy.
    pub fn allowed_ids(&self) -> Vec<i64> {
        self.allowed.iter().copied().collect()
    }

    /// Keep only `candidates` this policy permits, preserving their order.
    pub fn filter(&self, candidates: &[i64]) -> Vec<i64> {
        candidates
            .iter()
            .copied()
            .filter(|id| self.is_allowed(*id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_policy_allows_everyone() {
        let policy = AccessPolicy::unrestricted();
        assert!(policy.is_unrestricted());
        assert!(policy.is_allowed(42));
        assert_eq!(policy.filter(&[3, 1, 2]), vec![3, 1, 2]);
    }

    #[test]
    fn allow_list_filters() {
        let policy = AccessPolicy::new([111, 333]);
        assert!(policy.is_allowed(111));
        assert!(!policy.is_allowed(222));
        assert_eq!(policy.filter(&[222, 333, 111]), vec![333, 111]);
        assert_eq!(policy.allowed_ids(), vec![111, 333]);
    }
}
