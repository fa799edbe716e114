use std::collections::BTreeSet;

use crate::ir::{AppFilter, Bloom};

/// Stage 1 (§4.3.1): candidate application classes for a library class'
/// bloom, via bloom containment with multiplicities.
///
/// An empty bloom is defined as "no candidates" (§9 open question (a))
/// rather than the set-theoretic universal intersection.
pub(crate) fn candidates(bloom: &Bloom, app_filter: &AppFilter) -> Option<BTreeSet<String>> {
    if bloom.is_empty() {
        return None;
    }
    let mut result: Option<BTreeSet<String>> = None;
    for (&index, &count) in bloom {
        let slots = app_filter.get(&index)?;
        let slot_idx = (count as usize).saturating_sub(1);
        let at_index = slots.get(slot_idx).cloned().unwrap_or_default();
        result = Some(match result {
            None => at_index,
            Some(prev) => prev.intersection(&at_index).cloned().collect(),
        });
        if result.as_ref().is_some_and(BTreeSet::is_empty) {
            return None;
        }
    }
    result.filter(|set| !set.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn filter_with(index: u32, slot_members: &[(usize, &[&str])]) -> AppFilter {
        let mut slots: [BTreeSet<String>; 10] = std::array::from_fn(|_| BTreeSet::new());
        for (slot, members) in slot_members {
            slots[*slot] = members.iter().map(|s| s.to_string()).collect();
        }
        let mut filter = AppFilter::new();
        filter.insert(index, slots);
        filter
    }

    #[test]
    fn empty_bloom_has_no_candidates() {
        let filter = filter_with(1, &[(0, &["A"])]);
        assert!(candidates(&Bloom::new(), &filter).is_none());
    }

    #[test]
    fn missing_feature_index_has_no_candidates() {
        let mut bloom = Bloom::new();
        bloom.insert(99, 1);
        let filter = filter_with(1, &[(0, &["A"])]);
        assert!(candidates(&bloom, &filter).is_none());
    }

    #[test]
    fn intersects_across_indices() {
        let mut bloom = Bloom::new();
        bloom.insert(1, 1);
        bloom.insert(2, 2);
        let mut filter = BTreeMap::new();
        filter.insert(1, {
            let mut s: [BTreeSet<String>; 10] = std::array::from_fn(|_| BTreeSet::new());
            s[0] = BTreeSet::from(["A".to_string(), "B".to_string()]);
            s
        });
        filter.insert(2, {
            let mut s: [BTreeSet<String>; 10] = std::array::from_fn(|_| BTreeSet::new());
            s[1] = BTreeSet::from(["A".to_string()]);
            s
        });
        let result = candidates(&bloom, &filter).unwrap();
        assert_eq!(result, BTreeSet::from(["A".to_string()]));
    }
}
