//! Deduplication of literal constants across a whole compilation.

use alloc::vec::Vec;

use crate::IndexSet;
use pylower_compiler_core::bytecode::ConstantData;

/// Maps structurally equal constants to one canonical value.
///
/// Tuples and frozensets are merged element-wise, so a nested literal that
/// appears in several places is stored once. `None`, `...` and code objects
/// are passed through untouched.
#[derive(Debug, Default)]
pub struct ConstantCache {
    entries: IndexSet<ConstantData>,
}

impl ConstantCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the canonical representative of `value`, inserting it if new.
    pub fn merge(&mut self, value: ConstantData) -> ConstantData {
        let value = match value {
            ConstantData::None | ConstantData::Ellipsis | ConstantData::Code { .. } => {
                return value;
            }
            ConstantData::Tuple { elements } => ConstantData::Tuple {
                elements: self.merge_all(elements),
            },
            ConstantData::FrozenSet { elements } => ConstantData::FrozenSet {
                elements: self.merge_all(elements),
            },
            other => other,
        };
        let (idx, _) = self.entries.insert_full(value);
        self.entries[idx].clone()
    }

    fn merge_all(&mut self, elements: Vec<ConstantData>) -> Vec<ConstantData> {
        elements.into_iter().map(|e| self.merge(e)).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, value: &ConstantData) -> bool {
        self.entries.contains(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use malachite_bigint::BigInt;

    fn int(v: i32) -> ConstantData {
        ConstantData::Integer {
            value: BigInt::from(v),
        }
    }

    #[test]
    fn equal_tuples_share_an_entry() {
        let mut cache = ConstantCache::new();
        let a = cache.merge(ConstantData::Tuple {
            elements: vec![int(1), int(2)],
        });
        let before = cache.len();
        let b = cache.merge(ConstantData::Tuple {
            elements: vec![int(1), int(2)],
        });
        assert_eq!(a, b);
        assert_eq!(cache.len(), before);
        // the tuple plus both of its elements
        assert_eq!(before, 3);
    }

    #[test]
    fn nested_elements_are_merged() {
        let mut cache = ConstantCache::new();
        cache.merge(ConstantData::Tuple {
            elements: vec![
                ConstantData::Tuple {
                    elements: vec![int(1)],
                },
                ConstantData::str("x"),
            ],
        });
        assert!(cache.contains(&ConstantData::Tuple {
            elements: vec![int(1)]
        }));
        assert!(cache.contains(&ConstantData::str("x")));
    }

    #[test]
    fn singletons_are_not_cached() {
        let mut cache = ConstantCache::new();
        cache.merge(ConstantData::None);
        cache.merge(ConstantData::Ellipsis);
        assert!(cache.is_empty());
    }

    #[test]
    fn int_and_bool_stay_distinct() {
        let mut cache = ConstantCache::new();
        cache.merge(int(1));
        cache.merge(ConstantData::Boolean { value: true });
        assert_eq!(cache.len(), 2);
    }
}
