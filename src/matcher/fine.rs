use std::collections::{BTreeMap, BTreeSet};

use crate::ir::{CanonicalName, Node};
use crate::opcodes::OpcodeCode;

const MAX_INLINE_DEPTH: u32 = 20;

/// Inter-procedural opcode-path reconstruction (§4.3.3, §9): a right-then-
/// left DFS over a method's nodes that inlines invoked callees once per call
/// chain, bounded by a depth cap and a call-stack membership check to cut
/// cycles. Results are memoized per top-level method key.
pub(crate) struct PathReconstructor<'a> {
    nodes_by_method_key: &'a BTreeMap<CanonicalName, Vec<Node>>,
    memo: BTreeMap<CanonicalName, BTreeSet<OpcodeCode>>,
}

impl<'a> PathReconstructor<'a> {
    pub(crate) fn new(nodes_by_method_key: &'a BTreeMap<CanonicalName, Vec<Node>>) -> Self {
        Self {
            nodes_by_method_key,
            memo: BTreeMap::new(),
        }
    }

    pub(crate) fn path(&mut self, method: &CanonicalName) -> BTreeSet<OpcodeCode> {
        if let Some(cached) = self.memo.get(method) {
            return cached.clone();
        }
        let mut stack = BTreeSet::new();
        let mut acc = BTreeSet::new();
        self.walk(method, &mut stack, &mut acc, 0);
        self.memo.insert(method.clone(), acc.clone());
        acc
    }

    fn walk(
        &self,
        method: &CanonicalName,
        stack: &mut BTreeSet<CanonicalName>,
        acc: &mut BTreeSet<OpcodeCode>,
        depth: u32,
    ) {
        let Some(nodes) = self.nodes_by_method_key.get(method) else {
            return;
        };
        stack.insert(method.clone());
        for node in nodes {
            acc.extend(node.opcodes.iter().copied());
            if let Some(callee) = &node.callee {
                let callee_exists = self.nodes_by_method_key.contains_key(callee);
                if callee_exists && !stack.contains(callee) && depth + 1 <= MAX_INLINE_DEPTH {
                    self.walk(callee, stack, acc, depth + 1);
                }
            }
        }
        stack.remove(method);
    }
}

/// Merges a library's own node graph with nodes contributed by
/// already-detected, non-cyclic dependency packages (§4.3.5). Library-owned
/// definitions take priority over augmentation.
pub(crate) fn merge_nodes(
    own: &BTreeMap<CanonicalName, Vec<Node>>,
    augmented: impl IntoIterator<Item = (CanonicalName, Vec<Node>)>,
) -> BTreeMap<CanonicalName, Vec<Node>> {
    let mut merged = own.clone();
    for (name, nodes) in augmented {
        merged.entry(name).or_insert(nodes);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> CanonicalName {
        CanonicalName(s.to_string())
    }

    #[test]
    fn inlines_callee_fragment() {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            name("A.foo()V"),
            vec![Node {
                opcodes: vec![1],
                callee: Some(name("B.bar()V")),
            }],
        );
        nodes.insert(
            name("B.bar()V"),
            vec![Node {
                opcodes: vec![2],
                callee: None,
            }],
        );
        let mut reconstructor = PathReconstructor::new(&nodes);
        let path = reconstructor.path(&name("A.foo()V"));
        assert_eq!(path, BTreeSet::from([1, 2]));
    }

    #[test]
    fn cuts_recursive_cycle() {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            name("A.foo()V"),
            vec![Node {
                opcodes: vec![1],
                callee: Some(name("A.foo()V")),
            }],
        );
        let mut reconstructor = PathReconstructor::new(&nodes);
        let path = reconstructor.path(&name("A.foo()V"));
        assert_eq!(path, BTreeSet::from([1]));
    }

    #[test]
    fn memoizes_top_level_result() {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            name("A.foo()V"),
            vec![Node {
                opcodes: vec![1],
                callee: None,
            }],
        );
        let mut reconstructor = PathReconstructor::new(&nodes);
        let first = reconstructor.path(&name("A.foo()V"));
        let second = reconstructor.path(&name("A.foo()V"));
        assert_eq!(first, second);
    }
}
