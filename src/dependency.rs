use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};

use crate::ir::{CanonicalName, LibraryRecord};

/// Append-only sink for `methodes_jar.txt` (§6 persisted state): one
/// `canonical_method:library_filename` line per method observed during
/// library extraction. Guarded by a single mutex so concurrent extraction
/// workers can append without interleaving lines; rewritten from scratch
/// on every fresh run.
pub(crate) struct MethodIndexWriter {
    file: Mutex<File>,
}

impl MethodIndexWriter {
    pub(crate) fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("failed to create method index {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub(crate) fn record(&self, method: &CanonicalName, library_filename: &str) -> Result<()> {
        let mut file = self.file.lock().expect("method index mutex poisoned");
        writeln!(file, "{}:{}", method.0, library_filename).context("append to method index")
    }
}

/// Reads back `methodes_jar.txt`, applying last-write-wins per canonical
/// name (§4.2, §9 open question (b)): later lines overwrite earlier ones
/// for the same method.
pub(crate) fn load_method_library_file_map(path: &Path) -> Result<BTreeMap<CanonicalName, String>> {
    let file = File::open(path)
        .with_context(|| format!("failed to read method index {}", path.display()))?;
    let mut map = BTreeMap::new();
    for line in BufReader::new(file).lines() {
        let line = line.context("read method index line")?;
        let Some((method, filename)) = line.rsplit_once(':') else {
            continue;
        };
        map.insert(CanonicalName(method.to_string()), filename.to_string());
    }
    Ok(map)
}

/// Builds the global method→library package map directly from in-memory
/// library records (§4.2): scans every eligible method across the corpus,
/// last write wins across libraries in iteration order.
pub(crate) fn build_method_to_package_map(
    libraries: &[LibraryRecord],
) -> BTreeMap<CanonicalName, String> {
    let mut map = BTreeMap::new();
    for library in libraries {
        for method in library.eligible_method_names() {
            map.insert(method.clone(), library.package.clone());
        }
    }
    map
}

/// Caller→callee graph between library packages, plus the set of packages
/// participating in any directed cycle (§3 "Dependency graph", §4.2).
#[derive(Debug, Default)]
pub(crate) struct DependencyGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
    pub(crate) cyclic_libs: BTreeSet<String>,
}

impl DependencyGraph {
    pub(crate) fn build(
        libraries: &[LibraryRecord],
        method_to_package: &BTreeMap<CanonicalName, String>,
    ) -> DependencyGraph {
        let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for library in libraries {
            let entry = edges.entry(library.package.clone()).or_default();
            for callee in &library.invoked_external_methods {
                if let Some(callee_pkg) = method_to_package.get(callee) {
                    if callee_pkg != &library.package {
                        entry.insert(callee_pkg.clone());
                    }
                }
            }
        }
        let cyclic_libs = find_cyclic_nodes(&edges);
        DependencyGraph { edges, cyclic_libs }
    }

    pub(crate) fn callees_of(&self, package: &str) -> impl Iterator<Item = &String> {
        self.edges.get(package).into_iter().flatten()
    }
}

/// Tarjan's strongly-connected-components algorithm restricted to reporting
/// which nodes participate in a nontrivial cycle: any SCC of size > 1, or a
/// single node with a self-loop.
fn find_cyclic_nodes(edges: &BTreeMap<String, BTreeSet<String>>) -> BTreeSet<String> {
    struct Tarjan<'a> {
        edges: &'a BTreeMap<String, BTreeSet<String>>,
        index_of: BTreeMap<String, usize>,
        low_link: BTreeMap<String, usize>,
        on_stack: BTreeSet<String>,
        stack: Vec<String>,
        next_index: usize,
        cyclic: BTreeSet<String>,
    }

    impl<'a> Tarjan<'a> {
        fn visit(&mut self, node: &str) {
            self.index_of.insert(node.to_string(), self.next_index);
            self.low_link.insert(node.to_string(), self.next_index);
            self.next_index += 1;
            self.stack.push(node.to_string());
            self.on_stack.insert(node.to_string());

            if let Some(successors) = self.edges.get(node) {
                for successor in successors {
                    if !self.index_of.contains_key(successor) {
                        self.visit(successor);
                        let successor_low = self.low_link[successor];
                        let current_low = self.low_link[node];
                        self.low_link
                            .insert(node.to_string(), current_low.min(successor_low));
                    } else if self.on_stack.contains(successor) {
                        let successor_index = self.index_of[successor];
                        let current_low = self.low_link[node];
                        self.low_link
                            .insert(node.to_string(), current_low.min(successor_index));
                    }
                }
            }

            if self.low_link[node] == self.index_of[node] {
                let mut component = Vec::new();
                loop {
                    let member = self.stack.pop().expect("stack non-empty while unwinding");
                    self.on_stack.remove(&member);
                    let is_target = member == node;
                    component.push(member);
                    if is_target {
                        break;
                    }
                }
                let has_self_loop = component.len() == 1
                    && self
                        .edges
                        .get(&component[0])
                        .is_some_and(|successors| successors.contains(&component[0]));
                if component.len() > 1 || has_self_loop {
                    self.cyclic.extend(component);
                }
            }
        }
    }

    let mut tarjan = Tarjan {
        edges,
        index_of: BTreeMap::new(),
        low_link: BTreeMap::new(),
        on_stack: BTreeSet::new(),
        stack: Vec::new(),
        next_index: 0,
        cyclic: BTreeSet::new(),
    };
    for node in edges.keys() {
        if !tarjan.index_of.contains_key(node) {
            tarjan.visit(node);
        }
    }
    tarjan.cyclic
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edges_of(pairs: &[(&str, &str)]) -> BTreeMap<String, BTreeSet<String>> {
        let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (from, to) in pairs {
            edges
                .entry(from.to_string())
                .or_default()
                .insert(to.to_string());
            edges.entry(to.to_string()).or_default();
        }
        edges
    }

    #[test]
    fn acyclic_graph_has_no_cyclic_nodes() {
        let edges = edges_of(&[("P", "Q")]);
        assert!(find_cyclic_nodes(&edges).is_empty());
    }

    #[test]
    fn mutual_edges_form_a_cycle() {
        let edges = edges_of(&[("P", "Q"), ("Q", "P")]);
        let cyclic = find_cyclic_nodes(&edges);
        assert!(cyclic.contains("P"));
        assert!(cyclic.contains("Q"));
    }

    #[test]
    fn self_loop_is_cyclic() {
        let edges = edges_of(&[("P", "P")]);
        assert!(find_cyclic_nodes(&edges).contains("P"));
    }

    #[test]
    fn method_index_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("methodes_jar.txt");
        let writer = MethodIndexWriter::create(&path).unwrap();
        writer
            .record(&CanonicalName("com.example.Foo.bar()V".to_string()), "lib.txt")
            .unwrap();
        let map = load_method_library_file_map(&path).unwrap();
        assert_eq!(
            map.get(&CanonicalName("com.example.Foo.bar()V".to_string()))
                .unwrap(),
            "lib.txt"
        );
    }
}
