use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dependency::{build_method_to_package_map, DependencyGraph, MethodIndexWriter};
use crate::extractor::FeatureExtractor;
use crate::ir::{ApplicationRecord, CanonicalName, LibraryRecord, Node};
use crate::matcher::{resolve_versions, MatchConfig, VersionResult};
use crate::output::write_application_output;
use crate::provider::{BytecodeProvider, TextBytecodeProvider};

/// Shared library cache (§5 shared state (1)): every library version keyed
/// by its resolved dotted package. Built once, in parallel, before any
/// application is detected; read-only afterward.
struct LibraryCache {
    by_package: Mutex<BTreeMap<String, Vec<LibraryRecord>>>,
}

impl LibraryCache {
    fn new() -> Self {
        Self {
            by_package: Mutex::new(BTreeMap::new()),
        }
    }

    fn insert(&self, library: LibraryRecord) {
        let mut guard = self
            .by_package
            .lock()
            .expect("library cache mutex poisoned");
        guard.entry(library.package.clone()).or_default().push(library);
    }

    fn into_inner(self) -> BTreeMap<String, Vec<LibraryRecord>> {
        self.by_package
            .into_inner()
            .expect("library cache mutex poisoned")
    }
}

/// Builds the library cache and dependency graph from a corpus directory (or
/// single artifact) (§4.4, §4.2). Library extraction is embarrassingly
/// parallel; `methodes_jar.txt` is rewritten from scratch and fed back to
/// build the global method→library map.
pub(crate) fn build_corpus(
    config: &Config,
    corpus_path: &Path,
    method_index_path: &Path,
) -> Result<(BTreeMap<String, Vec<LibraryRecord>>, DependencyGraph)> {
    let entries = corpus_entries(corpus_path)?;
    let extractor = FeatureExtractor {
        alphabet: &config.alphabet,
        min_method_opcode_num: config.min_method_opcode_num,
        max_opcode_len: config.max_opcode_len,
        filter_record_limit: config.filter_record_limit,
    };
    let method_index = MethodIndexWriter::create(method_index_path).with_context(|| {
        format!(
            "failed to initialize method index at {}",
            method_index_path.display()
        )
    })?;
    let cache = LibraryCache::new();
    let provider = TextBytecodeProvider;

    entries.par_iter().for_each(|path| {
        match load_one_library(&provider, &extractor, config, path) {
            Ok(library) => {
                for method in library.eligible_method_names() {
                    if let Err(err) = method_index.record(method, &library.filename) {
                        warn!(error = %err, "failed to append method index entry");
                    }
                }
                cache.insert(library);
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unreadable library artifact");
            }
        }
    });

    let by_package = cache.into_inner();
    let all_libraries: Vec<LibraryRecord> = by_package.values().flatten().cloned().collect();
    let method_to_package = build_method_to_package_map(&all_libraries);
    let dependency_graph = DependencyGraph::build(&all_libraries, &method_to_package);
    info!(
        packages = by_package.len(),
        versions = all_libraries.len(),
        cyclic = dependency_graph.cyclic_libs.len(),
        "corpus built"
    );
    Ok((by_package, dependency_graph))
}

fn corpus_entries(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_dir() {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(path)
            .with_context(|| format!("failed to read corpus directory {}", path.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .collect();
        entries.sort();
        Ok(entries)
    } else {
        Ok(vec![path.to_path_buf()])
    }
}

fn load_one_library(
    provider: &impl BytecodeProvider,
    extractor: &FeatureExtractor,
    config: &Config,
    path: &Path,
) -> Result<LibraryRecord, crate::errors::EngineError> {
    let display_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
        .to_string();
    let package = config.resolve_package(&display_name);
    let classes = provider.load_classes(path)?;
    extractor.extract_library(package, display_name, &classes)
}

/// The per-application package queue and running-set (§5 shared state (3)):
/// a single mutex guards both. `completed` records packages whose detection
/// has finished (matched or not), which is what dependency suspension (§4.3.5)
/// actually waits on.
struct PackageQueue {
    state: Mutex<QueueState>,
}

struct QueueState {
    pending: VecDeque<String>,
    in_flight: BTreeSet<String>,
    completed: BTreeSet<String>,
}

impl PackageQueue {
    fn new(packages: impl IntoIterator<Item = String>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: packages.into_iter().collect(),
                in_flight: BTreeSet::new(),
                completed: BTreeSet::new(),
            }),
        }
    }

    fn pop(&self) -> Option<String> {
        let mut state = self.state.lock().expect("package queue mutex poisoned");
        let package = state.pending.pop_front()?;
        state.in_flight.insert(package.clone());
        Some(package)
    }

    fn requeue(&self, package: String) {
        let mut state = self.state.lock().expect("package queue mutex poisoned");
        state.in_flight.remove(&package);
        state.pending.push_back(package);
    }

    fn finish(&self, package: &str) {
        let mut state = self.state.lock().expect("package queue mutex poisoned");
        state.in_flight.remove(package);
        state.completed.insert(package.to_string());
    }

    fn is_completed(&self, package: &str) -> bool {
        let state = self.state.lock().expect("package queue mutex poisoned");
        state.completed.contains(package)
    }

    fn is_drained(&self) -> bool {
        let state = self.state.lock().expect("package queue mutex poisoned");
        state.pending.is_empty() && state.in_flight.is_empty()
    }

    fn snapshot(&self) -> (usize, usize, usize) {
        let state = self.state.lock().expect("package queue mutex poisoned");
        (state.pending.len(), state.in_flight.len(), state.completed.len())
    }
}

/// Outcome of detecting every logical package against one application.
pub(crate) struct DetectionReport {
    pub(crate) results: BTreeMap<String, VersionResult>,
    pub(crate) duration: Duration,
}

/// Runs dependency-aware detection of every logical package against one
/// application (§4.3.5, §4.4): a bounded worker pool pops packages from a
/// shared queue, re-enqueueing ones whose non-cyclic dependencies have not
/// yet finished (§5 suspension — no condition-variable wait).
pub(crate) fn detect_application(
    config: &Config,
    by_package: &BTreeMap<String, Vec<LibraryRecord>>,
    dependency_graph: &DependencyGraph,
    app: &ApplicationRecord,
) -> Result<DetectionReport> {
    let started = Instant::now();
    let match_config = MatchConfig {
        class_similar: config.class_similar,
        lib_similar: config.lib_similar,
        abstract_method_weight: config.abstract_method_weight,
    };
    let queue = PackageQueue::new(by_package.keys().cloned());
    let result_map: Mutex<BTreeMap<String, VersionResult>> = Mutex::new(BTreeMap::new());
    let worker_count = config.max_thread_num.max(1);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(worker_count)
        .build()
        .context("failed to build detection thread pool")?;

    pool.scope(|scope| {
        scope.spawn(|_| progress_monitor(&queue, by_package.len()));
        for _ in 0..worker_count {
            scope.spawn(|_| {
                worker_loop(&queue, by_package, dependency_graph, &match_config, app, &result_map)
            });
        }
    });

    let results = result_map.into_inner().expect("result map mutex poisoned");
    Ok(DetectionReport {
        results,
        duration: started.elapsed(),
    })
}

fn progress_monitor(queue: &PackageQueue, total: usize) {
    loop {
        if queue.is_drained() {
            return;
        }
        let (pending, in_flight, completed) = queue.snapshot();
        debug!(pending, in_flight, completed, total, "detection progress");
        std::thread::sleep(Duration::from_millis(200));
    }
}

fn worker_loop(
    queue: &PackageQueue,
    by_package: &BTreeMap<String, Vec<LibraryRecord>>,
    dependency_graph: &DependencyGraph,
    match_config: &MatchConfig,
    app: &ApplicationRecord,
    result_map: &Mutex<BTreeMap<String, VersionResult>>,
) {
    loop {
        let Some(package) = queue.pop() else {
            if queue.is_drained() {
                return;
            }
            std::thread::yield_now();
            continue;
        };

        let pending_dependency = dependency_graph.callees_of(&package).any(|dep| {
            by_package.contains_key(dep)
                && !dependency_graph.cyclic_libs.contains(dep)
                && !queue.is_completed(dep)
        });
        if pending_dependency {
            debug!(package = %package, "dependency pending, re-enqueueing");
            queue.requeue(package);
            std::thread::yield_now();
            continue;
        }

        let augmented = build_augmented_nodes(&package, dependency_graph, result_map, by_package);
        let versions = &by_package[&package];
        if let Some(result) = resolve_versions(match_config, versions, app, |_| augmented.clone()) {
            debug!(package = %package, ratio = result.ratio, "package detected");
            result_map
                .lock()
                .expect("result map mutex poisoned")
                .insert(package.clone(), result);
        }
        queue.finish(&package);
    }
}

/// Merges in the node graphs of already-detected, non-cyclic dependency
/// packages (§4.3.5), restricted to whichever version(s) actually matched.
fn build_augmented_nodes(
    package: &str,
    dependency_graph: &DependencyGraph,
    result_map: &Mutex<BTreeMap<String, VersionResult>>,
    by_package: &BTreeMap<String, Vec<LibraryRecord>>,
) -> BTreeMap<CanonicalName, Vec<Node>> {
    let mut augmented = BTreeMap::new();
    let results = result_map.lock().expect("result map mutex poisoned");
    for dep in dependency_graph.callees_of(package) {
        if dependency_graph.cyclic_libs.contains(dep) {
            continue;
        }
        let Some(result) = results.get(dep) else {
            continue;
        };
        let Some(versions) = by_package.get(dep) else {
            continue;
        };
        for version in versions {
            if !result.filenames.contains(&version.filename) {
                continue;
            }
            for (name, nodes) in &version.nodes_by_method_key {
                augmented.entry(name.clone()).or_insert_with(|| nodes.clone());
            }
        }
    }
    augmented
}

/// Top-level orchestration (§4.4): extracts each application, detects every
/// logical package against it, and writes its output file. Idempotent: an
/// application whose output file already exists is skipped.
pub(crate) fn run(
    config: &Config,
    by_package: &BTreeMap<String, Vec<LibraryRecord>>,
    dependency_graph: &DependencyGraph,
    applications: &[PathBuf],
    output_dir: &Path,
) -> Result<()> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create output directory {}", output_dir.display()))?;
    let provider = TextBytecodeProvider;
    let extractor = FeatureExtractor {
        alphabet: &config.alphabet,
        min_method_opcode_num: config.min_method_opcode_num,
        max_opcode_len: config.max_opcode_len,
        filter_record_limit: config.filter_record_limit,
    };

    for app_path in applications {
        let app_name = app_path
            .file_stem()
            .and_then(|name| name.to_str())
            .unwrap_or("application")
            .to_string();
        let output_path = output_dir.join(format!("{app_name}.txt"));
        if output_path.exists() {
            info!(application = %app_name, "output already present, skipping");
            continue;
        }

        let classes = match provider.load_classes(app_path) {
            Ok(classes) => classes,
            Err(err) => {
                warn!(application = %app_name, error = %err, "skipping undecodable application");
                continue;
            }
        };
        let app_record = match extractor.extract_application(&classes) {
            Ok(record) => record,
            Err(err) => {
                warn!(application = %app_name, error = %err, "skipping application");
                continue;
            }
        };

        let report = detect_application(config, by_package, dependency_graph, &app_record)?;
        info!(
            application = %app_name,
            packages = report.results.len(),
            duration_ms = report.duration.as_millis(),
            "application detection complete"
        );
        write_application_output(&output_path, &report.results, report.duration)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AppFilter, Bloom, ClassRecord, Digest, MethodRecord};

    fn method(name: &str) -> MethodRecord {
        MethodRecord {
            name: CanonicalName(name.to_string()),
            is_static: false,
            descriptor: "()V".to_string(),
            return_family: 12,
            param_family: 1,
            opcode_count: 2,
            digest: Digest([5; 16]),
            opcodes: vec![1, 2],
            nodes: vec![Node {
                opcodes: vec![1, 2],
                callee: None,
            }],
        }
    }

    fn library(package: &str, filename: &str, method_name: &str) -> LibraryRecord {
        let method = method(method_name);
        let mut bloom = Bloom::new();
        bloom.insert(1, 1);
        let class = ClassRecord::Concrete {
            digest: Digest([9; 16]),
            method_count: 1,
            opcode_count: 2,
            bloom,
            methods_by_name: BTreeMap::from([(method.name.clone(), method.clone())]),
        };
        LibraryRecord {
            package: package.to_string(),
            filename: filename.to_string(),
            opcode_count: 2,
            classes_by_name: BTreeMap::from([("com.example.Foo".to_string(), class)]),
            nodes_by_method_key: BTreeMap::from([(
                method.name.clone(),
                vec![Node {
                    opcodes: vec![1, 2],
                    callee: None,
                }],
            )]),
            invoked_external_methods: BTreeSet::new(),
            is_interface_only: false,
        }
    }

    #[test]
    fn detects_single_package_against_matching_application() {
        let lib = library("pkg", "pkg_v1.txt", "com.example.Foo.bar()V");
        let mut by_package = BTreeMap::new();
        by_package.insert("pkg".to_string(), vec![lib.clone()]);
        let dependency_graph = DependencyGraph::default();

        let mut app_filter = AppFilter::new();
        crate::ir::insert_into_app_filter(
            &mut app_filter,
            "com.example.Foo",
            lib.classes_by_name["com.example.Foo"].bloom(),
        );
        let app = ApplicationRecord {
            classes_by_name: lib.classes_by_name.clone(),
            nodes_by_method_key: lib.nodes_by_method_key.clone(),
            app_filter,
        };

        let config = test_config();
        let report = detect_application(&config, &by_package, &dependency_graph, &app).unwrap();
        assert_eq!(report.results.len(), 1);
        let result = &report.results["pkg"];
        assert!(result.ratio >= 1.0 - f64::EPSILON);
        assert_eq!(result.filenames, vec!["pkg_v1.txt"]);
    }

    fn test_config() -> Config {
        Config {
            detect_type: crate::config::DetectType::Apk,
            class_similar: 0.85,
            lib_similar: 0.85,
            min_method_opcode_num: 1,
            max_opcode_len: 1000,
            abstract_method_weight: 3,
            filter_record_limit: 10,
            max_thread_num: 2,
            alphabet: crate::opcodes::OpcodeAlphabet::parse("const-string:1\nreturn-void:2\n")
                .unwrap(),
            lib_name_map: BTreeMap::new(),
        }
    }
}
