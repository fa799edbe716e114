mod coarse;
mod fine;
mod prematch;

use std::collections::{BTreeMap, BTreeSet};

use crate::ir::{ApplicationRecord, CanonicalName, ClassRecord, LibraryRecord, Node};

/// Tunable thresholds shared by all three matching stages (§4.3).
#[derive(Clone, Copy, Debug)]
pub(crate) struct MatchConfig {
    pub(crate) class_similar: f64,
    pub(crate) lib_similar: f64,
    pub(crate) abstract_method_weight: u32,
}

fn class_weight(class: &ClassRecord, abstract_method_weight: u32) -> f64 {
    match class {
        ClassRecord::InterfaceOnly { method_count, .. } => {
            *method_count as f64 * abstract_method_weight as f64
        }
        ClassRecord::Concrete { opcode_count, .. } => *opcode_count as f64,
    }
}

fn library_weight(library: &LibraryRecord, abstract_method_weight: u32) -> f64 {
    library
        .classes_by_name
        .values()
        .map(|class| class_weight(class, abstract_method_weight))
        .sum()
}

/// Runs the three-stage pipeline against one library version (§4.3.1-3).
/// `augmented_nodes` carries the dependency-aware node graph of already
/// detected, non-cyclic callee packages (§4.3.5).
pub(crate) fn detect_version(
    config: &MatchConfig,
    library: &LibraryRecord,
    app: &ApplicationRecord,
    augmented_nodes: BTreeMap<CanonicalName, Vec<Node>>,
) -> Option<f64> {
    let denom = library_weight(library, config.abstract_method_weight);
    if denom <= 0.0 {
        return None;
    }

    // Stage 1: pre-match.
    let mut class_candidates: BTreeMap<&String, BTreeSet<String>> = BTreeMap::new();
    let mut pre_weight = 0.0;
    for (name, class) in &library.classes_by_name {
        if let Some(candidates) = prematch::candidates(class.bloom(), &app.app_filter) {
            pre_weight += class_weight(class, config.abstract_method_weight);
            class_candidates.insert(name, candidates);
        }
    }
    if pre_weight / denom < config.lib_similar {
        return None;
    }

    // Stage 2: coarse match.
    let mut interface_claimed: BTreeSet<String> = BTreeSet::new();
    let mut interface_matched: BTreeSet<&String> = BTreeSet::new();
    let mut concrete_pairs: BTreeMap<&String, Vec<(String, coarse::MethodBindings)>> =
        BTreeMap::new();

    for (lib_name, candidates) in &class_candidates {
        let lib_class = &library.classes_by_name[*lib_name];
        match lib_class {
            ClassRecord::InterfaceOnly { method_count, .. } => {
                for app_name in candidates {
                    if interface_claimed.contains(app_name) {
                        continue;
                    }
                    if let Some(ClassRecord::InterfaceOnly {
                        method_count: app_count,
                        ..
                    }) = app.classes_by_name.get(app_name)
                    {
                        if app_count == method_count {
                            interface_claimed.insert(app_name.clone());
                            interface_matched.insert(lib_name);
                            break;
                        }
                    }
                }
            }
            ClassRecord::Concrete { method_count, .. } => {
                for app_name in candidates {
                    let Some(app_class) = app.classes_by_name.get(app_name) else {
                        continue;
                    };
                    let ClassRecord::Concrete {
                        method_count: app_count,
                        ..
                    } = app_class
                    else {
                        continue;
                    };
                    if app_count > method_count {
                        continue;
                    }
                    let bindings = coarse::match_methods(lib_class, app_class);
                    if coarse::class_accepts(bindings.matched_opcodes, app_class, config.class_similar)
                    {
                        concrete_pairs
                            .entry(lib_name)
                            .or_default()
                            .push((app_name.clone(), bindings));
                    }
                }
            }
        }
    }

    let coarse_weight: f64 = interface_matched
        .iter()
        .map(|name| class_weight(&library.classes_by_name[*name], config.abstract_method_weight))
        .sum::<f64>()
        + concrete_pairs
            .keys()
            .map(|name| library.classes_by_name[*name].opcode_count() as f64)
            .sum::<f64>();
    if coarse_weight / denom < config.lib_similar {
        return None;
    }

    // Stage 3: fine match, strict one-to-one library↔application mapping.
    let lib_nodes = fine::merge_nodes(&library.nodes_by_method_key, augmented_nodes);
    let mut lib_paths = fine::PathReconstructor::new(&lib_nodes);
    let mut app_paths = fine::PathReconstructor::new(&app.nodes_by_method_key);

    let mut claimed_app_classes: BTreeSet<String> = BTreeSet::new();
    let mut final_weight = 0.0;

    for (lib_name, pairs) in &concrete_pairs {
        let mut best: Option<(String, usize, usize)> = None;
        for (app_name, bindings) in pairs {
            if claimed_app_classes.contains(app_name) {
                continue;
            }
            let mut match_opcodes = 0usize;
            let mut diff_sum = 0usize;
            for (lib_method, app_method) in &bindings.bindings {
                let lib_path = lib_paths.path(lib_method);
                let app_path = app_paths.path(app_method);
                if lib_path.is_subset(&app_path) {
                    let lib_opcode_count = library.classes_by_name[*lib_name]
                        .methods_by_name()
                        .and_then(|methods| methods.get(lib_method))
                        .map(|method| method.opcode_count)
                        .unwrap_or(0);
                    match_opcodes += lib_opcode_count;
                    diff_sum += app_path.len().abs_diff(lib_path.len());
                }
            }
            let is_better = match &best {
                None => true,
                Some((_, current_opcodes, current_diff)) => {
                    match_opcodes > *current_opcodes
                        || (match_opcodes == *current_opcodes && diff_sum < *current_diff)
                }
            };
            if is_better {
                best = Some((app_name.clone(), match_opcodes, diff_sum));
            }
        }
        if let Some((app_name, match_opcodes, _)) = best {
            claimed_app_classes.insert(app_name);
            final_weight += match_opcodes as f64;
        }
    }

    final_weight += interface_matched
        .iter()
        .map(|name| class_weight(&library.classes_by_name[*name], config.abstract_method_weight))
        .sum::<f64>();

    let ratio = final_weight / denom;
    let min_lib_match = if library.is_interface_only {
        1.0
    } else {
        config.lib_similar
    };
    if ratio >= min_lib_match {
        Some(ratio)
    } else {
        None
    }
}

/// Outcome of matching a logical package's versions against one application
/// (§4.3.4): the version(s) tied at the highest ratio.
#[derive(Debug)]
pub(crate) struct VersionResult {
    pub(crate) filenames: Vec<String>,
    pub(crate) ratio: f64,
}

/// Runs each version of a logical package independently and reports the
/// version(s) maximizing the ratio, concatenating ties (§4.3.4).
pub(crate) fn resolve_versions(
    config: &MatchConfig,
    versions: &[LibraryRecord],
    app: &ApplicationRecord,
    mut augmented_nodes_for: impl FnMut(&LibraryRecord) -> BTreeMap<CanonicalName, Vec<Node>>,
) -> Option<VersionResult> {
    let mut best_ratio = 0.0f64;
    let mut winners = Vec::new();
    for library in versions {
        let augmented = augmented_nodes_for(library);
        let Some(ratio) = detect_version(config, library, app, augmented) else {
            continue;
        };
        if winners.is_empty() || ratio > best_ratio {
            best_ratio = ratio;
            winners = vec![library.filename.clone()];
        } else if (ratio - best_ratio).abs() < f64::EPSILON {
            winners.push(library.filename.clone());
        }
    }
    if winners.is_empty() {
        None
    } else {
        Some(VersionResult {
            filenames: winners,
            ratio: best_ratio,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{AppFilter, Digest, MethodRecord};

    fn config() -> MatchConfig {
        MatchConfig {
            class_similar: 0.85,
            lib_similar: 0.85,
            abstract_method_weight: 3,
        }
    }

    fn method(name: &str) -> MethodRecord {
        MethodRecord {
            name: CanonicalName(name.to_string()),
            is_static: false,
            descriptor: "()V".to_string(),
            return_family: 12,
            param_family: 1,
            opcode_count: 2,
            digest: Digest([1; 16]),
            opcodes: vec![1, 2],
            nodes: vec![Node {
                opcodes: vec![1, 2],
                callee: None,
            }],
        }
    }

    fn simple_class(method_name: &str) -> ClassRecord {
        let method = method(method_name);
        let mut bloom = crate::ir::Bloom::new();
        bloom.insert(1, 1);
        ClassRecord::Concrete {
            digest: Digest([2; 16]),
            method_count: 1,
            opcode_count: 2,
            bloom,
            methods_by_name: BTreeMap::from([(method.name.clone(), method)]),
        }
    }

    #[test]
    fn identical_library_and_application_match_exactly() {
        let class = simple_class("com.example.Foo.bar()V");
        let mut classes_by_name = BTreeMap::new();
        classes_by_name.insert("com.example.Foo".to_string(), class.clone());
        let library = LibraryRecord {
            package: "pkg".to_string(),
            filename: "pkg_v1.txt".to_string(),
            opcode_count: 2,
            classes_by_name: classes_by_name.clone(),
            nodes_by_method_key: BTreeMap::from([(
                CanonicalName("com.example.Foo.bar()V".to_string()),
                vec![Node {
                    opcodes: vec![1, 2],
                    callee: None,
                }],
            )]),
            invoked_external_methods: BTreeSet::new(),
            is_interface_only: false,
        };

        let mut app_filter = AppFilter::new();
        crate::ir::insert_into_app_filter(&mut app_filter, "com.example.Foo", class.bloom());
        let app = ApplicationRecord {
            classes_by_name,
            nodes_by_method_key: library.nodes_by_method_key.clone(),
            app_filter,
        };

        let ratio = detect_version(&config(), &library, &app, BTreeMap::new()).unwrap();
        assert!(ratio >= 1.0 - f64::EPSILON);
    }

    #[test]
    fn version_resolution_reports_ties() {
        let class = simple_class("com.example.Foo.bar()V");
        let mut classes_by_name = BTreeMap::new();
        classes_by_name.insert("com.example.Foo".to_string(), class.clone());
        let make_library = |filename: &str| LibraryRecord {
            package: "pkg".to_string(),
            filename: filename.to_string(),
            opcode_count: 2,
            classes_by_name: classes_by_name.clone(),
            nodes_by_method_key: BTreeMap::from([(
                CanonicalName("com.example.Foo.bar()V".to_string()),
                vec![Node {
                    opcodes: vec![1, 2],
                    callee: None,
                }],
            )]),
            invoked_external_methods: BTreeSet::new(),
            is_interface_only: false,
        };
        let versions = vec![make_library("pkg_v1.txt"), make_library("pkg_v2.txt")];

        let mut app_filter = AppFilter::new();
        crate::ir::insert_into_app_filter(&mut app_filter, "com.example.Foo", class.bloom());
        let app = ApplicationRecord {
            classes_by_name,
            nodes_by_method_key: versions[0].nodes_by_method_key.clone(),
            app_filter,
        };

        let result = resolve_versions(&config(), &versions, &app, |_| BTreeMap::new()).unwrap();
        assert_eq!(result.filenames, vec!["pkg_v1.txt", "pkg_v2.txt"]);
    }
}
