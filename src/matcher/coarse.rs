use std::collections::{BTreeMap, BTreeSet};

use crate::ir::{CanonicalName, ClassRecord};

/// Result of greedily pairing a library class' methods against one
/// candidate application class (§4.3.2).
#[derive(Debug)]
pub(crate) struct MethodBindings {
    pub(crate) bindings: BTreeMap<CanonicalName, CanonicalName>,
    pub(crate) matched_opcodes: usize,
}

/// Greedily pairs library methods to application methods (§4.3.2):
/// exact-digest binds immediately; otherwise opcode containment with
/// argmin opcode-count difference, smaller application count breaking ties.
pub(crate) fn match_methods(library_class: &ClassRecord, app_class: &ClassRecord) -> MethodBindings {
    let mut bindings = BTreeMap::new();
    let mut matched_opcodes = 0usize;
    let Some(lib_methods) = library_class.methods_by_name() else {
        return MethodBindings {
            bindings,
            matched_opcodes,
        };
    };
    let Some(app_methods) = app_class.methods_by_name() else {
        return MethodBindings {
            bindings,
            matched_opcodes,
        };
    };

    let mut claimed: BTreeSet<CanonicalName> = BTreeSet::new();
    for lib_method in lib_methods.values() {
        let lib_opcodes = lib_method.distinct_opcodes();
        let mut exact = None;
        let mut best: Option<(&crate::ir::MethodRecord, i64)> = None;
        for app_method in app_methods.values() {
            if claimed.contains(&app_method.name) {
                continue;
            }
            if app_method.descriptor != lib_method.descriptor {
                continue;
            }
            if app_method.digest.0 == lib_method.digest.0 {
                exact = Some(app_method);
                break;
            }
            if lib_opcodes.is_subset(&app_method.distinct_opcodes()) {
                let diff =
                    (lib_method.opcode_count as i64 - app_method.opcode_count as i64).abs();
                let is_better = match best {
                    None => true,
                    Some((current, current_diff)) => {
                        diff < current_diff
                            || (diff == current_diff
                                && app_method.opcode_count < current.opcode_count)
                    }
                };
                if is_better {
                    best = Some((app_method, diff));
                }
            }
        }
        let chosen = exact.or_else(|| best.map(|(method, _)| method));
        if let Some(chosen) = chosen {
            claimed.insert(chosen.name.clone());
            bindings.insert(lib_method.name.clone(), chosen.name.clone());
            matched_opcodes += chosen.opcode_count;
        }
    }

    MethodBindings {
        bindings,
        matched_opcodes,
    }
}

/// Class-level acceptance test (§4.3.2): matched opcode share of the
/// candidate application class must exceed `class_similar`.
pub(crate) fn class_accepts(matched_opcodes: usize, app_class: &ClassRecord, class_similar: f64) -> bool {
    let denom = app_class.opcode_count();
    if denom == 0 {
        return false;
    }
    (matched_opcodes as f64 / denom as f64) > class_similar
}
