use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::opcodes::OpcodeAlphabet;

/// Whether the corpus/application path is a directory of per-library
/// artifacts (`apk` semantics, multiple applications) or a single artifact
/// (`lib` semantics) (§4.5).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum DetectType {
    Apk,
    Lib,
}

impl DetectType {
    pub(crate) fn from_path(path: &Path) -> DetectType {
        if path.is_dir() {
            DetectType::Apk
        } else {
            DetectType::Lib
        }
    }
}

/// Typed, validated union of CLI flags and the two corpus configuration
/// files (§4.6). Constructed once at process start; every downstream
/// component borrows from it rather than re-reading CLI flags.
#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub(crate) detect_type: DetectType,
    pub(crate) class_similar: f64,
    pub(crate) lib_similar: f64,
    pub(crate) min_method_opcode_num: usize,
    pub(crate) max_opcode_len: usize,
    pub(crate) abstract_method_weight: u32,
    pub(crate) filter_record_limit: u8,
    pub(crate) max_thread_num: usize,
    pub(crate) alphabet: OpcodeAlphabet,
    pub(crate) lib_name_map: BTreeMap<String, String>,
}

/// Raw CLI inputs needed to build a [`Config`]; kept separate from `clap`'s
/// `Cli` struct so config loading can be unit tested without parsing argv.
pub(crate) struct ConfigArgs {
    pub(crate) corpus_path: PathBuf,
    pub(crate) config_dir: PathBuf,
    pub(crate) class_similar: Option<f64>,
    pub(crate) lib_similar: Option<f64>,
    pub(crate) min_method_opcode_num: Option<usize>,
    pub(crate) max_opcode_len: Option<usize>,
    pub(crate) abstract_method_weight: Option<u32>,
    pub(crate) filter_record_limit: Option<u8>,
    pub(crate) max_threads: Option<usize>,
}

const DEFAULT_CLASS_SIMILAR: f64 = 0.85;
const DEFAULT_LIB_SIMILAR: f64 = 0.85;
const DEFAULT_MIN_METHOD_OPCODE_NUM: usize = 3;
const DEFAULT_MAX_OPCODE_LEN: usize = 1_000_000;
const DEFAULT_ABSTRACT_METHOD_WEIGHT: u32 = 3;
const DEFAULT_FILTER_RECORD_LIMIT: u8 = 10;

impl Config {
    pub(crate) fn load(args: &ConfigArgs) -> Result<Config> {
        let detect_type = DetectType::from_path(&args.corpus_path);

        let alphabet_path = args.config_dir.join("opcodes_encoding.txt");
        let alphabet = OpcodeAlphabet::load(&alphabet_path).with_context(|| {
            format!(
                "fatal: could not load opcode alphabet from {}",
                alphabet_path.display()
            )
        })?;

        let lib_name_map_path = args.config_dir.join("lib_name_map.csv");
        let lib_name_map = if lib_name_map_path.exists() {
            load_lib_name_map(&lib_name_map_path)?
        } else {
            debug!(
                path = %lib_name_map_path.display(),
                "lib_name_map.csv not found, deriving dotted package names from display names"
            );
            BTreeMap::new()
        };

        let max_thread_num = args
            .max_threads
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1));

        Ok(Config {
            detect_type,
            class_similar: args.class_similar.unwrap_or(DEFAULT_CLASS_SIMILAR),
            lib_similar: args.lib_similar.unwrap_or(DEFAULT_LIB_SIMILAR),
            min_method_opcode_num: args
                .min_method_opcode_num
                .unwrap_or(DEFAULT_MIN_METHOD_OPCODE_NUM),
            max_opcode_len: args.max_opcode_len.unwrap_or(DEFAULT_MAX_OPCODE_LEN),
            abstract_method_weight: args
                .abstract_method_weight
                .unwrap_or(DEFAULT_ABSTRACT_METHOD_WEIGHT),
            filter_record_limit: args
                .filter_record_limit
                .unwrap_or(DEFAULT_FILTER_RECORD_LIMIT),
            max_thread_num,
            alphabet,
            lib_name_map,
        })
    }

    /// Resolves a library's dotted package name from its on-disk display
    /// name, falling back to the display name itself when `lib_name_map.csv`
    /// has no entry (§4.6).
    pub(crate) fn resolve_package(&self, display_name: &str) -> String {
        self.lib_name_map
            .get(display_name)
            .cloned()
            .unwrap_or_else(|| display_name.to_string())
    }
}

fn load_lib_name_map(path: &Path) -> Result<BTreeMap<String, String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut map = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (display_name, dotted_package) = line
            .split_once(',')
            .with_context(|| format!("malformed lib_name_map.csv row: {line}"))?;
        map.insert(
            display_name.trim().to_string(),
            dotted_package.trim().to_string(),
        );
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_alphabet(dir: &Path) {
        fs::write(dir.join("opcodes_encoding.txt"), "const-string:1\nreturn-void:2\n").unwrap();
    }

    fn args(config_dir: PathBuf, corpus_path: PathBuf) -> ConfigArgs {
        ConfigArgs {
            corpus_path,
            config_dir,
            class_similar: None,
            lib_similar: None,
            min_method_opcode_num: None,
            max_opcode_len: None,
            abstract_method_weight: None,
            filter_record_limit: None,
            max_threads: Some(4),
        }
    }

    #[test]
    fn loads_defaults_when_lib_name_map_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        write_alphabet(dir.path());
        let config = Config::load(&args(dir.path().to_path_buf(), dir.path().to_path_buf())).unwrap();
        assert_eq!(config.class_similar, DEFAULT_CLASS_SIMILAR);
        assert_eq!(config.abstract_method_weight, DEFAULT_ABSTRACT_METHOD_WEIGHT);
        assert_eq!(config.resolve_package("com.example"), "com.example");
    }

    #[test]
    fn detect_type_follows_corpus_path_kind() {
        let dir = tempfile::tempdir().unwrap();
        write_alphabet(dir.path());
        let app_file = dir.path().join("app.txt");
        fs::write(&app_file, "").unwrap();
        let config = Config::load(&args(dir.path().to_path_buf(), app_file)).unwrap();
        assert_eq!(config.detect_type, DetectType::Lib);
    }

    #[test]
    fn lib_name_map_overrides_display_name() {
        let dir = tempfile::tempdir().unwrap();
        write_alphabet(dir.path());
        fs::write(dir.path().join("lib_name_map.csv"), "gson-2.8.jar,com.google.gson\n").unwrap();
        let config = Config::load(&args(dir.path().to_path_buf(), dir.path().to_path_buf())).unwrap();
        assert_eq!(config.resolve_package("gson-2.8.jar"), "com.google.gson");
    }

    #[test]
    fn missing_alphabet_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(&args(dir.path().to_path_buf(), dir.path().to_path_buf()));
        assert!(result.is_err());
    }
}
