use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::errors::EngineError;

/// A single opcode's position in the shared alphabet (1..=N).
pub(crate) type OpcodeCode = u16;

/// Fixed mapping from opcode mnemonic to a small integer code, shared between
/// the library corpus and every application scanned against it.
///
/// Loaded once from `opcodes_encoding.txt` (lines `mnemonic:code`) at process
/// start and treated as read-only configuration thereafter.
#[derive(Debug, Clone)]
pub(crate) struct OpcodeAlphabet {
    codes: BTreeMap<String, OpcodeCode>,
}

impl OpcodeAlphabet {
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read opcode alphabet {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("failed to parse opcode alphabet {}", path.display()))
    }

    pub(crate) fn parse(content: &str) -> Result<Self> {
        let mut codes = BTreeMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (mnemonic, code) = line
                .split_once(':')
                .with_context(|| format!("malformed opcode alphabet line: {line}"))?;
            let code: OpcodeCode = code
                .trim()
                .parse()
                .with_context(|| format!("non-numeric opcode code in line: {line}"))?;
            codes.insert(mnemonic.trim().to_string(), code);
        }
        if codes.is_empty() {
            anyhow::bail!("opcode alphabet is empty");
        }
        Ok(Self { codes })
    }

    /// Resolves a normalized mnemonic to its alphabet code.
    ///
    /// An unknown mnemonic is a configuration error (§7d): the alphabet must
    /// cover every opcode a conforming bytecode provider can emit.
    pub(crate) fn code_of(&self, mnemonic: &str) -> Result<OpcodeCode, EngineError> {
        self.codes
            .get(mnemonic)
            .copied()
            .ok_or_else(|| EngineError::UnknownOpcode(mnemonic.to_string()))
    }

    pub(crate) fn len(&self) -> usize {
        self.codes.len()
    }
}

/// Normalizes a raw opcode mnemonic per the filter rules in §4.1:
/// drop `move*`/`nop`, strip `/variant` suffixes, collapse `*-payload` to its
/// prefix. Returns `None` when the opcode is filtered out entirely.
pub(crate) fn normalize_mnemonic(raw: &str) -> Option<String> {
    let mut mnemonic = raw;
    if let Some(idx) = mnemonic.find('/') {
        mnemonic = &mnemonic[..idx];
    }
    let mnemonic = if let Some(prefix) = mnemonic.strip_suffix("-payload") {
        prefix
    } else {
        mnemonic
    };
    if mnemonic.is_empty() || mnemonic.starts_with("move") || mnemonic == "nop" {
        return None;
    }
    Some(mnemonic.to_string())
}
