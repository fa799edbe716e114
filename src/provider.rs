use std::fs;
use std::path::Path;

use walkdir::WalkDir;

use crate::errors::EngineError;
use crate::ir::{CanonicalName, ClassAccessShape};

/// One instruction as emitted by a provider, prior to opcode-alphabet
/// normalization (dropping `move*`/`nop`, stripping `/variant`, collapsing
/// `*-payload`) which the extractor applies uniformly across providers.
#[derive(Clone, Debug)]
pub(crate) struct RawInstruction {
    pub(crate) mnemonic: String,
    /// Present on `invoke*` instructions whose target is not `Ljava/…`
    /// (§4.1: such targets are excluded from node-graph edges).
    pub(crate) invoke_callee: Option<CanonicalName>,
}

#[derive(Clone, Debug)]
pub(crate) struct RawMethod {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) is_static: bool,
    pub(crate) instructions: Vec<RawInstruction>,
}

#[derive(Clone, Debug)]
pub(crate) struct RawField {
    pub(crate) is_static: bool,
    pub(crate) descriptor: String,
}

#[derive(Clone, Debug)]
pub(crate) struct RawClass {
    pub(crate) name: String,
    pub(crate) access: ClassAccessShape,
    pub(crate) super_name: Option<String>,
    pub(crate) fields: Vec<RawField>,
    pub(crate) methods: Vec<RawMethod>,
}

/// Abstracts the opaque bytecode source (§2 "Bytecode Provider"). The engine
/// never depends on a concrete DEX/APK decoder directly; it only asks a
/// provider for the classes contained in one artifact (a library version or
/// one application).
pub(crate) trait BytecodeProvider {
    fn load_classes(&self, path: &Path) -> Result<Vec<RawClass>, EngineError>;
}

/// Reference provider: a small line-oriented disassembly text format,
/// mirroring the opcode-alphabet text format of §6. Used both as a
/// deterministic test vehicle and as the default provider when no real DEX
/// decoder is wired in.
///
/// Grammar (one or more blocks per file):
/// ```text
/// class com.example.Foo access=public super=java.lang.Object
/// field static I count
/// method public foo()V
/// \t0000: (0002) const-string v0, "x"
/// \t0002: (0004) invoke-virtual {v0}, Lcom/example/Bar;->baz()V
/// \t0006: (0001) return-void
/// endmethod
/// endclass
/// ```
/// Instruction lines are recognized per §4.1: they begin with a tab, contain
/// a `)` byte-length terminator, are longer than 20 characters, and their
/// first token (after the tab) is not a branch label.
#[derive(Debug, Default)]
pub(crate) struct TextBytecodeProvider;

impl BytecodeProvider for TextBytecodeProvider {
    fn load_classes(&self, path: &Path) -> Result<Vec<RawClass>, EngineError> {
        let mut classes = Vec::new();
        if path.is_dir() {
            for entry in WalkDir::new(path).into_iter().filter_map(Result::ok) {
                if entry.file_type().is_file() {
                    classes.extend(self.load_file(entry.path())?);
                }
            }
        } else {
            classes.extend(self.load_file(path)?);
        }
        Ok(classes)
    }
}

impl TextBytecodeProvider {
    fn load_file(&self, path: &Path) -> Result<Vec<RawClass>, EngineError> {
        let content = fs::read_to_string(path).map_err(|err| EngineError::CorpusDecode {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        parse_text_classes(&content).map_err(|reason| EngineError::CorpusDecode {
            path: path.to_path_buf(),
            reason,
        })
    }
}

fn parse_text_classes(content: &str) -> Result<Vec<RawClass>, String> {
    let mut classes = Vec::new();
    let mut current: Option<RawClass> = None;
    let mut current_method: Option<RawMethod> = None;

    for raw_line in content.lines() {
        if is_instruction_line(raw_line) {
            let method = current_method
                .as_mut()
                .ok_or_else(|| format!("instruction line outside a method: {raw_line}"))?;
            method.instructions.push(parse_instruction_line(raw_line));
            continue;
        }
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("class") => {
                let name = tokens
                    .next()
                    .ok_or_else(|| "class line missing name".to_string())?
                    .to_string();
                let mut access = ClassAccessShape {
                    is_public_or_default: true,
                    is_interface: false,
                    is_abstract: false,
                    is_enum: false,
                    is_static: false,
                    has_non_object_super: false,
                };
                let mut super_name = None;
                for token in tokens {
                    if let Some(flags) = token.strip_prefix("access=") {
                        access.is_interface = flags.contains("interface");
                        access.is_abstract = flags.contains("abstract");
                        access.is_enum = flags.contains("enum");
                        access.is_static = flags.contains("static");
                        access.is_public_or_default = !(access.is_interface
                            || access.is_abstract
                            || access.is_enum
                            || access.is_static);
                    } else if let Some(sup) = token.strip_prefix("super=") {
                        super_name = Some(sup.to_string());
                        access.has_non_object_super = sup != "java.lang.Object";
                    }
                }
                current = Some(RawClass {
                    name,
                    access,
                    super_name,
                    fields: Vec::new(),
                    methods: Vec::new(),
                });
            }
            Some("field") => {
                let class = current
                    .as_mut()
                    .ok_or_else(|| "field line outside a class".to_string())?;
                let rest: Vec<&str> = tokens.collect();
                if rest.len() < 2 {
                    return Err(format!("malformed field line: {line}"));
                }
                let is_static = rest[0] == "static";
                let descriptor = if is_static { rest[1] } else { rest[0] };
                class.fields.push(RawField {
                    is_static,
                    descriptor: descriptor.to_string(),
                });
            }
            Some("method") => {
                let rest: Vec<&str> = tokens.collect();
                let is_static = rest.first() == Some(&"static");
                let signature = if is_static {
                    rest.get(1)
                } else {
                    rest.first()
                }
                .ok_or_else(|| format!("malformed method line: {line}"))?;
                let open = signature
                    .find('(')
                    .ok_or_else(|| format!("malformed method signature: {signature}"))?;
                current_method = Some(RawMethod {
                    name: signature[..open].to_string(),
                    descriptor: signature[open..].to_string(),
                    is_static,
                    instructions: Vec::new(),
                });
            }
            Some("endmethod") => {
                let class = current
                    .as_mut()
                    .ok_or_else(|| "endmethod outside a class".to_string())?;
                let method = current_method
                    .take()
                    .ok_or_else(|| "endmethod without matching method".to_string())?;
                class.methods.push(method);
            }
            Some("endclass") => {
                let class = current
                    .take()
                    .ok_or_else(|| "endclass without matching class".to_string())?;
                classes.push(class);
            }
            _ => return Err(format!("unrecognized line: {line}")),
        }
    }
    Ok(classes)
}

fn is_instruction_line(line: &str) -> bool {
    if !line.starts_with('\t') {
        return false;
    }
    if line.trim().len() <= 20 {
        return false;
    }
    if !line.contains(')') {
        return false;
    }
    let first_token = line.trim_start().split_whitespace().next().unwrap_or("");
    !first_token.starts_with(':')
}

fn parse_instruction_line(line: &str) -> RawInstruction {
    let after_paren = line.rsplit_once(')').map(|(_, rest)| rest).unwrap_or(line);
    let mnemonic = after_paren
        .trim()
        .split([' ', ','])
        .next()
        .unwrap_or("")
        .to_string();
    let invoke_callee = if mnemonic.starts_with("invoke") {
        parse_invoke_target(after_paren)
    } else {
        None
    };
    RawInstruction {
        mnemonic,
        invoke_callee,
    }
}

/// Parses an `Lowner;->name(params)return` target out of an invoke operand,
/// returning `None` for `Ljava/…` targets (§4.1: excluded from node-graph
/// edges) or malformed operands.
fn parse_invoke_target(operand: &str) -> Option<CanonicalName> {
    let (owner_raw, rest) = operand.split_once("->")?;
    let owner_start = owner_raw.find('L')?;
    let owner_slashed = owner_raw[owner_start + 1..].trim_end_matches(';').trim();
    if owner_slashed.starts_with("java/") {
        return None;
    }
    let owner_dotted = owner_slashed.replace('/', ".");
    let open = rest.find('(')?;
    let method_name = rest[..open].trim();
    let descriptor = rest[open..].trim();
    Some(CanonicalName::new(&owner_dotted, method_name, descriptor))
}
