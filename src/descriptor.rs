use std::collections::BTreeSet;

/// A single JVM/Dalvik type descriptor, parsed from its textual form
/// (`Ljava/lang/String;`, `I`, `[[B`, `V`, ...).
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum TypeDescriptor {
    Void,
    Primitive(char),
    Object(String),
    Array(Box<TypeDescriptor>),
}

impl TypeDescriptor {
    /// Parses a single type descriptor, returning the remainder of the input.
    pub(crate) fn parse(input: &str) -> Option<(TypeDescriptor, &str)> {
        let mut chars = input.char_indices();
        let (_, first) = chars.next()?;
        match first {
            'V' => Some((TypeDescriptor::Void, &input[1..])),
            'B' | 'S' | 'I' | 'J' | 'F' | 'D' | 'Z' | 'C' => {
                Some((TypeDescriptor::Primitive(first), &input[1..]))
            }
            '[' => {
                let (inner, rest) = TypeDescriptor::parse(&input[1..])?;
                Some((TypeDescriptor::Array(Box::new(inner)), rest))
            }
            'L' => {
                let end = input.find(';')?;
                let name = &input[1..end];
                Some((TypeDescriptor::Object(name.to_string()), &input[end + 1..]))
            }
            _ => None,
        }
    }

    /// Renders the descriptor back to its textual form, e.g. `Ljava/lang/String;`.
    pub(crate) fn to_descriptor_string(&self) -> String {
        match self {
            TypeDescriptor::Void => "V".to_string(),
            TypeDescriptor::Primitive(c) => c.to_string(),
            TypeDescriptor::Object(name) => format!("L{name};"),
            TypeDescriptor::Array(inner) => format!("[{}", inner.to_descriptor_string()),
        }
    }
}

/// A parsed method descriptor: `(param types)return`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct MethodDescriptor {
    pub(crate) params: Vec<TypeDescriptor>,
    pub(crate) return_type: TypeDescriptor,
}

impl MethodDescriptor {
    pub(crate) fn parse(descriptor: &str) -> Option<MethodDescriptor> {
        let descriptor = descriptor.trim();
        let open = descriptor.find('(')?;
        let close = descriptor.find(')')?;
        if close < open {
            return None;
        }
        let mut rest = &descriptor[open + 1..close];
        let mut params = Vec::new();
        while !rest.is_empty() {
            let (descr, remainder) = TypeDescriptor::parse(rest)?;
            params.push(descr);
            rest = remainder;
        }
        let (return_type, _) = TypeDescriptor::parse(&descriptor[close + 1..])?;
        Some(MethodDescriptor {
            params,
            return_type,
        })
    }
}

/// Field descriptor type family (§4.1 field indices, `type_family ∈ 1..22`).
///
/// The `String` bucket intentionally matches any `Ljava/lang/String` prefix
/// (e.g. `StringBuilder`, `StringBuffer`), mirroring the reference corpus'
/// classification rather than an exact-name check.
pub(crate) fn field_type_family(descriptor: &TypeDescriptor) -> u32 {
    match descriptor {
        TypeDescriptor::Object(name) => {
            let raw = format!("L{name};");
            if raw == "Ljava/lang/Object;" {
                1
            } else if raw.starts_with("Ljava/lang/String") {
                2
            } else if raw.starts_with("Ljava/") {
                3
            } else {
                22
            }
        }
        TypeDescriptor::Primitive(c) => primitive_family(*c),
        TypeDescriptor::Array(inner) => array_family(inner),
        TypeDescriptor::Void => 22,
    }
}

/// Method return type family (§4.1, `return_family ∈ 1..23`).
///
/// Mirrors the reference corpus' asymmetry with [`field_type_family`]: the
/// "other java" bucket here matches the bare `Ljava` prefix (no trailing
/// slash), not `Ljava/`.
pub(crate) fn return_type_family(descriptor: &TypeDescriptor) -> u32 {
    match descriptor {
        TypeDescriptor::Object(name) => {
            let raw = format!("L{name};");
            if raw == "Ljava/lang/Object;" {
                1
            } else if raw.starts_with("Ljava/lang/String") {
                2
            } else if raw.starts_with("Ljava") {
                3
            } else {
                23
            }
        }
        TypeDescriptor::Primitive(c) => primitive_family(*c),
        TypeDescriptor::Void => 12,
        TypeDescriptor::Array(inner) => match inner.as_ref() {
            TypeDescriptor::Object(name) if format!("L{name};").starts_with("Ljava/") => 13,
            TypeDescriptor::Primitive(c) => primitive_array_family(*c) + 1,
            _ => 22,
        },
    }
}

fn primitive_family(c: char) -> u32 {
    match c {
        'B' => 4,
        'S' => 5,
        'I' => 6,
        'J' => 7,
        'F' => 8,
        'D' => 9,
        'Z' => 10,
        'C' => 11,
        _ => 22,
    }
}

fn primitive_array_family(c: char) -> u32 {
    match c {
        'B' => 13,
        'S' => 14,
        'I' => 15,
        'J' => 16,
        'F' => 17,
        'D' => 18,
        'Z' => 19,
        'C' => 20,
        _ => 21,
    }
}

fn array_family(inner: &TypeDescriptor) -> u32 {
    match inner {
        TypeDescriptor::Object(name) if format!("L{name};").starts_with("Ljava/") => 12,
        TypeDescriptor::Primitive(c) => primitive_array_family(*c),
        _ => 21,
    }
}

/// Broad parameter family used when classifying a parameter list (§4.1):
/// which of `{java/, primitive, array, other}` each parameter belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
enum BroadParamFamily {
    Java = 1,
    Primitive = 2,
    Array = 3,
    Other = 4,
}

fn broad_param_family(descriptor: &TypeDescriptor) -> BroadParamFamily {
    match descriptor {
        TypeDescriptor::Object(name) if format!("L{name};").starts_with("Ljava/") => {
            BroadParamFamily::Java
        }
        TypeDescriptor::Primitive(_) => BroadParamFamily::Primitive,
        TypeDescriptor::Array(_) => BroadParamFamily::Array,
        _ => BroadParamFamily::Other,
    }
}

/// The 16-way parameter-family index used in the per-method bloom slot
/// (§4.1: `param_family ∈ 1..16`), derived from which of the four broad
/// families occur among the method's parameters.
pub(crate) fn param_family(params: &[TypeDescriptor]) -> u32 {
    if params.is_empty() {
        return 1;
    }
    let present: BTreeSet<BroadParamFamily> = params.iter().map(broad_param_family).collect();
    use BroadParamFamily::{Array, Java, Other, Primitive};
    match present.len() {
        1 => match present.iter().next().unwrap() {
            Java => 2,
            Primitive => 3,
            Array => 4,
            Other => 5,
        },
        2 => {
            if present.contains(&Java) && present.contains(&Primitive) {
                6
            } else if present.contains(&Java) && present.contains(&Array) {
                7
            } else if present.contains(&Java) && present.contains(&Other) {
                8
            } else if present.contains(&Primitive) && present.contains(&Array) {
                9
            } else if present.contains(&Primitive) && present.contains(&Other) {
                10
            } else {
                11
            }
        }
        3 => {
            if !present.contains(&Other) {
                12
            } else if !present.contains(&Array) {
                13
            } else if !present.contains(&Primitive) {
                14
            } else {
                15
            }
        }
        _ => 16,
    }
}
