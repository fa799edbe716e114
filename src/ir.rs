use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use sha2::{Digest as _, Sha256};

use crate::opcodes::OpcodeCode;

/// 128-bit digest of an opcode sequence or of a class' sorted method digests.
///
/// SHA-256 truncated to 16 bytes; the reference corpus uses a 128-bit MD5
/// digest for the same purpose (§3: "128 bits suffices"), and truncated
/// SHA-256 is the direct idiomatic substitute.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct Digest(pub [u8; 16]);

impl Digest {
    pub(crate) fn of_opcodes(opcodes: &[OpcodeCode]) -> Digest {
        let mut hasher = Sha256::new();
        for code in opcodes {
            hasher.update(code.to_le_bytes());
        }
        Digest::from_full(&hasher.finalize())
    }

    /// Digest of a class: the hash of its eligible methods' digests, sorted
    /// ascending so the result is invariant under method order (§3 invariant).
    pub(crate) fn of_class(method_digests: impl Iterator<Item = Digest>) -> Digest {
        let mut sorted: Vec<Digest> = method_digests.collect();
        sorted.sort();
        let mut hasher = Sha256::new();
        for digest in &sorted {
            hasher.update(digest.0);
        }
        Digest::from_full(&hasher.finalize())
    }

    fn from_full(full: &[u8]) -> Digest {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&full[..16]);
        Digest(bytes)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// A canonicalized method name: `owner.class.method(param types)return`,
/// whitespace stripped (§4.1). Stable across library and application views.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct CanonicalName(pub String);

impl fmt::Display for CanonicalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl CanonicalName {
    pub(crate) fn new(owner_dotted: &str, method_name: &str, descriptor: &str) -> CanonicalName {
        let joined = format!("{owner_dotted}.{method_name}{descriptor}");
        CanonicalName(joined.chars().filter(|c| !c.is_whitespace()).collect())
    }

    pub(crate) fn is_java_lang_owned(&self) -> bool {
        self.0.starts_with("java.")
    }
}

/// One basic-block-like fragment of a method's opcode sequence, split at
/// invoke boundaries (§3, §4.1). Nodes of a method are numbered `method_1`,
/// `method_2`, ... contiguously from 1.
#[derive(Clone, Debug, Default)]
pub(crate) struct Node {
    pub(crate) opcodes: Vec<OpcodeCode>,
    pub(crate) callee: Option<CanonicalName>,
}

/// A single method's extracted record (§3 "Method record").
#[derive(Clone, Debug)]
pub(crate) struct MethodRecord {
    pub(crate) name: CanonicalName,
    pub(crate) is_static: bool,
    pub(crate) descriptor: String,
    pub(crate) return_family: u32,
    pub(crate) param_family: u32,
    pub(crate) opcodes: Vec<OpcodeCode>,
    pub(crate) opcode_count: usize,
    pub(crate) digest: Digest,
    pub(crate) nodes: Vec<Node>,
}

impl MethodRecord {
    /// Distinct opcodes appearing in the method, used for opcode containment
    /// (§4.3.2): the library method's distinct opcodes must all occur in the
    /// candidate application method's sequence.
    pub(crate) fn distinct_opcodes(&self) -> BTreeSet<OpcodeCode> {
        self.opcodes.iter().copied().collect()
    }

    pub(crate) fn is_eligible(&self, min_method_opcode_num: usize, max_opcode_len: usize) -> bool {
        if self.name.is_java_lang_owned() {
            return false;
        }
        if self.name.0.contains(".<init>") || self.name.0.contains(".<clinit>") {
            return false;
        }
        self.opcode_count >= min_method_opcode_num && self.opcode_count <= max_opcode_len
    }
}

/// Feature index → saturating counter (§3 "bloom"). A dense map is used in
/// place of the reference corpus' per-slot arrays; `filter_record_limit`
/// bounds the counter value, not the map's size.
pub(crate) type Bloom = BTreeMap<u32, u8>;

pub(crate) fn bump_bloom(bloom: &mut Bloom, index: u32, limit: u8) {
    let counter = bloom.entry(index).or_insert(0);
    if *counter < limit {
        *counter += 1;
    }
}

/// Class-access bloom indices 1..6 (§4.1): exactly one of 1..5 plus,
/// independently, 6 when the superclass is not `java.lang.Object`.
pub(crate) struct ClassAccessShape {
    pub(crate) is_public_or_default: bool,
    pub(crate) is_interface: bool,
    pub(crate) is_abstract: bool,
    pub(crate) is_enum: bool,
    pub(crate) is_static: bool,
    pub(crate) has_non_object_super: bool,
}

pub(crate) fn class_access_indices(shape: &ClassAccessShape) -> Vec<u32> {
    let mut indices = Vec::with_capacity(2);
    if shape.is_interface {
        indices.push(2);
    } else if shape.is_abstract {
        indices.push(3);
    } else if shape.is_enum {
        indices.push(4);
    } else if shape.is_static {
        indices.push(5);
    } else {
        indices.push(1);
    }
    if shape.has_non_object_super {
        indices.push(6);
    }
    indices
}

/// Per-field bloom index (§4.1): `7 + (access_kind-1)*22 + type_family`.
pub(crate) fn field_index(is_static: bool, type_family: u32) -> u32 {
    let access_kind = if is_static { 1 } else { 2 };
    7 + (access_kind - 1) * 22 + type_family
}

/// Per-method bloom index (§4.1):
/// `51 + (static_kind-1)*368 + (return_family-1)*16 + param_family`.
pub(crate) fn method_index(is_static: bool, return_family: u32, param_family: u32) -> u32 {
    let static_kind = if is_static { 1 } else { 2 };
    51 + (static_kind - 1) * 368 + (return_family - 1) * 16 + param_family
}

/// No-fields marker (§4.1, index 7).
pub(crate) const NO_FIELDS_INDEX: u32 = 7;

/// A class' extracted record (§3 "Class record"). Interface/abstract classes
/// with no eligible method bodies keep only `(method_count, bloom)`.
#[derive(Clone, Debug)]
pub(crate) enum ClassRecord {
    InterfaceOnly {
        method_count: usize,
        bloom: Bloom,
    },
    Concrete {
        digest: Digest,
        method_count: usize,
        opcode_count: usize,
        bloom: Bloom,
        methods_by_name: BTreeMap<CanonicalName, MethodRecord>,
    },
}

impl ClassRecord {
    pub(crate) fn bloom(&self) -> &Bloom {
        match self {
            ClassRecord::InterfaceOnly { bloom, .. } => bloom,
            ClassRecord::Concrete { bloom, .. } => bloom,
        }
    }

    pub(crate) fn method_count(&self) -> usize {
        match self {
            ClassRecord::InterfaceOnly { method_count, .. } => *method_count,
            ClassRecord::Concrete { method_count, .. } => *method_count,
        }
    }

    pub(crate) fn opcode_count(&self) -> usize {
        match self {
            ClassRecord::InterfaceOnly { .. } => 0,
            ClassRecord::Concrete { opcode_count, .. } => *opcode_count,
        }
    }

    pub(crate) fn is_interface_only(&self) -> bool {
        matches!(self, ClassRecord::InterfaceOnly { .. })
    }

    pub(crate) fn methods_by_name(&self) -> Option<&BTreeMap<CanonicalName, MethodRecord>> {
        match self {
            ClassRecord::InterfaceOnly { .. } => None,
            ClassRecord::Concrete {
                methods_by_name, ..
            } => Some(methods_by_name),
        }
    }
}

/// A library package (one version) extracted from the corpus (§3 "Library
/// record").
#[derive(Clone, Debug)]
pub(crate) struct LibraryRecord {
    pub(crate) package: String,
    pub(crate) filename: String,
    pub(crate) opcode_count: usize,
    pub(crate) classes_by_name: BTreeMap<String, ClassRecord>,
    pub(crate) nodes_by_method_key: BTreeMap<CanonicalName, Vec<Node>>,
    pub(crate) invoked_external_methods: BTreeSet<CanonicalName>,
    pub(crate) is_interface_only: bool,
}

impl LibraryRecord {
    /// Every eligible method defined in this library (§4.2): drawn from each
    /// class' `methods_by_name`, which `FeatureExtractor` already restricts
    /// to methods passing `is_eligible`. `nodes_by_method_key` is not a
    /// substitute here since it also holds ineligible methods' call nodes.
    pub(crate) fn eligible_method_names(&self) -> impl Iterator<Item = &CanonicalName> {
        self.classes_by_name
            .values()
            .filter_map(ClassRecord::methods_by_name)
            .flat_map(|methods| methods.keys())
    }
}

/// The inverse bloom index used by application records (§3 "app_filter"):
/// `feature_index -> vector[10]`, slot `c` holding class names whose counter
/// at that index is at least `c+1`.
pub(crate) type AppFilter = BTreeMap<u32, [BTreeSet<String>; 10]>;

pub(crate) fn insert_into_app_filter(
    app_filter: &mut AppFilter,
    class_name: &str,
    bloom: &Bloom,
) {
    for (&index, &count) in bloom {
        let slots = app_filter
            .entry(index)
            .or_insert_with(|| std::array::from_fn(|_| BTreeSet::new()));
        for slot in slots.iter_mut().take(count as usize) {
            slot.insert(class_name.to_string());
        }
    }
}

/// An application's extracted record (§3 "Application record").
#[derive(Clone, Debug)]
pub(crate) struct ApplicationRecord {
    pub(crate) classes_by_name: BTreeMap<String, ClassRecord>,
    pub(crate) nodes_by_method_key: BTreeMap<CanonicalName, Vec<Node>>,
    pub(crate) app_filter: AppFilter,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_of_class_is_order_invariant() {
        let a = Digest::of_opcodes(&[1, 2, 3]);
        let b = Digest::of_opcodes(&[4, 5]);
        let forward = Digest::of_class(vec![a, b].into_iter());
        let backward = Digest::of_class(vec![b, a].into_iter());
        assert_eq!(forward.0, backward.0);
    }

    #[test]
    fn canonical_name_strips_whitespace() {
        let name = CanonicalName::new("com.example.Foo", "bar", "(I) V");
        assert_eq!(name.0, "com.example.Foo.bar(I)V");
    }

    #[test]
    fn java_owned_check_covers_the_whole_java_package_tree() {
        assert!(CanonicalName::new("java.lang.Object", "toString", "()Ljava/lang/String;")
            .is_java_lang_owned());
        assert!(CanonicalName::new("java.util.ArrayList", "add", "(Ljava/lang/Object;)Z")
            .is_java_lang_owned());
        assert!(!CanonicalName::new("javax.crypto.Cipher", "doFinal", "()[B")
            .is_java_lang_owned());
        assert!(!CanonicalName::new("com.example.Foo", "bar", "()V").is_java_lang_owned());
    }

    #[test]
    fn field_index_bounds() {
        assert_eq!(field_index(true, 1), 8);
        assert_eq!(field_index(false, 22), 51);
    }

    #[test]
    fn method_index_bounds() {
        assert_eq!(method_index(true, 1, 1), 52);
        assert_eq!(method_index(false, 23, 16), 787);
    }

    #[test]
    fn class_access_indices_exclusive_plus_super() {
        let shape = ClassAccessShape {
            is_public_or_default: false,
            is_interface: true,
            is_abstract: false,
            is_enum: false,
            is_static: false,
            has_non_object_super: true,
        };
        assert_eq!(class_access_indices(&shape), vec![2, 6]);
    }

    #[test]
    fn app_filter_is_cumulative() {
        let mut app_filter = AppFilter::new();
        let mut bloom = Bloom::new();
        bloom.insert(10, 3);
        insert_into_app_filter(&mut app_filter, "Foo", &bloom);
        let slots = &app_filter[&10];
        assert!(slots[0].contains("Foo"));
        assert!(slots[2].contains("Foo"));
        assert!(!slots[3].contains("Foo"));
    }
}
