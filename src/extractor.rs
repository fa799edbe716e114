use std::collections::{BTreeMap, BTreeSet};

use crate::descriptor::{field_type_family, param_family, return_type_family, MethodDescriptor};
use crate::errors::EngineError;
use crate::ir::{
    bump_bloom, class_access_indices, field_index, insert_into_app_filter, method_index,
    ApplicationRecord, Bloom, CanonicalName, ClassRecord, Digest, LibraryRecord, MethodRecord,
    Node, NO_FIELDS_INDEX,
};
use crate::opcodes::OpcodeAlphabet;
use crate::provider::RawClass;

/// Converts provider output into the internal data model (§4.1): class
/// bloom signatures, per-method opcode sequences and digests, per-method
/// call-site graph nodes.
pub(crate) struct FeatureExtractor<'a> {
    pub(crate) alphabet: &'a OpcodeAlphabet,
    pub(crate) min_method_opcode_num: usize,
    pub(crate) max_opcode_len: usize,
    pub(crate) filter_record_limit: u8,
}

struct ExtractedClass {
    name: String,
    record: ClassRecord,
    nodes_by_method_key: BTreeMap<CanonicalName, Vec<Node>>,
    invoked_callees: BTreeSet<CanonicalName>,
    defined_methods: BTreeSet<CanonicalName>,
}

impl<'a> FeatureExtractor<'a> {
    pub(crate) fn extract_library(
        &self,
        package: String,
        filename: String,
        classes: &[RawClass],
    ) -> Result<LibraryRecord, EngineError> {
        let extracted = self.extract_classes(classes)?;
        let mut classes_by_name = BTreeMap::new();
        let mut nodes_by_method_key = BTreeMap::new();
        let mut invoked_callees = BTreeSet::new();
        let mut defined_methods = BTreeSet::new();
        let mut opcode_count = 0usize;
        let mut any_concrete = false;
        for class in extracted {
            opcode_count += class.record.opcode_count();
            any_concrete |= !class.record.is_interface_only();
            classes_by_name.insert(class.name, class.record);
            nodes_by_method_key.extend(class.nodes_by_method_key);
            invoked_callees.extend(class.invoked_callees);
            defined_methods.extend(class.defined_methods);
        }
        let invoked_external_methods = invoked_callees
            .difference(&defined_methods)
            .cloned()
            .collect();
        Ok(LibraryRecord {
            package,
            filename,
            opcode_count,
            classes_by_name,
            nodes_by_method_key,
            invoked_external_methods,
            is_interface_only: !any_concrete,
        })
    }

    pub(crate) fn extract_application(
        &self,
        classes: &[RawClass],
    ) -> Result<ApplicationRecord, EngineError> {
        let extracted = self.extract_classes(classes)?;
        let mut classes_by_name = BTreeMap::new();
        let mut nodes_by_method_key = BTreeMap::new();
        let mut app_filter = BTreeMap::new();
        for class in extracted {
            insert_into_app_filter(&mut app_filter, &class.name, class.record.bloom());
            nodes_by_method_key.extend(class.nodes_by_method_key);
            classes_by_name.insert(class.name, class.record);
        }
        Ok(ApplicationRecord {
            classes_by_name,
            nodes_by_method_key,
            app_filter,
        })
    }

    fn extract_classes(&self, classes: &[RawClass]) -> Result<Vec<ExtractedClass>, EngineError> {
        classes
            .iter()
            .filter(|class| !is_resource_class(&class.name))
            .map(|class| self.extract_class(class))
            .collect()
    }

    fn extract_class(&self, raw: &RawClass) -> Result<ExtractedClass, EngineError> {
        let mut bloom: Bloom = Bloom::new();
        for index in class_access_indices(&raw.access) {
            bump_bloom(&mut bloom, index, self.filter_record_limit);
        }
        if raw.fields.is_empty() {
            bump_bloom(&mut bloom, NO_FIELDS_INDEX, self.filter_record_limit);
        }
        for field in &raw.fields {
            let Some((descriptor, _)) = crate::descriptor::TypeDescriptor::parse(&field.descriptor)
            else {
                continue;
            };
            let family = field_type_family(&descriptor);
            bump_bloom(
                &mut bloom,
                field_index(field.is_static, family),
                self.filter_record_limit,
            );
        }

        let mut nodes_by_method_key = BTreeMap::new();
        let mut invoked_callees = BTreeSet::new();
        let mut defined_methods = BTreeSet::new();
        let mut eligible_methods = Vec::new();

        for method in &raw.methods {
            let name = CanonicalName::new(&raw.name, &method.name, &method.descriptor);
            defined_methods.insert(name.clone());

            let descriptor = MethodDescriptor::parse(&method.descriptor);
            let (mut opcodes, nodes, callees) = self.linearize(method);
            invoked_callees.extend(callees);
            let opcode_count = opcodes.len();
            let digest = Digest::of_opcodes(&opcodes);
            opcodes.shrink_to_fit();

            nodes_by_method_key.insert(name.clone(), nodes.clone());

            let record = MethodRecord {
                name: name.clone(),
                is_static: method.is_static,
                descriptor: method.descriptor.clone(),
                return_family: descriptor
                    .as_ref()
                    .map(|d| return_type_family(&d.return_type))
                    .unwrap_or(23),
                param_family: descriptor
                    .as_ref()
                    .map(|d| param_family(&d.params))
                    .unwrap_or(16),
                opcodes,
                opcode_count,
                digest,
                nodes,
            };
            if record.is_eligible(self.min_method_opcode_num, self.max_opcode_len) {
                let index = method_index(record.is_static, record.return_family, record.param_family);
                bump_bloom(&mut bloom, index, self.filter_record_limit);
                eligible_methods.push(record);
            }
        }

        let is_abstract_like = raw.access.is_interface || raw.access.is_abstract;
        let class_record = if is_abstract_like && eligible_methods.is_empty() {
            ClassRecord::InterfaceOnly {
                method_count: raw.methods.len(),
                bloom,
            }
        } else {
            let opcode_count = eligible_methods.iter().map(|m| m.opcode_count).sum();
            let digest = Digest::of_class(eligible_methods.iter().map(|m| m.digest));
            let methods_by_name = eligible_methods
                .into_iter()
                .map(|m| (m.name.clone(), m))
                .collect();
            ClassRecord::Concrete {
                digest,
                method_count: methods_count(&methods_by_name),
                opcode_count,
                bloom,
                methods_by_name,
            }
        };

        Ok(ExtractedClass {
            name: raw.name.clone(),
            record: class_record,
            nodes_by_method_key,
            invoked_callees,
            defined_methods,
        })
    }

    /// Per-method linearization (§4.1): normalize each instruction through
    /// the shared opcode alphabet and split into nodes at invoke boundaries.
    fn linearize(
        &self,
        method: &crate::provider::RawMethod,
    ) -> (Vec<u16>, Vec<Node>, BTreeSet<CanonicalName>) {
        let mut opcodes = Vec::new();
        let mut nodes = Vec::new();
        let mut callees = BTreeSet::new();
        let mut current = Node::default();

        for instruction in &method.instructions {
            let Some(normalized) = crate::opcodes::normalize_mnemonic(&instruction.mnemonic)
            else {
                continue;
            };
            if let Ok(code) = self.alphabet.code_of(&normalized) {
                opcodes.push(code);
                current.opcodes.push(code);
            }
            if let Some(callee) = &instruction.invoke_callee {
                current.callee = Some(callee.clone());
                nodes.push(std::mem::take(&mut current));
                callees.insert(callee.clone());
            }
        }
        nodes.push(current);
        (opcodes, nodes, callees)
    }
}

fn methods_count(methods: &BTreeMap<CanonicalName, MethodRecord>) -> usize {
    methods.len()
}

fn is_resource_class(dotted_name: &str) -> bool {
    dotted_name
        .rsplit('.')
        .next()
        .map(|short| short.starts_with("R$"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ClassAccessShape;
    use crate::provider::{RawField, RawInstruction, RawMethod};

    fn alphabet() -> OpcodeAlphabet {
        OpcodeAlphabet::parse("const-string:1\nreturn-void:2\ninvoke-virtual:3\n").unwrap()
    }

    fn extractor(alphabet: &OpcodeAlphabet) -> FeatureExtractor<'_> {
        FeatureExtractor {
            alphabet,
            min_method_opcode_num: 1,
            max_opcode_len: 1000,
            filter_record_limit: 10,
        }
    }

    fn sample_class() -> RawClass {
        RawClass {
            name: "com.example.Foo".to_string(),
            access: ClassAccessShape {
                is_public_or_default: true,
                is_interface: false,
                is_abstract: false,
                is_enum: false,
                is_static: false,
                has_non_object_super: false,
            },
            super_name: Some("java.lang.Object".to_string()),
            fields: vec![RawField {
                is_static: true,
                descriptor: "I".to_string(),
            }],
            methods: vec![RawMethod {
                name: "bar".to_string(),
                descriptor: "()V".to_string(),
                is_static: false,
                instructions: vec![
                    RawInstruction {
                        mnemonic: "const-string".to_string(),
                        invoke_callee: None,
                    },
                    RawInstruction {
                        mnemonic: "return-void".to_string(),
                        invoke_callee: None,
                    },
                ],
            }],
        }
    }

    #[test]
    fn extracts_concrete_class_with_bloom() {
        let alphabet = alphabet();
        let extractor = extractor(&alphabet);
        let classes = vec![sample_class()];
        let library = extractor
            .extract_library("pkg".to_string(), "pkg-1.0.txt".to_string(), &classes)
            .unwrap();
        assert_eq!(library.opcode_count, 2);
        let class = library.classes_by_name.get("com.example.Foo").unwrap();
        assert!(!class.is_interface_only());
        assert_eq!(class.method_count(), 1);
        assert!(class.bloom().contains_key(&1));
    }

    #[test]
    fn resource_classes_are_skipped() {
        let alphabet = alphabet();
        let extractor = extractor(&alphabet);
        let mut class = sample_class();
        class.name = "com.example.R$drawable".to_string();
        let library = extractor
            .extract_library("pkg".to_string(), "pkg.txt".to_string(), &[class])
            .unwrap();
        assert!(library.classes_by_name.is_empty());
    }

    #[test]
    fn interface_without_bodies_is_interface_only() {
        let alphabet = alphabet();
        let extractor = extractor(&alphabet);
        let mut class = sample_class();
        class.access.is_interface = true;
        class.methods = vec![RawMethod {
            name: "bar".to_string(),
            descriptor: "()V".to_string(),
            is_static: false,
            instructions: Vec::new(),
        }];
        let library = extractor
            .extract_library("pkg".to_string(), "pkg.txt".to_string(), &[class])
            .unwrap();
        let class = library.classes_by_name.get("com.example.Foo").unwrap();
        assert!(class.is_interface_only());
        assert_eq!(class.method_count(), 1);
    }

    #[test]
    fn invoke_closes_a_node_and_tracks_callee() {
        let alphabet = alphabet();
        let extractor = extractor(&alphabet);
        let mut class = sample_class();
        class.methods[0].instructions.push(RawInstruction {
            mnemonic: "invoke-virtual".to_string(),
            invoke_callee: Some(CanonicalName::new("com.example.Bar", "baz", "()V")),
        });
        let library = extractor
            .extract_library("pkg".to_string(), "pkg.txt".to_string(), &[class])
            .unwrap();
        assert_eq!(
            library.invoked_external_methods,
            BTreeSet::from([CanonicalName::new("com.example.Bar", "baz", "()V")])
        );
        let method_name = CanonicalName::new("com.example.Foo", "bar", "()V");
        let nodes = library.nodes_by_method_key.get(&method_name).unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(nodes[0].callee.is_some());
        assert!(nodes[1].callee.is_none());
    }
}
