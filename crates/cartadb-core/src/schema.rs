//! Table schema descriptors.

use serde::{Deserialize, Serialize};

use crate::revision::{FieldValue, Revision};

/// Kind of one schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Int,
    Real,
    Text,
    Bytes,
    Bool,
    Ref,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
}

/// Schema of one table: its name and typed fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    name: String,
    fields: Vec<FieldDescriptor>,
}

impl TableDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn add_field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldDescriptor {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// A blank revision carrying every schema field at a default value.
    /// Used as the structure reference for transactions.
    pub fn template(&self, id: crate::id::Id) -> Revision {
        let mut revision = Revision::new(id);
        for field in &self.fields {
            let value = match field.kind {
                FieldKind::Int => FieldValue::Int(0),
                FieldKind::Real => FieldValue::Real(0.0),
                FieldKind::Text => FieldValue::Text(String::new()),
                FieldKind::Bytes => FieldValue::Bytes(Vec::new()),
                FieldKind::Bool => FieldValue::Bool(false),
                FieldKind::Ref => FieldValue::Ref(crate::id::Id::default()),
            };
            revision.set(field.name.clone(), value);
        }
        revision
    }

    /// Canonical byte form, used for the metatable's byte-equality check
    /// between competing definitions of the same table.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("descriptor serialization cannot fail")
    }

    pub fn structure_match(&self, other: &TableDescriptor) -> bool {
        self.canonical_bytes() == other.canonical_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Id;

    #[test]
    fn test_template_carries_all_fields() {
        let descriptor = TableDescriptor::new("poses")
            .add_field("n", FieldKind::Int)
            .add_field("label", FieldKind::Text);
        let template = descriptor.template(Id::generate());
        assert_eq!(template.get("n"), Some(&FieldValue::Int(0)));
        assert_eq!(template.get("label"), Some(&FieldValue::Text(String::new())));
    }

    #[test]
    fn test_structure_match_is_byte_equality() {
        let a = TableDescriptor::new("poses").add_field("n", FieldKind::Int);
        let b = TableDescriptor::new("poses").add_field("n", FieldKind::Int);
        let c = TableDescriptor::new("poses").add_field("n", FieldKind::Real);
        assert!(a.structure_match(&b));
        assert!(!a.structure_match(&c));
    }

    #[test]
    fn test_field_order_matters() {
        let a = TableDescriptor::new("t")
            .add_field("x", FieldKind::Int)
            .add_field("y", FieldKind::Int);
        let b = TableDescriptor::new("t")
            .add_field("y", FieldKind::Int)
            .add_field("x", FieldKind::Int);
        assert!(!a.structure_match(&b));
    }
}
