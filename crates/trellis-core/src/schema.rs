//! # Schema Metadata
//!
//! Type metadata the read path consults. Validation of stored data is the
//! concern of the write-side collaborators; this module only answers:
//! - the ancestor chain of a type (most specific first)
//! - which properties are links, and their cardinality
//! - which unique keys a type declares
//! - which reverse relations a type exposes
//! - which link paths the embedded frame expands
//!
//! A `Schema` is built once at start-up and never mutated afterwards.

use crate::calculated::CalculatedDocument;
use crate::primitives::KEY_NAMESPACE_SEPARATOR;
use crate::{ItemId, Properties, TrellisError, TypeName};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// COMPILED SCHEMA
// =============================================================================

/// How many targets a link property holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// A single identifier.
    One,
    /// A list of identifiers.
    Many,
}

/// Target and shape of a link property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSpec {
    /// Type the link points at.
    pub target: TypeName,
    /// Single or list.
    pub cardinality: Cardinality,
}

/// Declaration of one stored property.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PropertySpec {
    /// Set when the property is a link.
    pub link: Option<LinkSpec>,
    /// A required link that resolves to nothing fails the render.
    pub required: bool,
}

/// A reverse relation: items of `source_type` whose `field` links here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseSpec {
    /// Type of the linking items.
    pub source_type: TypeName,
    /// Forward link field on the source type.
    pub field: String,
}

/// Declaration of one item type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    name: TypeName,
    parent: Option<TypeName>,
    collection: String,
    properties: BTreeMap<String, PropertySpec>,
    unique_keys: Vec<String>,
    reverse: BTreeMap<String, ReverseSpec>,
    embedded: Vec<String>,
}

impl TypeInfo {
    /// Declare a type served under `/{collection}/`.
    #[must_use]
    pub fn new(name: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            name: TypeName::new(name),
            parent: None,
            collection: collection.into(),
            properties: BTreeMap::new(),
            unique_keys: Vec::new(),
            reverse: BTreeMap::new(),
            embedded: Vec::new(),
        }
    }

    /// Set the parent type.
    #[must_use]
    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(TypeName::new(parent));
        self
    }

    /// Declare a plain (non-link) property.
    #[must_use]
    pub fn property(mut self, name: impl Into<String>) -> Self {
        self.properties.insert(name.into(), PropertySpec::default());
        self
    }

    /// Declare a single-valued link.
    #[must_use]
    pub fn link(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.with_link(name, target, Cardinality::One, false)
    }

    /// Declare a single-valued link that must resolve.
    #[must_use]
    pub fn required_link(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.with_link(name, target, Cardinality::One, true)
    }

    /// Declare a list-valued link.
    #[must_use]
    pub fn link_list(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.with_link(name, target, Cardinality::Many, false)
    }

    fn with_link(
        mut self,
        name: impl Into<String>,
        target: impl Into<String>,
        cardinality: Cardinality,
        required: bool,
    ) -> Self {
        self.properties.insert(
            name.into(),
            PropertySpec {
                link: Some(LinkSpec {
                    target: TypeName::new(target),
                    cardinality,
                }),
                required,
            },
        );
        self
    }

    /// Declare a unique key over a stored property.
    #[must_use]
    pub fn unique_key(mut self, property: impl Into<String>) -> Self {
        self.unique_keys.push(property.into());
        self
    }

    /// Declare a reverse relation exposed as `name`.
    #[must_use]
    pub fn reverse(
        mut self,
        name: impl Into<String>,
        source_type: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        self.reverse.insert(
            name.into(),
            ReverseSpec {
                source_type: TypeName::new(source_type),
                field: field.into(),
            },
        );
        self
    }

    /// Add a dotted link path to expand in the embedded frame.
    #[must_use]
    pub fn embed(mut self, path: impl Into<String>) -> Self {
        self.embedded.push(path.into());
        self
    }

    /// The type name.
    #[must_use]
    pub fn name(&self) -> &TypeName {
        &self.name
    }

    /// The collection segment of canonical paths.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }
}

/// The compiled, immutable schema.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    types: BTreeMap<TypeName, TypeInfo>,
    collections: BTreeMap<String, TypeName>,
    ancestry: BTreeMap<TypeName, Vec<TypeName>>,
}

impl Schema {
    /// Compile a set of type declarations.
    ///
    /// Rejects duplicate names or collections, dangling parents or link
    /// targets, reverse relations over non-link fields, and parent cycles.
    pub fn new(types: Vec<TypeInfo>) -> Result<Self, TrellisError> {
        let mut schema = Self::default();

        for info in types {
            if schema.collections.contains_key(&info.collection) {
                return Err(TrellisError::InvalidSchema(format!(
                    "collection {} declared twice",
                    info.collection
                )));
            }
            let name = info.name.clone();
            schema
                .collections
                .insert(info.collection.clone(), name.clone());
            if schema.types.insert(name.clone(), info).is_some() {
                return Err(TrellisError::InvalidSchema(format!(
                    "type {} declared twice",
                    name
                )));
            }
        }

        let names: Vec<TypeName> = schema.types.keys().cloned().collect();
        for name in names {
            let chain = schema.build_ancestry(&name)?;
            schema.ancestry.insert(name, chain);
        }

        schema.check_references()?;
        Ok(schema)
    }

    /// Compile the type section of a schema document.
    pub fn from_document(doc: &SchemaDocument) -> Result<Self, TrellisError> {
        let mut types = Vec::with_capacity(doc.types.len());
        for t in &doc.types {
            types.push(t.to_type_info());
        }
        Self::new(types)
    }

    fn build_ancestry(&self, name: &TypeName) -> Result<Vec<TypeName>, TrellisError> {
        let mut chain = vec![name.clone()];
        let mut current = self.type_info(name)?;
        while let Some(parent) = &current.parent {
            if chain.contains(parent) {
                return Err(TrellisError::InvalidSchema(format!(
                    "type {} inherits from itself",
                    name
                )));
            }
            chain.push(parent.clone());
            current = self.type_info(parent)?;
        }
        Ok(chain)
    }

    fn check_references(&self) -> Result<(), TrellisError> {
        for info in self.types.values() {
            for (prop, spec) in &info.properties {
                let dangling = spec
                    .link
                    .as_ref()
                    .is_some_and(|link| !self.types.contains_key(&link.target));
                if dangling {
                    let target = spec.link.as_ref().map(|l| l.target.as_str()).unwrap_or_default();
                    return Err(TrellisError::InvalidSchema(format!(
                        "{}.{} links to undeclared type {}",
                        info.name, prop, target
                    )));
                }
            }
            for (name, rev) in &info.reverse {
                let is_link = self
                    .property_spec(&rev.source_type, &rev.field)
                    .is_some_and(|s| s.link.is_some());
                if !is_link {
                    return Err(TrellisError::InvalidSchema(format!(
                        "reverse {}.{} needs link field {}.{}",
                        info.name, name, rev.source_type, rev.field
                    )));
                }
            }
        }
        Ok(())
    }

    /// Look up a type declaration.
    pub fn type_info(&self, name: &TypeName) -> Result<&TypeInfo, TrellisError> {
        self.types
            .get(name)
            .ok_or_else(|| TrellisError::UnknownType(name.to_string()))
    }

    /// Ancestor chain of a type, most specific first, the type itself included.
    pub fn ancestry(&self, name: &TypeName) -> Result<&[TypeName], TrellisError> {
        self.ancestry
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| TrellisError::UnknownType(name.to_string()))
    }

    /// Check if `name` is `ancestor` or one of its descendants.
    #[must_use]
    pub fn is_a(&self, name: &TypeName, ancestor: &TypeName) -> bool {
        self.ancestry
            .get(name)
            .is_some_and(|chain| chain.contains(ancestor))
    }

    /// A type and every type descending from it, in name order.
    #[must_use]
    pub fn descendants(&self, name: &TypeName) -> Vec<TypeName> {
        self.ancestry
            .iter()
            .filter(|(_, chain)| chain.contains(name))
            .map(|(t, _)| t.clone())
            .collect()
    }

    /// Type served under a collection segment.
    #[must_use]
    pub fn type_for_collection(&self, collection: &str) -> Option<&TypeName> {
        self.collections.get(collection)
    }

    /// All declared type names.
    pub fn type_names(&self) -> impl Iterator<Item = &TypeName> {
        self.types.keys()
    }

    /// Property declaration, inherited along the ancestor chain.
    #[must_use]
    pub fn property_spec(&self, name: &TypeName, property: &str) -> Option<&PropertySpec> {
        self.ancestry.get(name)?.iter().find_map(|t| {
            self.types
                .get(t)
                .and_then(|info| info.properties.get(property))
        })
    }

    /// Reverse relation declaration, inherited along the ancestor chain.
    #[must_use]
    pub fn reverse_spec(&self, name: &TypeName, relation: &str) -> Option<&ReverseSpec> {
        self.ancestry
            .get(name)?
            .iter()
            .find_map(|t| self.types.get(t).and_then(|info| info.reverse.get(relation)))
    }

    /// Names of every reverse relation a type exposes.
    #[must_use]
    pub fn reverse_names(&self, name: &TypeName) -> BTreeSet<&str> {
        self.collect_along(name, |info| {
            info.reverse.keys().map(String::as_str).collect()
        })
    }

    /// Embedded paths of a type, own declarations first, then inherited.
    #[must_use]
    pub fn embedded_paths(&self, name: &TypeName) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for t in self.ancestry.get(name).into_iter().flatten() {
            if let Some(info) = self.types.get(t) {
                for path in &info.embedded {
                    if !out.contains(&path.as_str()) {
                        out.push(path);
                    }
                }
            }
        }
        out
    }

    /// Unique keys of a type as `(namespace, property)` pairs.
    ///
    /// The namespace is owned by the declaring type, so subtypes share
    /// their parent's key space.
    #[must_use]
    pub fn unique_keys(&self, name: &TypeName) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for t in self.ancestry.get(name).into_iter().flatten() {
            if let Some(info) = self.types.get(t) {
                for prop in &info.unique_keys {
                    out.push((key_namespace(t, prop), prop.clone()));
                }
            }
        }
        out
    }

    /// Unique key values carried by a property bag.
    #[must_use]
    pub fn unique_key_values(&self, name: &TypeName, props: &Properties) -> Vec<(String, String)> {
        self.unique_keys(name)
            .into_iter()
            .filter_map(|(ns, prop)| {
                let value = match props.get(&prop)? {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    _ => return None,
                };
                Some((ns, value))
            })
            .collect()
    }

    /// Forward links carried by a property bag as `(field, target)` pairs.
    #[must_use]
    pub fn links(&self, name: &TypeName, props: &Properties) -> Vec<(String, ItemId)> {
        let mut out = Vec::new();
        for (field, value) in props {
            let Some(link) = self.property_spec(name, field).and_then(|s| s.link.as_ref()) else {
                continue;
            };
            match (link.cardinality, value) {
                (Cardinality::Many, Value::Array(values)) => {
                    out.extend(
                        values
                            .iter()
                            .filter_map(ItemId::from_value)
                            .map(|id| (field.clone(), id)),
                    );
                }
                (_, v) => {
                    if let Some(id) = ItemId::from_value(v) {
                        out.push((field.clone(), id));
                    }
                }
            }
        }
        out
    }

    fn collect_along<'a>(
        &'a self,
        name: &TypeName,
        f: impl Fn(&'a TypeInfo) -> BTreeSet<&'a str>,
    ) -> BTreeSet<&'a str> {
        let mut out = BTreeSet::new();
        for t in self.ancestry.get(name).into_iter().flatten() {
            if let Some(info) = self.types.get(t) {
                out.extend(f(info));
            }
        }
        out
    }
}

/// Namespace of a unique key declared by `owner`.
#[must_use]
pub fn key_namespace(owner: &TypeName, property: &str) -> String {
    format!(
        "{}{}{}",
        owner.as_str().to_lowercase(),
        KEY_NAMESPACE_SEPARATOR,
        property
    )
}

// =============================================================================
// SCHEMA DOCUMENT (TOML / JSON)
// =============================================================================

/// Serialized form of a schema, as loaded from configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchemaDocument {
    /// Declared types.
    #[serde(default)]
    pub types: Vec<TypeDocument>,
}

/// Serialized form of one type.
#[derive(Debug, Clone, Deserialize)]
pub struct TypeDocument {
    /// Type name.
    pub name: String,
    /// Parent type name.
    #[serde(default)]
    pub parent: Option<String>,
    /// Collection segment; defaults to the lowercased name plus `s`.
    #[serde(default)]
    pub collection: Option<String>,
    /// Declared properties.
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyDocument>,
    /// Unique key properties.
    #[serde(default)]
    pub unique_keys: Vec<String>,
    /// Reverse relations.
    #[serde(default)]
    pub reverse: BTreeMap<String, ReverseDocument>,
    /// Embedded paths.
    #[serde(default)]
    pub embedded: Vec<String>,
    /// Declarative calculated properties.
    #[serde(default)]
    pub calculated: Vec<CalculatedDocument>,
}

/// Serialized form of a property declaration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PropertyDocument {
    /// Target type when the property is a link.
    #[serde(default)]
    pub link_to: Option<String>,
    /// The link holds a list of identifiers.
    #[serde(default)]
    pub list: bool,
    /// The link must resolve.
    #[serde(default)]
    pub required: bool,
}

/// Serialized form of a reverse relation.
#[derive(Debug, Clone, Deserialize)]
pub struct ReverseDocument {
    /// Type of the linking items.
    pub source_type: String,
    /// Forward link field on the source type.
    pub field: String,
}

impl TypeDocument {
    fn to_type_info(&self) -> TypeInfo {
        let collection = self
            .collection
            .clone()
            .unwrap_or_else(|| format!("{}s", self.name.to_lowercase()));
        let mut info = TypeInfo::new(self.name.clone(), collection);
        info.parent = self.parent.as_ref().map(TypeName::new);
        for (name, prop) in &self.properties {
            let link = prop.link_to.as_ref().map(|target| LinkSpec {
                target: TypeName::new(target),
                cardinality: if prop.list {
                    Cardinality::Many
                } else {
                    Cardinality::One
                },
            });
            info.properties.insert(
                name.clone(),
                PropertySpec {
                    link,
                    required: prop.required,
                },
            );
        }
        info.unique_keys.clone_from(&self.unique_keys);
        for (name, rev) in &self.reverse {
            info.reverse.insert(
                name.clone(),
                ReverseSpec {
                    source_type: TypeName::new(&rev.source_type),
                    field: rev.field.clone(),
                },
            );
        }
        info.embedded.clone_from(&self.embedded);
        info
    }
}

// =============================================================================
// TESTS
// =============================================================================
