//! # Calculated Property Registry
//!
//! Per-type definitions of derived attributes, inherited along a type's
//! ancestor chain. The registry is assembled once at start-up through a
//! `RegistryBuilder` and is immutable afterwards; every evaluation context
//! reads it by shared reference.
//!
//! ## Lookup
//!
//! For a name, the definition owned by the most specific type in the
//! ancestor chain wins, so a subtype overrides its ancestors.
//!
//! ## Cycles
//!
//! `RegistryBuilder::build` rejects any type whose effective definitions
//! depend on each other in a cycle, counting both declared arguments and
//! conditions.

use crate::render::CalcCall;
use crate::schema::{Schema, SchemaDocument};
use crate::{TrellisError, TypeName};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Resolved arguments handed to a compute or condition function.
///
/// Unresolvable arguments are absent, never `null`.
pub type CalcArgs = BTreeMap<String, Value>;

/// Compute function of a calculated property.
///
/// `Ok(None)` means the property is `Missing` for this item. An `Err` is a
/// defect in the derived logic and aborts the enclosing render.
pub type ComputeFn =
    Arc<dyn Fn(&mut CalcCall<'_, '_>) -> Result<Option<Value>, TrellisError> + Send + Sync>;

/// Predicate deciding whether a calculated property applies.
pub type ConditionFn = Arc<dyn Fn(&CalcArgs) -> bool + Send + Sync>;

/// Gate evaluated before a calculated property is computed.
#[derive(Clone)]
pub enum Condition {
    /// The named attribute must resolve.
    Requires(String),
    /// A predicate over resolved arguments.
    Check {
        /// Arguments the predicate reads.
        args: Vec<String>,
        /// The predicate.
        check: ConditionFn,
    },
}

impl Condition {
    /// Names this condition depends on.
    #[must_use]
    pub fn dependencies(&self) -> Vec<&str> {
        match self {
            Self::Requires(name) => vec![name.as_str()],
            Self::Check { args, .. } => args.iter().map(String::as_str).collect(),
        }
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requires(name) => f.debug_tuple("Requires").field(name).finish(),
            Self::Check { args, .. } => f
                .debug_struct("Check")
                .field("args", args)
                .finish_non_exhaustive(),
        }
    }
}

/// Definition of one calculated property.
#[derive(Clone)]
pub struct CalculatedProperty {
    name: String,
    owner: TypeName,
    args: Vec<String>,
    compute: ComputeFn,
    condition: Option<Condition>,
    define_only: bool,
}

impl CalculatedProperty {
    /// Define `name` on `owner`, computed by `compute`.
    pub fn new<F>(owner: impl Into<String>, name: impl Into<String>, compute: F) -> Self
    where
        F: Fn(&mut CalcCall<'_, '_>) -> Result<Option<Value>, TrellisError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            owner: TypeName::new(owner),
            args: Vec::new(),
            compute: Arc::new(compute),
            condition: None,
            define_only: false,
        }
    }

    /// Declare the arguments the compute function receives.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Only compute when `name` resolves.
    #[must_use]
    pub fn requires(mut self, name: impl Into<String>) -> Self {
        self.condition = Some(Condition::Requires(name.into()));
        self
    }

    /// Only compute when `check` holds over `args`.
    #[must_use]
    pub fn condition<I, S, F>(mut self, args: I, check: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&CalcArgs) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Condition::Check {
            args: args.into_iter().map(Into::into).collect(),
            check: Arc::new(check),
        });
        self
    }

    /// Make the property resolvable by other properties but absent from
    /// rendered views.
    #[must_use]
    pub fn define_only(mut self) -> Self {
        self.define_only = true;
        self
    }

    /// Property name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning type.
    #[must_use]
    pub fn owner(&self) -> &TypeName {
        &self.owner
    }

    /// Declared argument names.
    #[must_use]
    pub fn arg_names(&self) -> &[String] {
        &self.args
    }

    /// The gate, if any.
    #[must_use]
    pub fn gate(&self) -> Option<&Condition> {
        self.condition.as_ref()
    }

    /// Whether the property is hidden from rendered views.
    #[must_use]
    pub fn is_define_only(&self) -> bool {
        self.define_only
    }

    /// Invoke the compute function.
    pub fn compute(&self, call: &mut CalcCall<'_, '_>) -> Result<Option<Value>, TrellisError> {
        (self.compute)(call)
    }

    fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.args.iter().map(String::as_str).chain(
            self.condition
                .iter()
                .flat_map(|c| c.dependencies().into_iter()),
        )
    }
}

impl fmt::Debug for CalculatedProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalculatedProperty")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("args", &self.args)
            .field("condition", &self.condition)
            .field("define_only", &self.define_only)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Collects definitions before the registry is frozen.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    definitions: Vec<CalculatedProperty>,
}

impl RegistryBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition.
    #[must_use]
    pub fn register(mut self, definition: CalculatedProperty) -> Self {
        self.definitions.push(definition);
        self
    }

    /// Validate against the schema and freeze.
    pub fn build(self, schema: &Schema) -> Result<Registry, TrellisError> {
        let mut by_type: BTreeMap<TypeName, BTreeMap<String, Arc<CalculatedProperty>>> =
            BTreeMap::new();

        for def in self.definitions {
            schema.type_info(&def.owner)?;
            let slot = by_type.entry(def.owner.clone()).or_default();
            if slot.contains_key(&def.name) {
                return Err(TrellisError::InvalidSchema(format!(
                    "calculated property {}.{} registered twice",
                    def.owner, def.name
                )));
            }
            slot.insert(def.name.clone(), Arc::new(def));
        }

        let registry = Registry { by_type };
        for name in schema.type_names() {
            registry.check_acyclic(schema.ancestry(name)?, name)?;
        }
        Ok(registry)
    }
}

/// Immutable registry of calculated properties.
#[derive(Debug, Default)]
pub struct Registry {
    by_type: BTreeMap<TypeName, BTreeMap<String, Arc<CalculatedProperty>>>,
}

impl Registry {
    /// The definition of `name` for the most specific type in `ancestry`.
    #[must_use]
    pub fn lookup(&self, ancestry: &[TypeName], name: &str) -> Option<&Arc<CalculatedProperty>> {
        ancestry
            .iter()
            .find_map(|t| self.by_type.get(t).and_then(|defs| defs.get(name)))
    }

    /// Every definition applicable to `ancestry`, one per name, in name order.
    #[must_use]
    pub fn effective(&self, ancestry: &[TypeName]) -> Vec<&Arc<CalculatedProperty>> {
        let mut chosen: BTreeMap<&str, &Arc<CalculatedProperty>> = BTreeMap::new();
        for t in ancestry {
            for (name, def) in self.by_type.get(t).into_iter().flatten() {
                chosen.entry(name.as_str()).or_insert(def);
            }
        }
        chosen.into_values().collect()
    }

    /// Number of registered definitions.
    #[must_use]
    pub fn definition_count(&self) -> usize {
        self.by_type.values().map(BTreeMap::len).sum()
    }

    fn check_acyclic(&self, ancestry: &[TypeName], name: &TypeName) -> Result<(), TrellisError> {
        let defs: BTreeMap<&str, &Arc<CalculatedProperty>> = self
            .effective(ancestry)
            .into_iter()
            .map(|d| (d.name(), d))
            .collect();

        // Depth-first walk; `on_path` holds the current chain.
        let mut done: BTreeSet<&str> = BTreeSet::new();
        for &start in defs.keys() {
            if done.contains(&start) {
                continue;
            }
            let mut on_path: Vec<&str> = vec![start];
            let mut stack: Vec<(&str, Vec<&str>)> = vec![(start, deps_of(&defs, start))];
            while let Some((node, pending)) = stack.last_mut() {
                let node = *node;
                match pending.pop() {
                    Some(next) => {
                        if on_path.contains(&next) {
                            return Err(TrellisError::InvalidSchema(format!(
                                "calculated properties of {} form a cycle through {}",
                                name, next
                            )));
                        }
                        if !done.contains(&next) {
                            stack.push((next, deps_of(&defs, next)));
                            on_path.push(next);
                        }
                    }
                    None => {
                        done.insert(node);
                        stack.pop();
                        on_path.pop();
                    }
                }
            }
        }
        Ok(())
    }
}

fn deps_of<'a>(defs: &BTreeMap<&'a str, &'a Arc<CalculatedProperty>>, name: &str) -> Vec<&'a str> {
    defs.get(name)
        .map(|d| {
            let d: &'a Arc<CalculatedProperty> = d;
            d.dependencies().filter(|n| defs.contains_key(n)).collect()
        })
        .unwrap_or_default()
}

// =============================================================================
// CATALOG
// =============================================================================

/// Schema plus registry: the start-up snapshot every render reads from.
#[derive(Debug, Default)]
pub struct Catalog {
    /// Type metadata.
    pub schema: Schema,
    /// Calculated property definitions.
    pub registry: Registry,
}

impl Catalog {
    /// Pair an already-built schema and registry.
    #[must_use]
    pub fn new(schema: Schema, registry: Registry) -> Self {
        Self { schema, registry }
    }

    /// Compile a schema document, its declarative calculated properties,
    /// and any code-defined definitions in `extra`.
    pub fn from_document(doc: &SchemaDocument, extra: RegistryBuilder) -> Result<Self, TrellisError> {
        let schema = Schema::from_document(doc)?;
        let mut builder = extra;
        for t in &doc.types {
            for calc in &t.calculated {
                builder = builder.register(calc.compile(&t.name)?);
            }
        }
        let registry = builder.build(&schema)?;
        Ok(Self { schema, registry })
    }
}

// =============================================================================
// TESTS
// =============================================================================
