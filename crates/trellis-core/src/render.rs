//! # Renderer
//!
//! The Property Resolver and the Sub-call Embedder, driven per unit of work.
//!
//! ## Resolution Order
//!
//! `resolve(item, name)` tries, first match wins:
//! 1. a caller-supplied override on the evaluation context
//! 2. the calculated property of the most specific type defining `name`
//!    (condition first; unresolvable arguments are left out of the call)
//! 3. a stored property, link identifiers rewritten to canonical paths
//! 4. a reverse-link collection, as canonical paths
//! 5. `Missing`
//!
//! Every outcome is memoized on the item's evaluation context together with
//! the footprint it produced.
//!
//! ## Embedding
//!
//! `embed(base, path, principal)` normalizes `path` against `base`, then:
//! - for the session's own identity, serves from the embed cache or renders
//!   and caches
//! - for any other identity, renders with fresh contexts and never touches
//!   the cache
//!
//! Either way the sub-render's footprint is merged into the enclosing one.
//!
//! ## Footprints
//!
//! `UnitOfWork::footprints` is a stack. Every sub-render pushes a frame,
//! records what it inlines or references, then pops and merges into the
//! frame below.

use crate::addressing::{AccessPolicy, Addressing};
use crate::cache::EmbedEntry;
use crate::context::EvalContext;
use crate::primitives::FRAME_MARKER;
use crate::registry::{CalcArgs, Catalog, Condition};
use crate::schema::Cardinality;
use crate::session::UnitOfWork;
use crate::storage::StorageFacade;
use crate::{Footprint, Frame, Item, ItemId, Principal, Resolved, TrellisError, paths};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Output of a render: the view plus everything it depended on.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    /// The rendered view. Copy-on-write with `Arc::make_mut` to modify.
    pub value: Arc<Value>,
    /// Items inlined into and referenced by the view.
    pub footprint: Footprint,
}

/// Renders items for one unit of work.
pub struct Renderer<'r> {
    catalog: &'r Catalog,
    facade: &'r StorageFacade,
    policy: &'r dyn AccessPolicy,
    uow: &'r mut UnitOfWork,
    base: Principal,
    principals: Vec<Principal>,
}

impl<'r> Renderer<'r> {
    /// Create a renderer running as the session's own identity.
    pub fn new(
        catalog: &'r Catalog,
        facade: &'r StorageFacade,
        policy: &'r dyn AccessPolicy,
        uow: &'r mut UnitOfWork,
    ) -> Self {
        Self {
            catalog,
            facade,
            policy,
            uow,
            base: Principal::Session,
            principals: Vec::new(),
        }
    }

    /// Run every render as `principal` instead.
    #[must_use]
    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.base = principal;
        self
    }

    /// Identity the current sub-call runs as.
    #[must_use]
    pub fn principal(&self) -> &Principal {
        self.principals.last().unwrap_or(&self.base)
    }

    // =========================================================================
    // ENTRY POINTS
    // =========================================================================

    /// Render the item at an absolute path, `@@frame` suffix optional.
    ///
    /// Unlike embedded links, a missing top-level target is an error.
    pub fn render_path(&mut self, path: &str) -> Result<Rendered, TrellisError> {
        let absolute = paths::normalize("/", path)?;
        let (value, footprint) = self.tracked(|r| r.embed_absolute(&absolute));
        let value = value?;
        self.uow.absorb(&footprint);
        Ok(Rendered { value, footprint })
    }

    /// Render an already-fetched item at `frame`.
    pub fn render_item(&mut self, item: &Item, frame: Frame) -> Result<Rendered, TrellisError> {
        let (value, footprint) = self.tracked(|r| r.render_frame(item, frame));
        let value = value?;
        self.uow.absorb(&footprint);
        Ok(Rendered {
            value: Arc::new(value),
            footprint,
        })
    }

    /// Resolve one attribute of `item`.
    pub fn resolve(&mut self, item: &Item, name: &str) -> Result<Resolved, TrellisError> {
        let mut ctx = self.take_context(item)?;
        let result = self.resolve_in(&mut ctx, name);
        self.uow.contexts.insert(item.id(), ctx);
        result
    }

    /// Resolve one attribute with overrides that apply to this call only.
    ///
    /// The evaluation uses a throwaway context so the overrides never reach
    /// the item's shared memo.
    pub fn resolve_with<I>(
        &mut self,
        item: &Item,
        name: &str,
        overrides: I,
    ) -> Result<Resolved, TrellisError>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut ctx = self.new_context(item)?;
        for (key, value) in overrides {
            ctx = ctx.with_override(key, value);
        }
        self.resolve_in(&mut ctx, name)
    }

    /// Embed `relative` (resolved against `base`) as `principal`.
    pub fn embed(
        &mut self,
        base: &str,
        relative: &str,
        principal: &Principal,
    ) -> Result<Arc<Value>, TrellisError> {
        let absolute = paths::normalize(base, relative)?;
        if principal == self.principal() {
            return self.embed_absolute(&absolute);
        }

        // Contexts memoize values computed under the outer identity.
        self.principals.push(principal.clone());
        let saved = std::mem::take(&mut self.uow.contexts);
        let result = self.embed_absolute(&absolute);
        self.uow.contexts = saved;
        self.principals.pop();
        result
    }

    /// Like `embed` as the current identity, but a missing target is `None`.
    pub fn embed_optional(
        &mut self,
        base: &str,
        relative: &str,
    ) -> Result<Option<Arc<Value>>, TrellisError> {
        let principal = self.principal().clone();
        match self.embed(base, relative, &principal) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => {
                tracing::debug!(base, path = relative, "optional embed not found, omitting");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // SUB-CALL EMBEDDER
    // =========================================================================

    fn embed_absolute(&mut self, path: &str) -> Result<Arc<Value>, TrellisError> {
        let (item_path, frame) = paths::split_frame(path)?;
        let key = paths::with_frame(&item_path, frame);

        if self.uow.in_flight.contains(&key) {
            return Err(TrellisError::EmbedCycle(key));
        }
        if self.uow.in_flight.len() >= self.uow.limits().max_embed_depth {
            return Err(TrellisError::EmbedDepthExceeded(key));
        }

        let cacheable = self.principal().is_default();
        if cacheable && let Some(entry) = self.uow.embed_cache().get(&key) {
            self.uow.absorb(&entry.footprint);
            return Ok(entry.value);
        }

        let item = Addressing::new(&self.catalog.schema, self.facade, self.policy).locate(
            self.uow.edits(),
            self.uow.tier(),
            self.principal(),
            &item_path,
        )?;

        self.uow.in_flight.push(key.clone());
        let (result, footprint) = self.tracked(|r| r.render_frame(&item, frame));
        self.uow.in_flight.pop();
        let value = Arc::new(result?);

        if cacheable {
            self.uow.embed_cache().insert(
                key,
                EmbedEntry {
                    value: Arc::clone(&value),
                    footprint: footprint.clone(),
                },
            );
        }
        self.uow.absorb(&footprint);
        Ok(value)
    }

    /// Run `f` in its own footprint frame and hand back what it recorded.
    fn tracked<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, TrellisError>,
    ) -> (Result<T, TrellisError>, Footprint) {
        self.uow.footprints.push(Footprint::new());
        let result = f(self);
        let footprint = self.uow.footprints.pop().unwrap_or_default();
        (result, footprint)
    }

    fn note_embedded(&mut self, id: ItemId) {
        if let Some(top) = self.uow.footprints.last_mut() {
            top.embed(id);
        }
    }

    fn note_linked(&mut self, id: ItemId) {
        if let Some(top) = self.uow.footprints.last_mut() {
            top.link(id);
        }
    }

    // =========================================================================
    // FRAMES
    // =========================================================================

    fn render_frame(&mut self, item: &Item, frame: Frame) -> Result<Value, TrellisError> {
        match frame {
            Frame::Raw => {
                self.note_embedded(item.id());
                let catalog = self.catalog;
                for (_, target) in catalog
                    .schema
                    .links(item.item_type(), item.sheet().properties())
                {
                    self.note_linked(target);
                }
                Ok(Value::Object(
                    item.sheet()
                        .properties()
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                ))
            }
            Frame::Object => {
                self.note_embedded(item.id());
                let mut ctx = self.take_context(item)?;
                let result = self.object_view(&mut ctx);
                self.uow.contexts.insert(item.id(), ctx);
                result
            }
            Frame::Embedded => {
                let mut view = self.render_frame(item, Frame::Object)?;
                let catalog = self.catalog;
                for spec in catalog.schema.embedded_paths(item.item_type()) {
                    let (dotted, leaf_frame) = match spec.split_once(FRAME_MARKER) {
                        Some((dotted, name)) => (dotted, name.parse::<Frame>()?),
                        None => (spec, Frame::Object),
                    };
                    let segments: Vec<&str> = dotted.split('.').collect();
                    self.expand(item, &mut view, &segments, leaf_frame, true)?;
                }
                Ok(view)
            }
        }
    }

    fn object_view(&mut self, ctx: &mut EvalContext) -> Result<Value, TrellisError> {
        let catalog = self.catalog;
        let item = ctx.item().clone();
        let ancestry = catalog.schema.ancestry(item.item_type())?;

        let mut names: BTreeSet<&str> = item
            .sheet()
            .properties()
            .keys()
            .map(String::as_str)
            .collect();
        names.extend(catalog.schema.reverse_names(item.item_type()));
        names.extend(catalog.registry.effective(ancestry).into_iter().map(|d| d.name()));

        let mut out = Map::new();
        out.insert("@id".to_string(), Value::String(ctx.path().to_string()));
        out.insert(
            "@type".to_string(),
            Value::Array(
                ancestry
                    .iter()
                    .map(|t| Value::String(t.to_string()))
                    .collect(),
            ),
        );
        out.insert("uuid".to_string(), Value::from(item.id().0));

        for name in names {
            if out.contains_key(name) {
                continue;
            }
            let hidden = catalog
                .registry
                .lookup(ancestry, name)
                .is_some_and(|d| d.is_define_only());
            if hidden {
                continue;
            }
            if let Resolved::Found(value) = self.resolve_in(ctx, name)? {
                out.insert(name.to_string(), value);
            }
        }
        Ok(Value::Object(out))
    }

    /// Replace link paths along `segments` with embedded views.
    fn expand(
        &mut self,
        owner: &Item,
        value: &mut Value,
        segments: &[&str],
        leaf_frame: Frame,
        top: bool,
    ) -> Result<(), TrellisError> {
        let Some((head, rest)) = segments.split_first() else {
            return Ok(());
        };
        let Value::Object(map) = value else {
            return Ok(());
        };
        let required = top
            && self
                .catalog
                .schema
                .property_spec(owner.item_type(), head)
                .is_some_and(|spec| spec.required);
        let frame = if rest.is_empty() {
            leaf_frame
        } else {
            Frame::Object
        };

        let link = match map.get(*head) {
            Some(Value::String(s)) if s.starts_with('/') => Some(s.clone()),
            Some(_) => None,
            None => return Ok(()),
        };
        if let Some(link) = link {
            match self.embed_link(&link, frame)? {
                Some(mut embedded) => {
                    self.expand(owner, &mut embedded, rest, leaf_frame, false)?;
                    map.insert((*head).to_string(), embedded);
                }
                None if required => {
                    return Err(TrellisError::RequiredLinkMissing {
                        item: owner.id(),
                        field: (*head).to_string(),
                    });
                }
                None => {
                    map.shift_remove(*head);
                }
            }
            return Ok(());
        }

        if let Some(slot) = map.get_mut(*head) {
            match slot {
                Value::Array(elements) => {
                    let mut kept = Vec::with_capacity(elements.len());
                    for mut element in std::mem::take(elements) {
                        if let Value::String(link) = &element
                            && link.starts_with('/')
                        {
                            let link = link.clone();
                            match self.embed_link(&link, frame)? {
                                Some(embedded) => element = embedded,
                                None if required => {
                                    return Err(TrellisError::RequiredLinkMissing {
                                        item: owner.id(),
                                        field: (*head).to_string(),
                                    });
                                }
                                None => continue,
                            }
                        }
                        self.expand(owner, &mut element, rest, leaf_frame, false)?;
                        kept.push(element);
                    }
                    *elements = kept;
                }
                other => self.expand(owner, other, rest, leaf_frame, false)?,
            }
        }
        Ok(())
    }

    /// Embed a link target; `None` when it does not resolve.
    fn embed_link(&mut self, link: &str, frame: Frame) -> Result<Option<Value>, TrellisError> {
        match self.embed_absolute(&paths::with_frame(link, frame)) {
            Ok(value) => Ok(Some(Value::clone(&value))),
            Err(e) if e.is_not_found() => {
                tracing::debug!(path = link, "linked item not found, omitting");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // PROPERTY RESOLVER
    // =========================================================================

    fn new_context(&self, item: &Item) -> Result<EvalContext, TrellisError> {
        let info = self.catalog.schema.type_info(item.item_type())?;
        Ok(EvalContext::new(
            item.clone(),
            paths::canonical(info.collection(), item.id()),
        ))
    }

    /// The item's context for this unit of work, or a new one.
    ///
    /// A context built from another version of the item is discarded.
    /// The context stays out of `uow.contexts` until the caller puts it
    /// back, so a nested render of the same item builds its own context and
    /// the outer one replaces it on return.
    fn take_context(&mut self, item: &Item) -> Result<EvalContext, TrellisError> {
        match self.uow.contexts.remove(&item.id()) {
            Some(ctx) if ctx.item().tid() == item.tid() => Ok(ctx),
            _ => self.new_context(item),
        }
    }

    fn resolve_in(&mut self, ctx: &mut EvalContext, name: &str) -> Result<Resolved, TrellisError> {
        if let Some(value) = ctx.override_for(name) {
            return Ok(Resolved::Found(value.clone()));
        }
        if let Some(memo) = ctx.memo_for(name) {
            let resolved = memo.resolved.clone();
            let footprint = memo.footprint.clone();
            self.uow.absorb(&footprint);
            return Ok(resolved);
        }

        if !ctx.enter(name) {
            return Err(TrellisError::CalculatedCycle(format!("{}{}", ctx.path(), name)));
        }
        if ctx.depth() > self.uow.limits().max_calc_depth {
            ctx.leave();
            return Err(TrellisError::CalculatedCycle(format!(
                "{}{} exceeds the calculation depth limit",
                ctx.path(),
                name
            )));
        }
        let (result, footprint) = self.tracked(|r| r.dispatch(ctx, name));
        ctx.leave();
        let resolved = result?;

        self.uow.absorb(&footprint);
        ctx.remember(name, resolved.clone(), footprint);
        Ok(resolved)
    }

    fn dispatch(&mut self, ctx: &mut EvalContext, name: &str) -> Result<Resolved, TrellisError> {
        let catalog = self.catalog;
        let item = ctx.item().clone();
        let ancestry = catalog.schema.ancestry(item.item_type())?;

        if let Some(def) = catalog.registry.lookup(ancestry, name) {
            match def.gate() {
                Some(Condition::Requires(required)) => {
                    if !self.resolve_in(ctx, required)?.is_found() {
                        return Ok(Resolved::Missing);
                    }
                }
                Some(Condition::Check { args, check }) => {
                    let args = self.collect_args(ctx, args)?;
                    if !check(&args) {
                        return Ok(Resolved::Missing);
                    }
                }
                None => {}
            }
            let args = self.collect_args(ctx, def.arg_names())?;
            let path = ctx.path().to_string();
            let mut call = CalcCall {
                renderer: self,
                item: &item,
                path: &path,
                property: name,
                args,
            };
            return Ok(def.compute(&mut call)?.into());
        }

        if let Some(value) = item.property(name) {
            return Ok(Resolved::Found(self.stored(&item, name, value)?));
        }

        if let Some(reverse) = catalog.schema.reverse_spec(item.item_type(), name) {
            // Subtypes inherit the link field, so they belong to the collection.
            let source_types = catalog.schema.descendants(&reverse.source_type);
            let sources = self.facade.get_reverse_links(
                self.uow.edits(),
                self.uow.tier(),
                item.id(),
                &source_types,
                &reverse.field,
            )?;
            let mut out = Vec::with_capacity(sources.len());
            for source in sources {
                if source.is_deleted() || !self.policy.permits(self.principal(), &source) {
                    continue;
                }
                let info = catalog.schema.type_info(source.item_type())?;
                self.note_linked(source.id());
                out.push(Value::String(paths::canonical(info.collection(), source.id())));
            }
            return Ok(Resolved::Found(Value::Array(out)));
        }

        Ok(Resolved::Missing)
    }

    fn collect_args(
        &mut self,
        ctx: &mut EvalContext,
        names: &[String],
    ) -> Result<CalcArgs, TrellisError> {
        let mut args = CalcArgs::new();
        for name in names {
            if let Resolved::Found(value) = self.resolve_in(ctx, name)? {
                args.insert(name.clone(), value);
            }
        }
        Ok(args)
    }

    /// A stored value with link identifiers rewritten to canonical paths.
    fn stored(&mut self, item: &Item, name: &str, value: &Value) -> Result<Value, TrellisError> {
        let catalog = self.catalog;
        let Some(link) = catalog
            .schema
            .property_spec(item.item_type(), name)
            .and_then(|spec| spec.link.as_ref())
        else {
            return Ok(value.clone());
        };
        let collection = catalog.schema.type_info(&link.target)?.collection();
        Ok(match (link.cardinality, value) {
            (Cardinality::Many, Value::Array(values)) => Value::Array(
                values
                    .iter()
                    .map(|v| self.link_path(collection, v))
                    .collect(),
            ),
            (_, v) => self.link_path(collection, v),
        })
    }

    fn link_path(&mut self, collection: &str, value: &Value) -> Value {
        match ItemId::from_value(value) {
            Some(id) => {
                self.note_linked(id);
                Value::String(paths::canonical(collection, id))
            }
            None => value.clone(),
        }
    }
}

// =============================================================================
// CALC CALL
// =============================================================================

/// What a compute function sees: its resolved arguments and a handle for
/// sub-calls made on behalf of the item.
pub struct CalcCall<'c, 'r> {
    renderer: &'c mut Renderer<'r>,
    item: &'c Item,
    path: &'c str,
    property: &'c str,
    args: CalcArgs,
}

impl CalcCall<'_, '_> {
    /// A resolved argument; absent when it did not resolve.
    #[must_use]
    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }

    /// Every resolved argument.
    #[must_use]
    pub fn args(&self) -> &CalcArgs {
        &self.args
    }

    /// The item being evaluated.
    #[must_use]
    pub fn item(&self) -> &Item {
        self.item
    }

    /// Canonical path of the item; relative embeds resolve against it.
    #[must_use]
    pub fn path(&self) -> &str {
        self.path
    }

    /// Embed `relative` as the current identity.
    pub fn embed(&mut self, relative: &str) -> Result<Arc<Value>, TrellisError> {
        let principal = self.renderer.principal().clone();
        self.renderer.embed(self.path, relative, &principal)
    }

    /// Embed `relative` as another identity, bypassing the embed cache.
    pub fn embed_as(
        &mut self,
        relative: &str,
        principal: &Principal,
    ) -> Result<Arc<Value>, TrellisError> {
        self.renderer.embed(self.path, relative, principal)
    }

    /// Embed `relative`; `None` if it does not resolve.
    pub fn embed_optional(&mut self, relative: &str) -> Result<Option<Arc<Value>>, TrellisError> {
        self.renderer.embed_optional(self.path, relative)
    }

    /// Build the error a failing compute function returns.
    #[must_use]
    pub fn error(&self, message: impl Into<String>) -> TrellisError {
        TrellisError::Compute {
            property: self.property.to_string(),
            message: message.into(),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
