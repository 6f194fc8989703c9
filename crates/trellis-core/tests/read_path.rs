//! # Read Path Tests
//!
//! End-to-end behaviour of the resolver, the embedder, the embed cache and
//! the storage facade against a small genomics graph.
//!
//! ## Fixture
//! - Organism 1 `Homo sapiens`
//! - Lab 2
//! - Gene 3 `ATF4` (organism 1, lab 2), relabelled once at tid 6
//! - Gene 4 `XBP1` (organism 1, lab 99 which does not exist)
//! - Gene 5 (organism 1, status `deleted`)
//!
//! The Secondary Index is built through tid 6 before any test runs.

use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use trellis_core::{
    AccessPolicy, CacheSettings, CalculatedProperty, Catalog, EditLogEntry, Footprint, IndexStore,
    Indexer, Item, ItemId, ItemStore, MemoryIndex, MemoryStore, NewItem, OpenAccess, Principal,
    Properties, ReadTier, RegistryBuilder, RenderLimits, Rendered, Renderer, Resolved, Schema,
    Session, StorageFacade, Tid, TrellisError, TypeInfo,
};

// =============================================================================
// FIXTURE
// =============================================================================

const HUMAN: ItemId = ItemId(1);
const LAB: ItemId = ItemId(2);
const ATF4: ItemId = ItemId(3);
const XBP1: ItemId = ItemId(4);
const DELETED: ItemId = ItemId(5);

fn props(pairs: &[(&str, Value)]) -> Properties {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn schema() -> Schema {
    Schema::new(vec![
        TypeInfo::new("Item", "items"),
        TypeInfo::new("Organism", "organisms")
            .parent("Item")
            .unique_key("scientific_name")
            .reverse("genes", "Gene", "organism"),
        TypeInfo::new("Lab", "labs").parent("Item"),
        TypeInfo::new("Gene", "genes")
            .parent("Item")
            .unique_key("symbol")
            .required_link("organism", "Organism")
            .link("lab", "Lab")
            .embed("organism")
            .embed("lab"),
    ])
    .expect("schema")
}

fn display_name(calls: Arc<AtomicUsize>) -> CalculatedProperty {
    CalculatedProperty::new("Gene", "display_name", move |call| {
        calls.fetch_add(1, Ordering::SeqCst);
        let Some(label) = call.arg("label").and_then(Value::as_str).map(str::to_string) else {
            return Ok(None);
        };
        let Some(organism) = call
            .arg("organism")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            return Ok(Some(json!(label)));
        };
        let name = call.embed_optional(&organism)?.and_then(|o| {
            o.get("scientific_name")
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        Ok(Some(json!(match name {
            Some(name) => format!("{} ({})", label, name),
            None => label,
        })))
    })
    .args(["label", "organism"])
}

fn registry_builder(calls: Arc<AtomicUsize>, shout_calls: Arc<AtomicUsize>) -> RegistryBuilder {
    RegistryBuilder::new()
        .register(display_name(calls))
        .register(CalculatedProperty::new("Item", "title", |_| Ok(Some(json!("generic")))))
        .register(CalculatedProperty::new("Gene", "title", |call| {
            Ok(call.arg("symbol").cloned())
        }).args(["symbol"]))
        .register(
            CalculatedProperty::new("Gene", "received", |call| {
                Ok(Some(json!(call.args().keys().collect::<Vec<_>>())))
            })
            .args(["nickname", "symbol"])
            .define_only(),
        )
        .register(
            CalculatedProperty::new("Gene", "shout", move |call| {
                shout_calls.fetch_add(1, Ordering::SeqCst);
                Ok(call
                    .arg("nickname")
                    .and_then(Value::as_str)
                    .map(|n| json!(n.to_uppercase())))
            })
            .args(["nickname"])
            .requires("nickname"),
        )
}

struct World {
    catalog: Catalog,
    facade: StorageFacade,
    session: Session,
    calls: Arc<AtomicUsize>,
    shout_calls: Arc<AtomicUsize>,
}

fn world_with(settings: CacheSettings) -> World {
    let schema = schema();
    let calls = Arc::new(AtomicUsize::new(0));
    let shout_calls = Arc::new(AtomicUsize::new(0));
    let registry = registry_builder(Arc::clone(&calls), Arc::clone(&shout_calls))
        .build(&schema)
        .expect("registry");
    let catalog = Catalog::new(schema, registry);

    let mut facade = StorageFacade::new(MemoryStore::new(), MemoryIndex::new());
    let loader = Session::new();
    let mut uow = loader.unit_of_work();
    let schema = &catalog.schema;
    for item in [
        NewItem::new("Organism", props(&[("scientific_name", json!("Homo sapiens"))]))
            .with_id(HUMAN),
        NewItem::new("Lab", props(&[("name", json!("Walter lab"))])).with_id(LAB),
        NewItem::new(
            "Gene",
            props(&[
                ("symbol", json!("ATF4")),
                ("label", json!("atf4")),
                ("organism", json!(HUMAN.0)),
                ("lab", json!(LAB.0)),
            ]),
        )
        .with_id(ATF4),
        NewItem::new(
            "Gene",
            props(&[
                ("symbol", json!("XBP1")),
                ("label", json!("XBP1")),
                ("organism", json!(HUMAN.0)),
                ("lab", json!(99)),
            ]),
        )
        .with_id(XBP1),
        NewItem::new(
            "Gene",
            props(&[
                ("symbol", json!("OLD1")),
                ("organism", json!(HUMAN.0)),
                ("status", json!("deleted")),
            ]),
        )
        .with_id(DELETED),
    ] {
        facade.create(schema, &mut uow, item).expect("create");
    }
    facade
        .update(schema, &mut uow, ATF4, atf4_props("ATF4"), Some(Tid(3)))
        .expect("relabel");

    let report = Indexer::new(&catalog)
        .with_settings(settings.clone(), RenderLimits::default())
        .reindex_all(&mut facade)
        .expect("reindex");
    assert_eq!(report.indexed_through, Tid(6));

    World {
        catalog,
        facade,
        session: Session::with_settings(settings, RenderLimits::default()),
        calls,
        shout_calls,
    }
}

fn world() -> World {
    world_with(CacheSettings::default())
}

fn atf4_props(label: &str) -> Properties {
    props(&[
        ("symbol", json!("ATF4")),
        ("label", json!(label)),
        ("organism", json!(HUMAN.0)),
        ("lab", json!(LAB.0)),
    ])
}

fn fetch(world: &World, id: ItemId) -> Item {
    world
        .facade
        .authoritative()
        .get_by_id(id)
        .expect("get")
        .expect("present")
}

impl World {
    fn render(&mut self, path: &str) -> Result<Rendered, TrellisError> {
        self.render_with(&OpenAccess, path)
    }

    fn render_with(
        &mut self,
        policy: &dyn AccessPolicy,
        path: &str,
    ) -> Result<Rendered, TrellisError> {
        let mut uow = self.session.unit_of_work();
        let result = Renderer::new(&self.catalog, &self.facade, policy, &mut uow).render_path(path);
        self.session.complete(uow);
        result
    }

    fn write(&mut self, id: ItemId, properties: Properties) -> Item {
        let mut uow = self.session.unit_of_work();
        let item = self
            .facade
            .update(&self.catalog.schema, &mut uow, id, properties, None)
            .expect("update");
        self.session.complete(uow);
        item
    }
}

/// Counts how often one watched item passes the access check.
struct CountingPolicy {
    watched: ItemId,
    seen: AtomicUsize,
}

impl CountingPolicy {
    fn new(watched: ItemId) -> Self {
        Self {
            watched,
            seen: AtomicUsize::new(0),
        }
    }

    fn seen(&self) -> usize {
        self.seen.load(Ordering::SeqCst)
    }
}

impl AccessPolicy for CountingPolicy {
    fn permits(&self, _principal: &Principal, item: &Item) -> bool {
        if item.id() == self.watched {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
        true
    }
}

/// Hides labs from everyone.
struct NoLabs;

impl AccessPolicy for NoLabs {
    fn permits(&self, _principal: &Principal, item: &Item) -> bool {
        item.item_type().as_str() != "Lab"
    }
}

// =============================================================================
// PROPERTY RESOLVER
// =============================================================================

mod resolver {
    use super::*;

    /// Resolving the same attribute twice computes it once.
    #[test]
    fn resolution_is_idempotent_within_a_context() {
        let w = world();
        let gene = fetch(&w, ATF4);
        let mut uow = w.session.unit_of_work();
        let mut renderer = Renderer::new(&w.catalog, &w.facade, &OpenAccess, &mut uow);

        let before = w.calls.load(Ordering::SeqCst);
        let first = renderer.resolve(&gene, "display_name").expect("first");
        let second = renderer.resolve(&gene, "display_name").expect("second");

        assert_eq!(first, second);
        assert_eq!(first, Resolved::Found(json!("ATF4 (Homo sapiens)")));
        assert_eq!(w.calls.load(Ordering::SeqCst) - before, 1);
    }

    /// A subtype's definition wins over its ancestor's.
    #[test]
    fn subtype_definition_overrides_ancestor() {
        let w = world();
        let gene = fetch(&w, ATF4);
        let lab = fetch(&w, LAB);
        let mut uow = w.session.unit_of_work();
        let mut renderer = Renderer::new(&w.catalog, &w.facade, &OpenAccess, &mut uow);

        assert_eq!(
            renderer.resolve(&gene, "title").expect("gene"),
            Resolved::Found(json!("ATF4"))
        );
        assert_eq!(
            renderer.resolve(&lab, "title").expect("lab"),
            Resolved::Found(json!("generic"))
        );
    }

    /// An unresolvable argument is left out; the function still runs.
    #[test]
    fn missing_argument_is_omitted_not_fatal() {
        let w = world();
        let gene = fetch(&w, ATF4);
        let mut uow = w.session.unit_of_work();
        let mut renderer = Renderer::new(&w.catalog, &w.facade, &OpenAccess, &mut uow);

        assert_eq!(
            renderer.resolve(&gene, "received").expect("resolve"),
            Resolved::Found(json!(["symbol"]))
        );
    }

    /// A condition requiring the missing argument short-circuits the call.
    #[test]
    fn requires_condition_gates_the_call() {
        let w = world();
        let gene = fetch(&w, ATF4);
        let mut uow = w.session.unit_of_work();
        let mut renderer = Renderer::new(&w.catalog, &w.facade, &OpenAccess, &mut uow);

        let before = w.shout_calls.load(Ordering::SeqCst);
        assert_eq!(renderer.resolve(&gene, "shout").expect("resolve"), Resolved::Missing);
        assert_eq!(w.shout_calls.load(Ordering::SeqCst), before);

        let shouted = renderer
            .resolve_with(&gene, "shout", [("nickname".to_string(), json!("stress"))])
            .expect("override");
        assert_eq!(shouted, Resolved::Found(json!("STRESS")));
    }

    /// Define-only properties resolve but never show up in views.
    #[test]
    fn define_only_hidden_from_views() {
        let mut w = world();
        let view = w.render("/genes/3/").expect("render");
        assert!(view.value.get("received").is_none());
        assert!(view.value.get("shout").is_none());
        assert_eq!(view.value["title"], json!("ATF4"));
    }

    /// Reverse collections list linking items, minus deleted ones.
    #[test]
    fn reverse_collection_skips_deleted() {
        let mut w = world();
        let view = w.render("/organisms/1/").expect("render");
        assert_eq!(view.value["genes"], json!(["/genes/3/", "/genes/4/"]));
        assert!(view.footprint.linked.contains(&ATF4));
        assert!(!view.footprint.linked.contains(&DELETED));
    }
}

// =============================================================================
// SUB-CALL EMBEDDER
// =============================================================================

mod embedder {
    use super::*;

    /// Scenario A: a calculated property reads through a link.
    #[test]
    fn display_name_embeds_organism() {
        let mut w = world();
        let view = w.render("/genes/3/@@embedded").expect("render");

        assert_eq!(view.value["display_name"], json!("ATF4 (Homo sapiens)"));
        assert_eq!(view.value["organism"]["scientific_name"], json!("Homo sapiens"));
        assert_eq!(view.value["organism"]["@id"], json!("/organisms/1/"));
        assert!(view.footprint.embedded.contains(&HUMAN));
        assert!(view.footprint.embedded.contains(&ATF4));
    }

    /// Two embeds of one path never share mutable state.
    #[test]
    fn cached_results_do_not_alias() {
        let w = world();
        let mut uow = w.session.unit_of_work();
        {
            let mut renderer = Renderer::new(&w.catalog, &w.facade, &OpenAccess, &mut uow);
            let first = renderer.embed("/", "/genes/3/", &Principal::Session).expect("first");
            let mut second = renderer.embed("/", "/genes/3/", &Principal::Session).expect("second");
            Arc::make_mut(&mut second)["label"] = json!("mutated");

            assert_eq!(first["label"], json!("ATF4"));
            assert_eq!(second["label"], json!("mutated"));
            let third = renderer.embed("/", "/genes/3/", &Principal::Session).expect("third");
            assert_eq!(third["label"], json!("ATF4"));
        }
        let stats = uow.cache_stats().expect("cache used");
        assert_eq!(stats.hits, 2);
    }

    /// A hit carries the footprint recorded when the entry was built.
    #[test]
    fn cache_hit_propagates_footprint() {
        let w = world();
        let mut uow = w.session.unit_of_work();
        let mut renderer = Renderer::new(&w.catalog, &w.facade, &OpenAccess, &mut uow);

        let first = renderer.render_path("/genes/3/@@embedded").expect("first");
        let second = renderer.render_path("/genes/3/@@embedded").expect("second");
        assert_eq!(first.footprint, second.footprint);
        assert!(second.footprint.embedded.contains(&HUMAN));
    }

    /// Relative paths resolve against the base item.
    #[test]
    fn relative_embed_paths() {
        let w = world();
        let mut uow = w.session.unit_of_work();
        let mut renderer = Renderer::new(&w.catalog, &w.facade, &OpenAccess, &mut uow);

        let raw = renderer
            .embed("/genes/3/", "@@raw", &Principal::Session)
            .expect("raw");
        assert_eq!(raw["organism"], json!(1));
        let lab = renderer
            .embed("/genes/3/", "../../labs/2/", &Principal::Session)
            .expect("lab");
        assert_eq!(lab["name"], json!("Walter lab"));
        let escape = renderer.embed("/genes/3/", "../../../x/", &Principal::Session);
        assert!(matches!(escape, Err(TrellisError::InvalidPath(_))));
    }

    /// An optional link to nothing disappears from the embedded view.
    #[test]
    fn optional_missing_link_is_omitted() {
        let mut w = world();
        let object = w.render("/genes/4/").expect("object");
        assert_eq!(object.value["lab"], json!("/labs/99/"));

        let embedded = w.render("/genes/4/@@embedded").expect("embedded");
        assert!(embedded.value.get("lab").is_none());
        assert_eq!(embedded.value["organism"]["uuid"], json!(1));
    }

    /// A missing top-level target is NotFound.
    #[test]
    fn missing_top_level_is_not_found() {
        let mut w = world();
        assert!(matches!(w.render("/genes/77/"), Err(TrellisError::NotFound(_))));
        assert!(matches!(w.render("/proteins/1/"), Err(TrellisError::NotFound(_))));
    }

    /// Forbidden is never downgraded to an omitted field.
    #[test]
    fn forbidden_link_fails_the_render() {
        let mut w = world();
        let result = w.render_with(&NoLabs, "/genes/3/@@embedded");
        assert!(matches!(result, Err(TrellisError::Forbidden(_))));
        let result = w.render_with(&NoLabs, "/labs/2/");
        assert!(matches!(result, Err(TrellisError::Forbidden(_))));
    }

    /// Items can be addressed by a declared unique key.
    #[test]
    fn unique_key_addressing() {
        let mut w = world();
        let view = w.render("/genes/ATF4/").expect("by symbol");
        assert_eq!(view.value["@id"], json!("/genes/3/"));
        let view = w.render("/organisms/Homo sapiens/").expect("by name");
        assert_eq!(view.value["uuid"], json!(1));
        let view = w.render("/items/3/").expect("by ancestor collection");
        assert_eq!(view.value["@type"], json!(["Gene", "Item"]));
    }
}

// =============================================================================
// EMBED CACHE
// =============================================================================

mod embed_cache {
    use super::*;

    fn embed_sequence(capacity: usize) -> (usize, u64) {
        let w = world_with(CacheSettings::with_embed_capacity(capacity));
        let policy = CountingPolicy::new(HUMAN);
        let mut uow = w.session.unit_of_work();
        {
            let mut renderer = Renderer::new(&w.catalog, &w.facade, &policy, &mut uow);
            for path in ["/organisms/1/", "/labs/2/", "/organisms/1/"] {
                renderer.embed("/", path, &Principal::Session).expect("embed");
            }
        }
        let evictions = uow.cache_stats().expect("cache used").evictions;
        (policy.seen(), evictions)
    }

    /// Scenario C: capacity 1 recomputes P1 after P2 evicted it.
    #[test]
    fn capacity_one_recomputes_evicted_path() {
        let (seen, evictions) = embed_sequence(1);
        assert_eq!(seen, 2);
        assert_eq!(evictions, 2);
    }

    /// With room for both, P1 is served from the cache the second time.
    #[test]
    fn capacity_two_serves_from_cache() {
        let (seen, evictions) = embed_sequence(2);
        assert_eq!(seen, 1);
        assert_eq!(evictions, 0);
    }

    /// A new unit of work starts with an empty cache.
    #[test]
    fn cache_does_not_outlive_unit_of_work() {
        let w = world();
        let mut uow = w.session.unit_of_work();
        Renderer::new(&w.catalog, &w.facade, &OpenAccess, &mut uow)
            .render_path("/labs/2/")
            .expect("render");
        assert!(!uow.embed_cache().is_empty());
        let log = uow.finish();

        let mut fresh = w.session.unit_of_work();
        assert!(fresh.cache_stats().is_none());
        assert!(fresh.embed_cache().is_empty());
        assert!(log.is_empty());
    }
}

// =============================================================================
// STORAGE FACADE
// =============================================================================

mod facade {
    use super::*;
    use trellis_core::{IndexedRecord, ItemWrite, PropertySheet, SessionEditLog, TypeName};

    fn thing(id: u64, source: &str, reference: Option<u64>) -> ItemWrite {
        let mut properties = props(&[("source", json!(source))]);
        let mut links = Vec::new();
        if let Some(target) = reference {
            properties.insert("ref".to_string(), json!(target));
            links.push(("ref".to_string(), ItemId(target)));
        }
        ItemWrite {
            id: ItemId(id),
            item_type: TypeName::new("Thing"),
            properties,
            keys: Vec::new(),
            links,
        }
    }

    fn record(write: ItemWrite, tid: u64, embedded: &[u64], linked: &[u64]) -> IndexedRecord {
        let mut properties = write.properties.clone();
        properties.insert("source".to_string(), json!("index"));
        IndexedRecord {
            item: Item::new(
                write.id,
                write.item_type.clone(),
                PropertySheet::new(Tid(tid), properties),
            ),
            indexed_tid: Tid(tid),
            footprint: Footprint {
                embedded: embedded.iter().map(|&i| ItemId(i)).collect(),
                linked: linked.iter().map(|&i| ItemId(i)).collect(),
            },
            keys: write.keys,
            links: write.links,
        }
    }

    fn source(item: &Item) -> &str {
        item.property("source").and_then(Value::as_str).unwrap_or_default()
    }

    /// A write at tid 5 invalidates only records whose footprint it touches.
    #[test]
    fn invalidation_is_monotone_and_targeted() {
        let schema = Schema::new(vec![TypeInfo::new("Thing", "things").link("ref", "Thing")])
            .expect("schema");
        let mut store = MemoryStore::new();
        let mut index = MemoryIndex::new();
        let a = thing(1, "store", None);
        let b = thing(2, "store", Some(1));
        let c = thing(3, "store", None);
        let d = thing(4, "store", None);
        for w in [a.clone(), b.clone(), c.clone(), d] {
            store.put(w).expect("put");
        }
        index.put(record(a, 4, &[1], &[])).expect("index");
        index.put(record(b, 4, &[2], &[1])).expect("index");
        index.put(record(c, 4, &[3], &[])).expect("index");
        let mut facade = StorageFacade::new(store, index);

        let mut session = Session::new();
        let mut uow = session.unit_of_work();
        let written = facade
            .update(&schema, &mut uow, ItemId(1), props(&[("source", json!("store"))]), None)
            .expect("update");
        assert_eq!(written.tid(), Tid(5));
        session.complete(uow);
        let edits = session.edits();

        let b = facade.get_by_id(edits, ReadTier::Indexed, ItemId(2)).expect("b").expect("b");
        assert_eq!(source(&b), "store");
        let c = facade.get_by_id(edits, ReadTier::Indexed, ItemId(3)).expect("c").expect("c");
        assert_eq!(source(&c), "index");
        let c = facade
            .get_by_id(edits, ReadTier::Authoritative, ItemId(3))
            .expect("c")
            .expect("c");
        assert_eq!(source(&c), "store");
        let d = facade.get_by_id(edits, ReadTier::Indexed, ItemId(4)).expect("d").expect("d");
        assert_eq!(source(&d), "store", "index miss falls back");
    }

    /// With nothing written, the index answers even when it lags.
    #[test]
    fn empty_log_trusts_the_index() {
        let mut store = MemoryStore::new();
        let mut index = MemoryIndex::new();
        let a = thing(1, "store", None);
        store.put(a.clone()).expect("put");
        store.put(a.clone()).expect("newer version");
        index.put(record(a, 1, &[1], &[])).expect("index");
        let facade = StorageFacade::new(store, index);

        let a = facade
            .get_by_id(&SessionEditLog::new(), ReadTier::Indexed, ItemId(1))
            .expect("a")
            .expect("a");
        assert_eq!(a.tid(), Tid(1));
        assert_eq!(source(&a), "index");
    }

    /// Scenario B: a session reads its own write of A back at tid 7.
    #[test]
    fn own_write_is_read_back() {
        let mut w = world();
        let indexed = w.facade.index().get_by_id(ATF4).expect("get").expect("indexed");
        assert_eq!(indexed.item.tid(), Tid(6));

        let written = w.write(ATF4, atf4_props("ATF4 (activating transcription factor 4)"));
        assert_eq!(written.tid(), Tid(7));

        let read = w
            .facade
            .get_by_id(w.session.edits(), ReadTier::Indexed, ATF4)
            .expect("get")
            .expect("present");
        assert_eq!(read.tid(), Tid(7));

        let view = w.render("/genes/3/").expect("render");
        assert_eq!(
            view.value["display_name"],
            json!("ATF4 (activating transcription factor 4) (Homo sapiens)")
        );
    }

    /// A new linking item shows up in the target's reverse collection.
    #[test]
    fn reverse_scan_sees_own_writes() {
        let mut w = world();
        let mut uow = w.session.unit_of_work();
        w.facade
            .create(
                &w.catalog.schema,
                &mut uow,
                NewItem::new(
                    "Gene",
                    props(&[("symbol", json!("DDIT3")), ("organism", json!(HUMAN.0))]),
                )
                .with_id(ItemId(6)),
            )
            .expect("create");
        w.session.complete(uow);

        let view = w.render("/organisms/1/").expect("render");
        assert_eq!(view.value["genes"], json!(["/genes/3/", "/genes/4/", "/genes/6/"]));
    }

    /// A renamed unique key is looked up in the store, not the stale index.
    #[test]
    fn renamed_key_not_served_from_index() {
        let mut w = world();
        w.write(
            HUMAN,
            props(&[("scientific_name", json!("Homo sapiens sapiens"))]),
        );
        assert!(matches!(
            w.render("/organisms/Homo sapiens/"),
            Err(TrellisError::NotFound(_))
        ));
        let view = w.render("/organisms/Homo sapiens sapiens/").expect("renamed");
        assert_eq!(view.value["uuid"], json!(1));
    }

    /// Each commit logs the written item and its link targets.
    #[test]
    fn edit_entry_covers_old_and_new_targets() {
        let mut w = world();
        let mut moved = atf4_props("ATF4");
        moved.insert("lab".to_string(), json!(XBP1.0));
        w.write(ATF4, moved);

        let entry: &EditLogEntry = w.session.edits().entries().last().expect("entry");
        assert!(entry.changed.contains(&ATF4));
        assert!(entry.changed.contains(&LAB));
        assert!(entry.changed.contains(&XBP1));
        assert!(entry.changed.contains(&HUMAN));
        assert_eq!(entry.linked_changed.len(), 1);
    }
}

// =============================================================================
// SESSIONS
// =============================================================================

mod sessions {
    use super::*;

    /// A conflicting write is retried in a fresh unit of work.
    #[test]
    fn run_retries_on_conflict() {
        let mut w = world();
        let mut attempts = 0;
        let catalog = &w.catalog;
        let facade = &mut w.facade;
        let item = w
            .session
            .run(3, |uow| {
                attempts += 1;
                let expected = if attempts == 1 {
                    Tid(3)
                } else {
                    facade
                        .authoritative()
                        .get_by_id(ATF4)?
                        .map(|i| i.tid())
                        .unwrap_or_default()
                };
                facade.update(&catalog.schema, uow, ATF4, atf4_props("retried"), Some(expected))
            })
            .expect("second attempt");

        assert_eq!(attempts, 2);
        assert_eq!(item.tid(), Tid(7));
        assert_eq!(w.session.edits().len(), 1);
    }

    /// Writes from overlapping units of work all stay visible afterwards.
    #[test]
    fn overlapping_units_keep_read_your_writes() {
        let mut w = world();
        let mut first = w.session.unit_of_work();
        let mut second = w.session.unit_of_work();
        w.facade
            .update(
                &w.catalog.schema,
                &mut first,
                LAB,
                props(&[("name", json!("Ron lab"))]),
                None,
            )
            .expect("update lab");
        w.facade
            .update(&w.catalog.schema, &mut second, ATF4, atf4_props("late"), None)
            .expect("update gene");
        w.session.complete(first);
        w.session.complete(second);

        let tids: Vec<_> = w.session.edits().entries().iter().map(|e| e.tid).collect();
        assert_eq!(tids, vec![Tid(7), Tid(8)]);

        // Both index records predate the writes and must be bypassed.
        assert_eq!(w.render("/labs/2/").expect("lab").value["name"], json!("Ron lab"));
        assert_eq!(w.render("/genes/3/").expect("gene").value["label"], json!("late"));
    }

    /// Entries the index has caught up with are pruned.
    #[test]
    fn prune_after_reindex_restores_index_reads() {
        let mut w = world();
        w.write(LAB, props(&[("name", json!("Ron lab"))]));
        assert_eq!(w.session.edits().len(), 1);

        Indexer::new(&w.catalog)
            .reindex_all(&mut w.facade)
            .expect("reindex");
        let through = w.facade.index().indexed_through().expect("watermark");
        assert_eq!(w.session.prune_edits(through), 1);
        assert!(w.session.edits().is_empty());

        let view = w.render("/labs/2/").expect("render");
        assert_eq!(view.value["name"], json!("Ron lab"));
    }

    /// Compute errors abort the render instead of vanishing.
    #[test]
    fn compute_error_aborts_render() {
        let schema = Schema::new(vec![TypeInfo::new("Lab", "labs")]).expect("schema");
        let registry = RegistryBuilder::new()
            .register(CalculatedProperty::new("Lab", "budget", |call| {
                Err(call.error("ledger unavailable"))
            }))
            .build(&schema)
            .expect("registry");
        let catalog = Catalog::new(schema, registry);
        let mut facade = StorageFacade::new(MemoryStore::new(), MemoryIndex::new());
        let session = Session::new();
        let mut uow = session.unit_of_work();
        facade
            .create(&catalog.schema, &mut uow, NewItem::new("Lab", Properties::new()))
            .expect("create");

        let result = Renderer::new(&catalog, &facade, &OpenAccess, &mut uow).render_path("/labs/1/");
        assert!(matches!(result, Err(TrellisError::Compute { .. })));
        assert_eq!(facade.authoritative().current_tid().expect("tid"), Tid(1));
    }
}

// =============================================================================
// REVERSE COLLECTIONS
// =============================================================================

mod reverse {
    use super::*;
    use trellis_core::{SessionEditLog, TypeName};

    fn lab_world() -> (Catalog, StorageFacade) {
        let schema = Schema::new(vec![
            TypeInfo::new("Lab", "labs").reverse("datasets", "Dataset", "lab"),
            TypeInfo::new("Dataset", "datasets").link("lab", "Lab"),
            TypeInfo::new("Experiment", "experiments").parent("Dataset"),
        ])
        .expect("schema");
        let registry = RegistryBuilder::new().build(&schema).expect("registry");
        let catalog = Catalog::new(schema, registry);

        let mut facade = StorageFacade::new(MemoryStore::new(), MemoryIndex::new());
        let mut uow = Session::new().unit_of_work();
        for item in [
            NewItem::new("Lab", Properties::new()).with_id(ItemId(1)),
            NewItem::new("Dataset", props(&[("lab", json!(1))])).with_id(ItemId(2)),
            NewItem::new("Experiment", props(&[("lab", json!(1))])).with_id(ItemId(3)),
        ] {
            facade.create(&catalog.schema, &mut uow, item).expect("create");
        }
        Indexer::new(&catalog)
            .reindex_all(&mut facade)
            .expect("reindex");
        (catalog, facade)
    }

    /// Items of a subtype linking through the inherited field are members.
    #[test]
    fn subtype_sources_join_the_collection() {
        let (catalog, facade) = lab_world();
        for tier in [ReadTier::Indexed, ReadTier::Authoritative] {
            let mut uow = Session::new().unit_of_work().with_tier(tier);
            let view = Renderer::new(&catalog, &facade, &OpenAccess, &mut uow)
                .render_path("/labs/1/")
                .expect("render");
            assert_eq!(
                view.value["datasets"],
                json!(["/datasets/2/", "/experiments/3/"]),
                "tier {:?}",
                tier
            );
            assert!(view.footprint.linked.contains(&ItemId(3)));
        }
    }

    /// A collection declared on the subtype leaves the parent type out.
    #[test]
    fn parent_sources_stay_out_of_a_subtype_scan() {
        let (_, facade) = lab_world();
        let hits = facade
            .get_reverse_links(
                &SessionEditLog::new(),
                ReadTier::Indexed,
                ItemId(1),
                &[TypeName::new("Experiment")],
                "lab",
            )
            .expect("scan");
        assert_eq!(hits.iter().map(Item::id).collect::<Vec<_>>(), vec![ItemId(3)]);
    }
}

// =============================================================================
// DECLARATIVE SCHEMA DOCUMENTS
// =============================================================================

mod declarative {
    use super::*;
    use trellis_core::SchemaDocument;

    fn document() -> SchemaDocument {
        serde_json::from_value(json!({
            "types": [
                {
                    "name": "Organism",
                    "unique_keys": ["scientific_name"],
                    "reverse": { "genes": { "source_type": "Gene", "field": "organism" } },
                    "calculated": [
                        { "kind": "count", "name": "gene_count", "of": "genes" }
                    ]
                },
                {
                    "name": "Gene",
                    "properties": { "organism": { "link_to": "Organism", "required": true } },
                    "embedded": ["organism"],
                    "calculated": [
                        {
                            "kind": "template",
                            "name": "display_name",
                            "template": "{label} ({organism.scientific_name})",
                            "requires": "label"
                        }
                    ]
                }
            ]
        }))
        .expect("document")
    }

    /// Template and count properties compile from a document.
    #[test]
    fn document_properties_render() {
        let catalog = Catalog::from_document(&document(), RegistryBuilder::new()).expect("catalog");
        let mut facade = StorageFacade::new(MemoryStore::new(), MemoryIndex::new());
        let session = Session::new();
        let mut uow = session.unit_of_work();
        for item in [
            NewItem::new("Organism", props(&[("scientific_name", json!("Mus musculus"))])),
            NewItem::new("Gene", props(&[("label", json!("Atf4")), ("organism", json!(1))])),
            NewItem::new("Gene", props(&[("organism", json!(1))])),
        ] {
            facade.create(&catalog.schema, &mut uow, item).expect("create");
        }

        let mut renderer = Renderer::new(&catalog, &facade, &OpenAccess, &mut uow);
        let gene = renderer.render_path("/genes/2/@@embedded").expect("gene");
        assert_eq!(gene.value["display_name"], json!("Atf4 (Mus musculus)"));
        assert!(gene.footprint.embedded.contains(&ItemId(1)));

        let unlabelled = renderer.render_path("/genes/3/").expect("unlabelled");
        assert!(unlabelled.value.get("display_name").is_none());

        let organism = renderer.render_path("/organisms/1/").expect("organism");
        assert_eq!(organism.value["gene_count"], json!(2));
    }
}
