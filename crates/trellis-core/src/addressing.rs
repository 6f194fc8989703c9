//! # Addressing
//!
//! Path to item resolution plus the permission check.
//!
//! An item path is `/{collection}/{key}/` where `key` is either the item
//! identifier or the value of one of the unique keys the collection's type
//! declares. The item found must be of the collection's type or one of its
//! descendants.

use crate::schema::Schema;
use crate::session::{ReadTier, SessionEditLog};
use crate::storage::StorageFacade;
use crate::{Item, ItemId, Principal, TrellisError, paths};

/// Decides whether a principal may see an item.
pub trait AccessPolicy {
    /// Check if `principal` may see `item`.
    fn permits(&self, principal: &Principal, item: &Item) -> bool;
}

/// Lets everyone see everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAccess;

impl AccessPolicy for OpenAccess {
    fn permits(&self, _principal: &Principal, _item: &Item) -> bool {
        true
    }
}

/// Resolves item paths through the storage facade.
pub struct Addressing<'a> {
    schema: &'a Schema,
    facade: &'a StorageFacade,
    policy: &'a dyn AccessPolicy,
}

impl<'a> Addressing<'a> {
    /// Create a resolver.
    #[must_use]
    pub fn new(schema: &'a Schema, facade: &'a StorageFacade, policy: &'a dyn AccessPolicy) -> Self {
        Self {
            schema,
            facade,
            policy,
        }
    }

    /// Find the item at `path` and check that `principal` may see it.
    ///
    /// # Errors
    ///
    /// - `InvalidPath` if the path is not `/{collection}/{key}/`
    /// - `NotFound` if nothing (or more than one item) matches
    /// - `Forbidden` if the policy denies access
    pub fn locate(
        &self,
        edits: &SessionEditLog,
        tier: ReadTier,
        principal: &Principal,
        path: &str,
    ) -> Result<Item, TrellisError> {
        let segs = paths::segments(path);
        let [collection, key] = segs.as_slice() else {
            return Err(TrellisError::InvalidPath(format!(
                "expected /collection/key/, got {}",
                path
            )));
        };
        let Some(collection_type) = self.schema.type_for_collection(collection) else {
            return Err(TrellisError::NotFound(path.to_string()));
        };

        let mut found = None;
        if let Ok(id) = key.parse::<u64>() {
            found = self
                .facade
                .get_by_id(edits, tier, ItemId(id))?
                .filter(|item| self.schema.is_a(item.item_type(), collection_type));
        }
        if found.is_none() {
            for (namespace, _) in self.schema.unique_keys(collection_type) {
                let hit = self
                    .facade
                    .get_by_unique_key(edits, tier, &namespace, key)?
                    .filter(|item| self.schema.is_a(item.item_type(), collection_type));
                if hit.is_some() {
                    found = hit;
                    break;
                }
            }
        }

        let item = found.ok_or_else(|| TrellisError::NotFound(path.to_string()))?;
        if !self.policy.permits(principal, &item) {
            return Err(TrellisError::Forbidden(path.to_string()));
        }
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TypeInfo;
    use crate::session::Session;
    use crate::storage::{MemoryIndex, MemoryStore, NewItem};
    use crate::Properties;
    use serde_json::json;

    struct DenyAs;

    impl AccessPolicy for DenyAs {
        fn permits(&self, principal: &Principal, _item: &Item) -> bool {
            principal.is_default()
        }
    }

    fn setup() -> (Schema, StorageFacade) {
        let schema = Schema::new(vec![
            TypeInfo::new("Item", "items"),
            TypeInfo::new("Gene", "genes").parent("Item").unique_key("symbol"),
            TypeInfo::new("Lab", "labs"),
        ])
        .expect("schema");
        let mut facade = StorageFacade::new(MemoryStore::new(), MemoryIndex::new());
        let mut uow = Session::new().unit_of_work();
        let mut props = Properties::new();
        props.insert("symbol".to_string(), json!("ATF4"));
        facade
            .create(&schema, &mut uow, NewItem::new("Gene", props).with_id(ItemId(1)))
            .expect("create");
        (schema, facade)
    }

    #[test]
    fn locates_by_id_and_unique_key() {
        let (schema, facade) = setup();
        let addressing = Addressing::new(&schema, &facade, &OpenAccess);
        let edits = SessionEditLog::new();
        let tier = ReadTier::Authoritative;
        let who = Principal::Session;

        assert_eq!(addressing.locate(&edits, tier, &who, "/genes/1/").expect("id").id(), ItemId(1));
        assert_eq!(addressing.locate(&edits, tier, &who, "/genes/ATF4/").expect("key").id(), ItemId(1));
        assert_eq!(addressing.locate(&edits, tier, &who, "/items/1/").expect("ancestor").id(), ItemId(1));
    }

    #[test]
    fn wrong_collection_is_not_found() {
        let (schema, facade) = setup();
        let addressing = Addressing::new(&schema, &facade, &OpenAccess);
        let edits = SessionEditLog::new();
        let result = addressing.locate(&edits, ReadTier::Authoritative, &Principal::Session, "/labs/1/");
        assert!(matches!(result, Err(TrellisError::NotFound(_))));
        let result =
            addressing.locate(&edits, ReadTier::Authoritative, &Principal::Session, "/proteins/1/");
        assert!(matches!(result, Err(TrellisError::NotFound(_))));
    }

    #[test]
    fn denial_is_forbidden_not_not_found() {
        let (schema, facade) = setup();
        let addressing = Addressing::new(&schema, &facade, &DenyAs);
        let edits = SessionEditLog::new();
        let result = addressing.locate(
            &edits,
            ReadTier::Authoritative,
            &Principal::As("guest".to_string()),
            "/genes/1/",
        );
        assert!(matches!(result, Err(TrellisError::Forbidden(_))));
    }
}
