//! Resolving request paths to calendar resources.
//!
//! [`resolve`] walks a normalized path against the store and produces a
//! [`ResourceRef`]: what kind of thing lives at the path, whether it exists,
//! and the store objects that were fetched along the way.
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::store::{join_path, CalCollection, CalEvent, CalResource, CalStore, Principal};
use crate::DavResult;

/// What the caller expects about the existence of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Existence {
    MustExist,
    MustNotExist,
    MayExist,
}

/// Type hint from the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Principal,
    Collection,
    Entity,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Principal,
    Collection,
    Component,
    BinaryResource,
}

/// The store object behind a resource.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    None,
    Event(CalEvent),
    Resource(CalResource),
    Principal(Principal),
}

/// Objects the caller already has, e.g. from a collection listing.
#[derive(Debug, Clone, Default)]
pub struct Prefetched {
    pub collection: Option<CalCollection>,
    pub event: Option<CalEvent>,
    pub resource: Option<CalResource>,
}

/// The resolved identity of a path.
#[derive(Debug, Clone)]
pub struct ResourceRef {
    pub path: DavPath,
    pub kind: ResourceKind,
    pub exists: bool,
    /// Leaf name of an entity.
    pub entity_name: Option<String>,
    /// The collection itself for collections, the owning collection otherwise.
    pub collection: Option<CalCollection>,
    /// Parent of a collection that is about to be created.
    pub parent: Option<CalCollection>,
    pub payload: Payload,
}

impl ResourceRef {
    fn collection(path: &DavPath, col: CalCollection, exists: bool, parent: Option<CalCollection>) -> ResourceRef {
        ResourceRef {
            path: path.clone(),
            kind: ResourceKind::Collection,
            exists,
            entity_name: None,
            collection: Some(col),
            parent,
            payload: Payload::None,
        }
    }

    fn entity(path: &DavPath, kind: ResourceKind, col: Option<CalCollection>, name: &str, payload: Payload) -> ResourceRef {
        ResourceRef {
            path: path.clone(),
            kind,
            exists: false,
            entity_name: Some(name.to_string()),
            collection: col,
            parent: None,
            payload,
        }
    }

    fn from_prefetched(path: &DavPath, pre: Prefetched) -> Option<ResourceRef> {
        if let Some(ev) = pre.event {
            let name = ev.name.clone();
            let mut r = ResourceRef::entity(path, ResourceKind::Component, pre.collection, &name, Payload::Event(ev));
            r.exists = true;
            return Some(r);
        }
        if let Some(res) = pre.resource {
            let name = res.name.clone();
            let mut r = ResourceRef::entity(
                path,
                ResourceKind::BinaryResource,
                pre.collection,
                &name,
                Payload::Resource(res),
            );
            r.exists = true;
            return Some(r);
        }
        pre.collection
            .map(|col| ResourceRef::collection(path, col, true, None))
    }
}

/// Resolve `path` to a resource.
///
/// Fails with `NotFound` when `existence` is `MustExist` and nothing is
/// there; a successful `MustExist` resolution always has `exists == true`.
pub async fn resolve(
    store: &dyn CalStore,
    path: &DavPath,
    existence: Existence,
    hint: NodeType,
    prefetched: Option<Prefetched>,
) -> DavResult<ResourceRef>
{
    if let Some(r) = prefetched.and_then(|pre| ResourceRef::from_prefetched(path, pre)) {
        return Ok(r);
    }
    let p = path.as_str();

    let is_principal = store.is_principal(p).await?;
    if hint == NodeType::Principal || is_principal {
        if !is_principal {
            debug!("resolve: {p} is not a principal");
            return Err(DavError::NotFound);
        }
        let principal = store.get_principal(p).await?;
        if principal.is_none() && existence == Existence::MustExist {
            return Err(DavError::NotFound);
        }
        return Ok(ResourceRef {
            path: path.clone(),
            kind: ResourceKind::Principal,
            exists: principal.is_some(),
            entity_name: None,
            collection: None,
            parent: None,
            payload: principal.map_or(Payload::None, Payload::Principal),
        });
    }

    if hint == NodeType::Unknown && existence != Existence::MustExist {
        return Err(DavError::ServerError(format!("cannot resolve {p}: unknown type")));
    }

    if matches!(hint, NodeType::Collection | NodeType::Unknown) {
        if let Some(col) = store.get_collection(p).await? {
            if existence == Existence::MustNotExist {
                return Err(DavError::Forbidden(None));
            }
            return Ok(ResourceRef::collection(path, col, true, None));
        }
        if hint == NodeType::Collection && existence == Existence::MustExist {
            return Err(DavError::NotFound);
        }
    }

    let (parent_path, leaf) = path
        .split()
        .ok_or_else(|| DavError::BadRequest(format!("no entity name in {p}")))?;
    let parent = match store.get_collection(parent_path.as_str()).await? {
        Some(c) => c,
        None if hint == NodeType::Collection => return Err(DavError::Conflict),
        None => return Err(DavError::NotFound),
    };

    if hint == NodeType::Collection {
        let mut col = store.new_collection_object(false, &parent.path).await?;
        col.name = leaf.to_string();
        col.path = join_path(&parent.path, leaf);
        col.parent_path = Some(parent.path.clone());
        debug!("resolve: new collection {}", col.path);
        return Ok(ResourceRef::collection(path, col, false, Some(parent)));
    }

    if parent.cal_type.holds_components() {
        let lookup = if parent.is_alias() {
            store.resolve_alias(&parent).await?
        } else {
            None
        };
        let ev = store.get_event(lookup.as_ref().unwrap_or(&parent), leaf).await?;
        if ev.is_none() && existence == Existence::MustExist {
            return Err(DavError::NotFound);
        }
        let exists = ev.is_some();
        let payload = ev.map_or(Payload::None, Payload::Event);
        let mut r = ResourceRef::entity(path, ResourceKind::Component, Some(parent), leaf, payload);
        r.exists = exists;
        return Ok(r);
    }

    match store.get_file(&parent, leaf).await? {
        Some(res) => {
            let mut r = ResourceRef::entity(
                path,
                ResourceKind::BinaryResource,
                Some(parent),
                leaf,
                Payload::Resource(res),
            );
            r.exists = true;
            Ok(r)
        }
        None if existence == Existence::MustExist => Err(DavError::NotFound),
        None => {
            let mut res = store.new_resource_object(&parent.path).await?;
            res.name = leaf.to_string();
            res.content_type = path.get_mime_type_str().to_string();
            Ok(ResourceRef::entity(
                path,
                ResourceKind::BinaryResource,
                Some(parent),
                leaf,
                Payload::Resource(res),
            ))
        }
    }
}

#[cfg(all(test, feature = "memstore"))]
mod tests {
    use super::*;
    use crate::memstore::MemStore;

    fn path(p: &str) -> DavPath {
        DavPath::normalize(p).unwrap()
    }

    async fn setup() -> Box<MemStore> {
        let store = MemStore::new();
        store.add_user("alice");
        store
    }

    #[tokio::test]
    async fn collection_before_entity() {
        let store = setup().await;
        let r = resolve(&*store, &path("/user/alice/calendar"), Existence::MustExist, NodeType::Unknown, None)
            .await
            .unwrap();
        assert_eq!(r.kind, ResourceKind::Collection);
        assert!(r.exists);
        assert!(r.entity_name.is_none());
    }

    #[tokio::test]
    async fn must_exist_never_returns_missing() {
        let store = setup().await;
        for hint in [NodeType::Unknown, NodeType::Entity, NodeType::Collection] {
            let r = resolve(&*store, &path("/user/alice/calendar/nope.ics"), Existence::MustExist, hint, None).await;
            assert!(matches!(r, Err(DavError::NotFound)), "{hint:?}");
        }
        let r = resolve(&*store, &path("/nothere/x.ics"), Existence::MustExist, NodeType::Entity, None).await;
        assert!(matches!(r, Err(DavError::NotFound)));
    }

    #[tokio::test]
    async fn component_placeholder() {
        let store = setup().await;
        let r = resolve(&*store, &path("/user/alice/calendar/new.ics"), Existence::MayExist, NodeType::Entity, None)
            .await
            .unwrap();
        assert_eq!(r.kind, ResourceKind::Component);
        assert!(!r.exists);
        assert_eq!(r.entity_name.as_deref(), Some("new.ics"));
        assert_eq!(r.payload, Payload::None);
        assert_eq!(r.collection.map(|c| c.path), Some("/user/alice/calendar".to_string()));
    }

    #[tokio::test]
    async fn binary_placeholder() {
        let store = setup().await;
        let r = resolve(&*store, &path("/user/alice/notes.txt"), Existence::MayExist, NodeType::Entity, None)
            .await
            .unwrap();
        assert_eq!(r.kind, ResourceKind::BinaryResource);
        assert!(!r.exists);
        match r.payload {
            Payload::Resource(res) => {
                assert!(res.is_new);
                assert_eq!(res.name, "notes.txt");
                assert_eq!(res.content_type, "text/plain");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn new_collection() {
        let store = setup().await;
        let r = resolve(&*store, &path("/user/alice/cal2"), Existence::MustNotExist, NodeType::Collection, None)
            .await
            .unwrap();
        assert_eq!(r.kind, ResourceKind::Collection);
        assert!(!r.exists);
        let col = r.collection.unwrap();
        assert_eq!(col.path, "/user/alice/cal2");
        assert_eq!(col.name, "cal2");
        assert_eq!(r.parent.map(|p| p.path), Some("/user/alice".to_string()));

        let r = resolve(&*store, &path("/user/alice/calendar"), Existence::MustNotExist, NodeType::Collection, None).await;
        assert!(matches!(r, Err(DavError::Forbidden(None))));
        let r = resolve(&*store, &path("/user/bob/cal"), Existence::MustNotExist, NodeType::Collection, None).await;
        assert!(matches!(r, Err(DavError::Conflict)));
    }

    #[tokio::test]
    async fn principals() {
        let store = setup().await;
        let r = resolve(&*store, &path("/principals/users/alice"), Existence::MustExist, NodeType::Unknown, None)
            .await
            .unwrap();
        assert_eq!(r.kind, ResourceKind::Principal);
        assert!(r.collection.is_none() && r.entity_name.is_none());

        let r = resolve(&*store, &path("/principals/users/bob"), Existence::MustExist, NodeType::Unknown, None).await;
        assert!(matches!(r, Err(DavError::NotFound)));
        let r = resolve(&*store, &path("/user/alice"), Existence::MustExist, NodeType::Principal, None).await;
        assert!(matches!(r, Err(DavError::NotFound)));
    }

    #[tokio::test]
    async fn unknown_hint_must_exist() {
        let store = setup().await;
        let r = resolve(&*store, &path("/user/alice/x.ics"), Existence::MayExist, NodeType::Unknown, None).await;
        assert!(matches!(r, Err(DavError::ServerError(_))));
    }

    #[tokio::test]
    async fn root_has_no_leaf() {
        let store = MemStore::new();
        let r = resolve(&*store, &path("/"), Existence::MayExist, NodeType::Entity, None).await;
        assert!(matches!(r, Err(DavError::BadRequest(_))));
    }

    #[tokio::test]
    async fn prefetched_skips_store() {
        let store = setup().await;
        let col = store.get_collection("/user/alice/calendar").await.unwrap().unwrap();
        let pre = Prefetched {
            collection: Some(col),
            ..Default::default()
        };
        // the path does not matter when the objects are supplied.
        let r = resolve(&*store, &path("/elsewhere"), Existence::MustExist, NodeType::Unknown, Some(pre))
            .await
            .unwrap();
        assert!(r.exists);
        assert_eq!(r.kind, ResourceKind::Collection);
    }
}
