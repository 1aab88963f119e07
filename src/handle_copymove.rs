use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};

use crate::body::Body;
use crate::davhandler::CalDavInner;
use crate::davheaders::{self, Depth};
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::node::Node;
use crate::resource::{Existence, NodeType};
use crate::store::{CalStore, Privilege};
use crate::util::DavMethod;
use crate::DavResult;

/// Copy or move `src` onto `dst`.
///
/// Both nodes must be of the same concrete type. Returns `Created` when
/// the destination did not exist before, `NoContent` when it was replaced.
///
/// Collections are taken as they are: copying or moving an alias copies
/// or moves the alias and leaves its target alone. Entities go into the
/// dereferenced destination collection.
pub(crate) async fn copy_move(
    store: &dyn CalStore,
    src: &mut Node,
    dst: &mut Node,
    copy: bool,
    depth: Option<Depth>,
    overwrite: bool,
) -> DavResult<StatusCode>
{
    let existed = dst.exists();
    match (&*src, &*dst) {
        (Node::Collection(_), Node::Collection(_)) => {
            if matches!(depth, Some(Depth::Zero) | Some(Depth::One)) {
                return Err(DavError::BadRequest("collections are copied with depth infinity".to_string()));
            }
        }
        (Node::Component(_), Node::Component(_)) | (Node::Resource(_), Node::Resource(_)) => {
            if matches!(depth, Some(Depth::One) | Some(Depth::Infinity)) {
                return Err(DavError::BadRequest("depth is not allowed on entities".to_string()));
            }
        }
        _ => {
            debug!("copymove {} -> {}: type mismatch", src.uri(), dst.uri());
            return Err(DavError::BadRequest("source and destination differ in type".to_string()));
        }
    }
    if existed && !overwrite {
        return Err(DavError::PreconditionFailed);
    }

    if src.is_collection() {
        let from = src.collection(store, false).await.ok_or(DavError::NotFound)?;
        let to = dst.collection(store, false).await.ok_or(DavError::Conflict)?;
        store.copy_move_collection(&from, &to, copy, overwrite).await?;
    } else {
        let to = dst.collection(store, true).await.ok_or(DavError::Conflict)?;
        let name = dst.entity_name().unwrap_or_default().to_string();
        match &*src {
            Node::Component(n) => {
                let ev = n.event.as_ref().ok_or(DavError::NotFound)?;
                store.copy_move_event(ev, &to, &name, copy, overwrite).await?;
            }
            Node::Resource(n) => {
                let res = n.resource.as_ref().filter(|_| n.rref.exists).ok_or(DavError::NotFound)?;
                store.copy_move_file(res, &to.path, &name, copy, overwrite).await?;
            }
            _ => return Err(DavError::BadRequest("cannot copy this resource".to_string())),
        }
    }

    Ok(if existed {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::CREATED
    })
}

impl CalDavInner {
    pub(crate) async fn handle_copymove(
        &self,
        req: &Request<()>,
        path: &DavPath,
        method: DavMethod,
    ) -> DavResult<Response<Body>>
    {
        let store = self.store()?;

        let dest = req
            .headers()
            .typed_get::<davheaders::Destination>()
            .ok_or_else(|| DavError::BadRequest("missing Destination".to_string()))?;
        let dest = DavPath::from_href(&dest.0, &self.prefix)?;
        if dest.as_str() == path.as_str() {
            return Err(DavError::Forbidden(None));
        }
        let overwrite = req
            .headers()
            .typed_get::<davheaders::Overwrite>()
            .is_none_or(|o| o.0);
        let depth = req.headers().typed_get::<Depth>();

        let mut src = Node::resolve(store, path, Existence::MustExist, NodeType::Unknown, None).await?;
        let hint = match src {
            Node::Collection(_) => NodeType::Collection,
            Node::Principal(_) => return Err(DavError::BadRequest("cannot copy a principal".to_string())),
            _ => NodeType::Entity,
        };
        let mut dst = Node::resolve(store, &dest, Existence::MayExist, hint, None).await?;

        let copy = method == DavMethod::Copy;
        if !copy && !src.current_access(store, Privilege::Unbind).await {
            return Err(DavError::Forbidden(None));
        }
        if !dst.current_access(store, Privilege::Bind).await {
            return Err(DavError::Forbidden(None));
        }

        let status = copy_move(store, &mut src, &mut dst, copy, depth, overwrite).await?;

        let mut res = Response::new(Body::empty());
        let h = res.headers_mut();
        h.typed_insert(headers::ContentLength(0));
        if status == StatusCode::CREATED {
            h.typed_insert(davheaders::Location(dst.href()));
        }
        *res.status_mut() = status;
        Ok(res)
    }
}

#[cfg(all(test, feature = "memstore"))]
mod tests {
    use super::*;
    use crate::memstore::MemStore;
    use crate::store::{CalEntity, CalType, IcalResultType};

    const EVENT: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//Test//Test//EN\r\nBEGIN:VEVENT\r\nUID:cm-1\r\nDTSTART:20240105T120000Z\r\nDTEND:20240105T130000Z\r\nSUMMARY:Copy me\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

    fn path(p: &str) -> DavPath {
        DavPath::normalize(p).unwrap()
    }

    async fn setup() -> Box<MemStore> {
        let store = MemStore::new();
        store.add_user("alice");
        store.add_collection("/user/alice/work", CalType::Calendar).unwrap();
        let col = store.get_collection("/user/alice/calendar").await.unwrap().unwrap();
        let parsed = store
            .from_ical(Some(&col), EVENT, IcalResultType::OneComponent)
            .await
            .unwrap();
        let Some(CalEntity::Event(mut ev)) = parsed.entities.into_iter().next() else {
            panic!("no event");
        };
        ev.name = "e.ics".to_string();
        store.add_event(ev, true).await.unwrap();
        store
    }

    async fn resolve(store: &MemStore, p: &str, existence: Existence, hint: NodeType) -> Node {
        Node::resolve(store, &path(p), existence, hint, None).await.unwrap()
    }

    #[tokio::test]
    async fn collection_depth_zero() {
        let store = setup().await;
        let mut src = resolve(&store, "/user/alice/calendar", Existence::MustExist, NodeType::Unknown).await;
        let mut dst = resolve(&store, "/user/alice/other", Existence::MayExist, NodeType::Collection).await;
        let res = copy_move(&*store, &mut src, &mut dst, true, Some(Depth::Zero), true).await;
        assert!(matches!(res, Err(DavError::BadRequest(_))));
        assert!(store.get_collection("/user/alice/other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn no_overwrite_keeps_destination() {
        let store = setup().await;
        let work = store.get_collection("/user/alice/work").await.unwrap().unwrap();
        let before = work.etag.clone();
        let mut src = resolve(&store, "/user/alice/calendar", Existence::MustExist, NodeType::Unknown).await;
        let mut dst = resolve(&store, "/user/alice/work", Existence::MayExist, NodeType::Collection).await;
        let res = copy_move(&*store, &mut src, &mut dst, true, None, false).await;
        assert!(matches!(res, Err(DavError::PreconditionFailed)));
        let work = store.get_collection("/user/alice/work").await.unwrap().unwrap();
        assert_eq!(work.etag, before);
        assert!(store.get_event(&work, "e.ics").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn copy_and_move_events() {
        let store = setup().await;
        let mut src = resolve(&store, "/user/alice/calendar/e.ics", Existence::MustExist, NodeType::Unknown).await;
        let mut dst = resolve(&store, "/user/alice/work/copy.ics", Existence::MayExist, NodeType::Entity).await;
        let status = copy_move(&*store, &mut src, &mut dst, true, None, true).await.unwrap();
        assert_eq!(status, StatusCode::CREATED);

        let work = store.get_collection("/user/alice/work").await.unwrap().unwrap();
        assert!(store.get_event(&work, "copy.ics").await.unwrap().is_some());

        // moving over the copy replaces it.
        let mut src = resolve(&store, "/user/alice/calendar/e.ics", Existence::MustExist, NodeType::Unknown).await;
        let mut dst = resolve(&store, "/user/alice/work/copy.ics", Existence::MayExist, NodeType::Entity).await;
        let status = copy_move(&*store, &mut src, &mut dst, false, Some(Depth::Zero), true).await.unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        let cal = store.get_collection("/user/alice/calendar").await.unwrap().unwrap();
        assert!(store.get_event(&cal, "e.ics").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn move_alias_keeps_target() {
        let store = setup().await;
        store.add_alias("/user/alice/shared", "/user/alice/calendar").unwrap();
        let mut src = resolve(&store, "/user/alice/shared", Existence::MustExist, NodeType::Unknown).await;
        let mut dst = resolve(&store, "/user/alice/moved", Existence::MayExist, NodeType::Collection).await;
        let status = copy_move(&*store, &mut src, &mut dst, false, None, true).await.unwrap();
        assert_eq!(status, StatusCode::CREATED);

        assert!(store.get_collection("/user/alice/shared").await.unwrap().is_none());
        let moved = store.get_collection("/user/alice/moved").await.unwrap().unwrap();
        assert_eq!(moved.alias_target.as_deref(), Some("/user/alice/calendar"));
        let cal = store.get_collection("/user/alice/calendar").await.unwrap().unwrap();
        assert!(store.get_event(&cal, "e.ics").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn type_mismatch() {
        let store = setup().await;
        let mut src = resolve(&store, "/user/alice/calendar/e.ics", Existence::MustExist, NodeType::Unknown).await;
        let mut dst = resolve(&store, "/user/alice/notes.txt", Existence::MayExist, NodeType::Entity).await;
        let res = copy_move(&*store, &mut src, &mut dst, true, None, true).await;
        assert!(matches!(res, Err(DavError::BadRequest(_))));
    }
}
