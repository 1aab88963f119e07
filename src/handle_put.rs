use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};

use crate::body::Body;
use crate::davhandler::CalDavInner;
use crate::davheaders::{self, ETag, ETagList};
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::node::Node;
use crate::resource::{Existence, NodeType};
use crate::store::{CalEntity, CalStore, IcalResultType, ParsedCalendar, Privilege};
use crate::DavResult;

/// Store a calendar object at a component node.
///
/// `parsed` must hold exactly one event. With `create` set the node must
/// not exist yet. `if_match` is compared against the version the node had
/// when it was resolved. Returns true when the object was created.
pub(crate) async fn put_event(
    store: &dyn CalStore,
    node: &mut Node,
    parsed: ParsedCalendar,
    create: bool,
    if_match: Option<&ETagList>,
) -> DavResult<bool>
{
    if !matches!(node, Node::Component(_)) {
        return Err(DavError::BadRequest("not a calendar object resource".to_string()));
    }
    if parsed.entities.len() != 1 {
        warn!("put {}: {} calendar objects in one request", node.uri(), parsed.entities.len());
        return Err(DavError::BadRequest("expected exactly one calendar object".to_string()));
    }
    let mut ev = match parsed.entities.into_iter().next() {
        Some(CalEntity::Event(ev)) => ev,
        Some(CalEntity::Other(name)) => {
            warn!("put {}: cannot store a {}", node.uri(), name);
            return Err(DavError::BadRequest(format!("cannot store a {name}")));
        }
        None => return Err(DavError::BadRequest("no calendar object".to_string())),
    };
    let col = node.collection(store, true).await.ok_or(DavError::Conflict)?;
    let name = node.entity_name().unwrap_or_default().to_string();

    let created = if !node.exists() {
        if !ev.is_new {
            // the uid already lives elsewhere in this collection.
            debug!("put {}: uid {} already stored as {}", node.uri(), ev.uid, ev.name);
            return Err(DavError::Forbidden(Some("C:no-uid-conflict")));
        }
        ev.name = name.clone();
        ev.parent_path = col.path.clone();
        store.add_event(ev, false).await?;
        true
    } else if create {
        return Err(DavError::PreconditionFailed);
    } else {
        if ev.name != name {
            return Err(DavError::BadRequest(format!("object {} does not belong at {}", ev.uid, name)));
        }
        if let Some(tags) = if_match {
            if !tags.matches(node.prev_etag()) {
                debug!("put {}: stale etag", node.uri());
                return Err(DavError::PreconditionFailed);
            }
        }
        ev.parent_path = col.path.clone();
        store.update_event(ev).await?;
        false
    };

    let stored = store.get_event(&col, &name).await?.ok_or(DavError::NotFound)?;
    if let Node::Component(n) = node {
        n.set_event(stored);
    }
    Ok(created)
}

impl CalDavInner {
    pub(crate) async fn handle_put(&self, req: &Request<()>, path: &DavPath, body: &[u8]) -> DavResult<Response<Body>> {
        let store = self.store()?;
        let mut node = Node::resolve(store, path, Existence::MayExist, NodeType::Entity, None).await?;

        let ct = req.headers().typed_get::<davheaders::ContentType>().map(|c| c.mime());
        let if_match = req.headers().typed_get::<davheaders::IfMatch>().map(|h| h.0);
        let create = matches!(
            req.headers().typed_get::<davheaders::IfNoneMatch>(),
            Some(davheaders::IfNoneMatch(ETagList::Star))
        );

        let privilege = if node.exists() {
            Privilege::WriteContent
        } else {
            Privilege::Bind
        };
        if !node.current_access(store, privilege).await {
            return Err(DavError::Forbidden(None));
        }

        let max = store.get_max_user_entity_size().await?;
        if body.len() as u64 > max {
            return Err(DavError::Forbidden(Some("C:max-resource-size")));
        }

        let prev_etag = node.prev_etag().map(|t| t.to_string());
        let created = match node {
            Node::Component(_) => {
                if ct.as_deref() != Some("text/calendar") {
                    return Err(DavError::Forbidden(Some("C:supported-calendar-data")));
                }
                let text = std::str::from_utf8(body).map_err(|_| DavError::BadRequest("not utf-8".to_string()))?;
                let col = node.collection(store, true).await.ok_or(DavError::Conflict)?;
                let parsed = store.from_ical(Some(&col), text, IcalResultType::OneComponent).await?;
                put_event(store, &mut node, parsed, create, if_match.as_ref()).await?
            }
            Node::Resource(ref mut n) => {
                if ct.as_deref() == Some("text/calendar") {
                    return Err(DavError::Forbidden(Some("C:supported-calendar-data")));
                }
                let exists = n.rref.exists;
                if exists && create {
                    return Err(DavError::PreconditionFailed);
                }
                if let Some(ref tags) = if_match {
                    if !tags.matches(prev_etag.as_deref()) {
                        return Err(DavError::PreconditionFailed);
                    }
                }
                let mut res = n.resource.clone().ok_or(DavError::NotFound)?;
                res.content = bytes::Bytes::copy_from_slice(body);
                if let Some(ct) = req.headers().typed_get::<davheaders::ContentType>() {
                    res.content_type = ct.0;
                }
                if exists {
                    store.update_file(res, true).await?;
                } else {
                    let col = n.col.get().cloned().ok_or(DavError::Conflict)?;
                    store.put_file(&col, res).await?;
                }
                let name = n.rref.entity_name.clone().unwrap_or_default();
                if let Some(col) = n.col.get().cloned() {
                    if let Some(res) = store.get_file(&col, &name).await? {
                        n.set_resource(res);
                    }
                }
                !exists
            }
            _ => {
                debug!("put {path}: not an entity");
                return Err(DavError::PreconditionFailed);
            }
        };

        let mut res = Response::new(Body::empty());
        let h = res.headers_mut();
        h.typed_insert(headers::ContentLength(0));
        if let Some(e) = node.etag().as_deref().and_then(ETag::from_quoted) {
            h.typed_insert(e);
        }
        *res.status_mut() = if created {
            StatusCode::CREATED
        } else {
            StatusCode::NO_CONTENT
        };
        Ok(res)
    }
}
