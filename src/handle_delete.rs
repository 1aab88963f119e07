use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};

use crate::body::Body;
use crate::davhandler::CalDavInner;
use crate::davheaders;
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::node::Node;
use crate::resource::{Existence, NodeType};
use crate::store::{CalStore, Privilege};
use crate::DavResult;

/// Remove whatever a node stands for. Collections are never
/// dereferenced: deleting an alias removes the alias.
pub(crate) async fn delete_node(store: &dyn CalStore, node: &mut Node, schedule_reply: bool) -> DavResult<()> {
    match node {
        Node::Principal(_) => Err(DavError::Unauthorized),
        Node::Collection(_) => {
            let col = node.collection(store, false).await.ok_or(DavError::NotFound)?;
            Ok(store.delete_collection(&col).await?)
        }
        Node::Component(n) => match n.event {
            Some(ref ev) => Ok(store.delete_event(ev, schedule_reply).await?),
            None => {
                debug!("delete {}: already gone", n.rref.path);
                Ok(())
            }
        },
        Node::Resource(n) => match n.resource {
            Some(ref res) if n.rref.exists => Ok(store.delete_file(res).await?),
            _ => Err(DavError::NotFound),
        },
    }
}

impl CalDavInner {
    pub(crate) async fn handle_delete(&self, req: &Request<()>, path: &DavPath) -> DavResult<Response<Body>> {
        let store = self.store()?;
        let mut node = Node::resolve(store, path, Existence::MustExist, NodeType::Unknown, None).await?;

        if let Some(davheaders::IfMatch(tags)) = req.headers().typed_get::<davheaders::IfMatch>() {
            if !tags.matches(node.etag().as_deref()) {
                return Err(DavError::PreconditionFailed);
            }
        }
        if !node.is_principal() && !node.current_access(store, Privilege::Unbind).await {
            return Err(DavError::Forbidden(None));
        }

        let schedule_reply = req
            .headers()
            .typed_get::<davheaders::ScheduleReply>()
            .is_none_or(|s| s.0);
        delete_node(store, &mut node, schedule_reply).await?;

        let mut res = Response::new(Body::empty());
        res.headers_mut().typed_insert(headers::ContentLength(0));
        *res.status_mut() = StatusCode::NO_CONTENT;
        Ok(res)
    }
}
