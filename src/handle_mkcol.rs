use headers::HeaderMapExt;
use http::{Response, StatusCode};
use xmltree::Element;

use crate::body::Body;
use crate::caldav::{NS_CALDAV_URI, NS_DAV_URI};
use crate::davhandler::CalDavInner;
use crate::davheaders;
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::node::Node;
use crate::resource::{Existence, NodeType};
use crate::store::{CalStore, CalType, IcalResultType, Privilege};
use crate::xmltree_ext::ElementExt;
use crate::DavResult;

/// Properties that may be set while creating a calendar.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct CollectionProps {
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub timezone: Option<String>,
}

impl CollectionProps {
    // <C:mkcalendar><D:set><D:prop>...</D:prop></D:set></C:mkcalendar>
    fn parse(body: &[u8]) -> DavResult<CollectionProps> {
        let root = Element::parse2(body).map_err(|_| DavError::UnsupportedMediaType)?;
        if !root.is(NS_CALDAV_URI, "mkcalendar") {
            return Err(DavError::UnsupportedMediaType);
        }
        let mut props = CollectionProps::default();
        let set = root.child_elements().filter(|e| e.is(NS_DAV_URI, "set"));
        for prop in set.flat_map(|s| s.child_elements()).filter(|e| e.is(NS_DAV_URI, "prop")) {
            for p in prop.child_elements() {
                let ns = p.namespace.as_deref().unwrap_or("");
                match (ns, p.name.as_str()) {
                    (NS_DAV_URI, "displayname") => props.display_name = Some(p.text_content()),
                    (NS_CALDAV_URI, "calendar-description") => props.description = Some(p.text_content()),
                    (NS_CALDAV_URI, "calendar-timezone") => props.timezone = Some(p.text_content()),
                    _ => debug!("mkcalendar: ignoring {}", p.name),
                }
            }
        }
        Ok(props)
    }
}

/// Create the collection an unresolved collection node stands for.
/// Returns the status the store produced.
pub(crate) async fn make_collection(
    store: &dyn CalStore,
    node: &Node,
    is_calendar: bool,
    props: CollectionProps,
) -> DavResult<StatusCode>
{
    let n = match node {
        Node::Collection(n) if !n.rref.exists => n,
        Node::Collection(_) => return Err(DavError::MethodNotAllowed),
        _ => return Err(DavError::BadRequest("not a collection".to_string())),
    };
    let parent = n
        .parent
        .as_ref()
        .ok_or_else(|| DavError::BadRequest("no parent collection".to_string()))?;
    if parent.cal_type.holds_components() {
        debug!("mkcol {}: calendar collections do not nest", n.rref.path);
        return Err(DavError::Forbidden(Some("C:calendar-collection-location-ok")));
    }
    let mut col = n.col.get().cloned().ok_or(DavError::Conflict)?;
    if col.name.is_empty() {
        return Err(DavError::Forbidden(None));
    }
    if is_calendar {
        col.cal_type = CalType::Calendar;
    }
    col.display_name = props.display_name;
    col.description = props.description;
    col.timezone = props.timezone;
    Ok(store.make_collection(col).await?)
}

impl CalDavInner {
    pub(crate) async fn handle_mkcol(&self, path: &DavPath, is_calendar: bool, body: &[u8]) -> DavResult<Response<Body>> {
        let store = self.store()?;

        let props = if body.is_empty() {
            CollectionProps::default()
        } else {
            let props = CollectionProps::parse(body)?;
            if let Some(ref tz) = props.timezone {
                if store.from_ical(None, tz, IcalResultType::TimeZone).await.is_err() {
                    return Err(DavError::Forbidden(Some("C:valid-calendar-data")));
                }
            }
            props
        };

        let node = Node::resolve(store, path, Existence::MayExist, NodeType::Collection, None).await?;
        if node.exists() {
            return Err(DavError::MethodNotAllowed);
        }
        if !node.current_access(store, Privilege::Bind).await {
            return Err(DavError::Forbidden(None));
        }

        let status = make_collection(store, &node, is_calendar, props).await?;
        if !status.is_success() {
            return Err(DavError::Status(status));
        }

        let mut res = Response::new(Body::empty());
        res.headers_mut().typed_insert(headers::ContentLength(0));
        res.headers_mut()
            .typed_insert(davheaders::Location(node.href()));
        *res.status_mut() = status;
        Ok(res)
    }
}
