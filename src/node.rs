//! The node model.
//!
//! Every handler works on a [`Node`]: a resolved path wrapped into one of
//! four variants. Handlers match on the variant; the shared capabilities
//! (uri, existence, owning collection, etags, dates and the node-local
//! properties) live on `Node` itself.
use std::time::SystemTime;

use xmltree::Element;

use crate::caldav::*;
use crate::davpath::DavPath;
use crate::resource::{self, Existence, NodeType, Payload, Prefetched, ResourceKind, ResourceRef};
use crate::store::*;
use crate::util::{systemtime_to_httpdate, systemtime_to_rfc3339};
use crate::xmltree_ext::ElementExt;
use crate::DavResult;

/// Outcome of dereferencing an alias collection.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTarget {
    /// `None` when the alias points nowhere (or the lookup failed).
    pub target: Option<CalCollection>,
}

/// A collection reference with a request-scoped alias cache.
#[derive(Debug, Clone, Default)]
pub struct ColRef {
    col: Option<CalCollection>,
    resolved: Option<ResolvedTarget>,
}

impl ColRef {
    pub fn new(col: Option<CalCollection>) -> ColRef {
        ColRef { col, resolved: None }
    }

    /// The collection as stored, aliases not followed.
    pub fn get(&self) -> Option<&CalCollection> {
        self.col.as_ref()
    }

    /// Has the alias been looked up already.
    pub fn resolved(&self) -> Option<&ResolvedTarget> {
        self.resolved.as_ref()
    }

    /// The effective collection. For an alias the target is looked up
    /// once and cached; a failed lookup degrades to `None`.
    pub async fn deref(&mut self, store: &dyn CalStore) -> Option<CalCollection> {
        let col = self.col.as_ref()?;
        if !col.is_alias() {
            return Some(col.clone());
        }
        if let Some(ref r) = self.resolved {
            return r.target.clone();
        }
        let target = match store.resolve_alias(col).await {
            Ok(t) => t,
            Err(e) => {
                debug!("alias {}: resolve failed: {}", col.path, e);
                None
            }
        };
        if target.is_none() {
            debug!("alias {} has no reachable target", col.path);
        }
        self.resolved = Some(ResolvedTarget { target: target.clone() });
        target
    }
}

#[derive(Debug, Clone)]
pub struct CollectionNode {
    pub rref: ResourceRef,
    pub col: ColRef,
    /// Set for a collection that is about to be created.
    pub parent: Option<CalCollection>,
}

#[derive(Debug, Clone)]
pub struct ComponentNode {
    pub rref: ResourceRef,
    pub col: ColRef,
    pub event: Option<CalEvent>,
    prev_etag: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResourceNode {
    pub rref: ResourceRef,
    pub col: ColRef,
    /// For a new resource this is the unsaved placeholder.
    pub resource: Option<CalResource>,
    prev_etag: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PrincipalNode {
    pub rref: ResourceRef,
    pub principal: Option<Principal>,
    pub kind: PrincipalKind,
}

#[derive(Debug, Clone)]
pub enum Node {
    Collection(CollectionNode),
    Component(ComponentNode),
    Resource(ResourceNode),
    Principal(PrincipalNode),
}

fn quote(tag: &str) -> Option<String> {
    (!tag.is_empty()).then(|| format!("\"{tag}\""))
}

/// Wrap a resolved reference into a node. The payload moves into the node.
pub fn make_node(mut rref: ResourceRef) -> Node {
    let payload = std::mem::replace(&mut rref.payload, Payload::None);
    let col = ColRef::new(rref.collection.take());
    match rref.kind {
        ResourceKind::Principal => {
            let principal = match payload {
                Payload::Principal(p) => Some(p),
                _ => None,
            };
            let kind = principal.as_ref().map_or(PrincipalKind::User, |p| p.kind);
            Node::Principal(PrincipalNode { rref, principal, kind })
        }
        ResourceKind::Collection => {
            let parent = rref.parent.take();
            Node::Collection(CollectionNode { rref, col, parent })
        }
        ResourceKind::Component => {
            let event = match payload {
                Payload::Event(ev) => Some(ev),
                _ => None,
            };
            let prev_etag = event.as_ref().and_then(|e| quote(&e.etag));
            Node::Component(ComponentNode {
                rref,
                col,
                event,
                prev_etag,
            })
        }
        ResourceKind::BinaryResource => {
            let resource = match payload {
                Payload::Resource(r) => Some(r),
                _ => None,
            };
            let prev_etag = resource
                .as_ref()
                .filter(|_| rref.exists)
                .and_then(|r| quote(&r.etag));
            Node::Resource(ResourceNode {
                rref,
                col,
                resource,
                prev_etag,
            })
        }
    }
}

impl ComponentNode {
    /// Replace the in-memory entity with the one just stored.
    pub fn set_event(&mut self, ev: CalEvent) {
        self.rref.exists = true;
        self.event = Some(ev);
    }
}

impl ResourceNode {
    pub fn set_resource(&mut self, res: CalResource) {
        self.rref.exists = true;
        self.resource = Some(res);
    }
}

// properties a node may produce itself.
const NODE_PROPS: &[(&str, &str)] = &[
    (NS_DAV_URI, "displayname"),
    (NS_DAV_URI, "owner"),
    (NS_DAV_URI, "creationdate"),
    (NS_DAV_URI, "getlastmodified"),
    (NS_DAV_URI, "group-membership"),
    (NS_CALDAV_URI, "calendar-description"),
    (NS_CALDAV_URI, "supported-calendar-component-set"),
    (NS_CALDAV_URI, "supported-calendar-data"),
    (NS_CALDAV_URI, "calendar-home-set"),
    (NS_CALDAV_URI, "schedule-inbox-URL"),
    (NS_CALDAV_URI, "schedule-outbox-URL"),
    (NS_CALDAV_URI, "schedule-default-calendar-URL"),
    (NS_CALDAV_URI, "calendar-user-address-set"),
    (NS_CALENDARSERVER_URI, "getctag"),
];

const CALENDAR_REPORTS: &[(&str, &str)] = &[
    (NS_CALDAV_URI, "calendar-query"),
    (NS_CALDAV_URI, "calendar-multiget"),
    (NS_CALDAV_URI, "free-busy-query"),
];

impl Node {
    /// Resolve a path and wrap the result.
    pub async fn resolve(
        store: &dyn CalStore,
        path: &DavPath,
        existence: Existence,
        hint: NodeType,
        prefetched: Option<Prefetched>,
    ) -> DavResult<Node>
    {
        let rref = resource::resolve(store, path, existence, hint, prefetched).await?;
        Ok(make_node(rref))
    }

    fn rref(&self) -> &ResourceRef {
        match self {
            Node::Collection(n) => &n.rref,
            Node::Component(n) => &n.rref,
            Node::Resource(n) => &n.rref,
            Node::Principal(n) => &n.rref,
        }
    }

    fn colref(&self) -> Option<&ColRef> {
        match self {
            Node::Collection(n) => Some(&n.col),
            Node::Component(n) => Some(&n.col),
            Node::Resource(n) => Some(&n.col),
            Node::Principal(_) => None,
        }
    }

    pub fn uri(&self) -> &DavPath {
        &self.rref().path
    }

    /// URL encoded href, with the prefix. Collections end in a slash.
    pub fn href(&self) -> String {
        let mut h = self.uri().as_url_string_with_prefix();
        if self.is_collection() && !h.ends_with('/') {
            h.push('/');
        }
        h
    }

    // href for a path as known to the store.
    pub(crate) fn store_href(&self, path: &str) -> String {
        DavPath::from_store_path(path, self.uri().prefix()).as_url_string_with_prefix()
    }

    fn store_col_href(&self, path: &str) -> String {
        let mut h = self.store_href(path);
        if !h.ends_with('/') {
            h.push('/');
        }
        h
    }

    pub fn exists(&self) -> bool {
        self.rref().exists
    }

    pub fn kind(&self) -> ResourceKind {
        self.rref().kind
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, Node::Collection(_))
    }

    pub fn is_principal(&self) -> bool {
        matches!(self, Node::Principal(_))
    }

    pub fn entity_name(&self) -> Option<&str> {
        self.rref().entity_name.as_deref()
    }

    /// For collections the collection itself, for entities the
    /// collection they live in. With `deref`, aliases are followed.
    pub async fn collection(&mut self, store: &dyn CalStore, deref: bool) -> Option<CalCollection> {
        let col = match self {
            Node::Collection(n) => &mut n.col,
            Node::Component(n) => &mut n.col,
            Node::Resource(n) => &mut n.col,
            Node::Principal(_) => return None,
        };
        if deref {
            col.deref(store).await
        } else {
            col.get().cloned()
        }
    }

    /// Collection type of a collection node.
    pub fn cal_type(&self) -> Option<CalType> {
        match self {
            Node::Collection(n) => n.col.get().map(|c| c.cal_type),
            _ => None,
        }
    }

    pub fn is_calendar_collection(&self) -> bool {
        self.cal_type() == Some(CalType::Calendar)
    }

    /// Current etag, quoted.
    pub fn etag(&self) -> Option<String> {
        match self {
            Node::Collection(n) => n.col.get().filter(|_| n.rref.exists).and_then(|c| quote(&c.etag)),
            Node::Component(n) => n.event.as_ref().and_then(|e| quote(&e.etag)),
            Node::Resource(n) => n
                .resource
                .as_ref()
                .filter(|_| n.rref.exists)
                .and_then(|r| quote(&r.etag)),
            Node::Principal(_) => None,
        }
    }

    /// The etag as it was when the node was built.
    pub fn prev_etag(&self) -> Option<&str> {
        match self {
            Node::Component(n) => n.prev_etag.as_deref(),
            Node::Resource(n) => n.prev_etag.as_deref(),
            _ => None,
        }
    }

    pub fn owner(&self) -> Option<String> {
        let col_owner = || self.colref().and_then(|c| c.get()).and_then(|c| c.owner.clone());
        match self {
            Node::Collection(_) => col_owner(),
            Node::Component(n) => n.event.as_ref().and_then(|e| e.owner.clone()).or_else(col_owner),
            Node::Resource(n) => n.resource.as_ref().and_then(|r| r.owner.clone()).or_else(col_owner),
            Node::Principal(n) => n.principal.as_ref().map(|p| p.href.clone()),
        }
    }

    pub fn display_name(&self) -> Option<String> {
        match self {
            Node::Collection(n) => n
                .col
                .get()
                .map(|c| c.display_name.clone().unwrap_or_else(|| c.name.clone())),
            Node::Principal(n) => n.principal.as_ref().map(|p| p.account.clone()),
            _ => self.entity_name().map(|s| s.to_string()),
        }
    }

    pub fn creation_date(&self) -> Option<SystemTime> {
        match self {
            Node::Collection(n) => n.col.get().map(|c| c.created),
            Node::Component(n) => n.event.as_ref().map(|e| e.created),
            Node::Resource(n) => n.resource.as_ref().filter(|_| n.rref.exists).map(|r| r.created),
            Node::Principal(_) => None,
        }
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        match self {
            Node::Collection(n) => n.col.get().map(|c| c.last_modified),
            Node::Component(n) => n.event.as_ref().map(|e| e.last_modified),
            Node::Resource(n) => n
                .resource
                .as_ref()
                .filter(|_| n.rref.exists)
                .map(|r| r.last_modified),
            Node::Principal(_) => None,
        }
    }

    pub fn content_type(&self) -> Option<String> {
        match self {
            Node::Component(_) => Some("text/calendar; charset=utf-8".to_string()),
            Node::Resource(n) => n.resource.as_ref().map(|r| r.content_type.clone()),
            _ => None,
        }
    }

    pub fn content_len(&self) -> Option<u64> {
        match self {
            Node::Component(n) => n
                .event
                .as_ref()
                .map(|e| e.calendar.to_ical_string().len() as u64),
            Node::Resource(n) => n
                .resource
                .as_ref()
                .filter(|_| n.rref.exists)
                .map(|r| r.content.len() as u64),
            _ => None,
        }
    }

    /// Does the current principal hold `privilege` here. New entities are
    /// checked against the collection they will be created in.
    pub async fn current_access(&self, store: &dyn CalStore, privilege: Privilege) -> bool {
        let path = if self.exists() || self.is_collection() {
            self.uri().as_str().to_string()
        } else {
            match self.colref().and_then(|c| c.get()) {
                Some(col) => col.path.clone(),
                None => return false,
            }
        };
        match store.check_access(&path, privilege).await {
            Ok(ok) => ok,
            Err(e) => {
                debug!("check_access {path}: {e}");
                false
            }
        }
    }

    pub fn supported_reports(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Node::Collection(n) if n.col.get().is_some_and(|c| c.cal_type.holds_components()) => CALENDAR_REPORTS,
            _ => &[],
        }
    }

    /// Is this one of the properties a node generates itself.
    pub fn known_property(&self, tag: &Element) -> bool {
        let ns = tag.namespace.as_deref().unwrap_or("");
        NODE_PROPS.iter().any(|(n, name)| *n == ns && *name == tag.name)
    }

    async fn principal_info(&self, store: &dyn CalStore) -> DavResult<Option<CalPrincipalInfo>> {
        match self {
            Node::Principal(PrincipalNode {
                principal: Some(p), ..
            }) => Ok(Some(store.get_cal_principal_info(p).await?)),
            _ => Ok(None),
        }
    }

    /// Generate a node-local property. `None` means it does not apply to
    /// this node.
    pub async fn generate_property(&mut self, store: &dyn CalStore, tag: &Element) -> DavResult<Option<Element>> {
        let ns = tag.namespace.as_deref().unwrap_or("");
        let name = tag.name.as_str();

        if ns == NS_DAV_URI {
            let mut elem = dav_elem(name);
            match name {
                "displayname" => {
                    let dn = match self.principal_info(store).await? {
                        Some(info) => info.display_name,
                        None => self.display_name(),
                    };
                    match dn {
                        Some(dn) => elem.push_text(dn),
                        None => return Ok(None),
                    }
                }
                "owner" => match self.owner() {
                    Some(o) => elem.push(href_elem(&self.store_href(&o))),
                    None => return Ok(None),
                },
                "creationdate" => match self.creation_date() {
                    Some(t) => elem.push_text(systemtime_to_rfc3339(t)),
                    None => return Ok(None),
                },
                "getlastmodified" => match self.last_modified() {
                    Some(t) => elem.push_text(systemtime_to_httpdate(t)),
                    None => return Ok(None),
                },
                "group-membership" => {
                    let principal = match self {
                        Node::Principal(PrincipalNode {
                            principal: Some(p), ..
                        }) => p.clone(),
                        _ => return Ok(None),
                    };
                    for g in store.get_groups(None, &principal).await? {
                        elem.push(href_elem(&self.store_href(&g)));
                    }
                }
                _ => return Ok(None),
            }
            return Ok(Some(elem));
        }

        if ns == NS_CALDAV_URI {
            let elem = match name {
                "calendar-description" => {
                    let desc = match self {
                        Node::Collection(n) => n.col.get().and_then(|c| c.description.clone()),
                        _ => None,
                    };
                    match desc {
                        Some(d) => {
                            let mut e = caldav_elem(name);
                            e.push_text(d);
                            e
                        }
                        None => return Ok(None),
                    }
                }
                "supported-calendar-component-set" if self.is_calendar_collection() => {
                    create_supported_calendar_component_set(SUPPORTED_COMPONENTS)
                }
                "supported-calendar-data" if self.is_calendar_collection() => create_supported_calendar_data(),
                "calendar-home-set" | "schedule-inbox-URL" | "schedule-outbox-URL" | "schedule-default-calendar-URL" => {
                    let Some(info) = self.principal_info(store).await? else {
                        return Ok(None);
                    };
                    let path = match name {
                        "calendar-home-set" => info.calendar_home,
                        "schedule-inbox-URL" => info.inbox,
                        "schedule-outbox-URL" => info.outbox,
                        _ => info.default_calendar,
                    };
                    match path {
                        Some(p) => create_href_property(name, &self.store_col_href(&p)),
                        None => return Ok(None),
                    }
                }
                "calendar-user-address-set" => {
                    let Some(info) = self.principal_info(store).await? else {
                        return Ok(None);
                    };
                    let mut elem = caldav_elem(name);
                    if let Some(addr) = info.cal_address {
                        elem.push(href_elem(&addr));
                    }
                    elem.push(href_elem(&self.store_col_href(&info.principal.href)));
                    elem
                }
                _ => return Ok(None),
            };
            return Ok(Some(elem));
        }

        if ns == NS_CALENDARSERVER_URI && name == "getctag" {
            if let Node::Collection(n) = self {
                if let Some(col) = n.col.deref(store).await {
                    let mut elem = cs_elem("getctag");
                    elem.push_text(col.etag);
                    return Ok(Some(elem));
                }
            }
        }
        Ok(None)
    }
}
