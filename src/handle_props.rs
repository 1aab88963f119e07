use std::collections::HashMap;

use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};
use xml::writer::EventWriter;
use xml::writer::XmlEvent as XmlWEvent;
use xmltree::Element;

use crate::body::Body;
use crate::caldav::*;
use crate::davhandler::CalDavInner;
use crate::davheaders::{self, Depth};
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::node::Node;
use crate::resource::{Existence, NodeType, Prefetched};
use crate::store::{CalEvent, CalStore, CalType, Privilege};
use crate::util::dav_xml_error;
use crate::xmltree_ext::{self, ElementExt};
use crate::DavResult;

// list returned by PROPFIND <propname/>.
const PROPNAME_STR: &[&str] = &[
    "D:creationdate",
    "D:displayname",
    "D:getcontentlength",
    "D:getcontenttype",
    "D:getetag",
    "D:getlastmodified",
    "D:resourcetype",
    "D:owner",
    "D:current-user-principal",
    "D:current-user-privilege-set",
    "D:supported-report-set",
    "D:principal-URL",
    "D:group-membership",
    "C:calendar-description",
    "C:calendar-timezone",
    "C:supported-calendar-component-set",
    "C:supported-calendar-data",
    "C:max-resource-size",
    "C:calendar-home-set",
    "C:calendar-user-address-set",
    "C:schedule-inbox-URL",
    "C:schedule-outbox-URL",
    "CS:getctag",
];

// properties returned by PROPFIND <allprop/> or empty body.
const ALLPROP_STR: &[&str] = &[
    "D:creationdate",
    "D:displayname",
    "D:getcontentlength",
    "D:getcontenttype",
    "D:getetag",
    "D:getlastmodified",
    "D:resourcetype",
];

const PRIVILEGES: &[(Privilege, &str)] = &[
    (Privilege::Read, "read"),
    (Privilege::WriteContent, "write-content"),
    (Privilege::Bind, "bind"),
    (Privilege::Unbind, "unbind"),
];

fn init_staticprop(p: &[&str]) -> Vec<Element> {
    let mut v = Vec::new();
    for a in p {
        let mut e = Element::new2(*a);
        e.namespace = match e.prefix.as_deref() {
            Some("D") => Some(NS_DAV_URI.to_string()),
            Some("C") => Some(NS_CALDAV_URI.to_string()),
            Some("CS") => Some(NS_CALENDARSERVER_URI.to_string()),
            _ => None,
        };
        v.push(e);
    }
    v
}

// An empty copy of a requested property, carrying just its own
// namespace declaration.
fn bare_elem(tag: &Element) -> Element {
    let mut e = Element::new(&tag.name);
    e.prefix = tag.prefix.clone();
    e.namespace = tag.namespace.clone();
    if let Some(ref ns) = tag.namespace {
        e = e.ns(tag.prefix.clone().unwrap_or_default(), ns.clone());
    }
    e
}

/// Parse a PROPFIND body into the request type and the requested properties.
pub(crate) fn parse_propfind(xmldata: &[u8]) -> DavResult<(&'static str, Vec<Element>)> {
    if xmldata.is_empty() {
        return Ok(("allprop", Vec::new()));
    }
    let root = Element::parse2(xmldata)?;
    if !root.is(NS_DAV_URI, "propfind") {
        return Err(DavError::XmlParseError);
    }
    parse_propselect(&root).ok_or(DavError::XmlParseError)
}

// <D:prop>, <D:allprop> (with <D:include>) or <D:propname> inside `elem`.
pub(crate) fn parse_propselect(elem: &Element) -> Option<(&'static str, Vec<Element>)> {
    let includes: Vec<Element> = elem
        .child_elements()
        .filter(|e| e.is(NS_DAV_URI, "include"))
        .flat_map(|e| e.child_elements().cloned().collect::<Vec<_>>())
        .collect();
    let sel = elem
        .child_elements()
        .find(|e| e.namespace.as_deref() == Some(NS_DAV_URI) && matches!(e.name.as_str(), "propname" | "prop" | "allprop"));
    sel.map(|e| match e.name.as_str() {
        "propname" => ("propname", Vec::new()),
        "prop" => ("prop", e.child_elements().cloned().collect()),
        _ => ("allprop", includes),
    })
}

/// Writes a `D:multistatus` document.
pub(crate) struct PropWriter {
    emitter: EventWriter<Vec<u8>>,
    name: String,
    props: Vec<Element>,
}

impl PropWriter {
    pub fn new(name: &str, mut props: Vec<Element>) -> DavResult<PropWriter> {
        let mut emitter = xmltree_ext::emitter(Vec::new())?;

        if name != "prop" {
            let mut v = Vec::new();
            let list = if name == "allprop" {
                init_staticprop(ALLPROP_STR)
            } else {
                init_staticprop(PROPNAME_STR)
            };
            for a in list {
                if !props.iter().any(|e| a.namespace == e.namespace && a.name == e.name) {
                    v.push(a);
                }
            }
            props.append(&mut v);
        }

        emitter.write(
            XmlWEvent::start_element("D:multistatus")
                .ns("D", NS_DAV_URI)
                .ns("C", NS_CALDAV_URI)
                .ns("CS", NS_CALENDARSERVER_URI),
        )?;

        Ok(PropWriter {
            emitter,
            name: name.to_string(),
            props,
        })
    }

    /// Look up all requested properties of `node` and write its response.
    pub async fn write_props(&mut self, store: &dyn CalStore, node: &mut Node) -> DavResult<()> {
        // A HashMap<StatusCode, Vec<Element>> for the result.
        let mut props = HashMap::new();

        let do_content = self.name != "propname";
        let allprop = self.name == "allprop";
        for p in &self.props {
            match dispatch_property(store, node, p, allprop).await {
                Ok(Some(mut e)) => {
                    if !do_content {
                        e.children.clear();
                        e.attributes.clear();
                    }
                    add_sc_elem(&mut props, StatusCode::OK, e);
                }
                Ok(None) => {
                    if self.name == "prop" {
                        add_sc_elem(&mut props, StatusCode::NOT_FOUND, bare_elem(p));
                    }
                }
                Err(e) => {
                    debug!("property {} on {}: {:?}", p.name, node.uri(), e);
                    if self.name == "prop" {
                        add_sc_elem(&mut props, e.statuscode(), bare_elem(p));
                    }
                }
            }
        }

        let href = node.href();
        self.write_propresponse(&href, props)
    }

    pub fn write_propresponse(&mut self, href: &str, props: HashMap<StatusCode, Vec<Element>>) -> DavResult<()> {
        self.emitter.write(XmlWEvent::start_element("D:response"))?;
        href_elem(href).write_ev(&mut self.emitter)?;

        let mut keys = props.keys().collect::<Vec<_>>();
        keys.sort();
        for status in keys {
            let Some(v) = props.get(status) else {
                continue;
            };
            self.emitter.write(XmlWEvent::start_element("D:propstat"))?;
            self.emitter.write(XmlWEvent::start_element("D:prop"))?;
            for i in v.iter() {
                i.write_ev(&mut self.emitter)?;
            }
            self.emitter.write(XmlWEvent::end_element())?;
            status_elem(*status).write_ev(&mut self.emitter)?;
            self.emitter.write(XmlWEvent::end_element())?;
        }

        self.emitter.write(XmlWEvent::end_element())?; // response

        Ok(())
    }

    /// A response without properties, e.g. for a missing href in a multiget.
    pub fn write_status_response(&mut self, href: &str, status: StatusCode) -> DavResult<()> {
        self.emitter.write(XmlWEvent::start_element("D:response"))?;
        href_elem(href).write_ev(&mut self.emitter)?;
        status_elem(status).write_ev(&mut self.emitter)?;
        self.emitter.write(XmlWEvent::end_element())?;
        Ok(())
    }

    pub fn close(mut self) -> DavResult<Vec<u8>> {
        self.emitter.write(XmlWEvent::end_element())?;
        Ok(self.emitter.into_inner())
    }
}

fn status_elem(status: StatusCode) -> Element {
    let mut e = dav_elem("status");
    e.push_text(format!("HTTP/1.1 {status}"));
    e
}

fn add_sc_elem(hm: &mut HashMap<StatusCode, Vec<Element>>, sc: StatusCode, e: Element) {
    hm.entry(sc).or_default().push(e)
}

/// A 207 response around a multistatus document.
pub(crate) fn multistatus_response(body: Vec<u8>) -> Response<Body> {
    let mut res = Response::new(Body::from(body));
    res.headers_mut()
        .typed_insert(davheaders::ContentType("application/xml; charset=utf-8".to_string()));
    *res.status_mut() = StatusCode::MULTI_STATUS;
    res
}

/// Value of property `tag` on `node`. `None` means the property does not
/// apply. The node is asked first, then the CalDAV table, then the
/// generic DAV properties.
pub(crate) async fn dispatch_property(
    store: &dyn CalStore,
    node: &mut Node,
    tag: &Element,
    allprop: bool,
) -> DavResult<Option<Element>>
{
    if node.known_property(tag) {
        return node.generate_property(store, tag).await;
    }
    let ns = tag.namespace.as_deref().unwrap_or("");
    let name = tag.name.as_str();

    if ns == NS_CALDAV_URI {
        return match name {
            "calendar-data" => Ok(calendar_data_property(store, node, tag, allprop).await),
            "calendar-timezone" => {
                let tz = match node {
                    Node::Collection(_) => node.collection(store, true).await.and_then(|c| c.timezone),
                    _ => None,
                };
                Ok(tz.map(|tz| {
                    let mut e = caldav_elem(name);
                    e.push_text(tz);
                    e
                }))
            }
            "max-resource-size" => {
                let mut e = caldav_elem(name);
                e.push_text(store.get_max_user_entity_size().await?.to_string());
                Ok(Some(e))
            }
            // includes the scheduling limits, which are never reported.
            _ => Ok(None),
        };
    }

    if ns == NS_DAV_URI {
        return dav_property(store, node, name).await;
    }
    Ok(None)
}

// calendar-data is best effort: failures are logged and the property
// is left out.
async fn calendar_data_property(store: &dyn CalStore, node: &Node, tag: &Element, allprop: bool) -> Option<Element> {
    let params = if allprop {
        Ok(CalendarData::default())
    } else {
        CalendarData::parse(tag)
    };
    let res = match params {
        Ok(params) => calendar_data(store, node, &params).await,
        Err(e) => Err(e),
    };
    match res {
        Ok(text) => {
            let mut e = caldav_elem("calendar-data");
            e.push_text(text);
            Some(e)
        }
        Err(DavError::NotFound) => None,
        Err(e) => {
            error!("calendar-data for {}: {}", node.uri(), e);
            None
        }
    }
}

/// The calendar text of a component node, filtered by `params`.
pub(crate) async fn calendar_data(store: &dyn CalStore, node: &Node, params: &CalendarData) -> DavResult<String> {
    let ev = match node {
        Node::Component(n) => n.event.as_ref().ok_or(DavError::NotFound)?,
        _ => return Err(DavError::NotFound),
    };
    let filtered = CalEvent {
        calendar: params.apply(&ev.calendar),
        ..ev.clone()
    };
    Ok(store.to_ical_string(&filtered).await?)
}

// the generic WebDAV and ACL properties.
async fn dav_property(store: &dyn CalStore, node: &mut Node, name: &str) -> DavResult<Option<Element>> {
    let mut elem = dav_elem(name);
    match name {
        "resourcetype" => match node {
            Node::Collection(_) => {
                elem.push(dav_elem("collection"));
                match node.cal_type() {
                    Some(CalType::Calendar) => elem.push(caldav_elem("calendar")),
                    Some(CalType::Inbox) => elem.push(caldav_elem("schedule-inbox")),
                    Some(CalType::Outbox) => elem.push(caldav_elem("schedule-outbox")),
                    _ => {}
                }
            }
            Node::Principal(_) => elem.push(dav_elem("principal")),
            _ => {}
        },
        "getetag" => match node.etag() {
            Some(tag) => elem.push_text(tag),
            None => return Ok(None),
        },
        "getcontenttype" => match node.content_type() {
            Some(ct) => elem.push_text(ct),
            None => return Ok(None),
        },
        "getcontentlength" => match node.content_len() {
            Some(len) => elem.push_text(len.to_string()),
            None => return Ok(None),
        },
        "current-user-principal" => match store.current_principal().await? {
            Some(p) => elem.push(href_elem(&node.store_href(&p.href))),
            None => elem.push(dav_elem("unauthenticated")),
        },
        "principal-URL" => match node {
            Node::Principal(_) => elem.push(href_elem(&node.href())),
            _ => return Ok(None),
        },
        "principal-collection-set" => {
            for p in store.get_principal_collection_set(node.uri().as_str()).await? {
                let mut h = node.store_href(&p);
                if !h.ends_with('/') {
                    h.push('/');
                }
                elem.push(href_elem(&h));
            }
        }
        "supported-report-set" => {
            for (ns, report) in node.supported_reports() {
                let mut r = dav_elem("report");
                r.push(if *ns == NS_CALDAV_URI {
                    caldav_elem(report)
                } else {
                    dav_elem(report)
                });
                let mut sr = dav_elem("supported-report");
                sr.push(r);
                elem.push(sr);
            }
        }
        "current-user-privilege-set" => {
            for (privilege, pname) in PRIVILEGES {
                if node.current_access(store, *privilege).await {
                    let mut p = dav_elem("privilege");
                    p.push(dav_elem(pname));
                    elem.push(p);
                }
            }
        }
        _ => return Ok(None),
    }
    Ok(Some(elem))
}

impl CalDavInner {
    pub(crate) async fn handle_propfind(
        &self,
        req: &Request<()>,
        path: &DavPath,
        xmldata: &[u8],
    ) -> DavResult<Response<Body>>
    {
        let store = self.store()?;

        let depth = match req.headers().typed_get::<Depth>() {
            Some(Depth::Infinity) | None => {
                let mut res = Response::new(dav_xml_error("<D:propfind-finite-depth/>"));
                res.headers_mut()
                    .typed_insert(davheaders::ContentType("application/xml; charset=utf-8".to_string()));
                *res.status_mut() = StatusCode::FORBIDDEN;
                return Ok(res);
            }
            Some(d) => d,
        };

        let (name, props) = parse_propfind(xmldata)?;
        debug!("propfind: type request: {}", name);

        let mut node = Node::resolve(store, path, Existence::MustExist, NodeType::Unknown, None).await?;

        let mut pw = PropWriter::new(name, props)?;
        pw.write_props(store, &mut node).await?;
        if depth == Depth::One && node.is_collection() {
            self.propfind_children(store, &mut node, &mut pw).await?;
        }
        Ok(multistatus_response(pw.close()?))
    }

    // one level of members, built from the listing without further lookups.
    async fn propfind_children(&self, store: &dyn CalStore, node: &mut Node, pw: &mut PropWriter) -> DavResult<()> {
        let Some(col) = node.collection(store, true).await else {
            debug!("propfind {}: alias without target", node.uri());
            return Ok(());
        };
        let base = node.uri().clone();

        for child in store.get_collections(&col).await? {
            let mut npath = base.clone();
            npath.push_segment(&child.name);
            let pre = Prefetched {
                collection: Some(child),
                ..Default::default()
            };
            let mut n = Node::resolve(store, &npath, Existence::MustExist, NodeType::Unknown, Some(pre)).await?;
            pw.write_props(store, &mut n).await?;
        }

        if col.cal_type.holds_components() {
            for ev in store.get_events(&col, None).await? {
                let mut npath = base.clone();
                npath.push_segment(&ev.name);
                let pre = Prefetched {
                    collection: Some(col.clone()),
                    event: Some(ev),
                    ..Default::default()
                };
                let mut n = Node::resolve(store, &npath, Existence::MustExist, NodeType::Unknown, Some(pre)).await?;
                pw.write_props(store, &mut n).await?;
            }
        } else {
            for res in store.get_files(&col).await? {
                let mut npath = base.clone();
                npath.push_segment(&res.name);
                let pre = Prefetched {
                    collection: Some(col.clone()),
                    resource: Some(res),
                    ..Default::default()
                };
                let mut n = Node::resolve(store, &npath, Existence::MustExist, NodeType::Unknown, Some(pre)).await?;
                pw.write_props(store, &mut n).await?;
            }
        }
        Ok(())
    }
}

#[cfg(all(test, feature = "memstore"))]
mod tests {
    use super::*;
    use crate::memstore::MemStore;
    use crate::store::{CalEntity, IcalResultType};

    const EVENT: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//Test//Test//EN\r\nBEGIN:VEVENT\r\nUID:pf-1\r\nDTSTART:20240105T120000Z\r\nDTEND:20240105T130000Z\r\nSUMMARY:Props\r\nLOCATION:Room 1\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

    fn tag(ns: &str, name: &str) -> Element {
        let mut e = Element::new(name);
        e.namespace = Some(ns.to_string());
        e
    }

    async fn setup() -> Box<MemStore> {
        let store = MemStore::new();
        store.add_user("alice");
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

    async fn node(store: &MemStore, p: &str) -> Node {
        let path = DavPath::normalize(p).unwrap();
        Node::resolve(store, &path, Existence::MustExist, NodeType::Unknown, None)
            .await
            .unwrap()
    }

    #[test]
    fn propfind_bodies() {
        let (name, props) = parse_propfind(b"").unwrap();
        assert_eq!(name, "allprop");
        assert!(props.is_empty());

        let body = br#"<D:propfind xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
            <D:prop><D:getetag/><C:calendar-data/></D:prop></D:propfind>"#;
        let (name, props) = parse_propfind(body).unwrap();
        assert_eq!(name, "prop");
        assert_eq!(props.len(), 2);
        assert!(props[1].is(NS_CALDAV_URI, "calendar-data"));

        let body = br#"<propfind xmlns="DAV:"><allprop/><include><displayname/></include></propfind>"#;
        let (name, props) = parse_propfind(body).unwrap();
        assert_eq!(name, "allprop");
        assert_eq!(props.len(), 1);

        assert!(parse_propfind(b"<D:other xmlns:D=\"DAV:\"/>").is_err());
    }

    #[tokio::test]
    async fn dispatch_order() {
        let store = setup().await;
        let mut cal = node(&store, "/user/alice/calendar").await;

        // node-local first.
        let e = dispatch_property(&*store, &mut cal, &tag(NS_DAV_URI, "displayname"), false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(e.text_content(), "calendar");

        // then the caldav table.
        let e = dispatch_property(&*store, &mut cal, &tag(NS_CALDAV_URI, "max-resource-size"), false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(e.text_content(), "1000000");
        let e = dispatch_property(&*store, &mut cal, &tag(NS_CALDAV_URI, "max-instances"), false)
            .await
            .unwrap();
        assert!(e.is_none());

        // then the generic ones.
        let e = dispatch_property(&*store, &mut cal, &tag(NS_DAV_URI, "resourcetype"), false)
            .await
            .unwrap()
            .unwrap();
        let kinds: Vec<&str> = e.child_elements().map(|c| c.name.as_str()).collect();
        assert_eq!(kinds, vec!["collection", "calendar"]);

        let e = dispatch_property(&*store, &mut cal, &tag("urn:x", "unknown"), false)
            .await
            .unwrap();
        assert!(e.is_none());
    }

    #[tokio::test]
    async fn calendar_data_selects_properties() {
        let store = setup().await;
        let mut ev = node(&store, "/user/alice/calendar/e.ics").await;
        let req = Element::parse(
            br#"<C:calendar-data xmlns:C="urn:ietf:params:xml:ns:caldav">
                <C:comp name="VCALENDAR"><C:allprop/>
                  <C:comp name="VEVENT"><C:prop name="UID"/><C:prop name="SUMMARY"/></C:comp>
                </C:comp></C:calendar-data>"# as &[u8],
        )
        .unwrap();
        let e = dispatch_property(&*store, &mut ev, &req, false).await.unwrap().unwrap();
        let text = e.text_content();
        assert!(text.contains("SUMMARY:Props"));
        assert!(!text.contains("LOCATION"));

        // expand is not supported; the property is left out.
        let req = Element::parse(
            br#"<C:calendar-data xmlns:C="urn:ietf:params:xml:ns:caldav">
                <C:expand start="20240101T000000Z" end="20240201T000000Z"/></C:calendar-data>"# as &[u8],
        )
        .unwrap();
        assert!(dispatch_property(&*store, &mut ev, &req, false).await.unwrap().is_none());

        // and on a collection it does not apply.
        let mut cal = node(&store, "/user/alice/calendar").await;
        assert!(dispatch_property(&*store, &mut cal, &req, true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn multistatus_document() {
        let store = setup().await;
        let mut ev = node(&store, "/user/alice/calendar/e.ics").await;
        let props = vec![tag(NS_DAV_URI, "getetag"), tag("urn:x", "color")];
        let mut pw = PropWriter::new("prop", props).unwrap();
        pw.write_props(&*store, &mut ev).await.unwrap();
        pw.write_status_response("/user/alice/calendar/gone.ics", StatusCode::NOT_FOUND)
            .unwrap();
        let xml = String::from_utf8(pw.close().unwrap()).unwrap();

        let doc = Element::parse(xml.as_bytes()).unwrap();
        assert!(doc.is(NS_DAV_URI, "multistatus"));
        let responses: Vec<&Element> = doc.child_elements().collect();
        assert_eq!(responses.len(), 2);
        let statuses: Vec<String> = responses[0]
            .child_elements()
            .filter(|e| e.name == "propstat")
            .filter_map(|ps| ps.child_elements().find(|e| e.name == "status").map(|s| s.text_content()))
            .collect();
        assert_eq!(statuses, vec!["HTTP/1.1 200 OK", "HTTP/1.1 404 Not Found"]);
        assert!(xml.contains("/user/alice/calendar/gone.ics"));
    }
}
