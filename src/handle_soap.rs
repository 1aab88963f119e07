//! SOAP endpoints.
//!
//! Two services are reachable by POST: the calendar web service (CalWS)
//! with property, free-busy, fetch, add and patch operations, and the
//! synchronization service that a remote synch engine subscribes to.
//! Both answer with SOAP envelopes; operation failures are reported in
//! the response status, not as SOAP faults.
use std::collections::HashMap;

use chrono::Utc;
use headers::HeaderMapExt;
use http::{Response, StatusCode};
use xmltree::Element;

use crate::body::Body;
use crate::caldav::{format_ical_datetime, TimeRange};
use crate::davhandler::CalDavInner;
use crate::davheaders;
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::handle_caldav::freebusy_range;
use crate::handle_put::put_event;
use crate::ical::{ICalComponent, ICalProperty};
use crate::node::Node;
use crate::patch::{patch_node, PatchBatch, PatchStatus};
use crate::resource::{Existence, NodeType};
use crate::store::{CalEvent, CalStore, IcalResultType};
use crate::util::systemtime_to_rfc3339;
use crate::xmltree_ext::{self, ElementExt};
use crate::DavResult;

pub const NS_SOAP11_URI: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const NS_SOAP12_URI: &str = "http://www.w3.org/2003/05/soap-envelope";
pub const NS_CALWS_URI: &str = "http://docs.oasis-open.org/ws-calendar/ns/soap";
pub const NS_SYNCH_URI: &str = "http://calendarserver.org/ns/synch";
pub const NS_XRD_URI: &str = "http://docs.oasis-open.org/ns/xri/xrd-1.0";

const XRD_PROP_BASE: &str = "http://docs.oasis-open.org/ns/wscal/calws#";

/// Result of one SOAP operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoapStatus {
    Ok,
    Error,
}

impl SoapStatus {
    fn as_str(&self) -> &'static str {
        match self {
            SoapStatus::Ok => "OK",
            SoapStatus::Error => "Error",
        }
    }
}

// Envelope/Body/<operation>. Returns the envelope namespace and the operation.
fn parse_envelope(body: &[u8]) -> DavResult<(&'static str, Element)> {
    let root = Element::parse2(body)?;
    let soap_ns = if root.is(NS_SOAP11_URI, "Envelope") {
        NS_SOAP11_URI
    } else if root.is(NS_SOAP12_URI, "Envelope") {
        NS_SOAP12_URI
    } else {
        return Err(DavError::BadRequest("not a SOAP envelope".to_string()));
    };
    let op = root
        .child_elements()
        .find(|e| e.is(soap_ns, "Body"))
        .and_then(|b| b.child_elements().next().cloned())
        .ok_or_else(|| DavError::BadRequest("empty SOAP body".to_string()))?;
    Ok((soap_ns, op))
}

fn envelope_response(soap_ns: &str, payload: Element) -> DavResult<Response<Body>> {
    let mut body = Element::new("Body");
    body.prefix = Some("S".to_string());
    body.namespace = Some(soap_ns.to_string());
    body.push(payload);
    let mut env = Element::new("Envelope");
    env.prefix = Some("S".to_string());
    env.namespace = Some(soap_ns.to_string());
    env = env.ns("S", soap_ns);
    env.push(body);

    let mut res = Response::new(Body::from(xmltree_ext::element_to_bytes(&env)?));
    res.headers_mut()
        .typed_insert(davheaders::ContentType("text/xml; charset=utf-8".to_string()));
    *res.status_mut() = StatusCode::OK;
    Ok(res)
}

// element in the namespace of a service, with the service prefix.
fn ws_elem(ns: &str, name: &str) -> Element {
    let mut e = Element::new(name);
    e.prefix = Some(if ns == NS_SYNCH_URI { "SY" } else { "CW" }.to_string());
    e.namespace = Some(ns.to_string());
    e
}

fn ws_text(ns: &str, name: &str, text: impl Into<String>) -> Element {
    let mut e = ws_elem(ns, name);
    e.push_text(text);
    e
}

// `<name>Response` with status and optional message.
fn op_response(ns: &str, name: &str, status: SoapStatus, message: Option<String>) -> Element {
    let prefix = if ns == NS_SYNCH_URI { "SY" } else { "CW" };
    let mut e = ws_elem(ns, name).ns(prefix, ns);
    e.push(ws_text(ns, "status", status.as_str()));
    if let Some(msg) = message {
        e.push(ws_text(ns, "message", msg));
    }
    e
}

// text of a direct child, matched by local name.
fn child_text(op: &Element, name: &str) -> Option<String> {
    op.child_elements()
        .find(|e| e.name == name)
        .map(|e| e.text_content().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn child<'a>(op: &'a Element, name: &str) -> Option<&'a Element> {
    op.child_elements().find(|e| e.name == name)
}

fn xrd_property(name: &str, value: String) -> Element {
    let mut e = Element::new("Property");
    e.namespace = Some(NS_XRD_URI.to_string());
    e.attributes.insert("type".to_string(), format!("{XRD_PROP_BASE}{name}"));
    e.push_text(value);
    e
}

impl CalDavInner {
    fn soap_path(&self, href: &str) -> DavResult<DavPath> {
        Ok(DavPath::from_href(href, &self.prefix)?)
    }

    /// POST to the CalWS endpoint.
    pub(crate) async fn handle_calws(&self, body: &[u8]) -> DavResult<Response<Body>> {
        let store = self.store()?;
        let (soap_ns, op) = parse_envelope(body)?;
        if op.namespace.as_deref() != Some(NS_CALWS_URI) {
            return Err(DavError::BadRequest(format!("unknown service for {}", op.name)));
        }
        debug!("calws: {}", op.name);

        let payload = match op.name.as_str() {
            "GetProperties" => self.calws_get_properties(store, &op).await?,
            "FreebusyReport" => self.calws_freebusy_report(store, &op).await?,
            "AddItem" => {
                let href = child_text(&op, "href").unwrap_or_default();
                let (status, msg) = self.add_item(store, &href, &op).await;
                op_response(NS_CALWS_URI, "AddItemResponse", status, msg)
            }
            "FetchItem" => {
                let href = child_text(&op, "href").unwrap_or_default();
                self.fetch_item(store, NS_CALWS_URI, &href).await?
            }
            "UpdateItem" => self.calws_update_item(store, &op).await?,
            other => return Err(DavError::BadRequest(format!("unhandled request {other}"))),
        };
        envelope_response(soap_ns, payload)
    }

    async fn calws_get_properties(&self, store: &dyn CalStore, op: &Element) -> DavResult<Element> {
        let mut resp = op_response(NS_CALWS_URI, "GetPropertiesResponse", SoapStatus::Ok, None);
        let Some(href) = child_text(op, "href") else {
            return Ok(resp);
        };
        let path = self.soap_path(&href)?;
        let node = Node::resolve(store, &path, Existence::MustExist, NodeType::Collection, None).await?;

        let mut xrd = Element::new("XRD").ns("", NS_XRD_URI);
        xrd.namespace = Some(NS_XRD_URI.to_string());
        let mut subject = Element::new("Subject");
        subject.namespace = Some(NS_XRD_URI.to_string());
        subject.push_text(node.href());
        xrd.push(subject);
        if let Some(t) = node.creation_date() {
            xrd.push(xrd_property("created", systemtime_to_rfc3339(t)));
        }
        if let Some(dn) = node.display_name() {
            xrd.push(xrd_property("displayname", dn));
        }
        if let Some(t) = node.last_modified() {
            xrd.push(xrd_property("lastModified", systemtime_to_rfc3339(t)));
        }
        if let Some(owner) = node.owner() {
            let mut h = node.store_href(&owner);
            if !h.ends_with('/') {
                h.push('/');
            }
            xrd.push(xrd_property("owner", h));
        }
        resp.push(xrd);
        Ok(resp)
    }

    async fn calws_freebusy_report(&self, store: &dyn CalStore, op: &Element) -> DavResult<Element> {
        const NAME: &str = "FreebusyReportResponse";
        let err = |msg: &str| -> DavResult<Element> {
            Ok(op_response(NS_CALWS_URI, NAME, SoapStatus::Error, Some(msg.to_string())))
        };

        let Some(href) = child_text(op, "href") else {
            return err("No href supplied");
        };
        let path = self.soap_path(&href)?;
        let node = Node::resolve(store, &path, Existence::MustExist, NodeType::Unknown, None).await?;
        let target = match node {
            Node::Principal(ref n) => match n.principal {
                Some(ref p) => p.clone(),
                None => return err("Only principal href supported"),
            },
            _ => return err("Only principal href supported"),
        };
        let cua = store.principal_to_caladdr(&target).await?;

        let (start, end) = match child(op, "timeRange") {
            Some(tr) => (child_text(tr, "start"), child_text(tr, "end")),
            None => (None, None),
        };
        let mut tr = TimeRange::parse(start.as_deref(), end.as_deref())?;
        if tr.start.is_none() {
            tr.start = Some(Utc::now());
        }
        let tr = freebusy_range(store, tr).await?;

        let uid = uuid::Uuid::new_v4().to_string();
        let mut fb = ICalComponent::new("VFREEBUSY");
        if let (Some(s), Some(e)) = (tr.start, tr.end) {
            fb.add_property(ICalProperty::new("DTSTART", format_ical_datetime(s)));
            fb.add_property(ICalProperty::new("DTEND", format_ical_datetime(e)));
        }
        fb.add_property(ICalProperty::new("UID", uid.as_str()));
        fb.add_property(ICalProperty::new("ORGANIZER", cua.as_str()));
        if let Some(me) = store.current_principal().await? {
            let addr = store.principal_to_caladdr(&me).await?;
            fb.add_property(ICalProperty::new("ATTENDEE", addr));
        }
        let mut cal = ICalComponent::new("VCALENDAR");
        cal.add_property(ICalProperty::new("VERSION", "2.0"));
        cal.add_property(ICalProperty::new("PRODID", crate::PRODID));
        cal.add_property(ICalProperty::new("METHOD", "REQUEST"));
        cal.components.push(fb);

        let mut ev = CalEvent::new("", "", &uid, cal);
        ev.schedule_method = Some("REQUEST".to_string());
        ev.originator = Some(cua.clone());
        ev.recipients = vec![cua];

        let mut results = store.request_free_busy(&ev).await?;
        let fbev = match (results.len(), results.pop()) {
            (1, Some(r)) => r.freebusy,
            _ => None,
        };
        match fbev {
            Some(fbev) => {
                let mut resp = op_response(NS_CALWS_URI, NAME, SoapStatus::Ok, None);
                resp.push(store.to_xcal(&fbev).await?);
                Ok(resp)
            }
            None => err("No data returned"),
        }
    }

    async fn calws_update_item(&self, store: &dyn CalStore, op: &Element) -> DavResult<Element> {
        const NAME: &str = "UpdateItemResponse";
        let href = child_text(op, "href").unwrap_or_default();
        let node = match self.soap_path(&href) {
            Ok(path) => Node::resolve(store, &path, Existence::MustExist, NodeType::Entity, None).await,
            Err(e) => Err(e),
        };
        let Ok(mut node) = node else {
            return Ok(op_response(NS_CALWS_URI, NAME, SoapStatus::Error, Some("Href not found".to_string())));
        };

        let mut namespaces = HashMap::new();
        if let Some(nss) = child(op, "namespaces") {
            for ns in nss.child_elements() {
                if let (Some(prefix), Some(uri)) = (child_text(ns, "prefix"), child_text(ns, "uri")) {
                    namespaces.insert(prefix, uri);
                }
            }
        }
        let Some(updates) = child(op, "updates") else {
            return Ok(op_response(NS_CALWS_URI, NAME, SoapStatus::Error, Some("No updates".to_string())));
        };
        let batch = match PatchBatch::parse(updates, namespaces) {
            Ok(b) => b,
            Err(e) => return Ok(op_response(NS_CALWS_URI, NAME, SoapStatus::Error, Some(e.to_string()))),
        };

        let outcome = patch_node(store, &mut node, &batch).await?;
        let status = match outcome.status {
            PatchStatus::Ok => SoapStatus::Ok,
            PatchStatus::Error => SoapStatus::Error,
        };
        Ok(op_response(NS_CALWS_URI, NAME, status, outcome.message))
    }

    // Store a new object from an xCal payload. Failures become an
    // Error status with the message.
    async fn add_item(&self, store: &dyn CalStore, href: &str, op: &Element) -> (SoapStatus, Option<String>) {
        let res: DavResult<bool> = async {
            let path = self.soap_path(href)?;
            let mut node = Node::resolve(store, &path, Existence::MustNotExist, NodeType::Entity, None).await?;
            let xcal = child(op, "icalendar").ok_or_else(|| DavError::BadRequest("no icalendar".to_string()))?;
            let col = node.collection(store, true).await.ok_or(DavError::Conflict)?;
            let parsed = store.from_xcal(Some(&col), xcal, IcalResultType::OneComponent).await?;
            put_event(store, &mut node, parsed, true, None).await
        }
        .await;
        match res {
            Ok(true) => (SoapStatus::Ok, None),
            Ok(false) => (SoapStatus::Error, None),
            Err(e) => {
                debug!("add item {href}: {e}");
                (SoapStatus::Error, Some(e.to_string()))
            }
        }
    }

    async fn fetch_item(&self, store: &dyn CalStore, ns: &str, href: &str) -> DavResult<Element> {
        const NAME: &str = "FetchItemResponse";
        let node = match self.soap_path(href) {
            Ok(path) => Node::resolve(store, &path, Existence::MustExist, NodeType::Entity, None).await,
            Err(e) => Err(e),
        };
        let ev = match node {
            Ok(Node::Component(n)) => n.event,
            Ok(_) => None,
            Err(e) => return Ok(op_response(ns, NAME, SoapStatus::Error, Some(e.to_string()))),
        };
        match ev {
            Some(ev) => {
                let mut resp = op_response(ns, NAME, SoapStatus::Ok, None);
                resp.push(store.to_xcal(&ev).await?);
                Ok(resp)
            }
            None => Ok(op_response(ns, NAME, SoapStatus::Error, Some("Not a calendar item".to_string()))),
        }
    }

    /// POST to the synchronization endpoint.
    pub(crate) async fn handle_synch(&self, body: &[u8]) -> DavResult<Response<Body>> {
        let store = self.store()?;
        let (soap_ns, op) = parse_envelope(body)?;
        if op.namespace.as_deref() != Some(NS_SYNCH_URI) {
            return Err(DavError::BadRequest(format!("unknown service for {}", op.name)));
        }
        debug!("synch: {}", op.name);

        if op.name == "StartServiceNotification" {
            let url = child_text(&op, "subscribeUrl").unwrap_or_default();
            let token = child_text(&op, "token").unwrap_or_default();
            if let Some(old) = self.subscriptions.start(url, token.as_str()) {
                debug!("synch: replacing subscription {}", old.url);
            }
            let mut resp = op_response(NS_SYNCH_URI, "StartServiceResponse", SoapStatus::Ok, None);
            resp.push(ws_text(NS_SYNCH_URI, "token", token));
            return envelope_response(soap_ns, resp);
        }

        let token = child_text(&op, "synchToken").unwrap_or_default();
        if !self.subscriptions.check_token(&token) {
            warn!("synch: {} with invalid token", op.name);
            return Err(DavError::ServerError("Invalid synch token".to_string()));
        }
        let cal_href = child_text(&op, "calendarHref").unwrap_or_default();

        let payload = match op.name.as_str() {
            "GetSynchInfo" => self.synch_info(store, &cal_href).await?,
            "AddItem" => {
                let uid = child_text(&op, "uid").unwrap_or_default();
                let href = format!("{}/{}.ics", cal_href.trim_end_matches('/'), uid);
                let (status, msg) = self.add_item(store, &href, &op).await;
                op_response(NS_SYNCH_URI, "AddItemResponse", status, msg)
            }
            "FetchItem" => {
                let uid = child_text(&op, "uid").unwrap_or_default();
                let href = format!("{}/{}.ics", cal_href.trim_end_matches('/'), uid);
                self.fetch_item(store, NS_SYNCH_URI, &href).await?
            }
            other => return Err(DavError::BadRequest(format!("unhandled request {other}"))),
        };
        envelope_response(soap_ns, payload)
    }

    async fn synch_info(&self, store: &dyn CalStore, cal_href: &str) -> DavResult<Element> {
        let path = self.soap_path(cal_href)?;
        let mut node = Node::resolve(store, &path, Existence::MustExist, NodeType::Collection, None).await?;
        let col = node.collection(store, true).await.ok_or(DavError::NotFound)?;

        let mut infos = ws_elem(NS_SYNCH_URI, "synchInfos");
        for ev in store.get_events(&col, None).await? {
            let mut info = ws_elem(NS_SYNCH_URI, "synchInfo");
            info.push(ws_text(NS_SYNCH_URI, "uid", ev.uid.as_str()));
            info.push(ws_text(NS_SYNCH_URI, "name", ev.name.as_str()));
            info.push(ws_text(NS_SYNCH_URI, "etag", format!("\"{}\"", ev.etag)));
            infos.push(info);
        }
        let mut resp = op_response(NS_SYNCH_URI, "SynchInfoResponse", SoapStatus::Ok, None);
        resp.push(ws_text(NS_SYNCH_URI, "calendarHref", cal_href));
        resp.push(infos);
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_versions() {
        let body = br#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Body><GetProperties xmlns="http://docs.oasis-open.org/ws-calendar/ns/soap"><href>/user/alice/calendar</href></GetProperties></s:Body>
</s:Envelope>"#;
        let (ns, op) = parse_envelope(body).unwrap();
        assert_eq!(ns, NS_SOAP11_URI);
        assert!(op.is(NS_CALWS_URI, "GetProperties"));
        assert_eq!(child_text(&op, "href").as_deref(), Some("/user/alice/calendar"));

        let body = br#"<env:Envelope xmlns:env="http://www.w3.org/2003/05/soap-envelope"><env:Body/></env:Envelope>"#;
        assert!(matches!(parse_envelope(body), Err(DavError::BadRequest(_))));

        let body = br#"<Envelope><Body/></Envelope>"#;
        assert!(parse_envelope(body).is_err());
    }

    #[test]
    fn status_response() {
        let e = op_response(NS_CALWS_URI, "UpdateItemResponse", SoapStatus::Error, Some("Href not found".into()));
        let xml = String::from_utf8(xmltree_ext::element_to_bytes(&e).unwrap()).unwrap();
        let doc = Element::parse(xml.as_bytes()).unwrap();
        assert!(doc.is(NS_CALWS_URI, "UpdateItemResponse"));
        assert_eq!(child_text(&doc, "status").as_deref(), Some("Error"));
        assert_eq!(child_text(&doc, "message").as_deref(), Some("Href not found"));
    }
}
