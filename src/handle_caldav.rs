use chrono::Duration;
use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};
use xmltree::Element;

use crate::body::Body;
use crate::caldav::*;
use crate::davhandler::CalDavInner;
use crate::davheaders::{self, Depth};
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::handle_props::{multistatus_response, parse_propselect, PropWriter};
use crate::ical::ICalComponent;
use crate::node::Node;
use crate::resource::{Existence, NodeType, Prefetched};
use crate::store::{CalEvent, CalStore, CalType, Privilege, SchedRecipientResult};
use crate::xmltree_ext::{self, ElementExt};
use crate::DavResult;

/// A parsed REPORT body.
#[derive(Debug)]
pub(crate) enum ReportRequest {
    CalendarQuery {
        filter: ComponentFilter,
        name: &'static str,
        props: Vec<Element>,
    },
    CalendarMultiget {
        hrefs: Vec<String>,
        name: &'static str,
        props: Vec<Element>,
    },
    FreeBusyQuery(TimeRange),
}

pub(crate) fn parse_report(body: &[u8]) -> DavResult<ReportRequest> {
    if body.is_empty() {
        return Err(DavError::BadRequest("empty report".to_string()));
    }
    let root = Element::parse2(body)?;
    if root.namespace.as_deref() != Some(NS_CALDAV_URI) {
        debug!("report: unsupported {:?} {}", root.namespace, root.name);
        return Err(DavError::Forbidden(Some("D:supported-report")));
    }
    let (name, props) = parse_propselect(&root).unwrap_or(("allprop", Vec::new()));
    match root.name.as_str() {
        "calendar-query" => {
            let filter = root
                .child_elements()
                .find(|e| e.is(NS_CALDAV_URI, "filter"))
                .and_then(|f| f.child_elements().find(|e| e.is(NS_CALDAV_URI, "comp-filter")).cloned())
                .ok_or_else(|| DavError::BadRequest("calendar-query without filter".to_string()))?;
            Ok(ReportRequest::CalendarQuery {
                filter: parse_component_filter(&filter)?,
                name,
                props,
            })
        }
        "calendar-multiget" => {
            let hrefs = root
                .child_elements()
                .filter(|e| e.is(NS_DAV_URI, "href"))
                .map(|e| e.text_content().trim().to_string())
                .filter(|h| !h.is_empty())
                .collect();
            Ok(ReportRequest::CalendarMultiget { hrefs, name, props })
        }
        "free-busy-query" => {
            let tr = root
                .child_elements()
                .find(|e| e.is(NS_CALDAV_URI, "time-range"))
                .ok_or_else(|| DavError::BadRequest("free-busy-query without time-range".to_string()))?;
            Ok(ReportRequest::FreeBusyQuery(parse_time_range(tr)?))
        }
        _ => Err(DavError::Forbidden(Some("D:supported-report"))),
    }
}

fn attr_name(elem: &Element) -> DavResult<String> {
    elem.attributes
        .get("name")
        .cloned()
        .ok_or_else(|| DavError::BadRequest(format!("{} without name", elem.name)))
}

fn parse_time_range(elem: &Element) -> DavResult<TimeRange> {
    TimeRange::parse(
        elem.attributes.get("start").map(|s| s.as_str()),
        elem.attributes.get("end").map(|s| s.as_str()),
    )
}

fn parse_text_match(elem: &Element) -> TextMatch {
    TextMatch {
        text: elem.text_content(),
        collation: elem.attributes.get("collation").cloned(),
        negate_condition: elem.attributes.get("negate-condition").is_some_and(|v| v == "yes"),
    }
}

fn parse_component_filter(elem: &Element) -> DavResult<ComponentFilter> {
    let mut filter = ComponentFilter {
        name: attr_name(elem)?,
        is_not_defined: false,
        time_range: None,
        prop_filters: Vec::new(),
        comp_filters: Vec::new(),
    };
    for child in elem.child_elements() {
        match child.name.as_str() {
            "is-not-defined" => filter.is_not_defined = true,
            "time-range" => filter.time_range = Some(parse_time_range(child)?),
            "prop-filter" => filter.prop_filters.push(parse_property_filter(child)?),
            "comp-filter" => filter.comp_filters.push(parse_component_filter(child)?),
            _ => {}
        }
    }
    Ok(filter)
}

fn parse_property_filter(elem: &Element) -> DavResult<PropertyFilter> {
    let mut filter = PropertyFilter {
        name: attr_name(elem)?,
        is_not_defined: false,
        text_match: None,
        time_range: None,
        param_filters: Vec::new(),
    };
    for child in elem.child_elements() {
        match child.name.as_str() {
            "is-not-defined" => filter.is_not_defined = true,
            "time-range" => filter.time_range = Some(parse_time_range(child)?),
            "text-match" => filter.text_match = Some(parse_text_match(child)),
            "param-filter" => {
                let mut pf = ParameterFilter {
                    name: attr_name(child)?,
                    is_not_defined: false,
                    text_match: None,
                };
                for c in child.child_elements() {
                    match c.name.as_str() {
                        "is-not-defined" => pf.is_not_defined = true,
                        "text-match" => pf.text_match = Some(parse_text_match(c)),
                        _ => {}
                    }
                }
                filter.param_filters.push(pf);
            }
            _ => {}
        }
    }
    Ok(filter)
}

// the free-busy window, with an open end filled in and the length capped.
pub(crate) async fn freebusy_range(store: &dyn CalStore, tr: TimeRange) -> DavResult<TimeRange> {
    let sys = store.get_system_properties().await?;
    let start = tr
        .start
        .ok_or_else(|| DavError::BadRequest("time-range without start".to_string()))?;
    let max_end = start + Duration::days(sys.max_fb_period as i64);
    let end = tr
        .end
        .unwrap_or_else(|| start + Duration::days(sys.default_fb_period as i64));
    Ok(TimeRange {
        start: Some(start),
        end: Some(end.min(max_end)),
    })
}

fn schedule_response(results: Vec<(SchedRecipientResult, Option<String>)>) -> DavResult<Vec<u8>> {
    let mut root = caldav_elem("schedule-response")
        .ns("D", NS_DAV_URI)
        .ns("C", NS_CALDAV_URI);
    for (r, caldata) in results {
        let mut resp = caldav_elem("response");
        let mut recipient = caldav_elem("recipient");
        recipient.push(href_elem(&r.recipient));
        resp.push(recipient);
        let mut status = caldav_elem("request-status");
        status.push_text(r.status);
        resp.push(status);
        if let Some(text) = caldata {
            let mut cd = caldav_elem("calendar-data");
            cd.push_text(text);
            resp.push(cd);
        }
        root.push(resp);
    }
    xmltree_ext::element_to_bytes(&root)
}

impl CalDavInner {
    pub(crate) async fn handle_report(
        &self,
        req: &Request<()>,
        path: &DavPath,
        body: &[u8],
    ) -> DavResult<Response<Body>>
    {
        let store = self.store()?;
        let report = parse_report(body)?;

        let mut node = Node::resolve(store, path, Existence::MustExist, NodeType::Unknown, None).await?;
        if !node.current_access(store, Privilege::Read).await {
            return Err(DavError::Forbidden(None));
        }

        match report {
            ReportRequest::CalendarQuery { filter, name, props } => {
                self.calendar_query(store, &mut node, &filter, name, props).await
            }
            ReportRequest::CalendarMultiget { hrefs, name, props } => {
                self.calendar_multiget(store, &hrefs, name, props).await
            }
            ReportRequest::FreeBusyQuery(tr) => {
                let depth = match req.headers().typed_get::<Depth>() {
                    Some(Depth::One) | Some(Depth::Infinity) => 1,
                    _ => 0,
                };
                self.freebusy_query(store, &mut node, tr, depth).await
            }
        }
    }

    async fn calendar_query(
        &self,
        store: &dyn CalStore,
        node: &mut Node,
        filter: &ComponentFilter,
        name: &str,
        props: Vec<Element>,
    ) -> DavResult<Response<Body>>
    {
        let mut pw = PropWriter::new(name, props)?;

        if node.is_collection() {
            let col = node.collection(store, true).await.ok_or(DavError::NotFound)?;
            if !col.cal_type.holds_components() {
                return Err(DavError::Forbidden(Some("D:supported-report")));
            }
            let base = node.uri().clone();
            let events = store.get_events(&col, Some(filter)).await?;
            debug!("calendar-query {}: {} matches", base, events.len());
            for ev in events {
                let mut npath = base.clone();
                npath.push_segment(&ev.name);
                let pre = Prefetched {
                    collection: Some(col.clone()),
                    event: Some(ev),
                    ..Default::default()
                };
                let mut n = Node::resolve(store, &npath, Existence::MustExist, NodeType::Entity, Some(pre)).await?;
                pw.write_props(store, &mut n).await?;
            }
        } else {
            let matched = match &*node {
                Node::Component(n) => n.event.as_ref().is_some_and(|ev| filter.matches(&ev.calendar)),
                _ => false,
            };
            if matched {
                pw.write_props(store, node).await?;
            }
        }
        Ok(multistatus_response(pw.close()?))
    }

    async fn calendar_multiget(
        &self,
        store: &dyn CalStore,
        hrefs: &[String],
        name: &str,
        props: Vec<Element>,
    ) -> DavResult<Response<Body>>
    {
        let mut pw = PropWriter::new(name, props)?;
        for href in hrefs {
            let path = match DavPath::from_href(href, &self.prefix) {
                Ok(p) => p,
                Err(_) => {
                    pw.write_status_response(href, StatusCode::BAD_REQUEST)?;
                    continue;
                }
            };
            match Node::resolve(store, &path, Existence::MustExist, NodeType::Entity, None).await {
                Ok(mut n) => pw.write_props(store, &mut n).await?,
                Err(e) => {
                    debug!("calendar-multiget {href}: {e}");
                    pw.write_status_response(href, e.statuscode())?;
                }
            }
        }
        Ok(multistatus_response(pw.close()?))
    }

    async fn freebusy_query(
        &self,
        store: &dyn CalStore,
        node: &mut Node,
        tr: TimeRange,
        depth: u32,
    ) -> DavResult<Response<Body>>
    {
        if !node.is_collection() {
            return Err(DavError::Forbidden(Some("D:supported-report")));
        }
        let col = node.collection(store, true).await.ok_or(DavError::NotFound)?;
        let range = freebusy_range(store, tr).await?;
        let fb = store.get_free_busy(&col, depth, range).await?;
        let text = store.to_ical_string(&fb).await?;

        let mut res = Response::new(Body::from(text));
        res.headers_mut()
            .typed_insert(davheaders::ContentType("text/calendar; charset=utf-8".to_string()));
        *res.status_mut() = StatusCode::OK;
        Ok(res)
    }

    /// POST of a scheduling message to an outbox.
    pub(crate) async fn handle_post(&self, req: &Request<()>, path: &DavPath, body: &[u8]) -> DavResult<Response<Body>> {
        let store = self.store()?;
        let node = Node::resolve(store, path, Existence::MustExist, NodeType::Unknown, None).await?;
        if node.cal_type() != Some(CalType::Outbox) {
            return Err(DavError::MethodNotAllowed);
        }
        let ct = req.headers().typed_get::<davheaders::ContentType>().map(|c| c.mime());
        if ct.as_deref() != Some("text/calendar") {
            return Err(DavError::UnsupportedMediaType);
        }
        if !node.current_access(store, Privilege::Bind).await {
            return Err(DavError::Forbidden(None));
        }

        let text = std::str::from_utf8(body).map_err(|_| DavError::BadRequest("not utf-8".to_string()))?;
        let cal = ICalComponent::parse(text).map_err(|e| DavError::BadRequest(e.to_string()))?;
        let item = cal
            .items()
            .next()
            .cloned()
            .ok_or_else(|| DavError::BadRequest("no scheduling component".to_string()))?;

        let uid = item.uid().unwrap_or_default().to_string();
        let method = cal.property_value("METHOD").map(|m| m.to_ascii_uppercase());
        let mut ev = CalEvent::new(node.uri().as_str(), "", &uid, cal);
        ev.originator = item.property_value("ORGANIZER").map(|s| s.to_string());
        ev.recipients = item
            .properties_named("ATTENDEE")
            .map(|p| p.value.clone())
            .collect();
        ev.schedule_method = method;

        let results = if item.name == "VFREEBUSY" {
            store.request_free_busy(&ev).await?
        } else {
            store.schedule(&ev).await?
        };
        debug!("post {}: {} recipients", path, results.len());

        let mut out = Vec::new();
        for r in results {
            let caldata = match r.freebusy {
                Some(ref fb) => Some(store.to_ical_string(fb).await?),
                None => None,
            };
            out.push((r, caldata));
        }

        let mut res = Response::new(Body::from(schedule_response(out)?));
        res.headers_mut()
            .typed_insert(davheaders::ContentType("application/xml; charset=utf-8".to_string()));
        *res.status_mut() = StatusCode::OK;
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calendar_query_body() {
        let body = br#"<?xml version="1.0" encoding="utf-8" ?>
<C:calendar-query xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:prop><D:getetag/></D:prop>
  <C:filter>
    <C:comp-filter name="VCALENDAR">
      <C:comp-filter name="VEVENT">
        <C:time-range start="20240101T000000Z" end="20240201T000000Z"/>
        <C:prop-filter name="ATTENDEE">
          <C:text-match collation="i;ascii-casemap" negate-condition="yes">bob</C:text-match>
          <C:param-filter name="PARTSTAT"><C:is-not-defined/></C:param-filter>
        </C:prop-filter>
      </C:comp-filter>
    </C:comp-filter>
  </C:filter>
</C:calendar-query>"#;
        let ReportRequest::CalendarQuery { filter, name, props } = parse_report(body).unwrap() else {
            panic!("not a calendar-query");
        };
        assert_eq!(name, "prop");
        assert_eq!(props.len(), 1);
        assert_eq!(filter.name, "VCALENDAR");
        let ev = &filter.comp_filters[0];
        assert!(ev.time_range.is_some());
        let pf = &ev.prop_filters[0];
        let tm = pf.text_match.as_ref().unwrap();
        assert!(tm.negate_condition);
        assert_eq!(tm.text, "bob");
        assert!(pf.param_filters[0].is_not_defined);
    }

    #[test]
    fn report_errors() {
        let body = br#"<C:free-busy-query xmlns:C="urn:ietf:params:xml:ns:caldav"/>"#;
        assert!(matches!(parse_report(body), Err(DavError::BadRequest(_))));

        let body = br#"<D:sync-collection xmlns:D="DAV:"/>"#;
        assert!(matches!(
            parse_report(body),
            Err(DavError::Forbidden(Some("D:supported-report")))
        ));

        let body = br#"<C:calendar-query xmlns:C="urn:ietf:params:xml:ns:caldav"/>"#;
        assert!(matches!(parse_report(body), Err(DavError::BadRequest(_))));
    }

    #[test]
    fn multiget_hrefs() {
        let body = br#"<C:calendar-multiget xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:prop><D:getetag/><C:calendar-data/></D:prop>
  <D:href>/user/alice/calendar/a.ics</D:href>
  <D:href> /user/alice/calendar/b.ics </D:href>
</C:calendar-multiget>"#;
        let ReportRequest::CalendarMultiget { hrefs, props, .. } = parse_report(body).unwrap() else {
            panic!("not a multiget");
        };
        assert_eq!(hrefs, vec!["/user/alice/calendar/a.ics", "/user/alice/calendar/b.ics"]);
        assert_eq!(props.len(), 2);
    }

    #[cfg(feature = "memstore")]
    #[tokio::test]
    async fn freebusy_window() {
        let store = crate::memstore::MemStore::new();
        let tr = TimeRange::parse(Some("20240101T000000Z"), None).unwrap();
        let range = freebusy_range(&*store, tr).await.unwrap();
        let (s, e) = (range.start.unwrap(), range.end.unwrap());
        assert_eq!(e - s, Duration::days(31));

        let tr = TimeRange::parse(Some("20240101T000000Z"), Some("20250101T000000Z")).unwrap();
        let range = freebusy_range(&*store, tr).await.unwrap();
        assert_eq!(range.end.unwrap() - range.start.unwrap(), Duration::days(93));

        let tr = TimeRange::parse(None, Some("20250101T000000Z")).unwrap();
        assert!(freebusy_range(&*store, tr).await.is_err());
    }
}
