use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};

use crate::body::Body;
use crate::davhandler::CalDavInner;
use crate::davheaders::{self, ETag};
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::ical::{ICalComponent, ICalProperty};
use crate::node::Node;
use crate::resource::{Existence, NodeType};
use crate::store::{CalCollection, CalStore, CalType};
use crate::util::systemtime_to_httpdate;
use crate::DavResult;

impl CalDavInner {
    pub(crate) async fn handle_get(&self, req: &Request<()>, path: &DavPath) -> DavResult<Response<Body>> {
        let store = self.store()?;
        let head = req.method() == http::Method::HEAD;

        let mut node = Node::resolve(store, path, Existence::MustExist, NodeType::Unknown, None).await?;

        let (content_type, data) = match node {
            Node::Component(ref n) => {
                let ev = n.event.as_ref().ok_or(DavError::NotFound)?;
                let text = store.to_ical_string(ev).await?;
                ("text/calendar; charset=utf-8".to_string(), bytes::Bytes::from(text))
            }
            Node::Resource(ref n) => {
                let res = n.resource.as_ref().ok_or(DavError::NotFound)?;
                let data = store.get_file_content(res).await?;
                (res.content_type.clone(), data)
            }
            Node::Collection(_) if node.is_calendar_collection() => {
                let col = node.collection(store, true).await.ok_or(DavError::NotFound)?;
                let text = web_calendar(store, &col).await?;
                ("text/calendar; charset=utf-8".to_string(), bytes::Bytes::from(text))
            }
            _ => {
                debug!("GET {path}: not a calendar object");
                return Err(DavError::Forbidden(None));
            }
        };

        let etag = node.etag();
        if let (Some(inm), Some(tag)) = (req.headers().typed_get::<davheaders::IfNoneMatch>(), etag.as_deref()) {
            if inm.0.matches(Some(tag)) {
                let mut res = Response::new(Body::empty());
                res.headers_mut().typed_insert(headers::ContentLength(0));
                if let Some(e) = ETag::from_quoted(tag) {
                    res.headers_mut().typed_insert(e);
                }
                *res.status_mut() = StatusCode::NOT_MODIFIED;
                return Ok(res);
            }
        }

        let mut res = Response::new(Body::empty());
        let h = res.headers_mut();
        h.typed_insert(davheaders::ContentType(content_type));
        h.typed_insert(headers::ContentLength(data.len() as u64));
        if let Some(e) = etag.as_deref().and_then(ETag::from_quoted) {
            h.typed_insert(e);
        }
        if let Some(t) = node.last_modified() {
            if let Ok(v) = http::HeaderValue::from_str(&systemtime_to_httpdate(t)) {
                h.insert(http::header::LAST_MODIFIED, v);
            }
        }
        if !head {
            *res.body_mut() = Body::from(data);
        }
        *res.status_mut() = StatusCode::OK;
        Ok(res)
    }
}

// All objects of a calendar as a single VCALENDAR. Timezones are
// included once per TZID.
async fn web_calendar(store: &dyn CalStore, col: &CalCollection) -> DavResult<String> {
    let mut cal = ICalComponent::new("VCALENDAR");
    cal.add_property(ICalProperty::new("VERSION", "2.0"));
    cal.add_property(ICalProperty::new("PRODID", "-//caldav-handler//web calendar//EN"));
    if let Some(ref name) = col.display_name {
        cal.add_property(ICalProperty::new("X-WR-CALNAME", name.as_str()));
    }

    let mut tzids: Vec<String> = Vec::new();
    if col.cal_type == CalType::Calendar {
        for ev in store.get_events(col, None).await? {
            for comp in ev.calendar.components {
                if comp.is_timezone() {
                    let tzid = comp.property_value("TZID").unwrap_or("").to_string();
                    if tzids.contains(&tzid) {
                        continue;
                    }
                    tzids.push(tzid);
                }
                cal.components.push(comp);
            }
        }
    }
    Ok(cal.to_ical_string())
}
