use caldav_handler::{CalDavHandler, DavMethod, DavMethodSet, body::Body, memstore::MemStore, store::CalStore};
use http::{Method, Request, Response, StatusCode};

const ALICE: &str = "/principals/users/alice";

fn event(uid: &str, start: &str, end: &str, summary: &str) -> String {
    format!(
        "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//Test//Test//EN\r\nBEGIN:VEVENT\r\nUID:{uid}\r\nDTSTAMP:20240101T000000Z\r\nDTSTART:{start}\r\nDTEND:{end}\r\nSUMMARY:{summary}\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n"
    )
}

fn setup() -> (CalDavHandler, Box<MemStore>) {
    let store = MemStore::new();
    store.add_user("alice");
    store.add_user("bob");
    store.set_current_principal(Some("alice"));
    let server = CalDavHandler::builder()
        .store(store.clone())
        .principal(ALICE)
        .build_handler();
    (server, store)
}

async fn send(server: &CalDavHandler, req: Request<Body>) -> Response<Body> {
    server.handle(req).await
}

async fn resp_to_string(mut resp: Response<Body>) -> String {
    use futures_util::StreamExt;

    let mut data = Vec::new();
    let body = resp.body_mut();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => data.extend_from_slice(&bytes),
            Err(e) => panic!("Error reading body stream: {}", e),
        }
    }
    String::from_utf8(data).unwrap_or_default()
}

async fn put_event(server: &CalDavHandler, uri: &str, text: String) -> Response<Body> {
    let req = Request::builder()
        .method(Method::PUT)
        .uri(uri)
        .header("content-type", "text/calendar; charset=utf-8")
        .body(Body::from(text))
        .unwrap();
    send(server, req).await
}

async fn report(server: &CalDavHandler, uri: &str, depth: &str, body: &str) -> Response<Body> {
    let req = Request::builder()
        .method("REPORT")
        .uri(uri)
        .header("depth", depth)
        .header("content-type", "application/xml")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(server, req).await
}

#[tokio::test]
async fn options_advertises_calendar_access() {
    let (server, _store) = setup();
    let req = Request::builder()
        .method(Method::OPTIONS)
        .uri("/")
        .body(Body::empty())
        .unwrap();
    let resp = send(&server, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let dav = resp.headers().get("dav").unwrap().to_str().unwrap();
    assert!(dav.contains("calendar-access"));
    assert!(dav.contains("calendar-schedule"));
    let allow = resp.headers().get("allow").unwrap().to_str().unwrap();
    assert!(allow.contains("REPORT"));
    assert!(allow.contains("MKCALENDAR"));
    assert!(!allow.contains("PROPPATCH"));
}

#[tokio::test]
async fn without_store_only_options() {
    let server = CalDavHandler::new();
    let req = Request::builder()
        .method(Method::OPTIONS)
        .uri("/")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&server, req).await.status(), StatusCode::OK);

    let req = Request::builder()
        .method(Method::GET)
        .uri("/user/alice/calendar")
        .body(Body::empty())
        .unwrap();
    let resp = send(&server, req).await;
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(resp.headers().get("connection").unwrap(), "close");
}

#[tokio::test]
async fn method_restrictions() {
    let (server, store) = setup();
    let req = Request::builder()
        .method("PROPPATCH")
        .uri("/user/alice/calendar")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&server, req).await.status(), StatusCode::NOT_IMPLEMENTED);

    // a body where none is expected.
    let req = Request::builder()
        .method(Method::DELETE)
        .uri("/user/alice/calendar")
        .body(Body::from("junk"))
        .unwrap();
    assert_eq!(send(&server, req).await.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let ro = CalDavHandler::builder()
        .store(store)
        .methods(DavMethodSet::read_only())
        .build_handler();
    let req = Request::builder()
        .method(Method::DELETE)
        .uri("/user/alice/calendar")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&ro, req).await.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert!(DavMethodSet::read_only().contains(DavMethod::Report));
}

#[tokio::test]
async fn put_get_delete() {
    let (server, _store) = setup();
    let uri = "/user/alice/calendar/a.ics";

    let resp = put_event(&server, uri, event("a-1", "20240105T120000Z", "20240105T130000Z", "Lunch")).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let etag = resp.headers().get("etag").unwrap().to_str().unwrap().to_string();

    let req = Request::builder().method(Method::GET).uri(uri).body(Body::empty()).unwrap();
    let resp = send(&server, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("etag").unwrap().to_str().unwrap(), etag);
    assert!(resp.headers().get("content-type").unwrap().to_str().unwrap().starts_with("text/calendar"));
    let text = resp_to_string(resp).await;
    assert!(text.contains("UID:a-1"));
    assert!(text.contains("SUMMARY:Lunch"));

    let req = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header("if-none-match", etag.as_str())
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&server, req).await.status(), StatusCode::NOT_MODIFIED);

    // update with the right etag, then retry with the stale one.
    let req = Request::builder()
        .method(Method::PUT)
        .uri(uri)
        .header("content-type", "text/calendar")
        .header("if-match", etag.as_str())
        .body(Body::from(event("a-1", "20240105T120000Z", "20240105T140000Z", "Long lunch")))
        .unwrap();
    assert_eq!(send(&server, req).await.status(), StatusCode::NO_CONTENT);
    let req = Request::builder()
        .method(Method::PUT)
        .uri(uri)
        .header("content-type", "text/calendar")
        .header("if-match", etag.as_str())
        .body(Body::from(event("a-1", "20240105T120000Z", "20240105T150000Z", "Too late")))
        .unwrap();
    assert_eq!(send(&server, req).await.status(), StatusCode::PRECONDITION_FAILED);

    let req = Request::builder()
        .method(Method::PUT)
        .uri(uri)
        .header("content-type", "text/calendar")
        .header("if-none-match", "*")
        .body(Body::from(event("a-1", "20240105T120000Z", "20240105T130000Z", "Again")))
        .unwrap();
    assert_eq!(send(&server, req).await.status(), StatusCode::PRECONDITION_FAILED);

    let req = Request::builder().method(Method::DELETE).uri(uri).body(Body::empty()).unwrap();
    assert_eq!(send(&server, req).await.status(), StatusCode::NO_CONTENT);
    let req = Request::builder().method(Method::GET).uri(uri).body(Body::empty()).unwrap();
    assert_eq!(send(&server, req).await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn put_rejections() {
    let (server, store) = setup();

    // same uid under another name.
    let resp = put_event(
        &server,
        "/user/alice/calendar/a.ics",
        event("dup", "20240105T120000Z", "20240105T130000Z", "One"),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let resp = put_event(
        &server,
        "/user/alice/calendar/b.ics",
        event("dup", "20240105T120000Z", "20240105T130000Z", "Two"),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert!(resp_to_string(resp).await.contains("no-uid-conflict"));

    // wrong media type for a calendar collection.
    let req = Request::builder()
        .method(Method::PUT)
        .uri("/user/alice/calendar/c.ics")
        .header("content-type", "text/plain")
        .body(Body::from("hello"))
        .unwrap();
    assert_eq!(send(&server, req).await.status(), StatusCode::FORBIDDEN);

    // no media type at all.
    let req = Request::builder()
        .method(Method::PUT)
        .uri("/user/alice/calendar/noct.ics")
        .body(Body::from(event("noct", "20240105T120000Z", "20240105T130000Z", "Bare")))
        .unwrap();
    let resp = send(&server, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert!(resp_to_string(resp).await.contains("supported-calendar-data"));

    store.set_max_entity_size(10);
    let resp = put_event(
        &server,
        "/user/alice/calendar/d.ics",
        event("big", "20240105T120000Z", "20240105T130000Z", "Big"),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert!(resp_to_string(resp).await.contains("max-resource-size"));
}

#[tokio::test]
async fn mkcalendar() {
    let (server, store) = setup();
    let body = r#"<?xml version="1.0" encoding="utf-8" ?>
<C:mkcalendar xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:set><D:prop><D:displayname>Work</D:displayname></D:prop></D:set>
</C:mkcalendar>"#;
    let req = Request::builder()
        .method("MKCALENDAR")
        .uri("/user/alice/work")
        .body(Body::from(body))
        .unwrap();
    let resp = send(&server, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let col = store.get_collection("/user/alice/work").await.unwrap().unwrap();
    assert_eq!(col.display_name.as_deref(), Some("Work"));

    let req = Request::builder()
        .method("MKCALENDAR")
        .uri("/user/alice/work")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&server, req).await.status(), StatusCode::METHOD_NOT_ALLOWED);

    let req = Request::builder()
        .method("MKCALENDAR")
        .uri("/user/alice/work/nested")
        .body(Body::empty())
        .unwrap();
    let resp = send(&server, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert!(resp_to_string(resp).await.contains("calendar-collection-location-ok"));

    let req = Request::builder()
        .method("MKCOL")
        .uri("/user/alice/nowhere/deeper")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&server, req).await.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn propfind_depth_one() {
    let (server, _store) = setup();
    put_event(
        &server,
        "/user/alice/calendar/a.ics",
        event("a-1", "20240105T120000Z", "20240105T130000Z", "A"),
    )
    .await;

    let body = r#"<?xml version="1.0" encoding="utf-8" ?>
<D:propfind xmlns:D="DAV:" xmlns:CS="http://calendarserver.org/ns/" xmlns:X="urn:example">
  <D:prop><D:resourcetype/><D:getetag/><CS:getctag/><X:color/></D:prop>
</D:propfind>"#;
    let req = Request::builder()
        .method("PROPFIND")
        .uri("/user/alice/calendar/")
        .header("depth", "1")
        .body(Body::from(body))
        .unwrap();
    let resp = send(&server, req).await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
    let text = resp_to_string(resp).await;
    assert!(text.contains("/user/alice/calendar/a.ics"));
    assert!(text.contains("C:calendar"));
    assert!(text.contains("getctag"));
    assert!(text.contains("404 Not Found"));
    assert!(text.contains("color"));

    let req = Request::builder()
        .method("PROPFIND")
        .uri("/user/alice/calendar/")
        .header("depth", "infinity")
        .body(Body::empty())
        .unwrap();
    let resp = send(&server, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert!(resp_to_string(resp).await.contains("propfind-finite-depth"));
}

#[tokio::test]
async fn propfind_principal() {
    let (server, _store) = setup();
    let body = r#"<D:propfind xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:prop><D:current-user-principal/><C:calendar-home-set/><C:calendar-user-address-set/></D:prop>
</D:propfind>"#;
    let req = Request::builder()
        .method("PROPFIND")
        .uri(ALICE)
        .header("depth", "0")
        .body(Body::from(body))
        .unwrap();
    let resp = send(&server, req).await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
    let text = resp_to_string(resp).await;
    assert!(text.contains("/user/alice/"));
    assert!(text.contains("mailto:alice@example.com"));
    assert!(text.contains(ALICE));
}

#[tokio::test]
async fn calendar_query_by_time_range() {
    let (server, _store) = setup();
    put_event(
        &server,
        "/user/alice/calendar/jan.ics",
        event("jan", "20240105T120000Z", "20240105T130000Z", "January"),
    )
    .await;
    put_event(
        &server,
        "/user/alice/calendar/mar.ics",
        event("mar", "20240305T120000Z", "20240305T130000Z", "March"),
    )
    .await;

    let body = r#"<?xml version="1.0" encoding="utf-8" ?>
<C:calendar-query xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:prop><D:getetag/><C:calendar-data/></D:prop>
  <C:filter>
    <C:comp-filter name="VCALENDAR">
      <C:comp-filter name="VEVENT">
        <C:time-range start="20240101T000000Z" end="20240201T000000Z"/>
      </C:comp-filter>
    </C:comp-filter>
  </C:filter>
</C:calendar-query>"#;
    let resp = report(&server, "/user/alice/calendar/", "1", body).await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
    let text = resp_to_string(resp).await;
    assert!(text.contains("jan.ics"));
    assert!(text.contains("SUMMARY:January"));
    assert!(!text.contains("mar.ics"));
}

#[tokio::test]
async fn calendar_multiget_missing_href() {
    let (server, _store) = setup();
    put_event(
        &server,
        "/user/alice/calendar/a.ics",
        event("a-1", "20240105T120000Z", "20240105T130000Z", "A"),
    )
    .await;
    let body = r#"<C:calendar-multiget xmlns:D="DAV:" xmlns:C="urn:ietf:params:xml:ns:caldav">
  <D:prop><D:getetag/></D:prop>
  <D:href>/user/alice/calendar/a.ics</D:href>
  <D:href>/user/alice/calendar/gone.ics</D:href>
</C:calendar-multiget>"#;
    let resp = report(&server, "/user/alice/calendar/", "1", body).await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
    let text = resp_to_string(resp).await;
    assert!(text.contains("HTTP/1.1 200 OK"));
    assert!(text.contains("gone.ics"));
    assert!(text.contains("HTTP/1.1 404 Not Found"));
}

#[tokio::test]
async fn free_busy_query() {
    let (server, _store) = setup();
    put_event(
        &server,
        "/user/alice/calendar/a.ics",
        event("a-1", "20240105T120000Z", "20240105T130000Z", "Busy"),
    )
    .await;
    let body = r#"<C:free-busy-query xmlns:C="urn:ietf:params:xml:ns:caldav">
  <C:time-range start="20240101T000000Z" end="20240201T000000Z"/>
</C:free-busy-query>"#;
    let resp = report(&server, "/user/alice/calendar/", "1", body).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let text = resp_to_string(resp).await;
    assert!(text.contains("BEGIN:VFREEBUSY"));
    assert!(text.contains("20240105T120000Z/20240105T130000Z"));

    let body = r#"<D:expand-property xmlns:D="DAV:"/>"#;
    let resp = report(&server, "/user/alice/calendar/", "0", body).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn copy_and_move() {
    let (server, store) = setup();
    put_event(
        &server,
        "/user/alice/calendar/a.ics",
        event("a-1", "20240105T120000Z", "20240105T130000Z", "A"),
    )
    .await;
    store
        .add_collection("/user/alice/work", caldav_handler::store::CalType::Calendar)
        .unwrap();

    let req = Request::builder()
        .method("COPY")
        .uri("/user/alice/calendar/a.ics")
        .header("destination", "http://localhost/user/alice/work/a.ics")
        .body(Body::empty())
        .unwrap();
    let resp = send(&server, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    assert!(resp.headers().get("location").is_some());

    let req = Request::builder()
        .method("MOVE")
        .uri("/user/alice/calendar/a.ics")
        .header("destination", "/user/alice/work/a.ics")
        .header("overwrite", "F")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&server, req).await.status(), StatusCode::PRECONDITION_FAILED);

    let req = Request::builder()
        .method("MOVE")
        .uri("/user/alice/calendar/a.ics")
        .header("destination", "/user/alice/calendar/b.ics")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&server, req).await.status(), StatusCode::CREATED);
    let cal = store.get_collection("/user/alice/calendar").await.unwrap().unwrap();
    assert!(store.get_event(&cal, "a.ics").await.unwrap().is_none());
    assert!(store.get_event(&cal, "b.ics").await.unwrap().is_some());

    let req = Request::builder()
        .method("COPY")
        .uri("/user/alice/calendar/b.ics")
        .header("destination", "/user/alice/calendar/b.ics")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&server, req).await.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn outbox_post_delivers() {
    let (server, store) = setup();
    let invite = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//Test//Test//EN\r\nMETHOD:REQUEST\r\nBEGIN:VEVENT\r\nUID:inv-1\r\nDTSTAMP:20240101T000000Z\r\nDTSTART:20240110T100000Z\r\nDTEND:20240110T110000Z\r\nSUMMARY:Meeting\r\nORGANIZER:mailto:alice@example.com\r\nATTENDEE:mailto:bob@example.com\r\nATTENDEE:mailto:nobody@example.com\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
    let req = Request::builder()
        .method(Method::POST)
        .uri("/user/alice/Outbox/")
        .header("content-type", "text/calendar")
        .body(Body::from(invite))
        .unwrap();
    let resp = send(&server, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let text = resp_to_string(resp).await;
    assert!(text.contains("schedule-response"));
    assert!(text.contains("2.0;Success"));
    assert!(text.contains("3.7;Invalid calendar user"));

    let inbox = store.get_collection("/user/bob/Inbox").await.unwrap().unwrap();
    assert_eq!(store.get_events(&inbox, None).await.unwrap().len(), 1);

    // not an outbox.
    let req = Request::builder()
        .method(Method::POST)
        .uri("/user/alice/calendar/")
        .header("content-type", "text/calendar")
        .body(Body::from(invite))
        .unwrap();
    assert_eq!(send(&server, req).await.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn strip_prefix() {
    let store = MemStore::new();
    store.add_user("alice");
    let server = CalDavHandler::builder()
        .store(store)
        .strip_prefix("/dav")
        .build_handler();
    let resp = put_event(
        &server,
        "/dav/user/alice/calendar/a.ics",
        event("a-1", "20240105T120000Z", "20240105T130000Z", "A"),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let req = Request::builder()
        .method("PROPFIND")
        .uri("/dav/user/alice/calendar/")
        .header("depth", "1")
        .body(Body::empty())
        .unwrap();
    let text = resp_to_string(send(&server, req).await).await;
    assert!(text.contains("/dav/user/alice/calendar/a.ics"));
}
