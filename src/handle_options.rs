use headers::HeaderMapExt;
use http::{HeaderValue, Request, Response, StatusCode};

use crate::body::Body;
use crate::davhandler::CalDavInner;
use crate::davheaders;
use crate::util::{DavMethod, DavMethodSet};
use crate::DavResult;

impl CalDavInner {
    pub(crate) async fn handle_options(&self, req: &Request<()>) -> DavResult<Response<Body>> {
        let mut res = Response::new(Body::empty());

        let h = res.headers_mut();
        let mut dav = "1, 3, access-control, calendar-access".to_string();
        if self.principal.is_some() {
            dav.push_str(", calendar-schedule, calendar-auto-schedule");
        }
        h.typed_insert(davheaders::Dav(dav));
        h.typed_insert(headers::ContentLength(0));

        let allow = self.allowed_methods();
        debug!("options {}: {}", req.uri(), allow);
        h.insert(http::header::ALLOW, HeaderValue::from_str(&allow).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?);

        *res.status_mut() = StatusCode::OK;
        Ok(res)
    }

    // methods that are both configured and implemented.
    fn allowed_methods(&self) -> String {
        let allow = self.allow.unwrap_or_else(DavMethodSet::all);
        let v: Vec<&str> = allow
            .iter()
            .filter(|m| {
                !matches!(
                    m,
                    DavMethod::PropPatch | DavMethod::Lock | DavMethod::Unlock | DavMethod::Acl
                )
            })
            .map(|m| m.as_str())
            .collect();
        v.join(",")
    }
}
