//
// This module contains the main entry point of the library,
// CalDavHandler.
//
use std::error::Error as StdError;
use std::io;
use std::sync::Arc;

use bytes::{self, buf::Buf};
use futures_util::stream::Stream;
use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};
use http_body::Body as HttpBody;
use http_body_util::BodyExt;

use crate::body::{Body, StreamBody};
use crate::davheaders;
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::store::CalStore;
use crate::subscription::SubscriptionRegister;
use crate::util::{dav_method, dav_xml_error, DavMethod, DavMethodSet};
use crate::DavResult;

const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;
const DEFAULT_CALWS_URI: &str = "/calws/soap";
const DEFAULT_SYNCH_URI: &str = "/synchws/soap";

/// CalDAV request handler.
///
/// The [`new`](Self::new) and [`builder`](Self::builder) methods are used to instantiate a handler.
///
/// The [`handle`](Self::handle) and [`handle_with`](Self::handle_with) methods do the actual work.
#[derive(Clone, Default)]
pub struct CalDavHandler {
    pub(crate) config: Arc<CalDavConfig>,
}

/// Configuration of the handler.
#[derive(Clone, Default)]
pub struct CalDavConfig {
    // Prefix to be stripped off when handling request.
    pub(crate) prefix: Option<String>,
    // Calendar store backend.
    pub(crate) store: Option<Box<dyn CalStore>>,
    // Set of allowed methods (None means "all methods")
    pub(crate) allow: Option<DavMethodSet>,
    // href of the authenticated principal.
    pub(crate) principal: Option<String>,
    // maximum request body size in bytes.
    pub(crate) max_body_size: Option<usize>,
    // POST endpoint of the calendar web service.
    pub(crate) calws_uri: Option<String>,
    // POST endpoint of the synchronization service.
    pub(crate) synch_uri: Option<String>,
    pub(crate) subscriptions: Option<SubscriptionRegister>,
}

impl CalDavConfig {
    /// Create a new configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the configuration that was built to generate a [`CalDavHandler`].
    pub fn build_handler(self) -> CalDavHandler {
        let mut this = self;
        if this.subscriptions.is_none() {
            this.subscriptions = Some(SubscriptionRegister::new());
        }
        CalDavHandler {
            config: Arc::new(this),
        }
    }

    /// Prefix to be stripped off before translating the rest of
    /// the request path to a store path.
    pub fn strip_prefix(self, prefix: impl Into<String>) -> Self {
        let mut this = self;
        this.prefix = Some(prefix.into());
        this
    }

    /// Set the calendar store to use.
    pub fn store(self, store: Box<dyn CalStore>) -> Self {
        let mut this = self;
        this.store = Some(store);
        this
    }

    /// Which methods to allow (default is all methods).
    pub fn methods(self, allow: DavMethodSet) -> Self {
        let mut this = self;
        this.allow = Some(allow);
        this
    }

    /// Set the href of the authenticated principal. This also advertises
    /// the scheduling extensions.
    pub fn principal(self, principal: impl Into<String>) -> Self {
        let mut this = self;
        this.principal = Some(principal.into());
        this
    }

    /// Maximum size of a request body (default 1 MiB).
    pub fn max_body_size(self, size: usize) -> Self {
        let mut this = self;
        this.max_body_size = Some(size);
        this
    }

    /// Path of the calendar web service SOAP endpoint.
    pub fn calws_uri(self, uri: impl Into<String>) -> Self {
        let mut this = self;
        this.calws_uri = Some(uri.into());
        this
    }

    /// Path of the synchronization SOAP endpoint.
    pub fn synch_uri(self, uri: impl Into<String>) -> Self {
        let mut this = self;
        this.synch_uri = Some(uri.into());
        this
    }

    /// Share a subscription register between handlers.
    pub fn subscriptions(self, subscriptions: SubscriptionRegister) -> Self {
        let mut this = self;
        this.subscriptions = Some(subscriptions);
        this
    }

    fn merge(&self, new: Self) -> Self {
        Self {
            prefix: new.prefix.or_else(|| self.prefix.clone()),
            store: new.store.or_else(|| self.store.clone()),
            allow: new.allow.or(self.allow),
            principal: new.principal.or_else(|| self.principal.clone()),
            max_body_size: new.max_body_size.or(self.max_body_size),
            calws_uri: new.calws_uri.or_else(|| self.calws_uri.clone()),
            synch_uri: new.synch_uri.or_else(|| self.synch_uri.clone()),
            subscriptions: new.subscriptions.or_else(|| self.subscriptions.clone()),
        }
    }
}

// The actual inner struct.
//
// At the start of the request, CalDavConfig is used to generate
// a CalDavInner struct. CalDavInner::handle then handles the request.
pub(crate) struct CalDavInner {
    pub prefix: String,
    pub store: Option<Box<dyn CalStore>>,
    pub allow: Option<DavMethodSet>,
    pub principal: Option<String>,
    pub max_body_size: usize,
    pub calws_uri: String,
    pub synch_uri: String,
    pub subscriptions: SubscriptionRegister,
}

impl CalDavHandler {
    /// Create a new `CalDavHandler`.
    ///
    /// This returns a CalDavHandler with an empty configuration. That's only
    /// useful if you use the `handle_with` method instead of `handle`.
    /// Normally you should create a new `CalDavHandler` using `CalDavHandler::builder`
    /// and configure at least the store, and probably the strip_prefix.
    pub fn new() -> Self {
        CalDavConfig::new().build_handler()
    }

    /// Return a configuration builder.
    pub fn builder() -> CalDavConfig {
        CalDavConfig::new()
    }

    /// Process a CalDAV request.
    pub async fn handle<ReqBody, ReqData, ReqError>(&self, req: Request<ReqBody>) -> Response<Body>
    where
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
    {
        let inner = CalDavInner::new(self.config.as_ref().clone());
        inner.handle(req).await
    }

    /// Handle a CalDAV request, overriding parts of the config.
    ///
    /// For example, the `principal` can be set for this request.
    pub async fn handle_with<ReqBody, ReqData, ReqError>(
        &self,
        config: CalDavConfig,
        req: Request<ReqBody>,
    ) -> Response<Body>
    where
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
    {
        let inner = CalDavInner::new(self.config.merge(config));
        inner.handle(req).await
    }

    /// Handles a request with a `Stream` body instead of a `HttpBody`.
    #[doc(hidden)]
    pub async fn handle_stream<ReqBody, ReqData, ReqError>(&self, req: Request<ReqBody>) -> Response<Body>
    where
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: Stream<Item = Result<ReqData, ReqError>>,
    {
        let req = {
            let (parts, body) = req.into_parts();
            Request::from_parts(parts, StreamBody::new(body))
        };
        let inner = CalDavInner::new(self.config.as_ref().clone());
        inner.handle(req).await
    }
}

impl CalDavInner {
    pub fn new(cfg: CalDavConfig) -> Self {
        let CalDavConfig {
            prefix,
            store,
            allow,
            principal,
            max_body_size,
            calws_uri,
            synch_uri,
            subscriptions,
        } = cfg;
        Self {
            prefix: prefix.unwrap_or_default(),
            store,
            allow,
            principal,
            max_body_size: max_body_size.unwrap_or(DEFAULT_MAX_BODY_SIZE),
            calws_uri: calws_uri.unwrap_or_else(|| DEFAULT_CALWS_URI.to_string()),
            synch_uri: synch_uri.unwrap_or_else(|| DEFAULT_SYNCH_URI.to_string()),
            subscriptions: subscriptions.unwrap_or_default(),
        }
    }

    // helper.
    pub(crate) fn store(&self) -> DavResult<&dyn CalStore> {
        self.store
            .as_deref()
            .ok_or(DavError::StatusClose(StatusCode::METHOD_NOT_ALLOWED))
    }

    // drain request body and return it.
    pub(crate) async fn read_request<ReqBody, ReqData, ReqError>(
        &self,
        body: ReqBody,
        max_size: usize,
    ) -> DavResult<Vec<u8>>
    where
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
    {
        let mut data = Vec::new();
        let mut body = std::pin::pin!(body);

        while let Some(res) = body.frame().await {
            let mut data_frame = res
                .map_err(|_| DavError::IoError(io::Error::new(io::ErrorKind::UnexpectedEof, "UnexpectedEof")))?;

            let Some(buf) = data_frame.data_mut() else {
                continue;
            };

            while buf.has_remaining() {
                if data.len() + buf.remaining() > max_size {
                    return Err(StatusCode::PAYLOAD_TOO_LARGE.into());
                }
                let b = buf.chunk();
                let l = b.len();
                data.extend_from_slice(b);
                buf.advance(l);
            }
        }
        Ok(data)
    }

    // internal dispatcher.
    async fn handle<ReqBody, ReqData, ReqError>(self, req: Request<ReqBody>) -> Response<Body>
    where
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
    {
        // Turn any DavError results into a HTTP error response.
        match self.handle2(req).await {
            Ok(resp) => {
                debug!("== END REQUEST result OK");
                resp
            }
            Err(err) => {
                debug!("== END REQUEST result {:?}", err);
                error_response(&err)
            }
        }
    }

    // internal dispatcher part 2.
    async fn handle2<ReqBody, ReqData, ReqError>(mut self, req: Request<ReqBody>) -> DavResult<Response<Body>>
    where
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
    {
        let (req, body) = {
            let (parts, body) = req.into_parts();
            (Request::from_parts(parts, ()), body)
        };

        // translate HTTP method to CalDAV method.
        let method = match dav_method(req.method()) {
            Ok(m) => m,
            Err(e) => {
                debug!("refusing method {} request {}", req.method(), req.uri());
                return Err(e);
            }
        };

        // See if method makes sense if we don't have a store.
        if self.store.is_none() {
            match method {
                DavMethod::Options => {
                    if self.allow.as_ref().map(|a| a.contains(DavMethod::Options)).unwrap_or(true) {
                        let mut a = DavMethodSet::none();
                        a.add(DavMethod::Options);
                        self.allow = Some(a);
                    }
                }
                _ => {
                    debug!("no store: method not allowed on request {}", req.uri());
                    return Err(DavError::StatusClose(StatusCode::METHOD_NOT_ALLOWED));
                }
            }
        }

        // see if method is allowed.
        if let Some(ref a) = self.allow {
            if !a.contains(method) {
                debug!("method {} not allowed on request {}", req.method(), req.uri());
                return Err(DavError::StatusClose(StatusCode::METHOD_NOT_ALLOWED));
            }
        }

        // make sure the request path is valid.
        let path = DavPath::from_uri_and_prefix(req.uri(), &self.prefix)?;

        let body_data = self.read_request(body, self.max_body_size).await?;

        // Not all methods accept a body. MKCOL bodies (extended MKCOL)
        // are not supported either.
        match method {
            DavMethod::Put
            | DavMethod::Post
            | DavMethod::PropFind
            | DavMethod::PropPatch
            | DavMethod::Report
            | DavMethod::MkCalendar
            | DavMethod::Lock
            | DavMethod::Acl => {}
            _ => {
                if !body_data.is_empty() {
                    return Err(StatusCode::UNSUPPORTED_MEDIA_TYPE.into());
                }
            }
        }

        debug!("== START REQUEST {:?} {}", method, path);

        match method {
            DavMethod::Options => self.handle_options(&req).await,
            DavMethod::PropFind => self.handle_propfind(&req, &path, &body_data).await,
            DavMethod::Report => self.handle_report(&req, &path, &body_data).await,
            DavMethod::MkCol => self.handle_mkcol(&path, false, &body_data).await,
            DavMethod::MkCalendar => self.handle_mkcol(&path, true, &body_data).await,
            DavMethod::Delete => self.handle_delete(&req, &path).await,
            DavMethod::Head | DavMethod::Get => self.handle_get(&req, &path).await,
            DavMethod::Copy | DavMethod::Move => self.handle_copymove(&req, &path, method).await,
            DavMethod::Put => self.handle_put(&req, &path, &body_data).await,
            DavMethod::Post => {
                let p = path.as_str();
                if p == self.calws_uri {
                    self.handle_calws(&body_data).await
                } else if p == self.synch_uri {
                    self.handle_synch(&body_data).await
                } else {
                    self.handle_post(&req, &path, &body_data).await
                }
            }
            DavMethod::PropPatch | DavMethod::Lock | DavMethod::Unlock | DavMethod::Acl => {
                Err(StatusCode::NOT_IMPLEMENTED.into())
            }
        }
    }
}

// Error to response. Precondition failures get a DAV:error body.
fn error_response(err: &DavError) -> Response<Body> {
    let mut resp = Response::new(Body::empty());
    *resp.status_mut() = err.statuscode();
    let h = resp.headers_mut();
    match err.precondition() {
        Some(elem) => {
            let body = dav_xml_error(&format!("<{elem}/>"));
            h.typed_insert(davheaders::ContentType("application/xml; charset=utf-8".to_string()));
            *resp.body_mut() = body;
        }
        None => {
            h.typed_insert(headers::ContentLength(0));
        }
    }
    if err.must_close() {
        resp.headers_mut()
            .insert(http::header::CONNECTION, http::HeaderValue::from_static("close"));
    }
    resp
}
