//! ## Generic async CalDAV handler
//!
//! CalDAV (RFC 4791) is WebDAV (RFC 4918) for calendars: collections hold
//! calendar object resources, and a handful of extra methods and REPORTs
//! query them. This crate implements the protocol layer of a CalDAV server
//! as a request handler using the types from the `http` crate. Storage is
//! not part of it: you supply a [`CalStore`](store::CalStore) backend.
//!
//! The handler:
//!
//! - maps request paths to typed resources: principals, collections
//!   (folders, calendars, scheduling inbox and outbox, aliases), calendar
//!   components and opaque binary resources.
//! - implements OPTIONS, GET/HEAD, PUT, DELETE, COPY/MOVE, MKCOL,
//!   MKCALENDAR, PROPFIND and the calendar-query, calendar-multiget and
//!   free-busy-query REPORTs.
//! - accepts scheduling messages POSTed to an outbox.
//! - serves a SOAP extension: the calendar web service (CalWS) with
//!   selector based partial updates of calendar objects, and a
//!   synchronization service with a single active subscription.
//!
//! Included is an in-memory store, [`MemStore`](memstore::MemStore), used by
//! the tests and the example server.
//!
//! ## Example.
//!
//! Example server using [hyper] that serves an in-memory calendar store.
//!
//! ```no_run
//! use std::convert::Infallible;
//!
//! use caldav_handler::{CalDavHandler, memstore::MemStore};
//! use hyper::{server::conn::http1, service::service_fn};
//! use hyper_util::rt::TokioIo;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = MemStore::new();
//!     store.add_user("alice");
//!     store.set_current_principal(Some("alice"));
//!
//!     let dav_server = CalDavHandler::builder()
//!         .store(store)
//!         .principal("/principals/users/alice")
//!         .build_handler();
//!
//!     let addr = std::net::SocketAddr::from(([127, 0, 0, 1], 4918));
//!     let listener = TcpListener::bind(addr).await.unwrap();
//!
//!     loop {
//!         let (stream, _) = listener.accept().await.unwrap();
//!         let dav_server = dav_server.clone();
//!
//!         let io = TokioIo::new(stream);
//!         tokio::task::spawn(async move {
//!             let service = service_fn(move |req| {
//!                 let dav_server = dav_server.clone();
//!                 async move { Ok::<_, Infallible>(dav_server.handle(req).await) }
//!             });
//!             if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
//!                 eprintln!("Failed serving: {err:?}");
//!             }
//!         });
//!     }
//! }
//! ```
//! [hyper]: https://hyper.rs/

#![cfg_attr(docsrs, feature(doc_cfg))]

#[macro_use]
extern crate log;

mod davhandler;
mod davheaders;
mod errors;
mod handle_caldav;
mod handle_copymove;
mod handle_delete;
mod handle_gethead;
mod handle_mkcol;
mod handle_options;
mod handle_props;
mod handle_put;
mod handle_soap;
mod util;
mod xmltree_ext;

pub mod body;
pub mod caldav;
pub mod davpath;
pub mod ical;
#[cfg(any(docsrs, feature = "memstore"))]
#[cfg_attr(docsrs, doc(cfg(feature = "memstore")))]
pub mod memstore;
pub mod node;
pub mod patch;
pub mod resource;
pub mod store;
pub mod subscription;

/// Result type of the handlers and the resolver.
pub type DavResult<T> = Result<T, DavError>;

/// PRODID of calendars generated by the handler itself.
pub(crate) const PRODID: &str = "-//caldav-handler//EN";

pub use crate::davhandler::{CalDavConfig, CalDavHandler};
pub use crate::errors::DavError;
pub use crate::handle_soap::{NS_CALWS_URI, NS_SYNCH_URI, SoapStatus};
pub use crate::util::{DavMethod, DavMethodSet};
