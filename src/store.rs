//! Contains the structs and traits that define a calendar store backend.
//!
//! The protocol layer never touches storage directly. Everything it knows
//! about collections, calendar objects, opaque resources and principals comes
//! from an implementation of [`CalStore`]. Every method returns a boxed future;
//! the handlers await each call to completion before making the next one.
use std::error::Error;
use std::fmt::Debug;
use std::time::SystemTime;

use bytes::Bytes;
use dyn_clone::{clone_trait_object, DynClone};
use futures_util::future::{self, BoxFuture, FutureExt};
use http::StatusCode;
use xmltree::Element;

use crate::caldav::{ComponentFilter, TimeRange};
use crate::ical::ICalComponent;

macro_rules! notimplemented {
    ($method:expr) => {
        future::ready(Err(StoreError::NotImplemented)).boxed()
    };
}

/// Errors generated by a store backend.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    NotImplemented,
    GeneralFailure,
    Exists,
    NotFound,
    Forbidden,
    InsufficientStorage,
    TooLarge,
    BadData(String),
    Conflict,
}

impl Error for StoreError {}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            StoreError::BadData(msg) => write!(f, "bad data: {msg}"),
            _ => write!(f, "{self:?}"),
        }
    }
}

/// The Result type.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Future returned by almost all of the CalStore methods.
pub type StoreFuture<'a, T> = BoxFuture<'a, StoreResult<T>>;

/// Largest entity a store accepts unless it says otherwise.
pub const DEFAULT_MAX_ENTITY_SIZE: u64 = 1_000_000;

/// Kind of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalType {
    Folder,
    Calendar,
    Inbox,
    Outbox,
}

impl CalType {
    /// Calendar objects (rather than opaque resources) live in these.
    pub fn holds_components(&self) -> bool {
        !matches!(self, CalType::Folder)
    }
}

/// A collection as known to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct CalCollection {
    pub path: String,
    pub name: String,
    pub parent_path: Option<String>,
    pub cal_type: CalType,
    /// Path of the collection this one is an alias for.
    pub alias_target: Option<String>,
    pub owner: Option<String>,
    pub display_name: Option<String>,
    pub description: Option<String>,
    /// VTIMEZONE text.
    pub timezone: Option<String>,
    pub created: SystemTime,
    pub last_modified: SystemTime,
    pub etag: String,
}

impl CalCollection {
    pub fn is_alias(&self) -> bool {
        self.alias_target.is_some()
    }
}

/// A calendar object: one component plus its overrides, as a VCALENDAR.
#[derive(Debug, Clone, PartialEq)]
pub struct CalEvent {
    pub name: String,
    pub parent_path: String,
    pub uid: String,
    pub calendar: ICalComponent,
    pub etag: String,
    /// Not yet stored.
    pub is_new: bool,
    /// iTIP METHOD for scheduling requests.
    pub schedule_method: Option<String>,
    pub originator: Option<String>,
    pub recipients: Vec<String>,
    pub owner: Option<String>,
    pub created: SystemTime,
    pub last_modified: SystemTime,
}

impl CalEvent {
    pub fn new(parent_path: &str, name: &str, uid: &str, calendar: ICalComponent) -> CalEvent {
        let now = SystemTime::now();
        CalEvent {
            name: name.to_string(),
            parent_path: parent_path.to_string(),
            uid: uid.to_string(),
            calendar,
            etag: String::new(),
            is_new: true,
            schedule_method: None,
            originator: None,
            recipients: Vec::new(),
            owner: None,
            created: now,
            last_modified: now,
        }
    }

    pub fn path(&self) -> String {
        join_path(&self.parent_path, &self.name)
    }

    /// The main (non-timezone) component.
    pub fn component(&self) -> Option<&ICalComponent> {
        self.calendar.items().next()
    }
}

/// An opaque file stored in a non-calendar collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CalResource {
    pub name: String,
    pub parent_path: String,
    pub content_type: String,
    pub content: Bytes,
    pub etag: String,
    pub is_new: bool,
    pub owner: Option<String>,
    pub created: SystemTime,
    pub last_modified: SystemTime,
}

impl CalResource {
    pub fn path(&self) -> String {
        join_path(&self.parent_path, &self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrincipalKind {
    User,
    Group,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub href: String,
    pub account: String,
    pub kind: PrincipalKind,
}

/// Calendar related information about a principal.
#[derive(Debug, Clone, PartialEq)]
pub struct CalPrincipalInfo {
    pub principal: Principal,
    pub display_name: Option<String>,
    pub calendar_home: Option<String>,
    pub inbox: Option<String>,
    pub outbox: Option<String>,
    pub default_calendar: Option<String>,
    pub cal_address: Option<String>,
}

/// Terms of a principal-property-search; all given terms must match.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PrincipalSearch {
    pub display_name: Option<String>,
    pub cal_address: Option<String>,
}

/// Outcome of scheduling or free-busy for one recipient.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedRecipientResult {
    pub recipient: String,
    /// iTIP REQUEST-STATUS like `2.0;Success`.
    pub status: String,
    pub freebusy: Option<CalEvent>,
}

/// Store wide settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemProperties {
    /// Free-busy period when a request has no end, in days.
    pub default_fb_period: u32,
    /// Longest free-busy period, in days.
    pub max_fb_period: u32,
}

impl Default for SystemProperties {
    fn default() -> Self {
        SystemProperties {
            default_fb_period: 31,
            max_fb_period: 93,
        }
    }
}

/// What a calendar text is expected to contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcalResultType {
    /// Exactly one non-timezone component (with its overrides).
    OneComponent,
    /// Exactly one VTIMEZONE.
    TimeZone,
}

/// One entity parsed out of a calendar text.
#[derive(Debug, Clone, PartialEq)]
pub enum CalEntity {
    Event(CalEvent),
    /// A component type that cannot be stored as an event (its name).
    Other(String),
}

/// A parsed calendar text.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCalendar {
    pub method: Option<String>,
    pub entities: Vec<CalEntity>,
    pub timezone: Option<ICalComponent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Read,
    WriteContent,
    Bind,
    Unbind,
}

/// The trait that defines a calendar store.
pub trait CalStore: Debug + Send + Sync + DynClone {
    /// Is the path in the principal namespace.
    fn is_principal<'a>(&'a self, path: &'a str) -> StoreFuture<'a, bool>;

    /// Principal for a href, `None` when unknown.
    fn get_principal<'a>(&'a self, href: &'a str) -> StoreFuture<'a, Option<Principal>>;

    /// The authenticated principal, if any.
    fn current_principal(&self) -> StoreFuture<'_, Option<Principal>> {
        future::ready(Ok(None)).boxed()
    }

    #[allow(unused_variables)]
    fn get_cal_principal_info<'a>(&'a self, principal: &'a Principal) -> StoreFuture<'a, CalPrincipalInfo> {
        notimplemented!("get_cal_principal_info")
    }

    #[allow(unused_variables)]
    fn principal_to_caladdr<'a>(&'a self, principal: &'a Principal) -> StoreFuture<'a, String> {
        notimplemented!("principal_to_caladdr")
    }

    #[allow(unused_variables)]
    fn caladdr_to_principal<'a>(&'a self, addr: &'a str) -> StoreFuture<'a, Option<Principal>> {
        notimplemented!("caladdr_to_principal")
    }

    /// Hrefs of the groups the principal is a member of.
    #[allow(unused_variables)]
    fn get_groups<'a>(&'a self, root: Option<&'a str>, principal: &'a Principal) -> StoreFuture<'a, Vec<String>> {
        future::ready(Ok(Vec::new())).boxed()
    }

    #[allow(unused_variables)]
    fn get_principal_collection_set<'a>(&'a self, uri: &'a str) -> StoreFuture<'a, Vec<String>> {
        notimplemented!("get_principal_collection_set")
    }

    #[allow(unused_variables)]
    fn get_principals<'a>(
        &'a self,
        uri: &'a str,
        search: &'a PrincipalSearch,
    ) -> StoreFuture<'a, Vec<CalPrincipalInfo>>
    {
        notimplemented!("get_principals")
    }

    fn get_collection<'a>(&'a self, path: &'a str) -> StoreFuture<'a, Option<CalCollection>>;

    /// A fresh, unsaved collection object below `parent_path`.
    #[allow(unused_variables)]
    fn new_collection_object<'a>(&'a self, is_calendar: bool, parent_path: &'a str) -> StoreFuture<'a, CalCollection> {
        notimplemented!("new_collection_object")
    }

    /// Create a collection. The returned status is passed on to the client.
    #[allow(unused_variables)]
    fn make_collection(&self, col: CalCollection) -> StoreFuture<'_, StatusCode> {
        notimplemented!("make_collection")
    }

    #[allow(unused_variables)]
    fn update_collection(&self, col: CalCollection) -> StoreFuture<'_, ()> {
        notimplemented!("update_collection")
    }

    /// Delete a collection and everything below it. Aliases are not followed.
    #[allow(unused_variables)]
    fn delete_collection<'a>(&'a self, col: &'a CalCollection) -> StoreFuture<'a, ()> {
        notimplemented!("delete_collection")
    }

    /// Copy or move `from` to the location of `to`. Returns true if created.
    #[allow(unused_variables)]
    fn copy_move_collection<'a>(
        &'a self,
        from: &'a CalCollection,
        to: &'a CalCollection,
        copy: bool,
        overwrite: bool,
    ) -> StoreFuture<'a, bool>
    {
        notimplemented!("copy_move_collection")
    }

    fn get_collections<'a>(&'a self, col: &'a CalCollection) -> StoreFuture<'a, Vec<CalCollection>>;

    /// The target of an alias, `None` if it cannot be reached.
    #[allow(unused_variables)]
    fn resolve_alias<'a>(&'a self, col: &'a CalCollection) -> StoreFuture<'a, Option<CalCollection>> {
        future::ready(Ok(None)).boxed()
    }

    fn get_event<'a>(&'a self, col: &'a CalCollection, name: &'a str) -> StoreFuture<'a, Option<CalEvent>>;

    #[allow(unused_variables)]
    fn add_event(&self, ev: CalEvent, no_invites: bool) -> StoreFuture<'_, ()> {
        notimplemented!("add_event")
    }

    #[allow(unused_variables)]
    fn update_event(&self, ev: CalEvent) -> StoreFuture<'_, ()> {
        notimplemented!("update_event")
    }

    #[allow(unused_variables)]
    fn delete_event<'a>(&'a self, ev: &'a CalEvent, schedule_reply: bool) -> StoreFuture<'a, ()> {
        notimplemented!("delete_event")
    }

    fn get_events<'a>(
        &'a self,
        col: &'a CalCollection,
        filter: Option<&'a ComponentFilter>,
    ) -> StoreFuture<'a, Vec<CalEvent>>;

    /// Copy or move an event into `to`. Returns true if created.
    #[allow(unused_variables)]
    fn copy_move_event<'a>(
        &'a self,
        ev: &'a CalEvent,
        to: &'a CalCollection,
        name: &'a str,
        copy: bool,
        overwrite: bool,
    ) -> StoreFuture<'a, bool>
    {
        notimplemented!("copy_move_event")
    }

    #[allow(unused_variables)]
    fn new_resource_object<'a>(&'a self, parent_path: &'a str) -> StoreFuture<'a, CalResource> {
        notimplemented!("new_resource_object")
    }

    #[allow(unused_variables)]
    fn get_file<'a>(&'a self, col: &'a CalCollection, name: &'a str) -> StoreFuture<'a, Option<CalResource>> {
        future::ready(Ok(None)).boxed()
    }

    #[allow(unused_variables)]
    fn put_file<'a>(&'a self, col: &'a CalCollection, res: CalResource) -> StoreFuture<'a, ()> {
        notimplemented!("put_file")
    }

    #[allow(unused_variables)]
    fn update_file(&self, res: CalResource, update_content: bool) -> StoreFuture<'_, ()> {
        notimplemented!("update_file")
    }

    #[allow(unused_variables)]
    fn delete_file<'a>(&'a self, res: &'a CalResource) -> StoreFuture<'a, ()> {
        notimplemented!("delete_file")
    }

    #[allow(unused_variables)]
    fn get_files<'a>(&'a self, col: &'a CalCollection) -> StoreFuture<'a, Vec<CalResource>> {
        future::ready(Ok(Vec::new())).boxed()
    }

    fn get_file_content<'a>(&'a self, res: &'a CalResource) -> StoreFuture<'a, Bytes> {
        future::ready(Ok(res.content.clone())).boxed()
    }

    /// Copy or move a resource into collection `to_path`. Returns true if created.
    #[allow(unused_variables)]
    fn copy_move_file<'a>(
        &'a self,
        res: &'a CalResource,
        to_path: &'a str,
        name: &'a str,
        copy: bool,
        overwrite: bool,
    ) -> StoreFuture<'a, bool>
    {
        notimplemented!("copy_move_file")
    }

    /// A VFREEBUSY for the collection (and its children when `depth` > 0).
    #[allow(unused_variables)]
    fn get_free_busy<'a>(
        &'a self,
        col: &'a CalCollection,
        depth: u32,
        range: TimeRange,
    ) -> StoreFuture<'a, CalEvent>
    {
        notimplemented!("get_free_busy")
    }

    #[allow(unused_variables)]
    fn request_free_busy<'a>(&'a self, ev: &'a CalEvent) -> StoreFuture<'a, Vec<SchedRecipientResult>> {
        notimplemented!("request_free_busy")
    }

    #[allow(unused_variables)]
    fn schedule<'a>(&'a self, ev: &'a CalEvent) -> StoreFuture<'a, Vec<SchedRecipientResult>> {
        notimplemented!("schedule")
    }

    /// Parse calendar text into entities for collection `col`.
    fn from_ical<'a>(
        &'a self,
        col: Option<&'a CalCollection>,
        text: &'a str,
        mode: IcalResultType,
    ) -> StoreFuture<'a, ParsedCalendar>;

    /// Parse an xCal document. Goes through the text form by default.
    fn from_xcal<'a>(
        &'a self,
        col: Option<&'a CalCollection>,
        xcal: &'a Element,
        mode: IcalResultType,
    ) -> StoreFuture<'a, ParsedCalendar>
    {
        async move {
            let cal = ICalComponent::from_xcal(xcal).map_err(|e| StoreError::BadData(e.to_string()))?;
            let text = cal.to_ical_string();
            self.from_ical(col, &text, mode).await
        }
        .boxed()
    }

    fn to_ical_string<'a>(&'a self, ev: &'a CalEvent) -> StoreFuture<'a, String> {
        future::ready(Ok(ev.calendar.to_ical_string())).boxed()
    }

    fn to_xcal<'a>(&'a self, ev: &'a CalEvent) -> StoreFuture<'a, Element> {
        future::ready(Ok(ev.calendar.to_xcal())).boxed()
    }

    /// Does the current principal hold `privilege` on `path`.
    #[allow(unused_variables)]
    fn check_access<'a>(&'a self, path: &'a str, privilege: Privilege) -> StoreFuture<'a, bool> {
        future::ready(Ok(true)).boxed()
    }

    fn get_max_user_entity_size(&self) -> StoreFuture<'_, u64> {
        future::ready(Ok(DEFAULT_MAX_ENTITY_SIZE)).boxed()
    }

    fn get_system_properties(&self) -> StoreFuture<'_, SystemProperties> {
        future::ready(Ok(SystemProperties::default())).boxed()
    }

    /// Discard speculative state of the current request.
    fn rollback(&self) -> StoreFuture<'_, ()> {
        future::ready(Ok(())).boxed()
    }
}

clone_trait_object! {CalStore}

pub(crate) fn join_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}
