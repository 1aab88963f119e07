//! Simple in-memory calendar store.
//!
//! This implementation has state, so if you create a
//! new instance in a handler(), it will be empty every time.
//!
//! This means you have to create the instance once, using `MemStore::new`, store
//! it in your handler struct, and clone() it every time you pass
//! it to the CalDavHandler. As a MemStore struct is just a handle, cloning is cheap.
//!
//! Users are added with [`MemStore::add_user`], which also creates their
//! calendar home, a default calendar and the scheduling inbox and outbox.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::future::FutureExt;
use http::StatusCode;
use parking_lot::Mutex;

use crate::caldav::{
    component_span, format_ical_datetime, parse_ical_datetime, validate_calendar_data, ComponentFilter, TimeRange,
};
use crate::ical::{ICalComponent, ICalProperty};
use crate::store::*;

const USERS_ROOT: &str = "/principals/users";
const GROUPS_ROOT: &str = "/principals/groups";
const HOME_ROOT: &str = "/user";

/// Ephemeral in-memory calendar store.
#[derive(Debug, Clone)]
pub struct MemStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug)]
struct Inner {
    collections: BTreeMap<String, CalCollection>,
    // keyed by collection path, then name.
    events: BTreeMap<String, BTreeMap<String, CalEvent>>,
    resources: BTreeMap<String, BTreeMap<String, CalResource>>,
    principals: BTreeMap<String, PrincipalEntry>,
    read_only: BTreeSet<String>,
    current: Option<String>,
    max_entity_size: u64,
    next_tag: u64,
    generation: u64,
    rollbacks: u64,
}

#[derive(Debug, Clone)]
struct PrincipalEntry {
    principal: Principal,
    display_name: String,
    cal_address: String,
    members: Vec<String>,
}

// strip a trailing slash, except from the root.
fn trim(path: &str) -> &str {
    if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    }
}

fn parent_of(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(path[..idx].to_string()),
        None => None,
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

// is `path` equal to or below `root`.
fn is_below(path: &str, root: &str) -> bool {
    path == root || root == "/" || path.starts_with(&format!("{root}/"))
}

impl Inner {
    fn new_tag(&mut self) -> String {
        self.next_tag += 1;
        format!("{:x}-{:x}", self.generation, self.next_tag)
    }

    fn mutated(&mut self) {
        self.generation += 1;
    }

    // a collection changed below; new etag and mtime.
    fn touch(&mut self, path: &str) {
        let tag = self.new_tag();
        if let Some(col) = self.collections.get_mut(path) {
            col.etag = tag;
            col.last_modified = SystemTime::now();
        }
    }

    fn new_collection(&mut self, path: &str, cal_type: CalType, owner: Option<String>) -> CalCollection {
        let now = SystemTime::now();
        CalCollection {
            path: path.to_string(),
            name: name_of(path).to_string(),
            parent_path: parent_of(path),
            cal_type,
            alias_target: None,
            owner,
            display_name: None,
            description: None,
            timezone: None,
            created: now,
            last_modified: now,
            etag: self.new_tag(),
        }
    }

    fn insert_collection(&mut self, col: CalCollection) {
        trace!("STORE: add collection {}", col.path);
        self.collections.insert(col.path.clone(), col);
        self.mutated();
    }

    fn entry_by_caladdr(&self, addr: &str) -> Option<&PrincipalEntry> {
        self.principals
            .values()
            .find(|p| p.cal_address.eq_ignore_ascii_case(addr))
    }

    fn info(&self, entry: &PrincipalEntry) -> CalPrincipalInfo {
        let home = format!("{HOME_ROOT}/{}", entry.principal.account);
        let is_user = entry.principal.kind == PrincipalKind::User;
        let sub = |name: &str| is_user.then(|| format!("{home}/{name}"));
        CalPrincipalInfo {
            principal: entry.principal.clone(),
            display_name: Some(entry.display_name.clone()),
            calendar_home: is_user.then(|| home.clone()),
            inbox: sub("Inbox"),
            outbox: sub("Outbox"),
            default_calendar: sub("calendar"),
            cal_address: Some(entry.cal_address.clone()),
        }
    }

    fn event_by_uid(&self, col: &str, uid: &str) -> Option<&CalEvent> {
        self.events.get(col)?.values().find(|e| e.uid == uid)
    }

    fn subtree(&self, root: &str) -> Vec<String> {
        self.collections
            .keys()
            .filter(|p| is_below(p, root))
            .cloned()
            .collect()
    }

    fn remove_subtree(&mut self, root: &str) {
        for path in self.subtree(root) {
            self.collections.remove(&path);
            self.events.remove(&path);
            self.resources.remove(&path);
        }
    }

    // busy periods of the calendars at or below `root`.
    fn busy_periods(&self, root: &str, depth: u32, range: &TimeRange) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        let mut periods = Vec::new();
        for col in self.collections.values() {
            let inside = match depth {
                0 => col.path == root,
                _ => is_below(&col.path, root),
            };
            if !inside || col.cal_type != CalType::Calendar {
                continue;
            }
            for ev in self.events.get(&col.path).into_iter().flat_map(|m| m.values()) {
                for item in ev.calendar.items() {
                    if item.property_value("TRANSP") == Some("TRANSPARENT")
                        || item.property_value("STATUS") == Some("CANCELLED")
                    {
                        continue;
                    }
                    if let Some((s, e)) = component_span(item) {
                        if s < e && range.overlaps(s, e) {
                            periods.push((s, e));
                        }
                    }
                }
            }
        }
        periods.sort();
        periods
    }

    fn check_entity_size(&self, len: usize) -> StoreResult<()> {
        if len as u64 > self.max_entity_size {
            return Err(StoreError::TooLarge);
        }
        Ok(())
    }
}

// a VCALENDAR holding one VFREEBUSY.
fn freebusy_event(
    periods: &[(DateTime<Utc>, DateTime<Utc>)],
    range: &TimeRange,
    organizer: Option<&str>,
    attendee: Option<&str>,
) -> CalEvent
{
    let mut fb = ICalComponent::new("VFREEBUSY");
    let uid = uuid::Uuid::new_v4().to_string();
    fb.add_property(ICalProperty::new("UID", uid.as_str()));
    fb.add_property(ICalProperty::new("DTSTAMP", format_ical_datetime(Utc::now())));
    if let Some(s) = range.start {
        fb.add_property(ICalProperty::new("DTSTART", format_ical_datetime(s)));
    }
    if let Some(e) = range.end {
        fb.add_property(ICalProperty::new("DTEND", format_ical_datetime(e)));
    }
    if let Some(o) = organizer {
        fb.add_property(ICalProperty::new("ORGANIZER", o));
    }
    if let Some(a) = attendee {
        fb.add_property(ICalProperty::new("ATTENDEE", a));
    }
    for (s, e) in periods {
        let s = range.start.map_or(*s, |rs| (*s).max(rs));
        let e = range.end.map_or(*e, |re| (*e).min(re));
        fb.add_property(
            ICalProperty::new(
                "FREEBUSY",
                format!("{}/{}", format_ical_datetime(s), format_ical_datetime(e)),
            )
            .param("FBTYPE", "BUSY"),
        );
    }
    let mut cal = ICalComponent::new("VCALENDAR");
    cal.add_property(ICalProperty::new("VERSION", "2.0"));
    cal.add_property(ICalProperty::new("PRODID", "-//caldav-handler//memstore//EN"));
    cal.components.push(fb);
    CalEvent::new("", "", &uid, cal)
}

impl MemStore {
    /// Create a new, empty store with the fixed collection skeleton.
    pub fn new() -> Box<MemStore> {
        let mut inner = Inner {
            collections: BTreeMap::new(),
            events: BTreeMap::new(),
            resources: BTreeMap::new(),
            principals: BTreeMap::new(),
            read_only: BTreeSet::new(),
            current: None,
            max_entity_size: DEFAULT_MAX_ENTITY_SIZE,
            next_tag: 0,
            generation: 0,
            rollbacks: 0,
        };
        for path in ["/", HOME_ROOT, "/principals", USERS_ROOT, GROUPS_ROOT] {
            let col = inner.new_collection(path, CalType::Folder, None);
            inner.insert_collection(col);
        }
        Box::new(MemStore {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    /// Add a user principal with a calendar home, a calendar called
    /// `calendar`, and a scheduling inbox and outbox. Returns the principal href.
    pub fn add_user(&self, account: &str) -> String {
        let inner = &mut *self.inner.lock();
        let href = format!("{USERS_ROOT}/{account}");
        inner.principals.insert(
            href.clone(),
            PrincipalEntry {
                principal: Principal {
                    href: href.clone(),
                    account: account.to_string(),
                    kind: PrincipalKind::User,
                },
                display_name: account.to_string(),
                cal_address: format!("mailto:{account}@example.com"),
                members: Vec::new(),
            },
        );
        let home = format!("{HOME_ROOT}/{account}");
        let cols = [
            (home.clone(), CalType::Folder),
            (format!("{home}/calendar"), CalType::Calendar),
            (format!("{home}/Inbox"), CalType::Inbox),
            (format!("{home}/Outbox"), CalType::Outbox),
        ];
        for (path, cal_type) in cols {
            let col = inner.new_collection(&path, cal_type, Some(href.clone()));
            inner.insert_collection(col);
        }
        href
    }

    /// Add a group principal with the given member accounts.
    pub fn add_group(&self, account: &str, members: &[&str]) -> String {
        let inner = &mut *self.inner.lock();
        let href = format!("{GROUPS_ROOT}/{account}");
        inner.principals.insert(
            href.clone(),
            PrincipalEntry {
                principal: Principal {
                    href: href.clone(),
                    account: account.to_string(),
                    kind: PrincipalKind::Group,
                },
                display_name: account.to_string(),
                cal_address: format!("mailto:{account}@example.com"),
                members: members.iter().map(|m| format!("{USERS_ROOT}/{m}")).collect(),
            },
        );
        inner.mutated();
        href
    }

    /// Add a collection at `path`; the parent must exist.
    pub fn add_collection(&self, path: &str, cal_type: CalType) -> StoreResult<()> {
        let inner = &mut *self.inner.lock();
        let parent = parent_of(path).ok_or(StoreError::Exists)?;
        let owner = match inner.collections.get(&parent) {
            Some(p) => p.owner.clone(),
            None => return Err(StoreError::Conflict),
        };
        if inner.collections.contains_key(path) {
            return Err(StoreError::Exists);
        }
        let col = inner.new_collection(path, cal_type, owner);
        inner.insert_collection(col);
        Ok(())
    }

    /// Add an alias collection at `path` pointing at `target`.
    pub fn add_alias(&self, path: &str, target: &str) -> StoreResult<()> {
        self.add_collection(path, CalType::Folder)?;
        let inner = &mut *self.inner.lock();
        let cal_type = inner
            .collections
            .get(target)
            .map(|t| t.cal_type)
            .unwrap_or(CalType::Folder);
        if let Some(col) = inner.collections.get_mut(path) {
            col.alias_target = Some(target.to_string());
            col.cal_type = cal_type;
        }
        Ok(())
    }

    /// Set the principal that requests run as.
    pub fn set_current_principal(&self, account: Option<&str>) {
        let inner = &mut *self.inner.lock();
        inner.current = account.map(|a| format!("{USERS_ROOT}/{a}"));
    }

    /// Deny write access at and below `path`.
    pub fn set_read_only(&self, path: &str) {
        self.inner.lock().read_only.insert(path.to_string());
    }

    pub fn set_max_entity_size(&self, size: u64) {
        self.inner.lock().max_entity_size = size;
    }

    /// Changes every time the stored data changes.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Number of rollback() calls so far.
    pub fn rollback_count(&self) -> u64 {
        self.inner.lock().rollbacks
    }
}

impl CalStore for MemStore {
    fn is_principal<'a>(&'a self, path: &'a str) -> StoreFuture<'a, bool> {
        async move {
            let path = trim(path);
            let below = |root: &str| {
                path.strip_prefix(root)
                    .and_then(|rest| rest.strip_prefix('/'))
                    .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
            };
            Ok(below(USERS_ROOT) || below(GROUPS_ROOT))
        }
        .boxed()
    }

    fn get_principal<'a>(&'a self, href: &'a str) -> StoreFuture<'a, Option<Principal>> {
        async move {
            let inner = &*self.inner.lock();
            Ok(inner.principals.get(trim(href)).map(|e| e.principal.clone()))
        }
        .boxed()
    }

    fn current_principal(&self) -> StoreFuture<'_, Option<Principal>> {
        async move {
            let inner = &*self.inner.lock();
            let cur = inner.current.as_ref().and_then(|h| inner.principals.get(h));
            Ok(cur.map(|e| e.principal.clone()))
        }
        .boxed()
    }

    fn get_cal_principal_info<'a>(&'a self, principal: &'a Principal) -> StoreFuture<'a, CalPrincipalInfo> {
        async move {
            let inner = &*self.inner.lock();
            let entry = inner.principals.get(&principal.href).ok_or(StoreError::NotFound)?;
            Ok(inner.info(entry))
        }
        .boxed()
    }

    fn principal_to_caladdr<'a>(&'a self, principal: &'a Principal) -> StoreFuture<'a, String> {
        async move {
            let inner = &*self.inner.lock();
            let entry = inner.principals.get(&principal.href).ok_or(StoreError::NotFound)?;
            Ok(entry.cal_address.clone())
        }
        .boxed()
    }

    fn caladdr_to_principal<'a>(&'a self, addr: &'a str) -> StoreFuture<'a, Option<Principal>> {
        async move {
            let inner = &*self.inner.lock();
            Ok(inner.entry_by_caladdr(addr).map(|e| e.principal.clone()))
        }
        .boxed()
    }

    fn get_groups<'a>(&'a self, root: Option<&'a str>, principal: &'a Principal) -> StoreFuture<'a, Vec<String>> {
        async move {
            let inner = &*self.inner.lock();
            let groups = inner
                .principals
                .values()
                .filter(|e| e.principal.kind == PrincipalKind::Group)
                .filter(|e| root.is_none_or(|r| is_below(&e.principal.href, trim(r))))
                .filter(|e| e.members.contains(&principal.href))
                .map(|e| e.principal.href.clone())
                .collect();
            Ok(groups)
        }
        .boxed()
    }

    fn get_principal_collection_set<'a>(&'a self, _uri: &'a str) -> StoreFuture<'a, Vec<String>> {
        async move { Ok(vec![format!("{USERS_ROOT}/"), format!("{GROUPS_ROOT}/")]) }.boxed()
    }

    fn get_principals<'a>(
        &'a self,
        uri: &'a str,
        search: &'a PrincipalSearch,
    ) -> StoreFuture<'a, Vec<CalPrincipalInfo>>
    {
        async move {
            let inner = &*self.inner.lock();
            let contains = |value: &str, term: &Option<String>| {
                term.as_ref()
                    .is_none_or(|t| value.to_lowercase().contains(&t.to_lowercase()))
            };
            let found = inner
                .principals
                .values()
                .filter(|e| is_below(&e.principal.href, trim(uri)))
                .filter(|e| contains(&e.display_name, &search.display_name))
                .filter(|e| contains(&e.cal_address, &search.cal_address))
                .map(|e| inner.info(e))
                .collect();
            Ok(found)
        }
        .boxed()
    }

    fn get_collection<'a>(&'a self, path: &'a str) -> StoreFuture<'a, Option<CalCollection>> {
        async move {
            let inner = &*self.inner.lock();
            Ok(inner.collections.get(trim(path)).cloned())
        }
        .boxed()
    }

    fn new_collection_object<'a>(&'a self, is_calendar: bool, parent_path: &'a str) -> StoreFuture<'a, CalCollection> {
        async move {
            let inner = &mut *self.inner.lock();
            let cal_type = if is_calendar { CalType::Calendar } else { CalType::Folder };
            let owner = inner.current.clone();
            let mut col = inner.new_collection("", cal_type, owner);
            col.name.clear();
            col.parent_path = Some(trim(parent_path).to_string());
            Ok(col)
        }
        .boxed()
    }

    fn make_collection(&self, col: CalCollection) -> StoreFuture<'_, StatusCode> {
        async move {
            trace!("STORE: make_collection {}", col.path);
            let inner = &mut *self.inner.lock();
            if inner.collections.contains_key(&col.path) {
                return Ok(StatusCode::METHOD_NOT_ALLOWED);
            }
            let parent = match col.parent_path.as_ref().and_then(|p| inner.collections.get(p)) {
                Some(p) => p,
                None => return Ok(StatusCode::CONFLICT),
            };
            if parent.cal_type.holds_components() {
                return Ok(StatusCode::FORBIDDEN);
            }
            if inner.read_only.iter().any(|r| is_below(&col.path, r)) {
                return Ok(StatusCode::FORBIDDEN);
            }
            let parent_path = parent.path.clone();
            inner.insert_collection(col);
            inner.touch(&parent_path);
            Ok(StatusCode::CREATED)
        }
        .boxed()
    }

    fn update_collection(&self, col: CalCollection) -> StoreFuture<'_, ()> {
        async move {
            let inner = &mut *self.inner.lock();
            if !inner.collections.contains_key(&col.path) {
                return Err(StoreError::NotFound);
            }
            let path = col.path.clone();
            inner.collections.insert(path.clone(), col);
            inner.touch(&path);
            inner.mutated();
            Ok(())
        }
        .boxed()
    }

    fn delete_collection<'a>(&'a self, col: &'a CalCollection) -> StoreFuture<'a, ()> {
        async move {
            trace!("STORE: delete_collection {}", col.path);
            let inner = &mut *self.inner.lock();
            if !inner.collections.contains_key(&col.path) {
                return Err(StoreError::NotFound);
            }
            if col.path == "/" {
                return Err(StoreError::Forbidden);
            }
            inner.remove_subtree(&col.path);
            if let Some(ref parent) = col.parent_path {
                inner.touch(parent);
            }
            inner.mutated();
            Ok(())
        }
        .boxed()
    }

    fn copy_move_collection<'a>(
        &'a self,
        from: &'a CalCollection,
        to: &'a CalCollection,
        copy: bool,
        overwrite: bool,
    ) -> StoreFuture<'a, bool>
    {
        async move {
            trace!("STORE: copy_move_collection {} -> {} (copy {})", from.path, to.path, copy);
            let inner = &mut *self.inner.lock();
            if is_below(&to.path, &from.path) {
                return Err(StoreError::Forbidden);
            }
            let to_parent = parent_of(&to.path).ok_or(StoreError::Forbidden)?;
            if !inner.collections.contains_key(&to_parent) {
                return Err(StoreError::Conflict);
            }
            let existed = inner.collections.contains_key(&to.path);
            if existed && !overwrite {
                return Err(StoreError::Exists);
            }
            if existed {
                inner.remove_subtree(&to.path);
            }
            for path in inner.subtree(&from.path) {
                let new_path = format!("{}{}", to.path, &path[from.path.len()..]);
                let tag = inner.new_tag();
                let Some(mut col) = inner.collections.get(&path).cloned() else {
                    continue;
                };
                col.path = new_path.clone();
                col.name = name_of(&new_path).to_string();
                col.parent_path = parent_of(&new_path);
                col.etag = tag;
                inner.collections.insert(new_path.clone(), col);
                if let Some(mut evs) = inner.events.get(&path).cloned() {
                    for ev in evs.values_mut() {
                        ev.parent_path = new_path.clone();
                    }
                    inner.events.insert(new_path.clone(), evs);
                }
                if let Some(mut files) = inner.resources.get(&path).cloned() {
                    for f in files.values_mut() {
                        f.parent_path = new_path.clone();
                    }
                    inner.resources.insert(new_path.clone(), files);
                }
            }
            if !copy {
                inner.remove_subtree(&from.path);
                if let Some(ref p) = from.parent_path {
                    inner.touch(p);
                }
            }
            inner.touch(&to_parent);
            inner.mutated();
            Ok(!existed)
        }
        .boxed()
    }

    fn get_collections<'a>(&'a self, col: &'a CalCollection) -> StoreFuture<'a, Vec<CalCollection>> {
        async move {
            let inner = &*self.inner.lock();
            let children = inner
                .collections
                .values()
                .filter(|c| c.parent_path.as_deref() == Some(col.path.as_str()))
                .cloned()
                .collect();
            Ok(children)
        }
        .boxed()
    }

    fn resolve_alias<'a>(&'a self, col: &'a CalCollection) -> StoreFuture<'a, Option<CalCollection>> {
        async move {
            let inner = &*self.inner.lock();
            let target = col.alias_target.as_ref().and_then(|t| inner.collections.get(t));
            Ok(target.filter(|t| !t.is_alias()).cloned())
        }
        .boxed()
    }

    fn get_event<'a>(&'a self, col: &'a CalCollection, name: &'a str) -> StoreFuture<'a, Option<CalEvent>> {
        async move {
            let inner = &*self.inner.lock();
            Ok(inner.events.get(&col.path).and_then(|m| m.get(name)).cloned())
        }
        .boxed()
    }

    fn add_event(&self, mut ev: CalEvent, no_invites: bool) -> StoreFuture<'_, ()> {
        async move {
            trace!("STORE: add_event {} (no_invites {})", ev.path(), no_invites);
            let inner = &mut *self.inner.lock();
            if !inner.collections.contains_key(&ev.parent_path) {
                return Err(StoreError::NotFound);
            }
            if inner.read_only.iter().any(|r| is_below(&ev.parent_path, r)) {
                return Err(StoreError::Forbidden);
            }
            let events = inner.events.entry(ev.parent_path.clone()).or_default();
            if events.contains_key(&ev.name) {
                return Err(StoreError::Exists);
            }
            if events.values().any(|e| e.uid == ev.uid) {
                return Err(StoreError::Conflict);
            }
            inner.check_entity_size(ev.calendar.to_ical_string().len())?;
            let now = SystemTime::now();
            ev.etag = inner.new_tag();
            ev.is_new = false;
            ev.created = now;
            ev.last_modified = now;
            let parent = ev.parent_path.clone();
            inner
                .events
                .entry(parent.clone())
                .or_default()
                .insert(ev.name.clone(), ev);
            inner.touch(&parent);
            inner.mutated();
            Ok(())
        }
        .boxed()
    }

    fn update_event(&self, mut ev: CalEvent) -> StoreFuture<'_, ()> {
        async move {
            trace!("STORE: update_event {}", ev.path());
            let inner = &mut *self.inner.lock();
            if inner.read_only.iter().any(|r| is_below(&ev.parent_path, r)) {
                return Err(StoreError::Forbidden);
            }
            inner.check_entity_size(ev.calendar.to_ical_string().len())?;
            let tag = inner.new_tag();
            let old = inner
                .events
                .get_mut(&ev.parent_path)
                .and_then(|m| m.get_mut(&ev.name))
                .ok_or(StoreError::NotFound)?;
            ev.etag = tag;
            ev.is_new = false;
            ev.created = old.created;
            ev.last_modified = SystemTime::now();
            *old = ev;
            inner.mutated();
            Ok(())
        }
        .boxed()
    }

    fn delete_event<'a>(&'a self, ev: &'a CalEvent, schedule_reply: bool) -> StoreFuture<'a, ()> {
        async move {
            trace!("STORE: delete_event {} (schedule_reply {})", ev.path(), schedule_reply);
            let inner = &mut *self.inner.lock();
            if inner.read_only.iter().any(|r| is_below(&ev.parent_path, r)) {
                return Err(StoreError::Forbidden);
            }
            inner
                .events
                .get_mut(&ev.parent_path)
                .and_then(|m| m.remove(&ev.name))
                .ok_or(StoreError::NotFound)?;
            inner.touch(&ev.parent_path);
            inner.mutated();
            Ok(())
        }
        .boxed()
    }

    fn get_events<'a>(
        &'a self,
        col: &'a CalCollection,
        filter: Option<&'a ComponentFilter>,
    ) -> StoreFuture<'a, Vec<CalEvent>>
    {
        async move {
            let inner = &*self.inner.lock();
            let events = inner
                .events
                .get(&col.path)
                .into_iter()
                .flat_map(|m| m.values())
                .filter(|ev| filter.is_none_or(|f| f.matches(&ev.calendar)))
                .cloned()
                .collect();
            Ok(events)
        }
        .boxed()
    }

    fn copy_move_event<'a>(
        &'a self,
        ev: &'a CalEvent,
        to: &'a CalCollection,
        name: &'a str,
        copy: bool,
        overwrite: bool,
    ) -> StoreFuture<'a, bool>
    {
        async move {
            trace!("STORE: copy_move_event {} -> {}/{}", ev.path(), to.path, name);
            let inner = &mut *self.inner.lock();
            if !to.cal_type.holds_components() {
                return Err(StoreError::Forbidden);
            }
            if !inner.collections.contains_key(&to.path) {
                return Err(StoreError::Conflict);
            }
            let mut copied = inner
                .events
                .get(&ev.parent_path)
                .and_then(|m| m.get(&ev.name))
                .cloned()
                .ok_or(StoreError::NotFound)?;
            let existed = inner.events.get(&to.path).is_some_and(|m| m.contains_key(name));
            if existed && !overwrite {
                return Err(StoreError::Exists);
            }
            // another entity with this uid in the destination would be a duplicate.
            let clash = inner.events.get(&to.path).is_some_and(|m| {
                m.values()
                    .any(|e| e.uid == copied.uid && e.name != name && !(e.parent_path == ev.parent_path && e.name == ev.name))
            });
            if clash {
                return Err(StoreError::Conflict);
            }
            if !copy {
                if let Some(m) = inner.events.get_mut(&ev.parent_path) {
                    m.remove(&ev.name);
                }
                inner.touch(&ev.parent_path);
            }
            copied.name = name.to_string();
            copied.parent_path = to.path.clone();
            copied.etag = inner.new_tag();
            copied.last_modified = SystemTime::now();
            inner
                .events
                .entry(to.path.clone())
                .or_default()
                .insert(name.to_string(), copied);
            inner.touch(&to.path);
            inner.mutated();
            Ok(!existed)
        }
        .boxed()
    }

    fn new_resource_object<'a>(&'a self, parent_path: &'a str) -> StoreFuture<'a, CalResource> {
        async move {
            let inner = &*self.inner.lock();
            let now = SystemTime::now();
            Ok(CalResource {
                name: String::new(),
                parent_path: trim(parent_path).to_string(),
                content_type: "application/octet-stream".to_string(),
                content: Bytes::new(),
                etag: String::new(),
                is_new: true,
                owner: inner.current.clone(),
                created: now,
                last_modified: now,
            })
        }
        .boxed()
    }

    fn get_file<'a>(&'a self, col: &'a CalCollection, name: &'a str) -> StoreFuture<'a, Option<CalResource>> {
        async move {
            let inner = &*self.inner.lock();
            Ok(inner.resources.get(&col.path).and_then(|m| m.get(name)).cloned())
        }
        .boxed()
    }

    fn put_file<'a>(&'a self, col: &'a CalCollection, mut res: CalResource) -> StoreFuture<'a, ()> {
        async move {
            trace!("STORE: put_file {}/{}", col.path, res.name);
            let inner = &mut *self.inner.lock();
            if !inner.collections.contains_key(&col.path) {
                return Err(StoreError::NotFound);
            }
            if inner.read_only.iter().any(|r| is_below(&col.path, r)) {
                return Err(StoreError::Forbidden);
            }
            inner.check_entity_size(res.content.len())?;
            let files = inner.resources.entry(col.path.clone()).or_default();
            if files.contains_key(&res.name) {
                return Err(StoreError::Exists);
            }
            res.parent_path = col.path.clone();
            res.is_new = false;
            res.etag = inner.new_tag();
            inner
                .resources
                .entry(col.path.clone())
                .or_default()
                .insert(res.name.clone(), res);
            inner.touch(&col.path);
            inner.mutated();
            Ok(())
        }
        .boxed()
    }

    fn update_file(&self, mut res: CalResource, update_content: bool) -> StoreFuture<'_, ()> {
        async move {
            trace!("STORE: update_file {}", res.path());
            let inner = &mut *self.inner.lock();
            if inner.read_only.iter().any(|r| is_below(&res.parent_path, r)) {
                return Err(StoreError::Forbidden);
            }
            inner.check_entity_size(res.content.len())?;
            let tag = inner.new_tag();
            let old = inner
                .resources
                .get_mut(&res.parent_path)
                .and_then(|m| m.get_mut(&res.name))
                .ok_or(StoreError::NotFound)?;
            if !update_content {
                res.content = old.content.clone();
            }
            res.etag = tag;
            res.created = old.created;
            res.last_modified = SystemTime::now();
            *old = res;
            inner.mutated();
            Ok(())
        }
        .boxed()
    }

    fn delete_file<'a>(&'a self, res: &'a CalResource) -> StoreFuture<'a, ()> {
        async move {
            let inner = &mut *self.inner.lock();
            if inner.read_only.iter().any(|r| is_below(&res.parent_path, r)) {
                return Err(StoreError::Forbidden);
            }
            inner
                .resources
                .get_mut(&res.parent_path)
                .and_then(|m| m.remove(&res.name))
                .ok_or(StoreError::NotFound)?;
            inner.touch(&res.parent_path);
            inner.mutated();
            Ok(())
        }
        .boxed()
    }

    fn get_files<'a>(&'a self, col: &'a CalCollection) -> StoreFuture<'a, Vec<CalResource>> {
        async move {
            let inner = &*self.inner.lock();
            Ok(inner
                .resources
                .get(&col.path)
                .into_iter()
                .flat_map(|m| m.values().cloned())
                .collect())
        }
        .boxed()
    }

    fn copy_move_file<'a>(
        &'a self,
        res: &'a CalResource,
        to_path: &'a str,
        name: &'a str,
        copy: bool,
        overwrite: bool,
    ) -> StoreFuture<'a, bool>
    {
        async move {
            let inner = &mut *self.inner.lock();
            let to_path = trim(to_path).to_string();
            match inner.collections.get(&to_path) {
                Some(c) if c.cal_type.holds_components() => return Err(StoreError::Forbidden),
                Some(_) => {}
                None => return Err(StoreError::Conflict),
            }
            let mut copied = inner
                .resources
                .get(&res.parent_path)
                .and_then(|m| m.get(&res.name))
                .cloned()
                .ok_or(StoreError::NotFound)?;
            let existed = inner.resources.get(&to_path).is_some_and(|m| m.contains_key(name));
            if existed && !overwrite {
                return Err(StoreError::Exists);
            }
            if !copy {
                if let Some(m) = inner.resources.get_mut(&res.parent_path) {
                    m.remove(&res.name);
                }
                inner.touch(&res.parent_path);
            }
            copied.name = name.to_string();
            copied.parent_path = to_path.clone();
            copied.etag = inner.new_tag();
            inner
                .resources
                .entry(to_path.clone())
                .or_default()
                .insert(name.to_string(), copied);
            inner.touch(&to_path);
            inner.mutated();
            Ok(!existed)
        }
        .boxed()
    }

    fn get_free_busy<'a>(
        &'a self,
        col: &'a CalCollection,
        depth: u32,
        range: TimeRange,
    ) -> StoreFuture<'a, CalEvent>
    {
        async move {
            let inner = &*self.inner.lock();
            let periods = inner.busy_periods(&col.path, depth, &range);
            Ok(freebusy_event(&periods, &range, None, None))
        }
        .boxed()
    }

    fn request_free_busy<'a>(&'a self, ev: &'a CalEvent) -> StoreFuture<'a, Vec<SchedRecipientResult>> {
        async move {
            let inner = &*self.inner.lock();
            let fb = ev
                .calendar
                .items()
                .find(|c| c.name == "VFREEBUSY")
                .ok_or_else(|| StoreError::BadData("no VFREEBUSY in request".to_string()))?;
            let range = TimeRange {
                start: fb.property_value("DTSTART").and_then(parse_ical_datetime),
                end: fb.property_value("DTEND").and_then(parse_ical_datetime),
            };
            let mut results = Vec::new();
            for recipient in &ev.recipients {
                let entry = inner
                    .entry_by_caladdr(recipient)
                    .filter(|e| e.principal.kind == PrincipalKind::User);
                let result = match entry {
                    Some(e) => {
                        let home = format!("{HOME_ROOT}/{}", e.principal.account);
                        let periods = inner.busy_periods(&home, 1, &range);
                        let mut fbev = freebusy_event(&periods, &range, ev.originator.as_deref(), Some(recipient));
                        fbev.schedule_method = Some("REPLY".to_string());
                        SchedRecipientResult {
                            recipient: recipient.clone(),
                            status: "2.0;Success".to_string(),
                            freebusy: Some(fbev),
                        }
                    }
                    None => SchedRecipientResult {
                        recipient: recipient.clone(),
                        status: "3.7;Invalid calendar user".to_string(),
                        freebusy: None,
                    },
                };
                results.push(result);
            }
            Ok(results)
        }
        .boxed()
    }

    fn schedule<'a>(&'a self, ev: &'a CalEvent) -> StoreFuture<'a, Vec<SchedRecipientResult>> {
        async move {
            let inner = &mut *self.inner.lock();
            let mut results = Vec::new();
            for recipient in &ev.recipients {
                let inbox = inner
                    .entry_by_caladdr(recipient)
                    .filter(|e| e.principal.kind == PrincipalKind::User)
                    .map(|e| format!("{HOME_ROOT}/{}/Inbox", e.principal.account))
                    .filter(|p| inner.collections.contains_key(p));
                let status = match inbox {
                    Some(inbox) => {
                        let name = format!("{}.ics", uuid::Uuid::new_v4());
                        let mut delivered = ev.clone();
                        delivered.name = name.clone();
                        delivered.parent_path = inbox.clone();
                        delivered.etag = inner.new_tag();
                        delivered.is_new = false;
                        inner.events.entry(inbox.clone()).or_default().insert(name, delivered);
                        inner.touch(&inbox);
                        inner.mutated();
                        "2.0;Success"
                    }
                    None => "3.7;Invalid calendar user",
                };
                results.push(SchedRecipientResult {
                    recipient: recipient.clone(),
                    status: status.to_string(),
                    freebusy: None,
                });
            }
            Ok(results)
        }
        .boxed()
    }

    fn from_ical<'a>(
        &'a self,
        col: Option<&'a CalCollection>,
        text: &'a str,
        mode: IcalResultType,
    ) -> StoreFuture<'a, ParsedCalendar>
    {
        async move {
            validate_calendar_data(text).map_err(StoreError::BadData)?;
            let cal = ICalComponent::parse(text).map_err(|e| StoreError::BadData(e.to_string()))?;
            if cal.name != "VCALENDAR" {
                return Err(StoreError::BadData("not a VCALENDAR".to_string()));
            }
            let method = cal.property_value("METHOD").map(|m| m.to_string());
            if mode == IcalResultType::TimeZone {
                let mut tzs = cal.components.iter().filter(|c| c.is_timezone());
                let tz = tzs.next().cloned();
                if tz.is_none() || tzs.next().is_some() || cal.items().next().is_some() {
                    return Err(StoreError::BadData("expected exactly one VTIMEZONE".to_string()));
                }
                return Ok(ParsedCalendar {
                    method,
                    entities: Vec::new(),
                    timezone: tz,
                });
            }

            // group the items by uid; overrides share the uid of their master.
            let mut groups: Vec<(String, String)> = Vec::new();
            for item in cal.items() {
                let uid = item
                    .uid()
                    .ok_or_else(|| StoreError::BadData(format!("{} without UID", item.name)))?;
                if !groups.iter().any(|(u, _)| u == uid) {
                    groups.push((uid.to_string(), item.name.clone()));
                }
            }
            if groups.len() != 1 {
                return Err(StoreError::BadData(format!(
                    "expected exactly one calendar object, found {}",
                    groups.len()
                )));
            }
            let (uid, comp_name) = groups.remove(0);
            let entity = match comp_name.as_str() {
                "VEVENT" | "VTODO" => {
                    let parent = col.map(|c| c.path.as_str()).unwrap_or("");
                    let mut ev = CalEvent::new(parent, "", &uid, cal);
                    ev.schedule_method = method.clone();
                    if let Some(col) = col {
                        let inner = &*self.inner.lock();
                        if let Some(old) = inner.event_by_uid(&col.path, &uid) {
                            ev.is_new = false;
                            ev.name = old.name.clone();
                            ev.etag = old.etag.clone();
                            ev.created = old.created;
                        }
                    }
                    CalEntity::Event(ev)
                }
                _ => CalEntity::Other(comp_name.clone()),
            };
            Ok(ParsedCalendar {
                method,
                entities: vec![entity],
                timezone: None,
            })
        }
        .boxed()
    }

    fn check_access<'a>(&'a self, path: &'a str, privilege: Privilege) -> StoreFuture<'a, bool> {
        async move {
            let inner = &*self.inner.lock();
            if privilege == Privilege::Read {
                return Ok(true);
            }
            Ok(!inner.read_only.iter().any(|r| is_below(trim(path), r)))
        }
        .boxed()
    }

    fn get_max_user_entity_size(&self) -> StoreFuture<'_, u64> {
        async move { Ok(self.inner.lock().max_entity_size) }.boxed()
    }

    fn rollback(&self) -> StoreFuture<'_, ()> {
        async move {
            debug!("STORE: rollback");
            self.inner.lock().rollbacks += 1;
            Ok(())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVENT: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//Test//Test//EN\r\nBEGIN:VEVENT\r\nUID:ev-1\r\nDTSTART:20240105T120000Z\r\nDTEND:20240105T130000Z\r\nSUMMARY:Test\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

    async fn parse_one(store: &MemStore, col: &CalCollection, text: &str) -> CalEvent {
        let parsed = store
            .from_ical(Some(col), text, IcalResultType::OneComponent)
            .await
            .unwrap();
        match parsed.entities.into_iter().next() {
            Some(CalEntity::Event(ev)) => ev,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn skeleton_and_principals() {
        let store = MemStore::new();
        let href = store.add_user("alice");
        assert_eq!(href, "/principals/users/alice");
        assert!(store.is_principal("/principals/users/alice").await.unwrap());
        assert!(store.is_principal("/principals/users/alice/").await.unwrap());
        assert!(!store.is_principal("/principals/users").await.unwrap());
        assert!(!store.is_principal("/user/alice").await.unwrap());
        let cal = store.get_collection("/user/alice/calendar").await.unwrap().unwrap();
        assert_eq!(cal.cal_type, CalType::Calendar);
        assert_eq!(cal.owner.as_deref(), Some("/principals/users/alice"));
        let p = store.caladdr_to_principal("mailto:alice@example.com").await.unwrap();
        assert_eq!(p.map(|p| p.account), Some("alice".to_string()));
    }

    #[tokio::test]
    async fn event_lifecycle() {
        let store = MemStore::new();
        store.add_user("alice");
        let col = store.get_collection("/user/alice/calendar").await.unwrap().unwrap();
        let mut ev = parse_one(&store, &col, EVENT).await;
        assert!(ev.is_new);
        ev.name = "e.ics".to_string();
        store.add_event(ev, false).await.unwrap();

        // same uid again is recognized as an update of the stored one.
        let again = parse_one(&store, &col, EVENT).await;
        assert!(!again.is_new);
        assert_eq!(again.name, "e.ics");

        let stored = store.get_event(&col, "e.ics").await.unwrap().unwrap();
        let tag = stored.etag.clone();
        store.update_event(stored).await.unwrap();
        let updated = store.get_event(&col, "e.ics").await.unwrap().unwrap();
        assert_ne!(updated.etag, tag);

        store.delete_event(&updated, false).await.unwrap();
        assert!(store.get_event(&col, "e.ics").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_two_objects() {
        let store = MemStore::new();
        store.add_user("alice");
        let col = store.get_collection("/user/alice/calendar").await.unwrap().unwrap();
        let text = EVENT.replace(
            "END:VCALENDAR",
            "BEGIN:VEVENT\r\nUID:ev-2\r\nDTSTART:20240105T120000Z\r\nEND:VEVENT\r\nEND:VCALENDAR",
        );
        let res = store.from_ical(Some(&col), &text, IcalResultType::OneComponent).await;
        assert!(matches!(res, Err(StoreError::BadData(_))));
    }

    #[tokio::test]
    async fn collection_copy_and_delete() {
        let store = MemStore::new();
        store.add_user("alice");
        let col = store.get_collection("/user/alice/calendar").await.unwrap().unwrap();
        let mut ev = parse_one(&store, &col, EVENT).await;
        ev.name = "e.ics".to_string();
        store.add_event(ev, true).await.unwrap();

        let mut to = store.new_collection_object(false, "/user/alice").await.unwrap();
        to.path = "/user/alice/copy".to_string();
        to.name = "copy".to_string();
        assert!(store.copy_move_collection(&col, &to, true, false).await.unwrap());
        let copied = store.get_collection("/user/alice/copy").await.unwrap().unwrap();
        assert_eq!(copied.cal_type, CalType::Calendar);
        assert!(store.get_event(&copied, "e.ics").await.unwrap().is_some());

        let res = store.copy_move_collection(&col, &to, true, false).await;
        assert_eq!(res, Err(StoreError::Exists));

        store.delete_collection(&copied).await.unwrap();
        assert!(store.get_collection("/user/alice/copy").await.unwrap().is_none());
        assert!(store.get_event(&col, "e.ics").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn free_busy() {
        let store = MemStore::new();
        store.add_user("alice");
        let col = store.get_collection("/user/alice/calendar").await.unwrap().unwrap();
        let mut ev = parse_one(&store, &col, EVENT).await;
        ev.name = "e.ics".to_string();
        store.add_event(ev, true).await.unwrap();
        let range = TimeRange::parse(Some("20240105T000000Z"), Some("20240106T000000Z")).unwrap();
        let fb = store.get_free_busy(&col, 0, range).await.unwrap();
        let comp = fb.component().unwrap();
        assert_eq!(comp.name, "VFREEBUSY");
        assert_eq!(
            comp.property_value("FREEBUSY"),
            Some("20240105T120000Z/20240105T130000Z")
        );
    }
}
