//! Selector based patching of the xCal form of a calendar object.
//!
//! A batch is a list of add / replace / remove operations. Each operation
//! names its target with a selector, a small absolute XPath subset:
//!
//! ```text
//!   /x:icalendar/x:vcalendar/x:components/x:vevent[x:properties/x:uid/x:text='abc']/x:properties
//! ```
//!
//! Steps are `prefix:name`, `name` (matches the local name in any
//! namespace) or `*`, each optionally followed by predicates: `[n]`
//! (1-based position), `[rel/path='literal']` or `[rel/path]`.
//!
//! The batch runs against a scratch copy of the document. Only when every
//! operation applied is the result parsed and stored, in a single update.
use std::collections::HashMap;

use xmltree::{Element, XMLNode};

use crate::errors::DavError;
use crate::ical::NS_XCAL_URI;
use crate::node::Node;
use crate::store::{CalEntity, CalStore, IcalResultType};
use crate::xmltree_ext::ElementExt;
use crate::DavResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    Add,
    Replace,
    Remove,
}

/// What a fragment adds: decides which container it may go into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    Component,
    Property,
    Parameter,
}

impl FragmentKind {
    fn container(&self) -> &'static str {
        match self {
            FragmentKind::Component => "components",
            FragmentKind::Property => "properties",
            FragmentKind::Parameter => "parameters",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub kind: FragmentKind,
    pub element: Element,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatchOperation {
    pub selector: String,
    pub kind: PatchKind,
    /// Present for add and replace.
    pub payload: Option<Fragment>,
}

/// Operations plus the prefix bindings their selectors use.
#[derive(Debug, Clone, Default)]
pub struct PatchBatch {
    pub namespaces: HashMap<String, String>,
    pub ops: Vec<PatchOperation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatchOutcome {
    pub status: PatchStatus,
    pub message: Option<String>,
}

impl PatchOutcome {
    fn ok() -> PatchOutcome {
        PatchOutcome {
            status: PatchStatus::Ok,
            message: None,
        }
    }

    fn error(msg: impl Into<String>) -> PatchOutcome {
        PatchOutcome {
            status: PatchStatus::Error,
            message: Some(msg.into()),
        }
    }
}

/// Why a batch did not apply.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchError(pub String);

impl std::fmt::Display for PatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for PatchError {}

fn perr(msg: impl Into<String>) -> PatchError {
    PatchError(msg.into())
}

impl PatchBatch {
    /// Read the operations from an `updates` element. Prefix bindings in
    /// scope at that element are added to `namespaces` unless already bound.
    pub fn parse(updates: &Element, namespaces: HashMap<String, String>) -> DavResult<PatchBatch> {
        let mut namespaces = namespaces;
        if let Some(ref ns) = updates.namespaces {
            for (prefix, uri) in ns {
                if !prefix.is_empty() {
                    namespaces
                        .entry(prefix.to_string())
                        .or_insert_with(|| uri.to_string());
                }
            }
        }

        let mut ops = Vec::new();
        for elem in updates.child_elements() {
            let kind = match elem.name.as_str() {
                "add" => PatchKind::Add,
                "replace" => PatchKind::Replace,
                "remove" => PatchKind::Remove,
                other => return Err(DavError::BadRequest(format!("unknown update {other}"))),
            };
            let selector = elem
                .attributes
                .get("sel")
                .cloned()
                .ok_or_else(|| DavError::BadRequest(format!("{} without sel", elem.name)))?;
            let payload = if kind == PatchKind::Remove {
                None
            } else {
                Some(parse_fragment(elem)?)
            };
            ops.push(PatchOperation {
                selector,
                kind,
                payload,
            });
        }
        Ok(PatchBatch { namespaces, ops })
    }
}

fn parse_fragment(op: &Element) -> DavResult<Fragment> {
    let mut holders = op.child_elements();
    let holder = holders
        .next()
        .ok_or_else(|| DavError::BadRequest(format!("{} without a value", op.name)))?;
    if holders.next().is_some() {
        return Err(DavError::BadRequest(format!("{} with more than one value", op.name)));
    }
    let kind = match holder.name.as_str() {
        "component" => FragmentKind::Component,
        "property" => FragmentKind::Property,
        "parameter" => FragmentKind::Parameter,
        other => return Err(DavError::BadRequest(format!("unknown value type {other}"))),
    };
    let mut values = holder.child_elements();
    let element = match (values.next(), values.next()) {
        (Some(e), None) => e.clone(),
        _ => return Err(DavError::BadRequest(format!("{} needs exactly one element", holder.name))),
    };
    Ok(Fragment { kind, element })
}

//
// Selectors.
//

#[derive(Debug, Clone, PartialEq)]
enum NameTest {
    Any,
    Local(String),
    Qualified { ns: String, name: String },
}

#[derive(Debug, Clone, PartialEq)]
enum Predicate {
    Position(usize),
    Equals(Vec<NameTest>, String),
    Exists(Vec<NameTest>),
}

#[derive(Debug, Clone, PartialEq)]
struct Step {
    test: NameTest,
    predicates: Vec<Predicate>,
}

// split on `sep`, but not inside brackets or quotes.
fn split_top(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '[') => depth += 1,
            (None, ']') => depth = depth.saturating_sub(1),
            (None, c) if c == sep && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn parse_name_test(s: &str, namespaces: &HashMap<String, String>) -> Result<NameTest, PatchError> {
    let s = s.trim();
    if s == "*" {
        return Ok(NameTest::Any);
    }
    let valid = |n: &str| !n.is_empty() && !n.contains(|c: char| c.is_whitespace() || "[]'\"=/".contains(c));
    match s.split_once(':') {
        Some((prefix, name)) => {
            let ns = namespaces
                .get(prefix)
                .ok_or_else(|| perr(format!("unbound prefix {prefix}")))?;
            if !valid(name) {
                return Err(perr(format!("bad name test {s}")));
            }
            Ok(NameTest::Qualified {
                ns: ns.clone(),
                name: name.to_string(),
            })
        }
        None if valid(s) => Ok(NameTest::Local(s.to_string())),
        None => Err(perr(format!("bad name test {s}"))),
    }
}

fn parse_rel_path(s: &str, namespaces: &HashMap<String, String>) -> Result<Vec<NameTest>, PatchError> {
    s.split('/').map(|t| parse_name_test(t, namespaces)).collect()
}

fn parse_predicate(s: &str, namespaces: &HashMap<String, String>) -> Result<Predicate, PatchError> {
    let s = s.trim();
    if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
        return match s.parse::<usize>() {
            Ok(n) if n > 0 => Ok(Predicate::Position(n)),
            _ => Err(perr(format!("bad position {s}"))),
        };
    }
    let parts = split_top(s, '=');
    match parts.as_slice() {
        [path] => Ok(Predicate::Exists(parse_rel_path(path, namespaces)?)),
        [path, literal] => {
            let lit = literal.trim();
            let unquoted = lit
                .strip_prefix('\'')
                .and_then(|l| l.strip_suffix('\''))
                .or_else(|| lit.strip_prefix('"').and_then(|l| l.strip_suffix('"')))
                .ok_or_else(|| perr(format!("unquoted literal {lit}")))?;
            Ok(Predicate::Equals(parse_rel_path(path, namespaces)?, unquoted.to_string()))
        }
        _ => Err(perr(format!("bad predicate {s}"))),
    }
}

fn parse_step(s: &str, namespaces: &HashMap<String, String>) -> Result<Step, PatchError> {
    let (name, mut rest) = match s.find('[') {
        Some(pos) => (&s[..pos], &s[pos..]),
        None => (s, ""),
    };
    let test = parse_name_test(name, namespaces)?;
    let mut predicates = Vec::new();
    while !rest.is_empty() {
        let body = rest
            .strip_prefix('[')
            .ok_or_else(|| perr(format!("bad step {s}")))?;
        let end = split_top(body, ']')
            .first()
            .map(|p| p.len())
            .filter(|&l| l < body.len())
            .ok_or_else(|| perr(format!("unterminated predicate in {s}")))?;
        predicates.push(parse_predicate(&body[..end], namespaces)?);
        rest = &body[end + 1..];
    }
    Ok(Step { test, predicates })
}

fn parse_selector(sel: &str, namespaces: &HashMap<String, String>) -> Result<Vec<Step>, PatchError> {
    let rest = sel
        .trim()
        .strip_prefix('/')
        .ok_or_else(|| perr(format!("selector must be absolute: {sel}")))?;
    let steps = split_top(rest, '/')
        .into_iter()
        .map(|s| parse_step(s, namespaces))
        .collect::<Result<Vec<_>, _>>()?;
    if steps.is_empty() {
        return Err(perr("empty selector"));
    }
    Ok(steps)
}

fn name_matches(test: &NameTest, e: &Element) -> bool {
    match test {
        NameTest::Any => true,
        NameTest::Local(n) => e.name == *n,
        NameTest::Qualified { ns, name } => e.name == *name && e.namespace.as_deref().unwrap_or("") == ns,
    }
}

// all nodes reached from `e` by a relative path.
fn rel_nodes<'a>(e: &'a Element, path: &[NameTest]) -> Vec<&'a Element> {
    let mut cur = vec![e];
    for test in path {
        cur = cur
            .into_iter()
            .flat_map(|c| c.child_elements().filter(|ch| name_matches(test, ch)))
            .collect();
    }
    cur
}

fn apply_predicates<'a>(mut cands: Vec<(Vec<usize>, &'a Element)>, preds: &[Predicate]) -> Vec<(Vec<usize>, &'a Element)> {
    for pred in preds {
        cands = match pred {
            Predicate::Position(n) => cands.into_iter().nth(n - 1).into_iter().collect(),
            Predicate::Exists(path) => cands
                .into_iter()
                .filter(|(_, e)| !rel_nodes(e, path).is_empty())
                .collect(),
            Predicate::Equals(path, lit) => cands
                .into_iter()
                .filter(|(_, e)| rel_nodes(e, path).iter().any(|n| n.text_content() == *lit))
                .collect(),
        };
    }
    cands
}

// Evaluate, returning child-index paths from the root.
fn select(root: &Element, steps: &[Step]) -> Vec<Vec<usize>> {
    let Some((first, rest)) = steps.split_first() else {
        return Vec::new();
    };
    let start = if name_matches(&first.test, root) {
        vec![(Vec::new(), root)]
    } else {
        Vec::new()
    };
    let mut cur = apply_predicates(start, &first.predicates);
    for step in rest {
        let mut next = Vec::new();
        for (path, elem) in cur {
            let cands = elem
                .children
                .iter()
                .enumerate()
                .filter_map(|(i, n)| match n {
                    XMLNode::Element(ch) if name_matches(&step.test, ch) => {
                        let mut p = path.clone();
                        p.push(i);
                        Some((p, ch))
                    }
                    _ => None,
                })
                .collect::<Vec<_>>();
            next.extend(apply_predicates(cands, &step.predicates));
        }
        cur = next;
    }
    cur.into_iter().map(|(p, _)| p).collect()
}

fn elem_at_mut<'a>(root: &'a mut Element, path: &[usize]) -> Option<&'a mut Element> {
    let mut cur = root;
    for &i in path {
        cur = match cur.children.get_mut(i)? {
            XMLNode::Element(e) => e,
            _ => return None,
        };
    }
    Some(cur)
}

fn is_container(e: &Element, kind: FragmentKind) -> bool {
    e.name == kind.container() && e.namespace.as_deref().is_none_or(|ns| ns == NS_XCAL_URI)
}

fn apply_op(doc: &mut Element, op: &PatchOperation, namespaces: &HashMap<String, String>) -> Result<(), PatchError> {
    let steps = parse_selector(&op.selector, namespaces)?;
    let mut found = select(doc, &steps);
    if found.len() != 1 {
        return Err(perr(format!("selector {} matched {} nodes", op.selector, found.len())));
    }
    let path = found.remove(0);

    match op.kind {
        PatchKind::Remove => {
            let (last, parent) = path
                .split_last()
                .ok_or_else(|| perr("cannot remove the document root"))?;
            let parent = elem_at_mut(doc, parent).ok_or_else(|| perr("lost parent"))?;
            parent.children.remove(*last);
        }
        PatchKind::Add => {
            let frag = op.payload.as_ref().ok_or_else(|| perr("add without a value"))?;
            let target = elem_at_mut(doc, &path).ok_or_else(|| perr("lost target"))?;
            if !is_container(target, frag.kind) {
                return Err(perr(format!("{} is not a {} container", target.name, frag.kind.container())));
            }
            target.push(frag.element.clone());
        }
        PatchKind::Replace => {
            let frag = op.payload.as_ref().ok_or_else(|| perr("replace without a value"))?;
            let (last, parent_path) = path
                .split_last()
                .ok_or_else(|| perr("cannot replace the document root"))?;
            let parent = elem_at_mut(doc, parent_path).ok_or_else(|| perr("lost parent"))?;
            if !is_container(parent, frag.kind) {
                return Err(perr(format!(
                    "parent {} is not a {} container",
                    parent.name,
                    frag.kind.container()
                )));
            }
            parent.children[*last] = XMLNode::Element(frag.element.clone());
        }
    }
    Ok(())
}

/// Apply a batch to a copy of `doc`. On any failure `doc` stays as it was
/// and nothing of the batch is visible.
pub fn apply_to_document(doc: &Element, batch: &PatchBatch) -> Result<Element, PatchError> {
    let mut scratch = doc.clone();
    for (n, op) in batch.ops.iter().enumerate() {
        debug!("patch: op {} {:?} {}", n, op.kind, op.selector);
        apply_op(&mut scratch, op, &batch.namespaces)?;
    }
    Ok(scratch)
}

/// Number of nodes a selector matches in `doc`.
pub fn count_matches(doc: &Element, selector: &str, namespaces: &HashMap<String, String>) -> Result<usize, PatchError> {
    let steps = parse_selector(selector, namespaces)?;
    Ok(select(doc, &steps).len())
}

/// Patch the calendar object behind a component node.
///
/// An aborted batch rolls back the store and reports `Error`; failing to
/// store the result is a hard error.
pub async fn patch_node(store: &dyn CalStore, node: &mut Node, batch: &PatchBatch) -> DavResult<PatchOutcome> {
    let ev = match node {
        Node::Component(n) => n.event.clone().ok_or(DavError::NotFound)?,
        _ => return Err(DavError::NotFound),
    };
    let doc = store.to_xcal(&ev).await?;

    let patched = match apply_to_document(&doc, batch) {
        Ok(p) => p,
        Err(e) => {
            debug!("patch: batch aborted: {e}");
            if let Err(re) = store.rollback().await {
                error!("patch: rollback failed: {re}");
            }
            return Ok(PatchOutcome::error(e.0));
        }
    };

    let col = node.collection(store, true).await;
    let parsed = store
        .from_xcal(col.as_ref(), &patched, IcalResultType::OneComponent)
        .await?;
    let mut updated = match parsed.entities.into_iter().next() {
        Some(CalEntity::Event(e)) => e,
        _ => return Err(DavError::BadRequest("patched object is not an event".to_string())),
    };
    updated.name = ev.name.clone();
    updated.parent_path = ev.parent_path.clone();
    updated.etag = ev.etag.clone();
    updated.is_new = false;
    store.update_event(updated).await?;

    // reload so the node carries the new etag.
    if let Some(ref col) = col {
        if let Some(fresh) = store.get_event(col, &ev.name).await? {
            if let Node::Component(n) = node {
                n.set_event(fresh);
            }
        }
    }
    Ok(PatchOutcome::ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ical::{xcal_elem, ICalComponent};

    const EVENT: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//Test//Test//EN\r\nBEGIN:VEVENT\r\nUID:p-1\r\nDTSTART:20240105T120000Z\r\nDTEND:20240105T130000Z\r\nSUMMARY:Before\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";

    const SUMMARY: &str = "/x:icalendar/x:vcalendar/x:components/x:vevent/x:properties/x:summary";
    const VEVENT_PROPS: &str = "/x:icalendar/x:vcalendar/x:components/x:vevent/x:properties";

    fn doc() -> Element {
        ICalComponent::parse(EVENT).unwrap().to_xcal()
    }

    fn ns() -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("x".to_string(), NS_XCAL_URI.to_string());
        m
    }

    fn text_prop(name: &str, value: &str) -> Element {
        let mut p = xcal_elem(name);
        let mut t = xcal_elem("text");
        t.push_text(value);
        p.push(t);
        p
    }

    fn op(kind: PatchKind, sel: &str, payload: Option<Fragment>) -> PatchOperation {
        PatchOperation {
            selector: sel.to_string(),
            kind,
            payload,
        }
    }

    fn prop(name: &str, value: &str) -> Option<Fragment> {
        Some(Fragment {
            kind: FragmentKind::Property,
            element: text_prop(name, value),
        })
    }

    fn batch(ops: Vec<PatchOperation>) -> PatchBatch {
        PatchBatch { namespaces: ns(), ops }
    }

    fn summary_of(doc: &Element) -> Option<String> {
        ICalComponent::from_xcal(doc)
            .unwrap()
            .items()
            .next()
            .and_then(|c| c.property_value("SUMMARY").map(|s| s.to_string()))
    }

    #[test]
    fn selectors() {
        let d = doc();
        assert_eq!(count_matches(&d, SUMMARY, &ns()).unwrap(), 1);
        assert_eq!(count_matches(&d, "/icalendar/vcalendar/*", &ns()).unwrap(), 2);
        assert_eq!(count_matches(&d, &format!("{VEVENT_PROPS}/*[1]"), &ns()).unwrap(), 1);
        let by_uid = "/x:icalendar/x:vcalendar/x:components/x:vevent[x:properties/x:uid/x:text='p-1']";
        assert_eq!(count_matches(&d, by_uid, &ns()).unwrap(), 1);
        let by_other = "/x:icalendar/x:vcalendar/x:components/x:vevent[x:properties/x:uid/x:text='nope']";
        assert_eq!(count_matches(&d, by_other, &ns()).unwrap(), 0);
        let has_rrule = "/x:icalendar/x:vcalendar/x:components/x:vevent[x:properties/x:rrule]";
        assert_eq!(count_matches(&d, has_rrule, &ns()).unwrap(), 0);

        assert!(count_matches(&d, "icalendar", &ns()).is_err());
        assert!(count_matches(&d, "/y:icalendar", &ns()).is_err());
        assert!(count_matches(&d, "/x:icalendar[0]", &ns()).is_err());
        assert!(count_matches(&d, "/x:icalendar[x:vcalendar", &ns()).is_err());
    }

    #[test]
    fn replace_summary() {
        let d = doc();
        let out = apply_to_document(&d, &batch(vec![op(PatchKind::Replace, SUMMARY, prop("summary", "After"))])).unwrap();
        assert_eq!(summary_of(&out).as_deref(), Some("After"));
        assert_eq!(summary_of(&d).as_deref(), Some("Before"));
    }

    #[test]
    fn two_matches_abort_the_batch() {
        let d = doc();
        let b = batch(vec![
            op(PatchKind::Replace, SUMMARY, prop("summary", "After")),
            op(PatchKind::Remove, &format!("{VEVENT_PROPS}/*[x:date-time]"), None),
        ]);
        let err = apply_to_document(&d, &b).unwrap_err();
        assert!(err.0.contains("matched 2"), "{err}");
        assert_eq!(summary_of(&d).as_deref(), Some("Before"));
    }

    #[test]
    fn add_needs_the_right_container() {
        let d = doc();
        let add = op(PatchKind::Add, VEVENT_PROPS, prop("description", "More"));
        let out = apply_to_document(&d, &batch(vec![add])).unwrap();
        let cal = ICalComponent::from_xcal(&out).unwrap();
        assert_eq!(cal.items().next().unwrap().property_value("DESCRIPTION"), Some("More"));

        let wrong = op(PatchKind::Add, "/x:icalendar/x:vcalendar/x:components", prop("description", "More"));
        let err = apply_to_document(&d, &batch(vec![wrong])).unwrap_err();
        assert!(err.0.contains("not a properties container"), "{err}");

        // replace checks the parent.
        let wrong = op(PatchKind::Replace, "/x:icalendar/x:vcalendar/x:components/x:vevent", prop("summary", "X"));
        assert!(apply_to_document(&d, &batch(vec![wrong])).is_err());
    }

    #[test]
    fn remove_property() {
        let d = doc();
        let out = apply_to_document(&d, &batch(vec![op(PatchKind::Remove, SUMMARY, None)])).unwrap();
        assert_eq!(summary_of(&out), None);
        assert!(apply_to_document(&d, &batch(vec![op(PatchKind::Remove, "/x:icalendar", None)])).is_err());
    }

    #[test]
    fn parse_updates() {
        let xml = format!(
            r#"<updates xmlns="http://docs.oasis-open.org/ws-calendar/ns/soap" xmlns:x="{NS_XCAL_URI}">
                 <replace sel="{SUMMARY}"><property><x:summary><x:text>After</x:text></x:summary></property></replace>
                 <remove sel="{VEVENT_PROPS}/x:dtend"/>
               </updates>"#
        );
        let elem = Element::parse2(std::io::Cursor::new(xml.into_bytes())).unwrap();
        let b = PatchBatch::parse(&elem, HashMap::new()).unwrap();
        assert_eq!(b.ops.len(), 2);
        assert_eq!(b.namespaces.get("x").map(|s| s.as_str()), Some(NS_XCAL_URI));
        assert_eq!(b.ops[0].payload.as_ref().unwrap().kind, FragmentKind::Property);
        assert!(b.ops[1].payload.is_none());
        let out = apply_to_document(&doc(), &b).unwrap();
        assert_eq!(summary_of(&out).as_deref(), Some("After"));

        let bad = Element::parse2(std::io::Cursor::new(b"<updates><add/></updates>".to_vec())).unwrap();
        assert!(PatchBatch::parse(&bad, HashMap::new()).is_err());
    }

    #[cfg(feature = "memstore")]
    mod store {
        use super::*;
        use crate::davpath::DavPath;
        use crate::memstore::MemStore;
        use crate::resource::{Existence, NodeType};
        use crate::caldav::ComponentFilter;
        use crate::store::{CalCollection, CalEvent, ParsedCalendar, Principal, StoreError, StoreFuture};
        use futures_util::{future, FutureExt};

        // MemStore with a rollback that always fails.
        #[derive(Debug, Clone)]
        struct BrokenRollback(Box<MemStore>);

        impl CalStore for BrokenRollback {
            fn is_principal<'a>(&'a self, path: &'a str) -> StoreFuture<'a, bool> {
                self.0.is_principal(path)
            }

            fn get_principal<'a>(&'a self, href: &'a str) -> StoreFuture<'a, Option<Principal>> {
                self.0.get_principal(href)
            }

            fn get_collection<'a>(&'a self, path: &'a str) -> StoreFuture<'a, Option<CalCollection>> {
                self.0.get_collection(path)
            }

            fn get_collections<'a>(&'a self, col: &'a CalCollection) -> StoreFuture<'a, Vec<CalCollection>> {
                self.0.get_collections(col)
            }

            fn get_event<'a>(&'a self, col: &'a CalCollection, name: &'a str) -> StoreFuture<'a, Option<CalEvent>> {
                self.0.get_event(col, name)
            }

            fn get_events<'a>(
                &'a self,
                col: &'a CalCollection,
                filter: Option<&'a ComponentFilter>,
            ) -> StoreFuture<'a, Vec<CalEvent>> {
                self.0.get_events(col, filter)
            }

            fn from_ical<'a>(
                &'a self,
                col: Option<&'a CalCollection>,
                text: &'a str,
                mode: IcalResultType,
            ) -> StoreFuture<'a, ParsedCalendar> {
                self.0.from_ical(col, text, mode)
            }

            fn rollback(&self) -> StoreFuture<'_, ()> {
                future::ready(Err(StoreError::GeneralFailure)).boxed()
            }
        }

        async fn setup() -> (Box<MemStore>, Node) {
            let store = MemStore::new();
            store.add_user("alice");
            let col = store.get_collection("/user/alice/calendar").await.unwrap().unwrap();
            let parsed = store.from_ical(Some(&col), EVENT, IcalResultType::OneComponent).await.unwrap();
            let Some(CalEntity::Event(mut ev)) = parsed.entities.into_iter().next() else {
                panic!("no event");
            };
            ev.name = "p1.ics".to_string();
            store.add_event(ev, true).await.unwrap();
            let path = DavPath::normalize("/user/alice/calendar/p1.ics").unwrap();
            let node = Node::resolve(&*store, &path, Existence::MustExist, NodeType::Entity, None)
                .await
                .unwrap();
            (store, node)
        }

        async fn stored(store: &MemStore) -> crate::store::CalEvent {
            let col = store.get_collection("/user/alice/calendar").await.unwrap().unwrap();
            store.get_event(&col, "p1.ics").await.unwrap().unwrap()
        }

        #[tokio::test]
        async fn aborted_batch_changes_nothing() {
            let (store, mut node) = setup().await;
            let before = stored(&store).await;
            let generation = store.generation();
            let b = batch(vec![
                op(PatchKind::Replace, SUMMARY, prop("summary", "After")),
                op(PatchKind::Remove, &format!("{VEVENT_PROPS}/*[x:date-time]"), None),
            ]);
            let out = patch_node(&*store, &mut node, &b).await.unwrap();
            assert_eq!(out.status, PatchStatus::Error);
            assert_eq!(stored(&store).await, before);
            assert_eq!(store.generation(), generation);
            assert_eq!(store.rollback_count(), 1);
        }

        #[tokio::test]
        async fn failed_rollback_still_reports_error() {
            let (store, mut node) = setup().await;
            let before = stored(&store).await;
            let broken = BrokenRollback(store.clone());
            let b = batch(vec![op(PatchKind::Remove, &format!("{VEVENT_PROPS}/*[x:date-time]"), None)]);
            let out = patch_node(&broken, &mut node, &b).await.unwrap();
            assert_eq!(out.status, PatchStatus::Error);
            assert_eq!(stored(&store).await, before);
        }

        #[tokio::test]
        async fn replace_is_stored() {
            let (store, mut node) = setup().await;
            let before = stored(&store).await;
            let b = batch(vec![op(PatchKind::Replace, SUMMARY, prop("summary", "After"))]);
            assert_eq!(patch_node(&*store, &mut node, &b).await.unwrap(), PatchOutcome::ok());
            let after = stored(&store).await;
            assert_eq!(after.component().unwrap().property_value("SUMMARY"), Some("After"));
            assert_ne!(after.etag, before.etag);
            assert_eq!(after.name, "p1.ics");

            // the same batch again applies to the new state.
            assert_eq!(patch_node(&*store, &mut node, &b).await.unwrap().status, PatchStatus::Ok);
        }
    }
}
