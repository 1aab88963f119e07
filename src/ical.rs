//! Structured iCalendar data.
//!
//! A calendar object is kept as a tree of [`ICalComponent`]s holding
//! [`ICalProperty`] content lines. The tree can be read from and written
//! to iCalendar text (RFC 5545) and its XML representation, xCal (RFC 6321).
use std::error::Error;

use xmltree::{Element, XMLNode};

use crate::xmltree_ext::ElementExt;

/// The xCal namespace.
pub const NS_XCAL_URI: &str = "urn:ietf:params:xml:ns:icalendar-2.0";

/// Error while reading iCalendar text or xCal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcalError(pub String);

impl Error for IcalError {}

impl std::fmt::Display for IcalError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "invalid calendar data: {}", self.0)
    }
}

fn bad(msg: impl Into<String>) -> IcalError {
    IcalError(msg.into())
}

/// One content line: name, parameters and the raw (still escaped) value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ICalProperty {
    pub name: String,
    pub params: Vec<(String, String)>,
    pub value: String,
}

/// A component (VCALENDAR, VEVENT, VALARM ...) with its properties and
/// sub-components, in document order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ICalComponent {
    pub name: String,
    pub properties: Vec<ICalProperty>,
    pub components: Vec<ICalComponent>,
}

impl ICalProperty {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> ICalProperty {
        ICalProperty {
            name: name.into().to_ascii_uppercase(),
            params: Vec::new(),
            value: value.into(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> ICalProperty {
        self.params.push((name.into().to_ascii_uppercase(), value.into()));
        self
    }

    pub fn get_param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn write(&self, out: &mut String) {
        let mut line = self.name.clone();
        for (name, value) in &self.params {
            line.push(';');
            line.push_str(name);
            line.push('=');
            if value.contains([':', ';', ',']) {
                line.push('"');
                line.push_str(value);
                line.push('"');
            } else {
                line.push_str(value);
            }
        }
        line.push(':');
        line.push_str(&self.value);
        fold_line(&line, out);
    }
}

// fold at 75 octets, never inside a utf-8 sequence.
fn fold_line(line: &str, out: &mut String) {
    let mut width = 0;
    for c in line.chars() {
        let l = c.len_utf8();
        if width + l > 75 {
            out.push_str("\r\n ");
            width = 1;
        }
        out.push(c);
        width += l;
    }
    out.push_str("\r\n");
}

fn unfold(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in text.split('\n') {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        if raw.starts_with(' ') || raw.starts_with('\t') {
            if let Some(last) = lines.last_mut() {
                last.push_str(&raw[1..]);
                continue;
            }
        }
        if !raw.is_empty() {
            lines.push(raw.to_string());
        }
    }
    lines
}

fn parse_line(line: &str) -> Result<ICalProperty, IcalError> {
    let err = || bad(format!("malformed content line {line:?}"));
    let name_end = line.find([';', ':']).ok_or_else(err)?;
    if name_end == 0 {
        return Err(err());
    }
    let mut prop = ICalProperty::new(&line[..name_end], "");
    let mut rest = &line[name_end..];
    while let Some(r) = rest.strip_prefix(';') {
        let eq = r.find('=').ok_or_else(err)?;
        let pname = r[..eq].to_ascii_uppercase();
        rest = &r[eq + 1..];
        let mut pval = String::new();
        loop {
            if let Some(q) = rest.strip_prefix('"') {
                let end = q.find('"').ok_or_else(err)?;
                pval.push_str(&q[..end]);
                rest = &q[end + 1..];
            } else {
                let end = rest.find([';', ':', ',']).ok_or_else(err)?;
                pval.push_str(&rest[..end]);
                rest = &rest[end..];
            }
            match rest.strip_prefix(',') {
                Some(r) => {
                    pval.push(',');
                    rest = r;
                }
                None => break,
            }
        }
        prop.params.push((pname, pval));
    }
    prop.value = rest.strip_prefix(':').ok_or_else(err)?.to_string();
    Ok(prop)
}

/// Unescape a TEXT value.
pub fn unescape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') | Some('N') => out.push('\n'),
                Some(c) => out.push(c),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Escape a TEXT value.
pub fn escape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ';' => out.push_str("\\;"),
            ',' => out.push_str("\\,"),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            c => out.push(c),
        }
    }
    out
}

// split on commas that are not escaped.
fn split_unescaped(s: &str) -> Vec<&str> {
    let mut v = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            ',' if !escaped => {
                v.push(&s[start..i]);
                start = i + 1;
            }
            _ => escaped = false,
        }
    }
    v.push(&s[start..]);
    v
}

impl ICalComponent {
    pub fn new(name: impl Into<String>) -> ICalComponent {
        ICalComponent {
            name: name.into().to_ascii_uppercase(),
            properties: Vec::new(),
            components: Vec::new(),
        }
    }

    /// Parse iCalendar text holding exactly one top-level component.
    pub fn parse(text: &str) -> Result<ICalComponent, IcalError> {
        let mut stack: Vec<ICalComponent> = Vec::new();
        let mut root = None;
        for line in unfold(text) {
            let prop = parse_line(&line)?;
            match prop.name.as_str() {
                "BEGIN" => {
                    if root.is_some() {
                        return Err(bad("data after the end of the calendar"));
                    }
                    stack.push(ICalComponent::new(prop.value.trim()));
                }
                "END" => {
                    let comp = stack.pop().ok_or_else(|| bad("END without BEGIN"))?;
                    if !comp.name.eq_ignore_ascii_case(prop.value.trim()) {
                        return Err(bad(format!("END:{} closes {}", prop.value, comp.name)));
                    }
                    match stack.last_mut() {
                        Some(parent) => parent.components.push(comp),
                        None => root = Some(comp),
                    }
                }
                _ => match stack.last_mut() {
                    Some(comp) => comp.properties.push(prop),
                    None => return Err(bad("property outside of a component")),
                },
            }
        }
        if !stack.is_empty() {
            return Err(bad("unterminated component"));
        }
        root.ok_or_else(|| bad("no component found"))
    }

    /// Serialize as iCalendar text with CRLF line endings.
    pub fn to_ical_string(&self) -> String {
        let mut out = String::new();
        self.write(&mut out);
        out
    }

    fn write(&self, out: &mut String) {
        out.push_str("BEGIN:");
        out.push_str(&self.name);
        out.push_str("\r\n");
        for p in &self.properties {
            p.write(out);
        }
        for c in &self.components {
            c.write(out);
        }
        out.push_str("END:");
        out.push_str(&self.name);
        out.push_str("\r\n");
    }

    pub fn property(&self, name: &str) -> Option<&ICalProperty> {
        self.properties
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn properties_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ICalProperty> + 'a {
        self.properties
            .iter()
            .filter(move |p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn property_value(&self, name: &str) -> Option<&str> {
        self.property(name).map(|p| p.value.as_str())
    }

    /// Replace the first property with the same name, or append.
    pub fn set_property(&mut self, prop: ICalProperty) {
        match self.properties.iter_mut().find(|p| p.name == prop.name) {
            Some(p) => *p = prop,
            None => self.properties.push(prop),
        }
    }

    pub fn add_property(&mut self, prop: ICalProperty) {
        self.properties.push(prop);
    }

    pub fn uid(&self) -> Option<&str> {
        self.property_value("UID")
    }

    pub fn is_timezone(&self) -> bool {
        self.name == "VTIMEZONE"
    }

    /// The non-timezone sub-components.
    pub fn items(&self) -> impl Iterator<Item = &ICalComponent> {
        self.components.iter().filter(|c| !c.is_timezone())
    }

    /// Build the xCal tree. A VCALENDAR is wrapped in an `icalendar` root.
    pub fn to_xcal(&self) -> Element {
        let comp = self.to_xcal_component();
        if self.name == "VCALENDAR" {
            let mut root = xcal_elem("icalendar").ns("", NS_XCAL_URI);
            root.push(comp);
            root
        } else {
            comp.ns("", NS_XCAL_URI)
        }
    }

    fn to_xcal_component(&self) -> Element {
        let mut elem = xcal_elem(&self.name.to_ascii_lowercase());
        let mut props = xcal_elem("properties");
        for p in &self.properties {
            props.push(property_to_xcal(p));
        }
        elem.push(props);
        if !self.components.is_empty() || self.name == "VCALENDAR" {
            let mut comps = xcal_elem("components");
            for c in &self.components {
                comps.push(c.to_xcal_component());
            }
            elem.push(comps);
        }
        elem
    }

    /// Read an xCal tree: either an `icalendar` root or a single component.
    pub fn from_xcal(elem: &Element) -> Result<ICalComponent, IcalError> {
        if elem.name == "icalendar" {
            let mut comps = elem.child_elements();
            let comp = comps.next().ok_or_else(|| bad("empty icalendar element"))?;
            if comps.next().is_some() {
                return Err(bad("more than one calendar in icalendar element"));
            }
            return ICalComponent::from_xcal_component(comp);
        }
        ICalComponent::from_xcal_component(elem)
    }

    fn from_xcal_component(elem: &Element) -> Result<ICalComponent, IcalError> {
        let mut comp = ICalComponent::new(&elem.name);
        for child in elem.child_elements() {
            match child.name.as_str() {
                "properties" => {
                    for p in child.child_elements() {
                        comp.properties.push(property_from_xcal(p)?);
                    }
                }
                "components" => {
                    for c in child.child_elements() {
                        comp.components.push(ICalComponent::from_xcal_component(c)?);
                    }
                }
                other => return Err(bad(format!("unexpected element {other} in {}", comp.name))),
            }
        }
        Ok(comp)
    }
}

pub(crate) fn xcal_elem(name: &str) -> Element {
    let mut e = Element::new(name);
    e.namespace = Some(NS_XCAL_URI.to_string());
    e
}

fn xcal_text_elem(name: &str, text: impl Into<String>) -> Element {
    let mut e = xcal_elem(name);
    e.children.push(XMLNode::Text(text.into()));
    e
}

// default value type of a property.
fn default_value_type(name: &str) -> &'static str {
    match name {
        "DTSTART" | "DTEND" | "DUE" | "RECURRENCE-ID" | "EXDATE" | "RDATE" | "DTSTAMP"
        | "CREATED" | "LAST-MODIFIED" | "COMPLETED" => "date-time",
        "DURATION" | "TRIGGER" => "duration",
        "ATTENDEE" | "ORGANIZER" => "cal-address",
        "URL" | "TZURL" | "ATTACH" => "uri",
        "SEQUENCE" | "PRIORITY" | "PERCENT-COMPLETE" | "REPEAT" => "integer",
        "TZOFFSETFROM" | "TZOFFSETTO" => "utc-offset",
        "RRULE" | "EXRULE" => "recur",
        "FREEBUSY" => "period",
        _ => "text",
    }
}

fn is_multi_valued(name: &str) -> bool {
    matches!(
        name,
        "EXDATE" | "RDATE" | "CATEGORIES" | "RESOURCES" | "FREEBUSY"
    )
}

fn value_type(prop: &ICalProperty) -> String {
    if let Some(v) = prop.get_param("VALUE") {
        return v.to_ascii_lowercase();
    }
    let t = default_value_type(&prop.name);
    if t == "date-time" && prop.value.len() == 8 {
        return "date".to_string();
    }
    t.to_string()
}

// 20080205T120000Z -> 2008-02-05T12:00:00Z, 20080205 -> 2008-02-05
fn datetime_to_xcal(v: &str) -> String {
    let b = v.as_bytes();
    if b.len() >= 8 && b[..8].iter().all(|c| c.is_ascii_digit()) {
        let mut s = format!("{}-{}-{}", &v[0..4], &v[4..6], &v[6..8]);
        if b.len() >= 15 && b[8] == b'T' {
            s.push_str(&format!("T{}:{}:{}{}", &v[9..11], &v[11..13], &v[13..15], &v[15..]));
        }
        return s;
    }
    v.to_string()
}

fn datetime_from_xcal(v: &str) -> String {
    v.chars().filter(|&c| c != '-' && c != ':').collect()
}

fn offset_to_xcal(v: &str) -> String {
    if v.len() >= 5 {
        format!("{}:{}", &v[..3], &v[3..])
    } else {
        v.to_string()
    }
}

fn value_to_xcal(vtype: &str, value: &str) -> Element {
    match vtype {
        "date-time" | "date" => xcal_text_elem(vtype, datetime_to_xcal(value)),
        "utc-offset" => xcal_text_elem(vtype, offset_to_xcal(value)),
        "text" => xcal_text_elem(vtype, unescape_text(value)),
        "period" => {
            let mut e = xcal_elem("period");
            let (start, end) = value.split_once('/').unwrap_or((value, ""));
            e.push(xcal_text_elem("start", datetime_to_xcal(start)));
            if end.trim_start_matches(['+', '-']).starts_with('P') {
                e.push(xcal_text_elem("duration", end));
            } else if !end.is_empty() {
                e.push(xcal_text_elem("end", datetime_to_xcal(end)));
            }
            e
        }
        "recur" => {
            let mut e = xcal_elem("recur");
            for part in value.split(';').filter(|p| !p.is_empty()) {
                let (k, v) = part.split_once('=').unwrap_or((part, ""));
                let k = k.to_ascii_lowercase();
                for v in v.split(',') {
                    let v = if k == "until" {
                        datetime_to_xcal(v)
                    } else {
                        v.to_string()
                    };
                    e.push(xcal_text_elem(&k, v));
                }
            }
            e
        }
        other => xcal_text_elem(other, value),
    }
}

fn value_from_xcal(elem: &Element) -> String {
    match elem.name.as_str() {
        "date-time" | "date" => datetime_from_xcal(&elem.text_content()),
        "utc-offset" => elem.text_content().replace(':', ""),
        "text" => escape_text(&elem.text_content()),
        "period" => {
            let mut s = String::new();
            for part in elem.child_elements() {
                match part.name.as_str() {
                    "start" => s.insert_str(0, &datetime_from_xcal(&part.text_content())),
                    "end" => {
                        s.push('/');
                        s.push_str(&datetime_from_xcal(&part.text_content()));
                    }
                    _ => {
                        s.push('/');
                        s.push_str(&part.text_content());
                    }
                }
            }
            s
        }
        "recur" => {
            let mut parts: Vec<(String, Vec<String>)> = Vec::new();
            for part in elem.child_elements() {
                let k = part.name.to_ascii_uppercase();
                let v = if k == "UNTIL" {
                    datetime_from_xcal(&part.text_content())
                } else {
                    part.text_content()
                };
                match parts.iter_mut().find(|(n, _)| *n == k) {
                    Some((_, vals)) => vals.push(v),
                    None => parts.push((k, vec![v])),
                }
            }
            parts
                .into_iter()
                .map(|(k, v)| format!("{}={}", k, v.join(",")))
                .collect::<Vec<_>>()
                .join(";")
        }
        _ => elem.text_content(),
    }
}

fn property_to_xcal(prop: &ICalProperty) -> Element {
    let mut elem = xcal_elem(&prop.name.to_ascii_lowercase());
    let params = prop
        .params
        .iter()
        .filter(|(n, _)| n != "VALUE")
        .collect::<Vec<_>>();
    if !params.is_empty() {
        let mut pe = xcal_elem("parameters");
        for (name, value) in params {
            let mut p = xcal_elem(&name.to_ascii_lowercase());
            let ptype = match name.as_str() {
                "DELEGATED-FROM" | "DELEGATED-TO" | "MEMBER" | "SENT-BY" => "cal-address",
                "DIR" | "ALTREP" => "uri",
                _ => "text",
            };
            for v in value.split(',') {
                p.push(xcal_text_elem(ptype, v));
            }
            pe.push(p);
        }
        elem.push(pe);
    }
    let vtype = value_type(prop);
    if is_multi_valued(&prop.name) {
        let values = if vtype == "text" {
            split_unescaped(&prop.value)
        } else {
            prop.value.split(',').collect()
        };
        for v in values {
            elem.push(value_to_xcal(&vtype, v));
        }
    } else {
        elem.push(value_to_xcal(&vtype, &prop.value));
    }
    elem
}

fn property_from_xcal(elem: &Element) -> Result<ICalProperty, IcalError> {
    let mut prop = ICalProperty::new(&elem.name, "");
    let mut values = Vec::new();
    let mut vtype = None;
    for child in elem.child_elements() {
        if child.name == "parameters" {
            for p in child.child_elements() {
                let v = p
                    .child_elements()
                    .map(|v| v.text_content())
                    .collect::<Vec<_>>()
                    .join(",");
                prop.params.push((p.name.to_ascii_uppercase(), v));
            }
        } else {
            vtype.get_or_insert_with(|| child.name.clone());
            values.push(value_from_xcal(child));
        }
    }
    let vtype = vtype.ok_or_else(|| bad(format!("property {} has no value", prop.name)))?;
    let default = default_value_type(&prop.name);
    let implied = default == vtype || (default == "date-time" && vtype == "date" && values.iter().all(|v| v.len() == 8));
    if !implied && vtype != "unknown" {
        prop.params.push(("VALUE".to_string(), vtype.to_ascii_uppercase()));
    }
    prop.value = values.join(",");
    Ok(prop)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVENT: &str = "BEGIN:VCALENDAR\r\n\
VERSION:2.0\r\n\
PRODID:-//test//EN\r\n\
BEGIN:VEVENT\r\n\
UID:abc-123\r\n\
DTSTAMP:20240101T100000Z\r\n\
DTSTART;TZID=Europe/Amsterdam:20240105T120000\r\n\
DURATION:PT1H\r\n\
RRULE:FREQ=WEEKLY;COUNT=4;BYDAY=MO,WE\r\n\
SUMMARY:Lunch\\, with friends\r\n\
ATTENDEE;CN=\"Doe, Jane\";PARTSTAT=ACCEPTED:mailto:jane@example.com\r\n\
CATEGORIES:FOOD,FUN\r\n\
END:VEVENT\r\n\
END:VCALENDAR\r\n";

    #[test]
    fn parse_text() {
        let cal = ICalComponent::parse(EVENT).unwrap();
        assert_eq!(cal.name, "VCALENDAR");
        let ev = &cal.components[0];
        assert_eq!(ev.uid(), Some("abc-123"));
        let att = ev.property("ATTENDEE").unwrap();
        assert_eq!(att.get_param("cn"), Some("Doe, Jane"));
        assert_eq!(att.value, "mailto:jane@example.com");
        assert_eq!(unescape_text(ev.property_value("SUMMARY").unwrap()), "Lunch, with friends");
    }

    #[test]
    fn parse_folded_and_lf() {
        let text = "BEGIN:VCALENDAR\nBEGIN:VTODO\nUID:x\nSUMMARY:a very\n  long line\nEND:VTODO\nEND:VCALENDAR\n";
        let cal = ICalComponent::parse(text).unwrap();
        assert_eq!(cal.components[0].property_value("SUMMARY"), Some("a very long line"));
    }

    #[test]
    fn parse_errors() {
        assert!(ICalComponent::parse("BEGIN:VCALENDAR\r\nEND:VEVENT\r\n").is_err());
        assert!(ICalComponent::parse("BEGIN:VCALENDAR\r\n").is_err());
        assert!(ICalComponent::parse("SUMMARY:x\r\n").is_err());
        assert!(ICalComponent::parse("").is_err());
    }

    #[test]
    fn long_lines_fold() {
        let mut comp = ICalComponent::new("VEVENT");
        comp.add_property(ICalProperty::new("DESCRIPTION", "x".repeat(200)));
        let text = comp.to_ical_string();
        assert!(text.lines().all(|l| l.len() <= 75));
        let back = ICalComponent::parse(&text).unwrap();
        assert_eq!(back, comp);
    }

    #[test]
    fn xcal_shape() {
        let cal = ICalComponent::parse(EVENT).unwrap();
        let x = cal.to_xcal();
        assert_eq!(x.name, "icalendar");
        let vevent = x
            .get_child("vcalendar")
            .and_then(|c| c.get_child("components"))
            .and_then(|c| c.get_child("vevent"))
            .unwrap();
        let props = vevent.get_child("properties").unwrap();
        let dtstart = props.get_child("dtstart").unwrap();
        assert_eq!(
            dtstart.get_child("date-time").unwrap().text_content(),
            "2024-01-05T12:00:00"
        );
        let summary = props.get_child("summary").unwrap();
        assert_eq!(summary.get_child("text").unwrap().text_content(), "Lunch, with friends");
        let rrule = props.get_child("rrule").unwrap().get_child("recur").unwrap();
        assert_eq!(rrule.child_elements().filter(|e| e.name == "byday").count(), 2);
    }

    #[test]
    fn xcal_keeps_content() {
        let cal = ICalComponent::parse(EVENT).unwrap();
        let back = ICalComponent::from_xcal(&cal.to_xcal()).unwrap();
        assert_eq!(back, cal);
    }

    #[test]
    fn xcal_date_value() {
        let mut ev = ICalComponent::new("VEVENT");
        ev.add_property(ICalProperty::new("DTSTART", "20240105").param("VALUE", "DATE"));
        let x = ev.to_xcal();
        let props = x.get_child("properties").unwrap();
        assert!(props.get_child("dtstart").unwrap().get_child("date").is_some());
        let back = ICalComponent::from_xcal(&x).unwrap();
        assert_eq!(back.property_value("DTSTART"), Some("20240105"));
    }
}
