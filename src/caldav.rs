//! CalDAV (Calendaring Extensions to WebDAV) support
//!
//! Namespaces, query filters, `calendar-data` processing parameters and
//! the XML fragments CalDAV properties are built from. CalDAV is defined in
//! RFC 4791, scheduling extensions in RFC 6638.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use icalendar::Calendar;
use xmltree::Element;

use crate::errors::DavError;
use crate::ical::ICalComponent;
use crate::xmltree_ext::ElementExt;
use crate::DavResult;

// XML namespaces
pub const NS_DAV_URI: &str = "DAV:";
pub const NS_CALDAV_URI: &str = "urn:ietf:params:xml:ns:caldav";
pub const NS_CALENDARSERVER_URI: &str = "http://calendarserver.org/ns/";

/// CalDAV component types supported in a calendar collection
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalendarComponentType {
    VEvent,
    VTodo,
    VJournal,
    VFreeBusy,
    VTimezone,
    VAlarm,
}

impl CalendarComponentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalendarComponentType::VEvent => "VEVENT",
            CalendarComponentType::VTodo => "VTODO",
            CalendarComponentType::VJournal => "VJOURNAL",
            CalendarComponentType::VFreeBusy => "VFREEBUSY",
            CalendarComponentType::VTimezone => "VTIMEZONE",
            CalendarComponentType::VAlarm => "VALARM",
        }
    }
}

pub(crate) const SUPPORTED_COMPONENTS: &[CalendarComponentType] = &[
    CalendarComponentType::VEvent,
    CalendarComponentType::VTodo,
    CalendarComponentType::VJournal,
    CalendarComponentType::VFreeBusy,
];

#[derive(Debug, Clone)]
pub struct ComponentFilter {
    pub name: String,
    pub is_not_defined: bool,
    pub time_range: Option<TimeRange>,
    pub prop_filters: Vec<PropertyFilter>,
    pub comp_filters: Vec<ComponentFilter>,
}

#[derive(Debug, Clone)]
pub struct PropertyFilter {
    pub name: String,
    pub is_not_defined: bool,
    pub text_match: Option<TextMatch>,
    pub time_range: Option<TimeRange>,
    pub param_filters: Vec<ParameterFilter>,
}

#[derive(Debug, Clone)]
pub struct ParameterFilter {
    pub name: String,
    pub is_not_defined: bool,
    pub text_match: Option<TextMatch>,
}

#[derive(Debug, Clone)]
pub struct TextMatch {
    pub text: String,
    pub collation: Option<String>,
    pub negate_condition: bool,
}

/// A time range; an absent bound is open.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    /// From the `start`/`end` attribute values of a `time-range` element.
    pub fn parse(start: Option<&str>, end: Option<&str>) -> DavResult<TimeRange> {
        let conv = |v: Option<&str>| match v {
            Some(v) => parse_ical_datetime(v)
                .map(Some)
                .ok_or_else(|| DavError::BadRequest(format!("bad time-range value {v}"))),
            None => Ok(None),
        };
        let tr = TimeRange {
            start: conv(start)?,
            end: conv(end)?,
        };
        if let (Some(s), Some(e)) = (tr.start, tr.end) {
            if e <= s {
                return Err(DavError::BadRequest("empty time-range".to_string()));
            }
        }
        Ok(tr)
    }

    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        let before_end = self.end.map(|e| start < e || (start == end && start <= e));
        let after_start = self.start.map(|s| end > s || (start == end && start >= s));
        before_end.unwrap_or(true) && after_start.unwrap_or(true)
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start.is_none_or(|s| t >= s) && self.end.is_none_or(|e| t < e)
    }
}

/// Parse an iCalendar DATE or DATE-TIME value. Floating times are taken as UTC.
pub fn parse_ical_datetime(value: &str) -> Option<DateTime<Utc>> {
    let v = value.trim().trim_end_matches('Z');
    if v.len() == 8 {
        let d = NaiveDate::parse_from_str(v, "%Y%m%d").ok()?;
        return Some(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0)?));
    }
    let dt = NaiveDateTime::parse_from_str(v, "%Y%m%dT%H%M%S").ok()?;
    Some(Utc.from_utc_datetime(&dt))
}

pub fn format_ical_datetime(t: DateTime<Utc>) -> String {
    t.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Parse an iCalendar DURATION value like `PT1H30M` or `-P1D`.
pub fn parse_ical_duration(value: &str) -> Option<Duration> {
    let v = value.trim();
    let (neg, v) = match v.as_bytes().first()? {
        b'-' => (true, &v[1..]),
        b'+' => (false, &v[1..]),
        _ => (false, v),
    };
    let v = v.strip_prefix('P')?;
    let mut total = Duration::zero();
    let mut num = String::new();
    let mut in_time = false;
    for c in v.chars() {
        match c {
            'T' => in_time = true,
            '0'..='9' => num.push(c),
            _ => {
                let n: i64 = num.parse().ok()?;
                num.clear();
                total += match (c, in_time) {
                    ('W', false) => Duration::weeks(n),
                    ('D', false) => Duration::days(n),
                    ('H', true) => Duration::hours(n),
                    ('M', true) => Duration::minutes(n),
                    ('S', true) => Duration::seconds(n),
                    _ => return None,
                };
            }
        }
    }
    if !num.is_empty() {
        return None;
    }
    Some(if neg { -total } else { total })
}

/// The span covered by a VEVENT, VTODO or VJOURNAL (no recurrence expansion).
pub fn component_span(comp: &ICalComponent) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let start_prop = comp.property("DTSTART");
    let start = start_prop.and_then(|p| parse_ical_datetime(&p.value));
    let end = comp
        .property_value("DTEND")
        .or_else(|| comp.property_value("DUE"))
        .and_then(parse_ical_datetime);
    let duration = comp.property_value("DURATION").and_then(parse_ical_duration);
    match (start, end, duration) {
        (Some(s), Some(e), _) => Some((s, e)),
        (Some(s), None, Some(d)) => Some((s, s + d)),
        (Some(s), None, None) => {
            // a date-only start covers the whole day
            let is_date = start_prop.is_some_and(|p| p.value.trim().len() == 8);
            Some((s, if is_date { s + Duration::days(1) } else { s }))
        }
        (None, Some(e), _) => Some((e, e)),
        _ => None,
    }
}

fn text_matches(tm: &TextMatch, value: &str) -> bool {
    let found = match tm.collation.as_deref() {
        Some("i;octet") => value.contains(&tm.text),
        _ => value.to_lowercase().contains(&tm.text.to_lowercase()),
    };
    found != tm.negate_condition
}

impl ComponentFilter {
    /// Does the top-level component (normally the VCALENDAR) match.
    pub fn matches(&self, comp: &ICalComponent) -> bool {
        if !comp.name.eq_ignore_ascii_case(&self.name) {
            return self.is_not_defined;
        }
        !self.is_not_defined && self.matches_component(comp)
    }

    fn matches_component(&self, comp: &ICalComponent) -> bool {
        if let Some(ref tr) = self.time_range {
            let recurring = comp.property("RRULE").is_some() || comp.property("RDATE").is_some();
            match component_span(comp) {
                Some((s, e)) if recurring => {
                    // without expansion a recurring item matches from its first instance on.
                    if tr.end.is_some_and(|te| s >= te) && s != e {
                        return false;
                    }
                }
                Some((s, e)) => {
                    if !tr.overlaps(s, e) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        self.prop_filters.iter().all(|pf| pf.matches(comp))
            && self.comp_filters.iter().all(|cf| cf.matches_in(comp))
    }

    // applied to the sub-components of `parent`.
    fn matches_in(&self, parent: &ICalComponent) -> bool {
        let mut named = parent
            .components
            .iter()
            .filter(|c| c.name.eq_ignore_ascii_case(&self.name))
            .peekable();
        if self.is_not_defined {
            return named.peek().is_none();
        }
        named.any(|c| self.matches_component(c))
    }
}

impl PropertyFilter {
    fn matches(&self, comp: &ICalComponent) -> bool {
        let mut props = comp.properties_named(&self.name).peekable();
        if self.is_not_defined {
            return props.peek().is_none();
        }
        props.any(|p| {
            if let Some(ref tm) = self.text_match {
                if !text_matches(tm, &crate::ical::unescape_text(&p.value)) {
                    return false;
                }
            }
            if let Some(ref tr) = self.time_range {
                match parse_ical_datetime(&p.value) {
                    Some(t) if tr.contains(t) => {}
                    _ => return false,
                }
            }
            self.param_filters.iter().all(|pf| {
                let v = p.get_param(&pf.name);
                match (v, pf.is_not_defined) {
                    (None, true) => true,
                    (Some(_), true) | (None, false) => false,
                    (Some(v), false) => pf.text_match.as_ref().is_none_or(|tm| text_matches(tm, v)),
                }
            })
        })
    }
}

/// Which components and properties a `calendar-data` element asks for.
#[derive(Debug, Clone, PartialEq)]
pub struct CompSelect {
    pub name: String,
    pub allprop: bool,
    pub props: Vec<String>,
    pub allcomp: bool,
    pub comps: Vec<CompSelect>,
}

/// Processing parameters of a `C:calendar-data` property request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CalendarData {
    pub comp: Option<CompSelect>,
    pub limit_recurrence_set: Option<TimeRange>,
}

impl CompSelect {
    fn parse(elem: &Element) -> DavResult<CompSelect> {
        let name = elem
            .attributes
            .get("name")
            .ok_or_else(|| DavError::BadRequest("comp without name".to_string()))?
            .to_ascii_uppercase();
        let mut sel = CompSelect {
            name,
            allprop: false,
            props: Vec::new(),
            allcomp: false,
            comps: Vec::new(),
        };
        let mut saw_prop = false;
        let mut saw_comp = false;
        for child in elem.child_elements() {
            match child.name.as_str() {
                "allprop" => sel.allprop = true,
                "allcomp" => sel.allcomp = true,
                "prop" => {
                    saw_prop = true;
                    if let Some(n) = child.attributes.get("name") {
                        sel.props.push(n.to_ascii_uppercase());
                    }
                }
                "comp" => {
                    saw_comp = true;
                    sel.comps.push(CompSelect::parse(child)?);
                }
                _ => {}
            }
        }
        // nothing listed means everything.
        if !saw_prop {
            sel.allprop = true;
        }
        if !saw_comp {
            sel.allcomp = true;
        }
        Ok(sel)
    }

    fn select(&self, comp: &ICalComponent) -> ICalComponent {
        let mut out = ICalComponent::new(&comp.name);
        out.properties = comp
            .properties
            .iter()
            .filter(|p| self.allprop || self.props.iter().any(|n| *n == p.name))
            .cloned()
            .collect();
        for c in &comp.components {
            if self.allcomp || (comp.name == "VCALENDAR" && c.is_timezone()) {
                out.components.push(c.clone());
            } else if let Some(sel) = self.comps.iter().find(|s| s.name == c.name) {
                out.components.push(sel.select(c));
            }
        }
        out
    }
}

impl CalendarData {
    pub fn parse(elem: &Element) -> DavResult<CalendarData> {
        let mut cd = CalendarData::default();
        for child in elem.child_elements() {
            match child.name.as_str() {
                "comp" => cd.comp = Some(CompSelect::parse(child)?),
                "limit-recurrence-set" => {
                    cd.limit_recurrence_set = Some(TimeRange::parse(
                        child.attributes.get("start").map(|s| s.as_str()),
                        child.attributes.get("end").map(|s| s.as_str()),
                    )?);
                }
                "expand" => {
                    return Err(DavError::Forbidden(Some("C:supported-calendar-data")));
                }
                _ => {}
            }
        }
        Ok(cd)
    }

    /// Filter a calendar by these parameters.
    pub fn apply(&self, cal: &ICalComponent) -> ICalComponent {
        let mut out = match self.comp {
            Some(ref sel) => sel.select(cal),
            None => cal.clone(),
        };
        if let Some(ref tr) = self.limit_recurrence_set {
            out.components.retain(|c| {
                match c.property_value("RECURRENCE-ID").and_then(parse_ical_datetime) {
                    Some(rid) => {
                        let end = component_span(c).map(|(_, e)| e).unwrap_or(rid);
                        tr.overlaps(rid, end.max(rid))
                    }
                    None => true,
                }
            });
        }
        out
    }
}

/// Validate iCalendar data using the icalendar crate
pub fn validate_calendar_data(content: &str) -> Result<Calendar, String> {
    content
        .parse::<Calendar>()
        .map_err(|e| format!("Invalid iCalendar data: {}", e))
}

pub(crate) fn dav_elem(name: &str) -> Element {
    let mut e = Element::new(name);
    e.prefix = Some("D".to_string());
    e.namespace = Some(NS_DAV_URI.to_string());
    e
}

pub(crate) fn caldav_elem(name: &str) -> Element {
    let mut e = Element::new(name);
    e.prefix = Some("C".to_string());
    e.namespace = Some(NS_CALDAV_URI.to_string());
    e
}

pub(crate) fn cs_elem(name: &str) -> Element {
    let mut e = Element::new(name);
    e.prefix = Some("CS".to_string());
    e.namespace = Some(NS_CALENDARSERVER_URI.to_string());
    e
}

pub(crate) fn href_elem(href: &str) -> Element {
    let mut e = dav_elem("href");
    e.push_text(href);
    e
}

/// Helper functions for CalDAV XML generation
pub(crate) fn create_supported_calendar_component_set(components: &[CalendarComponentType]) -> Element {
    let mut elem = caldav_elem("supported-calendar-component-set");
    for comp in components {
        let mut comp_elem = caldav_elem("comp");
        comp_elem
            .attributes
            .insert("name".to_string(), comp.as_str().to_string());
        elem.push(comp_elem);
    }
    elem
}

pub(crate) fn create_supported_calendar_data() -> Element {
    let mut elem = caldav_elem("supported-calendar-data");
    let mut calendar_data = caldav_elem("calendar-data");
    calendar_data
        .attributes
        .insert("content-type".to_string(), "text/calendar".to_string());
    calendar_data
        .attributes
        .insert("version".to_string(), "2.0".to_string());
    elem.push(calendar_data);
    elem
}

/// `C:<name>` holding a single `D:href`.
pub(crate) fn create_href_property(name: &str, path: &str) -> Element {
    let mut elem = caldav_elem(name);
    elem.push(href_elem(path));
    elem
}
