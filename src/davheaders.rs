use std::convert::TryFrom;
use std::fmt::Display;
use std::str::FromStr;

use headers::Header;
use http::header::{HeaderName, HeaderValue};

pub static DEPTH: HeaderName = HeaderName::from_static("depth");
pub static OVERWRITE: HeaderName = HeaderName::from_static("overwrite");
pub static DESTINATION: HeaderName = HeaderName::from_static("destination");
pub static ETAG: HeaderName = HeaderName::from_static("etag");
pub static IF_MATCH: HeaderName = HeaderName::from_static("if-match");
pub static IF_NONE_MATCH: HeaderName = HeaderName::from_static("if-none-match");
pub static SCHEDULE_REPLY: HeaderName = HeaderName::from_static("schedule-reply");

// helper.
fn one<'i, I>(values: &mut I) -> Result<&'i HeaderValue, headers::Error>
where
    I: Iterator<Item = &'i HeaderValue>,
{
    let v = values.next().ok_or_else(invalid)?;
    if values.next().is_some() {
        Err(invalid())
    } else {
        Ok(v)
    }
}

// helper
fn invalid() -> headers::Error {
    headers::Error::invalid()
}

// helper
fn map_invalid(_e: impl std::error::Error) -> headers::Error {
    headers::Error::invalid()
}

// helper. values that cannot be encoded are left out.
fn put<E>(values: &mut E, value: &str)
where
    E: Extend<HeaderValue>,
{
    if let Ok(v) = HeaderValue::from_str(value) {
        values.extend(std::iter::once(v));
    }
}

macro_rules! header {
    ($tname:ident, $hname:ident, $sname:expr) => {
        pub static $hname: HeaderName = HeaderName::from_static($sname);

        #[derive(Debug, Clone, PartialEq)]
        pub struct $tname(pub String);

        impl Header for $tname {
            fn name() -> &'static HeaderName {
                &$hname
            }

            fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
            where
                I: Iterator<Item = &'i HeaderValue>,
            {
                one(values)?
                    .to_str()
                    .map(|x| $tname(x.to_owned()))
                    .map_err(map_invalid)
            }

            fn encode<E>(&self, values: &mut E)
            where
                E: Extend<HeaderValue>,
            {
                put(values, &self.0)
            }
        }
    };
}

header!(ContentType, CONTENT_TYPE, "content-type");
header!(Location, LOCATION, "location");
header!(Dav, DAV, "dav");

impl ContentType {
    /// The media type without parameters, lowercased.
    pub fn mime(&self) -> String {
        self.0
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase()
    }
}

/// Depth: header.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Depth {
    Zero,
    One,
    Infinity,
}

impl Header for Depth {
    fn name() -> &'static HeaderName {
        &DEPTH
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = one(values)?;
        match value.as_bytes() {
            b"0" => Ok(Depth::Zero),
            b"1" => Ok(Depth::One),
            b"infinity" | b"Infinity" => Ok(Depth::Infinity),
            _ => Err(invalid()),
        }
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        let value = match *self {
            Depth::Zero => "0",
            Depth::One => "1",
            Depth::Infinity => "Infinity",
        };
        values.extend(std::iter::once(HeaderValue::from_static(value)));
    }
}

/// Destination: header, as found (absolute URL or absolute path).
#[derive(Debug, Clone, PartialEq)]
pub struct Destination(pub String);

impl Header for Destination {
    fn name() -> &'static HeaderName {
        &DESTINATION
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let s = one(values)?.to_str().map_err(map_invalid)?;
        if s.starts_with('/') {
            return Ok(Destination(s.to_string()));
        }
        match url::Url::parse(s) {
            Ok(u) if u.scheme() == "http" || u.scheme() == "https" => Ok(Destination(s.to_string())),
            _ => Err(invalid()),
        }
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        put(values, &self.0)
    }
}

// T or F.
fn decode_bool<'i, I>(values: &mut I) -> Result<bool, headers::Error>
where
    I: Iterator<Item = &'i HeaderValue>,
{
    match one(values)?.as_bytes() {
        b"F" => Ok(false),
        b"T" => Ok(true),
        _ => Err(invalid()),
    }
}

fn encode_bool<E>(b: bool, values: &mut E)
where
    E: Extend<HeaderValue>,
{
    let value = if b { "T" } else { "F" };
    values.extend(std::iter::once(HeaderValue::from_static(value)));
}

#[derive(Debug, Clone, PartialEq)]
pub struct Overwrite(pub bool);

impl Header for Overwrite {
    fn name() -> &'static HeaderName {
        &OVERWRITE
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        decode_bool(values).map(Overwrite)
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        encode_bool(self.0, values)
    }
}

/// Schedule-Reply: header (RFC 6638).
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleReply(pub bool);

impl Header for ScheduleReply {
    fn name() -> &'static HeaderName {
        &SCHEDULE_REPLY
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        decode_bool(values).map(ScheduleReply)
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        encode_bool(self.0, values)
    }
}

/// An entity tag, including the quotes.
#[derive(Debug, Clone)]
pub struct ETag {
    tag: String,
    weak: bool,
}

impl ETag {
    /// From an already quoted tag as generated for a resource.
    pub fn from_quoted(tag: &str) -> Option<ETag> {
        ETag::from_str(tag).ok()
    }
}

impl FromStr for ETag {
    type Err = headers::Error;

    fn from_str(t: &str) -> Result<Self, Self::Err> {
        let (weak, s) = if let Some(t) = t.strip_prefix("W/") {
            (true, t)
        } else {
            (false, t)
        };
        if s.len() >= 2 && s.starts_with('\"') && s.ends_with('\"') && !s[1..s.len() - 1].contains('\"') {
            Ok(ETag {
                tag: t.to_owned(),
                weak,
            })
        } else {
            Err(invalid())
        }
    }
}

impl TryFrom<&HeaderValue> for ETag {
    type Error = headers::Error;

    fn try_from(value: &HeaderValue) -> Result<Self, Self::Error> {
        let s = value.to_str().map_err(map_invalid)?;
        ETag::from_str(s)
    }
}

impl Display for ETag {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.tag)
    }
}

impl PartialEq for ETag {
    fn eq(&self, other: &Self) -> bool {
        !self.weak && !other.weak && self.tag == other.tag
    }
}

impl Header for ETag {
    fn name() -> &'static HeaderName {
        &ETAG
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = one(values)?;
        ETag::try_from(value)
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        put(values, &self.tag)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ETagList {
    Tags(Vec<ETag>),
    Star,
}

impl ETagList {
    /// Does the list match a (quoted) current tag.
    pub fn matches(&self, current: Option<&str>) -> bool {
        match (self, current) {
            (ETagList::Star, Some(_)) => true,
            (ETagList::Tags(tags), Some(cur)) => {
                ETag::from_quoted(cur).is_some_and(|cur| tags.iter().any(|t| *t == cur))
            }
            (_, None) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfMatch(pub ETagList);

#[derive(Debug, Clone, PartialEq)]
pub struct IfNoneMatch(pub ETagList);

// Decode a list of etags. Commas inside etags are not handled,
// we never generate those.
fn decode_etaglist<'i, I>(values: &mut I) -> Result<ETagList, headers::Error>
where
    I: Iterator<Item = &'i HeaderValue>,
{
    let mut v = Vec::new();
    let mut count = 0usize;
    for value in values {
        let s = value.to_str().map_err(map_invalid)?;
        if s.trim() == "*" {
            return Ok(ETagList::Star);
        }
        for t in s.split(',') {
            // Simply skip misformed etags, they will never match.
            if let Ok(t) = ETag::from_str(t.trim()) {
                v.push(t);
            }
        }
        count += 1;
    }
    if count != 0 {
        Ok(ETagList::Tags(v))
    } else {
        Err(invalid())
    }
}

fn encode_etaglist<E>(m: &ETagList, values: &mut E)
where
    E: Extend<HeaderValue>,
{
    let value = match *m {
        ETagList::Star => "*".to_string(),
        ETagList::Tags(ref t) => t
            .iter()
            .map(|t| t.tag.as_str())
            .collect::<Vec<&str>>()
            .join(", "),
    };
    put(values, &value)
}

impl Header for IfMatch {
    fn name() -> &'static HeaderName {
        &IF_MATCH
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        Ok(IfMatch(decode_etaglist(values)?))
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        encode_etaglist(&self.0, values)
    }
}

impl Header for IfNoneMatch {
    fn name() -> &'static HeaderName {
        &IF_NONE_MATCH
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        Ok(IfNoneMatch(decode_etaglist(values)?))
    }

    fn encode<E>(&self, values: &mut E)
    where
        E: Extend<HeaderValue>,
    {
        encode_etaglist(&self.0, values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode<H: Header>(v: &'static str) -> Result<H, headers::Error> {
        let hdrval = HeaderValue::from_static(v);
        let mut iter = std::iter::once(&hdrval);
        H::decode(&mut iter)
    }

    #[test]
    fn etag_header() {
        let t1 = ETag::from_str(r#"W/"12345""#).unwrap();
        let t2 = ETag::from_str(r#"W/"12345""#).unwrap();
        let t3 = ETag::from_str(r#""12346""#).unwrap();
        let t4 = ETag::from_str(r#""12346""#).unwrap();
        assert!(t1 != t2);
        assert!(t2 != t3);
        assert!(t3 == t4);
        assert_eq!(t3.to_string(), r#""12346""#);
        assert!(ETag::from_str("12346").is_err());
    }

    #[test]
    fn etag_list_matching() {
        let IfMatch(list) = decode::<IfMatch>(r#""a", "b""#).unwrap();
        assert!(list.matches(Some(r#""b""#)));
        assert!(!list.matches(Some(r#""c""#)));
        assert!(!list.matches(None));
        let IfNoneMatch(star) = decode::<IfNoneMatch>("*").unwrap();
        assert_eq!(star, ETagList::Star);
        assert!(star.matches(Some(r#""x""#)));
    }

    #[test]
    fn depth_and_flags() {
        assert_eq!(decode::<Depth>("infinity").unwrap(), Depth::Infinity);
        assert!(decode::<Depth>("2").is_err());
        assert_eq!(decode::<Overwrite>("F").unwrap(), Overwrite(false));
        assert_eq!(decode::<ScheduleReply>("T").unwrap(), ScheduleReply(true));
        assert!(decode::<Overwrite>("yes").is_err());
    }

    #[test]
    fn destination_forms() {
        assert!(decode::<Destination>("/a/b").is_ok());
        assert!(decode::<Destination>("http://host:8080/a/b").is_ok());
        assert!(decode::<Destination>("ftp://host/a").is_err());
        assert!(decode::<Destination>("a/b").is_err());
    }

    #[test]
    fn content_type_mime() {
        let ct = decode::<ContentType>("Text/Calendar; charset=utf-8").unwrap();
        assert_eq!(ct.mime(), "text/calendar");
    }
}
