//! Utility module to handle the path part of an URL.
//!
//! All request paths go through [`DavPath::normalize`] before they are
//! used to look anything up in the calendar store.
use std::error::Error;

use percent_encoding as pct;

use crate::DavError;

/// A normalized, percent-decoded request path relative to a prefix.
///
/// The path is absolute, has no `.` or `..` segments, and never ends
/// in a slash unless it is the root `/`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DavPath {
    pub(crate) path: String,
    pub(crate) prefix: String,
}

// Encode all non-unreserved characters, except '/'.
// See RFC3986, and https://en.wikipedia.org/wiki/Percent-encoding .
const PATH_ENCODE_SET: &pct::AsciiSet = &pct::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

impl std::fmt::Display for DavPath {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", &self.as_url_string_with_prefix_debug())
    }
}

impl std::fmt::Debug for DavPath {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", &self.as_url_string_with_prefix_debug())
    }
}

/// Error returned by some of the DavPath methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// cannot parse
    InvalidPath,
    /// outside of prefix
    IllegalPath,
    /// too many dotdots
    ForbiddenPath,
}

impl Error for ParseError {}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<ParseError> for DavError {
    fn from(_: ParseError) -> Self {
        DavError::BadPath
    }
}

// every '%' must start a valid two hex digit escape.
fn valid_escapes(src: &[u8]) -> bool {
    let mut i = 0;
    while i < src.len() {
        if src[i] == b'%' {
            if i + 2 >= src.len() {
                return false;
            }
            if !src[i + 1].is_ascii_hexdigit() || !src[i + 2].is_ascii_hexdigit() {
                return false;
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    true
}

// a decoded segment can contain any value except '/' or '\0',
// must be valid utf-8 and must not decode into "." or "..".
fn decode_segment(src: &[u8]) -> Result<String, ParseError> {
    if !valid_escapes(src) {
        return Err(ParseError::InvalidPath);
    }
    let decoded = pct::percent_decode(src).collect::<Vec<u8>>();
    if decoded.iter().any(|&x| x == 0 || x == b'/') {
        return Err(ParseError::InvalidPath);
    }
    let s = String::from_utf8(decoded).map_err(|_| ParseError::InvalidPath)?;
    if s == "." || s == ".." {
        return Err(ParseError::InvalidPath);
    }
    Ok(s)
}

// encode path with the path encode set.
fn encode_path(src: &str) -> String {
    pct::utf8_percent_encode(src, PATH_ENCODE_SET).to_string()
}

// make path safe:
// - raw path before decoding can contain only printable ascii
// - make sure path is absolute
// - remove query part (everything after ?)
// - merge consecutive slashes
// - process . and ..
// - decode percent encoded bytes once, fail on invalid encodings.
// - do not allow NUL, '/', "." or ".." in decoded segments.
// - strip the trailing slash.
fn normalize_path(rp: &[u8]) -> Result<String, ParseError> {
    // must consist of printable ASCII
    if rp.iter().any(|&x| !(32..=126).contains(&x)) {
        return Err(ParseError::InvalidPath);
    }

    // don't allow fragments. query part gets deleted.
    let mut rawpath = rp;
    if let Some(pos) = rawpath.iter().position(|&x| x == b'?' || x == b'#') {
        if rawpath[pos] == b'#' {
            return Err(ParseError::InvalidPath);
        }
        rawpath = &rawpath[..pos];
    }

    // must start with "/"
    if rawpath.first() != Some(&b'/') {
        return Err(ParseError::InvalidPath);
    }

    // resolve dot segments before decoding, so that decoded
    // separators can not be used for traversal.
    let mut v: Vec<&[u8]> = Vec::new();
    for segment in rawpath.split(|c| *c == b'/') {
        match segment {
            b"." | b"" => {}
            b".." => {
                if v.pop().is_none() {
                    return Err(ParseError::ForbiddenPath);
                }
            }
            s => v.push(s),
        }
    }

    let mut path = String::new();
    for s in v {
        path.push('/');
        path.push_str(&decode_segment(s)?);
    }
    if path.is_empty() {
        path.push('/');
    }
    Ok(path)
}

impl DavPath {
    /// Normalize a raw (URL encoded) request path.
    ///
    /// Normalizing is idempotent over the URL encoded form:
    /// `normalize(normalize(p)?.as_url_string())` equals `normalize(p)`.
    /// The decoded `as_str()` form is not valid input. It may hold
    /// non-ASCII characters or a literal `%` that would be decoded twice.
    pub fn normalize(src: &str) -> Result<DavPath, ParseError> {
        Ok(DavPath {
            path: normalize_path(src.as_bytes())?,
            prefix: String::new(),
        })
    }

    /// from URL encoded strings: path and prefix.
    pub fn from_str_and_prefix(src: &str, prefix: &str) -> Result<DavPath, ParseError> {
        let path = normalize_path(src.as_bytes())?;
        let prefix = prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return Ok(DavPath {
                path,
                prefix: String::new(),
            });
        }
        let prefix = normalize_path(prefix.as_bytes())?;
        if path == prefix {
            return Ok(DavPath {
                path: "/".to_string(),
                prefix,
            });
        }
        match path.strip_prefix(&prefix) {
            Some(rest) if rest.starts_with('/') => Ok(DavPath {
                path: rest.to_string(),
                prefix,
            }),
            _ => Err(ParseError::IllegalPath),
        }
    }

    /// from request.uri
    pub fn from_uri_and_prefix(uri: &http::uri::Uri, prefix: &str) -> Result<Self, ParseError> {
        match uri.path() {
            path if path.starts_with('/') => DavPath::from_str_and_prefix(path, prefix),
            _ => Err(ParseError::InvalidPath),
        }
    }

    /// From an absolute URL or an absolute path, as found in
    /// `Destination:` headers and `href` elements.
    pub fn from_href(href: &str, prefix: &str) -> Result<Self, ParseError> {
        if href.starts_with('/') {
            return DavPath::from_str_and_prefix(href, prefix);
        }
        let url = url::Url::parse(href).map_err(|_| ParseError::InvalidPath)?;
        DavPath::from_str_and_prefix(url.path(), prefix)
    }

    /// as URL encoded string, no prefix.
    pub fn as_url_string(&self) -> String {
        encode_path(&self.path)
    }

    /// as URL encoded string, with prefix.
    pub fn as_url_string_with_prefix(&self) -> String {
        let mut p = encode_path(&self.prefix);
        if self.path != "/" || p.is_empty() {
            p.push_str(&encode_path(&self.path));
        }
        p
    }

    pub(crate) fn as_url_string_with_prefix_debug(&self) -> String {
        if self.prefix.is_empty() {
            encode_path(&self.path)
        } else {
            format!("{}[{}]", encode_path(&self.prefix), encode_path(&self.path))
        }
    }

    /// The decoded path, without prefix.
    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// return the URL prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn is_root(&self) -> bool {
        self.path == "/"
    }

    /// The parent path. The parent of the root is the root.
    pub fn parent(&self) -> DavPath {
        let path = match self.path.rfind('/') {
            Some(0) | None => "/".to_string(),
            Some(pos) => self.path[..pos].to_string(),
        };
        DavPath {
            path,
            prefix: self.prefix.clone(),
        }
    }

    /// The filename is the last segment of the path. Empty for the root.
    pub fn file_name(&self) -> &str {
        match self.path.rfind('/') {
            Some(pos) => &self.path[pos + 1..],
            None => "",
        }
    }

    /// Add a (decoded) segment to the end of the path.
    pub fn push_segment(&mut self, segment: &str) {
        if !self.path.ends_with('/') {
            self.path.push('/');
        }
        self.path.push_str(segment);
    }

    /// Split into (parent path, leaf name). `None` for the root.
    pub fn split(&self) -> Option<(DavPath, &str)> {
        if self.is_root() {
            None
        } else {
            Some((self.parent(), self.file_name()))
        }
    }

    /// Build from an already normalized store path.
    pub(crate) fn from_store_path(path: &str, prefix: &str) -> DavPath {
        DavPath {
            path: if path.is_empty() {
                "/".to_string()
            } else {
                path.to_string()
            },
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub(crate) fn get_mime_type_str(&self) -> &'static str {
        mime_guess::from_path(self.file_name())
            .first_raw()
            .unwrap_or("application/octet-stream")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(p: &str) -> Result<String, ParseError> {
        DavPath::normalize(p).map(|p| p.path)
    }

    #[test]
    fn removes_dot_segments() {
        assert_eq!(norm("/a/./b/../c").unwrap(), "/a/c");
        assert_eq!(norm("/a//b/").unwrap(), "/a/b");
        assert_eq!(norm("/").unwrap(), "/");
        assert_eq!(norm("/..").unwrap_err(), ParseError::ForbiddenPath);
        assert_eq!(norm("/a/../../b").unwrap_err(), ParseError::ForbiddenPath);
    }

    #[test]
    fn decodes_once() {
        assert_eq!(norm("/user/a%20b/cal").unwrap(), "/user/a b/cal");
        // a decoded separator or dot segment can not sneak in.
        assert!(norm("/user/a%2Fb").is_err());
        assert!(norm("/user/%2e%2e/x").is_err());
        assert!(norm("/user/%00").is_err());
        assert!(norm("/user/%zz").is_err());
        assert!(norm("/user/%4").is_err());
        // %25 decodes to a literal '%', never decoded a second time.
        assert_eq!(norm("/a%252Fb").unwrap(), "/a%2Fb");
    }

    #[test]
    fn rejects_bad_input() {
        assert!(norm("relative/path").is_err());
        assert!(norm("").is_err());
        assert!(norm("/a#frag").is_err());
        assert!(norm("/a\tb").is_err());
        assert_eq!(norm("/a/b?query=1").unwrap(), "/a/b");
    }

    #[test]
    fn normalize_is_idempotent() {
        for p in [
            "/a/./b/../c/",
            "/user/a%20b/%C3%A9t%C3%A9.ics",
            "/a%252Fb",
            "/x/y/z/../../w",
            "/",
        ] {
            let once = DavPath::normalize(p).unwrap();
            let twice = DavPath::normalize(&once.as_url_string()).unwrap();
            assert_eq!(once, twice, "path {p}");
            assert!(!once.as_str().split('/').any(|s| s == "." || s == ".."));
        }

        // the decoded form is not a request path.
        let p = DavPath::normalize("/%C3%A9").unwrap();
        assert_eq!(p.as_str(), "/\u{e9}");
        assert!(DavPath::normalize(p.as_str()).is_err());
        assert_eq!(DavPath::normalize(&p.as_url_string()).unwrap(), p);
    }

    #[test]
    fn prefix_handling() {
        let p = DavPath::from_str_and_prefix("/dav/user/alice", "/dav/").unwrap();
        assert_eq!(p.as_str(), "/user/alice");
        assert_eq!(p.as_url_string_with_prefix(), "/dav/user/alice");
        assert!(DavPath::from_str_and_prefix("/other/x", "/dav").is_err());
        assert!(DavPath::from_str_and_prefix("/davx/y", "/dav").is_err());
        let root = DavPath::from_str_and_prefix("/dav", "/dav").unwrap();
        assert!(root.is_root());
    }

    #[test]
    fn parent_and_name() {
        let p = DavPath::normalize("/user/alice/cal/evt1.ics").unwrap();
        assert_eq!(p.file_name(), "evt1.ics");
        assert_eq!(p.parent().as_str(), "/user/alice/cal");
        assert_eq!(DavPath::normalize("/a").unwrap().parent().as_str(), "/");
        assert!(DavPath::normalize("/").unwrap().split().is_none());
    }

    #[test]
    fn href_forms() {
        let p = DavPath::from_href("http://example.com/dav/a/b.ics", "/dav").unwrap();
        assert_eq!(p.as_str(), "/a/b.ics");
        let p = DavPath::from_href("/dav/a/b.ics", "/dav").unwrap();
        assert_eq!(p.as_str(), "/a/b.ics");
    }
}
