use std::borrow::Cow;
use std::io::{Read, Write};

use xml::EmitterConfig;
use xml::common::XmlVersion;
use xml::writer::EventWriter;
use xml::writer::XmlEvent as XmlWEvent;
use xmltree::{Element, XMLNode};

use crate::{DavError, DavResult};

pub(crate) trait ElementExt {
    fn ns<S: Into<String>>(self, prefix: S, namespace: S) -> Self;
    fn new2<'a, E: Into<&'a str>>(e: E) -> Self;
    fn parse2<R: Read>(r: R) -> Result<Element, DavError>;
    fn push(&mut self, e: Element);
    fn push_text<T: Into<String>>(&mut self, t: T);
    fn child_elements(&self) -> Box<dyn Iterator<Item = &Element> + '_>;
    fn text_content(&self) -> String;
    fn is(&self, namespace: &str, name: &str) -> bool;
    fn write_ev<W: Write>(&self, emitter: &mut EventWriter<W>) -> xml::writer::Result<()>;
}

impl ElementExt for Element {
    fn ns<S: Into<String>>(mut self, prefix: S, namespace: S) -> Element {
        let mut ns = self.namespaces.unwrap_or_else(xmltree::Namespace::empty);
        ns.force_put(prefix.into(), namespace.into());
        self.namespaces = Some(ns);
        self
    }

    fn new2<'a, N: Into<&'a str>>(n: N) -> Element {
        let v: Vec<&str> = n.into().splitn(2, ':').collect();
        if v.len() == 1 {
            Element::new(v[0])
        } else {
            let mut e = Element::new(v[1]);
            e.prefix = Some(v[0].to_string());
            e
        }
    }

    fn push(&mut self, e: Element) {
        self.children.push(XMLNode::Element(e));
    }

    fn push_text<T: Into<String>>(&mut self, t: T) {
        self.children.push(XMLNode::Text(t.into()));
    }

    fn child_elements(&self) -> Box<dyn Iterator<Item = &Element> + '_> {
        Box::new(self.children.iter().filter_map(|n| n.as_element()))
    }

    // concatenated text and cdata of the direct children.
    fn text_content(&self) -> String {
        let mut s = String::new();
        for n in &self.children {
            match n {
                XMLNode::Text(t) | XMLNode::CData(t) => s.push_str(t),
                _ => {}
            }
        }
        s
    }

    fn is(&self, namespace: &str, name: &str) -> bool {
        self.name == name && self.namespace.as_deref() == Some(namespace)
    }

    fn parse2<R: Read>(r: R) -> Result<Element, DavError> {
        match Element::parse(r) {
            Ok(elems) => Ok(elems),
            Err(xmltree::ParseError::MalformedXml(_)) => Err(DavError::XmlParseError),
            Err(_) => Err(DavError::XmlReadError),
        }
    }

    fn write_ev<W: Write>(&self, emitter: &mut EventWriter<W>) -> xml::writer::Result<()> {
        use xml::attribute::Attribute;
        use xml::name::Name;
        use xml::writer::XmlEvent;

        let mut name = Name::local(&self.name);
        if let Some(ref ns) = self.namespace {
            name.namespace = Some(ns);
        }
        if let Some(ref p) = self.prefix {
            name.prefix = Some(p);
        }

        let mut attributes = Vec::with_capacity(self.attributes.len());
        for (k, v) in &self.attributes {
            attributes.push(Attribute {
                name: Name::local(k),
                value: v,
            });
        }

        let namespace = match self.namespaces {
            Some(ref ns) => Cow::Borrowed(ns),
            None => Cow::Owned(xmltree::Namespace::empty()),
        };

        emitter.write(XmlEvent::StartElement {
            name,
            attributes: Cow::Owned(attributes),
            namespace,
        })?;
        for node in &self.children {
            match node {
                XMLNode::Element(elem) => elem.write_ev(emitter)?,
                XMLNode::Text(t) => emitter.write(XmlEvent::Characters(t))?,
                XMLNode::CData(t) => emitter.write(XmlEvent::CData(t))?,
                _ => {}
            }
        }
        emitter.write(XmlEvent::EndElement { name: Some(name) })
    }
}

pub(crate) fn emitter<W: Write>(w: W) -> DavResult<EventWriter<W>> {
    let mut emitter = EventWriter::new_with_config(
        w,
        EmitterConfig::new()
            .perform_indent(false)
            .indent_string(""),
    );
    emitter.write(XmlWEvent::StartDocument {
        version: XmlVersion::Version10,
        encoding: Some("utf-8"),
        standalone: None,
    })?;
    Ok(emitter)
}

// write a complete tree as a document.
pub(crate) fn element_to_bytes(elem: &Element) -> DavResult<Vec<u8>> {
    let mut buf = Vec::new();
    {
        let mut em = emitter(&mut buf)?;
        elem.write_ev(&mut em)?;
    }
    Ok(buf)
}
