//! Span-preserving tree for Confluence storage-format fragments.
//!
//! Storage format is XHTML with namespaced macro elements (`ac:*`, `ri:*`). A page
//! body is a fragment: it usually has several top-level nodes and no single root,
//! so the parser keeps top-level nodes under an implicit root. Every parsed node
//! remembers its byte span, which lets [`Fragment::render`] reproduce untouched
//! content byte-for-byte.
//!
//! Parsing never fails. User-authored pages carry stray close tags, unclosed
//! paragraphs and HTML void elements; the builder closes what it must, keeps stray
//! tags verbatim and records each repair. Callers that need a region to be well
//! formed ask [`Fragment::check_within`].

use std::ops::Range;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarkupError {
    #[error("unterminated tag starting at byte {0}")]
    UnterminatedTag(usize),
    #[error("unterminated comment starting at byte {0}")]
    UnterminatedComment(usize),
    #[error("unterminated CDATA section starting at byte {0}")]
    UnterminatedCdata(usize),
    #[error("closing </{found}> at byte {at} does not match open <{expected}>")]
    MismatchedClose {
        expected: String,
        found: String,
        at: usize,
    },
    #[error("closing </{name}> at byte {at} has no open element")]
    UnexpectedClose { name: String, at: usize },
    #[error("<{name}> opened at byte {at} is never closed")]
    Unclosed { name: String, at: usize },
    #[error("page has no details macro")]
    MissingMacro,
    #[error("details macro has no table")]
    MissingTable,
    #[error("details table row {row} has data cells but no header cell")]
    HeaderlessRow { row: usize },
    #[error("details table has no row '{key}' with a data cell")]
    MissingRow { key: String },
}

#[derive(Debug, Clone)]
pub enum Node {
    Element(Element),
    Text(Range<usize>),
    Cdata(Range<usize>),
    /// Comments, doctype and processing instructions, kept verbatim.
    Opaque(Range<usize>),
    /// Markup written by a mutation; it has no source span.
    Synthetic(String),
}

#[derive(Debug, Clone)]
pub struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    open: Range<usize>,
    close: Option<Range<usize>>,
    /// End of the element's extent in the source, implied when it was never closed.
    end: usize,
    self_closing: bool,
    children: Vec<Node>,
}

impl Element {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attribute value with entities decoded. Names compare case-sensitively.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn children(&self) -> &[Node] {
        &self.children
    }

    /// Element children paired with their index in [`Element::children`].
    pub fn child_elements(&self) -> impl Iterator<Item = (usize, &Element)> {
        self.children
            .iter()
            .enumerate()
            .filter_map(|(index, node)| match node {
                Node::Element(element) => Some((index, element)),
                _ => None,
            })
    }

    /// First descendant (preorder, excluding `self`) matching `predicate`.
    pub fn find_descendant(&self, predicate: &dyn Fn(&Element) -> bool) -> Option<&Element> {
        for (_, child) in self.child_elements() {
            if predicate(child) {
                return Some(child);
            }
            if let Some(found) = child.find_descendant(predicate) {
                return Some(found);
            }
        }
        None
    }

    pub fn replace_children(&mut self, markup: String) {
        self.children = vec![Node::Synthetic(markup)];
    }

    pub fn append_child(&mut self, markup: String) {
        self.children.push(Node::Synthetic(markup));
    }
}

/// A spot where the source was not well formed, keyed by the byte offset of the
/// element (or tag) that had to be repaired.
#[derive(Debug, Clone)]
struct Repair {
    at: usize,
    error: MarkupError,
}

#[derive(Debug, Clone)]
pub struct Fragment {
    source: String,
    nodes: Vec<Node>,
    repairs: Vec<Repair>,
}

impl Fragment {
    pub fn parse(source: &str) -> Self {
        let mut builder = TreeBuilder::default();
        let mut index = 0usize;
        let mut text_start = 0usize;

        while let Some(offset) = source[index..].find('<') {
            let at = index + offset;
            let (token, end) = match read_token(source, at) {
                Ok(Some(token)) => token,
                // A bare `<` that does not start markup stays part of the text run.
                Ok(None) => {
                    index = at + 1;
                    continue;
                }
                Err(error @ MarkupError::UnterminatedTag(_)) => {
                    builder.repair(at, error);
                    index = at + 1;
                    continue;
                }
                // An unterminated comment or CDATA section runs to the end of the input.
                Err(error) => {
                    builder.repair(at, error);
                    (Token::Opaque, source.len())
                }
            };
            if text_start < at {
                builder.push(Node::Text(text_start..at));
            }
            match token {
                Token::Opaque => builder.push(Node::Opaque(at..end)),
                Token::Cdata => builder.push(Node::Cdata(at..end)),
                Token::Open {
                    name,
                    attrs,
                    self_closing,
                } => builder.open(Element {
                    name,
                    attrs,
                    open: at..end,
                    close: None,
                    end,
                    self_closing,
                    children: Vec::new(),
                }),
                Token::Close { name } => builder.close(&name, at..end),
            }
            index = end;
            text_start = end;
        }
        if text_start < source.len() {
            builder.push(Node::Text(text_start..source.len()));
        }

        let (nodes, repairs) = builder.finish(source.len());
        Self {
            source: source.to_string(),
            nodes,
            repairs,
        }
    }

    /// Everything the parser had to repair, in source order of discovery.
    pub fn repairs(&self) -> impl Iterator<Item = &MarkupError> {
        self.repairs.iter().map(|repair| &repair.error)
    }

    /// Fails with the first repair made inside `element`, the element itself included.
    pub fn check_within(&self, element: &Element) -> Result<(), MarkupError> {
        let extent = element.open.start..element.end;
        match self
            .repairs
            .iter()
            .find(|repair| extent.contains(&repair.at))
        {
            Some(repair) => Err(repair.error.clone()),
            None => Ok(()),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Element at `path`, where each step indexes a children list starting at the top level.
    pub fn element(&self, path: &[usize]) -> Option<&Element> {
        let (first, rest) = path.split_first()?;
        let mut current = match self.nodes.get(*first)? {
            Node::Element(element) => element,
            _ => return None,
        };
        for step in rest {
            current = match current.children.get(*step)? {
                Node::Element(element) => element,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn element_mut(&mut self, path: &[usize]) -> Option<&mut Element> {
        let (first, rest) = path.split_first()?;
        let mut current = match self.nodes.get_mut(*first)? {
            Node::Element(element) => element,
            _ => return None,
        };
        for step in rest {
            current = match current.children.get_mut(*step)? {
                Node::Element(element) => element,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Path of the first element (preorder) matching `predicate`. An empty `within`
    /// searches the whole fragment; otherwise only descendants of that element.
    pub fn find_path(
        &self,
        within: &[usize],
        predicate: &dyn Fn(&Element) -> bool,
    ) -> Option<Vec<usize>> {
        let mut prefix = within.to_vec();
        if within.is_empty() {
            find_path_in(&self.nodes, &mut prefix, predicate)
        } else {
            let base = self.element(within)?;
            find_path_in(&base.children, &mut prefix, predicate)
        }
    }

    /// Concatenated text content of `element`, entities decoded, tags stripped.
    pub fn text(&self, element: &Element) -> String {
        let mut out = String::new();
        self.collect_text(&element.children, &mut out);
        out
    }

    /// Serialize the whole tree. Nodes that were not mutated come straight from the source.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.source.len() + 256);
        self.render_nodes(&self.nodes, &mut out);
        out
    }

    fn collect_text(&self, nodes: &[Node], out: &mut String) {
        for node in nodes {
            match node {
                Node::Element(child) => self.collect_text(&child.children, out),
                Node::Text(span) => out.push_str(&decode_entities(&self.source[span.clone()])),
                Node::Cdata(span) => {
                    let raw = &self.source[span.clone()];
                    out.push_str(&raw["<![CDATA[".len()..raw.len() - "]]>".len()]);
                }
                Node::Opaque(_) | Node::Synthetic(_) => {}
            }
        }
    }

    fn render_nodes(&self, nodes: &[Node], out: &mut String) {
        for node in nodes {
            match node {
                Node::Element(element) => self.render_element(element, out),
                Node::Text(span) | Node::Cdata(span) | Node::Opaque(span) => {
                    out.push_str(&self.source[span.clone()]);
                }
                Node::Synthetic(markup) => out.push_str(markup),
            }
        }
    }

    fn render_element(&self, element: &Element, out: &mut String) {
        let open = &self.source[element.open.clone()];
        if element.self_closing {
            if element.children.is_empty() {
                out.push_str(open);
                return;
            }
            // `<td/>` that gained children is expanded into an open/close pair.
            let head = open.strip_suffix("/>").unwrap_or(open).trim_end();
            out.push_str(head);
            out.push('>');
            self.render_nodes(&element.children, out);
            out.push_str("</");
            out.push_str(&element.name);
            out.push('>');
            return;
        }
        out.push_str(open);
        self.render_nodes(&element.children, out);
        if let Some(close) = &element.close {
            out.push_str(&self.source[close.clone()]);
        }
    }
}

fn find_path_in(
    nodes: &[Node],
    prefix: &mut Vec<usize>,
    predicate: &dyn Fn(&Element) -> bool,
) -> Option<Vec<usize>> {
    for (index, node) in nodes.iter().enumerate() {
        let Node::Element(element) = node else {
            continue;
        };
        prefix.push(index);
        if predicate(element) {
            return Some(prefix.clone());
        }
        if let Some(found) = find_path_in(&element.children, prefix, predicate) {
            return Some(found);
        }
        prefix.pop();
    }
    None
}

#[derive(Default)]
struct TreeBuilder {
    stack: Vec<Element>,
    nodes: Vec<Node>,
    repairs: Vec<Repair>,
}

impl TreeBuilder {
    fn push(&mut self, node: Node) {
        match self.stack.last_mut() {
            Some(parent) => parent.children.push(node),
            None => self.nodes.push(node),
        }
    }

    fn open(&mut self, element: Element) {
        if element.self_closing || is_void_element(&element.name) {
            self.push(Node::Element(element));
        } else {
            self.stack.push(element);
        }
    }

    /// Close the innermost open element called `name`, implicitly closing anything
    /// opened inside it. A close tag with no matching open element is kept verbatim.
    fn close(&mut self, name: &str, span: Range<usize>) {
        let Some(depth) = self.stack.iter().rposition(|open| open.name == name) else {
            self.repair(
                span.start,
                MarkupError::UnexpectedClose {
                    name: name.to_string(),
                    at: span.start,
                },
            );
            self.push(Node::Opaque(span));
            return;
        };
        while self.stack.len() > depth + 1 {
            let Some(mut inner) = self.stack.pop() else {
                break;
            };
            self.repair(
                inner.open.start,
                MarkupError::MismatchedClose {
                    expected: inner.name.clone(),
                    found: name.to_string(),
                    at: span.start,
                },
            );
            inner.end = span.start;
            self.push(Node::Element(inner));
        }
        if let Some(mut element) = self.stack.pop() {
            element.end = span.end;
            element.close = Some(span);
            self.push(Node::Element(element));
        }
    }

    fn repair(&mut self, at: usize, error: MarkupError) {
        self.repairs.push(Repair { at, error });
    }

    fn finish(mut self, source_len: usize) -> (Vec<Node>, Vec<Repair>) {
        while let Some(mut element) = self.stack.pop() {
            self.repair(
                element.open.start,
                MarkupError::Unclosed {
                    name: element.name.clone(),
                    at: element.open.start,
                },
            );
            element.end = source_len;
            self.push(Node::Element(element));
        }
        (self.nodes, self.repairs)
    }
}

/// HTML elements that never have content or a close tag, even without `/>`.
fn is_void_element(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "area" | "base" | "br" | "col" | "embed" | "hr" | "img" | "input" | "link" | "meta"
            | "param" | "source" | "track" | "wbr"
    )
}

enum Token {
    Opaque,
    Cdata,
    Open {
        name: String,
        attrs: Vec<(String, String)>,
        self_closing: bool,
    },
    Close {
        name: String,
    },
}

/// Classify the markup starting at `at` (which holds `<`). Returns the token and the
/// exclusive end offset, or `None` when the `<` is plain text.
fn read_token(source: &str, at: usize) -> Result<Option<(Token, usize)>, MarkupError> {
    let rest = &source[at..];
    if rest.starts_with("<!--") {
        let body = at + "<!--".len();
        let end = source[body..]
            .find("-->")
            .ok_or(MarkupError::UnterminatedComment(at))?;
        return Ok(Some((Token::Opaque, body + end + "-->".len())));
    }
    if rest.starts_with("<![CDATA[") {
        let body = at + "<![CDATA[".len();
        let end = source[body..]
            .find("]]>")
            .ok_or(MarkupError::UnterminatedCdata(at))?;
        return Ok(Some((Token::Cdata, body + end + "]]>".len())));
    }
    if rest.starts_with("<!") || rest.starts_with("<?") {
        let end = find_tag_end(source, at).ok_or(MarkupError::UnterminatedTag(at))?;
        return Ok(Some((Token::Opaque, end + 1)));
    }
    if let Some(after) = rest.strip_prefix("</") {
        let name_len = tag_name_len(after);
        if name_len == 0 {
            return Ok(None);
        }
        let end = find_tag_end(source, at).ok_or(MarkupError::UnterminatedTag(at))?;
        let name = after[..name_len].to_string();
        return Ok(Some((Token::Close { name }, end + 1)));
    }

    let name_len = tag_name_len(&rest[1..]);
    if name_len == 0 {
        return Ok(None);
    }
    let end = find_tag_end(source, at).ok_or(MarkupError::UnterminatedTag(at))?;
    let raw = &source[at..=end];
    let self_closing = raw[..raw.len() - 1].trim_end().ends_with('/');
    let name = rest[1..=name_len].to_string();
    let attrs = parse_attributes(raw, name_len + 1);
    Ok(Some((
        Token::Open {
            name,
            attrs,
            self_closing,
        },
        end + 1,
    )))
}

fn tag_name_len(text: &str) -> usize {
    let bytes = text.as_bytes();
    match bytes.first() {
        Some(byte) if byte.is_ascii_alphabetic() || *byte == b'_' || *byte == b':' => {}
        _ => return 0,
    }
    bytes
        .iter()
        .take_while(|byte| !byte.is_ascii_whitespace() && **byte != b'/' && **byte != b'>')
        .count()
}

fn find_tag_end(source: &str, start: usize) -> Option<usize> {
    let bytes = source.as_bytes();
    let mut index = start;
    let mut quote = None::<u8>;
    while index < bytes.len() {
        let byte = bytes[index];
        if let Some(active) = quote {
            if byte == active {
                quote = None;
            }
            index += 1;
            continue;
        }
        if byte == b'"' || byte == b'\'' {
            quote = Some(byte);
            index += 1;
            continue;
        }
        if byte == b'>' {
            return Some(index);
        }
        index += 1;
    }
    None
}

fn parse_attributes(tag_raw: &str, name_end: usize) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    let bytes = tag_raw.as_bytes();
    let mut index = name_end;

    while index < bytes.len() {
        let byte = bytes[index];
        if byte == b'>' {
            break;
        }
        if byte == b'/' || byte.is_ascii_whitespace() {
            index += 1;
            continue;
        }

        let name_start = index;
        while index < bytes.len() {
            let ch = bytes[index];
            if ch.is_ascii_whitespace() || ch == b'=' || ch == b'>' || ch == b'/' {
                break;
            }
            index += 1;
        }
        if name_start == index {
            index += 1;
            continue;
        }
        let name = tag_raw[name_start..index].to_string();
        while index < bytes.len() && bytes[index].is_ascii_whitespace() {
            index += 1;
        }
        let mut value = String::new();
        if bytes.get(index).copied() == Some(b'=') {
            index += 1;
            while index < bytes.len() && bytes[index].is_ascii_whitespace() {
                index += 1;
            }
            if let Some(quote) = bytes
                .get(index)
                .copied()
                .filter(|byte| *byte == b'"' || *byte == b'\'')
            {
                index += 1;
                let value_start = index;
                while index < bytes.len() && bytes[index] != quote {
                    index += 1;
                }
                value = decode_entities(&tag_raw[value_start..index]);
                if bytes.get(index).copied() == Some(quote) {
                    index += 1;
                }
            } else {
                let value_start = index;
                while index < bytes.len()
                    && !bytes[index].is_ascii_whitespace()
                    && bytes[index] != b'>'
                {
                    index += 1;
                }
                value = decode_entities(&tag_raw[value_start..index]);
            }
        }
        attrs.push((name, value));
    }

    attrs
}

pub fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let decoded = tail
            .find(';')
            .filter(|semi| *semi <= 12)
            .and_then(|semi| decode_entity(&tail[1..semi]).map(|ch| (ch, semi)));
        match decoded {
            Some((ch, semi)) => {
                out.push(ch);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// HTML named entities that turn up in storage format besides the XML five.
const NAMED_ENTITIES: &[(&str, char)] = &[
    ("nbsp", '\u{a0}'), ("iexcl", '\u{a1}'), ("cent", '\u{a2}'), ("pound", '\u{a3}'),
    ("curren", '\u{a4}'), ("yen", '\u{a5}'), ("brvbar", '\u{a6}'), ("sect", '\u{a7}'),
    ("uml", '\u{a8}'), ("copy", '\u{a9}'), ("ordf", '\u{aa}'), ("laquo", '\u{ab}'),
    ("not", '\u{ac}'), ("shy", '\u{ad}'), ("reg", '\u{ae}'), ("macr", '\u{af}'),
    ("deg", '\u{b0}'), ("plusmn", '\u{b1}'), ("sup2", '\u{b2}'), ("sup3", '\u{b3}'),
    ("acute", '\u{b4}'), ("micro", '\u{b5}'), ("para", '\u{b6}'), ("middot", '\u{b7}'),
    ("cedil", '\u{b8}'), ("sup1", '\u{b9}'), ("ordm", '\u{ba}'), ("raquo", '\u{bb}'),
    ("frac14", '\u{bc}'), ("frac12", '\u{bd}'), ("frac34", '\u{be}'), ("iquest", '\u{bf}'),
    ("Agrave", '\u{c0}'), ("Aacute", '\u{c1}'), ("Acirc", '\u{c2}'), ("Atilde", '\u{c3}'),
    ("Auml", '\u{c4}'), ("Aring", '\u{c5}'), ("AElig", '\u{c6}'), ("Ccedil", '\u{c7}'),
    ("Egrave", '\u{c8}'), ("Eacute", '\u{c9}'), ("Ecirc", '\u{ca}'), ("Euml", '\u{cb}'),
    ("Igrave", '\u{cc}'), ("Iacute", '\u{cd}'), ("Icirc", '\u{ce}'), ("Iuml", '\u{cf}'),
    ("ETH", '\u{d0}'), ("Ntilde", '\u{d1}'), ("Ograve", '\u{d2}'), ("Oacute", '\u{d3}'),
    ("Ocirc", '\u{d4}'), ("Otilde", '\u{d5}'), ("Ouml", '\u{d6}'), ("times", '\u{d7}'),
    ("Oslash", '\u{d8}'), ("Ugrave", '\u{d9}'), ("Uacute", '\u{da}'), ("Ucirc", '\u{db}'),
    ("Uuml", '\u{dc}'), ("Yacute", '\u{dd}'), ("THORN", '\u{de}'), ("szlig", '\u{df}'),
    ("agrave", '\u{e0}'), ("aacute", '\u{e1}'), ("acirc", '\u{e2}'), ("atilde", '\u{e3}'),
    ("auml", '\u{e4}'), ("aring", '\u{e5}'), ("aelig", '\u{e6}'), ("ccedil", '\u{e7}'),
    ("egrave", '\u{e8}'), ("eacute", '\u{e9}'), ("ecirc", '\u{ea}'), ("euml", '\u{eb}'),
    ("igrave", '\u{ec}'), ("iacute", '\u{ed}'), ("icirc", '\u{ee}'), ("iuml", '\u{ef}'),
    ("eth", '\u{f0}'), ("ntilde", '\u{f1}'), ("ograve", '\u{f2}'), ("oacute", '\u{f3}'),
    ("ocirc", '\u{f4}'), ("otilde", '\u{f5}'), ("ouml", '\u{f6}'), ("divide", '\u{f7}'),
    ("oslash", '\u{f8}'), ("ugrave", '\u{f9}'), ("uacute", '\u{fa}'), ("ucirc", '\u{fb}'),
    ("uuml", '\u{fc}'), ("yacute", '\u{fd}'), ("thorn", '\u{fe}'), ("yuml", '\u{ff}'),
    ("OElig", '\u{152}'), ("oelig", '\u{153}'), ("Scaron", '\u{160}'), ("scaron", '\u{161}'),
    ("Yuml", '\u{178}'), ("fnof", '\u{192}'), ("circ", '\u{2c6}'), ("tilde", '\u{2dc}'),
    ("ensp", '\u{2002}'), ("emsp", '\u{2003}'), ("thinsp", '\u{2009}'), ("zwnj", '\u{200c}'),
    ("zwj", '\u{200d}'), ("lrm", '\u{200e}'), ("rlm", '\u{200f}'), ("ndash", '\u{2013}'),
    ("mdash", '\u{2014}'), ("lsquo", '\u{2018}'), ("rsquo", '\u{2019}'), ("sbquo", '\u{201a}'),
    ("ldquo", '\u{201c}'), ("rdquo", '\u{201d}'), ("bdquo", '\u{201e}'),
    ("dagger", '\u{2020}'), ("Dagger", '\u{2021}'), ("bull", '\u{2022}'),
    ("hellip", '\u{2026}'), ("permil", '\u{2030}'), ("prime", '\u{2032}'),
    ("Prime", '\u{2033}'), ("lsaquo", '\u{2039}'), ("rsaquo", '\u{203a}'),
    ("euro", '\u{20ac}'), ("trade", '\u{2122}'), ("larr", '\u{2190}'), ("uarr", '\u{2191}'),
    ("rarr", '\u{2192}'), ("darr", '\u{2193}'), ("harr", '\u{2194}'), ("minus", '\u{2212}'),
    ("le", '\u{2264}'), ("ge", '\u{2265}'), ("ne", '\u{2260}'), ("asymp", '\u{2248}'),
    ("infin", '\u{221e}'),
];

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        _ if name.starts_with('#') => {
            let code = if let Some(hex) = name
                .strip_prefix("#x")
                .or_else(|| name.strip_prefix("#X"))
            {
                u32::from_str_radix(hex, 16).ok()?
            } else {
                name[1..].parse().ok()?
            };
            char::from_u32(code)
        }
        _ => NAMED_ENTITIES
            .iter()
            .find(|(entity, _)| *entity == name)
            .map(|(_, ch)| *ch),
    }
}

pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{Fragment, MarkupError, Node, decode_entities, escape_text};

    const PAGE: &str = concat!(
        "<h1>Overview</h1>\n",
        "<!-- owner: presales -->",
        "<ac:structured-macro ac:name=\"details\" ac:schema-version=\"1\" ac:macro-id=\"a1\">",
        "<ac:rich-text-body><table data-layout=\"default\"><colgroup><col/><col/></colgroup><tbody>",
        "<tr><th><p><strong>Status</strong></p></th><td><p>In&nbsp;Progress</p></td></tr>",
        "</tbody></table></ac:rich-text-body></ac:structured-macro>\n",
        "<ac:structured-macro ac:name=\"code\"><ac:plain-text-body><![CDATA[if a < b && c > d {}]]></ac:plain-text-body></ac:structured-macro>",
        "<p>Tail &amp; trailer</p>"
    );

    #[test]
    fn render_reproduces_untouched_source_exactly() {
        let fragment = Fragment::parse(PAGE);
        assert_eq!(fragment.render(), PAGE);
    }

    #[test]
    fn parse_accepts_fragment_with_many_top_level_nodes() {
        let fragment = Fragment::parse("<p>a</p>text<p>b</p>");
        assert_eq!(fragment.nodes().len(), 3);
        assert!(matches!(fragment.nodes()[1], Node::Text(_)));
    }

    #[test]
    fn find_path_and_attributes() {
        let fragment = Fragment::parse(PAGE);
        let path = fragment
            .find_path(&[], &|element| {
                element.name() == "ac:structured-macro" && element.attr("ac:name") == Some("code")
            })
            .expect("code macro");
        let code = fragment.element(&path).expect("element");
        assert_eq!(code.attr("ac:name"), Some("code"));
        assert_eq!(fragment.text(code), "if a < b && c > d {}");
    }

    #[test]
    fn text_decodes_entities_and_strips_tags() {
        let fragment = Fragment::parse(PAGE);
        let path = fragment
            .find_path(&[], &|element| element.name() == "td")
            .expect("td");
        let cell = fragment.element(&path).expect("td element");
        assert_eq!(fragment.text(cell).trim(), "In\u{a0}Progress");
    }

    #[test]
    fn quoted_attribute_may_contain_angle_bracket() {
        let fragment = Fragment::parse("<a href=\"https://x.test/?q=a>b\" title='x'>link</a>");
        let anchor = fragment.element(&[0]).expect("anchor");
        assert_eq!(anchor.attr("href"), Some("https://x.test/?q=a>b"));
        assert_eq!(anchor.attr("title"), Some("x"));
        assert_eq!(fragment.text(anchor), "link");
    }

    #[test]
    fn bare_less_than_stays_text() {
        let source = "<p>1 < 2</p>";
        let fragment = Fragment::parse(source);
        assert_eq!(fragment.render(), source);
        let paragraph = fragment.element(&[0]).expect("p");
        assert_eq!(fragment.text(paragraph), "1 < 2");
    }

    #[test]
    fn mismatched_close_is_repaired_and_rendered_verbatim() {
        let source = "<p><strong>x</p></strong>";
        let fragment = Fragment::parse(source);
        assert_eq!(fragment.render(), source);
        assert_eq!(
            fragment.repairs().cloned().collect::<Vec<_>>(),
            vec![
                MarkupError::MismatchedClose {
                    expected: "strong".to_string(),
                    found: "p".to_string(),
                    at: 12,
                },
                MarkupError::UnexpectedClose {
                    name: "strong".to_string(),
                    at: 16,
                },
            ]
        );
        let paragraph = fragment.element(&[0]).expect("p");
        assert_eq!(fragment.text(paragraph), "x");
    }

    #[test]
    fn unclosed_elements_close_at_end_of_input() {
        let source = "<table><tr>";
        let fragment = Fragment::parse(source);
        assert_eq!(fragment.render(), source);
        assert!(fragment.element(&[0, 0]).is_some_and(|row| row.name() == "tr"));
        assert!(
            fragment
                .repairs()
                .any(|repair| matches!(repair, MarkupError::Unclosed { name, .. } if name == "tr"))
        );
    }

    #[test]
    fn stray_close_is_kept_as_opaque_markup() {
        let fragment = Fragment::parse("x</p>");
        assert_eq!(fragment.render(), "x</p>");
        assert!(matches!(fragment.nodes()[1], Node::Opaque(_)));
        assert!(matches!(
            fragment.repairs().next(),
            Some(MarkupError::UnexpectedClose { at: 1, .. })
        ));
    }

    #[test]
    fn unterminated_comment_swallows_the_rest() {
        let source = "<p>a</p><!-- open <p>b</p>";
        let fragment = Fragment::parse(source);
        assert_eq!(fragment.render(), source);
        assert_eq!(fragment.nodes().len(), 2);
        assert_eq!(
            fragment.repairs().next(),
            Some(&MarkupError::UnterminatedComment(8))
        );
    }

    #[test]
    fn html_void_elements_need_no_close_tag() {
        let source = "<p>notes<br>more<img src=\"a.png\"></p>";
        let fragment = Fragment::parse(source);
        assert_eq!(fragment.render(), source);
        assert_eq!(fragment.repairs().count(), 0);
        let paragraph = fragment.element(&[0]).expect("p");
        assert_eq!(fragment.text(paragraph), "notesmore");
    }

    #[test]
    fn check_within_only_reports_repairs_inside_the_element() {
        let source = "<div><p>loose</div><section><p>ok</p></section><aside><b>x</aside>";
        let fragment = Fragment::parse(source);
        assert_eq!(fragment.render(), source);
        let section = fragment.element(&[1]).expect("section");
        assert_eq!(section.name(), "section");
        assert!(fragment.check_within(section).is_ok());

        let div = fragment.element(&[0]).expect("div");
        assert!(matches!(
            fragment.check_within(div),
            Err(MarkupError::MismatchedClose { ref expected, .. }) if expected == "p"
        ));
        let aside = fragment.element(&[2]).expect("aside");
        assert!(fragment.check_within(aside).is_err());
    }

    #[test]
    fn replacing_children_of_self_closing_element_expands_it() {
        let mut fragment = Fragment::parse("<tr><th>Key</th><td /></tr>");
        let path = fragment
            .find_path(&[], &|element| element.name() == "td")
            .expect("td");
        fragment
            .element_mut(&path)
            .expect("td")
            .replace_children("<p>v</p>".to_string());
        assert_eq!(fragment.render(), "<tr><th>Key</th><td><p>v</p></td></tr>");
    }

    #[test]
    fn appended_child_lands_before_close_tag() {
        let mut fragment = Fragment::parse("<div><tbody>\n</tbody></div>");
        fragment
            .element_mut(&[0, 0])
            .expect("tbody")
            .append_child("<tr/>".to_string());
        assert_eq!(fragment.render(), "<div><tbody>\n<tr/></tbody></div>");
    }

    #[test]
    fn entity_decoding_handles_numeric_and_unknown_references() {
        assert_eq!(decode_entities("a&#39;b&#x41;&amp;&bogus;"), "a'bA&&bogus;");
        assert_eq!(decode_entities("R&D"), "R&D");
    }

    #[test]
    fn named_html_entities_are_decoded() {
        assert_eq!(decode_entities("Won &ndash; Closed"), "Won \u{2013} Closed");
        assert_eq!(decode_entities("Retail&rsquo;s &hellip;"), "Retail\u{2019}s \u{2026}");
        assert_eq!(decode_entities("Caf&eacute; &copy;"), "Caf\u{e9} \u{a9}");
        assert_eq!(decode_entities("&Ndash;"), "&Ndash;");
    }

    #[test]
    fn escape_text_escapes_markup_characters() {
        assert_eq!(escape_text("a<b>&c"), "a&lt;b&gt;&amp;c");
    }
}
