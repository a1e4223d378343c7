use serde::ser::{Serialize, Serializer};
use tracing::{debug, warn};

use crate::markup::{Element, Fragment, MarkupError};

pub const DETAILS_MACRO_TAG: &str = "ac:structured-macro";
pub const DETAILS_MACRO_NAME: &str = "details";

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    Text(String),
    Link { href: String, text: String },
}

impl PropertyValue {
    /// The human-readable value: the text itself, or a link's display text.
    pub fn text(&self) -> &str {
        match self {
            Self::Text(text) => text,
            Self::Link { text, .. } => text,
        }
    }

    pub fn href(&self) -> Option<&str> {
        match self {
            Self::Text(_) => None,
            Self::Link { href, .. } => Some(href),
        }
    }
}

/// Properties in table row order. Keys are unique: inserting an existing key
/// replaces its value in place (the later row wins) and hands back the old value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyMap {
    entries: Vec<(String, PropertyValue)>,
}

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: PropertyValue) -> Option<PropertyValue> {
        let key = key.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// First property, in row order, whose key starts with `prefix`.
    pub fn find_by_prefix(&self, prefix: &str) -> Option<(&str, &PropertyValue)> {
        self.iter().find(|(key, _)| key.starts_with(prefix))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for PropertyMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.iter())
    }
}

/// Row and cell locations of the details macro table inside a parsed fragment.
#[derive(Debug, Clone)]
pub(crate) struct DetailsTable {
    /// Where new rows are appended: the last `tbody`, or the table itself.
    pub body: Vec<usize>,
    pub rows: Vec<DetailsRow>,
}

#[derive(Debug, Clone)]
pub(crate) struct DetailsRow {
    pub header: Option<Vec<usize>>,
    pub data: Option<Vec<usize>>,
}

pub fn is_details_macro(element: &Element) -> bool {
    element.name() == DETAILS_MACRO_TAG && element.attr("ac:name") == Some(DETAILS_MACRO_NAME)
}

pub fn has_details_macro(fragment: &Fragment) -> bool {
    fragment.find_path(&[], &is_details_macro).is_some()
}

/// Parse `raw_markup` and extract the first details macro's properties.
/// A page without the macro yields an empty map.
pub fn extract_properties(raw_markup: &str) -> Result<PropertyMap, MarkupError> {
    let fragment = Fragment::parse(raw_markup);
    extract_from_fragment(&fragment)
}

pub fn extract_from_fragment(fragment: &Fragment) -> Result<PropertyMap, MarkupError> {
    let mut properties = PropertyMap::new();
    let Some(table) = locate_details_table(fragment)? else {
        return Ok(properties);
    };

    for row in &table.rows {
        let Some(header) = row.header.as_deref().and_then(|path| fragment.element(path)) else {
            continue;
        };
        let key = fragment.text(header).trim().to_string();
        if key.is_empty() {
            continue;
        }
        let Some(cell) = row.data.as_deref().and_then(|path| fragment.element(path)) else {
            debug!(key = %key, "skipping property row without a data cell");
            continue;
        };
        let value = cell_value(fragment, cell);
        if let Some(previous) = properties.insert(key.clone(), value) {
            warn!(
                key = %key,
                previous = %previous.text(),
                "duplicate property row; the later row wins"
            );
        }
    }

    Ok(properties)
}

fn cell_value(fragment: &Fragment, cell: &Element) -> PropertyValue {
    let anchor = cell.find_descendant(&|element| {
        element.name() == "a" && element.attr("href").is_some_and(|href| !href.trim().is_empty())
    });
    match anchor {
        Some(anchor) => PropertyValue::Link {
            href: anchor.attr("href").unwrap_or_default().trim().to_string(),
            text: fragment.text(anchor).trim().to_string(),
        },
        None => PropertyValue::Text(fragment.text(cell).trim().to_string()),
    }
}

pub(crate) fn locate_details_table(
    fragment: &Fragment,
) -> Result<Option<DetailsTable>, MarkupError> {
    let Some(macro_path) = fragment.find_path(&[], &is_details_macro) else {
        return Ok(None);
    };
    // Markup outside the macro may be sloppy; inside it the table shape must be exact.
    let details = fragment
        .element(&macro_path)
        .ok_or(MarkupError::MissingMacro)?;
    fragment.check_within(details)?;
    let table_path = fragment
        .find_path(&macro_path, &|element| element.name() == "table")
        .ok_or(MarkupError::MissingTable)?;
    let table = fragment
        .element(&table_path)
        .ok_or(MarkupError::MissingTable)?;

    let mut body = table_path.clone();
    let mut row_paths = Vec::new();
    for (index, child) in table.child_elements() {
        match child.name() {
            "thead" | "tbody" | "tfoot" => {
                let section = child_path(&table_path, index);
                for (row_index, row) in child.child_elements() {
                    if row.name() == "tr" {
                        row_paths.push(child_path(&section, row_index));
                    }
                }
                if child.name() == "tbody" {
                    body = section;
                }
            }
            "tr" => row_paths.push(child_path(&table_path, index)),
            _ => {}
        }
    }

    let mut rows = Vec::with_capacity(row_paths.len());
    for (number, path) in row_paths.into_iter().enumerate() {
        let Some(row) = fragment.element(&path) else {
            continue;
        };
        let mut header = None;
        let mut data = None;
        for (index, cell) in row.child_elements() {
            match cell.name() {
                "th" if header.is_none() => header = Some(child_path(&path, index)),
                "td" if data.is_none() => data = Some(child_path(&path, index)),
                _ => {}
            }
        }
        if header.is_none() && data.is_some() {
            return Err(MarkupError::HeaderlessRow { row: number + 1 });
        }
        rows.push(DetailsRow { header, data });
    }

    Ok(Some(DetailsTable { body, rows }))
}

fn child_path(parent: &[usize], index: usize) -> Vec<usize> {
    let mut path = Vec::with_capacity(parent.len() + 1);
    path.extend_from_slice(parent);
    path.push(index);
    path
}
