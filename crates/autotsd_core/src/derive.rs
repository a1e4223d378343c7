//! Identifiers derived from link-valued properties.
//!
//! A derived id is recomputed from its source link on every pass. The resolver only
//! reports intent (insert or update a row); writing it into the page is the mutator's job.

use std::collections::BTreeSet;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, warn};

use crate::extract::{PropertyMap, PropertyValue};

pub const DEFAULT_SOURCE_KEY_PREFIX: &str = "SalesForce Opportunity";
pub const DEFAULT_DERIVED_KEY: &str = "OpportunityID";
/// Salesforce Lightning record links end in `/<record id>/view`.
pub const DEFAULT_ID_PATTERN: &str = r"/([^/?#]+)/view";

/// A regular expression applied to a link target. Capture group 1 is the id.
#[derive(Debug, Clone)]
pub struct IdPattern {
    regex: Regex,
}

impl IdPattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(pattern)?,
        })
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    /// A pattern without a capture group compiles fine but can never yield an id.
    pub fn has_capture_group(&self) -> bool {
        self.regex.captures_len() > 1
    }

    pub fn capture(&self, href: &str) -> Option<String> {
        let captures = self.regex.captures(href.trim())?;
        let value = captures.get(1)?.as_str().trim();
        (!value.is_empty()).then(|| value.to_string())
    }
}

impl PartialEq for IdPattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for IdPattern {}

impl fmt::Display for IdPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for IdPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for IdPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::new(&raw)
            .map_err(|error| serde::de::Error::custom(format!("invalid id pattern '{raw}': {error}")))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct IdDefinition {
    pub source_key_prefix: String,
    pub derived_key: String,
    pub pattern: IdPattern,
}

impl IdDefinition {
    /// Opportunity id taken from the Salesforce link row.
    pub fn opportunity() -> Result<Self, regex::Error> {
        Ok(Self {
            source_key_prefix: DEFAULT_SOURCE_KEY_PREFIX.to_string(),
            derived_key: DEFAULT_DERIVED_KEY.to_string(),
            pattern: IdPattern::new(DEFAULT_ID_PATTERN)?,
        })
    }
}

/// Definitions used when the config names none.
pub fn default_id_definitions() -> Vec<IdDefinition> {
    IdDefinition::opportunity().into_iter().collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DerivedProperty {
    pub key: String,
    pub source_key: String,
    pub pattern: IdPattern,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkupOp {
    Insert,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropertyUpdate {
    pub key: String,
    pub value: String,
    pub op: MarkupOp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub derived: Vec<DerivedProperty>,
    pub updates: Vec<PropertyUpdate>,
}

impl Resolution {
    /// True when at least one derived id needs a row inserted or updated.
    pub fn changed(&self) -> bool {
        !self.updates.is_empty()
    }

    pub fn derived_map(&self) -> PropertyMap {
        let mut map = PropertyMap::new();
        for property in &self.derived {
            map.insert(
                property.key.clone(),
                PropertyValue::Text(property.value.clone()),
            );
        }
        map
    }
}

pub fn resolve(properties: &PropertyMap, definitions: &[IdDefinition]) -> Resolution {
    let mut resolution = Resolution::default();
    let mut seen = BTreeSet::new();

    for definition in definitions {
        let Some((source_key, source)) = properties.find_by_prefix(&definition.source_key_prefix)
        else {
            continue;
        };
        let Some(href) = source.href() else {
            debug!(key = %source_key, "id source is not a link");
            continue;
        };
        let Some(value) = definition.pattern.capture(href) else {
            debug!(key = %source_key, pattern = %definition.pattern, "id pattern did not match");
            continue;
        };
        if !seen.insert(definition.derived_key.clone()) {
            warn!(key = %definition.derived_key, "derived key already resolved in this pass");
            continue;
        }

        let op = match properties.get(&definition.derived_key) {
            Some(existing) if existing.text().trim() == value => None,
            Some(_) => Some(MarkupOp::Update),
            None => Some(MarkupOp::Insert),
        };
        if let Some(op) = op {
            resolution.updates.push(PropertyUpdate {
                key: definition.derived_key.clone(),
                value: value.clone(),
                op,
            });
        }
        resolution.derived.push(DerivedProperty {
            key: definition.derived_key.clone(),
            source_key: source_key.to_string(),
            pattern: definition.pattern.clone(),
            value,
        });
    }

    resolution
}
