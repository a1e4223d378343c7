use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::extract::PropertyValue;

pub const DEFAULT_PROPERTY_KEYS: [&str; 5] = [
    "Solution Type",
    "Industry",
    "Horizontal",
    "Cloud Platform",
    "Status",
];
pub const DEFAULT_STATUS_KEY: &str = "Status";
pub const DEFAULT_STATUS_PREFIX: &str = "status-";
pub const DEFAULT_MARKER_LABELS: [&str; 2] = ["se-tsd", "se-opportunity"];
pub const DEFAULT_VALUES: [&str; 20] = [
    "sap",
    "salesforce",
    "oracle",
    "microsoft-dynamics",
    "custom-development",
    "retail",
    "manufacturing",
    "automotive",
    "financial-services",
    "healthcare",
    "public-sector",
    "data-analytics",
    "integration",
    "security",
    "ai-ml",
    "aws",
    "azure",
    "gcp",
    "alibaba-cloud",
    "on-premise",
];

/// Which property keys turn into labels, and which labels this tool owns.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Vocabulary {
    pub property_keys: Vec<String>,
    pub status_key: String,
    pub status_prefix: String,
    /// Closed value set. Entries are compared after [`normalize_label`].
    pub values: Vec<String>,
    pub marker_labels: Vec<String>,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self {
            property_keys: DEFAULT_PROPERTY_KEYS.iter().map(ToString::to_string).collect(),
            status_key: DEFAULT_STATUS_KEY.to_string(),
            status_prefix: DEFAULT_STATUS_PREFIX.to_string(),
            values: DEFAULT_VALUES.iter().map(ToString::to_string).collect(),
            marker_labels: DEFAULT_MARKER_LABELS
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

impl Vocabulary {
    /// Label for one property, or `None` when the key is not in the vocabulary or the
    /// value normalizes to nothing.
    pub fn label_for(&self, key: &str, value: &PropertyValue) -> Option<String> {
        if !self.property_keys.iter().any(|known| known == key) {
            return None;
        }
        let token = normalize_label(value.text());
        if token.is_empty() {
            return None;
        }
        if key == self.status_key {
            Some(format!("{}{token}", self.status_prefix))
        } else {
            Some(token)
        }
    }

    /// The closed value set as label tokens.
    pub fn value_labels(&self) -> BTreeSet<String> {
        self.values
            .iter()
            .map(|value| normalize_label(value))
            .filter(|token| !token.is_empty())
            .collect()
    }

    pub fn is_status_label(&self, label: &str) -> bool {
        !self.status_prefix.is_empty() && label.starts_with(&self.status_prefix)
    }

    pub fn has_marker(&self, labels: &BTreeSet<String>) -> bool {
        self.marker_labels
            .iter()
            .any(|marker| labels.contains(marker))
    }
}

/// Lowercase, fold accented Latin letters to ASCII, collapse every run of
/// non-alphanumeric characters to one hyphen, and drop leading and trailing hyphens.
pub fn normalize_label(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut pending_hyphen = false;
    for ch in value.chars().flat_map(char::to_lowercase) {
        if !ch.is_alphanumeric() {
            pending_hyphen = true;
            continue;
        }
        if pending_hyphen && !out.is_empty() {
            out.push('-');
        }
        pending_hyphen = false;
        match fold_latin(ch) {
            Some(folded) => out.push_str(folded),
            None => out.push(ch),
        }
    }
    out
}

/// ASCII spelling of a lowercase accented Latin letter. Other letters pass through.
fn fold_latin(ch: char) -> Option<&'static str> {
    let folded = match ch {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => "a",
        'æ' => "ae",
        'ç' | 'ć' | 'č' => "c",
        'ď' | 'đ' | 'ð' => "d",
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ė' | 'ę' | 'ě' => "e",
        'ğ' => "g",
        'ì' | 'í' | 'î' | 'ï' | 'ī' | 'į' | 'ı' => "i",
        'ł' => "l",
        'ñ' | 'ń' | 'ň' => "n",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => "o",
        'œ' => "oe",
        'ř' => "r",
        'ś' | 'š' | 'ş' => "s",
        'ß' => "ss",
        'ť' | 'ţ' => "t",
        'þ' => "th",
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' | 'ų' => "u",
        'ý' | 'ÿ' => "y",
        'ź' | 'ż' | 'ž' => "z",
        _ => return None,
    };
    Some(folded)
}
