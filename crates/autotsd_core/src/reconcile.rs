use std::collections::BTreeSet;

use serde::Serialize;

use crate::extract::PropertyMap;
use crate::vocabulary::Vocabulary;

/// Labels to add and remove. The two sets never overlap.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LabelDiff {
    pub to_add: BTreeSet<String>,
    pub to_remove: BTreeSet<String>,
}

impl LabelDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Labels the page should carry according to its properties.
pub fn target_labels(vocabulary: &Vocabulary, properties: &PropertyMap) -> BTreeSet<String> {
    properties
        .iter()
        .filter_map(|(key, value)| vocabulary.label_for(key, value))
        .collect()
}

/// Diff `existing` against the labels the properties call for.
///
/// Only labels this tool owns are ever removed: closed-set values, status-prefixed
/// labels, and labels that are targets anyway. Everything else on the page is left
/// alone.
pub fn reconcile(
    vocabulary: &Vocabulary,
    properties: &PropertyMap,
    existing: &BTreeSet<String>,
) -> LabelDiff {
    let target = target_labels(vocabulary, properties);
    let values = vocabulary.value_labels();
    let managed = existing
        .iter()
        .filter(|label| {
            values.contains(*label) || vocabulary.is_status_label(label) || target.contains(*label)
        })
        .cloned()
        .collect::<BTreeSet<_>>();

    LabelDiff {
        to_add: target.difference(&managed).cloned().collect(),
        to_remove: managed.difference(&target).cloned().collect(),
    }
}
