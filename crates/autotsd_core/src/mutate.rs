use std::borrow::Cow;

use crate::derive::{MarkupOp, PropertyUpdate};
use crate::extract::{DetailsTable, locate_details_table};
use crate::markup::{Fragment, MarkupError, escape_text};

/// Write derived property rows into the details macro.
///
/// With no updates the input is handed back untouched; the tree is only re-serialized
/// when a row actually changes.
pub fn apply_updates<'a>(
    raw_markup: &'a str,
    updates: &[PropertyUpdate],
) -> Result<Cow<'a, str>, MarkupError> {
    if updates.is_empty() {
        return Ok(Cow::Borrowed(raw_markup));
    }
    let mut fragment = Fragment::parse(raw_markup);
    apply_to_fragment(&mut fragment, updates)?;
    Ok(Cow::Owned(fragment.render()))
}

pub fn apply_to_fragment(
    fragment: &mut Fragment,
    updates: &[PropertyUpdate],
) -> Result<(), MarkupError> {
    let table = locate_details_table(fragment)?.ok_or(MarkupError::MissingMacro)?;
    for update in updates {
        match update.op {
            MarkupOp::Update => {
                let path = data_cell_for(fragment, &table, &update.key).ok_or_else(|| {
                    MarkupError::MissingRow {
                        key: update.key.clone(),
                    }
                })?;
                let cell = fragment
                    .element_mut(&path)
                    .ok_or_else(|| MarkupError::MissingRow {
                        key: update.key.clone(),
                    })?;
                cell.replace_children(paragraph(&update.value));
            }
            MarkupOp::Insert => {
                let body = fragment
                    .element_mut(&table.body)
                    .ok_or(MarkupError::MissingTable)?;
                body.append_child(property_row(&update.key, &update.value));
            }
        }
    }
    Ok(())
}

/// Data cell of the last row whose header reads `key`, matching the extractor's
/// last-row-wins rule.
fn data_cell_for(fragment: &Fragment, table: &DetailsTable, key: &str) -> Option<Vec<usize>> {
    table
        .rows
        .iter()
        .rev()
        .filter(|row| {
            row.header
                .as_deref()
                .and_then(|path| fragment.element(path))
                .is_some_and(|header| fragment.text(header).trim() == key)
        })
        .find_map(|row| row.data.clone())
}

fn paragraph(value: &str) -> String {
    format!("<p>{}</p>", escape_text(value))
}

fn property_row(key: &str, value: &str) -> String {
    format!(
        "<tr><th><p><strong>{}</strong></p></th><td>{}</td></tr>",
        escape_text(key),
        paragraph(value)
    )
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use super::apply_updates;
    use crate::derive::{MarkupOp, PropertyUpdate, default_id_definitions, resolve};
    use crate::extract::{PropertyValue, extract_properties};
    use crate::markup::MarkupError;

    const PAGE: &str = concat!(
        "<h2>Summary</h2>\n<p>Keep   this   spacing &amp; entities.</p>\n",
        "<ac:structured-macro ac:name=\"details\" ac:schema-version=\"1\" ac:macro-id=\"m-1\">",
        "<ac:rich-text-body><table class=\"wrapped\"><colgroup><col /><col /></colgroup><tbody>",
        "<tr><th><p><strong>Status</strong></p></th><td><p>Draft</p></td></tr>",
        "<tr><th><p><strong>SalesForce Opportunity Link</strong></p></th><td><p>",
        "<a href=\"https://acme.lightning.force.com/lightning/r/Opportunity/0010z00001YlCFEAA3/view\">Acme</a>",
        "</p></td></tr>",
        "</tbody></table></ac:rich-text-body></ac:structured-macro>\n",
        "<ac:structured-macro ac:name=\"toc\" />\n<p>Footer</p>"
    );

    fn update(key: &str, value: &str, op: MarkupOp) -> PropertyUpdate {
        PropertyUpdate {
            key: key.to_string(),
            value: value.to_string(),
            op,
        }
    }

    #[test]
    fn empty_updates_return_input_unchanged() {
        let result = apply_updates(PAGE, &[]).expect("apply");
        assert!(matches!(result, Cow::Borrowed(_)));
        assert_eq!(result, PAGE);
    }

    #[test]
    fn empty_updates_do_not_require_parseable_markup() {
        let broken = "<p>unclosed";
        assert_eq!(apply_updates(broken, &[]).expect("apply"), broken);
    }

    #[test]
    fn insert_appends_row_and_preserves_everything_else() {
        let result = apply_updates(
            PAGE,
            &[update("OpportunityID", "0010z00001YlCFEAA3", MarkupOp::Insert)],
        )
        .expect("apply");
        let expected = PAGE.replace(
            "</tbody>",
            "<tr><th><p><strong>OpportunityID</strong></p></th><td><p>0010z00001YlCFEAA3</p></td></tr></tbody>",
        );
        assert_eq!(result, expected);
    }

    #[test]
    fn insert_keeps_sloppy_markup_around_the_macro_byte_for_byte() {
        let page = format!("<p>notes<b>draft</p></span>\n{PAGE}\n<p>trailing");
        let result = apply_updates(
            &page,
            &[update("OpportunityID", "0010z00001YlCFEAA3", MarkupOp::Insert)],
        )
        .expect("apply");
        let expected = page.replace(
            "</tbody>",
            "<tr><th><p><strong>OpportunityID</strong></p></th><td><p>0010z00001YlCFEAA3</p></td></tr></tbody>",
        );
        assert_eq!(result, expected);
    }

    #[test]
    fn update_replaces_only_the_matching_data_cell() {
        let result =
            apply_updates(PAGE, &[update("Status", "Won & closed", MarkupOp::Update)]).expect("apply");
        let expected = PAGE.replace("<td><p>Draft</p></td>", "<td><p>Won &amp; closed</p></td>");
        assert_eq!(result, expected);
        let properties = extract_properties(&result).expect("extract");
        assert_eq!(
            properties.get("Status").map(PropertyValue::text),
            Some("Won & closed")
        );
    }

    #[test]
    fn update_targets_last_duplicate_row() {
        let page = "<ac:structured-macro ac:name=\"details\"><ac:rich-text-body><table><tbody>\
                    <tr><th>Key</th><td>first</td></tr><tr><th>Key</th><td>second</td></tr>\
                    </tbody></table></ac:rich-text-body></ac:structured-macro>";
        let result = apply_updates(page, &[update("Key", "third", MarkupOp::Update)]).expect("apply");
        assert!(result.contains("<td>first</td>"));
        assert!(result.contains("<td><p>third</p></td>"));
        assert!(!result.contains("second"));
    }

    #[test]
    fn update_of_missing_row_is_an_error() {
        let error = apply_updates(PAGE, &[update("OpportunityID", "x", MarkupOp::Update)])
            .expect_err("must fail");
        assert_eq!(
            error,
            MarkupError::MissingRow {
                key: "OpportunityID".to_string()
            }
        );
    }

    #[test]
    fn insert_without_macro_is_an_error() {
        let error = apply_updates("<p>plain</p>", &[update("OpportunityID", "x", MarkupOp::Insert)])
            .expect_err("must fail");
        assert_eq!(error, MarkupError::MissingMacro);
    }

    #[test]
    fn insert_then_resolve_again_is_stable() {
        let definitions = default_id_definitions();
        let first = resolve(&extract_properties(PAGE).expect("extract"), &definitions);
        assert!(first.changed());

        let mutated = apply_updates(PAGE, &first.updates).expect("apply");
        let second = resolve(&extract_properties(&mutated).expect("extract"), &definitions);
        assert!(!second.changed());
        assert_eq!(apply_updates(&mutated, &second.updates).expect("apply"), mutated);
    }
}
