//! Run-length merging of per-position edit tags.

use rise_types::{ActionError, ActionSpan, EditAction, EditTag, MergedAction};

/// Collapses an extended-input action list into maximal same-tag runs.
pub fn merge_tags(actions: &[EditAction]) -> Result<MergedAction, ActionError> {
    merge_spans(
        actions
            .iter()
            .enumerate()
            .map(|(position, action)| ActionSpan::unit(position, action))
            .collect(),
    )
}

/// Merges adjacent spans sharing a tag; substitute spans never merge.
pub fn merge_spans(spans: Vec<ActionSpan>) -> Result<MergedAction, ActionError> {
    let mut merged: Vec<ActionSpan> = Vec::with_capacity(spans.len());
    for span in spans {
        if let Some(last) = merged.last_mut() {
            if last.tag == span.tag && span.tag != EditTag::Substitute && last.end() == span.start
            {
                last.len += span.len;
                last.payloads.extend(span.payloads);
                continue;
            }
        }
        merged.push(span);
    }
    MergedAction::from_spans(merged)
}
