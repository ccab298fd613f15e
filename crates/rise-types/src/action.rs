//! Edit tags, per-position edit actions and run-length merged actions.
//!
//! Every action list is indexed by the *extended* input: `[BOS] + input +
//! [EOS]`. Insertions are expressed as "insert before this position", which
//! is why appending to a sequence is an `Insert` carried by EOS.

use crate::TokenId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of channels in a model edit-probability row.
pub const EDIT_CHANNELS: usize = 5;
/// Reserved null channel; never a valid edit outcome.
pub const NULL_CHANNEL: usize = 0;

/// Errors raised while validating or applying edit actions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("{context} shape mismatch: expected {expected}, found {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("merged action must contain at least one span")]
    EmptyMergedAction,
    #[error("{tag:?} at position {position} requires a non-empty token payload")]
    MissingPayload { tag: EditTag, position: usize },
    #[error("boundary position {position} cannot carry {tag:?}")]
    BoundaryViolation { position: usize, tag: EditTag },
    #[error("span starting at {start} does not continue the previous span ending at {expected}")]
    NonContiguousSpan { start: usize, expected: usize },
}

/// Edit type predicted per extended-input position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditTag {
    Keep,
    Insert,
    Delete,
    Substitute,
}

impl EditTag {
    /// Tags in model channel order.
    pub const ALL: [EditTag; 4] = [
        EditTag::Keep,
        EditTag::Insert,
        EditTag::Delete,
        EditTag::Substitute,
    ];

    /// Tie-break order used by the aligner and the greedy walk.
    pub const PRECEDENCE: [EditTag; 4] = [
        EditTag::Keep,
        EditTag::Substitute,
        EditTag::Insert,
        EditTag::Delete,
    ];

    /// Returns the model channel carrying this tag's probability.
    pub fn channel(self) -> usize {
        match self {
            Self::Keep => 1,
            Self::Insert => 2,
            Self::Delete => 3,
            Self::Substitute => 4,
        }
    }

    /// Maps a model channel back to a tag; the null channel maps to `None`.
    pub fn from_channel(channel: usize) -> Option<Self> {
        match channel {
            1 => Some(Self::Keep),
            2 => Some(Self::Insert),
            3 => Some(Self::Delete),
            4 => Some(Self::Substitute),
            _ => None,
        }
    }

    /// Position of this tag in [`EditTag::PRECEDENCE`].
    pub fn precedence_rank(self) -> usize {
        match self {
            Self::Keep => 0,
            Self::Substitute => 1,
            Self::Insert => 2,
            Self::Delete => 3,
        }
    }

    /// Returns true for tags that emit generated tokens.
    pub fn carries_payload(self) -> bool {
        matches!(self, Self::Insert | Self::Substitute)
    }
}

/// Concrete edit applied at one extended-input position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "tag", content = "tokens", rename_all = "snake_case")]
pub enum EditAction {
    Keep,
    /// Emits the payload, then the original token.
    Insert(Vec<TokenId>),
    Delete,
    /// Emits the payload in place of the original token.
    Substitute(Vec<TokenId>),
}

impl EditAction {
    pub fn tag(&self) -> EditTag {
        match self {
            Self::Keep => EditTag::Keep,
            Self::Insert(_) => EditTag::Insert,
            Self::Delete => EditTag::Delete,
            Self::Substitute(_) => EditTag::Substitute,
        }
    }

    /// Generated tokens carried by this action; empty for keep/delete.
    pub fn payload(&self) -> &[TokenId] {
        match self {
            Self::Insert(tokens) | Self::Substitute(tokens) => tokens,
            Self::Keep | Self::Delete => &[],
        }
    }

    /// Number of tokens this action contributes to the output.
    pub fn output_len(&self) -> usize {
        match self {
            Self::Keep => 1,
            Self::Delete => 0,
            Self::Insert(tokens) => tokens.len() + 1,
            Self::Substitute(tokens) => tokens.len(),
        }
    }

    fn emit(&self, token: TokenId, output: &mut Vec<TokenId>) {
        match self {
            Self::Keep => output.push(token),
            Self::Delete => {}
            Self::Insert(tokens) => {
                output.extend_from_slice(tokens);
                output.push(token);
            }
            Self::Substitute(tokens) => output.extend_from_slice(tokens),
        }
    }
}

/// Checks boundary and payload invariants of an extended-input action list.
pub fn validate_actions(actions: &[EditAction]) -> Result<(), ActionError> {
    if actions.len() < 2 {
        return Err(ActionError::ShapeMismatch {
            context: "boundary-inclusive action list",
            expected: 2,
            actual: actions.len(),
        });
    }
    let first = actions[0].tag();
    if first != EditTag::Keep {
        return Err(ActionError::BoundaryViolation {
            position: 0,
            tag: first,
        });
    }
    let last_position = actions.len() - 1;
    let last = actions[last_position].tag();
    if !matches!(last, EditTag::Keep | EditTag::Insert) {
        return Err(ActionError::BoundaryViolation {
            position: last_position,
            tag: last,
        });
    }
    for (position, action) in actions.iter().enumerate() {
        if action.tag().carries_payload() && action.payload().is_empty() {
            return Err(ActionError::MissingPayload {
                tag: action.tag(),
                position,
            });
        }
    }
    Ok(())
}

/// Applies an action list to the extended input it was sampled for.
///
/// The result still carries BOS/EOS; see [`strip_boundaries`].
pub fn apply_actions(
    extended_input: &[TokenId],
    actions: &[EditAction],
) -> Result<Vec<TokenId>, ActionError> {
    if extended_input.len() != actions.len() {
        return Err(ActionError::ShapeMismatch {
            context: "action list",
            expected: extended_input.len(),
            actual: actions.len(),
        });
    }
    validate_actions(actions)?;

    let capacity = actions.iter().map(EditAction::output_len).sum();
    let mut output = Vec::with_capacity(capacity);
    for (token, action) in extended_input.iter().zip(actions) {
        action.emit(*token, &mut output);
    }
    Ok(output)
}

/// Drops the leading BOS and trailing EOS of an applied extended sequence.
pub fn strip_boundaries(mut sequence: Vec<TokenId>) -> Vec<TokenId> {
    if sequence.len() < 2 {
        return Vec::new();
    }
    sequence.pop();
    sequence.remove(0);
    sequence
}

/// Run of identical tags covering `len` consecutive positions from `start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSpan {
    pub tag: EditTag,
    pub start: usize,
    pub len: usize,
    /// One token list per covered position for insert/substitute spans.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payloads: Vec<Vec<TokenId>>,
}

impl ActionSpan {
    /// Creates a one-position span from an action.
    pub fn unit(position: usize, action: &EditAction) -> Self {
        let payloads = if action.tag().carries_payload() {
            vec![action.payload().to_vec()]
        } else {
            Vec::new()
        };
        Self {
            tag: action.tag(),
            start: position,
            len: 1,
            payloads,
        }
    }

    /// First position past the span.
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    /// Expands the span back into per-position actions.
    pub fn actions(&self) -> Vec<EditAction> {
        match self.tag {
            EditTag::Keep => vec![EditAction::Keep; self.len],
            EditTag::Delete => vec![EditAction::Delete; self.len],
            EditTag::Insert => self
                .payloads
                .iter()
                .cloned()
                .map(EditAction::Insert)
                .collect(),
            EditTag::Substitute => self
                .payloads
                .iter()
                .cloned()
                .map(EditAction::Substitute)
                .collect(),
        }
    }
}

/// Run-length compacted action list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedAction {
    spans: Vec<ActionSpan>,
}

impl MergedAction {
    /// Builds a merged action from contiguous spans starting at position 0.
    pub fn from_spans(spans: Vec<ActionSpan>) -> Result<Self, ActionError> {
        if spans.is_empty() {
            return Err(ActionError::EmptyMergedAction);
        }
        let mut expected = 0usize;
        for span in &spans {
            if span.start != expected || span.len == 0 {
                return Err(ActionError::NonContiguousSpan {
                    start: span.start,
                    expected,
                });
            }
            let expected_payloads = if span.tag.carries_payload() {
                span.len
            } else {
                0
            };
            if span.payloads.len() != expected_payloads {
                return Err(ActionError::ShapeMismatch {
                    context: "span payloads",
                    expected: expected_payloads,
                    actual: span.payloads.len(),
                });
            }
            expected = span.end();
        }
        Ok(Self { spans })
    }

    pub fn spans(&self) -> &[ActionSpan] {
        &self.spans
    }

    pub fn into_spans(self) -> Vec<ActionSpan> {
        self.spans
    }

    /// Number of extended-input positions covered.
    pub fn position_count(&self) -> usize {
        self.spans.last().map(ActionSpan::end).unwrap_or(0)
    }

    /// Reconstructs the unmerged per-position action list.
    pub fn expand(&self) -> Vec<EditAction> {
        self.spans.iter().flat_map(ActionSpan::actions).collect()
    }

    /// Applies the merged action to the extended input.
    pub fn apply(&self, extended_input: &[TokenId]) -> Result<Vec<TokenId>, ActionError> {
        apply_actions(extended_input, &self.expand())
    }
}

/// Tag skeleton for one position before slot tokens are generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedEdit {
    pub tag: EditTag,
    /// Tokens to generate for insert/substitute; zero otherwise.
    pub width: usize,
}

impl PlannedEdit {
    /// Creates a planned edit with the default single-token width.
    pub fn new(tag: EditTag) -> Self {
        Self {
            tag,
            width: usize::from(tag.carries_payload()),
        }
    }

    pub fn output_len(&self) -> usize {
        match self.tag {
            EditTag::Keep => 1,
            EditTag::Delete => 0,
            EditTag::Insert => self.width + 1,
            EditTag::Substitute => self.width,
        }
    }
}

/// Length of the sequence a plan produces once BOS/EOS are stripped.
pub fn implied_output_len(plan: &[PlannedEdit]) -> usize {
    plan.iter()
        .map(PlannedEdit::output_len)
        .sum::<usize>()
        .saturating_sub(2)
}

/// Total number of slot tokens the generation model must fill.
pub fn slot_count(plan: &[PlannedEdit]) -> usize {
    plan.iter().map(|edit| edit.width).sum()
}

/// Fills a plan with generated slot tokens, consumed in position order.
///
/// Zero-width inserts collapse to keeps and zero-width substitutes to
/// deletes.
pub fn fill_plan(plan: &[PlannedEdit], tokens: &[TokenId]) -> Result<Vec<EditAction>, ActionError> {
    let expected = slot_count(plan);
    if tokens.len() != expected {
        return Err(ActionError::ShapeMismatch {
            context: "slot tokens",
            expected,
            actual: tokens.len(),
        });
    }

    let mut cursor = 0usize;
    let actions = plan
        .iter()
        .map(|edit| {
            let payload = tokens[cursor..cursor + edit.width].to_vec();
            cursor += edit.width;
            match (edit.tag, payload.is_empty()) {
                (EditTag::Keep, _) | (EditTag::Insert, true) => EditAction::Keep,
                (EditTag::Delete, _) | (EditTag::Substitute, true) => EditAction::Delete,
                (EditTag::Insert, false) => EditAction::Insert(payload),
                (EditTag::Substitute, false) => EditAction::Substitute(payload),
            }
        })
        .collect();
    Ok(actions)
}
