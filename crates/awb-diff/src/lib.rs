//! Line-level diff engine for workflow artifact views.
//!
//! Pure functions over two content strings: classify every line as
//! added/deleted/unchanged, number lines against the resulting document,
//! and group changes into context-bounded blocks for display. Total over
//! all string inputs; there is no error path.

use awb_core::{ChangeKind, DiffBlock, DiffSummary, LineChange};
use similar::{Algorithm, ChangeTag, TextDiff};

/// Computes a line-granularity Myers diff between two documents.
///
/// A modified line is represented as a Deleted change immediately followed
/// by an Added change; no word-level similarity matching is attempted.
/// Output order matches a linear top-to-bottom reading of the merged
/// document. Line numbers count positions in the new document: every change
/// receives the running counter, and the counter advances only for
/// non-Deleted changes, so deletions carry the slot they would have
/// occupied without consuming it.
pub fn compute_diff(old_text: &str, new_text: &str) -> Vec<LineChange> {
    let old_text = ensure_trailing_newline(old_text);
    let new_text = ensure_trailing_newline(new_text);

    let diff = TextDiff::configure()
        .algorithm(Algorithm::Myers)
        .diff_lines(&old_text, &new_text);

    let mut changes = Vec::new();
    let mut line_number = 1usize;

    for change in diff.iter_all_changes() {
        let text = change
            .value()
            .strip_suffix('\n')
            .unwrap_or(change.value())
            .to_string();

        let kind = match change.tag() {
            ChangeTag::Equal => ChangeKind::Unchanged,
            ChangeTag::Delete => ChangeKind::Deleted,
            ChangeTag::Insert => ChangeKind::Added,
        };

        changes.push(LineChange {
            kind,
            text,
            line_number,
        });

        if kind != ChangeKind::Deleted {
            line_number += 1;
        }
    }

    changes
}

/// Groups a change list into display blocks, keeping `context_lines` of
/// unchanged context around every change.
///
/// An empty input yields no blocks. A change-free input yields a single
/// spanning block with `has_changes = false`. Otherwise a line is kept if
/// it is a change or lies within `context_lines` of one, and a new block
/// opens whenever the gap between consecutive kept lines exceeds
/// `2 * context_lines + 1` (the unkept run is wider than double-sided
/// context would cover). With `context_lines = 0` only changed lines
/// survive, and adjacent changes still merge into one block.
pub fn group_into_blocks(changes: &[LineChange], context_lines: usize) -> Vec<DiffBlock> {
    if changes.is_empty() {
        return Vec::new();
    }

    let changed: Vec<usize> = changes
        .iter()
        .enumerate()
        .filter(|(_, change)| change.kind.is_change())
        .map(|(index, _)| index)
        .collect();

    if changed.is_empty() {
        return vec![block_from(changes, 0, changes.len() - 1)];
    }

    let mut kept = vec![false; changes.len()];
    for &index in &changed {
        let lo = index.saturating_sub(context_lines);
        let hi = (index + context_lines).min(changes.len() - 1);
        for slot in kept.iter_mut().take(hi + 1).skip(lo) {
            *slot = true;
        }
    }

    let gap_limit = 2 * context_lines + 1;
    let mut blocks = Vec::new();
    let mut block_start: Option<usize> = None;
    let mut prev_kept = 0usize;

    for index in (0..changes.len()).filter(|&index| kept[index]) {
        match block_start {
            None => block_start = Some(index),
            Some(start) => {
                if index - prev_kept > gap_limit {
                    blocks.push(block_from(changes, start, prev_kept));
                    block_start = Some(index);
                }
            }
        }
        prev_kept = index;
    }

    if let Some(start) = block_start {
        blocks.push(block_from(changes, start, prev_kept));
    }

    blocks
}

/// Counts changes by kind across the full change list.
pub fn summarize(changes: &[LineChange]) -> DiffSummary {
    let mut summary = DiffSummary::default();
    for change in changes {
        match change.kind {
            ChangeKind::Added => summary.additions += 1,
            ChangeKind::Deleted => summary.deletions += 1,
            ChangeKind::Unchanged => summary.unchanged += 1,
        }
    }
    summary
}

/// Byte-for-byte equality, including whitespace and line endings.
///
/// Stricter than the diff itself (which normalizes a terminal newline);
/// used to short-circuit the "no changes" state before diffing.
pub fn contents_equal(old_text: &str, new_text: &str) -> bool {
    old_text == new_text
}

fn block_from(changes: &[LineChange], start: usize, end: usize) -> DiffBlock {
    let slice = &changes[start..=end];
    DiffBlock {
        start_line: slice[0].line_number,
        end_line: slice[slice.len() - 1].line_number,
        has_changes: slice.iter().any(|change| change.kind.is_change()),
        changes: slice.to_vec(),
    }
}

fn ensure_trailing_newline(content: &str) -> String {
    if content.is_empty() || content.ends_with('\n') {
        content.to_string()
    } else {
        format!("{content}\n")
    }
}
