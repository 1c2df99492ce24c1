//! Reference-count bookkeeping applied when a write transaction commits.
//!
//! A chunk's count is the number of heads and chunks referencing it. New head
//! targets gain a reference, replaced head targets lose one, and a change
//! between zero and one propagates to the chunk's own refs. Chunks put during
//! the transaction always get an entry so unreferenced ones are dropped.

use rustc_hash::FxHashMap;

use crate::types::{Hash, PenumbraError, Result};

/// Head movement recorded by a write transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeadChange {
    /// Target before the transaction.
    pub old: Option<Hash>,
    /// Target after the transaction.
    pub new: Option<Hash>,
}

/// Source of the current counts and refs.
pub(crate) trait RefCountSource {
    /// Current count, or `None` when the chunk is not tracked by this store.
    fn ref_count(&self, hash: &Hash) -> Result<Option<usize>>;

    /// Refs of a tracked chunk.
    fn refs(&self, hash: &Hash) -> Result<Vec<Hash>>;
}

/// Computes the new count of every tracked chunk touched by the commit.
/// A resulting count of zero means the chunk must be deleted (or never written).
pub(crate) fn compute_ref_count_updates<'a>(
    head_changes: impl IntoIterator<Item = &'a HeadChange>,
    put_chunks: impl IntoIterator<Item = &'a Hash>,
    source: &dyn RefCountSource,
) -> Result<FxHashMap<Hash, usize>> {
    let mut counts: FxHashMap<Hash, usize> = FxHashMap::default();

    let mut increments = Vec::new();
    let mut decrements = Vec::new();
    for change in head_changes {
        if change.old == change.new {
            continue;
        }
        if let Some(new) = change.new {
            increments.push(new);
        }
        if let Some(old) = change.old {
            decrements.push(old);
        }
    }
    // Increments first so a subtree shared by the old and new head never
    // touches zero along the way.
    apply(&mut counts, increments, true, source)?;
    apply(&mut counts, decrements, false, source)?;

    for hash in put_chunks {
        if !counts.contains_key(hash) {
            if let Some(count) = source.ref_count(hash)? {
                counts.insert(*hash, count);
            }
        }
    }
    Ok(counts)
}

fn apply(
    counts: &mut FxHashMap<Hash, usize>,
    roots: Vec<Hash>,
    increment: bool,
    source: &dyn RefCountSource,
) -> Result<()> {
    let mut stack = roots;
    while let Some(hash) = stack.pop() {
        if hash.is_empty() {
            continue;
        }
        let current = match counts.get(&hash) {
            Some(count) => *count,
            None => match source.ref_count(&hash)? {
                Some(count) => count,
                None => continue,
            },
        };
        let next = if increment {
            current + 1
        } else {
            current
                .checked_sub(1)
                .ok_or(PenumbraError::Corruption("negative chunk ref count"))?
        };
        counts.insert(hash, next);
        let crossed_zero = (increment && current == 0) || (!increment && next == 0);
        if crossed_zero {
            stack.extend(source.refs(&hash)?);
        }
    }
    Ok(())
}
