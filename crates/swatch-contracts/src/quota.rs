use indexmap::IndexMap;

use crate::error::InvalidInput;
use crate::sources::SourceId;

/// Per-source share of one run's requested image count.
///
/// Entries keep the caller's source order. For any plan produced by
/// [`allocate`] the shares sum to exactly the requested count; a source
/// whose share is 0 is never queried.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QuotaPlan {
    shares: IndexMap<SourceId, usize>,
}

impl QuotaPlan {
    pub fn share(&self, source: SourceId) -> usize {
        self.shares.get(&source).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SourceId, usize)> + '_ {
        self.shares.iter().map(|(source, count)| (*source, *count))
    }

    pub fn total(&self) -> usize {
        self.shares.values().sum()
    }

    pub fn len(&self) -> usize {
        self.shares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shares.is_empty()
    }
}

/// Split `requested_count` images across `sources` in order.
///
/// The first `requested_count % len` sources get one image on top of the
/// even `requested_count / len` base, so the plan sums to the requested
/// count exactly and is deterministic for a given source order. The
/// per-source request floor (Pixabay's 3) is a wire-level concern handled
/// by the adapter at fetch time and never changes these shares.
pub fn allocate(requested_count: usize, sources: &[SourceId]) -> Result<QuotaPlan, InvalidInput> {
    if sources.is_empty() {
        return Err(InvalidInput::NoSources);
    }
    if requested_count < 1 {
        return Err(InvalidInput::CountBelowOne);
    }

    let base = requested_count / sources.len();
    let remainder = requested_count % sources.len();
    let mut shares: IndexMap<SourceId, usize> = IndexMap::with_capacity(sources.len());
    for (position, source) in sources.iter().enumerate() {
        let share = if position < remainder { base + 1 } else { base };
        *shares.entry(*source).or_insert(0) += share;
    }
    Ok(QuotaPlan { shares })
}
