use std::collections::HashSet;

use tracing::warn;

use crate::db::models::{MarketHistoryRow, MarketIndexRow};
use crate::diff::selection::{diff_selections, MarketContext, SelectionDiff};
use crate::diff::DiffError;
use crate::state::SnapshotCache;
use crate::types::{Bracket, MarketKey, MarketSnapshot};

/// Which tracked market fields differ from the baseline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarketChanges {
    pub open: bool,
    pub live: bool,
    pub selection_count: bool,
    pub name: bool,
}

impl MarketChanges {
    /// Compares exactly open, live, selection_count and name.
    pub fn between(prev: &MarketHistoryRow, next: &MarketHistoryRow) -> Self {
        Self {
            open: prev.open != next.open,
            live: prev.live != next.live,
            selection_count: prev.selection_count != next.selection_count,
            name: prev.source_market_name != next.source_market_name,
        }
    }

    pub fn any(&self) -> bool {
        self.open || self.live || self.selection_count || self.name
    }
}

/// Scheduling metadata corrections (event id, year) propagate to both brackets
/// even when nothing else changed.
fn linkage_changed(prev: &MarketHistoryRow, next: &MarketHistoryRow) -> bool {
    prev.event_id != next.event_id || prev.year != next.year
}

/// Selection ids a non-live market currently offers. Index CLOSE rows for
/// any other selection of the market are stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupDirective {
    pub market: MarketKey,
    pub present: HashSet<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct MarketDiff {
    pub market: MarketKey,
    pub is_new: bool,
    pub changes: MarketChanges,
    pub history: Option<MarketHistoryRow>,
    pub index: Vec<MarketIndexRow>,
    pub selections: Vec<SelectionDiff>,
    pub selection_failures: usize,
    pub cleanup: Option<CleanupDirective>,
}

pub async fn diff_market(
    cache: &SnapshotCache,
    snapshot: &MarketSnapshot,
) -> Result<MarketDiff, DiffError> {
    let mut incoming = validate(snapshot)?;
    let key = incoming.key();
    let timestamp = incoming.timestamp;
    let live = incoming.live;

    let mut changes = MarketChanges::default();
    let mut history = None;
    let mut index = Vec::new();

    let latest = cache.latest_market(&key);
    let baseline = match &latest {
        None => {
            incoming.is_new = true;
            index.push(incoming.to_index(Bracket::Open));
            if !live {
                index.push(incoming.to_index(Bracket::Close));
            }
            history = Some(incoming.clone());
            None
        }
        Some(latest) => {
            let previous = cache.market_before(&key, timestamp);
            match &previous {
                // Older than everything cached: keep it as a correction.
                None => history = Some(incoming.clone()),
                Some(prev) => {
                    changes = MarketChanges::between(prev, &incoming);
                    if changes.any() {
                        let mut row = incoming.clone();
                        row.open_changed = changes.open;
                        row.live_changed = changes.live;
                        row.selection_count_changed = changes.selection_count;
                        row.name_changed = changes.name;
                        history = Some(row);
                    }
                }
            }

            let reference = previous.clone().unwrap_or_else(|| latest.clone());
            let relinked = linkage_changed(&reference, &incoming);
            if relinked {
                index.push(incoming.to_index(Bracket::Open));
            }
            if !live && (relinked || timestamp > latest.timestamp) {
                index.push(incoming.to_index(Bracket::Close));
            }
            Some(reference)
        }
    };

    let ctx = MarketContext {
        market: &key,
        live,
        baseline: baseline.as_ref(),
        timestamp,
    };
    let mut selections = Vec::with_capacity(snapshot.selections.len());
    let mut selection_failures = 0;
    for result in diff_selections(cache, ctx, &snapshot.selections).await {
        match result {
            Ok(diff) => selections.push(diff),
            Err(e) => {
                selection_failures += 1;
                warn!(market = %key, "Skipping selection: {e}");
            }
        }
    }

    // An empty list may be a transient upstream hiccup, never authoritative.
    // A backdated snapshot cannot speak for the current selection set either;
    // the delete itself also spares CLOSE rows newer than this snapshot.
    let is_current = latest.as_ref().map_or(true, |l| timestamp >= l.timestamp);
    let cleanup = (!live && !snapshot.selections.is_empty() && is_current).then(|| {
        CleanupDirective {
            market: key.clone(),
            present: snapshot
                .selections
                .iter()
                .filter_map(|s| s.source_selection_id.clone())
                .filter(|id| !id.is_empty())
                .collect(),
            timestamp,
        }
    });

    Ok(MarketDiff {
        market: key,
        is_new: latest.is_none(),
        changes,
        history,
        index,
        selections,
        selection_failures,
        cleanup,
    })
}

fn validate(snapshot: &MarketSnapshot) -> Result<MarketHistoryRow, DiffError> {
    let missing = |field: &'static str| DiffError::MissingField {
        entity: "market",
        id: format!(
            "{}/{}",
            snapshot.source_id.as_deref().unwrap_or("?"),
            snapshot.source_market_id.as_deref().unwrap_or("?")
        ),
        field,
    };

    let source_id = snapshot
        .source_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| missing("source_id"))?;
    let source_market_id = snapshot
        .source_market_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| missing("source_market_id"))?;
    let timestamp = snapshot.timestamp.ok_or_else(|| missing("timestamp"))?;

    Ok(MarketHistoryRow {
        source_id: source_id.to_string(),
        source_market_id: source_market_id.to_string(),
        source_market_name: snapshot.source_market_name.clone(),
        open: snapshot.open,
        live: snapshot.live,
        selection_count: snapshot.selection_count,
        event_id: snapshot.event_id.clone(),
        year: snapshot.year,
        week: snapshot.week,
        is_new: false,
        open_changed: false,
        live_changed: false,
        selection_count_changed: false,
        name_changed: false,
        timestamp,
    })
}
