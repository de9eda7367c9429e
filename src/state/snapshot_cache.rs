use std::sync::Arc;

use dashmap::DashMap;

use crate::db::models::{MarketHistoryRow, SelectionHistoryRow};
use crate::db::HistoryWriter;
use crate::error::Result;
use crate::types::{MarketKey, SelectionKey};

// ---------------------------------------------------------------------------
// SnapshotCache
// ---------------------------------------------------------------------------

/// Batch-scoped read cache of recent history rows.
///
/// Filled once by [`SnapshotCache::prefetch`] at the start of an ingestion
/// batch, read (never written) while the batch is diffed, and emptied with
/// [`SnapshotCache::clear`] when the batch ends. Each key's rows are sorted
/// newest first. Not authoritative: a missing key only means "nothing within
/// the prefetch window".
pub struct SnapshotCache {
    /// (source_id, source_market_id) → history rows, newest first
    markets: DashMap<MarketKey, Vec<MarketHistoryRow>>,
    /// (source_id, source_market_id, source_selection_id) → history rows, newest first
    selections: DashMap<SelectionKey, Vec<SelectionHistoryRow>>,
}

impl SnapshotCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bulk-load market and selection history for `source_ids` observed at or
    /// after `since` (unix seconds). Returns `(market_rows, selection_rows)` loaded.
    pub async fn prefetch(
        &self,
        writer: &HistoryWriter,
        source_ids: &[String],
        since: i64,
    ) -> Result<(usize, usize)> {
        let markets = writer.market_history_since(source_ids, since).await?;
        let selections = writer.selection_history_since(source_ids, since).await?;
        let loaded = (markets.len(), selections.len());
        self.load_markets(markets);
        self.load_selections(selections);
        Ok(loaded)
    }

    pub fn load_markets(&self, rows: Vec<MarketHistoryRow>) {
        for row in rows {
            self.markets.entry(row.key()).or_default().push(row);
        }
        for mut entry in self.markets.iter_mut() {
            entry.value_mut().sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        }
    }

    pub fn load_selections(&self, rows: Vec<SelectionHistoryRow>) {
        for row in rows {
            self.selections.entry(row.key()).or_default().push(row);
        }
        for mut entry in self.selections.iter_mut() {
            entry.value_mut().sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        }
    }

    /// Most recent cached row for a market.
    pub fn latest_market(&self, key: &MarketKey) -> Option<MarketHistoryRow> {
        self.markets.get(key)?.first().cloned()
    }

    /// Most recent cached row for a market with `timestamp <= at`.
    /// Incoming snapshots can be older than what is already cached.
    pub fn market_before(&self, key: &MarketKey, at: i64) -> Option<MarketHistoryRow> {
        self.markets
            .get(key)?
            .iter()
            .find(|row| row.timestamp <= at)
            .cloned()
    }

    pub fn latest_selection(&self, key: &SelectionKey) -> Option<SelectionHistoryRow> {
        self.selections.get(key)?.first().cloned()
    }

    pub fn selection_before(&self, key: &SelectionKey, at: i64) -> Option<SelectionHistoryRow> {
        self.selections
            .get(key)?
            .iter()
            .find(|row| row.timestamp <= at)
            .cloned()
    }

    pub fn market_count(&self) -> usize {
        self.markets.len()
    }

    pub fn selection_count(&self) -> usize {
        self.selections.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.markets.is_empty() && self.selections.is_empty()
    }

    /// Drop both maps. Called once at the end of every batch.
    pub fn clear(&self) {
        self.markets.clear();
        self.selections.clear();
    }
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self {
            markets: DashMap::new(),
            selections: DashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
