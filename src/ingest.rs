use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{
    Config, DEFAULT_CACHE_WINDOW_DAYS, DEFAULT_MARKET_BATCH_SIZE, DEFAULT_SELECTION_BATCH_SIZE,
    SECS_PER_DAY,
};
use crate::db::models::{MarketHistoryRow, MarketIndexRow, SelectionHistoryRow, SelectionIndexRow};
use crate::db::HistoryWriter;
use crate::diff::{diff_market, CleanupDirective, MarketDiff};
use crate::error::Result;
use crate::state::SnapshotCache;
use crate::types::{Bracket, MarketKey, MarketSnapshot};

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub market_batch_size: usize,
    pub selection_batch_size: usize,
    /// How far back (seconds) the snapshot cache prefetches.
    pub cache_window_secs: i64,
}

impl IngestSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            market_batch_size: cfg.market_batch_size,
            selection_batch_size: cfg.selection_batch_size,
            cache_window_secs: cfg.cache_window_secs(),
        }
    }
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            market_batch_size: DEFAULT_MARKET_BATCH_SIZE,
            selection_batch_size: DEFAULT_SELECTION_BATCH_SIZE,
            cache_window_secs: DEFAULT_CACHE_WINDOW_DAYS * SECS_PER_DAY,
        }
    }
}

/// Per-batch counters. Row counts are rows submitted to the upserts after
/// deduplication.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub markets_received: usize,
    pub markets_failed: usize,
    pub selections_failed: usize,
    pub market_history_rows: usize,
    pub market_index_rows: usize,
    pub selection_history_rows: usize,
    pub selection_index_rows: usize,
    pub cleanup_directives: usize,
    pub cleanup_rows_deleted: u64,
    pub cleanup_failures: usize,
}

/// Rows accumulated from the market diffs of one sub-batch.
#[derive(Debug, Default)]
struct BatchRows {
    market_history: Vec<MarketHistoryRow>,
    market_index: Vec<MarketIndexRow>,
    selection_history: Vec<SelectionHistoryRow>,
    selection_index: Vec<SelectionIndexRow>,
    cleanups: Vec<CleanupDirective>,
}

impl BatchRows {
    fn absorb(&mut self, diff: MarketDiff) {
        self.market_history.extend(diff.history);
        self.market_index.extend(diff.index);
        for selection in diff.selections {
            self.selection_history.extend(selection.history);
            self.selection_index.extend(selection.index);
        }
        self.cleanups.extend(diff.cleanup);
    }
}

// ---------------------------------------------------------------------------
// Ingestor
// ---------------------------------------------------------------------------

/// Turns batches of market snapshots into deduplicated history and OPEN/CLOSE
/// index rows.
///
/// Owns the snapshot cache. Batches are serialized: a second `ingest` call
/// waits until the running batch has finished and cleared the cache.
pub struct Ingestor {
    writer: HistoryWriter,
    cache: Arc<SnapshotCache>,
    settings: IngestSettings,
    batch_lock: Mutex<()>,
}

impl Ingestor {
    pub fn new(pool: sqlx::SqlitePool, settings: IngestSettings) -> Self {
        Self {
            writer: HistoryWriter::new(pool),
            cache: SnapshotCache::new(),
            settings,
            batch_lock: Mutex::new(()),
        }
    }

    /// Ingest one batch. Invalid markets and selections are logged and
    /// skipped; a failed upsert aborts the batch and is returned. The cache is
    /// cleared either way.
    pub async fn ingest(&self, markets: Vec<MarketSnapshot>) -> Result<IngestStats> {
        let _batch = self.batch_lock.lock().await;

        let result = self.run_batch(&markets).await;
        self.cache.clear();

        match &result {
            Ok(stats) => info!(
                markets = stats.markets_received,
                markets_failed = stats.markets_failed,
                selections_failed = stats.selections_failed,
                market_history = stats.market_history_rows,
                selection_history = stats.selection_history_rows,
                cleanup_deleted = stats.cleanup_rows_deleted,
                "Ingested batch: {} markets, {} market + {} selection history rows",
                stats.markets_received,
                stats.market_history_rows,
                stats.selection_history_rows,
            ),
            Err(e) => error!(markets = markets.len(), "Batch ingestion failed: {e}"),
        }
        result
    }

    async fn run_batch(&self, markets: &[MarketSnapshot]) -> Result<IngestStats> {
        let mut stats = IngestStats {
            markets_received: markets.len(),
            ..Default::default()
        };
        if markets.is_empty() {
            return Ok(stats);
        }

        let source_ids = distinct_source_ids(markets);
        let since = now_secs().saturating_sub(self.settings.cache_window_secs);
        let (cached_markets, cached_selections) =
            self.cache.prefetch(&self.writer, &source_ids, since).await?;
        debug!(
            sources = source_ids.len(),
            cached_markets,
            cached_selections,
            market_keys = self.cache.market_count(),
            selection_keys = self.cache.selection_count(),
            "Snapshot cache prefetched",
        );

        for chunk in markets.chunks(self.settings.market_batch_size.max(1)) {
            let rows = self.diff_chunk(chunk, &mut stats).await;
            self.persist(rows, &mut stats).await?;
        }

        Ok(stats)
    }

    /// Markets are diffed one after another; selections inside each market fan out.
    async fn diff_chunk(&self, chunk: &[MarketSnapshot], stats: &mut IngestStats) -> BatchRows {
        let mut rows = BatchRows::default();
        for snapshot in chunk {
            match diff_market(&self.cache, snapshot).await {
                Ok(diff) => {
                    stats.selections_failed += diff.selection_failures;
                    debug!(
                        market = %diff.market,
                        is_new = diff.is_new,
                        history = diff.history.is_some(),
                        index_rows = diff.index.len(),
                        selections = diff.selections.len(),
                        "Market diffed",
                    );
                    rows.absorb(diff);
                }
                Err(e) => {
                    stats.markets_failed += 1;
                    warn!("Skipping market: {e}");
                }
            }
        }
        rows
    }

    async fn persist(&self, rows: BatchRows, stats: &mut IngestStats) -> Result<()> {
        let market_history = dedupe_last(rows.market_history, |r| r.history_key());
        let market_index = dedupe_last(
            order_brackets(rows.market_index, |r| (r.bracket, r.timestamp)),
            |r| r.index_key(),
        );
        let selection_history = dedupe_last(rows.selection_history, |r| r.history_key());
        let selection_index = dedupe_last(
            order_brackets(rows.selection_index, |r| (r.bracket, r.timestamp)),
            |r| r.index_key(),
        );

        self.writer.upsert_market_history(&market_history).await?;
        self.writer.upsert_market_index(&market_index).await?;
        let selection_batch_size = self.settings.selection_batch_size.max(1);
        for chunk in selection_history.chunks(selection_batch_size) {
            self.writer.upsert_selection_history(chunk).await?;
        }
        for chunk in selection_index.chunks(selection_batch_size) {
            self.writer.upsert_selection_index(chunk).await?;
        }

        stats.market_history_rows += market_history.len();
        stats.market_index_rows += market_index.len();
        stats.selection_history_rows += selection_history.len();
        stats.selection_index_rows += selection_index.len();

        self.run_cleanups(rows.cleanups, stats).await;
        Ok(())
    }

    /// Each market's cleanup is isolated: a failed read or delete is logged and
    /// the remaining directives still run.
    async fn run_cleanups(&self, cleanups: Vec<CleanupDirective>, stats: &mut IngestStats) {
        let mut newest: BTreeMap<MarketKey, CleanupDirective> = BTreeMap::new();
        for directive in cleanups {
            match newest.get(&directive.market) {
                Some(existing) if existing.timestamp > directive.timestamp => {}
                _ => {
                    newest.insert(directive.market.clone(), directive);
                }
            }
        }

        for directive in newest.into_values() {
            stats.cleanup_directives += 1;
            match self.cleanup_market(&directive).await {
                Ok(0) => {}
                Ok(deleted) => {
                    stats.cleanup_rows_deleted += deleted;
                    debug!(
                        market = %directive.market,
                        deleted,
                        "Removed stale selection CLOSE rows",
                    );
                }
                Err(e) => {
                    stats.cleanup_failures += 1;
                    error!(market = %directive.market, "Selection cleanup failed: {e}");
                }
            }
        }
    }

    async fn cleanup_market(&self, directive: &CleanupDirective) -> Result<u64> {
        let current: HashSet<String> = self
            .writer
            .close_selection_ids(&directive.market)
            .await?
            .into_iter()
            .collect();
        let mut stale: Vec<String> = current.difference(&directive.present).cloned().collect();
        stale.sort();
        self.writer
            .delete_close_selections(&directive.market, &stale, directive.timestamp)
            .await
    }
}

/// Keep the last row seen for each key. An upsert statement may not touch the
/// same conflict target twice, so this runs before every write.
fn dedupe_last<T, K: Ord>(rows: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    let mut by_key = BTreeMap::new();
    for row in rows {
        by_key.insert(key(&row), row);
    }
    by_key.into_values().collect()
}

/// Stable reorder so that last-wins dedupe keeps the earliest OPEN and the
/// newest CLOSE per key. Rows with equal timestamps keep arrival order.
fn order_brackets<T>(mut rows: Vec<T>, bracket_ts: impl Fn(&T) -> (Bracket, i64)) -> Vec<T> {
    rows.sort_by_key(|row| match bracket_ts(row) {
        (Bracket::Open, ts) => ts.saturating_neg(),
        (Bracket::Close, ts) => ts,
    });
    rows
}

fn distinct_source_ids(markets: &[MarketSnapshot]) -> Vec<String> {
    markets
        .iter()
        .filter_map(|m| m.source_id.as_deref())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::types::{RawLine, SelectionSnapshot};

    const T0: i64 = 1_700_000_000;

    fn settings() -> IngestSettings {
        IngestSettings {
            cache_window_secs: i64::MAX,
            ..Default::default()
        }
    }

    async fn ingestor() -> Ingestor {
        Ingestor::new(test_pool().await, settings())
    }

    fn selection(id: &str, odds_american: i64) -> SelectionSnapshot {
        SelectionSnapshot {
            source_selection_id: Some(id.to_string()),
            selection_name: format!("{id} Over"),
            selection_metric_line: Some(RawLine::Number(24.5)),
            odds_decimal: Some(1.91),
            odds_american: Some(odds_american),
            ..Default::default()
        }
    }

    fn market(
        market_id: &str,
        ts: i64,
        live: bool,
        selections: Vec<SelectionSnapshot>,
    ) -> MarketSnapshot {
        MarketSnapshot {
            source_id: Some("book".to_string()),
            source_market_id: Some(market_id.to_string()),
            source_market_name: format!("Market {market_id}"),
            open: true,
            live,
            selection_count: selections.len() as i64,
            event_id: Some("evt-1".to_string()),
            year: Some(2024),
            week: Some(5),
            timestamp: Some(ts),
            selections,
        }
    }

    async fn count(ingestor: &Ingestor, sql: &str) -> i64 {
        sqlx::query_scalar(sql)
            .fetch_one(ingestor.writer.pool())
            .await
            .unwrap()
    }

    async fn market_bracket_ts(
        ingestor: &Ingestor,
        market_id: &str,
        bracket: Bracket,
    ) -> Option<i64> {
        sqlx::query_scalar(
            "SELECT timestamp FROM market_index WHERE source_market_id = ? AND bracket = ?",
        )
        .bind(market_id)
        .bind(bracket.as_str())
        .fetch_optional(ingestor.writer.pool())
        .await
        .unwrap()
    }

    async fn close_selection_ids(ingestor: &Ingestor, market_id: &str) -> Vec<String> {
        let mut ids = ingestor
            .writer
            .close_selection_ids(&MarketKey::new("book", market_id))
            .await
            .unwrap();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn replaying_a_batch_is_idempotent() {
        let ingestor = ingestor().await;
        let batch = vec![market("m1", T0, false, vec![selection("a", -110), selection("b", 120)])];

        let first = ingestor.ingest(batch.clone()).await.unwrap();
        assert_eq!(first.market_history_rows, 1);
        assert_eq!(first.selection_history_rows, 2);

        let second = ingestor.ingest(batch).await.unwrap();
        assert_eq!(second.market_history_rows, 0);
        assert_eq!(second.selection_history_rows, 0);

        assert_eq!(count(&ingestor, "SELECT COUNT(*) FROM market_history").await, 1);
        assert_eq!(count(&ingestor, "SELECT COUNT(*) FROM selection_history").await, 2);
        assert_eq!(count(&ingestor, "SELECT COUNT(*) FROM market_index").await, 2);
        assert_eq!(count(&ingestor, "SELECT COUNT(*) FROM selection_index").await, 4);
    }

    #[tokio::test]
    async fn close_tracks_newest_snapshot_in_any_order() {
        let ingestor = ingestor().await;
        let t1 = T0;
        let t2 = T0 + 60;

        ingestor.ingest(vec![market("m1", t2, false, vec![selection("a", -110)])]).await.unwrap();
        ingestor.ingest(vec![market("m1", t1, false, vec![selection("a", -110)])]).await.unwrap();
        assert_eq!(market_bracket_ts(&ingestor, "m1", Bracket::Close).await, Some(t2));

        // Both in one batch, newest first.
        ingestor
            .ingest(vec![
                market("m2", t2, false, vec![selection("a", -110)]),
                market("m2", t1, false, vec![selection("a", -110)]),
            ])
            .await
            .unwrap();
        assert_eq!(market_bracket_ts(&ingestor, "m2", Bracket::Close).await, Some(t2));
        assert_eq!(market_bracket_ts(&ingestor, "m2", Bracket::Open).await, Some(t1));
        let selection_close: i64 = sqlx::query_scalar(
            "SELECT timestamp FROM selection_index
             WHERE source_market_id = 'm2' AND bracket = 'CLOSE'",
        )
        .fetch_one(ingestor.writer.pool())
        .await
        .unwrap();
        assert_eq!(selection_close, t2);
    }

    #[tokio::test]
    async fn open_is_never_moved_by_later_batches() {
        let ingestor = ingestor().await;
        ingestor
            .ingest(vec![market("m1", T0 + 100, false, vec![selection("a", -110)])])
            .await
            .unwrap();
        ingestor.ingest(vec![market("m1", T0, false, vec![selection("a", -115)])]).await.unwrap();
        ingestor
            .ingest(vec![market("m1", T0 + 200, false, vec![selection("a", -120)])])
            .await
            .unwrap();

        assert_eq!(market_bracket_ts(&ingestor, "m1", Bracket::Open).await, Some(T0 + 100));
        let selection_open: i64 = sqlx::query_scalar(
            "SELECT timestamp FROM selection_index WHERE bracket = 'OPEN'",
        )
        .fetch_one(ingestor.writer.pool())
        .await
        .unwrap();
        assert_eq!(selection_open, T0 + 100);
        // The backdated -115 is kept as a correction.
        assert_eq!(count(&ingestor, "SELECT COUNT(*) FROM selection_history").await, 3);
    }

    #[tokio::test]
    async fn odds_move_is_recorded_with_delta() {
        let ingestor = ingestor().await;
        ingestor.ingest(vec![market("m1", T0, false, vec![selection("a", -110)])]).await.unwrap();
        ingestor
            .ingest(vec![market("m1", T0 + 60, false, vec![selection("a", -120)])])
            .await
            .unwrap();

        let (amount, name_changed, odds_changed): (Option<i64>, bool, bool) = sqlx::query_as(
            "SELECT odds_change_amount, selection_name_changed, odds_changed
             FROM selection_history WHERE timestamp = ?",
        )
        .bind(T0 + 60)
        .fetch_one(ingestor.writer.pool())
        .await
        .unwrap();
        assert_eq!(amount, Some(-10));
        assert!(!name_changed);
        assert!(odds_changed);
        // The market itself did not change.
        assert_eq!(count(&ingestor, "SELECT COUNT(*) FROM market_history").await, 1);
    }

    #[tokio::test]
    async fn extreme_odds_fail_the_selection_not_the_batch() {
        let ingestor = ingestor().await;
        ingestor
            .ingest(vec![market(
                "m1",
                T0,
                false,
                vec![selection("a", i64::MIN), selection("b", 100)],
            )])
            .await
            .unwrap();

        let stats = ingestor
            .ingest(vec![market(
                "m1",
                T0 + 60,
                false,
                vec![selection("a", i64::MAX), selection("b", 120)],
            )])
            .await
            .unwrap();
        assert_eq!(stats.selections_failed, 1);
        assert_eq!(stats.selection_history_rows, 1);
        assert!(ingestor.cache.is_empty());
    }

    #[tokio::test]
    async fn vanished_selection_loses_its_close_row() {
        let ingestor = ingestor().await;
        ingestor
            .ingest(vec![market(
                "m1",
                T0,
                false,
                vec![selection("A", -110), selection("B", -110), selection("C", -110)],
            )])
            .await
            .unwrap();
        assert_eq!(close_selection_ids(&ingestor, "m1").await, vec!["A", "B", "C"]);

        let stats = ingestor
            .ingest(vec![market(
                "m1",
                T0 + 60,
                false,
                vec![selection("A", -110), selection("C", -110)],
            )])
            .await
            .unwrap();
        assert_eq!(stats.cleanup_rows_deleted, 1);
        assert_eq!(close_selection_ids(&ingestor, "m1").await, vec!["A", "C"]);
        // First-seen rows are untouched.
        assert_eq!(
            count(&ingestor, "SELECT COUNT(*) FROM selection_index WHERE bracket = 'OPEN'").await,
            3
        );

        let stats = ingestor.ingest(vec![market("m1", T0 + 120, false, vec![])]).await.unwrap();
        assert_eq!(stats.cleanup_directives, 0);
        assert_eq!(close_selection_ids(&ingestor, "m1").await, vec!["A", "C"]);
    }

    #[tokio::test]
    async fn older_snapshot_keeps_newer_close_rows() {
        let ingestor = ingestor().await;
        let both = || vec![selection("A", -110), selection("B", -110)];
        ingestor.ingest(vec![market("m1", T0, false, both())]).await.unwrap();
        ingestor.ingest(vec![market("m1", T0 + 300, false, both())]).await.unwrap();

        let stats = ingestor
            .ingest(vec![market("m1", T0 + 200, false, vec![selection("A", -110)])])
            .await
            .unwrap();
        assert_eq!(stats.cleanup_rows_deleted, 0);
        assert_eq!(close_selection_ids(&ingestor, "m1").await, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn older_snapshot_in_a_later_sub_batch_keeps_close_rows() {
        let ingestor = Ingestor::new(
            test_pool().await,
            IngestSettings {
                market_batch_size: 1,
                ..settings()
            },
        );
        let stats = ingestor
            .ingest(vec![
                market("m1", T0 + 300, false, vec![selection("A", -110), selection("B", -110)]),
                market("m1", T0 + 200, false, vec![selection("A", -110)]),
            ])
            .await
            .unwrap();
        assert_eq!(stats.cleanup_rows_deleted, 0);
        assert_eq!(close_selection_ids(&ingestor, "m1").await, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn live_market_is_never_cleaned() {
        let ingestor = ingestor().await;
        ingestor
            .ingest(vec![market("m1", T0, false, vec![selection("A", -110), selection("B", -110)])])
            .await
            .unwrap();
        let stats = ingestor
            .ingest(vec![market("m1", T0 + 60, true, vec![selection("A", -110)])])
            .await
            .unwrap();
        assert_eq!(stats.cleanup_directives, 0);
        assert_eq!(close_selection_ids(&ingestor, "m1").await, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn one_invalid_market_does_not_block_the_rest() {
        let ingestor = ingestor().await;
        let batch: Vec<MarketSnapshot> = (1..=10)
            .map(|i| {
                let mut m = market(&format!("m{i}"), T0, false, vec![selection("a", -110)]);
                if i == 5 {
                    m.source_market_id = None;
                }
                m
            })
            .collect();

        let stats = ingestor.ingest(batch).await.unwrap();
        assert_eq!(stats.markets_received, 10);
        assert_eq!(stats.markets_failed, 1);
        assert_eq!(count(&ingestor, "SELECT COUNT(*) FROM market_history").await, 9);
        assert_eq!(count(&ingestor, "SELECT COUNT(*) FROM market_index").await, 18);
        assert_eq!(count(&ingestor, "SELECT COUNT(*) FROM selection_history").await, 9);
    }

    #[tokio::test]
    async fn small_sub_batches_write_everything() {
        let pool = test_pool().await;
        let ingestor = Ingestor::new(
            pool,
            IngestSettings {
                market_batch_size: 3,
                selection_batch_size: 2,
                cache_window_secs: i64::MAX,
            },
        );
        let batch: Vec<MarketSnapshot> = (0..7)
            .map(|i| {
                market(
                    &format!("m{i}"),
                    T0,
                    false,
                    vec![selection("a", -110), selection("b", 100), selection("c", 150)],
                )
            })
            .collect();

        let stats = ingestor.ingest(batch).await.unwrap();
        assert_eq!(stats.market_history_rows, 7);
        assert_eq!(stats.selection_history_rows, 21);
        assert_eq!(count(&ingestor, "SELECT COUNT(*) FROM selection_index").await, 42);
    }

    #[tokio::test]
    async fn duplicate_snapshots_in_one_batch_collapse() {
        let ingestor = ingestor().await;
        let snap = market("m1", T0, false, vec![selection("a", -110)]);
        let stats = ingestor.ingest(vec![snap.clone(), snap]).await.unwrap();
        assert_eq!(stats.market_history_rows, 1);
        assert_eq!(stats.selection_history_rows, 1);
        assert_eq!(count(&ingestor, "SELECT COUNT(*) FROM market_history").await, 1);
    }

    #[tokio::test]
    async fn cache_is_empty_after_every_batch() {
        let ingestor = ingestor().await;
        ingestor.ingest(vec![market("m1", T0, false, vec![selection("a", -110)])]).await.unwrap();
        ingestor
            .ingest(vec![market("m1", T0 + 1, false, vec![selection("a", -110)])])
            .await
            .unwrap();
        assert!(ingestor.cache.is_empty());
    }

    #[test]
    fn dedupe_keeps_last_occurrence() {
        let rows = vec![("k1", 1), ("k2", 2), ("k1", 3)];
        let deduped = dedupe_last(rows, |r| r.0);
        assert_eq!(deduped, vec![("k1", 3), ("k2", 2)]);
    }

    #[test]
    fn bracket_ordering_prefers_earliest_open_and_newest_close() {
        let rows = vec![
            (Bracket::Close, 200, "close-new"),
            (Bracket::Close, 100, "close-old"),
            (Bracket::Open, 100, "open-early"),
            (Bracket::Open, 200, "open-late"),
        ];
        let deduped = dedupe_last(order_brackets(rows, |r| (r.0, r.1)), |r| r.0);
        let labels: Vec<&str> = deduped.iter().map(|r| r.2).collect();
        assert_eq!(labels, vec!["open-early", "close-new"]);
    }

    #[test]
    fn source_ids_are_distinct_and_skip_blanks() {
        let mut a = market("m1", T0, false, vec![]);
        let b = market("m2", T0, false, vec![]);
        let mut c = market("m3", T0, false, vec![]);
        c.source_id = Some(String::new());
        a.source_id = Some("alt".to_string());
        assert_eq!(distinct_source_ids(&[a, b, c]), vec!["alt".to_string(), "book".to_string()]);
    }
}
