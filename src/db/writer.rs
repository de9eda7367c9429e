use sqlx::{QueryBuilder, Sqlite};

use crate::db::models::{MarketHistoryRow, MarketIndexRow, SelectionHistoryRow, SelectionIndexRow};
use crate::error::Result;
use crate::types::{Bracket, MarketKey};

/// Bulk upserts into the history and index tables, plus the reads and deletes
/// needed by the ingestion batch (prefetch and selection cleanup).
///
/// Callers dedupe rows by primary key before calling an upsert: SQLite rejects
/// a statement that touches the same conflict target twice.
#[derive(Clone)]
pub struct HistoryWriter {
    pool: sqlx::SqlitePool,
}

impl HistoryWriter {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    #[cfg(test)]
    pub fn pool(&self) -> &sqlx::SqlitePool {
        &self.pool
    }

    // -----------------------------------------------------------------------
    // History tables: identical-value overwrite on conflict
    // -----------------------------------------------------------------------

    pub async fn upsert_market_history(&self, rows: &[MarketHistoryRow]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO market_history (
                source_id, source_market_id, source_market_name, open, live,
                selection_count, event_id, year, week,
                is_new, open_changed, live_changed, selection_count_changed, name_changed,
                timestamp
            ) ",
        );
        qb.push_values(rows, |mut b, r| {
            b.push_bind(r.source_id.as_str())
                .push_bind(r.source_market_id.as_str())
                .push_bind(r.source_market_name.as_str())
                .push_bind(r.open)
                .push_bind(r.live)
                .push_bind(r.selection_count)
                .push_bind(r.event_id.as_deref())
                .push_bind(r.year)
                .push_bind(r.week)
                .push_bind(r.is_new)
                .push_bind(r.open_changed)
                .push_bind(r.live_changed)
                .push_bind(r.selection_count_changed)
                .push_bind(r.name_changed)
                .push_bind(r.timestamp);
        });
        qb.push(
            " ON CONFLICT(source_id, source_market_id, timestamp) DO UPDATE SET
                source_market_name = excluded.source_market_name,
                open = excluded.open,
                live = excluded.live,
                selection_count = excluded.selection_count,
                event_id = excluded.event_id,
                year = excluded.year,
                week = excluded.week,
                is_new = excluded.is_new,
                open_changed = excluded.open_changed,
                live_changed = excluded.live_changed,
                selection_count_changed = excluded.selection_count_changed,
                name_changed = excluded.name_changed",
        );
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn upsert_selection_history(&self, rows: &[SelectionHistoryRow]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO selection_history (
                source_id, source_market_id, source_selection_id, selection_name,
                selection_metric_line, odds_decimal, odds_american,
                resolved_entity_id, selection_result,
                is_new, selection_name_changed, selection_line_changed, odds_changed,
                odds_change_amount, timestamp
            ) ",
        );
        qb.push_values(rows, |mut b, r| {
            b.push_bind(r.source_id.as_str())
                .push_bind(r.source_market_id.as_str())
                .push_bind(r.source_selection_id.as_str())
                .push_bind(r.selection_name.as_str())
                .push_bind(r.selection_metric_line)
                .push_bind(r.odds_decimal)
                .push_bind(r.odds_american)
                .push_bind(r.resolved_entity_id.as_deref())
                .push_bind(r.selection_result.as_deref())
                .push_bind(r.is_new)
                .push_bind(r.selection_name_changed)
                .push_bind(r.selection_line_changed)
                .push_bind(r.odds_changed)
                .push_bind(r.odds_change_amount)
                .push_bind(r.timestamp);
        });
        qb.push(
            " ON CONFLICT(source_id, source_market_id, source_selection_id, timestamp) DO UPDATE SET
                selection_name = excluded.selection_name,
                selection_metric_line = excluded.selection_metric_line,
                odds_decimal = excluded.odds_decimal,
                odds_american = excluded.odds_american,
                resolved_entity_id = excluded.resolved_entity_id,
                selection_result = excluded.selection_result,
                is_new = excluded.is_new,
                selection_name_changed = excluded.selection_name_changed,
                selection_line_changed = excluded.selection_line_changed,
                odds_changed = excluded.odds_changed,
                odds_change_amount = excluded.odds_change_amount",
        );
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    // -----------------------------------------------------------------------
    // Index tables
    //
    // OPEN keeps its first-seen timestamp and state forever; only game linkage
    // corrections are applied on conflict. CLOSE is overwritten, but never
    // with an older observation.
    // -----------------------------------------------------------------------

    pub async fn upsert_market_index(&self, rows: &[MarketIndexRow]) -> Result<u64> {
        let (open, close): (Vec<&MarketIndexRow>, Vec<&MarketIndexRow>) =
            rows.iter().partition(|r| r.bracket == Bracket::Open);

        let mut affected = 0;
        if !open.is_empty() {
            affected += self
                .insert_market_index(
                    &open,
                    " ON CONFLICT(source_id, source_market_id, bracket) DO UPDATE SET
                        event_id = excluded.event_id,
                        year = excluded.year,
                        week = excluded.week",
                )
                .await?;
        }
        if !close.is_empty() {
            affected += self
                .insert_market_index(
                    &close,
                    " ON CONFLICT(source_id, source_market_id, bracket) DO UPDATE SET
                        source_market_name = excluded.source_market_name,
                        open = excluded.open,
                        live = excluded.live,
                        selection_count = excluded.selection_count,
                        event_id = excluded.event_id,
                        year = excluded.year,
                        week = excluded.week,
                        timestamp = excluded.timestamp
                    WHERE excluded.timestamp >= market_index.timestamp",
                )
                .await?;
        }
        Ok(affected)
    }

    async fn insert_market_index(
        &self,
        rows: &[&MarketIndexRow],
        on_conflict: &str,
    ) -> Result<u64> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO market_index (
                source_id, source_market_id, bracket, source_market_name, open, live,
                selection_count, event_id, year, week, timestamp
            ) ",
        );
        qb.push_values(rows, |mut b, r| {
            b.push_bind(r.source_id.as_str())
                .push_bind(r.source_market_id.as_str())
                .push_bind(r.bracket.as_str())
                .push_bind(r.source_market_name.as_str())
                .push_bind(r.open)
                .push_bind(r.live)
                .push_bind(r.selection_count)
                .push_bind(r.event_id.as_deref())
                .push_bind(r.year)
                .push_bind(r.week)
                .push_bind(r.timestamp);
        });
        qb.push(on_conflict);
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn upsert_selection_index(&self, rows: &[SelectionIndexRow]) -> Result<u64> {
        let (open, close): (Vec<&SelectionIndexRow>, Vec<&SelectionIndexRow>) =
            rows.iter().partition(|r| r.bracket == Bracket::Open);

        let mut affected = 0;
        if !open.is_empty() {
            affected += self
                .insert_selection_index(
                    &open,
                    " ON CONFLICT(source_id, source_market_id, source_selection_id, bracket) DO NOTHING",
                )
                .await?;
        }
        if !close.is_empty() {
            affected += self
                .insert_selection_index(
                    &close,
                    " ON CONFLICT(source_id, source_market_id, source_selection_id, bracket) DO UPDATE SET
                        selection_name = excluded.selection_name,
                        selection_metric_line = excluded.selection_metric_line,
                        odds_decimal = excluded.odds_decimal,
                        odds_american = excluded.odds_american,
                        resolved_entity_id = excluded.resolved_entity_id,
                        selection_result = excluded.selection_result,
                        timestamp = excluded.timestamp
                    WHERE excluded.timestamp >= selection_index.timestamp",
                )
                .await?;
        }
        Ok(affected)
    }

    async fn insert_selection_index(
        &self,
        rows: &[&SelectionIndexRow],
        on_conflict: &str,
    ) -> Result<u64> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO selection_index (
                source_id, source_market_id, source_selection_id, bracket, selection_name,
                selection_metric_line, odds_decimal, odds_american,
                resolved_entity_id, selection_result, timestamp
            ) ",
        );
        qb.push_values(rows, |mut b, r| {
            b.push_bind(r.source_id.as_str())
                .push_bind(r.source_market_id.as_str())
                .push_bind(r.source_selection_id.as_str())
                .push_bind(r.bracket.as_str())
                .push_bind(r.selection_name.as_str())
                .push_bind(r.selection_metric_line)
                .push_bind(r.odds_decimal)
                .push_bind(r.odds_american)
                .push_bind(r.resolved_entity_id.as_deref())
                .push_bind(r.selection_result.as_deref())
                .push_bind(r.timestamp);
        });
        qb.push(on_conflict);
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    // -----------------------------------------------------------------------
    // Prefetch reads
    // -----------------------------------------------------------------------

    /// Market history rows for `source_ids` observed at or after `since`.
    pub async fn market_history_since(
        &self,
        source_ids: &[String],
        since: i64,
    ) -> Result<Vec<MarketHistoryRow>> {
        if source_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT source_id, source_market_id, source_market_name, open, live,
                    selection_count, event_id, year, week,
                    is_new, open_changed, live_changed, selection_count_changed, name_changed,
                    timestamp
             FROM market_history
             WHERE timestamp >= ",
        );
        qb.push_bind(since);
        push_source_filter(&mut qb, source_ids);
        let rows = qb
            .build_query_as::<MarketHistoryRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Selection history rows for `source_ids` observed at or after `since`.
    pub async fn selection_history_since(
        &self,
        source_ids: &[String],
        since: i64,
    ) -> Result<Vec<SelectionHistoryRow>> {
        if source_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT source_id, source_market_id, source_selection_id, selection_name,
                    selection_metric_line, odds_decimal, odds_american,
                    resolved_entity_id, selection_result,
                    is_new, selection_name_changed, selection_line_changed, odds_changed,
                    odds_change_amount, timestamp
             FROM selection_history
             WHERE timestamp >= ",
        );
        qb.push_bind(since);
        push_source_filter(&mut qb, source_ids);
        let rows = qb
            .build_query_as::<SelectionHistoryRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Selection cleanup
    // -----------------------------------------------------------------------

    /// Selection ids that currently hold a CLOSE row under `market`.
    pub async fn close_selection_ids(&self, market: &MarketKey) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT source_selection_id
            FROM selection_index
            WHERE source_id = ? AND source_market_id = ? AND bracket = ?
            "#,
        )
        .bind(market.source_id.as_str())
        .bind(market.source_market_id.as_str())
        .bind(Bracket::Close.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Deletes the CLOSE rows of `selection_ids` under `market` that are older
    /// than `before`. A CLOSE row written by a newer snapshot is never removed.
    pub async fn delete_close_selections(
        &self,
        market: &MarketKey,
        selection_ids: &[String],
        before: i64,
    ) -> Result<u64> {
        if selection_ids.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM selection_index WHERE source_id = ");
        qb.push_bind(market.source_id.as_str());
        qb.push(" AND source_market_id = ");
        qb.push_bind(market.source_market_id.as_str());
        qb.push(" AND bracket = ");
        qb.push_bind(Bracket::Close.as_str());
        qb.push(" AND timestamp < ");
        qb.push_bind(before);
        qb.push(" AND source_selection_id IN (");
        let mut ids = qb.separated(", ");
        for id in selection_ids {
            ids.push_bind(id.as_str());
        }
        ids.push_unseparated(")");
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

fn push_source_filter<'a>(qb: &mut QueryBuilder<'a, Sqlite>, source_ids: &'a [String]) {
    qb.push(" AND source_id IN (");
    let mut ids = qb.separated(", ");
    for id in source_ids {
        ids.push_bind(id.as_str());
    }
    ids.push_unseparated(")");
}
