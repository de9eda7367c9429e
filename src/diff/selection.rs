use futures_util::future::join_all;

use crate::db::models::{MarketHistoryRow, SelectionHistoryRow, SelectionIndexRow};
use crate::diff::line::normalize_metric_line;
use crate::diff::DiffError;
use crate::state::SnapshotCache;
use crate::types::{Bracket, MarketKey, SelectionKey, SelectionSnapshot};

/// Parent-market state a selection is diffed against.
#[derive(Debug, Clone, Copy)]
pub struct MarketContext<'a> {
    pub market: &'a MarketKey,
    pub live: bool,
    /// Market row the market-level diff used as its baseline. None when the
    /// market itself is being seen for the first time.
    pub baseline: Option<&'a MarketHistoryRow>,
    /// Market observation time; selections without their own timestamp inherit it.
    pub timestamp: i64,
}

/// Which tracked selection fields differ from the baseline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectionChanges {
    pub name: bool,
    pub line: bool,
    pub odds: bool,
    /// American odds, new minus old. Set only when odds changed.
    pub odds_change_amount: Option<i64>,
}

impl SelectionChanges {
    /// Compares exactly name, normalized line and odds. Timestamps, resolved
    /// identity and result never trigger a write on their own.
    ///
    /// Fails when the American odds delta does not fit in an `i64`.
    pub fn between(
        prev: &SelectionHistoryRow,
        next: &SelectionHistoryRow,
    ) -> Result<Self, DiffError> {
        let odds =
            prev.odds_american != next.odds_american || prev.odds_decimal != next.odds_decimal;
        let odds_change_amount = if odds {
            let delta = next.odds_american.checked_sub(prev.odds_american).ok_or_else(|| {
                DiffError::MalformedCache {
                    entity: "selection",
                    id: prev.key().to_string(),
                    reason: format!(
                        "odds delta {} -> {} overflows",
                        prev.odds_american, next.odds_american
                    ),
                }
            })?;
            Some(delta)
        } else {
            None
        };
        Ok(Self {
            name: prev.selection_name != next.selection_name,
            line: prev.selection_metric_line != next.selection_metric_line,
            odds,
            odds_change_amount,
        })
    }

    pub fn any(&self) -> bool {
        self.name || self.line || self.odds
    }
}

#[derive(Debug, Clone)]
pub struct SelectionDiff {
    pub key: SelectionKey,
    pub is_new: bool,
    pub changes: SelectionChanges,
    pub history: Option<SelectionHistoryRow>,
    pub index: Vec<SelectionIndexRow>,
}

/// Diff every selection of one market. Each selection settles on its own: a
/// failure is returned in place and never affects its siblings.
pub async fn diff_selections(
    cache: &SnapshotCache,
    ctx: MarketContext<'_>,
    selections: &[SelectionSnapshot],
) -> Vec<Result<SelectionDiff, DiffError>> {
    join_all(
        selections
            .iter()
            .map(|selection| async move { diff_selection(cache, ctx, selection) }),
    )
    .await
}

pub fn diff_selection(
    cache: &SnapshotCache,
    ctx: MarketContext<'_>,
    snapshot: &SelectionSnapshot,
) -> Result<SelectionDiff, DiffError> {
    let mut incoming = validate(ctx, snapshot)?;
    let key = incoming.key();

    let known = ctx.baseline.is_some() && cache.latest_selection(&key).is_some();
    if !known {
        incoming.is_new = true;
        let mut index = vec![incoming.to_index(Bracket::Open)];
        if !ctx.live {
            index.push(incoming.to_index(Bracket::Close));
        }
        return Ok(SelectionDiff {
            key,
            is_new: true,
            changes: SelectionChanges::default(),
            history: Some(incoming),
            index,
        });
    }

    let (changes, history) = match cache.selection_before(&key, incoming.timestamp) {
        // Older than anything cached: record it as a correction.
        None => (SelectionChanges::default(), Some(incoming.clone())),
        Some(prev) => {
            check_cached(&prev)?;
            let changes = SelectionChanges::between(&prev, &incoming)?;
            if changes.any() {
                let mut row = incoming.clone();
                row.selection_name_changed = changes.name;
                row.selection_line_changed = changes.line;
                row.odds_changed = changes.odds;
                row.odds_change_amount = changes.odds_change_amount;
                (changes, Some(row))
            } else {
                (changes, None)
            }
        }
    };

    // CLOSE follows the latest known state, changed or not.
    let index = if ctx.live {
        Vec::new()
    } else {
        vec![incoming.to_index(Bracket::Close)]
    };

    Ok(SelectionDiff {
        key,
        is_new: false,
        changes,
        history,
        index,
    })
}

fn validate(
    ctx: MarketContext<'_>,
    snapshot: &SelectionSnapshot,
) -> Result<SelectionHistoryRow, DiffError> {
    let missing = |field: &'static str| DiffError::MissingField {
        entity: "selection",
        id: format!(
            "{}/{}",
            ctx.market,
            snapshot.source_selection_id.as_deref().unwrap_or("?")
        ),
        field,
    };

    if ctx.market.source_market_id.is_empty() {
        return Err(missing("source_market_id"));
    }
    let selection_id = snapshot
        .source_selection_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| missing("source_selection_id"))?;
    let odds_decimal = snapshot.odds_decimal.ok_or_else(|| missing("odds_decimal"))?;
    let odds_american = snapshot.odds_american.ok_or_else(|| missing("odds_american"))?;
    let timestamp = snapshot.timestamp.unwrap_or(ctx.timestamp);

    Ok(SelectionHistoryRow {
        source_id: ctx.market.source_id.clone(),
        source_market_id: ctx.market.source_market_id.clone(),
        source_selection_id: selection_id.to_string(),
        selection_name: snapshot.selection_name.clone(),
        selection_metric_line: normalize_metric_line(
            snapshot.selection_metric_line.as_ref(),
            Some(snapshot.selection_name.as_str()),
        ),
        odds_decimal,
        odds_american,
        resolved_entity_id: snapshot.resolved_entity_id.clone(),
        selection_result: snapshot.selection_result.clone(),
        is_new: false,
        selection_name_changed: false,
        selection_line_changed: false,
        odds_changed: false,
        odds_change_amount: None,
        timestamp,
    })
}

fn check_cached(row: &SelectionHistoryRow) -> Result<(), DiffError> {
    if !row.odds_decimal.is_finite() {
        return Err(DiffError::MalformedCache {
            entity: "selection",
            id: row.key().to_string(),
            reason: format!("odds_decimal is {}", row.odds_decimal),
        });
    }
    Ok(())
}
