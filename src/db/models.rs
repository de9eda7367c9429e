/// Database row types for the four history/index tables in
/// `migrations/0001_history_tables.sql`.
use crate::types::{Bracket, MarketKey, SelectionKey};

// ---------------------------------------------------------------------------
// Markets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct MarketHistoryRow {
    pub source_id: String,
    pub source_market_id: String,
    pub source_market_name: String,
    pub open: bool,
    pub live: bool,
    pub selection_count: i64,
    pub event_id: Option<String>,
    pub year: Option<i64>,
    pub week: Option<i64>,
    pub is_new: bool,
    pub open_changed: bool,
    pub live_changed: bool,
    pub selection_count_changed: bool,
    pub name_changed: bool,
    pub timestamp: i64,
}

impl MarketHistoryRow {
    pub fn key(&self) -> MarketKey {
        MarketKey::new(&self.source_id, &self.source_market_id)
    }

    /// Primary key of `market_history`.
    pub fn history_key(&self) -> (String, String, i64) {
        (
            self.source_id.clone(),
            self.source_market_id.clone(),
            self.timestamp,
        )
    }

    pub fn to_index(&self, bracket: Bracket) -> MarketIndexRow {
        MarketIndexRow {
            source_id: self.source_id.clone(),
            source_market_id: self.source_market_id.clone(),
            bracket,
            source_market_name: self.source_market_name.clone(),
            open: self.open,
            live: self.live,
            selection_count: self.selection_count,
            event_id: self.event_id.clone(),
            year: self.year,
            week: self.week,
            timestamp: self.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketIndexRow {
    pub source_id: String,
    pub source_market_id: String,
    pub bracket: Bracket,
    pub source_market_name: String,
    pub open: bool,
    pub live: bool,
    pub selection_count: i64,
    pub event_id: Option<String>,
    pub year: Option<i64>,
    pub week: Option<i64>,
    pub timestamp: i64,
}

impl MarketIndexRow {
    /// Primary key of `market_index`.
    pub fn index_key(&self) -> (String, String, Bracket) {
        (
            self.source_id.clone(),
            self.source_market_id.clone(),
            self.bracket,
        )
    }
}

// ---------------------------------------------------------------------------
// Selections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct SelectionHistoryRow {
    pub source_id: String,
    pub source_market_id: String,
    pub source_selection_id: String,
    pub selection_name: String,
    pub selection_metric_line: Option<f64>,
    pub odds_decimal: f64,
    pub odds_american: i64,
    pub resolved_entity_id: Option<String>,
    pub selection_result: Option<String>,
    pub is_new: bool,
    pub selection_name_changed: bool,
    pub selection_line_changed: bool,
    pub odds_changed: bool,
    /// Signed american-odds delta (new - old). None for first sightings.
    pub odds_change_amount: Option<i64>,
    pub timestamp: i64,
}

impl SelectionHistoryRow {
    pub fn key(&self) -> SelectionKey {
        SelectionKey {
            source_id: self.source_id.clone(),
            source_market_id: self.source_market_id.clone(),
            source_selection_id: self.source_selection_id.clone(),
        }
    }

    /// Primary key of `selection_history`.
    pub fn history_key(&self) -> (SelectionKey, i64) {
        (self.key(), self.timestamp)
    }

    pub fn to_index(&self, bracket: Bracket) -> SelectionIndexRow {
        SelectionIndexRow {
            source_id: self.source_id.clone(),
            source_market_id: self.source_market_id.clone(),
            source_selection_id: self.source_selection_id.clone(),
            bracket,
            selection_name: self.selection_name.clone(),
            selection_metric_line: self.selection_metric_line,
            odds_decimal: self.odds_decimal,
            odds_american: self.odds_american,
            resolved_entity_id: self.resolved_entity_id.clone(),
            selection_result: self.selection_result.clone(),
            timestamp: self.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectionIndexRow {
    pub source_id: String,
    pub source_market_id: String,
    pub source_selection_id: String,
    pub bracket: Bracket,
    pub selection_name: String,
    pub selection_metric_line: Option<f64>,
    pub odds_decimal: f64,
    pub odds_american: i64,
    pub resolved_entity_id: Option<String>,
    pub selection_result: Option<String>,
    pub timestamp: i64,
}

impl SelectionIndexRow {
    /// Primary key of `selection_index`.
    pub fn index_key(&self) -> (SelectionKey, Bracket) {
        (
            SelectionKey {
                source_id: self.source_id.clone(),
                source_market_id: self.source_market_id.clone(),
                source_selection_id: self.source_selection_id.clone(),
            },
            self.bracket,
        )
    }
}
