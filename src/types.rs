use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Incoming snapshots (upstream poller payload)
// ---------------------------------------------------------------------------

/// One observation of a market, as delivered by the upstream poller.
///
/// Identifying fields are optional so that a single malformed market can be
/// rejected during diffing instead of failing deserialization of the whole batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub source_id: Option<String>,
    pub source_market_id: Option<String>,
    #[serde(default)]
    pub source_market_name: String,
    #[serde(default)]
    pub open: bool,
    #[serde(default)]
    pub live: bool,
    #[serde(default)]
    pub selection_count: i64,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub year: Option<i64>,
    #[serde(default)]
    pub week: Option<i64>,
    /// Unix seconds.
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub selections: Vec<SelectionSnapshot>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionSnapshot {
    pub source_selection_id: Option<String>,
    #[serde(default)]
    pub selection_name: String,
    #[serde(default)]
    pub selection_metric_line: Option<RawLine>,
    pub odds_decimal: Option<f64>,
    pub odds_american: Option<i64>,
    #[serde(default)]
    pub resolved_entity_id: Option<String>,
    #[serde(default)]
    pub selection_result: Option<String>,
    /// Unix seconds. Falls back to the parent market's timestamp when absent.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// A metric line as sent upstream: sportsbooks disagree on whether it is a
/// JSON number or a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawLine {
    Number(f64),
    Text(String),
}

// ---------------------------------------------------------------------------
// Entity keys
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MarketKey {
    pub source_id: String,
    pub source_market_id: String,
}

impl MarketKey {
    pub fn new(source_id: impl Into<String>, source_market_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            source_market_id: source_market_id.into(),
        }
    }

    pub fn selection(&self, source_selection_id: impl Into<String>) -> SelectionKey {
        SelectionKey {
            source_id: self.source_id.clone(),
            source_market_id: self.source_market_id.clone(),
            source_selection_id: source_selection_id.into(),
        }
    }
}

impl std::fmt::Display for MarketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.source_id, self.source_market_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SelectionKey {
    pub source_id: String,
    pub source_market_id: String,
    pub source_selection_id: String,
}

impl std::fmt::Display for SelectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.source_id, self.source_market_id, self.source_selection_id
        )
    }
}

// ---------------------------------------------------------------------------
// Index brackets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Bracket {
    /// First observation. Written once.
    Open,
    /// Most recent non-live observation.
    Close,
}

impl Bracket {
    pub fn as_str(self) -> &'static str {
        match self {
            Bracket::Open => "OPEN",
            Bracket::Close => "CLOSE",
        }
    }
}

impl std::fmt::Display for Bracket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_payload_tolerates_missing_ids_and_string_lines() {
        let json = r#"[{
            "source_market_name": "Receptions",
            "open": true,
            "live": false,
            "selection_count": 1,
            "timestamp": 1700000000,
            "selections": [{
                "source_selection_id": "s1",
                "selection_name": "3+",
                "selection_metric_line": "3",
                "odds_decimal": 1.91,
                "odds_american": -110
            }]
        }]"#;
        let markets: Vec<MarketSnapshot> = serde_json::from_str(json).unwrap();
        assert_eq!(markets.len(), 1);
        assert!(markets[0].source_id.is_none());
        assert_eq!(
            markets[0].selections[0].selection_metric_line,
            Some(RawLine::Text("3".to_string()))
        );
    }

    #[test]
    fn numeric_and_null_lines_deserialize() {
        let sel: SelectionSnapshot =
            serde_json::from_str(r#"{"selection_metric_line": 24.5}"#).unwrap();
        assert_eq!(sel.selection_metric_line, Some(RawLine::Number(24.5)));

        let sel: SelectionSnapshot =
            serde_json::from_str(r#"{"selection_metric_line": null}"#).unwrap();
        assert!(sel.selection_metric_line.is_none());
    }

    #[test]
    fn bracket_labels() {
        assert_eq!(Bracket::Open.to_string(), "OPEN");
        assert_eq!(Bracket::Close.as_str(), "CLOSE");
    }
}
