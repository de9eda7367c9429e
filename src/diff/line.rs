use crate::types::RawLine;

/// Canonical persisted metric line for a selection.
///
/// Hit-rate checks downstream use a strict `actual > line` comparison. A
/// discrete "N+" market ("3+ receptions") means `actual >= N`, so its whole
/// number line is shifted to `N - 0.5`. Half-point lines, negative spreads
/// and labels without an `N+` token pass through unchanged.
pub fn normalize_metric_line(raw: Option<&RawLine>, label: Option<&str>) -> Option<f64> {
    let value = parse_line(raw?)?;

    if value < 0.0 {
        return Some(value);
    }
    let Some(label) = label else {
        return Some(value);
    };
    if value.fract() != 0.0 {
        return Some(value);
    }

    if plus_threshold(label) == Some(value) {
        return Some(value - 0.5);
    }
    if label
        .split_whitespace()
        .filter_map(plus_threshold)
        .any(|n| n == value)
    {
        return Some(value - 0.5);
    }

    Some(value)
}

fn parse_line(raw: &RawLine) -> Option<f64> {
    let value = match raw {
        RawLine::Number(n) => *n,
        RawLine::Text(s) => s.trim().parse::<f64>().ok()?,
    };
    value.is_finite().then_some(value)
}

/// `"3+"` → 3. Anything else, including `"+3"`, `"3.5+"` or `"3+ TDs"`, → None.
fn plus_threshold(token: &str) -> Option<f64> {
    let digits = token.strip_suffix('+')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u64>().ok().map(|n| n as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(raw: Option<RawLine>, label: Option<&str>) -> Option<f64> {
        normalize_metric_line(raw.as_ref(), label)
    }

    fn num(v: f64) -> Option<RawLine> {
        Some(RawLine::Number(v))
    }

    fn text(s: &str) -> Option<RawLine> {
        Some(RawLine::Text(s.to_string()))
    }

    #[test]
    fn discrete_count_label_shifts_line() {
        assert_eq!(norm(num(3.0), Some("3+")), Some(2.5));
    }

    #[test]
    fn half_point_lines_are_already_canonical() {
        assert_eq!(norm(num(199.5), Some("200+ Passing Yards")), Some(199.5));
        assert_eq!(norm(num(24.5), Some("Aaron Jones Over")), Some(24.5));
    }

    #[test]
    fn negative_spreads_pass_through() {
        assert_eq!(norm(num(-7.5), Some("ATL -7.5")), Some(-7.5));
        assert_eq!(norm(num(-3.0), Some("3+")), Some(-3.0));
    }

    #[test]
    fn absent_or_non_numeric_lines_are_none() {
        assert_eq!(norm(None, Some("3+")), None);
        assert_eq!(norm(text("abc"), Some("3+")), None);
        assert_eq!(norm(text(""), None), None);
        assert_eq!(norm(Some(RawLine::Number(f64::NAN)), None), None);
    }

    #[test]
    fn string_lines_are_parsed() {
        assert_eq!(norm(text("3"), Some("3+")), Some(2.5));
        assert_eq!(norm(text(" 24.5 "), Some("Over")), Some(24.5));
    }

    #[test]
    fn missing_label_leaves_value() {
        assert_eq!(norm(num(3.0), None), Some(3.0));
    }

    #[test]
    fn embedded_token_must_match_value() {
        assert_eq!(norm(num(2.0), Some("Patrick Mahomes 2+ TDs")), Some(1.5));
        assert_eq!(norm(num(2.0), Some("Player 2+")), Some(1.5));
        assert_eq!(norm(num(3.0), Some("Player 2+ TDs")), Some(3.0));
    }

    #[test]
    fn token_must_be_whitespace_bounded() {
        assert_eq!(norm(num(3.0), Some("Over3+")), Some(3.0));
        assert_eq!(norm(num(3.0), Some("3+TDs")), Some(3.0));
        assert_eq!(norm(num(3.0), Some("3")), Some(3.0));
    }
}
