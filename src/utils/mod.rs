//! American-odds arithmetic shared by the edge calculator and the backtest.

/// Convert American odds to the implied win probability, vig included.
pub fn american_to_implied(odds: i32) -> f64 {
    let odds = f64::from(odds);
    if odds < 0.0 {
        -odds / (-odds + 100.0)
    } else {
        100.0 / (odds + 100.0)
    }
}

/// Convert a probability back to American odds, rounded to the nearest
/// whole number. `None` outside the open interval (0, 1).
pub fn implied_to_american(probability: f64) -> Option<i32> {
    if !(probability > 0.0 && probability < 1.0) {
        return None;
    }
    let odds = if probability >= 0.5 {
        -(probability / (1.0 - probability)) * 100.0
    } else {
        (1.0 - probability) / probability * 100.0
    };
    Some(odds.round() as i32)
}

/// Net profit on a one-unit stake that wins.
pub fn payout_per_unit(odds: i32) -> f64 {
    if odds < 0 {
        100.0 / f64::from(-odds)
    } else {
        f64::from(odds) / 100.0
    }
}

/// Full-Kelly fraction of bankroll for a bet at `odds`. Zero when the bet
/// has no positive expectation.
pub fn kelly_criterion(win_probability: f64, odds: i32) -> f64 {
    let b = payout_per_unit(odds);
    if b <= 0.0 {
        return 0.0;
    }
    let p = win_probability;
    let q = 1.0 - p;
    ((b * p - q) / b).max(0.0)
}

/// Arithmetic mean, `None` for an empty input.
pub fn mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}
