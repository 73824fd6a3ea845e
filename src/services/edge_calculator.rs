use anyhow::Result;
use sqlx::SqlitePool;
use statrs::distribution::{ContinuousCDF, Normal};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::config::{EdgeBands, EdgeThresholds};
use crate::db;
use crate::error::ConfigResult;
use crate::models::{
    ConsensusOdds, Edge, EdgeReport, EdgeStrength, GamePrediction, OddsSnapshot, Pick, Recommendation,
};
use crate::services::PredictionEngine;
use crate::utils::{american_to_implied, implied_to_american, kelly_criterion, mean};

/// Compares model lines against the betting market.
#[derive(Debug, Clone)]
pub struct EdgeCalculator {
    thresholds: EdgeThresholds,
}

impl EdgeCalculator {
    pub fn new(thresholds: EdgeThresholds) -> ConfigResult<Self> {
        thresholds.validate()?;
        Ok(Self { thresholds })
    }

    /// Market consensus from each bookmaker's most recent snapshot.
    ///
    /// Spreads and totals are plain means of the lines on offer. Moneylines
    /// are averaged as implied probabilities and converted back, so a -300
    /// and a +250 do not cancel into nonsense.
    pub fn consensus(snapshots: &[OddsSnapshot]) -> Option<ConsensusOdds> {
        let mut latest: BTreeMap<&str, &OddsSnapshot> = BTreeMap::new();
        for snapshot in snapshots {
            let newer = latest
                .get(snapshot.bookmaker.as_str())
                .map_or(true, |current| compare_snapshots(snapshot, current) == Ordering::Greater);
            if newer {
                latest.insert(snapshot.bookmaker.as_str(), snapshot);
            }
        }

        let as_of = latest.values().map(|s| s.fetched_at).max()?;
        let books: Vec<&OddsSnapshot> = latest.into_values().collect();

        let moneyline = |side: fn(&OddsSnapshot) -> Option<i32>| {
            mean(books.iter().filter_map(|s| side(s)).map(american_to_implied)).and_then(implied_to_american)
        };

        Some(ConsensusOdds {
            home_spread: mean(books.iter().filter_map(|s| s.home_spread)),
            total: mean(books.iter().filter_map(|s| s.total)),
            home_moneyline: moneyline(|s| s.home_moneyline),
            away_moneyline: moneyline(|s| s.away_moneyline),
            bookmakers: books.len(),
            as_of,
        })
    }

    /// Model minus market for spread and total.
    pub fn edge(prediction: &GamePrediction, market_spread: Option<f64>, market_total: Option<f64>) -> Edge {
        Edge {
            spread: market_spread.map(|line| prediction.predicted_spread - line),
            total: market_total.map(|line| prediction.predicted_total - line),
        }
    }

    pub fn strength(magnitude: f64, bands: &EdgeBands) -> EdgeStrength {
        let magnitude = magnitude.abs();
        if magnitude >= bands.strong {
            EdgeStrength::Strong
        } else if magnitude >= bands.moderate {
            EdgeStrength::Moderate
        } else {
            EdgeStrength::Weak
        }
    }

    /// Pick the market whose edge clears its minimum by the widest margin,
    /// provided the model has enough conviction on the winner.
    pub fn recommend(
        &self,
        edge: &Edge,
        home_win_probability: f64,
        consensus: &ConsensusOdds,
    ) -> Option<Recommendation> {
        let t = &self.thresholds;
        let conviction = home_win_probability.max(1.0 - home_win_probability);
        if conviction < t.min_win_probability {
            return None;
        }

        let spread = edge.spread.zip(consensus.home_spread).map(|(e, line)| {
            let pick = if e < 0.0 { Pick::Home } else { Pick::Away };
            (pick, line, e, t.min_spread_edge, &t.spread_bands, t.spread_std_dev)
        });
        let total = edge.total.zip(consensus.total).map(|(e, line)| {
            let pick = if e > 0.0 { Pick::Over } else { Pick::Under };
            (pick, line, e, t.min_total_edge, &t.total_bands, t.total_std_dev)
        });

        let mut best: Option<(f64, Recommendation)> = None;
        for (pick, line, e, minimum, bands, std_dev) in spread.into_iter().chain(total) {
            let magnitude = e.abs();
            if magnitude == 0.0 || magnitude < minimum {
                continue;
            }
            let ratio = magnitude / minimum.max(f64::EPSILON);
            if best.as_ref().is_some_and(|(best_ratio, _)| *best_ratio >= ratio) {
                continue;
            }

            let cover_probability = Normal::new(0.0, std_dev).ok()?.cdf(magnitude);
            best = Some((
                ratio,
                Recommendation {
                    pick,
                    line,
                    edge: e,
                    strength: Self::strength(magnitude, bands),
                    cover_probability,
                    stake_fraction: kelly_criterion(cover_probability, t.vig) * t.kelly_fraction,
                },
            ));
        }

        best.map(|(_, recommendation)| recommendation)
    }

    /// Consensus, edge and recommendation for one prediction. The returned
    /// prediction carries the market lines and edges it was priced against.
    pub fn analyze(&self, prediction: &GamePrediction, snapshots: &[OddsSnapshot]) -> EdgeReport {
        let Some(consensus) = Self::consensus(snapshots) else {
            return EdgeReport {
                prediction: prediction.clone(),
                consensus: None,
                edge: Edge::default(),
                recommendation: None,
            };
        };

        let edge = Self::edge(prediction, consensus.home_spread, consensus.total);
        let recommendation = self.recommend(&edge, prediction.home_win_probability, &consensus);

        let prediction = GamePrediction {
            market_spread: consensus.home_spread,
            market_total: consensus.total,
            edge_spread: edge.spread,
            edge_total: edge.total,
            ..prediction.clone()
        };

        EdgeReport {
            prediction,
            consensus: Some(consensus),
            edge,
            recommendation,
        }
    }

    /// Price one stored game, reusing its latest prediction when there is one.
    pub async fn analyze_game(
        &self,
        pool: &SqlitePool,
        engine: &PredictionEngine,
        game_id: &str,
    ) -> Result<Option<EdgeReport>> {
        let Some(game) = db::get_game(pool, game_id).await? else {
            return Ok(None);
        };

        let prediction = match db::get_latest_prediction(pool, game_id).await? {
            Some(prediction) => prediction,
            None => engine.predict_game(pool, &game).await?,
        };
        let snapshots = db::get_odds_snapshots(pool, game_id).await?;
        Ok(Some(self.analyze(&prediction, &snapshots)))
    }

    /// Price every upcoming game of the engine's sport and store the annotated
    /// predictions. Recommended plays come first, largest stake first.
    pub async fn analyze_upcoming(
        &self,
        pool: &SqlitePool,
        engine: &PredictionEngine,
        limit: i64,
    ) -> Result<Vec<EdgeReport>> {
        let games = db::get_upcoming_games(pool, Some(engine.sport()), limit).await?;
        let mut reports = Vec::with_capacity(games.len());

        for game in &games {
            let Some(report) = self.analyze_game(pool, engine, &game.id).await? else {
                continue;
            };
            if report.consensus.is_none() {
                tracing::debug!("No odds for game {}, skipping edge", game.id);
            }
            db::insert_prediction(pool, &report.prediction).await?;
            reports.push(report);
        }

        reports.sort_by(|a, b| {
            let stake = |r: &EdgeReport| r.recommendation.as_ref().map(|rec| rec.stake_fraction);
            stake(b).partial_cmp(&stake(a)).unwrap_or(Ordering::Equal)
        });

        tracing::info!(
            "Priced {} {} games, {} with a recommended play",
            reports.len(),
            engine.sport(),
            reports.iter().filter(|r| r.recommendation.is_some()).count()
        );
        Ok(reports)
    }
}

/// Orders snapshots from one bookmaker by time, falling back to the lines
/// themselves so the choice never depends on input order.
fn compare_snapshots(a: &OddsSnapshot, b: &OddsSnapshot) -> Ordering {
    fn line(a: Option<f64>, b: Option<f64>) -> Ordering {
        match (a, b) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (a, b) => a.is_some().cmp(&b.is_some()),
        }
    }

    a.fetched_at
        .cmp(&b.fetched_at)
        .then_with(|| line(a.home_spread, b.home_spread))
        .then_with(|| line(a.total, b.total))
        .then_with(|| a.home_moneyline.cmp(&b.home_moneyline))
        .then_with(|| a.away_moneyline.cmp(&b.away_moneyline))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::kickoff;
    use crate::models::Sport;
    use chrono::Utc;

    fn calculator() -> EdgeCalculator {
        EdgeCalculator::new(EdgeThresholds::for_sport(Sport::Nfl)).unwrap()
    }

    fn snapshot(bookmaker: &str, day: i64, spread: f64, total: f64) -> OddsSnapshot {
        OddsSnapshot {
            game_id: "g1".to_string(),
            bookmaker: bookmaker.to_string(),
            fetched_at: kickoff(day),
            home_spread: Some(spread),
            total: Some(total),
            home_moneyline: Some(-150),
            away_moneyline: Some(130),
        }
    }

    fn prediction(spread: f64, total: f64, home_win_probability: f64) -> GamePrediction {
        GamePrediction {
            id: "p1".to_string(),
            game_id: "g1".to_string(),
            home_team_id: "kc".to_string(),
            away_team_id: "buf".to_string(),
            predicted_home_score: (total - spread) / 2.0,
            predicted_away_score: (total + spread) / 2.0,
            predicted_spread: spread,
            predicted_total: total,
            home_win_probability,
            confidence: 0.4,
            market_spread: None,
            market_total: None,
            edge_spread: None,
            edge_total: None,
            model_version: "test".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_consensus_uses_latest_line_per_book() {
        let snapshots = vec![
            snapshot("draftkings", 0, -3.0, 44.0),
            snapshot("fanduel", 0, -2.5, 45.0),
            snapshot("draftkings", 1, -3.5, 44.0),
        ];
        let consensus = EdgeCalculator::consensus(&snapshots).unwrap();
        assert_eq!(consensus.bookmakers, 2);
        assert_eq!(consensus.home_spread, Some(-3.0));
        assert_eq!(consensus.total, Some(44.5));
        assert_eq!(consensus.home_moneyline, Some(-150));
        assert_eq!(consensus.as_of, kickoff(1));
    }

    #[test]
    fn test_consensus_ignores_input_order() {
        let a = snapshot("draftkings", 0, -3.0, 44.0);
        let b = snapshot("draftkings", 0, -3.5, 44.0);
        let forward = EdgeCalculator::consensus(&[a.clone(), b.clone()]).unwrap();
        let backward = EdgeCalculator::consensus(&[b, a]).unwrap();
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_no_snapshots_no_recommendation() {
        assert!(EdgeCalculator::consensus(&[]).is_none());

        let report = calculator().analyze(&prediction(-10.0, 50.0, 0.8), &[]);
        assert!(report.consensus.is_none());
        assert!(report.recommendation.is_none());
        assert_eq!(report.edge, Edge::default());
    }

    #[test]
    fn test_edge_is_model_minus_market() {
        let edge = EdgeCalculator::edge(&prediction(-7.0, 41.0, 0.7), Some(-3.0), None);
        assert_eq!(edge.spread, Some(-4.0));
        assert_eq!(edge.total, None);
    }

    #[test]
    fn test_strength_bands() {
        let bands = EdgeBands {
            moderate: 1.5,
            strong: 3.0,
        };
        assert_eq!(EdgeCalculator::strength(0.5, &bands), EdgeStrength::Weak);
        assert_eq!(EdgeCalculator::strength(-1.5, &bands), EdgeStrength::Moderate);
        assert_eq!(EdgeCalculator::strength(3.2, &bands), EdgeStrength::Strong);
    }

    #[test]
    fn test_recommends_home_on_negative_spread_edge() {
        let report = calculator().analyze(&prediction(-7.0, 45.0, 0.7), &[snapshot("draftkings", 0, -3.0, 44.0)]);
        let rec = report.recommendation.unwrap();

        assert_eq!(rec.pick, Pick::Home);
        assert_eq!(rec.line, -3.0);
        assert_eq!(rec.strength, EdgeStrength::Strong);
        assert!(rec.cover_probability > 0.6 && rec.cover_probability < 0.63, "{}", rec.cover_probability);
        assert!(rec.stake_fraction > 0.0 && rec.stake_fraction < 0.25);
        assert_eq!(report.prediction.edge_spread, Some(-4.0));
        assert_eq!(report.prediction.market_total, Some(44.0));
    }

    #[test]
    fn test_low_conviction_blocks_recommendation() {
        let report = calculator().analyze(&prediction(-7.0, 45.0, 0.52), &[snapshot("draftkings", 0, -3.0, 44.0)]);
        assert!(report.recommendation.is_none());
        assert!(report.consensus.is_some());
    }

    #[test]
    fn test_prefers_edge_that_clears_threshold_most() {
        // Spread edge 2 clears 1.5 by 1.33x, total edge 6 clears 2 by 3x.
        let report = calculator().analyze(&prediction(-5.0, 50.0, 0.7), &[snapshot("draftkings", 0, -3.0, 44.0)]);
        let rec = report.recommendation.unwrap();
        assert_eq!(rec.pick, Pick::Over);
        assert_eq!(rec.edge, 6.0);
    }

    #[test]
    fn test_small_edges_not_recommended() {
        let report = calculator().analyze(&prediction(-3.5, 44.5, 0.7), &[snapshot("draftkings", 0, -3.0, 44.0)]);
        assert!(report.recommendation.is_none());
    }

    #[test]
    fn test_cover_probability_one_sigma() {
        let mut thresholds = EdgeThresholds::for_sport(Sport::Nfl);
        thresholds.min_total_edge = 100.0;
        let calc = EdgeCalculator::new(thresholds).unwrap();

        // Spread edge of exactly one standard deviation.
        let report = calc.analyze(&prediction(-16.5, 44.0, 0.9), &[snapshot("draftkings", 0, -3.0, 44.0)]);
        let rec = report.recommendation.unwrap();
        assert!((rec.cover_probability - 0.8413).abs() < 1e-3);
    }
}
