//! Historical replay of the prediction model with a parallel grid search
//! over its tunable parameters.
//!
//! Every parameter combination replays the full game history from initial
//! ratings on its own copy of the rating map. Each game is predicted from
//! the ratings and scoring totals as they stood before kickoff, graded as a
//! unit spread bet, and only then folded into the ratings.

use rayon::prelude::*;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::io;

use crate::config::{ModelConfig, PredictionConfig, SimulationParams};
use crate::error::{ConfigError, ConfigResult};
use crate::models::{Game, GameContext, ScoringStats, Sport, TeamProfile};
use crate::services::{EloCalculator, PredictionEngine};
use crate::utils::payout_per_unit;

/// Candidate values for each searched parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterGrid {
    pub elo_points_per_100: Vec<f64>,
    pub spread_regression: Vec<f64>,
    pub elo_cap: Vec<Option<f64>>,
    pub stats_regression: Vec<f64>,
    /// (min, max) bands on |predicted spread|.
    pub spread_filters: Vec<(f64, f64)>,
}

impl ParameterGrid {
    /// A one-point grid at the configured prediction parameters.
    pub fn from_config(config: &PredictionConfig, min_spread: f64, max_spread: f64) -> Self {
        Self {
            elo_points_per_100: vec![config.elo_points_per_100],
            spread_regression: vec![config.spread_regression],
            elo_cap: vec![config.elo_cap],
            stats_regression: vec![config.stats_regression],
            spread_filters: vec![(min_spread, max_spread)],
        }
    }

    pub fn len(&self) -> usize {
        self.elo_points_per_100.len()
            * self.spread_regression.len()
            * self.elo_cap.len()
            * self.stats_regression.len()
            * self.spread_filters.len()
    }

    /// Every combination of the axes, each validated.
    pub fn combinations(&self) -> ConfigResult<Vec<SimulationParams>> {
        for (axis, empty) in [
            ("elo_points_per_100", self.elo_points_per_100.is_empty()),
            ("spread_regression", self.spread_regression.is_empty()),
            ("elo_cap", self.elo_cap.is_empty()),
            ("stats_regression", self.stats_regression.is_empty()),
            ("spread_filters", self.spread_filters.is_empty()),
        ] {
            if empty {
                return Err(ConfigError::EmptyGridAxis(axis));
            }
        }

        let mut combos = Vec::with_capacity(self.len());
        for &elo_points_per_100 in &self.elo_points_per_100 {
            for &spread_regression in &self.spread_regression {
                for &elo_cap in &self.elo_cap {
                    for &stats_regression in &self.stats_regression {
                        for &(min_spread, max_spread) in &self.spread_filters {
                            let params = SimulationParams {
                                elo_points_per_100,
                                spread_regression,
                                elo_cap,
                                stats_regression,
                                min_spread,
                                max_spread,
                            };
                            params.validate()?;
                            combos.push(params);
                        }
                    }
                }
            }
        }
        Ok(combos)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BetOutcome {
    Win,
    Loss,
    Push,
}

/// Grade a unit spread bet on one final score.
///
/// With a market line the model's side against that line is bet. Without
/// one the model favourite is bet to cover the model's own line. Returns
/// `None` when the model has no side.
pub fn grade_spread_bet(
    predicted_spread: f64,
    market_spread: Option<f64>,
    home_score: i32,
    away_score: i32,
) -> Option<BetOutcome> {
    let line = market_spread.unwrap_or(predicted_spread);
    let take_home = match market_spread {
        Some(market) => match predicted_spread.partial_cmp(&market)? {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => return None,
        },
        None => match predicted_spread.partial_cmp(&0.0)? {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => return None,
        },
    };

    let home_cover = f64::from(home_score - away_score) + line;
    let cover = if take_home { home_cover } else { -home_cover };
    Some(if cover > 0.0 {
        BetOutcome::Win
    } else if cover < 0.0 {
        BetOutcome::Loss
    } else {
        BetOutcome::Push
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktestResult {
    pub params: SimulationParams,
    pub games: usize,
    pub wins: u32,
    pub losses: u32,
    pub pushes: u32,
    pub profit: f64,
    pub roi: f64,
    /// Wins over decided bets. Pushes are left out.
    pub win_rate: f64,
    /// Mean absolute error of the predicted spread over every game.
    pub spread_mae: Option<f64>,
}

impl BacktestResult {
    pub fn bets(&self) -> u32 {
        self.wins + self.losses + self.pushes
    }
}

/// Parameter a ranked result list can be grouped by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridKey {
    EloPointsPer100,
    SpreadRegression,
    EloCap,
    StatsRegression,
    SpreadFilter,
}

impl GridKey {
    pub fn label(&self, params: &SimulationParams) -> String {
        match self {
            GridKey::EloPointsPer100 => format!("{}", params.elo_points_per_100),
            GridKey::SpreadRegression => format!("{}", params.spread_regression),
            GridKey::EloCap => params.elo_cap.map_or_else(|| "none".to_string(), |cap| format!("{}", cap)),
            GridKey::StatsRegression => format!("{}", params.stats_regression),
            GridKey::SpreadFilter => format!("{}-{}", params.min_spread, params.max_spread),
        }
    }
}

impl std::str::FromStr for GridKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "elo_points_per_100" | "elo-points" => Ok(GridKey::EloPointsPer100),
            "spread_regression" | "spread-regression" => Ok(GridKey::SpreadRegression),
            "elo_cap" | "elo-cap" => Ok(GridKey::EloCap),
            "stats_regression" | "stats-regression" => Ok(GridKey::StatsRegression),
            "spread_filter" | "spread-filter" => Ok(GridKey::SpreadFilter),
            other => Err(format!("unknown grid key: {}", other)),
        }
    }
}

/// Results of one search, best first.
#[derive(Debug, Clone, Default)]
pub struct BacktestReport {
    pub results: Vec<BacktestResult>,
    /// Final games left out of the replay because a score was missing.
    pub skipped: Vec<String>,
}

impl BacktestReport {
    pub fn top(&self, n: usize) -> &[BacktestResult] {
        &self.results[..n.min(self.results.len())]
    }

    pub fn best(&self) -> Option<&BacktestResult> {
        self.results.first()
    }

    /// The best result for each value of `key`, in ranking order.
    pub fn best_by(&self, key: GridKey) -> Vec<(String, &BacktestResult)> {
        let mut seen = HashSet::new();
        self.results
            .iter()
            .filter_map(|result| {
                let label = key.label(&result.params);
                seen.insert(label.clone()).then_some((label, result))
            })
            .collect()
    }

    pub fn write_csv<W: io::Write>(&self, writer: W) -> anyhow::Result<()> {
        #[derive(Serialize)]
        struct Row {
            rank: usize,
            elo_points_per_100: f64,
            spread_regression: f64,
            elo_cap: Option<f64>,
            stats_regression: f64,
            min_spread: f64,
            max_spread: f64,
            games: usize,
            wins: u32,
            losses: u32,
            pushes: u32,
            profit: f64,
            roi: f64,
            win_rate: f64,
            spread_mae: Option<f64>,
        }

        let mut csv_writer = csv::Writer::from_writer(writer);
        for (i, r) in self.results.iter().enumerate() {
            csv_writer.serialize(Row {
                rank: i + 1,
                elo_points_per_100: r.params.elo_points_per_100,
                spread_regression: r.params.spread_regression,
                elo_cap: r.params.elo_cap,
                stats_regression: r.params.stats_regression,
                min_spread: r.params.min_spread,
                max_spread: r.params.max_spread,
                games: r.games,
                wins: r.wins,
                losses: r.losses,
                pushes: r.pushes,
                profit: r.profit,
                roi: r.roi,
                win_rate: r.win_rate,
                spread_mae: r.spread_mae,
            })?;
        }
        csv_writer.flush()?;
        Ok(())
    }
}

pub struct BacktestOptimizer {
    sport: Sport,
    model: ModelConfig,
    games: Vec<Game>,
    skipped: Vec<String>,
}

impl BacktestOptimizer {
    /// Keeps only final games with a score, in replay order. Finals missing
    /// a score are logged and listed in `skipped`.
    pub fn new(sport: Sport, games: Vec<Game>, model: ModelConfig) -> ConfigResult<Self> {
        model.validate()?;

        let mut skipped = Vec::new();
        let mut games: Vec<Game> = games
            .into_iter()
            .filter(|g| {
                if g.is_malformed_final() {
                    tracing::warn!("Backtest skipping final game {} with missing score", g.id);
                    skipped.push(g.id.clone());
                }
                g.final_score().is_some()
            })
            .collect();
        games.sort_by(|a, b| a.game_time.cmp(&b.game_time).then_with(|| a.id.cmp(&b.id)));

        Ok(Self {
            sport,
            model,
            games,
            skipped,
        })
    }

    pub fn games(&self) -> &[Game] {
        &self.games
    }

    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    /// Evaluate every combination in parallel and rank by profit.
    pub fn search(&self, grid: &ParameterGrid) -> ConfigResult<BacktestReport> {
        let combos = grid.combinations()?;
        tracing::info!(
            "Backtesting {} parameter sets over {} {} games",
            combos.len(),
            self.games.len(),
            self.sport
        );

        let mut results = combos
            .par_iter()
            .map(|params| self.run(params))
            .collect::<ConfigResult<Vec<_>>>()?;

        results.sort_by(rank);
        if let Some(best) = results.first() {
            tracing::info!(
                "Best: {:+.2}u over {} bets ({:.1}% wins) with {:?}",
                best.profit,
                best.bets(),
                best.win_rate * 100.0,
                best.params
            );
        }
        Ok(BacktestReport {
            results,
            skipped: self.skipped.clone(),
        })
    }

    /// Replay the history once under `params`.
    pub fn run(&self, params: &SimulationParams) -> ConfigResult<BacktestResult> {
        let elo = EloCalculator::new(self.model.elo.clone())?;
        let engine = PredictionEngine::new(self.sport, params.apply(&self.model.prediction), elo.clone())?;
        let payout = payout_per_unit(self.model.edge.vig);

        let mut ratings: HashMap<String, f64> = HashMap::new();
        let mut stats: HashMap<String, ScoringStats> = HashMap::new();
        let (mut wins, mut losses, mut pushes) = (0u32, 0u32, 0u32);
        let mut abs_error = 0.0;

        for game in &self.games {
            let Some((home_score, away_score)) = game.final_score() else {
                continue;
            };
            let profile = |id: &str| TeamProfile {
                id: id.to_string(),
                rating: elo.rating_of(&ratings, id),
                stats: stats.get(id).copied().unwrap_or_default(),
            };
            let context = GameContext {
                neutral_site: game.neutral_site,
                ..Default::default()
            };
            let prediction = engine.predict(
                &game.id,
                &profile(&game.home_team_id),
                &profile(&game.away_team_id),
                &context,
            );

            let actual_spread = f64::from(away_score - home_score);
            abs_error += (prediction.predicted_spread - actual_spread).abs();

            if params.accepts_spread(prediction.predicted_spread) {
                match grade_spread_bet(prediction.predicted_spread, game.market_spread, home_score, away_score) {
                    Some(BetOutcome::Win) => wins += 1,
                    Some(BetOutcome::Loss) => losses += 1,
                    Some(BetOutcome::Push) => pushes += 1,
                    None => {}
                }
            }

            elo.fold_game(&mut ratings, &mut stats, game, home_score, away_score);
        }

        let profit = f64::from(wins) * payout - f64::from(losses);
        let bets = wins + losses + pushes;
        let decided = wins + losses;
        let games = self.games.len();

        Ok(BacktestResult {
            params: *params,
            games,
            wins,
            losses,
            pushes,
            profit,
            roi: if bets > 0 { profit / f64::from(bets) } else { 0.0 },
            win_rate: if decided > 0 { f64::from(wins) / f64::from(decided) } else { 0.0 },
            spread_mae: (games > 0).then(|| abs_error / games as f64),
        })
    }
}

/// Profit first, then win rate, then more bets placed.
fn rank(a: &BacktestResult, b: &BacktestResult) -> Ordering {
    b.profit
        .total_cmp(&a.profit)
        .then_with(|| b.win_rate.total_cmp(&a.win_rate))
        .then_with(|| b.bets().cmp(&a.bets()))
}
