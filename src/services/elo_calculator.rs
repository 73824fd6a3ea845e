use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};

use crate::config::EloConfig;
use crate::db::{self, RatingWrite};
use crate::error::ConfigResult;
use crate::models::{EloHistoryPoint, Game, ScoringStats, Sport};

/// Result of folding a batch of completed games into a set of ratings.
#[derive(Debug, Clone, Default)]
pub struct ReplayOutcome {
    pub ratings: HashMap<String, f64>,
    pub stats: HashMap<String, ScoringStats>,
    /// Games folded into the ratings, in the order they were applied.
    pub processed: Vec<String>,
    /// Final games dropped because their score was missing.
    pub skipped: Vec<String>,
    pub history: Vec<EloHistoryPoint>,
}

#[derive(Debug, Clone)]
pub struct EloCalculator {
    config: EloConfig,
}

impl EloCalculator {
    pub fn new(config: EloConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &EloConfig {
        &self.config
    }

    /// Calculate expected score based on ELO ratings
    pub fn expected_score(rating_a: f64, rating_b: f64) -> f64 {
        1.0 / (1.0 + 10f64.powf((rating_b - rating_a) / 400.0))
    }

    fn home_advantage(&self, neutral_site: bool) -> f64 {
        if neutral_site {
            0.0
        } else {
            self.config.home_field_advantage
        }
    }

    /// Home win probability for an upcoming game.
    pub fn win_probability(&self, home_rating: f64, away_rating: f64, neutral_site: bool) -> f64 {
        Self::expected_score(home_rating + self.home_advantage(neutral_site), away_rating)
    }

    /// Scales the rating swing by the score margin, damped when the winner
    /// was already favoured.
    pub fn margin_multiplier(&self, margin: i32, winner_elo_diff: f64) -> f64 {
        let mov = &self.config.margin_of_victory;
        if !mov.enabled {
            return 1.0;
        }

        let margin_term = (f64::from(margin.abs()) + 1.0).ln().max(mov.floor);
        // Underdog wins are capped at a 1000 point gap so the factor stays finite.
        let autocorrelation = mov.autocorrelation / (mov.autocorrelation + 0.001 * winner_elo_diff.max(-1000.0));
        margin_term * autocorrelation
    }

    /// Update ELO ratings after a game. Whatever the home side gains, the
    /// away side loses.
    pub fn update_ratings(
        &self,
        home_rating: f64,
        away_rating: f64,
        home_score: i32,
        away_score: i32,
        neutral_site: bool,
    ) -> (f64, f64) {
        let delta = self.rating_delta(home_rating, away_rating, home_score, away_score, neutral_site);
        (home_rating + delta, away_rating - delta)
    }

    /// Rating points moved from the away side to the home side.
    pub fn rating_delta(
        &self,
        home_rating: f64,
        away_rating: f64,
        home_score: i32,
        away_score: i32,
        neutral_site: bool,
    ) -> f64 {
        let adjusted_home = home_rating + self.home_advantage(neutral_site);
        let expected_home = Self::expected_score(adjusted_home, away_rating);

        let actual_home = match home_score.cmp(&away_score) {
            std::cmp::Ordering::Greater => 1.0,
            std::cmp::Ordering::Equal => 0.5,
            std::cmp::Ordering::Less => 0.0,
        };

        let winner_elo_diff = match home_score.cmp(&away_score) {
            std::cmp::Ordering::Greater => adjusted_home - away_rating,
            std::cmp::Ordering::Less => away_rating - adjusted_home,
            std::cmp::Ordering::Equal => 0.0,
        };

        let multiplier = self.margin_multiplier(home_score - away_score, winner_elo_diff);
        let delta = self.config.k_factor * multiplier * (actual_home - expected_home);
        self.limit_to_bounds(home_rating, away_rating, delta)
    }

    /// Shrinks the exchanged delta so neither side leaves the configured
    /// bounds. The exchange stays zero-sum.
    fn limit_to_bounds(&self, home_rating: f64, away_rating: f64, delta: f64) -> f64 {
        let Some(bounds) = self.config.bounds else {
            return delta;
        };
        if delta > 0.0 {
            delta
                .min(bounds.max - home_rating)
                .min(away_rating - bounds.min)
                .max(0.0)
        } else {
            delta
                .max(bounds.min - home_rating)
                .max(away_rating - bounds.max)
                .min(0.0)
        }
    }

    /// Derive ratings from scratch by replaying every completed game in
    /// chronological order. Teams missing from `initial_ratings` start at the
    /// configured initial rating.
    pub fn replay_from_scratch(&self, games: &[Game], initial_ratings: &HashMap<String, f64>) -> ReplayOutcome {
        self.replay_onto(games, initial_ratings.clone(), HashMap::new())
    }

    /// Fold `games` into existing ratings and scoring totals.
    pub fn replay_onto(
        &self,
        games: &[Game],
        ratings: HashMap<String, f64>,
        stats: HashMap<String, ScoringStats>,
    ) -> ReplayOutcome {
        let mut outcome = ReplayOutcome {
            ratings,
            stats,
            ..Default::default()
        };

        for game in chronological(games) {
            let Some((home_score, away_score)) = game.final_score() else {
                if game.is_malformed_final() {
                    tracing::warn!("Skipping final game {} with missing score", game.id);
                    outcome.skipped.push(game.id.clone());
                }
                continue;
            };

            let (new_home, new_away) =
                self.fold_game(&mut outcome.ratings, &mut outcome.stats, game, home_score, away_score);

            for (team_id, rating) in [(&game.home_team_id, new_home), (&game.away_team_id, new_away)] {
                outcome.history.push(EloHistoryPoint {
                    team_id: team_id.clone(),
                    date: game.game_time,
                    rating,
                    game_id: Some(game.id.clone()),
                });
            }

            outcome.processed.push(game.id.clone());
        }

        outcome
    }

    /// Apply one final game to the rating and scoring maps and return the
    /// new (home, away) ratings.
    pub(crate) fn fold_game(
        &self,
        ratings: &mut HashMap<String, f64>,
        stats: &mut HashMap<String, ScoringStats>,
        game: &Game,
        home_score: i32,
        away_score: i32,
    ) -> (f64, f64) {
        let home_rating = self.rating_of(ratings, &game.home_team_id);
        let away_rating = self.rating_of(ratings, &game.away_team_id);

        let (new_home, new_away) =
            self.update_ratings(home_rating, away_rating, home_score, away_score, game.neutral_site);

        ratings.insert(game.home_team_id.clone(), new_home);
        ratings.insert(game.away_team_id.clone(), new_away);
        stats.entry(game.home_team_id.clone()).or_default().record(home_score, away_score);
        stats.entry(game.away_team_id.clone()).or_default().record(away_score, home_score);

        (new_home, new_away)
    }

    pub(crate) fn rating_of(&self, ratings: &HashMap<String, f64>, team_id: &str) -> f64 {
        ratings.get(team_id).copied().unwrap_or(self.config.initial_rating)
    }

    /// Fold every final game not yet applied into the stored ratings.
    pub async fn process_pending_games(&self, pool: &SqlitePool, sport: Sport) -> Result<ReplayOutcome> {
        let games = db::get_pending_games(pool, sport).await?;
        if games.is_empty() {
            tracing::debug!("No pending {} games to rate", sport);
            return Ok(ReplayOutcome::default());
        }

        let teams = db::get_teams(pool, sport).await?;
        let ratings = teams.iter().map(|t| (t.id.clone(), t.rating)).collect();
        let stats = teams.iter().map(|t| (t.id.clone(), t.stats)).collect();

        let outcome = self.replay_onto(&games, ratings, stats);
        self.persist(pool, sport, &outcome).await?;

        tracing::info!(
            "Rated {} pending {} games ({} skipped for missing scores)",
            outcome.processed.len(),
            sport,
            outcome.skipped.len()
        );
        Ok(outcome)
    }

    /// Reset every rating, scoring total and processed flag for `sport`,
    /// then rebuild them from the full game history. Safe to rerun after an
    /// interrupted write or a corrected score.
    pub async fn recalculate_all(&self, pool: &SqlitePool, sport: Sport) -> Result<ReplayOutcome> {
        db::reset_ratings(pool, sport, self.config.initial_rating).await?;

        let games = db::get_completed_games_ordered(pool, sport).await?;
        let outcome = self.replay_from_scratch(&games, &HashMap::new());
        self.persist(pool, sport, &outcome).await?;

        tracing::info!(
            "Recalculated {} ratings from {} games ({} skipped for missing scores)",
            sport,
            outcome.processed.len(),
            outcome.skipped.len()
        );
        Ok(outcome)
    }

    async fn persist(&self, pool: &SqlitePool, sport: Sport, outcome: &ReplayOutcome) -> Result<()> {
        let touched: HashSet<&str> = outcome
            .history
            .iter()
            .map(|point| point.team_id.as_str())
            .collect();

        let now = Utc::now();
        let writes: Vec<RatingWrite> = touched
            .into_iter()
            .map(|team_id| RatingWrite {
                team_id: team_id.to_string(),
                rating: self.rating_of(&outcome.ratings, team_id),
                stats: outcome.stats.get(team_id).copied().unwrap_or_default(),
                updated_at: now,
            })
            .collect();

        db::apply_rating_batch(pool, sport, &writes, &outcome.processed, &outcome.history).await
    }
}

/// Completed games sorted by kickoff, ties broken by id so replay order never
/// depends on how the caller fetched them.
fn chronological(games: &[Game]) -> Vec<&Game> {
    let mut ordered: Vec<&Game> = games.iter().collect();
    ordered.sort_by(|a, b| a.game_time.cmp(&b.game_time).then_with(|| a.id.cmp(&b.id)));
    ordered
}
