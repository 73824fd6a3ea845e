use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::config::{ModelConfig, PredictionConfig};
use crate::db::{get_team_by_id, get_upcoming_games, insert_prediction};
use crate::error::ConfigResult;
use crate::models::{
    Game, GameContext, GamePrediction, InjuryImpact, InjuryReport, Sport, TeamProfile, WeatherReport,
};
use crate::services::EloCalculator;

pub const MODEL_VERSION: &str = "elo-stats-v1";

/// Turns ratings and scoring stats into a predicted score line.
#[derive(Debug, Clone)]
pub struct PredictionEngine {
    sport: Sport,
    config: PredictionConfig,
    elo_calculator: EloCalculator,
}

impl PredictionEngine {
    pub fn new(sport: Sport, config: PredictionConfig, elo_calculator: EloCalculator) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            sport,
            config,
            elo_calculator,
        })
    }

    pub fn from_model(sport: Sport, model: &ModelConfig) -> ConfigResult<Self> {
        Self::new(sport, model.prediction.clone(), EloCalculator::new(model.elo.clone())?)
    }

    pub fn sport(&self) -> Sport {
        self.sport
    }

    /// Predict one game from each side's profile and the game context.
    pub fn predict(
        &self,
        game_id: &str,
        home: &TeamProfile,
        away: &TeamProfile,
        context: &GameContext,
    ) -> GamePrediction {
        let home_ppg = self.regressed(home.stats.ppg());
        let home_allowed = self.regressed(home.stats.ppg_allowed());
        let away_ppg = self.regressed(away.stats.ppg());
        let away_allowed = self.regressed(away.stats.ppg_allowed());

        // Each side scores the average of its offence and the opponent's defence.
        let mut home_points = (home_ppg + away_allowed) / 2.0;
        let mut away_points = (away_ppg + home_allowed) / 2.0;

        let elo_points = self.elo_points(home.rating - away.rating);
        home_points += elo_points / 2.0;
        away_points -= elo_points / 2.0;

        if !context.neutral_site {
            home_points += self.config.home_field_points / 2.0;
            away_points -= self.config.home_field_points / 2.0;
        }

        if let Some(weather) = &context.weather {
            let penalty = self.weather_penalty(weather);
            home_points -= penalty;
            away_points -= penalty;
        }

        home_points -= self.injury_penalty(&home.id, &context.injuries);
        away_points -= self.injury_penalty(&away.id, &context.injuries);

        let total = home_points + away_points;
        let spread = (away_points - home_points) * (1.0 - self.config.spread_regression);

        let home_win_probability =
            self.elo_calculator
                .win_probability(home.rating, away.rating, context.neutral_site);

        GamePrediction {
            id: Uuid::new_v4().to_string(),
            game_id: game_id.to_string(),
            home_team_id: home.id.clone(),
            away_team_id: away.id.clone(),
            predicted_home_score: (total - spread) / 2.0,
            predicted_away_score: (total + spread) / 2.0,
            predicted_spread: spread,
            predicted_total: total,
            home_win_probability,
            confidence: self.confidence(home_win_probability, home, away),
            market_spread: None,
            market_total: None,
            edge_spread: None,
            edge_total: None,
            model_version: MODEL_VERSION.to_string(),
            created_at: Utc::now(),
        }
    }

    /// Pull a per-game stat towards the league average. Teams without games
    /// get the league average outright.
    fn regressed(&self, stat: Option<f64>) -> f64 {
        let avg = self.config.league_avg_ppg;
        match stat {
            Some(value) => value * (1.0 - self.config.stats_regression) + avg * self.config.stats_regression,
            None => avg,
        }
    }

    fn elo_points(&self, rating_diff: f64) -> f64 {
        let points = rating_diff / 100.0 * self.config.elo_points_per_100;
        match self.config.elo_cap {
            Some(cap) => points.clamp(-cap, cap),
            None => points,
        }
    }

    /// Points knocked off each side's score by the conditions.
    fn weather_penalty(&self, weather: &WeatherReport) -> f64 {
        if !self.sport.is_outdoor() || weather.is_dome {
            return 0.0;
        }

        let adj = &self.config.adjustments;
        let mut penalty = 0.0;
        if weather.wind_mph.is_some_and(|wind| wind > adj.wind_threshold_mph) {
            penalty += adj.wind_penalty;
        }
        if weather.temperature_f.is_some_and(|temp| temp < adj.cold_threshold_f) {
            penalty += adj.cold_penalty;
        }
        if weather.precipitation {
            penalty += adj.precipitation_penalty;
        }
        penalty
    }

    fn injury_penalty(&self, team_id: &str, injuries: &[InjuryReport]) -> f64 {
        let adj = &self.config.adjustments;
        injuries
            .iter()
            .filter(|injury| injury.team_id == team_id)
            .map(|injury| {
                let impact = match injury.impact {
                    InjuryImpact::StartingQuarterback => adj.starting_quarterback_penalty,
                    InjuryImpact::KeyPlayer => adj.key_player_penalty,
                    InjuryImpact::Starter => adj.starter_penalty,
                };
                impact * injury.status.weight()
            })
            .sum()
    }

    /// Conviction scaled down while either side has only a few games on record.
    fn confidence(&self, home_win_probability: f64, home: &TeamProfile, away: &TeamProfile) -> f64 {
        let conviction = (2.0 * home_win_probability - 1.0).abs();
        let fewest_games = home.stats.games_played.min(away.stats.games_played);
        let sufficiency = (f64::from(fewest_games) / f64::from(self.config.sample_games)).min(1.0);
        conviction * sufficiency
    }

    async fn profile(&self, pool: &SqlitePool, team_id: &str) -> Result<TeamProfile> {
        Ok(match get_team_by_id(pool, team_id).await? {
            Some(team) => team.profile(),
            None => {
                tracing::debug!("Team {} not in store, using initial rating", team_id);
                TeamProfile::unknown(team_id, self.elo_calculator.config().initial_rating)
            }
        })
    }

    /// Predict a stored game from the current ratings.
    pub async fn predict_game(&self, pool: &SqlitePool, game: &Game) -> Result<GamePrediction> {
        let home = self.profile(pool, &game.home_team_id).await?;
        let away = self.profile(pool, &game.away_team_id).await?;
        let context = GameContext {
            neutral_site: game.neutral_site,
            ..Default::default()
        };
        Ok(self.predict(&game.id, &home, &away, &context))
    }

    /// Generate and store predictions for upcoming games of this sport.
    pub async fn generate_predictions(&self, pool: &SqlitePool, limit: i64) -> Result<Vec<GamePrediction>> {
        let games = get_upcoming_games(pool, Some(self.sport), limit).await?;
        let mut predictions = Vec::with_capacity(games.len());

        for game in &games {
            let prediction = self.predict_game(pool, game).await?;
            insert_prediction(pool, &prediction).await?;

            tracing::info!(
                "Predicted {} @ {}: {:.1}-{:.1} (spread {:+.1}, home {:.1}%)",
                game.away_team_name,
                game.home_team_name,
                prediction.predicted_away_score,
                prediction.predicted_home_score,
                prediction.predicted_spread,
                prediction.home_win_probability * 100.0
            );
            predictions.push(prediction);
        }

        Ok(predictions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EloConfig;
    use crate::models::{InjuryStatus, ScoringStats};

    fn engine(sport: Sport, config: PredictionConfig) -> PredictionEngine {
        let elo = EloCalculator::new(EloConfig::for_sport(sport)).unwrap();
        PredictionEngine::new(sport, config, elo).unwrap()
    }

    fn flat_config() -> PredictionConfig {
        let mut config = PredictionConfig::for_sport(Sport::Nfl);
        config.stats_regression = 0.0;
        config.spread_regression = 0.0;
        config
    }

    fn profile(id: &str, rating: f64, points_for: i64, points_against: i64, games_played: u32) -> TeamProfile {
        TeamProfile {
            id: id.to_string(),
            rating,
            stats: ScoringStats {
                points_for,
                points_against,
                games_played,
            },
        }
    }

    fn neutral() -> GameContext {
        GameContext {
            neutral_site: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_swapping_sides_mirrors_prediction() {
        let engine = engine(Sport::Nfl, PredictionConfig::for_sport(Sport::Nfl));
        let kc = profile("kc", 1620.0, 280, 190, 10);
        let buf = profile("buf", 1555.0, 260, 230, 10);

        let forward = engine.predict("g", &kc, &buf, &neutral());
        let swapped = engine.predict("g", &buf, &kc, &neutral());

        assert!((forward.predicted_spread + swapped.predicted_spread).abs() < 1e-9);
        assert!((forward.home_win_probability + swapped.home_win_probability - 1.0).abs() < 1e-9);
        assert!((forward.predicted_total - swapped.predicted_total).abs() < 1e-9);
    }

    #[test]
    fn test_zero_games_uses_league_average() {
        let engine = engine(Sport::Nfl, PredictionConfig::for_sport(Sport::Nfl));
        let home = TeamProfile::unknown("new1", 1500.0);
        let away = TeamProfile::unknown("new2", 1500.0);

        let prediction = engine.predict("g", &home, &away, &neutral());
        assert_eq!(prediction.predicted_home_score, 22.5);
        assert_eq!(prediction.predicted_away_score, 22.5);
        assert_eq!(prediction.predicted_spread, 0.0);
        assert_eq!(prediction.home_win_probability, 0.5);
        assert_eq!(prediction.confidence, 0.0);
    }

    #[test]
    fn test_stats_regression_extremes() {
        let home = profile("home", 1500.0, 300, 200, 10);
        let away = profile("away", 1500.0, 200, 250, 10);

        let raw = engine(Sport::Nfl, flat_config()).predict("g", &home, &away, &neutral());
        assert!((raw.predicted_home_score - 27.5).abs() < 1e-9);
        assert!((raw.predicted_away_score - 20.0).abs() < 1e-9);
        assert!((raw.predicted_spread + 7.5).abs() < 1e-9);

        let mut full = flat_config();
        full.stats_regression = 1.0;
        let regressed = engine(Sport::Nfl, full).predict("g", &home, &away, &neutral());
        assert!((regressed.predicted_home_score - 22.5).abs() < 1e-9);
        assert!(regressed.predicted_spread.abs() < 1e-9);
    }

    #[test]
    fn test_elo_adjustment_is_capped() {
        let home = profile("home", 1900.0, 0, 0, 0);
        let away = profile("away", 1500.0, 0, 0, 0);

        let capped = engine(Sport::Nfl, flat_config()).predict("g", &home, &away, &neutral());
        assert!((capped.predicted_spread + 7.0).abs() < 1e-9);

        let mut uncapped = flat_config();
        uncapped.elo_cap = None;
        let free = engine(Sport::Nfl, uncapped).predict("g", &home, &away, &neutral());
        assert!((free.predicted_spread + 16.0).abs() < 1e-9);
    }

    #[test]
    fn test_home_field_points_split() {
        let home = profile("home", 1500.0, 0, 0, 0);
        let away = profile("away", 1500.0, 0, 0, 0);
        let prediction = engine(Sport::Nfl, flat_config()).predict("g", &home, &away, &GameContext::default());

        assert!((prediction.predicted_home_score - 23.5).abs() < 1e-9);
        assert!((prediction.predicted_away_score - 21.5).abs() < 1e-9);
        assert!(prediction.home_win_probability > 0.5);
    }

    #[test]
    fn test_spread_regression_keeps_scores_consistent() {
        let engine = engine(Sport::Nfl, PredictionConfig::for_sport(Sport::Nfl));
        let home = profile("home", 1650.0, 300, 180, 10);
        let away = profile("away", 1450.0, 190, 290, 10);

        let prediction = engine.predict("g", &home, &away, &GameContext::default());
        let margin = prediction.predicted_home_score - prediction.predicted_away_score;
        assert!((margin + prediction.predicted_spread).abs() < 1e-9);
        assert!(
            (prediction.predicted_home_score + prediction.predicted_away_score - prediction.predicted_total).abs()
                < 1e-9
        );
    }

    #[test]
    fn test_quarterback_out_costs_home_points() {
        let engine = engine(Sport::Nfl, PredictionConfig::for_sport(Sport::Nfl));
        let home = profile("home", 1500.0, 220, 220, 10);
        let away = profile("away", 1500.0, 220, 220, 10);

        let healthy = engine.predict("g", &home, &away, &neutral());
        let context = GameContext {
            neutral_site: true,
            weather: None,
            injuries: vec![InjuryReport {
                team_id: "home".to_string(),
                player: "QB1".to_string(),
                status: InjuryStatus::Out,
                impact: InjuryImpact::StartingQuarterback,
            }],
        };
        let hurt = engine.predict("g", &home, &away, &context);

        assert!((healthy.predicted_total - hurt.predicted_total - 7.0).abs() < 1e-9);
        // Spread regression shrinks the swing by 10%.
        assert!((hurt.predicted_spread - healthy.predicted_spread - 6.3).abs() < 1e-9);
    }

    #[test]
    fn test_weather_only_matters_outdoors() {
        let windy = GameContext {
            neutral_site: false,
            weather: Some(WeatherReport {
                temperature_f: Some(10.0),
                wind_mph: Some(25.0),
                precipitation: true,
                is_dome: false,
            }),
            injuries: vec![],
        };
        let home = profile("home", 1500.0, 0, 0, 0);
        let away = profile("away", 1500.0, 0, 0, 0);

        let nfl = engine(Sport::Nfl, PredictionConfig::for_sport(Sport::Nfl));
        let calm = nfl.predict("g", &home, &away, &GameContext::default());
        let storm = nfl.predict("g", &home, &away, &windy);
        // Wind, cold and rain each cost both sides.
        assert!((calm.predicted_total - storm.predicted_total - 7.0).abs() < 1e-9);

        let nba = engine(Sport::Nba, PredictionConfig::for_sport(Sport::Nba));
        let indoors = nba.predict("g", &home, &away, &GameContext::default());
        let indoors_windy = nba.predict("g", &home, &away, &windy);
        assert_eq!(indoors.predicted_total, indoors_windy.predicted_total);

        let mut dome = windy.clone();
        if let Some(weather) = dome.weather.as_mut() {
            weather.is_dome = true;
        }
        let covered = nfl.predict("g", &home, &away, &dome);
        assert_eq!(calm.predicted_total, covered.predicted_total);
    }

    #[test]
    fn test_confidence_scales_with_sample() {
        let engine = engine(Sport::Nfl, PredictionConfig::for_sport(Sport::Nfl));
        let early = engine.predict("g", &profile("home", 1600.0, 48, 20, 2), &profile("away", 1400.0, 40, 50, 2), &neutral());
        let settled = engine.predict("g", &profile("home", 1600.0, 96, 40, 4), &profile("away", 1400.0, 80, 100, 4), &neutral());

        let conviction = (2.0 * settled.home_win_probability - 1.0).abs();
        assert!((settled.confidence - conviction).abs() < 1e-12);
        assert!((early.confidence - conviction / 2.0).abs() < 1e-12);
    }
}
