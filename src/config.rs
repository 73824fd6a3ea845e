//! Model parameters and runtime settings.
//!
//! Every tunable number used by the rating engine, predictor and edge
//! calculator lives in one of the structs below and is passed in explicitly,
//! so the backtest can vary parameters per run without any shared state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::env;
use std::path::Path;

use crate::error::{check_fraction, check_non_negative, check_range, ConfigError, ConfigResult};
use crate::models::Sport;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarginOfVictory {
    pub enabled: bool,
    /// Damps rating swings when the favourite wins big.
    pub autocorrelation: f64,
    /// Lower bound on the log-margin term so narrow results still move ratings.
    pub floor: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatingBounds {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EloConfig {
    pub initial_rating: f64,
    pub k_factor: f64,
    /// Home-field advantage in rating points.
    pub home_field_advantage: f64,
    pub margin_of_victory: MarginOfVictory,
    pub bounds: Option<RatingBounds>,
}

impl EloConfig {
    pub fn for_sport(sport: Sport) -> Self {
        let (k_factor, home_field_advantage) = match sport {
            Sport::Nfl => (20.0, 48.0),
            Sport::Nba => (20.0, 100.0),
            Sport::Nhl => (8.0, 50.0),
            Sport::Cbb => (20.0, 100.0),
        };
        Self {
            initial_rating: 1500.0,
            k_factor,
            home_field_advantage,
            margin_of_victory: MarginOfVictory {
                enabled: true,
                autocorrelation: 2.2,
                floor: 1.0,
            },
            bounds: None,
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        check_range("initial_rating", self.initial_rating, f64::MIN, f64::MAX)?;
        check_non_negative("k_factor", self.k_factor)?;
        check_range("home_field_advantage", self.home_field_advantage, f64::MIN, f64::MAX)?;

        let mov = &self.margin_of_victory;
        check_range("margin_of_victory.autocorrelation", mov.autocorrelation, 0.0, f64::MAX)?;
        // Underdog gaps are capped at 1000 points, so c <= 1 would flip the sign.
        if mov.autocorrelation <= 1.0 {
            return Err(ConfigError::InvalidParameter {
                name: "margin_of_victory.autocorrelation",
                value: mov.autocorrelation,
                reason: "must exceed 1",
            });
        }
        check_non_negative("margin_of_victory.floor", mov.floor)?;

        if let Some(bounds) = &self.bounds {
            check_range("bounds.min", bounds.min, f64::MIN, f64::MAX)?;
            check_range("bounds.max", bounds.max, f64::MIN, f64::MAX)?;
            if bounds.min > bounds.max {
                return Err(ConfigError::InvertedRange {
                    name: "bounds",
                    min: bounds.min,
                    max: bounds.max,
                });
            }
            check_range("initial_rating", self.initial_rating, bounds.min, bounds.max)?;
        }
        Ok(())
    }
}

/// Penalties, in points, subtracted from a team's predicted score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextAdjustments {
    pub wind_threshold_mph: f64,
    pub wind_penalty: f64,
    pub cold_threshold_f: f64,
    pub cold_penalty: f64,
    pub precipitation_penalty: f64,
    pub starting_quarterback_penalty: f64,
    pub key_player_penalty: f64,
    pub starter_penalty: f64,
}

impl ContextAdjustments {
    pub fn for_sport(sport: Sport) -> Self {
        let (qb, key, starter) = match sport {
            Sport::Nfl => (7.0, 2.5, 1.0),
            Sport::Nba => (0.0, 4.0, 1.5),
            Sport::Nhl => (0.0, 0.3, 0.1),
            Sport::Cbb => (0.0, 3.5, 1.5),
        };
        Self {
            wind_threshold_mph: 15.0,
            wind_penalty: 1.5,
            cold_threshold_f: 25.0,
            cold_penalty: 1.0,
            precipitation_penalty: 1.0,
            starting_quarterback_penalty: qb,
            key_player_penalty: key,
            starter_penalty: starter,
        }
    }

    fn validate(&self) -> ConfigResult<()> {
        check_non_negative("adjustments.wind_threshold_mph", self.wind_threshold_mph)?;
        check_non_negative("adjustments.wind_penalty", self.wind_penalty)?;
        check_range("adjustments.cold_threshold_f", self.cold_threshold_f, f64::MIN, f64::MAX)?;
        check_non_negative("adjustments.cold_penalty", self.cold_penalty)?;
        check_non_negative("adjustments.precipitation_penalty", self.precipitation_penalty)?;
        check_non_negative("adjustments.starting_quarterback_penalty", self.starting_quarterback_penalty)?;
        check_non_negative("adjustments.key_player_penalty", self.key_player_penalty)?;
        check_non_negative("adjustments.starter_penalty", self.starter_penalty)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionConfig {
    pub league_avg_ppg: f64,
    /// 0 keeps team stats as-is, 1 replaces them with the league average.
    pub stats_regression: f64,
    /// Points of spread per 100 rating points of difference.
    pub elo_points_per_100: f64,
    /// Cap, in points, on the rating-derived adjustment.
    pub elo_cap: Option<f64>,
    pub home_field_points: f64,
    pub spread_regression: f64,
    /// Games a team needs before its stats count fully towards confidence.
    pub sample_games: u32,
    pub adjustments: ContextAdjustments,
}

impl PredictionConfig {
    pub fn for_sport(sport: Sport) -> Self {
        let (league_avg_ppg, elo_points_per_100, elo_cap, home_field_points, stats_regression, sample_games) =
            match sport {
                Sport::Nfl => (22.5, 4.0, Some(7.0), 2.0, 0.45, 4),
                Sport::Nba => (114.5, 3.6, Some(12.0), 2.5, 0.3, 10),
                Sport::Nhl => (3.05, 0.35, Some(1.0), 0.2, 0.4, 10),
                Sport::Cbb => (72.0, 3.5, Some(12.0), 3.5, 0.35, 6),
            };
        Self {
            league_avg_ppg,
            stats_regression,
            elo_points_per_100,
            elo_cap,
            home_field_points,
            spread_regression: 0.1,
            sample_games,
            adjustments: ContextAdjustments::for_sport(sport),
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        check_range("league_avg_ppg", self.league_avg_ppg, f64::MIN_POSITIVE, f64::MAX)?;
        check_fraction("stats_regression", self.stats_regression)?;
        check_non_negative("elo_points_per_100", self.elo_points_per_100)?;
        if let Some(cap) = self.elo_cap {
            check_non_negative("elo_cap", cap)?;
        }
        check_range("home_field_points", self.home_field_points, f64::MIN, f64::MAX)?;
        check_fraction("spread_regression", self.spread_regression)?;
        if self.sample_games == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "sample_games",
                value: 0.0,
                reason: "must be at least one game",
            });
        }
        self.adjustments.validate()
    }
}

/// Edge magnitudes at which an edge is considered moderate or strong.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EdgeBands {
    pub moderate: f64,
    pub strong: f64,
}

impl EdgeBands {
    fn validate(&self, name: &'static str) -> ConfigResult<()> {
        check_non_negative(name, self.moderate)?;
        check_non_negative(name, self.strong)?;
        if self.moderate > self.strong {
            return Err(ConfigError::InvertedRange {
                name,
                min: self.moderate,
                max: self.strong,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeThresholds {
    pub spread_bands: EdgeBands,
    pub total_bands: EdgeBands,
    pub min_spread_edge: f64,
    pub min_total_edge: f64,
    /// Minimum of max(p, 1 - p) before any pick is emitted.
    pub min_win_probability: f64,
    /// Standard deviation of actual margin around the line, in points.
    pub spread_std_dev: f64,
    pub total_std_dev: f64,
    pub kelly_fraction: f64,
    /// American odds paid on spread and total bets.
    pub vig: i32,
}

impl EdgeThresholds {
    pub fn for_sport(sport: Sport) -> Self {
        let (spread_bands, total_bands, spread_std_dev, total_std_dev) = match sport {
            Sport::Nfl => ((1.5, 3.0), (2.0, 4.0), 13.5, 13.0),
            Sport::Nba => ((2.0, 4.0), (3.0, 6.0), 12.0, 18.0),
            Sport::Nhl => ((0.5, 1.0), (0.5, 1.0), 2.3, 2.3),
            Sport::Cbb => ((2.0, 4.0), (3.0, 6.0), 11.0, 16.0),
        };
        Self {
            spread_bands: EdgeBands {
                moderate: spread_bands.0,
                strong: spread_bands.1,
            },
            total_bands: EdgeBands {
                moderate: total_bands.0,
                strong: total_bands.1,
            },
            min_spread_edge: spread_bands.0,
            min_total_edge: total_bands.0,
            min_win_probability: 0.55,
            spread_std_dev,
            total_std_dev,
            kelly_fraction: 0.25,
            vig: -110,
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.spread_bands.validate("spread_bands")?;
        self.total_bands.validate("total_bands")?;
        check_non_negative("min_spread_edge", self.min_spread_edge)?;
        check_non_negative("min_total_edge", self.min_total_edge)?;
        check_range("min_win_probability", self.min_win_probability, 0.5, 1.0)?;
        check_range("spread_std_dev", self.spread_std_dev, f64::MIN_POSITIVE, f64::MAX)?;
        check_range("total_std_dev", self.total_std_dev, f64::MIN_POSITIVE, f64::MAX)?;
        check_fraction("kelly_fraction", self.kelly_fraction)?;
        if self.vig.abs() < 100 {
            return Err(ConfigError::InvalidParameter {
                name: "vig",
                value: f64::from(self.vig),
                reason: "american odds must be <= -100 or >= 100",
            });
        }
        Ok(())
    }
}

/// Everything needed to rate, predict and price one sport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub elo: EloConfig,
    pub prediction: PredictionConfig,
    pub edge: EdgeThresholds,
}

impl ModelConfig {
    pub fn for_sport(sport: Sport) -> Self {
        Self {
            elo: EloConfig::for_sport(sport),
            prediction: PredictionConfig::for_sport(sport),
            edge: EdgeThresholds::for_sport(sport),
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.elo.validate()?;
        self.prediction.validate()?;
        self.edge.validate()
    }

    /// Sport defaults, patched by the matching entry of a JSON override file.
    ///
    /// The file maps sport tags to partial configs, e.g.
    /// `{"nfl": {"elo": {"k_factor": 25.0}}}`.
    pub fn load(sport: Sport, path: Option<&Path>) -> ConfigResult<Self> {
        let defaults = Self::for_sport(sport);
        let Some(path) = path else {
            defaults.validate()?;
            return Ok(defaults);
        };

        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config = Self::from_overrides(sport, &raw)?;
        tracing::info!("Loaded {} model overrides from {}", sport, path.display());
        Ok(config)
    }

    pub fn from_overrides(sport: Sport, raw: &str) -> ConfigResult<Self> {
        let overrides: HashMap<String, Value> =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let mut merged =
            serde_json::to_value(Self::for_sport(sport)).map_err(|e| ConfigError::Parse(e.to_string()))?;
        if let Some(patch) = overrides.get(sport.as_str()) {
            merge_json(&mut merged, patch);
        }

        let config: Self = serde_json::from_value(merged).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

fn merge_json(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

/// Parameters varied by the backtest grid search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimulationParams {
    pub elo_points_per_100: f64,
    pub spread_regression: f64,
    pub elo_cap: Option<f64>,
    pub stats_regression: f64,
    /// Bets are only placed when |predicted spread| falls in [min_spread, max_spread].
    pub min_spread: f64,
    pub max_spread: f64,
}

impl SimulationParams {
    pub fn validate(&self) -> ConfigResult<()> {
        check_non_negative("elo_points_per_100", self.elo_points_per_100)?;
        check_fraction("spread_regression", self.spread_regression)?;
        if let Some(cap) = self.elo_cap {
            check_non_negative("elo_cap", cap)?;
        }
        check_fraction("stats_regression", self.stats_regression)?;
        check_non_negative("min_spread", self.min_spread)?;
        check_non_negative("max_spread", self.max_spread)?;
        if self.min_spread > self.max_spread {
            return Err(ConfigError::InvertedRange {
                name: "spread_filter",
                min: self.min_spread,
                max: self.max_spread,
            });
        }
        Ok(())
    }

    /// The prediction config these parameters describe, everything else from `base`.
    pub fn apply(&self, base: &PredictionConfig) -> PredictionConfig {
        PredictionConfig {
            elo_points_per_100: self.elo_points_per_100,
            spread_regression: self.spread_regression,
            elo_cap: self.elo_cap,
            stats_regression: self.stats_regression,
            ..base.clone()
        }
    }

    pub fn accepts_spread(&self, predicted_spread: f64) -> bool {
        let magnitude = predicted_spread.abs();
        magnitude >= self.min_spread && magnitude <= self.max_spread
    }
}

/// Process-level settings read from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub odds_api_key: Option<String>,
    pub espn_base_url: String,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:../data/linesmith.db".to_string()),
            odds_api_key: env::var("ODDS_API_KEY").ok().filter(|k| !k.trim().is_empty()),
            espn_base_url: env::var("ESPN_BASE_URL")
                .unwrap_or_else(|_| "https://site.api.espn.com/apis/site/v2/sports".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        for sport in Sport::ALL {
            assert!(ModelConfig::for_sport(sport).validate().is_ok(), "{} defaults", sport);
        }
    }

    #[test]
    fn test_negative_k_factor_rejected() {
        let mut config = EloConfig::for_sport(Sport::Nfl);
        config.k_factor = -4.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidParameter { name: "k_factor", .. })
        ));
    }

    #[test]
    fn test_small_autocorrelation_rejected() {
        let mut config = EloConfig::for_sport(Sport::Nfl);
        for c in [0.5, 1.0] {
            config.margin_of_victory.autocorrelation = c;
            assert!(matches!(
                config.validate(),
                Err(ConfigError::InvalidParameter {
                    name: "margin_of_victory.autocorrelation",
                    ..
                })
            ));
        }
        config.margin_of_victory.autocorrelation = 1.01;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let mut config = EloConfig::for_sport(Sport::Nba);
        config.bounds = Some(RatingBounds { min: 2000.0, max: 1000.0 });
        assert!(matches!(config.validate(), Err(ConfigError::InvertedRange { .. })));
    }

    #[test]
    fn test_overrides_merge_into_defaults() {
        let raw = r#"{"nfl": {"elo": {"k_factor": 25.0}, "prediction": {"elo_cap": null}}}"#;
        let config = ModelConfig::from_overrides(Sport::Nfl, raw).unwrap();
        assert_eq!(config.elo.k_factor, 25.0);
        assert_eq!(config.prediction.elo_cap, None);
        assert_eq!(config.elo.home_field_advantage, 48.0);

        // Entries for other sports leave this one untouched.
        let nba = ModelConfig::from_overrides(Sport::Nba, raw).unwrap();
        assert_eq!(nba, ModelConfig::for_sport(Sport::Nba));
    }

    #[test]
    fn test_invalid_override_rejected() {
        let raw = r#"{"nhl": {"prediction": {"stats_regression": 1.5}}}"#;
        assert!(ModelConfig::from_overrides(Sport::Nhl, raw).is_err());
    }

    #[test]
    fn test_simulation_params_filter_band() {
        let params = SimulationParams {
            elo_points_per_100: 4.0,
            spread_regression: 0.1,
            elo_cap: Some(5.0),
            stats_regression: 0.45,
            min_spread: 2.0,
            max_spread: 7.0,
        };
        assert!(params.accepts_spread(-3.5));
        assert!(params.accepts_spread(7.0));
        assert!(!params.accepts_spread(1.0));
        assert!(!params.accepts_spread(10.0));

        let inverted = SimulationParams { min_spread: 8.0, ..params };
        assert!(inverted.validate().is_err());
    }
}
