use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sport {
    Nfl,
    Nba,
    Nhl,
    Cbb,
}

impl Sport {
    pub const ALL: [Sport; 4] = [Sport::Nfl, Sport::Nba, Sport::Nhl, Sport::Cbb];

    pub fn as_str(&self) -> &'static str {
        match self {
            Sport::Nfl => "nfl",
            Sport::Nba => "nba",
            Sport::Nhl => "nhl",
            Sport::Cbb => "cbb",
        }
    }

    /// Path segment of the ESPN site API scoreboard for this sport.
    pub fn espn_path(&self) -> &'static str {
        match self {
            Sport::Nfl => "football/nfl",
            Sport::Nba => "basketball/nba",
            Sport::Nhl => "hockey/nhl",
            Sport::Cbb => "basketball/mens-college-basketball",
        }
    }

    /// Sport key used by The Odds API.
    pub fn odds_api_key(&self) -> &'static str {
        match self {
            Sport::Nfl => "americanfootball_nfl",
            Sport::Nba => "basketball_nba",
            Sport::Nhl => "icehockey_nhl",
            Sport::Cbb => "basketball_ncaab",
        }
    }

    /// Weather only matters for sports played outside.
    pub fn is_outdoor(&self) -> bool {
        matches!(self, Sport::Nfl)
    }
}

impl fmt::Display for Sport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Sport {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "nfl" | "football" => Ok(Sport::Nfl),
            "nba" => Ok(Sport::Nba),
            "nhl" | "hockey" => Ok(Sport::Nhl),
            "cbb" | "ncaab" | "college-basketball" => Ok(Sport::Cbb),
            other => Err(ConfigError::UnknownSport(other.to_string())),
        }
    }
}

/// Lifecycle of a game. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Scheduled,
    InProgress,
    Final,
}

impl GameStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameStatus::Scheduled => "scheduled",
            GameStatus::InProgress => "in_progress",
            GameStatus::Final => "final",
        }
    }

    pub fn can_transition_to(&self, next: GameStatus) -> bool {
        next >= *self
    }
}

impl FromStr for GameStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(GameStatus::Scheduled),
            "in_progress" => Ok(GameStatus::InProgress),
            "final" => Ok(GameStatus::Final),
            other => Err(format!("unknown game status: {}", other)),
        }
    }
}

/// Whether a game has been folded into the ratings yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EloState {
    #[default]
    Unprocessed,
    Processed,
}

impl EloState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EloState::Unprocessed => "unprocessed",
            EloState::Processed => "processed",
        }
    }
}

impl FromStr for EloState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unprocessed" => Ok(EloState::Unprocessed),
            "processed" => Ok(EloState::Processed),
            other => Err(format!("unknown elo state: {}", other)),
        }
    }
}

/// Cumulative scoring totals for one team.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoringStats {
    pub points_for: i64,
    pub points_against: i64,
    pub games_played: u32,
}

impl ScoringStats {
    pub fn record(&mut self, scored: i32, allowed: i32) {
        self.points_for += i64::from(scored);
        self.points_against += i64::from(allowed);
        self.games_played += 1;
    }

    /// `None` until the team has played.
    pub fn ppg(&self) -> Option<f64> {
        (self.games_played > 0).then(|| self.points_for as f64 / f64::from(self.games_played))
    }

    pub fn ppg_allowed(&self) -> Option<f64> {
        (self.games_played > 0).then(|| self.points_against as f64 / f64::from(self.games_played))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    pub sport: Sport,
    pub name: String,
    pub abbreviation: String,
    pub rating: f64,
    #[serde(flatten)]
    pub stats: ScoringStats,
    pub updated_at: DateTime<Utc>,
}

impl Team {
    pub fn profile(&self) -> TeamProfile {
        TeamProfile {
            id: self.id.clone(),
            rating: self.rating,
            stats: self.stats,
        }
    }
}

/// What the predictor needs to know about one side of a matchup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamProfile {
    pub id: String,
    pub rating: f64,
    #[serde(default)]
    pub stats: ScoringStats,
}

impl TeamProfile {
    /// Stand-in for a team the store has never seen.
    pub fn unknown(id: &str, initial_rating: f64) -> Self {
        Self {
            id: id.to_string(),
            rating: initial_rating,
            stats: ScoringStats::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Game {
    pub id: String,
    pub sport: Sport,
    pub home_team_id: String,
    pub away_team_id: String,
    pub home_team_name: String,
    pub away_team_name: String,
    pub game_time: DateTime<Utc>,
    pub status: GameStatus,
    pub home_score: Option<i32>,
    pub away_score: Option<i32>,
    pub elo_state: EloState,
    pub season: Option<String>,
    pub week: Option<i32>,
    pub venue: Option<String>,
    pub neutral_site: bool,
    /// Closing home spread, when one was recorded. Used for backtests.
    pub market_spread: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl Game {
    /// Final score, only for games that are final and carry both scores.
    pub fn final_score(&self) -> Option<(i32, i32)> {
        match (self.status, self.home_score, self.away_score) {
            (GameStatus::Final, Some(home), Some(away)) if home >= 0 && away >= 0 => Some((home, away)),
            _ => None,
        }
    }

    /// A game marked final whose score is missing or negative.
    pub fn is_malformed_final(&self) -> bool {
        self.status == GameStatus::Final && self.final_score().is_none()
    }
}

/// One bookmaker's lines for one game at one moment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddsSnapshot {
    pub game_id: String,
    pub bookmaker: String,
    pub fetched_at: DateTime<Utc>,
    /// Home spread, negative when home is favoured.
    pub home_spread: Option<f64>,
    pub total: Option<f64>,
    pub home_moneyline: Option<i32>,
    pub away_moneyline: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusOdds {
    pub home_spread: Option<f64>,
    pub total: Option<f64>,
    pub home_moneyline: Option<i32>,
    pub away_moneyline: Option<i32>,
    pub bookmakers: usize,
    pub as_of: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GamePrediction {
    pub id: String,
    pub game_id: String,
    pub home_team_id: String,
    pub away_team_id: String,
    pub predicted_home_score: f64,
    pub predicted_away_score: f64,
    /// Away minus home; negative favours the home side.
    pub predicted_spread: f64,
    pub predicted_total: f64,
    pub home_win_probability: f64,
    pub confidence: f64,
    pub market_spread: Option<f64>,
    pub market_total: Option<f64>,
    pub edge_spread: Option<f64>,
    pub edge_total: Option<f64>,
    pub model_version: String,
    pub created_at: DateTime<Utc>,
}

impl GamePrediction {
    /// Rejects rows written by an older schema or a broken run.
    pub fn is_valid(&self) -> bool {
        [
            self.predicted_home_score,
            self.predicted_away_score,
            self.predicted_spread,
            self.predicted_total,
            self.confidence,
        ]
        .iter()
        .all(|v| v.is_finite())
            && (0.0..=1.0).contains(&self.home_win_probability)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EloHistoryPoint {
    pub team_id: String,
    pub date: DateTime<Utc>,
    pub rating: f64,
    pub game_id: Option<String>,
}

// Contextual adjustments

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeatherReport {
    pub temperature_f: Option<f64>,
    pub wind_mph: Option<f64>,
    #[serde(default)]
    pub precipitation: bool,
    #[serde(default)]
    pub is_dome: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjuryStatus {
    Out,
    Doubtful,
    Questionable,
}

impl InjuryStatus {
    pub fn weight(&self) -> f64 {
        match self {
            InjuryStatus::Out => 1.0,
            InjuryStatus::Doubtful => 0.75,
            InjuryStatus::Questionable => 0.25,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjuryImpact {
    StartingQuarterback,
    KeyPlayer,
    Starter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjuryReport {
    pub team_id: String,
    pub player: String,
    pub status: InjuryStatus,
    pub impact: InjuryImpact,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameContext {
    #[serde(default)]
    pub neutral_site: bool,
    pub weather: Option<WeatherReport>,
    #[serde(default)]
    pub injuries: Vec<InjuryReport>,
}

// Edges and recommendations

/// Model minus market, in points.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Edge {
    pub spread: Option<f64>,
    pub total: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeStrength {
    Weak,
    Moderate,
    Strong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pick {
    Home,
    Away,
    Over,
    Under,
}

impl fmt::Display for Pick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Pick::Home => "home",
            Pick::Away => "away",
            Pick::Over => "over",
            Pick::Under => "under",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub pick: Pick,
    /// Market line the pick is taken at (home spread or total).
    pub line: f64,
    pub edge: f64,
    pub strength: EdgeStrength,
    pub cover_probability: f64,
    /// Fraction of bankroll, already scaled by the configured Kelly fraction.
    pub stake_fraction: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeReport {
    pub prediction: GamePrediction,
    pub consensus: Option<ConsensusOdds>,
    pub edge: Edge,
    pub recommendation: Option<Recommendation>,
}

// API Response types
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: Utc::now(),
        }
    }
}


#[cfg(test)]
pub(crate) mod fixtures;
