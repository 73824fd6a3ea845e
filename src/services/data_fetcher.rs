use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use sqlx::SqlitePool;

use crate::config::Settings;
use crate::db::{upsert_game, upsert_team};
use crate::models::{EloState, Game, GameStatus, ScoringStats, Sport, Team};

// ── ESPN scoreboard structures ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct EspnScoreboard {
    #[serde(default)]
    pub events: Vec<EspnEvent>,
}

#[derive(Debug, Deserialize)]
pub struct EspnEvent {
    pub id: String,
    pub date: String,
    pub season: Option<EspnSeason>,
    pub week: Option<EspnWeek>,
    #[serde(default)]
    pub competitions: Vec<EspnCompetition>,
}

#[derive(Debug, Deserialize)]
pub struct EspnSeason {
    pub year: i32,
}

#[derive(Debug, Deserialize)]
pub struct EspnWeek {
    pub number: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EspnCompetition {
    #[serde(default)]
    pub neutral_site: bool,
    pub venue: Option<EspnVenue>,
    #[serde(default)]
    pub competitors: Vec<EspnCompetitor>,
    pub status: EspnStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EspnVenue {
    pub full_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EspnCompetitor {
    pub home_away: String,
    pub score: Option<String>,
    pub team: EspnTeam,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EspnTeam {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub abbreviation: String,
}

#[derive(Debug, Deserialize)]
pub struct EspnStatus {
    #[serde(rename = "type")]
    pub kind: EspnStatusType,
}

#[derive(Debug, Deserialize)]
pub struct EspnStatusType {
    pub state: String,
    #[serde(default)]
    pub completed: bool,
}

/// What one sync wrote to the store.
#[derive(Debug, Default, Clone, Copy)]
pub struct FetchSummary {
    pub teams: usize,
    pub games: usize,
    /// Updates refused because they would move a game's status backwards.
    pub refused: usize,
}

// ── DataFetcher ──────────────────────────────────────────────────────────────

pub struct DataFetcher {
    client: Client,
    base_url: String,
}

impl DataFetcher {
    pub fn new(settings: &Settings) -> Self {
        Self {
            client: Client::new(),
            base_url: settings.espn_base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Download the scoreboard for an inclusive date range.
    pub async fn fetch_scoreboard(&self, sport: Sport, from: NaiveDate, to: NaiveDate) -> Result<EspnScoreboard> {
        let url = format!(
            "{}/{}/scoreboard?dates={}-{}&limit=1000",
            self.base_url,
            sport.espn_path(),
            from.format("%Y%m%d"),
            to.format("%Y%m%d")
        );

        // Retry up to 3 times on 429 with exponential backoff
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let resp = self.client.get(&url).send().await?;

            if resp.status() == 429 {
                let wait = 2u64.pow(attempts) * 5; // 10s, 20s, 40s
                tracing::warn!("ESPN 429 rate-limited, waiting {}s (attempt {})", wait, attempts);
                if attempts >= 3 {
                    return Err(anyhow!("ESPN rate limit exceeded after {} attempts", attempts));
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(wait)).await;
                continue;
            }

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(anyhow!("ESPN {} scoreboard error {}: {}", sport, status, body));
            }

            return Ok(resp.json().await?);
        }
    }

    /// Pull the last `days_back` days plus the coming week and store teams
    /// and games.
    pub async fn sync_recent(
        &self,
        pool: &SqlitePool,
        sport: Sport,
        days_back: i64,
        initial_rating: f64,
    ) -> Result<FetchSummary> {
        let today = Utc::now().date_naive();
        let from = today - Duration::days(days_back);
        let to = today + Duration::days(7);
        tracing::info!("Fetching {} scoreboard {} to {}", sport, from, to);

        let scoreboard = self.fetch_scoreboard(sport, from, to).await?;
        let mut summary = FetchSummary::default();

        for event in &scoreboard.events {
            let Some((home, away, game)) = parse_event(sport, event, initial_rating) else {
                tracing::warn!("Skipping unparseable {} event {}", sport, event.id);
                continue;
            };

            upsert_team(pool, &home).await?;
            upsert_team(pool, &away).await?;
            summary.teams += 2;

            if upsert_game(pool, &game).await? {
                summary.games += 1;
            } else {
                summary.refused += 1;
            }
        }

        tracing::info!(
            "Stored {} {} games ({} stale updates refused)",
            summary.games,
            sport,
            summary.refused
        );
        Ok(summary)
    }
}

/// ESPN dates come as full RFC 3339 or without seconds ("2024-09-06T00:20Z").
fn parse_espn_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc3339(raw) {
        return Some(date.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%MZ")
        .ok()
        .map(|naive| naive.and_utc())
}

fn status_of(kind: &EspnStatusType) -> GameStatus {
    match kind.state.as_str() {
        "post" if kind.completed => GameStatus::Final,
        "in" => GameStatus::InProgress,
        // "pre", plus postponed or cancelled games reported as "post"
        _ => GameStatus::Scheduled,
    }
}

/// Turn one scoreboard event into its two teams and the game.
pub fn parse_event(sport: Sport, event: &EspnEvent, initial_rating: f64) -> Option<(Team, Team, Game)> {
    let competition = event.competitions.first()?;
    let home = competition.competitors.iter().find(|c| c.home_away == "home")?;
    let away = competition.competitors.iter().find(|c| c.home_away == "away")?;
    let game_time = parse_espn_date(&event.date)?;
    let status = status_of(&competition.status.kind);
    let now = Utc::now();

    let team = |c: &EspnCompetitor| Team {
        id: format!("{}_{}", sport, c.team.id),
        sport,
        name: c.team.display_name.clone(),
        abbreviation: c.team.abbreviation.clone(),
        rating: initial_rating,
        stats: ScoringStats::default(),
        updated_at: now,
    };
    // Live scores are not stored; only final ones feed the ratings.
    let score = |c: &EspnCompetitor| {
        (status == GameStatus::Final)
            .then(|| c.score.as_deref().and_then(|s| s.trim().parse::<i32>().ok()))
            .flatten()
    };

    let game = Game {
        id: format!("{}_{}", sport, event.id),
        sport,
        home_team_id: format!("{}_{}", sport, home.team.id),
        away_team_id: format!("{}_{}", sport, away.team.id),
        home_team_name: home.team.display_name.clone(),
        away_team_name: away.team.display_name.clone(),
        game_time,
        status,
        home_score: score(home),
        away_score: score(away),
        elo_state: EloState::Unprocessed,
        season: event.season.as_ref().map(|s| s.year.to_string()),
        week: event.week.as_ref().map(|w| w.number),
        venue: competition.venue.as_ref().map(|v| v.full_name.clone()),
        neutral_site: competition.neutral_site,
        market_spread: None,
        updated_at: now,
    };

    Some((team(home), team(away), game))
}
