//! Fetches spreads, totals and moneylines from The Odds API and stores one
//! snapshot per bookmaker in the `odds_snapshots` table.
//!
//! ## Credit budget (500 free req / month)
//! Each `refresh_odds` call consumes at most **1 API request**. A sport is
//! skipped unless forced when:
//!   1. The last successful fetch for that sport was < 6 hours ago, OR
//!   2. There are no scheduled games for that sport in the next 3 days.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use sqlx::{Row, SqlitePool};

use crate::db::{insert_odds_snapshot, timestamp};
use crate::models::{OddsSnapshot, Sport};

const STALE_AFTER_HOURS: i64 = 6;

// ── Odds API response types ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct OddsEvent {
    pub commence_time: DateTime<Utc>,
    pub home_team: String,
    pub away_team: String,
    #[serde(default)]
    pub bookmakers: Vec<Bookmaker>,
}

#[derive(Debug, Deserialize)]
pub struct Bookmaker {
    pub key: String,
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub markets: Vec<Market>,
}

#[derive(Debug, Deserialize)]
pub struct Market {
    pub key: String,
    pub outcomes: Vec<Outcome>,
}

#[derive(Debug, Deserialize)]
pub struct Outcome {
    pub name: String,
    /// American odds.
    pub price: f64,
    pub point: Option<f64>,
}

// ── Public entry point ────────────────────────────────────────────────────────

/// Refresh odds for one sport. Returns the number of snapshots stored.
pub async fn refresh_odds(pool: &SqlitePool, api_key: &str, sport: Sport, force: bool) -> Result<u32> {
    let sport_key = sport.odds_api_key();

    if !force && !(is_stale(pool, sport_key).await && has_upcoming(pool, sport, 3).await) {
        tracing::debug!("Odds: {} fetch skipped (not stale or no upcoming games)", sport);
        return Ok(0);
    }

    let stored = fetch_sport(pool, api_key, sport).await?;
    mark_fetched(pool, sport_key).await;
    tracing::info!("Odds: {} {} snapshots stored", stored, sport);
    Ok(stored)
}

// ── Internal helpers ──────────────────────────────────────────────────────────

/// Returns true if we haven't fetched this sport_key recently.
async fn is_stale(pool: &SqlitePool, sport_key: &str) -> bool {
    let last: Option<String> = sqlx::query_scalar("SELECT last_fetched FROM odds_fetch_log WHERE sport_key = ?")
        .bind(sport_key)
        .fetch_optional(pool)
        .await
        .ok()
        .flatten();

    match last {
        None => true,
        Some(ts) => {
            let fetched = DateTime::parse_from_rfc3339(&ts)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now() - Duration::hours(STALE_AFTER_HOURS + 1));
            Utc::now().signed_duration_since(fetched) > Duration::hours(STALE_AFTER_HOURS)
        }
    }
}

async fn mark_fetched(pool: &SqlitePool, sport_key: &str) {
    let result = sqlx::query("INSERT OR REPLACE INTO odds_fetch_log (sport_key, last_fetched) VALUES (?, ?)")
        .bind(sport_key)
        .bind(timestamp(Utc::now()))
        .execute(pool)
        .await;
    if let Err(e) = result {
        tracing::warn!("Could not record odds fetch for {}: {}", sport_key, e);
    }
}

/// Returns true if there are scheduled games for `sport` starting within `days` days.
async fn has_upcoming(pool: &SqlitePool, sport: Sport, days: i64) -> bool {
    let now = Utc::now();
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM games \
         WHERE sport = ? AND status = 'scheduled' AND game_time > ? AND game_time < ?",
    )
    .bind(sport.as_str())
    .bind(timestamp(now))
    .bind(timestamp(now + Duration::days(days)))
    .fetch_one(pool)
    .await
    .unwrap_or(0);
    count > 0
}

/// Calls The Odds API for one sport and stores a snapshot per bookmaker for
/// each event that matches a stored game.
async fn fetch_sport(pool: &SqlitePool, api_key: &str, sport: Sport) -> Result<u32> {
    let url = format!(
        "https://api.the-odds-api.com/v4/sports/{}/odds/\
         ?apiKey={}&regions=us&markets=h2h,spreads,totals&oddsFormat=american&dateFormat=iso",
        sport.odds_api_key(),
        api_key
    );

    let client = reqwest::Client::new();
    let resp = client
        .get(&url)
        .timeout(std::time::Duration::from_secs(20))
        .send()
        .await?;

    let status = resp.status();
    if status == 401 {
        return Err(anyhow!("Odds API: invalid API key (401)"));
    }
    if status == 422 {
        return Err(anyhow!("Odds API: sport {} not in subscription (422)", sport.odds_api_key()));
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(anyhow!("Odds API HTTP {}: {}", status, body));
    }

    let events: Vec<OddsEvent> = resp.json().await?;
    let fetched_at = Utc::now();
    let mut stored = 0u32;

    for event in &events {
        // Match to our DB by start time window (±4 h) + team name fuzzy match
        let Some(game_id) = find_game_id(pool, sport, &event.home_team, &event.away_team, event.commence_time).await
        else {
            tracing::debug!(
                "Odds: no stored game for {} @ {} at {}",
                event.away_team,
                event.home_team,
                event.commence_time
            );
            continue;
        };

        for snapshot in snapshots_for_event(event, &game_id, fetched_at) {
            match insert_odds_snapshot(pool, &snapshot).await {
                Ok(()) => stored += 1,
                Err(e) => tracing::error!("Odds insert failed for game {}: {}", game_id, e),
            }
        }
    }

    Ok(stored)
}

/// One snapshot per bookmaker that quotes at least one line for the event.
///
/// Outcomes are picked by exact name: the API echoes the event's own team
/// strings, and same-city teams are too close for fuzzy matching here.
pub fn snapshots_for_event(event: &OddsEvent, game_id: &str, fetched_at: DateTime<Utc>) -> Vec<OddsSnapshot> {
    fn side<'a>(market: &'a Market, team: &str) -> Option<&'a Outcome> {
        market.outcomes.iter().find(|o| o.name == team)
    }

    event
        .bookmakers
        .iter()
        .filter_map(|bk| {
            let market = |key: &str| bk.markets.iter().find(|m| m.key == key);

            let home_spread = market("spreads")
                .and_then(|m| side(m, &event.home_team))
                .and_then(|o| o.point);
            let total = market("totals")
                .and_then(|m| m.outcomes.iter().find(|o| o.name.eq_ignore_ascii_case("over")))
                .and_then(|o| o.point);
            let h2h = market("h2h");
            let home_moneyline = h2h.and_then(|m| side(m, &event.home_team)).map(|o| o.price.round() as i32);
            let away_moneyline = h2h.and_then(|m| side(m, &event.away_team)).map(|o| o.price.round() as i32);

            if home_spread.is_none() && total.is_none() && home_moneyline.is_none() {
                return None;
            }

            Some(OddsSnapshot {
                game_id: game_id.to_string(),
                bookmaker: bk.key.clone(),
                fetched_at: bk.last_update.unwrap_or(fetched_at),
                home_spread,
                total,
                home_moneyline,
                away_moneyline,
            })
        })
        .collect()
}

/// Find our internal game id by matching team names and start time. When
/// several stored games qualify, the best combined name score wins.
async fn find_game_id(
    pool: &SqlitePool,
    sport: Sport,
    home_team: &str,
    away_team: &str,
    commence_time: DateTime<Utc>,
) -> Option<String> {
    let window_start = timestamp(commence_time - Duration::hours(4));
    let window_end = timestamp(commence_time + Duration::hours(4));

    let rows = sqlx::query(
        "SELECT id, home_team_name, away_team_name FROM games \
         WHERE sport = ? AND status = 'scheduled' AND game_time BETWEEN ? AND ?",
    )
    .bind(sport.as_str())
    .bind(&window_start)
    .bind(&window_end)
    .fetch_all(pool)
    .await
    .ok()?;

    let candidates: Vec<(String, String, String)> = rows
        .iter()
        .map(|row| (row.get("id"), row.get("home_team_name"), row.get("away_team_name")))
        .collect();
    best_game_match(&candidates, home_team, away_team)
}

/// Pick the `(id, home, away)` candidate whose names both match, highest
/// combined score first.
fn best_game_match(candidates: &[(String, String, String)], home_team: &str, away_team: &str) -> Option<String> {
    candidates
        .iter()
        .filter_map(|(id, db_home, db_away)| {
            let home = name_score(db_home, home_team)?;
            let away = name_score(db_away, away_team)?;
            Some((id, home + away))
        })
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(id, _)| id.clone())
}

// City and school shorthands feeds disagree on.
const ALIASES: &[(&str, &str)] = &[
    ("la", "los angeles"),
    ("ny", "new york"),
    ("nj", "new jersey"),
    ("gs", "golden state"),
    ("okc", "oklahoma city"),
    ("saint", "st"),
    ("state", "st"),
    ("univ", "university"),
];

fn normalize(s: &str) -> String {
    let cleaned: String = s
        .to_lowercase()
        .replace('&', " and ")
        .replace('-', " ")
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    cleaned
        .split_whitespace()
        .map(|word| {
            ALIASES
                .iter()
                .find(|(short, _)| *short == word)
                .map_or(word, |(_, long)| *long)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// True when `phrase` appears in `text` as whole words.
fn contains_phrase(text: &str, phrase: &str) -> bool {
    let text_words: Vec<&str> = text.split_whitespace().collect();
    let phrase_words: Vec<&str> = phrase.split_whitespace().collect();
    !phrase_words.is_empty() && text_words.windows(phrase_words.len()).any(|window| window == phrase_words.as_slice())
}

/// How confidently two feeds' names refer to the same team, or `None`.
///
/// Exact names score 1.0 and one name contained in the other as whole words
/// ("Chiefs" in "Kansas City Chiefs") 0.9. Otherwise the nicknames (last
/// words) must agree before the full names are compared by Jaro-Winkler, so
/// "Los Angeles Lakers" never matches "Los Angeles Clippers".
pub fn name_score(a: &str, b: &str) -> Option<f64> {
    let a = normalize(a);
    let b = normalize(b);
    if a.is_empty() || b.is_empty() {
        return None;
    }
    if a == b {
        return Some(1.0);
    }
    if contains_phrase(&a, &b) || contains_phrase(&b, &a) {
        return Some(0.9);
    }

    let nickname_a = a.split_whitespace().last()?;
    let nickname_b = b.split_whitespace().last()?;
    if strsim::jaro_winkler(nickname_a, nickname_b) < 0.95 {
        return None;
    }
    let score = strsim::jaro_winkler(&a, &b);
    (score >= 0.93).then_some(score * 0.85)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names_match(a: &str, b: &str) -> bool {
        name_score(a, b).is_some()
    }

    const EVENT: &str = r#"{
        "id": "e912304de2b2ce35b473ce2ecd3d1502",
        "commence_time": "2024-09-06T00:20:00Z",
        "home_team": "Kansas City Chiefs",
        "away_team": "Baltimore Ravens",
        "bookmakers": [
            {
                "key": "draftkings",
                "last_update": "2024-09-05T20:00:00Z",
                "markets": [
                    {"key": "h2h", "outcomes": [
                        {"name": "Baltimore Ravens", "price": 124},
                        {"name": "Kansas City Chiefs", "price": -148}
                    ]},
                    {"key": "spreads", "outcomes": [
                        {"name": "Baltimore Ravens", "price": -110, "point": 3.0},
                        {"name": "Kansas City Chiefs", "price": -110, "point": -3.0}
                    ]},
                    {"key": "totals", "outcomes": [
                        {"name": "Over", "price": -110, "point": 46.5},
                        {"name": "Under", "price": -110, "point": 46.5}
                    ]}
                ]
            },
            {"key": "emptybook", "markets": []}
        ]
    }"#;

    #[test]
    fn test_snapshot_per_bookmaker() {
        let event: OddsEvent = serde_json::from_str(EVENT).unwrap();
        let snapshots = snapshots_for_event(&event, "nfl_1", Utc::now());

        assert_eq!(snapshots.len(), 1);
        let dk = &snapshots[0];
        assert_eq!(dk.bookmaker, "draftkings");
        assert_eq!(dk.home_spread, Some(-3.0));
        assert_eq!(dk.total, Some(46.5));
        assert_eq!(dk.home_moneyline, Some(-148));
        assert_eq!(dk.away_moneyline, Some(124));
        assert_eq!(dk.fetched_at, event.bookmakers[0].last_update.unwrap());
    }

    #[test]
    fn test_names_match() {
        assert!(names_match("Montréal Canadiens", "Montreal Canadiens"));
        assert!(names_match("St. Louis Blues", "St Louis Blues"));
        assert!(names_match("Kansas City Chiefs", "kansas city chiefs"));
        assert!(names_match("Chiefs", "Kansas City Chiefs"));
        assert!(names_match("LA Clippers", "Los Angeles Clippers"));
        assert!(!names_match("New York Giants", "New York Jets"));
        assert!(!names_match("", "Chiefs"));
    }

    #[test]
    fn test_same_city_teams_do_not_match() {
        assert!(!names_match("Los Angeles Lakers", "Los Angeles Clippers"));
        assert!(!names_match("LA Clippers", "Los Angeles Lakers"));
        assert!(!names_match("New York Rangers", "New York Islanders"));
        assert!(!names_match("Los Angeles Rams", "Los Angeles Chargers"));
    }

    #[test]
    fn test_same_city_outcomes_keep_home_sign() {
        let raw = r#"{
            "commence_time": "2024-11-01T02:30:00Z",
            "home_team": "Los Angeles Lakers",
            "away_team": "Los Angeles Clippers",
            "bookmakers": [{
                "key": "fanduel",
                "markets": [
                    {"key": "h2h", "outcomes": [
                        {"name": "Los Angeles Clippers", "price": -180},
                        {"name": "Los Angeles Lakers", "price": 150}
                    ]},
                    {"key": "spreads", "outcomes": [
                        {"name": "Los Angeles Clippers", "price": -110, "point": -4.5},
                        {"name": "Los Angeles Lakers", "price": -110, "point": 4.5}
                    ]}
                ]
            }]
        }"#;
        let event: OddsEvent = serde_json::from_str(raw).unwrap();
        let snapshots = snapshots_for_event(&event, "nba_1", Utc::now());

        assert_eq!(snapshots[0].home_spread, Some(4.5));
        assert_eq!(snapshots[0].home_moneyline, Some(150));
        assert_eq!(snapshots[0].away_moneyline, Some(-180));
    }

    #[test]
    fn test_best_game_match_picks_right_same_city_game() {
        let candidates = vec![
            (
                "nba_clippers".to_string(),
                "LA Clippers".to_string(),
                "Denver Nuggets".to_string(),
            ),
            (
                "nba_lakers".to_string(),
                "Los Angeles Lakers".to_string(),
                "Denver Nuggets".to_string(),
            ),
        ];
        assert_eq!(
            best_game_match(&candidates, "Los Angeles Lakers", "Denver Nuggets").as_deref(),
            Some("nba_lakers")
        );
        assert_eq!(
            best_game_match(&candidates, "Los Angeles Clippers", "Denver Nuggets").as_deref(),
            Some("nba_clippers")
        );
        assert_eq!(best_game_match(&candidates, "Boston Celtics", "Denver Nuggets"), None);
    }

    #[test]
    fn test_exact_name_outranks_containment() {
        let exact = name_score("Kansas City Chiefs", "Kansas City Chiefs").unwrap();
        let contained = name_score("Chiefs", "Kansas City Chiefs").unwrap();
        assert!(exact > contained);
    }
}
