use chrono::{DateTime, Duration, TimeZone, Utc};

use super::{EloState, Game, GameStatus, ScoringStats, Sport, Team};

pub(crate) fn kickoff(day: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 5, 0, 0, 0).unwrap() + Duration::days(day)
}

pub(crate) fn final_game(id: &str, home: &str, away: &str, day: i64, home_score: i32, away_score: i32) -> Game {
    Game {
        status: GameStatus::Final,
        home_score: Some(home_score),
        away_score: Some(away_score),
        ..scheduled_game(id, home, away, day)
    }
}

pub(crate) fn scheduled_game(id: &str, home: &str, away: &str, day: i64) -> Game {
    Game {
        id: id.to_string(),
        sport: Sport::Nfl,
        home_team_id: home.to_string(),
        away_team_id: away.to_string(),
        home_team_name: home.to_uppercase(),
        away_team_name: away.to_uppercase(),
        game_time: kickoff(day),
        status: GameStatus::Scheduled,
        home_score: None,
        away_score: None,
        elo_state: EloState::Unprocessed,
        season: Some("2024".to_string()),
        week: None,
        venue: None,
        neutral_site: false,
        market_spread: None,
        updated_at: kickoff(day),
    }
}

pub(crate) fn team(id: &str, rating: f64, points_for: i64, points_against: i64, games_played: u32) -> Team {
    Team {
        id: id.to_string(),
        sport: Sport::Nfl,
        name: id.to_uppercase(),
        abbreviation: id.to_uppercase(),
        rating,
        stats: ScoringStats {
            points_for,
            points_against,
            games_played,
        },
        updated_at: kickoff(0),
    }
}
