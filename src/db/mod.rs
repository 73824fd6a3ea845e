use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use crate::models::*;

pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    // Strip the "sqlite:" prefix to get the file path, create parent dir if needed
    let file_path = database_url
        .strip_prefix("sqlite:///")
        .or_else(|| database_url.strip_prefix("sqlite://"))
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url);

    if let Some(parent) = std::path::Path::new(file_path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

    let pool = SqlitePool::connect_with(options).await?;
    Ok(pool)
}

/// Called from the CLI where no pool exists yet.
pub async fn init_database(database_url: &str) -> Result<()> {
    let pool = create_pool(database_url).await?;
    init_database_with_pool(&pool).await
}

/// Called from the server so schema creation shares the main pool.
pub async fn init_database_with_pool(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS teams (
            id TEXT PRIMARY KEY,
            sport TEXT NOT NULL,
            name TEXT NOT NULL,
            abbreviation TEXT NOT NULL DEFAULT '',
            rating REAL NOT NULL DEFAULT 1500.0,
            points_for INTEGER NOT NULL DEFAULT 0,
            points_against INTEGER NOT NULL DEFAULT 0,
            games_played INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS games (
            id TEXT PRIMARY KEY,
            sport TEXT NOT NULL,
            home_team_id TEXT NOT NULL,
            away_team_id TEXT NOT NULL,
            home_team_name TEXT NOT NULL,
            away_team_name TEXT NOT NULL,
            game_time TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'scheduled',
            home_score INTEGER,
            away_score INTEGER,
            elo_state TEXT NOT NULL DEFAULT 'unprocessed',
            season TEXT,
            week INTEGER,
            venue TEXT,
            neutral_site INTEGER NOT NULL DEFAULT 0,
            market_spread REAL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS odds_snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            game_id TEXT NOT NULL,
            bookmaker TEXT NOT NULL,
            fetched_at TEXT NOT NULL,
            home_spread REAL,
            total REAL,
            home_moneyline INTEGER,
            away_moneyline INTEGER,
            UNIQUE (game_id, bookmaker, fetched_at),
            FOREIGN KEY (game_id) REFERENCES games (id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS predictions (
            id TEXT PRIMARY KEY,
            game_id TEXT NOT NULL,
            home_team_id TEXT NOT NULL,
            away_team_id TEXT NOT NULL,
            predicted_home_score REAL NOT NULL,
            predicted_away_score REAL NOT NULL,
            predicted_spread REAL NOT NULL,
            predicted_total REAL NOT NULL,
            home_win_probability REAL NOT NULL,
            confidence REAL NOT NULL,
            market_spread REAL,
            market_total REAL,
            edge_spread REAL,
            edge_total REAL,
            model_version TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (game_id) REFERENCES games (id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS elo_history (
            id TEXT PRIMARY KEY,
            team_id TEXT NOT NULL,
            date TEXT NOT NULL,
            rating REAL NOT NULL,
            game_id TEXT,
            FOREIGN KEY (team_id) REFERENCES teams (id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // odds_fetch_log: tracks last successful API call per sport_key to avoid burning quota
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS odds_fetch_log (
            sport_key    TEXT PRIMARY KEY,
            last_fetched TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_games_sport_time ON games(sport, game_time)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_games_status ON games(status, elo_state)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_odds_game ON odds_snapshots(game_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_predictions_game ON predictions(game_id, created_at)")
        .execute(pool)
        .await?;

    tracing::info!("Database initialized successfully");
    Ok(())
}

/// Single-connection in-memory database with the schema applied.
#[cfg(test)]
pub async fn memory_pool() -> Result<SqlitePool> {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    init_database_with_pool(&pool).await?;
    Ok(pool)
}

pub(crate) fn timestamp(date: DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn team_from_row(row: &SqliteRow) -> Result<Team> {
    Ok(Team {
        id: row.get("id"),
        sport: row.get::<String, _>("sport").parse()?,
        name: row.get("name"),
        abbreviation: row.get("abbreviation"),
        rating: row.get("rating"),
        stats: ScoringStats {
            points_for: row.get("points_for"),
            points_against: row.get("points_against"),
            games_played: row.get::<i64, _>("games_played").max(0) as u32,
        },
        updated_at: parse_timestamp(&row.get::<String, _>("updated_at"))?,
    })
}

fn game_from_row(row: &SqliteRow) -> Result<Game> {
    Ok(Game {
        id: row.get("id"),
        sport: row.get::<String, _>("sport").parse()?,
        home_team_id: row.get("home_team_id"),
        away_team_id: row.get("away_team_id"),
        home_team_name: row.get("home_team_name"),
        away_team_name: row.get("away_team_name"),
        game_time: parse_timestamp(&row.get::<String, _>("game_time"))?,
        status: row.get::<String, _>("status").parse().map_err(|e: String| anyhow!(e))?,
        home_score: row.get("home_score"),
        away_score: row.get("away_score"),
        elo_state: row.get::<String, _>("elo_state").parse().map_err(|e: String| anyhow!(e))?,
        season: row.get("season"),
        week: row.get("week"),
        venue: row.get("venue"),
        neutral_site: row.get("neutral_site"),
        market_spread: row.get("market_spread"),
        updated_at: parse_timestamp(&row.get::<String, _>("updated_at"))?,
    })
}

fn prediction_from_row(row: &SqliteRow) -> Result<GamePrediction> {
    Ok(GamePrediction {
        id: row.try_get("id")?,
        game_id: row.try_get("game_id")?,
        home_team_id: row.try_get("home_team_id")?,
        away_team_id: row.try_get("away_team_id")?,
        predicted_home_score: row.try_get("predicted_home_score")?,
        predicted_away_score: row.try_get("predicted_away_score")?,
        predicted_spread: row.try_get("predicted_spread")?,
        predicted_total: row.try_get("predicted_total")?,
        home_win_probability: row.try_get("home_win_probability")?,
        confidence: row.try_get("confidence")?,
        market_spread: row.try_get("market_spread")?,
        market_total: row.try_get("market_total")?,
        edge_spread: row.try_get("edge_spread")?,
        edge_total: row.try_get("edge_total")?,
        model_version: row.try_get("model_version")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
    })
}

// Team operations

/// Insert a team, or refresh its display fields. Rating and scoring totals
/// of an existing team are left alone.
pub async fn upsert_team(pool: &SqlitePool, team: &Team) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO teams
        (id, sport, name, abbreviation, rating, points_for, points_against, games_played, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name         = excluded.name,
            abbreviation = excluded.abbreviation,
            updated_at   = excluded.updated_at
        "#,
    )
    .bind(&team.id)
    .bind(team.sport.as_str())
    .bind(&team.name)
    .bind(&team.abbreviation)
    .bind(team.rating)
    .bind(team.stats.points_for)
    .bind(team.stats.points_against)
    .bind(i64::from(team.stats.games_played))
    .bind(timestamp(team.updated_at))
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_team_by_id(pool: &SqlitePool, team_id: &str) -> Result<Option<Team>> {
    let row = sqlx::query("SELECT * FROM teams WHERE id = ?")
        .bind(team_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(team_from_row).transpose()
}

/// All teams of a sport, strongest first.
pub async fn get_teams(pool: &SqlitePool, sport: Sport) -> Result<Vec<Team>> {
    let rows = sqlx::query("SELECT * FROM teams WHERE sport = ? ORDER BY rating DESC, name")
        .bind(sport.as_str())
        .fetch_all(pool)
        .await?;

    rows.iter().map(team_from_row).collect()
}

pub async fn find_teams_by_name(pool: &SqlitePool, name: &str) -> Result<Vec<Team>> {
    let rows = sqlx::query(
        "SELECT * FROM teams WHERE LOWER(name) LIKE LOWER(?) OR LOWER(abbreviation) = LOWER(?) ORDER BY name",
    )
    .bind(format!("%{}%", name))
    .bind(name)
    .fetch_all(pool)
    .await?;

    rows.iter().map(team_from_row).collect()
}

// Game operations

/// Insert or update a game. A stored status never moves backwards, and the
/// stored Elo state is kept. Returns false when the update was refused.
pub async fn upsert_game(pool: &SqlitePool, game: &Game) -> Result<bool> {
    if let Some(existing) = get_game(pool, &game.id).await? {
        if !existing.status.can_transition_to(game.status) {
            tracing::warn!(
                "Ignoring {} -> {} status regression for game {}",
                existing.status.as_str(),
                game.status.as_str(),
                game.id
            );
            return Ok(false);
        }

        if existing.elo_state == EloState::Processed
            && (existing.home_score != game.home_score || existing.away_score != game.away_score)
        {
            tracing::warn!(
                "Score changed for already-rated game {}; run a full recalculation to apply it",
                game.id
            );
        }
    }

    sqlx::query(
        r#"
        INSERT INTO games
        (id, sport, home_team_id, away_team_id, home_team_name, away_team_name, game_time, status,
         home_score, away_score, elo_state, season, week, venue, neutral_site, market_spread, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            home_team_name = excluded.home_team_name,
            away_team_name = excluded.away_team_name,
            game_time      = excluded.game_time,
            status         = excluded.status,
            home_score     = excluded.home_score,
            away_score     = excluded.away_score,
            season         = excluded.season,
            week           = excluded.week,
            venue          = excluded.venue,
            neutral_site   = excluded.neutral_site,
            market_spread  = COALESCE(excluded.market_spread, games.market_spread),
            updated_at     = excluded.updated_at
        "#,
    )
    .bind(&game.id)
    .bind(game.sport.as_str())
    .bind(&game.home_team_id)
    .bind(&game.away_team_id)
    .bind(&game.home_team_name)
    .bind(&game.away_team_name)
    .bind(timestamp(game.game_time))
    .bind(game.status.as_str())
    .bind(game.home_score)
    .bind(game.away_score)
    .bind(game.elo_state.as_str())
    .bind(&game.season)
    .bind(game.week)
    .bind(&game.venue)
    .bind(game.neutral_site)
    .bind(game.market_spread)
    .bind(timestamp(game.updated_at))
    .execute(pool)
    .await?;

    Ok(true)
}

pub async fn get_game(pool: &SqlitePool, game_id: &str) -> Result<Option<Game>> {
    let row = sqlx::query("SELECT * FROM games WHERE id = ?")
        .bind(game_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(game_from_row).transpose()
}

/// Every final game of a sport in replay order.
pub async fn get_completed_games_ordered(pool: &SqlitePool, sport: Sport) -> Result<Vec<Game>> {
    let rows = sqlx::query("SELECT * FROM games WHERE sport = ? AND status = 'final' ORDER BY game_time ASC, id ASC")
        .bind(sport.as_str())
        .fetch_all(pool)
        .await?;

    rows.iter().map(game_from_row).collect()
}

/// Final games not yet folded into the ratings, in replay order.
pub async fn get_pending_games(pool: &SqlitePool, sport: Sport) -> Result<Vec<Game>> {
    let rows = sqlx::query(
        r#"SELECT * FROM games
           WHERE sport = ? AND status = 'final' AND elo_state = 'unprocessed'
           ORDER BY game_time ASC, id ASC"#,
    )
    .bind(sport.as_str())
    .fetch_all(pool)
    .await?;

    rows.iter().map(game_from_row).collect()
}

pub async fn get_upcoming_games(pool: &SqlitePool, sport: Option<Sport>, limit: i64) -> Result<Vec<Game>> {
    let query = if sport.is_some() {
        "SELECT * FROM games WHERE status = 'scheduled' AND game_time > ? AND sport = ? ORDER BY game_time LIMIT ?"
    } else {
        "SELECT * FROM games WHERE status = 'scheduled' AND game_time > ? ORDER BY game_time LIMIT ?"
    };

    let mut query_builder = sqlx::query(query).bind(timestamp(Utc::now()));
    if let Some(sport) = sport {
        query_builder = query_builder.bind(sport.as_str());
    }

    let rows = query_builder.bind(limit).fetch_all(pool).await?;
    rows.iter().map(game_from_row).collect()
}

pub async fn get_team_recent_games(pool: &SqlitePool, team_id: &str, limit: i64) -> Result<Vec<Game>> {
    let rows = sqlx::query(
        r#"SELECT * FROM games
           WHERE (home_team_id = ? OR away_team_id = ?) AND status = 'final'
           ORDER BY game_time DESC LIMIT ?"#,
    )
    .bind(team_id)
    .bind(team_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(game_from_row).collect()
}

// Rating store operations

/// New rating and scoring totals for one team.
#[derive(Debug, Clone)]
pub struct RatingWrite {
    pub team_id: String,
    pub rating: f64,
    pub stats: ScoringStats,
    pub updated_at: DateTime<Utc>,
}

/// Write ratings, processed flags and rating history in one transaction,
/// so an interrupted run leaves either all of it or none of it.
pub async fn apply_rating_batch(
    pool: &SqlitePool,
    sport: Sport,
    writes: &[RatingWrite],
    processed_game_ids: &[String],
    history: &[EloHistoryPoint],
) -> Result<()> {
    let mut tx = pool.begin().await?;

    for write in writes {
        // Teams only ever seen in a game row get a placeholder record.
        sqlx::query(
            r#"
            INSERT INTO teams
            (id, sport, name, abbreviation, rating, points_for, points_against, games_played, updated_at)
            VALUES (?, ?, ?, '', ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                rating         = excluded.rating,
                points_for     = excluded.points_for,
                points_against = excluded.points_against,
                games_played   = excluded.games_played,
                updated_at     = excluded.updated_at
            "#,
        )
        .bind(&write.team_id)
        .bind(sport.as_str())
        .bind(&write.team_id)
        .bind(write.rating)
        .bind(write.stats.points_for)
        .bind(write.stats.points_against)
        .bind(i64::from(write.stats.games_played))
        .bind(timestamp(write.updated_at))
        .execute(&mut *tx)
        .await?;
    }

    for game_id in processed_game_ids {
        sqlx::query("UPDATE games SET elo_state = 'processed' WHERE id = ?")
            .bind(game_id)
            .execute(&mut *tx)
            .await?;
    }

    for point in history {
        sqlx::query("INSERT INTO elo_history (id, team_id, date, rating, game_id) VALUES (?, ?, ?, ?, ?)")
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(&point.team_id)
            .bind(timestamp(point.date))
            .bind(point.rating)
            .bind(&point.game_id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Put every team of a sport back to `initial_rating` with empty scoring
/// totals, and mark all its games unprocessed.
pub async fn reset_ratings(pool: &SqlitePool, sport: Sport, initial_rating: f64) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM elo_history WHERE team_id IN (SELECT id FROM teams WHERE sport = ?)")
        .bind(sport.as_str())
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"UPDATE teams
           SET rating = ?, points_for = 0, points_against = 0, games_played = 0, updated_at = ?
           WHERE sport = ?"#,
    )
    .bind(initial_rating)
    .bind(timestamp(Utc::now()))
    .bind(sport.as_str())
    .execute(&mut *tx)
    .await?;

    sqlx::query("UPDATE games SET elo_state = 'unprocessed' WHERE sport = ?")
        .bind(sport.as_str())
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    tracing::info!("Reset {} ratings to {:.0}", sport, initial_rating);
    Ok(())
}

pub async fn get_elo_history(pool: &SqlitePool, team_id: &str) -> Result<Vec<EloHistoryPoint>> {
    let rows = sqlx::query("SELECT * FROM elo_history WHERE team_id = ? ORDER BY date ASC")
        .bind(team_id)
        .fetch_all(pool)
        .await?;

    let mut history = Vec::new();
    for row in rows {
        history.push(EloHistoryPoint {
            team_id: row.get("team_id"),
            date: parse_timestamp(&row.get::<String, _>("date"))?,
            rating: row.get("rating"),
            game_id: row.get("game_id"),
        });
    }
    Ok(history)
}

// Odds operations

pub async fn insert_odds_snapshot(pool: &SqlitePool, snapshot: &OddsSnapshot) -> Result<()> {
    sqlx::query(
        r#"INSERT OR IGNORE INTO odds_snapshots
           (game_id, bookmaker, fetched_at, home_spread, total, home_moneyline, away_moneyline)
           VALUES (?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&snapshot.game_id)
    .bind(&snapshot.bookmaker)
    .bind(timestamp(snapshot.fetched_at))
    .bind(snapshot.home_spread)
    .bind(snapshot.total)
    .bind(snapshot.home_moneyline)
    .bind(snapshot.away_moneyline)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_odds_snapshots(pool: &SqlitePool, game_id: &str) -> Result<Vec<OddsSnapshot>> {
    let rows = sqlx::query("SELECT * FROM odds_snapshots WHERE game_id = ? ORDER BY fetched_at ASC, bookmaker ASC")
        .bind(game_id)
        .fetch_all(pool)
        .await?;

    let mut snapshots = Vec::new();
    for row in rows {
        snapshots.push(OddsSnapshot {
            game_id: row.get("game_id"),
            bookmaker: row.get("bookmaker"),
            fetched_at: parse_timestamp(&row.get::<String, _>("fetched_at"))?,
            home_spread: row.get("home_spread"),
            total: row.get("total"),
            home_moneyline: row.get("home_moneyline"),
            away_moneyline: row.get("away_moneyline"),
        });
    }
    Ok(snapshots)
}

// Prediction operations

pub async fn insert_prediction(pool: &SqlitePool, prediction: &GamePrediction) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO predictions
        (id, game_id, home_team_id, away_team_id, predicted_home_score, predicted_away_score,
         predicted_spread, predicted_total, home_win_probability, confidence,
         market_spread, market_total, edge_spread, edge_total, model_version, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&prediction.id)
    .bind(&prediction.game_id)
    .bind(&prediction.home_team_id)
    .bind(&prediction.away_team_id)
    .bind(prediction.predicted_home_score)
    .bind(prediction.predicted_away_score)
    .bind(prediction.predicted_spread)
    .bind(prediction.predicted_total)
    .bind(prediction.home_win_probability)
    .bind(prediction.confidence)
    .bind(prediction.market_spread)
    .bind(prediction.market_total)
    .bind(prediction.edge_spread)
    .bind(prediction.edge_total)
    .bind(&prediction.model_version)
    .bind(timestamp(prediction.created_at))
    .execute(pool)
    .await?;

    Ok(())
}

/// The newest prediction for a game whose row decodes and passes validation.
/// Predictions stamped in the same second resolve to the one written last.
pub async fn get_latest_prediction(pool: &SqlitePool, game_id: &str) -> Result<Option<GamePrediction>> {
    let rows = sqlx::query("SELECT * FROM predictions WHERE game_id = ? ORDER BY created_at DESC, rowid DESC")
        .bind(game_id)
        .fetch_all(pool)
        .await?;

    for row in &rows {
        match prediction_from_row(row) {
            Ok(prediction) if prediction.is_valid() => return Ok(Some(prediction)),
            Ok(prediction) => tracing::debug!("Skipping invalid prediction {}", prediction.id),
            Err(e) => tracing::debug!("Skipping undecodable prediction row for {}: {}", game_id, e),
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::{final_game, kickoff, scheduled_game, team};

    #[tokio::test]
    async fn test_team_upsert_keeps_rating() {
        let pool = memory_pool().await.unwrap();
        db_team(&pool, "kc", 1620.0).await;

        let mut renamed = team("kc", 1500.0, 0, 0, 0);
        renamed.name = "Kansas City Chiefs".to_string();
        upsert_team(&pool, &renamed).await.unwrap();

        let stored = get_team_by_id(&pool, "kc").await.unwrap().unwrap();
        assert_eq!(stored.name, "Kansas City Chiefs");
        assert_eq!(stored.rating, 1620.0);
    }

    async fn db_team(pool: &SqlitePool, id: &str, rating: f64) {
        upsert_team(pool, &team(id, rating, 0, 0, 0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_status_never_regresses() {
        let pool = memory_pool().await.unwrap();
        assert!(upsert_game(&pool, &final_game("g1", "kc", "buf", 0, 27, 20)).await.unwrap());
        assert!(!upsert_game(&pool, &scheduled_game("g1", "kc", "buf", 0)).await.unwrap());

        let stored = get_game(&pool, "g1").await.unwrap().unwrap();
        assert_eq!(stored.status, GameStatus::Final);
        assert_eq!(stored.final_score(), Some((27, 20)));
    }

    #[tokio::test]
    async fn test_upsert_keeps_elo_state() {
        let pool = memory_pool().await.unwrap();
        upsert_game(&pool, &final_game("g1", "kc", "buf", 0, 27, 20)).await.unwrap();
        apply_rating_batch(&pool, Sport::Nfl, &[], &["g1".to_string()], &[]).await.unwrap();

        // A refetch of the same game arrives as unprocessed.
        upsert_game(&pool, &final_game("g1", "kc", "buf", 0, 27, 20)).await.unwrap();
        let stored = get_game(&pool, "g1").await.unwrap().unwrap();
        assert_eq!(stored.elo_state, EloState::Processed);
        assert!(get_pending_games(&pool, Sport::Nfl).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reset_ratings() {
        let pool = memory_pool().await.unwrap();
        upsert_team(&pool, &team("kc", 1500.0, 0, 0, 0)).await.unwrap();
        upsert_game(&pool, &final_game("g1", "kc", "buf", 0, 27, 20)).await.unwrap();
        apply_rating_batch(
            &pool,
            Sport::Nfl,
            &[RatingWrite {
                team_id: "kc".to_string(),
                rating: 1540.0,
                stats: ScoringStats { points_for: 27, points_against: 20, games_played: 1 },
                updated_at: kickoff(1),
            }],
            &["g1".to_string()],
            &[EloHistoryPoint { team_id: "kc".to_string(), date: kickoff(0), rating: 1540.0, game_id: Some("g1".to_string()) }],
        )
        .await
        .unwrap();
        assert_eq!(get_elo_history(&pool, "kc").await.unwrap().len(), 1);

        reset_ratings(&pool, Sport::Nfl, 1500.0).await.unwrap();

        let kc = get_team_by_id(&pool, "kc").await.unwrap().unwrap();
        assert_eq!(kc.rating, 1500.0);
        assert_eq!(kc.stats, ScoringStats::default());
        assert_eq!(get_pending_games(&pool, Sport::Nfl).await.unwrap().len(), 1);
        assert!(get_elo_history(&pool, "kc").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_latest_valid_prediction_wins() {
        let pool = memory_pool().await.unwrap();
        upsert_game(&pool, &scheduled_game("g1", "kc", "buf", 0)).await.unwrap();
        let base = GamePrediction {
            id: "p1".to_string(),
            game_id: "g1".to_string(),
            home_team_id: "kc".to_string(),
            away_team_id: "buf".to_string(),
            predicted_home_score: 24.0,
            predicted_away_score: 21.0,
            predicted_spread: -3.0,
            predicted_total: 45.0,
            home_win_probability: 0.6,
            confidence: 0.2,
            market_spread: None,
            market_total: None,
            edge_spread: None,
            edge_total: None,
            model_version: "test".to_string(),
            created_at: kickoff(0),
        };
        insert_prediction(&pool, &base).await.unwrap();

        let broken = GamePrediction {
            id: "p2".to_string(),
            home_win_probability: 1.7,
            created_at: kickoff(1),
            ..base.clone()
        };
        insert_prediction(&pool, &broken).await.unwrap();

        let latest = get_latest_prediction(&pool, "g1").await.unwrap().unwrap();
        assert_eq!(latest.id, "p1");
        assert!(get_latest_prediction(&pool, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_same_second_predictions_prefer_last_written() {
        let pool = memory_pool().await.unwrap();
        upsert_game(&pool, &scheduled_game("g1", "kc", "buf", 0)).await.unwrap();
        let first = GamePrediction {
            id: "p-b".to_string(),
            game_id: "g1".to_string(),
            home_team_id: "kc".to_string(),
            away_team_id: "buf".to_string(),
            predicted_home_score: 24.0,
            predicted_away_score: 21.0,
            predicted_spread: -3.0,
            predicted_total: 45.0,
            home_win_probability: 0.6,
            confidence: 0.2,
            market_spread: None,
            market_total: None,
            edge_spread: None,
            edge_total: None,
            model_version: "test".to_string(),
            created_at: kickoff(0),
        };
        // Ids sort the other way, so only write order can pick the winner.
        let second = GamePrediction {
            id: "p-a".to_string(),
            market_spread: Some(-2.5),
            ..first.clone()
        };
        insert_prediction(&pool, &first).await.unwrap();
        insert_prediction(&pool, &second).await.unwrap();

        let latest = get_latest_prediction(&pool, "g1").await.unwrap().unwrap();
        assert_eq!(latest.id, "p-a");
    }

    #[tokio::test]
    async fn test_odds_snapshots_round_trip() {
        let pool = memory_pool().await.unwrap();
        upsert_game(&pool, &scheduled_game("g1", "kc", "buf", 0)).await.unwrap();
        let snapshot = OddsSnapshot {
            game_id: "g1".to_string(),
            bookmaker: "draftkings".to_string(),
            fetched_at: kickoff(0),
            home_spread: Some(-3.5),
            total: Some(47.5),
            home_moneyline: Some(-170),
            away_moneyline: Some(145),
        };
        insert_odds_snapshot(&pool, &snapshot).await.unwrap();
        // Same bookmaker and timestamp is a duplicate.
        insert_odds_snapshot(&pool, &snapshot).await.unwrap();

        let stored = get_odds_snapshots(&pool, "g1").await.unwrap();
        assert_eq!(stored, vec![snapshot]);
    }
}
