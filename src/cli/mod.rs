use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::Args;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::{ModelConfig, Settings};
use crate::db::{self, create_pool};
use crate::models::{EloState, Game, GameStatus, ScoringStats, Sport, Team};
use crate::services::{
    odds_fetcher, BacktestOptimizer, DataFetcher, EdgeCalculator, EloCalculator, GridKey, ParameterGrid,
    PredictionEngine,
};

/// Settings every command runs with.
pub struct Session {
    pub settings: Settings,
    pub config_path: Option<PathBuf>,
}

impl Session {
    fn model(&self, sport: Sport) -> Result<ModelConfig> {
        Ok(ModelConfig::load(sport, self.config_path.as_deref())?)
    }

    async fn pool(&self) -> Result<sqlx::SqlitePool> {
        let pool = create_pool(&self.settings.database_url).await?;
        db::init_database_with_pool(&pool).await?;
        Ok(pool)
    }
}

pub async fn fetch_data(session: &Session, sport: Sport, days: i64) -> Result<()> {
    let pool = session.pool().await?;
    let model = session.model(sport)?;
    let fetcher = DataFetcher::new(&session.settings);

    println!("📥 Fetching {} scoreboard for the last {} days...", sport, days);
    let summary = fetcher
        .sync_recent(&pool, sport, days, model.elo.initial_rating)
        .await?;
    println!(
        "✅ Stored {} games across {} team updates ({} stale updates ignored)",
        summary.games, summary.teams, summary.refused
    );

    let elo = EloCalculator::new(model.elo)?;
    let outcome = elo.process_pending_games(&pool, sport).await?;
    println!("📈 Rated {} newly final games", outcome.processed.len());
    Ok(())
}

pub async fn fetch_odds(session: &Session, sport: Sport, force: bool) -> Result<()> {
    let api_key = session
        .settings
        .odds_api_key
        .as_deref()
        .ok_or_else(|| anyhow!("ODDS_API_KEY not set"))?;
    let pool = session.pool().await?;

    let stored = odds_fetcher::refresh_odds(&pool, api_key, sport, force).await?;
    if stored == 0 {
        println!("📭 No new {} odds (recent fetch or no upcoming games; use --force to refetch)", sport);
    } else {
        println!("✅ Stored {} {} odds snapshots", stored, sport);
    }
    Ok(())
}

/// Upper bound of the default bet filter; no real spread reaches it.
const NO_SPREAD_LIMIT: f64 = 100.0;

/// One row of a historical results file.
#[derive(Debug, Deserialize)]
struct GameRecord {
    id: Option<String>,
    date: String,
    home_team: String,
    away_team: String,
    home_score: Option<i32>,
    away_score: Option<i32>,
    neutral_site: Option<bool>,
    market_spread: Option<f64>,
    season: Option<String>,
    week: Option<i32>,
}

fn slug(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

fn parse_game_date(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc3339(raw) {
        return Ok(date.with_timezone(&Utc));
    }
    let day = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").with_context(|| format!("bad date '{}'", raw))?;
    day.and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .ok_or_else(|| anyhow!("bad date '{}'", raw))
}

/// Parse a results CSV into the teams it mentions and its games.
///
/// Required columns: `date`, `home_team`, `away_team`. Rows with both scores
/// become final games; the rest are scheduled.
pub fn parse_games_csv<R: io::Read>(sport: Sport, reader: R, initial_rating: f64) -> Result<(Vec<Team>, Vec<Game>)> {
    let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut teams: BTreeMap<String, Team> = BTreeMap::new();
    let mut games = Vec::new();
    let now = Utc::now();

    for (line, record) in csv_reader.deserialize::<GameRecord>().enumerate() {
        let record = record.with_context(|| format!("row {}", line + 1))?;
        let game_time = parse_game_date(&record.date).with_context(|| format!("row {}", line + 1))?;

        let mut team_id = |name: &str| {
            let id = format!("{}_{}", sport, slug(name));
            teams.entry(id.clone()).or_insert_with(|| Team {
                id: id.clone(),
                sport,
                name: name.to_string(),
                abbreviation: String::new(),
                rating: initial_rating,
                stats: ScoringStats::default(),
                updated_at: now,
            });
            id
        };
        let home_team_id = team_id(&record.home_team);
        let away_team_id = team_id(&record.away_team);

        let status = match (record.home_score, record.away_score) {
            (Some(_), Some(_)) => GameStatus::Final,
            _ => GameStatus::Scheduled,
        };
        let id = record.id.filter(|id| !id.is_empty()).unwrap_or_else(|| {
            format!(
                "{}_{}_{}_{}",
                sport,
                game_time.format("%Y%m%d"),
                slug(&record.home_team),
                slug(&record.away_team)
            )
        });

        games.push(Game {
            id,
            sport,
            home_team_id,
            away_team_id,
            home_team_name: record.home_team,
            away_team_name: record.away_team,
            game_time,
            status,
            home_score: record.home_score,
            away_score: record.away_score,
            elo_state: EloState::Unprocessed,
            season: record.season,
            week: record.week,
            venue: None,
            neutral_site: record.neutral_site.unwrap_or(false),
            market_spread: record.market_spread,
            updated_at: now,
        });
    }

    Ok((teams.into_values().collect(), games))
}

pub async fn import_games(session: &Session, sport: Sport, file: &Path) -> Result<()> {
    let model = session.model(sport)?;
    let reader = std::fs::File::open(file).with_context(|| format!("opening {}", file.display()))?;
    let (teams, games) = parse_games_csv(sport, reader, model.elo.initial_rating)?;

    let pool = session.pool().await?;
    for team in &teams {
        db::upsert_team(&pool, team).await?;
    }
    let mut refused = 0usize;
    for game in &games {
        if !db::upsert_game(&pool, game).await? {
            refused += 1;
        }
    }

    println!(
        "✅ Imported {} games and {} teams from {} ({} ignored)",
        games.len() - refused,
        teams.len(),
        file.display(),
        refused
    );
    println!("💡 Run 'linesmith update-ratings --sport {}' to fold them into the ratings", sport);
    Ok(())
}

pub async fn update_ratings(session: &Session, sport: Sport) -> Result<()> {
    let pool = session.pool().await?;
    let elo = EloCalculator::new(session.model(sport)?.elo)?;

    let outcome = elo.process_pending_games(&pool, sport).await?;
    println!(
        "📈 Rated {} pending {} games ({} skipped for missing scores)",
        outcome.processed.len(),
        sport,
        outcome.skipped.len()
    );
    for id in &outcome.skipped {
        println!("   ⚠️  {}", id);
    }
    Ok(())
}

pub async fn recalculate(session: &Session, sport: Sport) -> Result<()> {
    let pool = session.pool().await?;
    let elo = EloCalculator::new(session.model(sport)?.elo)?;

    let outcome = elo.recalculate_all(&pool, sport).await?;
    println!(
        "🔁 Rebuilt {} ratings from {} games ({} skipped)",
        sport,
        outcome.processed.len(),
        outcome.skipped.len()
    );
    Ok(())
}

pub async fn generate_predictions(session: &Session, sport: Sport, limit: i64) -> Result<()> {
    let pool = session.pool().await?;
    let engine = PredictionEngine::from_model(sport, &session.model(sport)?)?;

    println!("🔮 Generating {} predictions for upcoming games...", sport);
    let predictions = engine.generate_predictions(&pool, limit).await?;

    if predictions.is_empty() {
        println!("📭 No upcoming games found. Try fetching data first with: linesmith fetch --sport {}", sport);
        return Ok(());
    }

    println!("✅ Generated {} predictions\n", predictions.len());
    for (i, prediction) in predictions.iter().take(10).enumerate() {
        println!(
            "{}. {} @ {}: {:.1}-{:.1}",
            i + 1,
            prediction.away_team_id,
            prediction.home_team_id,
            prediction.predicted_away_score,
            prediction.predicted_home_score
        );
        println!(
            "   Spread {:+.1} | Total {:.1} | Home win {:.1}% | Confidence {:.0}%",
            prediction.predicted_spread,
            prediction.predicted_total,
            prediction.home_win_probability * 100.0,
            prediction.confidence * 100.0
        );
    }
    Ok(())
}

pub async fn show_edges(session: &Session, sport: Sport, limit: i64) -> Result<()> {
    let pool = session.pool().await?;
    let model = session.model(sport)?;
    let engine = PredictionEngine::from_model(sport, &model)?;
    let calculator = EdgeCalculator::new(model.edge)?;

    println!("🎯 Pricing upcoming {} games against the market...\n", sport);
    let reports = calculator.analyze_upcoming(&pool, &engine, limit).await?;
    let plays: Vec<_> = reports.iter().filter(|r| r.recommendation.is_some()).collect();

    if plays.is_empty() {
        println!("📭 No edges clear the thresholds right now.");
        println!("💡 Make sure odds are loaded: linesmith odds --sport {}", sport);
        return Ok(());
    }

    for (i, report) in plays.iter().enumerate() {
        let Some(rec) = &report.recommendation else { continue };
        let p = &report.prediction;
        println!("{}. {} @ {}", i + 1, p.away_team_id, p.home_team_id);
        println!(
            "   Model: spread {:+.1}, total {:.1} | Market: {} / {}",
            p.predicted_spread,
            p.predicted_total,
            p.market_spread.map_or("-".to_string(), |s| format!("{:+.1}", s)),
            p.market_total.map_or("-".to_string(), |t| format!("{:.1}", t))
        );
        println!(
            "   Pick: {} {} ({:+.1} edge, {:?}) | Cover {:.1}% | Stake {:.2}% of bankroll\n",
            rec.pick,
            rec.line,
            rec.edge,
            rec.strength,
            rec.cover_probability * 100.0,
            rec.stake_fraction * 100.0
        );
    }
    Ok(())
}

/// Grid axes for `linesmith backtest`. Axes left empty use the configured value.
#[derive(Debug, Args)]
pub struct BacktestArgs {
    #[arg(short, long)]
    pub sport: Sport,
    /// Points of spread per 100 rating points, e.g. 3,3.5,4
    #[arg(long, value_delimiter = ',')]
    pub elo_points: Vec<f64>,
    #[arg(long, value_delimiter = ',')]
    pub spread_regression: Vec<f64>,
    /// Caps on the rating adjustment; "none" for uncapped
    #[arg(long, value_delimiter = ',')]
    pub elo_cap: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    pub stats_regression: Vec<f64>,
    /// Bet filter bands on |predicted spread|, e.g. 0-30,2-7
    #[arg(long, value_delimiter = ',')]
    pub spread_filter: Vec<String>,
    #[arg(long, default_value = "10")]
    pub top: usize,
    /// Also show the best result per value of this parameter
    #[arg(long)]
    pub group_by: Option<GridKey>,
    /// Write every ranked result to this CSV file
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

fn parse_cap(raw: &str) -> Result<Option<f64>> {
    match raw.trim().to_lowercase().as_str() {
        "none" | "off" => Ok(None),
        value => Ok(Some(value.parse().with_context(|| format!("bad elo cap '{}'", raw))?)),
    }
}

fn parse_spread_filter(raw: &str) -> Result<(f64, f64)> {
    let (min, max) = raw
        .split_once('-')
        .ok_or_else(|| anyhow!("spread filter '{}' must look like MIN-MAX", raw))?;
    Ok((
        min.trim().parse().with_context(|| format!("bad spread filter '{}'", raw))?,
        max.trim().parse().with_context(|| format!("bad spread filter '{}'", raw))?,
    ))
}

impl BacktestArgs {
    fn grid(&self, model: &ModelConfig) -> Result<ParameterGrid> {
        let mut grid = ParameterGrid::from_config(&model.prediction, 0.0, NO_SPREAD_LIMIT);
        if !self.elo_points.is_empty() {
            grid.elo_points_per_100 = self.elo_points.clone();
        }
        if !self.spread_regression.is_empty() {
            grid.spread_regression = self.spread_regression.clone();
        }
        if !self.elo_cap.is_empty() {
            grid.elo_cap = self.elo_cap.iter().map(|c| parse_cap(c)).collect::<Result<_>>()?;
        }
        if !self.stats_regression.is_empty() {
            grid.stats_regression = self.stats_regression.clone();
        }
        if !self.spread_filter.is_empty() {
            grid.spread_filters = self
                .spread_filter
                .iter()
                .map(|f| parse_spread_filter(f))
                .collect::<Result<_>>()?;
        }
        Ok(grid)
    }
}

pub async fn run_backtest(session: &Session, args: &BacktestArgs) -> Result<()> {
    let model = session.model(args.sport)?;
    let grid = args.grid(&model)?;
    let pool = session.pool().await?;

    let games = db::get_completed_games_ordered(&pool, args.sport).await?;
    if games.is_empty() {
        println!("📭 No completed {} games stored. Import or fetch history first.", args.sport);
        return Ok(());
    }

    let optimizer = BacktestOptimizer::new(args.sport, games, model)?;
    println!(
        "🧪 Backtesting {} parameter sets over {} games...\n",
        grid.len(),
        optimizer.games().len()
    );
    if !optimizer.skipped().is_empty() {
        println!("⚠️  Left out {} final games with missing scores", optimizer.skipped().len());
    }
    let report = tokio::task::spawn_blocking(move || optimizer.search(&grid)).await??;

    println!(
        "{:>4} {:>6} {:>6} {:>6} {:>6} {:>11} {:>6} {:>6} {:>5} {:>8} {:>7} {:>6}",
        "rank", "pts", "sreg", "cap", "streg", "filter", "W", "L", "P", "profit", "win%", "mae"
    );
    for (i, r) in report.top(args.top).iter().enumerate() {
        let p = &r.params;
        println!(
            "{:>4} {:>6} {:>6} {:>6} {:>6} {:>11} {:>6} {:>6} {:>5} {:>+8.2} {:>6.1}% {:>6}",
            i + 1,
            p.elo_points_per_100,
            p.spread_regression,
            GridKey::EloCap.label(p),
            p.stats_regression,
            GridKey::SpreadFilter.label(p),
            r.wins,
            r.losses,
            r.pushes,
            r.profit,
            r.win_rate * 100.0,
            r.spread_mae.map_or("-".to_string(), |m| format!("{:.2}", m))
        );
    }

    if let Some(best) = report.best() {
        println!(
            "\n🏆 Best: {:+.2}u on {} bets (ROI {:+.1}%)",
            best.profit,
            best.bets(),
            best.roi * 100.0
        );
    }

    if let Some(key) = args.group_by {
        println!("\n🏅 Best per {:?}:", key);
        for (label, r) in report.best_by(key) {
            println!("   {:>10}: {:+.2}u, {:.1}% over {} bets", label, r.profit, r.win_rate * 100.0, r.bets());
        }
    }

    if let Some(path) = &args.output {
        let file = std::fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
        report.write_csv(file)?;
        println!("\n💾 Wrote {} results to {}", report.results.len(), path.display());
    }
    Ok(())
}

pub async fn query_team(session: &Session, team_name: &str) -> Result<()> {
    let pool = session.pool().await?;

    println!("🔍 Searching for team: {}", team_name);
    let teams = db::find_teams_by_name(&pool, team_name).await?;

    let Some(team) = teams.first() else {
        println!("❌ No teams found matching '{}'", team_name);
        return Ok(());
    };

    if teams.len() > 1 {
        println!("📋 Found {} teams matching '{}':\n", teams.len(), team_name);
        for (i, t) in teams.iter().enumerate() {
            println!("{}. {} ({})", i + 1, t.name, t.sport);
        }
        println!("\n🔍 Showing details for first match:");
    }

    println!("📊 Team Details:");
    println!("   Name: {} ({})", team.name, team.sport);
    println!("   Elo Rating: {:.1}", team.rating);
    match (team.stats.ppg(), team.stats.ppg_allowed()) {
        (Some(scored), Some(allowed)) => println!(
            "   Scoring: {:.1} for, {:.1} against over {} games",
            scored, allowed, team.stats.games_played
        ),
        _ => println!("   Scoring: no games rated yet"),
    }
    println!("   Last Updated: {}", team.updated_at.format("%Y-%m-%d %H:%M:%S"));

    println!("\n📅 Recent Games:");
    let recent = db::get_team_recent_games(&pool, &team.id, 5).await?;
    if recent.is_empty() {
        println!("   No recent games found");
    }
    for game in recent {
        let Some((home, away)) = game.final_score() else { continue };
        let is_home = game.home_team_id == team.id;
        let (opponent, ours, theirs) = if is_home {
            (&game.away_team_name, home, away)
        } else {
            (&game.home_team_name, away, home)
        };
        let result = match ours.cmp(&theirs) {
            std::cmp::Ordering::Greater => "W",
            std::cmp::Ordering::Less => "L",
            std::cmp::Ordering::Equal => "T",
        };
        println!(
            "   {} {} {} ({}-{}) {}",
            game.game_time.format("%m/%d"),
            if is_home { "vs" } else { "at" },
            opponent,
            ours,
            theirs,
            result
        );
    }

    let history = db::get_elo_history(&pool, &team.id).await?;
    if let (Some(first), Some(last)) = (history.first(), history.last()) {
        println!(
            "\n📈 Rating moved {:+.1} across {} rated games",
            last.rating - first.rating,
            history.len()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESULTS: &str = "\
date,home_team,away_team,home_score,away_score,neutral_site,market_spread,season,week
2024-09-05,Kansas City Chiefs,Baltimore Ravens,27,20,false,-3,2024,1
2024-09-08T17:00:00Z,Buffalo Bills,Arizona Cardinals,34,28,,,2024,1
2024-09-15,Kansas City Chiefs,Cincinnati Bengals,,,,,2024,2
";

    #[test]
    fn test_parse_games_csv() {
        let (teams, games) = parse_games_csv(Sport::Nfl, RESULTS.as_bytes(), 1500.0).unwrap();

        assert_eq!(teams.len(), 5);
        assert_eq!(games.len(), 3);

        let opener = &games[0];
        assert_eq!(opener.id, "nfl_20240905_kansas_city_chiefs_baltimore_ravens");
        assert_eq!(opener.home_team_id, "nfl_kansas_city_chiefs");
        assert_eq!(opener.final_score(), Some((27, 20)));
        assert_eq!(opener.market_spread, Some(-3.0));
        assert_eq!(opener.week, Some(1));

        assert!(!games[1].neutral_site);
        assert_eq!(games[1].market_spread, None);
        assert_eq!(games[2].status, GameStatus::Scheduled);
    }

    #[test]
    fn test_bad_date_is_reported() {
        let csv = "date,home_team,away_team\nyesterday,A,B\n";
        let err = parse_games_csv(Sport::Nba, csv.as_bytes(), 1500.0).unwrap_err();
        assert!(format!("{:#}", err).contains("row 1"));
    }

    #[tokio::test]
    async fn test_odds_require_api_key() {
        let session = Session {
            settings: Settings {
                database_url: "sqlite::memory:".to_string(),
                odds_api_key: None,
                espn_base_url: String::new(),
            },
            config_path: None,
        };
        let err = fetch_odds(&session, Sport::Nfl, false).await.unwrap_err();
        assert!(err.to_string().contains("ODDS_API_KEY"));
    }

    #[test]
    fn test_grid_axes_parse() {
        assert_eq!(parse_cap("none").unwrap(), None);
        assert_eq!(parse_cap("7.5").unwrap(), Some(7.5));
        assert!(parse_cap("seven").is_err());
        assert_eq!(parse_spread_filter("2-7").unwrap(), (2.0, 7.0));
        assert!(parse_spread_filter("7").is_err());
    }

    #[test]
    fn test_backtest_args_fill_grid() {
        let args = BacktestArgs {
            sport: Sport::Nfl,
            elo_points: vec![3.0, 4.0],
            spread_regression: vec![],
            elo_cap: vec!["5".to_string(), "none".to_string()],
            stats_regression: vec![],
            spread_filter: vec!["0-30".to_string()],
            top: 5,
            group_by: None,
            output: None,
        };
        let model = ModelConfig::for_sport(Sport::Nfl);
        let grid = args.grid(&model).unwrap();

        assert_eq!(grid.elo_cap, vec![Some(5.0), None]);
        assert_eq!(grid.spread_regression, vec![model.prediction.spread_regression]);
        assert_eq!(grid.len(), 4);
    }
}
