use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::{ModelConfig, Settings};
use crate::db::{create_pool, get_game, get_latest_prediction, get_teams, init_database_with_pool};
use crate::models::{ApiResponse, EdgeReport, GameContext, GamePrediction, Sport, Team, TeamProfile};
use crate::services::{EdgeCalculator, EloCalculator, PredictionEngine};

type ApiResult<T> = Result<Json<ApiResponse<T>>, (StatusCode, Json<ApiResponse<()>>)>;

#[derive(Clone)]
pub struct AppState {
    pool: SqlitePool,
    config_path: Option<Arc<PathBuf>>,
}

impl AppState {
    pub fn new(pool: SqlitePool, config_path: Option<PathBuf>) -> Self {
        Self {
            pool,
            config_path: config_path.map(Arc::new),
        }
    }

    fn model(&self, sport: Sport) -> Result<ModelConfig, (StatusCode, Json<ApiResponse<()>>)> {
        ModelConfig::load(sport, self.config_path.as_deref().map(PathBuf::as_path))
            .map_err(|e| failure(StatusCode::BAD_REQUEST, e))
    }
}

pub async fn serve(port: u16, settings: &Settings, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let pool = create_pool(&settings.database_url).await?;
    init_database_with_pool(&pool).await?;

    let app = create_router().with_state(AppState::new(pool, config_path));

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    tracing::info!("linesmith API server listening on port {}", port);

    axum::serve(listener, app).await?;
    Ok(())
}

fn create_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/teams/{sport}", get(get_teams_handler))
        .route("/games/{id}/prediction", get(get_prediction_handler))
        .route("/games/{id}/edge", get(get_edge_handler))
        .route("/predictions/preview", post(preview_prediction_handler))
        .route("/ratings/{sport}/recalculate", post(recalculate_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

fn failure(status: StatusCode, error: impl std::fmt::Display) -> (StatusCode, Json<ApiResponse<()>>) {
    if status.is_server_error() {
        tracing::error!("{}", error);
    } else {
        tracing::debug!("{}: {}", status, error);
    }
    (status, Json(ApiResponse::error(error.to_string())))
}

fn parse_sport(raw: &str) -> Result<Sport, (StatusCode, Json<ApiResponse<()>>)> {
    raw.parse().map_err(|e| failure(StatusCode::BAD_REQUEST, e))
}

// Health check endpoint
async fn health_check() -> Json<ApiResponse<&'static str>> {
    Json(ApiResponse::success("linesmith API is running"))
}

// GET /teams/{sport} - Teams ranked by rating
async fn get_teams_handler(State(state): State<AppState>, Path(sport): Path<String>) -> ApiResult<Vec<Team>> {
    let sport = parse_sport(&sport)?;
    let teams = get_teams(&state.pool, sport)
        .await
        .map_err(|e| failure(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    Ok(Json(ApiResponse::success(teams)))
}

// GET /games/{id}/prediction - Latest stored prediction, or a fresh one
async fn get_prediction_handler(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
) -> ApiResult<GamePrediction> {
    let game = get_game(&state.pool, &game_id)
        .await
        .map_err(|e| failure(StatusCode::INTERNAL_SERVER_ERROR, e))?
        .ok_or_else(|| failure(StatusCode::NOT_FOUND, format!("game {} not found", game_id)))?;

    if let Some(prediction) = get_latest_prediction(&state.pool, &game_id)
        .await
        .map_err(|e| failure(StatusCode::INTERNAL_SERVER_ERROR, e))?
    {
        return Ok(Json(ApiResponse::success(prediction)));
    }

    let engine = PredictionEngine::from_model(game.sport, &state.model(game.sport)?)
        .map_err(|e| failure(StatusCode::BAD_REQUEST, e))?;
    let prediction = engine
        .predict_game(&state.pool, &game)
        .await
        .map_err(|e| failure(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    Ok(Json(ApiResponse::success(prediction)))
}

// GET /games/{id}/edge - Prediction priced against consensus odds
async fn get_edge_handler(State(state): State<AppState>, Path(game_id): Path<String>) -> ApiResult<EdgeReport> {
    let game = get_game(&state.pool, &game_id)
        .await
        .map_err(|e| failure(StatusCode::INTERNAL_SERVER_ERROR, e))?
        .ok_or_else(|| failure(StatusCode::NOT_FOUND, format!("game {} not found", game_id)))?;

    let model = state.model(game.sport)?;
    let engine = PredictionEngine::from_model(game.sport, &model).map_err(|e| failure(StatusCode::BAD_REQUEST, e))?;
    let calculator = EdgeCalculator::new(model.edge).map_err(|e| failure(StatusCode::BAD_REQUEST, e))?;

    let report = calculator
        .analyze_game(&state.pool, &engine, &game_id)
        .await
        .map_err(|e| failure(StatusCode::INTERNAL_SERVER_ERROR, e))?
        .ok_or_else(|| failure(StatusCode::NOT_FOUND, format!("game {} not found", game_id)))?;
    Ok(Json(ApiResponse::success(report)))
}

// POST /predictions/preview - Predict an arbitrary matchup without storing it
#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    sport: String,
    home: TeamProfile,
    away: TeamProfile,
    #[serde(default)]
    context: GameContext,
}

async fn preview_prediction_handler(
    State(state): State<AppState>,
    Json(request): Json<PreviewRequest>,
) -> ApiResult<GamePrediction> {
    let sport = parse_sport(&request.sport)?;
    let engine =
        PredictionEngine::from_model(sport, &state.model(sport)?).map_err(|e| failure(StatusCode::BAD_REQUEST, e))?;

    let prediction = engine.predict("preview", &request.home, &request.away, &request.context);
    Ok(Json(ApiResponse::success(prediction)))
}

// POST /ratings/{sport}/recalculate - Rebuild ratings from the full history
#[derive(Debug, Serialize)]
pub struct RecalculateResponse {
    processed: usize,
    skipped: Vec<String>,
}

async fn recalculate_handler(
    State(state): State<AppState>,
    Path(sport): Path<String>,
) -> ApiResult<RecalculateResponse> {
    let sport = parse_sport(&sport)?;
    let elo = EloCalculator::new(state.model(sport)?.elo).map_err(|e| failure(StatusCode::BAD_REQUEST, e))?;

    let outcome = elo
        .recalculate_all(&state.pool, sport)
        .await
        .map_err(|e| failure(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    Ok(Json(ApiResponse::success(RecalculateResponse {
        processed: outcome.processed.len(),
        skipped: outcome.skipped,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{memory_pool, upsert_game, upsert_team};
    use crate::models::fixtures::{final_game, scheduled_game, team};

    async fn state() -> AppState {
        AppState::new(memory_pool().await.unwrap(), None)
    }

    #[tokio::test]
    async fn test_unknown_sport_is_bad_request() {
        let err = get_teams_handler(State(state().await), Path("curling".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_game_is_not_found() {
        let err = get_prediction_handler(State(state().await), Path("nope".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_prediction_computed_when_none_stored() {
        let state = state().await;
        upsert_team(&state.pool, &team("kc", 1600.0, 0, 0, 0)).await.unwrap();
        upsert_game(&state.pool, &scheduled_game("g1", "kc", "buf", 0)).await.unwrap();

        let Json(response) = get_prediction_handler(State(state), Path("g1".to_string())).await.unwrap();
        let prediction = response.data.unwrap();
        assert_eq!(prediction.game_id, "g1");
        assert!(prediction.predicted_spread < 0.0);
    }

    #[tokio::test]
    async fn test_edge_without_odds_has_no_recommendation() {
        let state = state().await;
        upsert_game(&state.pool, &scheduled_game("g1", "kc", "buf", 0)).await.unwrap();

        let Json(response) = get_edge_handler(State(state), Path("g1".to_string())).await.unwrap();
        let report = response.data.unwrap();
        assert!(report.consensus.is_none());
        assert!(report.recommendation.is_none());
    }

    #[tokio::test]
    async fn test_recalculate_reports_counts() {
        let state = state().await;
        upsert_game(&state.pool, &final_game("g1", "kc", "buf", 0, 24, 17)).await.unwrap();

        let Json(response) = recalculate_handler(State(state.clone()), Path("nfl".to_string())).await.unwrap();
        assert_eq!(response.data.unwrap().processed, 1);

        let Json(teams) = get_teams_handler(State(state), Path("nfl".to_string())).await.unwrap();
        let teams = teams.data.unwrap();
        assert_eq!(teams.len(), 2);
        assert_eq!(teams[0].id, "kc");
    }

    #[tokio::test]
    async fn test_preview_uses_request_profiles() {
        let request: PreviewRequest = serde_json::from_str(
            r#"{
                "sport": "nba",
                "home": {"id": "bos", "rating": 1650.0},
                "away": {"id": "det", "rating": 1380.0},
                "context": {"neutral_site": true}
            }"#,
        )
        .unwrap();

        let Json(response) = preview_prediction_handler(State(state().await), Json(request)).await.unwrap();
        let prediction = response.data.unwrap();
        assert!(prediction.home_win_probability > 0.8);
        assert_eq!(prediction.confidence, 0.0);
    }
}
