pub mod backtest;
pub mod data_fetcher;
pub mod edge_calculator;
pub mod elo_calculator;
pub mod odds_fetcher;
pub mod predictor;

pub use backtest::*;
pub use data_fetcher::*;
pub use edge_calculator::*;
pub use elo_calculator::*;
pub use predictor::*;
