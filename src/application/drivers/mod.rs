pub mod backtest;
pub mod live;
pub mod walker;
