use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One OHLCV bar. `timestamp_ms` is the candle's open time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// A candle is usable once its O/H/L/C are finite and non-zero.
    pub fn is_sane(&self) -> bool {
        [self.open, self.high, self.low, self.close]
            .iter()
            .all(|v| v.is_finite() && *v != 0.0)
    }

    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

/// Long/short side of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Position {
    Long,
    Short,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Long => write!(f, "long"),
            Position::Short => write!(f, "short"),
        }
    }
}

/// Candle cadence. Strategy intervals are restricted to `OneMin..=OneHour`;
/// frame intervals may additionally go up to `ThreeDay`. `OneMin` is always
/// fetchable (used for VWAP regardless of a strategy's own interval).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandleInterval {
    OneMin,
    ThreeMin,
    FiveMin,
    FifteenMin,
    ThirtyMin,
    OneHour,
    FourHour,
    OneDay,
    ThreeDay,
}

impl CandleInterval {
    pub fn to_minutes(self) -> i64 {
        match self {
            CandleInterval::OneMin => 1,
            CandleInterval::ThreeMin => 3,
            CandleInterval::FiveMin => 5,
            CandleInterval::FifteenMin => 15,
            CandleInterval::ThirtyMin => 30,
            CandleInterval::OneHour => 60,
            CandleInterval::FourHour => 240,
            CandleInterval::OneDay => 1440,
            CandleInterval::ThreeDay => 4320,
        }
    }

    pub fn to_ms(self) -> i64 {
        self.to_minutes() * 60_000
    }

    /// Strategy intervals are bounded at 1h per spec.md §6.
    pub fn is_valid_signal_interval(self) -> bool {
        self.to_minutes() <= 60
    }

    /// A frame interval must be an integer multiple of the strategy
    /// interval it drives (spec.md §9 open question 3).
    pub fn is_multiple_of(self, other: CandleInterval) -> bool {
        self.to_minutes() % other.to_minutes() == 0
    }
}

impl fmt::Display for CandleInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl CandleInterval {
    pub fn as_str(self) -> &'static str {
        match self {
            CandleInterval::OneMin => "1m",
            CandleInterval::ThreeMin => "3m",
            CandleInterval::FiveMin => "5m",
            CandleInterval::FifteenMin => "15m",
            CandleInterval::ThirtyMin => "30m",
            CandleInterval::OneHour => "1h",
            CandleInterval::FourHour => "4h",
            CandleInterval::OneDay => "1d",
            CandleInterval::ThreeDay => "3d",
        }
    }
}

impl FromStr for CandleInterval {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "1m" => Ok(CandleInterval::OneMin),
            "3m" => Ok(CandleInterval::ThreeMin),
            "5m" => Ok(CandleInterval::FiveMin),
            "15m" => Ok(CandleInterval::FifteenMin),
            "30m" => Ok(CandleInterval::ThirtyMin),
            "1h" => Ok(CandleInterval::OneHour),
            "4h" => Ok(CandleInterval::FourHour),
            "1d" => Ok(CandleInterval::OneDay),
            "3d" => Ok(CandleInterval::ThreeDay),
            _ => anyhow::bail!("invalid candle interval: '{}'", s),
        }
    }
}

/// Why a signal closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    TakeProfit,
    StopLoss,
    TimeExpired,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::TakeProfit => write!(f, "take_profit"),
            CloseReason::StopLoss => write!(f, "stop_loss"),
            CloseReason::TimeExpired => write!(f, "time_expired"),
        }
    }
}

/// Realised P&L of a closed signal, in percent (e.g. `0.02` == 2%).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pnl {
    pub gross_pct: f64,
    pub net_pct_after_fees_and_slippage: f64,
}
