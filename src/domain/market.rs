//! One trading day of market and model data.

use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};

use super::error::LivebookError;

#[derive(Debug, Clone, PartialEq)]
pub struct MarketBar {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    pub model_score: f64,
    /// Upstream relative-strength percentile in `[0, 1]`, 1 = strongest.
    pub rs_rank: Option<f64>,
}

impl MarketBar {
    /// Worst observed price of the session, used for stop checks.
    pub fn low_or_close(&self) -> f64 {
        self.low.min(self.close)
    }

    /// An open that can be filled against.
    pub fn has_tradable_open(&self) -> bool {
        self.open.is_finite() && self.open > 0.0
    }

    /// A close that can mark a position.
    pub fn has_usable_close(&self) -> bool {
        self.close.is_finite() && self.close > 0.0
    }

    /// The symbol printed at least one usable price this session.
    pub fn traded(&self) -> bool {
        self.has_tradable_open() || self.has_usable_close()
    }
}

/// Immutable view of a single trading day, keyed by symbol.
#[derive(Debug, Clone)]
pub struct MarketView {
    date: NaiveDate,
    bars: HashMap<String, MarketBar>,
    score_percentiles: HashMap<String, f64>,
}

impl MarketView {
    /// Build a view from bars that must all carry `date` and unique symbols.
    pub fn new(date: NaiveDate, bars: Vec<MarketBar>) -> Result<Self, LivebookError> {
        let mut by_symbol = HashMap::with_capacity(bars.len());
        for bar in bars {
            if bar.date != date {
                return Err(LivebookError::MarketData {
                    reason: format!(
                        "bar for {} is dated {}, expected {}",
                        bar.symbol, bar.date, date
                    ),
                });
            }
            let symbol = bar.symbol.clone();
            if by_symbol.insert(symbol.clone(), bar).is_some() {
                return Err(LivebookError::MarketData {
                    reason: format!("duplicate bar for {} on {}", symbol, date),
                });
            }
        }

        let score_percentiles = score_percentiles(&by_symbol);
        Ok(MarketView {
            date,
            bars: by_symbol,
            score_percentiles,
        })
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn get(&self, symbol: &str) -> Option<&MarketBar> {
        self.bars.get(symbol)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.bars.contains_key(symbol)
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Bars with a finite model score, best score first. Ties break on symbol.
    pub fn ranked(&self) -> Vec<&MarketBar> {
        let mut ranked: Vec<&MarketBar> = self
            .bars
            .values()
            .filter(|b| b.model_score.is_finite())
            .collect();
        ranked.sort_by(|a, b| {
            b.model_score
                .total_cmp(&a.model_score)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });
        ranked
    }

    /// The `k` best-scored symbols of the day.
    pub fn top_symbols(&self, k: usize) -> HashSet<String> {
        self.ranked()
            .into_iter()
            .take(k)
            .map(|b| b.symbol.clone())
            .collect()
    }

    /// Upstream `rs_rank` when present, otherwise the model-score percentile.
    pub fn relative_strength(&self, symbol: &str) -> Option<f64> {
        let bar = self.bars.get(symbol)?;
        bar.rs_rank
            .filter(|r| r.is_finite())
            .or_else(|| self.score_percentiles.get(symbol).copied())
    }
}

/// Average-rank percentile (ascending), so the best score maps to 1.0.
fn score_percentiles(bars: &HashMap<String, MarketBar>) -> HashMap<String, f64> {
    let scores: Vec<f64> = bars
        .values()
        .map(|b| b.model_score)
        .filter(|s| s.is_finite())
        .collect();
    let n = scores.len() as f64;

    bars.values()
        .filter(|b| b.model_score.is_finite())
        .map(|b| {
            let s = b.model_score;
            let below = scores.iter().filter(|&&x| x < s).count() as f64;
            let equal = scores.iter().filter(|&&x| x == s).count() as f64;
            let avg_rank = below + (equal + 1.0) / 2.0;
            (b.symbol.clone(), avg_rank / n)
        })
        .collect()
}
