//! Long-format CSV market data adapter.
//!
//! One row per (date, symbol) with columns
//! `date,symbol,open,high,low,close,volume,model_score[,rs_rank]` in any order.
//! Empty price or score cells load as NaN so the bar stays visible but is
//! never traded or ranked.

use crate::domain::error::LivebookError;
use crate::domain::market::{MarketBar, MarketView};
use crate::ports::market_port::MarketDataPort;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

const REQUIRED: [&str; 8] = [
    "date",
    "symbol",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "model_score",
];

pub struct CsvMarketAdapter {
    days: BTreeMap<NaiveDate, Vec<MarketBar>>,
}

struct Columns {
    required: [usize; 8],
    rs_rank: Option<usize>,
}

impl CsvMarketAdapter {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LivebookError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| LivebookError::MarketData {
            reason: format!("failed to read {}: {}", path.display(), e),
        })?;
        Self::from_reader(file)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, LivebookError> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let headers = rdr.headers().map_err(|e| LivebookError::MarketData {
            reason: format!("CSV header error: {}", e),
        })?;
        let columns = Columns::locate(headers)?;

        let mut days: BTreeMap<NaiveDate, Vec<MarketBar>> = BTreeMap::new();
        for (i, result) in rdr.records().enumerate() {
            let line = i + 2;
            let record = result.map_err(|e| LivebookError::MarketData {
                reason: format!("CSV parse error: {}", e),
            })?;
            let bar = parse_bar(&record, &columns, line)?;
            days.entry(bar.date).or_default().push(bar);
        }

        Ok(Self { days })
    }
}

impl Columns {
    fn locate(headers: &csv::StringRecord) -> Result<Self, LivebookError> {
        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h.eq_ignore_ascii_case(name))
        };
        let mut required = [0usize; 8];
        for (slot, name) in required.iter_mut().zip(REQUIRED) {
            *slot = find(name).ok_or_else(|| LivebookError::MarketData {
                reason: format!("missing {} column", name),
            })?;
        }
        Ok(Columns {
            required,
            rs_rank: find("rs_rank"),
        })
    }
}

fn cell<'r>(record: &'r csv::StringRecord, idx: usize) -> &'r str {
    record.get(idx).unwrap_or("")
}

fn price(record: &csv::StringRecord, idx: usize, name: &str, line: usize) -> Result<f64, LivebookError> {
    let raw = cell(record, idx);
    if raw.is_empty() {
        return Ok(f64::NAN);
    }
    raw.parse().map_err(|e| LivebookError::MarketData {
        reason: format!("line {}: invalid {} value '{}': {}", line, name, raw, e),
    })
}

fn parse_bar(
    record: &csv::StringRecord,
    columns: &Columns,
    line: usize,
) -> Result<MarketBar, LivebookError> {
    let [date_i, symbol_i, open_i, high_i, low_i, close_i, volume_i, score_i] = columns.required;

    let date_raw = cell(record, date_i);
    let date = NaiveDate::parse_from_str(date_raw, "%Y-%m-%d").map_err(|e| {
        LivebookError::MarketData {
            reason: format!("line {}: invalid date '{}': {}", line, date_raw, e),
        }
    })?;

    let symbol = cell(record, symbol_i);
    if symbol.is_empty() {
        return Err(LivebookError::MarketData {
            reason: format!("line {}: empty symbol", line),
        });
    }

    let volume_raw = cell(record, volume_i);
    let volume = if volume_raw.is_empty() {
        0
    } else {
        // Upstream writes volume as a float column.
        volume_raw
            .parse::<f64>()
            .map(|v| v as i64)
            .map_err(|e| LivebookError::MarketData {
                reason: format!("line {}: invalid volume value '{}': {}", line, volume_raw, e),
            })?
    };

    let rs_rank = match columns.rs_rank.map(|i| cell(record, i)) {
        None | Some("") => None,
        Some(raw) => Some(raw.parse::<f64>().map_err(|e| LivebookError::MarketData {
            reason: format!("line {}: invalid rs_rank value '{}': {}", line, raw, e),
        })?),
    };

    Ok(MarketBar {
        symbol: symbol.to_string(),
        date,
        open: price(record, open_i, "open", line)?,
        high: price(record, high_i, "high", line)?,
        low: price(record, low_i, "low", line)?,
        close: price(record, close_i, "close", line)?,
        volume,
        model_score: price(record, score_i, "model_score", line)?,
        rs_rank,
    })
}

impl MarketDataPort for CsvMarketAdapter {
    fn available_dates(&self) -> Result<Vec<NaiveDate>, LivebookError> {
        Ok(self.days.keys().copied().collect())
    }

    fn load_day(&self, date: NaiveDate) -> Result<MarketView, LivebookError> {
        let bars = self
            .days
            .get(&date)
            .ok_or(LivebookError::NoMarketData { date })?;
        MarketView::new(date, bars.clone())
    }
}
