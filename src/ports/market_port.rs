//! Market data access port.

use crate::domain::error::LivebookError;
use crate::domain::market::MarketView;
use chrono::NaiveDate;

pub trait MarketDataPort {
    /// Every trading day the source has data for, ascending.
    fn available_dates(&self) -> Result<Vec<NaiveDate>, LivebookError>;

    /// One day's view. Fails with `NoMarketData` when the date is absent.
    fn load_day(&self, date: NaiveDate) -> Result<MarketView, LivebookError>;
}
