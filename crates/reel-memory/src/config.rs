//! Store configuration.

use reel_core::Date;

/// Configuration for a [`crate::MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Reject writes that leave a foreign key dangling.
    pub enforce_foreign_keys: bool,
    /// Value of `CURRENT_DATE`; the system clock when unset.
    pub current_date: Option<Date>,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            enforce_foreign_keys: true,
            current_date: None,
        }
    }
}

impl MemoryStoreConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn enforce_foreign_keys(mut self, value: bool) -> Self {
        self.enforce_foreign_keys = value;
        self
    }

    #[must_use]
    pub fn current_date(mut self, date: Date) -> Self {
        self.current_date = Some(date);
        self
    }

    /// Pin `CURRENT_DATE` to January 1st of `year`.
    #[must_use]
    pub fn current_year(mut self, year: i32) -> Self {
        self.current_date = Date::from_ymd(year, 1, 1).ok();
        self
    }

    pub(crate) fn today(&self) -> Date {
        self.current_date.unwrap_or_else(Date::today)
    }
}
