use ulid::Ulid;

use crate::limits::MAX_LISTING_DAYS;
use crate::model::*;

use super::{rejected, Engine, EngineError};

impl Engine {
    /// Every reservation overlapping `[start_date, start_date + days)`, in
    /// store order. `None` uses the configured default listing length.
    pub async fn list_within_range(
        &self,
        start_date: Day,
        number_of_days: Option<u32>,
    ) -> Result<Vec<Reservation>, EngineError> {
        let days = self.policy.listing_length(number_of_days);
        if days == 0 {
            return Err(rejected("list", EngineError::InvalidArgument("number of days must be positive")));
        }
        if days > MAX_LISTING_DAYS {
            return Err(rejected("list", EngineError::InvalidArgument("listing window too wide")));
        }
        let span = Span::from_length(start_date, days)
            .ok_or_else(|| rejected("list", EngineError::InvalidArgument("listing window out of range")))?;

        self.store
            .find_conflicting(span)
            .await
            .map_err(|e| rejected("list", e.into()))
    }

    pub async fn get(&self, id: Ulid) -> Result<Option<Reservation>, EngineError> {
        self.store
            .find_by_id(id)
            .await
            .map_err(|e| rejected("get", e.into()))
    }
}
