use chrono::Days;

use crate::model::*;

use super::error::PolicyViolation;

/// Stay-length and lead-time rules, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingPolicy {
    pub max_stay_length: u32,
    pub default_listing_length: u32,
    pub min_days_ahead: u32,
    pub max_days_ahead: u32,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            max_stay_length: 3,
            default_listing_length: 30,
            min_days_ahead: 1,
            max_days_ahead: 30,
        }
    }
}

impl BookingPolicy {
    /// Check a proposed stay against the rules, in order: length, then
    /// minimum lead time, then maximum lead time. Stops at the first violation.
    pub fn validate(&self, span: &Span, today: Day) -> Result<(), PolicyViolation> {
        let requested_days = span.days();
        if requested_days > i64::from(self.max_stay_length) {
            return Err(PolicyViolation::StayTooLong {
                requested_days,
                max_days: self.max_stay_length,
            });
        }

        let earliest = add_days(today, self.min_days_ahead);
        if span.start < earliest {
            return Err(PolicyViolation::TooSoon {
                earliest,
                min_days_ahead: self.min_days_ahead,
            });
        }

        let latest = add_days(today, self.max_days_ahead);
        if span.start > latest {
            return Err(PolicyViolation::TooFarAhead {
                latest,
                max_days_ahead: self.max_days_ahead,
            });
        }
        Ok(())
    }

    /// Listing length, falling back to the configured default.
    pub fn listing_length(&self, number_of_days: Option<u32>) -> u32 {
        number_of_days.unwrap_or(self.default_listing_length)
    }
}

fn add_days(d: Day, n: u32) -> Day {
    d.checked_add_days(Days::new(u64::from(n))).unwrap_or(Day::MAX)
}
