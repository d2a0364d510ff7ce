use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Calendar day, the only time type.
pub type Day = NaiveDate;

/// Optimistic concurrency token. The first persisted version is 1.
pub type Version = u64;

/// Two half-open day ranges `[a_start, a_end)` and `[b_start, b_end)` overlap
/// iff each one starts before the other ends.
pub fn overlaps(a_start: Day, a_end: Day, b_start: Day, b_end: Day) -> bool {
    a_start < b_end && b_start < a_end
}

/// Half-open interval `[start, end)` of days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Day,
    pub end: Day,
}

impl Span {
    pub fn new(start: Day, end: Day) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Build a span only if `start < end`.
    pub fn try_new(start: Day, end: Day) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    /// `start .. start + days`.
    pub fn from_length(start: Day, days: u32) -> Option<Self> {
        let end = start.checked_add_days(chrono::Days::new(u64::from(days)))?;
        Self::try_new(start, end)
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }

    pub fn contains_day(&self, d: Day) -> bool {
        self.start <= d && d < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Option<Ulid>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: String,
}

impl User {
    pub fn new(first_name: Option<String>, last_name: Option<String>, email: impl Into<String>) -> Self {
        Self {
            id: None,
            first_name,
            last_name,
            email: email.into(),
        }
    }
}

/// A campsite stay. `id` and `version` are `None` until the store persists it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Option<Ulid>,
    pub version: Option<Version>,
    pub start_date: Day,
    pub end_date: Day,
    pub owner: User,
}

impl Reservation {
    pub fn new(owner: User, span: Span) -> Self {
        Self {
            id: None,
            version: None,
            start_date: span.start,
            end_date: span.end,
            owner,
        }
    }

    /// The stay as a span, or `None` if the dates are not ordered.
    pub fn span(&self) -> Option<Span> {
        Span::try_new(self.start_date, self.end_date)
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }
}

/// A persisted reservation as the ledger stores it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stay {
    pub id: Ulid,
    pub version: Version,
    pub span: Span,
    pub owner: User,
}

impl Stay {
    pub fn to_reservation(&self) -> Reservation {
        Reservation {
            id: Some(self.id),
            version: Some(self.version),
            start_date: self.span.start,
            end_date: self.span.end,
            owner: self.owner.clone(),
        }
    }
}

/// All live reservations of the campsite, sorted by `span.start`.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    pub stays: Vec<Stay>,
}

impl Ledger {
    pub fn new() -> Self {
        Self { stays: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.stays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stays.is_empty()
    }

    /// Insert a stay maintaining sort order by span.start.
    pub fn insert(&mut self, stay: Stay) {
        let pos = self
            .stays
            .partition_point(|s| s.span.start <= stay.span.start);
        self.stays.insert(pos, stay);
    }

    /// Remove a stay by id.
    pub fn remove(&mut self, id: Ulid) -> Option<Stay> {
        let pos = self.stays.iter().position(|s| s.id == id)?;
        Some(self.stays.remove(pos))
    }

    pub fn get(&self, id: &Ulid) -> Option<&Stay> {
        self.stays.iter().find(|s| s.id == *id)
    }

    /// Return only stays whose span overlaps the query window.
    /// Uses binary search to skip stays starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Stay> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self.stays.partition_point(|s| s.span.start < query.end);
        self.stays[..right_bound]
            .iter()
            .filter(move |s| s.span.overlaps(query))
    }
}

/// The event types, flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationCreated {
        id: Ulid,
        version: Version,
        span: Span,
        owner: User,
    },
    ReservationUpdated {
        id: Ulid,
        version: Version,
        span: Span,
        owner: User,
    },
    ReservationDeleted {
        id: Ulid,
    },
}

impl Event {
    pub fn reservation_id(&self) -> Ulid {
        match self {
            Event::ReservationCreated { id, .. }
            | Event::ReservationUpdated { id, .. }
            | Event::ReservationDeleted { id } => *id,
        }
    }
}

#[cfg(test)]
pub(crate) fn day(s: &str) -> Day {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}
