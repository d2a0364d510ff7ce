use crate::model::*;

use super::EngineError;

/// Current UTC calendar day.
pub(crate) fn today() -> Day {
    chrono::Utc::now().date_naive()
}

pub(crate) fn validate_span(start: Day, end: Day) -> Result<Span, EngineError> {
    Span::try_new(start, end).ok_or(EngineError::InvalidArgument("start date must be before end date"))
}

pub(crate) fn validate_owner(owner: &User) -> Result<(), EngineError> {
    use crate::limits::MAX_NAME_LEN;
    if owner.email.trim().is_empty() {
        return Err(EngineError::InvalidArgument("owner email is required"));
    }
    if owner.email.len() > MAX_NAME_LEN {
        return Err(EngineError::InvalidArgument("owner email too long"));
    }
    let too_long = |n: &Option<String>| n.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN);
    if too_long(&owner.first_name) || too_long(&owner.last_name) {
        return Err(EngineError::InvalidArgument("owner name too long"));
    }
    Ok(())
}

/// Fails with the first reservation in `existing` that overlaps `span`.
pub(crate) fn check_no_conflict(existing: &[Reservation], span: &Span) -> Result<(), EngineError> {
    for r in existing {
        let Some(other) = r.span() else { continue };
        if other.overlaps(span) {
            return Err(EngineError::Conflict(r.id.unwrap_or_default()));
        }
    }
    Ok(())
}
