use tracing::info;

use crate::model::*;

use super::conflict::{check_no_conflict, today, validate_owner, validate_span};
use super::{rejected, Engine, EngineError};

impl Engine {
    /// Book `[start_date, end_date)` for `owner`, judged against today's date.
    pub async fn create(&self, owner: User, start_date: Day, end_date: Day) -> Result<Reservation, EngineError> {
        self.create_as_of(owner, start_date, end_date, today()).await
    }

    /// Book `[start_date, end_date)` for `owner` with an explicit `today`.
    ///
    /// Runs the booking policy, then refuses if any stored reservation
    /// overlaps. The store re-checks overlap atomically with the insert, so a
    /// concurrent create that slipped in after the lookup still surfaces as
    /// `Conflict`.
    pub async fn create_as_of(
        &self,
        owner: User,
        start_date: Day,
        end_date: Day,
        today: Day,
    ) -> Result<Reservation, EngineError> {
        self.try_create(owner, start_date, end_date, today)
            .await
            .map_err(|e| rejected("create", e))
    }

    async fn try_create(
        &self,
        owner: User,
        start_date: Day,
        end_date: Day,
        today: Day,
    ) -> Result<Reservation, EngineError> {
        let span = validate_span(start_date, end_date)?;
        validate_owner(&owner)?;
        self.policy.validate(&span, today)?;

        let existing = self.store.find_conflicting(span).await?;
        check_no_conflict(&existing, &span)?;

        let created = self.store.save(Reservation::new(owner, span)).await?;
        info!(
            "created reservation {} [{}, {}) for {}",
            created.id.unwrap_or_default(),
            created.start_date,
            created.end_date,
            created.owner.email
        );
        Ok(created)
    }

    /// Persist new dates/owner for an existing reservation. The caller's
    /// `version` must be the current one. Policy and overlap with other
    /// reservations are not re-checked.
    pub async fn update(&self, reservation: Reservation) -> Result<Reservation, EngineError> {
        self.try_update(reservation)
            .await
            .map_err(|e| rejected("update", e))
    }

    async fn try_update(&self, reservation: Reservation) -> Result<Reservation, EngineError> {
        let Some(id) = reservation.id else {
            return Err(EngineError::InvalidArgument("reservation id is required for update"));
        };
        if reservation.version.is_none() {
            return Err(EngineError::InvalidArgument("reservation version is required for update"));
        }
        validate_span(reservation.start_date, reservation.end_date)?;
        validate_owner(&reservation.owner)?;

        let updated = self.store.save(reservation).await?;
        info!(
            "updated reservation {id} to [{}, {}) at version {}",
            updated.start_date,
            updated.end_date,
            updated.version.unwrap_or_default()
        );
        Ok(updated)
    }

    /// Remove a reservation. The caller's `version` must be the current one.
    pub async fn delete(&self, reservation: &Reservation) -> Result<(), EngineError> {
        self.try_delete(reservation)
            .await
            .map_err(|e| rejected("delete", e))
    }

    async fn try_delete(&self, reservation: &Reservation) -> Result<(), EngineError> {
        let Some(id) = reservation.id else {
            return Err(EngineError::InvalidArgument("reservation id is required for delete"));
        };
        if reservation.version.is_none() {
            return Err(EngineError::InvalidArgument("reservation version is required for delete"));
        }
        self.store.delete(reservation).await?;
        info!("deleted reservation {id}");
        Ok(())
    }
}
