//! Booking termination: user-initiated release and cancellation.
//!
//! Both paths move the booking into the requester's history in the same
//! transaction that frees the spot, so a crash can never leave a booking
//! half-terminated.

use ulid::Ulid;

use crate::model::*;

use super::mutations::archive_record;
use super::{Engine, EngineError};

impl Engine {
    /// Terminate a booking.
    ///
    /// A booking whose window has not opened yet is cancelled; an active
    /// booking is released and its spot freed. Either way the history record
    /// mirrors the booking's fields, cost included. Only the owner (or an
    /// admin) may terminate a booking.
    pub async fn release_booking(
        &self,
        requester: Ulid,
        booking_id: Ulid,
        now: Ms,
    ) -> Result<(ReleaseKind, HistoryRecord), EngineError> {
        let requester_is_admin = self
            .get_user(&requester)
            .ok_or(EngineError::NotFound(requester))?
            .is_admin;

        let _commit = self.commit_gate.read().await;
        let lot_id = self
            .lot_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let lot_arc = self.get_lot(&lot_id).ok_or(EngineError::NotFound(lot_id))?;
        let mut lot = lot_arc.write().await;
        self.ensure_live(&lot)?;

        let booking = lot
            .booking(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?
            .clone();
        if booking.user_id != requester && !requester_is_admin {
            return Err(EngineError::Validation("booking belongs to another user"));
        }

        let kind = if booking.span.start > now {
            ReleaseKind::CancelledFuture
        } else {
            ReleaseKind::ReleasedActive
        };

        let record = archive_record(&lot, &booking);

        let mut txn = vec![Event::BookingArchived {
            lot_id,
            booking_id,
            record: record.clone(),
        }];
        if kind == ReleaseKind::ReleasedActive
            && lot
                .spot(booking.spot_id)
                .is_some_and(|s| s.status == SpotStatus::Occupied)
        {
            txn.push(Event::SpotFreed {
                id: booking.spot_id,
                lot_id,
            });
        }

        self.persist_and_apply(&mut lot, &txn).await?;
        Ok((kind, record))
    }
}
