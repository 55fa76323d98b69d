//! Pure availability logic over a lot's booking set.
//!
//! Everything here takes `&LotState` and an interval; no locks, no IO. The
//! mutation path calls `spot_conflict` a second time under the lot's write
//! lock before committing, which is what makes double-booking impossible.

use ulid::Ulid;

use crate::limits::{
    MAX_BOOKING_HORIZON_MS, MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS,
};
use crate::model::{AvailabilityReport, Booking, LotState, Ms, Span, SpotConflicts};

use super::EngineError;

/// Reject malformed or out-of-window booking intervals.
///
/// A valid interval starts strictly in the future, ends after it starts,
/// ends within the booking horizon, and sits inside sane timestamp bounds.
pub fn validate_booking_interval(span: &Span, now: Ms) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::InvalidInterval("timestamp out of range"));
    }
    if span.end <= span.start {
        return Err(EngineError::InvalidInterval("end must be after start"));
    }
    if span.start <= now {
        return Err(EngineError::InvalidInterval("start must be in the future"));
    }
    if span.end - now > MAX_BOOKING_HORIZON_MS {
        return Err(EngineError::InvalidInterval(
            "interval extends past the booking horizon",
        ));
    }
    Ok(())
}

/// The first booking on `spot_id` that overlaps `span`, if any.
///
/// Overlap is half-open: a booking ending exactly when the request starts
/// does not conflict.
pub fn spot_conflict<'a>(lot: &'a LotState, spot_id: Ulid, span: &Span) -> Option<&'a Booking> {
    lot.bookings_overlapping(span)
        .find(|b| b.spot_id == spot_id)
}

/// Per-spot availability for `span` across the whole lot.
///
/// Spots with no overlapping booking land in `available` (lot order
/// preserved, so the reserve path picks the first deterministically);
/// the rest land in `conflicts` with their blocking intervals.
pub fn find_availability(lot: &LotState, span: &Span) -> AvailabilityReport {
    let overlapping: Vec<&Booking> = lot.bookings_overlapping(span).collect();

    let mut available = Vec::new();
    let mut conflicts = Vec::new();
    for spot in &lot.spots {
        let blocking: Vec<Span> = overlapping
            .iter()
            .filter(|b| b.spot_id == spot.id)
            .map(|b| b.span)
            .collect();
        if blocking.is_empty() {
            available.push(spot.id);
        } else {
            conflicts.push(SpotConflicts {
                spot_id: spot.id,
                intervals: blocking,
            });
        }
    }

    AvailabilityReport {
        available,
        conflicts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LotProfile, Spot, SpotStatus};

    const H: Ms = 3_600_000;

    fn lot_with_spots(n: usize) -> LotState {
        let mut lot = LotState::new(
            Ulid::new(),
            LotProfile {
                name: "Test Lot".into(),
                address: "1 Main St".into(),
                city: "Springfield".into(),
                pincode: "560001".into(),
                area_type: "street".into(),
                price_per_hour: 30.0,
            },
        );
        for _ in 0..n {
            lot.spots.push(Spot {
                id: Ulid::new(),
                status: SpotStatus::Available,
            });
        }
        lot
    }

    fn booking(spot_id: Ulid, start: Ms, end: Ms) -> Booking {
        Booking {
            id: Ulid::new(),
            user_id: Ulid::new(),
            spot_id,
            span: Span::new(start, end),
            cost: 30.0,
            vehicle: "KA-01-1234".into(),
        }
    }

    #[test]
    fn interval_validation() {
        let now = 1_000 * H;
        assert!(validate_booking_interval(&Span::new(now + H, now + 2 * H), now).is_ok());
        // start in the past
        assert!(validate_booking_interval(&Span::new(now - H, now + H), now).is_err());
        // start == now is still not "in the future"
        assert!(validate_booking_interval(&Span::new(now, now + H), now).is_err());
        // end before start
        assert!(validate_booking_interval(&Span::new(now + 2 * H, now + H), now).is_err());
        // past the horizon
        assert!(
            validate_booking_interval(
                &Span::new(now + H, now + MAX_BOOKING_HORIZON_MS + H),
                now
            )
            .is_err()
        );
        // exactly at the horizon is allowed
        assert!(
            validate_booking_interval(&Span::new(now + H, now + MAX_BOOKING_HORIZON_MS), now)
                .is_ok()
        );
    }

    #[test]
    fn conflict_is_half_open() {
        let mut lot = lot_with_spots(1);
        let spot = lot.spots[0].id;
        lot.insert_booking(booking(spot, 10 * H, 12 * H));

        // back-to-back does not conflict
        assert!(spot_conflict(&lot, spot, &Span::new(12 * H, 14 * H)).is_none());
        assert!(spot_conflict(&lot, spot, &Span::new(8 * H, 10 * H)).is_none());
        // any overlap does
        assert!(spot_conflict(&lot, spot, &Span::new(11 * H, 13 * H)).is_some());
        assert!(spot_conflict(&lot, spot, &Span::new(9 * H, 11 * H)).is_some());
        assert!(spot_conflict(&lot, spot, &Span::new(10 * H + 1, 12 * H - 1)).is_some());
    }

    #[test]
    fn availability_partitions_spots() {
        let mut lot = lot_with_spots(3);
        let busy = lot.spots[1].id;
        lot.insert_booking(booking(busy, 10 * H, 12 * H));

        let report = find_availability(&lot, &Span::new(11 * H, 13 * H));
        assert_eq!(report.available.len(), 2);
        assert!(!report.available.contains(&busy));
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.conflicts[0].spot_id, busy);
        assert_eq!(report.conflicts[0].intervals, vec![Span::new(10 * H, 12 * H)]);
    }

    #[test]
    fn availability_preserves_spot_order() {
        let lot = lot_with_spots(4);
        let report = find_availability(&lot, &Span::new(H, 2 * H));
        let ids: Vec<Ulid> = lot.spots.iter().map(|s| s.id).collect();
        assert_eq!(report.available, ids);
    }

    #[test]
    fn fully_booked_lot_has_no_availability() {
        let mut lot = lot_with_spots(2);
        let ids: Vec<Ulid> = lot.spots.iter().map(|s| s.id).collect();
        for id in ids {
            lot.insert_booking(booking(id, 10 * H, 12 * H));
        }
        let report = find_availability(&lot, &Span::new(10 * H, 11 * H));
        assert!(report.available.is_empty());
        assert_eq!(report.conflicts.len(), 2);
    }
}
