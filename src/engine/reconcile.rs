//! Time reconciliation: the single place where the passage of time changes
//! state.
//!
//! One pass locks every lot in sorted id order, then:
//!   - expires bookings whose window has closed (`end <= now`): the booking
//!     moves to history, its spot is freed, and the owner gets ONE batched
//!     warning no matter how many bookings expired;
//!   - activates bookings whose window contains `now`: the spot flips to
//!     Occupied and the owner is told per booking.
//!
//! The whole pass is one WAL transaction, and a pass that finds nothing to
//! do writes nothing. Running it twice at the same instant is a no-op the
//! second time.

use std::collections::{BTreeMap, HashSet};

use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::mutations::archive_record;
use super::{Engine, EngineError};

impl Engine {
    pub async fn reconcile(&self, now: Ms) -> Result<ReconcileSummary, EngineError> {
        let _commit = self.commit_gate.read().await;
        let mut guards = self.lock_all_lots().await;

        let mut txn: Vec<Event> = Vec::new();
        let mut summary = ReconcileSummary::default();
        // user id → expired-booking count, for the batched warning
        let mut expired_by_user: BTreeMap<Ulid, usize> = BTreeMap::new();

        for (lot_id, lot) in guards.iter() {
            // Spots whose occupant expires in this pass. A back-to-back
            // booking on the same spot must activate in the same pass, and
            // the in-memory status only flips when the events apply.
            let mut freed: HashSet<Ulid> = HashSet::new();

            for booking in &lot.bookings {
                if booking.span.end <= now {
                    txn.push(Event::BookingArchived {
                        lot_id: *lot_id,
                        booking_id: booking.id,
                        record: archive_record(lot, booking),
                    });
                    if lot
                        .spot(booking.spot_id)
                        .is_some_and(|s| s.status == SpotStatus::Occupied)
                    {
                        txn.push(Event::SpotFreed {
                            id: booking.spot_id,
                            lot_id: *lot_id,
                        });
                        freed.insert(booking.spot_id);
                    }
                    summary.expired += 1;
                    *expired_by_user.entry(booking.user_id).or_default() += 1;
                }
            }

            for booking in &lot.bookings {
                if !booking.span.contains_instant(now) {
                    continue;
                }
                let effectively_available = freed.contains(&booking.spot_id)
                    || lot
                        .spot(booking.spot_id)
                        .is_some_and(|s| s.status == SpotStatus::Available);
                if !effectively_available {
                    continue;
                }
                txn.push(Event::SpotOccupied {
                    id: booking.spot_id,
                    lot_id: *lot_id,
                });
                txn.push(Event::NotificationQueued {
                    record: Notification {
                        id: Ulid::new(),
                        user_id: booking.user_id,
                        category: Category::Info,
                        text: format!(
                            "Your booking at {} is now active (vehicle {}).",
                            lot.profile.name, booking.vehicle
                        ),
                        read: false,
                        created_at: now,
                    },
                });
                summary.activated += 1;
            }
        }

        for (user_id, count) in &expired_by_user {
            let text = if *count == 1 {
                "1 of your bookings expired and was moved to history.".to_string()
            } else {
                format!("{count} of your bookings expired and were moved to history.")
            };
            txn.push(Event::NotificationQueued {
                record: Notification {
                    id: Ulid::new(),
                    user_id: *user_id,
                    category: Category::Warning,
                    text,
                    read: false,
                    created_at: now,
                },
            });
        }

        metrics::counter!(observability::RECONCILE_RUNS_TOTAL).increment(1);
        if summary.is_noop() {
            return Ok(summary);
        }
        metrics::counter!(observability::RECONCILE_ACTIVATED_TOTAL)
            .increment(summary.activated as u64);
        metrics::counter!(observability::RECONCILE_EXPIRED_TOTAL)
            .increment(summary.expired as u64);

        self.persist_and_apply_multi(&mut guards, &txn).await?;
        Ok(summary)
    }
}
