//! Read-only operations. Queries take read locks per lot and never touch
//! the WAL.

use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, SharedLotState, availability};

fn lot_stats(lot: &LotState, now: Ms) -> LotStats {
    LotStats {
        id: lot.id,
        profile: lot.profile.clone(),
        total_spots: lot.spots.len(),
        occupied_spots: lot
            .spots
            .iter()
            .filter(|s| s.status == SpotStatus::Occupied)
            .count(),
        active_bookings: lot.bookings.iter().filter(|b| b.span.end > now).count(),
    }
}

impl Engine {
    /// Snapshot of every lot's shared handle. Taken up-front so no DashMap
    /// ref is held across an await.
    fn lot_handles(&self) -> Vec<SharedLotState> {
        self.lots.iter().map(|e| e.value().clone()).collect()
    }

    /// Distinct cities that have at least one lot, sorted.
    pub async fn cities(&self) -> Vec<String> {
        let mut cities = Vec::new();
        for lot_arc in self.lot_handles() {
            let lot = lot_arc.read().await;
            if !cities.contains(&lot.profile.city) {
                cities.push(lot.profile.city.clone());
            }
        }
        cities.sort();
        cities
    }

    /// Lots whose city contains `query` (case-insensitive) or whose pincode
    /// starts with it. An empty query matches everything.
    pub async fn search_lots(&self, query: &str, now: Ms) -> Vec<LotStats> {
        let needle = query.trim().to_lowercase();
        let mut out = Vec::new();
        for lot_arc in self.lot_handles() {
            let lot = lot_arc.read().await;
            let matches = needle.is_empty()
                || lot.profile.city.to_lowercase().contains(&needle)
                || lot.profile.pincode.starts_with(&needle);
            if matches {
                out.push(lot_stats(&lot, now));
            }
        }
        out.sort_by(|a, b| a.profile.name.cmp(&b.profile.name));
        out
    }

    /// Per-spot availability of one lot for a prospective interval.
    pub async fn compute_availability(
        &self,
        lot_id: Ulid,
        span: Span,
        now: Ms,
    ) -> Result<AvailabilityReport, EngineError> {
        availability::validate_booking_interval(&span, now)?;
        let lot_arc = self.get_lot(&lot_id).ok_or(EngineError::NotFound(lot_id))?;
        let lot = lot_arc.read().await;
        Ok(availability::find_availability(&lot, &span))
    }

    pub async fn spot_details(&self, spot_id: Ulid, now: Ms) -> Result<SpotDetails, EngineError> {
        let lot_id = self
            .lot_for_spot(&spot_id)
            .ok_or(EngineError::NotFound(spot_id))?;
        let lot_arc = self.get_lot(&lot_id).ok_or(EngineError::NotFound(lot_id))?;
        let lot = lot_arc.read().await;
        let spot = lot.spot(spot_id).ok_or(EngineError::NotFound(spot_id))?;

        let mut current = None;
        let mut future = Vec::new();
        for booking in &lot.bookings {
            if booking.spot_id != spot_id {
                continue;
            }
            if booking.span.contains_instant(now) {
                current = Some(booking.clone());
            } else if booking.span.start > now {
                future.push(booking.clone());
            }
        }

        let has_bookings = lot.bookings.iter().any(|b| b.spot_id == spot_id);
        Ok(SpotDetails {
            spot_id,
            status: spot.status,
            current,
            future,
            deletable: spot.status == SpotStatus::Available && !has_bookings,
        })
    }

    /// The lot's stats plus one summary row per spot.
    pub async fn lot_spots(
        &self,
        lot_id: Ulid,
        now: Ms,
    ) -> Result<(LotStats, Vec<SpotSummary>), EngineError> {
        let lot_arc = self.get_lot(&lot_id).ok_or(EngineError::NotFound(lot_id))?;
        let lot = lot_arc.read().await;

        let spots = lot
            .spots
            .iter()
            .map(|spot| SpotSummary {
                id: spot.id,
                status: spot.status,
                future_booked: spot.status == SpotStatus::Available
                    && lot
                        .bookings
                        .iter()
                        .any(|b| b.spot_id == spot.id && b.span.end > now),
            })
            .collect();

        Ok((lot_stats(&lot, now), spots))
    }

    /// All live bookings of one user, across lots, start time ascending.
    pub async fn user_bookings(&self, user_id: Ulid) -> Vec<BookingView> {
        let mut out = Vec::new();
        for lot_arc in self.lot_handles() {
            let lot = lot_arc.read().await;
            for booking in lot.bookings.iter().filter(|b| b.user_id == user_id) {
                out.push(BookingView {
                    lot_id: lot.id,
                    lot_name: lot.profile.name.clone(),
                    booking: booking.clone(),
                });
            }
        }
        out.sort_by_key(|v| v.booking.span.start);
        out
    }

    /// A user's archived bookings, most recent first, capped at `limit`.
    pub fn user_history(&self, user_id: Ulid, limit: usize) -> Vec<HistoryRecord> {
        let mut records = self
            .history
            .get(&user_id)
            .map(|r| r.clone())
            .unwrap_or_default();
        records.sort_by(|a, b| b.span.start.cmp(&a.span.start));
        records.truncate(limit);
        records
    }

    /// The user's most-visited lots (by archived bookings), top five.
    pub fn user_summary(&self, user_id: Ulid) -> Vec<LotUsage> {
        let mut visits: HashMap<String, usize> = HashMap::new();
        if let Some(records) = self.history.get(&user_id) {
            for record in records.iter() {
                *visits.entry(record.lot_name.clone()).or_default() += 1;
            }
        }
        rank_usage(visits, 5)
    }

    pub async fn platform_totals(&self) -> PlatformTotals {
        let mut bookings = 0;
        for lot_arc in self.lot_handles() {
            bookings += lot_arc.read().await.bookings.len();
        }
        PlatformTotals {
            users: self.users.len(),
            lots: self.lots.len(),
            bookings,
            history: self.history.iter().map(|e| e.value().len()).sum(),
        }
    }

    /// Platform-wide most-visited lots, from archived bookings.
    pub fn top_lots(&self, limit: usize) -> Vec<LotUsage> {
        let mut visits: HashMap<String, usize> = HashMap::new();
        for entry in self.history.iter() {
            for record in entry.value() {
                *visits.entry(record.lot_name.clone()).or_default() += 1;
            }
        }
        rank_usage(visits, limit)
    }

    pub fn list_users(&self) -> Vec<UserInfo> {
        let mut users: Vec<UserInfo> = self
            .users
            .iter()
            .map(|e| UserInfo::from(e.value()))
            .collect();
        users.sort_by_key(|u| u.id);
        users
    }

    /// Full user record (including the password hash) for credential checks.
    pub fn user_by_email(&self, email: &str) -> Option<User> {
        let email = email.trim().to_ascii_lowercase();
        let id = *self.email_index.get(&email)?;
        self.get_user(&id)
    }
}

fn rank_usage(visits: HashMap<String, usize>, limit: usize) -> Vec<LotUsage> {
    let mut usage: Vec<LotUsage> = visits
        .into_iter()
        .map(|(lot_name, visits)| LotUsage { lot_name, visits })
        .collect();
    usage.sort_by(|a, b| b.visits.cmp(&a.visits).then(a.lot_name.cmp(&b.lot_name)));
    usage.truncate(limit);
    usage
}
