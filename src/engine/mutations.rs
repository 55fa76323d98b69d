//! State-changing operations: accounts, lots, spots, reservations.
//!
//! Every mutation follows the same shape: validate, take the engine's commit
//! gate (read), acquire the lot's write lock where one is involved, re-check
//! preconditions under the lock, append the whole transaction to the WAL,
//! then apply it to memory. Nothing is visible to readers until the WAL has
//! accepted it, and compaction (the gate's sole writer) can never snapshot
//! between a transaction's fsync and its apply.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::auth;
use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, availability};

fn validate_email(email: &str) -> Result<(), EngineError> {
    if email.is_empty() || email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::Validation("email length out of range"));
    }
    let Some((local, domain)) = email.split_once('@') else {
        return Err(EngineError::Validation("email must contain '@'"));
    };
    if local.is_empty() || domain.is_empty() {
        return Err(EngineError::Validation("email must have local and domain parts"));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(EngineError::Validation("name length out of range"));
    }
    Ok(())
}

fn validate_profile(profile: &LotProfile) -> Result<(), EngineError> {
    validate_name(&profile.name)?;
    if profile.address.is_empty() || profile.address.len() > MAX_ADDRESS_LEN {
        return Err(EngineError::Validation("address length out of range"));
    }
    if profile.city.is_empty() || profile.city.len() > MAX_NAME_LEN {
        return Err(EngineError::Validation("city length out of range"));
    }
    if profile.pincode.is_empty() || profile.pincode.len() > MAX_PINCODE_LEN {
        return Err(EngineError::Validation("pincode length out of range"));
    }
    if profile.area_type.len() > MAX_NAME_LEN {
        return Err(EngineError::Validation("area type too long"));
    }
    if !profile.price_per_hour.is_finite() || profile.price_per_hour <= 0.0 {
        return Err(EngineError::Validation("price per hour must be positive"));
    }
    Ok(())
}

fn validate_vehicle(vehicle: &str) -> Result<(), EngineError> {
    if vehicle.is_empty() || vehicle.len() > MAX_VEHICLE_LEN {
        return Err(EngineError::Validation("vehicle number length out of range"));
    }
    Ok(())
}

impl Engine {
    pub async fn register_user(
        &self,
        email: &str,
        password: &str,
        name: &str,
        is_admin: bool,
    ) -> Result<UserInfo, EngineError> {
        let email = email.trim().to_ascii_lowercase();
        validate_email(&email)?;
        let name = name.trim();
        validate_name(name)?;
        if password.is_empty() {
            return Err(EngineError::Validation("password must not be empty"));
        }
        if self.users.len() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("user capacity reached"));
        }

        let user = User {
            id: Ulid::new(),
            email: email.clone(),
            pass_hash: auth::hash_password(password),
            name: name.to_string(),
            is_admin,
        };

        let _commit = self.commit_gate.read().await;
        // Reserve the email before hitting the WAL so two concurrent
        // registrations can't both commit the same address.
        match self.email_index.entry(email) {
            Entry::Occupied(_) => return Err(EngineError::EmailInUse(user.email)),
            Entry::Vacant(v) => {
                v.insert(user.id);
            }
        }

        let txn = vec![Event::UserRegistered { user: user.clone() }];
        if let Err(e) = self.wal_append(&txn).await {
            self.email_index.remove(&user.email);
            return Err(e);
        }
        self.apply_event(None, &txn[0]);
        Ok(UserInfo::from(&user))
    }

    /// Update a user's profile. `password: None` keeps the current hash.
    pub async fn update_user(
        &self,
        id: Ulid,
        email: &str,
        password: Option<&str>,
        name: &str,
    ) -> Result<UserInfo, EngineError> {
        let email = email.trim().to_ascii_lowercase();
        validate_email(&email)?;
        let name = name.trim();
        validate_name(name)?;

        let current = self.get_user(&id).ok_or(EngineError::NotFound(id))?;

        let _commit = self.commit_gate.read().await;
        let mut reserved_email = false;
        if email != current.email {
            match self.email_index.entry(email.clone()) {
                Entry::Occupied(_) => return Err(EngineError::EmailInUse(email)),
                Entry::Vacant(v) => {
                    v.insert(id);
                    reserved_email = true;
                }
            }
        }

        let pass_hash = match password {
            Some(p) if !p.is_empty() => auth::hash_password(p),
            Some(_) => {
                if reserved_email {
                    self.email_index.remove(&email);
                }
                return Err(EngineError::Validation("password must not be empty"));
            }
            None => current.pass_hash.clone(),
        };

        let txn = vec![Event::UserUpdated {
            id,
            email: email.clone(),
            pass_hash,
            name: name.to_string(),
        }];
        if let Err(e) = self.wal_append(&txn).await {
            if reserved_email {
                self.email_index.remove(&email);
            }
            return Err(e);
        }
        self.apply_event(None, &txn[0]);

        Ok(UserInfo {
            id,
            email,
            name: name.to_string(),
            is_admin: current.is_admin,
        })
    }

    /// Delete an account. Refused while the user holds any booking that has
    /// not yet ended; already-ended bookings are archived in the same
    /// transaction, then the cascade removes history and notifications.
    pub async fn delete_user(&self, id: Ulid, now: Ms) -> Result<(), EngineError> {
        let user = self.get_user(&id).ok_or(EngineError::NotFound(id))?;
        if user.is_admin {
            return Err(EngineError::Integrity("admin accounts cannot be deleted"));
        }

        let _commit = self.commit_gate.read().await;
        let mut guards = self.lock_all_lots().await;

        let mut txn = Vec::new();
        for (lot_id, lot) in guards.iter() {
            for booking in lot.bookings.iter().filter(|b| b.user_id == id) {
                if booking.span.end > now {
                    return Err(EngineError::Integrity(
                        "user has active or future bookings",
                    ));
                }
                txn.push(Event::BookingArchived {
                    lot_id: *lot_id,
                    booking_id: booking.id,
                    record: archive_record(lot, booking),
                });
                if lot.spot(booking.spot_id).is_some_and(|s| s.status == SpotStatus::Occupied) {
                    txn.push(Event::SpotFreed {
                        id: booking.spot_id,
                        lot_id: *lot_id,
                    });
                }
            }
        }
        txn.push(Event::UserDeleted { id });

        self.persist_and_apply_multi(&mut guards, &txn).await
    }

    /// Create a lot with `spot_count` fresh spots, atomically.
    pub async fn create_lot(
        &self,
        profile: LotProfile,
        spot_count: usize,
    ) -> Result<Ulid, EngineError> {
        validate_profile(&profile)?;
        if spot_count == 0 {
            return Err(EngineError::Validation("a lot needs at least one spot"));
        }
        if spot_count > MAX_SPOTS_PER_LOT {
            return Err(EngineError::LimitExceeded("spot count exceeds per-lot maximum"));
        }
        if self.lots.len() >= MAX_LOTS {
            return Err(EngineError::LimitExceeded("lot capacity reached"));
        }

        let id = Ulid::new();
        let mut txn = vec![Event::LotCreated {
            id,
            profile: profile.clone(),
        }];
        for _ in 0..spot_count {
            txn.push(Event::SpotAdded {
                id: Ulid::new(),
                lot_id: id,
            });
        }

        let _commit = self.commit_gate.read().await;
        self.wal_append(&txn).await?;
        let mut lot = LotState::new(id, profile);
        for event in &txn[1..] {
            self.apply_event(Some(&mut lot), event);
        }
        self.lots.insert(id, Arc::new(RwLock::new(lot)));
        Ok(id)
    }

    /// Replace a lot's profile. Existing bookings keep the cost they were
    /// priced at.
    pub async fn update_lot(&self, id: Ulid, profile: LotProfile) -> Result<(), EngineError> {
        validate_profile(&profile)?;
        let _commit = self.commit_gate.read().await;
        let lot_arc = self.get_lot(&id).ok_or(EngineError::NotFound(id))?;
        let mut lot = lot_arc.write().await;
        self.ensure_live(&lot)?;

        let txn = vec![Event::LotUpdated { id, profile }];
        self.persist_and_apply(&mut lot, &txn).await
    }

    /// Delete a lot. Refused while any booking (active or future) exists.
    pub async fn delete_lot(&self, id: Ulid) -> Result<(), EngineError> {
        let _commit = self.commit_gate.read().await;
        let lot_arc = self.get_lot(&id).ok_or(EngineError::NotFound(id))?;
        let lot = lot_arc.write().await;
        self.ensure_live(&lot)?;

        if !lot.bookings.is_empty() {
            return Err(EngineError::Integrity("lot has active or future bookings"));
        }
        if lot.spots.iter().any(|s| s.status == SpotStatus::Occupied) {
            return Err(EngineError::Integrity("lot has occupied spots"));
        }

        self.wal_append(&[Event::LotDeleted { id }]).await?;
        for spot in &lot.spots {
            self.spot_to_lot.remove(&spot.id);
        }
        // Removing the map entry while still holding the write guard keeps
        // late lock-waiters from seeing the lot as live (ensure_live fails).
        self.lots.remove(&id);
        Ok(())
    }

    pub async fn add_spot(&self, lot_id: Ulid) -> Result<Ulid, EngineError> {
        let _commit = self.commit_gate.read().await;
        let lot_arc = self.get_lot(&lot_id).ok_or(EngineError::NotFound(lot_id))?;
        let mut lot = lot_arc.write().await;
        self.ensure_live(&lot)?;

        if lot.spots.len() >= MAX_SPOTS_PER_LOT {
            return Err(EngineError::LimitExceeded("spot count exceeds per-lot maximum"));
        }

        let id = Ulid::new();
        let txn = vec![Event::SpotAdded { id, lot_id }];
        self.persist_and_apply(&mut lot, &txn).await?;
        Ok(id)
    }

    /// Remove a spot. Only allowed while the spot is free and no booking,
    /// current or future, references it.
    pub async fn remove_spot(&self, lot_id: Ulid, spot_id: Ulid) -> Result<(), EngineError> {
        let _commit = self.commit_gate.read().await;
        let lot_arc = self.get_lot(&lot_id).ok_or(EngineError::NotFound(lot_id))?;
        let mut lot = lot_arc.write().await;
        self.ensure_live(&lot)?;

        let spot = lot.spot(spot_id).ok_or(EngineError::NotFound(spot_id))?;
        if spot.status == SpotStatus::Occupied {
            return Err(EngineError::Integrity("spot is occupied"));
        }
        if lot.bookings.iter().any(|b| b.spot_id == spot_id) {
            return Err(EngineError::Integrity("spot has bookings"));
        }

        let txn = vec![Event::SpotRemoved {
            id: spot_id,
            lot_id,
        }];
        self.persist_and_apply(&mut lot, &txn).await
    }

    /// Reserve a spot in `lot_id` for `span`.
    ///
    /// With `spot: None` the first available spot is chosen. With a specific
    /// spot (picked from an earlier availability query) the spot is
    /// re-checked under the lot's write lock; if it gained an overlapping
    /// booking in between, the reservation fails with `Conflict` instead of
    /// double-booking.
    pub async fn reserve(
        &self,
        user_id: Ulid,
        lot_id: Ulid,
        spot: Option<Ulid>,
        span: Span,
        vehicle: &str,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        if self.get_user(&user_id).is_none() {
            return Err(EngineError::NotFound(user_id));
        }
        availability::validate_booking_interval(&span, now)?;
        let vehicle = vehicle.trim();
        validate_vehicle(vehicle)?;

        let _commit = self.commit_gate.read().await;
        let lot_arc = self.get_lot(&lot_id).ok_or(EngineError::NotFound(lot_id))?;
        let mut lot = lot_arc.write().await;
        self.ensure_live(&lot)?;

        let spot_id = match spot {
            Some(id) => {
                if lot.spot(id).is_none() {
                    return Err(EngineError::NotFound(id));
                }
                if availability::spot_conflict(&lot, id, &span).is_some() {
                    metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL)
                        .increment(1);
                    return Err(EngineError::Conflict(id));
                }
                id
            }
            None => {
                let report = availability::find_availability(&lot, &span);
                *report.available.first().ok_or(EngineError::NoAvailability)?
            }
        };

        let booking = Booking {
            id: Ulid::new(),
            user_id,
            spot_id,
            span,
            cost: booking_cost(&span, lot.profile.price_per_hour),
            vehicle: vehicle.to_string(),
        };

        let txn = vec![Event::BookingCreated {
            lot_id,
            booking: booking.clone(),
        }];
        self.persist_and_apply(&mut lot, &txn).await?;
        Ok(booking)
    }

    /// Return a user's unread notifications and mark them read, in one
    /// transaction. No WAL write when the queue is empty.
    pub async fn drain_unread(&self, user_id: Ulid) -> Result<Vec<Notification>, EngineError> {
        let _commit = self.commit_gate.read().await;
        let unread = self.notices.unread(user_id);
        if unread.is_empty() {
            return Ok(unread);
        }

        let ids: Vec<Ulid> = unread.iter().map(|n| n.id).collect();
        let txn = vec![Event::NotificationsRead { user_id, ids }];
        self.wal_append(&txn).await?;
        self.apply_event(None, &txn[0]);
        Ok(unread)
    }

    /// First-boot bootstrap: create the admin account unless one exists.
    /// Returns true when the account was created on this call.
    pub async fn ensure_admin(
        &self,
        email: &str,
        password: &str,
        name: &str,
    ) -> Result<bool, EngineError> {
        if self.users.iter().any(|e| e.value().is_admin) {
            return Ok(false);
        }
        match self.register_user(email, password, name, true).await {
            Ok(_) => Ok(true),
            Err(EngineError::EmailInUse(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Build the archival record for a booking, snapshotting the lot name.
pub(super) fn archive_record(lot: &LotState, booking: &Booking) -> HistoryRecord {
    HistoryRecord {
        id: Ulid::new(),
        user_id: booking.user_id,
        spot_id: booking.spot_id,
        lot_id: lot.id,
        lot_name: lot.profile.name.clone(),
        span: booking.span,
        cost: booking.cost,
        vehicle: booking.vehicle.clone(),
    }
}
