mod archive;
mod availability;
mod error;
mod mutations;
mod queries;
mod reconcile;

pub use availability::{find_availability, spot_conflict, validate_booking_interval};
pub use error::EngineError;

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotificationQueue;
use crate::wal::Wal;

pub type SharedLotState = Arc<RwLock<LotState>>;

/// Write guards for every lot a transaction touches, keyed (and therefore
/// acquired) in sorted id order.
pub(super) type LotGuards = BTreeMap<Ulid, OwnedRwLockWriteGuard<LotState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        txn: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { txn, response } => {
                let mut batch = vec![(txn, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { txn, response }) => {
                            batch.push((txn, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Vec<Event>, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Vec<Event>, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (txn, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(txn) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

pub struct Engine {
    pub lots: DashMap<Ulid, SharedLotState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notices: NotificationQueue,
    pub(super) users: DashMap<Ulid, User>,
    /// email → user id, enforcing email uniqueness.
    pub(super) email_index: DashMap<String, Ulid>,
    /// user id → archived bookings, append-only.
    pub(super) history: DashMap<Ulid, Vec<HistoryRecord>>,
    /// Reverse lookup: spot id → owning lot id.
    pub(super) spot_to_lot: DashMap<Ulid, Ulid>,
    /// Reverse lookup: booking id → owning lot id.
    pub(super) booking_to_lot: DashMap<Ulid, Ulid>,
    /// Held (read) by every mutation across its WAL append and in-memory
    /// apply; held (write) by `compact_wal` while it snapshots state, so no
    /// acknowledged transaction can fall between the snapshot and the
    /// rename. Always acquired before any lot lock.
    pub(super) commit_gate: RwLock<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            lots: DashMap::new(),
            wal_tx,
            notices: NotificationQueue::new(),
            users: DashMap::new(),
            email_index: DashMap::new(),
            history: DashMap::new(),
            spot_to_lot: DashMap::new(),
            booking_to_lot: DashMap::new(),
            commit_gate: RwLock::new(()),
        };

        // Replay — we're the sole owner of these Arcs, so try_write always
        // succeeds instantly (no contention). Never use blocking_write here
        // because this may run inside an async context.
        for event in &events {
            match event {
                Event::LotCreated { id, profile } => {
                    let lot = LotState::new(*id, profile.clone());
                    engine.lots.insert(*id, Arc::new(RwLock::new(lot)));
                }
                Event::LotDeleted { id } => {
                    engine.drop_lot_entry(id);
                }
                other => {
                    if let Some(lot_id) = event_lot_id(other) {
                        if let Some(entry) = engine.lots.get(&lot_id) {
                            let lot_arc = entry.clone();
                            let mut guard =
                                lot_arc.try_write().expect("replay: uncontended write");
                            engine.apply_event(Some(&mut *guard), other);
                        }
                    } else {
                        engine.apply_event(None, other);
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Write a transaction to the WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, txn: &[Event]) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                txn: txn.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_lot(&self, id: &Ulid) -> Option<SharedLotState> {
        self.lots.get(id).map(|e| e.value().clone())
    }

    pub fn lot_for_spot(&self, spot_id: &Ulid) -> Option<Ulid> {
        self.spot_to_lot.get(spot_id).map(|e| *e.value())
    }

    pub fn lot_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_lot.get(booking_id).map(|e| *e.value())
    }

    pub fn get_user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|e| e.value().clone())
    }

    /// Apply one committed event to in-memory state. Lot-scoped events need
    /// the lot's write guard (the caller holds the lock); global events take
    /// `None`.
    pub(super) fn apply_event(&self, lot: Option<&mut LotState>, event: &Event) {
        match event {
            Event::UserRegistered { user } => {
                self.email_index.insert(user.email.clone(), user.id);
                self.users.insert(user.id, user.clone());
            }
            Event::UserUpdated {
                id,
                email,
                pass_hash,
                name,
            } => {
                if let Some(mut user) = self.users.get_mut(id) {
                    if user.email != *email {
                        self.email_index.remove(&user.email);
                        self.email_index.insert(email.clone(), *id);
                    }
                    user.email = email.clone();
                    user.pass_hash = pass_hash.clone();
                    user.name = name.clone();
                }
            }
            Event::UserDeleted { id } => {
                if let Some((_, user)) = self.users.remove(id) {
                    self.email_index.remove(&user.email);
                }
                self.history.remove(id);
                self.notices.remove_user(*id);
            }
            Event::LotUpdated { profile, .. } => {
                if let Some(lot) = lot {
                    lot.profile = profile.clone();
                }
            }
            Event::SpotAdded { id, lot_id } => {
                if let Some(lot) = lot {
                    lot.spots.push(Spot {
                        id: *id,
                        status: SpotStatus::Available,
                    });
                    self.spot_to_lot.insert(*id, *lot_id);
                }
            }
            Event::SpotRemoved { id, .. } => {
                if let Some(lot) = lot {
                    lot.spots.retain(|s| s.id != *id);
                    self.spot_to_lot.remove(id);
                }
            }
            Event::SpotOccupied { id, .. } => {
                if let Some(lot) = lot
                    && let Some(spot) = lot.spot_mut(*id)
                {
                    spot.status = SpotStatus::Occupied;
                }
            }
            Event::SpotFreed { id, .. } => {
                if let Some(lot) = lot
                    && let Some(spot) = lot.spot_mut(*id)
                {
                    spot.status = SpotStatus::Available;
                }
            }
            Event::BookingCreated { lot_id, booking } => {
                if let Some(lot) = lot {
                    self.booking_to_lot.insert(booking.id, *lot_id);
                    lot.insert_booking(booking.clone());
                }
            }
            Event::BookingArchived {
                booking_id, record, ..
            } => {
                if let Some(lot) = lot {
                    lot.remove_booking(*booking_id);
                }
                self.booking_to_lot.remove(booking_id);
                self.history
                    .entry(record.user_id)
                    .or_default()
                    .push(record.clone());
            }
            Event::HistoryRetained { record } => {
                self.history
                    .entry(record.user_id)
                    .or_default()
                    .push(record.clone());
            }
            Event::NotificationQueued { record } => {
                self.notices.apply_queued(record.clone());
            }
            Event::NotificationsRead { user_id, ids } => {
                self.notices.apply_read(*user_id, ids);
            }
            // Created/Deleted are handled at the DashMap level, not here
            Event::LotCreated { .. } | Event::LotDeleted { .. } => {}
        }
    }

    /// WAL-append + apply in one call, for transactions scoped to one lot
    /// (global events in the same transaction are fine).
    pub(super) async fn persist_and_apply(
        &self,
        lot: &mut LotState,
        txn: &[Event],
    ) -> Result<(), EngineError> {
        self.wal_append(txn).await?;
        for event in txn {
            if event_lot_id(event).is_some() {
                self.apply_event(Some(&mut *lot), event);
            } else {
                self.apply_event(None, event);
            }
        }
        Ok(())
    }

    /// WAL-append + apply for transactions spanning multiple lots. The
    /// caller has already acquired all write guards in sorted id order.
    pub(super) async fn persist_and_apply_multi(
        &self,
        guards: &mut LotGuards,
        txn: &[Event],
    ) -> Result<(), EngineError> {
        self.wal_append(txn).await?;
        for event in txn {
            match event_lot_id(event) {
                Some(lot_id) => {
                    let guard = guards
                        .get_mut(&lot_id)
                        .expect("transaction touches a lot that was not locked");
                    self.apply_event(Some(&mut **guard), event);
                }
                None => self.apply_event(None, event),
            }
        }
        Ok(())
    }

    /// Acquire write guards on every lot, in sorted id order (deadlock
    /// discipline for multi-lot transactions).
    pub(super) async fn lock_all_lots(&self) -> LotGuards {
        let mut ids: Vec<Ulid> = self.lots.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut guards = BTreeMap::new();
        for id in ids {
            // A lot can vanish between listing and locking; skip it.
            if let Some(lot) = self.get_lot(&id) {
                guards.insert(id, lot.write_owned().await);
            }
        }
        guards
    }

    /// A lot can be deleted while another task awaits its write lock, so
    /// every mutation re-checks map membership after locking.
    pub(super) fn ensure_live(&self, lot: &LotState) -> Result<(), EngineError> {
        if self.lots.contains_key(&lot.id) {
            Ok(())
        } else {
            Err(EngineError::NotFound(lot.id))
        }
    }

    /// Replay-only: remove a lot from the map and scrub its reverse indexes.
    pub(super) fn drop_lot_entry(&self, id: &Ulid) {
        if let Some(entry) = self.lots.get(id) {
            let lot = entry.try_read().expect("drop_lot_entry: uncontended read");
            for spot in &lot.spots {
                self.spot_to_lot.remove(&spot.id);
            }
            for booking in &lot.bookings {
                self.booking_to_lot.remove(&booking.id);
            }
        }
        self.lots.remove(id);
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate the current state. Read notifications are dropped; they can
    /// never be displayed again.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Quiesce commits while the snapshot is taken. Once the write half
        // is granted, every acknowledged transaction has been applied to
        // memory, so the snapshot misses nothing the rename throws away.
        let gate = self.commit_gate.write().await;

        let mut events = Vec::new();

        for entry in self.users.iter() {
            events.push(Event::UserRegistered {
                user: entry.value().clone(),
            });
        }

        let lot_ids: Vec<Ulid> = self.lots.iter().map(|e| *e.key()).collect();
        for id in lot_ids {
            let Some(lot_arc) = self.get_lot(&id) else {
                continue;
            };
            let lot = lot_arc.read().await;
            events.push(Event::LotCreated {
                id: lot.id,
                profile: lot.profile.clone(),
            });
            for spot in &lot.spots {
                events.push(Event::SpotAdded {
                    id: spot.id,
                    lot_id: lot.id,
                });
                if spot.status == SpotStatus::Occupied {
                    events.push(Event::SpotOccupied {
                        id: spot.id,
                        lot_id: lot.id,
                    });
                }
            }
            for booking in &lot.bookings {
                events.push(Event::BookingCreated {
                    lot_id: lot.id,
                    booking: booking.clone(),
                });
            }
        }

        for entry in self.history.iter() {
            for record in entry.value() {
                events.push(Event::HistoryRetained {
                    record: record.clone(),
                });
            }
        }

        for user_id in self.notices.user_ids() {
            for record in self.notices.all_for(user_id) {
                if !record.read {
                    events.push(Event::NotificationQueued { record });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        // Appends enqueued from here on follow the Compact command in the
        // channel, so they land in the fresh WAL file.
        drop(gate);
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Extract the owning lot id from a lot-scoped event.
pub(super) fn event_lot_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::LotUpdated { id, .. } => Some(*id),
        Event::SpotAdded { lot_id, .. }
        | Event::SpotRemoved { lot_id, .. }
        | Event::SpotOccupied { lot_id, .. }
        | Event::SpotFreed { lot_id, .. }
        | Event::BookingCreated { lot_id, .. }
        | Event::BookingArchived { lot_id, .. } => Some(*lot_id),
        Event::LotCreated { .. }
        | Event::LotDeleted { .. }
        | Event::UserRegistered { .. }
        | Event::UserUpdated { .. }
        | Event::UserDeleted { .. }
        | Event::HistoryRetained { .. }
        | Event::NotificationQueued { .. }
        | Event::NotificationsRead { .. } => None,
    }
}
