use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

pub fn unix_now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as Ms
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    // Untrusted intervals pass through here too; `validate_booking_interval`
    // is the gate that rejects inverted spans.
    pub fn new(start: Ms, end: Ms) -> Self {
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Booking cost: hours × hourly rate, rounded to 2 decimal places.
pub fn booking_cost(span: &Span, price_per_hour: f64) -> f64 {
    let hours = span.duration_ms() as f64 / 3_600_000.0;
    (hours * price_per_hour * 100.0).round() / 100.0
}

/// Physical state of a spot: whether the current moment falls inside an
/// active booking window. Says nothing about future bookings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpotStatus {
    Available,
    Occupied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spot {
    pub id: Ulid,
    pub status: SpotStatus,
}

/// An active or future reservation of one spot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: Ulid,
    pub spot_id: Ulid,
    pub span: Span,
    pub cost: f64,
    pub vehicle: String,
}

/// The mutable lot fields, shared by create/update events and queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LotProfile {
    pub name: String,
    pub address: String,
    pub city: String,
    pub pincode: String,
    pub area_type: String,
    pub price_per_hour: f64,
}

/// One parking lot plus everything it owns: spots in insertion order and
/// bookings kept sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct LotState {
    pub id: Ulid,
    pub profile: LotProfile,
    pub spots: Vec<Spot>,
    pub bookings: Vec<Booking>,
}

impl LotState {
    pub fn new(id: Ulid, profile: LotProfile) -> Self {
        Self {
            id,
            profile,
            spots: Vec::new(),
            bookings: Vec::new(),
        }
    }

    /// Insert a booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        self.bookings
            .iter()
            .position(|b| b.id == id)
            .map(|pos| self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    /// Bookings whose span overlaps the query window.
    /// Binary search skips bookings starting at or after `query.end`.
    pub fn bookings_overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    pub fn spot(&self, id: Ulid) -> Option<&Spot> {
        self.spots.iter().find(|s| s.id == id)
    }

    pub fn spot_mut(&mut self, id: Ulid) -> Option<&mut Spot> {
        self.spots.iter_mut().find(|s| s.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub email: String,
    pub pass_hash: String,
    pub name: String,
    pub is_admin: bool,
}

/// Immutable archival copy of a terminated booking. The lot name is
/// snapshotted so reports survive lot/spot deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: Ulid,
    pub user_id: Ulid,
    pub spot_id: Ulid,
    pub lot_id: Ulid,
    pub lot_name: String,
    pub span: Span,
    pub cost: f64,
    pub vehicle: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Info,
    Success,
    Warning,
    Danger,
}

/// A stored message for one user, displayed on their next request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Ulid,
    pub user_id: Ulid,
    pub category: Category,
    pub text: String,
    pub read: bool,
    pub created_at: Ms,
}

/// The event types — flat, no nesting. This is the WAL record format;
/// one WAL frame carries a whole transaction (`Vec<Event>`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        user: User,
    },
    UserUpdated {
        id: Ulid,
        email: String,
        pass_hash: String,
        name: String,
    },
    UserDeleted {
        id: Ulid,
    },
    LotCreated {
        id: Ulid,
        profile: LotProfile,
    },
    LotUpdated {
        id: Ulid,
        profile: LotProfile,
    },
    LotDeleted {
        id: Ulid,
    },
    SpotAdded {
        id: Ulid,
        lot_id: Ulid,
    },
    SpotRemoved {
        id: Ulid,
        lot_id: Ulid,
    },
    SpotOccupied {
        id: Ulid,
        lot_id: Ulid,
    },
    SpotFreed {
        id: Ulid,
        lot_id: Ulid,
    },
    BookingCreated {
        lot_id: Ulid,
        booking: Booking,
    },
    BookingArchived {
        lot_id: Ulid,
        booking_id: Ulid,
        record: HistoryRecord,
    },
    /// Compaction-only: re-emit a history record whose booking (and possibly
    /// lot) no longer exists.
    HistoryRetained {
        record: HistoryRecord,
    },
    NotificationQueued {
        record: Notification,
    },
    NotificationsRead {
        user_id: Ulid,
        ids: Vec<Ulid>,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LotStats {
    pub id: Ulid,
    pub profile: LotProfile,
    pub total_spots: usize,
    /// Spots physically occupied right now.
    pub occupied_spots: usize,
    /// Bookings not yet expired (current or future).
    pub active_bookings: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpotConflicts {
    pub spot_id: Ulid,
    pub intervals: Vec<Span>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvailabilityReport {
    pub available: Vec<Ulid>,
    pub conflicts: Vec<SpotConflicts>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpotDetails {
    pub spot_id: Ulid,
    pub status: SpotStatus,
    pub current: Option<Booking>,
    /// Future bookings ordered by start time ascending.
    pub future: Vec<Booking>,
    pub deletable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpotSummary {
    pub id: Ulid,
    pub status: SpotStatus,
    /// Available now but reserved for some future window.
    pub future_booked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseKind {
    ReleasedActive,
    CancelledFuture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ReconcileSummary {
    pub activated: usize,
    pub expired: usize,
}

impl ReconcileSummary {
    pub fn is_noop(&self) -> bool {
        self.activated == 0 && self.expired == 0
    }
}

/// A booking joined with its lot, for user-facing listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookingView {
    pub lot_id: Ulid,
    pub lot_name: String,
    pub booking: Booking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlatformTotals {
    pub users: usize,
    pub lots: usize,
    pub bookings: usize,
    pub history: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LotUsage {
    pub lot_name: String,
    pub visits: usize,
}

/// User view without the password hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserInfo {
    pub id: Ulid,
    pub email: String,
    pub name: String,
    pub is_admin: bool,
}

impl From<&User> for UserInfo {
    fn from(u: &User) -> Self {
        Self {
            id: u.id,
            email: u.email.clone(),
            name: u.name.clone(),
            is_admin: u.is_admin,
        }
    }
}
