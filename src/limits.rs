use crate::model::Ms;

/// How far into the future a booking may end, measured from `now` (10 days).
pub const MAX_BOOKING_HORIZON_MS: Ms = 10 * 24 * 3_600_000;

/// Timestamps must be plausible unix-ms values (1970..2100).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

pub const MAX_LOTS: usize = 65_536;
pub const MAX_SPOTS_PER_LOT: usize = 4_096;
pub const MAX_USERS: usize = 1_000_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_ADDRESS_LEN: usize = 512;
pub const MAX_PINCODE_LEN: usize = 16;
pub const MAX_VEHICLE_LEN: usize = 32;
pub const MAX_EMAIL_LEN: usize = 256;
