use crate::model::Ms;

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_RECORDS_PER_REGISTRY: usize = 100_000;
pub const MAX_DEFENSES_PER_ROOM: usize = 50_000;
pub const MAX_JURY_MEMBERS: usize = 16;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TEXT_LEN: usize = 16_384;

/// Longest bookable defense: one working day.
pub const MAX_DURATION_MINUTES: u32 = 12 * 60;

/// 1970-01-01 .. 2200-01-01
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

pub const MAX_QUERY_WINDOW_MS: Ms = 5 * 366 * 86_400_000;

pub const MIN_GRADE: f64 = 0.0;
pub const MAX_GRADE: f64 = 20.0;

/// Jury members required besides the president.
pub const MIN_JURY_MEMBERS: usize = 2;

pub const UPCOMING_DEFENSES: usize = 5;
