use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 86_400_000;

pub const DEFAULT_DEFENSE_MINUTES: u32 = 60;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Interval of `minutes` starting at `start`. Zero minutes yields an empty span.
    pub fn from_minutes(start: Ms, minutes: u32) -> Self {
        Self {
            start,
            end: start + Ms::from(minutes) * MINUTE_MS,
        }
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

/// Maps instants to calendar days at a fixed offset from UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Calendar {
    pub utc_offset_ms: Ms,
}

impl Calendar {
    pub fn new(utc_offset_ms: Ms) -> Self {
        Self { utc_offset_ms }
    }

    pub fn utc() -> Self {
        Self::default()
    }

    /// The local day `[midnight, next midnight)` containing `t`.
    pub fn day_containing(&self, t: Ms) -> Span {
        let local = t + self.utc_offset_ms;
        let start = local.div_euclid(DAY_MS) * DAY_MS - self.utc_offset_ms;
        Span::new(start, start + DAY_MS)
    }
}

// ── Enumerations ─────────────────────────────────────────────────

/// Declares a closed set of labels with their SQL spelling.
macro_rules! labeled_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                let lower = s.trim().to_lowercase();
                Self::ALL.iter().copied().find(|v| v.as_str() == lower)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

labeled_enum!(StudyLevel {
    Bachelor => "bachelor",
    Master => "master",
    Doctorate => "doctorate",
});

labeled_enum!(AcademicRank {
    Assistant => "assistant",
    SeniorAssistant => "senior_assistant",
    AssociateProfessor => "associate_professor",
    Professor => "professor",
});

labeled_enum!(ThesisKind {
    Bachelor => "bachelor",
    Master => "master",
    Doctorate => "doctorate",
});

labeled_enum!(
    /// InProgress → Submitted → Validated/Rejected → Defended.
    ThesisStatus {
        InProgress => "in_progress",
        Submitted => "submitted",
        Validated => "validated",
        Rejected => "rejected",
        Defended => "defended",
    }
);

labeled_enum!(
    /// Scheduled → InProgress → Completed, with Postponed and Cancelled on the side.
    /// Transitions are not guarded.
    DefenseStatus {
        Scheduled => "scheduled",
        InProgress => "in_progress",
        Completed => "completed",
        Postponed => "postponed",
        Cancelled => "cancelled",
    }
);

labeled_enum!(Honor {
    Passable => "passable",
    FairlyGood => "fairly_good",
    Good => "good",
    VeryGood => "very_good",
    Excellent => "excellent",
});

// ── Records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub id: Ulid,
    pub last_name: String,
    pub first_name: String,
    pub email: String,
    pub student_number: String,
    pub birth_date: Option<Ms>,
    pub program: String,
    pub level: StudyLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Professor {
    pub id: Ulid,
    pub last_name: String,
    pub first_name: String,
    pub email: String,
    pub department: String,
    pub specialty: String,
    pub rank: AcademicRank,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thesis {
    pub id: Ulid,
    pub title: String,
    pub summary: String,
    pub keywords: String,
    pub kind: ThesisKind,
    pub status: ThesisStatus,
    pub student_id: Ulid,
    pub director_id: Ulid,
    pub co_director_id: Option<Ulid>,
    pub created_at: Ms,
    /// Stamped the first time the thesis is marked submitted.
    pub submitted_at: Option<Ms>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Jury {
    pub id: Ulid,
    pub president_id: Ulid,
    /// Members besides the president, in declaration order.
    pub member_ids: Vec<Ulid>,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Defense {
    pub id: Ulid,
    pub thesis_id: Ulid,
    pub jury_id: Ulid,
    pub room: String,
    pub start: Ms,
    pub duration_minutes: u32,
    pub status: DefenseStatus,
    pub final_grade: Option<f64>,
    pub honor: Option<Honor>,
    pub observations: String,
}

impl Defense {
    pub fn span(&self) -> Span {
        Span::from_minutes(self.start, self.duration_minutes)
    }

    /// Cancelled and completed defenses no longer hold their room.
    pub fn is_active(&self) -> bool {
        !matches!(self.status, DefenseStatus::Cancelled | DefenseStatus::Completed)
    }
}

/// All defenses booked in one room, sorted by `start`.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub name: String,
    pub defenses: Vec<Defense>,
}

impl RoomState {
    pub fn new(name: String) -> Self {
        Self {
            name,
            defenses: Vec::new(),
        }
    }

    /// Insert defense maintaining sort order by start.
    pub fn insert_defense(&mut self, defense: Defense) {
        let pos = self
            .defenses
            .binary_search_by_key(&defense.start, |d| d.start)
            .unwrap_or_else(|e| e);
        self.defenses.insert(pos, defense);
    }

    /// Remove defense by id.
    pub fn remove_defense(&mut self, id: Ulid) -> Option<Defense> {
        let pos = self.defenses.iter().position(|d| d.id == id)?;
        Some(self.defenses.remove(pos))
    }

    pub fn get(&self, id: &Ulid) -> Option<&Defense> {
        self.defenses.iter().find(|d| d.id == *id)
    }

    /// Defenses whose start falls inside `window`.
    pub fn starting_within(&self, window: &Span) -> &[Defense] {
        let lo = self.defenses.partition_point(|d| d.start < window.start);
        let hi = self.defenses.partition_point(|d| d.start < window.end);
        &self.defenses[lo..hi]
    }
}

/// The event types. This is the WAL record format; `*Saved` is an upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    StudentSaved(Student),
    StudentDeleted { id: Ulid },
    ProfessorSaved(Professor),
    ProfessorDeleted { id: Ulid },
    ThesisSaved(Thesis),
    ThesisDeleted { id: Ulid },
    JurySaved(Jury),
    JuryDeleted { id: Ulid },
    DefenseSaved(Defense),
    DefenseDeleted { id: Ulid, room: String },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Dashboard {
    pub students: usize,
    pub professors: usize,
    pub theses: usize,
    pub juries: usize,
    pub defenses: usize,
    pub theses_by_status: Vec<(ThesisStatus, usize)>,
    pub defenses_by_status: Vec<(DefenseStatus, usize)>,
    pub students_per_program: Vec<(String, usize)>,
    pub upcoming: Vec<Defense>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;

    fn defense_at(start: Ms, minutes: u32) -> Defense {
        Defense {
            id: Ulid::new(),
            thesis_id: Ulid::new(),
            jury_id: Ulid::new(),
            room: "A101".into(),
            start,
            duration_minutes: minutes,
            status: DefenseStatus::Scheduled,
            final_grade: None,
            honor: None,
            observations: String::new(),
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn span_from_minutes() {
        let s = Span::from_minutes(10 * H, 90);
        assert_eq!(s.end, 10 * H + 90 * MINUTE_MS);
    }

    #[test]
    fn calendar_utc_day() {
        let cal = Calendar::utc();
        let day = cal.day_containing(3 * DAY_MS + 10 * H);
        assert_eq!(day, Span::new(3 * DAY_MS, 4 * DAY_MS));
        // Midnight belongs to the day it opens
        assert_eq!(cal.day_containing(4 * DAY_MS).start, 4 * DAY_MS);
    }

    #[test]
    fn calendar_offset_shifts_day_boundary() {
        // UTC+2: 23:00 UTC is already 01:00 the next local day
        let cal = Calendar::new(2 * H);
        let day = cal.day_containing(3 * DAY_MS + 23 * H);
        assert_eq!(day.start, 4 * DAY_MS - 2 * H);
        assert_eq!(day.duration_ms(), DAY_MS);
    }

    #[test]
    fn calendar_before_epoch() {
        let cal = Calendar::utc();
        let day = cal.day_containing(-1);
        assert_eq!(day, Span::new(-DAY_MS, 0));
    }

    #[test]
    fn room_keeps_defenses_sorted() {
        let mut room = RoomState::new("A101".into());
        room.insert_defense(defense_at(14 * H, 60));
        room.insert_defense(defense_at(9 * H, 60));
        room.insert_defense(defense_at(11 * H, 60));
        let starts: Vec<Ms> = room.defenses.iter().map(|d| d.start).collect();
        assert_eq!(starts, vec![9 * H, 11 * H, 14 * H]);
    }

    #[test]
    fn room_remove_middle_preserves_order() {
        let mut room = RoomState::new("A101".into());
        let d = defense_at(11 * H, 60);
        let id = d.id;
        room.insert_defense(defense_at(9 * H, 60));
        room.insert_defense(d);
        room.insert_defense(defense_at(14 * H, 60));
        assert!(room.remove_defense(id).is_some());
        assert!(room.remove_defense(id).is_none());
        assert_eq!(room.defenses.len(), 2);
        assert!(room.defenses[0].start < room.defenses[1].start);
    }

    #[test]
    fn starting_within_uses_start_only() {
        let mut room = RoomState::new("A101".into());
        // Starts the previous evening and runs past midnight
        room.insert_defense(defense_at(DAY_MS - H, 120));
        room.insert_defense(defense_at(DAY_MS + 9 * H, 60));
        room.insert_defense(defense_at(2 * DAY_MS, 60));
        let day = Span::new(DAY_MS, 2 * DAY_MS);
        let hits = room.starting_within(&day);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].start, DAY_MS + 9 * H);
    }

    #[test]
    fn defense_activity() {
        let mut d = defense_at(0, 60);
        assert!(d.is_active());
        d.status = DefenseStatus::Postponed;
        assert!(d.is_active());
        d.status = DefenseStatus::Cancelled;
        assert!(!d.is_active());
        d.status = DefenseStatus::Completed;
        assert!(!d.is_active());
    }

    #[test]
    fn labels_parse_case_insensitively() {
        assert_eq!(DefenseStatus::parse("In_Progress"), Some(DefenseStatus::InProgress));
        assert_eq!(Honor::parse("very_good"), Some(Honor::VeryGood));
        assert_eq!(AcademicRank::parse("nope"), None);
        assert_eq!(ThesisStatus::Submitted.to_string(), "submitted");
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::DefenseSaved(defense_at(10 * H, 60));
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
