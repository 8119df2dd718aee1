//! Defense scheduling rules: room availability and the checks a defense or
//! jury must pass before it is stored.
//!
//! Everything here is read-only and lock-free. Callers that need the check and
//! the write to be atomic hold the room lock themselves (see `mutations.rs`).

use std::collections::HashSet;

use ulid::Ulid;

use crate::limits::MIN_JURY_MEMBERS;
use crate::model::*;

use super::EngineError;

pub trait ThesisLookup {
    fn thesis_exists(&self, id: &Ulid) -> bool;
}

pub trait JuryLookup {
    fn jury_exists(&self, id: &Ulid) -> bool;
}

pub trait FacultyLookup {
    fn professor_exists(&self, id: &Ulid) -> bool;
}

/// Read side of the defense store.
pub trait DefenseLookup {
    /// Defenses booked in `room` whose start falls inside `day`.
    fn find_by_room_and_day(&self, room: &str, day: &Span) -> Vec<Defense>;
}

impl DefenseLookup for RoomState {
    fn find_by_room_and_day(&self, room: &str, day: &Span) -> Vec<Defense> {
        if self.name != room {
            return Vec::new();
        }
        self.starting_within(day).to_vec()
    }
}

/// Whether a defense is being created or replaced in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Create,
    Update,
}

/// First active defense in `room` that overlaps `[start, start + duration)`.
///
/// Only defenses starting on the same calendar day as `start` are considered,
/// so a booking that runs past midnight is invisible to the next day's checks.
pub fn find_conflict(
    store: &impl DefenseLookup,
    calendar: &Calendar,
    room: &str,
    start: Ms,
    duration_minutes: u32,
    exclude_id: Option<Ulid>,
) -> Option<Ulid> {
    let candidate = Span::from_minutes(start, duration_minutes);
    let day = calendar.day_containing(start);
    store
        .find_by_room_and_day(room, &day)
        .into_iter()
        .filter(|d| Some(d.id) != exclude_id && d.is_active())
        .find(|d| candidate.overlaps(&d.span()))
        .map(|d| d.id)
}

pub fn is_slot_available(
    store: &impl DefenseLookup,
    calendar: &Calendar,
    room: &str,
    start: Ms,
    duration_minutes: u32,
    exclude_id: Option<Ulid>,
) -> bool {
    find_conflict(store, calendar, room, start, duration_minutes, exclude_id).is_none()
}

pub fn validate_defense<R>(
    defense: &Defense,
    intent: Intent,
    refs: &R,
    schedule: &impl DefenseLookup,
    calendar: &Calendar,
    now: Ms,
) -> Result<(), EngineError>
where
    R: ThesisLookup + JuryLookup,
{
    if defense.room.trim().is_empty() {
        return Err(EngineError::Validation("room is required"));
    }
    if defense.duration_minutes == 0 {
        return Err(EngineError::Validation("duration must be positive"));
    }
    if !refs.thesis_exists(&defense.thesis_id) {
        return Err(EngineError::Reference {
            kind: "thesis",
            id: defense.thesis_id,
        });
    }
    if !refs.jury_exists(&defense.jury_id) {
        return Err(EngineError::Reference {
            kind: "jury",
            id: defense.jury_id,
        });
    }

    let exclude = match intent {
        Intent::Create => None,
        Intent::Update => Some(defense.id),
    };
    if let Some(other) = find_conflict(
        schedule,
        calendar,
        &defense.room,
        defense.start,
        defense.duration_minutes,
        exclude,
    ) {
        return Err(EngineError::Conflict(other));
    }

    // Creation only: an update may move a defense into the past.
    if intent == Intent::Create && defense.start <= now {
        return Err(EngineError::Validation("defense must be scheduled in the future"));
    }
    Ok(())
}

pub fn validate_jury(jury: &Jury, faculty: &impl FacultyLookup) -> Result<(), EngineError> {
    if !faculty.professor_exists(&jury.president_id) {
        return Err(EngineError::Reference {
            kind: "professor",
            id: jury.president_id,
        });
    }
    if let Some(missing) = jury
        .member_ids
        .iter()
        .find(|id| !faculty.professor_exists(id))
    {
        return Err(EngineError::Reference {
            kind: "professor",
            id: *missing,
        });
    }
    if jury.member_ids.contains(&jury.president_id) {
        return Err(EngineError::Validation(
            "the president cannot also be a jury member",
        ));
    }
    if jury.member_ids.len() < MIN_JURY_MEMBERS {
        return Err(EngineError::Validation(
            "a jury needs at least 2 members besides the president",
        ));
    }
    let mut seen = HashSet::with_capacity(jury.member_ids.len());
    if !jury.member_ids.iter().all(|id| seen.insert(*id)) {
        return Err(EngineError::Validation(
            "a professor cannot sit on the same jury twice",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;
    const M: Ms = 60_000;
    /// 2030-01-01T00:00:00Z
    const DAY0: Ms = 1_893_456_000_000;

    #[derive(Default)]
    struct Directory {
        theses: HashSet<Ulid>,
        juries: HashSet<Ulid>,
        professors: HashSet<Ulid>,
    }

    impl ThesisLookup for Directory {
        fn thesis_exists(&self, id: &Ulid) -> bool {
            self.theses.contains(id)
        }
    }

    impl JuryLookup for Directory {
        fn jury_exists(&self, id: &Ulid) -> bool {
            self.juries.contains(id)
        }
    }

    impl FacultyLookup for Directory {
        fn professor_exists(&self, id: &Ulid) -> bool {
            self.professors.contains(id)
        }
    }

    /// Defenses across every room, filtered the way a store query would.
    struct Schedule(Vec<Defense>);

    impl DefenseLookup for Schedule {
        fn find_by_room_and_day(&self, room: &str, day: &Span) -> Vec<Defense> {
            self.0
                .iter()
                .filter(|d| d.room == room && day.contains_instant(d.start))
                .cloned()
                .collect()
        }
    }

    fn defense(room: &str, start: Ms, minutes: u32) -> Defense {
        Defense {
            id: Ulid::new(),
            thesis_id: Ulid::new(),
            jury_id: Ulid::new(),
            room: room.into(),
            start,
            duration_minutes: minutes,
            status: DefenseStatus::Scheduled,
            final_grade: None,
            honor: None,
            observations: String::new(),
        }
    }

    /// Directory that knows the defense's thesis and jury.
    fn directory_for(d: &Defense) -> Directory {
        let mut dir = Directory::default();
        dir.theses.insert(d.thesis_id);
        dir.juries.insert(d.jury_id);
        dir
    }

    fn faculty(n: usize) -> (Directory, Vec<Ulid>) {
        let ids: Vec<Ulid> = (0..n).map(|_| Ulid::new()).collect();
        let mut dir = Directory::default();
        dir.professors.extend(ids.iter().copied());
        (dir, ids)
    }

    fn jury(president: Ulid, members: Vec<Ulid>) -> Jury {
        Jury {
            id: Ulid::new(),
            president_id: president,
            member_ids: members,
            created_at: DAY0,
        }
    }

    // ── Availability ─────────────────────────────────────

    #[test]
    fn reference_scenario_a101() {
        let cal = Calendar::utc();
        let existing = defense("A101", DAY0 + 10 * H, 60);
        let schedule = Schedule(vec![existing.clone()]);

        // 10:30–11:30 overlaps
        assert_eq!(
            find_conflict(&schedule, &cal, "A101", DAY0 + 10 * H + 30 * M, 60, None),
            Some(existing.id)
        );
        // 11:00–12:00 touches the end
        assert!(is_slot_available(&schedule, &cal, "A101", DAY0 + 11 * H, 60, None));
        // Same slot, other room
        assert!(is_slot_available(&schedule, &cal, "B202", DAY0 + 10 * H, 60, None));
    }

    #[test]
    fn non_overlapping_slots_are_available() {
        let cal = Calendar::utc();
        let schedule = Schedule(vec![defense("A101", DAY0 + 9 * H, 60)]);
        assert!(is_slot_available(&schedule, &cal, "A101", DAY0 + 14 * H, 90, None));
        assert!(is_slot_available(&schedule, &cal, "A101", DAY0 + 7 * H, 60, None));
    }

    #[test]
    fn candidate_ending_at_existing_start_is_available() {
        let cal = Calendar::utc();
        let schedule = Schedule(vec![defense("A101", DAY0 + 10 * H, 60)]);
        assert!(is_slot_available(&schedule, &cal, "A101", DAY0 + 9 * H, 60, None));
        assert!(!is_slot_available(&schedule, &cal, "A101", DAY0 + 9 * H, 61, None));
    }

    #[test]
    fn enclosing_and_enclosed_slots_conflict() {
        let cal = Calendar::utc();
        let schedule = Schedule(vec![defense("A101", DAY0 + 10 * H, 60)]);
        assert!(!is_slot_available(&schedule, &cal, "A101", DAY0 + 9 * H, 180, None));
        assert!(!is_slot_available(&schedule, &cal, "A101", DAY0 + 10 * H + 15 * M, 15, None));
    }

    #[test]
    fn excluded_id_does_not_conflict_with_itself() {
        let cal = Calendar::utc();
        let existing = defense("A101", DAY0 + 10 * H, 60);
        let schedule = Schedule(vec![existing.clone()]);
        assert!(!is_slot_available(&schedule, &cal, "A101", existing.start, 60, None));
        assert!(is_slot_available(&schedule, &cal, "A101", existing.start, 60, Some(existing.id)));
        // Excluding an unrelated id changes nothing
        assert!(!is_slot_available(&schedule, &cal, "A101", existing.start, 60, Some(Ulid::new())));
    }

    #[test]
    fn cancelled_and_completed_defenses_free_the_room() {
        let cal = Calendar::utc();
        let mut cancelled = defense("A101", DAY0 + 10 * H, 60);
        cancelled.status = DefenseStatus::Cancelled;
        let mut completed = defense("A101", DAY0 + 14 * H, 60);
        completed.status = DefenseStatus::Completed;
        let mut postponed = defense("A101", DAY0 + 16 * H, 60);
        postponed.status = DefenseStatus::Postponed;
        let schedule = Schedule(vec![cancelled, completed, postponed.clone()]);

        assert!(is_slot_available(&schedule, &cal, "A101", DAY0 + 10 * H, 60, None));
        assert!(is_slot_available(&schedule, &cal, "A101", DAY0 + 14 * H, 60, None));
        assert_eq!(
            find_conflict(&schedule, &cal, "A101", DAY0 + 16 * H, 30, None),
            Some(postponed.id)
        );
    }

    #[test]
    fn only_same_day_defenses_are_checked() {
        let cal = Calendar::utc();
        // Late-evening defense running past midnight
        let schedule = Schedule(vec![defense("A101", DAY0 + 23 * H, 120)]);
        // 00:30 the next day overlaps in real time but is on another calendar day
        assert!(is_slot_available(&schedule, &cal, "A101", DAY0 + 24 * H + 30 * M, 30, None));
    }

    #[test]
    fn day_boundary_follows_calendar_offset() {
        // UTC+2: 23:00 UTC and 21:30 UTC fall on different local days
        let cal = Calendar::new(2 * H);
        let schedule = Schedule(vec![defense("A101", DAY0 + 21 * H + 30 * M, 120)]);
        assert!(is_slot_available(&schedule, &cal, "A101", DAY0 + 23 * H, 30, None));
        assert!(!is_slot_available(&schedule, &cal, "A101", DAY0 + 21 * H, 60, None));
    }

    #[test]
    fn room_state_lookup_ignores_other_rooms() {
        let cal = Calendar::utc();
        let mut room = RoomState::new("A101".into());
        room.insert_defense(defense("A101", DAY0 + 10 * H, 60));
        assert!(!is_slot_available(&room, &cal, "A101", DAY0 + 10 * H, 60, None));
        assert!(is_slot_available(&room, &cal, "B202", DAY0 + 10 * H, 60, None));
    }

    // ── Defense validation ───────────────────────────────

    #[test]
    fn valid_new_defense_passes() {
        let d = defense("A101", DAY0 + 10 * H, 60);
        let dir = directory_for(&d);
        let schedule = Schedule(vec![]);
        let now = DAY0;
        assert!(validate_defense(&d, Intent::Create, &dir, &schedule, &Calendar::utc(), now).is_ok());
    }

    #[test]
    fn unknown_thesis_is_a_reference_error() {
        let d = defense("A101", DAY0 + 10 * H, 60);
        let mut dir = directory_for(&d);
        dir.theses.clear();
        let result = validate_defense(&d, Intent::Create, &dir, &Schedule(vec![]), &Calendar::utc(), DAY0);
        assert!(matches!(result, Err(EngineError::Reference { kind: "thesis", .. })));
    }

    #[test]
    fn unknown_jury_is_a_reference_error() {
        let d = defense("A101", DAY0 + 10 * H, 60);
        let mut dir = directory_for(&d);
        dir.juries.clear();
        let result = validate_defense(&d, Intent::Create, &dir, &Schedule(vec![]), &Calendar::utc(), DAY0);
        assert!(matches!(result, Err(EngineError::Reference { kind: "jury", .. })));
    }

    #[test]
    fn overlapping_defense_is_a_conflict() {
        let booked = defense("A101", DAY0 + 10 * H, 60);
        let d = defense("A101", DAY0 + 10 * H + 30 * M, 60);
        let dir = directory_for(&d);
        let schedule = Schedule(vec![booked.clone()]);
        let result = validate_defense(&d, Intent::Create, &dir, &schedule, &Calendar::utc(), DAY0);
        assert!(matches!(result, Err(EngineError::Conflict(id)) if id == booked.id));
    }

    #[test]
    fn update_excludes_itself_from_conflicts() {
        let booked = defense("A101", DAY0 + 10 * H, 60);
        let mut moved = booked.clone();
        moved.start += 30 * M;
        let dir = directory_for(&moved);
        let schedule = Schedule(vec![booked]);
        let cal = Calendar::utc();
        assert!(validate_defense(&moved, Intent::Update, &dir, &schedule, &cal, DAY0).is_ok());
        assert!(matches!(
            validate_defense(&moved, Intent::Create, &dir, &schedule, &cal, DAY0),
            Err(EngineError::Conflict(_))
        ));
    }

    #[test]
    fn past_start_fails_on_create_but_not_on_update() {
        let d = defense("A101", DAY0 + 10 * H, 60);
        let dir = directory_for(&d);
        let schedule = Schedule(vec![]);
        let cal = Calendar::utc();
        let now = DAY0 + 12 * H;
        assert!(matches!(
            validate_defense(&d, Intent::Create, &dir, &schedule, &cal, now),
            Err(EngineError::Validation(_))
        ));
        assert!(validate_defense(&d, Intent::Update, &dir, &schedule, &cal, now).is_ok());
    }

    #[test]
    fn start_equal_to_now_is_not_in_the_future() {
        let d = defense("A101", DAY0 + 10 * H, 60);
        let dir = directory_for(&d);
        let result = validate_defense(&d, Intent::Create, &dir, &Schedule(vec![]), &Calendar::utc(), d.start);
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[test]
    fn blank_room_and_zero_duration_are_rejected() {
        let cal = Calendar::utc();
        let mut d = defense("  ", DAY0 + 10 * H, 60);
        let dir = directory_for(&d);
        assert!(matches!(
            validate_defense(&d, Intent::Create, &dir, &Schedule(vec![]), &cal, DAY0),
            Err(EngineError::Validation("room is required"))
        ));
        d.room = "A101".into();
        d.duration_minutes = 0;
        assert!(matches!(
            validate_defense(&d, Intent::Create, &dir, &Schedule(vec![]), &cal, DAY0),
            Err(EngineError::Validation("duration must be positive"))
        ));
    }

    // ── Jury validation ──────────────────────────────────

    #[test]
    fn jury_with_two_members_passes() {
        let (dir, ids) = faculty(3);
        let j = jury(ids[0], vec![ids[1], ids[2]]);
        assert!(validate_jury(&j, &dir).is_ok());
    }

    #[test]
    fn jury_with_one_member_fails() {
        let (dir, ids) = faculty(2);
        let j = jury(ids[0], vec![ids[1]]);
        assert!(matches!(validate_jury(&j, &dir), Err(EngineError::Validation(_))));
    }

    #[test]
    fn president_listed_as_member_fails() {
        let (dir, ids) = faculty(3);
        let j = jury(ids[0], vec![ids[0], ids[1], ids[2]]);
        assert!(matches!(
            validate_jury(&j, &dir),
            Err(EngineError::Validation("the president cannot also be a jury member"))
        ));
    }

    #[test]
    fn duplicate_members_fail() {
        let (dir, ids) = faculty(3);
        let j = jury(ids[0], vec![ids[1], ids[2], ids[1]]);
        assert!(matches!(
            validate_jury(&j, &dir),
            Err(EngineError::Validation("a professor cannot sit on the same jury twice"))
        ));
    }

    #[test]
    fn unknown_president_or_member_is_a_reference_error() {
        let (dir, ids) = faculty(3);
        let stranger = Ulid::new();

        let j = jury(stranger, vec![ids[1], ids[2]]);
        assert!(matches!(
            validate_jury(&j, &dir),
            Err(EngineError::Reference { id, .. }) if id == stranger
        ));

        let j = jury(ids[0], vec![ids[1], stranger]);
        assert!(matches!(
            validate_jury(&j, &dir),
            Err(EngineError::Reference { id, .. }) if id == stranger
        ));
    }
}
