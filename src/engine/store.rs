use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::scheduler::{FacultyLookup, JuryLookup, ThesisLookup};
use super::EngineError;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

/// Where a defense lives and what it points at, readable without the room lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefenseRef {
    pub room: String,
    pub thesis_id: Ulid,
    pub jury_id: Ulid,
}

/// In-memory registries for one tenant. Records reference each other by id only.
pub struct Store {
    pub(super) students: DashMap<Ulid, Student>,
    pub(super) professors: DashMap<Ulid, Professor>,
    pub(super) theses: DashMap<Ulid, Thesis>,
    pub(super) juries: DashMap<Ulid, Jury>,
    pub(super) rooms: DashMap<String, SharedRoomState>,
    /// Reverse lookup: defense id → room and references
    pub(super) defenses: DashMap<Ulid, DefenseRef>,
    /// thesis id → its defense (at most one)
    pub(super) thesis_defense: DashMap<Ulid, Ulid>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            students: DashMap::new(),
            professors: DashMap::new(),
            theses: DashMap::new(),
            juries: DashMap::new(),
            rooms: DashMap::new(),
            defenses: DashMap::new(),
            thesis_defense: DashMap::new(),
        }
    }

    // ── Rooms ────────────────────────────────────────────────

    /// Get the room, creating an empty one on first use.
    pub fn room(&self, name: &str) -> SharedRoomState {
        if let Some(room) = self.rooms.get(name) {
            return room.value().clone();
        }
        self.rooms
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(RoomState::new(name.to_string()))))
            .value()
            .clone()
    }

    pub fn existing_room(&self, name: &str) -> Option<SharedRoomState> {
        self.rooms.get(name).map(|e| e.value().clone())
    }

    /// Forget `room` once its last defense is gone. Callers hold the room's
    /// write guard and the engine write lock.
    pub fn drop_if_empty(&self, room: &RoomState) {
        if room.defenses.is_empty() {
            self.rooms.remove(&room.name);
        }
    }

    pub fn room_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    // ── Defense index ────────────────────────────────────────

    pub fn defense_ref(&self, id: &Ulid) -> Option<DefenseRef> {
        self.defenses.get(id).map(|e| e.value().clone())
    }

    pub fn defense_count(&self) -> usize {
        self.defenses.len()
    }

    pub fn defense_for_thesis(&self, thesis_id: &Ulid) -> Option<Ulid> {
        self.thesis_defense.get(thesis_id).map(|e| *e.value())
    }

    pub fn jury_has_defenses(&self, jury_id: &Ulid) -> bool {
        self.defenses.iter().any(|e| e.value().jury_id == *jury_id)
    }

    fn unindex_defense(&self, id: &Ulid) {
        if let Some((_, old)) = self.defenses.remove(id) {
            self.thesis_defense.remove_if(&old.thesis_id, |_, d| d == id);
        }
    }

    /// Store `defense` in `target`, removing any previous copy first.
    /// `source` is the defense's previous room when it moves between rooms.
    pub fn place_defense(&self, target: &mut RoomState, source: Option<&mut RoomState>, defense: Defense) {
        match source {
            Some(src) => {
                src.remove_defense(defense.id);
            }
            None => {
                target.remove_defense(defense.id);
            }
        }
        self.unindex_defense(&defense.id);
        self.defenses.insert(
            defense.id,
            DefenseRef {
                room: defense.room.clone(),
                thesis_id: defense.thesis_id,
                jury_id: defense.jury_id,
            },
        );
        self.thesis_defense.insert(defense.thesis_id, defense.id);
        target.insert_defense(defense);
    }

    pub fn remove_defense(&self, room: &mut RoomState, id: &Ulid) -> Option<Defense> {
        let removed = room.remove_defense(*id);
        self.unindex_defense(id);
        removed
    }

    // ── Uniqueness ───────────────────────────────────────────

    /// Email and student number must not belong to any *other* student.
    pub fn check_student_unique(&self, student: &Student) -> Result<(), EngineError> {
        for entry in self.students.iter() {
            let other = entry.value();
            if other.id == student.id {
                continue;
            }
            if other.email == student.email {
                return Err(EngineError::Duplicate {
                    field: "email",
                    value: student.email.clone(),
                });
            }
            if other.student_number == student.student_number {
                return Err(EngineError::Duplicate {
                    field: "student_number",
                    value: student.student_number.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn check_professor_unique(&self, professor: &Professor) -> Result<(), EngineError> {
        let taken = self
            .professors
            .iter()
            .any(|e| e.value().id != professor.id && e.value().email == professor.email);
        if taken {
            return Err(EngineError::Duplicate {
                field: "email",
                value: professor.email.clone(),
            });
        }
        Ok(())
    }

    // ── Dependents ───────────────────────────────────────────

    pub fn student_has_theses(&self, student_id: &Ulid) -> bool {
        self.theses.iter().any(|e| e.value().student_id == *student_id)
    }

    /// What still points at this professor, if anything.
    pub fn professor_dependents(&self, professor_id: &Ulid) -> Option<&'static str> {
        let supervises = self.theses.iter().any(|e| {
            let t = e.value();
            t.director_id == *professor_id || t.co_director_id == Some(*professor_id)
        });
        if supervises {
            return Some("theses");
        }
        let sits = self.juries.iter().any(|e| {
            let j = e.value();
            j.president_id == *professor_id || j.member_ids.contains(professor_id)
        });
        sits.then_some("juries")
    }

    // ── Event application ────────────────────────────────────

    /// Apply a registry event. Defense events need room locks and go through
    /// `place_defense` / `remove_defense` instead.
    pub fn apply_registry_event(&self, event: &Event) {
        match event {
            Event::StudentSaved(s) => {
                self.students.insert(s.id, s.clone());
            }
            Event::StudentDeleted { id } => {
                self.students.remove(id);
            }
            Event::ProfessorSaved(p) => {
                self.professors.insert(p.id, p.clone());
            }
            Event::ProfessorDeleted { id } => {
                self.professors.remove(id);
            }
            Event::ThesisSaved(t) => {
                self.theses.insert(t.id, t.clone());
            }
            Event::ThesisDeleted { id } => {
                self.theses.remove(id);
            }
            Event::JurySaved(j) => {
                self.juries.insert(j.id, j.clone());
            }
            Event::JuryDeleted { id } => {
                self.juries.remove(id);
            }
            Event::DefenseSaved(_) | Event::DefenseDeleted { .. } => {}
        }
    }
}

impl ThesisLookup for Store {
    fn thesis_exists(&self, id: &Ulid) -> bool {
        self.theses.contains_key(id)
    }
}

impl JuryLookup for Store {
    fn jury_exists(&self, id: &Ulid) -> bool {
        self.juries.contains_key(id)
    }
}

impl FacultyLookup for Store {
    fn professor_exists(&self, id: &Ulid) -> bool {
        self.professors.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defense(room: &str, thesis_id: Ulid) -> Defense {
        Defense {
            id: Ulid::new(),
            thesis_id,
            jury_id: Ulid::new(),
            room: room.into(),
            start: 1_000,
            duration_minutes: 60,
            status: DefenseStatus::Scheduled,
            final_grade: None,
            honor: None,
            observations: String::new(),
        }
    }

    #[test]
    fn place_and_move_defense_keeps_index_in_sync() {
        let store = Store::new();
        let thesis = Ulid::new();
        let mut a = RoomState::new("A101".into());
        let mut b = RoomState::new("B202".into());

        let mut d = defense("A101", thesis);
        store.place_defense(&mut a, None, d.clone());
        assert_eq!(a.defenses.len(), 1);
        assert_eq!(store.defense_ref(&d.id).unwrap().room, "A101");
        assert_eq!(store.defense_for_thesis(&thesis), Some(d.id));

        // Replace in place
        d.duration_minutes = 90;
        store.place_defense(&mut a, None, d.clone());
        assert_eq!(a.defenses.len(), 1);
        assert_eq!(a.defenses[0].duration_minutes, 90);

        // Move to another room
        d.room = "B202".into();
        store.place_defense(&mut b, Some(&mut a), d.clone());
        assert!(a.defenses.is_empty());
        assert_eq!(b.defenses.len(), 1);
        assert_eq!(store.defense_ref(&d.id).unwrap().room, "B202");

        assert!(store.remove_defense(&mut b, &d.id).is_some());
        assert!(store.defense_ref(&d.id).is_none());
        assert_eq!(store.defense_for_thesis(&thesis), None);
    }

    #[test]
    fn changing_thesis_releases_the_old_one() {
        let store = Store::new();
        let (t1, t2) = (Ulid::new(), Ulid::new());
        let mut room = RoomState::new("A101".into());
        let mut d = defense("A101", t1);
        store.place_defense(&mut room, None, d.clone());
        d.thesis_id = t2;
        store.place_defense(&mut room, None, d.clone());
        assert_eq!(store.defense_for_thesis(&t1), None);
        assert_eq!(store.defense_for_thesis(&t2), Some(d.id));
    }

    #[test]
    fn room_is_created_once() {
        let store = Store::new();
        let r1 = store.room("A101");
        let r2 = store.room("A101");
        assert!(Arc::ptr_eq(&r1, &r2));
        assert!(store.existing_room("B202").is_none());
        assert_eq!(store.room_names(), vec!["A101".to_string()]);
    }
}
