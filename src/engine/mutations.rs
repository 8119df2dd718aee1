use std::sync::Arc;

use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::scheduler::{validate_defense, validate_jury, Intent};
use super::validate::*;
use super::{Engine, EngineError, SharedRoomState};

impl Engine {
    // ── Students ─────────────────────────────────────────────

    pub async fn create_student(&self, student: Student) -> Result<(), EngineError> {
        validate_student_fields(&student)?;
        let _w = self.write_lock.lock().await;
        if self.store.students.contains_key(&student.id) {
            return Err(EngineError::AlreadyExists(student.id));
        }
        if self.store.students.len() >= MAX_RECORDS_PER_REGISTRY {
            return Err(EngineError::LimitExceeded("too many students"));
        }
        self.store.check_student_unique(&student)?;
        tracing::debug!(id = %student.id, number = %student.student_number, "create student");
        self.commit(Event::StudentSaved(student)).await
    }

    pub async fn update_student(&self, student: Student) -> Result<(), EngineError> {
        validate_student_fields(&student)?;
        let _w = self.write_lock.lock().await;
        if !self.store.students.contains_key(&student.id) {
            return Err(EngineError::NotFound(student.id));
        }
        self.store.check_student_unique(&student)?;
        tracing::debug!(id = %student.id, "update student");
        self.commit(Event::StudentSaved(student)).await
    }

    pub async fn delete_student(&self, id: Ulid) -> Result<(), EngineError> {
        let _w = self.write_lock.lock().await;
        if !self.store.students.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if self.store.student_has_theses(&id) {
            return Err(EngineError::HasDependents { id, dependents: "theses" });
        }
        tracing::debug!(%id, "delete student");
        self.commit(Event::StudentDeleted { id }).await
    }

    // ── Professors ───────────────────────────────────────────

    pub async fn create_professor(&self, professor: Professor) -> Result<(), EngineError> {
        validate_professor_fields(&professor)?;
        let _w = self.write_lock.lock().await;
        if self.store.professors.contains_key(&professor.id) {
            return Err(EngineError::AlreadyExists(professor.id));
        }
        if self.store.professors.len() >= MAX_RECORDS_PER_REGISTRY {
            return Err(EngineError::LimitExceeded("too many professors"));
        }
        self.store.check_professor_unique(&professor)?;
        tracing::debug!(id = %professor.id, "create professor");
        self.commit(Event::ProfessorSaved(professor)).await
    }

    pub async fn update_professor(&self, professor: Professor) -> Result<(), EngineError> {
        validate_professor_fields(&professor)?;
        let _w = self.write_lock.lock().await;
        if !self.store.professors.contains_key(&professor.id) {
            return Err(EngineError::NotFound(professor.id));
        }
        self.store.check_professor_unique(&professor)?;
        tracing::debug!(id = %professor.id, "update professor");
        self.commit(Event::ProfessorSaved(professor)).await
    }

    pub async fn delete_professor(&self, id: Ulid) -> Result<(), EngineError> {
        let _w = self.write_lock.lock().await;
        if !self.store.professors.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if let Some(dependents) = self.store.professor_dependents(&id) {
            return Err(EngineError::HasDependents { id, dependents });
        }
        tracing::debug!(%id, "delete professor");
        self.commit(Event::ProfessorDeleted { id }).await
    }

    // ── Theses ───────────────────────────────────────────────

    pub async fn create_thesis(&self, mut thesis: Thesis) -> Result<(), EngineError> {
        validate_timestamp(thesis.created_at)?;
        let _w = self.write_lock.lock().await;
        if self.store.theses.contains_key(&thesis.id) {
            return Err(EngineError::AlreadyExists(thesis.id));
        }
        if self.store.theses.len() >= MAX_RECORDS_PER_REGISTRY {
            return Err(EngineError::LimitExceeded("too many theses"));
        }
        self.check_thesis(&thesis)?;
        stamp_submission(&mut thesis, None);
        tracing::debug!(id = %thesis.id, student = %thesis.student_id, "create thesis");
        self.commit(Event::ThesisSaved(thesis)).await
    }

    pub async fn update_thesis(&self, mut thesis: Thesis) -> Result<(), EngineError> {
        validate_timestamp(thesis.created_at)?;
        let _w = self.write_lock.lock().await;
        let previous = self
            .store
            .theses
            .get(&thesis.id)
            .map(|e| e.submitted_at)
            .ok_or(EngineError::NotFound(thesis.id))?;
        self.check_thesis(&thesis)?;
        stamp_submission(&mut thesis, previous);
        tracing::debug!(id = %thesis.id, "update thesis");
        self.commit(Event::ThesisSaved(thesis)).await
    }

    /// Unvalidated status change. Stamps `submitted_at` the first time a
    /// thesis becomes Submitted.
    pub async fn set_thesis_status(&self, id: Ulid, status: ThesisStatus) -> Result<Thesis, EngineError> {
        let _w = self.write_lock.lock().await;
        let mut thesis = self
            .store
            .theses
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        let previous = thesis.submitted_at;
        thesis.status = status;
        stamp_submission(&mut thesis, previous);
        tracing::debug!(%id, %status, "set thesis status");
        self.commit(Event::ThesisSaved(thesis.clone())).await?;
        Ok(thesis)
    }

    pub async fn delete_thesis(&self, id: Ulid) -> Result<(), EngineError> {
        let _w = self.write_lock.lock().await;
        if !self.store.theses.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if self.store.defense_for_thesis(&id).is_some() {
            return Err(EngineError::HasDependents { id, dependents: "defense" });
        }
        tracing::debug!(%id, "delete thesis");
        self.commit(Event::ThesisDeleted { id }).await
    }

    fn check_thesis(&self, thesis: &Thesis) -> Result<(), EngineError> {
        if !self.store.students.contains_key(&thesis.student_id) {
            return Err(EngineError::Reference {
                kind: "student",
                id: thesis.student_id,
            });
        }
        validate_thesis(thesis, &self.store)
    }

    // ── Juries ───────────────────────────────────────────────

    pub async fn create_jury(&self, jury: Jury) -> Result<(), EngineError> {
        validate_jury_limits(&jury)?;
        validate_timestamp(jury.created_at)?;
        let _w = self.write_lock.lock().await;
        if self.store.juries.contains_key(&jury.id) {
            return Err(EngineError::AlreadyExists(jury.id));
        }
        if self.store.juries.len() >= MAX_RECORDS_PER_REGISTRY {
            return Err(EngineError::LimitExceeded("too many juries"));
        }
        validate_jury(&jury, &self.store)?;
        tracing::debug!(id = %jury.id, members = jury.member_ids.len(), "create jury");
        self.commit(Event::JurySaved(jury)).await
    }

    pub async fn update_jury(&self, jury: Jury) -> Result<(), EngineError> {
        validate_jury_limits(&jury)?;
        validate_timestamp(jury.created_at)?;
        let _w = self.write_lock.lock().await;
        if !self.store.juries.contains_key(&jury.id) {
            return Err(EngineError::NotFound(jury.id));
        }
        validate_jury(&jury, &self.store)?;
        tracing::debug!(id = %jury.id, "update jury");
        self.commit(Event::JurySaved(jury)).await
    }

    pub async fn delete_jury(&self, id: Ulid) -> Result<(), EngineError> {
        let _w = self.write_lock.lock().await;
        if !self.store.juries.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if self.store.jury_has_defenses(&id) {
            return Err(EngineError::HasDependents { id, dependents: "defenses" });
        }
        tracing::debug!(%id, "delete jury");
        self.commit(Event::JuryDeleted { id }).await
    }

    // ── Defenses ─────────────────────────────────────────────

    /// The named room, or a detached empty one that is only registered once a
    /// defense is actually placed in it.
    fn room_for_write(&self, name: &str) -> (SharedRoomState, bool) {
        match self.store.existing_room(name) {
            Some(rs) => (rs, false),
            None => (Arc::new(RwLock::new(RoomState::new(name.to_string()))), true),
        }
    }

    fn register_room(&self, name: &str, rs: &SharedRoomState) {
        self.store.rooms.insert(name.to_string(), rs.clone());
    }

    fn check_thesis_free(&self, defense: &Defense) -> Result<(), EngineError> {
        match self.store.defense_for_thesis(&defense.thesis_id) {
            Some(other) if other != defense.id => Err(EngineError::Duplicate {
                field: "thesis_id",
                value: defense.thesis_id.to_string(),
            }),
            _ => Ok(()),
        }
    }

    pub async fn create_defense(&self, defense: Defense) -> Result<(), EngineError> {
        validate_defense_limits(&defense)?;
        let _w = self.write_lock.lock().await;
        if self.store.defense_ref(&defense.id).is_some() {
            return Err(EngineError::AlreadyExists(defense.id));
        }
        self.check_thesis_free(&defense)?;

        let (rs, fresh) = self.room_for_write(&defense.room);
        let mut guard = rs.write().await;
        if guard.defenses.len() >= MAX_DEFENSES_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many defenses in room"));
        }
        validate_defense(&defense, Intent::Create, &self.store, &*guard, &self.calendar, now_ms())?;

        tracing::debug!(id = %defense.id, room = %defense.room, start = defense.start, "create defense");
        self.wal_append(&Event::DefenseSaved(defense.clone())).await?;
        if fresh {
            self.register_room(&defense.room, &rs);
        }
        self.store.place_defense(&mut guard, None, defense);
        Ok(())
    }

    /// Replace a defense by id. It may move to another room or time; the slot
    /// check ignores the defense's own current booking.
    pub async fn update_defense(&self, defense: Defense) -> Result<(), EngineError> {
        validate_defense_limits(&defense)?;
        let _w = self.write_lock.lock().await;
        let current = self
            .store
            .defense_ref(&defense.id)
            .ok_or(EngineError::NotFound(defense.id))?;
        self.check_thesis_free(&defense)?;

        if current.room == defense.room {
            let rs = self
                .store
                .existing_room(&current.room)
                .ok_or(EngineError::NotFound(defense.id))?;
            let mut guard = rs.write().await;
            validate_defense(&defense, Intent::Update, &self.store, &*guard, &self.calendar, now_ms())?;
            tracing::debug!(id = %defense.id, start = defense.start, "update defense");
            self.wal_append(&Event::DefenseSaved(defense.clone())).await?;
            self.store.place_defense(&mut guard, None, defense);
            return Ok(());
        }

        let source = self
            .store
            .existing_room(&current.room)
            .ok_or(EngineError::NotFound(defense.id))?;
        let (target, fresh) = self.room_for_write(&defense.room);
        let (mut src_guard, mut dst_guard) = if current.room < defense.room {
            let s = source.write().await;
            (s, target.write().await)
        } else {
            let t = target.write().await;
            (source.write().await, t)
        };
        if dst_guard.defenses.len() >= MAX_DEFENSES_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many defenses in room"));
        }
        validate_defense(&defense, Intent::Update, &self.store, &*dst_guard, &self.calendar, now_ms())?;

        tracing::debug!(id = %defense.id, from = %current.room, to = %defense.room, "move defense");
        self.wal_append(&Event::DefenseSaved(defense.clone())).await?;
        if fresh {
            self.register_room(&defense.room, &target);
        }
        self.store.place_defense(&mut dst_guard, Some(&mut src_guard), defense);
        self.store.drop_if_empty(&src_guard);
        Ok(())
    }

    /// Change a defense in place without rescheduling it.
    async fn modify_defense(
        &self,
        id: Ulid,
        change: impl FnOnce(&mut Defense),
    ) -> Result<Defense, EngineError> {
        let _w = self.write_lock.lock().await;
        let location = self.store.defense_ref(&id).ok_or(EngineError::NotFound(id))?;
        let rs = self
            .store
            .existing_room(&location.room)
            .ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;
        let mut defense = guard.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
        change(&mut defense);
        self.wal_append(&Event::DefenseSaved(defense.clone())).await?;
        self.store.place_defense(&mut guard, None, defense.clone());
        Ok(defense)
    }

    /// Any status may follow any other.
    pub async fn set_defense_status(&self, id: Ulid, status: DefenseStatus) -> Result<Defense, EngineError> {
        tracing::debug!(%id, %status, "set defense status");
        self.modify_defense(id, |d| d.status = status).await
    }

    /// Record the outcome of a defense and mark it Completed.
    pub async fn record_grade(&self, id: Ulid, grade: f64, honor: Honor) -> Result<Defense, EngineError> {
        validate_grade(grade)?;
        tracing::debug!(%id, grade, %honor, "record grade");
        self.modify_defense(id, |d| {
            d.final_grade = Some(grade);
            d.honor = Some(honor);
            d.status = DefenseStatus::Completed;
        })
        .await
    }

    pub async fn delete_defense(&self, id: Ulid) -> Result<(), EngineError> {
        let _w = self.write_lock.lock().await;
        let location = self.store.defense_ref(&id).ok_or(EngineError::NotFound(id))?;
        let rs = self
            .store
            .existing_room(&location.room)
            .ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;
        tracing::debug!(%id, room = %location.room, "delete defense");
        self.wal_append(&Event::DefenseDeleted {
            id,
            room: location.room,
        })
        .await?;
        self.store.remove_defense(&mut guard, &id);
        self.store.drop_if_empty(&guard);
        Ok(())
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the minimal event list that recreates current state.
    /// Referenced records come before the records that reference them.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _w = self.write_lock.lock().await;

        let mut professors: Vec<Professor> = self.store.professors.iter().map(|e| e.value().clone()).collect();
        professors.sort_by_key(|p| p.id);
        let mut students: Vec<Student> = self.store.students.iter().map(|e| e.value().clone()).collect();
        students.sort_by_key(|s| s.id);
        let mut theses: Vec<Thesis> = self.store.theses.iter().map(|e| e.value().clone()).collect();
        theses.sort_by_key(|t| t.id);
        let mut juries: Vec<Jury> = self.store.juries.iter().map(|e| e.value().clone()).collect();
        juries.sort_by_key(|j| j.id);

        let mut events: Vec<Event> = Vec::new();
        events.extend(professors.into_iter().map(Event::ProfessorSaved));
        events.extend(students.into_iter().map(Event::StudentSaved));
        events.extend(theses.into_iter().map(Event::ThesisSaved));
        events.extend(juries.into_iter().map(Event::JurySaved));
        for name in self.store.room_names() {
            let Some(rs) = self.store.existing_room(&name) else {
                continue;
            };
            let guard = rs.read().await;
            events.extend(guard.defenses.iter().cloned().map(Event::DefenseSaved));
        }

        let count = events.len();
        self.wal
            .compact(events)
            .await
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        tracing::info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }
}

/// Keep an earlier submission time, or stamp now on the first Submitted.
/// Whatever the caller put in `submitted_at` is discarded.
fn stamp_submission(thesis: &mut Thesis, previous: Option<Ms>) {
    thesis.submitted_at = match previous {
        Some(t) => Some(t),
        None => (thesis.status == ThesisStatus::Submitted).then(now_ms),
    };
}
