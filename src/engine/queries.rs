use std::collections::BTreeMap;

use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::scheduler;
use super::validate::validate_timestamp;
use super::{Engine, EngineError};

/// Records matching `pred`, ordered by id.
fn select<T: Clone>(map: &DashMap<Ulid, T>, pred: impl Fn(&T) -> bool) -> Vec<T> {
    let mut rows: Vec<(Ulid, T)> = map
        .iter()
        .filter(|e| pred(e.value()))
        .map(|e| (*e.key(), e.value().clone()))
        .collect();
    rows.sort_by_key(|(id, _)| *id);
    rows.into_iter().map(|(_, v)| v).collect()
}

/// Case-insensitive substring match; `needle` is already lowercase.
fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(needle)
}

fn validate_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    validate_timestamp(start)?;
    validate_timestamp(end)?;
    if start >= end {
        return Err(EngineError::Validation("window start must be before its end"));
    }
    if end - start > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(Span::new(start, end))
}

fn validate_slot(start: Ms, duration_minutes: u32) -> Result<(), EngineError> {
    validate_timestamp(start)?;
    if duration_minutes == 0 {
        return Err(EngineError::Validation("duration must be positive"));
    }
    if duration_minutes > MAX_DURATION_MINUTES {
        return Err(EngineError::LimitExceeded("defense too long"));
    }
    Ok(())
}

impl Engine {
    // ── Students ─────────────────────────────────────────────

    pub fn get_student(&self, id: &Ulid) -> Option<Student> {
        self.store.students.get(id).map(|e| e.value().clone())
    }

    pub fn list_students(&self) -> Vec<Student> {
        select(&self.store.students, |_| true)
    }

    pub fn find_student_by_email(&self, email: &str) -> Option<Student> {
        select(&self.store.students, |s| s.email == email).into_iter().next()
    }

    pub fn find_student_by_number(&self, number: &str) -> Option<Student> {
        select(&self.store.students, |s| s.student_number == number)
            .into_iter()
            .next()
    }

    pub fn students_by_program(&self, program: &str) -> Vec<Student> {
        select(&self.store.students, |s| s.program == program)
    }

    pub fn students_by_level(&self, level: StudyLevel) -> Vec<Student> {
        select(&self.store.students, |s| s.level == level)
    }

    /// Case-insensitive match over names, email, program and student number.
    pub fn search_students(&self, term: &str) -> Vec<Student> {
        let needle = term.to_lowercase();
        select(&self.store.students, |s| {
            [&s.last_name, &s.first_name, &s.email, &s.program, &s.student_number]
                .iter()
                .any(|field| contains_ci(field, &needle))
        })
    }

    pub fn students_without_thesis(&self) -> Vec<Student> {
        select(&self.store.students, |s| !self.store.student_has_theses(&s.id))
    }

    pub fn count_students_by_level(&self) -> Vec<(StudyLevel, usize)> {
        StudyLevel::ALL
            .iter()
            .map(|level| {
                let n = self.store.students.iter().filter(|e| e.level == *level).count();
                (*level, n)
            })
            .collect()
    }

    /// Student count per program, ordered by program name.
    pub fn students_per_program(&self) -> Vec<(String, usize)> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for entry in self.store.students.iter() {
            *counts.entry(entry.program.clone()).or_default() += 1;
        }
        counts.into_iter().collect()
    }

    // ── Professors ───────────────────────────────────────────

    pub fn get_professor(&self, id: &Ulid) -> Option<Professor> {
        self.store.professors.get(id).map(|e| e.value().clone())
    }

    pub fn list_professors(&self) -> Vec<Professor> {
        select(&self.store.professors, |_| true)
    }

    pub fn professors_by_department(&self, department: &str) -> Vec<Professor> {
        select(&self.store.professors, |p| p.department == department)
    }

    pub fn professors_by_specialty(&self, specialty: &str) -> Vec<Professor> {
        select(&self.store.professors, |p| p.specialty == specialty)
    }

    pub fn professors_by_rank(&self, rank: AcademicRank) -> Vec<Professor> {
        select(&self.store.professors, |p| p.rank == rank)
    }

    pub fn search_professors(&self, term: &str) -> Vec<Professor> {
        let needle = term.to_lowercase();
        select(&self.store.professors, |p| {
            [&p.last_name, &p.first_name, &p.email, &p.department, &p.specialty]
                .iter()
                .any(|field| contains_ci(field, &needle))
        })
    }

    // ── Theses ───────────────────────────────────────────────

    pub fn get_thesis(&self, id: &Ulid) -> Option<Thesis> {
        self.store.theses.get(id).map(|e| e.value().clone())
    }

    pub fn list_theses(&self) -> Vec<Thesis> {
        select(&self.store.theses, |_| true)
    }

    pub fn theses_by_student(&self, student_id: &Ulid) -> Vec<Thesis> {
        select(&self.store.theses, |t| t.student_id == *student_id)
    }

    pub fn theses_by_director(&self, director_id: &Ulid) -> Vec<Thesis> {
        select(&self.store.theses, |t| t.director_id == *director_id)
    }

    pub fn theses_by_co_director(&self, co_director_id: &Ulid) -> Vec<Thesis> {
        select(&self.store.theses, |t| t.co_director_id == Some(*co_director_id))
    }

    pub fn theses_by_status(&self, status: ThesisStatus) -> Vec<Thesis> {
        select(&self.store.theses, |t| t.status == status)
    }

    pub fn theses_by_kind(&self, kind: ThesisKind) -> Vec<Thesis> {
        select(&self.store.theses, |t| t.kind == kind)
    }

    pub fn search_theses_by_title(&self, term: &str) -> Vec<Thesis> {
        let needle = term.to_lowercase();
        select(&self.store.theses, |t| contains_ci(&t.title, &needle))
    }

    pub fn search_theses_by_keyword(&self, term: &str) -> Vec<Thesis> {
        let needle = term.to_lowercase();
        select(&self.store.theses, |t| contains_ci(&t.keywords, &needle))
    }

    /// Theses whose submission time falls in `[start, end)`.
    pub fn theses_submitted_between(&self, start: Ms, end: Ms) -> Result<Vec<Thesis>, EngineError> {
        let window = validate_window(start, end)?;
        Ok(select(&self.store.theses, |t| {
            t.submitted_at.is_some_and(|at| window.contains_instant(at))
        }))
    }

    pub fn count_theses_by_director_and_status(&self, director_id: &Ulid, status: ThesisStatus) -> usize {
        self.store
            .theses
            .iter()
            .filter(|e| e.director_id == *director_id && e.status == status)
            .count()
    }

    // ── Juries ───────────────────────────────────────────────

    pub fn get_jury(&self, id: &Ulid) -> Option<Jury> {
        self.store.juries.get(id).map(|e| e.value().clone())
    }

    pub fn list_juries(&self) -> Vec<Jury> {
        select(&self.store.juries, |_| true)
    }

    pub fn juries_by_president(&self, president_id: &Ulid) -> Vec<Jury> {
        select(&self.store.juries, |j| j.president_id == *president_id)
    }

    pub fn juries_by_member(&self, member_id: &Ulid) -> Vec<Jury> {
        select(&self.store.juries, |j| j.member_ids.contains(member_id))
    }

    pub fn juries_created_between(&self, start: Ms, end: Ms) -> Result<Vec<Jury>, EngineError> {
        let window = validate_window(start, end)?;
        Ok(select(&self.store.juries, |j| window.contains_instant(j.created_at)))
    }

    pub fn count_juries_by_president(&self, president_id: &Ulid) -> usize {
        self.store
            .juries
            .iter()
            .filter(|e| e.president_id == *president_id)
            .count()
    }

    // ── Defenses ─────────────────────────────────────────────

    /// Defenses across all rooms matching `pred`, ordered by start then id.
    async fn collect_defenses(&self, pred: impl Fn(&Defense) -> bool) -> Vec<Defense> {
        let mut out = Vec::new();
        for name in self.store.room_names() {
            let Some(rs) = self.store.existing_room(&name) else {
                continue;
            };
            let guard = rs.read().await;
            out.extend(guard.defenses.iter().filter(|d| pred(d)).cloned());
        }
        out.sort_by_key(|d| (d.start, d.id));
        out
    }

    /// Defenses starting inside `window`, using each room's start index.
    async fn defenses_starting_within(&self, window: &Span) -> Vec<Defense> {
        let mut out = Vec::new();
        for name in self.store.room_names() {
            let Some(rs) = self.store.existing_room(&name) else {
                continue;
            };
            let guard = rs.read().await;
            out.extend_from_slice(guard.starting_within(window));
        }
        out.sort_by_key(|d| (d.start, d.id));
        out
    }

    pub async fn get_defense(&self, id: &Ulid) -> Option<Defense> {
        let location = self.store.defense_ref(id)?;
        let rs = self.store.existing_room(&location.room)?;
        let guard = rs.read().await;
        guard.get(id).cloned()
    }

    pub async fn list_defenses(&self) -> Vec<Defense> {
        self.collect_defenses(|_| true).await
    }

    pub async fn defense_for_thesis(&self, thesis_id: &Ulid) -> Option<Defense> {
        let id = self.store.defense_for_thesis(thesis_id)?;
        self.get_defense(&id).await
    }

    pub async fn defenses_by_jury(&self, jury_id: &Ulid) -> Vec<Defense> {
        self.collect_defenses(|d| d.jury_id == *jury_id).await
    }

    pub async fn defenses_by_status(&self, status: DefenseStatus) -> Vec<Defense> {
        self.collect_defenses(|d| d.status == status).await
    }

    pub async fn defenses_in_room(&self, room: &str) -> Vec<Defense> {
        match self.store.existing_room(room) {
            Some(rs) => rs.read().await.defenses.clone(),
            None => Vec::new(),
        }
    }

    /// Defenses starting in `[start, end)`.
    pub async fn defenses_between(&self, start: Ms, end: Ms) -> Result<Vec<Defense>, EngineError> {
        let window = validate_window(start, end)?;
        Ok(self.defenses_starting_within(&window).await)
    }

    /// Defenses starting on the calendar day containing `t`.
    pub async fn defenses_on_day(&self, t: Ms) -> Result<Vec<Defense>, EngineError> {
        validate_timestamp(t)?;
        let day = self.calendar.day_containing(t);
        Ok(self.defenses_starting_within(&day).await)
    }

    /// Scheduled defenses ordered by start, at most `limit` of them.
    pub async fn upcoming_defenses(&self, limit: usize) -> Vec<Defense> {
        let mut out = self
            .collect_defenses(|d| d.status == DefenseStatus::Scheduled)
            .await;
        out.truncate(limit);
        out
    }

    pub async fn count_defenses_by_jury_and_status(&self, jury_id: &Ulid, status: DefenseStatus) -> usize {
        self.collect_defenses(|d| d.jury_id == *jury_id && d.status == status)
            .await
            .len()
    }

    /// Whether `room` is free for `[start, start + duration)`. A room nobody
    /// has booked yet is always free.
    pub async fn is_slot_available(
        &self,
        room: &str,
        start: Ms,
        duration_minutes: u32,
        exclude_id: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        validate_slot(start, duration_minutes)?;
        let Some(rs) = self.store.existing_room(room) else {
            return Ok(true);
        };
        let guard = rs.read().await;
        Ok(scheduler::is_slot_available(
            &*guard,
            &self.calendar,
            room,
            start,
            duration_minutes,
            exclude_id,
        ))
    }

    // ── Statistics ───────────────────────────────────────────

    pub async fn dashboard(&self) -> Dashboard {
        let defenses = self.list_defenses().await;

        let theses_by_status = ThesisStatus::ALL
            .iter()
            .map(|s| {
                let n = self.store.theses.iter().filter(|e| e.status == *s).count();
                (*s, n)
            })
            .collect();
        let defenses_by_status = DefenseStatus::ALL
            .iter()
            .map(|s| (*s, defenses.iter().filter(|d| d.status == *s).count()))
            .collect();
        let upcoming = defenses
            .iter()
            .filter(|d| d.status == DefenseStatus::Scheduled)
            .take(UPCOMING_DEFENSES)
            .cloned()
            .collect();

        Dashboard {
            students: self.store.students.len(),
            professors: self.store.professors.len(),
            theses: self.store.theses.len(),
            juries: self.store.juries.len(),
            defenses: defenses.len(),
            theses_by_status,
            defenses_by_status,
            students_per_program: self.students_per_program(),
            upcoming,
        }
    }
}
