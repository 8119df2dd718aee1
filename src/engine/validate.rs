use crate::limits::*;
use crate::model::*;

use super::scheduler::FacultyLookup;
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_timestamp(t: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&t) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

fn required(value: &str, msg: &'static str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::Validation(msg));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("field too long"));
    }
    Ok(())
}

fn bounded_text(value: &str) -> Result<(), EngineError> {
    if value.len() > MAX_TEXT_LEN {
        return Err(EngineError::LimitExceeded("text too long"));
    }
    Ok(())
}

fn email(value: &str) -> Result<(), EngineError> {
    required(value, "email is required")?;
    match value.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
        _ => Err(EngineError::Validation("email is malformed")),
    }
}

pub(crate) fn validate_student_fields(s: &Student) -> Result<(), EngineError> {
    required(&s.last_name, "last name is required")?;
    required(&s.first_name, "first name is required")?;
    email(&s.email)?;
    required(&s.student_number, "student number is required")?;
    required(&s.program, "program is required")?;
    if let Some(born) = s.birth_date {
        // Birth dates before 1970 are legitimate.
        if born >= MAX_VALID_TIMESTAMP_MS {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
    }
    Ok(())
}

pub(crate) fn validate_professor_fields(p: &Professor) -> Result<(), EngineError> {
    required(&p.last_name, "last name is required")?;
    required(&p.first_name, "first name is required")?;
    email(&p.email)?;
    required(&p.department, "department is required")?;
    required(&p.specialty, "specialty is required")
}

/// Structural and reference checks for a thesis. The student reference is
/// checked by the caller, which owns the student registry.
pub(crate) fn validate_thesis(t: &Thesis, faculty: &impl FacultyLookup) -> Result<(), EngineError> {
    required(&t.title, "title is required")?;
    bounded_text(&t.summary)?;
    bounded_text(&t.keywords)?;
    if !faculty.professor_exists(&t.director_id) {
        return Err(EngineError::Reference {
            kind: "professor",
            id: t.director_id,
        });
    }
    if let Some(co) = t.co_director_id {
        if !faculty.professor_exists(&co) {
            return Err(EngineError::Reference {
                kind: "professor",
                id: co,
            });
        }
        if co == t.director_id {
            return Err(EngineError::Validation(
                "director and co-director must be different",
            ));
        }
    }
    Ok(())
}

pub(crate) fn validate_jury_limits(j: &Jury) -> Result<(), EngineError> {
    if j.member_ids.len() > MAX_JURY_MEMBERS {
        return Err(EngineError::LimitExceeded("too many jury members"));
    }
    Ok(())
}

pub(crate) fn validate_defense_limits(d: &Defense) -> Result<(), EngineError> {
    validate_timestamp(d.start)?;
    if d.duration_minutes > MAX_DURATION_MINUTES {
        return Err(EngineError::LimitExceeded("defense too long"));
    }
    if d.room.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("room name too long"));
    }
    bounded_text(&d.observations)?;
    if let Some(grade) = d.final_grade {
        validate_grade(grade)?;
    }
    Ok(())
}

pub(crate) fn validate_grade(grade: f64) -> Result<(), EngineError> {
    if !(MIN_GRADE..=MAX_GRADE).contains(&grade) {
        return Err(EngineError::Validation("grade must be between 0 and 20"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use ulid::Ulid;

    use super::*;

    struct Faculty(HashSet<Ulid>);

    impl FacultyLookup for Faculty {
        fn professor_exists(&self, id: &Ulid) -> bool {
            self.0.contains(id)
        }
    }

    fn student() -> Student {
        Student {
            id: Ulid::new(),
            last_name: "Diallo".into(),
            first_name: "Awa".into(),
            email: "awa.diallo@univ.example".into(),
            student_number: "E2024-001".into(),
            birth_date: Some(-86_400_000 * 365),
            program: "Informatique".into(),
            level: StudyLevel::Master,
        }
    }

    fn thesis(director: Ulid, co: Option<Ulid>) -> Thesis {
        Thesis {
            id: Ulid::new(),
            title: "Scheduling under constraints".into(),
            summary: String::new(),
            keywords: "scheduling".into(),
            kind: ThesisKind::Master,
            status: ThesisStatus::InProgress,
            student_id: Ulid::new(),
            director_id: director,
            co_director_id: co,
            created_at: 0,
            submitted_at: None,
        }
    }

    #[test]
    fn student_fields() {
        assert!(validate_student_fields(&student()).is_ok());

        let mut s = student();
        s.email = "not-an-email".into();
        assert!(matches!(validate_student_fields(&s), Err(EngineError::Validation("email is malformed"))));

        let mut s = student();
        s.program = " ".into();
        assert!(matches!(validate_student_fields(&s), Err(EngineError::Validation(_))));

        let mut s = student();
        s.last_name = "x".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(validate_student_fields(&s), Err(EngineError::LimitExceeded(_))));
    }

    #[test]
    fn thesis_director_rules() {
        let d = Ulid::new();
        let c = Ulid::new();
        let faculty = Faculty([d, c].into_iter().collect());

        assert!(validate_thesis(&thesis(d, None), &faculty).is_ok());
        assert!(validate_thesis(&thesis(d, Some(c)), &faculty).is_ok());
        assert!(matches!(
            validate_thesis(&thesis(d, Some(d)), &faculty),
            Err(EngineError::Validation("director and co-director must be different"))
        ));
        assert!(matches!(
            validate_thesis(&thesis(Ulid::new(), None), &faculty),
            Err(EngineError::Reference { kind: "professor", .. })
        ));
        assert!(matches!(
            validate_thesis(&thesis(d, Some(Ulid::new())), &faculty),
            Err(EngineError::Reference { kind: "professor", .. })
        ));
    }

    #[test]
    fn grade_bounds() {
        assert!(validate_grade(0.0).is_ok());
        assert!(validate_grade(20.0).is_ok());
        assert!(validate_grade(20.5).is_err());
        assert!(validate_grade(-1.0).is_err());
        assert!(validate_grade(f64::NAN).is_err());
    }

    #[test]
    fn timestamp_range() {
        assert!(validate_timestamp(0).is_ok());
        assert!(validate_timestamp(-1).is_err());
        assert!(validate_timestamp(MAX_VALID_TIMESTAMP_MS).is_err());
    }
}
