//! Conversion between SQL column values and registry records, plus the row
//! filtering and ordering behind `SELECT`.

use std::cmp::Ordering;

use ulid::Ulid;

use crate::model::*;
use crate::sql::{literal_i64, literal_ulid, Fields, Filter, FilterOp, Literal, SelectQuery, SqlError, Table};

pub trait Record: Sized {
    const TABLE: Table;
    /// Columns an INSERT must provide (besides `id`).
    const REQUIRED: &'static [&'static str];

    /// A record holding only defaults, stamped with `now` where it has a
    /// creation time.
    fn blank(id: Ulid, now: Ms) -> Self;

    fn set(&mut self, column: &str, value: &Literal) -> Result<(), SqlError>;

    /// Cells in `TABLE.columns()` order.
    fn row(&self) -> Vec<Literal>;
}

/// Build a record from an INSERT's fields.
pub fn from_fields<R: Record>(fields: &Fields, now: Ms) -> Result<R, SqlError> {
    let table = R::TABLE.name();
    let id = fields
        .iter()
        .find(|(c, _)| c == "id")
        .ok_or(SqlError::MissingColumn(table, "id"))?;
    let id = literal_ulid(&id.1)?;
    for required in R::REQUIRED {
        if !fields.iter().any(|(c, v)| c == required && *v != Literal::Null) {
            return Err(SqlError::MissingColumn(table, required));
        }
    }
    let mut record = R::blank(id, now);
    merge(&mut record, fields)?;
    Ok(record)
}

/// Overwrite the given columns of `record`. `id` is never changed.
pub fn merge<R: Record>(record: &mut R, fields: &Fields) -> Result<(), SqlError> {
    for (column, value) in fields {
        if column != "id" {
            record.set(column, value)?;
        }
    }
    Ok(())
}

fn unknown<R: Record>(column: &str) -> SqlError {
    SqlError::UnknownColumn(R::TABLE.name(), column.to_string())
}

// ── Value coercion ───────────────────────────────────────────────

fn text(column: &'static str, value: &Literal) -> Result<String, SqlError> {
    match value {
        Literal::Text(s) => Ok(s.clone()),
        Literal::Null => Err(SqlError::BadValue(column, "must not be NULL".into())),
        other => Err(SqlError::BadValue(column, format!("expected text, got {other:?}"))),
    }
}

/// Text where NULL means empty.
fn text_or_empty(column: &'static str, value: &Literal) -> Result<String, SqlError> {
    match value {
        Literal::Null => Ok(String::new()),
        _ => text(column, value),
    }
}

fn ulid(column: &'static str, value: &Literal) -> Result<Ulid, SqlError> {
    literal_ulid(value).map_err(|e| SqlError::BadValue(column, e.to_string()))
}

fn opt_ulid(column: &'static str, value: &Literal) -> Result<Option<Ulid>, SqlError> {
    match value {
        Literal::Null => Ok(None),
        _ => ulid(column, value).map(Some),
    }
}

fn ms(column: &'static str, value: &Literal) -> Result<Ms, SqlError> {
    literal_i64(value).map_err(|e| SqlError::BadValue(column, e.to_string()))
}

fn opt_ms(column: &'static str, value: &Literal) -> Result<Option<Ms>, SqlError> {
    match value {
        Literal::Null => Ok(None),
        _ => ms(column, value).map(Some),
    }
}

fn minutes(column: &'static str, value: &Literal) -> Result<u32, SqlError> {
    let n = ms(column, value)?;
    u32::try_from(n).map_err(|_| SqlError::BadValue(column, format!("{n} out of range")))
}

fn opt_f64(column: &'static str, value: &Literal) -> Result<Option<f64>, SqlError> {
    match value {
        Literal::Null => Ok(None),
        Literal::Int(n) => Ok(Some(*n as f64)),
        Literal::Float(x) => Ok(Some(*x)),
        Literal::Text(s) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| SqlError::BadValue(column, format!("not a number: {s}"))),
        other => Err(SqlError::BadValue(column, format!("expected number, got {other:?}"))),
    }
}

fn label<E>(column: &'static str, value: &Literal, parse: fn(&str) -> Option<E>) -> Result<E, SqlError> {
    let s = text(column, value)?;
    parse(&s).ok_or_else(|| SqlError::BadValue(column, format!("unknown value {s:?}")))
}

fn opt_label<E>(column: &'static str, value: &Literal, parse: fn(&str) -> Option<E>) -> Result<Option<E>, SqlError> {
    match value {
        Literal::Null => Ok(None),
        _ => label(column, value, parse).map(Some),
    }
}

/// Comma-separated ULIDs.
fn ulid_list(column: &'static str, value: &Literal) -> Result<Vec<Ulid>, SqlError> {
    text_or_empty(column, value)?
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| ulid(column, &Literal::Text(s.to_string())))
        .collect()
}

fn id_cell(id: &Ulid) -> Literal {
    Literal::Text(id.to_string())
}

fn opt_id_cell(id: &Option<Ulid>) -> Literal {
    id.as_ref().map_or(Literal::Null, id_cell)
}

fn opt_int_cell(v: Option<Ms>) -> Literal {
    v.map_or(Literal::Null, Literal::Int)
}

fn label_cell(s: &str) -> Literal {
    Literal::Text(s.to_string())
}

// ── Records ──────────────────────────────────────────────────────

impl Record for Student {
    const TABLE: Table = Table::Students;
    const REQUIRED: &'static [&'static str] =
        &["last_name", "first_name", "email", "student_number", "program", "level"];

    fn blank(id: Ulid, _now: Ms) -> Self {
        Student {
            id,
            last_name: String::new(),
            first_name: String::new(),
            email: String::new(),
            student_number: String::new(),
            birth_date: None,
            program: String::new(),
            level: StudyLevel::Bachelor,
        }
    }

    fn set(&mut self, column: &str, value: &Literal) -> Result<(), SqlError> {
        match column {
            "last_name" => self.last_name = text("last_name", value)?,
            "first_name" => self.first_name = text("first_name", value)?,
            "email" => self.email = text("email", value)?,
            "student_number" => self.student_number = text("student_number", value)?,
            "birth_date" => self.birth_date = opt_ms("birth_date", value)?,
            "program" => self.program = text("program", value)?,
            "level" => self.level = label("level", value, StudyLevel::parse)?,
            other => return Err(unknown::<Self>(other)),
        }
        Ok(())
    }

    fn row(&self) -> Vec<Literal> {
        vec![
            id_cell(&self.id),
            Literal::Text(self.last_name.clone()),
            Literal::Text(self.first_name.clone()),
            Literal::Text(self.email.clone()),
            Literal::Text(self.student_number.clone()),
            opt_int_cell(self.birth_date),
            Literal::Text(self.program.clone()),
            label_cell(self.level.as_str()),
        ]
    }
}

impl Record for Professor {
    const TABLE: Table = Table::Professors;
    const REQUIRED: &'static [&'static str] = &["last_name", "first_name", "email", "department", "specialty"];

    fn blank(id: Ulid, _now: Ms) -> Self {
        Professor {
            id,
            last_name: String::new(),
            first_name: String::new(),
            email: String::new(),
            department: String::new(),
            specialty: String::new(),
            rank: AcademicRank::Assistant,
        }
    }

    fn set(&mut self, column: &str, value: &Literal) -> Result<(), SqlError> {
        match column {
            "last_name" => self.last_name = text("last_name", value)?,
            "first_name" => self.first_name = text("first_name", value)?,
            "email" => self.email = text("email", value)?,
            "department" => self.department = text("department", value)?,
            "specialty" => self.specialty = text("specialty", value)?,
            "rank" => self.rank = label("rank", value, AcademicRank::parse)?,
            other => return Err(unknown::<Self>(other)),
        }
        Ok(())
    }

    fn row(&self) -> Vec<Literal> {
        vec![
            id_cell(&self.id),
            Literal::Text(self.last_name.clone()),
            Literal::Text(self.first_name.clone()),
            Literal::Text(self.email.clone()),
            Literal::Text(self.department.clone()),
            Literal::Text(self.specialty.clone()),
            label_cell(self.rank.as_str()),
        ]
    }
}

impl Record for Thesis {
    const TABLE: Table = Table::Theses;
    const REQUIRED: &'static [&'static str] = &["title", "kind", "student_id", "director_id"];

    fn blank(id: Ulid, now: Ms) -> Self {
        Thesis {
            id,
            title: String::new(),
            summary: String::new(),
            keywords: String::new(),
            kind: ThesisKind::Master,
            status: ThesisStatus::InProgress,
            student_id: Ulid::nil(),
            director_id: Ulid::nil(),
            co_director_id: None,
            created_at: now,
            submitted_at: None,
        }
    }

    fn set(&mut self, column: &str, value: &Literal) -> Result<(), SqlError> {
        match column {
            "title" => self.title = text("title", value)?,
            "summary" => self.summary = text_or_empty("summary", value)?,
            "keywords" => self.keywords = text_or_empty("keywords", value)?,
            "kind" => self.kind = label("kind", value, ThesisKind::parse)?,
            "status" => self.status = label("status", value, ThesisStatus::parse)?,
            "student_id" => self.student_id = ulid("student_id", value)?,
            "director_id" => self.director_id = ulid("director_id", value)?,
            "co_director_id" => self.co_director_id = opt_ulid("co_director_id", value)?,
            "created_at" => self.created_at = ms("created_at", value)?,
            "submitted_at" => self.submitted_at = opt_ms("submitted_at", value)?,
            other => return Err(unknown::<Self>(other)),
        }
        Ok(())
    }

    fn row(&self) -> Vec<Literal> {
        vec![
            id_cell(&self.id),
            Literal::Text(self.title.clone()),
            Literal::Text(self.summary.clone()),
            Literal::Text(self.keywords.clone()),
            label_cell(self.kind.as_str()),
            label_cell(self.status.as_str()),
            id_cell(&self.student_id),
            id_cell(&self.director_id),
            opt_id_cell(&self.co_director_id),
            Literal::Int(self.created_at),
            opt_int_cell(self.submitted_at),
        ]
    }
}

impl Record for Jury {
    const TABLE: Table = Table::Juries;
    const REQUIRED: &'static [&'static str] = &["president_id", "member_ids"];

    fn blank(id: Ulid, now: Ms) -> Self {
        Jury {
            id,
            president_id: Ulid::nil(),
            member_ids: Vec::new(),
            created_at: now,
        }
    }

    fn set(&mut self, column: &str, value: &Literal) -> Result<(), SqlError> {
        match column {
            "president_id" => self.president_id = ulid("president_id", value)?,
            "member_ids" => self.member_ids = ulid_list("member_ids", value)?,
            "created_at" => self.created_at = ms("created_at", value)?,
            other => return Err(unknown::<Self>(other)),
        }
        Ok(())
    }

    fn row(&self) -> Vec<Literal> {
        let members: Vec<String> = self.member_ids.iter().map(Ulid::to_string).collect();
        vec![
            id_cell(&self.id),
            id_cell(&self.president_id),
            Literal::Text(members.join(",")),
            Literal::Int(self.created_at),
        ]
    }
}

impl Record for Defense {
    const TABLE: Table = Table::Defenses;
    const REQUIRED: &'static [&'static str] = &["thesis_id", "jury_id", "room", "start"];

    fn blank(id: Ulid, _now: Ms) -> Self {
        Defense {
            id,
            thesis_id: Ulid::nil(),
            jury_id: Ulid::nil(),
            room: String::new(),
            start: 0,
            duration_minutes: DEFAULT_DEFENSE_MINUTES,
            status: DefenseStatus::Scheduled,
            final_grade: None,
            honor: None,
            observations: String::new(),
        }
    }

    fn set(&mut self, column: &str, value: &Literal) -> Result<(), SqlError> {
        match column {
            "thesis_id" => self.thesis_id = ulid("thesis_id", value)?,
            "jury_id" => self.jury_id = ulid("jury_id", value)?,
            "room" => self.room = text("room", value)?,
            "start" => self.start = ms("start", value)?,
            "duration_minutes" => self.duration_minutes = minutes("duration_minutes", value)?,
            "status" => self.status = label("status", value, DefenseStatus::parse)?,
            "final_grade" => self.final_grade = opt_f64("final_grade", value)?,
            "honor" => self.honor = opt_label("honor", value, Honor::parse)?,
            "observations" => self.observations = text_or_empty("observations", value)?,
            other => return Err(unknown::<Self>(other)),
        }
        Ok(())
    }

    fn row(&self) -> Vec<Literal> {
        vec![
            id_cell(&self.id),
            id_cell(&self.thesis_id),
            id_cell(&self.jury_id),
            Literal::Text(self.room.clone()),
            Literal::Int(self.start),
            Literal::Int(self.duration_minutes as i64),
            label_cell(self.status.as_str()),
            self.final_grade.map_or(Literal::Null, Literal::Float),
            self.honor.map_or(Literal::Null, |h| label_cell(h.as_str())),
            Literal::Text(self.observations.clone()),
        ]
    }
}

// ── SELECT evaluation ────────────────────────────────────────────

/// Apply WHERE, ORDER BY and LIMIT to `rows` (cells in `table.columns()` order).
pub fn select_rows(table: Table, mut rows: Vec<Vec<Literal>>, query: &SelectQuery) -> Vec<Vec<Literal>> {
    let filters: Vec<(usize, &Filter)> = query
        .filters
        .iter()
        .filter_map(|f| table.column_index(&f.column).map(|i| (i, f)))
        .collect();
    rows.retain(|row| filters.iter().all(|(i, f)| matches(&row[*i], f)));

    if let Some((column, descending)) = &query.order_by
        && let Some(i) = table.column_index(column)
    {
        rows.sort_by(|a, b| {
            let ord = sort_order(&a[i], &b[i]);
            if *descending { ord.reverse() } else { ord }
        });
    }
    if let Some(limit) = query.limit {
        rows.truncate(limit);
    }
    rows
}

fn matches(cell: &Literal, filter: &Filter) -> bool {
    match filter.op {
        FilterOp::Eq => compare(cell, &filter.value) == Some(Ordering::Equal),
        FilterOp::GtEq => matches!(compare(cell, &filter.value), Some(Ordering::Greater | Ordering::Equal)),
        FilterOp::Lt => compare(cell, &filter.value) == Some(Ordering::Less),
        FilterOp::ILike => match (cell_text(cell), &filter.value) {
            (Some(text), Literal::Text(pattern)) => like(&text.to_lowercase(), &pattern.to_lowercase()),
            _ => false,
        },
    }
}

/// SQL comparison: NULL compares to nothing; numbers compare across int/float;
/// text compared with a number is read as a number.
fn compare(a: &Literal, b: &Literal) -> Option<Ordering> {
    match (a, b) {
        (Literal::Null, _) | (_, Literal::Null) => None,
        (Literal::Int(x), Literal::Int(y)) => Some(x.cmp(y)),
        (Literal::Text(x), Literal::Text(y)) => Some(x.cmp(y)),
        (Literal::Bool(x), Literal::Bool(y)) => Some(x.cmp(y)),
        _ => as_f64(a)?.partial_cmp(&as_f64(b)?),
    }
}

fn as_f64(v: &Literal) -> Option<f64> {
    match v {
        Literal::Int(n) => Some(*n as f64),
        Literal::Float(x) => Some(*x),
        Literal::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Ordering for ORDER BY: NULLs sort last.
fn sort_order(a: &Literal, b: &Literal) -> Ordering {
    match (a, b) {
        (Literal::Null, Literal::Null) => Ordering::Equal,
        (Literal::Null, _) => Ordering::Greater,
        (_, Literal::Null) => Ordering::Less,
        _ => compare(a, b).unwrap_or(Ordering::Equal),
    }
}

fn cell_text(cell: &Literal) -> Option<String> {
    match cell {
        Literal::Null => None,
        Literal::Bool(b) => Some(b.to_string()),
        Literal::Int(n) => Some(n.to_string()),
        Literal::Float(x) => Some(x.to_string()),
        Literal::Text(s) => Some(s.clone()),
    }
}

/// LIKE matching with `%` (any run) and `_` (one char).
fn like(text: &str, pattern: &str) -> bool {
    let t: Vec<char> = text.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    // reachable[j]: pattern prefix p[..j] matches the text consumed so far
    let mut reachable = vec![false; p.len() + 1];
    reachable[0] = true;
    for j in 1..=p.len() {
        reachable[j] = reachable[j - 1] && p[j - 1] == '%';
    }
    for c in &t {
        let mut next = vec![false; p.len() + 1];
        for j in 1..=p.len() {
            next[j] = match p[j - 1] {
                '%' => next[j - 1] || reachable[j],
                '_' => reachable[j - 1],
                pc => reachable[j - 1] && pc == *c,
            };
        }
        reachable = next;
    }
    reachable[p.len()]
}
