use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

/// Status domain for one attendance mark. Nothing else is ever persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Present,
    Absent,
    Late,
}

impl Status {
    pub fn parse(raw: &str) -> Option<Status> {
        match raw.trim() {
            "present" => Some(Status::Present),
            "absent" => Some(Status::Absent),
            "late" => Some(Status::Late),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Present => "present",
            Status::Absent => "absent",
            Status::Late => "late",
        }
    }
}

#[derive(Debug)]
pub enum LedgerError {
    InvalidArgument(String),
    NotFound(String),
    Forbidden(String),
    Internal(String),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        LedgerError::Internal(e.to_string())
    }
}

/// Normalize caller-supplied dates to day granularity (UTC) at the ledger
/// boundary. Accepts a plain calendar date, or an RFC 3339 datetime whose
/// time-of-day is discarded after conversion to UTC. Every lookup and every
/// stored key goes through this one rule so two marks on the same day always
/// collide on the unique triple.
pub fn normalize_date(raw: &str) -> Result<NaiveDate, LedgerError> {
    let t = raw.trim();
    if let Ok(d) = NaiveDate::parse_from_str(t, "%Y-%m-%d") {
        return Ok(d);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Ok(dt.with_timezone(&Utc).date_naive());
    }
    Err(LedgerError::InvalidArgument(format!(
        "date must be YYYY-MM-DD or RFC 3339, got {:?}",
        t
    )))
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub id: String,
    pub student_id: String,
    pub course_id: String,
    pub date: String,
    pub status: String,
    pub marked_by: String,
    pub remarks: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct MarkInput {
    pub student_id: String,
    pub course_id: String,
    pub date: NaiveDate,
    pub status: Status,
    pub remarks: Option<String>,
    pub caller_teacher_id: String,
}

fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, LedgerError> {
    let row = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?;
    Ok(row.is_some())
}

fn course_exists(conn: &Connection, course_id: &str) -> Result<bool, LedgerError> {
    let row = conn
        .query_row("SELECT 1 FROM courses WHERE id = ?", [course_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?;
    Ok(row.is_some())
}

fn student_enrolled(conn: &Connection, course_id: &str, student_id: &str) -> Result<bool, LedgerError> {
    let row = conn
        .query_row(
            "SELECT 1 FROM enrollments WHERE course_id = ? AND student_id = ?",
            (course_id, student_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()?;
    Ok(row.is_some())
}

fn record_by_id(conn: &Connection, record_id: &str) -> Result<Option<AttendanceRecord>, LedgerError> {
    conn.query_row(
        "SELECT id, student_id, course_id, date, status, marked_by, remarks, created_at, updated_at
         FROM attendance_records WHERE id = ?",
        [record_id],
        row_to_record,
    )
    .optional()
    .map_err(LedgerError::from)
}

fn row_to_record(r: &rusqlite::Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    Ok(AttendanceRecord {
        id: r.get(0)?,
        student_id: r.get(1)?,
        course_id: r.get(2)?,
        date: r.get(3)?,
        status: r.get(4)?,
        marked_by: r.get(5)?,
        remarks: r.get(6)?,
        created_at: r.get(7)?,
        updated_at: r.get(8)?,
    })
}

/// Insert-or-update the one authoritative row for (student, course, date).
///
/// The write is a single conditional upsert keyed on the unique triple, so a
/// concurrent mark for the same key cannot produce a duplicate; the later
/// completing write wins. RETURNING reports the stored row, and comparing the
/// returned id against the candidate id distinguishes insert from update.
///
/// Authorization is the guard's job and must have passed before this is
/// called; this function only checks referential validity of the inputs.
pub fn mark_attendance(
    conn: &Connection,
    input: &MarkInput,
) -> Result<(AttendanceRecord, bool), LedgerError> {
    if !student_exists(conn, &input.student_id)? {
        return Err(LedgerError::NotFound("student not found".to_string()));
    }
    if !student_enrolled(conn, &input.course_id, &input.student_id)? {
        return Err(LedgerError::NotFound(
            "student not enrolled in course".to_string(),
        ));
    }

    match upsert_once(conn, input) {
        Ok(v) => Ok(v),
        // The upsert should never trip the constraint; if the storage layer
        // still reports one (e.g. a racing external writer), retry once.
        Err(e) if is_constraint_violation(&e) => match upsert_once(conn, input) {
            Ok(v) => Ok(v),
            Err(e2) => Err(LedgerError::Internal(format!(
                "upsert failed after retry: {}",
                e2
            ))),
        },
        Err(e) => Err(LedgerError::from(e)),
    }
}

fn upsert_once(
    conn: &Connection,
    input: &MarkInput,
) -> Result<(AttendanceRecord, bool), rusqlite::Error> {
    let candidate_id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    let record = conn.query_row(
        "INSERT INTO attendance_records(
            id, student_id, course_id, date, status, marked_by, remarks, created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, course_id, date) DO UPDATE SET
           status = excluded.status,
           remarks = excluded.remarks,
           marked_by = excluded.marked_by,
           updated_at = excluded.updated_at
         RETURNING id, student_id, course_id, date, status, marked_by, remarks, created_at, updated_at",
        (
            &candidate_id,
            &input.student_id,
            &input.course_id,
            input.date.format("%Y-%m-%d").to_string(),
            input.status.as_str(),
            &input.caller_teacher_id,
            &input.remarks,
            &now,
            &now,
        ),
        row_to_record,
    )?;
    let created = record.id == candidate_id;
    Ok((record, created))
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::ConstraintViolation,
                ..
            },
            _,
        )
    )
}

/// Direct correction of an already-marked record by id. Only the teacher who
/// marked it may edit it; `marked_by` is left untouched.
pub fn update_attendance(
    conn: &Connection,
    record_id: &str,
    new_status: Status,
    new_remarks: Option<String>,
    caller_teacher_id: &str,
) -> Result<AttendanceRecord, LedgerError> {
    let Some(existing) = record_by_id(conn, record_id)? else {
        return Err(LedgerError::NotFound("record not found".to_string()));
    };
    if existing.marked_by != caller_teacher_id {
        return Err(LedgerError::Forbidden(
            "only the marking teacher may edit this record".to_string(),
        ));
    }

    let now = now_rfc3339();
    conn.execute(
        "UPDATE attendance_records SET status = ?, remarks = ?, updated_at = ? WHERE id = ?",
        (new_status.as_str(), &new_remarks, &now, record_id),
    )?;
    match record_by_id(conn, record_id)? {
        Some(rec) => Ok(rec),
        None => Err(LedgerError::Internal(
            "record vanished during update".to_string(),
        )),
    }
}

pub struct DateRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

fn range_clause(range: &DateRange, sql: &mut String, params: &mut Vec<String>) {
    if let Some(from) = range.from {
        sql.push_str(" AND date >= ?");
        params.push(from.format("%Y-%m-%d").to_string());
    }
    if let Some(to) = range.to {
        sql.push_str(" AND date <= ?");
        params.push(to.format("%Y-%m-%d").to_string());
    }
}

/// Student view: newest day first, course id breaking ties for a stable order.
pub fn records_for_student(
    conn: &Connection,
    student_id: &str,
    course_id: Option<&str>,
    range: &DateRange,
) -> Result<Vec<AttendanceRecord>, LedgerError> {
    if !student_exists(conn, student_id)? {
        return Err(LedgerError::NotFound("student not found".to_string()));
    }
    if let Some(cid) = course_id {
        if !course_exists(conn, cid)? {
            return Err(LedgerError::NotFound("course not found".to_string()));
        }
    }

    let mut sql = String::from(
        "SELECT id, student_id, course_id, date, status, marked_by, remarks, created_at, updated_at
         FROM attendance_records WHERE student_id = ?",
    );
    let mut params: Vec<String> = vec![student_id.to_string()];
    if let Some(cid) = course_id {
        sql.push_str(" AND course_id = ?");
        params.push(cid.to_string());
    }
    range_clause(range, &mut sql, &mut params);
    sql.push_str(" ORDER BY date DESC, course_id");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), row_to_record)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Course view: ascending by date, then student id (stable order).
pub fn records_for_course(
    conn: &Connection,
    course_id: &str,
    range: &DateRange,
) -> Result<Vec<AttendanceRecord>, LedgerError> {
    if !course_exists(conn, course_id)? {
        return Err(LedgerError::NotFound("course not found".to_string()));
    }

    let mut sql = String::from(
        "SELECT id, student_id, course_id, date, status, marked_by, remarks, created_at, updated_at
         FROM attendance_records WHERE course_id = ?",
    );
    let mut params: Vec<String> = vec![course_id.to_string()];
    range_clause(range, &mut sql, &mut params);
    sql.push_str(" ORDER BY date, student_id");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), row_to_record)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
