use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::ledger::{self, Status};
use crate::stats;
use chrono::{Days, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

struct HandlerErr {
    code: &'static str,
    message: String,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, None)
    }

    fn bad_params(message: impl Into<String>) -> HandlerErr {
        HandlerErr {
            code: "bad_params",
            message: message.into(),
        }
    }

    fn db(e: rusqlite::Error) -> HandlerErr {
        HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
        }
    }
}

impl From<ledger::LedgerError> for HandlerErr {
    fn from(e: ledger::LedgerError) -> Self {
        match e {
            ledger::LedgerError::InvalidArgument(m) => HandlerErr::bad_params(m),
            ledger::LedgerError::NotFound(m) => HandlerErr {
                code: "not_found",
                message: m,
            },
            ledger::LedgerError::Forbidden(m) => HandlerErr {
                code: "forbidden",
                message: m,
            },
            ledger::LedgerError::Internal(m) => HandlerErr {
                code: "db_query_failed",
                message: m,
            },
        }
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

fn require_teacher(conn: &Connection, teacher_id: &str) -> Result<(), HandlerErr> {
    let exists = conn
        .query_row("SELECT 1 FROM teachers WHERE id = ?", [teacher_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()
        .map_err(HandlerErr::db)?
        .is_some();
    if exists {
        Ok(())
    } else {
        Err(HandlerErr {
            code: "not_found",
            message: "teacher not found".to_string(),
        })
    }
}

fn parse_status_row(raw: &str) -> Result<Status, HandlerErr> {
    // I3 keeps the stored domain closed; anything else is corruption.
    Status::parse(raw).ok_or_else(|| HandlerErr {
        code: "internal",
        message: format!("unexpected status in ledger: {:?}", raw),
    })
}

fn fmt_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

fn stats_daily_snapshot(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let date_raw = get_required_str(params, "date")?;
    let date = ledger::normalize_date(&date_raw)?;
    require_teacher(conn, &teacher_id)?;

    // One transaction so the mark rows and the enrollment count come from a
    // single consistent snapshot.
    let tx = conn.unchecked_transaction().map_err(HandlerErr::db)?;

    let enrolled_total: i64 = tx
        .query_row(
            "SELECT COUNT(DISTINCT e.student_id)
             FROM enrollments e
             JOIN courses c ON c.id = e.course_id
             WHERE c.owner_teacher_id = ?",
            [&teacher_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::db)?;

    let mut stmt = tx
        .prepare(
            "SELECT ar.status
             FROM attendance_records ar
             JOIN courses c ON c.id = ar.course_id
             WHERE c.owner_teacher_id = ? AND ar.date = ?",
        )
        .map_err(HandlerErr::db)?;
    let raw_marks = stmt
        .query_map((&teacher_id, fmt_date(date)), |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    drop(stmt);
    tx.commit().map_err(HandlerErr::db)?;

    let marks = raw_marks
        .iter()
        .map(|s| parse_status_row(s))
        .collect::<Result<Vec<_>, _>>()?;

    let snap = stats::daily_snapshot(&marks, enrolled_total);
    Ok(json!({
        "date": fmt_date(date),
        "present": snap.present,
        "absent": snap.absent,
        "total": snap.total,
        "percentage": snap.percentage
    }))
}

fn stats_trend(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let window_days = params
        .get("windowDays")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| HandlerErr::bad_params("missing windowDays"))?;
    if !(1..=366).contains(&window_days) {
        return Err(HandlerErr::bad_params(
            "windowDays must be between 1 and 366",
        ));
    }
    let end = match params.get("endDate").and_then(|v| v.as_str()) {
        Some(raw) => ledger::normalize_date(raw)?,
        None => Utc::now().date_naive(),
    };
    let start = end
        .checked_sub_days(Days::new(window_days))
        .ok_or_else(|| HandlerErr::bad_params("window extends before the calendar"))?;
    require_teacher(conn, &teacher_id)?;

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db)?;
    let mut stmt = tx
        .prepare(
            "SELECT ar.date, ar.status
             FROM attendance_records ar
             JOIN courses c ON c.id = ar.course_id
             WHERE c.owner_teacher_id = ? AND ar.date >= ? AND ar.date <= ?",
        )
        .map_err(HandlerErr::db)?;
    let raw_rows = stmt
        .query_map((&teacher_id, fmt_date(start), fmt_date(end)), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    drop(stmt);
    tx.commit().map_err(HandlerErr::db)?;

    let mut rows: Vec<(NaiveDate, Status)> = Vec::with_capacity(raw_rows.len());
    for (date_raw, status_raw) in &raw_rows {
        let date = NaiveDate::parse_from_str(date_raw, "%Y-%m-%d").map_err(|_| HandlerErr {
            code: "internal",
            message: format!("unexpected date in ledger: {:?}", date_raw),
        })?;
        rows.push((date, parse_status_row(status_raw)?));
    }

    let series: Vec<serde_json::Value> = stats::pivot_trend(&rows, start, end)
        .into_iter()
        .map(|p| {
            json!({
                "date": fmt_date(p.date),
                "present": p.present,
                "absent": p.absent
            })
        })
        .collect();
    Ok(json!({ "series": series }))
}

fn stats_course_breakdown(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let from = match params.get("from").and_then(|v| v.as_str()) {
        Some(raw) => Some(ledger::normalize_date(raw)?),
        None => None,
    };
    let to = match params.get("to").and_then(|v| v.as_str()) {
        Some(raw) => Some(ledger::normalize_date(raw)?),
        None => None,
    };
    require_teacher(conn, &teacher_id)?;

    let tx = conn.unchecked_transaction().map_err(HandlerErr::db)?;

    struct CourseRow {
        id: String,
        name: String,
        code: String,
        enrolled: i64,
    }
    let mut stmt = tx
        .prepare(
            "SELECT
               c.id,
               c.name,
               c.code,
               (SELECT COUNT(*) FROM enrollments e WHERE e.course_id = c.id) AS enrolled_count
             FROM courses c
             WHERE c.owner_teacher_id = ?
             ORDER BY c.code, c.name",
        )
        .map_err(HandlerErr::db)?;
    let courses = stmt
        .query_map([&teacher_id], |r| {
            Ok(CourseRow {
                id: r.get(0)?,
                name: r.get(1)?,
                code: r.get(2)?,
                enrolled: r.get(3)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    drop(stmt);

    let mut sql = String::from("SELECT status FROM attendance_records WHERE course_id = ?");
    let mut range_params: Vec<String> = Vec::new();
    if let Some(from) = from {
        sql.push_str(" AND date >= ?");
        range_params.push(fmt_date(from));
    }
    if let Some(to) = to {
        sql.push_str(" AND date <= ?");
        range_params.push(fmt_date(to));
    }

    let mut out = Vec::with_capacity(courses.len());
    let mut marks_stmt = tx.prepare(&sql).map_err(HandlerErr::db)?;
    for course in courses {
        let mut bind: Vec<String> = Vec::with_capacity(1 + range_params.len());
        bind.push(course.id.clone());
        bind.extend(range_params.iter().cloned());
        let raw_marks = marks_stmt
            .query_map(rusqlite::params_from_iter(bind.iter()), |r| {
                r.get::<_, String>(0)
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db)?;
        let marks = raw_marks
            .iter()
            .map(|s| parse_status_row(s))
            .collect::<Result<Vec<_>, _>>()?;
        let row = stats::course_breakdown_row(course.id, course.name, course.code, course.enrolled, &marks);
        out.push(json!({
            "courseId": row.course_id,
            "name": row.name,
            "code": row.code,
            "totalStudents": row.total_students,
            "presentCount": row.present_count,
            "absentCount": row.absent_count,
            "percentage": row.percentage
        }));
    }
    drop(marks_stmt);
    tx.commit().map_err(HandlerErr::db)?;

    Ok(json!({ "courses": out }))
}

fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "stats.dailySnapshot" => Some(with_conn(state, req, stats_daily_snapshot)),
        "stats.trend" => Some(with_conn(state, req, stats_trend)),
        "stats.courseBreakdown" => Some(with_conn(state, req, stats_course_breakdown)),
        _ => None,
    }
}
