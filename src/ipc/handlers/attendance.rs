use crate::guard::{self, Caller, GuardError, Role};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::ledger::{self, DateRange, LedgerError, MarkInput, Status};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::json;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    fn bad_params(message: impl Into<String>) -> HandlerErr {
        HandlerErr {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }
}

impl From<LedgerError> for HandlerErr {
    fn from(e: LedgerError) -> Self {
        let (code, message) = match e {
            LedgerError::InvalidArgument(m) => ("bad_params", m),
            LedgerError::NotFound(m) => ("not_found", m),
            LedgerError::Forbidden(m) => ("forbidden", m),
            LedgerError::Internal(m) => ("db_update_failed", m),
        };
        HandlerErr {
            code,
            message,
            details: None,
        }
    }
}

impl From<GuardError> for HandlerErr {
    fn from(e: GuardError) -> Self {
        match e {
            GuardError::Forbidden(m) => HandlerErr {
                code: "forbidden",
                message: m,
                details: None,
            },
            GuardError::CourseNotFound => HandlerErr {
                code: "not_found",
                message: "course not found".to_string(),
                details: None,
            },
            GuardError::Storage(m) => HandlerErr {
                code: "db_query_failed",
                message: m,
                details: None,
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

fn get_optional_str(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be string or null", key))),
    }
}

/// Every write carries the caller identity resolved upstream; the sidecar
/// trusts it and only applies the data-dependent ownership policy.
fn parse_caller(params: &serde_json::Value) -> Result<Caller, HandlerErr> {
    let caller = params
        .get("caller")
        .ok_or_else(|| HandlerErr::bad_params("missing caller"))?;
    let id = caller
        .get("id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params("missing caller.id"))?;
    let role_raw = caller
        .get("role")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerErr::bad_params("missing caller.role"))?;
    let role = Role::parse(role_raw)
        .ok_or_else(|| HandlerErr::bad_params("caller.role must be student, teacher or admin"))?;
    Ok(Caller { id, role })
}

fn parse_status(params: &serde_json::Value) -> Result<Status, HandlerErr> {
    let raw = get_required_str(params, "status")?;
    Status::parse(&raw)
        .ok_or_else(|| HandlerErr::bad_params("status must be present, absent or late"))
}

fn parse_date_field(params: &serde_json::Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    let raw = get_required_str(params, key)?;
    ledger::normalize_date(&raw).map_err(HandlerErr::from)
}

fn parse_date_range(params: &serde_json::Value) -> Result<DateRange, HandlerErr> {
    let from = match get_optional_str(params, "from")? {
        Some(raw) => Some(ledger::normalize_date(&raw)?),
        None => None,
    };
    let to = match get_optional_str(params, "to")? {
        Some(raw) => Some(ledger::normalize_date(&raw)?),
        None => None,
    };
    Ok(DateRange { from, to })
}

fn record_json(rec: &ledger::AttendanceRecord) -> serde_json::Value {
    json!(rec)
}

fn attendance_mark(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let course_id = get_required_str(params, "courseId")?;
    let status = parse_status(params)?;
    let date = parse_date_field(params, "date")?;
    let remarks = get_optional_str(params, "remarks")?;
    let caller = parse_caller(params)?;

    // Policy check first; a denial must leave the ledger untouched.
    guard::authorize_course_write(conn, &course_id, &caller)?;

    let input = MarkInput {
        student_id,
        course_id,
        date,
        status,
        remarks,
        caller_teacher_id: caller.id,
    };
    let (record, created) = ledger::mark_attendance(conn, &input)?;
    Ok(json!({ "record": record_json(&record), "created": created }))
}

fn attendance_update(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let record_id = get_required_str(params, "recordId")?;
    let status = parse_status(params)?;
    let remarks = get_optional_str(params, "remarks")?;
    let caller = parse_caller(params)?;
    if caller.role != Role::Teacher {
        return Err(HandlerErr {
            code: "forbidden",
            message: "only teachers may edit attendance".to_string(),
            details: None,
        });
    }

    let record = ledger::update_attendance(conn, &record_id, status, remarks, &caller.id)?;
    Ok(json!({ "record": record_json(&record) }))
}

fn attendance_for_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let course_id = get_optional_str(params, "courseId")?;
    let range = parse_date_range(params)?;
    let records = ledger::records_for_student(conn, &student_id, course_id.as_deref(), &range)?;
    let records_json: Vec<serde_json::Value> = records.iter().map(record_json).collect();
    Ok(json!({ "records": records_json }))
}

fn attendance_for_course(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let range = parse_date_range(params)?;
    let records = ledger::records_for_course(conn, &course_id, &range)?;
    let records_json: Vec<serde_json::Value> = records.iter().map(record_json).collect();
    Ok(json!({ "records": records_json }))
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
        "attendance.mark" => Some(with_conn(state, req, attendance_mark)),
        "attendance.update" => Some(with_conn(state, req, attendance_update)),
        "attendance.forStudent" => Some(with_conn(state, req, attendance_for_student)),
        "attendance.forCourse" => Some(with_conn(state, req, attendance_for_course)),
        _ => None,
    }
}
