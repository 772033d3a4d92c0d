use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;

// Local read-mirror of the external Course Directory and identity directory.
// These methods are the sync boundary; the core only ever reads these tables.

fn required_str(params: &serde_json::Value, key: &str) -> Result<String, String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("missing {}", key))
}

fn handle_upsert_teacher(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let teacher_id = match required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let name = match required_str(&req.params, "name") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    if let Err(e) = conn.execute(
        "INSERT INTO teachers(id, name) VALUES(?, ?)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        (&teacher_id, &name),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "teacherId": teacher_id, "name": name }))
}

fn handle_upsert_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = match required_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let name = match required_str(&req.params, "name") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, name) VALUES(?, ?)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        (&student_id, &name),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "studentId": student_id, "name": name }))
}

fn handle_upsert_course(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let course_id = match required_str(&req.params, "courseId") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let name = match required_str(&req.params, "name") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let code = match required_str(&req.params, "code") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let owner_teacher_id = match required_str(&req.params, "ownerTeacherId") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };

    let owner_exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM teachers WHERE id = ?",
            [&owner_teacher_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if owner_exists.is_none() {
        return err(&req.id, "not_found", "owner teacher not found", None);
    }

    if let Err(e) = conn.execute(
        "INSERT INTO courses(id, name, code, owner_teacher_id) VALUES(?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           name = excluded.name,
           code = excluded.code,
           owner_teacher_id = excluded.owner_teacher_id",
        (&course_id, &name, &code, &owner_teacher_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({
            "courseId": course_id,
            "name": name,
            "code": code,
            "ownerTeacherId": owner_teacher_id
        }),
    )
}

fn handle_enroll(state: &mut AppState, req: &Request, enroll: bool) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let course_id = match required_str(&req.params, "courseId") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };
    let student_id = match required_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(m) => return err(&req.id, "bad_params", m, None),
    };

    for (table, id, msg) in [
        ("courses", &course_id, "course not found"),
        ("students", &student_id, "student not found"),
    ] {
        let exists: Option<i64> = match conn
            .query_row(&format!("SELECT 1 FROM {} WHERE id = ?", table), [id], |r| {
                r.get(0)
            })
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if exists.is_none() {
            return err(&req.id, "not_found", msg, None);
        }
    }

    // Idempotent both ways.
    let result = if enroll {
        conn.execute(
            "INSERT INTO enrollments(course_id, student_id) VALUES(?, ?)
             ON CONFLICT(course_id, student_id) DO NOTHING",
            (&course_id, &student_id),
        )
    } else {
        conn.execute(
            "DELETE FROM enrollments WHERE course_id = ? AND student_id = ?",
            (&course_id, &student_id),
        )
    };
    if let Err(e) = result {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({ "courseId": course_id, "studentId": student_id, "enrolled": enroll }),
    )
}

fn handle_courses_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let owner_filter = req
        .params
        .get("teacherId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    // Correlated subquery keeps counts join-free.
    let mut sql = String::from(
        "SELECT
           c.id,
           c.name,
           c.code,
           c.owner_teacher_id,
           (SELECT COUNT(*) FROM enrollments e WHERE e.course_id = c.id) AS enrolled_count
         FROM courses c",
    );
    let mut params: Vec<String> = Vec::new();
    if let Some(owner) = &owner_filter {
        sql.push_str(" WHERE c.owner_teacher_id = ?");
        params.push(owner.clone());
    }
    sql.push_str(" ORDER BY c.code, c.name");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), |row| {
            Ok(json!({
                "courseId": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "code": row.get::<_, String>(2)?,
                "ownerTeacherId": row.get::<_, String>(3)?,
                "enrolledCount": row.get::<_, i64>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(courses) => ok(&req.id, json!({ "courses": courses })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "directory.upsertTeacher" => Some(handle_upsert_teacher(state, req)),
        "directory.upsertStudent" => Some(handle_upsert_student(state, req)),
        "directory.upsertCourse" => Some(handle_upsert_course(state, req)),
        "directory.enroll" => Some(handle_enroll(state, req, true)),
        "directory.unenroll" => Some(handle_enroll(state, req, false)),
        "directory.courses" => Some(handle_courses_list(state, req)),
        _ => None,
    }
}
