use rusqlite::{Connection, OptionalExtension};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Student,
    Teacher,
    Admin,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Role> {
        match raw.trim() {
            "student" => Some(Role::Student),
            "teacher" => Some(Role::Teacher),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Caller {
    pub id: String,
    pub role: Role,
}

#[derive(Debug)]
pub enum GuardError {
    Forbidden(String),
    CourseNotFound,
    Storage(String),
}

impl From<rusqlite::Error> for GuardError {
    fn from(e: rusqlite::Error) -> Self {
        GuardError::Storage(e.to_string())
    }
}

pub fn owner_of(conn: &Connection, course_id: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT owner_teacher_id FROM courses WHERE id = ?",
        [course_id],
        |r| r.get(0),
    )
    .optional()
}

/// Decide whether `caller` may write attendance for `course_id`.
///
/// Stateless by contract: ownership is re-read from the store on every call,
/// never cached, since course ownership can change between requests. A denial
/// means the ledger was never touched.
pub fn authorize_course_write(
    conn: &Connection,
    course_id: &str,
    caller: &Caller,
) -> Result<(), GuardError> {
    if caller.role != Role::Teacher {
        return Err(GuardError::Forbidden(
            "only teachers may write attendance".to_string(),
        ));
    }
    let Some(owner) = owner_of(conn, course_id)? else {
        return Err(GuardError::CourseNotFound);
    };
    if owner != caller.id {
        return Err(GuardError::Forbidden(
            "caller does not own this course".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn seeded_conn() -> Connection {
        let dir = std::env::temp_dir().join(format!(
            "attendanced-guard-{}",
            uuid::Uuid::new_v4()
        ));
        let conn = db::open_db(&dir).expect("open db");
        conn.execute(
            "INSERT INTO teachers(id, name) VALUES('t1', 'Moreau'), ('t2', 'Okafor')",
            [],
        )
        .expect("seed teachers");
        conn.execute(
            "INSERT INTO courses(id, name, code, owner_teacher_id)
             VALUES('c1', 'Algebra', 'MATH-101', 't1')",
            [],
        )
        .expect("seed course");
        conn
    }

    fn teacher(id: &str) -> Caller {
        Caller {
            id: id.to_string(),
            role: Role::Teacher,
        }
    }

    #[test]
    fn owner_passes_non_owner_denied() {
        let conn = seeded_conn();
        assert!(authorize_course_write(&conn, "c1", &teacher("t1")).is_ok());
        assert!(matches!(
            authorize_course_write(&conn, "c1", &teacher("t2")),
            Err(GuardError::Forbidden(_))
        ));
    }

    #[test]
    fn non_teacher_roles_denied_even_for_owner_id() {
        let conn = seeded_conn();
        for role in [Role::Student, Role::Admin] {
            let caller = Caller {
                id: "t1".to_string(),
                role,
            };
            assert!(matches!(
                authorize_course_write(&conn, "c1", &caller),
                Err(GuardError::Forbidden(_))
            ));
        }
    }

    #[test]
    fn unknown_course_is_not_found() {
        let conn = seeded_conn();
        assert!(matches!(
            authorize_course_write(&conn, "nope", &teacher("t1")),
            Err(GuardError::CourseNotFound)
        ));
    }

    #[test]
    fn ownership_change_takes_effect_immediately() {
        let conn = seeded_conn();
        conn.execute(
            "UPDATE courses SET owner_teacher_id = 't2' WHERE id = 'c1'",
            [],
        )
        .expect("reassign owner");
        assert!(authorize_course_write(&conn, "c1", &teacher("t2")).is_ok());
        assert!(matches!(
            authorize_course_write(&conn, "c1", &teacher("t1")),
            Err(GuardError::Forbidden(_))
        ));
    }
}
