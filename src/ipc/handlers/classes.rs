use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    check, check_iso_date, db_query_err, get_i64, get_opt_str, get_str, identity, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::scope::{self, Action, ListKind, Resource, ResourceKind, Role, ScopeFilter};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn require_admin_or_coordinator(ident: &crate::scope::Identity) -> Result<(), HandlerErr> {
    match ident.role {
        Role::Admin | Role::Coordinator => Ok(()),
        _ => Err(HandlerErr::with_details(
            "forbidden",
            "access denied",
            json!({ "reason": "ROLE_NOT_PERMITTED" }),
        )),
    }
}

fn disciplines_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;
    require_admin_or_coordinator(&ident)?;

    let name = get_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr::new("bad_params", "name must not be empty"));
    }

    let exists: Option<String> = conn
        .query_row("SELECT id FROM disciplines WHERE name = ?", [&name], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_query_err)?;
    if exists.is_some() {
        return Err(HandlerErr::new("conflict", "discipline already exists"));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO disciplines(id, name) VALUES(?, ?)",
        (&id, &name),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;

    Ok(json!({ "disciplineId": id, "name": name }))
}

fn disciplines_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let _ident = identity(conn, params)?;
    let mut stmt = conn
        .prepare("SELECT id, name FROM disciplines ORDER BY name")
        .map_err(db_query_err)?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;
    Ok(json!({ "disciplines": rows }))
}

fn terms_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;
    require_admin_or_coordinator(&ident)?;

    let academic_year = get_i64(params, "academicYear")?;
    let label = get_str(params, "label")?.trim().to_string();
    let starts_on = get_str(params, "startsOn")?;
    let ends_on = get_str(params, "endsOn")?;
    if label.is_empty() {
        return Err(HandlerErr::new("bad_params", "label must not be empty"));
    }
    check_iso_date(&starts_on, "startsOn")?;
    check_iso_date(&ends_on, "endsOn")?;
    if ends_on < starts_on {
        return Err(HandlerErr::new("bad_params", "endsOn precedes startsOn"));
    }

    let exists: Option<String> = conn
        .query_row(
            "SELECT id FROM terms WHERE academic_year = ? AND label = ?",
            rusqlite::params![academic_year, &label],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query_err)?;
    if exists.is_some() {
        return Err(HandlerErr::new(
            "conflict",
            "term already exists for that year",
        ));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO terms(id, academic_year, label, starts_on, ends_on)
         VALUES(?, ?, ?, ?, ?)",
        rusqlite::params![&id, academic_year, &label, &starts_on, &ends_on],
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;

    Ok(json!({
        "termId": id,
        "academicYear": academic_year,
        "label": label,
        "startsOn": starts_on,
        "endsOn": ends_on,
    }))
}

fn terms_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let _ident = identity(conn, params)?;
    let mut stmt = conn
        .prepare(
            "SELECT id, academic_year, label, starts_on, ends_on
             FROM terms
             ORDER BY starts_on",
        )
        .map_err(db_query_err)?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "academicYear": r.get::<_, i64>(1)?,
                "label": r.get::<_, String>(2)?,
                "startsOn": r.get::<_, String>(3)?,
                "endsOn": r.get::<_, String>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;
    Ok(json!({ "terms": rows }))
}

fn classes_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;
    let school_id = get_str(params, "schoolId")?;
    let name = get_str(params, "name")?.trim().to_string();
    let academic_year = get_i64(params, "academicYear")?;
    let grade_level = get_opt_str(params, "gradeLevel");
    let shift = get_opt_str(params, "shift");
    if name.is_empty() {
        return Err(HandlerErr::new("bad_params", "name must not be empty"));
    }

    let school: Option<String> = conn
        .query_row("SELECT id FROM schools WHERE id = ?", [&school_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_query_err)?;
    if school.is_none() {
        return Err(HandlerErr::new("not_found", "school not found"));
    }

    check(
        &ident,
        Action::Create,
        &Resource {
            kind: ResourceKind::Class,
            school_id: Some(school_id.clone()),
            class_id: None,
            student_id: None,
            assigned: None,
        },
    )?;

    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, school_id, name, grade_level, academic_year, shift)
         VALUES(?, ?, ?, ?, ?, ?)",
        rusqlite::params![&class_id, &school_id, &name, &grade_level, academic_year, &shift],
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;

    Ok(json!({ "classId": class_id, "schoolId": school_id, "name": name }))
}

fn classes_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;

    let (where_clause, bind): (&str, Vec<String>) =
        match scope::scope_filter(&ident, ListKind::Classes) {
            ScopeFilter::All => ("", vec![]),
            ScopeFilter::School(s) => ("WHERE c.school_id = ?", vec![s]),
            ScopeFilter::TeacherAssigned(t) => (
                "WHERE c.id IN (SELECT class_id FROM teaching_assignments WHERE teacher_id = ?)",
                vec![t],
            ),
            ScopeFilter::OwnClass(c) => ("WHERE c.id = ?", vec![c]),
            _ => return Ok(json!({ "classes": [] })),
        };

    // Counts via correlated subqueries to avoid double-counting joins.
    let sql = format!(
        "SELECT
           c.id,
           c.school_id,
           c.name,
           c.grade_level,
           c.academic_year,
           c.shift,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count,
           (SELECT COUNT(*) FROM teaching_assignments ta WHERE ta.class_id = c.id) AS assignment_count
         FROM classes c
         {}
         ORDER BY c.name",
        where_clause
    );
    let mut stmt = conn.prepare(&sql).map_err(db_query_err)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(bind), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "schoolId": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "gradeLevel": r.get::<_, Option<String>>(3)?,
                "academicYear": r.get::<_, i64>(4)?,
                "shift": r.get::<_, Option<String>>(5)?,
                "studentCount": r.get::<_, i64>(6)?,
                "assignmentCount": r.get::<_, i64>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;

    Ok(json!({ "classes": rows }))
}

fn classes_get(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;
    let class_id = get_str(params, "classId")?;

    let row: Option<(String, String, Option<String>, i64, Option<String>)> = conn
        .query_row(
            "SELECT school_id, name, grade_level, academic_year, shift
             FROM classes WHERE id = ?",
            [&class_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()
        .map_err(db_query_err)?;
    let Some((school_id, name, grade_level, academic_year, shift)) = row else {
        return Err(HandlerErr::new("not_found", "class not found"));
    };

    let derived_school = scope::class_school(conn, &class_id)?;
    let resource =
        Resource::class(derived_school, class_id.as_str()).with_assignment_for(conn, &ident)?;
    check(&ident, Action::Read, &resource)?;

    let mut stmt = conn
        .prepare(
            "SELECT id, name, enrollment_no, birth_date
             FROM students
             WHERE class_id = ?
             ORDER BY name",
        )
        .map_err(db_query_err)?;
    let students = stmt
        .query_map([&class_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "enrollmentNo": r.get::<_, String>(2)?,
                "birthDate": r.get::<_, Option<String>>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;

    Ok(json!({
        "id": class_id,
        "schoolId": school_id,
        "name": name,
        "gradeLevel": grade_level,
        "academicYear": academic_year,
        "shift": shift,
        "students": students,
    }))
}

fn students_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;
    let class_id = get_str(params, "classId")?;
    let name = get_str(params, "name")?.trim().to_string();
    let enrollment_no = get_str(params, "enrollmentNo")?;
    let birth_date = get_opt_str(params, "birthDate");
    if name.is_empty() {
        return Err(HandlerErr::new("bad_params", "name must not be empty"));
    }
    if let Some(d) = &birth_date {
        check_iso_date(d, "birthDate")?;
    }

    let class_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_query_err)?;
    if class_exists.is_none() {
        return Err(HandlerErr::new("not_found", "class not found"));
    }

    let derived_school = scope::class_school(conn, &class_id)?;
    check(
        &ident,
        Action::Create,
        &Resource {
            kind: ResourceKind::StudentRecord,
            school_id: derived_school,
            class_id: Some(class_id.clone()),
            student_id: None,
            assigned: None,
        },
    )?;

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, class_id, name, enrollment_no, birth_date)
         VALUES(?, ?, ?, ?, ?)",
        rusqlite::params![&student_id, &class_id, &name, &enrollment_no, &birth_date],
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;

    Ok(json!({ "studentId": student_id, "classId": class_id, "name": name }))
}

fn students_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;

    let (where_clause, bind): (&str, Vec<String>) =
        match scope::scope_filter(&ident, ListKind::Students) {
            ScopeFilter::All => ("", vec![]),
            ScopeFilter::School(sc) => (
                "WHERE s.class_id IN (SELECT id FROM classes WHERE school_id = ?)",
                vec![sc],
            ),
            ScopeFilter::TeacherAssigned(t) => (
                "WHERE s.class_id IN (SELECT class_id FROM teaching_assignments WHERE teacher_id = ?)",
                vec![t],
            ),
            ScopeFilter::OwnClass(c) => ("WHERE s.class_id = ?", vec![c]),
            _ => return Ok(json!({ "students": [] })),
        };

    let sql = format!(
        "SELECT s.id, s.class_id, s.name, s.enrollment_no, s.birth_date
         FROM students s
         {}
         ORDER BY s.name",
        where_clause
    );
    let mut stmt = conn.prepare(&sql).map_err(db_query_err)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(bind), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "classId": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "enrollmentNo": r.get::<_, String>(3)?,
                "birthDate": r.get::<_, Option<String>>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;

    Ok(json!({ "students": rows }))
}

fn assignments_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;
    let class_id = get_str(params, "classId")?;
    let teacher_id = get_str(params, "teacherId")?;
    let discipline_id = get_str(params, "disciplineId")?;

    let class_school: Option<String> = conn
        .query_row(
            "SELECT school_id FROM classes WHERE id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query_err)?;
    let Some(class_school) = class_school else {
        return Err(HandlerErr::new("not_found", "class not found"));
    };
    let teacher_school: Option<String> = conn
        .query_row(
            "SELECT school_id FROM teachers WHERE id = ?",
            [&teacher_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query_err)?;
    let Some(teacher_school) = teacher_school else {
        return Err(HandlerErr::new("not_found", "teacher not found"));
    };
    let discipline: Option<String> = conn
        .query_row(
            "SELECT id FROM disciplines WHERE id = ?",
            [&discipline_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query_err)?;
    if discipline.is_none() {
        return Err(HandlerErr::new("not_found", "discipline not found"));
    }

    check(
        &ident,
        Action::Update,
        &Resource::class(Some(class_school.clone()), class_id.as_str()),
    )?;

    if teacher_school != class_school {
        return Err(HandlerErr::new(
            "precondition_failed",
            "teacher and class belong to different schools",
        ));
    }

    let duplicate: Option<String> = conn
        .query_row(
            "SELECT id FROM teaching_assignments
             WHERE class_id = ? AND teacher_id = ? AND discipline_id = ?",
            rusqlite::params![&class_id, &teacher_id, &discipline_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query_err)?;
    if duplicate.is_some() {
        return Err(HandlerErr::new(
            "conflict",
            "teaching assignment already exists",
        ));
    }

    let assignment_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO teaching_assignments(id, class_id, teacher_id, discipline_id)
         VALUES(?, ?, ?, ?)",
        rusqlite::params![&assignment_id, &class_id, &teacher_id, &discipline_id],
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;

    Ok(json!({
        "assignmentId": assignment_id,
        "classId": class_id,
        "teacherId": teacher_id,
        "disciplineId": discipline_id,
    }))
}

fn assignments_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;
    let class_id = get_str(params, "classId")?;

    let class_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_query_err)?;
    if class_exists.is_none() {
        return Err(HandlerErr::new("not_found", "class not found"));
    }

    let derived_school = scope::class_school(conn, &class_id)?;
    let resource =
        Resource::class(derived_school, class_id.as_str()).with_assignment_for(conn, &ident)?;
    check(&ident, Action::Read, &resource)?;

    let mut stmt = conn
        .prepare(
            "SELECT ta.id, ta.teacher_id, te.name, ta.discipline_id, d.name
             FROM teaching_assignments ta
             JOIN teachers te ON te.id = ta.teacher_id
             JOIN disciplines d ON d.id = ta.discipline_id
             WHERE ta.class_id = ?
             ORDER BY d.name",
        )
        .map_err(db_query_err)?;
    let rows = stmt
        .query_map([&class_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "teacherId": r.get::<_, String>(1)?,
                "teacherName": r.get::<_, String>(2)?,
                "disciplineId": r.get::<_, String>(3)?,
                "disciplineName": r.get::<_, String>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;

    Ok(json!({ "assignments": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handled = matches!(
        req.method.as_str(),
        "disciplines.create"
            | "disciplines.list"
            | "terms.create"
            | "terms.list"
            | "classes.create"
            | "classes.list"
            | "classes.get"
            | "students.create"
            | "students.list"
            | "assignments.create"
            | "assignments.list"
    );
    if !handled {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };

    let result = match req.method.as_str() {
        "disciplines.create" => disciplines_create(conn, &req.params),
        "disciplines.list" => disciplines_list(conn, &req.params),
        "terms.create" => terms_create(conn, &req.params),
        "terms.list" => terms_list(conn, &req.params),
        "classes.create" => classes_create(conn, &req.params),
        "classes.list" => classes_list(conn, &req.params),
        "classes.get" => classes_get(conn, &req.params),
        "students.create" => students_create(conn, &req.params),
        "students.list" => students_list(conn, &req.params),
        "assignments.create" => assignments_create(conn, &req.params),
        "assignments.list" => assignments_list(conn, &req.params),
        _ => unreachable!(),
    };

    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
