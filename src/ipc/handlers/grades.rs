use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    assessment_ctx, assessment_resource, check, check_grade_value, db_query_err, get_f64, get_str,
    identity, AssessmentCtx, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::scope::{self, Action, Identity, ListKind, Resource, Role, ScopeFilter};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

fn student_class(
    conn: &Connection,
    student_id: &str,
) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT class_id FROM students WHERE id = ?",
        [student_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(db_query_err)
}

fn grade_resource(ctx: &AssessmentCtx, ident: &Identity, student_id: &str) -> Resource {
    let mut resource = Resource::grade(
        ctx.school_id.clone(),
        Some(ctx.class_id.clone()),
        student_id,
    );
    if ident.role == Role::Teacher {
        resource.assigned = Some(ident.teacher_id.as_deref() == Some(ctx.teacher_id.as_str()));
    }
    resource
}

fn grades_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;
    let assessment_id = get_str(params, "assessmentId")?;
    let student_id = get_str(params, "studentId")?;
    let value = get_f64(params, "value")?;

    check_grade_value(value)?;
    let Some(ctx) = assessment_ctx(conn, &assessment_id)? else {
        return Err(HandlerErr::new("not_found", "assessment not found"));
    };
    check(&ident, Action::Create, &grade_resource(&ctx, &ident, &student_id))?;

    let Some(class_id) = student_class(conn, &student_id)? else {
        return Err(HandlerErr::new("not_found", "student not found"));
    };
    if class_id != ctx.class_id {
        return Err(HandlerErr::with_details(
            "precondition_failed",
            "student is not enrolled in the assessment's class",
            json!({ "studentId": student_id }),
        ));
    }

    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM grades WHERE assessment_id = ? AND student_id = ?",
            [&assessment_id, &student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query_err)?;
    if exists.is_some() {
        return Err(HandlerErr::with_details(
            "conflict",
            "student already has a grade for this assessment",
            json!({ "studentId": student_id }),
        ));
    }

    let grade_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO grades(id, assessment_id, student_id, value) VALUES(?, ?, ?, ?)",
        rusqlite::params![&grade_id, &assessment_id, &student_id, value],
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;

    Ok(json!({
        "gradeId": grade_id,
        "assessmentId": assessment_id,
        "studentId": student_id,
        "value": value,
    }))
}

fn grades_create_batch(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;
    let assessment_id = get_str(params, "assessmentId")?;
    let entries = params
        .get("grades")
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::new("bad_params", "missing grades array"))?;
    if entries.is_empty() {
        return Err(HandlerErr::new("bad_params", "grades array is empty"));
    }

    let Some(ctx) = assessment_ctx(conn, &assessment_id)? else {
        return Err(HandlerErr::new("not_found", "assessment not found"));
    };
    let resource = assessment_resource(conn, &ctx, &ident, true)?;
    check(&ident, Action::Create, &resource)?;

    let mut parsed: Vec<(String, f64)> = Vec::with_capacity(entries.len());
    for entry in entries {
        let student_id = get_str(entry, "studentId")?;
        let value = get_f64(entry, "value")?;
        parsed.push((student_id, value));
    }

    // Validate the whole batch before touching the database so the caller
    // gets every offender at once, not the first one.
    let mut invalid_values: Vec<&str> = Vec::new();
    let mut unknown: Vec<&str> = Vec::new();
    let mut not_enrolled: Vec<&str> = Vec::new();
    let mut duplicated: Vec<&str> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for (student_id, value) in &parsed {
        if check_grade_value(*value).is_err() {
            invalid_values.push(student_id);
        }
        if !seen.insert(student_id) {
            duplicated.push(student_id);
            continue;
        }
        match student_class(conn, student_id)? {
            None => unknown.push(student_id),
            Some(class_id) if class_id != ctx.class_id => not_enrolled.push(student_id),
            Some(_) => {
                let graded: Option<i64> = conn
                    .query_row(
                        "SELECT 1 FROM grades WHERE assessment_id = ? AND student_id = ?",
                        [assessment_id.as_str(), student_id.as_str()],
                        |r| r.get(0),
                    )
                    .optional()
                    .map_err(db_query_err)?;
                if graded.is_some() {
                    duplicated.push(student_id);
                }
            }
        }
    }

    if !invalid_values.is_empty() {
        return Err(HandlerErr::with_details(
            "bad_params",
            "one or more grade values are out of range",
            json!({ "studentIds": invalid_values }),
        ));
    }
    if !unknown.is_empty() {
        return Err(HandlerErr::with_details(
            "not_found",
            "one or more students do not exist",
            json!({ "studentIds": unknown }),
        ));
    }
    if !not_enrolled.is_empty() {
        return Err(HandlerErr::with_details(
            "precondition_failed",
            "one or more students are not enrolled in the assessment's class",
            json!({ "studentIds": not_enrolled }),
        ));
    }
    if !duplicated.is_empty() {
        return Err(HandlerErr::with_details(
            "conflict",
            "one or more students are already graded for this assessment",
            json!({ "studentIds": duplicated }),
        ));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut created = Vec::with_capacity(parsed.len());
    for (student_id, value) in &parsed {
        let grade_id = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO grades(id, assessment_id, student_id, value) VALUES(?, ?, ?, ?)",
            rusqlite::params![&grade_id, &assessment_id, student_id, value],
        )
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        created.push(json!({ "gradeId": grade_id, "studentId": student_id, "value": value }));
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    Ok(json!({ "assessmentId": assessment_id, "created": created }))
}

fn load_grade(
    conn: &Connection,
    grade_id: &str,
) -> Result<Option<(String, String, f64)>, HandlerErr> {
    conn.query_row(
        "SELECT assessment_id, student_id, value FROM grades WHERE id = ?",
        [grade_id],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )
    .optional()
    .map_err(db_query_err)
}

fn grades_update(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;
    let grade_id = get_str(params, "gradeId")?;
    let value = get_f64(params, "value")?;

    check_grade_value(value)?;
    let Some((assessment_id, student_id, _)) = load_grade(conn, &grade_id)? else {
        return Err(HandlerErr::new("not_found", "grade not found"));
    };
    let Some(ctx) = assessment_ctx(conn, &assessment_id)? else {
        return Err(HandlerErr::new("not_found", "assessment not found"));
    };
    check(&ident, Action::Update, &grade_resource(&ctx, &ident, &student_id))?;

    conn.execute(
        "UPDATE grades SET value = ? WHERE id = ?",
        rusqlite::params![value, &grade_id],
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;

    Ok(json!({ "gradeId": grade_id, "studentId": student_id, "value": value }))
}

fn grades_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;
    let grade_id = get_str(params, "gradeId")?;

    let Some((assessment_id, student_id, _)) = load_grade(conn, &grade_id)? else {
        return Err(HandlerErr::new("not_found", "grade not found"));
    };
    let Some(ctx) = assessment_ctx(conn, &assessment_id)? else {
        return Err(HandlerErr::new("not_found", "assessment not found"));
    };
    check(&ident, Action::Delete, &grade_resource(&ctx, &ident, &student_id))?;

    conn.execute("DELETE FROM grades WHERE id = ?", [&grade_id])
        .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;

    Ok(json!({ "gradeId": grade_id }))
}

fn grades_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;

    let (scope_clause, bind): (&str, Vec<String>) =
        match scope::scope_filter(&ident, ListKind::Grades) {
            ScopeFilter::All => ("1 = 1", vec![]),
            ScopeFilter::School(s) => (
                "g.student_id IN (SELECT s.id FROM students s
                 JOIN classes c ON c.id = s.class_id WHERE c.school_id = ?)",
                vec![s],
            ),
            ScopeFilter::TeacherAssigned(t) => (
                "a.assignment_id IN (SELECT id FROM teaching_assignments WHERE teacher_id = ?)",
                vec![t],
            ),
            ScopeFilter::OwnStudent(s) => ("g.student_id = ?", vec![s]),
            _ => return Ok(json!({ "grades": [] })),
        };

    let sql = format!(
        "SELECT g.id, g.value, g.assessment_id, a.title, a.applied_on, g.student_id, s.name
         FROM grades g
         JOIN assessments a ON a.id = g.assessment_id
         JOIN students s ON s.id = g.student_id
         WHERE {}
         ORDER BY a.applied_on, s.name",
        scope_clause
    );
    let mut stmt = conn.prepare(&sql).map_err(db_query_err)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(bind), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "value": r.get::<_, f64>(1)?,
                "assessmentId": r.get::<_, String>(2)?,
                "assessmentTitle": r.get::<_, String>(3)?,
                "appliedOn": r.get::<_, String>(4)?,
                "studentId": r.get::<_, String>(5)?,
                "studentName": r.get::<_, String>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;

    Ok(json!({ "grades": rows }))
}

fn grades_list_by_assessment(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;
    let assessment_id = get_str(params, "assessmentId")?;

    let Some(ctx) = assessment_ctx(conn, &assessment_id)? else {
        return Err(HandlerErr::new("not_found", "assessment not found"));
    };
    let resource = assessment_resource(conn, &ctx, &ident, false)?;
    check(&ident, Action::Read, &resource)?;

    // A student passes the class gate above but still only sees their own
    // row of the sheet.
    let own_only = match ident.role {
        Role::Student => ident.student_id.clone(),
        _ => None,
    };

    let mut sql = String::from(
        "SELECT g.id, g.student_id, s.name, g.value
         FROM grades g
         JOIN students s ON s.id = g.student_id
         WHERE g.assessment_id = ?",
    );
    let mut bind = vec![assessment_id.clone()];
    if let Some(own) = own_only {
        sql.push_str(" AND g.student_id = ?");
        bind.push(own);
    }
    sql.push_str(" ORDER BY s.name");

    let mut stmt = conn.prepare(&sql).map_err(db_query_err)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(bind), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "studentName": r.get::<_, String>(2)?,
                "value": r.get::<_, f64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;

    Ok(json!({
        "assessmentId": assessment_id,
        "title": ctx.title,
        "grades": rows,
    }))
}

fn grades_list_by_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;
    let student_id = get_str(params, "studentId")?;

    let Some(class_id) = student_class(conn, &student_id)? else {
        return Err(HandlerErr::new("not_found", "student not found"));
    };
    let school_id = scope::class_school(conn, &class_id)?;
    let resource = Resource::student_record(school_id, Some(class_id), student_id.as_str())
        .with_assignment_for(conn, &ident)?;
    check(&ident, Action::Read, &resource)?;

    let mut stmt = conn
        .prepare(
            "SELECT g.id, g.value, a.id, a.title, a.weight, a.applied_on, d.name, t.label
             FROM grades g
             JOIN assessments a ON a.id = g.assessment_id
             JOIN teaching_assignments ta ON ta.id = a.assignment_id
             JOIN disciplines d ON d.id = ta.discipline_id
             JOIN terms t ON t.id = a.term_id
             WHERE g.student_id = ?
             ORDER BY t.starts_on, a.applied_on",
        )
        .map_err(db_query_err)?;
    let rows = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "value": r.get::<_, f64>(1)?,
                "assessmentId": r.get::<_, String>(2)?,
                "assessmentTitle": r.get::<_, String>(3)?,
                "weight": r.get::<_, f64>(4)?,
                "appliedOn": r.get::<_, String>(5)?,
                "discipline": r.get::<_, String>(6)?,
                "termLabel": r.get::<_, String>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;

    Ok(json!({ "studentId": student_id, "grades": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handled = matches!(
        req.method.as_str(),
        "grades.create"
            | "grades.createBatch"
            | "grades.update"
            | "grades.delete"
            | "grades.list"
            | "grades.listByAssessment"
            | "grades.listByStudent"
    );
    if !handled {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };

    let result = match req.method.as_str() {
        "grades.create" => grades_create(conn, &req.params),
        "grades.createBatch" => grades_create_batch(conn, &req.params),
        "grades.update" => grades_update(conn, &req.params),
        "grades.delete" => grades_delete(conn, &req.params),
        "grades.list" => grades_list(conn, &req.params),
        "grades.listByAssessment" => grades_list_by_assessment(conn, &req.params),
        "grades.listByStudent" => grades_list_by_student(conn, &req.params),
        _ => unreachable!(),
    };

    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
