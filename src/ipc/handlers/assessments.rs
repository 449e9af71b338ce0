use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    assessment_ctx, assessment_resource, check, check_iso_date, db_query_err, get_f64,
    get_opt_str, get_str, identity, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::scope::{self, Action, ListKind, Resource, ScopeFilter};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

fn assessments_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;
    let assignment_id = get_str(params, "assignmentId")?;
    let term_id = get_str(params, "termId")?;
    let title = get_str(params, "title")?.trim().to_string();
    let weight = get_f64(params, "weight")?;
    let applied_on = get_str(params, "appliedOn")?;

    if title.is_empty() {
        return Err(HandlerErr::new("bad_params", "title must not be empty"));
    }
    // Weight is a positive multiplier, not a percentage; weights in a term
    // do not need to sum to anything.
    if !(weight > 0.0) || !weight.is_finite() {
        return Err(HandlerErr::with_details(
            "bad_params",
            "weight must be a positive number",
            json!({ "weight": weight }),
        ));
    }
    check_iso_date(&applied_on, "appliedOn")?;

    let assignment: Option<(String, String, Option<String>)> = conn
        .query_row(
            "SELECT ta.class_id, ta.teacher_id, c.school_id
             FROM teaching_assignments ta
             LEFT JOIN classes c ON c.id = ta.class_id
             WHERE ta.id = ?",
            [&assignment_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(db_query_err)?;
    let Some((class_id, teacher_id, school_id)) = assignment else {
        return Err(HandlerErr::new("not_found", "teaching assignment not found"));
    };
    let term: Option<i64> = conn
        .query_row("SELECT 1 FROM terms WHERE id = ?", [&term_id], |r| r.get(0))
        .optional()
        .map_err(db_query_err)?;
    if term.is_none() {
        return Err(HandlerErr::new("not_found", "term not found"));
    }

    let mut resource = Resource::assessment(school_id, class_id.as_str());
    if ident.role == scope::Role::Teacher {
        // Only the assignment's own teacher grades that class in that
        // discipline.
        resource.assigned = Some(ident.teacher_id.as_deref() == Some(teacher_id.as_str()));
    }
    check(&ident, Action::Create, &resource)?;

    let assessment_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO assessments(id, assignment_id, term_id, title, weight, applied_on)
         VALUES(?, ?, ?, ?, ?, ?)",
        rusqlite::params![&assessment_id, &assignment_id, &term_id, &title, weight, &applied_on],
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;

    Ok(json!({
        "assessmentId": assessment_id,
        "assignmentId": assignment_id,
        "termId": term_id,
        "title": title,
        "weight": weight,
        "appliedOn": applied_on,
    }))
}

fn assessments_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;
    let class_filter = get_opt_str(params, "classId");

    let (scope_clause, mut bind): (&str, Vec<String>) =
        match scope::scope_filter(&ident, ListKind::Assessments) {
            ScopeFilter::All => ("1 = 1", vec![]),
            ScopeFilter::School(s) => (
                "ta.class_id IN (SELECT id FROM classes WHERE school_id = ?)",
                vec![s],
            ),
            ScopeFilter::TeacherAssigned(t) => (
                "ta.class_id IN (SELECT class_id FROM teaching_assignments WHERE teacher_id = ?)",
                vec![t],
            ),
            ScopeFilter::OwnClass(c) => ("ta.class_id = ?", vec![c]),
            _ => return Ok(json!({ "assessments": [] })),
        };

    let mut sql = format!(
        "SELECT a.id, a.title, a.weight, a.applied_on, a.term_id, t.label,
                ta.class_id, d.name, te.name
         FROM assessments a
         JOIN teaching_assignments ta ON ta.id = a.assignment_id
         JOIN terms t ON t.id = a.term_id
         JOIN disciplines d ON d.id = ta.discipline_id
         JOIN teachers te ON te.id = ta.teacher_id
         WHERE {}",
        scope_clause
    );
    if let Some(c) = class_filter {
        sql.push_str(" AND ta.class_id = ?");
        bind.push(c);
    }
    sql.push_str(" ORDER BY a.applied_on, a.title");

    let mut stmt = conn.prepare(&sql).map_err(db_query_err)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(bind), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "weight": r.get::<_, f64>(2)?,
                "appliedOn": r.get::<_, String>(3)?,
                "termId": r.get::<_, String>(4)?,
                "termLabel": r.get::<_, String>(5)?,
                "classId": r.get::<_, String>(6)?,
                "discipline": r.get::<_, String>(7)?,
                "teacher": r.get::<_, String>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;

    Ok(json!({ "assessments": rows }))
}

fn assessments_delete(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;
    let assessment_id = get_str(params, "assessmentId")?;

    let Some(ctx) = assessment_ctx(conn, &assessment_id)? else {
        return Err(HandlerErr::new("not_found", "assessment not found"));
    };
    let resource = assessment_resource(conn, &ctx, &ident, true)?;
    check(&ident, Action::Delete, &resource)?;

    // Deleting an assessment takes its grades and attachment with it, as
    // one unit.
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let grades_removed = tx
        .execute("DELETE FROM grades WHERE assessment_id = ?", [&assessment_id])
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "DELETE FROM assessment_files WHERE assessment_id = ?",
        [&assessment_id],
    )
    .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute("DELETE FROM assessments WHERE id = ?", [&assessment_id])
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    Ok(json!({
        "assessmentId": assessment_id,
        "gradesRemoved": grades_removed,
    }))
}

fn assessments_attach_file(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;
    let assessment_id = get_str(params, "assessmentId")?;
    let file_name = get_str(params, "fileName")?;
    let source_path = get_str(params, "sourcePath")?;

    let Some(ctx) = assessment_ctx(conn, &assessment_id)? else {
        return Err(HandlerErr::new("not_found", "assessment not found"));
    };
    let resource = assessment_resource(conn, &ctx, &ident, true)?;
    check(&ident, Action::Update, &resource)?;

    // The blob is opaque; only its digest is recorded.
    let content = std::fs::read(&source_path).map_err(|e| {
        HandlerErr::with_details(
            "file_read_failed",
            e.to_string(),
            json!({ "sourcePath": source_path }),
        )
    })?;
    let sha256 = format!("{:x}", Sha256::digest(&content));
    let uploaded_at = chrono::Utc::now().to_rfc3339();
    let size = content.len();

    conn.execute(
        "INSERT INTO assessment_files(assessment_id, file_name, content, sha256, uploaded_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(assessment_id)
         DO UPDATE SET file_name = excluded.file_name,
                       content = excluded.content,
                       sha256 = excluded.sha256,
                       uploaded_at = excluded.uploaded_at",
        rusqlite::params![&assessment_id, &file_name, &content, &sha256, &uploaded_at],
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;

    Ok(json!({
        "assessmentId": assessment_id,
        "fileName": file_name,
        "sha256": sha256,
        "size": size,
    }))
}

fn assessments_get_file(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;
    let assessment_id = get_str(params, "assessmentId")?;
    let dest_path = get_opt_str(params, "destPath");

    let Some(ctx) = assessment_ctx(conn, &assessment_id)? else {
        return Err(HandlerErr::new("not_found", "assessment not found"));
    };
    let resource = assessment_resource(conn, &ctx, &ident, false)?;
    check(&ident, Action::Read, &resource)?;

    let row: Option<(String, Vec<u8>, String, String)> = conn
        .query_row(
            "SELECT file_name, content, sha256, uploaded_at
             FROM assessment_files WHERE assessment_id = ?",
            [&assessment_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(db_query_err)?;
    let Some((file_name, content, sha256, uploaded_at)) = row else {
        return Err(HandlerErr::new("not_found", "no file attached"));
    };

    if let Some(dest) = &dest_path {
        std::fs::write(dest, &content).map_err(|e| {
            HandlerErr::with_details(
                "file_write_failed",
                e.to_string(),
                json!({ "destPath": dest }),
            )
        })?;
    }

    Ok(json!({
        "assessmentId": assessment_id,
        "fileName": file_name,
        "sha256": sha256,
        "uploadedAt": uploaded_at,
        "size": content.len(),
        "written": dest_path.is_some(),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handled = matches!(
        req.method.as_str(),
        "assessments.create"
            | "assessments.list"
            | "assessments.delete"
            | "assessments.attachFile"
            | "assessments.getFile"
    );
    if !handled {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };

    let result = match req.method.as_str() {
        "assessments.create" => assessments_create(conn, &req.params),
        "assessments.list" => assessments_list(conn, &req.params),
        "assessments.delete" => assessments_delete(conn, &req.params),
        "assessments.attachFile" => assessments_attach_file(conn, &req.params),
        "assessments.getFile" => assessments_get_file(conn, &req.params),
        _ => unreachable!(),
    };

    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
