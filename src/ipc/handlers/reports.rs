use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{check, db_query_err, get_str, identity, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::scope::{self, Action, Resource, ResourceKind, Role};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

fn to_value<T: serde::Serialize>(report: T) -> Result<serde_json::Value, HandlerErr> {
    serde_json::to_value(report)
        .map_err(|e| HandlerErr::new("encode_failed", e.to_string()))
}

fn reports_student(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;
    let student_id = get_str(params, "studentId")?;

    let class_id: Option<String> = conn
        .query_row(
            "SELECT class_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query_err)?;
    let Some(class_id) = class_id else {
        return Err(HandlerErr::new("not_found", "student not found"));
    };
    let school_id = scope::class_school(conn, &class_id)?;
    let resource = Resource::student_record(school_id, Some(class_id), student_id.as_str())
        .with_assignment_for(conn, &ident)?;
    check(&ident, Action::Read, &resource)?;

    to_value(calc::student_report(conn, &student_id)?)
}

fn reports_class(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;
    let class_id = get_str(params, "classId")?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_query_err)?;
    if exists.is_none() {
        return Err(HandlerErr::new("not_found", "class not found"));
    }
    // The class-wide sheet names every classmate's standing. Students get
    // their own report instead.
    if ident.role == Role::Student {
        return Err(HandlerErr::with_details(
            "forbidden",
            "access denied",
            json!({ "reason": "ROLE_NOT_PERMITTED" }),
        ));
    }
    let school_id = scope::class_school(conn, &class_id)?;
    let resource =
        Resource::class(school_id, class_id.as_str()).with_assignment_for(conn, &ident)?;
    check(&ident, Action::Read, &resource)?;

    to_value(calc::class_report(conn, &class_id)?)
}

fn reports_school(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;
    let school_id = get_str(params, "schoolId")?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM schools WHERE id = ?", [&school_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_query_err)?;
    if exists.is_none() {
        return Err(HandlerErr::new("not_found", "school not found"));
    }
    let resource = Resource::school(ResourceKind::SchoolStats, school_id.as_str());
    check(&ident, Action::Read, &resource)?;

    to_value(calc::school_statistics(conn, &school_id)?)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handled = matches!(
        req.method.as_str(),
        "reports.student" | "reports.class" | "reports.school"
    );
    if !handled {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };

    let result = match req.method.as_str() {
        "reports.student" => reports_student(conn, &req.params),
        "reports.class" => reports_class(conn, &req.params),
        "reports.school" => reports_school(conn, &req.params),
        _ => unreachable!(),
    };

    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
