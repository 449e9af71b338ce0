use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    check, db_query_err, get_f64, get_i64, get_str, identity, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::scope::{self, Action, ListKind, Resource, ResourceKind, Role, ScopeFilter};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn school_exists(conn: &Connection, school_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM schools WHERE id = ?", [school_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(db_query_err)
}

fn schools_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;
    // Creating a school has no school to scope against; admin only.
    if ident.role != Role::Admin {
        return Err(HandlerErr::with_details(
            "forbidden",
            "access denied",
            json!({ "reason": "ROLE_NOT_PERMITTED" }),
        ));
    }

    let name = get_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr::new("bad_params", "name must not be empty"));
    }

    let school_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO schools(id, name) VALUES(?, ?)",
        (&school_id, &name),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;

    Ok(json!({ "schoolId": school_id, "name": name }))
}

fn schools_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;
    let (where_clause, bind): (&str, Vec<String>) =
        match scope::scope_filter(&ident, ListKind::Schools) {
            ScopeFilter::All => ("", vec![]),
            ScopeFilter::School(s) => ("WHERE s.id = ?", vec![s]),
            _ => return Ok(json!({ "schools": [] })),
        };

    let sql = format!(
        "SELECT
           s.id,
           s.name,
           (SELECT COUNT(*) FROM classes c WHERE c.school_id = s.id) AS class_count,
           (SELECT COUNT(*) FROM teachers t WHERE t.school_id = s.id) AS teacher_count
         FROM schools s
         {}
         ORDER BY s.name",
        where_clause
    );
    let mut stmt = conn.prepare(&sql).map_err(db_query_err)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(bind), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "classCount": r.get::<_, i64>(2)?,
                "teacherCount": r.get::<_, i64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;

    Ok(json!({ "schools": rows }))
}

fn schools_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;
    let school_id = get_str(params, "schoolId")?;

    let name: Option<String> = conn
        .query_row("SELECT name FROM schools WHERE id = ?", [&school_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_query_err)?;
    let Some(name) = name else {
        return Err(HandlerErr::new("not_found", "school not found"));
    };

    check(
        &ident,
        Action::Read,
        &Resource::school(ResourceKind::School, school_id.as_str()),
    )?;

    Ok(json!({ "id": school_id, "name": name }))
}

fn rules_set(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;
    let school_id = get_str(params, "schoolId")?;
    let academic_year = get_i64(params, "academicYear")?;
    let minimum_average = get_f64(params, "minimumAverage")?;

    if !(0.0..=10.0).contains(&minimum_average) || !minimum_average.is_finite() {
        return Err(HandlerErr::with_details(
            "bad_params",
            "minimumAverage must be within [0, 10]",
            json!({ "minimumAverage": minimum_average }),
        ));
    }
    if !school_exists(conn, &school_id)? {
        return Err(HandlerErr::new("not_found", "school not found"));
    }

    check(
        &ident,
        Action::Update,
        &Resource::school(ResourceKind::ApprovalRule, school_id.as_str()),
    )?;

    // One rule per school-year; re-setting replaces the threshold.
    conn.execute(
        "INSERT INTO approval_rules(id, school_id, academic_year, minimum_average)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(school_id, academic_year)
         DO UPDATE SET minimum_average = excluded.minimum_average",
        (
            Uuid::new_v4().to_string(),
            &school_id,
            academic_year,
            minimum_average,
        ),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;

    Ok(json!({
        "schoolId": school_id,
        "academicYear": academic_year,
        "minimumAverage": minimum_average,
    }))
}

fn rules_get(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;
    let school_id = get_str(params, "schoolId")?;
    let academic_year = get_i64(params, "academicYear")?;

    if !school_exists(conn, &school_id)? {
        return Err(HandlerErr::new("not_found", "school not found"));
    }
    check(
        &ident,
        Action::Read,
        &Resource::school(ResourceKind::ApprovalRule, school_id.as_str()),
    )?;

    let minimum: Option<f64> = conn
        .query_row(
            "SELECT minimum_average FROM approval_rules
             WHERE school_id = ? AND academic_year = ?",
            (&school_id, academic_year),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_query_err)?;

    Ok(json!({
        "schoolId": school_id,
        "academicYear": academic_year,
        "minimumAverage": minimum.unwrap_or(crate::calc::DEFAULT_MINIMUM_AVERAGE),
        "isDefault": minimum.is_none(),
    }))
}

fn roster_create(
    conn: &Connection,
    params: &serde_json::Value,
    table: &str,
    id_key: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;
    let school_id = get_str(params, "schoolId")?;
    let name = get_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr::new("bad_params", "name must not be empty"));
    }
    if !school_exists(conn, &school_id)? {
        return Err(HandlerErr::new("not_found", "school not found"));
    }

    check(
        &ident,
        Action::Create,
        &Resource::school(ResourceKind::Roster, school_id.as_str()),
    )?;

    let id = Uuid::new_v4().to_string();
    let sql = format!("INSERT INTO {}(id, school_id, name) VALUES(?, ?, ?)", table);
    conn.execute(&sql, (&id, &school_id, &name))
        .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;

    Ok(json!({ id_key: id, "schoolId": school_id, "name": name }))
}

fn roster_list(
    conn: &Connection,
    params: &serde_json::Value,
    table: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let ident = identity(conn, params)?;
    let requested = params
        .get("schoolId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let school_filter = match scope::scope_filter(&ident, ListKind::Roster) {
        ScopeFilter::All => requested,
        // Coarse school-scoped list: teachers and coordinators see their
        // own school's roster without an assignment gate.
        ScopeFilter::School(own) => match requested {
            Some(r) if r != own => return Ok(json!({ "people": [] })),
            _ => Some(own),
        },
        _ => return Ok(json!({ "people": [] })),
    };

    let (sql, bind): (String, Vec<String>) = match school_filter {
        Some(s) => (
            format!(
                "SELECT id, school_id, name FROM {} WHERE school_id = ? ORDER BY name",
                table
            ),
            vec![s],
        ),
        None => (
            format!("SELECT id, school_id, name FROM {} ORDER BY name", table),
            vec![],
        ),
    };
    let mut stmt = conn.prepare(&sql).map_err(db_query_err)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(bind), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "schoolId": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query_err)?;

    Ok(json!({ "people": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handled = matches!(
        req.method.as_str(),
        "schools.create"
            | "schools.list"
            | "schools.get"
            | "rules.set"
            | "rules.get"
            | "teachers.create"
            | "teachers.list"
            | "coordinators.create"
            | "coordinators.list"
    );
    if !handled {
        return None;
    }
    let Some(conn) = state.db.as_ref() else {
        return Some(err(&req.id, "no_workspace", "select a workspace first", None));
    };

    let result = match req.method.as_str() {
        "schools.create" => schools_create(conn, &req.params),
        "schools.list" => schools_list(conn, &req.params),
        "schools.get" => schools_get(conn, &req.params),
        "rules.set" => rules_set(conn, &req.params),
        "rules.get" => rules_get(conn, &req.params),
        "teachers.create" => roster_create(conn, &req.params, "teachers", "teacherId"),
        "teachers.list" => roster_list(conn, &req.params, "teachers"),
        "coordinators.create" => roster_create(conn, &req.params, "coordinators", "coordinatorId"),
        "coordinators.list" => roster_list(conn, &req.params, "coordinators"),
        _ => unreachable!(),
    };

    Some(match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
