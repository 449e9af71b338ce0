use crate::calc::CalcError;
use crate::ipc::error::err;
use crate::scope::{self, Access, Action, Identity, IdentityClaims, Resource, ScopeError};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

pub struct HandlerErr {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(code: &str, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, &self.code, self.message, self.details)
    }
}

impl From<ScopeError> for HandlerErr {
    fn from(e: ScopeError) -> Self {
        HandlerErr::new(&e.code, e.message)
    }
}

impl From<CalcError> for HandlerErr {
    fn from(e: CalcError) -> Self {
        HandlerErr {
            code: e.code,
            message: e.message,
            details: e.details,
        }
    }
}

pub fn db_query_err(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", e.to_string())
}

pub fn get_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn get_opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

pub fn get_f64(params: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing or non-numeric {}", key)))
}

pub fn get_i64(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing or non-integer {}", key)))
}

/// A grade must land inside the 0..=10 marking scale.
pub fn check_grade_value(value: f64) -> Result<(), HandlerErr> {
    if !(0.0..=10.0).contains(&value) || !value.is_finite() {
        return Err(HandlerErr::with_details(
            "bad_params",
            "grade value must be within [0, 10]",
            json!({ "value": value }),
        ));
    }
    Ok(())
}

pub fn check_iso_date(raw: &str, key: &str) -> Result<(), HandlerErr> {
    chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|_| ())
        .map_err(|_| {
            HandlerErr::with_details(
                "bad_params",
                format!("{} must be an ISO date (YYYY-MM-DD)", key),
                json!({ key: raw }),
            )
        })
}

/// Pulls the verified claims out of `params.identity` and resolves the
/// derived scope for this request. Every scope-gated method starts here.
pub fn identity(conn: &Connection, params: &serde_json::Value) -> Result<Identity, HandlerErr> {
    let raw = params
        .get("identity")
        .cloned()
        .ok_or_else(|| HandlerErr::new("bad_params", "missing identity"))?;
    let claims: IdentityClaims = serde_json::from_value(raw)
        .map_err(|e| HandlerErr::new("bad_params", format!("malformed identity: {}", e)))?;
    Ok(Identity::resolve(conn, &claims)?)
}

/// Joined context for one assessment: its assignment, class, owning
/// teacher, and the derived school. `school_id == None` marks an orphaned
/// class row, which `authorize` fails closed on.
pub struct AssessmentCtx {
    pub assessment_id: String,
    pub assignment_id: String,
    pub class_id: String,
    pub teacher_id: String,
    pub school_id: Option<String>,
    pub title: String,
    pub weight: f64,
}

pub fn assessment_ctx(
    conn: &Connection,
    assessment_id: &str,
) -> Result<Option<AssessmentCtx>, HandlerErr> {
    conn.query_row(
        "SELECT a.id, ta.id, ta.class_id, ta.teacher_id, c.school_id, a.title, a.weight
         FROM assessments a
         JOIN teaching_assignments ta ON ta.id = a.assignment_id
         LEFT JOIN classes c ON c.id = ta.class_id
         WHERE a.id = ?",
        [assessment_id],
        |r| {
            Ok(AssessmentCtx {
                assessment_id: r.get(0)?,
                assignment_id: r.get(1)?,
                class_id: r.get(2)?,
                teacher_id: r.get(3)?,
                school_id: r.get(4)?,
                title: r.get(5)?,
                weight: r.get(6)?,
            })
        },
    )
    .optional()
    .map_err(db_query_err)
}

/// Resource descriptor for one assessment. When `owner_gate` is set, a
/// teacher only passes as the assignment's own teacher (write paths);
/// otherwise any teaching-assignment link with the class suffices (reads).
pub fn assessment_resource(
    conn: &Connection,
    ctx: &AssessmentCtx,
    ident: &Identity,
    owner_gate: bool,
) -> Result<Resource, HandlerErr> {
    let mut resource = Resource::assessment(ctx.school_id.clone(), ctx.class_id.as_str());
    if ident.role == crate::scope::Role::Teacher {
        if owner_gate {
            resource.assigned = Some(ident.teacher_id.as_deref() == Some(ctx.teacher_id.as_str()));
        } else {
            resource = resource.with_assignment_for(conn, ident)?;
        }
    }
    Ok(resource)
}

/// Uniform authorization gate. The deny reason code travels in
/// `details.reason`; the message never names the other tenant.
pub fn check(identity: &Identity, action: Action, resource: &Resource) -> Result<(), HandlerErr> {
    match scope::authorize(identity, action, resource) {
        Access::Allow => Ok(()),
        Access::Deny(reason) => Err(HandlerErr::with_details(
            "forbidden",
            "access denied",
            json!({ "reason": reason.code() }),
        )),
    }
}
