use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Role carried by a verified token, as issued by the auth collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    Coordinator,
    Teacher,
    Student,
}

/// Claims object as it arrives on the wire. Token verification happened
/// upstream; these are trusted role bindings, not credentials.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityClaims {
    pub user_id: String,
    pub role: Role,
    #[serde(default)]
    pub teacher_id: Option<String>,
    #[serde(default)]
    pub coordinator_id: Option<String>,
    #[serde(default)]
    pub student_id: Option<String>,
}

/// Fully resolved per-request identity. `school_id` and `class_id` are
/// derived from the current role bindings, never stored on the token:
/// teachers and coordinators inherit their school from their record, a
/// student inherits the class from enrollment and the school through the
/// class. A non-admin identity whose school cannot be resolved is
/// scope-less and denied everywhere.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
    pub teacher_id: Option<String>,
    pub coordinator_id: Option<String>,
    pub student_id: Option<String>,
    pub school_id: Option<String>,
    pub class_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScopeError {
    pub code: String,
    pub message: String,
}

impl ScopeError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

fn db_err(e: rusqlite::Error) -> ScopeError {
    ScopeError::new("db_query_failed", e.to_string())
}

impl Identity {
    /// Builds the identity fresh for one request. Orphaned bindings
    /// (record deleted since the token was issued) resolve to a
    /// scope-less identity rather than an error.
    pub fn resolve(conn: &Connection, claims: &IdentityClaims) -> Result<Identity, ScopeError> {
        let mut ident = Identity {
            user_id: claims.user_id.clone(),
            role: claims.role,
            teacher_id: claims.teacher_id.clone(),
            coordinator_id: claims.coordinator_id.clone(),
            student_id: claims.student_id.clone(),
            school_id: None,
            class_id: None,
        };

        match claims.role {
            Role::Admin => {}
            Role::Coordinator => {
                if let Some(id) = &claims.coordinator_id {
                    ident.school_id = conn
                        .query_row(
                            "SELECT school_id FROM coordinators WHERE id = ?",
                            [id],
                            |r| r.get(0),
                        )
                        .optional()
                        .map_err(db_err)?;
                }
            }
            Role::Teacher => {
                if let Some(id) = &claims.teacher_id {
                    ident.school_id = conn
                        .query_row("SELECT school_id FROM teachers WHERE id = ?", [id], |r| {
                            r.get(0)
                        })
                        .optional()
                        .map_err(db_err)?;
                }
            }
            Role::Student => {
                if let Some(id) = &claims.student_id {
                    let row: Option<(String, Option<String>)> = conn
                        .query_row(
                            "SELECT s.class_id, c.school_id
                             FROM students s
                             LEFT JOIN classes c ON c.id = s.class_id
                             WHERE s.id = ?",
                            [id],
                            |r| Ok((r.get(0)?, r.get(1)?)),
                        )
                        .optional()
                        .map_err(db_err)?;
                    if let Some((class_id, school_id)) = row {
                        ident.class_id = Some(class_id);
                        ident.school_id = school_id;
                    }
                }
            }
        }

        Ok(ident)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Create,
    Update,
    Delete,
}

/// What kind of thing is being touched. Coarse kinds (School, Roster,
/// ApprovalRule) are gated by school alone; detail kinds additionally
/// require the teaching-assignment link for teachers and ownership for
/// students.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    School,
    SchoolStats,
    Roster,
    ApprovalRule,
    Class,
    Assessment,
    Grade,
    StudentRecord,
}

/// Target descriptor handed to `authorize`. `school_id == None` means the
/// derived school could not be computed (orphaned row) and must fail
/// closed. `assigned` is the precomputed teaching-assignment link for the
/// acting teacher; `None` when not applicable.
#[derive(Debug, Clone)]
pub struct Resource {
    pub kind: ResourceKind,
    pub school_id: Option<String>,
    pub class_id: Option<String>,
    pub student_id: Option<String>,
    pub assigned: Option<bool>,
}

impl Resource {
    pub fn school(kind: ResourceKind, school_id: impl Into<String>) -> Resource {
        Resource {
            kind,
            school_id: Some(school_id.into()),
            class_id: None,
            student_id: None,
            assigned: None,
        }
    }

    pub fn class(school_id: Option<String>, class_id: impl Into<String>) -> Resource {
        Resource {
            kind: ResourceKind::Class,
            school_id,
            class_id: Some(class_id.into()),
            student_id: None,
            assigned: None,
        }
    }

    pub fn assessment(school_id: Option<String>, class_id: impl Into<String>) -> Resource {
        Resource {
            kind: ResourceKind::Assessment,
            school_id,
            class_id: Some(class_id.into()),
            student_id: None,
            assigned: None,
        }
    }

    pub fn grade(
        school_id: Option<String>,
        class_id: Option<String>,
        student_id: impl Into<String>,
    ) -> Resource {
        Resource {
            kind: ResourceKind::Grade,
            school_id,
            class_id,
            student_id: Some(student_id.into()),
            assigned: None,
        }
    }

    pub fn student_record(
        school_id: Option<String>,
        class_id: Option<String>,
        student_id: impl Into<String>,
    ) -> Resource {
        Resource {
            kind: ResourceKind::StudentRecord,
            school_id,
            class_id,
            student_id: Some(student_id.into()),
            assigned: None,
        }
    }

    /// Fills the teaching-assignment link when the caller is a teacher and
    /// the resource has a class. No-op for other roles.
    pub fn with_assignment_for(
        mut self,
        conn: &Connection,
        identity: &Identity,
    ) -> Result<Resource, ScopeError> {
        if identity.role != Role::Teacher {
            return Ok(self);
        }
        let (Some(teacher_id), Some(class_id)) = (&identity.teacher_id, &self.class_id) else {
            self.assigned = Some(false);
            return Ok(self);
        };
        self.assigned = Some(teacher_assigned(conn, teacher_id, class_id)?);
        Ok(self)
    }
}

pub fn teacher_assigned(
    conn: &Connection,
    teacher_id: &str,
    class_id: &str,
) -> Result<bool, ScopeError> {
    conn.query_row(
        "SELECT 1 FROM teaching_assignments WHERE teacher_id = ? AND class_id = ?",
        (teacher_id, class_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(db_err)
}

/// Looks up the school a class belongs to. `Ok(None)` when the class row
/// or its school is gone, which `authorize` turns into RESOURCE_SCOPELESS.
pub fn class_school(conn: &Connection, class_id: &str) -> Result<Option<String>, ScopeError> {
    conn.query_row(
        "SELECT sc.id
         FROM classes c
         JOIN schools sc ON sc.id = c.school_id
         WHERE c.id = ?",
        [class_id],
        |r| r.get(0),
    )
    .optional()
    .map_err(db_err)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    RoleNotPermitted,
    Scopeless,
    ResourceScopeless,
    OutOfScope,
}

impl DenyReason {
    /// Wire codes are a client contract; keep them verbatim.
    pub fn code(&self) -> &'static str {
        match self {
            DenyReason::RoleNotPermitted => "ROLE_NOT_PERMITTED",
            DenyReason::Scopeless => "SCOPELESS",
            DenyReason::ResourceScopeless => "RESOURCE_SCOPELESS",
            DenyReason::OutOfScope => "FORBIDDEN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allow,
    Deny(DenyReason),
}

fn role_permits(role: Role, action: Action, kind: ResourceKind) -> bool {
    use Action::*;
    use ResourceKind::*;
    match role {
        Role::Admin => true,
        // Coordinators manage everything inside their school. Creating a
        // school itself is admin-only and gated at the handler.
        Role::Coordinator => true,
        Role::Teacher => match action {
            Read => !matches!(kind, SchoolStats),
            Create | Update | Delete => matches!(kind, Assessment | Grade),
        },
        Role::Student => {
            action == Read && matches!(kind, Class | Assessment | Grade | StudentRecord)
        }
    }
}

/// Single authorization decision applied at the top of every operation.
/// Pure over its inputs; the caller precomputes derived scope fields.
pub fn authorize(identity: &Identity, action: Action, resource: &Resource) -> Access {
    if identity.role == Role::Admin {
        return Access::Allow;
    }
    if !role_permits(identity.role, action, resource.kind) {
        return Access::Deny(DenyReason::RoleNotPermitted);
    }
    let Some(own_school) = &identity.school_id else {
        return Access::Deny(DenyReason::Scopeless);
    };
    let Some(resource_school) = &resource.school_id else {
        return Access::Deny(DenyReason::ResourceScopeless);
    };

    match identity.role {
        Role::Admin => Access::Allow,
        Role::Coordinator => {
            if resource_school == own_school {
                Access::Allow
            } else {
                Access::Deny(DenyReason::OutOfScope)
            }
        }
        Role::Teacher => {
            if resource_school != own_school {
                return Access::Deny(DenyReason::OutOfScope);
            }
            match resource.kind {
                // Class/grade-level detail needs the assignment link; a
                // school match alone only covers coarse lists.
                ResourceKind::Class
                | ResourceKind::Assessment
                | ResourceKind::Grade
                | ResourceKind::StudentRecord => {
                    if resource.assigned == Some(true) {
                        Access::Allow
                    } else {
                        Access::Deny(DenyReason::OutOfScope)
                    }
                }
                _ => Access::Allow,
            }
        }
        Role::Student => match resource.kind {
            ResourceKind::Grade | ResourceKind::StudentRecord => {
                if resource.student_id.as_deref() == identity.student_id.as_deref()
                    && resource.student_id.is_some()
                {
                    Access::Allow
                } else {
                    Access::Deny(DenyReason::OutOfScope)
                }
            }
            ResourceKind::Class | ResourceKind::Assessment => {
                if resource.class_id.as_deref() == identity.class_id.as_deref()
                    && resource.class_id.is_some()
                {
                    Access::Allow
                } else {
                    Access::Deny(DenyReason::OutOfScope)
                }
            }
            _ => Access::Deny(DenyReason::RoleNotPermitted),
        },
    }
}

/// Which bulk listing is being narrowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Schools,
    Roster,
    Classes,
    Students,
    Assessments,
    Grades,
}

/// Filter a listing must apply before pagination. `Nothing` yields an
/// empty page, never an error: a scope-less caller sees no rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeFilter {
    All,
    School(String),
    TeacherAssigned(String),
    OwnClass(String),
    OwnStudent(String),
    Nothing,
}

pub fn scope_filter(identity: &Identity, kind: ListKind) -> ScopeFilter {
    match identity.role {
        Role::Admin => ScopeFilter::All,
        Role::Coordinator => match &identity.school_id {
            Some(s) => ScopeFilter::School(s.clone()),
            None => ScopeFilter::Nothing,
        },
        Role::Teacher => match (&identity.school_id, &identity.teacher_id) {
            (Some(school), Some(teacher)) => match kind {
                ListKind::Schools | ListKind::Roster => ScopeFilter::School(school.clone()),
                ListKind::Classes
                | ListKind::Students
                | ListKind::Assessments
                | ListKind::Grades => ScopeFilter::TeacherAssigned(teacher.clone()),
            },
            _ => ScopeFilter::Nothing,
        },
        Role::Student => match kind {
            ListKind::Grades => match &identity.student_id {
                Some(s) => ScopeFilter::OwnStudent(s.clone()),
                None => ScopeFilter::Nothing,
            },
            ListKind::Classes | ListKind::Students | ListKind::Assessments => {
                match &identity.class_id {
                    Some(c) => ScopeFilter::OwnClass(c.clone()),
                    None => ScopeFilter::Nothing,
                }
            }
            ListKind::Schools | ListKind::Roster => ScopeFilter::Nothing,
        },
    }
}
