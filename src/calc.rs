use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

/// Fallback pass mark when a school has no approval rule registered for
/// the academic year. Documented default, not invented per call site.
pub const DEFAULT_MINIMUM_AVERAGE: f64 = 6.0;

/// Half-up rounding to 2 decimals, applied only to returned summary
/// values. Intermediate sums stay unrounded.
pub fn round2(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

fn db_err(e: rusqlite::Error) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

/// Running weighted mean: Σ(value·weight) / Σ(weight). A zero weight sum
/// (no grades yet) averages to 0 instead of dividing by zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedMean {
    sum: f64,
    weights: f64,
    count: usize,
}

impl WeightedMean {
    pub fn push(&mut self, value: f64, weight: f64) {
        self.sum += value * weight;
        self.weights += weight;
        self.count += 1;
    }

    pub fn average(&self) -> f64 {
        if self.weights > 0.0 {
            self.sum / self.weights
        } else {
            0.0
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Standing {
    Approved,
    Failing,
    InProgress,
}

/// A student with no grades is in progress, never failing: a zero average
/// from an empty record must not read as a fail.
pub fn classify(average: f64, graded_count: usize, minimum_average: f64) -> Standing {
    if graded_count == 0 {
        Standing::InProgress
    } else if average >= minimum_average {
        Standing::Approved
    } else {
        Standing::Failing
    }
}

pub fn approval_threshold(
    conn: &Connection,
    school_id: &str,
    academic_year: i64,
) -> Result<f64, CalcError> {
    let minimum: Option<f64> = conn
        .query_row(
            "SELECT minimum_average FROM approval_rules
             WHERE school_id = ? AND academic_year = ?",
            (school_id, academic_year),
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    Ok(minimum.unwrap_or(DEFAULT_MINIMUM_AVERAGE))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentHeader {
    pub id: String,
    pub name: String,
    pub enrollment_no: String,
    pub birth_date: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassHeader {
    pub id: String,
    pub name: String,
    pub grade_level: Option<String>,
    pub academic_year: i64,
    pub shift: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchoolHeader {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportGrade {
    pub discipline: String,
    pub teacher: String,
    pub term: String,
    pub assessment: String,
    pub value: f64,
    pub weight: f64,
    pub applied_on: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentReport {
    pub student: StudentHeader,
    pub class: ClassHeader,
    pub school: SchoolHeader,
    pub grades: Vec<ReportGrade>,
    pub average: f64,
    pub total_assessments: usize,
    pub standing: Standing,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisciplinePerformance {
    pub discipline: String,
    pub teacher: String,
    pub average: f64,
    pub total_assessments: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentPerformance {
    pub id: String,
    pub name: String,
    pub enrollment_no: String,
    pub average: f64,
    pub total_grades: usize,
    pub standing: Standing,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassReport {
    pub class: ClassHeader,
    pub school: SchoolHeader,
    pub total_students: usize,
    pub total_assessments: i64,
    pub class_average: f64,
    pub disciplines: Vec<DisciplinePerformance>,
    pub students: Vec<StudentPerformance>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeLevelCount {
    pub grade_level: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassPerformance {
    pub id: String,
    pub name: String,
    pub grade_level: Option<String>,
    pub average: f64,
    pub total_students: usize,
    pub total_grades: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchoolStatistics {
    pub school: SchoolHeader,
    pub total_classes: i64,
    pub total_students: i64,
    pub total_teachers: i64,
    pub total_coordinators: i64,
    pub total_disciplines: i64,
    pub total_assessments: i64,
    pub school_average: f64,
    pub classes_by_grade_level: Vec<GradeLevelCount>,
    pub class_performance: Vec<ClassPerformance>,
}

struct StudentRow {
    id: String,
    name: String,
    enrollment_no: String,
    birth_date: Option<String>,
    class_id: String,
}

fn load_student(conn: &Connection, student_id: &str) -> Result<Option<StudentRow>, CalcError> {
    conn.query_row(
        "SELECT id, name, enrollment_no, birth_date, class_id
         FROM students WHERE id = ?",
        [student_id],
        |r| {
            Ok(StudentRow {
                id: r.get(0)?,
                name: r.get(1)?,
                enrollment_no: r.get(2)?,
                birth_date: r.get(3)?,
                class_id: r.get(4)?,
            })
        },
    )
    .optional()
    .map_err(db_err)
}

fn load_class(conn: &Connection, class_id: &str) -> Result<Option<ClassHeader>, CalcError> {
    conn.query_row(
        "SELECT id, name, grade_level, academic_year, shift
         FROM classes WHERE id = ?",
        [class_id],
        |r| {
            Ok(ClassHeader {
                id: r.get(0)?,
                name: r.get(1)?,
                grade_level: r.get(2)?,
                academic_year: r.get(3)?,
                shift: r.get(4)?,
            })
        },
    )
    .optional()
    .map_err(db_err)
}

fn load_school(conn: &Connection, school_id: &str) -> Result<Option<SchoolHeader>, CalcError> {
    conn.query_row(
        "SELECT id, name FROM schools WHERE id = ?",
        [school_id],
        |r| {
            Ok(SchoolHeader {
                id: r.get(0)?,
                name: r.get(1)?,
            })
        },
    )
    .optional()
    .map_err(db_err)
}

fn school_of_class(conn: &Connection, class_id: &str) -> Result<Option<SchoolHeader>, CalcError> {
    let school_id: Option<String> = conn
        .query_row(
            "SELECT school_id FROM classes WHERE id = ?",
            [class_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    match school_id {
        Some(id) => load_school(conn, &id),
        None => Ok(None),
    }
}

/// Weighted average over every grade of one student, across disciplines.
fn student_weighted_average(
    conn: &Connection,
    student_id: &str,
) -> Result<WeightedMean, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT g.value, a.weight
             FROM grades g
             JOIN assessments a ON a.id = g.assessment_id
             WHERE g.student_id = ?",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([student_id], |r| {
            Ok((r.get::<_, f64>(0)?, r.get::<_, f64>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut mean = WeightedMean::default();
    for (value, weight) in rows {
        mean.push(value, weight);
    }
    Ok(mean)
}

/// The boletim. Grade lines are ordered by term start then application
/// date; report-card consumers render chronologically, so the ordering is
/// part of the contract.
pub fn student_report(conn: &Connection, student_id: &str) -> Result<StudentReport, CalcError> {
    let Some(student) = load_student(conn, student_id)? else {
        return Err(CalcError::new("not_found", "student not found"));
    };
    let Some(class) = load_class(conn, &student.class_id)? else {
        return Err(CalcError::new("not_found", "class not found"));
    };
    let Some(school) = school_of_class(conn, &class.id)? else {
        return Err(CalcError::new("not_found", "school not found"));
    };

    let mut stmt = conn
        .prepare(
            "SELECT d.name, te.name, t.label, a.title, g.value, a.weight, a.applied_on
             FROM grades g
             JOIN assessments a ON a.id = g.assessment_id
             JOIN terms t ON t.id = a.term_id
             JOIN teaching_assignments ta ON ta.id = a.assignment_id
             JOIN disciplines d ON d.id = ta.discipline_id
             JOIN teachers te ON te.id = ta.teacher_id
             WHERE g.student_id = ?
             ORDER BY t.starts_on ASC, a.applied_on ASC",
        )
        .map_err(db_err)?;
    let grades: Vec<ReportGrade> = stmt
        .query_map([student_id], |r| {
            Ok(ReportGrade {
                discipline: r.get(0)?,
                teacher: r.get(1)?,
                term: r.get(2)?,
                assessment: r.get(3)?,
                value: r.get(4)?,
                weight: r.get(5)?,
                applied_on: r.get(6)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut mean = WeightedMean::default();
    for g in &grades {
        mean.push(g.value, g.weight);
    }

    let minimum = approval_threshold(conn, &school.id, class.academic_year)?;
    let standing = classify(mean.average(), mean.count(), minimum);

    Ok(StudentReport {
        student: StudentHeader {
            id: student.id,
            name: student.name,
            enrollment_no: student.enrollment_no,
            birth_date: student.birth_date,
        },
        class,
        school,
        average: round2(mean.average()),
        total_assessments: grades.len(),
        grades,
        standing,
    })
}

struct ClassAggregate {
    /// Unweighted mean of the per-student weighted averages.
    average: f64,
    student_count: usize,
    grade_count: usize,
    per_student: Vec<(StudentHeader, WeightedMean)>,
}

/// Two-level aggregation: weight grades within each student, then average
/// across students unweighted, so one heavy-weighted assessment for a
/// single student cannot skew the class figure.
fn class_aggregate(conn: &Connection, class_id: &str) -> Result<ClassAggregate, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, name, enrollment_no, birth_date
             FROM students
             WHERE class_id = ?
             ORDER BY name",
        )
        .map_err(db_err)?;
    let students: Vec<StudentHeader> = stmt
        .query_map([class_id], |r| {
            Ok(StudentHeader {
                id: r.get(0)?,
                name: r.get(1)?,
                enrollment_no: r.get(2)?,
                birth_date: r.get(3)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut per_student = Vec::with_capacity(students.len());
    let mut sum_of_averages = 0.0;
    let mut grade_count = 0;
    for s in students {
        let mean = student_weighted_average(conn, &s.id)?;
        sum_of_averages += mean.average();
        grade_count += mean.count();
        per_student.push((s, mean));
    }

    let average = if per_student.is_empty() {
        0.0
    } else {
        sum_of_averages / per_student.len() as f64
    };

    Ok(ClassAggregate {
        average,
        student_count: per_student.len(),
        grade_count,
        per_student,
    })
}

pub fn class_report(conn: &Connection, class_id: &str) -> Result<ClassReport, CalcError> {
    let Some(class) = load_class(conn, class_id)? else {
        return Err(CalcError::new("not_found", "class not found"));
    };
    let Some(school) = school_of_class(conn, class_id)? else {
        return Err(CalcError::new("not_found", "school not found"));
    };

    // One figure per teaching assignment: a grade-weighted pool across the
    // discipline's assessments for this class.
    let mut stmt = conn
        .prepare(
            "SELECT ta.id, d.name, te.name
             FROM teaching_assignments ta
             JOIN disciplines d ON d.id = ta.discipline_id
             JOIN teachers te ON te.id = ta.teacher_id
             WHERE ta.class_id = ?
             ORDER BY d.name",
        )
        .map_err(db_err)?;
    let assignments: Vec<(String, String, String)> = stmt
        .query_map([class_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut disciplines = Vec::with_capacity(assignments.len());
    let mut total_assessments: i64 = 0;
    for (assignment_id, discipline, teacher) in assignments {
        let assessment_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM assessments WHERE assignment_id = ?",
                [&assignment_id],
                |r| r.get(0),
            )
            .map_err(db_err)?;
        total_assessments += assessment_count;

        let mut stmt = conn
            .prepare(
                "SELECT g.value, a.weight
                 FROM grades g
                 JOIN assessments a ON a.id = g.assessment_id
                 WHERE a.assignment_id = ?",
            )
            .map_err(db_err)?;
        let rows: Vec<(f64, f64)> = stmt
            .query_map([&assignment_id], |r| Ok((r.get(0)?, r.get(1)?)))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(db_err)?;
        let mut mean = WeightedMean::default();
        for (value, weight) in rows {
            mean.push(value, weight);
        }

        disciplines.push(DisciplinePerformance {
            discipline,
            teacher,
            average: round2(mean.average()),
            total_assessments: assessment_count,
        });
    }

    let minimum = approval_threshold(conn, &school.id, class.academic_year)?;
    let aggregate = class_aggregate(conn, class_id)?;
    let students = aggregate
        .per_student
        .iter()
        .map(|(s, mean)| StudentPerformance {
            id: s.id.clone(),
            name: s.name.clone(),
            enrollment_no: s.enrollment_no.clone(),
            average: round2(mean.average()),
            total_grades: mean.count(),
            standing: classify(mean.average(), mean.count(), minimum),
        })
        .collect();

    Ok(ClassReport {
        class,
        school,
        total_students: aggregate.student_count,
        total_assessments,
        class_average: round2(aggregate.average),
        disciplines,
        students,
    })
}

pub fn school_statistics(
    conn: &Connection,
    school_id: &str,
) -> Result<SchoolStatistics, CalcError> {
    let Some(school) = load_school(conn, school_id)? else {
        return Err(CalcError::new("not_found", "school not found"));
    };

    let count = |sql: &str| -> Result<i64, CalcError> {
        conn.query_row(sql, [school_id], |r| r.get(0)).map_err(db_err)
    };
    let total_classes = count("SELECT COUNT(*) FROM classes WHERE school_id = ?")?;
    let total_students = count(
        "SELECT COUNT(*) FROM students s
         JOIN classes c ON c.id = s.class_id
         WHERE c.school_id = ?",
    )?;
    let total_teachers = count("SELECT COUNT(*) FROM teachers WHERE school_id = ?")?;
    let total_coordinators = count("SELECT COUNT(*) FROM coordinators WHERE school_id = ?")?;
    let total_disciplines = count(
        "SELECT COUNT(DISTINCT ta.discipline_id)
         FROM teaching_assignments ta
         JOIN classes c ON c.id = ta.class_id
         WHERE c.school_id = ?",
    )?;
    let total_assessments = count(
        "SELECT COUNT(*)
         FROM assessments a
         JOIN teaching_assignments ta ON ta.id = a.assignment_id
         JOIN classes c ON c.id = ta.class_id
         WHERE c.school_id = ?",
    )?;

    let mut stmt = conn
        .prepare(
            "SELECT id, name, grade_level
             FROM classes
             WHERE school_id = ?
             ORDER BY name",
        )
        .map_err(db_err)?;
    let classes: Vec<(String, String, Option<String>)> = stmt
        .query_map([school_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut class_performance = Vec::with_capacity(classes.len());
    let mut graded_class_averages: Vec<f64> = Vec::new();
    let mut by_grade_level: Vec<GradeLevelCount> = Vec::new();
    for (id, name, grade_level) in classes {
        let aggregate = class_aggregate(conn, &id)?;
        // Ungraded classes are excluded from the school mean, not zeroed.
        if aggregate.grade_count > 0 {
            graded_class_averages.push(aggregate.average);
        }

        let level = grade_level
            .clone()
            .unwrap_or_else(|| "unspecified".to_string());
        match by_grade_level.iter_mut().find(|g| g.grade_level == level) {
            Some(entry) => entry.count += 1,
            None => by_grade_level.push(GradeLevelCount {
                grade_level: level,
                count: 1,
            }),
        }

        class_performance.push(ClassPerformance {
            id,
            name,
            grade_level,
            average: round2(aggregate.average),
            total_students: aggregate.student_count,
            total_grades: aggregate.grade_count,
        });
    }

    let school_average = if graded_class_averages.is_empty() {
        0.0
    } else {
        round2(graded_class_averages.iter().sum::<f64>() / graded_class_averages.len() as f64)
    };

    Ok(SchoolStatistics {
        school,
        total_classes,
        total_students,
        total_teachers,
        total_coordinators,
        total_disciplines,
        total_assessments,
        school_average,
        classes_by_grade_level: by_grade_level,
        class_performance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round2_is_half_up() {
        assert_eq!(round2(0.0), 0.0);
        assert_eq!(round2(1.0 / 3.0), 0.33);
        assert_eq!(round2(2.0 / 3.0), 0.67);
        // 0.125 is exact in binary; the half rounds up, not to even.
        assert_eq!(round2(0.125), 0.13);
        assert_eq!(round2(7.0), 7.0);
    }

    #[test]
    fn weighted_mean_matches_boletim_scenario() {
        // grades {w=2.0: 8.0, w=1.0: 5.0} => (16 + 5) / 3 = 7.0
        let mut mean = WeightedMean::default();
        mean.push(8.0, 2.0);
        mean.push(5.0, 1.0);
        assert_eq!(round2(mean.average()), 7.0);
        assert_eq!(mean.count(), 2);
        assert_eq!(
            classify(mean.average(), mean.count(), 6.0),
            Standing::Approved
        );
    }

    #[test]
    fn weighted_mean_invariant_under_weight_scaling() {
        let mut a = WeightedMean::default();
        a.push(8.0, 2.0);
        a.push(5.0, 1.0);
        let mut b = WeightedMean::default();
        b.push(8.0, 4.0);
        b.push(5.0, 2.0);
        assert!((a.average() - b.average()).abs() < 1e-12);
    }

    #[test]
    fn empty_record_averages_to_zero_and_stays_in_progress() {
        let mean = WeightedMean::default();
        assert_eq!(mean.average(), 0.0);
        assert_eq!(mean.count(), 0);
        assert_eq!(classify(mean.average(), 0, 6.0), Standing::InProgress);
    }

    #[test]
    fn classify_uses_threshold_inclusively() {
        assert_eq!(classify(6.0, 3, 6.0), Standing::Approved);
        assert_eq!(classify(5.99, 3, 6.0), Standing::Failing);
        assert_eq!(classify(0.0, 1, 6.0), Standing::Failing);
    }
}
