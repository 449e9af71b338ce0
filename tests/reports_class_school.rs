mod test_support;

use serde_json::json;
use test_support::{admin, request_ok, spawn_sidecar, temp_dir};

#[test]
fn class_average_spans_every_enrolled_student_and_school_average_skips_ungraded_classes() {
    let workspace = temp_dir("sigead-report-class-school");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "schools.create",
        json!({ "identity": admin(), "name": "Escola Sul" }),
    )["schoolId"]
        .as_str()
        .expect("schoolId")
        .to_string();
    let teacher_id = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "teachers.create",
        json!({ "identity": admin(), "schoolId": school, "name": "Prof. Vieira" }),
    )["teacherId"]
        .as_str()
        .expect("teacherId")
        .to_string();
    let discipline = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "disciplines.create",
        json!({ "identity": admin(), "name": "Ciências" }),
    )["disciplineId"]
        .as_str()
        .expect("disciplineId")
        .to_string();

    let graded_class = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "classes.create",
        json!({
            "identity": admin(),
            "schoolId": school,
            "name": "6A",
            "gradeLevel": "6",
            "academicYear": 2026
        }),
    )["classId"]
        .as_str()
        .expect("classId")
        .to_string();
    let empty_class = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "classes.create",
        json!({
            "identity": admin(),
            "schoolId": school,
            "name": "6B",
            "gradeLevel": "6",
            "academicYear": 2026
        }),
    )["classId"]
        .as_str()
        .expect("classId")
        .to_string();

    let ana = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.create",
        json!({ "identity": admin(), "classId": graded_class, "name": "Ana", "enrollmentNo": "1" }),
    )["studentId"]
        .as_str()
        .expect("studentId")
        .to_string();
    let bruno = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.create",
        json!({ "identity": admin(), "classId": graded_class, "name": "Bruno", "enrollmentNo": "2" }),
    )["studentId"]
        .as_str()
        .expect("studentId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "students.create",
        json!({ "identity": admin(), "classId": empty_class, "name": "Clara", "enrollmentNo": "3" }),
    );

    let assignment = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "assignments.create",
        json!({
            "identity": admin(),
            "classId": graded_class,
            "teacherId": teacher_id,
            "disciplineId": discipline
        }),
    )["assignmentId"]
        .as_str()
        .expect("assignmentId")
        .to_string();
    let term = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "terms.create",
        json!({
            "identity": admin(),
            "academicYear": 2026,
            "label": "1º Bimestre",
            "startsOn": "2026-02-01",
            "endsOn": "2026-04-10"
        }),
    )["termId"]
        .as_str()
        .expect("termId")
        .to_string();

    let teacher = json!({ "userId": "u-t", "role": "TEACHER", "teacherId": teacher_id });
    let heavy = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "assessments.create",
        json!({
            "identity": &teacher,
            "assignmentId": assignment,
            "termId": term,
            "title": "Prova pesada",
            "weight": 10.0,
            "appliedOn": "2026-03-01"
        }),
    )["assessmentId"]
        .as_str()
        .expect("assessmentId")
        .to_string();
    let light = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "assessments.create",
        json!({
            "identity": &teacher,
            "assignmentId": assignment,
            "termId": term,
            "title": "Tarefa leve",
            "weight": 1.0,
            "appliedOn": "2026-03-05"
        }),
    )["assessmentId"]
        .as_str()
        .expect("assessmentId")
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "grades.create",
        json!({ "identity": &teacher, "assessmentId": heavy, "studentId": ana, "value": 10.0 }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "g2",
        "grades.create",
        json!({ "identity": &teacher, "assessmentId": light, "studentId": bruno, "value": 0.0 }),
    );

    // Per-student weighted averages first, then an unweighted mean over
    // the two students: (10 + 0) / 2 = 5, not the 9.09 a grade-weighted
    // pool across the class would give.
    let report = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "reports.class",
        json!({ "identity": admin(), "classId": graded_class }),
    );
    assert_eq!(report["classAverage"].as_f64(), Some(5.0));
    assert_eq!(report["totalStudents"].as_u64(), Some(2));
    assert_eq!(report["totalAssessments"].as_u64(), Some(2));
    let students = report["students"].as_array().expect("students");
    assert_eq!(students.len(), 2);
    let standing_of = |name: &str| {
        students
            .iter()
            .find(|s| s["name"].as_str() == Some(name))
            .and_then(|s| s["standing"].as_str())
            .map(|s| s.to_string())
    };
    assert_eq!(standing_of("Ana").as_deref(), Some("approved"));
    assert_eq!(standing_of("Bruno").as_deref(), Some("failing"));
    // The per-discipline figure is the grade-weighted pool, so it does
    // skew towards the heavy assessment: (10*10 + 0*1) / 11.
    let disciplines = report["disciplines"].as_array().expect("disciplines");
    assert_eq!(disciplines.len(), 1);
    assert_eq!(disciplines[0]["average"].as_f64(), Some(9.09));

    // The ungraded class counts in the totals but not in the average.
    let stats = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "reports.school",
        json!({ "identity": admin(), "schoolId": school }),
    );
    assert_eq!(stats["totalClasses"].as_u64(), Some(2));
    assert_eq!(stats["totalStudents"].as_u64(), Some(3));
    assert_eq!(stats["totalTeachers"].as_u64(), Some(1));
    assert_eq!(stats["schoolAverage"].as_f64(), Some(5.0));
    let by_level = stats["classesByGradeLevel"].as_array().expect("grade levels");
    assert_eq!(by_level.len(), 1);
    assert_eq!(by_level[0]["gradeLevel"].as_str(), Some("6"));
    assert_eq!(by_level[0]["count"].as_u64(), Some(2));
    let perf = stats["classPerformance"].as_array().expect("performance");
    assert_eq!(perf.len(), 2);
    let ungraded = perf
        .iter()
        .find(|c| c["name"].as_str() == Some("6B"))
        .expect("6B row");
    assert_eq!(ungraded["totalGrades"].as_u64(), Some(0));
    assert_eq!(ungraded["average"].as_f64(), Some(0.0));
}
