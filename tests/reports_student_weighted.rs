mod test_support;

use serde_json::json;
use test_support::{admin, request_ok, spawn_sidecar, temp_dir};

fn seed_class(
    stdin: &mut std::process::ChildStdin,
    reader: &mut std::io::BufReader<std::process::ChildStdout>,
    workspace: &std::path::Path,
) -> (String, String, String, serde_json::Value) {
    let _ = request_ok(
        stdin,
        reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school = request_ok(
        stdin,
        reader,
        "s2",
        "schools.create",
        json!({ "identity": admin(), "name": "Escola Modelo" }),
    )["schoolId"]
        .as_str()
        .expect("schoolId")
        .to_string();
    let teacher_id = request_ok(
        stdin,
        reader,
        "s3",
        "teachers.create",
        json!({ "identity": admin(), "schoolId": school, "name": "Prof. Nunes" }),
    )["teacherId"]
        .as_str()
        .expect("teacherId")
        .to_string();
    let discipline = request_ok(
        stdin,
        reader,
        "s4",
        "disciplines.create",
        json!({ "identity": admin(), "name": "Português" }),
    )["disciplineId"]
        .as_str()
        .expect("disciplineId")
        .to_string();
    let class = request_ok(
        stdin,
        reader,
        "s5",
        "classes.create",
        json!({ "identity": admin(), "schoolId": school, "name": "7C", "academicYear": 2026 }),
    )["classId"]
        .as_str()
        .expect("classId")
        .to_string();
    let assignment = request_ok(
        stdin,
        reader,
        "s6",
        "assignments.create",
        json!({
            "identity": admin(),
            "classId": class,
            "teacherId": teacher_id,
            "disciplineId": discipline
        }),
    )["assignmentId"]
        .as_str()
        .expect("assignmentId")
        .to_string();
    let teacher = json!({ "userId": "u-t", "role": "TEACHER", "teacherId": teacher_id });
    (school, class, assignment, teacher)
}

fn create_term(
    stdin: &mut std::process::ChildStdin,
    reader: &mut std::io::BufReader<std::process::ChildStdout>,
    id: &str,
    label: &str,
    starts_on: &str,
    ends_on: &str,
) -> String {
    request_ok(
        stdin,
        reader,
        id,
        "terms.create",
        json!({
            "identity": admin(),
            "academicYear": 2026,
            "label": label,
            "startsOn": starts_on,
            "endsOn": ends_on
        }),
    )["termId"]
        .as_str()
        .expect("termId")
        .to_string()
}

#[test]
fn weighted_average_threshold_and_in_progress() {
    let workspace = temp_dir("sigead-report-student");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (school, class, assignment, teacher) = seed_class(&mut stdin, &mut reader, &workspace);
    let term = create_term(&mut stdin, &mut reader, "t1", "1º Bimestre", "2026-02-01", "2026-04-10");

    let ana = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.create",
        json!({ "identity": admin(), "classId": class, "name": "Ana", "enrollmentNo": "2026-001" }),
    )["studentId"]
        .as_str()
        .expect("studentId")
        .to_string();
    let bruno = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "identity": admin(), "classId": class, "name": "Bruno", "enrollmentNo": "2026-002" }),
    )["studentId"]
        .as_str()
        .expect("studentId")
        .to_string();

    let prova = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "assessments.create",
        json!({
            "identity": &teacher,
            "assignmentId": assignment,
            "termId": term,
            "title": "Prova",
            "weight": 2.0,
            "appliedOn": "2026-03-01"
        }),
    )["assessmentId"]
        .as_str()
        .expect("assessmentId")
        .to_string();
    let trabalho = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "assessments.create",
        json!({
            "identity": &teacher,
            "assignmentId": assignment,
            "termId": term,
            "title": "Trabalho",
            "weight": 1.0,
            "appliedOn": "2026-03-15"
        }),
    )["assessmentId"]
        .as_str()
        .expect("assessmentId")
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grades.create",
        json!({ "identity": &teacher, "assessmentId": prova, "studentId": ana, "value": 8.0 }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "grades.create",
        json!({ "identity": &teacher, "assessmentId": trabalho, "studentId": ana, "value": 5.0 }),
    );

    // (8*2 + 5*1) / 3 = 7.0, above the 6.0 default.
    let report = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "reports.student",
        json!({ "identity": admin(), "studentId": ana }),
    );
    assert_eq!(report["average"].as_f64(), Some(7.0));
    assert_eq!(report["standing"].as_str(), Some("approved"));
    assert_eq!(report["totalAssessments"].as_u64(), Some(2));

    // A stricter per-school rule flips the same average to failing.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "rules.set",
        json!({
            "identity": admin(),
            "schoolId": school,
            "academicYear": 2026,
            "minimumAverage": 7.5
        }),
    );
    let report = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "reports.student",
        json!({ "identity": admin(), "studentId": ana }),
    );
    assert_eq!(report["average"].as_f64(), Some(7.0));
    assert_eq!(report["standing"].as_str(), Some("failing"));

    // No grades yet: in progress with a zero average, never failing.
    let report = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "reports.student",
        json!({ "identity": admin(), "studentId": bruno }),
    );
    assert_eq!(report["average"].as_f64(), Some(0.0));
    assert_eq!(report["standing"].as_str(), Some("inProgress"));
    assert_eq!(report["totalAssessments"].as_u64(), Some(0));
}

#[test]
fn report_lines_follow_term_then_application_order() {
    let workspace = temp_dir("sigead-report-order");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let (_school, class, assignment, teacher) = seed_class(&mut stdin, &mut reader, &workspace);

    let term1 = create_term(&mut stdin, &mut reader, "t1", "1º Bimestre", "2026-02-01", "2026-04-10");
    let term2 = create_term(&mut stdin, &mut reader, "t2", "2º Bimestre", "2026-04-20", "2026-06-30");

    let ana = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "students.create",
        json!({ "identity": admin(), "classId": class, "name": "Ana", "enrollmentNo": "2026-001" }),
    )["studentId"]
        .as_str()
        .expect("studentId")
        .to_string();

    // Created out of order on purpose.
    for (i, (term, title, applied)) in [
        (&term2, "Prova T2", "2026-05-10"),
        (&term1, "Prova T1 tarde", "2026-03-20"),
        (&term1, "Prova T1 cedo", "2026-02-15"),
    ]
    .iter()
    .enumerate()
    {
        let assessment = request_ok(
            &mut stdin,
            &mut reader,
            &format!("a{}", i),
            "assessments.create",
            json!({
                "identity": &teacher,
                "assignmentId": assignment,
                "termId": term,
                "title": title,
                "weight": 1.0,
                "appliedOn": applied
            }),
        )["assessmentId"]
            .as_str()
            .expect("assessmentId")
            .to_string();
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("g{}", i),
            "grades.create",
            json!({ "identity": &teacher, "assessmentId": assessment, "studentId": ana, "value": 6.0 }),
        );
    }

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "r",
        "reports.student",
        json!({ "identity": admin(), "studentId": ana }),
    );
    let titles: Vec<&str> = report["grades"]
        .as_array()
        .expect("grades")
        .iter()
        .map(|g| g["assessment"].as_str().expect("assessment"))
        .collect();
    assert_eq!(titles, vec!["Prova T1 cedo", "Prova T1 tarde", "Prova T2"]);

    // The flat listing follows the same chronological order.
    let listing = request_ok(
        &mut stdin,
        &mut reader,
        "l",
        "grades.listByStudent",
        json!({ "identity": admin(), "studentId": ana }),
    );
    let titles: Vec<&str> = listing["grades"]
        .as_array()
        .expect("grades")
        .iter()
        .map(|g| g["assessmentTitle"].as_str().expect("assessmentTitle"))
        .collect();
    assert_eq!(titles, vec!["Prova T1 cedo", "Prova T1 tarde", "Prova T2"]);
}
