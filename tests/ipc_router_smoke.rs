mod test_support;

use serde_json::json;
use test_support::{admin, error_code, request, request_err, request_ok, spawn_sidecar, temp_dir};

#[test]
fn health_unknown_method_and_workspace_gate() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health.get("version").and_then(|v| v.as_str()).is_some());
    assert!(health["workspacePath"].is_null());

    // Data methods refuse to run before a workspace is selected.
    let e = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "schools.list",
        json!({ "identity": admin() }),
    );
    assert_eq!(error_code(&e), "no_workspace");

    let workspace = temp_dir("sigead-smoke");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let health = request_ok(&mut stdin, &mut reader, "4", "health", json!({}));
    assert_eq!(
        health["workspacePath"].as_str(),
        Some(workspace.to_string_lossy().as_ref())
    );

    let resp = request(&mut stdin, &mut reader, "5", "no.such.method", json!({}));
    assert_eq!(resp["ok"].as_bool(), Some(false));
    assert_eq!(error_code(&resp["error"]), "not_implemented");
}

#[test]
fn validation_conflict_and_precondition_paths() {
    let workspace = temp_dir("sigead-smoke-validation");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let school_a = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "schools.create",
        json!({ "identity": admin(), "name": "Escola A" }),
    )["schoolId"]
        .as_str()
        .expect("schoolId")
        .to_string();
    let school_b = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "schools.create",
        json!({ "identity": admin(), "name": "Escola B" }),
    )["schoolId"]
        .as_str()
        .expect("schoolId")
        .to_string();
    let teacher_b = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "teachers.create",
        json!({ "identity": admin(), "schoolId": school_b, "name": "Prof. Fora" }),
    )["teacherId"]
        .as_str()
        .expect("teacherId")
        .to_string();
    let discipline = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "disciplines.create",
        json!({ "identity": admin(), "name": "Artes" }),
    )["disciplineId"]
        .as_str()
        .expect("disciplineId")
        .to_string();
    let class_a = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "classes.create",
        json!({ "identity": admin(), "schoolId": school_a, "name": "1A", "academicYear": 2026 }),
    )["classId"]
        .as_str()
        .expect("classId")
        .to_string();

    // A teacher from another school cannot be assigned to this class.
    let e = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "assignments.create",
        json!({
            "identity": admin(),
            "classId": class_a,
            "teacherId": teacher_b,
            "disciplineId": discipline
        }),
    );
    assert_eq!(error_code(&e), "precondition_failed");

    // Duplicate discipline names collide.
    let e = request_err(
        &mut stdin,
        &mut reader,
        "8",
        "disciplines.create",
        json!({ "identity": admin(), "name": "Artes" }),
    );
    assert_eq!(error_code(&e), "conflict");

    // Approval rules reject values off the marking scale and upsert
    // silently on the same year.
    let e = request_err(
        &mut stdin,
        &mut reader,
        "9",
        "rules.set",
        json!({
            "identity": admin(),
            "schoolId": school_a,
            "academicYear": 2026,
            "minimumAverage": 10.5
        }),
    );
    assert_eq!(error_code(&e), "bad_params");

    let rule = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "rules.get",
        json!({ "identity": admin(), "schoolId": school_a, "academicYear": 2026 }),
    );
    assert_eq!(rule["minimumAverage"].as_f64(), Some(6.0));
    assert_eq!(rule["isDefault"].as_bool(), Some(true));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "rules.set",
        json!({
            "identity": admin(),
            "schoolId": school_a,
            "academicYear": 2026,
            "minimumAverage": 7.0
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "rules.set",
        json!({
            "identity": admin(),
            "schoolId": school_a,
            "academicYear": 2026,
            "minimumAverage": 6.5
        }),
    );
    let rule = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "rules.get",
        json!({ "identity": admin(), "schoolId": school_a, "academicYear": 2026 }),
    );
    assert_eq!(rule["minimumAverage"].as_f64(), Some(6.5));
    assert_eq!(rule["isDefault"].as_bool(), Some(false));

    // Schools never leak across a coordinator's boundary on lookups.
    let coord_a = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "coordinators.create",
        json!({ "identity": admin(), "schoolId": school_a, "name": "Coord. A" }),
    )["coordinatorId"]
        .as_str()
        .expect("coordinatorId")
        .to_string();
    let e = request_err(
        &mut stdin,
        &mut reader,
        "15",
        "schools.get",
        json!({
            "identity": { "userId": "u-ca", "role": "COORDINATOR", "coordinatorId": coord_a },
            "schoolId": school_b
        }),
    );
    assert_eq!(error_code(&e), "forbidden");
}
