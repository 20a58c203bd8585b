use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_workspace(tag: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("carnetd-{}-{}-{}", tag, std::process::id(), nanos))
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_carnetd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn carnetd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

struct Seed {
    year_id: String,
    next_year_id: String,
    teacher_id: String,
    supervisor_id: String,
    assignment_id: String,
}

fn seed_school(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    tag: &str,
    with_next_year: bool,
) -> Seed {
    let ws = temp_workspace(tag);
    request_ok(
        stdin,
        reader,
        "s0",
        "workspace.select",
        json!({ "path": ws.to_string_lossy() }),
    );
    let year = request_ok(
        stdin,
        reader,
        "s1",
        "setup.schoolYear",
        json!({
            "name": "2025-2026", "sequence": 1,
            "startsOn": "2025-09-01", "endsOn": "2026-07-04", "active": true,
        }),
    );
    let year_id = year["schoolYearId"].as_str().unwrap().to_string();
    let next_year_id = if with_next_year {
        let next = request_ok(
            stdin,
            reader,
            "s2",
            "setup.schoolYear",
            json!({
                "name": "2026-2027", "sequence": 2,
                "startsOn": "2026-09-01", "endsOn": "2027-07-03",
            }),
        );
        next["schoolYearId"].as_str().unwrap().to_string()
    } else {
        String::new()
    };
    let teacher = request_ok(
        stdin,
        reader,
        "s3",
        "setup.actor",
        json!({ "displayName": "Mme Garnier", "role": "teacher" }),
    );
    let teacher_id = teacher["actorId"].as_str().unwrap().to_string();
    let supervisor = request_ok(
        stdin,
        reader,
        "s4",
        "setup.actor",
        json!({ "displayName": "M. Diallo", "role": "supervisor" }),
    );
    let supervisor_id = supervisor["actorId"].as_str().unwrap().to_string();
    request_ok(
        stdin,
        reader,
        "s5",
        "setup.supervision",
        json!({ "supervisorId": supervisor_id, "teacherId": teacher_id }),
    );
    let class = request_ok(
        stdin,
        reader,
        "s6",
        "setup.class",
        json!({
            "schoolYearId": year_id, "name": "PS A", "level": "PS",
            "teacherIds": [teacher_id],
        }),
    );
    let student = request_ok(
        stdin,
        reader,
        "s7",
        "setup.student",
        json!({ "lastName": "Moreau", "firstName": "Lina" }),
    );
    request_ok(
        stdin,
        reader,
        "s8",
        "setup.enrollment",
        json!({ "studentId": student["studentId"], "classId": class["classId"] }),
    );
    let template = request_ok(
        stdin,
        reader,
        "s9",
        "setup.template",
        json!({
            "name": "Carnet PS",
            "fields": [{ "key": "text:remarks", "kind": "free_text" }],
        }),
    );
    let assignment = request_ok(
        stdin,
        reader,
        "s10",
        "assignments.create",
        json!({
            "templateId": template["templateId"],
            "studentId": student["studentId"],
            "teacherIds": [teacher_id],
        }),
    );
    Seed {
        year_id,
        next_year_id,
        teacher_id,
        supervisor_id,
        assignment_id: assignment["assignmentId"].as_str().unwrap().to_string(),
    }
}

/// Walks the assignment to fully completed and signs end-of-year as the
/// supervisor, the precondition every promotion needs.
fn sign_end_of_year(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, seed: &Seed) {
    request_ok(
        stdin,
        reader,
        "w1",
        "assignments.setStatus",
        json!({
            "assignmentId": seed.assignment_id,
            "actorId": seed.teacher_id,
            "status": "in_progress",
        }),
    );
    for semester in [1, 2] {
        request_ok(
            stdin,
            reader,
            &format!("w-sem{}", semester),
            "assignments.completeSemester",
            json!({
                "assignmentId": seed.assignment_id,
                "actorId": seed.teacher_id,
                "semester": semester,
            }),
        );
    }
    request_ok(
        stdin,
        reader,
        "w-sign",
        "assignments.sign",
        json!({
            "assignmentId": seed.assignment_id,
            "actorId": seed.supervisor_id,
            "type": "end_of_year",
        }),
    );
}

#[test]
fn promote_moves_the_student_but_not_the_assignment_year() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seed = seed_school(&mut stdin, &mut reader, "promote-ok", true);
    sign_end_of_year(&mut stdin, &mut reader, &seed);

    let outcome = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "assignments.promote",
        json!({
            "assignmentId": seed.assignment_id,
            "actorId": seed.supervisor_id,
            "nextLevel": "MS",
        }),
    );
    assert_eq!(outcome["fromLevel"], "PS");
    assert_eq!(outcome["toLevel"], "MS");
    assert_eq!(outcome["nextSchoolYearId"], seed.next_year_id);
    assert!(outcome["snapshotId"].as_str().is_some());
    assert!(outcome["nextEnrollmentId"].as_str().is_some());

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "assignments.get",
        json!({ "assignmentId": seed.assignment_id }),
    );
    // The assignment stays on the current year until the explicit rollover.
    assert_eq!(got["assignment"]["schoolYearId"], seed.year_id);
    let promotions = got["assignment"]["data"]["promotions"].as_array().unwrap();
    assert_eq!(promotions.len(), 1);
    assert_eq!(promotions[0]["toLevel"], "MS");
    assert_eq!(promotions[0]["promotedBy"], seed.supervisor_id);
    let actions: Vec<&str> = got["changeLog"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["action"].as_str().unwrap())
        .collect();
    assert!(actions.contains(&"promote"));
}

#[test]
fn promote_twice_in_the_same_year_is_rejected() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seed = seed_school(&mut stdin, &mut reader, "promote-twice", true);
    sign_end_of_year(&mut stdin, &mut reader, &seed);

    let params = json!({
        "assignmentId": seed.assignment_id,
        "actorId": seed.supervisor_id,
        "nextLevel": "MS",
    });
    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "assignments.promote",
        params.clone(),
    );
    let resp = request(&mut stdin, &mut reader, "2", "assignments.promote", params);
    assert_eq!(resp["ok"], json!(false));
    assert_eq!(resp["error"]["code"], "already_promoted");
}

#[test]
fn promote_requires_the_actors_own_end_of_year_signature() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seed = seed_school(&mut stdin, &mut reader, "promote-signer", true);
    sign_end_of_year(&mut stdin, &mut reader, &seed);

    // The teacher is authorized on the assignment but did not sign.
    let resp = request(
        &mut stdin,
        &mut reader,
        "1",
        "assignments.promote",
        json!({
            "assignmentId": seed.assignment_id,
            "actorId": seed.teacher_id,
            "nextLevel": "MS",
        }),
    );
    assert_eq!(resp["ok"], json!(false));
    assert_eq!(resp["error"]["code"], "not_signed_by_you");
}

#[test]
fn promote_with_no_configured_next_year_fails_cleanly() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seed = seed_school(&mut stdin, &mut reader, "promote-noyear", false);
    sign_end_of_year(&mut stdin, &mut reader, &seed);

    let resp = request(
        &mut stdin,
        &mut reader,
        "1",
        "assignments.promote",
        json!({
            "assignmentId": seed.assignment_id,
            "actorId": seed.supervisor_id,
            "nextLevel": "MS",
        }),
    );
    assert_eq!(resp["ok"], json!(false));
    assert_eq!(resp["error"]["code"], "no_next_year");

    // Nothing landed.
    let got = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "assignments.get",
        json!({ "assignmentId": seed.assignment_id }),
    );
    assert!(got["assignment"]["data"].get("promotions").is_none());
}
