use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    next_id: u64,
}

impl Sidecar {
    fn spawn(workspace: &Path) -> Self {
        let mut child = Command::new(env!("CARGO_BIN_EXE_campusd"))
            .arg("--workspace")
            .arg(workspace)
            .args(["--admin-email", "admin@campus.test"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn campusd");
        let stdin = child.stdin.take().expect("child stdin");
        let stdout = child.stdout.take().expect("child stdout");
        Sidecar {
            child,
            stdin,
            reader: BufReader::new(stdout),
            next_id: 0,
        }
    }

    fn call(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let payload = json!({ "id": id, "method": method, "params": params });
        writeln!(self.stdin, "{}", payload).expect("write request");
        self.stdin.flush().expect("flush request");
        let mut line = String::new();
        self.reader.read_line(&mut line).expect("read response line");
        let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
        assert_eq!(value["id"], json!(id));
        value
    }

    fn ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let resp = self.call(method, params);
        assert_eq!(resp["ok"], json!(true), "{} failed: {}", method, resp);
        resp["result"].clone()
    }

    fn sign_up_and_in(&mut self, email: &str, name: &str) {
        self.ok(
            "auth.signUp",
            json!({ "email": email, "password": "secret1", "fullName": name }),
        );
        self.ok("auth.signIn", json!({ "email": email, "password": "secret1" }));
    }

    fn create_group(&mut self, name: &str) -> String {
        let res = self.ok(
            "groups.create",
            json!({ "name": name, "place": "Sala 1", "scheduleDate": "2024-09-16" }),
        );
        res["group"]["id"].as_str().expect("group id").to_string()
    }

    fn finish(mut self) {
        drop(self.stdin);
        let _ = self.child.wait();
    }
}

fn add_student(sc: &mut Sidecar, group_id: &str, name: &str, national_id: &str) -> String {
    let res = sc.ok(
        "students.create",
        json!({
            "groupId": group_id,
            "fullName": name,
            "email": format!("{}@x.es", national_id),
            "nationalId": national_id
        }),
    );
    res["student"]["id"].as_str().expect("student id").to_string()
}

#[test]
fn saving_a_day_replaces_it_and_defaults_missing_students_to_absent() {
    let workspace = temp_dir("campus-attendance-save");
    let mut sc = Sidecar::spawn(&workspace);
    sc.sign_up_and_in("t@campus.test", "Tania");
    let group = sc.create_group("Robotica");
    let ana = add_student(&mut sc, &group, "Ana Sol", "1");
    let bruno = add_student(&mut sc, &group, "Bruno Diaz", "2");

    let fresh = sc.ok(
        "attendance.dayOpen",
        json!({ "groupId": group, "date": "2024-10-07" }),
    );
    assert_eq!(fresh["existing"], json!(false));
    assert_eq!(fresh["presentCount"], json!(0));
    assert_eq!(fresh["totalCount"], json!(2));
    assert_eq!(fresh["rows"][0]["present"], json!(false));
    assert_eq!(fresh["rows"][0]["notes"], json!(""));

    let saved = sc.ok(
        "attendance.save",
        json!({
            "groupId": group,
            "date": "2024-10-07",
            "records": [{ "studentId": ana, "present": true, "notes": "llego tarde" }]
        }),
    );
    assert_eq!(saved["saved"], json!(2));
    assert_eq!(saved["presentCount"], json!(1));

    let opened = sc.ok(
        "attendance.dayOpen",
        json!({ "groupId": group, "date": "2024-10-07" }),
    );
    assert_eq!(opened["existing"], json!(true));
    assert_eq!(opened["presentCount"], json!(1));
    let rows = opened["rows"].as_array().expect("rows");
    let ana_row = rows.iter().find(|r| r["studentId"] == json!(ana)).expect("ana");
    assert_eq!(ana_row["present"], json!(true));
    assert_eq!(ana_row["notes"], json!("llego tarde"));
    let bruno_row = rows.iter().find(|r| r["studentId"] == json!(bruno)).expect("bruno");
    assert_eq!(bruno_row["present"], json!(false));

    sc.ok(
        "attendance.save",
        json!({
            "groupId": group,
            "date": "2024-10-07",
            "records": [
                { "studentId": ana, "present": false, "notes": "   " },
                { "studentId": bruno, "present": true }
            ]
        }),
    );
    let history = sc.ok("attendance.history", json!({ "groupId": group }));
    assert_eq!(
        history["days"],
        json!([{ "date": "2024-10-07", "present": 1, "absent": 1, "total": 2 }])
    );

    let conn = rusqlite::Connection::open(workspace.join("campus.sqlite3")).expect("open db");
    let (rows, null_notes): (i64, i64) = conn
        .query_row(
            "SELECT COUNT(*), SUM(CASE WHEN notes IS NULL THEN 1 ELSE 0 END) FROM attendance",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .expect("count attendance");
    assert_eq!(rows, 2);
    assert_eq!(null_notes, 2);
    drop(conn);

    sc.finish();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn save_rejects_outsiders_and_bad_dates_without_writing() {
    let workspace = temp_dir("campus-attendance-reject");
    let mut sc = Sidecar::spawn(&workspace);
    sc.sign_up_and_in("t@campus.test", "Tania");
    let g1 = sc.create_group("Robotica");
    let g2 = sc.create_group("Pintura");
    let inside = add_student(&mut sc, &g1, "Ana Sol", "1");
    let outside = add_student(&mut sc, &g2, "Otro Grupo", "2");

    let outsider = sc.call(
        "attendance.save",
        json!({
            "groupId": g1,
            "date": "2024-10-08",
            "records": [
                { "studentId": inside, "present": true },
                { "studentId": outside, "present": true }
            ]
        }),
    );
    assert_eq!(outsider["error"]["code"], json!("bad_params"));
    assert_eq!(outsider["error"]["details"]["studentId"], json!(outside));

    let bad_date = sc.call(
        "attendance.save",
        json!({ "groupId": g1, "date": "08/10/2024", "records": [] }),
    );
    assert_eq!(bad_date["error"]["code"], json!("bad_params"));

    let history = sc.ok("attendance.history", json!({ "groupId": g1 }));
    assert_eq!(history["days"], json!([]));

    sc.finish();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn history_is_newest_first_and_calendar_groups_by_day() {
    let workspace = temp_dir("campus-attendance-calendar");
    let mut sc = Sidecar::spawn(&workspace);
    sc.sign_up_and_in("t@campus.test", "Tania");
    let g1 = sc.create_group("Robotica");
    let g2 = sc.create_group("Pintura");
    let a = add_student(&mut sc, &g1, "Ana Sol", "1");
    let b = add_student(&mut sc, &g2, "Bea Luz", "2");

    for date in ["2024-10-01", "2024-10-15", "2024-11-02"] {
        sc.ok(
            "attendance.save",
            json!({ "groupId": g1, "date": date, "records": [{ "studentId": a, "present": true }] }),
        );
    }
    sc.ok(
        "attendance.save",
        json!({ "groupId": g2, "date": "2024-10-15", "records": [{ "studentId": b, "present": false }] }),
    );

    let history = sc.ok("attendance.history", json!({ "groupId": g1 }));
    let dates: Vec<&str> = history["days"]
        .as_array()
        .expect("days")
        .iter()
        .map(|d| d["date"].as_str().unwrap_or(""))
        .collect();
    assert_eq!(dates, vec!["2024-11-02", "2024-10-15", "2024-10-01"]);

    let cal = sc.ok("attendance.calendar", json!({ "month": "2024-10" }));
    assert_eq!(cal["month"], json!("2024-10"));
    let days = cal["days"].as_array().expect("days");
    assert_eq!(days.len(), 2);
    assert_eq!(days[0]["date"], json!("2024-10-01"));
    assert_eq!(days[1]["date"], json!("2024-10-15"));
    let groups = days[1]["groups"].as_array().expect("groups");
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0]["groupName"], json!("Robotica"));
    assert_eq!(groups[0]["present"], json!(1));
    assert_eq!(groups[1]["groupName"], json!("Pintura"));
    assert_eq!(groups[1]["present"], json!(0));
    assert_eq!(groups[1]["total"], json!(1));

    let bad = sc.call("attendance.calendar", json!({ "month": "2024-13" }));
    assert_eq!(bad["error"]["code"], json!("bad_params"));

    sc.finish();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn attendance_sheet_is_a_date_matrix_with_totals() {
    let workspace = temp_dir("campus-attendance-sheet");
    let mut sc = Sidecar::spawn(&workspace);
    sc.sign_up_and_in("t@campus.test", "Tania");
    let group = sc.create_group("Robotica");
    let empty = sc.create_group("Vacio");

    let nothing = sc.call("export.attendanceSheet", json!({ "groupId": empty }));
    assert_eq!(nothing["error"]["code"], json!("nothing_to_export"));

    let ana = add_student(&mut sc, &group, "Ana Sol", "1");
    let bruno = add_student(&mut sc, &group, "Bruno Diaz", "2");
    sc.ok(
        "attendance.save",
        json!({
            "groupId": group,
            "date": "2024-10-01",
            "records": [{ "studentId": ana, "present": true }, { "studentId": bruno, "present": false }]
        }),
    );
    let carla = add_student(&mut sc, &group, "Carla Ruiz", "3");
    sc.ok(
        "attendance.save",
        json!({
            "groupId": group,
            "date": "2024-10-15",
            "records": [
                { "studentId": ana, "present": true },
                { "studentId": bruno, "present": true },
                { "studentId": carla, "present": false }
            ]
        }),
    );

    let out = workspace.join("sheet.csv");
    let sheet = sc.ok(
        "export.attendanceSheet",
        json!({ "groupId": group, "outPath": out.to_string_lossy() }),
    );
    let expected = "Nombre Completo,1/10/2024,15/10/2024,Presentes,Ausentes,%\n\
                    Ana Sol,P,P,2,0,100\n\
                    Bruno Diaz,A,P,1,1,50\n\
                    Carla Ruiz,,A,0,1,0";
    assert_eq!(sheet["csv"], json!(expected));
    assert_eq!(sheet["rowsExported"], json!(3));
    assert_eq!(sheet["dates"], json!(["2024-10-01", "2024-10-15"]));
    assert!(sheet["fileName"]
        .as_str()
        .is_some_and(|n| n.starts_with("asistencia_Robotica_") && n.ends_with(".csv")));
    assert_eq!(std::fs::read_to_string(&out).expect("read sheet"), expected);

    let ranged = sc.ok(
        "export.attendanceSheet",
        json!({ "groupId": group, "from": "2024-10-10", "to": "2024-10-31" }),
    );
    assert_eq!(ranged["dates"], json!(["2024-10-15"]));
    assert!(ranged["csv"]
        .as_str()
        .is_some_and(|csv| csv.lines().nth(1) == Some("Ana Sol,P,1,0,100")));

    let backwards = sc.call(
        "export.attendanceSheet",
        json!({ "groupId": group, "from": "2024-10-31", "to": "2024-10-01" }),
    );
    assert_eq!(backwards["error"]["code"], json!("bad_params"));

    sc.finish();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn resaving_a_day_keeps_marks_of_students_who_moved_away() {
    let workspace = temp_dir("campus-attendance-moved");
    let mut sc = Sidecar::spawn(&workspace);
    sc.sign_up_and_in("t@campus.test", "Tania");
    let group_a = sc.create_group("Robotica");
    let group_b = sc.create_group("Pintura");
    let s1 = add_student(&mut sc, &group_a, "Ana Sol", "1");
    let s2 = add_student(&mut sc, &group_a, "Bruno Diaz", "2");
    sc.ok(
        "attendance.save",
        json!({
            "groupId": group_a,
            "date": "2024-10-07",
            "records": [{ "studentId": s1, "present": true }, { "studentId": s2, "present": true }]
        }),
    );

    let moved = sc.ok(
        "students.move",
        json!({ "studentId": s1, "targetGroupId": group_b }),
    );
    assert_eq!(moved["moved"], json!(true));

    sc.ok(
        "attendance.save",
        json!({
            "groupId": group_a,
            "date": "2024-10-07",
            "records": [{ "studentId": s2, "present": true }]
        }),
    );
    let history = sc.ok("attendance.history", json!({ "groupId": group_a }));
    assert_eq!(
        history["days"],
        json!([{ "date": "2024-10-07", "present": 2, "absent": 0, "total": 2 }])
    );

    sc.finish();
    let _ = std::fs::remove_dir_all(workspace);
}
