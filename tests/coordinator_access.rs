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

fn sign_in(sc: &mut Sidecar, email: &str) {
    sc.ok("auth.signIn", json!({ "email": email, "password": "secret1" }));
}

fn sign_up(sc: &mut Sidecar, email: &str, name: &str) -> String {
    let res = sc.ok(
        "auth.signUp",
        json!({ "email": email, "password": "secret1", "fullName": name }),
    );
    res["teacherId"].as_str().expect("teacher id").to_string()
}

#[test]
fn coordinators_read_everything_but_only_owners_and_admins_write() {
    let workspace = temp_dir("campus-coordinator-access");
    let mut sc = Sidecar::spawn(&workspace);
    sign_up(&mut sc, "admin@campus.test", "Admin");
    sign_up(&mut sc, "tere@campus.test", "Teresa Lopez");
    let coord_id = sign_up(&mut sc, "coord@campus.test", "Carlos Coord");

    sign_in(&mut sc, "tere@campus.test");
    let mut group_ids = Vec::new();
    for name in ["G1", "G2", "G3", "G4", "G5", "G6"] {
        group_ids.push(sc.create_group(name));
    }
    let student = sc.ok(
        "students.create",
        json!({ "groupId": group_ids[0], "fullName": "Ana Sol", "email": "a@x.es", "nationalId": "1" }),
    );
    let student_id = student["student"]["id"].as_str().expect("id").to_string();
    sc.ok(
        "attendance.save",
        json!({ "groupId": group_ids[0], "date": "2024-10-07", "records": [{ "studentId": student_id, "present": true }] }),
    );
    let denied = sc.call("coordinator.overview", json!({}));
    assert_eq!(denied["error"]["code"], json!("forbidden"));

    sign_in(&mut sc, "admin@campus.test");
    sc.ok(
        "teachers.setRole",
        json!({ "teacherId": coord_id, "role": "coordinator" }),
    );

    sign_in(&mut sc, "coord@campus.test");
    let overview = sc.ok("coordinator.overview", json!({}));
    assert_eq!(
        overview["totals"],
        json!({ "teachers": 2, "groups": 6, "students": 1, "attendanceRecords": 1 })
    );
    let tere = overview["teachers"]
        .as_array()
        .expect("teachers")
        .iter()
        .find(|t| t["teacher"]["email"] == json!("tere@campus.test"))
        .expect("tere listed")
        .clone();
    assert_eq!(tere["groupCount"], json!(6));
    assert_eq!(tere["studentCount"], json!(1));
    assert_eq!(tere["attendanceCount"], json!(1));
    let recent: Vec<&str> = overview["recentGroups"]
        .as_array()
        .expect("recentGroups")
        .iter()
        .map(|g| g["name"].as_str().unwrap_or(""))
        .collect();
    assert_eq!(recent, vec!["G6", "G5", "G4", "G3", "G2"]);
    assert_eq!(overview["recentGroups"][0]["teacherName"], json!("Teresa Lopez"));

    let filtered = sc.ok("coordinator.overview", json!({ "search": "TERE" }));
    assert_eq!(filtered["teachers"].as_array().map(|t| t.len()), Some(1));

    let all = sc.ok("groups.list", json!({ "scope": "all" }));
    assert_eq!(all["groups"].as_array().map(|g| g.len()), Some(6));
    let read = sc.ok("students.list", json!({ "groupId": group_ids[0] }));
    assert_eq!(read["students"][0]["fullName"], json!("Ana Sol"));
    sc.ok(
        "attendance.dayOpen",
        json!({ "groupId": group_ids[0], "date": "2024-10-07" }),
    );
    sc.ok("stats.group", json!({ "groupId": group_ids[0] }));

    let write = sc.call(
        "students.create",
        json!({ "groupId": group_ids[0], "fullName": "Nuevo", "email": "n@x.es", "nationalId": "2" }),
    );
    assert_eq!(write["error"]["code"], json!("forbidden"));
    let save = sc.call(
        "attendance.save",
        json!({ "groupId": group_ids[0], "date": "2024-10-08", "records": [] }),
    );
    assert_eq!(save["error"]["code"], json!("forbidden"));
    let dash = sc.call("admin.dashboard", json!({}));
    assert_eq!(dash["error"]["code"], json!("forbidden"));
    let setup = sc.call(
        "setup.update",
        json!({ "section": "birthdays", "patch": { "windowDays": 10 } }),
    );
    assert_eq!(setup["error"]["code"], json!("forbidden"));

    sign_in(&mut sc, "admin@campus.test");
    sc.ok(
        "students.create",
        json!({ "groupId": group_ids[0], "fullName": "Por Admin", "email": "p@x.es", "nationalId": "3" }),
    );
    let dashboard = sc.ok("admin.dashboard", json!({}));
    let emails: Vec<&str> = dashboard["teachers"]
        .as_array()
        .expect("teachers")
        .iter()
        .map(|t| t["email"].as_str().unwrap_or(""))
        .collect();
    assert_eq!(emails, vec!["coord@campus.test", "tere@campus.test"]);
    assert_eq!(dashboard["groups"].as_array().map(|g| g.len()), Some(6));
    assert_eq!(dashboard["students"].as_array().map(|s| s.len()), Some(2));
    assert_eq!(dashboard["attendance"].as_array().map(|a| a.len()), Some(1));

    sc.finish();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn moving_another_teachers_group_follows_the_write_rule() {
    let workspace = temp_dir("campus-coordinator-move");
    let mut sc = Sidecar::spawn(&workspace);
    sign_up(&mut sc, "admin@campus.test", "Admin");
    sign_up(&mut sc, "tere@campus.test", "Teresa Lopez");
    let coord_id = sign_up(&mut sc, "coord@campus.test", "Carlos Coord");

    sign_in(&mut sc, "tere@campus.test");
    sc.create_group("G1");
    let g2 = sc.create_group("G2");

    sign_in(&mut sc, "admin@campus.test");
    sc.ok(
        "teachers.setRole",
        json!({ "teacherId": coord_id, "role": "coordinator" }),
    );

    sign_in(&mut sc, "coord@campus.test");
    let denied = sc.call("groups.move", json!({ "groupId": g2, "direction": "up" }));
    assert_eq!(denied["error"]["code"], json!("forbidden"));

    sign_in(&mut sc, "admin@campus.test");
    let moved = sc.ok("groups.move", json!({ "groupId": g2, "direction": "up" }));
    assert_eq!(moved["moved"], json!(true));
    assert_eq!(moved["groupIds"][0], json!(g2));
    // Two creates plus this move, all on Teresa's order.
    assert_eq!(moved["orderRevision"], json!(3));

    sign_in(&mut sc, "tere@campus.test");
    let own = sc.ok("groups.list", json!({}));
    let names: Vec<&str> = own["groups"]
        .as_array()
        .expect("groups")
        .iter()
        .map(|g| g["name"].as_str().unwrap_or(""))
        .collect();
    assert_eq!(names, vec!["G2", "G1"]);
    assert_eq!(own["orderRevision"], json!(3));

    sc.finish();
    let _ = std::fs::remove_dir_all(workspace);
}
