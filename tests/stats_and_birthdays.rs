use chrono::{Datelike, Duration, Local, NaiveDate};
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

fn add_student(sc: &mut Sidecar, group_id: &str, name: &str, national_id: &str, birth: Option<NaiveDate>) -> String {
    let res = sc.ok(
        "students.create",
        json!({
            "groupId": group_id,
            "fullName": name,
            "email": format!("{}@x.es", national_id),
            "nationalId": national_id,
            "birthDate": birth.map(|d| d.format("%Y-%m-%d").to_string())
        }),
    );
    res["student"]["id"].as_str().expect("student id").to_string()
}

fn years_back(d: NaiveDate, years: i32) -> NaiveDate {
    d.with_year(d.year() - years).expect("same day exists in a leap-aligned year")
}

#[test]
fn group_stats_compute_percentages_bands_and_ranking() {
    let workspace = temp_dir("campus-stats-group");
    let mut sc = Sidecar::spawn(&workspace);
    sc.sign_up_and_in("admin@campus.test", "Admin");
    let group = sc.create_group("Robotica");
    let ana = add_student(&mut sc, &group, "Ana Sol", "1", None);
    let bruno = add_student(&mut sc, &group, "Bruno Diaz Prado", "2", None);
    let carla = add_student(&mut sc, &group, "Carla Ros", "3", None);

    let days = [
        ("2024-09-30", [true, true, false]),
        ("2024-10-01", [true, false, true]),
        ("2024-10-02", [true, true, false]),
    ];
    for (date, marks) in days {
        sc.ok(
            "attendance.save",
            json!({
                "groupId": group,
                "date": date,
                "records": [
                    { "studentId": ana, "present": marks[0] },
                    { "studentId": bruno, "present": marks[1] },
                    { "studentId": carla, "present": marks[2] }
                ]
            }),
        );
    }
    add_student(&mut sc, &group, "Dani Mar", "4", None);

    let stats = sc.ok("stats.group", json!({ "groupId": group }));
    let students = stats["students"].as_array().expect("students");
    let summary: Vec<(String, i64, i64, String)> = students
        .iter()
        .map(|s| {
            (
                s["fullName"].as_str().unwrap_or("").to_string(),
                s["totalClasses"].as_i64().unwrap_or(-1),
                s["percentage"].as_i64().unwrap_or(-1),
                s["band"].as_str().unwrap_or("").to_string(),
            )
        })
        .collect();
    assert_eq!(
        summary,
        vec![
            ("Ana Sol".to_string(), 3, 100, "good".to_string()),
            ("Bruno Diaz Prado".to_string(), 3, 67, "warning".to_string()),
            ("Carla Ros".to_string(), 3, 33, "critical".to_string()),
            ("Dani Mar".to_string(), 0, 0, "critical".to_string()),
        ]
    );
    assert_eq!(stats["group"]["totalStudents"], json!(4));
    assert_eq!(stats["group"]["averagePercentage"], json!(50));
    assert_eq!(stats["totals"], json!({ "present": 7, "absent": 3 }));
    assert_eq!(
        stats["monthly"],
        json!([
            { "month": "09/2024", "present": 2, "absent": 1 },
            { "month": "10/2024", "present": 4, "absent": 2 }
        ])
    );
    assert_eq!(
        stats["absenceRanking"],
        json!([
            { "name": "Carla", "absences": 2, "percentage": 67 },
            { "name": "Bruno", "absences": 1, "percentage": 33 },
            { "name": "Ana", "absences": 0, "percentage": 0 }
        ])
    );

    sc.ok(
        "setup.update",
        json!({ "section": "statistics", "patch": { "goodThreshold": 60, "warningThreshold": 30 } }),
    );
    let relaxed = sc.ok("stats.group", json!({ "groupId": group }));
    assert_eq!(relaxed["students"][1]["band"], json!("good"));
    assert_eq!(relaxed["students"][2]["band"], json!("warning"));

    sc.finish();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn birthdays_split_today_and_upcoming_within_the_window() {
    let workspace = temp_dir("campus-birthdays");
    let mut sc = Sidecar::spawn(&workspace);
    sc.sign_up_and_in("admin@campus.test", "Admin");
    let g1 = sc.create_group("Robotica");
    let g2 = sc.create_group("Pintura");

    let today = Local::now().date_naive();
    add_student(&mut sc, &g1, "Hoy Cumple", "1", Some(years_back(today, 24)));
    add_student(&mut sc, &g1, "Pronto Cumple", "2", Some(years_back(today + Duration::days(5), 12)));
    add_student(&mut sc, &g1, "Sin Fecha", "3", None);
    add_student(&mut sc, &g2, "Lejos Cumple", "4", Some(years_back(today + Duration::days(40), 12)));

    let res = sc.ok("birthdays.list", json!({}));
    assert_eq!(res["windowDays"], json!(30));
    let today_list = res["today"].as_array().expect("today");
    assert_eq!(today_list.len(), 1);
    assert_eq!(today_list[0]["fullName"], json!("Hoy Cumple"));
    assert_eq!(today_list[0]["daysUntil"], json!(0));
    assert_eq!(today_list[0]["turningAge"], json!(24));
    assert_eq!(today_list[0]["groupName"], json!("Robotica"));
    let upcoming = res["upcoming"].as_array().expect("upcoming");
    assert_eq!(upcoming.len(), 1);
    assert_eq!(upcoming[0]["fullName"], json!("Pronto Cumple"));
    assert_eq!(upcoming[0]["daysUntil"], json!(5));
    assert_eq!(upcoming[0]["turningAge"], json!(12));

    let wide = sc.ok("birthdays.list", json!({ "days": 60 }));
    let names: Vec<&str> = wide["upcoming"]
        .as_array()
        .expect("upcoming")
        .iter()
        .map(|b| b["fullName"].as_str().unwrap_or(""))
        .collect();
    assert_eq!(names, vec!["Pronto Cumple", "Lejos Cumple"]);

    let one_group = sc.ok("birthdays.list", json!({ "days": 60, "groupId": g2 }));
    assert_eq!(one_group["today"], json!([]));
    assert_eq!(one_group["upcoming"][0]["fullName"], json!("Lejos Cumple"));

    sc.ok(
        "setup.update",
        json!({ "section": "birthdays", "patch": { "windowDays": 3 } }),
    );
    let narrow = sc.ok("birthdays.list", json!({}));
    assert_eq!(narrow["windowDays"], json!(3));
    assert_eq!(narrow["upcoming"], json!([]));
    assert_eq!(narrow["today"].as_array().map(|a| a.len()), Some(1));

    let bad = sc.call("birthdays.list", json!({ "days": 400 }));
    assert_eq!(bad["error"]["code"], json!("bad_params"));

    sc.finish();
    let _ = std::fs::remove_dir_all(workspace);
}
