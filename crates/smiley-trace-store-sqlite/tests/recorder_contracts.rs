use std::path::{Path, PathBuf};

use proptest::prelude::*;
use rusqlite::{params, Connection};
use smiley_trace_core::{
    decode, parse_rfc3339_utc, EventKind, Locals, NewTraceEvent, TraceRecorder, TraceValue,
};
use smiley_trace_store_sqlite::{SqliteRecorder, StoreError};
use time::OffsetDateTime;
use ulid::Ulid;

fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err}"),
    }
}

/// Temp database path; the file and its WAL sidecars are removed on drop.
struct TempDb {
    path: PathBuf,
}

impl TempDb {
    fn new(name: &str) -> Self {
        Self {
            path: std::env::temp_dir().join(format!(
                "smiley-trace-sqlite-test-{}-{}.sqlite",
                name,
                Ulid::new()
            )),
        }
    }
}

impl std::ops::Deref for TempDb {
    type Target = Path;

    fn deref(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm", "-journal"] {
            let mut sidecar = self.path.clone().into_os_string();
            sidecar.push(suffix);
            let _ = std::fs::remove_file(&sidecar);
        }
    }
}

fn at(value: &str) -> OffsetDateTime {
    must(parse_rfc3339_utc(value))
}

fn raw(path: &Path) -> Connection {
    must(Connection::open(path))
}

fn count(conn: &Connection, sql: &str) -> i64 {
    must(conn.query_row(sql, [], |row| row.get(0)))
}

fn locals_of(entries: &[(&str, TraceValue)]) -> Locals {
    entries
        .iter()
        .map(|(name, value)| ((*name).to_string(), value.clone()))
        .collect()
}

fn line_event<'a>(
    run_id: &'a str,
    line_no: u32,
    trace_arg: &'a TraceValue,
    locals: &'a Locals,
    timestamp: OffsetDateTime,
) -> NewTraceEvent<'a> {
    NewTraceEvent {
        run_id,
        event: EventKind::Line,
        func_name: "foo",
        line_no,
        filename: "a.py",
        trace_arg,
        locals,
        timestamp,
    }
}

#[test]
fn reopening_keeps_schema_and_data() {
    let path = TempDb::new("reopen");
    let locals = locals_of(&[("x", TraceValue::Int(7))]);
    {
        let mut recorder = must(SqliteRecorder::open(&path));
        must(recorder.start_run("r1", "/tmp", "desc", at("2026-02-07T12:00:00Z")));
        must(recorder.trace(&line_event(
            "r1",
            4,
            &TraceValue::Null,
            &locals,
            at("2026-02-07T12:00:01Z"),
        )));
    }

    let conn = raw(&path);
    assert_eq!(
        count(
            &conn,
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('run', 'trace')"
        ),
        2
    );
    drop(conn);

    let recorder = must(SqliteRecorder::open(&path));
    let runs = must(recorder.list_runs());
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, "r1");

    let events = must(recorder.list_trace_events("r1"));
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].line_no, 4);
    assert_eq!(events[0].locals, locals);
}

#[test]
fn open_refuses_a_file_that_is_not_a_database() {
    let path = TempDb::new("not-a-db");
    let contents = "plain text, not a trace database\n".repeat(128);
    must(std::fs::write(&*path, &contents));

    assert!(SqliteRecorder::open(&path).is_err());
    assert_eq!(must(std::fs::read_to_string(&*path)), contents);
}

#[test]
fn start_run_inserts_one_open_row() {
    let path = TempDb::new("start");
    let mut recorder = must(SqliteRecorder::open(&path));
    must(recorder.start_run("r1", "/tmp", "desc", at("2026-02-07T12:00:00Z")));

    let conn = raw(&path);
    let (id, cwd, description, end_time): (String, String, String, Option<String>) = must(
        conn.query_row(
            "SELECT id, cwd, description, end_time FROM run",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        ),
    );
    assert_eq!(id, "r1");
    assert_eq!(cwd, "/tmp");
    assert_eq!(description, "desc");
    assert_eq!(end_time, None);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM run"), 1);

    let run = must(recorder.get_run("r1"));
    let run = match run {
        Some(run) => run,
        None => panic!("run r1 missing"),
    };
    assert!(run.is_open());
    assert_eq!(run.error_message, None);
    assert_eq!(run.traceback, None);
}

#[test]
fn duplicate_run_id_is_a_constraint_error_and_keeps_first_row() {
    let path = TempDb::new("duplicate");
    let mut recorder = must(SqliteRecorder::open(&path));
    must(recorder.start_run("r1", "/tmp", "first", at("2026-02-07T12:00:00Z")));

    let second = recorder.start_run("r1", "/var", "second", at("2026-02-07T12:05:00Z"));
    assert!(matches!(second, Err(StoreError::Constraint { .. })));

    let conn = raw(&path);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM run"), 1);
    let description: String = must(conn.query_row(
        "SELECT description FROM run WHERE id = ?1",
        params!["r1"],
        |row| row.get(0),
    ));
    assert_eq!(description, "first");
}

#[test]
fn end_run_updates_the_existing_row() {
    let path = TempDb::new("end");
    let mut recorder = must(SqliteRecorder::open(&path));
    must(recorder.start_run("r1", "/tmp", "desc", at("2026-02-07T12:00:00Z")));
    must(recorder.end_run("r1", at("2026-02-07T12:00:05Z"), "ok", None));

    let conn = raw(&path);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM run"), 1);
    let (end_time, message, traceback): (String, String, String) = must(conn.query_row(
        "SELECT end_time, error_message, traceback FROM run WHERE id = 'r1'",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    ));
    assert_eq!(end_time, "2026-02-07T12:00:05Z");
    assert_eq!(message, "ok");
    assert_eq!(traceback, "null");

    let run = match must(recorder.get_run("r1")) {
        Some(run) => run,
        None => panic!("run r1 missing"),
    };
    assert_eq!(run.end_time, Some(at("2026-02-07T12:00:05Z")));
    assert_eq!(run.traceback, Some(TraceValue::Null));
}

#[test]
fn end_run_stores_structured_traceback() {
    let mut recorder = must(SqliteRecorder::open_in_memory());
    must(recorder.start_run("r1", "/tmp", "", at("2026-02-07T12:00:00Z")));

    let traceback: TraceValue = vec![
        [("file", TraceValue::from("a.py")), ("line", TraceValue::Int(10))]
            .into_iter()
            .collect::<TraceValue>(),
        [("file", TraceValue::from("b.py")), ("line", TraceValue::Int(3))]
            .into_iter()
            .collect::<TraceValue>(),
    ]
    .into();
    must(recorder.end_run(
        "r1",
        at("2026-02-07T12:00:01Z"),
        "ZeroDivisionError: division by zero",
        Some(&traceback),
    ));

    let run = match must(recorder.get_run("r1")) {
        Some(run) => run,
        None => panic!("run r1 missing"),
    };
    assert_eq!(
        run.error_message.as_deref(),
        Some("ZeroDivisionError: division by zero")
    );
    assert_eq!(run.traceback, Some(traceback));
}

#[test]
fn end_run_for_unknown_run_is_a_silent_no_op() {
    let path = TempDb::new("end-unknown");
    let mut recorder = must(SqliteRecorder::open(&path));
    must(recorder.start_run("r1", "/tmp", "desc", at("2026-02-07T12:00:00Z")));

    assert!(recorder
        .end_run("nonexistent", at("2026-02-07T12:00:05Z"), "ok", None)
        .is_ok());

    let conn = raw(&path);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM run"), 1);
    assert_eq!(
        count(&conn, "SELECT COUNT(*) FROM run WHERE end_time IS NOT NULL"),
        0
    );
}

#[test]
fn trace_inserts_one_row_with_decodable_locals() {
    let path = TempDb::new("trace");
    let mut recorder = must(SqliteRecorder::open(&path));
    must(recorder.start_run("r1", "/tmp", "desc", at("2026-02-07T12:00:00Z")));

    let locals = locals_of(&[("x", TraceValue::Int(1))]);
    let event_seq = must(recorder.trace(&line_event(
        "r1",
        10,
        &TraceValue::Null,
        &locals,
        at("2026-02-07T12:00:02Z"),
    )));

    let conn = raw(&path);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM trace"), 1);
    let (seq, event, line_no, stored_locals, trace_arg): (i64, String, i64, String, String) =
        must(conn.query_row(
            "SELECT event_seq, event, line_no, locals, trace_arg FROM trace",
            [],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            },
        ));
    assert_eq!(seq, event_seq);
    assert_eq!(event, "line");
    assert_eq!(line_no, 10);
    assert_eq!(trace_arg, "null");
    assert_eq!(must(decode(&stored_locals)), TraceValue::Map(locals.clone()));

    let events = must(recorder.list_trace_events("r1"));
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].locals, locals);
    assert_eq!(events[0].func_name, "foo");
    assert_eq!(events[0].filename, "a.py");
    assert_eq!(events[0].timestamp, at("2026-02-07T12:00:02Z"));
}

#[test]
fn events_for_unstarted_runs_are_accepted() {
    let mut recorder = must(SqliteRecorder::open_in_memory());
    let locals = Locals::new();
    must(recorder.trace(&line_event(
        "never-started",
        1,
        &TraceValue::Null,
        &locals,
        at("2026-02-07T12:00:00Z"),
    )));
    assert_eq!(must(recorder.list_trace_events("never-started")).len(), 1);
}

#[test]
fn unencodable_locals_fail_without_inserting() {
    let path = TempDb::new("unencodable");
    let mut recorder = must(SqliteRecorder::open(&path));
    must(recorder.start_run("r1", "/tmp", "desc", at("2026-02-07T12:00:00Z")));

    let locals = locals_of(&[
        ("ok", TraceValue::Int(1)),
        ("ratio", TraceValue::Float(f64::NAN)),
    ]);
    let result = recorder.trace(&line_event(
        "r1",
        11,
        &TraceValue::Null,
        &locals,
        at("2026-02-07T12:00:03Z"),
    ));
    assert!(matches!(result, Err(StoreError::Encoding(_))));

    let conn = raw(&path);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM trace"), 0);
}

#[test]
fn floats_read_back_exactly() {
    let path = TempDb::new("floats");
    let mut recorder = must(SqliteRecorder::open(&path));
    must(recorder.start_run("r1", "/tmp", "desc", at("2026-02-07T12:00:00Z")));

    let stored = 433_615_145.713_907_96_f64;
    let locals = locals_of(&[("x", TraceValue::Float(stored))]);
    let trace_arg = TraceValue::Float(0.1);
    must(recorder.trace(&line_event(
        "r1",
        12,
        &trace_arg,
        &locals,
        at("2026-02-07T12:00:01Z"),
    )));

    let events = must(recorder.list_trace_events("r1"));
    assert_eq!(events.len(), 1);
    match events[0].locals.get("x") {
        Some(TraceValue::Float(read)) => assert_eq!(read.to_bits(), stored.to_bits()),
        other => panic!("unexpected local x: {other:?}"),
    }
    assert_eq!(events[0].trace_arg, trace_arg);
}

#[test]
fn overly_nested_locals_fail_without_inserting() {
    let path = TempDb::new("deep");
    let mut recorder = must(SqliteRecorder::open(&path));
    must(recorder.start_run("r1", "/tmp", "desc", at("2026-02-07T12:00:00Z")));

    let ts = at("2026-02-07T12:00:01Z");
    let shallow = locals_of(&[("x", TraceValue::Int(1))]);
    must(recorder.trace(&line_event("r1", 1, &TraceValue::Null, &shallow, ts)));

    let deep_value =
        (0..200).fold(TraceValue::Null, |inner, _| TraceValue::Seq(vec![inner]));
    let deep = locals_of(&[("deep", deep_value)]);
    let result = recorder.trace(&line_event("r1", 2, &TraceValue::Null, &deep, ts));
    assert!(result.as_ref().is_err_and(StoreError::is_encoding));

    let conn = raw(&path);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM trace"), 1);
    drop(conn);

    let events = must(recorder.list_trace_events("r1"));
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].line_no, 1);
}

#[test]
fn opcode_events_are_recorded() {
    let mut recorder = must(SqliteRecorder::open_in_memory());
    let locals = Locals::new();
    must(recorder.trace(&NewTraceEvent {
        event: EventKind::Opcode,
        ..line_event("r1", 5, &TraceValue::Null, &locals, at("2026-02-07T12:00:00Z"))
    }));
    let events = must(recorder.list_trace_events("r1"));
    assert_eq!(events[0].event, EventKind::Opcode);
}

#[test]
fn unencodable_traceback_leaves_run_open() {
    let mut recorder = must(SqliteRecorder::open_in_memory());
    must(recorder.start_run("r1", "/tmp", "", at("2026-02-07T12:00:00Z")));

    let traceback = TraceValue::Seq(vec![TraceValue::Float(f64::INFINITY)]);
    let result = recorder.end_run("r1", at("2026-02-07T12:00:01Z"), "boom", Some(&traceback));
    assert!(result.as_ref().is_err_and(StoreError::is_encoding));

    let run = match must(recorder.get_run("r1")) {
        Some(run) => run,
        None => panic!("run r1 missing"),
    };
    assert!(run.is_open());
}

#[test]
fn list_runs_orders_by_start_time() {
    let mut recorder = must(SqliteRecorder::open_in_memory());
    must(recorder.start_run("late", "/tmp", "", at("2026-02-07T12:00:01Z")));
    must(recorder.start_run("early", "/tmp", "", at("2026-02-07T12:00:00.500Z")));
    must(recorder.start_run("earliest", "/tmp", "", at("2026-02-07T12:00:00Z")));

    let ids: Vec<String> = must(recorder.list_runs())
        .into_iter()
        .map(|run| run.id)
        .collect();
    assert_eq!(ids, vec!["earliest", "early", "late"]);
}

#[test]
fn trace_events_are_scoped_to_their_run() {
    let mut recorder = must(SqliteRecorder::open_in_memory());
    must(recorder.start_run("a", "/tmp", "", at("2026-02-07T12:00:00Z")));
    must(recorder.start_run("b", "/tmp", "", at("2026-02-07T12:00:00Z")));

    let locals = Locals::new();
    let ts = at("2026-02-07T12:00:01Z");
    must(recorder.trace(&line_event("a", 1, &TraceValue::Null, &locals, ts)));
    must(recorder.trace(&line_event("b", 2, &TraceValue::Null, &locals, ts)));
    must(recorder.trace(&line_event("a", 3, &TraceValue::Null, &locals, ts)));

    let lines: Vec<u32> = must(recorder.list_trace_events("a"))
        .into_iter()
        .map(|event| event.line_no)
        .collect();
    assert_eq!(lines, vec![1, 3]);
}

fn arb_event_kind() -> impl Strategy<Value = EventKind> {
    prop_oneof![
        Just(EventKind::Call),
        Just(EventKind::Line),
        Just(EventKind::Return),
        Just(EventKind::Exception),
        Just(EventKind::CCall),
        Just(EventKind::Opcode),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn n_traces_yield_n_rows_in_insertion_order(
        steps in prop::collection::vec((arb_event_kind(), 0_u32..500, any::<i64>()), 0..40)
    ) {
        let mut recorder = must(SqliteRecorder::open_in_memory());
        must(recorder.start_run("r1", "/tmp", "prop", at("2026-02-07T12:00:00Z")));

        // Same timestamp for every event; ordering must come from insertion.
        let ts = at("2026-02-07T12:00:01Z");
        let mut expected = Vec::with_capacity(steps.len());
        for (kind, line_no, marker) in &steps {
            let locals = locals_of(&[("marker", TraceValue::Int(*marker))]);
            let trace_arg = TraceValue::Null;
            let event_seq = must(recorder.trace(&NewTraceEvent {
                run_id: "r1",
                event: *kind,
                func_name: "step",
                line_no: *line_no,
                filename: "prop.py",
                trace_arg: &trace_arg,
                locals: &locals,
                timestamp: ts,
            }));
            expected.push((event_seq, *kind, *line_no, *marker));
        }

        let stored = must(recorder.list_trace_events("r1"));
        prop_assert_eq!(stored.len(), steps.len());
        for (record, (event_seq, kind, line_no, marker)) in stored.iter().zip(&expected) {
            prop_assert_eq!(record.event_seq, *event_seq);
            prop_assert_eq!(record.event, *kind);
            prop_assert_eq!(record.line_no, *line_no);
            prop_assert_eq!(record.locals.get("marker"), Some(&TraceValue::Int(*marker)));
        }
        prop_assert!(stored.windows(2).all(|pair| pair[0].event_seq < pair[1].event_seq));
    }
}
