mod common;

use common::*;
use pretty_assertions::assert_eq;
use trex_coordinator::{QueryError, QueryId, QueryState};

fn killed(output: &trex_coordinator::QueryOutput) -> bool {
    output.get_bool(0, 0).unwrap()
}

#[test]
fn kill_interrupts_blocked_metadata_call() {
    let metadata = MockMetadata::new();
    let coordinator = coordinator(metadata.clone());
    let marker = unique_marker();
    let table = format!("{marker}_table");
    let pending = metadata.block_table(&table);

    let handle = coordinator
        .submit(&format!("SELECT 1 AS {marker} FROM {table}"))
        .unwrap();
    assert_query_eventually(&coordinator, &marker, "WAITING_FOR_RESOURCES");

    let id = query_rows(&coordinator, &marker, "query_id")
        .get_string(0, 0)
        .unwrap();
    assert_eq!(&id, handle.id().as_str());

    let output = run(
        &coordinator,
        &format!("CALL trex_kill_query('{id}', 'because')"),
    );
    assert!(killed(&output));

    assert!(handle.wait_done(TIMEOUT));
    assert!(handle.is_done());
    assert!(pending.is_cancelled());
    assert!(!pending.set(Vec::new()));

    let rows = query_rows(
        &coordinator,
        &marker,
        "state, error_type, error_message, cancellation_requested",
    );
    assert_eq!(rows.get_string(0, 0).as_deref(), Some("FAILED"));
    assert_eq!(rows.get_string(0, 1).as_deref(), Some("CANCELLED"));
    assert_eq!(
        rows.get_string(0, 2).as_deref(),
        Some("Query killed. Message: because")
    );
    assert_eq!(rows.get_bool(0, 3), Some(true));

    assert_eq!(
        handle.wait().unwrap_err(),
        QueryError::cancelled(Some("because"))
    );
}

#[test]
fn second_kill_is_a_no_op() {
    let metadata = MockMetadata::new();
    let coordinator = coordinator(metadata.clone());
    let marker = unique_marker();
    let table = format!("{marker}_table");
    let _pending = metadata.block_table(&table);

    let handle = coordinator
        .submit(&format!("SELECT 1 AS {marker} FROM {table}"))
        .unwrap();
    assert_query_eventually(&coordinator, &marker, "WAITING_FOR_RESOURCES");

    let sql = format!("CALL trex_kill_query('{}', 'first')", handle.id());
    assert!(killed(&run(&coordinator, &sql)));
    assert!(handle.wait_done(TIMEOUT));
    assert!(!killed(&run(&coordinator, &sql)));
    assert!(!coordinator.kill(handle.id(), Some("again")));

    let rows = query_rows(&coordinator, &marker, "error_message");
    assert_eq!(
        rows.get_string(0, 0).as_deref(),
        Some("Query killed. Message: first")
    );
}

#[test]
fn kill_without_reason() {
    let metadata = MockMetadata::new();
    let coordinator = coordinator(metadata.clone());
    let marker = unique_marker();
    let table = format!("{marker}_table");
    let _pending = metadata.block_table(&table);

    let handle = coordinator
        .submit(&format!("SELECT 1 AS {marker} FROM {table}"))
        .unwrap();
    assert_query_eventually(&coordinator, &marker, "WAITING_FOR_RESOURCES");

    assert!(coordinator.kill(handle.id(), None));
    let err = handle.wait_timeout(TIMEOUT).unwrap().unwrap_err();
    assert_eq!(err.to_string(), "Query killed. No message provided.");
}

#[test]
fn kill_of_unknown_query_returns_false() {
    let coordinator = coordinator(MockMetadata::new());
    let output = run(
        &coordinator,
        "CALL trex_kill_query('00000000-0000-0000-0000-000000000000', 'because')",
    );
    assert!(!killed(&output));
    assert!(!coordinator.kill(&QueryId::from("missing"), None));
}

#[test]
fn kill_of_finished_query_returns_false() {
    let coordinator = coordinator(MockMetadata::new());
    let handle = coordinator.submit("SELECT 1").unwrap();
    let id = handle.id().clone();
    handle.wait_timeout(TIMEOUT).unwrap().unwrap();

    assert!(!killed(&run(
        &coordinator,
        &format!("CALL trex_kill_query('{id}', 'late')"),
    )));
    let info = coordinator.registry().lookup(&id).unwrap();
    assert_eq!(info.state, QueryState::Finished);
    assert!(!info.cancellation_requested);
}

#[test]
fn kill_right_after_submit_cancels_query() {
    let metadata = MockMetadata::new();
    let coordinator = coordinator(metadata.clone());
    let marker = unique_marker();
    let table = format!("{marker}_table");
    let pending = metadata.block_table(&table);

    let handle = coordinator
        .submit(&format!("SELECT 1 AS {marker} FROM {table}"))
        .unwrap();
    coordinator.kill(handle.id(), Some("early"));

    let err = handle
        .wait_timeout(TIMEOUT)
        .expect("killed query did not finish")
        .unwrap_err();
    assert!(err.is_cancelled());
    // Either interrupted mid-call or never called at all; never resolved.
    assert!(pending.is_cancelled() || !pending.is_done());
    assert!(!coordinator.kill(handle.id(), Some("early")));
    assert_eq!(
        coordinator.registry().lookup(handle.id()).unwrap().state,
        QueryState::Failed
    );
}

#[test]
fn kill_interrupts_running_duckdb_scan() {
    let coordinator = coordinator(MockMetadata::new());
    let marker = unique_marker();

    let handle = coordinator
        .submit(&format!(
            "SELECT count(*) AS {marker} FROM range(1000000000000) t(n) WHERE n % 7 = 3"
        ))
        .unwrap();
    assert_query_eventually(&coordinator, &marker, "RUNNING");

    let output = run(
        &coordinator,
        &format!("CALL trex_kill_query('{}', 'scan too long')", handle.id()),
    );
    assert!(killed(&output));

    assert!(handle.wait_done(std::time::Duration::from_secs(5)));
    assert_eq!(
        handle.wait().unwrap_err(),
        QueryError::cancelled(Some("scan too long"))
    );
    let rows = query_rows(&coordinator, &marker, "state, error_type");
    assert_eq!(rows.get_string(0, 0).as_deref(), Some("FAILED"));
    assert_eq!(rows.get_string(0, 1).as_deref(), Some("CANCELLED"));
}

#[test]
fn kill_with_null_reason_reports_no_message() {
    let metadata = MockMetadata::new();
    let coordinator = coordinator(metadata.clone());
    let marker = unique_marker();
    let table = format!("{marker}_table");
    let _pending = metadata.block_table(&table);

    let handle = coordinator
        .submit(&format!("SELECT 1 AS {marker} FROM {table}"))
        .unwrap();
    assert_query_eventually(&coordinator, &marker, "WAITING_FOR_RESOURCES");

    let output = run(
        &coordinator,
        &format!("CALL trex_kill_query('{}', NULL)", handle.id()),
    );
    assert!(killed(&output));
    assert!(handle.wait_done(TIMEOUT));

    let rows = query_rows(&coordinator, &marker, "error_message");
    assert_eq!(
        rows.get_string(0, 0).as_deref(),
        Some("Query killed. No message provided.")
    );
}
