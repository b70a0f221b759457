use remote_index_builder::pipeline::RunReport;
use remote_index_builder::types::TaskResult;

use super::engine::InstrumentedEngine;
use super::harness::TestHarness;

/// Exactly one of `file_name` and `error` is populated.
pub fn assert_exclusive(result: &TaskResult) {
    match (&result.file_name, &result.error) {
        (Some(name), None) => assert!(!name.is_empty(), "file name should not be empty"),
        (None, Some(error)) => assert!(!error.is_empty(), "error should not be empty"),
        other => panic!("expected exactly one of file_name/error, got {other:?}"),
    }
}

/// The run succeeded and produced `expected` as the artifact name.
pub fn assert_success(result: &TaskResult, expected: &str) {
    assert_exclusive(result);
    assert_eq!(
        result.file_name.as_deref(),
        Some(expected),
        "unexpected result: {result:?}"
    );
}

/// The run failed and the error mentions `needle`.
pub fn assert_failure_contains(result: &TaskResult, needle: &str) {
    assert_exclusive(result);
    let error = result
        .error
        .as_deref()
        .unwrap_or_else(|| panic!("expected a failure, got {result:?}"));
    assert!(
        error.contains(needle),
        "expected error to contain '{needle}', got '{error}'"
    );
}

/// Every handle the run registered was released exactly once, the engine
/// holds nothing and the staging root is empty.
pub fn assert_clean(report: &RunReport, engine: &InstrumentedEngine, harness: &TestHarness) {
    assert_eq!(
        report.handles.registered, report.handles.released,
        "registered and released handles differ: {:?}",
        report.handles
    );
    assert_eq!(report.handles.outstanding(), 0);
    assert_eq!(engine.live_structures(), 0, "engine still holds structures");
    assert!(
        engine.double_releases().is_empty(),
        "raw handles released twice: {:?}",
        engine.double_releases()
    );
    assert_eq!(harness.staging_entries(), 0, "staging root is not empty");
}
