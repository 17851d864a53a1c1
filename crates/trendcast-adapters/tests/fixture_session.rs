use std::path::{Path, PathBuf};
use std::time::Duration;

use trendcast_adapters::{AdapterError, FixtureSessionLauncher, SessionLauncher, SessionProfile};
use trendcast_core::{RawTrend, SourceDescriptor};

fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/trends")
        .canonicalize()
        .expect("fixtures dir")
}

fn profile() -> SessionProfile {
    SessionProfile::rotated(Duration::from_secs(30), Duration::from_secs(10))
}

#[tokio::test]
async fn canada_page_matches_golden_rows() {
    let launcher = FixtureSessionLauncher::new(fixtures_dir());
    let mut session = launcher.launch(&profile()).await.expect("launch");
    let rows = session
        .visit(&SourceDescriptor::new("fixture://canada", "Canada"))
        .await
        .expect("visit");
    session.close().await;

    let golden: Vec<RawTrend> = serde_json::from_str(
        &std::fs::read_to_string(fixtures_dir().join("canada.rows.json")).expect("read golden"),
    )
    .expect("parse golden");
    assert_eq!(rows, golden);
}

#[tokio::test]
async fn load_more_follows_next_link_until_disabled() {
    let launcher = FixtureSessionLauncher::new(fixtures_dir());
    let mut session = launcher.launch(&profile()).await.expect("launch");
    session
        .visit(&SourceDescriptor::new("fixture://canada", "Canada"))
        .await
        .expect("visit");

    let second = session.load_more().await.expect("page 2").expect("more rows");
    assert_eq!(second.len(), 2);
    assert_eq!(second[1], RawTrend::new("Maple Leafs", "20K+"));

    assert!(session.load_more().await.expect("exhausted").is_none());
    session.close().await;
}

#[tokio::test]
async fn unknown_label_is_a_source_error() {
    let launcher = FixtureSessionLauncher::new(fixtures_dir());
    let mut session = launcher.launch(&profile()).await.expect("launch");
    let err = session
        .visit(&SourceDescriptor::new("fixture://mars", "Mars"))
        .await
        .expect_err("missing fixture");
    assert!(matches!(err, AdapterError::Message(_)));
}

#[tokio::test]
async fn missing_directory_fails_to_launch() {
    let launcher = FixtureSessionLauncher::new(fixtures_dir().join("nope"));
    let err = launcher.launch(&profile()).await.err().expect("launch error");
    assert!(matches!(err, AdapterError::Launch(_)));
}
