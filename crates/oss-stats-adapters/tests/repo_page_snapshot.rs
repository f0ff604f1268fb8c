use std::path::{Path, PathBuf};

use oss_stats_adapters::parse_repo_page_counts;

fn fixture_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn read_fixture(name: &str) -> String {
    std::fs::read_to_string(fixture_path(name)).expect("read fixture")
}

#[test]
fn repo_page_fixture_yields_both_counters() {
    let counts = parse_repo_page_counts(&read_fixture("repo_page.html")).expect("parse page");
    assert_eq!(counts.contributor_count, Some(1_042));
    assert_eq!(counts.dependent_count, Some(21_337));
    assert!(counts.is_complete());
}

#[test]
fn page_without_dependents_is_incomplete() {
    let counts = parse_repo_page_counts(&read_fixture("repo_page_partial.html")).expect("parse page");
    assert_eq!(counts.contributor_count, Some(9));
    assert_eq!(counts.dependent_count, None);
    assert!(!counts.is_complete());
}
