//! Docker engine invariant tests.

use std::fs;
use std::path::PathBuf;

fn docker_source() -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("src/engine/docker.rs");
    fs::read_to_string(&path).expect("docker source should load")
}

#[test]
fn stop_treats_not_modified_as_success() {
    let source = docker_source();
    assert!(source.contains("status_code: 304"));
}

#[test]
fn missing_containers_map_to_not_found() {
    let source = docker_source();
    assert!(source.contains("status_code: 404"));
    assert!(source.contains("EngineError::NotFound(subject.to_owned())"));
}

#[test]
fn remove_is_forced() {
    let source = docker_source();
    assert!(source.contains("force: true"));
}

#[test]
fn list_filters_by_label() {
    let source = docker_source();
    assert!(source.contains("(\"label\".to_owned(), filter.expressions())"));
}
