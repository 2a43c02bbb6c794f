//! Async discipline in production code
//!
//! The relay crates run entirely on tokio. Blocking the executor thread
//! stalls every connection served by it.

use architectural_enforcement::{assert_clean, find_in_production_code, workspace_root};

#[test]
fn test_no_thread_sleep_in_relay_crates() {
    let root = workspace_root();
    for krate in ["relay/core/src", "relay/daemon/src"] {
        let violations = find_in_production_code(
            &root.join(krate),
            &["std::thread::sleep", "thread::sleep("],
        );
        assert_clean("Blocking sleep in async code", &violations);
    }
}

#[test]
fn test_channel_layer_uses_async_fs() {
    let violations = find_in_production_code(
        &workspace_root().join("relay/core/src/channel"),
        &[
            "std::fs::read",
            "std::fs::write",
            "std::fs::remove_file",
            "std::fs::create_dir",
            "std::fs::set_permissions",
            "std::fs::metadata",
            "fs::File::",
        ],
    );
    assert_clean("Blocking filesystem call in the channel layer", &violations);
}

#[test]
fn test_core_library_does_not_unwrap() {
    let violations = find_in_production_code(
        &workspace_root().join("relay/core/src"),
        &[".unwrap()", ".expect("],
    );
    assert_clean("unwrap/expect outside tests", &violations);
}

#[test]
fn test_sources_are_found() {
    let sources = architectural_enforcement::rust_sources(&workspace_root().join("relay/core/src"));
    assert!(sources.iter().any(|p| p.ends_with("lib.rs")));
}
