#[test]
fn askpipe_version_text_output_contract() {
    let bin = assert_cmd::cargo::cargo_bin!("askpipe");
    let out = std::process::Command::new(bin)
        .args(["version", "--output", "text"])
        .output()
        .expect("run askpipe version --output text");

    assert!(out.status.success(), "askpipe version failed");
    let s = String::from_utf8_lossy(&out.stdout);
    assert!(
        s.trim_start().starts_with("askpipe "),
        "expected text output to start with `askpipe `"
    );
}

#[test]
fn askpipe_check_text_output_contract() {
    let bin = assert_cmd::cargo::cargo_bin!("askpipe");
    let cache = tempfile::tempdir().expect("temp cache dir");
    let out = std::process::Command::new(bin)
        .args([
            "check",
            "--output",
            "text",
            "--check-ollama=false",
            "--timeout-ms",
            "1",
        ])
        .env("ASKPIPE_CACHE_DIR", cache.path())
        // Ensure we don't accidentally inherit keys from the environment.
        .env_remove("ASKPIPE_BRAVE_API_KEY")
        .env_remove("BRAVE_SEARCH_API_KEY")
        .env_remove("ASKPIPE_OPENWEATHER_API_KEY")
        .env_remove("OPENWEATHER_API_KEY")
        .output()
        .expect("run askpipe check --output text");

    assert!(out.status.success(), "askpipe check failed");
    let s = String::from_utf8_lossy(&out.stdout);
    assert!(
        s.contains("askpipe check: ok"),
        "expected a check summary line"
    );
    assert!(s.contains("cache_dir_writable"), "expected per-check lines");
    assert!(
        s.contains("hint: set ASKPIPE_BRAVE_API_KEY"),
        "expected a hint for the missing search key"
    );
}
