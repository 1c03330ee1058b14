#[test]
fn askpipe_check_contract_json_and_bool_flags() {
    let bin = assert_cmd::cargo::cargo_bin!("askpipe");
    let cache = tempfile::tempdir().expect("temp cache dir");

    // Critical contract: allow explicit `--check-ollama=false` (clap ArgAction::Set),
    // and still emit well-formed JSON with stable keys.
    let out = std::process::Command::new(bin)
        .args(["check", "--check-ollama=false", "--timeout-ms", "1"])
        .env("ASKPIPE_CACHE_DIR", cache.path())
        // Ensure we don't accidentally inherit keys from the environment.
        .env_remove("ASKPIPE_BRAVE_API_KEY")
        .env_remove("BRAVE_SEARCH_API_KEY")
        .env_remove("ASKPIPE_OPENWEATHER_API_KEY")
        .env_remove("OPENWEATHER_API_KEY")
        .env_remove("ASKPIPE_API_KEY")
        .output()
        .expect("run askpipe check");

    assert!(out.status.success(), "askpipe check failed");
    let s = String::from_utf8_lossy(&out.stdout);
    let v: serde_json::Value = serde_json::from_str(&s).expect("parse check json");

    assert_eq!(v["schema_version"].as_u64(), Some(1));
    assert_eq!(v["kind"].as_str(), Some("check"));
    assert_eq!(v["ok"].as_bool(), Some(true));
    assert_eq!(v["name"].as_str(), Some("askpipe"));
    assert!(!v["version"].as_str().unwrap_or("").is_empty());
    assert!(v.get("elapsed_ms").is_some());
    assert!(!v["platform"]["os"].as_str().unwrap_or("").is_empty());

    // Config surface should be present and booleans-only for secrets.
    assert_eq!(v["configured"]["providers"]["brave"].as_bool(), Some(false));
    assert_eq!(
        v["configured"]["providers"]["openweather"].as_bool(),
        Some(false)
    );
    assert_eq!(v["configured"]["auth"]["api_key"].as_bool(), Some(false));
    assert_eq!(
        v["configured"]["cache_dir"].as_str(),
        cache.path().to_str()
    );

    // Check list should exist and include the ollama probe with skipped=true.
    let checks = v["checks"].as_array().expect("checks array");
    let writable = checks
        .iter()
        .find(|c| c["name"].as_str() == Some("cache_dir_writable"))
        .expect("cache_dir_writable check");
    assert_eq!(writable["ok"].as_bool(), Some(true));
    let ollama = checks
        .iter()
        .find(|c| c["name"].as_str() == Some("ollama_reachable"))
        .expect("ollama_reachable check");
    assert_eq!(ollama["skipped"].as_bool(), Some(true));
    assert_eq!(ollama["ok"].as_bool(), Some(true));
}

#[test]
fn askpipe_check_sees_configured_keys() {
    let bin = assert_cmd::cargo::cargo_bin!("askpipe");
    let cache = tempfile::tempdir().expect("temp cache dir");

    let out = std::process::Command::new(bin)
        .args(["check", "--check-ollama=false", "--timeout-ms", "1"])
        .env("ASKPIPE_CACHE_DIR", cache.path())
        .env("ASKPIPE_BRAVE_API_KEY", "test-key")
        .env("ASKPIPE_API_KEY", "server-secret")
        .env_remove("ASKPIPE_OPENWEATHER_API_KEY")
        .env_remove("OPENWEATHER_API_KEY")
        .output()
        .expect("run askpipe check");

    assert!(out.status.success(), "askpipe check failed");
    let s = String::from_utf8_lossy(&out.stdout);
    let v: serde_json::Value = serde_json::from_str(&s).expect("parse check json");

    assert_eq!(v["configured"]["providers"]["brave"].as_bool(), Some(true));
    assert_eq!(
        v["configured"]["providers"]["openweather"].as_bool(),
        Some(false)
    );
    assert_eq!(v["configured"]["auth"]["api_key"].as_bool(), Some(true));

    let checks = v["checks"].as_array().expect("checks array");
    let search = checks
        .iter()
        .find(|c| c["name"].as_str() == Some("web_search_key"))
        .expect("web_search_key check");
    assert_eq!(search["ok"].as_bool(), Some(true));
    assert_eq!(search["optional"].as_bool(), Some(true));
}

#[test]
fn askpipe_check_fails_on_unwritable_cache_dir() {
    let bin = assert_cmd::cargo::cargo_bin!("askpipe");
    // A path underneath a regular file can never become a directory.
    let file = tempfile::NamedTempFile::new().expect("temp file");
    let bad_dir = file.path().join("nested");

    let out = std::process::Command::new(bin)
        .args(["check", "--check-ollama=false", "--timeout-ms", "1"])
        .env("ASKPIPE_CACHE_DIR", &bad_dir)
        .env_remove("ASKPIPE_BRAVE_API_KEY")
        .env_remove("BRAVE_SEARCH_API_KEY")
        .output()
        .expect("run askpipe check");

    assert!(!out.status.success(), "expected a failing exit status");
    assert_eq!(out.status.code(), Some(1));

    let s = String::from_utf8_lossy(&out.stdout);
    let v: serde_json::Value = serde_json::from_str(&s).expect("parse check json");
    assert_eq!(v["ok"].as_bool(), Some(false));

    let checks = v["checks"].as_array().expect("checks array");
    let writable = checks
        .iter()
        .find(|c| c["name"].as_str() == Some("cache_dir_writable"))
        .expect("cache_dir_writable check");
    assert_eq!(writable["ok"].as_bool(), Some(false));
    assert!(writable["hint"]
        .as_str()
        .unwrap_or("")
        .contains("ASKPIPE_CACHE_DIR"));
}
