#[test]
fn askpipe_version_contract() {
    let bin = assert_cmd::cargo::cargo_bin!("askpipe");
    let out = std::process::Command::new(bin)
        .args(["version"])
        .output()
        .expect("run askpipe version");

    assert!(out.status.success(), "askpipe version failed");
    let s = String::from_utf8_lossy(&out.stdout);
    let v: serde_json::Value = serde_json::from_str(&s).expect("parse version json");

    assert_eq!(v["schema_version"].as_u64(), Some(1));
    assert_eq!(v["kind"].as_str(), Some("version"));
    assert_eq!(v["ok"].as_bool(), Some(true));
    assert_eq!(v["name"].as_str(), Some("askpipe"));
    assert!(!v["version"].as_str().unwrap_or("").is_empty());
    // Version stays lean: no platform or check data here.
    assert!(v.get("platform").is_none());
    assert!(v.get("checks").is_none());
}
