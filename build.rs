fn main() {
    // Reads from RELEASE_VERSION env var (set by CI) or falls back to Cargo.toml version
    let release = std::env::var("RELEASE_VERSION").ok();
    let version = release
        .clone()
        .or_else(|| std::env::var("CARGO_PKG_VERSION").ok())
        .unwrap_or_else(|| "0.0.0".to_string());

    let profile = std::env::var("PROFILE").unwrap_or_default();
    let full_version = if profile == "debug" && release.is_none() {
        format!("{version}-dev")
    } else {
        version
    };

    println!("cargo:rustc-env=APP_VERSION={full_version}");
    println!("cargo:rerun-if-env-changed=RELEASE_VERSION");
}
