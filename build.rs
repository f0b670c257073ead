use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

/// Stamp `PKGREPO_VERSION` from the nearest git tag.
///
/// Outside a git checkout the crate version is used with a build timestamp,
/// so user agents sent to repository hosts still tell builds apart.
fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let version = git_describe().unwrap_or_else(|| {
        let crate_version = std::env::var("CARGO_PKG_VERSION").unwrap_or_default();
        format!("{}+{}", crate_version, timestamp())
    });
    println!("cargo:rustc-env=PKGREPO_VERSION={}", version);
}

fn git_describe() -> Option<String> {
    let output = Command::new("git")
        .args(["describe", "--tags", "--always", "--dirty"])
        .output()
        .ok()
        .filter(|o| o.status.success())?;
    let described = String::from_utf8(output.stdout).ok()?;
    let version = described.trim().trim_start_matches('v');
    match version {
        "" => None,
        v if v.ends_with("-dirty") => Some(format!("{}-{}", v, timestamp())),
        v => Some(v.to_string()),
    }
}

fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
