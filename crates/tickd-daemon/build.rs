use std::env;
use std::process::Command;

/// Packagers building from a source tarball have no git checkout and set
/// this instead.
const REV_OVERRIDE: &str = "TICKD_BUILD_REV";

fn main() {
    println!("cargo:rerun-if-env-changed={REV_OVERRIDE}");
    println!("cargo:rerun-if-changed=../../.git/HEAD");
    println!("cargo:rerun-if-changed=../../.git/index");

    let rev = env::var(REV_OVERRIDE)
        .ok()
        .filter(|rev| !rev.trim().is_empty())
        .or_else(git_describe)
        .unwrap_or_else(|| "unknown".to_string());
    let profile = env::var("PROFILE").unwrap_or_default();
    let build = if profile == "release" {
        rev
    } else {
        format!("{rev}, {profile}")
    };
    println!("cargo:rustc-env=TICKD_BUILD={build}");
}

/// `<tag>-<n>-g<sha>[-dirty]`, or just the sha when no tag exists.
fn git_describe() -> Option<String> {
    let out = Command::new("git")
        .args(["describe", "--tags", "--always", "--dirty"])
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let rev = String::from_utf8_lossy(&out.stdout).trim().to_string();
    (!rev.is_empty()).then_some(rev)
}
