use std::env;
use std::fs;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

// Stamps the metadata the boot event and dashboard footer render:
// the build instant (raw epoch seconds; the daemon formats it at runtime,
// where chrono is available), the building host, and the git revision.

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // SOURCE_DATE_EPOCH wins so reproducible builds stay reproducible.
    let build_epoch = env::var("SOURCE_DATE_EPOCH").ok().unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            .to_string()
    });

    let build_host = env::var("HOSTNAME")
        .ok()
        .or_else(|| fs::read_to_string("/etc/hostname").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    let git_rev = Command::new("git")
        .args(["rev-parse", "--short=12", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=PROGMAN_BUILD_EPOCH={build_epoch}");
    println!("cargo:rustc-env=PROGMAN_BUILD_HOST={build_host}");
    println!("cargo:rustc-env=PROGMAN_GIT_REV={git_rev}");
}
