//! Build identification baked in by `build.rs` via `cargo:rustc-env` +
//! `option_env!`. This is the only module that reads those variables --
//! everything else should go through [`version_string`] rather than poking
//! `option_env!` directly.

use core::cmp::min;

use alloc::format;
use alloc::string::String;

/// One-line build identity: short commit, branch, dirty marker, build
/// timestamp, target triple. Logged once at boot so a serial capture says
/// what it's looking at without a separate version command.
pub fn version_string() -> String {
    let commit = option_env!("GIT_COMMIT").unwrap_or("unknown");
    let branch = option_env!("GIT_BRANCH").unwrap_or("unknown");
    let dirty = option_env!("GIT_DIRTY") == Some("1");
    let built = option_env!("BUILD_TIMESTAMP").unwrap_or("0");
    let target = option_env!("TARGET").unwrap_or("unknown");
    format!(
        "kcore {} ({}{}) built={} target={}",
        &commit[..min(12, commit.len())],
        branch,
        if dirty { "+dirty" } else { "" },
        built,
        target,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_string_has_the_expected_shape() {
        // build.rs runs for host test builds too, so GIT_COMMIT/TARGET are
        // genuinely set; this workspace just isn't a git checkout, so the
        // commit/branch fall back to "unknown" while TARGET stays real.
        let v = version_string();
        assert!(v.starts_with("kcore "));
        assert!(v.contains("target="));
    }
}
