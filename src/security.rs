#![forbid(unsafe_code)]

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Refuses to start the relay under uid 0. The service spawns yt-dlp and
/// talks to arbitrary upstream hosts, neither of which needs privileges.
pub fn ensure_unprivileged(process: &str) -> Result<()> {
    check_uid(Uid::effective(), process)
}

fn check_uid(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("{process} refuses to run as root; start it from an unprivileged service account");
    }
    Ok(())
}
