#![forbid(unsafe_code)]

//! Shared security helpers used by the newtube binaries.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when a binary is started as root. The API server and the
/// refresh job only need to read and write the metadata database, so they are
/// expected to run under an unprivileged service account.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_uid_allowed(process, Uid::current())
}

fn ensure_uid_allowed(process: &str, uid: Uid) -> Result<()> {
    if uid.is_root() {
        bail!("{process} must not be run as root; start it from the newtube service account");
    }
    Ok(())
}
