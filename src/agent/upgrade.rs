//! Self-upgrade (§3.4 "`upgrade` → download platform binary, verify SHA-1
//! against sibling `.sha1` URL, atomically replace, re-exec with the same
//! argv").
//!
//! The actual upgrade server and binary naming scheme are out of scope
//! (§1 "self-upgrade binary download" is named only through the interface
//! this module uses): the URL is read from an environment override so the
//! behavior is testable without a real release server.

use anyhow::{Context, Result};
use sha1::{Digest, Sha1};

/// Env var naming the base URL to download the platform binary and its
/// sibling `.sha1` checksum from. Left unset in production until a real
/// release server exists; tests set it to a `wiremock` instance.
const UPGRADE_URL_ENV: &str = "OVERLORD_UPGRADE_URL";

pub async fn perform_upgrade() -> Result<()> {
    let Ok(base_url) = std::env::var(UPGRADE_URL_ENV) else {
        log::info!("upgrade requested but {UPGRADE_URL_ENV} is unset; skipping");
        return Ok(());
    };

    let binary_url = format!("{base_url}/overlord-agent");
    let checksum_url = format!("{binary_url}.sha1");

    let client = reqwest::Client::new();
    let binary_bytes = client.get(&binary_url).send().await?.error_for_status()?.bytes().await?;
    let checksum_text = client.get(&checksum_url).send().await?.error_for_status()?.text().await?;
    let expected = checksum_text.split_whitespace().next().context("empty checksum response")?;

    let mut hasher = Sha1::new();
    hasher.update(&binary_bytes);
    let actual = hex_encode(&hasher.finalize());
    if !actual.eq_ignore_ascii_case(expected) {
        anyhow::bail!("downloaded binary checksum mismatch: expected {expected}, got {actual}");
    }

    let current_exe = std::env::current_exe().context("resolving current executable path")?;
    let staged = current_exe.with_extension("new");
    tokio::fs::write(&staged, &binary_bytes).await.context("writing staged binary")?;
    set_executable(&staged)?;
    tokio::fs::rename(&staged, &current_exe).await.context("replacing running binary")?;

    log::info!("upgrade downloaded and verified; re-executing {current_exe:?}");
    let args: Vec<String> = std::env::args().skip(1).collect();
    let err = exec_replace(&current_exe, &args);
    anyhow::bail!("re-exec failed: {err}")
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{b:02x}").expect("writing to a String cannot fail");
    }
    out
}

#[cfg(unix)]
fn set_executable(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .context("marking staged binary executable")
}

#[cfg(not(unix))]
fn set_executable(_path: &std::path::Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn exec_replace(path: &std::path::Path, args: &[String]) -> std::io::Error {
    use std::os::unix::process::CommandExt;
    std::process::Command::new(path).args(args).exec()
}

#[cfg(not(unix))]
fn exec_replace(path: &std::path::Path, args: &[String]) -> std::io::Error {
    match std::process::Command::new(path).args(args).spawn() {
        Ok(_) => {
            std::process::exit(0);
        }
        Err(e) => e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_encode_matches_known_sha1() {
        let mut hasher = Sha1::new();
        hasher.update(b"abc");
        let digest = hasher.finalize();
        assert_eq!(hex_encode(&digest), "a9993e364706816aba3e25717850c26c9cd0d89");
    }
}
