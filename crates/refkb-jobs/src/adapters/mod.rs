//! External tool adapters: the conversion engine and the page counter.

pub mod mineru;
pub mod pdfinfo;

pub use mineru::{MineruConfig, MineruEngine};
pub use pdfinfo::PdfInfoPageCounter;

use std::time::Duration;

use tokio::process::Command;

use refkb_core::{Error, Result};

/// Run a command to completion, returning stdout as a string.
///
/// A non-zero exit is a conversion error carrying the trimmed stderr.
pub(crate) async fn run_cmd(cmd: &mut Command) -> Result<String> {
    let output = cmd
        .output()
        .await
        .map_err(|e| Error::Conversion(format!("Failed to execute command: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Conversion(format!(
            "Command failed (exit {}): {}",
            output.status,
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run a command with a timeout, returning stdout as a string.
pub(crate) async fn run_cmd_with_timeout(cmd: &mut Command, timeout_secs: u64) -> Result<String> {
    cmd.kill_on_drop(true);
    tokio::time::timeout(Duration::from_secs(timeout_secs), run_cmd(cmd))
        .await
        .map_err(|_| {
            Error::Conversion(format!(
                "External command timed out after {}s",
                timeout_secs
            ))
        })?
}

/// Whether `bin` can be executed (`<bin> <version_flag>` exits successfully).
pub(crate) async fn binary_available(bin: &str, version_flag: &str) -> bool {
    match Command::new(bin).arg(version_flag).output().await {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}
