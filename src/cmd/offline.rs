//! Commands that run without the service: `patchgate check` and `patchgate hash`.

use std::path::Path;

use anyhow::{Context, Result};

use patchgate::{safety, token};

fn read_diff(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read diff {}", path.display()))
}

/// Run the safety validator on a diff. Returns whether it was accepted.
pub fn cmd_check(file: &str, diff_path: &Path) -> Result<bool> {
    let diff = read_diff(diff_path)?;
    let verdict = safety::check(file, &diff);
    if verdict.safe {
        println!("accepted: {}", file);
    } else {
        println!(
            "rejected: {}",
            verdict.reason.as_deref().unwrap_or("unsafe patch")
        );
    }
    Ok(verdict.safe)
}

pub fn cmd_hash(diff_path: &Path) -> Result<()> {
    let diff = read_diff(diff_path)?;
    println!("{}", token::hash_diff(&diff));
    Ok(())
}
