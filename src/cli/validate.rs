use anyhow::{Context, Result};
use std::path::Path;

use super::outline::print_outline;
use crate::core::log::{LogSnapshot, SchemaError, parse_batch};
use crate::core::terminal::{print_status, print_success};

pub(crate) fn validate_raw(raw: &str) -> Result<LogSnapshot, SchemaError> {
    let batch = parse_batch(raw)?;
    batch.validate()?;
    Ok(LogSnapshot {
        steps: batch.steps,
        final_result: batch.final_result,
        system_prompt_excerpt: batch.system_prompt_excerpt,
    })
}

/// Checks a serialized batch. Any schema problem is returned as an error so the process exits 1.
pub(crate) fn run_validate(path: &Path, show_outline: bool) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let snapshot =
        validate_raw(&raw).with_context(|| format!("{} is not a valid execution log", path.display()))?;

    print_success(&format!("{} is a valid execution log", path.display()));
    print_status("Steps", &snapshot.steps.len().to_string());
    print_status(
        "Final result",
        if snapshot.final_result.is_some() { "yes" } else { "no" },
    );
    if show_outline {
        print_outline(&snapshot, false);
    }
    Ok(())
}
