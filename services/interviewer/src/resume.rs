use anyhow::{Context, Result, bail};
use std::fs;
use std::path::Path;

/// Reads a plain-text résumé. Surrounding whitespace is dropped; an empty
/// file is an error since it would only add noise to every request.
pub fn load_resume(path: &Path) -> Result<String> {
    if !path.is_file() {
        bail!("Résumé is not a readable file: {}", path.display());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read résumé file: {}", path.display()))?;
    let content = content.trim();
    if content.is_empty() {
        bail!("Résumé file is empty: {}", path.display());
    }

    tracing::debug!("Loaded {} characters of résumé text", content.chars().count());
    Ok(content.to_string())
}
