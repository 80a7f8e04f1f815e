use indicatif::{ProgressBar, ProgressStyle};

use crate::error::{QtlError, Result};

/// A bar over `len` units, or a hidden one when `show` is false.
pub fn progress_bar(len: usize, show: bool, unit: &str) -> Result<ProgressBar> {
    if !show {
        return Ok(ProgressBar::hidden());
    }
    let style = ProgressStyle::default_bar()
        .template(&format!(
            "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{pos}}/{{len}} {} ({{percent}}%) ETA: {{eta}}",
            unit
        ))
        .map_err(|e| QtlError::config(format!("Failed to create progress bar style: {}", e)))?
        .progress_chars("=> ");
    Ok(ProgressBar::new(len as u64).with_style(style))
}
