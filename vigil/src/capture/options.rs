//! Probing of ffmpeg CLI option support.
//!
//! ffmpeg builds differ in which protocol options they accept, and passing
//! an unknown one makes ffmpeg exit immediately. Support is checked once per
//! process against `ffmpeg -h full` and cached; options that a running
//! ffmpeg rejects anyway are marked unsupported and stripped before retrying.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Socket/IO timeout spellings, in priority order. The first supported one wins.
pub const TIMEOUT_OPTIONS: &[&str] = &["rw_timeout", "stimeout"];

/// Legacy spelling used only when none of [`TIMEOUT_OPTIONS`] is supported.
pub const LEGACY_TIMEOUT_OPTION: &str = "timeout";

/// Cached knowledge of which options the installed ffmpeg accepts.
#[derive(Debug)]
pub struct FfmpegOptions {
    binary_path: String,
    help_text: OnceCell<String>,
    cache: Mutex<HashMap<String, bool>>,
}

impl FfmpegOptions {
    pub fn new(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            help_text: OnceCell::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Create option knowledge from a pre-loaded help text (no subprocess is run).
    pub fn with_help_text(binary_path: impl Into<String>, help_text: impl Into<String>) -> Self {
        let options = Self::new(binary_path);
        let _ = options.help_text.set(help_text.into());
        options
    }

    async fn help_text(&self) -> &str {
        self.help_text
            .get_or_init(|| async {
                let output = process_utils::tokio_command(&self.binary_path)
                    .args(["-hide_banner", "-h", "full"])
                    .stdin(std::process::Stdio::null())
                    .output();
                match tokio::time::timeout(std::time::Duration::from_secs(5), output).await {
                    Ok(Ok(output)) => {
                        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                        text.push('\n');
                        text.push_str(&String::from_utf8_lossy(&output.stderr));
                        text
                    }
                    Ok(Err(e)) => {
                        debug!("Failed to run ffmpeg option check: {}", e);
                        String::new()
                    }
                    Err(_) => {
                        debug!("ffmpeg option check timed out");
                        String::new()
                    }
                }
            })
            .await
    }

    /// Whether `option` (without the leading dash) is supported.
    pub async fn supports(&self, option: &str) -> bool {
        if let Some(known) = self.cache.lock().get(option) {
            return *known;
        }

        let supported = help_lists_option(self.help_text().await, option);
        self.cache.lock().insert(option.to_string(), supported);
        supported
    }

    /// Record that a running ffmpeg rejected `option`.
    pub fn mark_unsupported(&self, option: &str) {
        self.cache.lock().insert(option.to_string(), false);
    }

    /// Input arguments that bound how long ffmpeg blocks on a dead source.
    pub async fn timeout_args(&self, timeout_us: u64) -> Vec<String> {
        for option in TIMEOUT_OPTIONS {
            if self.supports(option).await {
                return vec![format!("-{option}"), timeout_us.to_string()];
            }
        }
        if self.supports(LEGACY_TIMEOUT_OPTION).await {
            return vec![format!("-{LEGACY_TIMEOUT_OPTION}"), timeout_us.to_string()];
        }
        Vec::new()
    }

    /// Remove options that ffmpeg's diagnostics say are unknown.
    ///
    /// Returns the reduced argument list if anything was removed, or `None`
    /// when the failure was not caused by an unsupported option.
    pub fn strip_unsupported(&self, args: &[String], diagnostics: &str) -> Option<Vec<String>> {
        let rejected: Vec<&str> = TIMEOUT_OPTIONS
            .iter()
            .chain(std::iter::once(&LEGACY_TIMEOUT_OPTION))
            .copied()
            .filter(|option| rejects_option(diagnostics, option))
            .filter(|option| args.iter().any(|a| a == &format!("-{option}")))
            .collect();

        if rejected.is_empty() {
            return None;
        }

        let mut stripped = args.to_vec();
        for option in rejected {
            let flag = format!("-{option}");
            if let Some(idx) = stripped.iter().position(|a| a == &flag) {
                let end = (idx + 2).min(stripped.len());
                stripped.drain(idx..end);
            }
            self.mark_unsupported(option);
            warn!(option = %flag, "ffmpeg build does not support option, retrying without it");
        }
        Some(stripped)
    }
}

/// Whether `ffmpeg -h full` output lists `-option` as an option name.
fn help_lists_option(help: &str, option: &str) -> bool {
    let flag = format!("-{option}");
    help.lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|first| first == flag)
}

/// Whether ffmpeg diagnostics report `option` as unknown.
fn rejects_option(diagnostics: &str, option: &str) -> bool {
    let lower = diagnostics.to_ascii_lowercase();
    lower.contains(&format!("option {option} not found"))
        || lower.contains(&format!("unrecognized option '{option}'"))
}
