use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;

static GRADPASS_DUMP_DIR: OnceLock<Option<PathBuf>> = OnceLock::new();
static GRADPASS_PASS_STATS: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// Directory receiving before/after job snapshots of every pass.
pub(crate) fn dump_dir() -> Option<PathBuf> {
    GRADPASS_DUMP_DIR
        .get_or_init(|| match env::var("GRADPASS_DUMP_DIR") {
            Ok(value) if !value.trim().is_empty() => Some(PathBuf::from(value.trim())),
            _ => None,
        })
        .clone()
}

pub(crate) fn pass_stats_enabled() -> bool {
    *GRADPASS_PASS_STATS.get_or_init(|| match env::var("GRADPASS_PASS_STATS") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}
