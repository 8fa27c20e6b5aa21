//! Global subscriber setup for the `repomesh` binary.
//!
//! Only repomesh's own targets log at the requested level; dependencies are
//! held at `warn`. `REPOMESH_LOG` (then `RUST_LOG`) overrides the whole
//! directive set.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "REPOMESH_LOG";

const TARGETS: &[&str] = &["repomesh_core", "repomesh"];

/// Default directive string for `level`, e.g. `warn,repomesh_core=debug,repomesh=debug`.
pub fn default_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    let mut directives = String::from("warn");
    for target in TARGETS {
        directives.push_str(&format!(",{target}={level}"));
    }
    directives
}

fn env_filter(level: Level) -> EnvFilter {
    [LOG_ENV, EnvFilter::DEFAULT_ENV]
        .iter()
        .find_map(|var| EnvFilter::try_from_env(var).ok())
        .unwrap_or_else(|| EnvFilter::new(default_directives(level)))
}

/// Install the global subscriber. Later calls are no-ops.
///
/// Log lines go to stderr; stdout carries command output. `json` switches
/// them to newline-delimited JSON.
pub fn init_tracing(json: bool, level: Level) {
    let registry = tracing_subscriber::registry().with(env_filter(level));
    let installed = if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_scope_level_to_repomesh_targets() {
        assert_eq!(
            default_directives(Level::DEBUG),
            "warn,repomesh_core=debug,repomesh=debug"
        );
        assert!(default_directives(Level::INFO).parse::<EnvFilter>().is_ok());
    }

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        init_tracing(false, Level::WARN);
        init_tracing(true, Level::DEBUG);
    }
}
