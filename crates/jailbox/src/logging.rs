//! Tracing setup shared by host applications and the worker binary.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Level for the jailbox crates when `RUST_LOG` is unset.
fn base_level(var: Option<&str>) -> &'static str {
    match var {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    let var = std::env::var("JAILBOX_LOG").ok();
    EnvFilter::new(format!(
        "jailbox={level},jailbox_quickjs={level}",
        level = base_level(var.as_deref())
    ))
}

/// Install a stderr subscriber. JSON lines when `LOG_FORMAT=json`.
///
/// Stdout is never written: in the worker it carries the frame stream.
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names() {
        assert_eq!(base_level(None), "info");
        assert_eq!(base_level(Some("warning")), "warn");
        assert_eq!(base_level(Some("debug")), "debug");
        assert_eq!(base_level(Some("loud")), "info");
    }

    #[test]
    fn init_is_repeatable() {
        init_tracing();
        init_tracing();
    }
}
