use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const TARGETS: [&str; 2] = ["monitorkit", "monitorkit_drills"];

/// Install the global subscriber. Logs go to stderr so stdout carries only
/// the JSON report.
///
/// `RUST_LOG` wins when set. Otherwise `MONITORKIT_LOG` picks the level for
/// both crates, and `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => crate_filter(std::env::var("MONITORKIT_LOG").ok().as_deref()),
    };

    let output = if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    let _ = tracing_subscriber::registry()
        .with(output)
        .with(filter)
        .try_init();
}

/// `MONITORKIT_LOG` as a level, falling back to `info` when it is missing
/// or unparseable.
fn crate_level(raw: Option<&str>) -> LevelFilter {
    raw.map(|raw| raw.trim().to_ascii_lowercase())
        .map(|raw| if raw == "warning" { "warn".to_string() } else { raw })
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(LevelFilter::INFO)
}

fn crate_filter(raw: Option<&str>) -> EnvFilter {
    let level = crate_level(raw);
    let directives: Vec<String> = TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect();
    EnvFilter::new(directives.join(","))
}
