use tracing_subscriber::EnvFilter;

use crate::settings::ENV_LOG;

/// Installs the stderr subscriber.
///
/// `CREDIBLE_LOG` takes precedence; otherwise `verbosity` selects the level
/// (`0` warn, `1` info, `2` debug, more is trace). Repeated calls are ignored.
pub fn init(verbosity: u8) {
    let filter = EnvFilter::try_from_env(ENV_LOG)
        .unwrap_or_else(|_| EnvFilter::new(default_level(verbosity)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn default_level(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

#[cfg(test)]
mod tests {
    use super::default_level;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(default_level(0), "warn");
        assert_eq!(default_level(1), "info");
        assert_eq!(default_level(2), "debug");
        assert_eq!(default_level(9), "trace");
    }
}
