use tracing::level_filters::LevelFilter;

const SSPL_CONFIG: &str = "SSPL_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "/etc/sspl.json";

pub fn get_default_config_path() -> &'static str {
    DEFAULT_CONFIG_PATH
}

/// Config file named by the environment, if any
pub fn get_config_path() -> Option<String> {
    std::env::var(SSPL_CONFIG).ok().filter(|path| !path.is_empty())
}

const SSPL_LOG_LEVEL: &str = "SSPL_LOG_LEVEL";

const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::INFO;

pub fn get_log_level() -> LevelFilter {
    let level_from_env = std::env::var(SSPL_LOG_LEVEL);
    level_from_env.map_or(DEFAULT_LOG_LEVEL, |res| {
        res.parse().unwrap_or(DEFAULT_LOG_LEVEL)
    })
}
