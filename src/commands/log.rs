use crate::logging::{LogConfig, VALID_LEVELS};
use crate::AppContext;
use anyhow::Result;

pub fn get_log_config(ctx: &AppContext) -> LogConfig {
    LogConfig::load(&ctx.config_dir)
}

/// Apply the given changes and persist; omitted fields keep their value
pub fn set_log_config(
    ctx: &AppContext,
    enabled: Option<bool>,
    max_size_mb: Option<u32>,
    level: Option<String>,
) -> Result<LogConfig> {
    let mut config = LogConfig::load(&ctx.config_dir);

    if let Some(enabled) = enabled {
        config.enabled = enabled;
    }
    if let Some(size) = max_size_mb {
        config.max_size_mb = size.clamp(1, 100);
    }
    if let Some(level) = level {
        let level = level.to_lowercase();
        if !VALID_LEVELS.contains(&level.as_str()) {
            anyhow::bail!("Invalid log level: {} (expected one of {})", level, VALID_LEVELS.join(", "));
        }
        config.level = level;
    }

    config.save(&ctx.config_dir)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn changes_are_validated_and_saved() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AppContext::at(dir.path());

        let config = set_log_config(&ctx, Some(false), Some(500), Some("DEBUG".into())).unwrap();
        assert_eq!(config.max_size_mb, 100);
        assert_eq!(config.level, "debug");

        let loaded = get_log_config(&ctx);
        assert!(!loaded.enabled);
        assert_eq!(loaded.level, "debug");

        assert!(set_log_config(&ctx, None, None, Some("chatty".into())).is_err());
        assert_eq!(get_log_config(&ctx).level, "debug");
    }
}
