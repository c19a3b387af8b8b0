use super::{types::Config, ConfigError};

/// Validate configuration
/// Currently validates:
/// - Output width is positive and a multiple of 16
/// - Both bit rates are positive
/// - Snapshot count is positive when snapshots are enabled
/// - Workspace directory is set
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let shrink = &config.shrink;
    if shrink.width == 0 || shrink.width % 16 != 0 {
        return Err(ConfigError::ValidationError(format!(
            "shrink.width must be a positive multiple of 16, got {}",
            shrink.width
        )));
    }
    if shrink.video_bitrate == 0 {
        return Err(ConfigError::ValidationError(
            "shrink.video_bitrate cannot be 0".to_string(),
        ));
    }
    if shrink.audio_bitrate == 0 {
        return Err(ConfigError::ValidationError(
            "shrink.audio_bitrate cannot be 0".to_string(),
        ));
    }
    if shrink.snapshots.as_ref().is_some_and(|s| s.count == 0) {
        return Err(ConfigError::ValidationError(
            "shrink.snapshots.count cannot be 0".to_string(),
        ));
    }

    if config.queue.workspace_dir.as_os_str().is_empty() {
        return Err(ConfigError::ValidationError(
            "queue.workspace_dir cannot be empty".to_string(),
        ));
    }

    Ok(())
}
