// Player configuration

use crate::decoder::mailbox::Backpressure;
use crate::decoder::DecoderConfig;
use crate::pipeline::importer::MAX_IMPORT_PLANES;
use crate::pipeline::PipelineError;
use crate::renderer::WindowConfig;
use std::time::Duration;

/// Render loop tuning
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Most planes a frame may have to be imported
    pub max_planes: usize,
    /// Sleep between polls when the source has no frame yet
    pub poll_interval: Duration,
    /// Fail the session after this long without a frame; `None` waits forever
    pub stall_timeout: Option<Duration>,
    pub max_consecutive_allocation_failures: u32,
    pub max_consecutive_decode_errors: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_planes: MAX_IMPORT_PLANES,
            poll_interval: Duration::from_millis(3),
            stall_timeout: Some(Duration::from_secs(10)),
            max_consecutive_allocation_failures: 3,
            max_consecutive_decode_errors: 16,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.max_planes == 0 || self.max_planes > MAX_IMPORT_PLANES {
            return Err(PipelineError::Usage(format!(
                "--max-planes must be between 1 and {}",
                MAX_IMPORT_PLANES
            )));
        }
        if self.max_consecutive_allocation_failures == 0 || self.max_consecutive_decode_errors == 0 {
            return Err(PipelineError::Usage(
                "failure limits must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Everything the player needs for one session
#[derive(Debug, Clone, Default)]
pub struct PlayerConfig {
    pub decoder: DecoderConfig,
    pub window: WindowConfig,
    pub pipeline: PipelineConfig,
    /// Decode on a separate thread behind a single-slot mailbox
    pub threaded: bool,
    pub backpressure: Backpressure,
}

impl PlayerConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        let input = &self.decoder.input;
        if input.as_os_str().is_empty() {
            return Err(PipelineError::Usage("no input file given".to_string()));
        }
        if !input.is_file() {
            return Err(PipelineError::Usage(format!(
                "input file {} does not exist",
                input.display()
            )));
        }
        if self.window.width == 0 || self.window.height == 0 {
            return Err(PipelineError::Usage(format!(
                "invalid window size {}x{}",
                self.window.width, self.window.height
            )));
        }
        if self.decoder.max_packets_per_poll == 0 {
            return Err(PipelineError::Usage(
                "max packets per poll must be at least 1".to_string(),
            ));
        }
        self.pipeline.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_planes, 4);
        assert_eq!(config.stall_timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.max_consecutive_allocation_failures, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_plane_limit_validation() {
        let mut config = PipelineConfig::default();
        config.max_planes = 0;
        assert!(matches!(config.validate(), Err(PipelineError::Usage(_))));
        config.max_planes = 5;
        assert!(matches!(config.validate(), Err(PipelineError::Usage(_))));
        config.max_planes = 3;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_input_is_usage_error() {
        let config = PlayerConfig::default();
        assert!(matches!(config.validate(), Err(PipelineError::Usage(_))));

        let mut config = PlayerConfig::default();
        config.decoder.input = "/nonexistent/clip.mp4".into();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, PipelineError::Usage(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_existing_input_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"\0\0\0\x18ftypmp42").unwrap();

        let mut config = PlayerConfig::default();
        config.decoder.input = file.path().to_path_buf();
        assert!(config.validate().is_ok());

        config.window.width = 0;
        assert!(config.validate().is_err());
    }
}
