use std::path::PathBuf;
use std::time::Duration;

/// Programmatic session configuration. There is deliberately no file-backed
/// loader here: embedders construct this in code, matching the Non-goal that
/// excludes configuration file loading from this crate.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub handshake_version: u32,
    pub handshake_retry_interval: Duration,
    pub handshake_deadline: Duration,
    pub ignore_extra_commands: bool,
    pub show_internal_frames: bool,
    pub snapshot_info_override: Option<PathBuf>,
}

impl SessionConfig {
    pub fn builder(handshake_version: u32) -> SessionConfigBuilder {
        SessionConfigBuilder::new(handshake_version)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            handshake_version: 1,
            handshake_retry_interval: Duration::from_secs(2),
            handshake_deadline: Duration::from_secs(60),
            ignore_extra_commands: false,
            show_internal_frames: false,
            snapshot_info_override: None,
        }
    }
}

/// Builder for [`SessionConfig`]; every setting has a sane default so that
/// `SessionConfig::builder(version).build()` alone is a usable config.
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn new(handshake_version: u32) -> Self {
        SessionConfigBuilder {
            config: SessionConfig {
                handshake_version,
                ..SessionConfig::default()
            },
        }
    }

    pub fn handshake_retry_interval(mut self, interval: Duration) -> Self {
        self.config.handshake_retry_interval = interval;
        self
    }

    pub fn handshake_deadline(mut self, deadline: Duration) -> Self {
        self.config.handshake_deadline = deadline;
        self
    }

    pub fn ignore_extra_commands(mut self, ignore: bool) -> Self {
        self.config.ignore_extra_commands = ignore;
        self
    }

    pub fn show_internal_frames(mut self, show: bool) -> Self {
        self.config.show_internal_frames = show;
        self
    }

    pub fn snapshot_info_override(mut self, path: PathBuf) -> Self {
        self.config.snapshot_info_override = Some(path);
        self
    }

    pub fn build(self) -> SessionConfig {
        self.config
    }
}
