//! Test data builders

use vesc_link::config::FirmwareRelease;
use vesc_link::LinkConfig;

/// Builder for link configurations used by integration tests
pub struct LinkConfigBuilder {
    config: LinkConfig,
}

impl LinkConfigBuilder {
    /// Defaults with firmware polling off so tests control the traffic
    pub fn new() -> Self {
        let mut config = LinkConfig::default();
        config.commands.poll_fw_version = false;
        Self { config }
    }

    pub fn command_timeout_ms(mut self, ms: u64) -> Self {
        self.config.commands.default_timeout_ms = ms;
        self
    }

    pub fn poll_fw_version(mut self, poll: bool) -> Self {
        self.config.commands.poll_fw_version = poll;
        self
    }

    pub fn supported(mut self, releases: &[(i8, i8)]) -> Self {
        self.config.commands.supported_firmwares = releases
            .iter()
            .map(|&(major, minor)| FirmwareRelease::new(major, minor))
            .collect();
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.firmware.chunk_size = size;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.config.firmware.retries = retries;
        self
    }

    pub fn ack_timeout_ms(mut self, ms: u64) -> Self {
        self.config.firmware.ack_timeout_ms = ms;
        self
    }

    pub fn verify(mut self, verify: bool) -> Self {
        self.config.firmware.verify = verify;
        self
    }

    pub fn candidate_timeout_ms(mut self, ms: u64) -> Self {
        self.config.autoconnect.candidate_timeout_ms = ms;
        self
    }

    pub fn build(self) -> LinkConfig {
        self.config
    }
}

/// Deterministic firmware image of `len` bytes
pub fn firmware_image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_config_builder() {
        let config = LinkConfigBuilder::new()
            .command_timeout_ms(100)
            .chunk_size(64)
            .supported(&[(6, 2)])
            .build();

        assert_eq!(config.commands.default_timeout_ms, 100);
        assert!(!config.commands.poll_fw_version);
        assert_eq!(config.firmware.chunk_size, 64);
        assert_eq!(config.commands.supported_firmwares.len(), 1);
    }
}
