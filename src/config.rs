//! Device configuration (spec §6 "Configuration").

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::MashError;

/// Lower/upper clamp bounds for the commissioning window (spec §8 boundary
/// behaviors): a requested duration below 3s is raised to 3s; above 3h is
/// lowered to 3h.
pub const MIN_COMMISSIONING_WINDOW: Duration = Duration::from_secs(3);
pub const MAX_COMMISSIONING_WINDOW: Duration = Duration::from_secs(10_800);

pub const DEFAULT_COMMISSIONING_WINDOW: Duration = Duration::from_secs(15 * 60);
pub const TEST_MODE_COMMISSIONING_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

pub const DEFAULT_MAX_ZONES: usize = 2;
pub const TEST_MODE_MAX_ZONES: usize = 3;

/// One tier of the PASE backoff step function (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffTier {
    /// Consecutive-failure count at or above which this delay applies.
    pub at_failures: u32,
    pub delay: Duration,
}

/// Default tiers: `{0->0, 1->0, 2->500ms, 3->2s, 4->10s, >=5->60s}`.
pub fn default_backoff_tiers() -> Vec<BackoffTier> {
    vec![
        BackoffTier { at_failures: 0, delay: Duration::ZERO },
        BackoffTier { at_failures: 1, delay: Duration::ZERO },
        BackoffTier { at_failures: 2, delay: Duration::from_millis(500) },
        BackoffTier { at_failures: 3, delay: Duration::from_secs(2) },
        BackoffTier { at_failures: 4, delay: Duration::from_secs(10) },
        BackoffTier { at_failures: 5, delay: Duration::from_secs(60) },
    ]
}

/// Recognized configuration options (spec §6).
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub discriminator: u16,
    pub setup_code: String,
    pub listen_address: SocketAddr,
    pub max_zones: usize,
    pub failsafe_timeout: Duration,
    pub commissioning_window_duration: Duration,
    pub pase_backoff_enabled: bool,
    pub pase_backoff_tiers: Vec<BackoffTier>,
    pub pase_first_message_timeout: Duration,
    pub handshake_timeout: Duration,
    pub connection_cooldown: Duration,
    pub stale_connection_timeout: Duration,
    pub reaper_interval: Duration,
    pub test_mode: bool,
    pub listen_for_pairing_requests: bool,
}

impl DeviceConfig {
    /// Builds a config with spec-documented defaults, applying the test-mode
    /// overrides for `max_zones` and `commissioning_window_duration`.
    pub fn new(listen_address: SocketAddr, discriminator: u16, setup_code: impl Into<String>) -> Self {
        Self {
            discriminator,
            setup_code: setup_code.into(),
            listen_address,
            max_zones: DEFAULT_MAX_ZONES,
            failsafe_timeout: Duration::from_secs(60),
            commissioning_window_duration: DEFAULT_COMMISSIONING_WINDOW,
            pase_backoff_enabled: true,
            pase_backoff_tiers: default_backoff_tiers(),
            pase_first_message_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            connection_cooldown: Duration::from_secs(2),
            stale_connection_timeout: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(10),
            test_mode: false,
            listen_for_pairing_requests: false,
        }
    }

    pub fn test_mode(mut self) -> Self {
        self.test_mode = true;
        self.max_zones = TEST_MODE_MAX_ZONES;
        self.commissioning_window_duration = TEST_MODE_COMMISSIONING_WINDOW;
        self
    }

    /// Validates and normalizes the configuration. Called once from
    /// `DeviceService::start` (spec §4.10: "Invalid config fails Start with
    /// InvalidConfig").
    pub fn validate(mut self) -> Result<Self, MashError> {
        if self.discriminator > 4095 {
            return Err(MashError::InvalidConfig(format!(
                "discriminator {} exceeds 12-bit range (0-4095)",
                self.discriminator
            )));
        }
        if self.setup_code.len() != 8 || !self.setup_code.chars().all(|c| c.is_ascii_digit()) {
            return Err(MashError::InvalidConfig(
                "setup_code must be exactly 8 digits".into(),
            ));
        }
        if self.max_zones == 0 {
            return Err(MashError::InvalidConfig("max_zones must be at least 1".into()));
        }
        if self.pase_backoff_tiers.is_empty() {
            return Err(MashError::InvalidConfig(
                "pase_backoff_tiers must not be empty".into(),
            ));
        }

        self.commissioning_window_duration = self
            .commissioning_window_duration
            .clamp(MIN_COMMISSIONING_WINDOW, MAX_COMMISSIONING_WINDOW);

        Ok(self)
    }
}
