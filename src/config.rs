//! Environment-driven configuration for both node roles.
//!
//! Safety-critical timing lives in [`crate::constants`] and cannot be
//! overridden here. Everything else - addresses, ports, camera devices,
//! storage paths, autocut tuning - comes from environment variables with
//! conservative defaults, so a bare `serpent-bridge robot` on the bench
//! does something sensible.
//!
//! # Key variables
//!
//! - `SERPENT_PSK_HEX` - 64-hex-char pre-shared key (see `framing`)
//! - `SIM_MODE` - replace hardware drivers with deterministic mocks
//! - `BASE_PI_IP` / `ROBOT_PI_IP` - peer addresses
//! - `CONTROL_PORT` / `VIDEO_PORT` / `TELEMETRY_PORT` - channel ports
//! - `DISABLE_WATCHDOG_FOR_LOCAL_TESTING` - skip safety timeouts (warns)
//! - `ALLOW_LOCAL_ESTOP_CLEAR` - deployment gate for dashboard-local clears
//! - `LOG_LEVEL`, `STORAGE_BASE_PATH`, `TELEMETRY_RETENTION_DAYS`

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::{
    DEFAULT_CONTROL_PORT, DEFAULT_TELEMETRY_PORT, DEFAULT_VIDEO_PORT, TELEMETRY_INTERVAL,
};

/// Read and parse an environment variable, falling back to `default` on
/// absence or a parse failure (the failure is logged, not fatal).
fn env_parse<T: FromStr>(key: &str, default: T) -> T
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Ignoring invalid {key}={raw:?}: {e}");
                default
            }
        },
        Err(_) => default,
    }
}

/// Boolean flag: `true` (case-insensitive) enables, anything else disables.
fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

/// I2C address: accepts decimal or `0x`-prefixed hex.
fn env_addr(key: &str, default: u8) -> u8 {
    match std::env::var(key) {
        Ok(raw) => {
            let raw = raw.trim();
            let parsed = raw
                .strip_prefix("0x")
                .or_else(|| raw.strip_prefix("0X"))
                .map_or_else(|| raw.parse(), |hex| u8::from_str_radix(hex, 16));
            match parsed {
                Ok(addr) => addr,
                Err(e) => {
                    log::warn!("Ignoring invalid {key}={raw:?}: {e}");
                    default
                }
            }
        }
        Err(_) => default,
    }
}

/// Autonomous cutter tuning.
#[derive(Debug, Clone, Copy)]
pub struct AutocutConfig {
    /// Back off above this feed current (amps).
    pub high_current: f64,
    /// Re-advance below this current (amps).
    pub safe_current: f64,
    /// Breakthrough threshold (amps).
    pub idle_current: f64,
    /// Feed motor advance speed (0..=800).
    pub advance_speed: i16,
    /// Feed motor backoff speed (0..=800).
    pub backoff_speed: i16,
    /// Current must stay below idle this long to confirm the cut.
    pub breakthrough_confirm: Duration,
    /// Control loop sleep interval.
    pub loop_interval: Duration,
    /// Blade on/off motor speed (0..=800).
    pub onoff_speed: i16,
}

impl Default for AutocutConfig {
    fn default() -> Self {
        Self {
            high_current: 8.0,
            safe_current: 5.0,
            idle_current: 2.0,
            advance_speed: 300,
            backoff_speed: 500,
            breakthrough_confirm: Duration::from_millis(500),
            loop_interval: Duration::from_millis(100),
            onoff_speed: 720,
        }
    }
}

impl AutocutConfig {
    fn from_env() -> Self {
        let d = Self::default();
        Self {
            high_current: env_parse("AUTOCUT_HIGH_CURRENT_A", d.high_current),
            safe_current: env_parse("AUTOCUT_SAFE_CURRENT_A", d.safe_current),
            idle_current: env_parse("AUTOCUT_IDLE_CURRENT_A", d.idle_current),
            advance_speed: env_parse("AUTOCUT_ADVANCE_SPEED", d.advance_speed),
            backoff_speed: env_parse("AUTOCUT_BACKOFF_SPEED", d.backoff_speed),
            breakthrough_confirm: Duration::from_secs_f64(env_parse(
                "AUTOCUT_BREAKTHROUGH_CONFIRM_S",
                d.breakthrough_confirm.as_secs_f64(),
            )),
            loop_interval: Duration::from_secs_f64(env_parse(
                "AUTOCUT_LOOP_INTERVAL_S",
                d.loop_interval.as_secs_f64(),
            )),
            onoff_speed: env_parse("AUTOCUT_ONOFF_SPEED", d.onoff_speed),
        }
    }
}

/// Robot node configuration.
#[derive(Debug, Clone)]
pub struct RobotConfig {
    /// Base station address (telemetry and video targets).
    pub base_ip: String,
    /// Control server port (this node listens).
    pub control_port: u16,
    /// Video target port on the base.
    pub video_port: u16,
    /// Telemetry target port on the base.
    pub telemetry_port: u16,
    /// Hardware replaced by deterministic mocks.
    pub sim_mode: bool,
    /// Skip watchdog safety checks (local bench testing only).
    pub disable_watchdog: bool,
    /// Allow `clear_estop_local` from a same-host dashboard.
    pub allow_local_estop_clear: bool,
    /// Telemetry send cadence.
    pub telemetry_interval: Duration,
    /// Sensor poll cadence.
    pub sensor_read_interval: Duration,
    /// Ordered camera device identifiers.
    pub camera_devices: Vec<String>,
    /// Video streaming enabled.
    pub video_enabled: bool,
    /// Motor driver board addresses (I2C).
    pub motoron_addresses: Vec<u8>,
    /// Autocut tuning.
    pub autocut: AutocutConfig,
}

impl RobotConfig {
    /// Assemble robot configuration from the environment.
    pub fn from_env() -> Self {
        let num_cameras: usize = env_parse("NUM_CAMERAS", 3);
        let default_devices = ["/dev/video0", "/dev/video2", "/dev/video4"];
        let camera_devices = (0..num_cameras)
            .map(|i| {
                env_string(
                    &format!("CAMERA_{i}"),
                    default_devices.get(i).copied().unwrap_or("/dev/video0"),
                )
            })
            .collect();

        Self {
            base_ip: env_string("BASE_PI_IP", "192.168.100.1"),
            control_port: env_parse("CONTROL_PORT", DEFAULT_CONTROL_PORT),
            video_port: env_parse("VIDEO_PORT", DEFAULT_VIDEO_PORT),
            telemetry_port: env_parse("TELEMETRY_PORT", DEFAULT_TELEMETRY_PORT),
            sim_mode: env_flag("SIM_MODE"),
            disable_watchdog: env_flag("DISABLE_WATCHDOG_FOR_LOCAL_TESTING"),
            allow_local_estop_clear: env_flag("ALLOW_LOCAL_ESTOP_CLEAR"),
            telemetry_interval: Duration::from_secs_f64(env_parse(
                "TELEMETRY_INTERVAL",
                TELEMETRY_INTERVAL.as_secs_f64(),
            )),
            sensor_read_interval: Duration::from_secs_f64(env_parse(
                "SENSOR_READ_INTERVAL",
                0.1,
            )),
            camera_devices,
            video_enabled: !matches!(
                std::env::var("VIDEO_ENABLED").as_deref().map(str::trim),
                Ok("false") | Ok("FALSE") | Ok("False")
            ),
            motoron_addresses: vec![
                env_addr("MOTORON_ADDR_0", 0x10),
                env_addr("MOTORON_ADDR_1", 0x11),
                env_addr("MOTORON_ADDR_2", 0x12),
                env_addr("MOTORON_ADDR_3", 0x13),
            ],
            autocut: AutocutConfig::from_env(),
        }
    }
}

/// Base station configuration.
#[derive(Debug, Clone)]
pub struct BaseConfig {
    /// Robot address (control target).
    pub robot_ip: String,
    /// Control target port on the robot.
    pub control_port: u16,
    /// Video server port (this node listens).
    pub video_port: u16,
    /// Telemetry server port (this node listens).
    pub telemetry_port: u16,
    /// Telemetry ring buffer capacity in samples.
    pub telemetry_buffer_samples: usize,
    /// Root directory for on-disk telemetry and video storage.
    pub storage_base: PathBuf,
    /// Days of telemetry files to retain.
    pub telemetry_retention_days: u32,
    /// Telemetry storage enabled.
    pub storage_enabled: bool,
    /// Days of video recordings to retain.
    pub video_retention_days: u32,
    /// Video recording to disk enabled.
    pub video_recording_enabled: bool,
    /// Condensed controller telemetry rate (Hz).
    pub controller_rate_hz: f64,
}

impl BaseConfig {
    /// Assemble base configuration from the environment.
    pub fn from_env() -> Self {
        let storage_base = std::env::var("STORAGE_BASE_PATH").map_or_else(
            |_| {
                dirs::data_local_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("serpent")
            },
            PathBuf::from,
        );

        Self {
            robot_ip: env_string("ROBOT_PI_IP", "192.168.100.2"),
            control_port: env_parse("CONTROL_PORT", DEFAULT_CONTROL_PORT),
            video_port: env_parse("VIDEO_PORT", DEFAULT_VIDEO_PORT),
            telemetry_port: env_parse("TELEMETRY_PORT", DEFAULT_TELEMETRY_PORT),
            telemetry_buffer_samples: env_parse("TELEMETRY_BUFFER_SAMPLES", 600),
            storage_base,
            telemetry_retention_days: env_parse("TELEMETRY_RETENTION_DAYS", 30),
            storage_enabled: !env_flag("DISABLE_TELEMETRY_STORAGE"),
            video_retention_days: env_parse("VIDEO_RETENTION_DAYS", 7),
            video_recording_enabled: !env_flag("DISABLE_VIDEO_RECORDING"),
            controller_rate_hz: env_parse(
                "CONTROLLER_TELEMETRY_RATE_HZ",
                crate::constants::CONTROLLER_TELEMETRY_RATE_HZ,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_autocut_defaults_satisfy_ordering() {
        let cfg = AutocutConfig::default();
        // idle < safe < high, or the state machine cannot settle.
        assert!(cfg.idle_current < cfg.safe_current);
        assert!(cfg.safe_current < cfg.high_current);
        assert!(cfg.advance_speed > 0 && cfg.advance_speed <= 800);
        assert!(cfg.backoff_speed > 0 && cfg.backoff_speed <= 800);
    }

    #[test]
    fn test_env_parse_falls_back_on_garbage() {
        std::env::set_var("SERPENT_TEST_PORT", "not-a-port");
        let port: u16 = env_parse("SERPENT_TEST_PORT", 1234);
        assert_eq!(port, 1234);
        std::env::remove_var("SERPENT_TEST_PORT");
    }

    #[test]
    fn test_env_addr_accepts_hex_and_decimal() {
        std::env::set_var("SERPENT_TEST_ADDR", "0x4A");
        assert_eq!(env_addr("SERPENT_TEST_ADDR", 0), 0x4a);
        std::env::set_var("SERPENT_TEST_ADDR", "16");
        assert_eq!(env_addr("SERPENT_TEST_ADDR", 0), 16);
        std::env::remove_var("SERPENT_TEST_ADDR");
        assert_eq!(env_addr("SERPENT_TEST_ADDR", 0x77), 0x77);
    }

    #[test]
    fn test_env_flag_semantics() {
        std::env::set_var("SERPENT_TEST_FLAG", "TRUE");
        assert!(env_flag("SERPENT_TEST_FLAG"));
        std::env::set_var("SERPENT_TEST_FLAG", "1");
        assert!(!env_flag("SERPENT_TEST_FLAG"));
        std::env::remove_var("SERPENT_TEST_FLAG");
        assert!(!env_flag("SERPENT_TEST_FLAG"));
    }
}
