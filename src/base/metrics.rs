//! Derived telemetry metrics: orientation, health score, threshold
//! alerts, and the condensed controller view.
//!
//! Everything here is a pure function over one [`TelemetrySnapshot`],
//! computed on demand on the base station - the robot never spends
//! cycles on it.

use serde::Serialize;

use crate::protocol::TelemetrySnapshot;

// Threshold definitions: (green, yellow). Beyond yellow is red.
const RTT_MS_THRESHOLDS: (f64, f64) = (100.0, 500.0);
const CONTROL_AGE_MS_THRESHOLDS: (f64, f64) = (2000.0, 4000.0);
const MOTOR_CURRENT_THRESHOLDS: (f64, f64) = (6.0, 8.0);
// Voltage thresholds are floors: below green is a warning, below yellow
// is critical.
const VOLTAGE_THRESHOLDS: (f64, f64) = (11.5, 10.5);
const TOTAL_CURRENT_THRESHOLDS: (f64, f64) = (20.0, 30.0);

/// Euler angles in degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EulerAngles {
    /// Rotation about X.
    pub roll: f64,
    /// Rotation about Y.
    pub pitch: f64,
    /// Rotation about Z.
    pub yaw: f64,
}

/// Convert a quaternion to Euler angles (ZYX convention), in degrees.
///
/// Pitch is clamped to +/-90 degrees at the gimbal singularity using
/// `copysign`.
pub fn quaternion_to_euler(qw: f64, qx: f64, qy: f64, qz: f64) -> EulerAngles {
    // Roll (x-axis rotation).
    let sinr_cosp = 2.0 * (qw * qx + qy * qz);
    let cosr_cosp = 1.0 - 2.0 * (qx * qx + qy * qy);
    let roll = sinr_cosp.atan2(cosr_cosp);

    // Pitch (y-axis rotation).
    let sinp = 2.0 * (qw * qy - qz * qx);
    let pitch = if sinp.abs() >= 1.0 {
        (std::f64::consts::FRAC_PI_2).copysign(sinp)
    } else {
        sinp.asin()
    };

    // Yaw (z-axis rotation).
    let siny_cosp = 2.0 * (qw * qz + qx * qy);
    let cosy_cosp = 1.0 - 2.0 * (qy * qy + qz * qz);
    let yaw = siny_cosp.atan2(cosy_cosp);

    EulerAngles {
        roll: roll.to_degrees(),
        pitch: pitch.to_degrees(),
        yaw: yaw.to_degrees(),
    }
}

/// Overall health score, 0 (critical) to 100 (excellent).
///
/// E-STOP engaged is an immediate 0. Otherwise penalties accumulate:
/// RTT (-10/-20), control age (-10/-20), voltage (-15/-30), per-motor
/// current (-5/-15), total current (-5/-15). Clamped to 0..=100.
pub fn health_score(telemetry: &TelemetrySnapshot) -> u8 {
    if telemetry.estop.engaged {
        return 0;
    }

    let mut score: i32 = 100;

    let rtt = telemetry.rtt_ms as f64;
    if rtt > RTT_MS_THRESHOLDS.1 {
        score -= 20;
    } else if rtt > RTT_MS_THRESHOLDS.0 {
        score -= 10;
    }

    let control_age = telemetry.control_age_ms as f64;
    if control_age > CONTROL_AGE_MS_THRESHOLDS.1 {
        score -= 20;
    } else if control_age > CONTROL_AGE_MS_THRESHOLDS.0 {
        score -= 10;
    }

    let voltage = f64::from(telemetry.voltage);
    if voltage < VOLTAGE_THRESHOLDS.1 {
        score -= 30;
    } else if voltage < VOLTAGE_THRESHOLDS.0 {
        score -= 15;
    }

    if !telemetry.motor_currents.is_empty() {
        let max_current = telemetry
            .motor_currents
            .iter()
            .fold(0.0f64, |acc, c| acc.max(f64::from(*c)));
        let total_current = f64::from(telemetry.total_motor_current());

        if max_current > MOTOR_CURRENT_THRESHOLDS.1 {
            score -= 15;
        } else if max_current > MOTOR_CURRENT_THRESHOLDS.0 {
            score -= 5;
        }

        if total_current > TOTAL_CURRENT_THRESHOLDS.1 {
            score -= 15;
        } else if total_current > TOTAL_CURRENT_THRESHOLDS.0 {
            score -= 5;
        }
    }

    score.clamp(0, 100) as u8
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Elevated but tolerable.
    Yellow,
    /// Out of the safe envelope.
    Red,
}

/// One threshold violation with a human-readable message.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    /// Metric identifier, e.g. `"rtt_ms"` or `"motor_3_current"`.
    pub metric: String,
    /// Observed value.
    pub value: f64,
    /// Severity band.
    pub severity: Severity,
    /// Operator-facing message.
    pub message: String,
}

/// Check a snapshot against all thresholds, returning violations in a
/// stable order (network, control, power, motors, E-STOP).
pub fn check_thresholds(telemetry: &TelemetrySnapshot) -> Vec<Alert> {
    let mut alerts = Vec::new();

    let rtt = telemetry.rtt_ms as f64;
    if rtt > RTT_MS_THRESHOLDS.1 {
        alerts.push(Alert {
            metric: "rtt_ms".into(),
            value: rtt,
            severity: Severity::Red,
            message: format!("High RTT: {}ms", telemetry.rtt_ms),
        });
    } else if rtt > RTT_MS_THRESHOLDS.0 {
        alerts.push(Alert {
            metric: "rtt_ms".into(),
            value: rtt,
            severity: Severity::Yellow,
            message: format!("Elevated RTT: {}ms", telemetry.rtt_ms),
        });
    }

    let control_age = telemetry.control_age_ms as f64;
    if control_age > CONTROL_AGE_MS_THRESHOLDS.1 {
        alerts.push(Alert {
            metric: "control_age_ms".into(),
            value: control_age,
            severity: Severity::Red,
            message: format!("Stale control: {}ms", telemetry.control_age_ms),
        });
    } else if control_age > CONTROL_AGE_MS_THRESHOLDS.0 {
        alerts.push(Alert {
            metric: "control_age_ms".into(),
            value: control_age,
            severity: Severity::Yellow,
            message: format!("Old control: {}ms", telemetry.control_age_ms),
        });
    }

    let voltage = f64::from(telemetry.voltage);
    if voltage < VOLTAGE_THRESHOLDS.1 {
        alerts.push(Alert {
            metric: "voltage".into(),
            value: voltage,
            severity: Severity::Red,
            message: format!("Low battery: {voltage:.1}V"),
        });
    } else if voltage < VOLTAGE_THRESHOLDS.0 {
        alerts.push(Alert {
            metric: "voltage".into(),
            value: voltage,
            severity: Severity::Yellow,
            message: format!("Battery warning: {voltage:.1}V"),
        });
    }

    for (idx, current) in telemetry.motor_currents.iter().enumerate() {
        let current = f64::from(*current);
        if current > MOTOR_CURRENT_THRESHOLDS.1 {
            alerts.push(Alert {
                metric: format!("motor_{idx}_current"),
                value: current,
                severity: Severity::Red,
                message: format!("Motor {idx} overload: {current:.1}A"),
            });
        } else if current > MOTOR_CURRENT_THRESHOLDS.0 {
            alerts.push(Alert {
                metric: format!("motor_{idx}_current"),
                value: current,
                severity: Severity::Yellow,
                message: format!("Motor {idx} high current: {current:.1}A"),
            });
        }
    }

    if !telemetry.motor_currents.is_empty() {
        let total = f64::from(telemetry.total_motor_current());
        if total > TOTAL_CURRENT_THRESHOLDS.1 {
            alerts.push(Alert {
                metric: "total_current".into(),
                value: total,
                severity: Severity::Red,
                message: format!("Total current critical: {total:.1}A"),
            });
        } else if total > TOTAL_CURRENT_THRESHOLDS.0 {
            alerts.push(Alert {
                metric: "total_current".into(),
                value: total,
                severity: Severity::Yellow,
                message: format!("Total current elevated: {total:.1}A"),
            });
        }
    }

    if telemetry.estop.engaged {
        alerts.push(Alert {
            metric: "estop".into(),
            value: 1.0,
            severity: Severity::Red,
            message: format!("E-STOP: {}", telemetry.estop.reason),
        });
    }

    alerts
}

/// Overall status badge for the condensed view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatusBadge {
    /// All metrics within the green band.
    Ok,
    /// At least one red alert.
    Warn,
    /// E-STOP engaged.
    Estop,
}

/// Condensed snapshot forwarded to the operator's controller at <= 1 Hz.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerTelemetry {
    /// Overall status badge.
    pub status: StatusBadge,
    /// Robot timestamp of the underlying snapshot.
    pub timestamp: f64,
    /// E-STOP engaged flag.
    pub estop_engaged: bool,
    /// E-STOP reason tag.
    pub estop_reason: String,
    /// Orientation in degrees, rounded to 0.1.
    pub orientation: EulerAngles,
    /// Altitude in meters, rounded to 0.1.
    pub altitude: f64,
    /// Pressure in mBar, rounded to 0.1.
    pub pressure: f64,
    /// Temperature in degrees C, rounded to 0.1.
    pub temperature: f64,
    /// Battery voltage, rounded to 0.1.
    pub voltage: f64,
    /// Round-trip time in ms.
    pub rtt_ms: i64,
    /// Control age in ms.
    pub control_age_ms: i64,
    /// Per-motor currents, rounded to 0.1 A.
    pub motor_currents: Vec<f64>,
    /// Per-motor "drawing meaningful current" flags (> 0.5 A).
    pub motors_active: Vec<bool>,
    /// Total motor current, rounded to 0.1 A.
    pub total_motor_current: f64,
    /// Operator height cache, rounded.
    pub height: f64,
    /// Operator force cache, rounded.
    pub force: f64,
    /// Acceleration magnitude (vibration monitoring), rounded to 0.01.
    pub accel_magnitude: f64,
    /// Top three alert messages.
    pub alerts: Vec<String>,
    /// Total alert count.
    pub alert_count: usize,
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Build the condensed controller view from a full snapshot.
pub fn format_for_controller(telemetry: &TelemetrySnapshot) -> ControllerTelemetry {
    let alerts = check_thresholds(telemetry);

    let status = if telemetry.estop.engaged {
        StatusBadge::Estop
    } else if alerts.iter().any(|a| a.severity == Severity::Red) {
        StatusBadge::Warn
    } else {
        StatusBadge::Ok
    };

    let orientation = telemetry.imu.map_or_else(EulerAngles::default, |imu| {
        let euler = quaternion_to_euler(imu.quat_w, imu.quat_x, imu.quat_y, imu.quat_z);
        EulerAngles {
            roll: round1(euler.roll),
            pitch: round1(euler.pitch),
            yaw: round1(euler.yaw),
        }
    });

    let accel_magnitude = telemetry.imu.map_or(0.0, |imu| {
        round2((imu.accel_x.powi(2) + imu.accel_y.powi(2) + imu.accel_z.powi(2)).sqrt())
    });

    let (altitude, pressure, temperature) = telemetry.barometer.map_or((0.0, 0.0, 0.0), |baro| {
        (
            round1(baro.altitude),
            // hPa is numerically equal to mBar.
            round1(baro.pressure),
            round1(baro.temperature),
        )
    });

    let motor_currents: Vec<f64> = telemetry
        .motor_currents
        .iter()
        .map(|c| round1(f64::from(*c)))
        .collect();
    let motors_active = telemetry
        .motor_currents
        .iter()
        .map(|c| f64::from(*c) > 0.5)
        .collect();

    ControllerTelemetry {
        status,
        timestamp: telemetry.timestamp,
        estop_engaged: telemetry.estop.engaged,
        estop_reason: telemetry.estop.reason.as_str().to_owned(),
        orientation,
        altitude,
        pressure,
        temperature,
        voltage: round1(f64::from(telemetry.voltage)),
        rtt_ms: telemetry.rtt_ms,
        control_age_ms: telemetry.control_age_ms,
        motor_currents,
        motors_active,
        total_motor_current: round1(f64::from(telemetry.total_motor_current())),
        height: round1(f64::from(telemetry.height)),
        force: round1(f64::from(telemetry.force)),
        accel_magnitude,
        alerts: alerts.iter().take(3).map(|a| a.message.clone()).collect(),
        alert_count: alerts.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EstopReason, EstopStatus, ImuSnapshot};

    fn healthy_snapshot() -> TelemetrySnapshot {
        TelemetrySnapshot {
            timestamp: 1000.0,
            voltage: 12.5,
            height: 0.0,
            force: 0.0,
            chainsaw_force: 0.0,
            rope_force: 0.0,
            imu: Some(ImuSnapshot {
                quat_w: 1.0,
                ..ImuSnapshot::default()
            }),
            barometer: None,
            motor_currents: vec![1.0, 1.0, 0.0, 0.0],
            estop: EstopStatus {
                engaged: false,
                reason: EstopReason::OperatorCommand,
                timestamp: 990.0,
                age_s: 10.0,
            },
            control_age_ms: 150,
            control_established: true,
            control_seq: 10,
            rtt_ms: 30,
            pong: None,
            received_at: None,
        }
    }

    // ── Euler conversion ──────────────────────────────────────────────────

    #[test]
    fn test_identity_quaternion_is_level() {
        let euler = quaternion_to_euler(1.0, 0.0, 0.0, 0.0);
        assert!(euler.roll.abs() < 1e-9);
        assert!(euler.pitch.abs() < 1e-9);
        assert!(euler.yaw.abs() < 1e-9);
    }

    #[test]
    fn test_ninety_degree_yaw() {
        // Rotation of 90 degrees about Z: q = (cos45, 0, 0, sin45).
        let s = std::f64::consts::FRAC_1_SQRT_2;
        let euler = quaternion_to_euler(s, 0.0, 0.0, s);
        assert!((euler.yaw - 90.0).abs() < 1e-6);
        assert!(euler.roll.abs() < 1e-6);
    }

    #[test]
    fn test_pitch_clamped_at_singularity() {
        // Rotation of 90 degrees about Y hits the gimbal singularity.
        let s = std::f64::consts::FRAC_1_SQRT_2;
        let euler = quaternion_to_euler(s, 0.0, s, 0.0);
        assert!((euler.pitch - 90.0).abs() < 1e-6);
    }

    // ── Health score ──────────────────────────────────────────────────────

    #[test]
    fn test_healthy_snapshot_scores_100() {
        assert_eq!(health_score(&healthy_snapshot()), 100);
    }

    #[test]
    fn test_estop_zeroes_the_score() {
        let mut t = healthy_snapshot();
        t.estop.engaged = true;
        assert_eq!(health_score(&t), 0);
    }

    #[test]
    fn test_score_penalties_accumulate() {
        let mut t = healthy_snapshot();
        t.rtt_ms = 600; // -20
        t.control_age_ms = 4500; // -20
        t.voltage = 10.0; // -30
        assert_eq!(health_score(&t), 30);
    }

    #[test]
    fn test_score_clamped_at_zero() {
        let mut t = healthy_snapshot();
        t.rtt_ms = 600;
        t.control_age_ms = 4500;
        t.voltage = 10.0;
        t.motor_currents = vec![9.0, 9.0, 9.0, 9.0]; // max -15, total -15
        assert_eq!(health_score(&t), 0);
    }

    #[test]
    fn test_score_monotone_in_rtt() {
        let mut last = 100;
        for rtt in [0i64, 50, 150, 600, 5000] {
            let mut t = healthy_snapshot();
            t.rtt_ms = rtt;
            let score = health_score(&t);
            assert!(score <= last, "score must not rise with RTT");
            last = score;
        }
    }

    #[test]
    fn test_score_monotone_in_voltage() {
        let mut last = 0;
        for voltage in [9.0f32, 10.6, 11.0, 11.6, 12.6] {
            let mut t = healthy_snapshot();
            t.voltage = voltage;
            let score = health_score(&t);
            assert!(score >= last, "score must not fall with more voltage");
            last = score;
        }
    }

    // ── Alerts ────────────────────────────────────────────────────────────

    #[test]
    fn test_no_alerts_when_healthy() {
        assert!(check_thresholds(&healthy_snapshot()).is_empty());
    }

    #[test]
    fn test_alert_severities() {
        let mut t = healthy_snapshot();
        t.rtt_ms = 200; // yellow
        t.voltage = 10.0; // red
        let alerts = check_thresholds(&t);

        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].metric, "rtt_ms");
        assert_eq!(alerts[0].severity, Severity::Yellow);
        assert_eq!(alerts[1].metric, "voltage");
        assert_eq!(alerts[1].severity, Severity::Red);
    }

    #[test]
    fn test_per_motor_alerts_name_the_motor() {
        let mut t = healthy_snapshot();
        t.motor_currents = vec![0.0, 0.0, 9.5, 0.0];
        let alerts = check_thresholds(&t);
        assert!(alerts.iter().any(|a| a.metric == "motor_2_current"
            && a.severity == Severity::Red));
    }

    #[test]
    fn test_estop_alert_carries_reason() {
        let mut t = healthy_snapshot();
        t.estop.engaged = true;
        t.estop.reason = EstopReason::WatchdogTimeout;
        let alerts = check_thresholds(&t);
        let estop = alerts.last().expect("estop alert");
        assert!(estop.message.contains("watchdog_timeout"));
    }

    // ── Controller view ───────────────────────────────────────────────────

    #[test]
    fn test_controller_view_status_badges() {
        assert_eq!(format_for_controller(&healthy_snapshot()).status, StatusBadge::Ok);

        let mut warn = healthy_snapshot();
        warn.voltage = 10.0;
        assert_eq!(format_for_controller(&warn).status, StatusBadge::Warn);

        let mut estop = healthy_snapshot();
        estop.estop.engaged = true;
        assert_eq!(format_for_controller(&estop).status, StatusBadge::Estop);
    }

    #[test]
    fn test_controller_view_rounding_and_flags() {
        let mut t = healthy_snapshot();
        t.voltage = 12.3456;
        t.motor_currents = vec![0.04, 0.66];
        let view = format_for_controller(&t);

        assert!((view.voltage - 12.3).abs() < 1e-9);
        assert_eq!(view.motors_active, vec![false, true]);
        assert!((view.accel_magnitude - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_controller_view_caps_alert_messages_at_three() {
        let mut t = healthy_snapshot();
        t.rtt_ms = 600;
        t.control_age_ms = 4500;
        t.voltage = 10.0;
        t.motor_currents = vec![9.0, 9.0];
        let view = format_for_controller(&t);

        assert_eq!(view.alerts.len(), 3);
        assert!(view.alert_count > 3);
    }
}
