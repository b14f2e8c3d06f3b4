//! Jet warm-up.
//!
//! Before the first run of a session the jet is ignited at a high setpoint,
//! held at a moderate one until the discharge and the substrate have
//! stabilised, and switched off again. The hold can take a quarter of an
//! hour, so the remaining time is logged at a fixed interval.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{error, info};

use crate::error::{AppResult, DaqError};
use crate::hardware::DeviceRegistry;

/// Setpoints and timing of a warm-up.
#[derive(Debug, Clone, PartialEq)]
pub struct WarmupPlan {
    /// Ignition power, W.
    pub ignition_power: f64,
    /// Ignition flow, slm.
    pub ignition_flow: f64,
    /// Time at the ignition setpoint.
    pub ignition_hold: Duration,
    /// Holding power, W.
    pub hold_power: f64,
    /// Holding flow, slm.
    pub hold_flow: f64,
    /// Time at the holding setpoint.
    pub hold: Duration,
    /// Duty cycle sent with every command, %.
    pub duty_cycle: f64,
    /// Interval between progress messages.
    pub progress_every: Duration,
}

impl Default for WarmupPlan {
    fn default() -> Self {
        Self {
            ignition_power: 4.0,
            ignition_flow: 3.0,
            ignition_hold: Duration::from_secs(4),
            hold_power: 2.0,
            hold_flow: 2.0,
            hold: Duration::from_secs(15 * 60),
            duty_cycle: 100.0,
            progress_every: Duration::from_secs(5 * 60),
        }
    }
}

impl WarmupPlan {
    /// Check setpoints before anything is sent to the jet.
    pub fn validate(&self) -> AppResult<()> {
        let setpoints = [
            ("ignition_power", self.ignition_power),
            ("ignition_flow", self.ignition_flow),
            ("hold_power", self.hold_power),
            ("hold_flow", self.hold_flow),
        ];
        for (name, value) in setpoints {
            if !value.is_finite() || value < 0.0 {
                return Err(DaqError::Configuration(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        if !(0.0..=100.0).contains(&self.duty_cycle) {
            return Err(DaqError::Configuration(format!(
                "duty_cycle must be within 0-100 %, got {}",
                self.duty_cycle
            )));
        }
        Ok(())
    }
}

/// Ignite, hold and switch the jet off.
///
/// A failed command stops the warm-up; the off command is still attempted
/// before the error is returned.
pub async fn warm_up(registry: &DeviceRegistry, plan: &WarmupPlan) -> AppResult<()> {
    plan.validate()?;
    let started = Instant::now();

    info!(
        power = plan.ignition_power,
        flow = plan.ignition_flow,
        "Igniting plasma"
    );
    actuate_or_stop(registry, plan, plan.ignition_power, plan.ignition_flow).await?;
    sleep(plan.ignition_hold).await;

    info!(
        power = plan.hold_power,
        flow = plan.hold_flow,
        hold_s = plan.hold.as_secs(),
        "Holding for warm-up"
    );
    actuate_or_stop(registry, plan, plan.hold_power, plan.hold_flow).await?;

    let step = if plan.progress_every.is_zero() {
        plan.hold
    } else {
        plan.progress_every
    };
    let mut remaining = plan.hold;
    while !remaining.is_zero() {
        let pause = step.min(remaining);
        sleep(pause).await;
        remaining -= pause;
        info!(remaining_s = remaining.as_secs(), "Warm-up in progress");
    }

    registry.actuate(0.0, 0.0, plan.duty_cycle).await?;
    info!(
        elapsed_s = started.elapsed().as_secs(),
        "Warm-up complete, plasma switched off"
    );
    Ok(())
}

async fn actuate_or_stop(registry: &DeviceRegistry, plan: &WarmupPlan, power: f64, flow: f64) -> AppResult<()> {
    if let Err(e) = registry.actuate(power, flow, plan.duty_cycle).await {
        error!(error = %e, "Warm-up command failed, switching the jet off");
        if let Err(off) = registry.actuate(0.0, 0.0, plan.duty_cycle).await {
            error!(error = %off, "Shutdown actuation failed, switch the jet off manually");
        }
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockRig;
    use crate::hardware::RequiredDevice;

    #[tokio::test(start_paused = true)]
    async fn ignites_holds_then_switches_off() {
        let rig = MockRig::new(Duration::ZERO);
        let plan = WarmupPlan {
            hold: Duration::from_secs(90),
            progress_every: Duration::from_secs(60),
            ..WarmupPlan::default()
        };

        let start = Instant::now();
        warm_up(&rig.registry(), &plan).await.unwrap();

        assert_eq!(
            rig.microcontroller.actuations().await,
            vec![(4.0, 3.0, 100.0), (2.0, 2.0, 100.0), (0.0, 0.0, 100.0)]
        );
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(94) && elapsed < Duration::from_secs(95));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_command_is_returned() {
        let rig = MockRig::new(Duration::ZERO);
        rig.microcontroller.fail_actuation(true);

        let err = warm_up(&rig.registry(), &WarmupPlan::default()).await.unwrap_err();
        assert!(matches!(err, DaqError::Driver(_)));
        assert!(rig.microcontroller.actuations().await.is_empty());
    }

    #[tokio::test]
    async fn missing_actuator_and_bad_setpoints_are_rejected() {
        let err = warm_up(&DeviceRegistry::new(), &WarmupPlan::default()).await.unwrap_err();
        assert!(matches!(err, DaqError::MissingDevice(RequiredDevice::Actuator)));

        let rig = MockRig::new(Duration::ZERO);
        let plan = WarmupPlan {
            hold_power: -1.0,
            ..WarmupPlan::default()
        };
        assert!(matches!(
            warm_up(&rig.registry(), &plan).await,
            Err(DaqError::Configuration(_))
        ));
        assert!(rig.microcontroller.actuations().await.is_empty());
    }
}
