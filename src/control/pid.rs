// PID correction for gyro-guided motion
//
// turn = kp * error + ki * integral + kd * derivative
//
// The integral is the plain running sum of every error seen this session and
// is never reset or clamped. Saturation is left to the caller.

use tracing::trace;

use crate::config::Gains;

/// Per-session controller memory
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ControlState {
    pub integral: f64,
    pub last_error: f64,
    pub ticks: u64,
}

#[derive(Debug, Clone)]
pub struct Pid {
    gains: Gains,
    state: ControlState,
}

impl Pid {
    pub fn new(gains: Gains) -> Self {
        Self {
            gains,
            state: ControlState::default(),
        }
    }

    /// Feed the latest error and get the correction for this tick
    pub fn update(&mut self, error: f64) -> f64 {
        self.state.integral += error;
        let derivative = error - self.state.last_error;
        self.state.last_error = error;
        self.state.ticks += 1;

        let turn = self.gains.kp * error + self.gains.ki * self.state.integral + self.gains.kd * derivative;
        trace!(
            "pid tick {}: error={}, integral={}, derivative={}, turn={}",
            self.state.ticks, error, self.state.integral, derivative, turn
        );
        turn
    }

    pub fn gains(&self) -> Gains {
        self.gains
    }

    pub fn state(&self) -> ControlState {
        self.state
    }
}
