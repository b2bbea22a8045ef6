//! External interfaces of the MMS core.
//!
//! The core never touches hardware directly. Everything it needs from the
//! printer host is expressed by three traits: [`MotionEngine`] (stepper
//! motion queue, homing primitive, reactor clock), [`Toolhead`] (XYZ moves,
//! extruder, fan) and [`PrintHost`] (print state, pause/resume macros,
//! command responses, LED events). A host implements all three; [`Host`]
//! is the blanket supertrait the core is generic over.

use embassy_time::Duration;

use alloc::string::String;

/// Logical edge of a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Edge {
    /// The sensor entered the triggered state.
    Triggered,
    /// The sensor entered the released state.
    Released,
}

impl Edge {
    /// Edge polarity from a boolean trigger flag.
    pub fn from_trigger(trigger: bool) -> Self {
        if trigger {
            Edge::Triggered
        } else {
            Edge::Released
        }
    }
}

/// One armed endstop of a homing move: the sensor that may end the move
/// and the pin name reported back to the operator.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndstopPair {
    /// Sensor arena index.
    pub sensor: usize,
    /// Stepper arena index the endstop is armed for.
    pub stepper: usize,
    /// Pin name, e.g. `buffer:PA5`.
    pub name: String,
}

/// Engine-level motion fault. Non-recoverable; the core reacts with
/// [`MotionEngine::emergency_stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EngineError;

/// The motion queue and reactor clock of the host firmware.
///
/// Steppers are addressed by their arena index; the host resolves indexes
/// to its own stepper objects once at registration time.
pub trait MotionEngine {
    /// Monotonic reactor time in seconds.
    fn monotonic(&self) -> f64;

    /// Suspend the calling task for `duration`. This is the only generic
    /// suspension point of the core.
    async fn pause(&self, duration: Duration);

    /// Estimated MCU print time for "now".
    fn estimated_print_time(&self) -> f64;

    /// Append a trapezoidal move for `stepper` starting at `print_time`.
    /// Returns the print time at which the move ends.
    fn queue_move(
        &self,
        stepper: usize,
        print_time: f64,
        distance: f64,
        speed: f64,
        accel: f64,
    ) -> Result<f64, EngineError>;

    /// Run a homing move: drive `stepper` over `distance` (signed) and stop
    /// on the first edge of polarity `trigger` on any endstop in
    /// `endstops`, or when the distance is exhausted. Resolves with the
    /// index (into `endstops`) of the endstop that ended the move, or
    /// `None` when the full distance was traveled.
    async fn homing_move(
        &self,
        stepper: usize,
        endstops: &[EndstopPair],
        distance: f64,
        speed: f64,
        accel: f64,
        trigger: Edge,
    ) -> Result<Option<usize>, EngineError>;

    /// Fire a host-request trigger into the in-flight homing dispatch of
    /// `stepper`, forcing [`Self::homing_move`] to drain and return.
    fn break_homing(&self, stepper: usize);

    /// Tear down the homing dispatch after a host-request break.
    fn teardown_homing(&self, stepper: usize);

    /// Raw MCU step counter of the stepper.
    fn stepper_mcu_position(&self, stepper: usize) -> i64;

    /// Distance covered by one step, in mm.
    fn stepper_step_distance(&self, stepper: usize) -> f64;

    /// Reset the commanded stepper position to zero. Keeps the step
    /// compressor from overflowing between unrelated moves.
    fn reset_stepper_position(&self, stepper: usize);

    /// Whether the stepper driver is energized.
    fn motor_enabled(&self, stepper: usize) -> bool;

    /// Energize or release the stepper driver at `print_time`.
    fn set_motor_enabled(&self, stepper: usize, enable: bool, print_time: f64);

    /// Request a full printer shutdown. Invoked only on engine faults.
    fn emergency_stop(&self, reason: &str);
}

/// Toolhead position snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ToolheadPosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub e: f64,
}

/// Toolhead and extruder control.
pub trait Toolhead {
    fn is_homed(&self) -> bool;

    /// Whether the toolhead still has queued or lookahead motion.
    fn is_busy(&self) -> bool;

    /// Print time of the last queued toolhead move.
    fn print_time(&self) -> f64;

    /// Block until all queued toolhead moves finished (M400).
    async fn wait_moves(&self);

    /// Insert a motion-queue dwell of `delay` seconds.
    async fn dwell(&self, delay: f64);

    fn position(&self) -> ToolheadPosition;

    /// Absolute XY move. `speed` is mm/min; `None` uses the configured
    /// swap move speed.
    async fn move_xy(&self, x: f64, y: f64, speed: Option<f64>, wait: bool);

    async fn move_x(&self, x: f64, speed: Option<f64>, wait: bool);

    async fn move_y(&self, y: f64, speed: Option<f64>, wait: bool);

    /// Absolute Z move.
    async fn move_z(&self, z: f64, speed: Option<f64>, wait: bool);

    /// Relative Z move (positive raises).
    async fn move_z_relative(&self, dz: f64);

    fn fan_speed(&self) -> f64;

    fn set_fan_speed(&self, speed: f64);

    // Extruder

    fn extruder_temp(&self) -> f64;

    fn extruder_target_temp(&self) -> f64;

    /// Minimum extrusion temperature of the extruder heater, in °C.
    fn min_extrude_temp(&self) -> f64;

    /// Whether the extruder is hot enough to extrude.
    fn can_extrude(&self) -> bool;

    async fn set_extruder_temperature(&self, temp: f64, wait: bool);

    /// Extrude `distance` mm at `speed` mm/min.
    async fn extrude(&self, distance: f64, speed: f64, wait: bool);

    /// Retract `distance` mm at `speed` mm/min.
    async fn retract(&self, distance: f64, speed: f64, wait: bool);

    /// Commanded extruder position, in mm of filament.
    fn extruder_position(&self) -> f64;

    /// Commanded extruder speed, in mm/s.
    fn extruder_speed(&self) -> f64;

    /// Cross section of the filament in the extruder, in mm².
    fn extruder_filament_area(&self) -> f64;
}

/// Host print state, as reported by the print pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PrintState {
    Standby,
    Printing,
    Paused,
    Finished,
}

/// LED effect identifiers forwarded to the host LED driver. The effect
/// rendering itself lives outside the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LedEffect {
    Marquee,
    Breathing,
    Rainbow,
    Blinking,
}

/// Print pipeline, G-code responses and LED events.
pub trait PrintHost {
    fn is_shutdown(&self) -> bool;

    fn print_state(&self) -> PrintState;

    /// Whether a pause has been requested but not yet reached
    /// (the virtual-sdcard pause flag).
    fn pause_pending(&self) -> bool;

    /// Filename of the active print, if any.
    fn print_filename(&self) -> Option<String>;

    /// Run the host `PAUSE` macro.
    async fn run_pause(&self);

    /// Run the host's original resume path. The MMS resume wrapper always
    /// forwards here so the host state machine advances.
    async fn run_resume(&self);

    /// Run a custom host macro by name.
    async fn run_macro(&self, name: &str);

    /// Override the host paused flag. Used to re-assert "paused" after a
    /// failed MMS resume.
    fn set_paused_flag(&self, paused: bool);

    /// Emit a G-code console response.
    fn respond(&self, msg: &str);

    /// Refresh a slot LED to its idle indication.
    fn led_notify(&self, slot: usize);

    /// Start or stop an LED effect on a slot.
    fn led_effect(&self, slot: usize, effect: LedEffect, reverse: bool, activate: bool);
}

/// Everything the core needs from the host.
pub trait Host: MotionEngine + Toolhead + PrintHost {}

impl<T: MotionEngine + Toolhead + PrintHost> Host for T {}

/// Split a move into its trapezoid parameters, the way the motion queue
/// expects them: `(axis_r, accel_t, cruise_t, cruise_v)`.
pub fn calc_move_time(distance: f64, speed: f64, accel: f64) -> (f64, f64, f64, f64) {
    let axis_r = if distance < 0.0 { -1.0 } else { 1.0 };
    let distance = crate::fabs(distance);
    if accel <= 0.0 || distance == 0.0 {
        return (axis_r, 0.0, if speed > 0.0 { distance / speed } else { 0.0 }, speed);
    }
    let mut cruise_v = speed;
    let max_cruise_v2 = distance * accel;
    if cruise_v * cruise_v > max_cruise_v2 {
        // Triangular profile, never reaches the requested speed
        cruise_v = crate::fsqrt(max_cruise_v2);
    }
    let accel_t = cruise_v / accel;
    let accel_d = 0.5 * cruise_v * accel_t;
    let cruise_t = (distance - 2.0 * accel_d) / cruise_v;
    (axis_r, accel_t, cruise_t, cruise_v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trapezoid_with_cruise_phase() {
        let (axis_r, accel_t, cruise_t, cruise_v) = calc_move_time(100.0, 10.0, 100.0);
        assert_eq!(axis_r, 1.0);
        assert_eq!(cruise_v, 10.0);
        assert!((accel_t - 0.1).abs() < 1e-9);
        // 100mm at 10mm/s minus two 0.5mm ramps
        assert!((cruise_t - 9.9).abs() < 1e-9);
    }

    #[test]
    fn triangular_profile_clamps_cruise_velocity() {
        let (_, accel_t, cruise_t, cruise_v) = calc_move_time(1.0, 100.0, 100.0);
        assert!(cruise_v < 100.0);
        assert!((cruise_v - 10.0).abs() < 1e-6);
        assert!((accel_t - 0.1).abs() < 1e-6);
        assert!(cruise_t.abs() < 1e-6);
    }

    #[test]
    fn backward_moves_keep_negative_axis_ratio() {
        let (axis_r, ..) = calc_move_time(-50.0, 10.0, 10.0);
        assert_eq!(axis_r, -1.0);
    }
}
