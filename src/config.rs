//! Typed configuration surface.
//!
//! Values are read once when [`crate::MmsCore`] is constructed; there is no
//! hot reload. Defaults reproduce the shipped tuning of the MMS unit.

use embassy_time::Duration;

use alloc::string::String;
use alloc::vec::Vec;

/// Sensor wiring of one pin. A leading `!` in the pin name inverts the
/// polarity (handled by the sensor layer).
#[derive(Debug, Clone)]
pub struct PinDef {
    /// Pin name, e.g. `buffer:PA5` or `!mms:PB1`.
    pub pin: String,
    /// Sample source: digital button input or ADC edge detection.
    pub adc: bool,
}

impl PinDef {
    pub fn digital(pin: &str) -> Self {
        Self { pin: String::from(pin), adc: false }
    }

    pub fn adc(pin: &str) -> Self {
        Self { pin: String::from(pin), adc: true }
    }
}

/// Per-slot configuration (`[mms slot N]`).
#[derive(Debug, Clone)]
pub struct SlotConfig {
    pub selector: PinDef,
    pub inlet: PinDef,
    pub gate: PinDef,
    /// React to new filament pushed into the inlet.
    pub autoload_enable: bool,
    /// Slot promoted in place of this one on filament fracture.
    pub substitute_with: Option<usize>,
}

/// Per selector/drive set configuration. One set serves four slots and
/// shares one selector stepper, one drive stepper and the outlet /
/// buffer-runout / entry wires.
#[derive(Debug, Clone)]
pub struct SetConfig {
    /// Stepper config section name of the selector.
    pub selector_name: String,
    /// Stepper config section name of the drive.
    pub drive_name: String,
    /// Buffer-full pin, shared by the set.
    pub outlet: PinDef,
    /// Buffer-runout pin, shared by the set.
    pub buffer_runout: PinDef,
    /// Optional toolhead entry sensor pin, shared by the set.
    pub entry: Option<PinDef>,
}

/// Delivery tuning.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub retry_period: Duration,
    /// Short forward correction after the selector pin triggers, in mm.
    pub refine_calibration_distance: f64,

    pub wait_toolhead_interval: Duration,
    pub wait_toolhead_timeout: Duration,
    pub wait_stepper_interval: Duration,
    pub wait_stepper_timeout: Duration,

    pub speed_selector: f64,
    pub accel_selector: f64,
    pub speed_drive: f64,
    pub accel_drive: f64,
    /// Upper bound of any homing travel, in mm.
    pub stepper_move_distance: f64,
    /// Extra retreat after unloading past the gate, in mm.
    pub safety_retract_distance: f64,
    /// Rounds of the slots loop diagnostic.
    pub slots_loop_times: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retry_period: Duration::from_millis(500),
            refine_calibration_distance: 3.7,
            wait_toolhead_interval: Duration::from_millis(500),
            wait_toolhead_timeout: Duration::from_secs(60),
            wait_stepper_interval: Duration::from_millis(200),
            wait_stepper_timeout: Duration::from_secs(5),
            speed_selector: 100.0,
            accel_selector: 100.0,
            speed_drive: 60.0,
            accel_drive: 10.0,
            stepper_move_distance: 1000.0,
            safety_retract_distance: 50.0,
            slots_loop_times: 200,
        }
    }
}

/// Stepper layer tuning.
#[derive(Debug, Clone)]
pub struct StepperConfig {
    /// Extra wait when flushing a lagging print time, in seconds.
    pub wait_delay: f64,
    /// Print-time headroom added in front of every queued move, in seconds.
    pub interval_time: f64,
    /// Segment length of cancellable drip moves, in mm.
    pub selector_drip_segment: f64,
    pub drive_drip_segment: f64,
    /// Settle time after a host-request homing break.
    pub break_delay: Duration,
}

impl Default for StepperConfig {
    fn default() -> Self {
        Self {
            wait_delay: 0.05,
            interval_time: 1.0,
            selector_drip_segment: 0.2,
            drive_drip_segment: 0.2,
            break_delay: Duration::from_millis(100),
        }
    }
}

/// Compliance-buffer tuning.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Spring stroke between max compression and max relaxation, in mm.
    pub spring_stroke: f64,
    /// Filament diameter inside the buffer, in mm.
    pub filament_diameter: f64,
    /// Target fill of the buffer, in percent of capacity.
    pub target_percentage: f64,
    /// Smallest volume worth a feed or retract move, in mm³.
    pub min_deliver_volume: f64,
    pub measure_speed: f64,
    pub measure_accel: f64,
    /// Period of the extruder monitor task.
    pub monitor_period: Duration,
    /// Extruder sample rejection bounds, in mm per tick.
    pub e_distance_moved_min: f64,
    pub e_distance_moved_max: f64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            spring_stroke: 20.0,
            filament_diameter: 1.75,
            target_percentage: 50.0,
            min_deliver_volume: 2.0,
            measure_speed: 10.0,
            measure_accel: 10.0,
            monitor_period: Duration::from_millis(200),
            e_distance_moved_min: -20.0,
            e_distance_moved_max: 100.0,
        }
    }
}

impl BufferConfig {
    /// Filament cross section, in mm².
    pub fn cross_section(&self) -> f64 {
        core::f64::consts::PI * (self.filament_diameter * 0.5) * (self.filament_diameter * 0.5)
    }

    /// Nominal buffer capacity, in mm³.
    pub fn max_volume(&self) -> f64 {
        self.cross_section() * self.spring_stroke
    }

    pub fn min_volume(&self) -> f64 {
        0.0
    }

    pub fn target_volume(&self) -> f64 {
        (self.max_volume() - self.min_volume()) * self.target_percentage / 100.0
    }
}

/// Swap sequencing.
#[derive(Debug, Clone)]
pub struct SwapConfig {
    pub enable: bool,
    /// Z lift during swap operations, in mm.
    pub z_raise: f64,
    /// Prefix of the slicer swap command, usually `T`.
    pub command_string: String,
    /// Toolhead travel speed during swap phases, in mm/min.
    pub toolhead_move_speed: f64,
    pub custom_before: Option<String>,
    pub custom_after: Option<String>,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            enable: true,
            z_raise: 1.0,
            command_string: String::from("T"),
            toolhead_move_speed: 24000.0,
            custom_before: None,
            custom_after: None,
        }
    }
}

/// Charge phase tuning.
#[derive(Debug, Clone)]
pub struct ChargeConfig {
    pub z_raise: f64,
    /// Extrusion per cycle of the standard charge, in mm.
    pub extrude_distance: f64,
    pub extrude_times: u32,
    /// Extrusion speed, in mm/min.
    pub extrude_speed: f64,
    /// Extrusion per drip of the careful charge, in mm.
    pub drip_extrude_distance: f64,
    /// Extra travel past the spring stroke during careful charge, in mm.
    pub drip_extra_distance: f64,
    /// Retraction applied when a charge attempt failed, in mm.
    pub distance_unload: f64,
    pub custom_before: Option<String>,
    pub custom_after: Option<String>,
}

impl Default for ChargeConfig {
    fn default() -> Self {
        Self {
            z_raise: 1.0,
            extrude_distance: 2.0,
            extrude_times: 5,
            extrude_speed: 300.0,
            drip_extrude_distance: 1.0,
            drip_extra_distance: 10.0,
            distance_unload: 120.0,
            custom_before: None,
            custom_after: None,
        }
    }
}

/// Eject phase tuning.
#[derive(Debug, Clone)]
pub struct EjectConfig {
    pub z_raise: f64,
    /// Retraction per pulse, in mm.
    pub retract_distance: f64,
    pub retract_times: u32,
    /// Retraction speed, in mm/min.
    pub retract_speed: f64,
    /// Drive speed/accel of the slow unload, in mm/s and mm/s².
    pub drive_speed: f64,
    pub drive_accel: f64,
    /// Total unload travel, in mm.
    pub distance_unload: f64,
    pub custom_before: Option<String>,
    pub custom_after: Option<String>,
}

impl Default for EjectConfig {
    fn default() -> Self {
        Self {
            z_raise: 1.0,
            retract_distance: 10.0,
            retract_times: 100,
            retract_speed: 1200.0,
            drive_speed: 20.0,
            drive_accel: 20.0,
            distance_unload: 120.0,
            custom_before: None,
            custom_after: None,
        }
    }
}

/// Purge phase tuning.
#[derive(Debug, Clone)]
pub struct PurgeConfig {
    pub enable: bool,
    pub z_raise: f64,
    pub fan_cooldown_speed: f64,
    /// Cooldown wait, in seconds.
    pub fan_cooldown_wait: f64,
    /// Extrusion speed during purging, in mm/min.
    pub purge_speed: f64,
    /// Orphan filament below the cutter, in mm.
    pub orphan_filament_length: f64,
    pub purge_modifier: f64,
    /// Retraction after purge, bounded by the spring stroke, in mm.
    pub retraction_compensation: f64,
    pub retract_speed: f64,
    pub nozzle_priming_dist: f64,
    pub nozzle_priming_speed: f64,
    pub pulse_clean_enable: bool,
    pub pulse_rest_time: f64,
    pub pulse_count: u32,
    pub pulse_speed: f64,
    pub pulse_retract_dist: f64,
    pub pulse_extrude_dist: f64,
    pub tray_point: (f64, f64),
    pub eject_point: (f64, f64),
    pub custom_before: Option<String>,
    pub custom_after: Option<String>,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            enable: true,
            z_raise: 1.0,
            fan_cooldown_speed: 1.0,
            fan_cooldown_wait: 2.0,
            purge_speed: 600.0,
            orphan_filament_length: 60.0,
            purge_modifier: 2.5,
            retraction_compensation: 3.0,
            retract_speed: 10000.0,
            nozzle_priming_dist: 20.0,
            nozzle_priming_speed: 600.0,
            pulse_clean_enable: false,
            pulse_rest_time: 0.1,
            pulse_count: 4,
            pulse_speed: 1200.0,
            pulse_retract_dist: 10.0,
            pulse_extrude_dist: 5.0,
            tray_point: (60.0, 100.0),
            eject_point: (60.0, 100.0),
            custom_before: None,
            custom_after: None,
        }
    }
}

/// Brush phase tuning.
#[derive(Debug, Clone)]
pub struct BrushConfig {
    pub enable: bool,
    pub z_raise: f64,
    pub fan_cooldown_speed: f64,
    pub fan_cooldown_wait: f64,
    pub wipe_points: Vec<(f64, f64)>,
    pub wipe_speed: f64,
    pub wipe_times: u32,
    pub peck_point: Option<(f64, f64)>,
    pub peck_speed: f64,
    pub peck_depth: f64,
    pub peck_times: u32,
    pub custom_before: Option<String>,
    pub custom_after: Option<String>,
}

impl Default for BrushConfig {
    fn default() -> Self {
        Self {
            enable: true,
            z_raise: 1.0,
            fan_cooldown_speed: 1.0,
            fan_cooldown_wait: 1.0,
            wipe_points: alloc::vec![(90.0, 300.0), (60.0, 300.0)],
            wipe_speed: 10000.0,
            wipe_times: 5,
            peck_point: Some((150.0, 300.0)),
            peck_speed: 10000.0,
            peck_depth: 2.0,
            peck_times: 0,
            custom_before: None,
            custom_after: None,
        }
    }
}

/// Cutter tuning.
#[derive(Debug, Clone)]
pub struct CutConfig {
    pub enable: bool,
    pub z_raise: f64,
    /// Travel speed from init to final point, in mm/min.
    pub cut_speed: f64,
    pub cutter_init_point: (f64, f64),
    pub cutter_final_point: (f64, f64),
}

impl Default for CutConfig {
    fn default() -> Self {
        Self {
            enable: true,
            z_raise: 1.0,
            cut_speed: 2000.0,
            cutter_init_point: (40.0, 50.0),
            cutter_final_point: (20.0, 50.0),
        }
    }
}

/// Autoload tuning.
#[derive(Debug, Clone)]
pub struct AutoloadConfig {
    /// Quiet time after startup before autoload may fire.
    pub delay: Duration,
    pub execute_stop_delay: Duration,
}

impl Default for AutoloadConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(3),
            execute_stop_delay: Duration::from_millis(300),
        }
    }
}

/// Filament fracture handling.
#[derive(Debug, Clone)]
pub struct FractureConfig {
    /// Fixed retreat after a fracture, in mm.
    pub unload_distance: f64,
    /// Upper bound of recovery purging, in mm of extrusion.
    pub extrude_distance_max: f64,
}

impl Default for FractureConfig {
    fn default() -> Self {
        Self {
            unload_distance: 100.0,
            extrude_distance_max: 3000.0,
        }
    }
}

/// Top-level core configuration.
#[derive(Debug, Clone)]
pub struct MmsConfig {
    pub slots: Vec<SlotConfig>,
    pub sets: Vec<SetConfig>,
    pub retry_times: u32,
    pub fracture_detection_enable: bool,
    pub slot_substitute_enable: bool,
    pub delivery: DeliveryConfig,
    pub stepper: StepperConfig,
    pub buffer: BufferConfig,
    pub swap: SwapConfig,
    pub charge: ChargeConfig,
    pub eject: EjectConfig,
    pub purge: PurgeConfig,
    pub brush: BrushConfig,
    pub cut: CutConfig,
    pub autoload: AutoloadConfig,
    pub fracture: FractureConfig,
}

impl MmsConfig {
    /// Number of slots one set serves.
    pub const SLOTS_PER_SET: usize = 4;

    /// The set a slot belongs to.
    pub fn set_of(slot: usize) -> usize {
        slot / Self::SLOTS_PER_SET
    }
}
