//! Shared test fixture: a scripted host implementing all three host
//! traits with recorded call logs, plus core constructors.

use core::cell::{Cell, RefCell};

use embassy_time::Duration;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::config::{
    MmsConfig, PinDef, SetConfig, SlotConfig,
};
use crate::host::{
    Edge, EndstopPair, EngineError, LedEffect, MotionEngine, PrintHost, PrintState, Toolhead,
    ToolheadPosition,
};
use crate::slot::PinKind;
use crate::MmsCore;

pub(crate) const STEP_DIST: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct QueuedMove {
    pub print_time: f64,
    pub distance: f64,
    pub speed: f64,
    pub accel: f64,
}

/// Scripted outcome of one `homing_move` call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HomingScript {
    outcome: Result<Option<usize>, EngineError>,
    steps: i64,
}

impl HomingScript {
    /// The endstop at `idx` fires after `steps` raw steps.
    pub fn endstop(idx: usize, steps: i64) -> Self {
        Self { outcome: Ok(Some(idx)), steps }
    }

    /// No endstop fires; the full travel runs out.
    pub fn full_travel(steps: i64) -> Self {
        Self { outcome: Ok(None), steps }
    }

    /// Engine-level fault.
    pub fn fault() -> Self {
        Self { outcome: Err(EngineError), steps: 0 }
    }
}

type HomingHook = Box<dyn Fn(usize)>;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ToolheadOp {
    MoveXY(f64, f64),
    MoveX(f64),
    MoveY(f64),
    MoveZ(f64),
    MoveZRel(f64),
    Dwell(f64),
    WaitMoves,
    Extrude(f64, f64),
    Retract(f64, f64),
    SetTemp(f64, bool),
    SetFan(f64),
}

pub(crate) struct MockHost {
    now: Cell<f64>,

    // Engine
    mcu_steps: RefCell<Vec<i64>>,
    queued: RefCell<Vec<Vec<QueuedMove>>>,
    homing_scripts: RefCell<Vec<VecDeque<HomingScript>>>,
    homing_hook: RefCell<Option<HomingHook>>,
    motor_on: RefCell<Vec<bool>>,
    enables: RefCell<Vec<u32>>,
    breaks: Cell<u32>,
    teardowns: Cell<u32>,
    estops: Cell<u32>,

    // Toolhead
    homed: Cell<bool>,
    busy: Cell<bool>,
    position: Cell<ToolheadPosition>,
    fan: Cell<f64>,
    temp: Cell<f64>,
    target: Cell<f64>,
    min_temp: f64,
    can_extrude: Cell<bool>,
    e_pos: Cell<f64>,
    e_speed: Cell<f64>,
    ops: RefCell<Vec<ToolheadOp>>,

    // Print host
    shutdown: Cell<bool>,
    state: Cell<PrintState>,
    pause_pending: Cell<bool>,
    filename: RefCell<Option<String>>,
    pauses: Cell<u32>,
    resumes: Cell<u32>,
    macros: RefCell<Vec<String>>,
    responds: RefCell<Vec<String>>,
    led_log: RefCell<Vec<(usize, LedEffect, bool)>>,
    paused_flag: Cell<bool>,
}

impl MockHost {
    pub fn new(stepper_count: usize) -> Self {
        Self {
            now: Cell::new(100.0),
            mcu_steps: RefCell::new(alloc::vec![0; stepper_count]),
            queued: RefCell::new(alloc::vec![Vec::new(); stepper_count]),
            homing_scripts: RefCell::new(alloc::vec![VecDeque::new(); stepper_count]),
            homing_hook: RefCell::new(None),
            motor_on: RefCell::new(alloc::vec![false; stepper_count]),
            enables: RefCell::new(alloc::vec![0; stepper_count]),
            breaks: Cell::new(0),
            teardowns: Cell::new(0),
            estops: Cell::new(0),
            homed: Cell::new(true),
            busy: Cell::new(false),
            position: Cell::new(ToolheadPosition { x: 10.0, y: 20.0, z: 5.0, e: 0.0 }),
            fan: Cell::new(0.0),
            temp: Cell::new(215.0),
            target: Cell::new(215.0),
            min_temp: 170.0,
            can_extrude: Cell::new(true),
            e_pos: Cell::new(0.0),
            e_speed: Cell::new(0.0),
            ops: RefCell::new(Vec::new()),
            shutdown: Cell::new(false),
            state: Cell::new(PrintState::Standby),
            pause_pending: Cell::new(false),
            filename: RefCell::new(None),
            pauses: Cell::new(0),
            resumes: Cell::new(0),
            macros: RefCell::new(Vec::new()),
            responds: RefCell::new(Vec::new()),
            led_log: RefCell::new(Vec::new()),
            paused_flag: Cell::new(false),
        }
    }

    // ---- Scripting ----

    pub fn script_homing(&self, stepper: usize, script: HomingScript) {
        self.homing_scripts.borrow_mut()[stepper].push_back(script);
    }

    pub fn set_homing_hook(&self, hook: impl Fn(usize) + 'static) {
        *self.homing_hook.borrow_mut() = Some(Box::new(hook));
    }

    pub fn clear_homing_hook(&self) {
        *self.homing_hook.borrow_mut() = None;
    }

    pub fn set_print_state(&self, state: PrintState) {
        self.state.set(state);
    }

    pub fn set_shutdown(&self, v: bool) {
        self.shutdown.set(v);
    }

    pub fn set_homed(&self, v: bool) {
        self.homed.set(v);
    }

    pub fn set_busy(&self, v: bool) {
        self.busy.set(v);
    }

    pub fn set_can_extrude(&self, v: bool) {
        self.can_extrude.set(v);
    }

    pub fn set_extruder_position(&self, pos: f64) {
        self.e_pos.set(pos);
    }

    pub fn set_extruder_speed(&self, speed: f64) {
        self.e_speed.set(speed);
    }

    pub fn set_filename(&self, name: &str) {
        *self.filename.borrow_mut() = Some(name.to_string());
    }

    // ---- Inspection ----

    pub fn queued_moves(&self, stepper: usize) -> Vec<QueuedMove> {
        self.queued.borrow()[stepper].clone()
    }

    pub fn clear_queued_moves(&self) {
        for q in self.queued.borrow_mut().iter_mut() {
            q.clear();
        }
    }

    pub fn enable_calls(&self, stepper: usize) -> u32 {
        self.enables.borrow()[stepper]
    }

    pub fn homing_breaks(&self) -> u32 {
        self.breaks.get()
    }

    pub fn homing_teardowns(&self) -> u32 {
        self.teardowns.get()
    }

    pub fn emergency_stops(&self) -> u32 {
        self.estops.get()
    }

    pub fn pause_calls(&self) -> u32 {
        self.pauses.get()
    }

    pub fn resume_calls(&self) -> u32 {
        self.resumes.get()
    }

    pub fn macros_run(&self) -> Vec<String> {
        self.macros.borrow().clone()
    }

    pub fn responses(&self) -> Vec<String> {
        self.responds.borrow().clone()
    }

    pub fn toolhead_ops(&self) -> Vec<ToolheadOp> {
        self.ops.borrow().clone()
    }

    pub fn clear_toolhead_ops(&self) {
        self.ops.borrow_mut().clear();
    }

    pub fn led_events(&self) -> Vec<(usize, LedEffect, bool)> {
        self.led_log.borrow().clone()
    }

    pub fn paused_flag(&self) -> bool {
        self.paused_flag.get()
    }

    pub fn extruded_total(&self) -> f64 {
        self.ops
            .borrow()
            .iter()
            .map(|op| match op {
                ToolheadOp::Extrude(d, _) => *d,
                _ => 0.0,
            })
            .sum()
    }
}

impl MotionEngine for MockHost {
    fn monotonic(&self) -> f64 {
        self.now.get()
    }

    async fn pause(&self, duration: Duration) {
        self.now
            .set(self.now.get() + duration.as_micros() as f64 / 1_000_000.0);
    }

    fn estimated_print_time(&self) -> f64 {
        self.now.get()
    }

    fn queue_move(
        &self,
        stepper: usize,
        print_time: f64,
        distance: f64,
        speed: f64,
        accel: f64,
    ) -> Result<f64, EngineError> {
        self.queued.borrow_mut()[stepper].push(QueuedMove { print_time, distance, speed, accel });
        self.mcu_steps.borrow_mut()[stepper] += (distance / STEP_DIST) as i64;
        let duration = if speed > 0.0 { crate::fabs(distance) / speed } else { 0.0 };
        Ok(print_time + duration)
    }

    async fn homing_move(
        &self,
        stepper: usize,
        _endstops: &[EndstopPair],
        distance: f64,
        _speed: f64,
        _accel: f64,
        _trigger: Edge,
    ) -> Result<Option<usize>, EngineError> {
        if let Some(hook) = self.homing_hook.borrow().as_ref() {
            hook(stepper);
        }
        let script = self.homing_scripts.borrow_mut()[stepper]
            .pop_front()
            .unwrap_or(HomingScript::endstop(0, 100));
        let steps = if distance < 0.0 { -script.steps } else { script.steps };
        self.mcu_steps.borrow_mut()[stepper] += steps;
        script.outcome
    }

    fn break_homing(&self, _stepper: usize) {
        self.breaks.set(self.breaks.get() + 1);
    }

    fn teardown_homing(&self, _stepper: usize) {
        self.teardowns.set(self.teardowns.get() + 1);
    }

    fn stepper_mcu_position(&self, stepper: usize) -> i64 {
        self.mcu_steps.borrow()[stepper]
    }

    fn stepper_step_distance(&self, _stepper: usize) -> f64 {
        STEP_DIST
    }

    fn reset_stepper_position(&self, _stepper: usize) {}

    fn motor_enabled(&self, stepper: usize) -> bool {
        self.motor_on.borrow()[stepper]
    }

    fn set_motor_enabled(&self, stepper: usize, enable: bool, _print_time: f64) {
        if enable && !self.motor_on.borrow()[stepper] {
            self.enables.borrow_mut()[stepper] += 1;
        }
        self.motor_on.borrow_mut()[stepper] = enable;
    }

    fn emergency_stop(&self, _reason: &str) {
        self.estops.set(self.estops.get() + 1);
        self.shutdown.set(true);
    }
}

impl Toolhead for MockHost {
    fn is_homed(&self) -> bool {
        self.homed.get()
    }

    fn is_busy(&self) -> bool {
        self.busy.get()
    }

    fn print_time(&self) -> f64 {
        self.now.get()
    }

    async fn wait_moves(&self) {
        self.ops.borrow_mut().push(ToolheadOp::WaitMoves);
    }

    async fn dwell(&self, delay: f64) {
        self.ops.borrow_mut().push(ToolheadOp::Dwell(delay));
        self.now.set(self.now.get() + delay);
    }

    fn position(&self) -> ToolheadPosition {
        self.position.get()
    }

    async fn move_xy(&self, x: f64, y: f64, _speed: Option<f64>, _wait: bool) {
        self.ops.borrow_mut().push(ToolheadOp::MoveXY(x, y));
        let mut p = self.position.get();
        p.x = x;
        p.y = y;
        self.position.set(p);
    }

    async fn move_x(&self, x: f64, _speed: Option<f64>, _wait: bool) {
        self.ops.borrow_mut().push(ToolheadOp::MoveX(x));
        let mut p = self.position.get();
        p.x = x;
        self.position.set(p);
    }

    async fn move_y(&self, y: f64, _speed: Option<f64>, _wait: bool) {
        self.ops.borrow_mut().push(ToolheadOp::MoveY(y));
        let mut p = self.position.get();
        p.y = y;
        self.position.set(p);
    }

    async fn move_z(&self, z: f64, _speed: Option<f64>, _wait: bool) {
        self.ops.borrow_mut().push(ToolheadOp::MoveZ(z));
        let mut p = self.position.get();
        p.z = z;
        self.position.set(p);
    }

    async fn move_z_relative(&self, dz: f64) {
        self.ops.borrow_mut().push(ToolheadOp::MoveZRel(dz));
        let mut p = self.position.get();
        p.z += dz;
        self.position.set(p);
    }

    fn fan_speed(&self) -> f64 {
        self.fan.get()
    }

    fn set_fan_speed(&self, speed: f64) {
        self.ops.borrow_mut().push(ToolheadOp::SetFan(speed));
        self.fan.set(speed);
    }

    fn extruder_temp(&self) -> f64 {
        self.temp.get()
    }

    fn extruder_target_temp(&self) -> f64 {
        self.target.get()
    }

    fn min_extrude_temp(&self) -> f64 {
        self.min_temp
    }

    fn can_extrude(&self) -> bool {
        self.can_extrude.get()
    }

    async fn set_extruder_temperature(&self, temp: f64, wait: bool) {
        self.ops.borrow_mut().push(ToolheadOp::SetTemp(temp, wait));
        self.target.set(temp);
        if wait {
            self.temp.set(temp);
        }
    }

    async fn extrude(&self, distance: f64, speed: f64, _wait: bool) {
        self.ops.borrow_mut().push(ToolheadOp::Extrude(distance, speed));
        self.e_pos.set(self.e_pos.get() + distance);
    }

    async fn retract(&self, distance: f64, speed: f64, _wait: bool) {
        self.ops.borrow_mut().push(ToolheadOp::Retract(distance, speed));
        self.e_pos.set(self.e_pos.get() - distance);
    }

    fn extruder_position(&self) -> f64 {
        self.e_pos.get()
    }

    fn extruder_speed(&self) -> f64 {
        self.e_speed.get()
    }

    fn extruder_filament_area(&self) -> f64 {
        core::f64::consts::PI * (1.75 / 2.0) * (1.75 / 2.0)
    }
}

impl PrintHost for MockHost {
    fn is_shutdown(&self) -> bool {
        self.shutdown.get()
    }

    fn print_state(&self) -> PrintState {
        self.state.get()
    }

    fn pause_pending(&self) -> bool {
        self.pause_pending.get()
    }

    fn print_filename(&self) -> Option<String> {
        self.filename.borrow().clone()
    }

    async fn run_pause(&self) {
        self.pauses.set(self.pauses.get() + 1);
        self.state.set(PrintState::Paused);
    }

    async fn run_resume(&self) {
        self.resumes.set(self.resumes.get() + 1);
        self.state.set(PrintState::Printing);
    }

    async fn run_macro(&self, name: &str) {
        self.macros.borrow_mut().push(name.to_string());
    }

    fn set_paused_flag(&self, paused: bool) {
        self.paused_flag.set(paused);
    }

    fn respond(&self, msg: &str) {
        self.responds.borrow_mut().push(msg.to_string());
    }

    fn led_notify(&self, _slot: usize) {}

    fn led_effect(&self, slot: usize, effect: LedEffect, _reverse: bool, activate: bool) {
        self.led_log.borrow_mut().push((slot, effect, activate));
    }
}

/// Four-slots-per-set config with deterministic pin names.
pub(crate) fn test_config(slots: usize) -> MmsConfig {
    let sets = slots.div_ceil(MmsConfig::SLOTS_PER_SET);
    MmsConfig {
        slots: (0..slots)
            .map(|n| SlotConfig {
                selector: PinDef::digital(&alloc::format!("mms:SEL{}", n)),
                inlet: PinDef::digital(&alloc::format!("mms:INL{}", n)),
                gate: PinDef::digital(&alloc::format!("mms:GAT{}", n)),
                autoload_enable: true,
                substitute_with: if slots > 1 { Some((n + 1) % slots) } else { None },
            })
            .collect(),
        sets: (0..sets)
            .map(|s| SetConfig {
                selector_name: alloc::format!("mms_selector_{}", s),
                drive_name: alloc::format!("mms_drive_{}", s),
                outlet: PinDef::digital(&alloc::format!("buffer:OUT{}", s)),
                buffer_runout: PinDef::digital(&alloc::format!("buffer:RUN{}", s)),
                entry: Some(PinDef::digital(&alloc::format!("toolhead:ENT{}", s))),
            })
            .collect(),
        retry_times: 3,
        fracture_detection_enable: true,
        slot_substitute_enable: true,
        delivery: Default::default(),
        stepper: Default::default(),
        buffer: Default::default(),
        swap: Default::default(),
        charge: Default::default(),
        eject: Default::default(),
        purge: Default::default(),
        brush: Default::default(),
        cut: Default::default(),
        autoload: Default::default(),
        fracture: Default::default(),
    }
}

/// A leaked core so homing hooks can reach back into it.
pub(crate) fn fresh_core(slots: usize) -> &'static MmsCore<MockHost> {
    let sets = slots.div_ceil(MmsConfig::SLOTS_PER_SET);
    let host = MockHost::new(sets * 2);
    Box::leak(Box::new(MmsCore::new(test_config(slots), host)))
}

/// A ready core with the autoload quiet period already elapsed.
pub(crate) fn ready_core(slots: usize) -> &'static MmsCore<MockHost> {
    let core = fresh_core(slots);
    core.on_ready();
    embassy_futures::block_on(core.host().pause(Duration::from_secs(10)));
    core
}

pub(crate) fn sensor_of(core: &MmsCore<MockHost>, slot: usize, kind: PinKind) -> usize {
    core.slot(slot).pin(kind).sensor().unwrap()
}

pub(crate) fn sensor_name_of(core: &MmsCore<MockHost>, slot: usize, kind: PinKind) -> String {
    core.sensor(sensor_of(core, slot, kind)).name().to_string()
}

/// Make a slot `is_ready` (inlet triggered) via the sample path.
pub(crate) fn insert_filament(core: &MmsCore<MockHost>, slot: usize) {
    use embedded_hal_1::digital::PinState;
    core.on_digital_sample(sensor_of(core, slot, PinKind::Inlet), PinState::High);
}

/// Make a slot `is_loading` (inlet and gate triggered).
pub(crate) fn load_to_gate_state(core: &MmsCore<MockHost>, slot: usize) {
    use embedded_hal_1::digital::PinState;
    insert_filament(core, slot);
    core.on_digital_sample(sensor_of(core, slot, PinKind::Gate), PinState::High);
}
