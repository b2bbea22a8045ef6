//! Compliance-buffer volume model.
//!
//! One buffer per selector/drive set. A periodic monitor compares extruder
//! consumption against the buffer volume and schedules drive feed/retract
//! moves to hold the volume near its target. The shared outlet and
//! buffer-runout pins clamp the volume at the physical limits; the
//! `freezing` guard keeps the edges produced by the buffer's own moves
//! from overwriting the computed volume.

use core::cell::Cell;
use core::fmt::Write as _;

use alloc::string::String;

use crate::config::BufferConfig;
use crate::error::MmsError;
use crate::host::{Edge, Host};
use crate::sensor::EdgeHook;
use crate::slot::PinKind;
use crate::{fabs, fmin, MmsCore};

/// Volume state of one selector/drive set.
pub struct Buffer {
    index: usize,
    outlet_sensor: usize,
    runout_sensor: usize,

    cross_section: f64,
    max_volume: f64,
    min_volume: f64,
    target_volume: f64,
    min_deliver_volume: f64,
    e_distance_moved_min: f64,
    e_distance_moved_max: f64,
    measure_speed: f64,
    measure_accel: f64,
    monitor_period: embassy_time::Duration,

    spring_stroke: Cell<f64>,
    stroke_measured: Cell<bool>,
    volume: Cell<f64>,
    last_e_position: Cell<f64>,
    activating: Cell<bool>,
    freezing: Cell<bool>,
    inlet_triggered_before: Cell<bool>,
    ready: Cell<bool>,
}

impl Buffer {
    pub(crate) fn new(
        index: usize,
        outlet_sensor: usize,
        runout_sensor: usize,
        cfg: &BufferConfig,
    ) -> Self {
        Self {
            index,
            outlet_sensor,
            runout_sensor,
            cross_section: cfg.cross_section(),
            max_volume: cfg.max_volume(),
            min_volume: cfg.min_volume(),
            target_volume: cfg.target_volume(),
            min_deliver_volume: cfg.min_deliver_volume,
            e_distance_moved_min: cfg.e_distance_moved_min,
            e_distance_moved_max: cfg.e_distance_moved_max,
            measure_speed: cfg.measure_speed,
            measure_accel: cfg.measure_accel,
            monitor_period: cfg.monitor_period,
            spring_stroke: Cell::new(cfg.spring_stroke),
            stroke_measured: Cell::new(false),
            volume: Cell::new(0.0),
            last_e_position: Cell::new(0.0),
            activating: Cell::new(false),
            freezing: Cell::new(false),
            inlet_triggered_before: Cell::new(false),
            ready: Cell::new(false),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn outlet_sensor(&self) -> usize {
        self.outlet_sensor
    }

    pub(crate) fn runout_sensor(&self) -> usize {
        self.runout_sensor
    }

    pub(crate) fn set_ready(&self) {
        self.ready.set(true);
    }

    fn check_ready(&self) -> bool {
        if !self.ready.get() {
            warn!("buffer[{}] is not ready yet", self.index);
        }
        self.ready.get()
    }

    pub fn volume(&self) -> f64 {
        self.volume.get()
    }

    pub fn max_volume(&self) -> f64 {
        self.max_volume
    }

    pub fn min_volume(&self) -> f64 {
        self.min_volume
    }

    pub fn target_volume(&self) -> f64 {
        self.target_volume
    }

    pub fn min_deliver_volume(&self) -> f64 {
        self.min_deliver_volume
    }

    pub(crate) fn cross_section(&self) -> f64 {
        self.cross_section
    }

    pub fn spring_stroke(&self) -> f64 {
        self.spring_stroke.get()
    }

    pub fn is_activating(&self) -> bool {
        self.activating.get()
    }

    pub(crate) fn is_freezing(&self) -> bool {
        self.freezing.get()
    }

    fn set_volume(&self, new_volume: f64) {
        let old = self.volume.get();
        self.volume.set(new_volume);
        if self.ready.get() && self.activating.get() && old != new_volume {
            trace!("buffer[{}] volume {} -> {}", self.index, old, new_volume);
        }
    }

    /// Freeze edge-driven volume updates for the scope of one move.
    fn freeze(&self) -> FreezeGuard<'_> {
        self.freezing.set(true);
        FreezeGuard { flag: &self.freezing }
    }

    pub(crate) fn format_status(&self) -> String {
        let mut out = String::new();
        let _ = write!(
            out,
            "buffer[{}] volume={:.2} stroke={:.2} activating={} freezing={} measured={}",
            self.index,
            self.volume.get(),
            self.spring_stroke.get(),
            self.activating.get(),
            self.freezing.get(),
            self.stroke_measured.get(),
        );
        out
    }
}

struct FreezeGuard<'a> {
    flag: &'a Cell<bool>,
}

impl Drop for FreezeGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

impl<H: Host> MmsCore<H> {
    /// Shared outlet pin triggered: the spring is fully compressed.
    pub(crate) fn buffer_clamp_full(&self, buffer: usize) {
        let b = self.buffer(buffer);
        if b.freezing.get() {
            return;
        }
        b.set_volume(b.max_volume);
    }

    /// Shared buffer-runout pin triggered: the spring is fully relaxed.
    pub(crate) fn buffer_clamp_runout(&self, buffer: usize) {
        let b = self.buffer(buffer);
        if b.freezing.get() {
            return;
        }
        b.set_volume(b.min_volume);
    }

    fn buffer_check_sensors(&self, buffer: usize) {
        let b = self.buffer(buffer);
        if b.freezing.get() {
            return;
        }
        if self.sensor(b.outlet_sensor).is_triggered() {
            b.set_volume(b.max_volume);
        } else if self.sensor(b.runout_sensor).is_triggered() {
            b.set_volume(b.min_volume);
        }
    }

    pub(crate) fn activate_buffer_monitor(&self, buffer: usize) {
        let b = self.buffer(buffer);
        if !b.check_ready() {
            return;
        }
        if b.activating.get() {
            warn!("buffer[{}] monitor is already activating", buffer);
            return;
        }
        b.last_e_position.set(self.host().extruder_position());
        b.activating.set(true);
        b.inlet_triggered_before.set(false);
        debug!("buffer[{}] monitor activated", buffer);
    }

    pub(crate) fn deactivate_buffer_monitor(&self, buffer: usize) {
        let b = self.buffer(buffer);
        if !b.activating.get() {
            return;
        }
        b.activating.set(false);
        b.inlet_triggered_before.set(false);
        debug!("buffer[{}] monitor deactivated", buffer);
    }

    /// Periodic monitor loop for one buffer; spawn on the host executor.
    pub async fn buffer_monitor_task(&self, buffer: usize) -> ! {
        let period = self.buffer(buffer).monitor_period;
        loop {
            self.host().pause(period).await;
            if self.buffer(buffer).activating.get() {
                self.buffer_tick(buffer).await;
            }
        }
    }

    /// One monitor tick: clamp on sensors, integrate extruder motion,
    /// schedule a feed or retract when the volume drifted far enough.
    pub async fn buffer_tick(&self, buffer: usize) {
        self.buffer_check_sensors(buffer);

        let b = self.buffer(buffer);
        let e_position = self.host().extruder_position();
        let e_speed = self.host().extruder_speed();
        let moved = e_position - b.last_e_position.get();
        if moved == 0.0 {
            return;
        }
        if moved <= b.e_distance_moved_min || fabs(moved) >= b.e_distance_moved_max {
            warn!(
                "buffer[{}] extruder moved {} mm over limit, sample dropped",
                buffer, moved
            );
            b.last_e_position.set(e_position);
            return;
        }

        b.last_e_position.set(e_position);
        let consumed = moved * self.host().extruder_filament_area();
        b.set_volume(b.volume.get() - consumed);

        if b.volume.get() < b.target_volume {
            let feed_volume = b.target_volume - b.volume.get();
            if feed_volume < b.min_deliver_volume {
                return;
            }
            let _freeze = b.freeze();
            if let Some(delivered) = self.buffer_feed(buffer, feed_volume, e_speed).await {
                b.set_volume(b.volume.get() + delivered);
            }
        } else if b.volume.get() > b.max_volume {
            let retract_volume = b.volume.get() - b.max_volume;
            if retract_volume < b.min_deliver_volume {
                return;
            }
            let _freeze = b.freeze();
            if let Some(delivered) = self.buffer_retract(buffer, retract_volume).await {
                b.set_volume(b.volume.get() - delivered);
            }
        }
    }

    async fn buffer_feed(&self, buffer: usize, volume: f64, e_speed: f64) -> Option<f64> {
        let b = self.buffer(buffer);
        if volume <= 0.0 {
            warn!("buffer[{}] feed failed: unavailable volume", buffer);
            return None;
        }
        let Some(slot) = self.current_slot() else {
            warn!("buffer[{}] feed failed: no active slot", buffer);
            return None;
        };

        let distance = volume / b.cross_section;
        let speed = if e_speed == 0.0 {
            distance * 2.0
        } else {
            fmin(distance * 2.0, e_speed)
        };
        debug!("slot[{}] buffer feed {} mm", slot, distance);

        if self.buffer_simple_move(buffer, slot, fabs(distance), speed, speed).await {
            Some(volume)
        } else {
            None
        }
    }

    async fn buffer_retract(&self, buffer: usize, volume: f64) -> Option<f64> {
        let b = self.buffer(buffer);
        if volume <= 0.0 {
            warn!("buffer[{}] retract failed: unavailable volume", buffer);
            return None;
        }
        let Some(slot) = self.current_slot() else {
            warn!("buffer[{}] retract failed: no active slot", buffer);
            return None;
        };

        let distance = volume / b.cross_section;
        let speed = distance * 2.0;
        debug!("slot[{}] buffer retract {} mm", slot, distance);

        if self.buffer_simple_move(buffer, slot, -fabs(distance), speed, speed).await {
            Some(volume)
        } else {
            None
        }
    }

    /// Unselected drive move with fracture-edge detection on both sides.
    async fn buffer_simple_move(
        &self,
        buffer: usize,
        slot: usize,
        distance: f64,
        speed: f64,
        accel: f64,
    ) -> bool {
        let b = self.buffer(buffer);
        let drive = self.slot(slot).drive_stepper();
        self.stepper(drive).update_focus_slot(Some(slot));

        // Inlet was present last move and is gone now: the filament snapped
        if b.inlet_triggered_before.get() && self.pin_released(slot, PinKind::Inlet) {
            self.fracture_while_feeding(slot).await;
            return false;
        }
        b.inlet_triggered_before.set(self.pin_triggered(slot, PinKind::Inlet));

        if distance > 0.0 {
            let inlet = self.slot(slot).pin(PinKind::Inlet).sensor();
            let hook = EdgeHook::FractureWhileFeeding { slot };
            if let Some(inlet) = inlet {
                if self.fracture.enabled.get() {
                    self.sensor(inlet).add_hook(Edge::Released, hook);
                }
            }
            self.manual_move(drive, distance, speed, accel).await;
            if let Some(inlet) = inlet {
                self.sensor(inlet).remove_hook(Edge::Released, hook);
            }
        } else {
            self.manual_move(drive, distance, speed, accel).await;
        }

        if b.inlet_triggered_before.get() && self.pin_released(slot, PinKind::Inlet) {
            self.fracture.set_pending_feeding(slot);
        }
        self.run_pending_fracture().await;
        true
    }

    // ---- Buffer operations ----

    /// Load to outlet so the spring is fully compressed.
    pub async fn buffer_fill(&self, slot: usize) -> bool {
        let buffer = self.buffer_of(slot).index();
        if !self.buffer(buffer).check_ready() {
            return false;
        }
        if !self.buffer(buffer).stroke_measured.get() {
            self.buffer_measure_stroke(slot, false).await;
        }
        if self.sensor(self.buffer(buffer).outlet_sensor).is_triggered() {
            return true;
        }
        match self.load_to_outlet(slot, None, None, None).await {
            Ok(_) => {
                debug!("slot[{}] fill buffer success", slot);
                true
            }
            Err(MmsError::Terminated) => {
                error!("slot[{}] fill buffer is terminated", slot);
                false
            }
            Err(_) => {
                error!("slot[{}] fill buffer failed", slot);
                false
            }
        }
    }

    /// Unload until the runout pin triggers so the spring is fully relaxed.
    pub async fn buffer_clear(&self, slot: usize) -> bool {
        let buffer = self.buffer_of(slot).index();
        if !self.buffer(buffer).check_ready() {
            return false;
        }
        if !self.buffer(buffer).stroke_measured.get() {
            self.buffer_measure_stroke(slot, false).await;
        }
        if self.sensor(self.buffer(buffer).runout_sensor).is_triggered() {
            return true;
        }
        match self
            .unload_until_buffer_runout_trigger(slot, None, None, None)
            .await
        {
            Ok(_) => {
                debug!("slot[{}] clear buffer success", slot);
                true
            }
            Err(MmsError::Terminated) => {
                error!("slot[{}] clear buffer is terminated", slot);
                false
            }
            Err(_) => {
                error!("slot[{}] clear buffer failed", slot);
                false
            }
        }
    }

    /// Deliberately set the volume to the middle of the stroke: relax the
    /// spring, take up the slack, then feed half a stroke.
    pub async fn buffer_halfway(&self, slot: usize) -> bool {
        let b = self.buffer_of(slot);
        let buffer = b.index();
        if !self.buffer(buffer).check_ready() {
            return false;
        }
        if !self.buffer(buffer).stroke_measured.get() {
            self.buffer_measure_stroke(slot, false).await;
        }

        let result: crate::error::Result<bool> = async {
            self.unload_until_buffer_runout_trigger(slot, None, None, None)
                .await?;
            self.load_until_buffer_runout_release(slot, None, None, None)
                .await?;

            let distance = fabs(self.buffer(buffer).spring_stroke.get() * 0.5);
            let speed = distance * 2.0;
            Ok(self.mms_move(slot, distance, Some(speed), Some(speed)).await)
        }
        .await;

        match result {
            Ok(true) => {}
            Ok(false) => return false,
            Err(MmsError::Terminated) => {
                error!("slot[{}] halfway buffer is terminated", slot);
                return false;
            }
            Err(_) => {
                error!("slot[{}] halfway buffer failed", slot);
                return false;
            }
        }

        let b = self.buffer(buffer);
        if !b.freezing.get() {
            b.set_volume((b.max_volume - b.min_volume) / 2.0);
        }
        debug!("slot[{}] halfway buffer success", slot);
        true
    }

    /// Measure the real spring stroke: compress fully, then relax until
    /// runout and record the travel.
    pub async fn buffer_measure_stroke(&self, slot: usize, force: bool) -> bool {
        let b = self.buffer_of(slot);
        let buffer = b.index();
        if !self.buffer(buffer).check_ready() {
            return false;
        }
        if self.buffer(buffer).stroke_measured.get() && !force {
            return true;
        }

        debug!("slot[{}] measure buffer stroke begin", slot);
        let measure = async {
            self.load_to_outlet(slot, None, None, None).await?;
            let b = self.buffer(buffer);
            self.unload_until_buffer_runout_trigger(
                slot,
                None,
                Some(b.measure_speed),
                Some(b.measure_accel),
            )
            .await
        };
        match measure.await {
            Ok(_) => {}
            Err(MmsError::Terminated) => {
                error!("slot[{}] measure buffer is terminated", slot);
                return false;
            }
            Err(_) => {
                error!("slot[{}] measure buffer stroke failed", slot);
                return false;
            }
        }

        let drive = self.slot(slot).drive_stepper();
        let measured = fabs(self.stepper(drive).distance_moved());
        let b = self.buffer(buffer);
        let old = b.spring_stroke.get();
        b.spring_stroke.set(fmin(measured, old));
        b.stroke_measured.set(true);
        info!(
            "buffer spring stroke measured: {} mm -> {} mm",
            old,
            b.spring_stroke.get()
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;
    use embedded_hal_1::digital::PinState;

    use crate::testing::{load_to_gate_state, ready_core, sensor_of};
    use crate::slot::PinKind;

    fn activated(core: &'static crate::MmsCore<crate::testing::MockHost>) {
        core.activate_buffer_monitor(0);
        assert!(core.buffer(0).is_activating());
    }

    #[test]
    fn outlet_trigger_clamps_volume_to_max() {
        let core = ready_core(4);
        activated(core);
        let outlet = sensor_of(core, 0, PinKind::Outlet);
        core.on_digital_sample(outlet, PinState::High);
        assert_eq!(core.buffer(0).volume(), core.buffer(0).max_volume());
    }

    #[test]
    fn runout_trigger_clamps_volume_to_min() {
        let core = ready_core(4);
        activated(core);
        core.buffer(0).set_volume(10.0);
        let runout = sensor_of(core, 0, PinKind::BufferRunout);
        core.on_digital_sample(runout, PinState::High);
        assert_eq!(core.buffer(0).volume(), core.buffer(0).min_volume());
    }

    #[test]
    fn overlimit_extruder_sample_is_discarded_and_realigned() {
        let core = ready_core(4);
        activated(core);
        core.buffer(0).set_volume(20.0);

        core.host().set_extruder_position(500.0);
        block_on(core.buffer_tick(0));

        // Volume unchanged, last position realigned
        assert_eq!(core.buffer(0).volume(), 20.0);
        core.host().set_extruder_position(501.0);
        block_on(core.buffer_tick(0));
        // 1mm of extrusion consumed volume now
        assert!(core.buffer(0).volume() < 20.0);
    }

    #[test]
    fn consumption_below_target_schedules_a_feed() {
        let core = ready_core(4);
        load_to_gate_state(core, 0);
        core.slot(0); // slot 0 loading; focus it
        core.stepper(core.slot(0).selector_stepper()).update_focus_slot(Some(0));
        activated(core);
        core.buffer(0).set_volume(core.buffer(0).target_volume());

        // 5mm of extrusion
        core.host().set_extruder_position(5.0);
        core.host().clear_queued_moves();
        block_on(core.buffer_tick(0));

        let drive = core.slot(0).drive_stepper();
        let moves = core.host().queued_moves(drive);
        assert_eq!(moves.len(), 1);
        assert!(moves[0].distance > 0.0);
        // Feed restored the volume to target
        let b = core.buffer(0);
        assert!((b.volume() - b.target_volume()).abs() < 1e-6);
    }

    #[test]
    fn small_deficit_is_left_alone() {
        let core = ready_core(4);
        load_to_gate_state(core, 0);
        core.stepper(core.slot(0).selector_stepper()).update_focus_slot(Some(0));
        activated(core);
        core.buffer(0).set_volume(core.buffer(0).target_volume());

        // 0.5mm of extrusion is ~1.2mm^3, below min_deliver_volume
        core.host().set_extruder_position(0.5);
        core.host().clear_queued_moves();
        block_on(core.buffer_tick(0));

        let drive = core.slot(0).drive_stepper();
        assert!(core.host().queued_moves(drive).is_empty());
    }

    #[test]
    fn outlet_clamp_suppresses_scheduled_feed() {
        let core = ready_core(4);
        load_to_gate_state(core, 0);
        core.stepper(core.slot(0).selector_stepper()).update_focus_slot(Some(0));
        activated(core);
        // Deep deficit that would feed
        core.buffer(0).set_volume(0.0);

        // Outlet goes triggered before the next tick
        let outlet = sensor_of(core, 0, PinKind::Outlet);
        core.on_digital_sample(outlet, PinState::High);

        core.host().set_extruder_position(1.0);
        core.host().clear_queued_moves();
        block_on(core.buffer_tick(0));

        // Clamp won: volume pinned at max minus the tick's consumption,
        // no feed issued
        let drive = core.slot(0).drive_stepper();
        assert!(core.host().queued_moves(drive).is_empty());
        let b = core.buffer(0);
        assert!(b.volume() <= b.max_volume());
        assert!(b.volume() > b.target_volume());
    }

    #[test]
    fn surplus_above_max_schedules_a_retract() {
        let core = ready_core(4);
        load_to_gate_state(core, 0);
        core.stepper(core.slot(0).selector_stepper()).update_focus_slot(Some(0));
        activated(core);
        core.buffer(0).set_volume(core.buffer(0).max_volume() + 1.0);

        // 3mm of retraction pushes volume further up
        core.host().set_extruder_position(-3.0);
        core.host().clear_queued_moves();
        block_on(core.buffer_tick(0));

        let drive = core.slot(0).drive_stepper();
        let moves = core.host().queued_moves(drive);
        assert_eq!(moves.len(), 1);
        assert!(moves[0].distance < 0.0);
        let b = core.buffer(0);
        assert!((b.volume() - b.max_volume()).abs() < 1e-6);
    }

    #[test]
    fn idle_extruder_is_a_noop_tick() {
        let core = ready_core(4);
        activated(core);
        core.buffer(0).set_volume(5.0);
        core.host().clear_queued_moves();
        block_on(core.buffer_tick(0));
        assert_eq!(core.buffer(0).volume(), 5.0);
    }

    #[test]
    fn monitor_activation_is_single_entry() {
        let core = ready_core(4);
        core.activate_buffer_monitor(0);
        core.activate_buffer_monitor(0);
        assert!(core.buffer(0).is_activating());
        core.deactivate_buffer_monitor(0);
        assert!(!core.buffer(0).is_activating());
    }

    #[test]
    fn not_ready_buffer_refuses_commands() {
        let core = crate::testing::fresh_core(4);
        core.activate_buffer_monitor(0);
        assert!(!core.buffer(0).is_activating());
    }

    #[test]
    fn fracture_edge_before_feed_skips_the_move() {
        let core = ready_core(4);
        load_to_gate_state(core, 0);
        core.stepper(core.slot(0).selector_stepper()).update_focus_slot(Some(0));
        activated(core);
        core.buffer(0).set_volume(core.buffer(0).target_volume());

        // One normal feed records inlet as present
        core.host().set_extruder_position(5.0);
        block_on(core.buffer_tick(0));

        // Filament snaps upstream: inlet releases
        let inlet = sensor_of(core, 0, PinKind::Inlet);
        core.on_digital_sample(inlet, PinState::Low);

        core.host().set_extruder_position(10.0);
        core.host().clear_queued_moves();
        block_on(core.buffer_tick(0));

        // The feed was replaced by the fracture path: monitor deactivated
        assert!(!core.buffer(0).is_activating());
        let drive = core.slot(0).drive_stepper();
        assert!(core.host().queued_moves(drive).iter().all(|m| m.distance <= 0.0));
    }
}
