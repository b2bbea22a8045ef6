//! Stepper motion layer.
//!
//! Each selector/drive stepper runs at most one move at a time: the
//! `is_running` latch is a hard lock and a second move while it is set is
//! refused with a warning, never queued. Moves end in one of four ways:
//! a bound pin edge completes them, a cooperative cancel terminates them,
//! natural completion without an edge expires them, or an engine fault
//! marks them errored and shuts the printer down.

use core::cell::Cell;

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::signal::Signal;

use alloc::string::String;

use crate::error::{MmsError, Result};
use crate::host::{Edge, EndstopPair, Host};
use crate::{fabs, fmin, secs, MmsCore};

/// What kind of move the stepper is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MoveKind {
    Manual,
    Home,
    Drip,
}

/// Outcome state of the current or last move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MoveStatus {
    /// Never ran since startup.
    Ready,
    Moving,
    /// Ended by a pin edge.
    Completed,
    /// Cancelled by command.
    Terminated,
    /// Ran the full distance without an edge.
    Expired,
    /// Engine fault; fatal.
    Error,
}

/// Selector chooses the engaged slot; drive feeds the filament.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StepperRole {
    Selector,
    Drive,
}

impl StepperRole {
    fn label(self) -> &'static str {
        match self {
            StepperRole::Selector => "Selector",
            StepperRole::Drive => "Drive",
        }
    }
}

/// Per-stepper state. Structure is fixed after construction; all fields
/// that change at runtime are interior-mutable.
pub struct Stepper {
    index: usize,
    name: String,
    role: StepperRole,
    drip_segment: f64,

    focus_slot: Cell<Option<usize>>,
    is_running: Cell<bool>,
    forward: Cell<bool>,
    move_kind: Cell<Option<MoveKind>>,
    move_status: Cell<MoveStatus>,
    can_calibrate: Cell<bool>,
    drip_terminate: Cell<bool>,

    end_print_time: Cell<f64>,
    start_steps: Cell<i64>,
    steps_moved: Cell<i64>,
    distance_moved: Cell<f64>,

    /// Wakes the in-flight move wait early on completion or termination.
    wake: Signal<NoopRawMutex, MoveStatus>,
}

impl Stepper {
    pub(crate) fn new(index: usize, name: &str, role: StepperRole, drip_segment: f64) -> Self {
        Self {
            index,
            name: String::from(name),
            role,
            drip_segment,
            focus_slot: Cell::new(None),
            is_running: Cell::new(false),
            forward: Cell::new(true),
            move_kind: Cell::new(None),
            move_status: Cell::new(MoveStatus::Ready),
            can_calibrate: Cell::new(true),
            drip_terminate: Cell::new(false),
            end_print_time: Cell::new(0.0),
            start_steps: Cell::new(0),
            steps_moved: Cell::new(0),
            distance_moved: Cell::new(0.0),
            wake: Signal::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> StepperRole {
        self.role
    }

    pub fn is_running(&self) -> bool {
        self.is_running.get()
    }

    /// Never ran since startup.
    pub fn is_init(&self) -> bool {
        self.move_status.get() == MoveStatus::Ready
    }

    pub fn move_status(&self) -> MoveStatus {
        self.move_status.get()
    }

    pub fn move_is_completed(&self, status: Option<MoveStatus>) -> bool {
        status.unwrap_or(self.move_status.get()) == MoveStatus::Completed
    }

    pub fn move_is_terminated(&self, status: Option<MoveStatus>) -> bool {
        status.unwrap_or(self.move_status.get()) == MoveStatus::Terminated
    }

    pub fn move_is_error(&self, status: Option<MoveStatus>) -> bool {
        status.unwrap_or(self.move_status.get()) == MoveStatus::Error
    }

    pub fn focus_slot(&self) -> Option<usize> {
        self.focus_slot.get()
    }

    /// Tag which slot this stepper is logically serving.
    pub fn update_focus_slot(&self, slot: Option<usize>) {
        self.focus_slot.set(slot);
    }

    pub fn steps_moved(&self) -> i64 {
        self.steps_moved.get()
    }

    pub fn distance_moved(&self) -> f64 {
        self.distance_moved.get()
    }

    /// Refine calibration is allowed unless the endstop was pre-triggered.
    pub fn can_calibrate(&self) -> bool {
        self.can_calibrate.get()
    }

    pub(crate) fn drip_segment(&self) -> f64 {
        self.drip_segment
    }

    /// Complete the in-flight homing move. Invoked from a pin edge.
    pub(crate) fn complete_manual_home(&self) {
        if !self.is_running.get() {
            warn!("[{}] is not running, complete failed", self.role.label());
            return;
        }
        self.move_status.set(MoveStatus::Completed);
        self.wake.signal(MoveStatus::Completed);
    }

    pub(crate) fn terminate_manual_home(&self) {
        if !self.is_running.get() {
            warn!("[{}] is not running, terminate failed", self.role.label());
            return;
        }
        self.move_status.set(MoveStatus::Terminated);
        self.wake.signal(MoveStatus::Terminated);
    }

    pub(crate) fn terminate_manual_move(&self) {
        if !self.is_running.get() {
            warn!("[{}] is not running, terminate failed", self.role.label());
            return;
        }
        self.move_status.set(MoveStatus::Terminated);
        self.wake.signal(MoveStatus::Terminated);
    }

    pub(crate) fn terminate_drip_move(&self) {
        if !self.is_running.get() {
            warn!("[{}] is not running, terminate failed", self.role.label());
            return;
        }
        self.drip_terminate.set(true);
        self.move_status.set(MoveStatus::Terminated);
        self.wake.signal(MoveStatus::Terminated);
    }

    pub(crate) fn format_status(&self) -> String {
        use core::fmt::Write as _;
        let mut out = String::new();
        let _ = write!(
            out,
            "[{}] name={} focus_slot={:?} running={} forward={} kind={:?} status={:?} steps={} distance={}",
            self.role.label(),
            self.name,
            self.focus_slot.get(),
            self.is_running.get(),
            self.forward.get(),
            self.move_kind.get(),
            self.move_status.get(),
            self.steps_moved.get(),
            self.distance_moved.get(),
        );
        out
    }

    fn begin(&self, kind: MoveKind) -> Option<RunGuard<'_>> {
        if self.is_running.get() {
            warn!("[{}] is still running, move skip...", self.role.label());
            return None;
        }
        self.move_kind.set(Some(kind));
        self.move_status.set(MoveStatus::Moving);
        self.is_running.set(true);
        self.drip_terminate.set(false);
        self.wake.reset();
        Some(RunGuard { stepper: self })
    }

    #[cfg(test)]
    pub(crate) fn begin_move_for_test(&self) {
        self.move_kind.set(Some(MoveKind::Home));
        self.move_status.set(MoveStatus::Moving);
        self.is_running.set(true);
        self.wake.reset();
    }

    #[cfg(test)]
    pub(crate) fn end_move_for_test(&self) {
        self.is_running.set(false);
    }
}

/// Releases the `is_running` latch; a move still `Moving` at release time
/// ran its full course without an edge and is marked `Expired`.
struct RunGuard<'a> {
    stepper: &'a Stepper,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.stepper.is_running.set(false);
        if self.stepper.move_status.get() == MoveStatus::Moving {
            self.stepper.move_status.set(MoveStatus::Expired);
        }
    }
}

impl<H: Host> MmsCore<H> {
    /// Estimated print time with the configured queue headroom.
    fn cal_print_time(&self, add_interval: bool) -> f64 {
        let mut print_time = self.host().estimated_print_time();
        if add_interval {
            print_time += self.config().stepper.interval_time;
        }
        print_time
    }

    /// Wait out a lagging motion queue so a new move does not overlap the
    /// previous one on the same MCU.
    async fn adjust_print_time(&self, stepper: usize) -> f64 {
        let st = self.stepper(stepper);
        let mut print_time = self.cal_print_time(true);
        let end = st.end_print_time.get();
        if print_time < end {
            let wait = end - print_time + self.config().stepper.wait_delay;
            info!("[{}] waiting {} s for print time flush", st.name(), wait);
            self.host().pause(secs(wait)).await;
            print_time = self.cal_print_time(true);
        }
        print_time
    }

    /// Align the stepper's end print time with the toolhead clock before a
    /// homing move: flush backwards, dwell forwards.
    async fn sync_print_time(&self, stepper: usize) {
        let st = self.stepper(stepper);
        let toolhead_pt = self.host().print_time();
        let gap = st.end_print_time.get() - toolhead_pt;
        if gap < 0.0 {
            st.end_print_time.set(toolhead_pt);
        } else if gap > 0.0 {
            self.host().dwell(gap).await;
        }
    }

    /// Energize the stepper driver if it is not already.
    pub(crate) fn enable_stepper(&self, stepper: usize) {
        if !self.host().motor_enabled(stepper) {
            let pt = crate::fmax(self.cal_print_time(false), self.host().print_time());
            self.host().set_motor_enabled(stepper, true, pt);
            info!("[{}] enable", self.stepper(stepper).name());
        }
    }

    fn prepare_tracking(&self, stepper: usize) {
        let st = self.stepper(stepper);
        self.host().reset_stepper_position(stepper);
        st.start_steps.set(self.host().stepper_mcu_position(stepper));
        st.steps_moved.set(0);
        st.distance_moved.set(0.0);
    }

    fn update_tracking(&self, stepper: usize) {
        let st = self.stepper(stepper);
        // The commanded position is reset inside homing, so distance comes
        // from the raw MCU step counter instead.
        let steps = self.host().stepper_mcu_position(stepper) - st.start_steps.get();
        st.steps_moved.set(steps);
        st.distance_moved
            .set(self.host().stepper_step_distance(stepper) * steps as f64);
        self.host().reset_stepper_position(stepper);
    }

    fn notify_stepper_running(&self) {
        for num in 0..self.slot_count() {
            self.led_deactivate(num, crate::host::LedEffect::Blinking);
        }
    }

    /// Bounded-distance move. Suspends until the motion queue's print time
    /// passes the computed end, or until the move is terminated.
    pub(crate) async fn manual_move(&self, stepper: usize, distance: f64, speed: f64, accel: f64) {
        let st = self.stepper(stepper);
        st.forward.set(distance >= 0.0);
        let Some(guard) = st.begin(MoveKind::Manual) else {
            return;
        };
        self.notify_stepper_running();
        self.enable_stepper(stepper);

        let print_time = self.adjust_print_time(stepper).await;
        self.prepare_tracking(stepper);
        match self.host().queue_move(stepper, print_time, distance, speed, accel) {
            Ok(end) => {
                st.end_print_time.set(end);
                let delay = end - print_time;
                match select(self.host().pause(secs(delay)), st.wake.wait()).await {
                    Either::First(()) => {}
                    Either::Second(status) => {
                        debug!("[{}] move woken early: {:?}", st.name(), status);
                    }
                }
            }
            Err(_) => {
                error!("[{}] manual_move queue error", st.name());
            }
        }
        self.update_tracking(stepper);
        drop(guard);
    }

    /// Segmented cancellable move: queues `drip_segment` long chunks and
    /// re-checks the terminate flag between them.
    pub(crate) async fn drip_move(&self, stepper: usize, distance: f64, speed: f64, accel: f64) {
        let st = self.stepper(stepper);
        let forward = distance >= 0.0;
        st.forward.set(forward);
        let Some(guard) = st.begin(MoveKind::Drip) else {
            return;
        };
        self.notify_stepper_running();
        self.enable_stepper(stepper);

        self.prepare_tracking(stepper);
        let total = fabs(distance);
        let direction = if forward { 1.0 } else { -1.0 };
        let mut moved = 0.0;
        while total - moved > 1e-9 {
            if st.drip_terminate.get() || st.move_status.get() != MoveStatus::Moving {
                break;
            }
            let segment = fmin(st.drip_segment(), total - moved);
            let print_time = self.adjust_print_time(stepper).await;
            match self
                .host()
                .queue_move(stepper, print_time, direction * segment, speed, accel)
            {
                Ok(end) => {
                    st.end_print_time.set(end);
                    let delay = end - print_time;
                    if let Either::Second(status) =
                        select(self.host().pause(secs(delay)), st.wake.wait()).await
                    {
                        debug!("[{}] drip move woken early: {:?}", st.name(), status);
                        break;
                    }
                }
                Err(_) => {
                    error!("[{}] drip_move queue error", st.name());
                    break;
                }
            }
            moved += segment;
        }
        self.update_tracking(stepper);
        drop(guard);
    }

    /// Endstop-armed homing move toward `trigger` polarity.
    ///
    /// Returns the final move status: `Completed` when an endstop edge (or
    /// a pre-triggered endstop with zero motion) ended the move,
    /// `Terminated` on cooperative cancel, `Expired` when the full
    /// distance ran out without an edge. Engine faults are fatal.
    pub(crate) async fn manual_home(
        &self,
        stepper: usize,
        distance: f64,
        speed: f64,
        accel: f64,
        forward: bool,
        trigger: Edge,
        endstops: &[EndstopPair],
    ) -> Result<MoveStatus> {
        let st = self.stepper(stepper);
        let signed = if forward { fabs(distance) } else { -fabs(distance) };
        st.forward.set(forward);
        let Some(guard) = st.begin(MoveKind::Home) else {
            return Ok(st.move_status.get());
        };
        self.notify_stepper_running();
        self.enable_stepper(stepper);

        st.can_calibrate.set(true);
        self.sync_print_time(stepper).await;
        self.prepare_tracking(stepper);

        let outcome = self
            .host()
            .homing_move(stepper, endstops, signed, speed, accel, trigger)
            .await;
        self.update_tracking(stepper);

        match outcome {
            Ok(endstop) => {
                if endstop.is_some() {
                    if st.steps_moved.get() == 0 {
                        // Endstop was already in its target state
                        if st.move_status.get() == MoveStatus::Moving {
                            st.move_status.set(MoveStatus::Completed);
                        }
                        st.can_calibrate.set(false);
                    } else if st.move_status.get() == MoveStatus::Moving {
                        st.move_status.set(MoveStatus::Completed);
                    }
                }
            }
            Err(_) => {
                st.move_status.set(MoveStatus::Error);
                drop(guard);
                self.host().emergency_stop("mms homing move failed");
                return Err(MmsError::Engine);
            }
        }

        drop(guard);
        let status = self.stepper(stepper).move_status.get();
        debug!("[{}] manual_home done: {:?}", self.stepper(stepper).name(), status);
        Ok(status)
    }
}
