//! The G-code command surface.
//!
//! Text parsing lives in the host; the typed boundary is [`MmsCommand`].
//! The host registers the names from [`command_names`] with its G-code
//! parser and forwards invocations to [`MmsCore::execute`]. Errors are
//! surfaced as console responses; deliver-family commands without
//! `WAIT=1` go through the single-flight latch and a second invocation is
//! refused, never queued.

use embassy_time::Duration;

use alloc::string::String;
use alloc::vec::Vec;

use crate::host::Host;
use crate::slot::PinKind;
use crate::MmsCore;

/// One MMS command with its parsed arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum MmsCommand {
    /// `MMS`: version banner.
    Mms,
    /// `MMS_STATUS`
    Status,
    /// `MMS_SAMPLE [DURATION=s]`
    Sample { duration: Option<u32> },
    /// `MMS_STATUS_STEPPER`
    StatusStepper,
    /// `MMS_SAMPLE_STEPPER [DURATION=s]`
    SampleStepper { duration: Option<u32> },

    /// `MMS_LOAD SLOT=n [WAIT=1]`
    Load { slot: usize, wait: bool },
    /// `MMS_UNLOAD [SLOT=n] [WAIT=1]`
    Unload { slot: Option<usize>, wait: bool },
    /// `MMS_POP [SLOT=n] [WAIT=1]`
    Pop { slot: Option<usize>, wait: bool },
    /// `MMS_PREPARE SLOT=n [WAIT=1]`
    Prepare { slot: usize, wait: bool },
    /// `MMS_MOVE SLOT=n DISTANCE=d [SPEED=s] [ACCEL=a] [WAIT=1]`
    Move {
        slot: usize,
        distance: f64,
        speed: Option<f64>,
        accel: Option<f64>,
        wait: bool,
    },
    /// `MMS_DRIP_MOVE SLOT=n DISTANCE=d [SPEED=s] [ACCEL=a] [WAIT=1]`
    DripMove {
        slot: usize,
        distance: f64,
        speed: Option<f64>,
        accel: Option<f64>,
        wait: bool,
    },
    /// `MMS_SELECT SLOT=n [WAIT=1]`
    Select { slot: usize, wait: bool },
    /// `MMS_UNSELECT SLOT=n [WAIT=1]`
    Unselect { slot: usize, wait: bool },
    /// `MMS_STOP [SLOT=n]`
    Stop { slot: Option<usize> },

    /// `MMS_SLOTS_CHECK`
    SlotsCheck,
    /// `MMS_SLOTS_LOOP`
    SlotsLoop,

    /// `MMS_BUFFER_ACTIVATE`
    BufferActivate,
    /// `MMS_BUFFER_DEACTIVATE`
    BufferDeactivate,
    /// `MMS_BUFFER_MEASURE SLOT=n [FORCE=1]`
    BufferMeasure { slot: usize, force: bool },
    /// `MMS_BUFFER_FILL SLOT=n`
    BufferFill { slot: usize },
    /// `MMS_BUFFER_CLEAR SLOT=n`
    BufferClear { slot: usize },
    /// `MMS_BUFFER_HALFWAY SLOT=n`
    BufferHalfway { slot: usize },

    /// `MMS_CHARGE SLOT=n`
    Charge { slot: usize },
    /// `MMS_CAREFUL_CHARGE SLOT=n`
    CarefulCharge { slot: usize },
    /// `MMS_EJECT`
    Eject,
    /// `MMS_PURGE`
    Purge,
    /// `MMS_TRAY`
    Tray,
    /// `MMS_TRAY_EJECT`
    TrayEject,
    /// `MMS_BRUSH`
    Brush,
    /// `MMS_BRUSH_WIPE`
    BrushWipe,
    /// `MMS_BRUSH_PECK`
    BrushPeck,
    /// `MMS_CUT`
    Cut,

    /// `MMS_PAUSE`
    Pause,
    /// `MMS_RESUME`
    Resume,
    /// `MMS_SWAP_MAPPING SWAP_NUM=i SLOT=j [FILENAME=...]`
    SwapMapping {
        swap_num: usize,
        slot: usize,
        filename: Option<String>,
    },

    /// `T<n>`: the slicer swap command.
    Swap { slot: usize },
}

/// Command names the host should register, including one `T<n>` per slot.
pub fn command_names(slot_count: usize, command_string: &str) -> Vec<String> {
    let mut names: Vec<String> = [
        "MMS",
        "MMS_STATUS",
        "MMS_SAMPLE",
        "MMS_STATUS_STEPPER",
        "MMS_SAMPLE_STEPPER",
        "MMS_LOAD",
        "MMS_UNLOAD",
        "MMS_POP",
        "MMS_PREPARE",
        "MMS_MOVE",
        "MMS_DRIP_MOVE",
        "MMS_SELECT",
        "MMS_UNSELECT",
        "MMS_STOP",
        "MMS_SLOTS_CHECK",
        "MMS_SLOTS_LOOP",
        "MMS_BUFFER_ACTIVATE",
        "MMS_BUFFER_DEACTIVATE",
        "MMS_BUFFER_MEASURE",
        "MMS_BUFFER_FILL",
        "MMS_BUFFER_CLEAR",
        "MMS_BUFFER_HALFWAY",
        "MMS_CHARGE",
        "MMS_CAREFUL_CHARGE",
        "MMS_EJECT",
        "MMS_PURGE",
        "MMS_TRAY",
        "MMS_TRAY_EJECT",
        "MMS_BRUSH",
        "MMS_BRUSH_WIPE",
        "MMS_BRUSH_PECK",
        "MMS_CUT",
        "MMS_PAUSE",
        "MMS_RESUME",
        "MMS_SWAP_MAPPING",
    ]
    .iter()
    .map(|s| String::from(*s))
    .collect();

    for n in 0..slot_count {
        names.push(alloc::format!("{}{}", command_string, n));
    }
    names
}

const VERSION: &str = env!("CARGO_PKG_VERSION");

impl<H: Host> MmsCore<H> {
    fn check_slot_arg(&self, slot: usize) -> bool {
        if !self.slot_is_available(slot) {
            self.host().respond("slot is not available");
            return false;
        }
        true
    }

    fn check_opt_slot_arg(&self, slot: Option<usize>) -> bool {
        match slot {
            Some(slot) => self.check_slot_arg(slot),
            None => true,
        }
    }

    /// A triggered gate anywhere means filament is engaged downstream;
    /// the manual charge commands refuse to run over it.
    fn any_gate_triggered(&self) -> bool {
        (0..self.slot_count()).any(|slot| self.pin_triggered(slot, PinKind::Gate))
    }

    /// Deliver-family entry: `wait` commands run inline, the rest go
    /// through the single-flight latch.
    async fn deliver_entry<F>(&self, wait: bool, run: F) -> bool
    where
        F: core::future::Future<Output = bool>,
    {
        if wait {
            return run.await;
        }
        let Some(_guard) = self.claim_deliver() else {
            return false;
        };
        run.await
    }

    /// Periodic status dump, bounded by `duration`.
    async fn mms_sample(&self, duration: Option<u32>, steppers_only: bool) {
        if self.delivery.sampling.get() {
            warn!("MMS sample is running, return...");
            return;
        }
        self.delivery.sampling.set(true);

        let period = Duration::from_millis(500);
        let total = duration.unwrap_or(60) as f64;
        let begin = self.host().monotonic();
        info!("MMS sample begin");

        while self.host().monotonic() - begin < total {
            let report = if steppers_only {
                self.format_stepper_status()
            } else {
                self.format_status()
            };
            self.host().respond(&report);
            self.host().pause(period).await;
        }
        self.delivery.sampling.set(false);
    }

    /// Run one command to completion. Returns overall success; failures
    /// have already been reported through the host console.
    pub async fn execute(&self, cmd: MmsCommand) -> bool {
        match cmd {
            MmsCommand::Mms => {
                self.host().respond(VERSION);
                true
            }
            MmsCommand::Status => {
                let status = self.format_status();
                self.host().respond(&status);
                true
            }
            MmsCommand::StatusStepper => {
                let status = self.format_stepper_status();
                self.host().respond(&status);
                true
            }
            MmsCommand::Sample { duration } => {
                self.mms_sample(duration, false).await;
                true
            }
            MmsCommand::SampleStepper { duration } => {
                self.mms_sample(duration, true).await;
                true
            }

            MmsCommand::Load { slot, wait } => {
                if !self.check_slot_arg(slot) {
                    return false;
                }
                self.deliver_entry(wait, self.mms_load(slot)).await
            }
            MmsCommand::Unload { slot, wait } => {
                if !self.check_opt_slot_arg(slot) {
                    return false;
                }
                self.deliver_entry(wait, self.mms_unload(slot)).await
            }
            MmsCommand::Pop { slot, wait } => {
                if !self.check_opt_slot_arg(slot) {
                    return false;
                }
                self.deliver_entry(wait, self.mms_pop(slot)).await
            }
            MmsCommand::Prepare { slot, wait } => {
                if !self.check_slot_arg(slot) {
                    return false;
                }
                self.deliver_entry(wait, self.mms_prepare(slot)).await
            }
            MmsCommand::Move { slot, distance, speed, accel, wait } => {
                if !self.check_slot_arg(slot) {
                    return false;
                }
                self.deliver_entry(wait, self.mms_move(slot, distance, speed, accel))
                    .await
            }
            MmsCommand::DripMove { slot, distance, speed, accel, wait } => {
                if !self.check_slot_arg(slot) {
                    return false;
                }
                self.deliver_entry(wait, self.mms_drip_move(slot, distance, speed, accel))
                    .await
            }
            MmsCommand::Select { slot, wait } => {
                if !self.check_slot_arg(slot) {
                    return false;
                }
                self.deliver_entry(wait, self.mms_select(slot)).await
            }
            MmsCommand::Unselect { slot, wait } => {
                if !self.check_slot_arg(slot) {
                    return false;
                }
                self.deliver_entry(wait, self.mms_unselect(slot)).await
            }
            MmsCommand::Stop { slot } => {
                if !self.cmd_can_exec() {
                    warn!("MMS_STOP can not execute now");
                    return false;
                }
                if self.swap.is_running() {
                    warn!("MMS_STOP can not execute while swapping");
                    return false;
                }
                if !self.check_opt_slot_arg(slot) {
                    return false;
                }
                self.mms_stop(slot).await
            }

            MmsCommand::SlotsCheck => {
                if !self.cmd_can_exec() {
                    warn!("MMS_SLOTS_CHECK can not execute now");
                    return false;
                }
                self.deliver_entry(false, self.mms_slots_check()).await
            }
            MmsCommand::SlotsLoop => {
                if !self.cmd_can_exec() {
                    warn!("MMS_SLOTS_LOOP can not execute now");
                    return false;
                }
                self.deliver_entry(false, self.mms_slots_loop()).await
            }

            MmsCommand::BufferActivate => {
                for buffer in 0..self.buffers().len() {
                    self.activate_buffer_monitor(buffer);
                }
                true
            }
            MmsCommand::BufferDeactivate => {
                for buffer in 0..self.buffers().len() {
                    self.deactivate_buffer_monitor(buffer);
                }
                true
            }
            MmsCommand::BufferMeasure { slot, force } => {
                if !self.check_slot_arg(slot) {
                    return false;
                }
                self.buffer_measure_stroke(slot, force).await
            }
            MmsCommand::BufferFill { slot } => {
                if !self.check_slot_arg(slot) {
                    return false;
                }
                self.buffer_fill(slot).await
            }
            MmsCommand::BufferClear { slot } => {
                if !self.check_slot_arg(slot) {
                    return false;
                }
                self.buffer_clear(slot).await
            }
            MmsCommand::BufferHalfway { slot } => {
                if !self.check_slot_arg(slot) {
                    return false;
                }
                self.buffer_halfway(slot).await
            }

            MmsCommand::Charge { slot } => {
                if !self.check_slot_arg(slot) {
                    return false;
                }
                if self.any_gate_triggered() {
                    warn!("slot[{}] can not charge when any gate is triggered", slot);
                    return false;
                }
                let z = self.config().charge.z_raise;
                self.run_with_snapshot_z(z, self.mms_charge(slot)).await
            }
            MmsCommand::CarefulCharge { slot } => {
                if !self.check_slot_arg(slot) {
                    return false;
                }
                if self.any_gate_triggered() {
                    warn!(
                        "slot[{}] can not careful charge when any gate is triggered",
                        slot
                    );
                    return false;
                }
                self.run_with_snapshot(self.mms_careful_charge(slot)).await
            }
            MmsCommand::Eject => {
                if !self.cmd_can_exec() {
                    warn!("MMS_EJECT can not execute now");
                    return false;
                }
                let z = self.config().eject.z_raise;
                self.run_with_snapshot_z(z, self.mms_eject(true)).await
            }
            MmsCommand::Purge => {
                let z = self.config().purge.z_raise;
                self.run_with_snapshot_z(z, self.mms_purge()).await
            }
            MmsCommand::Tray => {
                let z = self.config().purge.z_raise;
                self.host().move_z_relative(z).await;
                self.purge_move_to_tray().await;
                self.host().move_z_relative(-z).await;
                true
            }
            MmsCommand::TrayEject => {
                let z = self.config().purge.z_raise;
                self.run_with_snapshot_z(z, async {
                    self.purge_move_to_tray().await;
                    self.tray_eject().await;
                    true
                })
                .await
            }
            MmsCommand::Brush => {
                let z = self.config().brush.z_raise;
                self.run_with_snapshot_z(z, self.mms_brush()).await
            }
            MmsCommand::BrushWipe => {
                let b = &self.config().brush;
                self.run_with_snapshot_z(b.z_raise, async {
                    let fan = self
                        .fan_cooldown_begin(b.fan_cooldown_speed, b.fan_cooldown_wait)
                        .await;
                    let success = self.brush_wipe().await;
                    self.fan_cooldown_end(fan);
                    success
                })
                .await
            }
            MmsCommand::BrushPeck => {
                let b = &self.config().brush;
                self.run_with_snapshot_z(b.z_raise, async {
                    let fan = self
                        .fan_cooldown_begin(b.fan_cooldown_speed, b.fan_cooldown_wait)
                        .await;
                    let success = self.brush_peck().await;
                    self.fan_cooldown_end(fan);
                    success
                })
                .await
            }
            MmsCommand::Cut => {
                if !self.cmd_can_exec() {
                    warn!("MMS_CUT can not execute now");
                    return false;
                }
                let z = self.config().cut.z_raise;
                self.run_with_snapshot_z(z, self.mms_cut()).await
            }

            MmsCommand::Pause => self.mms_pause().await,
            MmsCommand::Resume => self.mms_resume().await,
            MmsCommand::SwapMapping { swap_num, slot, filename } => {
                if !self.check_slot_arg(swap_num) || !self.check_slot_arg(slot) {
                    return false;
                }
                self.swap.set_mapping(swap_num, slot, filename);
                self.host().respond("swap mapping updated");
                true
            }

            MmsCommand::Swap { slot } => self.cmd_swap(slot).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;

    use crate::host::Toolhead;
    use crate::testing::{insert_filament, ready_core};

    use super::{command_names, MmsCommand};

    #[test]
    fn registered_names_cover_the_surface_and_tn() {
        let names = command_names(4, "T");
        assert!(names.iter().any(|n| n == "MMS_LOAD"));
        assert!(names.iter().any(|n| n == "MMS_BUFFER_HALFWAY"));
        assert!(names.iter().any(|n| n == "MMS_SWAP_MAPPING"));
        assert!(names.iter().any(|n| n == "MMS_CAREFUL_CHARGE"));
        assert!(names.iter().any(|n| n == "MMS_TRAY_EJECT"));
        assert!(names.iter().any(|n| n == "MMS_BRUSH_PECK"));
        assert!(names.iter().any(|n| n == "MMS_CUT"));
        assert!(names.iter().any(|n| n == "T0"));
        assert!(names.iter().any(|n| n == "T3"));
        assert!(!names.iter().any(|n| n == "T4"));
    }

    #[test]
    fn invalid_slot_argument_is_reported() {
        let core = ready_core(4);
        assert!(!block_on(core.execute(MmsCommand::Load { slot: 9, wait: true })));
        assert!(!core.host().responses().is_empty());
    }

    #[test]
    fn busy_latch_refuses_second_deliver_command() {
        let core = ready_core(4);
        insert_filament(core, 0);
        let guard = core.claim_deliver();
        // No WAIT flag: the latch refuses
        assert!(!block_on(core.execute(MmsCommand::Select { slot: 0, wait: false })));
        drop(guard);
        assert!(block_on(core.execute(MmsCommand::Select { slot: 0, wait: false })));
    }

    #[test]
    fn wait_flag_bypasses_the_latch() {
        let core = ready_core(4);
        let guard = core.claim_deliver();
        assert!(block_on(core.execute(MmsCommand::Select { slot: 1, wait: true })));
        drop(guard);
    }

    #[test]
    fn status_command_responds() {
        let core = ready_core(4);
        assert!(block_on(core.execute(MmsCommand::Status)));
        let responses = core.host().responses();
        assert!(responses.iter().any(|r| r.contains("slot[0]")));
    }

    #[test]
    fn swap_mapping_command_edits_the_map() {
        let core = ready_core(4);
        assert!(block_on(core.execute(MmsCommand::SwapMapping {
            swap_num: 1,
            slot: 3,
            filename: None,
        })));
        assert_eq!(core.swap.mapped_slot(1), Some(3));
    }

    #[test]
    fn charge_command_refuses_over_a_triggered_gate() {
        let core = ready_core(4);
        crate::testing::load_to_gate_state(core, 0);
        core.host().clear_toolhead_ops();

        assert!(!block_on(core.execute(MmsCommand::Charge { slot: 1 })));
        // Refused before the snapshot scope: the toolhead never moved
        assert!(core.host().toolhead_ops().is_empty());
    }

    #[test]
    fn careful_charge_command_runs_under_a_snapshot() {
        let core = ready_core(4);
        insert_filament(core, 0);
        let before = core.host().position();

        assert!(block_on(core.execute(MmsCommand::CarefulCharge { slot: 0 })));

        let after = core.host().position();
        assert_eq!(before.x, after.x);
        assert_eq!(before.y, after.y);
    }

    #[test]
    fn tray_command_parks_over_the_tray() {
        let core = ready_core(4);
        core.host().clear_toolhead_ops();

        assert!(block_on(core.execute(MmsCommand::Tray)));

        use crate::testing::ToolheadOp;
        let ops = core.host().toolhead_ops();
        assert!(ops.iter().any(|op| matches!(op, ToolheadOp::MoveY(y) if *y == 100.0)));
        assert!(ops.iter().any(|op| matches!(op, ToolheadOp::MoveX(x) if *x == 60.0)));
        // The Z lift was undone
        assert_eq!(core.host().position().z, 5.0);
    }

    #[test]
    fn cut_command_is_refused_while_printing() {
        let core = ready_core(4);
        core.host().set_print_state(crate::host::PrintState::Printing);
        block_on(core.observe_tick());
        assert!(!block_on(core.execute(MmsCommand::Cut)));
    }

    #[test]
    fn brush_wipe_command_restores_fan_speed() {
        let core = ready_core(4);
        core.host().set_fan_speed(0.4);
        assert!(block_on(core.execute(MmsCommand::BrushWipe)));
        assert_eq!(core.host().fan_speed(), 0.4);
    }

    #[test]
    fn stop_is_refused_during_swap() {
        let core = ready_core(4);
        core.swap.force_running(true);
        assert!(!block_on(core.execute(MmsCommand::Stop { slot: None })));
        core.swap.force_running(false);
        assert!(block_on(core.execute(MmsCommand::Stop { slot: None })));
    }
}
