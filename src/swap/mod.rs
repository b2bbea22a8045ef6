//! Filament swap: the top-of-stack state machine behind the slicer's
//! `T<n>` commands.
//!
//! A swap resolves the commanded index through the per-print swap map,
//! passes the safety gate, snapshots the toolhead, and runs either the
//! shortcut path (charge, purge, halfway, brush) or the standard path
//! (eject first) depending on what is loaded. Any failing phase aborts
//! the swap, registers the same invocation as the resume hook and pauses
//! the print.

mod brush;
mod charge;
mod cut;
mod eject;
mod purge;

use core::cell::{Cell, RefCell};

use alloc::collections::BTreeMap;
use alloc::string::String;

use crate::host::{Host, PrintState, ToolheadPosition};
use crate::MmsCore;

/// Saved toolhead context around a swap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ToolheadSnapshot {
    position: ToolheadPosition,
    target_temp: f64,
    fan_speed: f64,
}

/// Swap bookkeeping: the per-print map, the serialization latches of the
/// swap itself and of each sub-phase, and the toolhead snapshot.
pub struct SwapState {
    slot_count: usize,
    running: Cell<bool>,
    slot_num_to: Cell<Option<usize>>,
    mapping: RefCell<BTreeMap<usize, usize>>,
    filename: RefCell<Option<String>>,
    snapshot: Cell<Option<ToolheadSnapshot>>,

    pub(crate) eject_running: Cell<bool>,
    pub(crate) charge_running: Cell<bool>,
    pub(crate) purge_running: Cell<bool>,
    pub(crate) brush_running: Cell<bool>,
    pub(crate) cut_running: Cell<bool>,

    pub(crate) charging_slot: Cell<Option<usize>>,
    pub(crate) eject_retract_end: Cell<bool>,
}

impl SwapState {
    pub(crate) fn new(slot_count: usize) -> Self {
        let state = Self {
            slot_count,
            running: Cell::new(false),
            slot_num_to: Cell::new(None),
            mapping: RefCell::new(BTreeMap::new()),
            filename: RefCell::new(None),
            snapshot: Cell::new(None),
            eject_running: Cell::new(false),
            charge_running: Cell::new(false),
            purge_running: Cell::new(false),
            brush_running: Cell::new(false),
            cut_running: Cell::new(false),
            charging_slot: Cell::new(None),
            eject_retract_end: Cell::new(false),
        };
        state.reset_mapping();
        state
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    #[cfg(test)]
    pub(crate) fn force_running(&self, value: bool) {
        self.running.set(value);
    }

    /// Target slot of the swap in flight.
    pub fn slot_num_to(&self) -> Option<usize> {
        self.slot_num_to.get()
    }

    /// Identity map; cleared filename.
    pub(crate) fn reset_mapping(&self) {
        let mut mapping = self.mapping.borrow_mut();
        mapping.clear();
        for n in 0..self.slot_count {
            mapping.insert(n, n);
        }
        *self.filename.borrow_mut() = None;
    }

    /// Stamp the map with the filename of the starting print.
    pub(crate) fn init_mapping_filename(&self, filename: Option<String>) {
        let mut current = self.filename.borrow_mut();
        if current.is_none() {
            *current = filename;
        }
    }

    pub(crate) fn mapping_filename(&self) -> Option<String> {
        self.filename.borrow().clone()
    }

    /// Raw map entry for a swap index.
    pub fn mapped_slot(&self, swap_num: usize) -> Option<usize> {
        self.mapping.borrow().get(&swap_num).copied()
    }

    /// Promote `slot_num_new` wherever `slot_num` was serving, including
    /// entries that had already been redirected onto it.
    pub(crate) fn update_mapping_slot_num(&self, slot_num: usize, slot_num_new: usize) {
        let mut mapping = self.mapping.borrow_mut();
        if !mapping.contains_key(&slot_num) {
            return;
        }
        mapping.insert(slot_num, slot_num_new);
        for value in mapping.values_mut() {
            if *value == slot_num {
                *value = slot_num_new;
            }
        }
        info!("slot[{}] replaced by slot[{}] in the swap mapping", slot_num, slot_num_new);
    }

    /// Explicit `MMS_SWAP_MAPPING` edit.
    pub(crate) fn set_mapping(&self, swap_num: usize, slot_num: usize, filename: Option<String>) {
        self.mapping.borrow_mut().insert(swap_num, slot_num);
        *self.filename.borrow_mut() = filename;
    }
}

struct RunningGuard<'a> {
    flag: &'a Cell<bool>,
}

impl<'a> RunningGuard<'a> {
    fn claim(flag: &'a Cell<bool>) -> Option<Self> {
        if flag.get() {
            return None;
        }
        flag.set(true);
        Some(Self { flag })
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

impl<H: Host> MmsCore<H> {
    // ---- Toolhead snapshot ----

    pub(crate) fn save_toolhead_snapshot(&self) {
        if self.swap.snapshot.get().is_some() {
            warn!("another toolhead snapshot exists, save failed");
            return;
        }
        self.swap.snapshot.set(Some(ToolheadSnapshot {
            position: self.host().position(),
            target_temp: self.host().extruder_target_temp(),
            fan_speed: self.host().fan_speed(),
        }));
    }

    pub(crate) fn truncate_toolhead_snapshot(&self) {
        if self.swap.snapshot.take().is_none() {
            warn!("no toolhead snapshot found, truncate failed");
        }
    }

    pub(crate) async fn restore_toolhead_snapshot(&self) {
        let Some(snapshot) = self.swap.snapshot.take() else {
            warn!("no toolhead snapshot found, restore failed");
            return;
        };
        if !self.host().is_homed() {
            warn!("toolhead not homed, snapshot dropped");
            return;
        }
        if matches!(self.print_state(), PrintState::Paused | PrintState::Finished) {
            debug!("print is paused or finished, snapshot dropped");
            return;
        }

        let p = snapshot.position;
        self.host().move_xy(p.x, p.y, None, true).await;
        self.host().move_z(p.z, None, true).await;

        let current = self.host().extruder_temp();
        if snapshot.target_temp > current {
            self.host()
                .set_extruder_temperature(snapshot.target_temp, false)
                .await;
        }
        self.host().set_fan_speed(snapshot.fan_speed);
    }

    /// Snapshot scope of the hand-operated phase commands: save, run,
    /// restore.
    pub(crate) async fn run_with_snapshot<F>(&self, run: F) -> bool
    where
        F: core::future::Future<Output = bool>,
    {
        self.save_toolhead_snapshot();
        let result = run.await;
        self.restore_toolhead_snapshot().await;
        result
    }

    /// Snapshot scope with a Z lift held for the duration of `run`.
    pub(crate) async fn run_with_snapshot_z<F>(&self, z_raise: f64, run: F) -> bool
    where
        F: core::future::Future<Output = bool>,
    {
        self.save_toolhead_snapshot();
        self.host().move_z_relative(z_raise).await;
        let result = run.await;
        self.host().move_z_relative(-z_raise).await;
        self.restore_toolhead_snapshot().await;
        result
    }

    // ---- Swap mapping ----

    /// Resolve a swap index through the per-print map. A map stamped for a
    /// different file is ignored.
    pub(crate) fn get_mapping_slot_num(&self, swap_num: usize) -> Option<usize> {
        if self.swap.mapping_filename() == self.host().print_filename() {
            let target = self.swap.mapped_slot(swap_num);
            debug!("command slot[{}] resolves to {:?}", swap_num, target);
            return target;
        }
        Some(swap_num)
    }

    // ---- Swap ----

    /// Deactivate the buffer of a slot and wait for its steppers.
    pub(crate) async fn pause_swap_buffer(&self, slot: usize) -> bool {
        let buffer = self.buffer_of(slot).index();
        self.deactivate_buffer_monitor(buffer);
        if !self.wait_selector_and_drive(slot).await {
            error!("slot[{}] selector or drive still running after wait timeout", slot);
            return false;
        }
        true
    }

    fn swap_safety_checks(&self, slot_num_to: Option<usize>) -> bool {
        let Some(slot_num_to) = slot_num_to else {
            warn!("target slot is None, return");
            return false;
        };
        if self.swap.is_running() {
            warn!("another swap is running, return");
            return false;
        }
        if !self.host().is_homed() {
            warn!("toolhead is not homed, return");
            return false;
        }
        if !self.host().can_extrude() {
            error!("extruder is not hot enough");
            return false;
        }
        if !self.slot_is_ready(slot_num_to) {
            warn!("slot[{}] inlet is not triggered, swap failed", slot_num_to);
            return false;
        }
        true
    }

    /// Park, then charge / purge / halfway / brush the target slot.
    async fn shortcut_swap(&self, slot_num: usize) -> Result<(), ()> {
        debug!("slot[{}] shortcut swap begin", slot_num);

        if self.config().purge.enable {
            self.purge_move_to_tray().await;
        } else {
            self.cut_init().await;
        }

        if !self.mms_charge(slot_num).await {
            error!("slot[{}] charge failed", slot_num);
            return Err(());
        }
        if !self.mms_purge().await {
            error!("slot[{}] purge failed", slot_num);
            return Err(());
        }
        if !self.buffer_halfway(slot_num).await {
            error!("slot[{}] halfway buffer failed", slot_num);
            return Err(());
        }
        if !self.mms_brush().await {
            error!("slot[{}] brush failed", slot_num);
            return Err(());
        }

        debug!("slot[{}] shortcut swap finish", slot_num);
        Ok(())
    }

    /// Eject whatever is loaded, then run the shortcut phases.
    async fn standard_swap(&self, slot_num_from: Option<usize>, slot_num_to: usize) -> Result<(), ()> {
        debug!("slot[{:?}] to slot[{}] standard swap begin", slot_num_from, slot_num_to);

        if self.config().purge.enable {
            self.purge_move_to_tray().await;
        } else {
            self.cut_init().await;
        }

        if !self.mms_eject(true).await {
            error!("slot[{:?}] eject failed", slot_num_from);
            return Err(());
        }
        if !self.mms_charge(slot_num_to).await {
            error!("slot[{}] charge failed", slot_num_to);
            return Err(());
        }
        if !self.mms_purge().await {
            error!("slot[{}] purge failed", slot_num_to);
            return Err(());
        }
        if !self.buffer_halfway(slot_num_to).await {
            error!("slot[{}] halfway buffer failed", slot_num_to);
            return Err(());
        }
        if !self.mms_brush().await {
            error!("slot[{}] brush failed", slot_num_to);
            return Err(());
        }

        debug!("standard swap finish");
        Ok(())
    }

    async fn mms_swap(&self, swap_num: usize) -> bool {
        if let Some(before) = self.config().swap.custom_before.clone() {
            self.host().run_macro(&before).await;
        }

        if !self.config().swap.enable {
            debug!("MMS swap is disabled, skip...");
            return true;
        }

        let slot_num_from = self.current_slot();
        let slot_num_to = self.get_mapping_slot_num(swap_num);
        let loading = self.loading_slots();

        if !self.swap_safety_checks(slot_num_to) {
            self.handle_swap_failure(swap_num).await;
            return false;
        }
        let slot_num_to = slot_num_to.unwrap();
        debug!("swap to slot[{}], loading slots: {:?}", slot_num_to, loading);

        let success = {
            let Some(_running) = RunningGuard::claim(&self.swap.running) else {
                // Guarded above; kept as a hard serialization point
                return false;
            };

            let sequence = async {
                if let Some(from) = slot_num_from {
                    if !self.pause_swap_buffer(from).await {
                        return Err(());
                    }
                }
                if !self.pause_swap_buffer(slot_num_to).await {
                    return Err(());
                }

                if loading.is_empty() || loading == alloc::vec![slot_num_to] {
                    self.shortcut_swap(slot_num_to).await?;
                } else {
                    self.standard_swap(slot_num_from, slot_num_to).await?;
                }

                let buffer = self.buffer_of(slot_num_to).index();
                self.activate_buffer_monitor(buffer);
                Ok(())
            };
            sequence.await.is_ok()
        };

        if !success {
            self.handle_swap_failure(swap_num).await;
            return false;
        }

        if let Some(after) = self.config().swap.custom_after.clone() {
            self.host().run_macro(&after).await;
        }
        true
    }

    /// Abort pipeline of a failing swap: lower Z, drop the snapshot,
    /// register this same invocation as the resume hook, and pause the
    /// print if one is active.
    async fn handle_swap_failure(&self, swap_num: usize) {
        self.host()
            .move_z_relative(-self.config().swap.z_raise)
            .await;
        self.truncate_toolhead_snapshot();

        warn!("'T{}' failed, pause print...", swap_num);
        self.set_swap_resume(swap_num);

        if self.printer_is_printing() || self.host().print_state() == PrintState::Printing {
            self.mms_pause().await;
        }
    }

    /// Entry point of the slicer-issued `T<n>` command.
    pub async fn cmd_swap(&self, swap_num: usize) -> bool {
        if self.printer_is_shutdown() {
            warn!("'T{}' can not execute now", swap_num);
            return false;
        }
        if !self.slot_is_available(swap_num) {
            error!("invalid swap command: T{}", swap_num);
            return false;
        }

        self.save_toolhead_snapshot();
        self.host().move_z_relative(self.config().swap.z_raise).await;

        self.swap.slot_num_to.set(Some(swap_num));
        info!("'T{}' begin", swap_num);

        let success = self.mms_swap(swap_num).await;

        self.swap.slot_num_to.set(None);
        if success {
            self.host()
                .move_z_relative(-self.config().swap.z_raise)
                .await;
            info!("'T{}' finish", swap_num);
        } else {
            info!("'T{}' failed", swap_num);
        }

        self.restore_toolhead_snapshot().await;
        success
    }
}
