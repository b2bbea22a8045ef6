//! Delivery: atomic slot operations.
//!
//! Common shape: preflight, select the slot, run an endstop-armed drive
//! move toward the destination pin, retry a bounded number of times, and
//! raise `DeliveryFailed` when retries are exhausted. Cooperative cancels
//! surface as the silent `Terminated` signal. Forward moves run under a
//! fracture-monitor scope.

use core::cell::Cell;

use embassy_time::Duration;

use alloc::vec::Vec;

use crate::error::{MmsError, Result};
use crate::host::{Edge, Host, LedEffect};
use crate::sensor::EdgeHook;
use crate::slot::PinKind;
use crate::stepper::MoveStatus;
use crate::{fabs, fmax, fmin, MmsCore};

/// Command-layer bookkeeping: the single-flight latch for deliver
/// commands and the status-sampling task.
pub struct DeliveryState {
    pub(crate) busy: Cell<bool>,
    pub(crate) sampling: Cell<bool>,
}

impl DeliveryState {
    pub(crate) fn new() -> Self {
        Self {
            busy: Cell::new(false),
            sampling: Cell::new(false),
        }
    }
}

/// Releases the single-flight deliver latch on drop.
pub(crate) struct DeliverGuard<'a> {
    flag: &'a Cell<bool>,
}

impl Drop for DeliverGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

impl<H: Host> MmsCore<H> {
    /// Claim the single-flight deliver latch. A second deliver command
    /// while one runs is refused with a warning, never queued.
    pub(crate) fn claim_deliver(&self) -> Option<DeliverGuard<'_>> {
        if self.delivery.busy.get() {
            warn!("another deliver task is running, return...");
            return None;
        }
        self.delivery.busy.set(true);
        Some(DeliverGuard { flag: &self.delivery.busy })
    }

    fn can_deliver(&self) -> bool {
        if self.printer_is_shutdown() {
            warn!("printer is shutdown");
            return false;
        }
        true
    }

    // ---- Waits ----

    async fn wait_stepper_idle(
        &self,
        slot: usize,
        stepper: usize,
        interval: Option<Duration>,
        timeout: Option<Duration>,
    ) -> bool {
        let interval = interval.unwrap_or(self.config().delivery.wait_stepper_interval);
        let timeout = timeout.unwrap_or(self.config().delivery.wait_stepper_timeout);
        let begin = self.host().monotonic();

        while self.stepper(stepper).is_running() {
            self.host().pause(interval).await;
            let elapsed = self.host().monotonic() - begin;
            if elapsed > timeout.as_micros() as f64 / 1_000_000.0 {
                warn!(
                    "slot[{}] waiting for stepper idle timed out after {} s",
                    slot, elapsed
                );
                return false;
            }
        }
        true
    }

    pub(crate) async fn wait_selector(&self, slot: usize, timeout: Option<Duration>) -> bool {
        let selector = self.slot(slot).selector_stepper();
        self.wait_stepper_idle(slot, selector, None, timeout).await
    }

    pub(crate) async fn wait_drive(&self, slot: usize, timeout: Option<Duration>) -> bool {
        let drive = self.slot(slot).drive_stepper();
        self.wait_stepper_idle(slot, drive, None, timeout).await
    }

    pub(crate) async fn wait_selector_and_drive(&self, slot: usize) -> bool {
        self.wait_selector(slot, None).await;
        self.wait_drive(slot, None).await;
        let selector = self.stepper(self.slot(slot).selector_stepper());
        let drive = self.stepper(self.slot(slot).drive_stepper());
        !(selector.is_running() || drive.is_running())
    }

    /// Wait until the toolhead has no queued motion. Times out with a
    /// `false` return, never an error.
    pub(crate) async fn wait_toolhead(&self) -> bool {
        let interval = self.config().delivery.wait_toolhead_interval;
        let timeout = self.config().delivery.wait_toolhead_timeout;
        let begin = self.host().monotonic();
        while self.host().is_busy() {
            self.host().pause(interval).await;
            if self.host().monotonic() - begin > timeout.as_micros() as f64 / 1_000_000.0 {
                return false;
            }
        }
        true
    }

    // ---- Select ----

    fn led_rainbow_activate(&self, slots: &[Option<usize>], reverse: bool) {
        for slot in slots.iter().flatten() {
            self.led_activate(*slot, LedEffect::Rainbow, reverse);
        }
    }

    fn led_rainbow_deactivate(&self, slots: &[Option<usize>]) {
        for slot in slots.iter().flatten() {
            self.led_deactivate(*slot, LedEffect::Rainbow);
        }
    }

    async fn selector_refine_calibration(&self, slot: usize) {
        let selector = self.slot(slot).selector_stepper();
        if self.stepper(selector).can_calibrate() {
            let d = &self.config().delivery;
            debug!("selector refine calibration: {} mm", d.refine_calibration_distance);
            self.manual_move(
                selector,
                d.refine_calibration_distance,
                d.speed_selector,
                d.accel_selector,
            )
            .await;
        }
    }

    async fn selector_deliver_to(&self, slot: usize) -> Result<MoveStatus> {
        if !self.can_deliver() {
            // Raised by the caller, after the selection LEDs are gone
            return Err(MmsError::DeliveryPrecondition { slot });
        }

        let selector = self.slot(slot).selector_stepper();
        let endstops = self.endstop_pairs(slot, PinKind::Selector);
        let d = &self.config().delivery;

        let _wait = self.slot(slot).pin(PinKind::Selector).wait();
        self.manual_home(
            selector,
            d.stepper_move_distance,
            d.speed_selector,
            d.accel_selector,
            true,
            Edge::Triggered,
            &endstops,
        )
        .await
    }

    /// Home the selector onto `slot`. A slot whose selector pin already
    /// reads triggered is a no-op apart from a focus bump.
    pub async fn select_slot(&self, slot: usize) -> Result<()> {
        let selector_idx = self.slot(slot).selector_stepper();
        let selector = self.stepper(selector_idx);

        if self.pin_triggered(slot, PinKind::Selector) {
            self.enable_stepper(selector_idx);
            selector.update_focus_slot(Some(slot));
            debug!("slot[{}] is already selected, skip...", slot);
            return Ok(());
        }

        let focus = selector.focus_slot();
        let led_slots = [focus, Some(slot)];
        let reverse = focus.map(|f| f > slot).unwrap_or(false);
        self.led_rainbow_activate(&led_slots, reverse);

        let mut completed = false;
        for i in 0..self.config().retry_times {
            let status = match self.selector_deliver_to(slot).await {
                Ok(status) => status,
                Err(err) => {
                    self.led_rainbow_deactivate(&led_slots);
                    return Err(self.raise(err));
                }
            };

            if self.stepper(selector_idx).move_is_terminated(Some(status)) {
                self.led_rainbow_deactivate(&led_slots);
                debug!("slot[{}] select is terminated", slot);
                return Err(MmsError::Terminated);
            }
            if self.stepper(selector_idx).move_is_completed(Some(status)) {
                self.stepper(selector_idx).update_focus_slot(Some(slot));
                completed = true;
                break;
            }

            self.host().pause(self.config().delivery.retry_period).await;
            info!(
                "slot[{}] select failed, retry {}/{} ...",
                slot,
                i + 1,
                self.config().retry_times
            );
        }

        // Recover overtravel once the selector pin reads triggered
        if completed {
            self.selector_refine_calibration(slot).await;
        }
        self.led_rainbow_deactivate(&led_slots);

        if !completed {
            return Err(self.raise(MmsError::DeliveryFailed { slot }));
        }
        Ok(())
    }

    // ---- Deliver ----

    async fn deliver_distance(
        &self,
        slot: usize,
        distance: f64,
        speed: Option<f64>,
        accel: Option<f64>,
    ) -> Result<()> {
        if !self.can_deliver() {
            return Err(self.raise(MmsError::DeliveryPrecondition { slot }));
        }

        if !self.wait_selector_and_drive(slot).await {
            warn!("slot[{}] wait selector or drive stepper idle timeout", slot);
        }

        let d = &self.config().delivery;
        let speed = speed.unwrap_or(d.speed_drive);
        let accel = accel.unwrap_or(d.accel_drive);
        debug!("slot[{}] deliver {} mm", slot, distance);

        self.select_slot(slot).await?;
        let drive = self.slot(slot).drive_stepper();
        self.stepper(drive).update_focus_slot(Some(slot));
        self.manual_move(drive, distance, speed, accel).await;
        Ok(())
    }

    async fn drip_deliver_distance(
        &self,
        slot: usize,
        distance: f64,
        speed: Option<f64>,
        accel: Option<f64>,
    ) -> Result<()> {
        if !self.can_deliver() {
            return Err(self.raise(MmsError::DeliveryPrecondition { slot }));
        }

        if !self.wait_selector_and_drive(slot).await {
            warn!("slot[{}] wait selector or drive stepper idle timeout", slot);
        }

        let d = &self.config().delivery;
        let speed = speed.unwrap_or(d.speed_drive);
        let accel = accel.unwrap_or(d.accel_drive);
        debug!("slot[{}] drip deliver {} mm", slot, distance);

        self.select_slot(slot).await?;
        let drive = self.slot(slot).drive_stepper();
        self.stepper(drive).update_focus_slot(Some(slot));

        let monitor = distance > 0.0;
        let _armed = monitor.then(|| self.arm_fracture_homing(slot));
        self.drip_move(drive, distance, speed, accel).await;
        drop(_armed);
        self.run_pending_fracture().await;
        Ok(())
    }

    async fn drive_deliver_to(
        &self,
        slot: usize,
        kind: PinKind,
        forward: bool,
        trigger: bool,
        distance: Option<f64>,
        speed: Option<f64>,
        accel: Option<f64>,
    ) -> Result<MoveStatus> {
        if !self.can_deliver() {
            return Err(self.raise(MmsError::DeliveryPrecondition { slot }));
        }

        let d = &self.config().delivery;
        let dist = distance.unwrap_or(d.stepper_move_distance);
        let spd = speed.map(|s| fmin(fmax(s, 0.0), d.speed_drive)).unwrap_or(d.speed_drive);
        let acc = accel.map(|a| fmin(fmax(a, 0.0), d.accel_drive)).unwrap_or(d.accel_drive);

        let drive = self.slot(slot).drive_stepper();
        self.stepper(drive).update_focus_slot(Some(slot));
        let endstops = self.endstop_pairs(slot, kind);

        let status = {
            let _wait = self.slot(slot).pin(kind).wait();
            let _armed = forward.then(|| self.arm_fracture_homing(slot));
            self.manual_home(
                drive,
                dist,
                spd,
                acc,
                forward,
                Edge::from_trigger(trigger),
                &endstops,
            )
            .await?
        };
        self.run_pending_fracture().await;
        Ok(status)
    }

    /// Retry shell around `drive_deliver_to`: re-select before every
    /// attempt, skip when the destination pin already reads right,
    /// surface terminations, raise after the last retry.
    ///
    /// `Ok(true)` means a move was actually performed; `Ok(false)` is the
    /// already-satisfied skip.
    async fn deliver_to(
        &self,
        slot: usize,
        kind: PinKind,
        forward: bool,
        trigger: bool,
        distance: Option<f64>,
        speed: Option<f64>,
        accel: Option<f64>,
    ) -> Result<bool> {
        let drive = self.slot(slot).drive_stepper();

        for i in 0..self.config().retry_times {
            if !self.wait_selector_and_drive(slot).await {
                warn!("slot[{}] wait selector or drive stepper idle timeout", slot);
            }
            self.select_slot(slot).await?;

            if self.check_pin(slot, kind, trigger) {
                debug!("slot[{}] deliver to '{}' is already done, skip...", slot, kind.name());
                return Ok(false);
            }

            let status = self
                .drive_deliver_to(slot, kind, forward, trigger, distance, speed, accel)
                .await?;

            if self.stepper(drive).move_is_terminated(Some(status)) {
                debug!("slot[{}] deliver to '{}' is terminated", slot, kind.name());
                return Err(MmsError::Terminated);
            }
            if self.stepper(drive).move_is_completed(Some(status)) {
                debug!("slot[{}] deliver to '{}' is completed", slot, kind.name());
                return Ok(true);
            }

            self.host().pause(self.config().delivery.retry_period).await;
            info!(
                "slot[{}] deliver to '{}' failed, retry {}/{} ...",
                slot,
                kind.name(),
                i + 1,
                self.config().retry_times
            );
        }

        Err(self.raise(MmsError::DeliveryFailed { slot }))
    }

    fn check_slot_is_ready(&self, slot: usize) -> Result<()> {
        if self.slot_is_ready(slot) {
            return Ok(());
        }
        warn!("slot[{}] is not ready, please check inlet", slot);
        Err(self.raise(MmsError::DeliveryReady { slot }))
    }

    // ---- Atomic operations ----

    pub async fn move_forward(
        &self,
        slot: usize,
        distance: f64,
        speed: Option<f64>,
        accel: Option<f64>,
    ) -> Result<()> {
        self.deliver_distance(slot, fabs(distance), speed, accel).await
    }

    pub async fn move_backward(
        &self,
        slot: usize,
        distance: f64,
        speed: Option<f64>,
        accel: Option<f64>,
    ) -> Result<()> {
        self.deliver_distance(slot, -fabs(distance), speed, accel).await
    }

    pub async fn load_to_gate(&self, slot: usize) -> Result<bool> {
        self.check_slot_is_ready(slot)?;
        self.deliver_to(slot, PinKind::Gate, true, true, None, None, None).await
    }

    pub async fn load_to_outlet(
        &self,
        slot: usize,
        distance: Option<f64>,
        speed: Option<f64>,
        accel: Option<f64>,
    ) -> Result<bool> {
        self.check_slot_is_ready(slot)?;
        self.deliver_to(slot, PinKind::Outlet, true, true, distance, speed, accel)
            .await
    }

    pub async fn load_to_entry(&self, slot: usize) -> Result<bool> {
        self.check_slot_is_ready(slot)?;
        self.deliver_to(slot, PinKind::Entry, true, true, None, None, None).await
    }

    pub async fn load_until_buffer_runout_release(
        &self,
        slot: usize,
        distance: Option<f64>,
        speed: Option<f64>,
        accel: Option<f64>,
    ) -> Result<bool> {
        self.check_slot_is_ready(slot)?;
        self.deliver_to(slot, PinKind::BufferRunout, true, false, distance, speed, accel)
            .await
    }

    pub async fn unload_to_outlet(&self, slot: usize) -> Result<bool> {
        self.check_slot_is_ready(slot)?;
        self.deliver_to(slot, PinKind::Outlet, false, false, None, None, None).await
    }

    pub async fn unload_until_buffer_runout_trigger(
        &self,
        slot: usize,
        distance: Option<f64>,
        speed: Option<f64>,
        accel: Option<f64>,
    ) -> Result<bool> {
        self.check_slot_is_ready(slot)?;
        self.deliver_to(slot, PinKind::BufferRunout, false, true, distance, speed, accel)
            .await
    }

    /// Unload until the gate releases, then retreat the safety distance so
    /// the filament sits clear of the gate. The retreat only applies when
    /// the unload homing move actually ran.
    pub async fn unload_to_gate(&self, slot: usize) -> Result<()> {
        self.check_slot_is_ready(slot)?;
        let moved = self.deliver_to(slot, PinKind::Gate, false, false, None, None, None).await?;
        if moved {
            self.move_backward(slot, self.config().delivery.safety_retract_distance, None, None)
                .await?;
        }
        Ok(())
    }

    pub async fn unload_to_inlet(&self, slot: usize) -> Result<bool> {
        self.check_slot_is_ready(slot)?;
        self.deliver_to(slot, PinKind::Inlet, false, false, None, None, None).await
    }

    /// Unload until the gate releases without the inlet preflight. Used by
    /// the fracture recovery where the inlet is already gone.
    pub(crate) async fn unload_to_release_gate(&self, slot: usize) -> Result<bool> {
        self.deliver_to(slot, PinKind::Gate, false, false, None, None, None).await
    }

    /// Unload every loading slot to gate release, except `skip`.
    pub async fn unload_loading_slots(&self, skip: Option<usize>) -> Result<()> {
        let loading = self.loading_slots();
        if loading.is_empty() {
            debug!("no loading slots, unload skip...");
            return Ok(());
        }
        for slot in loading {
            if Some(slot) == skip {
                debug!("slot[{}] is loading, unload skip...", slot);
                continue;
            }
            self.unload_to_gate(slot).await?;
        }
        Ok(())
    }

    pub async fn pop_slot(&self, slot: usize) -> Result<bool> {
        self.check_slot_is_ready(slot)?;
        self.unload_to_inlet(slot).await
    }

    pub async fn pop_all_slots(&self) -> Result<()> {
        for slot in 0..self.slot_count() {
            if self.slot_is_ready(slot) {
                self.pop_slot(slot).await?;
            }
        }
        Ok(())
    }

    /// Select any slot other than `slot`.
    pub(crate) async fn select_another_slot(&self, slot: usize) -> Result<()> {
        for other in 0..self.slot_count() {
            if other != slot {
                debug!("slot[{}] select another slot[{}]", slot, other);
                return self.select_slot(other).await;
            }
        }
        Ok(())
    }

    // ---- Deliver commands ----
    // The `mms_*` entry points map every error to a boolean result;
    // `Terminated` stays silent.

    pub async fn mms_load(&self, slot: usize) -> bool {
        debug!("slot[{}] load begin", slot);
        let sequence = async {
            self.unload_loading_slots(Some(slot)).await?;
            if self.entry_is_set(slot) {
                self.load_to_entry(slot).await?;
            } else {
                self.load_to_outlet(slot, None, None, None).await?;
            }
            Ok::<(), MmsError>(())
        };
        match sequence.await {
            Ok(()) => {
                debug!("slot[{}] load finish", slot);
                true
            }
            Err(MmsError::Terminated) => {
                debug!("slot[{}] load terminated", slot);
                false
            }
            Err(_) => {
                error!("slot[{}] load error", slot);
                false
            }
        }
    }

    pub async fn mms_unload(&self, slot: Option<usize>) -> bool {
        let result = match slot {
            Some(slot) => self.unload_to_gate(slot).await,
            None => self.unload_loading_slots(None).await,
        };
        match result {
            Ok(()) => true,
            Err(MmsError::Terminated) => {
                debug!("unload terminated");
                false
            }
            Err(_) => {
                error!("unload error");
                false
            }
        }
    }

    pub async fn mms_pop(&self, slot: Option<usize>) -> bool {
        let result = match slot {
            Some(slot) => self.pop_slot(slot).await.map(|_| ()),
            None => self.pop_all_slots().await,
        };
        match result {
            Ok(()) => true,
            Err(MmsError::Terminated) => {
                debug!("pop terminated");
                false
            }
            Err(_) => {
                error!("pop error");
                false
            }
        }
    }

    /// Unload the others, load to the gate and park just behind it.
    pub async fn mms_prepare(&self, slot: usize) -> bool {
        debug!("slot[{}] prepare begin", slot);
        let sequence = async {
            self.unload_loading_slots(Some(slot)).await?;
            self.load_to_gate(slot).await?;
            self.unload_to_gate(slot).await
        };
        match sequence.await {
            Ok(()) => {
                debug!("slot[{}] prepare finish", slot);
                true
            }
            Err(MmsError::Terminated) => {
                debug!("slot[{}] prepare terminated", slot);
                false
            }
            Err(_) => {
                error!("slot[{}] prepare error", slot);
                false
            }
        }
    }

    pub async fn mms_move(
        &self,
        slot: usize,
        distance: f64,
        speed: Option<f64>,
        accel: Option<f64>,
    ) -> bool {
        if fabs(distance) > self.config().delivery.stepper_move_distance {
            warn!("slot[{}] can not move {} mm", slot, distance);
            return false;
        }
        let result = if distance > 0.0 {
            self.move_forward(slot, distance, speed, accel).await
        } else {
            self.move_backward(slot, distance, speed, accel).await
        };
        match result {
            Ok(()) => true,
            Err(MmsError::Terminated) => {
                debug!("slot[{}] move terminated", slot);
                false
            }
            Err(_) => {
                error!("slot[{}] move error", slot);
                false
            }
        }
    }

    pub async fn mms_drip_move(
        &self,
        slot: usize,
        distance: f64,
        speed: Option<f64>,
        accel: Option<f64>,
    ) -> bool {
        if fabs(distance) > self.config().delivery.stepper_move_distance {
            warn!("slot[{}] can not drip move {} mm", slot, distance);
            return false;
        }
        let result = if distance > 0.0 {
            self.drip_deliver_distance(slot, fabs(distance), speed, accel).await
        } else {
            self.drip_deliver_distance(slot, -fabs(distance), speed, accel).await
        };
        match result {
            Ok(()) => true,
            Err(MmsError::Terminated) => {
                debug!("slot[{}] drip move terminated", slot);
                false
            }
            Err(_) => {
                error!("slot[{}] drip move error", slot);
                false
            }
        }
    }

    pub async fn mms_select(&self, slot: usize) -> bool {
        match self.select_slot(slot).await {
            Ok(()) => true,
            Err(MmsError::Terminated) => {
                debug!("slot[{}] select terminated", slot);
                false
            }
            Err(_) => {
                error!("slot[{}] select error", slot);
                false
            }
        }
    }

    pub async fn mms_unselect(&self, slot: usize) -> bool {
        match self.select_another_slot(slot).await {
            Ok(()) => true,
            Err(MmsError::Terminated) => {
                debug!("slot[{}] unselect terminated", slot);
                false
            }
            Err(_) => {
                error!("slot[{}] unselect error", slot);
                false
            }
        }
    }

    /// Stop outstanding homing waits, buffer monitors and drive motion for
    /// one slot (or all of them).
    pub async fn mms_stop(&self, slot: Option<usize>) -> bool {
        let slots: Vec<usize> = match slot {
            Some(slot) => alloc::vec![slot],
            None => (0..self.slot_count()).collect(),
        };
        for slot in slots {
            if self.waiting_pin(slot).is_some() {
                self.stop_homing(slot).await;
            }

            let buffer = self.buffer_of(slot).index();
            if self.buffer(buffer).is_activating() {
                self.deactivate_buffer_monitor(buffer);
            }

            let drive = self.stepper(self.slot(slot).drive_stepper());
            if drive.is_running() {
                drive.terminate_drip_move();
            }
            let selector = self.stepper(self.slot(slot).selector_stepper());
            if selector.is_running() {
                selector.terminate_drip_move();
            }
        }
        true
    }

    // ---- Diagnostics ----

    fn can_walk(&self) -> bool {
        if self.printer_is_shutdown() {
            warn!("can not walk when printer is shutdown");
            return false;
        }
        if self.printer_is_printing() {
            warn!("can not walk when printer is printing");
            return false;
        }
        if self.printer_is_paused() {
            warn!("can not walk when printer is paused");
            return false;
        }
        if self.printer_is_resuming() {
            warn!("can not walk when printer is resuming");
            return false;
        }
        true
    }

    fn verify_pins(&self, slot: usize, loaded: bool) -> core::result::Result<(), &'static str> {
        if !self.pin_triggered(slot, PinKind::Inlet) {
            return Err("inlet");
        }
        if self.pin_triggered(slot, PinKind::Gate) != loaded {
            return Err("gate");
        }
        if self.pin_triggered(slot, PinKind::BufferRunout) == loaded {
            return Err("buffer_runout");
        }
        if self.pin_triggered(slot, PinKind::Outlet) != loaded {
            return Err("outlet");
        }
        if self.entry_is_set(slot) && self.entry_is_triggered(slot) != loaded {
            return Err("entry");
        }
        Ok(())
    }

    /// Walk every slot: unload all, verify the pin truth table, load to
    /// outlet (and entry), verify again.
    pub async fn mms_slots_check(&self) -> bool {
        info!("slots check begin");
        for slot in 0..self.slot_count() {
            if !self.can_walk() {
                return false;
            }

            let round = async {
                self.unload_loading_slots(None).await?;
                self.host().pause(Duration::from_secs(1)).await;
                info!("unload: {}", self.format_pins_status(slot).as_str());
                if let Err(pin) = self.verify_pins(slot, false) {
                    error!("slots check pin mismatch: {}", pin);
                    return Err(MmsError::DeliveryFailed { slot });
                }

                self.load_to_outlet(slot, None, None, None).await?;
                if self.entry_is_set(slot) && !self.entry_is_triggered(slot) {
                    self.load_to_entry(slot).await?;
                }
                info!("load: {}", self.format_pins_status(slot).as_str());
                if let Err(pin) = self.verify_pins(slot, true) {
                    error!("slots check pin mismatch: {}", pin);
                    return Err(MmsError::DeliveryFailed { slot });
                }
                Ok(())
            };
            match round.await {
                Ok(()) => {}
                Err(MmsError::Terminated) => {
                    info!("slots check terminated");
                    return false;
                }
                Err(MmsError::DeliveryReady { .. }) => {}
                Err(_) => {
                    error!("slots check error");
                    return false;
                }
            }
        }

        if self.can_walk() {
            match self.unload_loading_slots(None).await {
                Ok(()) => {}
                Err(MmsError::Terminated) => {
                    info!("slots check terminated");
                    return false;
                }
                Err(MmsError::DeliveryReady { .. }) => {}
                Err(_) => {
                    error!("slots check error");
                    return false;
                }
            }
        }

        info!("slots check finish");
        true
    }

    /// Run the slots check until failure or the configured round count.
    pub async fn mms_slots_loop(&self) -> bool {
        info!("slots loop begin");
        let total = self.config().delivery.slots_loop_times;
        for i in 0..total {
            info!("slots loop round {}/{}", i + 1, total);
            if !self.mms_slots_check().await || !self.can_walk() {
                info!("slots loop finish early");
                return false;
            }
        }
        info!("slots loop finish");
        true
    }

    /// Fracture-monitor arm for the scope of one forward move.
    pub(crate) fn arm_fracture_homing(&self, slot: usize) -> FractureArm<'_, H> {
        let hook = EdgeHook::FractureWhileHoming { slot };
        let sensor = self.slot(slot).pin(PinKind::Inlet).sensor();
        if let Some(sensor) = sensor {
            if self.fracture.enabled.get() {
                self.sensor(sensor).add_hook(Edge::Released, hook);
                return FractureArm { core: self, sensor: Some(sensor), hook };
            }
        }
        FractureArm { core: self, sensor: None, hook }
    }
}

/// Removes the one-shot fracture hook on drop.
pub(crate) struct FractureArm<'a, H: Host> {
    core: &'a MmsCore<H>,
    sensor: Option<usize>,
    hook: EdgeHook,
}

impl<H: Host> Drop for FractureArm<'_, H> {
    fn drop(&mut self) {
        if let Some(sensor) = self.sensor {
            self.core.sensor(sensor).remove_hook(Edge::Released, self.hook);
        }
    }
}
