//! Sensor layer: digital buttons and ADC edge detection.
//!
//! A [`Sensor`] wraps either a digital input or an ADC-sampled signal and
//! turns raw samples into `Triggered`/`Released` edges. A `!` prefix on the
//! pin name reverses polarity. Sensor faults never propagate: the sensor
//! simply stays in the last successfully observed state.

use core::cell::{Cell, RefCell};

use embedded_hal_1::digital::PinState;

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;

use crate::host::Edge;

/// Length of the ADC value history.
const ADC_WINDOW_SIZE: usize = 10;
/// Scale applied to the window maximum when computing the midpoint.
const ADC_UPPER_SCALE: f64 = 1.1;
/// Minimum observed range before midpoint/trend detection engages.
const INTERVAL_DELTA_THRESHOLD: i32 = 200;
/// Fixed threshold for initial trigger detection below that range.
const INIT_TRIGGER_THRESHOLD: i32 = 150;

/// Samples for trend averaging.
const TREND_WINDOW_SIZE: usize = 5;
/// Sigma multiplier for rising edges.
const RISE_SENSITIVITY: f64 = 0.8;
/// Sigma multiplier for falling edges.
const FALL_SENSITIVITY: f64 = 1.6;
/// Threshold scaling for slow changes.
const SLOW_SCALE: f64 = 1.3;
/// Threshold scaling for fast changes.
const FAST_SCALE: f64 = 0.8;
/// Minimum trend magnitude for detection.
const MIN_TREND: f64 = 50.0;

/// Outlet signals change slowly; their detector runs more sensitive.
const OUTLET_SLOW_SCALE: f64 = 2.0;
const OUTLET_FAST_SCALE: f64 = 0.8;
const OUTLET_MIN_TREND: f64 = 5.0;

/// One-shot actions attached to a sensor edge. The core interprets these
/// during edge dispatch; they are the dynamic part of the handler list
/// (the structural handlers - homing completion, buffer clamps, autoload -
/// are routed by pin identity).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum EdgeHook {
    /// Filament fracture armed during a forward homing move.
    FractureWhileHoming { slot: usize },
    /// Filament fracture armed during a buffer feed.
    FractureWhileFeeding { slot: usize },
}

/// Trend-sigma edge detector over a sample window.
#[derive(Debug)]
struct EdgeDetector {
    min_trend: f64,
    slow_scale: f64,
    fast_scale: f64,
}

impl EdgeDetector {
    fn new() -> Self {
        Self {
            min_trend: MIN_TREND,
            slow_scale: SLOW_SCALE,
            fast_scale: FAST_SCALE,
        }
    }

    fn outlet() -> Self {
        Self {
            min_trend: OUTLET_MIN_TREND,
            slow_scale: OUTLET_SLOW_SCALE,
            fast_scale: OUTLET_FAST_SCALE,
        }
    }

    /// Detect `(rising, falling)` over the last `TREND_WINDOW_SIZE` steps.
    fn detect(&self, window: &VecDeque<i32>) -> (bool, bool) {
        if window.len() < TREND_WINDOW_SIZE + 1 {
            return (false, false);
        }

        let start = window.len() - (TREND_WINDOW_SIZE + 1);
        let mut diffs = [0.0; TREND_WINDOW_SIZE];
        for (i, d) in diffs.iter_mut().enumerate() {
            *d = (window[start + i + 1] - window[start + i]) as f64;
        }

        let trend = diffs.iter().sum::<f64>() / TREND_WINDOW_SIZE as f64;
        let var = diffs.iter().map(|d| (d - trend) * (d - trend)).sum::<f64>()
            / TREND_WINDOW_SIZE as f64;
        let sigma = crate::fsqrt(var);

        let scale = if crate::fabs(trend) >= self.min_trend {
            self.fast_scale
        } else {
            self.slow_scale
        };
        let rise_threshold = crate::fmax(self.min_trend, RISE_SENSITIVITY * sigma) * scale;
        let fall_threshold = crate::fmax(self.min_trend, FALL_SENSITIVITY * sigma) * scale;

        (trend > rise_threshold, trend < -fall_threshold)
    }
}

/// ADC sampling state: sliding window plus dynamic range tracking.
#[derive(Debug)]
struct AdcState {
    window: VecDeque<i32>,
    upper: i32,
    lower: i32,
    middle: i32,
    detector: EdgeDetector,
}

impl AdcState {
    fn new(outlet_profile: bool) -> Self {
        Self {
            window: VecDeque::with_capacity(ADC_WINDOW_SIZE),
            upper: 0,
            lower: 9999,
            middle: 5000,
            detector: if outlet_profile {
                EdgeDetector::outlet()
            } else {
                EdgeDetector::new()
            },
        }
    }

    fn push(&mut self, value: i32) {
        if self.window.len() == ADC_WINDOW_SIZE {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.upper = self.upper.max(value);
        self.lower = self.lower.min(value);
        self.middle = ((self.upper as f64 * ADC_UPPER_SCALE + self.lower as f64) / 2.0) as i32;
    }

    fn range_available(&self) -> bool {
        self.upper - self.lower >= INTERVAL_DELTA_THRESHOLD
    }
}

/// Sample source of a sensor.
enum SensorSource {
    Digital,
    Adc(RefCell<AdcState>),
}

/// Debounced trigger/release sensor with edge memory and ordered hooks.
pub struct Sensor {
    /// Pin name as configured, including a possible `!` prefix.
    name: String,
    invert: bool,
    source: SensorSource,
    state: Cell<Edge>,
    prev: Cell<Option<Edge>>,
    trigger_hooks: RefCell<Vec<EdgeHook>>,
    release_hooks: RefCell<Vec<EdgeHook>>,
}

impl Sensor {
    pub(crate) fn digital(name: &str) -> Self {
        Self::new(name, SensorSource::Digital)
    }

    pub(crate) fn adc(name: &str, outlet_profile: bool) -> Self {
        Self::new(name, SensorSource::Adc(RefCell::new(AdcState::new(outlet_profile))))
    }

    fn new(name: &str, source: SensorSource) -> Self {
        Self {
            name: String::from(name),
            invert: name.starts_with('!'),
            source,
            state: Cell::new(Edge::Released),
            prev: Cell::new(None),
            trigger_hooks: RefCell::new(Vec::new()),
            release_hooks: RefCell::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> Edge {
        self.state.get()
    }

    pub fn is_triggered(&self) -> bool {
        self.state.get() == Edge::Triggered
    }

    pub fn is_released(&self) -> bool {
        self.state.get() == Edge::Released
    }

    fn has_changed(&self) -> bool {
        self.prev.get() != Some(self.state.get())
    }

    pub fn is_new_triggered(&self) -> bool {
        self.is_triggered() && self.has_changed()
    }

    pub fn is_new_released(&self) -> bool {
        self.is_released() && self.has_changed()
    }

    fn update(&self, new_state: Edge) -> Option<Edge> {
        self.prev.set(Some(self.state.get()));
        self.state.set(new_state);
        if self.has_changed() {
            Some(new_state)
        } else {
            None
        }
    }

    /// Feed a digital sample. Returns the edge if the state changed.
    pub fn feed_digital(&self, level: PinState) -> Option<Edge> {
        let triggered = matches!(level, PinState::High) != self.invert;
        self.update(Edge::from_trigger(triggered))
    }

    /// Feed one ADC reading. Returns the edge if the state changed.
    ///
    /// Below `INTERVAL_DELTA_THRESHOLD` counts of observed range only the
    /// fixed initial-trigger threshold applies. Above it, the midpoint of
    /// the scaled running range decides, with the trend-sigma detector as
    /// fallback for drifting signals.
    pub fn feed_adc(&self, value: i32) -> Option<Edge> {
        let SensorSource::Adc(state) = &self.source else {
            warn!("sensor is not ADC sampled, sample dropped");
            return None;
        };
        let mut adc = state.borrow_mut();
        adc.push(value);

        if !adc.range_available() {
            if value < INIT_TRIGGER_THRESHOLD {
                return self.update(Edge::Triggered);
            }
            return None;
        }

        // Midpoint stays above the window maximum until motion starts.
        if adc.middle < adc.upper {
            let below = value <= adc.middle;
            let above = value >= adc.middle;
            let (trigger, release) = if self.invert { (above, below) } else { (below, above) };
            if trigger {
                return self.update(Edge::Triggered);
            }
            if release {
                return self.update(Edge::Released);
            }
        }

        let (rising, falling) = adc.detector.detect(&adc.window);
        if !rising && !falling {
            return None;
        }
        let (trigger_edge, release_edge) = if self.invert {
            (rising, falling)
        } else {
            (falling, rising)
        };
        if trigger_edge {
            self.update(Edge::Triggered)
        } else if release_edge {
            self.update(Edge::Released)
        } else {
            None
        }
    }

    // Hooks fire in registration order, once per new edge.

    pub(crate) fn add_hook(&self, edge: Edge, hook: EdgeHook) {
        match edge {
            Edge::Triggered => self.trigger_hooks.borrow_mut().push(hook),
            Edge::Released => self.release_hooks.borrow_mut().push(hook),
        }
    }

    pub(crate) fn remove_hook(&self, edge: Edge, hook: EdgeHook) {
        let hooks = match edge {
            Edge::Triggered => &self.trigger_hooks,
            Edge::Released => &self.release_hooks,
        };
        hooks.borrow_mut().retain(|h| *h != hook);
    }

    pub(crate) fn hooks_for(&self, edge: Edge) -> Vec<EdgeHook> {
        match edge {
            Edge::Triggered => self.trigger_hooks.borrow().clone(),
            Edge::Released => self.release_hooks.borrow().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digital_edges_fire_once_per_transition() {
        let s = Sensor::digital("mms:PB0");
        assert_eq!(s.feed_digital(PinState::High), Some(Edge::Triggered));
        assert!(s.is_new_triggered());
        // Same level again: no edge and not new anymore
        assert_eq!(s.feed_digital(PinState::High), None);
        assert!(!s.is_new_triggered());
        assert_eq!(s.feed_digital(PinState::Low), Some(Edge::Released));
        assert!(s.is_new_released());
    }

    #[test]
    fn inverted_pin_reverses_polarity() {
        let s = Sensor::digital("!mms:PB0");
        assert_eq!(s.feed_digital(PinState::Low), Some(Edge::Triggered));
        assert!(s.is_triggered());
        assert_eq!(s.feed_digital(PinState::High), Some(Edge::Released));
    }

    #[test]
    fn adc_init_threshold_triggers_before_range_established() {
        let s = Sensor::adc("buffer:PA5", false);
        // Range below 200 counts: fixed threshold applies
        assert_eq!(s.feed_adc(120), Some(Edge::Triggered));
        assert!(s.is_triggered());
        // High-but-narrow readings produce nothing
        let s2 = Sensor::adc("buffer:PA5", false);
        assert_eq!(s2.feed_adc(160), None);
        assert_eq!(s2.feed_adc(170), None);
        assert!(s2.is_released());
    }

    #[test]
    fn adc_midpoint_crossing_detects_both_edges() {
        let s = Sensor::adc("buffer:PA5", false);
        // Establish a wide range: 100..2000
        s.feed_adc(2000);
        s.feed_adc(2000);
        // middle = (2000*1.1 + 100)/2 = 1150
        assert_eq!(s.feed_adc(100), Some(Edge::Triggered));
        assert_eq!(s.feed_adc(1900), Some(Edge::Released));
        // A second low crossing re-triggers
        assert_eq!(s.feed_adc(150), Some(Edge::Triggered));
    }

    #[test]
    fn trend_detector_needs_full_window() {
        let d = EdgeDetector::new();
        let mut w = VecDeque::new();
        for v in [1000, 1000, 1000] {
            w.push_back(v);
        }
        assert_eq!(d.detect(&w), (false, false));
        // Strong monotone fall across six samples
        let mut w = VecDeque::new();
        for v in [3000, 2600, 2200, 1800, 1400, 1000] {
            w.push_back(v);
        }
        let (rising, falling) = d.detect(&w);
        assert!(!rising);
        assert!(falling);
    }

    #[test]
    fn hooks_keep_registration_order_and_remove_cleanly() {
        let s = Sensor::digital("mms:PB1");
        s.add_hook(Edge::Released, EdgeHook::FractureWhileHoming { slot: 1 });
        s.add_hook(Edge::Released, EdgeHook::FractureWhileFeeding { slot: 1 });
        let hooks = s.hooks_for(Edge::Released);
        assert_eq!(
            hooks,
            alloc::vec![
                EdgeHook::FractureWhileHoming { slot: 1 },
                EdgeHook::FractureWhileFeeding { slot: 1 },
            ]
        );
        s.remove_hook(Edge::Released, EdgeHook::FractureWhileHoming { slot: 1 });
        assert_eq!(
            s.hooks_for(Edge::Released),
            alloc::vec![EdgeHook::FractureWhileFeeding { slot: 1 }]
        );
    }
}
