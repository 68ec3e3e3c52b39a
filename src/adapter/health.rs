//! Health transition policy for one adapter
//!
//! [`HealthTracker`] turns the stream of connection and delivery outcomes
//! into `is_bad` transitions. It only ever yields a value when the derived
//! health differs from the last value it yielded, so N consecutive failures
//! produce a single `true`.

/// Tracks consecutive failures and emits `is_bad` transitions
#[derive(Debug, Clone)]
pub struct HealthTracker {
    threshold: u32,
    connect_failures: u32,
    delivery_failures: u32,
    link_down: bool,
    connected: bool,
    reported: Option<bool>,
}

impl HealthTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            connect_failures: 0,
            delivery_failures: 0,
            link_down: false,
            connected: false,
            reported: None,
        }
    }

    /// Last emitted value, `None` before the first signal
    pub fn is_bad(&self) -> Option<bool> {
        self.reported
    }

    pub fn connected(&mut self) -> Option<bool> {
        self.connect_failures = 0;
        self.link_down = false;
        self.connected = true;
        self.transition()
    }

    pub fn connect_failed(&mut self) -> Option<bool> {
        self.connect_failures = self.connect_failures.saturating_add(1);
        self.connected = false;
        self.transition()
    }

    /// An established subscription dropped; unhealthy until reconnected
    pub fn connection_lost(&mut self) -> Option<bool> {
        self.link_down = true;
        self.connected = false;
        self.transition()
    }

    pub fn delivered(&mut self) -> Option<bool> {
        self.delivery_failures = 0;
        self.transition()
    }

    /// A notification could not be delivered after exhausting its retries
    pub fn delivery_failed(&mut self) -> Option<bool> {
        self.delivery_failures = self.delivery_failures.saturating_add(1);
        self.transition()
    }

    fn derived(&self) -> bool {
        self.link_down
            || self.connect_failures >= self.threshold
            || self.delivery_failures >= self.threshold
    }

    fn transition(&mut self) -> Option<bool> {
        let is_bad = self.derived();
        if self.reported == Some(is_bad) {
            return None;
        }
        // healthy is only claimed once a subscription is actually up
        if !is_bad && !self.connected {
            return None;
        }
        self.reported = Some(is_bad);
        Some(is_bad)
    }
}
