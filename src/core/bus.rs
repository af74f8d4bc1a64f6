//! Intra-loadpoint event bus.
//!
//! Four fixed topics connect the loadpoint to its synthetic capability
//! wrappers: charge start/stop edges, the commanded charge current, and the
//! measured charge power. Delivery is synchronous and follows subscription
//! order; handlers must not block. The bus carries no cross-loadpoint
//! traffic — it only decouples wrapper attachment from the control flow.

type EdgeHandler = Box<dyn Fn() + Send>;
type ValueHandler = Box<dyn Fn(f64) + Send>;

/// Topic-keyed publish/subscribe bus with a single publisher.
#[derive(Default)]
pub struct EventBus {
    start: Vec<EdgeHandler>,
    stop: Vec<EdgeHandler>,
    current: Vec<ValueHandler>,
    power: Vec<ValueHandler>,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to charge start edges.
    pub fn subscribe_start(&mut self, handler: impl Fn() + Send + 'static) {
        self.start.push(Box::new(handler));
    }

    /// Subscribes to charge stop edges.
    pub fn subscribe_stop(&mut self, handler: impl Fn() + Send + 'static) {
        self.stop.push(Box::new(handler));
    }

    /// Subscribes to commanded charge current updates (amperes).
    pub fn subscribe_current(&mut self, handler: impl Fn(f64) + Send + 'static) {
        self.current.push(Box::new(handler));
    }

    /// Subscribes to measured charge power updates (watts).
    pub fn subscribe_power(&mut self, handler: impl Fn(f64) + Send + 'static) {
        self.power.push(Box::new(handler));
    }

    /// Publishes a charge start edge.
    pub fn publish_start(&self) {
        for handler in &self.start {
            handler();
        }
    }

    /// Publishes a charge stop edge.
    pub fn publish_stop(&self) {
        for handler in &self.stop {
            handler();
        }
    }

    /// Publishes the effective charge current in amperes.
    pub fn publish_current(&self, amps: f64) {
        for handler in &self.current {
            handler(amps);
        }
    }

    /// Publishes the charge power in watts.
    pub fn publish_power(&self, watts: f64) {
        for handler in &self.power {
            handler(watts);
        }
    }
}
