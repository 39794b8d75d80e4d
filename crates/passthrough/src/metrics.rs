use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Stripe-level prometheus metrics.
pub struct StripeMetrics {
    /// Number of running server processes.
    pub servers_running: IntGauge,
    /// Number of entities on the active server.
    pub entities: IntGauge,
    /// Number of open client connections.
    pub connections: IntGauge,
    /// Number of times the active was replaced.
    pub failovers: IntCounter,
    /// Messages executed by any server process.
    pub messages_processed: IntCounter,
}

impl StripeMetrics {
    /// Create metrics and register them with the given prometheus registry.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let servers_running = IntGauge::with_opts(Opts::new(
            "stripe_servers_running",
            "Number of running server processes",
        ))?;
        let entities = IntGauge::with_opts(Opts::new(
            "stripe_entities",
            "Number of entities on the active server",
        ))?;
        let connections = IntGauge::with_opts(Opts::new(
            "stripe_connections",
            "Number of open client connections",
        ))?;
        let failovers = IntCounter::with_opts(Opts::new(
            "stripe_failovers_total",
            "Number of times the active server was replaced",
        ))?;
        let messages_processed = IntCounter::with_opts(Opts::new(
            "stripe_messages_processed_total",
            "Messages executed by server processes",
        ))?;

        registry.register(Box::new(servers_running.clone()))?;
        registry.register(Box::new(entities.clone()))?;
        registry.register(Box::new(connections.clone()))?;
        registry.register(Box::new(failovers.clone()))?;
        registry.register(Box::new(messages_processed.clone()))?;

        Ok(Self {
            servers_running,
            entities,
            connections,
            failovers,
            messages_processed,
        })
    }

    /// Create metrics without registering (for testing).
    pub fn unregistered() -> Self {
        Self {
            servers_running: IntGauge::new("stripe_servers_running", "servers")
                .expect("valid metric name"),
            entities: IntGauge::new("stripe_entities", "entities").expect("valid metric name"),
            connections: IntGauge::new("stripe_connections", "connections")
                .expect("valid metric name"),
            failovers: IntCounter::new("stripe_failovers_total", "failovers")
                .expect("valid metric name"),
            messages_processed: IntCounter::new("stripe_messages_processed_total", "messages")
                .expect("valid metric name"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_metrics_work() {
        let m = StripeMetrics::unregistered();
        m.servers_running.set(3);
        m.failovers.inc();
        assert_eq!(m.servers_running.get(), 3);
        assert_eq!(m.failovers.get(), 1);
    }

    #[test]
    fn registered_metrics_work() {
        let r = Registry::new();
        let m = StripeMetrics::new(&r).unwrap();
        m.connections.inc();
        m.messages_processed.inc_by(4);
        let families = r.gather();
        assert_eq!(families.len(), 5);
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"stripe_connections"));
        assert!(names.contains(&"stripe_messages_processed_total"));
    }

    #[test]
    fn double_registration_fails() {
        let r = Registry::new();
        let _m = StripeMetrics::new(&r).unwrap();
        assert!(StripeMetrics::new(&r).is_err());
    }
}
