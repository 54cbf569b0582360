// src/domain/topology.rs

//! Reliability topology naming.
//!
//! Every transport instance owns three queues derived from one base name:
//! the primary work queue, a delay queue for deferred redelivery, and an
//! error queue for poisoned messages. All three bind to the same direct
//! exchange; the names double as their default routing keys.

/// The three queue names a transport operates on.
///
/// Construction is pure string derivation; nothing is declared on a broker
/// until the transport's initialize calls run.
///
/// # Example
///
/// ```
/// use wave_amqp::QueueTopology;
///
/// let topology = QueueTopology::new("Orders");
///
/// assert_eq!(topology.primary(), "Orders");
/// assert_eq!(topology.delay(), "Orders_Delay");
/// assert_eq!(topology.error(), "Orders_Error");
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueTopology {
    // ---
    primary: String,
    delay: String,
    error: String,
}

impl QueueTopology {
    // ---
    /// Derive the topology from a base queue name.
    pub fn new(base: impl Into<String>) -> Self {
        let primary = base.into();
        let delay = format!("{primary}_Delay");
        let error = format!("{primary}_Error");

        Self {
            primary,
            delay,
            error,
        }
    }

    /// Primary work queue name (equal to the base name).
    pub fn primary(&self) -> &str {
        &self.primary
    }

    /// Delay queue name.
    pub fn delay(&self) -> &str {
        &self.delay
    }

    /// Error queue name.
    pub fn error(&self) -> &str {
        &self.error
    }

    /// All three names in declaration order.
    pub fn all(&self) -> [&str; 3] {
        [&self.primary, &self.delay, &self.error]
    }
}

// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_derive_from_base() {
        let topology = QueueTopology::new("Invoicing");

        assert_eq!(topology.primary(), "Invoicing");
        assert_eq!(topology.delay(), "Invoicing_Delay");
        assert_eq!(topology.error(), "Invoicing_Error");
    }

    #[test]
    fn all_lists_primary_first() {
        let topology = QueueTopology::new("Q");

        assert_eq!(topology.all(), ["Q", "Q_Delay", "Q_Error"]);
    }
}
