//! Node construction options.

use std::sync::Arc;
use std::time::Duration;

use cardlink_core::{EventPollStrategy, IdGenerator, UuidIdGenerator};

/// Default bound for every suspended node operation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Options shared by every node role.
#[derive(Clone)]
pub struct NodeOptions {
    /// Bound for suspended operations (open, request, close).
    pub timeout: Duration,
    /// Source of node and session identifiers.
    pub id_generator: Arc<dyn IdGenerator>,
}

impl NodeOptions {
    /// Create options with the default timeout and UUID ids.
    #[must_use]
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            id_generator: Arc::new(UuidIdGenerator),
        }
    }

    /// Override the suspension bound.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the identifier source (deterministic ids in tests).
    #[must_use]
    pub fn with_id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = id_generator;
        self
    }
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Options for the synchronous client role.
#[derive(Clone)]
pub struct SyncClientOptions {
    /// Shared node options.
    pub node: NodeOptions,
    /// Observe plugin events with this strategy, if any.
    pub plugin_events: Option<EventPollStrategy>,
    /// Observe reader events with this strategy, if any.
    pub reader_events: Option<EventPollStrategy>,
    /// Base unit of the Fibonacci retry delays used when a poller loses
    /// connectivity.
    pub retry_unit: Duration,
}

impl SyncClientOptions {
    /// Create options with no event observation.
    #[must_use]
    pub fn new() -> Self {
        Self {
            node: NodeOptions::new(),
            plugin_events: None,
            reader_events: None,
            retry_unit: Duration::from_secs(1),
        }
    }

    /// Observe plugin events.
    #[must_use]
    pub const fn observe_plugin_events(mut self, strategy: EventPollStrategy) -> Self {
        self.plugin_events = Some(strategy);
        self
    }

    /// Observe reader events.
    #[must_use]
    pub const fn observe_reader_events(mut self, strategy: EventPollStrategy) -> Self {
        self.reader_events = Some(strategy);
        self
    }

    /// Override the retry base unit.
    #[must_use]
    pub const fn with_retry_unit(mut self, retry_unit: Duration) -> Self {
        self.retry_unit = retry_unit;
        self
    }
}

impl Default for SyncClientOptions {
    fn default() -> Self {
        Self::new()
    }
}
