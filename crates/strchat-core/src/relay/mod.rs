pub mod failures;
pub mod lifecycle;
pub mod memory;
pub mod pool;
pub mod sdk;
pub mod transport;

pub use failures::FailureCache;
pub use lifecycle::{LinkState, RelayRole};
pub use memory::MemoryNetwork;
pub use pool::{DesiredMapping, EventSink, RelayPlan, RelayPool, RelaySources, compute_desired_mapping};
pub use sdk::NostrConnector;
pub use transport::{
    RelayConnection, RelayConnector, RelaySubscription, SubscriptionFilter, SubscriptionMessage,
};
