//! Broker clients behind the backend transport seams.
//!
//! - [`faktory`]: TCP client for Faktory-compatible queue servers
//! - [`nsq`]: TCP client for NSQ-compatible brokers plus lookup discovery
//! - [`memory`]: in-process brokers for tests and local development

pub mod faktory;
pub mod memory;
pub mod nsq;

pub use faktory::{FaktoryConnection, FaktoryConnector};
pub use memory::{InMemoryPubSub, InMemoryQueueService};
pub use nsq::{LookupClient, NsqOptions, NsqProducer, NsqSubscription, NsqTransport};
