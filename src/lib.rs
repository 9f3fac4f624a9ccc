//! agentbus library root.
//!
//! Topic-based publish/subscribe for cooperating agents: channel naming and
//! routing, a typed message protocol, and a broker over in-process or Redis
//! transports.

pub mod broker;
pub mod channels;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;

pub use broker::{Broker, MemoryTransport, PatternSubscription, Subscription, TopicSubscription};
pub use channels::{Channel, SubscriptionRegistry, TopicRouter};
pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use error::{Error, Result};
pub use protocol::{create_message, EnvelopeBuilder, MessageContent, MessageEnvelope, MessageType};
