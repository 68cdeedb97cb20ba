//! Realtime data production and fan-out.
//!
//! Provides:
//! - [`BroadcastHub`]: fan-out of serialized events to live subscribers
//! - Upstream feed traits (prices, forecast scores, TVL) and their
//!   HTTP / simulated implementations
//! - [`RealtimeOrchestrator`]: the independent producer loops that fetch
//!   under failure isolation, persist, and publish

pub mod feeds;
pub mod hub;
pub mod orchestrator;

pub use feeds::{
    CoinGeckoFeed, DefiLlamaFeed, ForecastProvider, PriceFeed, SimulatedRiskModel,
    SimulatedSentiment, TvlFeed,
};
pub use hub::{BroadcastHub, ChannelSubscriber, Envelope, Subscriber};
pub use orchestrator::{OrchestratorConfig, RealtimeOrchestrator};
