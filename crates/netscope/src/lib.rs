//! In-process HTTP interception for `reqwest` and hyper clients.
//!
//! An [`Engine`] observes every outgoing request made through an attached
//! adapter, optionally routes it to a mock, and records the outcome.
//!
//! ```ignore
//! let engine = Engine::builder().build()?;
//! let client = reqwest::Client::new().intercepted(Arc::clone(&engine));
//! let response = client.send(client.get("http://localhost:8080/v1/ping")).await?;
//! for transaction in engine.recorder().snapshot() {
//!     println!("{} {:?}", transaction.id, transaction.outcome);
//! }
//! ```

// ===== Core pipeline =====
pub mod adapters;
pub mod engine;
pub mod model;
pub mod recorder;
pub mod resolver;

// ===== Supporting services =====
pub mod config;
pub mod error;
pub mod metrics;
pub mod mock_endpoint;

pub use adapters::hyper::{InterceptLayer, InterceptService};
pub use adapters::reqwest::{InterceptedClient, ReqwestInterceptExt};
pub use adapters::LibraryAdapter;
pub use config::NetscopeConfig;
pub use engine::{Engine, EngineBuilder, InterceptOption, Route, RoutingDecision};
pub use recorder::{Recorder, TransactionEvent};
pub use resolver::{MockResolver, MockResponse, MockRule, RuleMatcher};
