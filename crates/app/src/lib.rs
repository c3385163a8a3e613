//! Twitch WebSub webhook manager.
//!
//! [`TwitchWebHook`] subscribes to Helix webhook topics, answers the hub's
//! verification challenges and routes normalized notifications to the
//! handlers registered for each subscription.

mod error;
mod handshake;
mod problem;
mod registry;
mod renewal;
mod router;
mod settings;
pub mod telemetry;
mod topics;
mod webhook;

pub use error::WebhookError;
pub use handshake::{SubscribeOutcome, TwitchWebHook};
pub use registry::{EventHandler, SubscriptionRecord, SubscriptionRegistry, SubscriptionState};
pub use renewal::{RenewalReport, RenewalWorker};
pub use router::{app_router, AppState};
pub use settings::{Authentication, HookSettings, MAX_LEASE_SECONDS, MIN_LEASE_SECONDS};
pub use topics::SubscriptionEventFilter;
pub use twi_hook_core::{Payload, Topic};
