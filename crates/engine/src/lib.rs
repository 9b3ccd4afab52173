//! Push-notification dispatch core.
//!
//! - [`directory`]: resolves users to device tokens, with a refreshable cache
//! - [`store`]: the idempotency / outcome store keyed by notification id
//! - [`retry`]: exponential backoff with jitter
//! - [`dispatcher`]: the engine that owns every delivery attempt
//! - [`setup`]: production wiring from `AppConfig`

pub mod directory;
pub mod dispatcher;
pub mod retry;
pub mod setup;
pub mod store;

pub use directory::{AddressStore, DirectoryError, InMemoryAddressStore, PgAddressStore, RecipientDirectory};
pub use dispatcher::{DispatchConfig, DispatchEngine};
pub use retry::RetryPolicy;
pub use store::{Claim, ClaimToken, InMemoryOutcomeStore, OutcomeStore, RedisOutcomeStore, StoreError};
