//! # atelier-sync — Offline-first sync and realtime collaboration core
//!
//! Keeps a business-data client fully usable offline: local mutations go
//! into a durable queue and replay when the network returns, reads come
//! from a TTL cache, and a reconnecting WebSocket session delivers
//! collaboration events to typed listeners.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  enqueue   ┌──────────────┐   drain    ┌──────────────┐
//! │ App mutation │ ─────────► │ DurableQueue │ ◄───────── │  SyncEngine  │
//! └──────────────┘            └──────┬───────┘            └──────┬───────┘
//!                                    │ persist                   │ apply
//!                             ┌──────▼───────┐            ┌──────▼───────┐
//!                             │ KeyValueStore│            │ Mutation     │
//!                             │ (file/memory)│            │ Endpoint     │
//!                             └──────▲───────┘            └──────────────┘
//!                                    │ persist
//! ┌──────────────┐   get/put  ┌──────┴───────┐
//! │ App reads    │ ─────────► │  ReadCache   │
//! └──────────────┘            └──────────────┘
//!
//! ┌──────────────┐  online    ┌──────────────┐  WebSocket ┌──────────────┐
//! │ Connectivity │ ─────────► │ Realtime     │ ◄────────► │ Collab       │
//! │ Monitor      │  triggers  │ Session      │   frames   │ Service      │
//! └──────┬───────┘            └──────┬───────┘            └──────────────┘
//!        │ online                    │ dispatch
//! ┌──────▼───────┐            ┌──────▼───────┐
//! │  SyncEngine  │            │ EventRouter  │──► typed listeners
//! └──────────────┘            └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded frames)
//! - [`queue`] — Durable FIFO operation queue with retry bookkeeping
//! - [`sync`] — Drains the queue against the remote mutation endpoint
//! - [`cache`] — TTL read cache with stale-while-offline semantics
//! - [`connectivity`] — Reachability watch channel and triggers
//! - [`session`] — Reconnecting realtime session with room membership
//! - [`router`] — Per-event-type listener registration and dispatch
//! - [`store`] — Key/value persistence behind the queue and cache
//! - [`ws`] — WebSocket transport for the session
//! - [`clock`] — Injectable time source

pub mod cache;
pub mod clock;
pub mod connectivity;
pub mod protocol;
pub mod queue;
pub mod router;
pub mod session;
pub mod store;
pub mod sync;
pub mod ws;

// Re-exports for convenience
pub use cache::{CacheConfig, CacheEntry, CacheError, Lookup, ReadCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use connectivity::{run_reconnect_trigger, ConnectivityMonitor};
pub use protocol::{
    Actor, ClientFrame, CollaborationEvent, EventKind, PresenceStatus, ProtocolError, ServerFrame,
};
pub use queue::{
    DeadLetter, DurableQueue, FailureDisposition, OperationKind, PendingOperation, QueueConfig,
    QueueError,
};
pub use router::{EventRouter, ListenerId};
pub use session::{
    ConnectionState, Connector, Link, LinkEvent, RealtimeSession, SendOutcome, SessionConfig,
    SessionError, SessionSignal, SessionStatus, StaticToken, TokenProvider,
};
pub use store::{FileStore, KeyValueStore, MemoryStore, StoreError};
pub use sync::{DrainSummary, MutationEndpoint, PushOutcome, SyncEngine};
pub use ws::{WsConnector, CLOSE_DO_NOT_RECONNECT};
