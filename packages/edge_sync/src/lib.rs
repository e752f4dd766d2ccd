//! Real-time sync client for the messaging edge.
//!
//! A session is bootstrapped with one HTTP query that returns the current
//! inbox sequence id, then a single MQTT-over-WebSocket connection streams
//! deltas from that point on. The client keeps the `(last_seq_id,
//! sync_token)` cursor across reconnects and identity rotations so no
//! history is replayed or skipped. A periodic page load keeps the web
//! session's cookies and form token fresh.
//!
//! ```no_run
//! # async fn run() -> edge_sync::Result<()> {
//! use std::sync::Arc;
//! use edge_sync::{ClientConfig, ClientEvent, CookieJar, EdgeClient, SessionContext};
//!
//! let jar = CookieJar::load("appstate.json".as_ref())?;
//! let session = Arc::new(SessionContext::new(jar)?);
//! let mut listener = EdgeClient::new(session, ClientConfig::default())?
//!     .listen()
//!     .await?;
//! while let Some(event) = listener.recv().await {
//!     match event {
//!         ClientEvent::Delta(delta) => println!("{delta:?}"),
//!         ClientEvent::Error(e) => return Err(e),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod connection;
pub mod delta;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod refresh;
pub mod scheduler;
pub mod session;
pub mod topics;
pub mod transport;

pub use client::{ClientEvent, EdgeClient, Listener, ListenerHandle};
pub use config::{ClientConfig, EdgeSyncConfig, FileConfig};
pub use delta::{DeltaEvent, Message, MessageReply, PresenceUpdate, TypingNotification};
pub use error::{Result, SyncError};
pub use refresh::RefreshOutcome;
pub use session::{Cookie, CookieJar, SessionContext, SyncCursor};
