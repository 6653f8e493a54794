//! Session registry
//!
//! The registry maps each [`StreamKey`] to at most one live session and keeps
//! track of which viewers are attached to it.
//!
//! # Architecture
//!
//! ```text
//!                        Arc<SessionRegistry>
//!                   ┌──────────────────────────────┐
//!                   │ Mutex<                       │
//!                   │   sessions: HashMap<Key,     │
//!                   │     SessionEntry {           │
//!                   │       viewers: {id: seen},   │
//!                   │       claims, process,       │
//!                   │       phase: watch::Tx,      │
//!                   │     }>,                      │
//!                   │   viewers: HashMap<Viewer,   │
//!                   │     {Key}>                   │
//!                   │ >                            │
//!                   └──────────────┬───────────────┘
//!                                  │
//!         ┌────────────────────────┼────────────────────────┐
//!         │                        │                        │
//!         ▼                        ▼                        ▼
//!     [acquire]               [release]                 [reaper]
//!     claim()/join()          remove_viewer()           sweep()
//!         │                        │                        │
//!         └── Created ──► startup  └── Idle ──► timer       └──► teardown
//! ```
//!
//! # Lifecycle
//!
//! ```text
//!   Starting ──► Ready ──► Terminating ──► Terminated (removed)
//!       │                      ▲
//!       └──────────────────────┘  spawn / readiness failure, cancellation
//! ```
//!
//! A key stays occupied while its session is Terminating, so a new session
//! for the same stream only starts once the old transcoder is gone.

pub mod entry;
pub mod key;
pub mod store;

pub use entry::{SessionState, SessionStats};
pub use key::{StreamKey, ViewerId};
pub use store::SessionRegistry;
