//! Application layer: the synchronisation logic of one peer.
//!
//! # What is the "application" layer? (for beginners)
//!
//! In Clean Architecture the *application* layer sits between the domain
//! (the shared types in `skirmish-core`) and the infrastructure (sockets,
//! threads, files).  Code here:
//!
//! - **Orchestrates** domain objects: applies received messages to the world,
//!   decides what to broadcast and when.
//! - **Depends on abstractions**: it talks to the network only through the
//!   [`link::PeerLink`] trait and reads time only through
//!   `skirmish_core::Clock`, so tests drive it with scripted doubles.
//! - **Contains no OS calls, no network I/O, no file system access**.
//!
//! # Sub-modules
//!
//! - **`coordinator`**   – The per-tick driver: dispatch, deferral, readiness
//!   gate, impact reconciliation, server fan-out.
//! - **`clock_sync`**    – Estimates the offset to the server clock.
//! - **`scheduler`**     – Fixed-interval recurring actions.
//! - **`deferred`**      – Messages waiting for a prerequisite.
//! - **`impact_ledger`** – Server damage history and duplicate suppression.
//! - **`link`**          – The seam to the peer host.

pub mod clock_sync;
pub mod coordinator;
pub mod deferred;
pub mod impact_ledger;
pub mod link;
pub mod scheduler;
