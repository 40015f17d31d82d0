//! Infrastructure layer: sockets, threads and files.
//!
//! Contains the OS-facing adapters: datagram transports, the peer host that
//! drives a transport from its own I/O thread, and configuration storage.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `skirmish_core`, but MUST NOT be imported by the `application` layer.

pub mod peer_host;
pub mod storage;
pub mod transport;
