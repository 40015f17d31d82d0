//! Domain types shared by every role.
//!
//! Nothing in here performs I/O.  The [`world::WorldRegistry`] trait is the
//! seam between the synchronisation core and the simulation that owns the
//! entities; [`world::InMemoryWorld`] is the reference implementation used by
//! the headless binary and the tests.

pub mod clock;
pub mod entity;
pub mod game_id;
pub mod world;
