#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Control-plane core for the fleet manager: dependency-ordered teardown of
//! applications and the coalescing checkpoint writer for allocation state.

pub mod checkpoint;
pub mod memory;
pub mod model;
pub mod teardown;

mod util;

pub use util::{new_ulid, now_ms};
