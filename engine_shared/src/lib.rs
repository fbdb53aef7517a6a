//! `engine_shared`
//!
//! Shared libraries used by both client and server.
//!
//! - `codec`, `fields`, `frame`, `protocol`: the binary wire format, from
//!   primitive values up to encoded events.
//! - `event`, `task`, `worker`, `reactor`, `runtime`: the event pipeline and
//!   the cooperative scheduler that drives it.
//! - `net`: TCP connections attached to the reactor.
//! - `math`, `scene`, `objects`, `render`: the replicated scene graph and the
//!   seam a renderer reads it through.
//! - `config`: engine configuration.
//!
//! No `unsafe`.

pub mod codec;
pub mod config;
pub mod event;
pub mod fields;
pub mod frame;
pub mod math;
pub mod net;
pub mod objects;
pub mod protocol;
pub mod reactor;
pub mod render;
pub mod runtime;
pub mod scene;
pub mod task;
pub mod worker;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::event::*;
    pub use crate::math::*;
    pub use crate::net::{ClientId, Connection, NetError, DEFAULT_PORT};
    pub use crate::objects::{ObjectChange, ObjectError, ObjectManager, ObjectRole};
    pub use crate::protocol::{decode_event, encode_event, ProtocolError};
    pub use crate::runtime::{GameState, Runtime};
    pub use crate::scene::*;
    pub use crate::task::{PeriodicHandle, Task};
}
