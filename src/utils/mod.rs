//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod safetcp;
mod timer;

pub use error::LeaseKvError;
pub use timer::Timer;

pub(crate) use safetcp::{
    framed_recv, framed_send, tcp_bind_with_retry, tcp_connect_with_retry,
};
