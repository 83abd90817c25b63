//! Cache library ("Libstore") functionality modules.

mod apistub;
mod cache;
mod callback;
mod libstore;
mod tracker;

pub use libstore::{ClientConfig, LeaseMode, Libstore};
pub use tracker::{QUERY_THRESHOLD, QUERY_WINDOW_SECS};
