//!
//! This crate provides everything necessary to run a simulated
//! [PBX](https://en.wikipedia.org/wiki/Business_telephone_system): a TCP
//! switch that line-oriented clients connect to as telephone units, register
//! on numbered extensions and call each other through.
//!
//! # Quick usage example
//!
//! ```no_run
//! use libpbx::{ListenerOptions, Pbx, PbxOptions};
//!
//! tokio_test::block_on(async {
//!     let pbx = Pbx::new_with_opts(PbxOptions {
//!         listen: Some(ListenerOptions {
//!             listen_addr: "127.0.0.1:3000".parse().unwrap(),
//!         }),
//!         ..Default::default()
//!     })
//!     .await
//!     .unwrap();
//!     // ... serve until told otherwise ...
//!     pbx.stop().await;
//! })
//! ```
//!
//! # Overview
//! The main type to start off with is [`Pbx`]. Each accepted connection gets
//! a [`TelephoneUnit`] whose call state moves through [`TuState`].

mod client_session;
mod error;
pub mod logging;
mod pbx;
mod spawn_utils;
mod tu;

pub use error::{Error, Result};
pub use pbx::{DEFAULT_MAX_EXTENSIONS, ListenerOptions, Pbx, PbxOptions};
pub use tu::{ClientTx, TelephoneUnit, TuState};

pub use wire_protocol;

#[cfg(test)]
mod tests;

/// The cargo version of libpbx.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
