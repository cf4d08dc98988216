//! A client library for pellet and wood stoves connected to the Agua IOT cloud.
//!
//! Stoves of many brands report to the same vendor platform. The cloud does not
//! expose typed values; every stove instead publishes a *register map* that
//! describes where each parameter lives in the stove's value buffer and how raw
//! words convert to display values. This crate:
//!
//! 1.  **Authenticates** an account and keeps its token fresh ([`session`]).
//! 2.  **Discovers** the account's devices and their register maps ([`client`], [`register`]).
//! 3.  **Reads** device buffers through asynchronous cloud jobs ([`job`], [`buffer`]).
//! 4.  **Converts** raw values with the vendor's formula language ([`formula`]).
//! 5.  **Writes** values back with the inverse formulas ([`device`]).
//!
//! ## Quick Start
//!
//! ```no_run
//! use aguaiot_lib::{client::Client, config::{ClientConfig, Endpoint}};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let endpoint = Endpoint::find("Nina").ok_or("unknown brand")?;
//!     let config = ClientConfig::from_endpoint(endpoint, "me@example.com", "secret", "my-app-id");
//!     let mut client = Client::new(config)?;
//!     client.connect().await?;
//!
//!     for device in client.devices() {
//!         println!("{}: {:?}", device.name(), device.air_temperature());
//!     }
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod buffer;
pub mod client;
pub mod config;
pub mod device;
mod error;
pub mod formula;
pub mod job;
pub mod register;
pub mod session;
pub mod transport;

pub use error::{Error, Result};
