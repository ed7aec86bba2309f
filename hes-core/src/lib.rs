//! Protocol engine for a per-gateway smart-meter RF mesh head-end.
//!
//! This crate is transport- and storage-agnostic: `hes-server` wires it to a
//! live TCP socket, an MQTT broker and a MySQL store. Everything here is
//! plain state machines and codecs, testable without any of that.

pub mod codec;
pub mod error;
pub mod fuota;
pub mod mqtt_api;
pub mod path_book;
pub mod profile;
pub mod registry;
pub mod scheduler;
pub mod store_api;
pub mod transactor;
