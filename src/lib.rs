#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

//! # influxdb_proxy
//!
//! A stateless proxy in front of a fleet of InfluxDB 1.x backends. Clients
//! write line protocol and issue InfluxQL against the proxy as though it
//! were a single database; measurements route to configured backend sets,
//! writes are batched and spilled to disk while a backend is down, and
//! administrative queries fan out and merge.

pub mod http;
