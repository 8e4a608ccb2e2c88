//! conduit: client library for the conduit media driver.
//!
//! Clients attach to a running driver through its cnc file: commands go
//! into the to-driver ring, events come back over the to-clients
//! broadcast, and stream payloads move through memory-mapped log buffers
//! shared with the driver and remote peers.
//!
//! This crate holds the client-facing API (connect, publish, subscribe)
//! and re-exports the protocol and concurrency layers for embedders.

pub mod client;
pub mod fragment;
pub mod publication;
pub mod subscription;

pub use client::{Client, ClientError};
pub use fragment::FragmentAssembler;
pub use publication::{OfferOutcome, Publication};
pub use subscription::{Image, Subscription};

// Shared layers, re-exported for embedders and tests.
pub use cn_concurrent as concurrent;
pub use cn_logbuffer as logbuffer;
pub use cn_protocol as protocol;
