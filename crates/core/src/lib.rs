//! Domain building blocks for the linewatch quality-event pipeline.
//!
//! Everything in this crate is free of I/O: message envelopes, inspection
//! requests and results, the error taxonomy shared by every pipeline
//! component, the injectable [`clock::Clock`], the pluggable
//! [`strategy::InspectionStrategy`] and ingress validation.

pub mod clock;
pub mod envelope;
pub mod error;
pub mod inspection;
pub mod quality_event;
pub mod sink;
pub mod strategy;
pub mod types;
