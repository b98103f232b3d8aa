//! Instrument implementations.
//!
//! The real instrument communication layer is an external collaborator;
//! this crate ships mock implementations of the capability traits for
//! testing and simulation.

pub mod mock;
