//! JunctionRelay relay process.
//!
//! Wires configured sources, junctions and target devices into a running
//! [`runner::RelayRunner`].

pub mod runner;

pub use runner::RelayRunner;
