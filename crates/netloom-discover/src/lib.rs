//! netloom-discover: multi-protocol host discovery for the netloom topology graph.
//!
//! Runs ARP, ICMP, mDNS and SSDP scanners against a target set, resolves the
//! raw observations into devices and interfaces, merges them into the stored
//! graph and records what changed.

pub mod config;
pub mod diff;
pub mod error;
pub mod merge;
pub mod orchestrator;
pub mod queue;
pub mod ratelimit;
pub mod report;
pub mod resolve;
pub mod runner;
pub mod scanner;
pub mod scheduler;
