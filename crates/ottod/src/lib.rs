//! Otto daemon: a cognitive dispatch kernel for a local assistant.
//!
//! Requests from every source land in one prioritized queue, get
//! triaged into reflex, shallow, or deep handling, and any resulting
//! action passes through the safety envelope before a skill runs.
//! Outcomes feed lesson memory and the model router's stats.

pub mod backend;
pub mod controller;
pub mod dispatch;
pub mod flush;
pub mod lessons;
pub mod reflex;
pub mod router;
pub mod safety;
pub mod triage;
pub mod worker;
