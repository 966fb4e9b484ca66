//! Triage daemon: progressive multi-tier analysis of threaded business
//! conversations.
//!
//! Workers claim pending records from the store, the router picks a tier,
//! the invoker runs it against the inference backend (or the local pattern
//! table for tier 1), and the outcome is finalized or escalated. A retry
//! sweep requeues stuck and failed records with a bounded attempt ceiling.

pub mod invoker;
pub mod patterns;
pub mod prompts;
pub mod retry;
pub mod router;
pub mod scorer;
pub mod service;
pub mod store;
pub mod worker;
