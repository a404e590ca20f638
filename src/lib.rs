//! Approval-gated change request engine
//!
//! Mutations to catalog entities are not written directly; they are
//! proposed as change request trees, gated by configurable decision
//! policies, and applied by per-entity strategies once every element of
//! a request carries a decision. Decisions can be taken internally or
//! relayed through an external sync channel.

pub mod catalog;
pub mod dto;
pub mod element;
pub mod error;
pub mod ids;
pub mod policy;
pub mod service;
pub mod store;
pub mod strategy;
pub mod sync;
pub mod timestamp;
pub mod value;
