//! USB Type-C / Power Delivery port management for `[no_std]`.
//!
//! Three cooperating state machines negotiate, maintain and tear down a PD
//! contract over a Type-C connector:
//!
//! - the Type-C connection manager ([`type_c`]) detects attach/detach and
//!   controls the CC terminations,
//! - the protocol layer ([`protocol_layer`]) frames messages, deduplicates
//!   them by message ID and orchestrates soft/hard resets,
//! - the policy engine ([`policy_engine`]) implements the contract
//!   negotiation semantics for the sink and source roles.
//!
//! A [`port::Port`] ties them together and steps them from a single
//! cooperative loop. Hardware access goes through the traits in
//! [`usbc_traits`]; policy decisions are delegated to a
//! [`device_policy_manager::DevicePolicyManager`].
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

#[macro_use]
extern crate uom;

#[macro_use]
pub mod fmt;

pub mod counters;
pub mod device_policy_manager;
pub mod flags;
pub mod policy_engine;
pub mod port;
pub mod protocol_layer;
pub mod timers;
pub mod type_c;
pub mod units;

#[cfg(test)]
pub(crate) mod dummy;

pub use usbc_traits::{DataRole, PowerRole};
