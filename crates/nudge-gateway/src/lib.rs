//! # Nudge Gateway
//!
//! HTTP trigger surface for the follow-up scheduler: single-contact
//! enqueue, bulk inactivity scan and a pending-queue listing.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};
