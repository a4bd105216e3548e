//! Marketplace chat core - Library exports for the interactive client and tests
//!
//! Buyer/seller conversations around a product: conversation list, message history,
//! live delivery and optimistic sends reconciled against the query service.

pub mod api;
pub mod config;
pub mod core;
pub mod infrastructure;
