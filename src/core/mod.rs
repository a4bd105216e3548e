//! Chat core: domain types, session adapter, realtime subscriptions and the chat controller.

pub mod controller;
pub mod error;
pub mod models;
pub mod realtime;
pub mod services;
pub mod session;
pub mod state;
pub mod traits;
