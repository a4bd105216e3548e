//! Backend collaborators: the query service, realtime feed, object storage and auth service.

pub mod auth;
pub mod database;
pub mod entities;
pub mod realtime;
pub mod repositories;
pub mod session_storage;
pub mod storage;
pub mod traits;
