//! Bazaar chat service library
//!
//! Exposes modules for testing and reuse

pub mod db;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod live;
pub mod models;
pub mod presence;
pub mod push;
pub mod state;
pub mod validation;
