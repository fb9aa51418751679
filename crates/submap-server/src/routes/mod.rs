//! HTTP route handlers.

pub mod health;
pub mod messagesets;
pub mod migrations;
pub mod optout;
