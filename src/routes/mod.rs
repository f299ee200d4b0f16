//! HTTP route handlers, one module per resource.

pub mod chat;
pub mod health;
pub mod inspect;
pub mod models;
pub mod settings;
