//! HTTP handlers for the identity provider.

pub mod admin;
pub mod auth;
pub mod oauth;
pub mod well_known;
