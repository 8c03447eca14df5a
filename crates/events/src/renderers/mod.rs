//! Event renderers.

pub mod json;

pub use json::JsonRenderer;
