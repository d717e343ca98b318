pub mod companion;
pub mod components;
pub mod config;
pub mod runtime;
