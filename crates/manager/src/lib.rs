//! Fleet manager service: HTTP API and configuration around [`manager_lib::Manager`]

pub mod api;
pub mod config;
