#![cfg_attr(not(test), no_std)]

// must go first so the logging macros are visible to every module below
#[macro_use]
mod fmt;

pub mod battery;
pub mod charge_state;
pub mod charger;
pub mod config;
pub mod debounce;
pub mod error_flags;
pub mod power_state;
pub mod tasks;
