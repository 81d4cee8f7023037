//! Workstation agent that measures work, idle and per-window time of a signed in employee and
//! keeps the totals in a shared store. Time counted while the store is unreachable is merged in
//! once it is back, never overwriting what is already there.

pub mod cli;
pub mod daemon;
pub mod utils;
pub mod window_api;
