//! Counting of work time and window usage for the logged in employee.

pub mod elapsed;
pub mod idle;
pub mod work_time;
pub mod window_usage;
