//! Process exit codes.

pub const SUCCESS: u8 = 0;
pub const GENERAL_ERROR: u8 = 1;
// 2 is what clap uses for usage errors
pub const NOT_FOUND: u8 = 3;
pub const READ_ONLY: u8 = 4;
pub const CORRUPT: u8 = 5;
