pub mod avb;
pub mod buffer;
pub mod capture;
pub mod commands;
pub mod config;
pub mod device;
pub mod driver;
pub mod fastboot_info;
pub mod flash;
pub mod flashall;
pub mod format;
pub mod images;
pub mod lp;
pub mod partition;
pub mod plan;
pub mod requirements;
pub mod slot;
pub mod source;
pub mod sparse;
pub mod task;
pub mod utils;
pub mod vendor_boot;

#[macro_use]
extern crate log;
