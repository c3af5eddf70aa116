#![no_std]

//! ESP32-S3 glue for the wakeon firmware: flash-backed settings storage
//! and the physical switch-line driver.

pub mod power;
pub mod storage;
