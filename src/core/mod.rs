//! Core module containing the sensor communication engine
//!
//! This module provides:
//! - Transport layer (serial port, in-process simulator)
//! - Frame decoding for ASCII sentences and binary packets
//! - Register codec
//! - Command dispatch with response correlation
//! - Async measurement listener
//! - Firmware update over the bootloader protocol

pub mod command;
pub mod dispatcher;
pub mod firmware;
pub mod listener;
pub mod measurement;
pub mod protocol;
pub mod register;
pub mod sensor;
pub mod simulator;
pub mod transport;
