//! SLES Output Library
//!
//! Buffer-queue audio output driver for OpenSL ES style backends.

pub mod audio;
pub mod decode;
pub mod engine;
