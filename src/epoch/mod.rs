//! Epoch-based protection
//!
//! This module implements the LightEpoch mechanism. Operations run inside an
//! epoch-protected region; eviction registers the closing of records as a
//! deferred action that runs once every session has moved past the epoch in
//! which the head address was shifted.

mod light_epoch;

pub use light_epoch::{EpochGuard, LightEpoch};
