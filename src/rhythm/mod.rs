//! Tick arithmetic shared by every converter
//!
//! `duration` maps tick counts to written note values, `timing` walks a
//! measure's event list into onsets, capacity checks and voice lanes.

pub mod duration;
pub mod timing;
