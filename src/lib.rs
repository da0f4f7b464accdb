//! Multicast channel monitor: joins UDP multicast groups, counts datagrams per
//! channel and reports bitrate and packet rate once per interval.

pub mod config;
pub mod domain;
pub mod health;
pub mod net;
pub mod pipeline;
pub mod shutdown;
pub mod sink;
