//! gphotos2immich: imports Google Photos shared albums into Immich.
//!
//! Work is organised in jobs. A job names an Immich server, its
//! credentials and a list of shared album links. The [`controller`] admits
//! queued jobs and runs each through a bounded download pool feeding a
//! bounded upload pool ([`pipeline`]). Progress, album and item state live
//! in SQLite ([`state`]), so a paused, cancelled or interrupted job picks
//! up where it stopped.

#![warn(clippy::all)]

pub mod checksum;
pub mod cli;
pub mod config;
pub mod controller;
pub mod destination;
pub mod events;
pub mod exif;
pub mod lock;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod secrets;
pub mod shutdown;
pub mod source;
pub mod staging;
pub mod state;
pub mod systemd;
