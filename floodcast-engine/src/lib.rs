/*
This code is part of the FloodCast flood simulation library.
Authors: The FloodCast Developers
Created: 22/03/2024
Last Modified: 19/05/2025
License: MIT
*/

//! The FloodCast simulation core: a Lagrangian particle transport engine that
//! estimates surface runoff and flood depth over gridded terrain. Rainfall is
//! converted to incremental runoff by the cumulative SCS-CN model,
//! discretized into water particles, routed along D8 flow directions with
//! per-cell travel-time gating, and migrated between ranks when particles
//! cross row-slab boundaries.

pub mod aggregate;
pub mod checkpoint;
pub mod config;
pub mod decomp;
pub mod engine;
pub mod errors;
pub mod grid;
pub mod particle;
pub mod rainfall;
pub mod risk;
pub mod router;
pub mod runoff;
pub mod transport;

pub use crate::config::RunConfig;
pub use crate::engine::{run_parallel, RunSummary, Simulation};
pub use crate::errors::{EngineError, Result};
pub use crate::grid::{D8Encoding, Grid, Hop};
pub use crate::particle::{Particle, ParticleClass, ParticlePool, ParticleRecord};
pub use crate::transport::{ChannelTransport, SerialTransport, Transport};
