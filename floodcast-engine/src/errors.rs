/*
This code is part of the FloodCast flood simulation library.
Authors: The FloodCast Developers
Created: 22/03/2024
Last Modified: 06/10/2024
License: MIT
*/
use thiserror::Error;

/// The error taxonomy of the engine. Every fatal condition maps onto one of
/// these kinds; recoverable conditions (an out-of-window rainfall frame,
/// minor mass drift) are reported as warnings instead and never surface here.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid domain: {0}")]
    DomainInvalid(String),

    #[error("rainfall unavailable: {0}")]
    RainfallUnavailable(String),

    #[error("mass conservation violated: {0}")]
    MassConservationViolation(String),

    #[error("transport failure: {0}")]
    TransportError(String),

    #[error("incompatible restart state: {0}")]
    StateIncompatible(String),

    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// The process exit code the front end reports for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::ConfigurationInvalid(_) => 2,
            EngineError::StateIncompatible(_) => 3,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
