//! Model execution bridge.
//!
//! Marshals one imputed dataset and one [`longmix_model::ModelSpec`] across
//! a process boundary to an external mixed-model fitting engine and returns
//! a structured [`longmix_model::FitResult`] or a typed [`BridgeError`].
//!
//! The external engine holds process-wide named state, so every call runs
//! in an exclusive [`EngineSession`] obtained from the engine and torn down
//! when dropped. [`RscriptEngine`] gives each fit its own `Rscript` process.

mod bridge;
mod cancel;
mod engine;
mod error;
mod marshal;
mod rscript;

pub use bridge::{Bridge, DEFAULT_TIMEOUT, FitContext, interpret};
pub use cancel::CancellationToken;
pub use engine::{
    CallLimits, EngineCoefficient, EngineCorrelation, EngineFailure, EngineOutput,
    EngineSession, EngineVarComp, FailureKind, FittingEngine,
};
pub use error::{BridgeError, ErrorClass, Result};
pub use marshal::{FitRequest, Payload, marshal};
pub use rscript::{EngineReport, PackageStatus, R_PACKAGES, RscriptEngine, RscriptSession};
