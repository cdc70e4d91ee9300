//! # Lockstep Co-Simulation Runtime
//!
//! A distributed co-simulation runtime: a master process orchestrates a set
//! of independently running **slaves** (simulation components, each
//! encapsulating a black-box model) so that together they advance simulated
//! time in lock-step, exchanging the values of connected variables at every
//! step.
//!
//! ## Design Principles
//!
//! - **Single-threaded reactors**: each process runs one event loop; no
//!   callback ever runs concurrently with another.  Multi-slave parallelism
//!   is by process, not by thread.
//! - **Push-style futures**: operations that wait return a [`Future`];
//!   completion handlers resume the flow at the next reactor tick.
//! - **Request/reply control, publish/subscribe data**: the master drives
//!   each slave over an RFSM protocol carrying a state tag in every reply,
//!   while variable values flow directly between slaves.
//! - **Jacobi coupling**: every slave computes its next step from the
//!   previous step's peer outputs; all slaves advance in parallel.
//! - **Validate before running**: the [`ModelBuilder`] checks names,
//!   causality, data types, and variability offline and freezes an
//!   immutable [`Model`] for the controller.

pub mod agent;
pub mod builder;
pub mod config;
pub mod controller;
pub mod error;
pub mod future;
pub mod instance;
pub mod model;
pub mod reactor;
pub mod rfsm;
pub mod types;
pub mod wire;

// Re-export commonly used types
pub use agent::{AgentState, SlaveAgent, SlaveRunner};
pub use builder::{Model, ModelBuilder};
pub use config::ExecutionOptions;
pub use controller::{Execution, ExecutionStats, SlaveLocator, StepResult};
pub use error::{Error, Result};
pub use future::{chain, when_all, ChainedFuture, EndChain, Future, Promise};
pub use instance::{Instance, LoggingInstance};
pub use model::{
    Causality, DataType, QualifiedVariableName, ScalarValue, SlaveDescription,
    SlaveTypeDescription, Variability, VariableDescription,
};
pub use reactor::Reactor;
pub use types::{SlaveId, StepId, TimeDuration, TimePoint, VariableId, ETERNITY};
