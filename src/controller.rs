//! Master-side orchestration.
//!
//! A [`SlaveController`] wraps the RFSM master for one slave and exposes
//! the control events as future-returning operations.  The [`Execution`]
//! drives a whole set of slaves through their lifecycle: greeting,
//! configuration, variable initialisation, peer wiring, and then the step
//! loop.  Each stage is issued to all slaves in parallel (one outstanding
//! request per slave) and joined with [`when_all`]; a failure from any
//! slave stops the controller and terminates all slaves.
//!
//! Slave-to-slave variable values flow directly over PUB/SUB between the
//! slaves; the controller never routes them itself.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use crate::builder::Model;
use crate::config::ExecutionOptions;
use crate::error::{Error, Result};
use crate::future::{when_all, Future, Promise};
use crate::model::{QualifiedVariableName, SlaveDescription, SlaveTypeDescription};
use crate::reactor::Reactor;
use crate::rfsm::{self, Reply};
use crate::types::{SlaveId, StepId, TimePoint};
use crate::wire::{self, event, response};

/// Where to find one slave: its control and data publisher endpoints.
#[derive(Clone, Debug)]
pub struct SlaveLocator {
    pub control_endpoint: String,
    pub data_pub_endpoint: String,
}

impl SlaveLocator {
    pub fn new(control: impl Into<String>, data_pub: impl Into<String>) -> Self {
        Self {
            control_endpoint: control.into(),
            data_pub_endpoint: data_pub.into(),
        }
    }
}

/// The outcome of one STEP command across all slaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepResult {
    /// Every slave performed the step.
    Complete,
    /// At least one slave reported the step as failed (too long).
    Failed,
}

/// Statistics collected by an execution.
#[derive(Clone, Debug, Default)]
pub struct ExecutionStats {
    /// STEP rounds in which every slave succeeded
    pub steps_completed: u64,
    /// STEP rounds in which at least one slave failed
    pub steps_failed: u64,
    /// ACCEPT_STEP rounds performed
    pub steps_accepted: u64,
}

/// The per-slave outcome of a STEP command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StepOutcome {
    Complete,
    Failed,
}

/// Future-returning protocol client for one slave.
struct SlaveController {
    reactor: Reactor,
    master: rfsm::Master,
    name: String,
}

impl SlaveController {
    fn new(reactor: &Reactor, context: &zmq::Context, name: &str, endpoint: &str) -> Result<Self> {
        Ok(Self {
            reactor: reactor.clone(),
            master: rfsm::Master::new(reactor, context, endpoint)?,
            name: name.to_string(),
        })
    }

    /// Sends one event and returns a future of the raw reply.  A send
    /// failure (e.g. [`Error::Busy`]) fails the future instead of being
    /// returned synchronously, so stages compose uniformly.
    fn request(&self, event_id: &'static [u8], data: Vec<u8>, timeout: Duration) -> Future<Reply> {
        let (promise, future) = Promise::pair(&self.reactor);
        let cell = Rc::new(RefCell::new(Some(promise)));
        let settled = Rc::clone(&cell);
        let outcome = self.master.send_event(
            event_id,
            &data,
            timeout,
            Box::new(move |_, result| {
                if let Some(mut promise) = settled.borrow_mut().take() {
                    match result {
                        Ok(reply) => promise.set_value(reply),
                        Err(e) => promise.set_exception(e),
                    }
                } else {
                    Ok(())
                }
            }),
        );
        if let Err(e) = outcome {
            if let Some(mut promise) = cell.borrow_mut().take() {
                let _ = promise.set_exception(e);
            }
        }
        future
    }

    /// Like [`SlaveController::request`], but maps the reply through `map`
    /// with error replies already rejected.
    fn command<T: 'static>(
        &self,
        event_id: &'static [u8],
        data: Vec<u8>,
        timeout: Duration,
        map: impl FnOnce(Reply) -> Result<T> + 'static,
    ) -> Future<T> {
        let slave = self.name.clone();
        let (promise, out) = Promise::pair(&self.reactor);
        let cell = Rc::new(RefCell::new(Some(promise)));
        let on_ok = Rc::clone(&cell);
        let on_err = Rc::clone(&cell);
        self.request(event_id, data, timeout).on_completion(
            move |reply| {
                let Some(mut promise) = on_ok.borrow_mut().take() else {
                    return Ok(());
                };
                let mapped = if reply.response_id == response::ERROR {
                    Err(Error::Protocol(format!(
                        "slave {slave} reported: {}",
                        String::from_utf8_lossy(&reply.response_data)
                    )))
                } else {
                    map(reply)
                };
                match mapped {
                    Ok(value) => promise.set_value(value),
                    Err(e) => promise.set_exception(e),
                }
            },
            move |e| {
                if let Some(mut promise) = on_err.borrow_mut().take() {
                    promise.set_exception(e)
                } else {
                    Ok(())
                }
            },
        );
        out
    }

    fn expect_ok(event_name: &'static str) -> impl FnOnce(Reply) -> Result<()> + 'static {
        move |reply| {
            if reply.response_id == response::OK || reply.response_id == response::HELLO {
                Ok(())
            } else {
                Err(Error::Protocol(format!(
                    "unexpected response to {event_name}: {}",
                    String::from_utf8_lossy(&reply.response_id)
                )))
            }
        }
    }

    fn hello(&self, timeout: Duration) -> Future<()> {
        self.command(event::HELLO, Vec::new(), timeout, Self::expect_ok("HELLO"))
    }

    fn describe(&self, timeout: Duration) -> Future<SlaveTypeDescription> {
        self.command(event::DESCRIBE, Vec::new(), timeout, |reply| {
            if reply.response_id != response::OK {
                return Err(Error::Protocol(format!(
                    "unexpected response to DESCRIBE: {}",
                    String::from_utf8_lossy(&reply.response_id)
                )));
            }
            wire::decode(&reply.response_data)
        })
    }

    fn setup(&self, data: &wire::SetupData, timeout: Duration) -> Future<()> {
        match wire::encode(data) {
            Ok(bytes) => self.command(event::SETUP, bytes, timeout, Self::expect_ok("SETUP")),
            Err(e) => self.failed(e),
        }
    }

    fn set_variable(&self, data: &wire::SetVarData, timeout: Duration) -> Future<()> {
        match wire::encode(data) {
            Ok(bytes) => self.command(event::SET_VAR, bytes, timeout, Self::expect_ok("SET_VAR")),
            Err(e) => self.failed(e),
        }
    }

    fn set_peers(&self, peers: Vec<String>, timeout: Duration) -> Future<()> {
        match wire::encode(&wire::SetPeersData { peers }) {
            Ok(bytes) => {
                self.command(event::SET_PEERS, bytes, timeout, Self::expect_ok("SET_PEERS"))
            }
            Err(e) => self.failed(e),
        }
    }

    fn start_simulation(&self, timeout: Duration) -> Future<()> {
        self.command(
            event::START_SIM,
            Vec::new(),
            timeout,
            Self::expect_ok("START_SIM"),
        )
    }

    fn step(&self, data: &wire::StepData, timeout: Duration) -> Future<StepOutcome> {
        match wire::encode(data) {
            Ok(bytes) => self.command(event::STEP, bytes, timeout, |reply| {
                if reply.response_id == response::OK {
                    Ok(StepOutcome::Complete)
                } else if reply.response_id == response::STEP_FAILED {
                    Ok(StepOutcome::Failed)
                } else {
                    Err(Error::Protocol(format!(
                        "unexpected response to STEP: {}",
                        String::from_utf8_lossy(&reply.response_id)
                    )))
                }
            }),
            Err(e) => self.failed(e),
        }
    }

    fn accept_step(&self, timeout: Duration) -> Future<()> {
        self.command(
            event::ACCEPT_STEP,
            Vec::new(),
            timeout,
            Self::expect_ok("ACCEPT_STEP"),
        )
    }

    fn terminate(&self, timeout: Duration) -> Future<()> {
        self.command(
            event::TERMINATE,
            Vec::new(),
            timeout,
            Self::expect_ok("TERMINATE"),
        )
    }

    /// An immediately failing future, for errors detected before sending.
    fn failed<T: 'static>(&self, error: Error) -> Future<T> {
        let (mut promise, future) = Promise::pair(&self.reactor);
        let _ = promise.set_exception(error);
        future
    }
}

struct ExecutionSlave {
    id: SlaveId,
    name: String,
    controller: SlaveController,
    data_pub_endpoint: String,
}

/// Drives a set of slaves through a co-simulation in lock-step.
///
/// Constructed from a frozen [`Model`] plus the locators of the running
/// slaves; construction performs the whole initialisation sequence, after
/// which [`Execution::step`] / [`Execution::accept_step`] advance the
/// simulation one fixed step at a time, or [`Execution::run_to`] loops for
/// you.
pub struct Execution {
    reactor: Reactor,
    options: ExecutionOptions,
    slaves: Vec<ExecutionSlave>,
    /// Populated during initialisation from the slaves' DESCRIBE replies.
    descriptions: Vec<SlaveDescription>,
    current_time: TimePoint,
    step_id: StepId,
    terminated: bool,
    stats: ExecutionStats,
}

impl Execution {
    /// Connects to all slaves named by `model` and takes them through
    /// greeting, setup, initial values, connections, peer wiring, and
    /// simulation start.
    pub fn new(
        context: &zmq::Context,
        model: &Model,
        options: ExecutionOptions,
        locators: &HashMap<String, SlaveLocator>,
    ) -> Result<Self> {
        options.validate()?;
        let reactor = Reactor::new();
        let mut slaves = Vec::new();
        for (index, name) in model.slave_names().into_iter().enumerate() {
            let locator = locators.get(name).ok_or_else(|| {
                Error::EntityNotFound(format!("no locator for slave {name}"))
            })?;
            let id = (index + 1) as SlaveId;
            slaves.push(ExecutionSlave {
                id,
                name: name.to_string(),
                controller: SlaveController::new(
                    &reactor,
                    context,
                    name,
                    &locator.control_endpoint,
                )?,
                data_pub_endpoint: locator.data_pub_endpoint.clone(),
            });
        }
        let current_time = options.start_time;
        let mut execution = Self {
            reactor,
            options,
            slaves,
            descriptions: Vec::new(),
            current_time,
            step_id: crate::types::INVALID_STEP_ID,
            terminated: false,
            stats: ExecutionStats::default(),
        };
        execution.initialize(model)?;
        Ok(execution)
    }

    /// The master's current simulated time.
    pub fn current_time(&self) -> TimePoint {
        self.current_time
    }

    /// Whether TERMINATE has been issued.
    pub fn terminated(&self) -> bool {
        self.terminated
    }

    /// The slaves of this execution, as reported by their DESCRIBE replies.
    pub fn slave_descriptions(&self) -> &[SlaveDescription] {
        &self.descriptions
    }

    /// Statistics collected so far.
    pub fn stats(&self) -> &ExecutionStats {
        &self.stats
    }

    /// Exports the execution state and statistics as JSON.
    pub fn export_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "execution": {
                "name": self.options.name,
                "current_time": self.current_time,
                "step_size": self.options.step_size,
                "terminated": self.terminated,
                "slave_count": self.slaves.len(),
            },
            "steps": {
                "completed": self.stats.steps_completed,
                "failed": self.stats.steps_failed,
                "accepted": self.stats.steps_accepted,
            },
        })
    }

    /// Issues STEP to all slaves in parallel and joins the outcomes.
    ///
    /// `Ok(StepResult::Failed)` means at least one slave could not perform
    /// the step; protocol-level failures are returned as errors.  In both
    /// cases the caller is expected to terminate the execution.
    pub fn step(&mut self) -> Result<StepResult> {
        self.ensure_active()?;
        self.step_id += 1;
        let data = wire::StepData {
            step_id: self.step_id,
            time: self.current_time,
            step_size: self.options.step_size,
        };
        tracing::debug!(step = data.step_id, time = data.time, "stepping");
        let timeout = self.options.comm_timeout();
        let futures = self
            .slaves
            .iter()
            .map(|s| s.controller.step(&data, timeout))
            .collect();
        let results = self.join(futures)?;

        let mut failed = false;
        for (slave, outcome) in self.slaves.iter().zip(results) {
            match outcome {
                Ok(StepOutcome::Complete) => {}
                Ok(StepOutcome::Failed) => {
                    tracing::warn!(slave = %slave.name, "slave could not perform the step");
                    failed = true;
                }
                Err(e) => {
                    tracing::error!(slave = %slave.name, error = %e, "step command failed");
                    return Err(e);
                }
            }
        }
        if failed {
            self.stats.steps_failed += 1;
            Ok(StepResult::Failed)
        } else {
            self.stats.steps_completed += 1;
            Ok(StepResult::Complete)
        }
    }

    /// Issues ACCEPT_STEP to all slaves and advances the master's time.
    pub fn accept_step(&mut self) -> Result<()> {
        self.ensure_active()?;
        let timeout = self.options.comm_timeout();
        let futures = self
            .slaves
            .iter()
            .map(|s| s.controller.accept_step(timeout))
            .collect();
        for outcome in self.join(futures)? {
            outcome?;
        }
        self.current_time += self.options.step_size;
        self.stats.steps_accepted += 1;
        Ok(())
    }

    /// Issues TERMINATE to all slaves.  Always leaves the execution in the
    /// terminated state; per-slave delivery failures are only logged.
    pub fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;
        let timeout = self.options.comm_timeout();
        let futures = self
            .slaves
            .iter()
            .map(|s| s.controller.terminate(timeout))
            .collect();
        let results = self.join(futures)?;
        for (slave, outcome) in self.slaves.iter().zip(results) {
            if let Err(e) = outcome {
                tracing::warn!(slave = %slave.name, error = %e, "TERMINATE not confirmed");
            }
        }
        tracing::info!("execution terminated at t={}", self.current_time);
        Ok(())
    }

    /// Runs step/accept rounds until `end_time` is reached.  Any slave
    /// failure terminates all slaves and surfaces an error.
    pub fn run_to(&mut self, end_time: TimePoint) -> Result<()> {
        while self.current_time + self.options.step_size <= end_time + 1e-9 {
            match self.step() {
                Ok(StepResult::Complete) => self.accept_step()?,
                Ok(StepResult::Failed) => {
                    self.terminate()?;
                    return Err(Error::InstanceBroken(
                        "one or more slaves failed to perform the time step".into(),
                    ));
                }
                Err(e) => {
                    self.terminate()?;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn ensure_active(&self) -> Result<()> {
        if self.terminated {
            return Err(Error::InvalidArgument(
                "execution has been terminated".into(),
            ));
        }
        Ok(())
    }

    fn initialize(&mut self, model: &Model) -> Result<()> {
        let timeout = self.options.comm_timeout();

        tracing::debug!(slaves = self.slaves.len(), "greeting slaves");
        let hellos = self.slaves.iter().map(|s| s.controller.hello(timeout)).collect();
        self.join_all_ok(hellos)?;

        let setups = self
            .slaves
            .iter()
            .map(|s| {
                let data = wire::SetupData {
                    slave_id: s.id,
                    slave_name: s.name.clone(),
                    execution_name: self.options.name.clone(),
                    start_time: self.options.start_time,
                    stop_time: self.options.max_time.filter(|t| t.is_finite()),
                    adaptive_step_size: self.options.adaptive_step_size,
                    relative_tolerance: self.options.relative_tolerance,
                    variable_recv_timeout_ms: Some(self.options.variable_recv_timeout_ms),
                };
                s.controller.setup(&data, timeout)
            })
            .collect();
        self.join_all_ok(setups)?;

        // Every slave must report the type the model declares for it.
        let describes = self
            .slaves
            .iter()
            .map(|s| s.controller.describe(timeout))
            .collect();
        let replies = self.join(describes)?;
        let mut descriptions = Vec::with_capacity(self.slaves.len());
        for (slave, description) in self.slaves.iter().zip(replies) {
            let description = description?;
            let declared = model.slave_type(&slave.name).ok_or_else(|| {
                Error::EntityNotFound(format!("unknown slave name: {}", slave.name))
            })?;
            if description.uuid() != declared.uuid() {
                return Err(Error::ModelConstruction(format!(
                    "slave {} reports type {} ({}) but the model declares {} ({})",
                    slave.name,
                    description.name(),
                    description.uuid(),
                    declared.name(),
                    declared.uuid()
                )));
            }
            descriptions.push(SlaveDescription::new(slave.id, slave.name.clone(), description));
        }
        self.descriptions = descriptions;

        // One SET_VAR per initial value and per connection, issued in
        // rounds so that each slave has at most one outstanding request.
        let settings = self.variable_settings(model)?;
        let rounds = settings.values().map(Vec::len).max().unwrap_or(0);
        for round in 0..rounds {
            let futures: Vec<Future<()>> = self
                .slaves
                .iter()
                .filter_map(|s| {
                    settings
                        .get(&s.id)
                        .and_then(|list| list.get(round))
                        .map(|data| s.controller.set_variable(data, timeout))
                })
                .collect();
            self.join_all_ok(futures)?;
        }

        // Every slave subscribes at the publishers of all its peers.
        let peer_stage = self
            .slaves
            .iter()
            .map(|s| {
                let peers: Vec<String> = self
                    .slaves
                    .iter()
                    .filter(|peer| peer.id != s.id)
                    .map(|peer| peer.data_pub_endpoint.clone())
                    .collect();
                s.controller.set_peers(peers, timeout)
            })
            .collect();
        self.join_all_ok(peer_stage)?;

        let starts = self
            .slaves
            .iter()
            .map(|s| s.controller.start_simulation(timeout))
            .collect();
        self.join_all_ok(starts)?;
        tracing::info!(slaves = self.slaves.len(), "all slaves started");
        Ok(())
    }

    /// Translates the model's initial values and connections into per-slave
    /// SET_VAR payloads.
    fn variable_settings(&self, model: &Model) -> Result<HashMap<SlaveId, Vec<wire::SetVarData>>> {
        let mut by_slave: HashMap<SlaveId, Vec<wire::SetVarData>> = HashMap::new();

        for (qvn, value) in model.initial_values() {
            let (slave_id, variable) = self.resolve(model, qvn)?;
            by_slave.entry(slave_id).or_default().push(wire::SetVarData {
                variable,
                value: Some(value.clone()),
                connect_to: None,
            });
        }

        for (target, source) in model.connections() {
            let (target_slave, target_variable) = self.resolve(model, target)?;
            let (source_slave, source_variable) = self.resolve(model, source)?;
            let source_variable = u16::try_from(source_variable).map_err(|_| {
                Error::InvalidArgument(format!(
                    "variable ID of {source} does not fit the data frame header"
                ))
            })?;
            by_slave.entry(target_slave).or_default().push(wire::SetVarData {
                variable: target_variable,
                value: None,
                connect_to: Some(wire::RemoteVariable {
                    slave: source_slave,
                    variable: source_variable,
                }),
            });
        }
        Ok(by_slave)
    }

    fn resolve(
        &self,
        model: &Model,
        qvn: &QualifiedVariableName,
    ) -> Result<(SlaveId, crate::types::VariableId)> {
        let slave = self
            .slaves
            .iter()
            .find(|s| s.name == qvn.slave())
            .ok_or_else(|| Error::EntityNotFound(format!("unknown slave name: {}", qvn.slave())))?;
        let ty = model
            .slave_type(qvn.slave())
            .ok_or_else(|| Error::EntityNotFound(format!("unknown slave name: {}", qvn.slave())))?;
        let variable = ty
            .variable_by_name(qvn.variable())
            .ok_or_else(|| Error::EntityNotFound(format!("unknown variable: {qvn}")))?;
        Ok((slave.id, variable.id))
    }

    /// Joins a set of per-slave futures by running the reactor until the
    /// combined future resolves.
    fn join<T: 'static>(&self, futures: Vec<Future<T>>) -> Result<Vec<Result<T>>> {
        let combined = when_all(&self.reactor, futures);
        let slot = Rc::new(RefCell::new(None));
        let out = Rc::clone(&slot);
        let reactor = self.reactor.clone();
        combined.on_completion(
            move |results| {
                *out.borrow_mut() = Some(results);
                reactor.stop();
                Ok(())
            },
            |e| Err(e),
        );
        self.reactor.run()?;
        let result = slot
            .borrow_mut()
            .take()
            .ok_or_else(|| Error::Protocol("reactor stopped before all replies arrived".into()));
        result
    }

    fn join_all_ok(&self, futures: Vec<Future<()>>) -> Result<()> {
        for outcome in self.join(futures)? {
            outcome?;
        }
        Ok(())
    }
}
