//! Slave-side state machine and per-step variable exchange.
//!
//! The [`SlaveAgent`] holds the state of one slave and answers the master's
//! control events in a manner appropriate to that state.  It owns the PUB
//! socket on which the slave's output variables are published and the SUB
//! socket on which peer outputs coupled to its inputs arrive.
//!
//! State transitions (any unexpected event yields a protocol-error reply
//! and no transition; TERMINATE is accepted in every state):
//!
//! ```text
//! Connecting --SETUP--> Init --START_SIM--> Ready --STEP--> Published
//!                        |  \                 ^               |
//!                        |   SET_VAR/GET_VAR/ \--ACCEPT_STEP--/
//!                        |   SET_PEERS (loop)
//!                        |
//! Ready --STEP (do_step == false)--> StepFailed --TERMINATE--> Terminated
//! ```
//!
//! Per step the agent publishes one frame per output variable, then waits
//! until exactly one frame has arrived for every coupled input, applies
//! those values to the instance, and only then calls `do_step` — plain
//! Jacobi coupling: step N consumes the peers' step N−1 outputs.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::instance::Instance;
use crate::model::{Causality, DataType, ScalarValue, SlaveTypeDescription};
use crate::reactor::{Reactor, TimerId};
use crate::rfsm;
use crate::types::{SlaveId, TimeDuration, TimePoint, VariableId, ETERNITY};
use crate::wire::{self, event, response, FrameHeader};

/// The lifecycle state of a slave agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentState {
    Connecting,
    Init,
    Ready,
    Published,
    StepFailed,
    Terminated,
}

impl AgentState {
    /// The RFSM state tag reported in replies.
    pub fn tag(self) -> u16 {
        match self {
            AgentState::Connecting => 1,
            AgentState::Init => 2,
            AgentState::Ready => 3,
            AgentState::Published => 4,
            AgentState::StepFailed => 5,
            AgentState::Terminated => 6,
        }
    }
}

/// Couplings from remote output frames to local input variables, plus the
/// SUB socket subscriptions that realise them.
#[derive(Default)]
struct Connections {
    /// local input variable -> remote frame header
    inputs: HashMap<VariableId, FrameHeader>,
}

impl Connections {
    fn couple(
        &mut self,
        subscriber: &zmq::Socket,
        local_input: VariableId,
        header: FrameHeader,
    ) -> Result<()> {
        self.decouple(subscriber, local_input)?;
        subscriber.set_subscribe(&header.to_bytes())?;
        self.inputs.insert(local_input, header);
        Ok(())
    }

    fn decouple(&mut self, subscriber: &zmq::Socket, local_input: VariableId) -> Result<()> {
        let Some(header) = self.inputs.remove(&local_input) else {
            return Ok(());
        };
        // Only unsubscribe once no other input is fed by the same frame.
        if !self.inputs.values().any(|h| *h == header) {
            subscriber.set_unsubscribe(&header.to_bytes())?;
        }
        Ok(())
    }

    fn subscribed_headers(&self) -> HashSet<FrameHeader> {
        self.inputs.values().copied().collect()
    }
}

/// The state of one slave: responds to control events from the master and
/// drives the wrapped [`Instance`].
pub struct SlaveAgent {
    instance: Box<dyn Instance>,
    type_description: SlaveTypeDescription,
    state: AgentState,
    broken: bool,
    slave_id: SlaveId,
    publisher: zmq::Socket,
    subscriber: zmq::Socket,
    connections: Connections,
    current_time: TimePoint,
    last_step_size: TimeDuration,
    started: bool,
    variable_recv_timeout: Duration,
    /// Reset on every control message; owned by the runner.
    inactivity_timer: Option<TimerId>,
}

impl SlaveAgent {
    /// Creates an agent wrapping `instance`, binding its data publisher to
    /// `data_pub_endpoint`.
    pub fn new(
        context: &zmq::Context,
        instance: Box<dyn Instance>,
        data_pub_endpoint: &str,
    ) -> Result<Self> {
        let publisher = context.socket(zmq::PUB)?;
        publisher.set_linger(0)?;
        publisher.bind(data_pub_endpoint)?;
        let subscriber = context.socket(zmq::SUB)?;
        subscriber.set_linger(0)?;

        let type_description = instance.type_description();
        Ok(Self {
            instance,
            type_description,
            state: AgentState::Connecting,
            broken: false,
            slave_id: 0,
            publisher,
            subscriber,
            connections: Connections::default(),
            current_time: 0.0,
            last_step_size: 0.0,
            started: false,
            variable_recv_timeout: Duration::from_secs(1),
            inactivity_timer: None,
        })
    }

    /// The current lifecycle state.
    pub fn state(&self) -> AgentState {
        self.state
    }

    /// The slave's current simulated time.
    pub fn current_time(&self) -> TimePoint {
        self.current_time
    }

    /// The endpoint the data publisher is bound to.
    pub fn bound_data_endpoint(&self) -> Result<String> {
        self.publisher
            .get_last_endpoint()?
            .map_err(|_| Error::Protocol("bound endpoint is not valid UTF-8".into()))
    }

    fn reply_ok(&self) -> (u16, Vec<u8>, Vec<u8>) {
        (self.state.tag(), response::OK.to_vec(), Vec::new())
    }

    fn unexpected(&self, event_id: &[u8]) -> Error {
        Error::Protocol(format!(
            "unexpected event {} in state {:?}",
            String::from_utf8_lossy(event_id),
            self.state
        ))
    }

    fn broken_by<T>(&mut self, error: Error) -> Result<T> {
        self.broken = true;
        Err(Error::InstanceBroken(error.to_string()))
    }

    fn handle_hello(&mut self) -> Result<(u16, Vec<u8>, Vec<u8>)> {
        tracing::debug!("greeting master");
        Ok((self.state.tag(), response::HELLO.to_vec(), Vec::new()))
    }

    fn handle_setup(&mut self, data: &[u8]) -> Result<(u16, Vec<u8>, Vec<u8>)> {
        let setup: wire::SetupData = wire::decode(data)?;
        let stop_time = setup.stop_time.unwrap_or(ETERNITY);
        tracing::debug!(
            slave = %setup.slave_name,
            id = setup.slave_id,
            start = setup.start_time,
            stop = stop_time,
            "configuring instance"
        );
        if let Err(e) = self.instance.setup(
            &setup.slave_name,
            &setup.execution_name,
            setup.start_time,
            stop_time,
            setup.adaptive_step_size,
            setup.relative_tolerance,
        ) {
            return self.broken_by(e);
        }
        self.slave_id = setup.slave_id;
        self.current_time = setup.start_time;
        if let Some(ms) = setup.variable_recv_timeout_ms {
            self.variable_recv_timeout = Duration::from_millis(ms);
        }
        self.state = AgentState::Init;
        Ok(self.reply_ok())
    }

    fn handle_describe(&self) -> Result<(u16, Vec<u8>, Vec<u8>)> {
        Ok((
            self.state.tag(),
            response::OK.to_vec(),
            wire::encode(&self.type_description)?,
        ))
    }

    fn handle_set_var(&mut self, data: &[u8]) -> Result<(u16, Vec<u8>, Vec<u8>)> {
        let setting: wire::SetVarData = wire::decode(data)?;
        let variable = self
            .type_description
            .variable(setting.variable)
            .ok_or_else(|| {
                Error::Protocol(format!("unknown variable ID {}", setting.variable))
            })?
            .clone();
        if let Some(value) = setting.value {
            self.set_scalar(setting.variable, &variable.name, value)?;
        }
        if let Some(remote) = setting.connect_to {
            if variable.causality != Causality::Input
                && variable.causality != Causality::Parameter
            {
                return Err(Error::Protocol(format!(
                    "variable {} is not connectable ({})",
                    variable.name, variable.causality
                )));
            }
            self.connections
                .couple(&self.subscriber, setting.variable, remote.into())?;
            tracing::debug!(
                input = %variable.name,
                remote_slave = remote.slave,
                remote_variable = remote.variable,
                "coupled input to remote output"
            );
        }
        Ok(self.reply_ok())
    }

    fn handle_get_var(&mut self, data: &[u8]) -> Result<(u16, Vec<u8>, Vec<u8>)> {
        let request: wire::GetVarData = wire::decode(data)?;
        let variable = self
            .type_description
            .variable(request.variable)
            .ok_or_else(|| {
                Error::Protocol(format!("unknown variable ID {}", request.variable))
            })?;
        let value = match self.read_scalar(request.variable, variable.data_type) {
            Ok(v) => v,
            Err(e) => return self.broken_by(e),
        };
        Ok((
            self.state.tag(),
            response::OK.to_vec(),
            wire::encode(&value)?,
        ))
    }

    fn handle_set_peers(&mut self, data: &[u8]) -> Result<(u16, Vec<u8>, Vec<u8>)> {
        let peers: wire::SetPeersData = wire::decode(data)?;
        for endpoint in &peers.peers {
            self.subscriber.connect(endpoint)?;
        }
        tracing::debug!(count = peers.peers.len(), "connected to peer publishers");
        Ok(self.reply_ok())
    }

    fn handle_start_sim(&mut self) -> Result<(u16, Vec<u8>, Vec<u8>)> {
        if let Err(e) = self.instance.start_simulation() {
            return self.broken_by(e);
        }
        self.started = true;
        self.state = AgentState::Ready;
        tracing::info!(slave = self.slave_id, "simulation started");
        Ok(self.reply_ok())
    }

    fn handle_step(&mut self, data: &[u8]) -> Result<(u16, Vec<u8>, Vec<u8>)> {
        let step: wire::StepData = wire::decode(data)?;
        tracing::trace!(
            step = step.step_id,
            time = step.time,
            size = step.step_size,
            "performing step"
        );

        self.publish_outputs()?;
        let received = self.receive_inputs()?;
        self.apply_inputs(&received)?;

        match self.instance.do_step(step.time, step.step_size) {
            Ok(true) => {
                self.current_time = step.time;
                self.last_step_size = step.step_size;
                self.state = AgentState::Published;
                Ok(self.reply_ok())
            }
            Ok(false) => {
                tracing::warn!(
                    time = step.time,
                    size = step.step_size,
                    "step too long, entering StepFailed"
                );
                self.state = AgentState::StepFailed;
                Ok((
                    self.state.tag(),
                    response::STEP_FAILED.to_vec(),
                    Vec::new(),
                ))
            }
            Err(e) => self.broken_by(e),
        }
    }

    fn handle_accept_step(&mut self) -> Result<(u16, Vec<u8>, Vec<u8>)> {
        self.current_time += self.last_step_size;
        self.state = AgentState::Ready;
        Ok(self.reply_ok())
    }

    fn handle_terminate(&mut self, reactor: &Reactor) -> Result<(u16, Vec<u8>, Vec<u8>)> {
        if self.started {
            if let Err(e) = self.instance.end_simulation() {
                return self.broken_by(e);
            }
            self.started = false;
        }
        self.state = AgentState::Terminated;
        tracing::info!(slave = self.slave_id, "terminated");
        reactor.stop();
        Ok(self.reply_ok())
    }

    /// Publishes one data frame per output variable with the instance's
    /// current values.
    fn publish_outputs(&mut self) -> Result<()> {
        let outputs: Vec<_> = self
            .type_description
            .variables()
            .iter()
            .filter(|v| v.causality == Causality::Output)
            .cloned()
            .collect();
        for variable in outputs {
            let wire_id = u16::try_from(variable.id).map_err(|_| {
                Error::InvalidArgument(format!(
                    "variable ID {} does not fit the data frame header",
                    variable.id
                ))
            })?;
            let value = match self.read_scalar(variable.id, variable.data_type) {
                Ok(v) => v,
                Err(e) => return self.broken_by(e),
            };
            let header = FrameHeader {
                slave: self.slave_id,
                variable: wire_id,
            };
            self.publisher
                .send(wire::encode_data_frame(header, &value), 0)?;
        }
        Ok(())
    }

    /// Waits until exactly one frame has arrived for every subscribed input
    /// header, within the variable-receive timeout.
    fn receive_inputs(&mut self) -> Result<HashMap<FrameHeader, ScalarValue>> {
        let mut wanted = self.connections.subscribed_headers();
        let mut received = HashMap::new();
        if wanted.is_empty() {
            return Ok(received);
        }

        // All inputs coupled to the same header share its data type.
        let mut types: HashMap<FrameHeader, DataType> = HashMap::new();
        for (local, header) in &self.connections.inputs {
            if let Some(v) = self.type_description.variable(*local) {
                types.insert(*header, v.data_type);
            }
        }

        let deadline = Instant::now() + self.variable_recv_timeout;
        while !wanted.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout(format!(
                    "missing {} peer variable frame(s)",
                    wanted.len()
                )));
            }
            let readable = {
                let mut items = [self.subscriber.as_poll_item(zmq::POLLIN)];
                zmq::poll(&mut items, remaining.as_millis().max(1) as i64)?;
                items[0].is_readable()
            };
            if !readable {
                continue;
            }
            let frame = self.subscriber.recv_bytes(0)?;
            let header = FrameHeader::from_bytes(&frame)?;
            let Some(data_type) = types.get(&header) else {
                tracing::trace!(?header, "ignoring frame for unsubscribed header");
                continue;
            };
            let (_, value) = wire::decode_data_frame(&frame, *data_type)?;
            wanted.remove(&header);
            received.insert(header, value);
        }
        Ok(received)
    }

    /// Applies the received peer values to the coupled input variables.
    fn apply_inputs(&mut self, received: &HashMap<FrameHeader, ScalarValue>) -> Result<()> {
        let couplings: Vec<(VariableId, FrameHeader)> = self
            .connections
            .inputs
            .iter()
            .map(|(local, header)| (*local, *header))
            .collect();
        for (local, header) in couplings {
            if let Some(value) = received.get(&header) {
                let name = self
                    .type_description
                    .variable(local)
                    .map(|v| v.name.clone())
                    .unwrap_or_default();
                self.set_scalar(local, &name, value.clone())?;
            }
        }
        Ok(())
    }

    fn set_scalar(&mut self, id: VariableId, name: &str, value: ScalarValue) -> Result<()> {
        let declared = self
            .type_description
            .variable(id)
            .map(|v| v.data_type)
            .ok_or_else(|| Error::Protocol(format!("unknown variable ID {id}")))?;
        if declared != value.data_type() {
            return Err(Error::Protocol(format!(
                "cannot assign a {} value to variable {name} of type {declared}",
                value.data_type()
            )));
        }
        let accepted = {
            let result = match &value {
                ScalarValue::Real(v) => self.instance.set_real_variables(&[id], &[*v]),
                ScalarValue::Integer(v) => self.instance.set_integer_variables(&[id], &[*v]),
                ScalarValue::Boolean(v) => self.instance.set_boolean_variables(&[id], &[*v]),
                ScalarValue::String(v) => {
                    self.instance.set_string_variables(&[id], &[v.clone()])
                }
            };
            match result {
                Ok(accepted) => accepted,
                Err(e) => return self.broken_by(e),
            }
        };
        if !accepted {
            return Err(Error::Protocol(format!(
                "failed to set the value of variable {name}"
            )));
        }
        Ok(())
    }

    fn read_scalar(&self, id: VariableId, data_type: DataType) -> Result<ScalarValue> {
        match data_type {
            DataType::Real => {
                let mut v = [0.0];
                self.instance.get_real_variables(&[id], &mut v)?;
                Ok(ScalarValue::Real(v[0]))
            }
            DataType::Integer => {
                let mut v = [0];
                self.instance.get_integer_variables(&[id], &mut v)?;
                Ok(ScalarValue::Integer(v[0]))
            }
            DataType::Boolean => {
                let mut v = [false];
                self.instance.get_boolean_variables(&[id], &mut v)?;
                Ok(ScalarValue::Boolean(v[0]))
            }
            DataType::String => {
                let mut v = [String::new()];
                self.instance.get_string_variables(&[id], &mut v)?;
                Ok(ScalarValue::String(v[0].clone()))
            }
        }
    }
}

impl rfsm::SlaveHandler for SlaveAgent {
    fn handle_event(
        &mut self,
        reactor: &Reactor,
        event_id: &[u8],
        event_data: &[u8],
    ) -> Result<(u16, Vec<u8>, Vec<u8>)> {
        if let Some(timer) = self.inactivity_timer {
            let _ = reactor.restart_timer_interval(timer);
        }
        if self.broken {
            return Err(Error::InstanceBroken(
                "instance has failed, slave is unusable".into(),
            ));
        }
        if event_id == event::TERMINATE {
            return self.handle_terminate(reactor);
        }
        match (self.state, event_id) {
            (AgentState::Connecting, id) if id == event::HELLO => self.handle_hello(),
            (AgentState::Connecting, id) if id == event::SETUP => self.handle_setup(event_data),
            (AgentState::Init, id) if id == event::DESCRIBE => self.handle_describe(),
            (AgentState::Init, id) if id == event::SET_VAR => self.handle_set_var(event_data),
            (AgentState::Init, id) if id == event::GET_VAR => self.handle_get_var(event_data),
            (AgentState::Init, id) if id == event::SET_PEERS => {
                self.handle_set_peers(event_data)
            }
            (AgentState::Init, id) if id == event::START_SIM => self.handle_start_sim(),
            (AgentState::Ready, id) if id == event::STEP => self.handle_step(event_data),
            (AgentState::Published, id) if id == event::ACCEPT_STEP => {
                self.handle_accept_step()
            }
            (_, id) => Err(self.unexpected(id)),
        }
    }
}

/// Hosts one slave: a reactor, the RFSM server, and the agent.
///
/// Typically created inside a dedicated process (or thread in tests);
/// [`SlaveRunner::run`] blocks until the master sends TERMINATE, the
/// inactivity timeout expires, or an error occurs.
pub struct SlaveRunner {
    reactor: Reactor,
    slave: rfsm::Slave,
    agent: Rc<RefCell<SlaveAgent>>,
}

impl SlaveRunner {
    /// Binds the control and data endpoints and wires everything together.
    ///
    /// With `inactivity_timeout` set, the runner aborts with
    /// [`Error::Timeout`] if no control message arrives within the window.
    pub fn new(
        context: &zmq::Context,
        instance: Box<dyn Instance>,
        control_endpoint: &str,
        data_pub_endpoint: &str,
        inactivity_timeout: Option<Duration>,
    ) -> Result<Self> {
        let reactor = Reactor::new();
        let agent = Rc::new(RefCell::new(SlaveAgent::new(
            context,
            instance,
            data_pub_endpoint,
        )?));
        let slave = rfsm::Slave::new(
            &reactor,
            context,
            control_endpoint,
            Rc::clone(&agent) as Rc<RefCell<dyn rfsm::SlaveHandler>>,
        )?;
        tracing::debug!(
            control = %slave.bound_endpoint()?,
            data = %agent.borrow().bound_data_endpoint()?,
            "slave bound"
        );
        if let Some(timeout) = inactivity_timeout {
            let timer = reactor.add_timer(timeout, -1, move |_, _| {
                Err(Error::Timeout(
                    "lost contact with master".into(),
                ))
            })?;
            agent.borrow_mut().inactivity_timer = Some(timer);
        }
        Ok(Self {
            reactor,
            slave,
            agent,
        })
    }

    /// The concrete control endpoint (wildcards resolved).
    pub fn bound_control_endpoint(&self) -> Result<String> {
        self.slave.bound_endpoint()
    }

    /// The concrete data publisher endpoint (wildcards resolved).
    pub fn bound_data_endpoint(&self) -> Result<String> {
        self.agent.borrow().bound_data_endpoint()
    }

    /// The agent's current state; mainly for inspection in tests.
    pub fn agent_state(&self) -> AgentState {
        self.agent.borrow().state()
    }

    /// Serves control events until TERMINATE or failure.
    pub fn run(&self) -> Result<()> {
        self.reactor.run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::testing::{real_input, real_output, MemoryInstance};
    use crate::rfsm::SlaveHandler;

    fn test_agent() -> SlaveAgent {
        let context = zmq::Context::new();
        let endpoint = format!("inproc://agent_test_{}", uuid::Uuid::new_v4().simple());
        let instance =
            MemoryInstance::new("mem", vec![real_output(0, "out"), real_input(1, "in")]);
        SlaveAgent::new(&context, Box::new(instance), &endpoint).unwrap()
    }

    fn setup_data() -> Vec<u8> {
        wire::encode(&wire::SetupData {
            slave_id: 1,
            slave_name: "a".into(),
            execution_name: "test".into(),
            start_time: 0.0,
            stop_time: None,
            adaptive_step_size: false,
            relative_tolerance: 1.0,
            variable_recv_timeout_ms: Some(200),
        })
        .unwrap()
    }

    #[test]
    fn test_lifecycle_transitions() {
        let reactor = Reactor::new();
        let mut agent = test_agent();
        assert_eq!(agent.state(), AgentState::Connecting);

        let (tag, id, _) = agent.handle_event(&reactor, event::HELLO, b"").unwrap();
        assert_eq!(tag, AgentState::Connecting.tag());
        assert_eq!(id, response::HELLO);

        agent.handle_event(&reactor, event::SETUP, &setup_data()).unwrap();
        assert_eq!(agent.state(), AgentState::Init);

        agent.handle_event(&reactor, event::START_SIM, b"").unwrap();
        assert_eq!(agent.state(), AgentState::Ready);

        // No couplings: the step runs without waiting for peers.
        let step = wire::encode(&wire::StepData {
            step_id: 0,
            time: 0.0,
            step_size: 0.1,
        })
        .unwrap();
        let (_, id, _) = agent.handle_event(&reactor, event::STEP, &step).unwrap();
        assert_eq!(id, response::OK);
        assert_eq!(agent.state(), AgentState::Published);

        agent.handle_event(&reactor, event::ACCEPT_STEP, b"").unwrap();
        assert_eq!(agent.state(), AgentState::Ready);
        assert!((agent.current_time() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_unexpected_event_is_protocol_error_without_transition() {
        let reactor = Reactor::new();
        let mut agent = test_agent();
        let result = agent.handle_event(&reactor, event::STEP, b"{}");
        assert!(matches!(result, Err(Error::Protocol(_))));
        assert_eq!(agent.state(), AgentState::Connecting);
    }

    #[test]
    fn test_terminate_accepted_in_any_state() {
        let reactor = Reactor::new();
        let mut agent = test_agent();
        let (tag, id, _) = agent.handle_event(&reactor, event::TERMINATE, b"").unwrap();
        assert_eq!(tag, AgentState::Terminated.tag());
        assert_eq!(id, response::OK);
        assert_eq!(agent.state(), AgentState::Terminated);
    }

    #[test]
    fn test_set_var_type_mismatch_rejected() {
        let reactor = Reactor::new();
        let mut agent = test_agent();
        agent.handle_event(&reactor, event::SETUP, &setup_data()).unwrap();

        let setting = wire::encode(&wire::SetVarData {
            variable: 1,
            value: Some(ScalarValue::String("oops".into())),
            connect_to: None,
        })
        .unwrap();
        let result = agent.handle_event(&reactor, event::SET_VAR, &setting);
        assert!(matches!(result, Err(Error::Protocol(_))));
        assert_eq!(agent.state(), AgentState::Init);
    }

    #[test]
    fn test_describe_reports_type_description() {
        let reactor = Reactor::new();
        let mut agent = test_agent();
        agent.handle_event(&reactor, event::SETUP, &setup_data()).unwrap();

        let (_, id, data) = agent.handle_event(&reactor, event::DESCRIBE, b"").unwrap();
        assert_eq!(id, response::OK);
        let description: crate::model::SlaveTypeDescription = wire::decode(&data).unwrap();
        assert_eq!(description.name(), "mem");
        assert_eq!(description.variables().len(), 2);
    }

    #[test]
    fn test_get_var_returns_value() {
        let reactor = Reactor::new();
        let mut agent = test_agent();
        agent.handle_event(&reactor, event::SETUP, &setup_data()).unwrap();

        let setting = wire::encode(&wire::SetVarData {
            variable: 1,
            value: Some(ScalarValue::Real(7.5)),
            connect_to: None,
        })
        .unwrap();
        agent.handle_event(&reactor, event::SET_VAR, &setting).unwrap();

        let request = wire::encode(&wire::GetVarData { variable: 1 }).unwrap();
        let (_, id, data) = agent.handle_event(&reactor, event::GET_VAR, &request).unwrap();
        assert_eq!(id, response::OK);
        let value: ScalarValue = wire::decode(&data).unwrap();
        assert_eq!(value, ScalarValue::Real(7.5));
    }

    #[test]
    fn test_step_failure_enters_step_failed() {
        let reactor = Reactor::new();
        let context = zmq::Context::new();
        let endpoint = format!("inproc://agent_fail_{}", uuid::Uuid::new_v4().simple());
        let mut instance = MemoryInstance::new("mem", vec![real_output(0, "out")]);
        instance.fail_from = Some(0.0);
        let mut agent = SlaveAgent::new(&context, Box::new(instance), &endpoint).unwrap();

        agent.handle_event(&reactor, event::SETUP, &setup_data()).unwrap();
        agent.handle_event(&reactor, event::START_SIM, b"").unwrap();

        let step = wire::encode(&wire::StepData {
            step_id: 0,
            time: 0.0,
            step_size: 0.1,
        })
        .unwrap();
        let (tag, id, _) = agent.handle_event(&reactor, event::STEP, &step).unwrap();
        assert_eq!(tag, AgentState::StepFailed.tag());
        assert_eq!(id, response::STEP_FAILED);

        // Only TERMINATE is accepted now.
        let result = agent.handle_event(&reactor, event::ACCEPT_STEP, b"");
        assert!(matches!(result, Err(Error::Protocol(_))));
        agent.handle_event(&reactor, event::TERMINATE, b"").unwrap();
        assert_eq!(agent.state(), AgentState::Terminated);
    }
}
