//! End-to-end tests: a master executes slaves running in their own threads,
//! connected over in-process endpoints, through whole step cycles.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use lockstep::agent::{AgentState, SlaveRunner};
use lockstep::{
    Causality, DataType, Error, Execution, ExecutionOptions, Instance, ModelBuilder,
    QualifiedVariableName, Result, ScalarValue, SlaveLocator, SlaveTypeDescription, StepResult,
    TimeDuration, TimePoint, Variability, VariableDescription, VariableId,
};

/// Step log shared between a slave thread and the test body.
#[derive(Default)]
struct Telemetry {
    steps: Mutex<Vec<(TimePoint, TimeDuration)>>,
    /// Value of the input variable (id 1) at each `do_step`.
    inputs_seen: Mutex<Vec<f64>>,
}

/// A real-valued test model.  Output variable 0 (if declared) is
/// incremented by one on every successful step; input variable 1 (if
/// declared) is recorded at each step.
struct TestInstance {
    description: SlaveTypeDescription,
    values: HashMap<VariableId, f64>,
    fail_from: Option<TimePoint>,
    telemetry: Arc<Telemetry>,
}

impl TestInstance {
    fn new(description: SlaveTypeDescription, telemetry: Arc<Telemetry>) -> Self {
        let values = description.variables().iter().map(|v| (v.id, 0.0)).collect();
        Self {
            description,
            values,
            fail_from: None,
            telemetry,
        }
    }
}

impl Instance for TestInstance {
    fn type_description(&self) -> SlaveTypeDescription {
        self.description.clone()
    }

    fn setup(
        &mut self,
        _slave_name: &str,
        _execution_name: &str,
        _start_time: TimePoint,
        _stop_time: TimePoint,
        _adaptive_step_size: bool,
        _relative_tolerance: f64,
    ) -> Result<()> {
        Ok(())
    }

    fn start_simulation(&mut self) -> Result<()> {
        Ok(())
    }

    fn end_simulation(&mut self) -> Result<()> {
        Ok(())
    }

    fn do_step(&mut self, current_t: TimePoint, delta_t: TimeDuration) -> Result<bool> {
        if let Some(fail_from) = self.fail_from {
            if current_t >= fail_from - 1e-12 {
                return Ok(false);
            }
        }
        self.telemetry.steps.lock().unwrap().push((current_t, delta_t));
        if let Some(input) = self.values.get(&1) {
            if self.description.variable(1).is_some() {
                self.telemetry.inputs_seen.lock().unwrap().push(*input);
            }
        }
        if self.description.variable(0).is_some() {
            *self.values.get_mut(&0).unwrap() += 1.0;
        }
        Ok(true)
    }

    fn get_real_variables(&self, variables: &[VariableId], values: &mut [f64]) -> Result<()> {
        for (id, out) in variables.iter().zip(values.iter_mut()) {
            *out = *self
                .values
                .get(id)
                .ok_or_else(|| Error::InstanceBroken(format!("no variable {id}")))?;
        }
        Ok(())
    }

    fn get_integer_variables(&self, _: &[VariableId], _: &mut [i32]) -> Result<()> {
        Err(Error::InstanceBroken("no integer variables".into()))
    }

    fn get_boolean_variables(&self, _: &[VariableId], _: &mut [bool]) -> Result<()> {
        Err(Error::InstanceBroken("no boolean variables".into()))
    }

    fn get_string_variables(&self, _: &[VariableId], _: &mut [String]) -> Result<()> {
        Err(Error::InstanceBroken("no string variables".into()))
    }

    fn set_real_variables(&mut self, variables: &[VariableId], values: &[f64]) -> Result<bool> {
        for (id, v) in variables.iter().zip(values.iter()) {
            self.values.insert(*id, *v);
        }
        Ok(true)
    }

    fn set_integer_variables(&mut self, _: &[VariableId], _: &[i32]) -> Result<bool> {
        Err(Error::InstanceBroken("no integer variables".into()))
    }

    fn set_boolean_variables(&mut self, _: &[VariableId], _: &[bool]) -> Result<bool> {
        Err(Error::InstanceBroken("no boolean variables".into()))
    }

    fn set_string_variables(&mut self, _: &[VariableId], _: &[String]) -> Result<bool> {
        Err(Error::InstanceBroken("no string variables".into()))
    }
}

fn source_type() -> SlaveTypeDescription {
    SlaveTypeDescription::new(
        "source",
        "0a0a0a0a-1111-2222-3333-444444444444",
        "emits a counting output",
        "tests",
        "1.0",
        vec![VariableDescription::new(
            0,
            "out",
            DataType::Real,
            Causality::Output,
            Variability::Continuous,
        )],
    )
    .unwrap()
}

fn sink_type() -> SlaveTypeDescription {
    SlaveTypeDescription::new(
        "sink",
        "0b0b0b0b-1111-2222-3333-444444444444",
        "consumes one input",
        "tests",
        "1.0",
        vec![VariableDescription::new(
            1,
            "in",
            DataType::Real,
            Causality::Input,
            Variability::Continuous,
        )],
    )
    .unwrap()
}

struct SpawnedSlave {
    locator: SlaveLocator,
    handle: thread::JoinHandle<()>,
}

fn spawn_slave(
    context: &zmq::Context,
    description: SlaveTypeDescription,
    telemetry: Arc<Telemetry>,
    fail_from: Option<TimePoint>,
    tag: &str,
) -> SpawnedSlave {
    let context = context.clone();
    let control = format!("inproc://step_cycle_{tag}_ctl");
    let data = format!("inproc://step_cycle_{tag}_data");
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let mut instance = TestInstance::new(description, telemetry);
        instance.fail_from = fail_from;
        let runner =
            SlaveRunner::new(&context, Box::new(instance), &control, &data, None).unwrap();
        tx.send((
            runner.bound_control_endpoint().unwrap(),
            runner.bound_data_endpoint().unwrap(),
        ))
        .unwrap();
        runner.run().unwrap();
        assert_eq!(runner.agent_state(), AgentState::Terminated);
    });
    let (control, data) = rx.recv().unwrap();
    SpawnedSlave {
        locator: SlaveLocator::new(control, data),
        handle,
    }
}

fn qvn(s: &str) -> QualifiedVariableName {
    s.parse().unwrap()
}

fn options() -> ExecutionOptions {
    ExecutionOptions {
        name: "step_cycle".into(),
        step_size: 0.1,
        max_time: Some(100.0),
        comm_timeout_ms: 5000,
        variable_recv_timeout_ms: 5000,
        ..Default::default()
    }
}

#[test]
fn two_slaves_exchange_values_in_lockstep() {
    let context = zmq::Context::new();
    let source_log = Arc::new(Telemetry::default());
    let sink_log = Arc::new(Telemetry::default());

    let source = spawn_slave(&context, source_type(), Arc::clone(&source_log), None, "xchg_a");
    let sink = spawn_slave(&context, sink_type(), Arc::clone(&sink_log), None, "xchg_b");

    let mut builder = ModelBuilder::new();
    builder.add_slave("a", &source_type()).unwrap();
    builder.add_slave("b", &sink_type()).unwrap();
    builder.connect(&qvn("a.out"), &qvn("b.in")).unwrap();
    builder
        .set_initial_value(&qvn("a.out"), ScalarValue::Real(42.0))
        .unwrap();
    let model = builder.build();

    let mut locators = HashMap::new();
    locators.insert("a".to_string(), source.locator.clone());
    locators.insert("b".to_string(), sink.locator.clone());

    let mut execution = Execution::new(&context, &model, options(), &locators).unwrap();

    // Initialisation retrieved both slave descriptions over the protocol.
    let described: Vec<&str> = execution
        .slave_descriptions()
        .iter()
        .map(|d| d.type_description.name())
        .collect();
    assert_eq!(described, vec!["source", "sink"]);

    assert_eq!(execution.step().unwrap(), StepResult::Complete);
    execution.accept_step().unwrap();
    assert!((execution.current_time() - 0.1).abs() < 1e-12);

    assert_eq!(execution.step().unwrap(), StepResult::Complete);
    execution.accept_step().unwrap();
    assert!((execution.current_time() - 0.2).abs() < 1e-12);

    assert_eq!(execution.stats().steps_completed, 2);
    assert_eq!(execution.stats().steps_accepted, 2);
    let stats = execution.export_stats();
    assert_eq!(stats["execution"]["slave_count"], 2);
    assert_eq!(stats["steps"]["completed"], 2);

    execution.terminate().unwrap();
    source.handle.join().unwrap();
    sink.handle.join().unwrap();

    // Both slaves performed the same two steps.
    let expected = vec![(0.0, 0.1), (0.1, 0.1)];
    assert_eq!(*source_log.steps.lock().unwrap(), expected);
    assert_eq!(*sink_log.steps.lock().unwrap(), expected);

    // Jacobi coupling: at step 1 the sink saw the source's initial output;
    // at step 2 it saw the value computed during step 1.
    assert_eq!(*sink_log.inputs_seen.lock().unwrap(), vec![42.0, 43.0]);
}

#[test]
fn step_failure_terminates_the_execution() {
    let context = zmq::Context::new();
    let log = Arc::new(Telemetry::default());

    // The slave refuses steps starting at t = 0.2.
    let slave = spawn_slave(&context, source_type(), Arc::clone(&log), Some(0.2), "fail");

    let mut builder = ModelBuilder::new();
    builder.add_slave("a", &source_type()).unwrap();
    let model = builder.build();

    let mut locators = HashMap::new();
    locators.insert("a".to_string(), slave.locator.clone());

    let mut execution = Execution::new(&context, &model, options(), &locators).unwrap();

    let result = execution.run_to(1.0);
    assert!(matches!(result, Err(Error::InstanceBroken(_))));
    assert!(execution.terminated());

    slave.handle.join().unwrap();
    assert_eq!(*log.steps.lock().unwrap(), vec![(0.0, 0.1), (0.1, 0.1)]);

    // The terminated execution refuses further stepping.
    assert!(execution.step().is_err());
}
