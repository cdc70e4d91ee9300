//! Two coupled tanks, co-simulated in lock-step.
//!
//! The upper tank drains proportionally to its level; its outflow feeds the
//! lower tank.  Each tank runs as a slave in its own thread (its own
//! reactor, control endpoint, and data publisher), and the master drives
//! them through the step loop.  Each slave writes a CSV log of its
//! variables next to the working directory.
//!
//! Run with: `cargo run --example coupled_tanks`

use std::collections::HashMap;
use std::sync::mpsc;
use std::thread;

use lockstep::agent::SlaveRunner;
use lockstep::{
    Causality, DataType, Execution, ExecutionOptions, Instance, LoggingInstance, ModelBuilder,
    Result, ScalarValue, SlaveLocator, SlaveTypeDescription, TimeDuration, TimePoint, Variability,
    VariableDescription, VariableId,
};

const INFLOW: VariableId = 0;
const OUTFLOW: VariableId = 1;
const LEVEL: VariableId = 2;

/// A water tank with one inflow, one level state, and a level-proportional
/// outflow.
struct Tank {
    drain_coefficient: f64,
    inflow: f64,
    level: f64,
}

impl Tank {
    fn new(drain_coefficient: f64) -> Self {
        Self {
            drain_coefficient,
            inflow: 0.0,
            level: 0.0,
        }
    }

    fn outflow(&self) -> f64 {
        self.drain_coefficient * self.level
    }
}

impl Instance for Tank {
    fn type_description(&self) -> SlaveTypeDescription {
        SlaveTypeDescription::new(
            "tank",
            "6b1e2a4c-55a0-4aeb-9d3e-52b6f1a7c901",
            "A single tank with level-proportional outflow",
            "lockstep demos",
            "1.0",
            vec![
                VariableDescription::new(INFLOW, "inflow", DataType::Real, Causality::Input, Variability::Continuous),
                VariableDescription::new(OUTFLOW, "outflow", DataType::Real, Causality::Output, Variability::Continuous),
                VariableDescription::new(LEVEL, "level", DataType::Real, Causality::Local, Variability::Continuous),
            ],
        )
        .expect("static type description is valid")
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

    fn do_step(&mut self, _current_t: TimePoint, delta_t: TimeDuration) -> Result<bool> {
        // Explicit Euler; the fixed step is small enough for this demo.
        self.level += delta_t * (self.inflow - self.outflow());
        Ok(true)
    }

    fn get_real_variables(&self, variables: &[VariableId], values: &mut [f64]) -> Result<()> {
        for (id, out) in variables.iter().zip(values.iter_mut()) {
            *out = match *id {
                INFLOW => self.inflow,
                OUTFLOW => self.outflow(),
                LEVEL => self.level,
                other => {
                    return Err(lockstep::Error::InstanceBroken(format!(
                        "no variable {other}"
                    )))
                }
            };
        }
        Ok(())
    }

    fn get_integer_variables(&self, _: &[VariableId], _: &mut [i32]) -> Result<()> {
        Err(lockstep::Error::InstanceBroken("no integer variables".into()))
    }

    fn get_boolean_variables(&self, _: &[VariableId], _: &mut [bool]) -> Result<()> {
        Err(lockstep::Error::InstanceBroken("no boolean variables".into()))
    }

    fn get_string_variables(&self, _: &[VariableId], _: &mut [String]) -> Result<()> {
        Err(lockstep::Error::InstanceBroken("no string variables".into()))
    }

    fn set_real_variables(&mut self, variables: &[VariableId], values: &[f64]) -> Result<bool> {
        for (id, value) in variables.iter().zip(values.iter()) {
            match *id {
                INFLOW => self.inflow = *value,
                LEVEL => self.level = *value,
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    fn set_integer_variables(&mut self, _: &[VariableId], _: &[i32]) -> Result<bool> {
        Ok(false)
    }

    fn set_boolean_variables(&mut self, _: &[VariableId], _: &[bool]) -> Result<bool> {
        Ok(false)
    }

    fn set_string_variables(&mut self, _: &[VariableId], _: &[String]) -> Result<bool> {
        Ok(false)
    }
}

fn spawn_tank(context: &zmq::Context, tag: &str, drain_coefficient: f64) -> (SlaveLocator, thread::JoinHandle<Result<()>>) {
    let context = context.clone();
    let control = format!("inproc://tanks_{tag}_ctl");
    let data = format!("inproc://tanks_{tag}_data");
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || -> Result<()> {
        let instance = LoggingInstance::new(Box::new(Tank::new(drain_coefficient)), "./");
        let runner = SlaveRunner::new(&context, Box::new(instance), &control, &data, None)?;
        tx.send((
            runner.bound_control_endpoint()?,
            runner.bound_data_endpoint()?,
        ))
        .ok();
        runner.run()
    });
    let (control, data) = rx.recv().expect("slave failed to start");
    (SlaveLocator::new(control, data), handle)
}

fn main() -> Result<()> {
    let context = zmq::Context::new();
    let (upper_locator, upper) = spawn_tank(&context, "upper", 0.8);
    let (lower_locator, lower) = spawn_tank(&context, "lower", 0.3);

    let mut builder = ModelBuilder::new();
    let tank_type = Tank::new(0.0).type_description();
    builder.add_slave("upper", &tank_type)?;
    builder.add_slave("lower", &tank_type)?;
    builder.connect(&"upper.outflow".parse()?, &"lower.inflow".parse()?)?;
    builder.set_initial_value(&"upper.level".parse()?, ScalarValue::Real(1.0))?;
    let model = builder.build();

    let options = ExecutionOptions {
        name: "coupled_tanks".into(),
        step_size: 0.05,
        max_time: Some(5.0),
        ..Default::default()
    };

    let mut locators = HashMap::new();
    locators.insert("upper".to_string(), upper_locator);
    locators.insert("lower".to_string(), lower_locator);

    let mut execution = Execution::new(&context, &model, options, &locators)?;
    execution.run_to(5.0)?;
    execution.terminate()?;

    println!("{}", serde_json::to_string_pretty(&execution.export_stats())?);

    upper.join().expect("upper tank thread panicked")?;
    lower.join().expect("lower tank thread panicked")?;
    Ok(())
}
