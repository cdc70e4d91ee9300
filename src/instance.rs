//! The slave instance interface.
//!
//! An [`Instance`] is the black-box model a slave wraps: a solver exposing
//! typed variables and a fixed-step time advance.  The call sequence is:
//!
//!  1. `setup()` — configure and enter initialisation mode;
//!  2. `get_*`/`set_*` — variable initialisation, any order, repeatedly;
//!  3. `start_simulation()` — leave initialisation mode;
//!  4. `do_step()` interleaved with `get_*`/`set_*` — simulation;
//!  5. `end_simulation()`.
//!
//! Any operation may fail; a failed instance is considered broken and no
//! further calls are made to it.

use std::fs::File;
use std::io::{BufWriter, Write};

use crate::error::{Error, Result};
use crate::model::{DataType, SlaveTypeDescription};
use crate::types::{TimeDuration, TimePoint, VariableId};

/// A black-box simulation model with a uniform variable interface.
///
/// The `get_*`/`set_*` operations take matched-length slices of variable
/// IDs and values.  The setters return `Ok(false)` when one or more values
/// were rejected as invalid (e.g. out of range); hard failures are errors.
pub trait Instance {
    /// Describes this slave type, including all its variables.
    fn type_description(&self) -> SlaveTypeDescription;

    /// Configures the instance and enters initialisation mode.
    ///
    /// `start_time` and `stop_time` delimit the interval inside which
    /// `do_step` will be called; `stop_time` may be [`crate::types::ETERNITY`].
    /// `relative_tolerance` is only meaningful when `adaptive_step_size` is
    /// set.
    fn setup(
        &mut self,
        slave_name: &str,
        execution_name: &str,
        start_time: TimePoint,
        stop_time: TimePoint,
        adaptive_step_size: bool,
        relative_tolerance: f64,
    ) -> Result<()>;

    /// Ends initialisation mode and starts the simulation.
    fn start_simulation(&mut self) -> Result<()>;

    /// Ends the simulation run.
    fn end_simulation(&mut self) -> Result<()>;

    /// Performs the time step starting at `current_t` with length `delta_t`.
    ///
    /// Returns `Ok(false)` if the calculations could not be carried out
    /// because the step was too long.  Retrying a failed step is not
    /// supported; the agent treats `false` as terminal for the step.
    fn do_step(&mut self, current_t: TimePoint, delta_t: TimeDuration) -> Result<bool>;

    fn get_real_variables(&self, variables: &[VariableId], values: &mut [f64]) -> Result<()>;
    fn get_integer_variables(&self, variables: &[VariableId], values: &mut [i32]) -> Result<()>;
    fn get_boolean_variables(&self, variables: &[VariableId], values: &mut [bool]) -> Result<()>;
    fn get_string_variables(&self, variables: &[VariableId], values: &mut [String]) -> Result<()>;

    fn set_real_variables(&mut self, variables: &[VariableId], values: &[f64]) -> Result<bool>;
    fn set_integer_variables(&mut self, variables: &[VariableId], values: &[i32]) -> Result<bool>;
    fn set_boolean_variables(&mut self, variables: &[VariableId], values: &[bool]) -> Result<bool>;
    fn set_string_variables(&mut self, variables: &[VariableId], values: &[String]) -> Result<bool>;
}

/// Decorator that logs every variable of the wrapped instance to a CSV
/// file, one row per successful time step.
///
/// The file is created during `setup()` as
/// `{prefix}{execution}_{slave}.csv`, falling back to the type name plus a
/// random suffix when no slave name was assigned.
pub struct LoggingInstance {
    inner: Box<dyn Instance>,
    output_file_prefix: String,
    writer: Option<BufWriter<File>>,
}

impl LoggingInstance {
    pub fn new(inner: Box<dyn Instance>, output_file_prefix: impl Into<String>) -> Self {
        let mut prefix = output_file_prefix.into();
        if prefix.is_empty() {
            prefix = "./".to_string();
        }
        Self {
            inner,
            output_file_prefix: prefix,
            writer: None,
        }
    }

    fn write_row(&mut self, time: TimePoint) -> Result<()> {
        let description = self.inner.type_description();
        let mut row = format!("{time}");
        for variable in description.variables() {
            let id = [variable.id];
            let cell = match variable.data_type {
                DataType::Real => {
                    let mut v = [0.0];
                    self.inner.get_real_variables(&id, &mut v)?;
                    v[0].to_string()
                }
                DataType::Integer => {
                    let mut v = [0];
                    self.inner.get_integer_variables(&id, &mut v)?;
                    v[0].to_string()
                }
                DataType::Boolean => {
                    let mut v = [false];
                    self.inner.get_boolean_variables(&id, &mut v)?;
                    v[0].to_string()
                }
                DataType::String => {
                    let mut v = [String::new()];
                    self.inner.get_string_variables(&id, &mut v)?;
                    v[0].clone()
                }
            };
            row.push(',');
            row.push_str(&cell);
        }
        row.push('\n');
        if let Some(writer) = self.writer.as_mut() {
            writer.write_all(row.as_bytes())?;
        }
        Ok(())
    }
}

impl Instance for LoggingInstance {
    fn type_description(&self) -> SlaveTypeDescription {
        self.inner.type_description()
    }

    fn setup(
        &mut self,
        slave_name: &str,
        execution_name: &str,
        start_time: TimePoint,
        stop_time: TimePoint,
        adaptive_step_size: bool,
        relative_tolerance: f64,
    ) -> Result<()> {
        self.inner.setup(
            slave_name,
            execution_name,
            start_time,
            stop_time,
            adaptive_step_size,
            relative_tolerance,
        )?;

        let execution_part = if execution_name.is_empty() {
            "execution".to_string()
        } else {
            execution_name.to_string()
        };
        let slave_part = if slave_name.is_empty() {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!("{}_{}", self.inner.type_description().name(), &suffix[..6])
        } else {
            slave_name.to_string()
        };
        let file_name = format!(
            "{}{}_{}.csv",
            self.output_file_prefix, execution_part, slave_part
        );

        tracing::debug!(file = %file_name, "opening variable log");
        let file = File::create(&file_name)
            .map_err(|e| Error::Io(std::io::Error::new(e.kind(), format!("{file_name}: {e}"))))?;
        let mut writer = BufWriter::new(file);

        let mut header = String::from("Time");
        for variable in self.inner.type_description().variables() {
            header.push(',');
            header.push_str(&variable.name);
        }
        header.push('\n');
        writer.write_all(header.as_bytes())?;
        self.writer = Some(writer);
        Ok(())
    }

    fn start_simulation(&mut self) -> Result<()> {
        self.inner.start_simulation()
    }

    fn end_simulation(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        self.inner.end_simulation()
    }

    fn do_step(&mut self, current_t: TimePoint, delta_t: TimeDuration) -> Result<bool> {
        let ok = self.inner.do_step(current_t, delta_t)?;
        if ok {
            self.write_row(current_t + delta_t)?;
        }
        Ok(ok)
    }

    fn get_real_variables(&self, variables: &[VariableId], values: &mut [f64]) -> Result<()> {
        self.inner.get_real_variables(variables, values)
    }

    fn get_integer_variables(&self, variables: &[VariableId], values: &mut [i32]) -> Result<()> {
        self.inner.get_integer_variables(variables, values)
    }

    fn get_boolean_variables(&self, variables: &[VariableId], values: &mut [bool]) -> Result<()> {
        self.inner.get_boolean_variables(variables, values)
    }

    fn get_string_variables(&self, variables: &[VariableId], values: &mut [String]) -> Result<()> {
        self.inner.get_string_variables(variables, values)
    }

    fn set_real_variables(&mut self, variables: &[VariableId], values: &[f64]) -> Result<bool> {
        self.inner.set_real_variables(variables, values)
    }

    fn set_integer_variables(&mut self, variables: &[VariableId], values: &[i32]) -> Result<bool> {
        self.inner.set_integer_variables(variables, values)
    }

    fn set_boolean_variables(&mut self, variables: &[VariableId], values: &[bool]) -> Result<bool> {
        self.inner.set_boolean_variables(variables, values)
    }

    fn set_string_variables(&mut self, variables: &[VariableId], values: &[String]) -> Result<bool> {
        self.inner.set_string_variables(variables, values)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{real_input, real_output, MemoryInstance};
    use super::*;

    #[test]
    fn test_memory_instance_round_trip() {
        let mut instance = MemoryInstance::new("mem", vec![real_output(0, "out"), real_input(1, "in")]);
        assert!(instance.set_real_variables(&[0], &[4.5]).unwrap());
        let mut out = [0.0];
        instance.get_real_variables(&[0], &mut out).unwrap();
        assert_eq!(out[0], 4.5);
    }

    #[test]
    fn test_logging_instance_writes_header_and_rows() {
        let dir = std::env::temp_dir();
        let prefix = format!(
            "{}/lockstep_log_{}_",
            dir.display(),
            uuid::Uuid::new_v4().simple()
        );
        let instance = MemoryInstance::new("mem", vec![real_output(0, "out")]);
        let mut logging = LoggingInstance::new(Box::new(instance), prefix.clone());

        logging.setup("slave1", "exec1", 0.0, 1.0, false, 1.0).unwrap();
        logging.start_simulation().unwrap();
        logging.set_real_variables(&[0], &[2.0]).unwrap();
        assert!(logging.do_step(0.0, 0.5).unwrap());
        logging.end_simulation().unwrap();

        let path = format!("{prefix}exec1_slave1.csv");
        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next(), Some("Time,out"));
        assert_eq!(lines.next(), Some("0.5,2"));
        std::fs::remove_file(&path).ok();
    }
}
