//! Offline validation of a simulation graph.
//!
//! The [`ModelBuilder`] collects slaves, initial variable values, and
//! variable connections, validating every mutation against the slave type
//! descriptions.  A failed mutation leaves the builder untouched and
//! usable.  [`ModelBuilder::build`] freezes the result into an immutable
//! [`Model`] that the execution controller consumes.

use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::model::{
    is_valid_slave_name, variables_by_name, Causality, QualifiedVariableName, ScalarValue,
    SlaveTypeDescription, VariableDescription,
};

/// Builds and validates a simulation graph.
///
/// Slave types are interned by UUID, so adding many slaves of the same type
/// shares one description.
#[derive(Default)]
pub struct ModelBuilder {
    type_cache: HashMap<String, Rc<SlaveTypeDescription>>,
    slaves: HashMap<String, Rc<SlaveTypeDescription>>,
    initial_values: HashMap<QualifiedVariableName, ScalarValue>,
    /// target -> source; keying by target enforces one source per target.
    connections: HashMap<QualifiedVariableName, QualifiedVariableName>,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a slave under `name`.
    ///
    /// The name must be a valid identifier (non-empty, alphanumeric or
    /// underscore, not starting with a digit) and not already in use.
    pub fn add_slave(&mut self, name: &str, ty: &SlaveTypeDescription) -> Result<()> {
        if !is_valid_slave_name(name) {
            return Err(Error::InvalidArgument(format!(
                "not a valid slave name: {name}"
            )));
        }
        if self.slaves.contains_key(name) {
            return Err(Error::ModelConstruction(format!(
                "slave name already in use: {name}"
            )));
        }
        let interned = self
            .type_cache
            .entry(ty.uuid().to_string())
            .or_insert_with(|| Rc::new(ty.clone()));
        self.slaves.insert(name.to_string(), Rc::clone(interned));
        Ok(())
    }

    /// Assigns an initial value, replacing any previous one.
    ///
    /// The variable must exist and the value's runtime type must match its
    /// declared type.
    pub fn set_initial_value(
        &mut self,
        variable: &QualifiedVariableName,
        value: ScalarValue,
    ) -> Result<()> {
        let description = self.variable_description(variable)?;
        if description.data_type != value.data_type() {
            return Err(Error::ModelConstruction(format!(
                "attempted to assign a value of type {} to variable {variable} which has type {}",
                value.data_type(),
                description.data_type
            )));
        }
        self.initial_values.insert(variable.clone(), value);
        Ok(())
    }

    /// The initial value assigned to `variable`.
    ///
    /// Fails with [`Error::EntityNotFound`] if no value has been set; there
    /// is no fallback to a declared default.
    pub fn initial_value(&self, variable: &QualifiedVariableName) -> Result<&ScalarValue> {
        self.initial_values.get(variable).ok_or_else(|| {
            Error::EntityNotFound(format!("no initial value set for variable {variable}"))
        })
    }

    /// Removes the initial value assigned to `variable`, if any.
    pub fn reset_initial_value(&mut self, variable: &QualifiedVariableName) {
        self.initial_values.remove(variable);
    }

    /// Connects `source` to `target`.
    ///
    /// The source must be an output or calculated parameter, the target an
    /// input (or a parameter, when fed by a calculated parameter), the
    /// data types must be equal, the source must not vary more often than
    /// the target admits, and the target must not already be connected.
    pub fn connect(
        &mut self,
        source: &QualifiedVariableName,
        target: &QualifiedVariableName,
    ) -> Result<()> {
        let source_var = self.variable_description(source)?.clone();
        let target_var = self.variable_description(target)?.clone();

        let connection_error = |details: String| {
            Error::ModelConstruction(format!(
                "cannot connect variable {source} to {target}: {details}"
            ))
        };

        match source_var.causality {
            Causality::Output => {
                if target_var.causality != Causality::Input {
                    return Err(connection_error(
                        "an output variable may only be connected to an input variable".into(),
                    ));
                }
            }
            Causality::CalculatedParameter => {
                if target_var.causality != Causality::Input
                    && target_var.causality != Causality::Parameter
                {
                    return Err(connection_error(
                        "a calculated parameter may only be connected to a parameter or input variable"
                            .into(),
                    ));
                }
            }
            _ => {
                return Err(connection_error(
                    "only output variables and calculated parameters may be used as connection sources"
                        .into(),
                ));
            }
        }

        if source_var.data_type != target_var.data_type {
            return Err(connection_error(format!(
                "a variable of type {} cannot be connected to a variable of type {}",
                source_var.data_type, target_var.data_type
            )));
        }

        if source_var.variability.rank() > target_var.variability.rank() {
            return Err(connection_error(format!(
                "a {} variable cannot drive a {} variable",
                source_var.variability, target_var.variability
            )));
        }

        if self.connections.contains_key(target) {
            return Err(Error::ModelConstruction(format!(
                "variable already connected: {target}"
            )));
        }
        self.connections.insert(target.clone(), source.clone());
        Ok(())
    }

    /// All connections as (source, target) pairs, ordered by target name.
    pub fn connections(&self) -> Vec<(QualifiedVariableName, QualifiedVariableName)> {
        let mut result: Vec<_> = self
            .connections
            .iter()
            .map(|(target, source)| (source.clone(), target.clone()))
            .collect();
        result.sort_by(|a, b| a.1.cmp(&b.1));
        result
    }

    /// Every declared input of every added slave that is not the target of
    /// any connection, in name order.
    pub fn unconnected_inputs(&self) -> Vec<QualifiedVariableName> {
        let mut result = Vec::new();
        for (slave_name, ty) in &self.slaves {
            for variable in ty.variables() {
                if variable.causality != Causality::Input {
                    continue;
                }
                let qvn = QualifiedVariableName::new(slave_name.clone(), variable.name.clone());
                if let Ok(qvn) = qvn {
                    if !self.connections.contains_key(&qvn) {
                        result.push(qvn);
                    }
                }
            }
        }
        result.sort();
        result
    }

    /// Freezes the builder into an immutable [`Model`].
    pub fn build(self) -> Model {
        Model {
            slaves: self.slaves,
            initial_values: self.initial_values,
            connections: self.connections,
        }
    }

    fn variable_description(
        &self,
        variable: &QualifiedVariableName,
    ) -> Result<&VariableDescription> {
        let ty = self.slaves.get(variable.slave()).ok_or_else(|| {
            Error::EntityNotFound(format!("unknown slave name: {}", variable.slave()))
        })?;
        variables_by_name(ty)
            .get(variable.variable())
            .copied()
            .ok_or_else(|| Error::EntityNotFound(format!("unknown variable: {variable}")))
    }
}

/// An immutable, validated simulation graph.
pub struct Model {
    slaves: HashMap<String, Rc<SlaveTypeDescription>>,
    initial_values: HashMap<QualifiedVariableName, ScalarValue>,
    connections: HashMap<QualifiedVariableName, QualifiedVariableName>,
}

impl Model {
    /// The names of all slaves, sorted.
    pub fn slave_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.slaves.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// The type description of the named slave.
    pub fn slave_type(&self, name: &str) -> Option<&SlaveTypeDescription> {
        self.slaves.get(name).map(Rc::as_ref)
    }

    /// All assigned initial values.
    pub fn initial_values(
        &self,
    ) -> impl Iterator<Item = (&QualifiedVariableName, &ScalarValue)> {
        self.initial_values.iter()
    }

    /// All connections as (target, source) pairs.
    pub fn connections(
        &self,
    ) -> impl Iterator<Item = (&QualifiedVariableName, &QualifiedVariableName)> {
        self.connections.iter()
    }
}
