//! Model description types.
//!
//! These types describe slaves and their variables: what a variable is
//! called, what it holds, whether it is an input or an output, and how
//! often it may change.  Descriptions are immutable once published by a
//! slave; the model builder validates a simulation graph against them
//! before execution starts.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{SlaveId, VariableId};

/// The data type of a variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Real,
    Integer,
    Boolean,
    String,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Real => "real",
            DataType::Integer => "integer",
            DataType::Boolean => "boolean",
            DataType::String => "string",
        };
        f.write_str(name)
    }
}

/// The causality of a variable: its role in the data flow of a simulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Causality {
    /// Set externally before the simulation starts, constant afterwards.
    Parameter,
    /// Computed by the slave, may only change between steps.
    CalculatedParameter,
    /// Set by a connection (or initial value) every step.
    Input,
    /// Computed by the slave every step.
    Output,
    /// Internal to the slave; visible but never connected.
    Local,
}

impl fmt::Display for Causality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Causality::Parameter => "parameter",
            Causality::CalculatedParameter => "calculated parameter",
            Causality::Input => "input",
            Causality::Output => "output",
            Causality::Local => "local",
        };
        f.write_str(name)
    }
}

/// The variability of a variable: how often its value may change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variability {
    Constant,
    Fixed,
    Tunable,
    Discrete,
    Continuous,
}

impl Variability {
    /// Ordering rank used for connection compatibility: a source may not
    /// vary more often than its target can absorb.
    pub(crate) fn rank(self) -> u8 {
        match self {
            Variability::Constant => 0,
            Variability::Fixed => 1,
            Variability::Tunable => 2,
            Variability::Discrete => 3,
            Variability::Continuous => 4,
        }
    }
}

impl fmt::Display for Variability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Variability::Constant => "constant",
            Variability::Fixed => "fixed",
            Variability::Tunable => "tunable",
            Variability::Discrete => "discrete",
            Variability::Continuous => "continuous",
        };
        f.write_str(name)
    }
}

/// A single typed variable value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ScalarValue {
    Real(f64),
    Integer(i32),
    Boolean(bool),
    String(String),
}

impl ScalarValue {
    /// Returns the runtime data type of this value.
    pub fn data_type(&self) -> DataType {
        match self {
            ScalarValue::Real(_) => DataType::Real,
            ScalarValue::Integer(_) => DataType::Integer,
            ScalarValue::Boolean(_) => DataType::Boolean,
            ScalarValue::String(_) => DataType::String,
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Real(v) => write!(f, "{v}"),
            ScalarValue::Integer(v) => write!(f, "{v}"),
            ScalarValue::Boolean(v) => write!(f, "{v}"),
            ScalarValue::String(v) => write!(f, "{v}"),
        }
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        ScalarValue::Real(v)
    }
}

impl From<i32> for ScalarValue {
    fn from(v: i32) -> Self {
        ScalarValue::Integer(v)
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        ScalarValue::Boolean(v)
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        ScalarValue::String(v.to_string())
    }
}

/// Describes one variable of a slave type.
///
/// Immutable once published.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariableDescription {
    /// Identifier, unique within the slave type
    pub id: VariableId,
    /// Human-readable name, unique within the slave type
    pub name: String,
    /// What the variable holds
    pub data_type: DataType,
    /// The variable's role in the data flow
    pub causality: Causality,
    /// How often the value may change
    pub variability: Variability,
}

impl VariableDescription {
    /// Creates a new variable description.
    pub fn new(
        id: VariableId,
        name: impl Into<String>,
        data_type: DataType,
        causality: Causality,
        variability: Variability,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            data_type,
            causality,
            variability,
        }
    }
}

/// Describes a slave type: its identity and its variable interface.
///
/// Immutable once constructed; the constructor enforces that the name is
/// non-empty and that variable IDs are unique.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SlaveTypeDescription {
    name: String,
    uuid: String,
    description: String,
    author: String,
    version: String,
    variables: Vec<VariableDescription>,
}

impl SlaveTypeDescription {
    /// Creates a new slave type description.
    ///
    /// Fails with [`Error::InvalidArgument`] if `name` is empty or two
    /// variables share an ID.
    pub fn new(
        name: impl Into<String>,
        uuid: impl Into<String>,
        description: impl Into<String>,
        author: impl Into<String>,
        version: impl Into<String>,
        variables: Vec<VariableDescription>,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidArgument(
                "slave type name must not be empty".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for v in &variables {
            if !seen.insert(v.id) {
                return Err(Error::InvalidArgument(format!(
                    "duplicate variable ID {} in slave type {}",
                    v.id, name
                )));
            }
        }
        Ok(Self {
            name,
            uuid: uuid.into(),
            description: description.into(),
            author: author.into(),
            version: version.into(),
            variables,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// All variables of this slave type, in declaration order.
    pub fn variables(&self) -> &[VariableDescription] {
        &self.variables
    }

    /// Looks up a variable by ID.
    pub fn variable(&self, id: VariableId) -> Option<&VariableDescription> {
        self.variables.iter().find(|v| v.id == id)
    }

    /// Looks up a variable by name.
    pub fn variable_by_name(&self, name: &str) -> Option<&VariableDescription> {
        self.variables.iter().find(|v| v.name == name)
    }
}

/// Describes one slave in an execution: its assigned ID, its name, and its
/// type.
#[derive(Clone, Debug)]
pub struct SlaveDescription {
    pub id: SlaveId,
    pub name: String,
    pub type_description: SlaveTypeDescription,
}

impl SlaveDescription {
    pub fn new(id: SlaveId, name: impl Into<String>, type_description: SlaveTypeDescription) -> Self {
        Self {
            id,
            name: name.into(),
            type_description,
        }
    }
}

/// A variable identified by slave name and variable name.
///
/// The string form is `slave.variable`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedVariableName {
    slave: String,
    variable: String,
}

impl QualifiedVariableName {
    /// Creates a qualified variable name.  Both parts must be non-empty.
    pub fn new(slave: impl Into<String>, variable: impl Into<String>) -> Result<Self> {
        let slave = slave.into();
        let variable = variable.into();
        if slave.is_empty() || variable.is_empty() {
            return Err(Error::InvalidArgument(
                "qualified variable name parts must not be empty".into(),
            ));
        }
        Ok(Self { slave, variable })
    }

    pub fn slave(&self) -> &str {
        &self.slave
    }

    pub fn variable(&self) -> &str {
        &self.variable
    }
}

impl fmt::Display for QualifiedVariableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.slave, self.variable)
    }
}

impl FromStr for QualifiedVariableName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.find('.') {
            Some(pos) if pos >= 1 && pos < s.len() - 1 => {
                QualifiedVariableName::new(&s[..pos], &s[pos + 1..])
            }
            _ => Err(Error::InvalidArgument(format!(
                "not a fully qualified variable name: {s}"
            ))),
        }
    }
}

/// Checks whether `s` is a valid slave name: non-empty, alphanumeric or
/// underscore, and not starting with a digit.
pub fn is_valid_slave_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        None => return false,
        Some(c) if c.is_ascii_digit() => return false,
        Some(c) if !c.is_ascii_alphanumeric() && c != '_' => return false,
        Some(_) => {}
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A helper index from variable names to descriptions, used by the builder.
pub(crate) fn variables_by_name(
    ty: &SlaveTypeDescription,
) -> HashMap<&str, &VariableDescription> {
    ty.variables().iter().map(|v| (v.name.as_str(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_names() {
        assert_eq!(DataType::Real.to_string(), "real");
        assert_eq!(DataType::String.to_string(), "string");
        assert_eq!(Causality::CalculatedParameter.to_string(), "calculated parameter");
        assert_eq!(Variability::Continuous.to_string(), "continuous");
    }

    #[test]
    fn test_scalar_value_data_type() {
        assert_eq!(ScalarValue::Real(1.5).data_type(), DataType::Real);
        assert_eq!(ScalarValue::Integer(3).data_type(), DataType::Integer);
        assert_eq!(ScalarValue::Boolean(true).data_type(), DataType::Boolean);
        assert_eq!(ScalarValue::from("foo").data_type(), DataType::String);
    }

    #[test]
    fn test_scalar_value_serialization() {
        let v = ScalarValue::Real(2.5);
        let json = serde_json::to_string(&v).unwrap();
        let back: ScalarValue = serde_json::from_str(&json).unwrap();
        assert_eq!(v, back);

        // Real and Integer must stay distinguishable on the wire.
        let i = ScalarValue::Integer(2);
        let json = serde_json::to_string(&i).unwrap();
        let back: ScalarValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back.data_type(), DataType::Integer);
    }

    #[test]
    fn test_variability_rank_order() {
        assert!(Variability::Constant.rank() < Variability::Fixed.rank());
        assert!(Variability::Discrete.rank() < Variability::Continuous.rank());
    }

    #[test]
    fn test_slave_type_description() {
        let ty = SlaveTypeDescription::new(
            "widget",
            "b331f8fc-3958-45ad-92fc-e88e57df4297",
            "A widget that does something",
            "A. Widgetmaker",
            "1.0",
            vec![
                VariableDescription::new(0, "a", DataType::Real, Causality::Output, Variability::Continuous),
                VariableDescription::new(1, "b", DataType::Real, Causality::Output, Variability::Fixed),
            ],
        )
        .unwrap();

        assert_eq!(ty.name(), "widget");
        assert_eq!(ty.variables().len(), 2);
        assert_eq!(ty.variable(1).unwrap().name, "b");
        assert_eq!(ty.variable_by_name("a").unwrap().id, 0);
        assert!(ty.variable(99).is_none());
    }

    #[test]
    fn test_slave_type_rejects_duplicate_ids() {
        let result = SlaveTypeDescription::new(
            "widget",
            "u",
            "",
            "",
            "1.0",
            vec![
                VariableDescription::new(0, "a", DataType::Real, Causality::Output, Variability::Continuous),
                VariableDescription::new(0, "b", DataType::Real, Causality::Output, Variability::Continuous),
            ],
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_slave_type_rejects_empty_name() {
        let result = SlaveTypeDescription::new("", "u", "", "", "1.0", vec![]);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_qualified_variable_name() {
        let a = QualifiedVariableName::new("slaveA", "var1").unwrap();
        assert_eq!(a.slave(), "slaveA");
        assert_eq!(a.variable(), "var1");
        assert_eq!(a.to_string(), "slaveA.var1");

        let b: QualifiedVariableName = "slaveB.var1".parse().unwrap();
        assert_eq!(b.slave(), "slaveB");
        assert_eq!(b.variable(), "var1");
        assert_ne!(a, b);

        assert!("noseparator".parse::<QualifiedVariableName>().is_err());
        assert!(".leading".parse::<QualifiedVariableName>().is_err());
        assert!("trailing.".parse::<QualifiedVariableName>().is_err());
        assert!(QualifiedVariableName::new("", "x").is_err());
    }

    #[test]
    fn test_valid_slave_names() {
        assert!(is_valid_slave_name("slave1"));
        assert!(is_valid_slave_name("_hidden"));
        assert!(is_valid_slave_name("a_b_c"));
        assert!(!is_valid_slave_name(""));
        assert!(!is_valid_slave_name("1slave"));
        assert!(!is_valid_slave_name("bad name"));
        assert!(!is_valid_slave_name("bad.name"));
    }
}
