//! Integration tests for the model builder: the widget/gadget scenario
//! plus the invariants over connections and unconnected inputs.

use lockstep::{
    Causality, DataType, Error, ModelBuilder, QualifiedVariableName, ScalarValue,
    SlaveTypeDescription, Variability, VariableDescription,
};

fn widget() -> SlaveTypeDescription {
    SlaveTypeDescription::new(
        "widget",
        "b331f8fc-3958-45ad-92fc-e88e57df4297",
        "A widget that does something",
        "A. Widgetmaker",
        "1.0",
        vec![
            VariableDescription::new(0, "a", DataType::Real, Causality::Output, Variability::Continuous),
            VariableDescription::new(1, "b", DataType::Real, Causality::Output, Variability::Fixed),
            VariableDescription::new(2, "c", DataType::String, Causality::Output, Variability::Discrete),
        ],
    )
    .unwrap()
}

fn gadget() -> SlaveTypeDescription {
    SlaveTypeDescription::new(
        "gadget",
        "8876b42f-db2b-4b84-8695-1752057d3562",
        "An interesting gadget",
        "Gadgets Gadgets Gadgets",
        "3.4",
        vec![
            VariableDescription::new(10, "x", DataType::Real, Causality::Input, Variability::Continuous),
            VariableDescription::new(20, "y", DataType::Real, Causality::Input, Variability::Continuous),
            VariableDescription::new(30, "z", DataType::String, Causality::Input, Variability::Fixed),
        ],
    )
    .unwrap()
}

fn qvn(s: &str) -> QualifiedVariableName {
    s.parse().unwrap()
}

#[test]
fn builder_scenario() {
    let mut builder = ModelBuilder::new();
    builder.add_slave("widget", &widget()).unwrap();
    builder.add_slave("gadget", &gadget()).unwrap();

    // Initial value with wrong type.
    assert!(matches!(
        builder.set_initial_value(&qvn("gadget.x"), ScalarValue::from("foo")),
        Err(Error::ModelConstruction(_))
    ));

    // Valid connection.
    builder.connect(&qvn("widget.a"), &qvn("gadget.x")).unwrap();

    // Unknown slave.
    assert!(matches!(
        builder.connect(&qvn("widget.a"), &qvn("slaveE.x")),
        Err(Error::EntityNotFound(_))
    ));

    // Data type mismatch: string output, real input.
    assert!(matches!(
        builder.connect(&qvn("widget.c"), &qvn("gadget.y")),
        Err(Error::ModelConstruction(_))
    ));

    // y stayed unconnected above; connect it properly now.
    builder.connect(&qvn("widget.b"), &qvn("gadget.y")).unwrap();

    let unconnected = builder.unconnected_inputs();
    assert_eq!(unconnected, vec![qvn("gadget.z")]);
}

#[test]
fn connections_and_unconnected_inputs_are_disjoint() {
    let mut builder = ModelBuilder::new();
    builder.add_slave("widget", &widget()).unwrap();
    builder.add_slave("gadget", &gadget()).unwrap();
    builder.connect(&qvn("widget.a"), &qvn("gadget.x")).unwrap();

    let connections = builder.connections();
    let unconnected = builder.unconnected_inputs();

    // No unconnected input appears as a connection target.
    for input in &unconnected {
        assert!(connections.iter().all(|(_, target)| target != input));
    }

    // Every unconnected input is a declared input of an added slave.
    let gadget_ty = gadget();
    for input in &unconnected {
        assert_eq!(input.slave(), "gadget");
        let variable = gadget_ty.variable_by_name(input.variable()).unwrap();
        assert_eq!(variable.causality, Causality::Input);
    }

    // Every connection respects causality and data type.
    let types = [("widget", widget()), ("gadget", gadget())];
    for (source, target) in &connections {
        let source_ty = &types.iter().find(|(n, _)| n == &source.slave()).unwrap().1;
        let target_ty = &types.iter().find(|(n, _)| n == &target.slave()).unwrap().1;
        let source_var = source_ty.variable_by_name(source.variable()).unwrap();
        let target_var = target_ty.variable_by_name(target.variable()).unwrap();
        assert!(matches!(
            source_var.causality,
            Causality::Output | Causality::CalculatedParameter
        ));
        assert!(matches!(
            target_var.causality,
            Causality::Input | Causality::Parameter
        ));
        assert_eq!(source_var.data_type, target_var.data_type);
    }
}

#[test]
fn target_accepts_at_most_one_source() {
    let mut builder = ModelBuilder::new();
    builder.add_slave("w1", &widget()).unwrap();
    builder.add_slave("w2", &widget()).unwrap();
    builder.add_slave("gadget", &gadget()).unwrap();

    builder.connect(&qvn("w1.a"), &qvn("gadget.x")).unwrap();
    assert!(matches!(
        builder.connect(&qvn("w2.a"), &qvn("gadget.x")),
        Err(Error::ModelConstruction(_))
    ));

    // The failed connect left exactly one connection behind.
    assert_eq!(builder.connections().len(), 1);
    assert_eq!(builder.connections()[0].0, qvn("w1.a"));
}

#[test]
fn calculated_parameter_may_feed_parameter_or_input() {
    let source_ty = SlaveTypeDescription::new(
        "estimator",
        "11111111-2222-3333-4444-555555555555",
        "",
        "",
        "1.0",
        vec![VariableDescription::new(
            0,
            "gain",
            DataType::Real,
            Causality::CalculatedParameter,
            Variability::Tunable,
        )],
    )
    .unwrap();
    let sink_ty = SlaveTypeDescription::new(
        "plant",
        "66666666-7777-8888-9999-000000000000",
        "",
        "",
        "1.0",
        vec![
            VariableDescription::new(0, "k", DataType::Real, Causality::Parameter, Variability::Tunable),
            VariableDescription::new(1, "u", DataType::Real, Causality::Input, Variability::Continuous),
            VariableDescription::new(2, "state", DataType::Real, Causality::Local, Variability::Continuous),
        ],
    )
    .unwrap();

    let mut builder = ModelBuilder::new();
    builder.add_slave("est", &source_ty).unwrap();
    builder.add_slave("plant", &sink_ty).unwrap();

    builder.connect(&qvn("est.gain"), &qvn("plant.k")).unwrap();
    builder.connect(&qvn("est.gain"), &qvn("plant.u")).unwrap();

    // A local variable can be neither source nor target.
    assert!(matches!(
        builder.connect(&qvn("plant.state"), &qvn("plant.u")),
        Err(Error::ModelConstruction(_))
    ));
    assert!(matches!(
        builder.connect(&qvn("est.gain"), &qvn("plant.state")),
        Err(Error::ModelConstruction(_))
    ));
}
