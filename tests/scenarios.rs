//=====================================================
// File: tests/scenarios.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: End-to-end MarineScript execution tests
// Objective: Compile AST units through the embedding API and check returned values,
//            yielded sequences, overload selection, faults and telemetry
//=====================================================

use std::cell::Cell;
use std::rc::Rc;

use marinescript::ast::{BinaryOp, Expr, FunctionDef, ProgramUnit, Stmt};
use marinescript::vm::runtime::EngineState;
use marinescript::{
    HostFunction, HostObject, HostType, Marine, MarineError, RunOutcome, RuntimeFault,
    RuntimeOptions, TelemetryCollector, TelemetryEventKind, TypeRef, Value,
};

fn compiled(functions: Vec<FunctionDef>) -> Marine {
    compiled_with(Marine::new(), functions)
}

fn compiled_with(mut marine: Marine, functions: Vec<FunctionDef>) -> Marine {
    marine.load_unit(ProgramUnit::new("scenario.mrn", functions));
    marine.compile().expect("program should compile");
    marine
}

fn main_fn(body: Vec<Stmt>) -> FunctionDef {
    FunctionDef::new("main", Vec::<String>::new(), body)
}

fn add(lhs: Expr, rhs: Expr) -> Expr {
    Expr::binary(BinaryOp::Add, lhs, rhs)
}

fn run_value(marine: &Marine) -> Value {
    marine
        .run("main", vec![])
        .expect("run")
        .into_value()
        .expect("value")
}

#[test]
fn arithmetic_respects_operand_order() {
    // ret 2*3+10/2
    let marine = compiled(vec![main_fn(vec![Stmt::ret(add(
        Expr::binary(BinaryOp::Mul, Expr::int(2), Expr::int(3)),
        Expr::binary(BinaryOp::Div, Expr::int(10), Expr::int(2)),
    ))])]);
    assert_eq!(run_value(&marine), Value::Int(11));
}

#[test]
fn while_loop_sums_inclusive_range() {
    let marine = compiled(vec![main_fn(vec![
        Stmt::let_("i", Expr::int(0)),
        Stmt::let_("sum", Expr::int(0)),
        Stmt::while_(
            Expr::binary(BinaryOp::Le, Expr::var("i"), Expr::int(100)),
            vec![
                Stmt::assign("sum", add(Expr::var("sum"), Expr::var("i"))),
                Stmt::assign("i", add(Expr::var("i"), Expr::int(1))),
            ],
        ),
        Stmt::ret(Expr::var("sum")),
    ])]);
    assert_eq!(run_value(&marine), Value::Int(5050));
}

#[test]
fn closures_share_captures_across_invocations() {
    // let f = action(x) a = a + x; b = b * 2; ret a + b end
    let action = Expr::action(
        vec!["x"],
        vec![
            Stmt::assign("a", add(Expr::var("a"), Expr::var("x"))),
            Stmt::assign("b", Expr::binary(BinaryOp::Mul, Expr::var("b"), Expr::int(2))),
            Stmt::ret(add(Expr::var("a"), Expr::var("b"))),
        ],
    );
    let marine = compiled(vec![main_fn(vec![
        Stmt::let_("a", Expr::int(1)),
        Stmt::let_("b", Expr::int(10)),
        Stmt::let_("f", action),
        Stmt::let_("first", Expr::call("f", vec![Expr::int(5)])),
        Stmt::let_("second", Expr::call("f", vec![Expr::int(2)])),
        Stmt::ret(Expr::array(vec![Expr::var("first"), Expr::var("second")])),
    ])]);
    // a: 1 -> 6 -> 8, b: 10 -> 20 -> 40
    assert_eq!(
        run_value(&marine),
        Value::array(vec![Value::Int(26), Value::Int(48)])
    );
}

#[test]
fn closures_can_be_invoked_through_expressions() {
    let make_counter = FunctionDef::new(
        "make_counter",
        vec!["start"],
        vec![Stmt::ret(Expr::action(
            Vec::<String>::new(),
            vec![
                Stmt::assign("start", add(Expr::var("start"), Expr::int(1))),
                Stmt::ret(Expr::var("start")),
            ],
        ))],
    );
    let marine = compiled(vec![
        make_counter,
        main_fn(vec![
            Stmt::let_("next", Expr::call("make_counter", vec![Expr::int(40)])),
            Stmt::expr(Expr::invoke(Expr::var("next"), vec![])),
            Stmt::ret(Expr::invoke(Expr::var("next"), vec![])),
        ]),
    ]);
    assert_eq!(run_value(&marine), Value::Int(42));
}

#[test]
fn exact_integer_overload_wins() {
    let marine = Marine::new();
    marine.register_function(HostFunction::new(
        "combine",
        vec![TypeRef::int(), TypeRef::int()],
        |_| Ok(Value::string("int,int")),
    ));
    marine.register_function(HostFunction::new(
        "combine",
        vec![TypeRef::int(), TypeRef::float()],
        |_| Ok(Value::string("int,float")),
    ));
    let marine = compiled_with(
        marine,
        vec![main_fn(vec![Stmt::ret(Expr::call(
            "combine",
            vec![Expr::int(1), Expr::int(2)],
        ))])],
    );
    assert_eq!(run_value(&marine), Value::string("int,int"));
}

#[test]
fn overloads_registered_after_compile_take_part_in_resolution() {
    let marine = Marine::new();
    marine.register_function(HostFunction::new(
        "describe",
        vec![TypeRef::float()],
        |_| Ok(Value::string("float")),
    ));
    let marine = compiled_with(
        marine,
        vec![main_fn(vec![Stmt::ret(Expr::call(
            "describe",
            vec![Expr::int(1)],
        ))])],
    );
    assert_eq!(run_value(&marine), Value::string("float"));

    marine.register_function(HostFunction::new(
        "describe",
        vec![TypeRef::int()],
        |_| Ok(Value::string("int")),
    ));
    assert_eq!(run_value(&marine), Value::string("int"));
}

#[test]
fn equally_ranked_overloads_fault_as_ambiguous() {
    let marine = Marine::new();
    marine.register_function(HostFunction::new(
        "mix",
        vec![TypeRef::int(), TypeRef::float()],
        |_| Ok(Value::Unit),
    ));
    marine.register_function(HostFunction::new(
        "mix",
        vec![TypeRef::float(), TypeRef::int()],
        |_| Ok(Value::Unit),
    ));
    let marine = compiled_with(
        marine,
        vec![main_fn(vec![Stmt::ret(Expr::call(
            "mix",
            vec![Expr::int(1), Expr::int(2)],
        ))])],
    );
    let error = marine.run("main", vec![]).expect_err("ambiguous call");
    let fault = error.as_fault().expect("runtime fault");
    match fault.kind() {
        RuntimeFault::AmbiguousOverload { name, candidates } => {
            assert_eq!(name, "mix");
            assert_eq!(candidates.len(), 2);
        }
        other => panic!("unexpected fault {other:?}"),
    }
    assert_eq!(fault.innermost().map(|ctx| ctx.function.as_str()), Some("main"));
}

#[test]
fn await_yields_each_host_element_then_returns() {
    let marine = Marine::new();
    marine.register_function(HostFunction::new("readings", vec![], |_| {
        Ok(Value::iterator((1..=5).map(Value::Int)))
    }));
    let marine = compiled_with(
        marine,
        vec![main_fn(vec![
            Stmt::let_("last", Expr::awaiting(Expr::call("readings", vec![]))),
            Stmt::ret(Expr::binary(BinaryOp::Mul, Expr::var("last"), Expr::int(10))),
        ])],
    );
    let outcome = marine.run("main", vec![]).expect("run");
    assert!(outcome.is_sequence());
    let values = outcome.into_values().expect("values");
    assert_eq!(
        values,
        vec![
            Value::Int(1),
            Value::Int(2),
            Value::Int(3),
            Value::Int(4),
            Value::Int(5),
            Value::Int(50),
        ]
    );
}

#[test]
fn k_yields_produce_k_plus_one_values() {
    let body = vec![
        Stmt::For {
            var: "i".into(),
            start: Expr::int(1),
            end: Expr::var("k"),
            step: None,
            body: vec![Stmt::yield_(Expr::var("i"))],
        },
        Stmt::ret(Expr::string("done")),
    ];
    let marine = compiled(vec![FunctionDef::new("count", vec!["k"], body)]);
    for k in [0_i64, 1, 4] {
        let values = marine
            .run("count", vec![Value::Int(k)])
            .expect("run")
            .into_values()
            .expect("values");
        assert_eq!(values.len(), k as usize + 1);
        assert_eq!(values.last(), Some(&Value::string("done")));
    }
}

#[test]
fn zero_step_for_faults_instead_of_spinning() {
    let ticks = Rc::new(Cell::new(0));
    let marine = Marine::new();
    let counter = Rc::clone(&ticks);
    marine.register_function(HostFunction::new("tick", vec![], move |_| {
        counter.set(counter.get() + 1);
        Ok(Value::Unit)
    }));
    // for i = 1, 3, 0 do tick() end
    let marine = compiled_with(
        marine,
        vec![main_fn(vec![
            Stmt::For {
                var: "i".into(),
                start: Expr::int(1),
                end: Expr::int(3),
                step: Some(Expr::int(0)),
                body: vec![Stmt::expr(Expr::call("tick", vec![]))],
            },
            Stmt::ret(Expr::int(1)),
        ])],
    );
    let error = marine.run("main", vec![]).expect_err("zero step");
    let fault = error.as_fault().expect("runtime fault");
    assert_eq!(fault.kind(), &RuntimeFault::ZeroForStep);
    assert!(error.to_string().contains("'for' step is zero"));
    assert_eq!(ticks.get(), 0);
}

#[test]
fn sequences_report_engine_state() {
    let marine = compiled(vec![main_fn(vec![
        Stmt::yield_(Expr::int(1)),
        Stmt::ret(Expr::int(2)),
    ])]);
    let RunOutcome::Sequence(mut sequence) = marine.run("main", vec![]).expect("run") else {
        panic!("expected a sequence");
    };
    assert_eq!(sequence.state(), EngineState::Suspended);
    assert_eq!(sequence.next().map(|v| v.ok()), Some(Some(Value::Int(1))));
    assert_eq!(sequence.next().map(|v| v.ok()), Some(Some(Value::Int(2))));
    assert_eq!(sequence.state(), EngineState::Completed);
    assert!(sequence.next().is_none());
}

#[test]
fn telemetry_records_every_transition() {
    let collector = TelemetryCollector::new();
    let options = RuntimeOptions::default().with_telemetry_collector(collector.clone());
    let marine = compiled_with(
        Marine::with_options(options),
        vec![main_fn(vec![
            Stmt::yield_(Expr::int(1)),
            Stmt::yield_(Expr::int(2)),
            Stmt::ret(Expr::int(3)),
        ])],
    );
    let values = marine
        .run("main", vec![])
        .expect("run")
        .into_values()
        .expect("values");
    assert_eq!(values.len(), 3);
    assert_eq!(
        collector.kinds(),
        vec![
            TelemetryEventKind::Started,
            TelemetryEventKind::Suspended,
            TelemetryEventKind::Resumed,
            TelemetryEventKind::Suspended,
            TelemetryEventKind::Resumed,
            TelemetryEventKind::Completed,
        ]
    );
    let records = collector.snapshot();
    assert!(records.iter().all(|record| record.function == "main"));
}

#[test]
fn faults_are_reported_to_telemetry() {
    let collector = TelemetryCollector::new();
    let options = RuntimeOptions::default().with_telemetry_collector(collector.clone());
    let marine = compiled_with(
        Marine::with_options(options),
        vec![main_fn(vec![Stmt::ret(Expr::binary(
            BinaryOp::Div,
            Expr::int(1),
            Expr::int(0),
        ))])],
    );
    let error = marine.run("main", vec![]).expect_err("division by zero");
    assert!(matches!(
        error.as_fault().map(|fault| fault.kind()),
        Some(RuntimeFault::DivisionByZero)
    ));
    assert_eq!(
        collector.kinds(),
        vec![TelemetryEventKind::Started, TelemetryEventKind::Faulted]
    );
}

#[test]
fn host_types_expose_statics_methods_and_privacy() {
    let marine = Marine::new();
    marine.register_type(
        HostType::new("Point")
            .with_static_field("origin_label", Value::string("origin"))
            .with_static_function(HostFunction::new(
                "new",
                vec![TypeRef::int(), TypeRef::int()],
                |call| {
                    Ok(Value::object(
                        HostObject::new("Point")
                            .with_field("x", Value::Int(call.int(0)?))
                            .with_field("y", Value::Int(call.int(1)?))
                            .with_field("secret", Value::Int(7)),
                    ))
                },
            ))
            .with_method(HostFunction::new(
                "sum",
                vec![TypeRef::named("Point")],
                |call| {
                    let point = call.object(0)?;
                    let x = point.field("x").and_then(|v| v.as_int()).unwrap_or(0);
                    let y = point.field("y").and_then(|v| v.as_int()).unwrap_or(0);
                    Ok(Value::Int(x + y))
                },
            ))
            .with_private("secret"),
    );
    let point = Expr::method(
        Expr::var("Point"),
        "new",
        vec![Expr::int(3), Expr::int(4)],
    );
    let marine = compiled_with(
        marine,
        vec![
            main_fn(vec![
                Stmt::let_("p", point.clone()),
                Stmt::ret(add(
                    Expr::method(Expr::var("p"), "sum", vec![]),
                    Expr::field(Expr::var("p"), "x"),
                )),
            ]),
            FunctionDef::new(
                "peek",
                Vec::<String>::new(),
                vec![
                    Stmt::let_("p", point),
                    Stmt::ret(Expr::field(Expr::var("p"), "secret")),
                ],
            ),
            FunctionDef::new(
                "label",
                Vec::<String>::new(),
                vec![Stmt::ret(Expr::field(Expr::var("Point"), "origin_label"))],
            ),
        ],
    );
    assert_eq!(run_value(&marine), Value::Int(10));

    let error = marine.run("peek", vec![]).expect_err("private member");
    assert!(matches!(
        error.as_fault().map(|fault| fault.kind()),
        Some(RuntimeFault::PrivateMemberAccess { .. })
    ));

    let label = marine
        .run("label", vec![])
        .expect("run")
        .into_value()
        .expect("value");
    assert_eq!(label, Value::string("origin"));
}

#[test]
fn namespaced_functions_resolve_through_the_table() {
    let mut marine = Marine::new();
    marine.load_unit(
        ProgramUnit::new(
            "tools.mrn",
            vec![FunctionDef::new(
                "twice",
                vec!["n"],
                vec![Stmt::ret(Expr::binary(
                    BinaryOp::Mul,
                    Expr::var("n"),
                    Expr::int(2),
                ))],
            )],
        )
        .with_namespace(["app", "tools"]),
    );
    marine.load_unit(ProgramUnit::new(
        "main.mrn",
        vec![main_fn(vec![Stmt::ret(Expr::call_in(
            ["app", "tools"],
            "twice",
            vec![Expr::int(21)],
        ))])],
    ));
    marine.compile().expect("compile");
    assert_eq!(run_value(&marine), Value::Int(42));

    let direct = marine
        .run_in(["app", "tools"], "twice", vec![Value::Int(5)])
        .expect("run")
        .into_value()
        .expect("value");
    assert_eq!(direct, Value::Int(10));
}

#[test]
fn host_globals_are_read_and_written_through() {
    let marine = Marine::new();
    marine.register_global("counter", Value::Int(5));
    let marine = compiled_with(
        marine,
        vec![main_fn(vec![
            Stmt::assign("counter", add(Expr::var("counter"), Expr::int(1))),
            Stmt::ret(Expr::var("counter")),
        ])],
    );
    assert_eq!(run_value(&marine), Value::Int(6));
    assert_eq!(marine.global("counter"), Some(Value::Int(6)));
    assert!(marine.set_global("counter", Value::Int(100)));
    assert_eq!(run_value(&marine), Value::Int(101));
}

#[test]
fn compile_errors_surface_through_the_api() {
    let mut marine = Marine::new();
    marine.load_unit(ProgramUnit::new(
        "broken.mrn",
        vec![main_fn(vec![Stmt::ret(Expr::var("nowhere"))])],
    ));
    assert!(matches!(marine.compile(), Err(MarineError::Compile(_))));
}

//=====================================================
// End of file
//=====================================================
