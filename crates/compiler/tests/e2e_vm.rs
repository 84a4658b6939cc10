//! End-to-end tests: build a Program, compile it, run it on a fresh VM.

use lattice_compiler::ast::*;
use lattice_compiler::{compile, compile_module};
use lattice_core::error::{LatError, LatErrorKind};
use lattice_core::value::{LatValue, ValueKind};
use lattice_runtime::{ModuleRegistry, Vm};
use std::sync::Arc;

fn run(program: &Program) -> Result<LatValue, LatError> {
    let chunk = compile(program).expect("program compiles");
    Vm::new().run_chunk(chunk)
}

fn run_ok(program: &Program) -> LatValue {
    match run(program) {
        Ok(v) => v,
        Err(e) => panic!("program failed: {}", e),
    }
}

fn main_fn(body: Vec<Stmt>) -> Program {
    Program {
        items: vec![Item::Function(FnDecl::new("main", vec![], body))],
    }
}

fn ret(expr: Expr) -> Stmt {
    Stmt::Return {
        value: Some(expr),
        line: 1,
    }
}

fn let_(name: &str, value: Expr) -> Stmt {
    Stmt::Let {
        name: name.to_string(),
        value,
        line: 1,
    }
}

fn int(n: i64) -> LatValue {
    LatValue::int(n)
}

// --- core behavior ---

#[test]
fn test_arithmetic_with_folding() {
    // fn main() { return (2 + 3) * 4 - 1 }
    let program = main_fn(vec![ret(Expr::binary(
        BinaryOp::Sub,
        Expr::binary(
            BinaryOp::Mul,
            Expr::binary(BinaryOp::Add, Expr::Int(2), Expr::Int(3)),
            Expr::Int(4),
        ),
        Expr::Int(1),
    ))]);
    let chunk = compile(&program).unwrap();
    // Find main's prototype and check the fold left one constant and no
    // arithmetic opcodes.
    let proto = chunk
        .constants
        .iter()
        .find_map(|c| match &c.kind {
            ValueKind::Function(p) => Some(p.clone()),
            _ => None,
        })
        .expect("main prototype in pool");
    assert_eq!(proto.chunk.constants.len(), 1);
    assert_eq!(proto.chunk.constants[0], int(19));
    use lattice_core::opcode::Opcode;
    for op in [Opcode::Add, Opcode::Mul, Opcode::Sub] {
        assert!(
            !proto.chunk.code.contains(&(op as u8)),
            "folded chunk must not contain {:?}",
            op
        );
    }
    assert_eq!(Vm::new().run_chunk(chunk).unwrap(), int(19));
}

#[test]
fn test_freeze_round_trip() {
    // let a = [1,2,3]; let b = freeze(a); let c = thaw(b); return c == a
    let program = main_fn(vec![
        let_(
            "a",
            Expr::Array(vec![Expr::Int(1), Expr::Int(2), Expr::Int(3)]),
        ),
        let_(
            "b",
            Expr::Freeze {
                target: PhaseTarget::Value(Box::new(Expr::ident("a"))),
                except: vec![],
            },
        ),
        let_("c", Expr::Thaw(PhaseTarget::Value(Box::new(Expr::ident("b"))))),
        Stmt::expr(Expr::call_named(
            "assert",
            vec![Expr::binary(
                BinaryOp::Eq,
                Expr::call_named("phase_of", vec![Expr::ident("b")]),
                Expr::string("crystal"),
            )],
        )),
        Stmt::expr(Expr::call_named(
            "assert",
            vec![Expr::binary(
                BinaryOp::Eq,
                Expr::call_named("phase_of", vec![Expr::ident("c")]),
                Expr::string("fluid"),
            )],
        )),
        Stmt::expr(Expr::call_named(
            "assert",
            vec![Expr::binary(
                BinaryOp::Eq,
                Expr::call_named("phase_of", vec![Expr::ident("a")]),
                Expr::string("fluid"),
            )],
        )),
        ret(Expr::binary(BinaryOp::Eq, Expr::ident("c"), Expr::ident("a"))),
    ]);
    assert_eq!(run_ok(&program), LatValue::boolean(true));
}

#[test]
fn test_crystal_mutation_is_rejected() {
    // let a = freeze([1,2,3]); a[0] = 9  -> crystal-mutation error
    let program = main_fn(vec![
        let_(
            "a",
            Expr::Freeze {
                target: PhaseTarget::Value(Box::new(Expr::Array(vec![
                    Expr::Int(1),
                    Expr::Int(2),
                    Expr::Int(3),
                ]))),
                except: vec![],
            },
        ),
        Stmt::Assign {
            target: AssignTarget::Index {
                target: Expr::ident("a"),
                index: Expr::Int(0),
            },
            value: Expr::Int(9),
            line: 2,
        },
        ret(Expr::ident("a")),
    ]);
    match run(&program) {
        Err(err) => {
            assert!(err.message.contains("crystal"), "message: {}", err.message)
        }
        Ok(v) => panic!("expected crystal-mutation error, got {}", v),
    }
}

#[test]
fn test_crystal_mutation_leaves_value_intact() {
    let program = main_fn(vec![
        let_(
            "a",
            Expr::Freeze {
                target: PhaseTarget::Value(Box::new(Expr::Array(vec![
                    Expr::Int(1),
                    Expr::Int(2),
                    Expr::Int(3),
                ]))),
                except: vec![],
            },
        ),
        let_("failed", Expr::Bool(false)),
        Stmt::TryCatch {
            body: vec![Stmt::Assign {
                target: AssignTarget::Index {
                    target: Expr::ident("a"),
                    index: Expr::Int(0),
                },
                value: Expr::Int(9),
                line: 3,
            }],
            catch_var: "e".to_string(),
            catch_body: vec![Stmt::Assign {
                target: AssignTarget::Name("failed".to_string()),
                value: Expr::Bool(true),
                line: 3,
            }],
            line: 3,
        },
        Stmt::expr(Expr::call_named("assert", vec![Expr::ident("failed")])),
        ret(Expr::index(Expr::ident("a"), Expr::Int(0))),
    ]);
    assert_eq!(run_ok(&program), int(1));
}

#[test]
fn test_match_binding_with_guard() {
    let arms = vec![
        MatchArm {
            pattern: Pattern::Binding("x".to_string()),
            guard: Some(Expr::binary(BinaryOp::Gt, Expr::ident("x"), Expr::Int(5))),
            body: Expr::string("big"),
            line: 1,
        },
        MatchArm {
            pattern: Pattern::Wildcard { phase: None },
            guard: None,
            body: Expr::string("small"),
            line: 1,
        },
    ];
    for (scrutinee, expected) in [(7, "big"), (3, "small")] {
        let program = main_fn(vec![ret(Expr::Match {
            scrutinee: Box::new(Expr::Int(scrutinee)),
            arms: arms.clone(),
        })]);
        assert_eq!(run_ok(&program), LatValue::string(expected));
    }
}

#[test]
fn test_defer_runs_lifo() {
    // defer { println(1) }; defer { println(2) }; return 0  =>  "2\n1\n"
    let program = main_fn(vec![
        Stmt::Defer {
            body: vec![Stmt::expr(Expr::call_named("println", vec![Expr::Int(1)]))],
            line: 1,
        },
        Stmt::Defer {
            body: vec![Stmt::expr(Expr::call_named("println", vec![Expr::Int(2)]))],
            line: 2,
        },
        ret(Expr::Int(0)),
    ]);
    let chunk = compile(&program).unwrap();
    let (mut vm, out) = Vm::with_output_buffer();
    let result = vm.run_chunk(chunk).unwrap();
    assert_eq!(result, int(0));
    assert_eq!(String::from_utf8(out.borrow().clone()).unwrap(), "2\n1\n");
}

// --- control flow ---

#[test]
fn test_while_loop_with_inc_fast_path() {
    let program = main_fn(vec![
        let_("i", Expr::Int(0)),
        let_("total", Expr::Int(0)),
        Stmt::While {
            cond: Expr::binary(BinaryOp::Lt, Expr::ident("i"), Expr::Int(5)),
            body: vec![
                Stmt::Assign {
                    target: AssignTarget::Name("total".to_string()),
                    value: Expr::binary(BinaryOp::Add, Expr::ident("total"), Expr::ident("i")),
                    line: 3,
                },
                Stmt::Assign {
                    target: AssignTarget::Name("i".to_string()),
                    value: Expr::binary(BinaryOp::Add, Expr::ident("i"), Expr::Int(1)),
                    line: 4,
                },
            ],
            line: 2,
        },
        ret(Expr::ident("total")),
    ]);
    assert_eq!(run_ok(&program), int(10));
}

#[test]
fn test_for_in_range_with_break_continue() {
    let program = main_fn(vec![
        let_("sum", Expr::Int(0)),
        Stmt::ForIn {
            var: "i".to_string(),
            iterable: Expr::Range {
                start: Box::new(Expr::Int(0)),
                end: Box::new(Expr::Int(10)),
            },
            body: vec![
                Stmt::If {
                    cond: Expr::binary(BinaryOp::Eq, Expr::ident("i"), Expr::Int(5)),
                    then_body: vec![Stmt::Continue { line: 3 }],
                    else_body: None,
                    line: 3,
                },
                Stmt::If {
                    cond: Expr::binary(BinaryOp::Eq, Expr::ident("i"), Expr::Int(8)),
                    then_body: vec![Stmt::Break { line: 4 }],
                    else_body: None,
                    line: 4,
                },
                Stmt::Assign {
                    target: AssignTarget::Name("sum".to_string()),
                    value: Expr::binary(BinaryOp::Add, Expr::ident("sum"), Expr::ident("i")),
                    line: 5,
                },
            ],
            line: 2,
        },
        ret(Expr::ident("sum")),
    ]);
    // 0+1+2+3+4 + 6+7 = 23
    assert_eq!(run_ok(&program), int(23));
}

#[test]
fn test_for_in_array() {
    let program = main_fn(vec![
        let_(
            "xs",
            Expr::Array(vec![Expr::Int(10), Expr::Int(20), Expr::Int(12)]),
        ),
        let_("sum", Expr::Int(0)),
        Stmt::ForIn {
            var: "x".to_string(),
            iterable: Expr::ident("xs"),
            body: vec![Stmt::Assign {
                target: AssignTarget::Name("sum".to_string()),
                value: Expr::binary(BinaryOp::Add, Expr::ident("sum"), Expr::ident("x")),
                line: 3,
            }],
            line: 2,
        },
        ret(Expr::ident("sum")),
    ]);
    assert_eq!(run_ok(&program), int(42));
}

#[test]
fn test_logical_short_circuit_and_nil_coalesce() {
    let program = main_fn(vec![ret(Expr::Logical {
        op: LogicalOp::NilCoalesce,
        lhs: Box::new(Expr::Nil),
        rhs: Box::new(Expr::Int(5)),
    })]);
    assert_eq!(run_ok(&program), int(5));

    let program = main_fn(vec![ret(Expr::Logical {
        op: LogicalOp::And,
        lhs: Box::new(Expr::Bool(false)),
        rhs: Box::new(Expr::Int(1)),
    })]);
    assert_eq!(run_ok(&program), LatValue::boolean(false));

    let program = main_fn(vec![ret(Expr::Logical {
        op: LogicalOp::Or,
        lhs: Box::new(Expr::Int(3)),
        rhs: Box::new(Expr::Int(9)),
    })]);
    assert_eq!(run_ok(&program), int(3));
}

// --- functions, closures, contracts ---

#[test]
fn test_closure_captures_upvalue() {
    // fn make_adder(n) { return fn(x) { return n + x } }
    let adder = FnDecl::new(
        "make_adder",
        vec![Param::plain("n")],
        vec![ret(Expr::Closure {
            params: vec![Param::plain("x")],
            variadic: None,
            body: vec![ret(Expr::binary(
                BinaryOp::Add,
                Expr::ident("n"),
                Expr::ident("x"),
            ))],
        })],
    );
    let program = Program {
        items: vec![
            Item::Function(adder),
            Item::Function(FnDecl::new(
                "main",
                vec![],
                vec![
                    let_(
                        "add10",
                        Expr::call_named("make_adder", vec![Expr::Int(10)]),
                    ),
                    ret(Expr::call(Expr::ident("add10"), vec![Expr::Int(5)])),
                ],
            )),
        ],
    };
    assert_eq!(run_ok(&program), int(15));
}

#[test]
fn test_recursion_through_callee_slot() {
    // fn fact(n) { if n < 2 { return 1 }; return n * fact(n - 1) }
    let fact = FnDecl::new(
        "fact",
        vec![Param::plain("n")],
        vec![
            Stmt::If {
                cond: Expr::binary(BinaryOp::Lt, Expr::ident("n"), Expr::Int(2)),
                then_body: vec![ret(Expr::Int(1))],
                else_body: None,
                line: 2,
            },
            ret(Expr::binary(
                BinaryOp::Mul,
                Expr::ident("n"),
                Expr::call_named(
                    "fact",
                    vec![Expr::binary(BinaryOp::Sub, Expr::ident("n"), Expr::Int(1))],
                ),
            )),
        ],
    );
    let program = Program {
        items: vec![
            Item::Function(fact),
            Item::Function(FnDecl::new(
                "main",
                vec![],
                vec![ret(Expr::call_named("fact", vec![Expr::Int(6)]))],
            )),
        ],
    };
    assert_eq!(run_ok(&program), int(720));
}

#[test]
fn test_default_parameters() {
    let mut decl = FnDecl::new(
        "add",
        vec![
            Param::plain("a"),
            Param {
                name: "b".to_string(),
                default: Some(Expr::Int(10)),
                phase: None,
                type_name: None,
            },
        ],
        vec![ret(Expr::binary(
            BinaryOp::Add,
            Expr::ident("a"),
            Expr::ident("b"),
        ))],
    );
    decl.line = 1;
    let program = Program {
        items: vec![
            Item::Function(decl),
            Item::Function(FnDecl::new(
                "main",
                vec![],
                vec![ret(Expr::binary(
                    BinaryOp::Add,
                    Expr::call_named("add", vec![Expr::Int(5)]),
                    Expr::call_named("add", vec![Expr::Int(5), Expr::Int(1)]),
                ))],
            )),
        ],
    };
    // (5 + 10) + (5 + 1)
    assert_eq!(run_ok(&program), int(21));
}

#[test]
fn test_variadic_collects_rest() {
    let mut decl = FnDecl::new(
        "count",
        vec![],
        vec![ret(Expr::call_named("len", vec![Expr::ident("rest")]))],
    );
    decl.variadic = Some("rest".to_string());
    let program = Program {
        items: vec![
            Item::Function(decl),
            Item::Function(FnDecl::new(
                "main",
                vec![],
                vec![ret(Expr::call_named(
                    "count",
                    vec![Expr::Int(1), Expr::Int(2), Expr::Int(3)],
                ))],
            )),
        ],
    };
    assert_eq!(run_ok(&program), int(3));
}

#[test]
fn test_require_contract() {
    let mut half = FnDecl::new(
        "half",
        vec![Param::plain("n")],
        vec![ret(Expr::binary(BinaryOp::Div, Expr::ident("n"), Expr::Int(2)))],
    );
    half.requires.push(Contract {
        condition: Expr::binary(
            BinaryOp::Eq,
            Expr::binary(BinaryOp::Mod, Expr::ident("n"), Expr::Int(2)),
            Expr::Int(0),
        ),
        message: "n must be even".to_string(),
        line: 1,
    });
    let ok = Program {
        items: vec![
            Item::Function(half.clone()),
            Item::Function(FnDecl::new(
                "main",
                vec![],
                vec![ret(Expr::call_named("half", vec![Expr::Int(10)]))],
            )),
        ],
    };
    assert_eq!(run_ok(&ok), int(5));

    let bad = Program {
        items: vec![
            Item::Function(half),
            Item::Function(FnDecl::new(
                "main",
                vec![],
                vec![ret(Expr::call_named("half", vec![Expr::Int(3)]))],
            )),
        ],
    };
    match run(&bad) {
        Err(err) => assert_eq!(err.message, "require failed in 'half': n must be even"),
        Ok(v) => panic!("expected contract error, got {}", v),
    }
}

#[test]
fn test_ensure_contract() {
    let mut bad = FnDecl::new(
        "shrink",
        vec![Param::plain("n")],
        vec![ret(Expr::binary(BinaryOp::Sub, Expr::ident("n"), Expr::Int(1)))],
    );
    bad.ensures.push(Contract {
        condition: Expr::binary(BinaryOp::Gt, Expr::ident("result"), Expr::ident("n")),
        message: "result grows".to_string(),
        line: 1,
    });
    let program = Program {
        items: vec![
            Item::Function(bad),
            Item::Function(FnDecl::new(
                "main",
                vec![],
                vec![ret(Expr::call_named("shrink", vec![Expr::Int(5)]))],
            )),
        ],
    };
    match run(&program) {
        Err(err) => assert_eq!(err.message, "ensure failed in 'shrink': result grows"),
        Ok(v) => panic!("expected ensure error, got {}", v),
    }
}

#[test]
fn test_param_phase_contract() {
    let mut decl = FnDecl::new(
        "takes_crystal",
        vec![Param {
            name: "x".to_string(),
            default: None,
            phase: Some(lattice_core::phase::Phase::Crystal),
            type_name: None,
        }],
        vec![ret(Expr::Int(1))],
    );
    decl.line = 1;
    let bad = Program {
        items: vec![
            Item::Function(decl.clone()),
            Item::Function(FnDecl::new(
                "main",
                vec![],
                vec![ret(Expr::call_named(
                    "takes_crystal",
                    vec![Expr::Array(vec![Expr::Int(1)])],
                ))],
            )),
        ],
    };
    match run(&bad) {
        Err(err) => assert_eq!(err.kind, LatErrorKind::Phase),
        Ok(v) => panic!("expected phase error, got {}", v),
    }

    let ok = Program {
        items: vec![
            Item::Function(decl),
            Item::Function(FnDecl::new(
                "main",
                vec![],
                vec![ret(Expr::call_named(
                    "takes_crystal",
                    vec![Expr::Freeze {
                        target: PhaseTarget::Value(Box::new(Expr::Array(vec![Expr::Int(1)]))),
                        except: vec![],
                    }],
                ))],
            )),
        ],
    };
    assert_eq!(run_ok(&ok), int(1));
}

// --- errors, defer, unwinding ---

#[test]
fn test_nested_try_catch_innermost_wins() {
    let program = main_fn(vec![Stmt::TryCatch {
        body: vec![Stmt::TryCatch {
            body: vec![Stmt::Throw {
                value: Expr::Int(42),
                line: 3,
            }],
            catch_var: "e".to_string(),
            catch_body: vec![ret(Expr::ident("e"))],
            line: 2,
        }],
        catch_var: "outer".to_string(),
        catch_body: vec![ret(Expr::Int(-1))],
        line: 1,
    }]);
    assert_eq!(run_ok(&program), int(42));
}

#[test]
fn test_throw_runs_defers_during_unwind() {
    let program = main_fn(vec![
        let_("r", Expr::call_named("ref", vec![Expr::Int(0)])),
        Stmt::TryCatch {
            body: vec![
                Stmt::Defer {
                    body: vec![Stmt::expr(Expr::call_named(
                        "set_ref",
                        vec![
                            Expr::ident("r"),
                            Expr::binary(
                                BinaryOp::Add,
                                Expr::call_named("deref", vec![Expr::ident("r")]),
                                Expr::Int(1),
                            ),
                        ],
                    ))],
                    line: 3,
                },
                Stmt::Throw {
                    value: Expr::string("boom"),
                    line: 4,
                },
            ],
            catch_var: "e".to_string(),
            catch_body: vec![],
            line: 2,
        },
        ret(Expr::call_named("deref", vec![Expr::ident("r")])),
    ]);
    assert_eq!(run_ok(&program), int(1));
}

#[test]
fn test_uncaught_throw_carries_payload() {
    let program = main_fn(vec![Stmt::Throw {
        value: Expr::string("nobody catches this"),
        line: 7,
    }]);
    match run(&program) {
        Err(err) => {
            assert_eq!(err.kind, LatErrorKind::Thrown);
            assert_eq!(err.payload(), LatValue::string("nobody catches this"));
            assert_eq!(err.line, 7);
        }
        Ok(v) => panic!("expected throw, got {}", v),
    }
}

#[test]
fn test_try_unwrap_ok_err_and_nil() {
    // Ok unwraps
    let program = main_fn(vec![ret(Expr::binary(
        BinaryOp::Add,
        Expr::TryUnwrap(Box::new(Expr::EnumLit {
            enum_name: "Result".to_string(),
            variant: "Ok".to_string(),
            payload: vec![Expr::Int(4)],
        })),
        Expr::Int(1),
    ))]);
    assert_eq!(run_ok(&program), int(5));

    // Err throws (caught)
    let program = main_fn(vec![Stmt::TryCatch {
        body: vec![
            let_(
                "x",
                Expr::TryUnwrap(Box::new(Expr::EnumLit {
                    enum_name: "Result".to_string(),
                    variant: "Err".to_string(),
                    payload: vec![Expr::string("broken")],
                })),
            ),
            ret(Expr::Int(0)),
        ],
        catch_var: "e".to_string(),
        catch_body: vec![ret(Expr::ident("e"))],
        line: 1,
    }]);
    assert_eq!(run_ok(&program), LatValue::string("broken"));

    // nil short-circuits a nil return
    let inner = FnDecl::new(
        "maybe",
        vec![],
        vec![
            let_("x", Expr::TryUnwrap(Box::new(Expr::Nil))),
            ret(Expr::Int(99)),
        ],
    );
    let program = Program {
        items: vec![
            Item::Function(inner),
            Item::Function(FnDecl::new(
                "main",
                vec![],
                vec![ret(Expr::binary(
                    BinaryOp::Eq,
                    Expr::call_named("maybe", vec![]),
                    Expr::Nil,
                ))],
            )),
        ],
    };
    assert_eq!(run_ok(&program), LatValue::boolean(true));
}

#[test]
fn test_defer_at_scope_exit() {
    let append = |text: &str| {
        Stmt::expr(Expr::call_named(
            "set_ref",
            vec![
                Expr::ident("r"),
                Expr::binary(
                    BinaryOp::Add,
                    Expr::call_named("deref", vec![Expr::ident("r")]),
                    Expr::string(text),
                ),
            ],
        ))
    };
    let program = main_fn(vec![
        let_("r", Expr::call_named("ref", vec![Expr::string("")])),
        Stmt::If {
            cond: Expr::Bool(true),
            then_body: vec![
                Stmt::Defer {
                    body: vec![append("a")],
                    line: 3,
                },
                append("b"),
            ],
            else_body: None,
            line: 2,
        },
        append("c"),
        ret(Expr::call_named("deref", vec![Expr::ident("r")])),
    ]);
    assert_eq!(run_ok(&program), LatValue::string("bac"));
}

// --- data structures ---

#[test]
fn test_struct_literal_method_dispatch_and_pic() {
    let method = FnDecl::new(
        "sum",
        vec![],
        vec![ret(Expr::binary(
            BinaryOp::Add,
            Expr::field(Expr::ident("self"), "x"),
            Expr::field(Expr::ident("self"), "y"),
        ))],
    );
    let program = Program {
        items: vec![
            Item::Struct(StructDecl {
                name: "Point".to_string(),
                fields: vec!["x".to_string(), "y".to_string()],
                exported: false,
                line: 1,
            }),
            Item::Impl(ImplBlock {
                type_name: "Point".to_string(),
                trait_name: None,
                methods: vec![method],
                line: 2,
            }),
            Item::Function(FnDecl::new(
                "main",
                vec![],
                vec![
                    let_(
                        "p",
                        Expr::StructLit {
                            name: "Point".to_string(),
                            fields: vec![
                                ("x".to_string(), Expr::Int(3)),
                                ("y".to_string(), Expr::Int(4)),
                            ],
                        },
                    ),
                    let_("total", Expr::Int(0)),
                    // call twice so the second dispatch hits the cache
                    Stmt::Assign {
                        target: AssignTarget::Name("total".to_string()),
                        value: Expr::method(Expr::ident("p"), "sum", vec![]),
                        line: 4,
                    },
                    ret(Expr::binary(
                        BinaryOp::Add,
                        Expr::ident("total"),
                        Expr::method(Expr::ident("p"), "sum", vec![]),
                    )),
                ],
            )),
        ],
    };
    assert_eq!(run_ok(&program), int(14));
}

#[test]
fn test_map_index_insert_and_methods() {
    let program = main_fn(vec![
        let_(
            "m",
            Expr::MapLit(vec![
                (Expr::string("a"), Expr::Int(1)),
                (Expr::string("b"), Expr::Int(2)),
            ]),
        ),
        Stmt::Assign {
            target: AssignTarget::Index {
                target: Expr::ident("m"),
                index: Expr::string("c"),
            },
            value: Expr::Int(3),
            line: 2,
        },
        Stmt::expr(Expr::call_named(
            "assert",
            vec![Expr::binary(
                BinaryOp::Eq,
                Expr::method(Expr::ident("m"), "len", vec![]),
                Expr::Int(3),
            )],
        )),
        ret(Expr::binary(
            BinaryOp::Add,
            Expr::index(Expr::ident("m"), Expr::string("a")),
            Expr::index(Expr::ident("m"), Expr::string("c")),
        )),
    ]);
    assert_eq!(run_ok(&program), int(4));
}

#[test]
fn test_missing_map_index_is_nil() {
    let program = main_fn(vec![
        let_("m", Expr::MapLit(vec![])),
        ret(Expr::Logical {
            op: LogicalOp::NilCoalesce,
            lhs: Box::new(Expr::index(Expr::ident("m"), Expr::string("missing"))),
            rhs: Box::new(Expr::Int(7)),
        }),
    ]);
    assert_eq!(run_ok(&program), int(7));
}

#[test]
fn test_array_methods_and_slices() {
    let program = main_fn(vec![
        let_("xs", Expr::Array(vec![Expr::Int(1), Expr::Int(2)])),
        Stmt::expr(Expr::method(Expr::ident("xs"), "push", vec![Expr::Int(3)])),
        Stmt::expr(Expr::call_named(
            "assert",
            vec![Expr::method(
                Expr::ident("xs"),
                "contains",
                vec![Expr::Int(3)],
            )],
        )),
        let_(
            "mid",
            Expr::index(
                Expr::ident("xs"),
                Expr::Range {
                    start: Box::new(Expr::Int(1)),
                    end: Box::new(Expr::Int(3)),
                },
            ),
        ),
        ret(Expr::binary(
            BinaryOp::Add,
            Expr::call_named("len", vec![Expr::ident("mid")]),
            Expr::index(Expr::ident("mid"), Expr::Int(0)),
        )),
    ]);
    // len [2,3] + first element 2
    assert_eq!(run_ok(&program), int(4));
}

#[test]
fn test_slice_assignment() {
    let program = main_fn(vec![
        let_(
            "xs",
            Expr::Array(vec![Expr::Int(1), Expr::Int(2), Expr::Int(3), Expr::Int(4)]),
        ),
        Stmt::Assign {
            target: AssignTarget::Slice {
                target: Expr::ident("xs"),
                start: Expr::Int(1),
                end: Expr::Int(3),
            },
            value: Expr::Array(vec![Expr::Int(9)]),
            line: 2,
        },
        Stmt::expr(Expr::call_named(
            "assert",
            vec![Expr::binary(
                BinaryOp::Eq,
                Expr::call_named("len", vec![Expr::ident("xs")]),
                Expr::Int(3),
            )],
        )),
        ret(Expr::index(Expr::ident("xs"), Expr::Int(1))),
    ]);
    assert_eq!(run_ok(&program), int(9));
}

#[test]
fn test_tuple_is_crystal() {
    let program = main_fn(vec![
        let_(
            "t",
            Expr::Tuple(vec![Expr::Int(1), Expr::Array(vec![Expr::Int(2)])]),
        ),
        ret(Expr::call_named("phase_of", vec![Expr::ident("t")])),
    ]);
    assert_eq!(run_ok(&program), LatValue::string("crystal"));
}

#[test]
fn test_enum_variant_method() {
    let program = Program {
        items: vec![
            Item::Enum(EnumDecl {
                name: "Color".to_string(),
                variants: vec![("Red".to_string(), 0), ("Rgb".to_string(), 3)],
                exported: false,
                line: 1,
            }),
            Item::Function(FnDecl::new(
                "main",
                vec![],
                vec![
                    let_(
                        "c",
                        Expr::EnumLit {
                            enum_name: "Color".to_string(),
                            variant: "Rgb".to_string(),
                            payload: vec![Expr::Int(1), Expr::Int(2), Expr::Int(3)],
                        },
                    ),
                    ret(Expr::method(Expr::ident("c"), "variant", vec![])),
                ],
            )),
        ],
    };
    assert_eq!(run_ok(&program), LatValue::string("Rgb"));
}

#[test]
fn test_match_array_pattern_with_rest() {
    let program = main_fn(vec![ret(Expr::Match {
        scrutinee: Box::new(Expr::Array(vec![
            Expr::Int(1),
            Expr::Int(2),
            Expr::Int(3),
        ])),
        arms: vec![
            MatchArm {
                pattern: Pattern::Array {
                    prefix: vec![Pattern::Literal(Expr::Int(1))],
                    rest: Some(Some("rest".to_string())),
                    suffix: vec![],
                },
                guard: None,
                body: Expr::call_named("len", vec![Expr::ident("rest")]),
                line: 1,
            },
            MatchArm {
                pattern: Pattern::Wildcard { phase: None },
                guard: None,
                body: Expr::Int(-1),
                line: 1,
            },
        ],
    })]);
    assert_eq!(run_ok(&program), int(2));
}

#[test]
fn test_match_array_pattern_end_relative() {
    // [.., last] matches and binds the final element
    let program = main_fn(vec![ret(Expr::Match {
        scrutinee: Box::new(Expr::Array(vec![
            Expr::Int(5),
            Expr::Int(6),
            Expr::Int(7),
        ])),
        arms: vec![MatchArm {
            pattern: Pattern::Array {
                prefix: vec![],
                rest: Some(None),
                suffix: vec![Pattern::Binding("last".to_string())],
            },
            guard: None,
            body: Expr::ident("last"),
            line: 1,
        }],
    })]);
    assert_eq!(run_ok(&program), int(7));
}

#[test]
fn test_match_struct_pattern() {
    let program = Program {
        items: vec![
            Item::Struct(StructDecl {
                name: "P".to_string(),
                fields: vec!["x".to_string(), "y".to_string()],
                exported: false,
                line: 1,
            }),
            Item::Function(FnDecl::new(
                "main",
                vec![],
                vec![ret(Expr::Match {
                    scrutinee: Box::new(Expr::StructLit {
                        name: "P".to_string(),
                        fields: vec![
                            ("x".to_string(), Expr::Int(1)),
                            ("y".to_string(), Expr::Int(2)),
                        ],
                    }),
                    arms: vec![
                        MatchArm {
                            pattern: Pattern::Struct {
                                name: "P".to_string(),
                                fields: vec![
                                    ("x".to_string(), Pattern::Literal(Expr::Int(1))),
                                    ("y".to_string(), Pattern::Binding("n".to_string())),
                                ],
                            },
                            guard: None,
                            body: Expr::ident("n"),
                            line: 2,
                        },
                        MatchArm {
                            pattern: Pattern::Wildcard { phase: None },
                            guard: None,
                            body: Expr::Int(0),
                            line: 3,
                        },
                    ],
                })],
            )),
        ],
    };
    assert_eq!(run_ok(&program), int(2));
}

#[test]
fn test_match_no_arm_yields_nil() {
    let program = main_fn(vec![ret(Expr::Match {
        scrutinee: Box::new(Expr::Int(9)),
        arms: vec![MatchArm {
            pattern: Pattern::Literal(Expr::Int(1)),
            guard: None,
            body: Expr::string("one"),
            line: 1,
        }],
    })]);
    assert_eq!(run_ok(&program), LatValue::nil());
}

#[test]
fn test_match_range_and_phase_patterns() {
    let program = main_fn(vec![
        let_("frozen", Expr::Freeze {
            target: PhaseTarget::Value(Box::new(Expr::Array(vec![Expr::Int(1)]))),
            except: vec![],
        }),
        let_(
            "a",
            Expr::Match {
                scrutinee: Box::new(Expr::Int(42)),
                arms: vec![
                    MatchArm {
                        pattern: Pattern::Range { start: 0, end: 10 },
                        guard: None,
                        body: Expr::string("small"),
                        line: 2,
                    },
                    MatchArm {
                        pattern: Pattern::Range { start: 10, end: 100 },
                        guard: None,
                        body: Expr::string("medium"),
                        line: 3,
                    },
                    MatchArm {
                        pattern: Pattern::Wildcard { phase: None },
                        guard: None,
                        body: Expr::string("large"),
                        line: 4,
                    },
                ],
            },
        ),
        let_(
            "b",
            Expr::Match {
                scrutinee: Box::new(Expr::ident("frozen")),
                arms: vec![
                    MatchArm {
                        pattern: Pattern::Wildcard {
                            phase: Some(lattice_core::phase::Phase::Crystal),
                        },
                        guard: None,
                        body: Expr::string("crystal"),
                        line: 5,
                    },
                    MatchArm {
                        pattern: Pattern::Wildcard { phase: None },
                        guard: None,
                        body: Expr::string("other"),
                        line: 6,
                    },
                ],
            },
        ),
        ret(Expr::binary(
            BinaryOp::Add,
            Expr::ident("a"),
            Expr::ident("b"),
        )),
    ]);
    assert_eq!(run_ok(&program), LatValue::string("mediumcrystal"));
}

// --- phase forms ---

#[test]
fn test_freeze_var_in_place() {
    let program = main_fn(vec![
        let_("a", Expr::Array(vec![Expr::Int(1)])),
        Stmt::expr(Expr::Freeze {
            target: PhaseTarget::Var("a".to_string()),
            except: vec![],
        }),
        ret(Expr::call_named("phase_of", vec![Expr::ident("a")])),
    ]);
    assert_eq!(run_ok(&program), LatValue::string("crystal"));
}

#[test]
fn test_thaw_var_in_place() {
    let program = main_fn(vec![
        let_("a", Expr::Array(vec![Expr::Int(1)])),
        Stmt::expr(Expr::Freeze {
            target: PhaseTarget::Var("a".to_string()),
            except: vec![],
        }),
        Stmt::expr(Expr::Thaw(PhaseTarget::Var("a".to_string()))),
        Stmt::expr(Expr::method(Expr::ident("a"), "push", vec![Expr::Int(2)])),
        ret(Expr::call_named("len", vec![Expr::ident("a")])),
    ]);
    assert_eq!(run_ok(&program), int(2));
}

#[test]
fn test_freeze_field_partial() {
    let program = main_fn(vec![
        let_(
            "m",
            Expr::MapLit(vec![
                (Expr::string("config"), Expr::Array(vec![Expr::Int(1)])),
                (Expr::string("log"), Expr::Array(vec![])),
            ]),
        ),
        Stmt::expr(Expr::Freeze {
            target: PhaseTarget::Field {
                object: "m".to_string(),
                field: "config".to_string(),
            },
            except: vec![],
        }),
        let_("blocked", Expr::Bool(false)),
        Stmt::TryCatch {
            body: vec![Stmt::Assign {
                target: AssignTarget::Index {
                    target: Expr::ident("m"),
                    index: Expr::string("config"),
                },
                value: Expr::Int(9),
                line: 4,
            }],
            catch_var: "e".to_string(),
            catch_body: vec![Stmt::Assign {
                target: AssignTarget::Name("blocked".to_string()),
                value: Expr::Bool(true),
                line: 4,
            }],
            line: 4,
        },
        Stmt::expr(Expr::call_named("assert", vec![Expr::ident("blocked")])),
        // the other key stays writable
        Stmt::Assign {
            target: AssignTarget::Index {
                target: Expr::ident("m"),
                index: Expr::string("log"),
            },
            value: Expr::Int(1),
            line: 6,
        },
        ret(Expr::index(Expr::ident("m"), Expr::string("log"))),
    ]);
    assert_eq!(run_ok(&program), int(1));
}

#[test]
fn test_freeze_except() {
    let program = Program {
        items: vec![
            Item::Struct(StructDecl {
                name: "Account".to_string(),
                fields: vec!["id".to_string(), "log".to_string()],
                exported: false,
                line: 1,
            }),
            Item::Function(FnDecl::new(
                "main",
                vec![],
                vec![
                    let_(
                        "acct",
                        Expr::StructLit {
                            name: "Account".to_string(),
                            fields: vec![
                                ("id".to_string(), Expr::Int(1)),
                                ("log".to_string(), Expr::Array(vec![])),
                            ],
                        },
                    ),
                    Stmt::expr(Expr::Freeze {
                        target: PhaseTarget::Var("acct".to_string()),
                        except: vec!["log".to_string()],
                    }),
                    let_("blocked", Expr::Bool(false)),
                    Stmt::TryCatch {
                        body: vec![Stmt::Assign {
                            target: AssignTarget::Field {
                                target: Expr::ident("acct"),
                                field: "id".to_string(),
                            },
                            value: Expr::Int(9),
                            line: 4,
                        }],
                        catch_var: "e".to_string(),
                        catch_body: vec![Stmt::Assign {
                            target: AssignTarget::Name("blocked".to_string()),
                            value: Expr::Bool(true),
                            line: 4,
                        }],
                        line: 4,
                    },
                    Stmt::expr(Expr::call_named("assert", vec![Expr::ident("blocked")])),
                    Stmt::Assign {
                        target: AssignTarget::Field {
                            target: Expr::ident("acct"),
                            field: "log".to_string(),
                        },
                        value: Expr::Array(vec![Expr::Int(1)]),
                        line: 6,
                    },
                    ret(Expr::call_named(
                        "len",
                        vec![Expr::field(Expr::ident("acct"), "log")],
                    )),
                ],
            )),
        ],
    };
    assert_eq!(run_ok(&program), int(1));
}

#[test]
fn test_crystallize_window() {
    let program = main_fn(vec![
        let_("a", Expr::Array(vec![Expr::Int(1)])),
        let_(
            "inside",
            Expr::Crystallize {
                target: "a".to_string(),
                body: Block::of_expr(Expr::call_named("phase_of", vec![Expr::ident("a")])),
            },
        ),
        Stmt::expr(Expr::call_named(
            "assert",
            vec![Expr::binary(
                BinaryOp::Eq,
                Expr::ident("inside"),
                Expr::string("crystal"),
            )],
        )),
        ret(Expr::call_named("phase_of", vec![Expr::ident("a")])),
    ]);
    assert_eq!(run_ok(&program), LatValue::string("fluid"));
}

#[test]
fn test_borrow_window() {
    let program = main_fn(vec![
        let_("a", Expr::Array(vec![Expr::Int(1)])),
        Stmt::expr(Expr::Freeze {
            target: PhaseTarget::Var("a".to_string()),
            except: vec![],
        }),
        let_(
            "inside",
            Expr::Borrow {
                target: "a".to_string(),
                body: Block::of_expr(Expr::call_named("phase_of", vec![Expr::ident("a")])),
            },
        ),
        Stmt::expr(Expr::call_named(
            "assert",
            vec![Expr::binary(
                BinaryOp::Eq,
                Expr::ident("inside"),
                Expr::string("fluid"),
            )],
        )),
        ret(Expr::call_named("phase_of", vec![Expr::ident("a")])),
    ]);
    assert_eq!(run_ok(&program), LatValue::string("crystal"));
}

#[test]
fn test_forge_returns_frozen() {
    let program = main_fn(vec![ret(Expr::call_named(
        "phase_of",
        vec![Expr::Forge {
            body: Block::of_expr(Expr::Array(vec![Expr::Int(1), Expr::Int(2)])),
        }],
    ))]);
    assert_eq!(run_ok(&program), LatValue::string("crystal"));
}

#[test]
fn test_anneal_mutation_window() {
    let program = main_fn(vec![
        let_("a", Expr::Array(vec![Expr::Int(1), Expr::Int(2)])),
        Stmt::expr(Expr::Freeze {
            target: PhaseTarget::Var("a".to_string()),
            except: vec![],
        }),
        Stmt::expr(Expr::Anneal {
            target: Box::new(Expr::ident("a")),
            func: Box::new(Expr::Closure {
                params: vec![Param::plain("v")],
                variadic: None,
                body: vec![
                    Stmt::expr(Expr::method(Expr::ident("v"), "push", vec![Expr::Int(3)])),
                    ret(Expr::ident("v")),
                ],
            }),
        }),
        Stmt::expr(Expr::call_named(
            "assert",
            vec![Expr::binary(
                BinaryOp::Eq,
                Expr::call_named("phase_of", vec![Expr::ident("a")]),
                Expr::string("crystal"),
            )],
        )),
        ret(Expr::call_named("len", vec![Expr::ident("a")])),
    ]);
    assert_eq!(run_ok(&program), int(3));
}

#[test]
fn test_anneal_on_fluid_fails() {
    let program = main_fn(vec![
        let_("a", Expr::Array(vec![Expr::Int(1)])),
        Stmt::expr(Expr::Anneal {
            target: Box::new(Expr::ident("a")),
            func: Box::new(Expr::Closure {
                params: vec![Param::plain("v")],
                variadic: None,
                body: vec![ret(Expr::ident("v"))],
            }),
        }),
        ret(Expr::Int(0)),
    ]);
    match run(&program) {
        Err(err) => assert_eq!(err.kind, LatErrorKind::Phase),
        Ok(v) => panic!("expected phase error, got {}", v),
    }
}

#[test]
fn test_sublimate_thaws() {
    let program = main_fn(vec![
        let_("a", Expr::Freeze {
            target: PhaseTarget::Value(Box::new(Expr::Array(vec![Expr::Int(1)]))),
            except: vec![],
        }),
        let_("b", Expr::Sublimate(Box::new(Expr::ident("a")))),
        ret(Expr::call_named("phase_of", vec![Expr::ident("b")])),
    ]);
    assert_eq!(run_ok(&program), LatValue::string("fluid"));
}

// --- concurrency ---

#[test]
fn test_scope_spawns_and_joins() {
    let send_stmt = |n: i64| {
        Stmt::expr(Expr::call_named(
            "send",
            vec![Expr::ident("ch"), Expr::Int(n)],
        ))
    };
    let program = main_fn(vec![
        let_("ch", Expr::call_named("channel", vec![Expr::Int(4)])),
        ret(Expr::Scope {
            spawns: vec![
                Block::of_stmts(vec![send_stmt(21)]),
                Block::of_stmts(vec![send_stmt(21)]),
            ],
            sync: Block::of_expr(Expr::binary(
                BinaryOp::Add,
                Expr::call_named("recv", vec![Expr::ident("ch")]),
                Expr::call_named("recv", vec![Expr::ident("ch")]),
            )),
        }),
    ]);
    assert_eq!(run_ok(&program), int(42));
}

#[test]
fn test_scope_spawn_error_cancels() {
    let program = main_fn(vec![ret(Expr::Scope {
        spawns: vec![Block::of_stmts(vec![Stmt::Throw {
            value: Expr::string("spawn failed"),
            line: 2,
        }])],
        sync: Block::of_expr(Expr::Int(1)),
    })]);
    match run(&program) {
        Err(err) => assert_eq!(err.payload(), LatValue::string("spawn failed")),
        Ok(v) => panic!("expected scope error, got {}", v),
    }
}

#[test]
fn test_select_ready_channel() {
    let program = main_fn(vec![
        let_("ch", Expr::call_named("channel", vec![Expr::Int(1)])),
        Stmt::expr(Expr::call_named(
            "send",
            vec![Expr::ident("ch"), Expr::Int(7)],
        )),
        ret(Expr::Select {
            arms: vec![
                SelectArm {
                    kind: SelectArmKind::Recv(Expr::ident("ch")),
                    binding: Some("v".to_string()),
                    body: Block::of_expr(Expr::binary(
                        BinaryOp::Add,
                        Expr::ident("v"),
                        Expr::Int(1),
                    )),
                    line: 3,
                },
                SelectArm {
                    kind: SelectArmKind::Timeout(Expr::Int(1000)),
                    binding: None,
                    body: Block::of_expr(Expr::Int(-1)),
                    line: 4,
                },
            ],
        }),
    ]);
    assert_eq!(run_ok(&program), int(8));
}

#[test]
fn test_select_default_arm() {
    let program = main_fn(vec![
        let_("ch", Expr::call_named("channel", vec![Expr::Int(1)])),
        ret(Expr::Select {
            arms: vec![
                SelectArm {
                    kind: SelectArmKind::Recv(Expr::ident("ch")),
                    binding: Some("v".to_string()),
                    body: Block::of_expr(Expr::ident("v")),
                    line: 2,
                },
                SelectArm {
                    kind: SelectArmKind::Default,
                    binding: None,
                    body: Block::of_expr(Expr::Int(99)),
                    line: 3,
                },
            ],
        }),
    ]);
    assert_eq!(run_ok(&program), int(99));
}

#[test]
fn test_select_timeout_fires() {
    let program = main_fn(vec![
        let_("ch", Expr::call_named("channel", vec![Expr::Int(1)])),
        ret(Expr::Select {
            arms: vec![
                SelectArm {
                    kind: SelectArmKind::Recv(Expr::ident("ch")),
                    binding: None,
                    body: Block::of_expr(Expr::Int(-1)),
                    line: 2,
                },
                SelectArm {
                    kind: SelectArmKind::Timeout(Expr::Int(10)),
                    binding: None,
                    body: Block::of_expr(Expr::Int(5)),
                    line: 3,
                },
            ],
        }),
    ]);
    assert_eq!(run_ok(&program), int(5));
}

// --- modules ---

#[test]
fn test_import_binds_exports() {
    let mut double = FnDecl::new(
        "double",
        vec![Param::plain("x")],
        vec![ret(Expr::binary(BinaryOp::Mul, Expr::ident("x"), Expr::Int(2)))],
    );
    double.exported = true;
    let module = Program {
        items: vec![Item::Function(double)],
    };
    let module_chunk = compile_module(&module).unwrap();
    assert!(module_chunk.has_exports);
    assert_eq!(module_chunk.export_names, vec!["double".to_string()]);

    let registry = Arc::new(ModuleRegistry::new());
    registry.register("math", module_chunk);

    let program = main_fn(vec![
        Stmt::Import {
            module: "math".to_string(),
            line: 1,
        },
        ret(Expr::call_named("math::double", vec![Expr::Int(21)])),
    ]);
    let chunk = compile(&program).unwrap();
    let mut vm = Vm::new().with_modules(registry);
    assert_eq!(vm.run_chunk(chunk).unwrap(), int(42));
}

#[test]
fn test_import_unknown_module_errors() {
    let program = main_fn(vec![Stmt::Import {
        module: "nonexistent".to_string(),
        line: 1,
    }]);
    match run(&program) {
        Err(err) => assert_eq!(err.kind, LatErrorKind::MissingModule),
        Ok(v) => panic!("expected module error, got {}", v),
    }
}

// --- strings and misc ---

#[test]
fn test_string_concat_and_methods() {
    let program = main_fn(vec![
        let_("s", Expr::string("Hello, World")),
        Stmt::expr(Expr::call_named(
            "assert",
            vec![Expr::method(
                Expr::ident("s"),
                "starts_with",
                vec![Expr::string("Hello")],
            )],
        )),
        ret(Expr::method(
            Expr::method(Expr::ident("s"), "split", vec![Expr::string(", ")]),
            "len",
            vec![],
        )),
    ]);
    assert_eq!(run_ok(&program), int(2));
}

#[test]
fn test_append_str_local_fast_path() {
    let program = main_fn(vec![
        let_("s", Expr::string("ab")),
        Stmt::Assign {
            target: AssignTarget::Name("s".to_string()),
            value: Expr::binary(BinaryOp::Add, Expr::ident("s"), Expr::string("cd")),
            line: 2,
        },
        ret(Expr::ident("s")),
    ]);
    assert_eq!(run_ok(&program), LatValue::string("abcd"));
}

#[test]
fn test_divide_by_zero_throws() {
    let program = main_fn(vec![
        let_("zero", Expr::Int(0)),
        ret(Expr::binary(BinaryOp::Div, Expr::Int(1), Expr::ident("zero"))),
    ]);
    match run(&program) {
        Err(err) => assert_eq!(err.kind, LatErrorKind::DivideByZero),
        Ok(v) => panic!("expected divide-by-zero, got {}", v),
    }
}

#[test]
fn test_gc_collects_loop_garbage() {
    let program = main_fn(vec![
        let_("keep", Expr::Array(vec![Expr::Int(1)])),
        Stmt::ForIn {
            var: "i".to_string(),
            iterable: Expr::Range {
                start: Box::new(Expr::Int(0)),
                end: Box::new(Expr::Int(50)),
            },
            body: vec![let_("tmp", Expr::Array(vec![Expr::ident("i")]))],
            line: 2,
        },
        let_("freed", Expr::call_named("gc", vec![])),
        Stmt::expr(Expr::call_named(
            "assert",
            vec![Expr::binary(
                BinaryOp::GtEq,
                Expr::ident("freed"),
                Expr::Int(50),
            )],
        )),
        ret(Expr::call_named("len", vec![Expr::ident("keep")])),
    ]);
    assert_eq!(run_ok(&program), int(1));
}

#[test]
fn test_compile_then_run_is_deterministic() {
    let program = main_fn(vec![
        let_("xs", Expr::Array(vec![Expr::Int(3), Expr::Int(4)])),
        ret(Expr::binary(
            BinaryOp::Add,
            Expr::index(Expr::ident("xs"), Expr::Int(0)),
            Expr::index(Expr::ident("xs"), Expr::Int(1)),
        )),
    ]);
    let chunk_a = compile(&program).unwrap();
    let chunk_b = compile(&program).unwrap();
    assert_eq!(chunk_a.code, chunk_b.code, "identical bytecode");
    let result_a = Vm::new().run_chunk(chunk_a).unwrap();
    let result_b = Vm::new().run_chunk(chunk_b).unwrap();
    assert_eq!(result_a, result_b);
    assert_eq!(result_a, int(7));
}

#[test]
fn test_chunk_persist_and_reload_runs_identically() {
    use lattice_core::chunk::Chunk;
    let program = main_fn(vec![ret(Expr::binary(
        BinaryOp::Mul,
        Expr::Int(6),
        Expr::ident("seven"),
    ))]);
    let program = Program {
        items: {
            let mut items = vec![Item::Stmt(let_("seven", Expr::Int(7)))];
            items.extend(program.items);
            items
        },
    };
    let chunk = compile(&program).unwrap();
    let bytes = chunk.to_bytes().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("program.latb");
    std::fs::write(&path, &bytes).unwrap();
    let loaded = Chunk::from_bytes(&std::fs::read(&path).unwrap()).unwrap();

    assert_eq!(Vm::new().run_chunk(Arc::new(loaded)).unwrap(), int(42));
}
