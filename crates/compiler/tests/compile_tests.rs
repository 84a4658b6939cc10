//! Compiler-level tests: chunk structure, modes, and compile errors.

use lattice_compiler::ast::*;
use lattice_compiler::{compile, compile_repl, compile_with_config, CompileMode, CompilerConfig};
use lattice_core::error::CompileErrorKind;
use lattice_core::opcode::Opcode;
use lattice_core::value::{LatValue, ValueKind};
use lattice_runtime::Vm;

fn let_(name: &str, value: Expr) -> Stmt {
    Stmt::Let {
        name: name.to_string(),
        value,
        line: 1,
    }
}

#[test]
fn test_repl_preserves_last_expression() {
    let program = Program {
        items: vec![
            Item::Stmt(let_("x", Expr::Int(20))),
            Item::Stmt(Stmt::expr(Expr::binary(
                BinaryOp::Add,
                Expr::ident("x"),
                Expr::Int(2),
            ))),
        ],
    };
    let chunk = compile_repl(&program).unwrap();
    // REPL chunks reset the ephemeral arena up front.
    assert_eq!(chunk.code[0], Opcode::ResetEphemeral as u8);
    let result = Vm::new().run_chunk(chunk).unwrap();
    assert_eq!(result, LatValue::int(22));
}

#[test]
fn test_script_without_main_returns_unit() {
    let program = Program {
        items: vec![Item::Stmt(let_("x", Expr::Int(1)))],
    };
    let chunk = compile(&program).unwrap();
    let result = Vm::new().run_chunk(chunk).unwrap();
    assert_eq!(result, LatValue::unit());
}

#[test]
fn test_folding_can_be_disabled() {
    let program = Program {
        items: vec![Item::Function(FnDecl::new(
            "main",
            vec![],
            vec![Stmt::Return {
                value: Some(Expr::binary(BinaryOp::Add, Expr::Int(2), Expr::Int(3))),
                line: 1,
            }],
        ))],
    };
    let config = CompilerConfig::new().without_folding();
    let chunk = compile_with_config(&program, &config, CompileMode::Script).unwrap();
    let proto = chunk
        .constants
        .iter()
        .find_map(|c| match &c.kind {
            ValueKind::Function(p) => Some(p.clone()),
            _ => None,
        })
        .unwrap();
    assert!(proto.chunk.code.contains(&(Opcode::Add as u8)));
    assert_eq!(Vm::new().run_chunk(chunk).unwrap(), LatValue::int(5));
}

#[test]
fn test_break_outside_loop_is_a_compile_error() {
    let program = Program {
        items: vec![Item::Stmt(Stmt::Break { line: 3 })],
    };
    match compile(&program) {
        Err(err) => {
            assert_eq!(err.kind, CompileErrorKind::LoopControlOutsideLoop);
            assert_eq!(err.to_string(), "3:1: break outside of a loop");
        }
        Ok(_) => panic!("expected compile error"),
    }
}

#[test]
fn test_continue_outside_loop_is_a_compile_error() {
    let program = Program {
        items: vec![Item::Stmt(Stmt::Continue { line: 9 })],
    };
    match compile(&program) {
        Err(err) => assert_eq!(err.kind, CompileErrorKind::LoopControlOutsideLoop),
        Ok(_) => panic!("expected compile error"),
    }
}

#[test]
fn test_struct_literal_field_mismatch_is_rejected() {
    let program = Program {
        items: vec![
            Item::Struct(StructDecl {
                name: "P".to_string(),
                fields: vec!["x".to_string()],
                exported: false,
                line: 1,
            }),
            Item::Stmt(let_(
                "p",
                Expr::StructLit {
                    name: "P".to_string(),
                    fields: vec![("y".to_string(), Expr::Int(1))],
                },
            )),
        ],
    };
    assert!(compile(&program).is_err());
}

#[test]
fn test_enum_literal_arity_checked() {
    let program = Program {
        items: vec![
            Item::Enum(EnumDecl {
                name: "Color".to_string(),
                variants: vec![("Rgb".to_string(), 3)],
                exported: false,
                line: 1,
            }),
            Item::Stmt(let_(
                "c",
                Expr::EnumLit {
                    enum_name: "Color".to_string(),
                    variant: "Rgb".to_string(),
                    payload: vec![Expr::Int(1)],
                },
            )),
        ],
    };
    assert!(compile(&program).is_err());
}

#[test]
fn test_trait_impl_requires_methods() {
    let trait_decl = TraitDecl {
        name: "Show".to_string(),
        required: vec!["show".to_string()],
        defaults: vec![],
        line: 1,
    };
    let missing = Program {
        items: vec![
            Item::Trait(trait_decl.clone()),
            Item::Struct(StructDecl {
                name: "P".to_string(),
                fields: vec!["x".to_string()],
                exported: false,
                line: 2,
            }),
            Item::Impl(ImplBlock {
                type_name: "P".to_string(),
                trait_name: Some("Show".to_string()),
                methods: vec![],
                line: 3,
            }),
        ],
    };
    assert!(compile(&missing).is_err());
}

#[test]
fn test_trait_default_method_is_copied_into_impl() {
    let default_method = FnDecl::new(
        "describe",
        vec![],
        vec![Stmt::Return {
            value: Some(Expr::string("something")),
            line: 1,
        }],
    );
    let program = Program {
        items: vec![
            Item::Trait(TraitDecl {
                name: "Describe".to_string(),
                required: vec![],
                defaults: vec![default_method],
                line: 1,
            }),
            Item::Struct(StructDecl {
                name: "P".to_string(),
                fields: vec!["x".to_string()],
                exported: false,
                line: 2,
            }),
            Item::Impl(ImplBlock {
                type_name: "P".to_string(),
                trait_name: Some("Describe".to_string()),
                methods: vec![],
                line: 3,
            }),
            Item::Function(FnDecl::new(
                "main",
                vec![],
                vec![
                    let_(
                        "p",
                        Expr::StructLit {
                            name: "P".to_string(),
                            fields: vec![("x".to_string(), Expr::Int(1))],
                        },
                    ),
                    Stmt::Return {
                        value: Some(Expr::method(Expr::ident("p"), "describe", vec![])),
                        line: 5,
                    },
                ],
            )),
        ],
    };
    let result = Vm::new().run_chunk(compile(&program).unwrap()).unwrap();
    assert_eq!(result, LatValue::string("something"));
}

#[test]
fn test_test_items_are_exported() {
    let program = Program {
        items: vec![Item::Test(TestDecl {
            name: "adds".to_string(),
            body: vec![Stmt::expr(Expr::call_named(
                "assert",
                vec![Expr::binary(
                    BinaryOp::Eq,
                    Expr::binary(BinaryOp::Add, Expr::Int(1), Expr::Int(1)),
                    Expr::Int(2),
                )],
            ))],
            line: 1,
        })],
    };
    let chunk = compile(&program).unwrap();
    assert!(chunk.export_names.contains(&"test:adds".to_string()));

    let mut vm = Vm::new();
    vm.run_chunk(chunk).unwrap();
    let test_fn = vm.globals().lookup("test:adds").expect("test defined");
    vm.call_value_with(&test_fn, vec![]).expect("test passes");
}

#[test]
fn test_disassembly_lists_nested_functions() {
    let program = Program {
        items: vec![Item::Function(FnDecl::new(
            "main",
            vec![],
            vec![Stmt::Return {
                value: Some(Expr::Int(200)),
                line: 1,
            }],
        ))],
    };
    let chunk = compile(&program).unwrap();
    let listing = chunk.disassemble("script");
    assert!(listing.contains("== script =="));
    assert!(listing.contains("== main =="));
    assert!(listing.contains("CONSTANT"));
    assert!(listing.contains("RETURN"));
}

#[test]
fn test_line_numbers_flow_into_runtime_errors() {
    let program = Program {
        items: vec![Item::Function(FnDecl::new(
            "main",
            vec![],
            vec![Stmt::Throw {
                value: Expr::string("here"),
                line: 41,
            }],
        ))],
    };
    match Vm::new().run_chunk(compile(&program).unwrap()) {
        Err(err) => assert_eq!(err.line, 41),
        Ok(_) => panic!("expected throw"),
    }
}

#[test]
fn test_param_type_annotation_is_checked() {
    let decl = FnDecl::new(
        "takes_int",
        vec![Param {
            name: "n".to_string(),
            default: None,
            phase: None,
            type_name: Some("int".to_string()),
        }],
        vec![Stmt::Return {
            value: Some(Expr::ident("n")),
            line: 1,
        }],
    );
    let ok = Program {
        items: vec![
            Item::Function(decl.clone()),
            Item::Function(FnDecl::new(
                "main",
                vec![],
                vec![Stmt::Return {
                    value: Some(Expr::call_named("takes_int", vec![Expr::Int(3)])),
                    line: 2,
                }],
            )),
        ],
    };
    assert_eq!(
        Vm::new().run_chunk(compile(&ok).unwrap()).unwrap(),
        LatValue::int(3)
    );

    let bad = Program {
        items: vec![
            Item::Function(decl),
            Item::Function(FnDecl::new(
                "main",
                vec![],
                vec![Stmt::Return {
                    value: Some(Expr::call_named("takes_int", vec![Expr::string("x")])),
                    line: 2,
                }],
            )),
        ],
    };
    match Vm::new().run_chunk(compile(&bad).unwrap()) {
        Err(err) => assert_eq!(
            err.message,
            "require failed in 'takes_int': parameter 'n' must be int"
        ),
        Ok(v) => panic!("expected contract error, got {}", v),
    }
}

#[test]
fn test_return_type_annotation_is_checked() {
    let mut decl = FnDecl::new(
        "gives_int",
        vec![],
        vec![Stmt::Return {
            value: Some(Expr::string("not an int")),
            line: 1,
        }],
    );
    decl.return_type = Some("int".to_string());
    let program = Program {
        items: vec![
            Item::Function(decl),
            Item::Function(FnDecl::new(
                "main",
                vec![],
                vec![Stmt::Return {
                    value: Some(Expr::call_named("gives_int", vec![])),
                    line: 2,
                }],
            )),
        ],
    };
    match Vm::new().run_chunk(compile(&program).unwrap()) {
        Err(err) => assert_eq!(
            err.message,
            "ensure failed in 'gives_int': return value must be int"
        ),
        Ok(v) => panic!("expected contract error, got {}", v),
    }
}

#[test]
fn test_globals_use_wide_operands_when_pool_grows() {
    // Force more than 256 constants so global access needs 16-bit
    // operands, then check the program still runs.
    let mut items: Vec<Item> = (0..300)
        .map(|i| {
            Item::Stmt(let_(
                &format!("g{}", i),
                Expr::string(format!("value-{}", i)),
            ))
        })
        .collect();
    items.push(Item::Function(FnDecl::new(
        "main",
        vec![],
        vec![Stmt::Return {
            value: Some(Expr::ident("g299")),
            line: 1,
        }],
    )));
    let program = Program { items };
    let chunk = compile(&program).unwrap();
    assert!(chunk.constants.len() > 256);
    let result = Vm::new().run_chunk(chunk).unwrap();
    assert_eq!(result, LatValue::string("value-299"));
}
