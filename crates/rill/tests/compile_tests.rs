use pretty_assertions::assert_eq;
use rill::{Error, Limits, MULT_RET, Op, Proto, compile, compile_with_limits};

fn chunk(source: &str) -> Proto {
    compile(source, "test").expect("compilation failed")
}

fn err(source: &str) -> Error {
    compile(source, "test").expect_err("compilation unexpectedly succeeded")
}

fn syntax_message(e: &Error) -> String {
    match e {
        Error::Syntax { message, .. } => message.clone(),
        other => panic!("expected a syntax error, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Locals, expressions, returns
// ---------------------------------------------------------------------------

#[test]
fn locals_and_arithmetic() {
    let proto = chunk("local x = 1; local y = x + 2; return y");
    assert_eq!(
        proto.code,
        vec![
            Op::PushInt(1),
            Op::GetLocal(0),
            Op::PushInt(2),
            Op::Add,
            Op::GetLocal(1),
            Op::Return(2),
            Op::Return(2),
        ]
    );
    assert_eq!(proto.locvars.len(), 2);
    assert_eq!(proto.locvars[0].name, "x");
    assert_eq!(proto.locvars[1].name, "y");
    assert_eq!(proto.max_stack, 3);
    assert_eq!(proto.num_params, 0);
    assert_eq!(proto.num_upvalues, 0);
}

#[test]
fn line_info_parallels_code_with_sentinel() {
    let proto = chunk("local x = 1\nlocal y = 2\nreturn x");
    assert_eq!(proto.lines.len(), proto.code.len() + 1);
    assert_eq!(proto.lines.last(), Some(&u32::MAX));
    // the PushInt(2) initializer sits on line 2
    assert_eq!(proto.lines[1], 2);
}

#[test]
fn uninitialized_locals_get_nils() {
    let proto = chunk("local a, b, c");
    assert_eq!(proto.code, vec![Op::PushNil(3), Op::Return(3)]);
}

#[test]
fn numeric_literals_use_the_constant_pool_when_needed() {
    let proto = chunk("return 100, 0.5, 0.5");
    assert_eq!(
        proto.code,
        vec![
            Op::PushInt(100),
            Op::PushNum(0),
            Op::PushNum(0),
            Op::Return(0),
            Op::Return(0),
        ]
    );
    assert_eq!(proto.numbers, vec![0.5]);
}

#[test]
fn string_constants_are_deduplicated() {
    let proto = chunk(r#"x = "a" .. "a" .. "b""#);
    assert_eq!(proto.strings.len(), 3); // "x", "a", "b"
}

#[test]
fn unary_minus_folds_into_literals() {
    let proto = chunk("return -5");
    assert_eq!(proto.code, vec![Op::PushInt(-5), Op::Return(0), Op::Return(0)]);
}

#[test]
fn parenthesized_expressions_pass_through() {
    let proto = chunk("return (1 + 2) * 3");
    assert_eq!(
        proto.code,
        vec![
            Op::PushInt(1),
            Op::PushInt(2),
            Op::Add,
            Op::PushInt(3),
            Op::Mul,
            Op::Return(0),
            Op::Return(0),
        ]
    );
}

// ---------------------------------------------------------------------------
// Short-circuit operators
// ---------------------------------------------------------------------------

#[test]
fn and_keeps_the_tested_value_in_expression_context() {
    // "x" is interned first (assignment target), then "a" and "b"
    let proto = chunk("x = a and b");
    assert_eq!(
        proto.code,
        vec![
            Op::GetGlobal(1),
            Op::JumpOnFalse(1),
            Op::GetGlobal(2),
            Op::SetGlobal(0),
            Op::Return(0),
        ]
    );
}

#[test]
fn or_keeps_the_tested_value_in_expression_context() {
    let proto = chunk("x = a or b");
    assert_eq!(
        proto.code,
        vec![
            Op::GetGlobal(1),
            Op::JumpOnTrue(1),
            Op::GetGlobal(2),
            Op::SetGlobal(0),
            Op::Return(0),
        ]
    );
}

#[test]
fn and_in_a_condition_pops_the_tested_value() {
    let proto = chunk("if a and b then c = 1 end");
    assert_eq!(
        proto.code,
        vec![
            Op::GetGlobal(0),
            Op::JumpIfFalse(4),
            Op::GetGlobal(1),
            Op::JumpIfFalse(2),
            Op::PushInt(1),
            Op::SetGlobal(2),
            Op::Return(0),
        ]
    );
}

#[test]
fn not_fuses_into_the_conditional_jump() {
    let proto = chunk("if not x then y = 1 end");
    assert_eq!(
        proto.code,
        vec![
            Op::GetGlobal(0),
            Op::JumpIfTrue(2),
            Op::PushInt(1),
            Op::SetGlobal(1),
            Op::Return(0),
        ]
    );
    assert!(!proto.code.contains(&Op::Not));
}

#[test]
fn not_survives_when_its_value_is_needed() {
    let proto = chunk("x = not y");
    assert!(proto.code.contains(&Op::Not));
}

// ---------------------------------------------------------------------------
// Control flow
// ---------------------------------------------------------------------------

#[test]
fn while_loop_shape_and_break_patching() {
    let proto = chunk("while true do if x then break end end");
    assert_eq!(
        proto.code,
        vec![
            Op::GetGlobal(0),    // `true` is not reserved: a global read
            Op::JumpIfFalse(4),  // loop exit
            Op::GetGlobal(1),    // x
            Op::JumpIfFalse(-4), // if-false continues the loop
            Op::Jump(1),         // break, patched past the back-jump
            Op::Jump(-6),        // back to the condition
            Op::Return(0),
        ]
    );
}

#[test]
fn break_outside_a_loop_is_rejected() {
    let e = err("break");
    assert_eq!(syntax_message(&e), "no loop to break");
}

#[test]
fn repeat_jumps_back_while_false() {
    let proto = chunk("repeat x = 1 until x");
    assert_eq!(
        proto.code,
        vec![
            Op::PushInt(1),
            Op::SetGlobal(0),
            Op::GetGlobal(0),
            Op::JumpIfFalse(-4),
            Op::Return(0),
        ]
    );
}

#[test]
fn if_elseif_else_chains_escape_to_the_end() {
    let proto = chunk("if a then x = 1 elseif b then x = 2 else x = 3 end");
    let jumps: Vec<usize> = proto
        .code
        .iter()
        .enumerate()
        .filter_map(|(pc, op)| match op {
            Op::Jump(o) => Some((pc as i64 + 1 + i64::from(*o)) as usize),
            _ => None,
        })
        .collect();
    // both true-branch escapes land on the final return
    let end = proto.code.len() - 1;
    assert_eq!(jumps, vec![end, end]);
    assert!(matches!(proto.code.last(), Some(Op::Return(0))));
}

#[test]
fn numeric_for_registers_hidden_locals() {
    let proto = chunk("for i = 1, 3 do print(i) end");
    assert_eq!(
        proto.code,
        vec![
            Op::PushInt(1),
            Op::PushInt(3),
            Op::PushInt(1), // default step
            Op::ForPrep(3),
            Op::GetGlobal(0),
            Op::GetLocal(0),
            Op::Call {
                base: 3,
                results: 0
            },
            Op::ForLoop(-4),
            Op::Return(0),
        ]
    );
    let names: Vec<&str> = proto.locvars.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(names, vec!["i", "(limit)", "(step)"]);
    // `i` spans exactly the loop body and latch
    assert_eq!(proto.locvars[0].start_pc, 4);
    assert_eq!(proto.locvars[0].end_pc, 8);
}

#[test]
fn generic_for_registers_four_hidden_locals() {
    let proto = chunk("for k, v in t do x = k end");
    let names: Vec<&str> = proto.locvars.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(names, vec!["(table)", "(index)", "k", "v"]);
    assert_eq!(
        proto.code,
        vec![
            Op::GetGlobal(0),
            Op::TForPrep(2),
            Op::GetLocal(2),
            Op::SetGlobal(1),
            Op::TForLoop(-3),
            Op::Return(0),
        ]
    );
}

#[test]
fn generic_for_requires_in() {
    let e = err("for k, v of t do end");
    assert_eq!(syntax_message(&e), "'in' expected");
}

#[test]
fn for_requires_assign_or_comma() {
    let e = err("for x do end");
    assert_eq!(syntax_message(&e), "'=' or ',' expected");
}

#[test]
fn break_restores_the_loop_entry_stack() {
    // the break discards the three numeric-for control values
    let proto = chunk("for i = 1, 10 do break end");
    assert!(proto.code.contains(&Op::Pop(3)));
}

// ---------------------------------------------------------------------------
// Table constructors
// ---------------------------------------------------------------------------

#[test]
fn mixed_constructor_batches_and_patches_the_size() {
    let proto = chunk("local t = {10, 20; a = 1, b = 2}");
    assert_eq!(
        proto.code,
        vec![
            Op::CreateTable(4), // patched to the total element count
            Op::PushInt(10),
            Op::PushInt(20),
            Op::SetList { batch: 0, table: 0 },
            Op::PushString(0),
            Op::PushInt(1),
            Op::PushString(1),
            Op::PushInt(2),
            Op::SetMap { table: 0 },
            Op::Return(1),
        ]
    );
    assert_eq!(proto.strings, vec!["a".to_string(), "b".to_string()]);
}

#[test]
fn long_list_parts_flush_in_batches() {
    let items: Vec<String> = (1..=65).map(|i| i.to_string()).collect();
    let source = format!("t = {{{}}}", items.join(", "));
    let proto = chunk(&source);
    let flushes: Vec<&Op> = proto
        .code
        .iter()
        .filter(|op| matches!(op, Op::SetList { .. }))
        .collect();
    assert_eq!(
        flushes,
        vec![
            &Op::SetList { batch: 0, table: 0 },
            &Op::SetList { batch: 1, table: 0 }
        ]
    );
    assert_eq!(proto.code[0], Op::CreateTable(65));
}

#[test]
fn record_keys_may_be_computed() {
    let proto = chunk("t = {[k] = 1}");
    assert!(proto.code.contains(&Op::SetMap { table: 0 }));
    assert_eq!(proto.code[0], Op::CreateTable(1));
}

#[test]
fn two_parts_of_the_same_kind_are_rejected() {
    let e = err("t = {1, 2; 3}");
    assert_eq!(syntax_message(&e), "invalid constructor syntax");
    let e = err("t = {a = 1; b = 2}");
    assert_eq!(syntax_message(&e), "invalid constructor syntax");
}

#[test]
fn trailing_open_call_feeds_the_final_flush() {
    let proto = chunk("t = {1, f()}");
    assert!(proto.code.contains(&Op::Call {
        base: 2,
        results: MULT_RET
    }));
}

// ---------------------------------------------------------------------------
// Functions, closures, upvalues
// ---------------------------------------------------------------------------

#[test]
fn vararg_function_metadata() {
    let proto = chunk("function f(a, b, ...) return a end");
    assert_eq!(proto.protos.len(), 1);
    let f = &proto.protos[0];
    assert_eq!(f.num_params, 2);
    assert!(f.is_vararg);
    let names: Vec<&str> = f.locvars.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "arg"]);
    assert_eq!(f.line_defined, 1);
    // the body returns above its three locals (a, b, arg)
    assert_eq!(f.code, vec![Op::GetLocal(0), Op::Return(3), Op::Return(3)]);
}

#[test]
fn method_definition_prepends_self() {
    let proto = chunk("function t:m(x) return self end");
    let m = &proto.protos[0];
    assert_eq!(m.num_params, 2);
    let names: Vec<&str> = m.locvars.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(names, vec!["self", "x"]);
    // the store target is t["m"]
    assert_eq!(proto.code[0], Op::GetGlobal(0));
    assert_eq!(proto.code[1], Op::PushString(1));
    assert!(matches!(proto.code.last(), Some(Op::Return(0))));
    assert!(proto.code.contains(&Op::SetTablePop));
}

#[test]
fn dotted_function_names_build_an_indexed_target() {
    let proto = chunk("function a.b.c() end");
    assert_eq!(proto.code[0], Op::GetGlobal(0));
    assert_eq!(proto.code[1], Op::GetDotted(1));
    assert_eq!(proto.code[2], Op::PushString(2));
    assert!(proto.code.contains(&Op::SetTablePop));
}

#[test]
fn upvalues_capture_enclosing_locals_by_slot() {
    let proto = chunk("local x = 1\nfunction f() return %x end");
    // the enclosing function pushes the captured value, then the closure
    assert_eq!(
        &proto.code[1..3],
        &[
            Op::GetLocal(0),
            Op::Closure {
                proto: 0,
                upvalues: 1
            }
        ]
    );
    let f = &proto.protos[0];
    assert_eq!(f.num_upvalues, 1);
    assert_eq!(f.code[0], Op::GetUpvalue(0));
}

#[test]
fn identical_upvalues_are_deduplicated() {
    let proto = chunk("local x = 1\nfunction f() return %x + %x end");
    let f = &proto.protos[0];
    assert_eq!(f.num_upvalues, 1);
    assert_eq!(f.code[0], Op::GetUpvalue(0));
    assert_eq!(f.code[1], Op::GetUpvalue(0));
}

#[test]
fn global_upvalues_capture_through_the_enclosing_pool() {
    let proto = chunk("function f() return %g end");
    assert_eq!(
        &proto.code[0..2],
        &[
            Op::GetGlobal(1), // "g" — pool slot 0 is "f"
            Op::Closure {
                proto: 0,
                upvalues: 1
            }
        ]
    );
}

#[test]
fn plain_outer_local_access_is_rejected() {
    let e = err("local x = 1\nfunction f() return x end");
    assert_eq!(syntax_message(&e), "cannot access a variable in outer function");
}

#[test]
fn upvalue_at_top_level_is_rejected() {
    let e = err("return %x");
    assert_eq!(syntax_message(&e), "cannot access an upvalue at top level");
}

#[test]
fn upvalue_must_come_from_the_immediate_enclosing_function() {
    let e = err("local x = 1\nfunction f()\nreturn function() return %x end\nend");
    assert_eq!(
        syntax_message(&e),
        "upvalue must be global or local to immediately outer function"
    );
}

#[test]
fn anonymous_function_statement_must_be_called() {
    let e = err("function() end");
    assert_eq!(syntax_message(&e), "syntax error");
    // calling it immediately is fine
    let proto = chunk("function() end ()");
    assert!(proto.code.contains(&Op::Call {
        base: 0,
        results: 0
    }));
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

#[test]
fn call_statements_discard_all_results() {
    let proto = chunk("print(1)");
    assert_eq!(
        proto.code,
        vec![
            Op::GetGlobal(0),
            Op::PushInt(1),
            Op::Call {
                base: 0,
                results: 0
            },
            Op::Return(0),
        ]
    );
}

#[test]
fn method_calls_use_pushself() {
    let proto = chunk("t:m(1)");
    assert_eq!(
        proto.code,
        vec![
            Op::GetGlobal(0),
            Op::PushSelf(1),
            Op::PushInt(1),
            Op::Call {
                base: 0,
                results: 0
            },
            Op::Return(0),
        ]
    );
}

#[test]
fn string_and_constructor_arguments() {
    let proto = chunk(r#"f "hello""#);
    assert_eq!(proto.code[1], Op::PushString(1));
    let proto = chunk("f {1}");
    assert!(proto.code.contains(&Op::CreateTable(1)));
}

#[test]
fn nested_call_arguments_stay_open_until_the_outer_call() {
    let proto = chunk("f(g())");
    assert_eq!(
        proto.code,
        vec![
            Op::GetGlobal(0),
            Op::GetGlobal(1),
            Op::Call {
                base: 1,
                results: MULT_RET
            },
            Op::Call {
                base: 0,
                results: 0
            },
            Op::Return(0),
        ]
    );
}

#[test]
fn non_call_expression_statements_are_rejected() {
    assert_eq!(syntax_message(&err("a + 1")), "syntax error");
    assert_eq!(syntax_message(&err("f")), "syntax error");
}

// ---------------------------------------------------------------------------
// Assignment
// ---------------------------------------------------------------------------

#[test]
fn swap_assignment_stores_in_reverse_order() {
    let proto = chunk("a, b = b, a");
    assert_eq!(
        proto.code,
        vec![
            Op::GetGlobal(1), // b
            Op::GetGlobal(0), // a
            Op::SetGlobal(1), // b = a's value (TOS first)
            Op::SetGlobal(0), // a = b's value
            Op::Return(0),
        ]
    );
    assert_eq!(proto.max_stack, 2);
}

#[test]
fn short_rhs_pads_with_nils_and_long_rhs_pops() {
    let proto = chunk("a, b, c = 1");
    assert!(proto.code.contains(&Op::PushNil(2)));
    let proto = chunk("a = 1, 2");
    assert!(proto.code.contains(&Op::Pop(1)));
}

#[test]
fn open_call_supplies_missing_values() {
    let proto = chunk("local a, b, c = f()");
    assert!(proto.code.contains(&Op::Call {
        base: 0,
        results: 3
    }));
}

#[test]
fn surplus_trailing_call_is_told_to_yield_nothing() {
    let proto = chunk("a, b = 1, 2, f()");
    assert!(proto.code.contains(&Op::Call {
        base: 2,
        results: 0
    }));
}

#[test]
fn indexed_targets_reach_under_intervening_values() {
    let proto = chunk("x, t[i] = 1, 2");
    assert!(proto.code.contains(&Op::SetTable(1)));
    // the leftover pair is popped at the end
    assert!(proto.code.contains(&Op::Pop(2)));
}

#[test]
fn single_indexed_assignment_uses_the_popping_store() {
    let proto = chunk("t[1] = 2");
    assert_eq!(
        proto.code,
        vec![
            Op::GetGlobal(0),
            Op::PushInt(1),
            Op::PushInt(2),
            Op::SetTablePop,
            Op::Return(0),
        ]
    );
}

#[test]
fn dotted_reads_fuse_into_getdotted() {
    // pool order: "x" (target), then "t", "a", "b"
    let proto = chunk("x = t.a.b");
    assert_eq!(
        proto.code,
        vec![
            Op::GetGlobal(1),
            Op::GetDotted(2),
            Op::GetDotted(3),
            Op::SetGlobal(0),
            Op::Return(0),
        ]
    );
}

// ---------------------------------------------------------------------------
// Scoping
// ---------------------------------------------------------------------------

#[test]
fn inner_locals_shadow_and_unshadow() {
    let proto = chunk("local a = 1\ndo\nlocal a = 2\nb = a\nend\nc = a");
    let reads: Vec<&Op> = proto
        .code
        .iter()
        .filter(|op| matches!(op, Op::GetLocal(_)))
        .collect();
    assert_eq!(reads, vec![&Op::GetLocal(1), &Op::GetLocal(0)]);
    // the block's local is popped on exit
    assert!(proto.code.contains(&Op::Pop(1)));
}

#[test]
fn redeclared_local_initializer_sees_the_previous_one() {
    let proto = chunk("local x\nlocal x = x");
    assert_eq!(
        proto.code,
        vec![Op::PushNil(1), Op::GetLocal(0), Op::Return(2)]
    );
    assert_eq!(proto.locvars.len(), 2);
    assert_eq!(proto.locvars[0].name, "x");
    assert_eq!(proto.locvars[1].name, "x");
}

#[test]
fn overlapping_locals_occupy_distinct_slots() {
    let proto = chunk("local a = 1\nlocal b = 2\nx = a + b");
    for v in &proto.locvars {
        assert!(v.start_pc <= v.end_pc);
        assert!(v.end_pc as usize <= proto.code.len());
    }
    assert!(proto.code.contains(&Op::GetLocal(0)));
    assert!(proto.code.contains(&Op::GetLocal(1)));
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

#[test]
fn unclosed_construct_names_its_opening_line() {
    let e = err("if x then\ny = 1\n");
    assert_eq!(
        e.to_string(),
        "test:3: 'end' expected (to close 'if' at line 1) near '<eof>'"
    );
}

#[test]
fn same_line_mismatch_uses_the_plain_message() {
    let e = err("f(1");
    assert_eq!(e.to_string(), "test:1: ')' expected near '<eof>'");
}

#[test]
fn garbage_after_the_chunk_is_rejected() {
    let e = err("return 1 x = 2");
    assert_eq!(syntax_message(&e), "'<eof>' expected");
}

#[test]
fn trailing_semicolon_after_return_is_allowed() {
    let proto = chunk("return 1;");
    assert_eq!(proto.code, vec![Op::PushInt(1), Op::Return(0), Op::Return(0)]);
}

#[test]
fn lexical_errors_surface_with_their_line() {
    let e = err("x = \"abc");
    assert!(matches!(e, Error::Lexical { .. }));
    assert_eq!(e.to_string(), "test:1: unfinished string near 'abc'");
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

#[test]
fn nesting_depth_is_bounded() {
    let source = format!("x = {}1{}", "(".repeat(40), ")".repeat(40));
    let limits = Limits { max_depth: 10 };
    let e = compile_with_limits(&source, "test", &limits).unwrap_err();
    assert!(matches!(
        e,
        Error::Limit {
            what: "syntax levels",
            ..
        }
    ));
}

#[test]
fn too_many_locals_is_a_limit_error() {
    let source = (0..40)
        .map(|i| format!("local v{i} = {i}"))
        .collect::<Vec<_>>()
        .join("\n");
    let e = compile(&source, "test").unwrap_err();
    assert!(matches!(
        e,
        Error::Limit {
            what: "local variables",
            ..
        }
    ));
}

#[test]
fn too_many_assignment_targets_is_a_limit_error() {
    let targets: Vec<String> = (0..20).map(|i| format!("a{i}")).collect();
    let source = format!("{} = 1", targets.join(", "));
    let e = compile(&source, "test").unwrap_err();
    assert!(matches!(
        e,
        Error::Limit {
            what: "variables in a multiple assignment",
            ..
        }
    ));
}

// ---------------------------------------------------------------------------
// Laws
// ---------------------------------------------------------------------------

#[test]
fn compilation_is_deterministic() {
    let source = "local t = {1, 2; a = 3}\nfor i = 1, 10 do t[i] = i * i end\nreturn t";
    assert_eq!(chunk(source), chunk(source));
}

#[test]
fn every_jump_is_patched_in_range() {
    let source = "while a do if b then break end x = 1 end\nif c then y = 2 else y = 3 end";
    let proto = chunk(source);
    let len = proto.code.len() as i64;
    for (pc, op) in proto.code.iter().enumerate() {
        if let Some(offset) = op.jump_offset() {
            let dest = pc as i64 + 1 + i64::from(offset);
            assert!(dest >= 0 && dest < len, "jump at {pc} lands at {dest}");
        }
    }
}

#[test]
fn main_chunk_has_no_params_and_no_upvalues() {
    let proto = chunk("x = 1");
    assert_eq!(proto.num_params, 0);
    assert_eq!(proto.num_upvalues, 0);
    assert!(!proto.is_vararg);
}

#[test]
fn disassembly_lists_every_instruction() {
    let proto = chunk("for i = 1, 3 do print(i) end");
    let listing = rill::disassemble(&proto);
    for mnemonic in ["FORPREP", "FORLOOP", "GETGLOBAL", "CALL", "RETURN"] {
        assert!(listing.contains(mnemonic), "missing {mnemonic} in:\n{listing}");
    }
}
