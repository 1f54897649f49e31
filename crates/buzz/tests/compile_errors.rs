//! Compile-time rejection: each case must fail before anything runs.

use buzz::{BuzzError, Runner};

/// Checks the source and returns the rendered compile report.
fn compile_error(source: &str) -> String {
    let mut runner = Runner::new();
    let err = runner
        .check_source(source, None)
        .expect_err("source must not compile");
    match err {
        BuzzError::Compile(report) => report.to_string(),
        BuzzError::Runtime(err) => panic!("expected a compile error, got runtime: {err}"),
    }
}

#[test]
fn object_init_must_cover_fields_without_defaults() {
    let report = compile_error("object P { int x }\nP p = P{};\nprint(\"never\");");
    assert!(report.contains("not initialized"), "got: {report}");
}

#[test]
fn unknown_forward_type_is_a_resolution_error() {
    let report = compile_error("fun use(Ghost g) > void { }");
    assert!(report.contains("Unknown type `Ghost`"), "got: {report}");
}

#[test]
fn conditions_must_be_boolean() {
    let report = compile_error("if (1) { }");
    assert!(report.contains("must be `bool`"), "got: {report}");
}

#[test]
fn missing_arguments_without_defaults_are_rejected() {
    let report = compile_error("fun g(int a) > int { return a; }\ng();");
    assert!(report.contains("missing argument `a`"), "got: {report}");
}

#[test]
fn constants_cannot_be_reassigned() {
    let report = compile_error("const x = 1;\nx = 2;");
    assert!(report.contains("can't assign to constant"), "got: {report}");
}

#[test]
fn undefined_variables_are_reported() {
    let report = compile_error("y = 3;");
    assert!(report.contains("undefined variable `y`"), "got: {report}");
}

#[test]
fn break_outside_a_loop_is_rejected() {
    let report = compile_error("break;");
    assert!(report.contains("outside of a loop"), "got: {report}");
}

#[test]
fn initializer_types_must_match() {
    let report = compile_error("int x = \"hi\";");
    assert!(report.contains("expected `int`"), "got: {report}");
}

#[test]
fn force_unwrap_requires_an_optional() {
    let report = compile_error("int x = 3;\nint y = x!;");
    assert!(report.contains("needs an optional"), "got: {report}");
}

#[test]
fn null_coalesce_requires_an_optional_left_operand() {
    let report = compile_error("int x = 3 ?? 4;");
    assert!(report.contains("optional left operand"), "got: {report}");
}

#[test]
fn mixed_arithmetic_is_rejected() {
    let report = compile_error("float f = 1 + 2.5;");
    assert!(report.contains("can't combine"), "got: {report}");
}

#[test]
fn arguments_are_type_checked() {
    let report = compile_error("fun id(int v) > int { return v; }\nint x = id(\"nope\");");
    assert!(report.contains("argument"), "got: {report}");
}

#[test]
fn non_optional_variables_require_initializers() {
    let report = compile_error("int x;");
    assert!(report.contains("must be initialized"), "got: {report}");
}

#[test]
fn errors_accumulate_across_statements() {
    let report = compile_error("if (1) { }\nint x = \"hi\";");
    assert!(report.contains("must be `bool`"), "got: {report}");
    assert!(report.contains("expected `int`"), "got: {report}");
}

#[test]
fn methods_cannot_be_read_as_values() {
    let report = compile_error(
        "object T { fun m() > void { } }\nT t = T{};\nconst f = t.m;",
    );
    assert!(report.contains("methods must be called"), "got: {report}");
}

#[test]
fn duplicate_locals_in_one_scope_are_rejected() {
    let report = compile_error("fun f() > void { int a = 1; int a = 2; }");
    assert!(report.contains("already declared"), "got: {report}");
}
