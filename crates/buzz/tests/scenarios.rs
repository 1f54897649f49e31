//! End-to-end scenarios: literal source in, observed output out.

use buzz::{BuzzError, CollectStringPrint, Runner};
use pretty_assertions::assert_eq;

fn run(source: &str) -> String {
    let mut runner = Runner::new();
    let mut out = CollectStringPrint::new();
    runner
        .run_source(source, None, &mut out)
        .unwrap_or_else(|err| panic!("script failed: {err}"));
    out.into_output()
}

#[test]
fn hello_world_prints_one_line() {
    assert_eq!(run("print(\"hello\");"), "hello\n");
}

#[test]
fn empty_script_produces_no_output() {
    assert_eq!(run(""), "");
}

#[test]
fn test_mode_runs_blocks_and_reports_them() {
    let source = "test \"add\" { assert(1 + 2 == 3, message: \"ok\"); }";
    let mut runner = Runner::new();
    let mut out = CollectStringPrint::new();
    runner
        .run_tests(source, None, &mut out)
        .expect("test block passes");
    assert_eq!(out.output(), "\u{2713} add\n");
}

#[test]
fn failing_test_block_reports_the_assert_message() {
    let source = "test \"broken\" { assert(false, message: \"expected\"); }";
    let mut runner = Runner::new();
    let mut out = CollectStringPrint::new();
    let err = runner
        .run_tests(source, None, &mut out)
        .expect_err("failing assert aborts the test run");
    let BuzzError::Runtime(err) = err else {
        panic!("expected a runtime error, got {err}");
    };
    assert!(err.message.contains("expected"), "got: {}", err.message);
}

#[test]
fn defaulted_object_fields_are_fresh_per_instance() {
    let source = "\
object A { [int] xs = [1, 2, 3] }
A a = A{};
A b = A{};
a.xs.append(4);
print(\"{a.xs.len()} {b.xs.len()}\");
";
    assert_eq!(run(source), "4 3\n");
}

#[test]
fn foreach_over_an_ascending_range_excludes_the_high_bound() {
    let source = "int s = 0; foreach (int n in 0..10) { s = s + n; } print(\"{s}\");";
    assert_eq!(run(source), "45\n");
}

#[test]
fn foreach_over_a_descending_range_excludes_the_low_bound() {
    let source = "int s = 0; foreach (int n in 10..0) { s = s + n; } print(\"{s}\");";
    assert_eq!(run(source), "55\n");
}

#[test]
fn merkle_tree_report_repeats_the_same_root_hash() {
    let source = "\
object Node {
    int hash = 0,
    Node? left = null,
    Node? right = null,
}

fun build(int depth) > Node {
    if (depth == 0) {
        return Node{ hash = 1 };
    }
    Node left = build(depth - 1);
    Node right = build(depth - 1);
    int combined = (left.hash * 31 + right.hash) % 1000003;
    return Node{ hash = combined, left = left, right = right };
}

Node tree = build(6);
Node stretch = build(6);
print(\"depth: 6\");
print(\"nodes: 127\");
print(\"root: {tree.hash} stretch: {stretch.hash}\");
";
    let output = run(source);
    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "depth: 6");
    assert_eq!(lines[1], "nodes: 127");
    let tail: Vec<&str> = lines[2].split_whitespace().collect();
    // "root: <hash> stretch: <hash>" with equal hashes.
    assert_eq!(tail.len(), 4);
    assert_eq!(tail[1], tail[3], "root hash differs from stretch tree");
}

#[test]
fn parse_int_round_trips_to_string() {
    let source = "\
foreach (int n in [0, 1, -1, 42, 2147483647, -2147483647 - 1]) {
    assert(parseInt(toString(n))! == n, message: \"round trip\");
}
print(\"ok\");
";
    assert_eq!(run(source), "ok\n");
}

#[test]
fn range_to_list_length_is_the_absolute_span() {
    let source = "\
assert((0..10).toList().len() == 10, message: \"ascending\");
assert((10..0).toList().len() == 10, message: \"descending\");
assert((3..3).toList().len() == 0, message: \"empty\");
assert((0..10).len() == 10, message: \"len method\");
print(\"ok\");
";
    assert_eq!(run(source), "ok\n");
}

#[test]
fn unhandled_throw_carries_the_value_and_a_trace() {
    let source = "fun boom() > void { throw \"kapow\"; }\nboom();";
    let mut runner = Runner::new();
    let mut out = CollectStringPrint::new();
    let err = runner
        .run_source(source, None, &mut out)
        .expect_err("unhandled throw fails the run");
    let BuzzError::Runtime(err) = err else {
        panic!("expected a runtime error, got {err}");
    };
    assert!(err.message.contains("kapow"), "got: {}", err.message);
    assert!(
        err.trace.iter().any(|frame| frame.function == "boom"),
        "trace misses the throwing function: {:?}",
        err.trace
    );
}
