//! Language behavior: closures, defaults, inheritance, enums, optionals,
//! exceptions, containers, and control flow.

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
fn closures_capture_and_share_their_upvalue() {
    let source = "\
fun makeCounter() > fun () > int {
    int count = 0;
    fun bump() > int {
        count = count + 1;
        return count;
    }
    return bump;
}

const first = makeCounter();
const second = makeCounter();
print(\"{first()} {first()} {second()}\");
";
    assert_eq!(run(source), "1 2 1\n");
}

#[test]
fn upvalues_close_when_the_defining_frame_returns() {
    let source = "\
fun makePair() > [fun () > int] {
    int shared = 10;
    fun read() > int { return shared; }
    fun grow() > int {
        shared = shared + 5;
        return shared;
    }
    return [grow, read];
}

const pair = makePair();
const grow = pair[0];
const read = pair[1];
grow();
print(\"{read()}\");
";
    assert_eq!(run(source), "15\n");
}

#[test]
fn defaulted_list_arguments_do_not_share_state_across_calls() {
    let source = "\
fun collect(int value, [int] into = []) > [int] {
    into.append(value);
    return into;
}

assert(collect(1).len() == 1, message: \"first call\");
assert(collect(2).len() == 1, message: \"second call\");
print(\"ok\");
";
    assert_eq!(run(source), "ok\n");
}

#[test]
fn named_arguments_bind_by_parameter_name() {
    let source = "\
fun describe(str label, int count = 0) > str {
    return \"{label}:{count}\";
}

print(describe(\"apples\", count: 3));
print(describe($: \"pears\"));
";
    assert_eq!(run(source), "apples:3\npears:0\n");
}

#[test]
fn inheritance_dispatches_methods_and_super_calls() {
    let source = "\
object Animal {
    str name = \"animal\",
    fun label() > str { return \"a \" + this.name; }
    fun speak() > str { return \"...\"; }
}

object Dog < Animal {
    fun speak() > str { return \"woof\"; }
    fun labelLoud() > str { return super.label() + \"!\"; }
}

Dog d = Dog{ name = \"rex\" };
print(d.speak());
print(d.labelLoud());
Animal plain = Animal{};
print(plain.speak());
";
    assert_eq!(run(source), "woof\na rex!\n...\n");
}

#[test]
fn enums_expose_case_values_and_iterate_in_order() {
    let source = "\
enum Color { red, green, blue }

assert(Color.green.value == 1, message: \"int value\");
assert(Color.red == Color.red, message: \"case identity\");
int count = 0;
int sum = 0;
foreach (Color c in Color) {
    count = count + 1;
    sum = sum + c.value;
}
print(\"{count} {sum}\");
";
    assert_eq!(run(source), "3 3\n");
}

#[test]
fn string_backed_enums_use_case_names_as_values() {
    let source = "\
enum(str) Status { active, done }
print(Status.done.value);
";
    assert_eq!(run(source), "done\n");
}

#[test]
fn optionals_unwrap_coalesce_and_chain() {
    let source = "\
int? maybe = null;
assert((maybe ?? 5) == 5, message: \"coalesce null\");
maybe = 3;
assert((maybe ?? 5) == 3, message: \"coalesce present\");
assert(maybe! == 3, message: \"force unwrap\");

object Box { int v = 7 }
Box? b = null;
print(\"{b?.v}\");
b = Box{};
print(\"{b?.v}\");
";
    assert_eq!(run(source), "null\n7\n");
}

#[test]
fn force_unwrapping_null_throws() {
    let source = "int? nothing = null;\nint x = nothing!;\nprint(\"{x}\");";
    let mut runner = Runner::new();
    let mut out = CollectStringPrint::new();
    let err = runner
        .run_source(source, None, &mut out)
        .expect_err("force unwrap of null throws");
    let BuzzError::Runtime(err) = err else {
        panic!("expected a runtime error, got {err}");
    };
    assert!(err.message.contains("null"), "got: {}", err.message);
}

#[test]
fn catch_clauses_replace_the_call_result() {
    let source = "\
fun risky(bool fail) > int {
    if (fail) {
        throw \"boom\";
    }
    return 7;
}

fun tryIt(bool fail) > int {
    return risky(fail) catch (str e) { return 0 - 1; };
}

print(\"{tryIt(false)} {tryIt(true)}\");
";
    assert_eq!(run(source), "7 -1\n");
}

#[test]
fn integer_overflow_throws_a_catchable_error() {
    let source = "\
fun add(int a, int b) > int { return a + b; }

int clamped = add(2147483647, 1) catch (str e) { return 0 - 99; };
assert(clamped == 0 - 99, message: \"overflow caught\");

int fine = add(2, 3) catch (str e) { return 0 - 99; };
assert(fine == 5, message: \"no throw\");
print(\"ok\");
";
    assert_eq!(run(source), "ok\n");
}

#[test]
fn integer_overflow_without_a_catch_aborts() {
    let mut runner = Runner::new();
    let mut out = CollectStringPrint::new();
    let err = runner
        .run_source("int big = 2147483647 + 1;", None, &mut out)
        .expect_err("overflow aborts");
    let BuzzError::Runtime(err) = err else {
        panic!("expected a runtime error, got {err}");
    };
    assert!(err.message.contains("OverflowError"), "got: {}", err.message);
}

#[test]
fn float_arithmetic_does_not_overflow_check() {
    let source = "\
float big = 1.5;
float sum = big + 2.5;
assert(sum == 4.0, message: \"float add\");
print(\"{sum}\");
";
    assert_eq!(run(source), "4.0\n");
}

#[test]
fn maps_are_ordered_merge_right_biased_and_read_optionally() {
    let source = "\
{str, int} ages = {\"ana\": 36, \"bo\": 4};
assert(ages[\"ana\"]! == 36, message: \"read\");
assert(ages[\"missing\"] == null, message: \"absent key reads null\");
ages[\"cy\"] = 12;
assert(ages.size() == 3, message: \"insert\");

const merged = ages + {\"ana\": 37};
assert(merged[\"ana\"]! == 37, message: \"right side wins\");
assert(ages[\"ana\"]! == 36, message: \"merge copies\");

assert(ages.remove(\"bo\")! == 4, message: \"remove returns the value\");
assert(ages.size() == 2, message: \"removed\");

str order = \"\";
foreach (str key, int value in merged) {
    order = order + key;
}
assert(order == \"anabocy\", message: \"insertion order\");
print(\"ok\");
";
    assert_eq!(run(source), "ok\n");
}

#[test]
fn list_concatenation_builds_a_new_list() {
    let source = "\
[int] left = [1, 2];
[int] right = [3];
[int] both = left + right;
left.append(9);
print(\"{both.len()} {left.len()}\");
";
    assert_eq!(run(source), "3 3\n");
}

#[test]
fn strings_intern_and_iterate_by_codepoint() {
    let source = "\
str greeting = \"h\u{e9}llo\";
assert(greeting.len() == 5, message: \"codepoint length\");

str collected = \"\";
int last = 0 - 1;
foreach (int index, str ch in greeting) {
    collected = collected + ch;
    last = index;
}
assert(collected == greeting, message: \"same content same string\");
assert(last == 4, message: \"codepoint indices\");
print(\"ok\");
";
    assert_eq!(run(source), "ok\n");
}

#[test]
fn is_checks_runtime_types() {
    let source = "\
assert(3 is int, message: \"int\");
assert(!(3.5 is int), message: \"float is not int\");
[int] xs = [1];
assert(xs is [int], message: \"list type\");
int? maybe = null;
assert(maybe is int?, message: \"null matches optional\");
print(\"ok\");
";
    assert_eq!(run(source), "ok\n");
}

#[test]
fn while_do_until_break_and_continue() {
    let source = "\
int i = 0;
while (true) {
    i = i + 1;
    if (i >= 5) {
        break;
    }
}
assert(i == 5, message: \"while/break\");

int j = 0;
do {
    j = j + 1;
} until (j == 3);
assert(j == 3, message: \"do-until\");

int evens = 0;
foreach (int n in 0..10) {
    if (n % 2 == 1) {
        continue;
    }
    evens = evens + 1;
}
assert(evens == 5, message: \"continue\");

int steps = 0;
for (int k = 0; k < 10; k = k + 2) {
    steps = steps + 1;
}
assert(steps == 5, message: \"for\");
print(\"ok\");
";
    assert_eq!(run(source), "ok\n");
}

#[test]
fn string_interpolation_coerces_every_segment() {
    let source = "\
int count = 2;
bool ready = true;
print(\"count={count} ready={ready} next={count + 1}\");
";
    assert_eq!(run(source), "count=2 ready=true next=3\n");
}

#[test]
fn anonymous_functions_are_first_class_values() {
    let source = "\
fun apply(fun (int) > int op, int value) > int {
    return op(value);
}

const double = fun (int n) > int { return n * 2; };
print(\"{apply(double, 21)}\");
";
    assert_eq!(run(source), "42\n");
}
