//! End-to-end scenarios: whole scripts in, exact output bytes out.

use jx9::{Engine, ExecStatus};
use pretty_assertions::assert_eq;

fn run(src: &str) -> String {
    let engine = Engine::new();
    let mut vm = engine.compile("test.jx9", src).expect("script compiles");
    vm.collect_output();
    vm.exec();
    String::from_utf8(vm.take_output().expect("collection enabled")).expect("utf8 output")
}

#[test]
fn arithmetic_coerces_string_operands() {
    assert_eq!(run(r#"print 2 + "3 apples";"#), "5");
}

#[test]
fn autovivification_and_json_round_trip() {
    let out = run(r#"$a = {}; $a.users[0].name = "Ada"; $a.users[0].born = 1815; print json_encode($a);"#);
    assert_eq!(out, r#"{"users":[{"name":"Ada","born":1815}]}"#);
}

#[test]
fn foreach_with_key_binding() {
    let out = run("$m = {a:1, b:2, c:3}; foreach($m as $k, $v){ print $k.'='.$v.'|'; }");
    assert_eq!(out, "a=1|b=2|c=3|");
}

#[test]
fn switch_falls_through_without_break() {
    let out = run(
        r#"$x = 2; switch($x){ case 1: print "one"; break; case 2: print "two"; case 3: print "three"; break; default: print "d"; }"#,
    );
    assert_eq!(out, "twothree");
}

#[test]
fn switch_takes_default_when_nothing_matches() {
    let out = run(r#"switch(9){ case 1: print "one"; break; default: print "d"; }"#);
    assert_eq!(out, "d");
}

#[test]
fn function_overloading_by_signature() {
    let out = run(
        r#"function foo(int $a){ return $a; } function foo(string $a){ return $a; } print foo(5); print '|'; print foo("hi");"#,
    );
    assert_eq!(out, "5|hi");
}

#[test]
fn division_by_zero_recovers_with_warning() {
    let engine = Engine::new();
    let mut vm = engine.compile("t.jx9", "$r = 10 / 0; print $r;").unwrap();
    vm.collect_output();
    vm.collect_errors();
    vm.enable_error_reporting(true);
    assert_eq!(vm.exec(), ExecStatus::Done);
    assert_eq!(vm.take_output().unwrap(), b"0");
    let errors = String::from_utf8(vm.take_error_output().unwrap()).unwrap();
    assert_eq!(errors, "t.jx9 Warning: Division by zero\n");
}

#[test]
fn string_interpolation_resolves_variables_and_paths() {
    assert_eq!(run(r#"$name = "World"; print "Hello $name!";"#), "Hello World!");
    assert_eq!(run(r#"$u = {name: "Ada"}; print "Hi $u.name.";"#), "Hi Ada.");
    assert_eq!(run(r#"$a = [7]; print "got $a[0]";"#), "got 7");
}

#[test]
fn single_quotes_keep_escapes_verbatim() {
    assert_eq!(run(r"print 'a\nb';"), "a\\nb");
    assert_eq!(run(r#"print "a\nb";"#), "a\nb");
}

#[test]
fn exit_records_status_and_stops() {
    let engine = Engine::new();
    let mut vm = engine.compile("t.jx9", r#"print "a"; exit(3); print "b";"#).unwrap();
    vm.collect_output();
    assert_eq!(vm.exec(), ExecStatus::Halt(3));
    assert_eq!(vm.exit_status(), 3);
    assert_eq!(vm.take_output().unwrap(), b"a");
}

#[test]
fn die_with_message_prints_it() {
    let engine = Engine::new();
    let mut vm = engine.compile("t.jx9", r#"die("bye");"#).unwrap();
    vm.collect_output();
    assert_eq!(vm.exec(), ExecStatus::Halt(0));
    assert_eq!(vm.take_output().unwrap(), b"bye");
}

#[test]
fn top_level_return_surfaces_to_host() {
    let engine = Engine::new();
    let mut vm = engine.compile("t.jx9", "return {x: 1, y: [2, 3]};").unwrap();
    vm.silence_output();
    assert_eq!(vm.exec(), ExecStatus::Done);
    let value = vm.return_object().expect("program returned a value");
    let jx9::Object::Map(entries) = value else {
        panic!("expected an object, got {value:?}");
    };
    assert_eq!(entries[0].0, "x");
    assert_eq!(entries[0].1, jx9::Object::Int(1));
    assert_eq!(entries[1].1, jx9::Object::Array(vec![jx9::Object::Int(2), jx9::Object::Int(3)]));
}

#[test]
fn output_length_counts_bytes() {
    let engine = Engine::new();
    let mut vm = engine.compile("t.jx9", "print 'abcd';").unwrap();
    vm.collect_output();
    vm.exec();
    assert_eq!(vm.output_length(), 4);
}

#[test]
fn reset_allows_rerunning() {
    let engine = Engine::new();
    let mut vm = engine.compile("t.jx9", "$n = 1; print $n + 1;").unwrap();
    vm.collect_output();
    vm.exec();
    assert_eq!(vm.take_output().unwrap(), b"2");
    vm.reset();
    vm.exec();
    assert_eq!(vm.take_output().unwrap(), b"2");
}
