//! Control flow, scoping and function semantics.

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
fn if_elseif_else_chains() {
    let src = r#"
        $x = 7;
        if ($x < 5) { print "low"; }
        elseif ($x < 10) { print "mid"; }
        else { print "high"; }
    "#;
    assert_eq!(run(src), "mid");
}

#[test]
fn while_and_for_loops() {
    assert_eq!(run("$i = 0; while($i < 3){ print $i; $i++; }"), "012");
    assert_eq!(run("for($i = 0; $i < 3; $i++){ print $i; }"), "012");
}

#[test]
fn continue_in_for_reaches_post_expression() {
    assert_eq!(run("for($i = 0; $i < 5; $i++){ if($i % 2 == 0){ continue; } print $i; }"), "13");
}

#[test]
fn break_n_leaves_multiple_loops() {
    let src = r#"
        for($i = 0; $i < 3; $i++){
            foreach([1, 2] as $v){
                if($v == 2){ break 2; }
                print $v;
            }
        }
        print "done";
    "#;
    assert_eq!(run(src), "1done");
}

#[test]
fn foreach_visits_only_the_initial_entries() {
    let src = r#"
        $m = {a: 1, b: 2};
        foreach($m as $k, $v){
            $m.c = 3;
            print $k;
        }
        print sizeof($m);
    "#;
    // Entries inserted mid-loop are not visited; the map still grew.
    assert_eq!(run(src), "ab3");
}

#[test]
fn nested_foreach_is_legal() {
    let src = r#"
        foreach([1, 2] as $a){
            foreach([3, 4] as $b){
                print $a.$b.' ';
            }
        }
    "#;
    assert_eq!(run(src), "13 14 23 24 ");
}

#[test]
fn ternary_and_logic_short_circuit() {
    assert_eq!(run(r#"print 1 ? "y" : "n";"#), "y");
    // The right side of && must not run when the left is falsy.
    let src = r#"
        function boom(){ print "boom"; return true; }
        $r = false && boom();
        print $r ? "t" : "f";
    "#;
    assert_eq!(run(src), "f");
    assert_eq!(run(r#"print (true || false) ? "t" : "f";"#), "t");
}

#[test]
fn increments_prefix_and_postfix() {
    assert_eq!(run("$i = 1; print $i++; print $i; print ++$i;"), "123");
    assert_eq!(run("$a = [5]; $a[0]--; print $a[0];"), "4");
}

#[test]
fn compound_assignment_operators() {
    assert_eq!(run(r#"$s = "a"; $s .= "b"; print $s;"#), "ab");
    assert_eq!(run("$n = 10; $n -= 4; $n *= 2; print $n;"), "12");
    assert_eq!(run("$a = [1]; $a[0] += 5; print $a[0];"), "6");
    assert_eq!(run("$m = {v: 4}; $m.v <<= 2; print $m.v;"), "16");
}

#[test]
fn casts_apply_in_place() {
    assert_eq!(run(r#"print (int)"0x1a";"#), "26");
    assert_eq!(run(r#"print (int)"0b101";"#), "5");
    assert_eq!(run("print (string)1.5;"), "1.5");
    assert_eq!(run(r#"print (bool)"false" ? "t" : "f";"#), "f");
    assert_eq!(run("print json_encode((array)7);"), "[7]");
}

#[test]
fn default_arguments_fill_missing_and_null() {
    let src = r#"
        function d($a, $b = 7){ return $a + $b; }
        print d(1); print '|'; print d(1, 2); print '|'; print d(1, null);
    "#;
    assert_eq!(run(src), "8|3|8");
}

#[test]
fn type_hints_coerce_arguments() {
    let src = r#"
        function h(int $n){ return gettype($n); }
        print h("42");
    "#;
    assert_eq!(run(src), "int");
}

#[test]
fn variadic_arguments_are_reachable() {
    let src = r#"
        function va($first){
            $img = json_encode(func_get_args());
            $n = func_num_args();
            return $n . ':' . $img;
        }
        print va(1, "x", true);
    "#;
    assert_eq!(run(src), r#"3:[1,"x",true]"#);
}

#[test]
fn static_locals_persist_across_calls() {
    let src = r#"
        function counter(){ static $n = 0; $n++; return $n; }
        print counter(); print counter(); print counter();
    "#;
    assert_eq!(run(src), "123");
}

#[test]
fn uplink_aliases_the_outer_variable() {
    let src = r#"
        $g = 5;
        function read_g(){ uplink $g; return $g; }
        function write_x(){ uplink $x; $x = 9; }
        print read_g();
        write_x();
        print $x;
    "#;
    assert_eq!(run(src), "59");
}

#[test]
fn anonymous_functions_call_through_variables() {
    let src = r#"
        $twice = function($x){ return $x * 2; };
        print $twice(21);
    "#;
    assert_eq!(run(src), "42");
}

#[test]
fn constants_compile_to_deferred_expressions() {
    assert_eq!(run("const ANSWER = 6 * 7; print ANSWER;"), "42");
}

#[test]
fn unknown_bare_identifier_loads_its_own_name() {
    assert_eq!(run("print not_a_constant;"), "not_a_constant");
}

#[test]
fn recursion_limit_yields_null_and_an_error() {
    let engine = Engine::new();
    let mut vm = engine
        .compile("t.jx9", "function r($n){ return r($n + 1); } print r(0);")
        .unwrap();
    vm.collect_output();
    vm.collect_errors();
    vm.enable_error_reporting(true);
    assert_eq!(vm.exec(), ExecStatus::Done);
    // The over-deep call substituted null, which prints as nothing.
    assert_eq!(vm.take_output().unwrap(), b"");
    let errors = String::from_utf8(vm.take_error_output().unwrap()).unwrap();
    assert!(errors.contains("maximum function recursion depth reached"), "{errors}");
}

#[test]
fn recursion_depth_is_configurable() {
    let engine = Engine::new();
    let mut vm = engine
        .compile(
            "t.jx9",
            "function down($n){ if($n == 0){ return 'hit'; } return down($n - 1); } print down(50);",
        )
        .unwrap();
    vm.set_recursion_depth(64);
    vm.collect_output();
    assert_eq!(vm.exec(), ExecStatus::Done);
    assert_eq!(vm.take_output().unwrap(), b"hit");
}

#[test]
fn switch_compares_loosely_across_types() {
    assert_eq!(run(r#"switch("2"){ case 2: print "num"; break; default: print "d"; }"#), "num");
}

#[test]
fn calling_a_missing_function_yields_null_with_warning() {
    let engine = Engine::new();
    let mut vm = engine.compile("t.jx9", "print no_such_fn(1);").unwrap();
    vm.collect_output();
    vm.collect_errors();
    vm.enable_error_reporting(true);
    assert_eq!(vm.exec(), ExecStatus::Done);
    assert_eq!(vm.take_output().unwrap(), b"");
    let errors = String::from_utf8(vm.take_error_output().unwrap()).unwrap();
    assert!(errors.contains("Warning: calling an undefined function 'no_such_fn'"), "{errors}");
}

#[test]
fn functions_see_fresh_locals_per_call() {
    let src = r#"
        function f(){ $local = $local + 1; return $local; }
        print f(); print f();
    "#;
    // A plain local starts from null on every invocation.
    assert_eq!(run(src), "11");
}
