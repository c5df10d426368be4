//! The builtin library: string functions, native array mutators, the script
//! prelude, and the execution tracer.

use std::{cell::RefCell, rc::Rc};

use jx9::{Engine, RecordingTracer};
use pretty_assertions::assert_eq;

fn run(src: &str) -> String {
    let engine = Engine::new();
    let mut vm = engine.compile("test.jx9", src).expect("script compiles");
    vm.collect_output();
    vm.exec();
    String::from_utf8(vm.take_output().expect("collection enabled")).expect("utf8 output")
}

#[test]
fn string_length_and_slicing() {
    assert_eq!(run("print strlen('hello');"), "5");
    assert_eq!(run("print substr('hello', 1);"), "ello");
    assert_eq!(run("print substr('hello', 1, 3);"), "ell");
    assert_eq!(run("print substr('hello', -2);"), "lo");
    assert_eq!(run("print substr('hello', 1, -1);"), "ell");
    assert_eq!(run("print (substr('hi', 9) === false) ? 'f' : 'x';"), "f");
}

#[test]
fn string_case_trim_repeat() {
    assert_eq!(run("print strtoupper('aBc');"), "ABC");
    assert_eq!(run("print strtolower('AbC');"), "abc");
    assert_eq!(run("print trim('  pad  ');"), "pad");
    assert_eq!(run("print ltrim('  pad  ');"), "pad  ");
    assert_eq!(run("print rtrim('  pad  ');"), "  pad");
    assert_eq!(run("print str_repeat('ab', 3);"), "ababab");
}

#[test]
fn string_search_join_split() {
    assert_eq!(run("print strpos('abcabc', 'ca');"), "2");
    assert_eq!(run("print (strpos('abc', 'z') === false) ? 'f' : 'x';"), "f");
    assert_eq!(run("print implode('-', [1, 2, 3]);"), "1-2-3");
    assert_eq!(run("print json_encode(explode(',', 'a,b,c'));"), r#"["a","b","c"]"#);
}

#[test]
fn array_push_pop_shift_mutate_in_place() {
    assert_eq!(run("$a = [1]; array_push($a, 2, 3); print json_encode($a);"), "[1,2,3]");
    assert_eq!(run("$a = [1, 2, 3]; print array_pop($a); print json_encode($a);"), "3[1,2]");
    assert_eq!(run("$a = [1, 2, 3]; print array_shift($a); print json_encode($a);"), "1[2,3]");
    assert_eq!(run("print (array_pop([]) === null) ? 'n' : 'x';"), "n");
}

#[test]
fn foreach_skips_entries_deleted_mid_loop() {
    // The cursor snapshot holds keys 0..2; popping the tail deletes the
    // upcoming entries, which the walk then skips.
    let src = r#"
        $m = [1, 2, 3];
        foreach($m as $v){
            print $v;
            array_pop($m);
        }
        print '|';
        print sizeof($m);
    "#;
    assert_eq!(run(src), "12|1");
}

#[test]
fn substr_tolerates_extreme_bounds() {
    // Offsets and lengths are arbitrary script integers; the edges of the
    // i64 range must clamp instead of overflowing.
    assert_eq!(run("print substr('hello', 1, 9223372036854775807);"), "ello");
    assert_eq!(run("print substr('hello', -9223372036854775808, 2);"), "he");
    assert_eq!(run("print substr('hello', 1, -9223372036854775808); print '|';"), "|");
}

#[test]
fn rand_tolerates_extreme_bounds() {
    let src = r#"
        $r = rand(-9223372036854775808, 9223372036854775807);
        print is_int($r) ? 'i' : 'x';
        $s = rand(-5, 9223372036854775807);
        print ($s >= -5) ? 'in' : 'out';
    "#;
    assert_eq!(run(src), "iin");
}

#[test]
fn prelude_max_min_abs() {
    assert_eq!(run("print max(3, 9, 5);"), "9");
    assert_eq!(run("print max([3, 9, 5]);"), "9");
    assert_eq!(run("print min(3, 9, 5);"), "3");
    assert_eq!(run("print min(7);"), "7");
    assert_eq!(run("print (max() === null) ? 'n' : 'x';"), "n");
    assert_eq!(run("print abs(0 - 4); print abs(4);"), "44");
}

#[test]
fn prelude_array_helpers() {
    assert_eq!(run("print json_encode(array_keys({a:1, b:2}));"), r#"["a","b"]"#);
    assert_eq!(run("print json_encode(array_values({a:1, b:2}));"), "[1,2]");
    assert_eq!(run("print in_array(2, [1, 2, 3]) ? 't' : 'f';"), "t");
    assert_eq!(run("print in_array(9, [1, 2, 3]) ? 't' : 'f';"), "f");
    assert_eq!(
        run("print json_encode(array_merge([1, 2], {k: 'v'}, [3]));"),
        r#"{"0":1,"1":2,"k":"v","2":3}"#
    );
}

#[test]
fn user_functions_shadow_the_prelude() {
    assert_eq!(run("function max(){ return 'mine'; } print max(1, 2);"), "mine");
}

#[test]
fn tracer_observes_the_instruction_stream() {
    let engine = Engine::new();
    let mut vm = engine.compile("t.jx9", "print 1 + 2;").unwrap();
    let recorder = Rc::new(RefCell::new(RecordingTracer::new()));
    vm.set_tracer(Box::new(Rc::clone(&recorder)));
    vm.silence_output();
    vm.exec();
    let recorder = recorder.borrow();
    let opcodes: Vec<&str> = recorder.events().iter().map(|e| e.opcode).collect();
    assert_eq!(opcodes, ["Loadc", "Loadc", "Add", "Consume", "Done"]);
    // The global frame is depth 1 throughout.
    assert!(recorder.events().iter().all(|e| e.frame_depth == 1));
}

#[test]
fn tracer_can_be_removed() {
    let engine = Engine::new();
    let mut vm = engine.compile("t.jx9", "print 1;").unwrap();
    vm.set_tracer(Box::new(jx9::NoopTracer));
    assert!(vm.take_tracer().is_some());
    assert!(vm.take_tracer().is_none());
}
