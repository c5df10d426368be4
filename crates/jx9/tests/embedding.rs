//! The embedding surface: foreign functions, constants, superglobals,
//! stream-backed inclusion, output consumers and the environment builtins.

use std::{cell::RefCell, rc::Rc};

use jx9::{Abort, Engine, ExecStatus, FnResult, Object, OutputConsumer, Severity};
use pretty_assertions::assert_eq;

fn run(src: &str) -> String {
    let engine = Engine::new();
    let mut vm = engine.compile("test.jx9", src).expect("script compiles");
    vm.collect_output();
    vm.exec();
    String::from_utf8(vm.take_output().expect("collection enabled")).expect("utf8 output")
}

#[test]
fn foreign_functions_receive_and_return_values() {
    let engine = Engine::new();
    let mut vm = engine.compile("t.jx9", "print double_it(21);").unwrap();
    vm.register_function("double_it", |ctx| {
        let n = ctx.arg_int(0);
        ctx.result_int(n * 2);
        FnResult::Ok
    });
    vm.collect_output();
    vm.exec();
    assert_eq!(vm.take_output().unwrap(), b"42");
}

#[test]
fn foreign_functions_see_structured_arguments() {
    let engine = Engine::new();
    let mut vm = engine.compile("t.jx9", r#"inspect({k: [1, 2]});"#).unwrap();
    let seen: Rc<RefCell<Option<Object>>> = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&seen);
    vm.register_function("inspect", move |ctx| {
        *sink.borrow_mut() = ctx.arg_object(0);
        FnResult::Ok
    });
    vm.silence_output();
    vm.exec();
    let value = seen.borrow_mut().take().expect("argument captured");
    let Object::Map(entries) = value else {
        panic!("expected an object argument");
    };
    assert_eq!(entries[0].0, "k");
}

#[test]
fn foreign_abort_unwinds_everything() {
    let engine = Engine::new();
    let mut vm = engine
        .compile("t.jx9", r#"print "before"; stop_now(); print "after";"#)
        .unwrap();
    vm.register_function("stop_now", |_ctx| FnResult::Abort);
    vm.collect_output();
    assert_eq!(vm.exec(), ExecStatus::Aborted);
    assert_eq!(vm.take_output().unwrap(), b"before");
}

#[test]
fn foreign_functions_can_throw_diagnostics() {
    let engine = Engine::new();
    let mut vm = engine.compile("t.jx9", "grumble();").unwrap();
    vm.register_function("grumble", |ctx| {
        ctx.throw(Severity::Notice, "nothing to do");
        FnResult::Ok
    });
    vm.collect_errors();
    vm.enable_error_reporting(true);
    vm.silence_output();
    vm.exec();
    let errors = String::from_utf8(vm.take_error_output().unwrap()).unwrap();
    assert_eq!(errors, "t.jx9 Notice: grumble(): nothing to do\n");
}

#[test]
fn registered_constants_expand_on_reference() {
    let engine = Engine::new();
    let mut vm = engine.compile("t.jx9", "print APP_NAME; print '|'; print APP_NAME;").unwrap();
    let hits = Rc::new(RefCell::new(0u32));
    let counter = Rc::clone(&hits);
    vm.register_constant("APP_NAME", move || {
        *counter.borrow_mut() += 1;
        Object::from("demo")
    });
    vm.collect_output();
    vm.exec();
    assert_eq!(vm.take_output().unwrap(), b"demo|demo");
    // Expanded on demand, each time the name is referenced.
    assert_eq!(*hits.borrow(), 2);
}

#[test]
fn builtin_constants_exist() {
    assert_eq!(run("print INT_MAX;"), i64::MAX.to_string());
    assert_eq!(run(r#"print defined("JX9_VERSION") ? "t" : "f";"#), "t");
}

#[test]
fn superglobals_resolve_before_locals() {
    // $_GET is visible inside function frames without any uplink.
    let src = r#"
        function inner(){ return $_GET["id"]; }
        print $_GET["id"]; print "|"; print inner();
    "#;
    let engine = Engine::new();
    let mut vm = engine.compile("t.jx9", src).unwrap();
    vm.superglobal_insert("_GET", "id", Object::from("42"));
    vm.collect_output();
    vm.exec();
    assert_eq!(vm.take_output().unwrap(), b"42|42");
}

#[test]
fn argv_feeds_getopt() {
    let engine = Engine::new();
    let src = r#"
        $o = getopt("vo:", ["mode:"]);
        print $o.o; print "|"; print $o.mode; print "|";
        print ($o.v === false) ? "flag" : "x";
    "#;
    let mut vm = engine.compile("t.jx9", src).unwrap();
    for arg in ["-v", "-o", "out.txt", "--mode=fast"] {
        vm.argv_push(arg);
    }
    vm.collect_output();
    vm.exec();
    assert_eq!(vm.take_output().unwrap(), b"out.txt|fast|flag");
}

#[test]
fn argv_is_a_script_visible_array() {
    let engine = Engine::new();
    let mut vm = engine.compile("t.jx9", "print sizeof($argv); print $argv[0];").unwrap();
    vm.argv_push("alpha");
    vm.collect_output();
    vm.exec();
    assert_eq!(vm.take_output().unwrap(), b"1alpha");
}

#[test]
fn extract_imports_map_entries_as_variables() {
    assert_eq!(run("$data = {x: 10, y: 20}; extract($data); print $x + $y;"), "30");
}

#[test]
fn parse_url_returns_components() {
    let src = r#"
        $u = parse_url("http://ada:pw@example.com:8080/docs?q=1#top");
        print $u.scheme; print ' '; print $u.host; print ' '; print $u.port;
        print ' '; print $u.path; print ' '; print $u.query;
    "#;
    assert_eq!(run(src), "http example.com 8080 /docs q=1");
}

#[test]
fn utf8_encode_and_decode() {
    assert_eq!(run(r#"print utf8_decode(utf8_encode("plain"));"#), "plain");
}

#[test]
fn rand_respects_bounds() {
    let out = run("$r = rand(5, 7); print ($r >= 5 && $r <= 7) ? 'in' : 'out';");
    assert_eq!(out, "in");
    assert_eq!(run("print getrandmax();"), u32::MAX.to_string());
    let s = run("print rand_str(12);");
    assert_eq!(s.len(), 12);
    assert!(s.bytes().all(|b| b.is_ascii_lowercase()));
}

#[test]
fn include_compiles_and_runs_in_the_calling_scope() {
    let dir = std::env::temp_dir();
    let path = dir.join("jx9_include_test.jx9");
    std::fs::write(&path, "function from_inc(){ return 11; } $inc_var = 7;").unwrap();
    let src = format!("include('{}'); print from_inc(); print $inc_var;", path.display());
    assert_eq!(run(&src), "117");
    std::fs::remove_file(&path).ok();
}

#[test]
fn import_runs_once_per_path() {
    let dir = std::env::temp_dir();
    let path = dir.join("jx9_import_test.jx9");
    std::fs::write(&path, "print 'x';").unwrap();
    let src = format!("import('{p}'); import('{p}'); print '|';", p = path.display());
    assert_eq!(run(&src), "x|");
    std::fs::remove_file(&path).ok();
}

#[test]
fn import_path_resolves_relative_names() {
    let dir = std::env::temp_dir().join("jx9_import_dir_test");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("lib.jx9"), "function lib_fn(){ return 'lib'; }").unwrap();
    let engine = Engine::new();
    let mut vm = engine.compile("t.jx9", "include('lib.jx9'); print lib_fn();").unwrap();
    vm.add_import_path(dir.display().to_string());
    vm.collect_output();
    vm.exec();
    assert_eq!(vm.take_output().unwrap(), b"lib");
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn output_consumer_abort_stops_the_script() {
    struct Stopper;
    impl OutputConsumer for Stopper {
        fn consume(&mut self, _chunk: &[u8]) -> Result<(), Abort> {
            Err(Abort)
        }
    }
    let engine = Engine::new();
    let mut vm = engine.compile("t.jx9", r#"print "x"; print "never";"#).unwrap();
    vm.set_output_consumer(Box::new(Stopper));
    assert_eq!(vm.exec(), ExecStatus::Aborted);
}

#[test]
fn custom_output_consumer_receives_chunks() {
    #[derive(Default)]
    struct Tape(Rc<RefCell<Vec<u8>>>);
    impl OutputConsumer for Tape {
        fn consume(&mut self, chunk: &[u8]) -> Result<(), Abort> {
            self.0.borrow_mut().extend_from_slice(chunk);
            Ok(())
        }
    }
    let tape = Rc::new(RefCell::new(Vec::new()));
    let engine = Engine::new();
    let mut vm = engine.compile("t.jx9", "print 'a'; print 'b';").unwrap();
    vm.set_output_consumer(Box::new(Tape(Rc::clone(&tape))));
    vm.exec();
    assert_eq!(&*tape.borrow(), b"ab");
}

#[test]
fn function_registry_introspection() {
    assert_eq!(run(r#"print function_exists("json_encode") ? "t" : "f";"#), "t");
    assert_eq!(run(r#"print function_exists("nope") ? "t" : "f";"#), "f");
    assert_eq!(run(r#"function mine(){} print is_callable("mine") ? "t" : "f";"#), "t");
}

#[test]
fn include_inside_a_loop_keeps_the_outer_cursor() {
    // The included unit runs its own foreach in the calling frame; the
    // outer loop's cursor must survive it.
    let dir = std::env::temp_dir();
    let path = dir.join("jx9_loop_include_test.jx9");
    std::fs::write(&path, "foreach([9] as $x){ $seen = $x; }").unwrap();
    let src = format!(
        "foreach([1, 2] as $v){{ include('{}'); print $v; }} print $seen;",
        path.display()
    );
    assert_eq!(run(&src), "129");
    std::fs::remove_file(&path).ok();
}

#[test]
fn bytecode_dump_lists_units_and_instructions() {
    let engine = Engine::new();
    let vm = engine
        .compile("t.jx9", "function twice(int $n){ return $n * 2; } print twice(4);")
        .unwrap();
    let dump = vm.dump_bytecode();
    assert!(dump.contains("==== main ===="), "{dump}");
    assert!(dump.contains("function twice(i)"), "{dump}");
    assert!(dump.contains("Consume"), "{dump}");
    assert!(dump.contains("Mul"), "{dump}");
}

#[test]
fn host_can_shadow_a_builtin() {
    let engine = Engine::new();
    let mut vm = engine.compile("t.jx9", "print rand();").unwrap();
    vm.register_function("rand", |ctx| {
        ctx.result_int(4);
        FnResult::Ok
    });
    vm.collect_output();
    vm.exec();
    assert_eq!(vm.take_output().unwrap(), b"4");
}
