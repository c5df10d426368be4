//! The compiled-in script prelude.
//!
//! Array helpers that need no native support are written in the scripting
//! language itself and compiled into every VM at creation, the same way the
//! engine's other functions register. A user function with the same name
//! wins: prelude entries install only for names not already taken.

use crate::{compile, value::Value, vm::Vm};

const PRELUDE: &str = r#"
function abs($x){
    if( $x < 0 ){ return 0 - $x; }
    return $x;
}
function max(){
    $args = func_get_args();
    if( sizeof($args) < 1 ){ return null; }
    if( sizeof($args) == 1 ){
        if( !is_array($args[0]) ){ return $args[0]; }
        $args = $args[0];
    }
    $found = false;
    $cur = null;
    foreach($args as $v){
        if( $found == false || $v > $cur ){ $cur = $v; $found = true; }
    }
    return $cur;
}
function min(){
    $args = func_get_args();
    if( sizeof($args) < 1 ){ return null; }
    if( sizeof($args) == 1 ){
        if( !is_array($args[0]) ){ return $args[0]; }
        $args = $args[0];
    }
    $found = false;
    $cur = null;
    foreach($args as $v){
        if( $found == false || $v < $cur ){ $cur = $v; $found = true; }
    }
    return $cur;
}
function in_array($needle, $haystack){
    if( !is_array($haystack) ){ return false; }
    foreach($haystack as $v){
        if( $v == $needle ){ return true; }
    }
    return false;
}
function array_keys($arr){
    $out = [];
    if( is_array($arr) ){
        foreach($arr as $k, $v){ $out[] = $k; }
    }
    return $out;
}
function array_values($arr){
    $out = [];
    if( is_array($arr) ){
        foreach($arr as $k, $v){ $out[] = $v; }
    }
    return $out;
}
function array_merge(){
    $args = func_get_args();
    $out = [];
    foreach($args as $arr){
        if( !is_array($arr) ){ continue; }
        foreach($arr as $k, $v){
            if( is_int($k) ){ $out[] = $v; }
            else { $out[$k] = $v; }
        }
    }
    return $out;
}
"#;

pub(super) fn install(vm: &mut Vm) {
    let literals: Vec<Value> = vm.literals.iter().map(Value::clone_immediate).collect();
    match compile::compile_source(PRELUDE, literals, vm.lambda_next) {
        Ok(out) => {
            vm.literals = out.literals;
            vm.lambda_next = out.lambda_next;
            for func in out.funcs {
                if !vm.funcs.contains_key(&*func.name) {
                    vm.install_func(func);
                }
            }
        }
        Err(errors) => debug_assert!(false, "prelude failed to compile: {errors:?}"),
    }
}
