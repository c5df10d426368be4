//! Value-system properties observed through whole scripts: equality
//! behavior, JSON round trips, hashmap sharing.

use jx9::Engine;
use pretty_assertions::assert_eq;

fn run(src: &str) -> String {
    let engine = Engine::new();
    let mut vm = engine.compile("test.jx9", src).expect("script compiles");
    vm.collect_output();
    vm.exec();
    String::from_utf8(vm.take_output().expect("collection enabled")).expect("utf8 output")
}

#[test]
fn loose_equality_is_not_transitive() {
    assert_eq!(run(r#"print ("0" == 0) ? "t" : "f";"#), "t");
    assert_eq!(run(r#"print (0 == "") ? "t" : "f";"#), "t");
    assert_eq!(run(r#"print ("0" == "") ? "t" : "f";"#), "f");
}

#[test]
fn strict_equality_requires_matching_types() {
    assert_eq!(run(r#"print (1 === 1.0) ? "t" : "f";"#), "f");
    assert_eq!(run(r#"print (1 == 1.0) ? "t" : "f";"#), "t");
    assert_eq!(run(r#"print ("5" === 5) ? "t" : "f";"#), "f");
    assert_eq!(run(r#"print (null === null) ? "t" : "f";"#), "t");
}

#[test]
fn null_pairs_with_the_empty_map() {
    assert_eq!(run(r#"print (null == []) ? "t" : "f";"#), "t");
    assert_eq!(run(r#"print (null == [1]) ? "t" : "f";"#), "f");
    assert_eq!(run(r#"print (null === []) ? "t" : "f";"#), "f");
}

#[test]
fn relational_comparisons_promote_numerically() {
    assert_eq!(run(r#"print ("10" > 9) ? "t" : "f";"#), "t");
    assert_eq!(run(r#"print ("abc" < "abd") ? "t" : "f";"#), "t");
    // Shorter string is less when it is a prefix of the longer one.
    assert_eq!(run(r#"print ("ab" < "abc") ? "t" : "f";"#), "t");
}

#[test]
fn map_comparison_is_deep_and_ordered() {
    assert_eq!(run(r#"print ({a:1, b:[2]} == {a:1, b:[2]}) ? "t" : "f";"#), "t");
    assert_eq!(run(r#"print ({a:1} == {a:2}) ? "t" : "f";"#), "f");
    assert_eq!(run(r#"print ([1,2] == [1,2,3]) ? "t" : "f";"#), "f");
}

#[test]
fn json_round_trip_is_strictly_structural() {
    let src = r#"
        $v = json_decode('{"k":[1,"s",true,null],"n":{"x":"y"}}');
        $w = json_decode(json_encode($v));
        print ($v === $w) ? "same" : "diff";
    "#;
    assert_eq!(run(src), "same");
}

#[test]
fn json_decode_rejects_malformed_input() {
    assert_eq!(run(r#"print (json_decode('{"unclosed":') === null) ? "null" : "x";"#), "null");
}

#[test]
fn maps_share_by_reference() {
    let src = r#"
        $a = {n: 1};
        $b = $a;
        $b.n = 2;
        print $a.n;
    "#;
    assert_eq!(run(src), "2");
}

#[test]
fn foreach_values_share_nested_maps() {
    let src = r#"
        $rows = [{n: 1}];
        foreach($rows as $row){ $row.n = 9; }
        print $rows[0].n;
    "#;
    assert_eq!(run(src), "9");
}

#[test]
fn map_union_prefers_the_left_operand() {
    assert_eq!(run("print json_encode([1,2] + [9,8,7]);"), "[1,2,7]");
    assert_eq!(run("print json_encode({a:1} + {a:2, b:3});"), r#"{"a":1,"b":3}"#);
}

#[test]
fn real_formatting_uses_fifteen_significant_digits() {
    assert_eq!(run("print 0.5;"), "0.5");
    assert_eq!(run("print 1.0e20;"), "1e+20");
    // Exact real results demote to integers.
    assert_eq!(run("print 1.5 + 0.5;"), "2");
    assert_eq!(run("print 7 / 2;"), "3.5");
}

#[test]
fn string_number_addition_examples() {
    assert_eq!(run(r#"print "10" + 5;"#), "15");
    assert_eq!(run(r#"print "1.5" + "1.5";"#), "3");
    assert_eq!(run(r#"print "junk" + 1;"#), "1");
}

#[test]
fn bool_and_null_images() {
    assert_eq!(run("print true;"), "true");
    assert_eq!(run("print false;"), "false");
    assert_eq!(run("print null; print 'x';"), "x");
}

#[test]
fn type_reflection_builtins() {
    assert_eq!(run("print gettype(1.5);"), "float");
    assert_eq!(run("print gettype([]);"), "JSON Array");
    assert_eq!(run("print gettype({});"), "JSON Object");
    assert_eq!(run("print sizeof({a:1, b:2});"), "2");
    assert_eq!(run(r#"print is_numeric("1.5e3") ? "t" : "f";"#), "t");
    assert_eq!(run(r#"print is_numeric("3 apples") ? "t" : "f";"#), "f");
}

#[test]
fn dump_shows_type_and_contents() {
    assert_eq!(run("dump(5);"), "int(5)\n");
    assert_eq!(run("dump('abc');"), "string(3 'abc')\n");
    assert_eq!(run("dump([1,2]);"), "JSON Array(2 [1,2])\n");
    assert_eq!(run("dump(null);"), "null\n");
}

#[test]
fn numeric_string_keys_alias_integer_keys() {
    let src = r#"
        $a = [];
        $a["7"] = "x";
        print $a[7];
    "#;
    assert_eq!(run(src), "x");
}

#[test]
fn append_form_uses_next_free_index() {
    let src = r#"
        $a = [];
        $a[] = "first";
        $a[9] = "gap";
        $a[] = "after";
        print json_encode($a);
    "#;
    assert_eq!(run(src), r#"["first","gap","after"]"#);
}
