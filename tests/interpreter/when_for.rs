//! `/when` cascades and `/for` loops, directive and expression forms

use pretty_assertions::assert_eq;

use super::eval;

#[test]
fn simple_when_directive() {
    assert_eq!(eval("/var @x = 5\n/when @x > 3 => show \"big\"\n"), "big\n");
    assert_eq!(eval("/var @x = 1\n/when @x > 3 => show \"big\"\n"), "");
}

#[test]
fn when_block_runs_every_truthy_arm() {
    let source = "/var @x = 5\n/when [\n  @x > 1 => show \"one\"\n  @x > 2 => show \"two\"\n  @x > 10 => show \"ten\"\n]\n";
    assert_eq!(eval(source), "one\ntwo\n");
}

#[test]
fn when_first_stops_at_the_first_match() {
    let source =
        "/var @x = 5\n/when first [\n  @x > 1 => show \"one\"\n  @x > 2 => show \"two\"\n]\n";
    assert_eq!(eval(source), "one\n");
}

#[test]
fn when_none_fires_only_without_matches() {
    let source = "/var @x = 0\n/when [\n  @x > 1 => show \"big\"\n  none => show \"nothing\"\n]\n";
    assert_eq!(eval(source), "nothing\n");
    let matched = "/var @x = 5\n/when [\n  @x > 1 => show \"big\"\n  none => show \"nothing\"\n]\n";
    assert_eq!(eval(matched), "big\n");
}

#[test]
fn when_expression_first_returns_action_value() {
    let source = "/var @grade = when first [\n  90 <= 95 => \"A\"\n  * => \"B\"\n]\n/show @grade\n";
    assert_eq!(eval(source), "A\n");
}

#[test]
fn when_any_is_boolean_or_with_short_circuit() {
    let source = "/var @r = when any [\n  false => \"x\"\n  true => \"y\"\n]\n/show @r\n";
    assert_eq!(eval(source), "true\n");
    let source = "/var @r = when any [\n  false => \"x\"\n]\n/show @r\n";
    assert_eq!(eval(source), "false\n");
}

#[test]
fn when_all_is_boolean_and() {
    let source = "/var @r = when all [\n  true => \"x\"\n  1 < 2 => \"y\"\n]\n/show @r\n";
    assert_eq!(eval(source), "true\n");
    let source = "/var @r = when all [\n  true => \"x\"\n  1 > 2 => \"y\"\n]\n/show @r\n";
    assert_eq!(eval(source), "false\n");
}

#[test]
fn for_directive_emits_in_iteration_order() {
    let source = "/var @items = [\"a\", \"b\", \"c\"]\n/for @x in @items => show `item @x`\n";
    assert_eq!(eval(source), "item a\nitem b\nitem c\n");
}

#[test]
fn for_expression_collects_results() {
    let source = "/var @xs = [1, 2, 3]\n/var @doubled = for @x in @xs => @x * 2\n/show @doubled\n";
    assert_eq!(eval(source), "[2,4,6]\n");
}

#[test]
fn for_iterates_object_values() {
    let source = "/var @m = {\"a\": 1, \"b\": 2}\n/var @vals = for @v in @m => @v\n/show @vals\n";
    assert_eq!(eval(source), "[1,2]\n");
}

#[test]
fn parallel_for_preserves_order_and_length() {
    let source = "/var @xs = [1, 2, 3, 4]\n/var @out = for parallel(2) @x in @xs => @x + 10\n/show @out\n";
    assert_eq!(eval(source), "[11,12,13,14]\n");
}

#[test]
fn parallel_for_rejects_outer_mutation_but_completes() {
    // Rebinding @total inside a parallel iteration is an outward write; it
    // lands in @mx.errors instead of aborting the loop
    let source = "/var @total = 0\n/var @xs = [1, 2]\n/for parallel(2) @x in @xs => /var @total = @x\n/show @mx.errors.length\n/show @total\n";
    assert_eq!(eval(source), "2\n0\n");
}

#[test]
fn parallel_for_expression_records_errors_and_yields_null() {
    let source = "/var @xs = [1, 0, 2]\n/var @out = for parallel(2) @x in @xs => 10 / @x\n/show @out\n/show @mx.errors.length\n";
    assert_eq!(eval(source), "[10,null,5]\n1\n");
}

#[test]
fn mx_for_frame_exposes_iteration_index() {
    let source = "/var @xs = [\"a\", \"b\"]\n/for @x in @xs => show `@mx.for.index/@mx.for.total @x`\n";
    assert_eq!(eval(source), "0/2 a\n1/2 b\n");
}
