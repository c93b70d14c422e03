//! Pipeline stages, retries, hints, and control returns

use pretty_assertions::assert_eq;

use super::{eval, js_runner, Harness};

#[test]
fn stages_chain_left_to_right() {
    let source = "/exe @excl(s) = `@s!`\n/var @r = \"hi\" | @upper | @excl\n/show @r\n";
    assert_eq!(eval(source), "HI!\n");
}

#[test]
fn retry_with_hint_replays_the_source() {
    // The inline effect replays once per attempt; the source re-executes
    let harness = Harness::new().runner(js_runner(vec![("return \"payload\"", "payload")]));
    let source = "/exe @src() = js { return \"payload\"; }\n/exe @check(input, pipeline) = when first [\n  @pipeline.try < 3 => retry \"again\"\n  * => \"done\"\n]\n/var @r = @src() | show \"attempt @p.try\" | @check(@p)\n/show @r\n";
    assert_eq!(
        harness.eval(source),
        "attempt 1\nattempt 2\nattempt 3\ndone\n"
    );
    // The source stage re-executed once per attempt
    assert_eq!(harness.runner.calls(), 3);
}

#[test]
fn hint_is_threaded_into_later_attempts() {
    let source = "/exe @probe(input, ctx) = when first [\n  @ctx.hint == \"again\" => \"saw hint\"\n  * => retry \"again\"\n]\n/exe @seed() = `seed`\n/var @r = @seed() | @probe(@ctx)\n/show @r\n";
    assert_eq!(eval(source), "saw hint\n");
}

#[test]
fn prior_attempts_accumulate_in_tries() {
    let source = "/exe @seed() = `s`\n/exe @count(input, pipeline) = when first [\n  @pipeline.tries.length < 2 => retry\n  * => @pipeline.tries.length\n]\n/var @r = @seed() | @count(@p)\n/show @r\n";
    assert_eq!(eval(source), "2\n");
}

#[test]
fn skip_halts_with_the_last_good_output() {
    let source = "/exe @gate(input) = when first [\n  @input == \"stop\" => skip\n  * => \"changed\"\n]\n/exe @seed() = `stop`\n/var @r = @seed() | @gate\n/show @r\n";
    assert_eq!(eval(source), "stop\n");
}

#[test]
fn done_short_circuits_successfully() {
    let source = "/exe @gate(input) = when first [\n  * => done\n]\n/exe @never(input) = `not reached`\n/exe @seed() = `value`\n/var @r = @seed() | @gate | @never\n/show @r\n";
    assert_eq!(eval(source), "value\n");
}

#[test]
fn retry_exhaustion_fails_with_pipeline_error() {
    let harness = Harness::new().strict();
    let source = "/exe @seed() = `s`\n/exe @always(input) = retry\n/var @r = @seed() | @always\n";
    let err = harness.run(source).unwrap_err();
    assert_eq!(err.code(), "PIPELINE_RETRY_EXHAUSTED");
}

#[test]
fn retry_without_retryable_source_fails() {
    let harness = Harness::new().strict();
    let source = "/exe @always(input) = retry\n/var @r = \"fixed\" | @always\n";
    let err = harness.run(source).unwrap_err();
    assert_eq!(err.code(), "PIPELINE_STAGE_THROW");
}

#[test]
fn stage_positions_are_one_based_and_indexable() {
    let source = "/exe @a(input) = `a-out`\n/exe @b(input, pipeline) = `stage @pipeline.stage saw @pipeline[0] then @pipeline[-1]`\n/exe @seed() = `seed`\n/var @r = @seed() | @a | @b(@p)\n/show @r\n";
    assert_eq!(eval(source), "stage 2 saw seed then a-out\n");
}

#[test]
fn structured_input_parses_json_for_data_access() {
    let source = "/exe @emit() = `{\"count\": 3}`\n/exe @reader(input) = `count=@input.count`\n/var @r = @emit() | @reader\n/show @r\n";
    assert_eq!(eval(source), "count=3\n");
}

#[test]
fn input_text_stays_raw() {
    let source = "/exe @emit() = `{\"count\": 3}`\n/exe @reader(input) = `raw=@input.text`\n/var @r = @emit() | @reader\n/show @r\n";
    assert_eq!(eval(source), "raw={\"count\": 3}\n");
}

#[test]
fn with_clause_pipeline_on_invocations() {
    let source = "/exe @seed() = `hi`\n/var @r = @seed() with { pipeline: [@upper] }\n/show @r\n";
    assert_eq!(eval(source), "HI\n");
}

#[test]
fn non_retry_pipeline_folds_like_function_composition() {
    let source = "/exe @wrap(s) = `[@s]`\n/var @r = \"x\" | @wrap | @wrap | @wrap\n/show @r\n";
    assert_eq!(eval(source), "[[[x]]]\n");
}
