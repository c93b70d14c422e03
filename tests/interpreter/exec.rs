//! `/exe` definition and invocation

use pretty_assertions::assert_eq;

use super::{eval, js_runner, Harness};

#[test]
fn template_body_interpolates_parameters() {
    let source = "/exe @greet(name) = `Hello, @name!`\n/show @greet(\"Alice\")\n";
    assert_eq!(eval(source), "Hello, Alice!\n");
}

#[test]
fn missing_arguments_bind_null() {
    let source = "/exe @pair(a, b) = `a=@a b=@b`\n/show @pair(\"x\")\n";
    assert_eq!(eval(source), "a=x b=null\n");
}

#[test]
fn ref_body_forwards_with_fixed_arguments() {
    let source = "/exe @greet(name) = `Hello, @name!`\n/exe @hi() = @greet(\"world\")\n/show @hi()\n";
    assert_eq!(eval(source), "Hello, world!\n");
}

#[test]
fn when_body_selects_a_template() {
    let source = "/exe @grade(score) = when first [\n  @score >= 90 => \"A\"\n  @score >= 80 => \"B\"\n  * => \"F\"\n]\n/show @grade(85)\n/show @grade(50)\n";
    assert_eq!(eval(source), "B\nF\n");
}

#[test]
fn executables_close_over_their_definition_environment() {
    let source = "/var @suffix = \"!\"\n/exe @shout(word) = `@word@suffix`\n/show @shout(\"hey\")\n";
    assert_eq!(eval(source), "hey!\n");
}

#[test]
fn js_body_runs_through_the_command_runner() {
    let harness = Harness::new().runner(js_runner(vec![("return \"payload\"", "payload")]));
    let source = "/exe @src() = js { return \"payload\"; }\n/show @src()\n";
    assert_eq!(harness.eval(source), "payload\n");
    assert_eq!(harness.runner.calls(), 1);
    let request = &harness.runner.requests()[0];
    assert_eq!(request.language.as_deref(), Some("js"));
}

#[test]
fn shell_command_body_interpolates_parameters() {
    let harness = Harness::new().runner(super::js_runner(vec![("echo alpha", "alpha")]));
    let source = "/exe @echo(word) = run \"echo @word\"\n/show @echo(\"alpha\")\n";
    assert_eq!(harness.eval(source), "alpha\n");
}

#[test]
fn arguments_cross_the_host_boundary_as_unwrapped_json() {
    let harness = Harness::new()
        .file("/data.json", "{\"k\": 1}")
        .runner(js_runner(vec![("use(data)", "ok")]));
    let source = "/var @d = <data.json>\n/exe @f(data) = js { use(data) }\n/show @f(@d)\n";
    assert_eq!(harness.eval(source), "ok\n");
    let request = &harness.runner.requests()[0];
    // Auto-unwrap: the wrapper's parsed data, not the wrapper itself
    assert_eq!(
        request.env.get("MLLD_ARG_DATA").map(String::as_str),
        Some("{\"k\":1}")
    );
}

#[test]
fn keep_parameters_preserve_the_wrapper() {
    let harness = Harness::new()
        .file("/data.json", "{\"k\": 1}")
        .runner(js_runner(vec![("use(data)", "ok")]));
    let source = "/var @d = <data.json>\n/exe @f(data.keep) = js { use(data) }\n/show @f(@d)\n";
    assert_eq!(harness.eval(source), "ok\n");
    let request = &harness.runner.requests()[0];
    let serialized = request.env.get("MLLD_ARG_DATA").unwrap();
    assert!(serialized.contains("\"text\""));
    assert!(serialized.contains("\"ctx\""));
}

#[test]
fn failing_command_surfaces_exit_code_and_stderr() {
    let harness = Harness::new()
        .strict()
        .runner(js_runner(vec![]));
    let err = harness
        .run("/exe @f() = js { boom() }\n/show @f()\n")
        .unwrap_err();
    assert_eq!(err.code(), "EXECUTION_ERROR");
    assert!(err.to_string().contains("status 1"));
}

#[test]
fn unbounded_recursion_overflows() {
    let err = Harness::new()
        .strict()
        .run("/exe @loop_() = @loop_()\n/show @loop_()\n")
        .unwrap_err();
    assert_eq!(err.code(), "EXECUTION_OVERFLOW");
}

#[test]
fn executables_cannot_be_redefined() {
    let err = Harness::new()
        .strict()
        .run("/exe @f() = `a`\n/var @f = 1\n")
        .unwrap_err();
    assert!(err.to_string().contains("cannot be redefined"));
}

#[test]
fn builtin_transformers_are_available_in_pipes() {
    assert_eq!(eval("/var @x = \"hi\" | @upper\n/show @x\n"), "HI\n");
    assert_eq!(eval("/var @x = \"  hi  \" | @trim\n/show @x\n"), "hi\n");
}
