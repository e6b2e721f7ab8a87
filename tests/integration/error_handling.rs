// tests/integration/error_handling.rs

use std::io::Write;
use tempfile::NamedTempFile;

use dagflow::config::{build_registry, build_sink, load_and_validate};
use dagflow::dag::{Graph, GraphError, TaskNode};
use dagflow::errors::DagflowError;
use dagflow::exec::{TaskContext, TaskError, TaskOutput, TaskRegistry};
use dagflow_test_utils::builders::{ConfigFileBuilder, TaskConfigBuilder};

fn config_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{contents}").unwrap();
    file
}

#[test]
fn graph_cycle_returns_structured_error() {
    let file = config_file(
        r#"
[task.A]
cmd = "echo A"
after = ["B"]

[task.B]
cmd = "echo B"
after = ["A"]
"#,
    );

    match load_and_validate(file.path()) {
        Err(DagflowError::Graph(GraphError::Cycle { task })) => {
            assert!(task == "A" || task == "B");
        }
        Err(e) => panic!("Expected cycle error, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn unknown_dependency_returns_config_error() {
    let file = config_file(
        r#"
[task.A]
cmd = "echo A"
after = ["NonExistent"]
"#,
    );

    match load_and_validate(file.path()) {
        Err(DagflowError::ConfigError(msg)) => {
            assert!(msg.contains("unknown dependency"));
            assert!(msg.contains("NonExistent"));
        }
        Err(e) => panic!("Expected ConfigError, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn malformed_toml_returns_toml_error() {
    let file = config_file("[task.A\ncmd = ");
    assert!(matches!(
        load_and_validate(file.path()),
        Err(DagflowError::TomlError(_))
    ));
}

#[test]
fn unknown_trigger_rule_is_rejected_while_parsing() {
    let file = config_file(
        r#"
[task.A]
cmd = "echo A"
trigger_rule = "one_success"
"#,
    );
    assert!(matches!(
        load_and_validate(file.path()),
        Err(DagflowError::TomlError(_))
    ));
}

#[test]
fn empty_config_is_rejected() {
    let err = ConfigFileBuilder::new().try_build().unwrap_err();
    assert!(err.to_string().contains("at least one [task.<name>]"));
}

#[test]
fn bad_durations_are_rejected() {
    let err = ConfigFileBuilder::new()
        .with_task("a", TaskConfigBuilder::new("echo a").backoff("soon").build())
        .try_build()
        .unwrap_err();
    assert!(err.to_string().contains("backoff"));

    let err = ConfigFileBuilder::new()
        .default_backoff("5 minutes")
        .with_task("a", TaskConfigBuilder::new("echo a").build())
        .try_build()
        .unwrap_err();
    assert!(err.to_string().contains("[default].backoff"));
}

#[test]
fn zero_attempts_is_rejected() {
    let err = ConfigFileBuilder::new()
        .with_task("a", TaskConfigBuilder::new("echo a").max_attempts(0).build())
        .try_build()
        .unwrap_err();
    assert!(err.to_string().contains("max_attempts"));
}

#[test]
fn sink_config_builds_a_complete_registry() {
    let cfg = ConfigFileBuilder::new()
        .with_table("stock_prices", &["symbol", "date"], &["close"])
        .with_task("extract", TaskConfigBuilder::new("echo '[]'").build())
        .with_task("load", TaskConfigBuilder::sink("stock_prices", "extract").build())
        .build();

    let graph = cfg.to_graph().unwrap();
    let registry = build_registry(&cfg, build_sink(&cfg)).unwrap();
    registry.check(&graph).unwrap();
}

#[test]
fn registry_without_operator_is_rejected() {
    let graph = Graph::new("p", vec![TaskNode::new("a"), TaskNode::new("b").after("a")]).unwrap();
    let registry = TaskRegistry::new().task("a", |_ctx: TaskContext| async {
        Ok::<_, TaskError>(TaskOutput::default())
    });

    match registry.check(&graph) {
        Err(DagflowError::TaskNotFound(name)) => assert_eq!(name, "b"),
        other => panic!("Expected TaskNotFound, got: {:?}", other),
    }
}
