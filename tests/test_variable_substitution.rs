mod common;

use common::ProjectFixture;
use otsc::{OtsModuleReader, OutputFormat};

#[test]
fn test_default_applies_with_empty_variable_map() {
    let fixture = ProjectFixture::new("t_project");
    fixture.write(
        "models/a/filtered.sql",
        "SELECT * FROM a.base WHERE n = @name:anonymous",
    );
    fixture.write("models/a/base.sql", "SELECT 1 AS n");

    let mut compiler = fixture.compiler();
    let result = compiler.compile(OutputFormat::Json).unwrap();

    let module = OtsModuleReader::new()
        .read_module(&result.exported_paths["t_project.a"])
        .unwrap();
    let filtered = module
        .transformations
        .iter()
        .find(|t| t.transformation_id == "a.filtered")
        .unwrap();
    assert!(filtered.code.sql.original_sql.contains("n = 'anonymous'"));
}

#[test]
fn test_configured_variable_wins_over_default() {
    let fixture = ProjectFixture::new("t_project");
    fixture.set_config(
        r#"
name = "t_project"
project_folder = "t_project"

[connection]
type = "duckdb"

[variables]
name = "x"
env = "prod"
"#,
    );
    fixture.write(
        "models/a/filtered.sql",
        "SELECT * FROM a.base WHERE n = @name:anonymous AND env = {{ env }}",
    );
    fixture.write("models/a/base.sql", "SELECT 1 AS n");

    let mut compiler = fixture.compiler();
    let result = compiler.compile(OutputFormat::Json).unwrap();

    let module = OtsModuleReader::new()
        .read_module(&result.exported_paths["t_project.a"])
        .unwrap();
    let filtered = module
        .transformations
        .iter()
        .find(|t| t.transformation_id == "a.filtered")
        .unwrap();
    assert!(filtered.code.sql.original_sql.contains("n = 'x'"));
    assert!(filtered.code.sql.original_sql.contains("env = 'prod'"));
}

#[test]
fn test_missing_required_variable_skips_the_file() {
    let fixture = ProjectFixture::new("t_project");
    fixture.write("models/a/good.sql", "SELECT 1 AS id");
    fixture.write(
        "models/a/needs_var.sql",
        "SELECT * FROM a.good WHERE env = @environment",
    );

    let mut compiler = fixture.compiler();
    let result = compiler.compile(OutputFormat::Json).unwrap();
    // the file with the unresolved placeholder is skipped, not fatal
    assert_eq!(result.parsed_model_count, 1);
    assert_eq!(result.execution_order, vec!["a.good"]);
}

#[test]
fn test_nested_variable_paths() {
    let fixture = ProjectFixture::new("t_project");
    fixture.set_config(
        r#"
name = "t_project"
project_folder = "t_project"

[connection]
type = "duckdb"

[variables.config]
start_date = "2024-01-01"
"#,
    );
    fixture.write(
        "models/a/windowed.sql",
        "SELECT * FROM a.base WHERE ts >= @config.start_date",
    );
    fixture.write("models/a/base.sql", "SELECT 1 AS ts");

    let mut compiler = fixture.compiler();
    let result = compiler.compile(OutputFormat::Json).unwrap();

    let module = OtsModuleReader::new()
        .read_module(&result.exported_paths["t_project.a"])
        .unwrap();
    let windowed = module
        .transformations
        .iter()
        .find(|t| t.transformation_id == "a.windowed")
        .unwrap();
    assert!(windowed
        .code
        .sql
        .original_sql
        .contains("ts >= '2024-01-01'"));
}
