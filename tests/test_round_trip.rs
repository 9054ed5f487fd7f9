mod common;

use common::ProjectFixture;
use otsc::{OtsConverter, OtsModuleReader, OutputFormat};
use serde_json::json;

#[test]
fn test_transformation_round_trip() {
    let fixture = ProjectFixture::new("t_project");
    fixture.write("models/a/orders.sql", "SELECT * FROM raw_orders WHERE ts >= '2024-01-01'");
    fixture.write(
        "models/a/orders.py",
        r#"
metadata = {
    "description": "Order facts",
    "materialization": "incremental",
    "incremental": {
        "strategy": "append",
        "append": {"time_column": "ts", "start_date": "2024-01-01"},
    },
    "tags": ["orders", "facts"],
    "object_tags": {"sensitivity": "internal"},
}
"#,
    );

    let mut compiler = fixture.compiler();
    let result = compiler.compile(OutputFormat::Json).unwrap();

    // importing the emitted module yields an equal entity
    let module_path = &result.exported_paths["t_project.a"];
    let module = OtsModuleReader::new().read_module(module_path).unwrap();
    let (transformations, _) = OtsConverter::new()
        .convert_module(&module, module_path)
        .unwrap();
    let orders = &transformations["a.orders"];

    let mut original = compiler.parse_models().unwrap()["a.orders"].clone();
    // references are qualified on the merged map during compilation
    original.code.source_tables = vec!["raw_orders".to_string()];

    assert_eq!(orders.id, original.id);
    assert_eq!(
        orders.materialization.type_name(),
        original.materialization.type_name()
    );
    assert_eq!(orders.code.resolved_sql, original.code.resolved_sql);
    assert_eq!(orders.code.source_tables, original.code.source_tables);
    assert_eq!(orders.tags, original.tags);

    // the emitted strategy details follow the fixed field mapping
    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(module_path).unwrap()).unwrap();
    assert_eq!(
        raw["transformations"][0]["materialization"]["incremental_details"]["filter_condition"],
        json!("ts >= 2024-01-01")
    );
    assert_eq!(
        raw["transformations"][0]["materialization"]["incremental_details"]["strategy"],
        json!("append")
    );
}

#[test]
fn test_function_round_trip() {
    let fixture = ProjectFixture::new("t_project");
    fixture.write("functions/util/normalize.sql", "SELECT LOWER(value)");
    fixture.write(
        "functions/util/normalize.py",
        r#"
metadata = {
    "function_name": "normalize",
    "function_type": "scalar",
    "language": "sql",
    "return_type": "VARCHAR",
    "parameters": [
        {"name": "value", "type": "VARCHAR", "mode": "IN"},
    ],
    "deterministic": True,
    "description": "Lower-case a value",
}
"#,
    );
    fixture.write("models/a/users.sql", "SELECT normalize(name) AS name FROM raw_users");

    let mut compiler = fixture.compiler();
    let result = compiler.compile(OutputFormat::Json).unwrap();

    // the function orders before the model that calls it
    let order = &result.execution_order;
    let function = order.iter().position(|n| n == "util.normalize").unwrap();
    let model = order.iter().position(|n| n == "a.users").unwrap();
    assert!(function < model);

    let module_path = &result.exported_paths["t_project.util"];
    let module = OtsModuleReader::new().read_module(module_path).unwrap();
    assert_eq!(module.functions.len(), 1);

    let (_, functions) = OtsConverter::new()
        .convert_module(&module, module_path)
        .unwrap();
    let normalize = &functions["util.normalize"];
    let original = &compiler.parse_functions().unwrap()["util.normalize"];

    assert_eq!(normalize.id, original.id);
    assert_eq!(normalize.kind, original.kind);
    assert_eq!(normalize.language, original.language);
    assert_eq!(normalize.parameters.len(), original.parameters.len());
    assert_eq!(normalize.return_type, original.return_type);
    assert!(normalize.deterministic);

    // the model records its function dependency under source_functions
    let models_module = OtsModuleReader::new()
        .read_module(&result.exported_paths["t_project.a"])
        .unwrap();
    let users = &models_module.transformations[0];
    assert!(users
        .code
        .sql
        .source_functions
        .contains(&"util.normalize".to_string()));
}

#[test]
fn test_revalidation_reads_every_emitted_module() {
    let fixture = ProjectFixture::new("t_project");
    fixture.write("models/a/x.sql", "SELECT 1 AS id");
    fixture.write("models/b/y.sql", "SELECT * FROM a.x");
    fixture.write("models/c/z.sql", "SELECT * FROM b.y");

    let mut compiler = fixture.compiler();
    let result = compiler.compile(OutputFormat::Json).unwrap();

    // compile already revalidated; read each module once more to be sure
    let reader = OtsModuleReader::new();
    for path in result.exported_paths.values() {
        reader.read_module(path).unwrap();
    }
    assert_eq!(result.module_count, 3);
}
