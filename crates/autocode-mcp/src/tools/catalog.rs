//! Store, dependency and lint tools. All synchronous.

use autocode_store::{detect_recursion, find_cycles, LintIssue, LintSeverity, NewFunction};
use serde_json::{json, Value};

use super::{
    failure, optional_bool, optional_str, optional_string_list, required_str, store_failure,
    success_with, AutocodeServices,
};
use crate::registry::{object_schema, Tool};

fn nullable_string() -> Value {
    json!({"type": ["string", "null"]})
}

pub(super) fn tools(services: &AutocodeServices) -> Vec<Tool> {
    vec![
        list_functions(services),
        get_function(services),
        add_function(services),
        modify_function(services),
        delete_function(services),
        add_test(services),
        test_results(services),
        coverage_report(services),
        search_functions(services),
        function_history(services),
        list_modules(services),
        list_tags(services),
        list_dependencies(services),
        add_dependency(services),
        remove_dependency(services),
        find_cycles_tool(services),
        detect_recursion_tool(services),
        lint_code(services),
    ]
}

fn list_functions(services: &AutocodeServices) -> Tool {
    let store = services.store.clone();
    Tool::new(
        "list_functions",
        "List functions (optionally filtered by module or tag).",
        object_schema(
            json!({"module": nullable_string(), "tag": nullable_string()}),
            &[],
        ),
        move |arguments| {
            let module = optional_str(arguments, "module")?;
            let tag = optional_str(arguments, "tag")?;
            let functions = store.list_functions(module, tag);
            let count = functions.len();
            Ok(success_with(json!(functions), json!({ "count": count })))
        },
    )
}

fn get_function(services: &AutocodeServices) -> Tool {
    let store = services.store.clone();
    Tool::new(
        "get_function",
        "Get full details of a function by ID.",
        object_schema(json!({"id": {"type": "string"}}), &["id"]),
        move |arguments| {
            let id = required_str(arguments, "id")?;
            Ok(match store.get_function(id) {
                Ok(record) => success_with(json!(record), json!({ "function_id": id })),
                Err(error) => store_failure(&error),
            })
        },
    )
}

fn add_function(services: &AutocodeServices) -> Tool {
    let store = services.store.clone();
    let linter = services.linter.clone();
    Tool::new(
        "add_function",
        "Add a function with provided name, description, and code. The code is linted first.",
        object_schema(
            json!({
                "name": {"type": "string"},
                "description": {"type": "string"},
                "code": {"type": "string"},
                "modules": {"type": ["array", "null"], "items": {"type": "string"}},
                "tags": {"type": ["array", "null"], "items": {"type": "string"}},
            }),
            &["name", "description", "code"],
        ),
        move |arguments| {
            let name = required_str(arguments, "name")?;
            let description = required_str(arguments, "description")?;
            let code = required_str(arguments, "code")?;
            let modules = optional_string_list(arguments, "modules")?;
            let tags = optional_string_list(arguments, "tags")?;

            let report = linter.lint(code, false);
            if !report.success {
                return Ok(lint_rejection(
                    "Function code contains compatibility errors",
                    &report.issues,
                ));
            }
            let record = match store.add_function(NewFunction {
                name: name.to_string(),
                description: description.to_string(),
                code: code.to_string(),
                modules,
                tags,
            }) {
                Ok(record) => record,
                Err(error) => return Ok(store_failure(&error)),
            };
            let mut result = json!({ "function_id": record.id, "name": record.name });
            let warnings = issues_with_severity(&report.issues, LintSeverity::Warning);
            if !warnings.is_empty() {
                result["lint_warnings"] = json!(warnings);
            }
            Ok(success_with(result, json!({ "function_id": record.id })))
        },
    )
}

fn modify_function(services: &AutocodeServices) -> Tool {
    let store = services.store.clone();
    Tool::new(
        "modify_function",
        "Modify the code for an existing function (overwrites code) and record who changed it.",
        object_schema(
            json!({
                "id": {"type": "string"},
                "modifier": {"type": "string"},
                "description": {"type": "string"},
                "code": {"type": "string"},
            }),
            &["id", "modifier", "description", "code"],
        ),
        move |arguments| {
            let id = required_str(arguments, "id")?;
            let modifier = required_str(arguments, "modifier")?;
            let description = required_str(arguments, "description")?;
            let code = required_str(arguments, "code")?;
            Ok(
                match store.modify_function(id, modifier, description, code) {
                    Ok(modification) => success_with(
                        json!({ "status": "modified", "modification_id": modification.id }),
                        json!({ "function_id": id }),
                    ),
                    Err(error) => store_failure(&error),
                },
            )
        },
    )
}

fn delete_function(services: &AutocodeServices) -> Tool {
    let store = services.store.clone();
    Tool::new(
        "delete_function",
        "Delete a function by ID together with its tests, results, history and inbound dependencies.",
        object_schema(json!({"function_id": {"type": "string"}}), &["function_id"]),
        move |arguments| {
            let function_id = required_str(arguments, "function_id")?;
            Ok(match store.delete_function(function_id) {
                Ok(()) => success_with(
                    json!({ "deleted": true }),
                    json!({ "function_id": function_id }),
                ),
                Err(error) => store_failure(&error),
            })
        },
    )
}

fn add_test(services: &AutocodeServices) -> Tool {
    let store = services.store.clone();
    Tool::new(
        "add_test",
        "Attach a unit test to a function.",
        object_schema(
            json!({
                "function_id": {"type": "string"},
                "name": {"type": "string"},
                "description": {"type": "string"},
                "test_code": {"type": "string"},
            }),
            &["function_id", "name", "description", "test_code"],
        ),
        move |arguments| {
            let function_id = required_str(arguments, "function_id")?;
            let name = required_str(arguments, "name")?;
            let description = required_str(arguments, "description")?;
            let test_code = required_str(arguments, "test_code")?;
            Ok(
                match store.add_test(function_id, name, description, test_code) {
                    Ok(test) => success_with(
                        json!({ "test_id": test.id }),
                        json!({ "function_id": function_id, "test_id": test.id }),
                    ),
                    Err(error) => store_failure(&error),
                },
            )
        },
    )
}

fn test_results(services: &AutocodeServices) -> Tool {
    let store = services.store.clone();
    Tool::new(
        "test_results",
        "Stored results of the most recent test runs.",
        object_schema(json!({"function_id": nullable_string()}), &[]),
        move |arguments| {
            let function_id = optional_str(arguments, "function_id")?;
            let results = store.test_results(function_id);
            let count = results.len();
            Ok(success_with(json!(results), json!({ "result_count": count })))
        },
    )
}

fn coverage_report(services: &AutocodeServices) -> Tool {
    let store = services.store.clone();
    Tool::new(
        "coverage_report",
        "Get coverage (tests passed/failed) for all functions.",
        object_schema(json!({}), &[]),
        move |_arguments| {
            let functions = store.coverage_report();
            let count = functions.len();
            Ok(success_with(
                json!({ "functions": functions }),
                json!({ "function_count": count }),
            ))
        },
    )
}

fn search_functions(services: &AutocodeServices) -> Tool {
    let store = services.store.clone();
    Tool::new(
        "search_functions",
        "Keyword search across name, description, code.",
        object_schema(json!({"query": {"type": "string"}}), &["query"]),
        move |arguments| {
            let query = required_str(arguments, "query")?;
            let results = store.search_functions(query);
            let count = results.len();
            Ok(success_with(
                json!(results),
                json!({ "query": query, "result_count": count }),
            ))
        },
    )
}

fn function_history(services: &AutocodeServices) -> Tool {
    let store = services.store.clone();
    Tool::new(
        "function_history",
        "Modification history for a function.",
        object_schema(json!({"function_id": {"type": "string"}}), &["function_id"]),
        move |arguments| {
            let function_id = required_str(arguments, "function_id")?;
            if let Err(error) = store.get_function(function_id) {
                return Ok(store_failure(&error));
            }
            let modifications = store.list_modifications(function_id);
            let count = modifications.len();
            Ok(success_with(
                json!({ "modifications": modifications }),
                json!({ "function_id": function_id, "modification_count": count }),
            ))
        },
    )
}

fn list_modules(services: &AutocodeServices) -> Tool {
    let store = services.store.clone();
    Tool::new(
        "list_modules",
        "Module names in use.",
        object_schema(json!({}), &[]),
        move |_arguments| {
            let modules = store.list_modules();
            let count = modules.len();
            Ok(success_with(json!(modules), json!({ "count": count })))
        },
    )
}

fn list_tags(services: &AutocodeServices) -> Tool {
    let store = services.store.clone();
    Tool::new(
        "list_tags",
        "Tags in use.",
        object_schema(json!({}), &[]),
        move |_arguments| {
            let tags = store.list_tags();
            let count = tags.len();
            Ok(success_with(json!(tags), json!({ "count": count })))
        },
    )
}

fn list_dependencies(services: &AutocodeServices) -> Tool {
    let store = services.store.clone();
    Tool::new(
        "list_dependencies",
        "List dependencies for a function.",
        object_schema(json!({"function_id": {"type": "string"}}), &["function_id"]),
        move |arguments| {
            let function_id = required_str(arguments, "function_id")?;
            Ok(match store.list_dependencies(function_id) {
                Ok(dependencies) => {
                    let count = dependencies.len();
                    success_with(
                        json!({ "dependencies": dependencies }),
                        json!({ "function_id": function_id, "dependency_count": count }),
                    )
                }
                Err(error) => store_failure(&error),
            })
        },
    )
}

fn dependency_schema() -> Value {
    object_schema(
        json!({
            "function_id": {"type": "string"},
            "depends_on_id": {"type": "string"},
        }),
        &["function_id", "depends_on_id"],
    )
}

fn add_dependency(services: &AutocodeServices) -> Tool {
    let store = services.store.clone();
    Tool::new(
        "add_dependency",
        "Record that one function depends on another. Cycles are rejected.",
        dependency_schema(),
        move |arguments| {
            let function_id = required_str(arguments, "function_id")?;
            let depends_on_id = required_str(arguments, "depends_on_id")?;
            Ok(match store.add_dependency(function_id, depends_on_id) {
                Ok(()) => success_with(
                    json!({ "added": true }),
                    json!({ "function_id": function_id, "depends_on_id": depends_on_id }),
                ),
                Err(error) => store_failure(&error),
            })
        },
    )
}

fn remove_dependency(services: &AutocodeServices) -> Tool {
    let store = services.store.clone();
    Tool::new(
        "remove_dependency",
        "Remove a dependency between two functions.",
        dependency_schema(),
        move |arguments| {
            let function_id = required_str(arguments, "function_id")?;
            let depends_on_id = required_str(arguments, "depends_on_id")?;
            Ok(match store.remove_dependency(function_id, depends_on_id) {
                Ok(()) => success_with(
                    json!({ "removed": true }),
                    json!({ "function_id": function_id, "depends_on_id": depends_on_id }),
                ),
                Err(error) => store_failure(&error),
            })
        },
    )
}

fn find_cycles_tool(services: &AutocodeServices) -> Tool {
    let store = services.store.clone();
    Tool::new(
        "find_cycles",
        "Detect and return dependency cycles in the DB.",
        object_schema(json!({}), &[]),
        move |_arguments| {
            let cycles = find_cycles(&store.dependency_graph());
            let count = cycles.len();
            Ok(success_with(
                json!({ "cycles": cycles }),
                json!({ "cycle_count": count }),
            ))
        },
    )
}

fn detect_recursion_tool(services: &AutocodeServices) -> Tool {
    let store = services.store.clone();
    Tool::new(
        "detect_recursion",
        "Detect direct or mutual recursion for a function.",
        object_schema(json!({"function_id": {"type": "string"}}), &["function_id"]),
        move |arguments| {
            let function_id = required_str(arguments, "function_id")?;
            let record = match store.get_function(function_id) {
                Ok(record) => record,
                Err(error) => return Ok(store_failure(&error)),
            };
            let report = detect_recursion(
                &store.dependency_graph(),
                function_id,
                &record.name,
                &record.code,
            );
            let has_recursion = report.direct || !report.mutual_cycles.is_empty();
            Ok(success_with(
                json!({
                    "direct_recursion": report.direct,
                    "mutual_recursion": report.mutual_cycles,
                    "has_recursion": has_recursion,
                }),
                json!({ "function_id": function_id }),
            ))
        },
    )
}

fn lint_code(services: &AutocodeServices) -> Tool {
    let linter = services.linter.clone();
    Tool::new(
        "lint_code",
        "Check code for compatibility issues, optionally returning fixed code.",
        object_schema(
            json!({
                "code": {"type": "string"},
                "fix": {"type": "boolean", "default": false},
            }),
            &["code"],
        ),
        move |arguments| {
            let code = required_str(arguments, "code")?;
            let fix = optional_bool(arguments, "fix")?.unwrap_or(false);
            let report = linter.lint(code, fix);
            let count = report.issues.len();
            Ok(success_with(json!(report), json!({ "issue_count": count })))
        },
    )
}

pub(super) fn issues_with_severity(issues: &[LintIssue], severity: LintSeverity) -> Vec<Value> {
    issues
        .iter()
        .filter(|issue| issue.severity == severity)
        .map(|issue| json!({ "type": issue.kind, "message": issue.message, "line": issue.line }))
        .collect()
}

pub(super) fn lint_rejection(context: &str, issues: &[LintIssue]) -> Value {
    let errors = issues
        .iter()
        .filter(|issue| issue.severity == LintSeverity::Error)
        .map(|issue| issue.message.as_str())
        .collect::<Vec<_>>();
    failure(
        "LintingFailed",
        format!("{context}: {}", errors.join(", ")),
        Some("Fix the reported compatibility issues or relax the linter policy."),
        Some(json!({ "lint_issues": issues })),
    )
}
