use jdbg_core::{DebugError, VariableKind};
use jdbg_jdwp::Value;

use crate::harness::app;

#[tokio::test]
async fn variables_list_this_arguments_and_locals() {
    let app = app();
    let session = app.stopped_at_line_11().await;

    let variables = session.variables(None, None).await.unwrap();
    let names: Vec<&str> = variables.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(names, ["this", "factor", "count", "total", "label"]);

    assert_eq!(variables[0].kind, VariableKind::This);
    assert_eq!(variables[0].type_name, "com.example.App");
    assert_eq!(variables[1].kind, VariableKind::Argument);
    assert_eq!(variables[2].kind, VariableKind::Local);
    assert_eq!(variables[2].type_name, "int");
    assert_eq!(variables[2].value, "5");
    assert_eq!(variables[3].type_name, "long");
    assert_eq!(variables[4].value, "\"ready\"");

    let outer = session.variables(None, Some(1)).await.unwrap();
    let names: Vec<&str> = outer.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(names, ["args", "app"]);

    let label = session.variable("label").await.unwrap();
    assert_eq!(label.type_name, "java.lang.String");
    assert!(matches!(
        session.variable("nope").await,
        Err(DebugError::VariableNotFound(name)) if name == "nope"
    ));
}

#[tokio::test]
async fn variable_lookup_addresses_a_thread_and_frame() {
    let app = app();
    let session = app.stopped_at_line_11().await;

    let app_var = session
        .variable_in(Some(app.main_thread), Some(1), "app")
        .await
        .unwrap();
    assert_eq!(app_var.type_name, "com.example.App");
    assert_eq!(app_var.kind, VariableKind::Local);

    let this = session
        .variable_in(Some(app.main_thread), Some(0), "this")
        .await
        .unwrap();
    assert_eq!(this.kind, VariableKind::This);

    // The selection is untouched by addressed lookups.
    assert_eq!(session.selected_frame(), 0);
    assert!(matches!(
        session.variable_in(Some(app.main_thread), Some(1), "count").await,
        Err(DebugError::VariableNotFound(name)) if name == "count"
    ));
    assert!(matches!(
        session.variable_in(Some(app.main_thread), Some(9), "count").await,
        Err(DebugError::InvalidFrameIndex { index: 9, .. })
    ));
}

#[tokio::test]
async fn evaluates_in_the_selected_frame() {
    let app = app();
    let session = app.stopped_at_line_11().await;

    let sum = session.evaluate("count * factor + 1").await.unwrap();
    assert_eq!(sum.value, Value::Int(16));
    assert_eq!(sum.type_name, "int");

    let widened = session.evaluate("total + count").await.unwrap();
    assert_eq!(widened.value, Value::Long(105));

    let text = session.evaluate("label + \"!\"").await.unwrap();
    assert_eq!(text.display, "\"ready!\"");

    let joined = session.evaluate("label + count").await.unwrap();
    assert_eq!(joined.display, "\"ready5\"");
    assert_eq!(joined.type_name, "java.lang.String");
    let joined = session.evaluate("count + label").await.unwrap();
    assert_eq!(joined.display, "\"5ready\"");
    let joined = session.evaluate("label + factor * count").await.unwrap();
    assert_eq!(joined.display, "\"ready15\"");

    let field = session.evaluate("this.name").await.unwrap();
    assert_eq!(field.display, "\"demo\"");

    session.select_frame(1).await.unwrap();
    let outer = session.evaluate("app.name.length()").await.unwrap();
    assert_eq!(outer.value, Value::Int(4));
    assert!(matches!(
        session.evaluate("count").await,
        Err(DebugError::VariableNotFound(_))
    ));

    let inner = session
        .evaluate_in(Some(app.main_thread), Some(0), "count")
        .await
        .unwrap();
    assert_eq!(inner.value, Value::Int(5));
}

#[tokio::test]
async fn evaluation_errors_are_classified() {
    let app = app();
    let session = app.attach().await;

    assert!(matches!(
        session.evaluate("count").await,
        Err(DebugError::NoThreadSelected)
    ));
    assert!(matches!(session.evaluate("1 +").await, Err(DebugError::Parse(_))));

    // The main thread is running until something stops it.
    assert!(matches!(
        session
            .evaluate_in(Some(app.main_thread), None, "count")
            .await,
        Err(DebugError::ThreadNotSuspended(_))
    ));

    session.suspend().await.unwrap();
    assert!(matches!(
        session.evaluate_in(Some(app.main_thread), Some(7), "count").await,
        Err(DebugError::InvalidFrameIndex { index: 7, count: 2 })
    ));
    assert!(matches!(
        session.evaluate_in(Some(app.main_thread), None, "count / 0").await,
        Err(DebugError::EvaluationFailed(_))
    ));
}

#[tokio::test]
async fn set_variable_converts_and_writes_back() {
    let app = app();
    let session = app.stopped_at_line_11().await;

    let updated = session.set_variable("count", "count + 10").await.unwrap();
    assert_eq!(updated.value, "15");
    assert_eq!(app.mock.local_value(app.main_thread, "count"), Some(Value::Int(15)));

    session.set_variable("total", "factor").await.unwrap();
    assert_eq!(app.mock.local_value(app.main_thread, "total"), Some(Value::Long(3)));

    session.set_variable("label", "null").await.unwrap();
    assert_eq!(app.mock.local_value(app.main_thread, "label"), Some(Value::Null));

    assert!(matches!(
        session.set_variable("count", "\"text\"").await,
        Err(DebugError::EvaluationFailed(_))
    ));
    assert!(matches!(
        session.set_variable("missing", "1").await,
        Err(DebugError::VariableNotFound(name)) if name == "missing"
    ));
    assert_eq!(app.mock.local_value(app.main_thread, "count"), Some(Value::Int(15)));
}

#[tokio::test]
async fn static_members_resolve_through_class_names() {
    let app = app();
    let limit = app.mock.add_field(app.class, "LIMIT", "I", true);
    app.mock.set_static_value(app.class, &limit, Value::Int(64));
    let session = app.stopped_at_line_11().await;

    let value = session.evaluate("com.example.App.LIMIT * 2").await.unwrap();
    assert_eq!(value.value, Value::Int(128));
    assert!(matches!(
        session.evaluate("com.example.Missing.LIMIT").await,
        Err(DebugError::ClassNotLoaded(_))
    ));
}
