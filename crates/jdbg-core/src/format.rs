use jdbg_jdwp::{InvokeOutcome, ObjectRef, TargetConnection, ThreadId, Value};

use crate::error::DebugResult;

/// Display string for a value, as shown in variable listings and
/// evaluation results: `null`, `"text"`, `'c'`, `int[3]`,
/// `com.example.Foo@1f`, or the primitive in Java notation.
pub async fn display_value(conn: &dyn TargetConnection, value: &Value) -> DebugResult<String> {
    Ok(match value {
        Value::Object(obj) if obj.is_string() => {
            let text = conn.string_value(obj).await?;
            format!("\"{}\"", escape_java_string(&text))
        }
        Value::Object(obj) if obj.is_array() => {
            let len = conn.array_length(obj).await?;
            let element = obj.runtime_type.strip_suffix("[]").unwrap_or(&obj.runtime_type);
            format!("{element}[{len}]")
        }
        Value::Object(obj) => identity_string(obj),
        Value::Char(c) => format!("'{}'", char_from_u16(*c)),
        primitive => primitive_to_string(primitive),
    })
}

/// Java `String.valueOf` semantics, used for string concatenation.
///
/// Objects are stringified with a remote `toString()`; if that fails or
/// throws the identity form `Type@hexid` is used instead.
pub async fn value_to_string(
    conn: &dyn TargetConnection,
    thread: ThreadId,
    value: &Value,
) -> DebugResult<String> {
    match value {
        Value::Object(obj) if obj.is_string() => Ok(conn.string_value(obj).await?),
        Value::Object(obj) => Ok(remote_to_string(conn, thread, obj)
            .await
            .unwrap_or_else(|| identity_string(obj))),
        Value::Char(c) => Ok(char_from_u16(*c).to_string()),
        primitive => Ok(primitive_to_string(primitive)),
    }
}

async fn remote_to_string(
    conn: &dyn TargetConnection,
    thread: ThreadId,
    obj: &ObjectRef,
) -> Option<String> {
    let methods = conn.methods(obj.type_id).await.ok()?;
    let method = methods.into_iter().find(|m| {
        m.name == "toString" && m.signature == "()Ljava/lang/String;" && !m.is_static()
    })?;
    match conn.invoke_instance(thread, obj, &method, &[]).await {
        Ok(InvokeOutcome::Returned(Value::Object(text))) if text.is_string() => {
            conn.string_value(&text).await.ok()
        }
        Ok(InvokeOutcome::Returned(Value::Null)) => Some("null".to_string()),
        Ok(_) => None,
        Err(err) => {
            tracing::debug!(target: "jdbg.eval", object = obj.id, error = %err, "toString() failed");
            None
        }
    }
}

/// Best-effort `detailMessage` of a throwable, without running target code.
pub async fn exception_message(conn: &dyn TargetConnection, exception: &ObjectRef) -> Option<String> {
    let fields = conn.fields(exception.type_id).await.ok()?;
    let field = fields.into_iter().find(|f| f.name == "detailMessage")?;
    match conn.get_field(exception, &field).await.ok()? {
        Value::Object(text) if text.is_string() => conn.string_value(&text).await.ok(),
        _ => None,
    }
}

pub fn identity_string(obj: &ObjectRef) -> String {
    format!("{}@{:x}", obj.runtime_type, obj.id)
}

pub fn primitive_to_string(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Void => "void".to_string(),
        Value::Boolean(v) => v.to_string(),
        Value::Byte(v) => v.to_string(),
        Value::Char(c) => char_from_u16(*c).to_string(),
        Value::Short(v) => v.to_string(),
        Value::Int(v) => v.to_string(),
        Value::Long(v) => v.to_string(),
        Value::Float(v) => java_float(f64::from(*v)),
        Value::Double(v) => java_float(*v),
        Value::Object(obj) => identity_string(obj),
    }
}

/// `1.0`, `-0.5`, `NaN`, `Infinity`: floating point values keep a
/// fractional part the way Java prints them.
fn java_float(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if value.fract() == 0.0 && value.abs() < 1e7 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

fn char_from_u16(c: u16) -> char {
    char::from_u32(u32::from(c)).unwrap_or('\u{FFFD}')
}

fn escape_java_string(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use jdbg_jdwp::MockTarget;

    use super::*;

    #[test]
    fn primitives_use_java_notation() {
        assert_eq!(primitive_to_string(&Value::Double(1.0)), "1.0");
        assert_eq!(primitive_to_string(&Value::Float(2.5)), "2.5");
        assert_eq!(primitive_to_string(&Value::Double(f64::INFINITY)), "Infinity");
        assert_eq!(primitive_to_string(&Value::Long(42)), "42");
        assert_eq!(primitive_to_string(&Value::Char(u16::from(b'x'))), "x");
    }

    #[tokio::test]
    async fn display_quotes_strings_and_sizes_arrays() {
        let mock = MockTarget::new();
        let text = mock.new_string("a \"b\"\n");
        let array = mock.new_array("int", vec![Value::Int(1), Value::Int(2), Value::Int(3)]);

        assert_eq!(
            display_value(&mock, &Value::Object(text)).await.unwrap(),
            r#""a \"b\"\n""#
        );
        assert_eq!(display_value(&mock, &Value::Object(array)).await.unwrap(), "int[3]");
        assert_eq!(display_value(&mock, &Value::Char(u16::from(b'q'))).await.unwrap(), "'q'");
        assert_eq!(display_value(&mock, &Value::Null).await.unwrap(), "null");
    }

    #[tokio::test]
    async fn exception_message_reads_detail_message() {
        let mock = MockTarget::new();
        let class = mock.class_id("java.lang.ArithmeticException").unwrap();
        let with = mock.new_exception(class, Some("/ by zero"));
        let without = mock.new_exception(class, None);

        assert_eq!(exception_message(&mock, &with).await.as_deref(), Some("/ by zero"));
        assert_eq!(exception_message(&mock, &without).await, None);
    }
}
