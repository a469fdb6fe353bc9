//! Java expression evaluation against a suspended frame.
//!
//! [`parse`] turns source text into an [`Expr`] tree; [`Interpreter`] walks
//! the tree issuing remote reads and invocations on the target.

mod ast;
mod interpreter;
mod parser;

use std::sync::Arc;

use jdbg_jdwp::{FrameInfo, TargetConnection, ThreadId};

pub use ast::{BinaryOp, Expr, Literal, UnaryOp};
pub use interpreter::{Evaluation, Interpreter};
pub use parser::{parse, ParseError};

use crate::error::DebugResult;

/// Parse and evaluate `source` in `frame` of `thread`.
pub async fn evaluate(
    conn: Arc<dyn TargetConnection>,
    thread: ThreadId,
    frame: FrameInfo,
    source: &str,
) -> DebugResult<Evaluation> {
    let expr = parse(source)?;
    let interpreter = Interpreter::new(conn, thread, frame).await?;
    interpreter.evaluate(&expr).await
}

#[cfg(test)]
mod tests {
    use jdbg_jdwp::{InvokeOutcome, MockFrame, MockInvocation, MockState, MockTarget, Value};

    use super::*;
    use crate::error::DebugError;

    struct Fixture {
        mock: Arc<MockTarget>,
        thread: ThreadId,
        frame: FrameInfo,
    }

    impl Fixture {
        async fn eval(&self, source: &str) -> DebugResult<Evaluation> {
            evaluate(self.mock.clone(), self.thread, self.frame, source).await
        }
    }

    /// A `com.example.Person` instance stopped in `greet()`, with locals
    /// `count = 5`, `name = "Ada"` and `numbers = {1, 2, 3}`.
    async fn fixture() -> Fixture {
        let mock = Arc::new(MockTarget::new());
        let object = mock.class_id("java.lang.Object").unwrap();
        let person = mock.define_class("com.example.Person", Some(object));
        mock.add_field(person, "age", "I", false);
        let limit = mock.add_field(person, "LIMIT", "I", true);
        mock.set_static_value(person, &limit, Value::Int(120));
        mock.add_method(
            person,
            "twice",
            "(I)I",
            false,
            Some(Arc::new(|_: &mut MockState, call: &MockInvocation| {
                let n = match call.args.first() {
                    Some(Value::Int(n)) => *n,
                    _ => 0,
                };
                InvokeOutcome::Returned(Value::Int(n * 2))
            })),
        );
        let arithmetic = mock.class_id("java.lang.ArithmeticException").unwrap();
        mock.add_method(
            person,
            "explode",
            "()V",
            false,
            Some(Arc::new(move |state: &mut MockState, _: &MockInvocation| {
                let exception = state.new_object(arithmetic);
                let text = state.new_string("boom");
                state.set_field_value(&exception, "detailMessage", Value::Object(text));
                InvokeOutcome::Threw(exception)
            })),
        );
        let greet = mock.add_method(person, "greet", "()V", false, None);
        let location = mock.add_line(&greet, 10);

        let this = mock.new_object(person);
        mock.set_field_value(&this, "age", Value::Int(36));
        let name = mock.new_string("Ada");
        let numbers = mock.new_array("int", vec![Value::Int(1), Value::Int(2), Value::Int(3)]);

        let thread = mock.add_thread("main");
        mock.add_frame(
            thread,
            MockFrame::new(location)
                .with_this(this)
                .with_local("count", "I", Value::Int(5))
                .with_local("name", "Ljava/lang/String;", Value::Object(name))
                .with_local("numbers", "[I", Value::Object(numbers)),
        );
        mock.set_suspended(thread, true);
        let frame = mock.frames(thread).await.unwrap()[0];
        Fixture { mock, thread, frame }
    }

    #[tokio::test]
    async fn evaluates_arithmetic_and_locals() {
        let fx = fixture().await;
        assert_eq!(fx.eval("1 + 2").await.unwrap().value, Value::Int(3));
        assert_eq!(fx.eval("count * 2 - 1").await.unwrap().value, Value::Int(9));
        assert_eq!(fx.eval("age + count").await.unwrap().value, Value::Int(41));
        assert_eq!(fx.eval("numbers[1]").await.unwrap().value, Value::Int(2));
        assert_eq!(fx.eval("numbers.length").await.unwrap().value, Value::Int(3));
        assert_eq!(
            fx.eval("com.example.Person.LIMIT").await.unwrap().value,
            Value::Int(120)
        );
    }

    #[tokio::test]
    async fn concatenation_builds_remote_strings() {
        let fx = fixture().await;
        let result = fx.eval("name + \" is \" + age").await.unwrap();
        assert_eq!(result.display, "\"Ada is 36\"");
        assert_eq!(result.type_name, "java.lang.String");
    }

    #[tokio::test]
    async fn invokes_methods_and_boxes_arguments() {
        let fx = fixture().await;
        assert_eq!(fx.eval("twice(count)").await.unwrap().value, Value::Int(10));
        assert_eq!(fx.eval("this.twice(4)").await.unwrap().value, Value::Int(8));
        assert_eq!(fx.eval("name.length()").await.unwrap().value, Value::Int(3));

        let boxed = fx.eval("Integer.valueOf(7)").await.unwrap();
        assert_eq!(boxed.type_name, "java.lang.Integer");
        assert_eq!(fx.eval("(int) Integer.valueOf(7)").await.unwrap().value, Value::Int(7));
    }

    #[tokio::test]
    async fn remote_exceptions_surface_class_and_message() {
        let fx = fixture().await;
        let err = fx.eval("explode()").await.unwrap_err();
        match err {
            DebugError::RemoteInvocationThrew { class_name, message } => {
                assert_eq!(class_name, "java.lang.ArithmeticException");
                assert_eq!(message.as_deref(), Some("boom"));
            }
            other => panic!("expected a remote exception, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reports_resolution_failures() {
        let fx = fixture().await;
        assert!(matches!(
            fx.eval("missing").await,
            Err(DebugError::VariableNotFound(name)) if name == "missing"
        ));
        assert!(matches!(
            fx.eval("this.unknownField").await,
            Err(DebugError::VariableNotFound(name)) if name == "unknownField"
        ));
        assert!(matches!(
            fx.eval("com.foo.Unloaded.X").await,
            Err(DebugError::ClassNotLoaded(name)) if name == "com.foo.Unloaded"
        ));
        assert!(matches!(fx.eval("1 +").await, Err(DebugError::Parse(_))));
    }

    #[tokio::test]
    async fn rejects_invalid_operations() {
        let fx = fixture().await;
        for source in [
            "1.0 / 0",
            "count / 0",
            "numbers[3]",
            "!count",
            "count && true",
            "java.lang.Integer",
            "new int[-1]",
        ] {
            assert!(
                matches!(fx.eval(source).await, Err(DebugError::EvaluationFailed(_))),
                "`{source}` should fail to evaluate"
            );
        }
    }

    #[tokio::test]
    async fn equality_and_instanceof() {
        let fx = fixture().await;
        assert_eq!(fx.eval("this == this").await.unwrap().value, Value::Boolean(true));
        assert_eq!(fx.eval("name == null").await.unwrap().value, Value::Boolean(false));
        assert_eq!(fx.eval("count == 5L").await.unwrap().value, Value::Boolean(true));
        assert_eq!(
            fx.eval("name instanceof Comparable").await.unwrap().value,
            Value::Boolean(true)
        );
        assert_eq!(
            fx.eval("this instanceof java.lang.Object").await.unwrap().value,
            Value::Boolean(true)
        );
        assert_eq!(
            fx.eval("count > 3 && age < 40").await.unwrap().value,
            Value::Boolean(true)
        );
    }

    #[tokio::test]
    async fn allocates_arrays_and_objects() {
        let fx = fixture().await;
        let array = fx.eval("new int[4]").await.unwrap();
        assert_eq!(array.display, "int[4]");

        let person = fx.eval("new Object()").await.unwrap();
        assert_eq!(person.type_name, "java.lang.Object");

        assert!(matches!(
            fx.eval("new long[2]").await,
            Err(DebugError::ClassNotLoaded(name)) if name == "long[]"
        ));
    }
}
