//! Remote evaluation of parsed expressions.
//!
//! Nothing is computed from target memory locally: field reads, array
//! indexing, calls and allocations are all issued against the suspended
//! thread through [`TargetConnection`]. Only primitive arithmetic runs here.

use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_recursion::async_recursion;
use jdbg_jdwp::signature::is_primitive_type_name;
use jdbg_jdwp::{
    FieldInfo, FrameInfo, InvokeOutcome, LocalVariable, MethodInfo, ObjectRef, ReferenceTypeId,
    TargetConnection, ThreadId, TypeInfo, TypeKind, Value,
};

use super::ast::{BinaryOp, Expr, Literal, UnaryOp};
use crate::error::{DebugError, DebugResult};
use crate::format::{display_value, exception_message, value_to_string};

/// Result of evaluating an expression: the value plus how to show it.
#[derive(Clone, Debug, PartialEq)]
pub struct Evaluation {
    pub value: Value,
    pub display: String,
    pub type_name: String,
}

/// An intermediate result. A class name only ever appears as the target
/// of a static member access and is rejected as a final value.
#[derive(Clone, Debug)]
enum Evaluated {
    Value(Value),
    Class(TypeInfo),
}

/// Evaluates expressions in the context of one suspended stack frame.
pub struct Interpreter {
    conn: Arc<dyn TargetConnection>,
    thread: ThreadId,
    frame: FrameInfo,
    locals: Vec<(LocalVariable, Value)>,
    this: Option<ObjectRef>,
}

impl Interpreter {
    /// Snapshot the frame's visible locals and receiver.
    pub async fn new(
        conn: Arc<dyn TargetConnection>,
        thread: ThreadId,
        frame: FrameInfo,
    ) -> DebugResult<Self> {
        let variables = conn.visible_variables(thread, &frame).await?;
        let values = if variables.is_empty() {
            Vec::new()
        } else {
            conn.local_values(thread, &frame, &variables).await?
        };
        let this = conn.this_object(thread, &frame).await?;
        Ok(Self {
            conn,
            thread,
            frame,
            locals: variables.into_iter().zip(values).collect(),
            this,
        })
    }

    pub fn this_object(&self) -> Option<&ObjectRef> {
        self.this.as_ref()
    }

    pub fn locals(&self) -> &[(LocalVariable, Value)] {
        &self.locals
    }

    pub async fn evaluate(&self, expr: &Expr) -> DebugResult<Evaluation> {
        let value = self.eval_value(expr).await?;
        let display = display_value(self.conn.as_ref(), &value).await?;
        let type_name = value.type_name().to_string();
        Ok(Evaluation {
            value,
            display,
            type_name,
        })
    }

    /// Convert `value` for storage into a slot of type `type_name`
    /// (widening and boxing as for method arguments).
    pub async fn assignment_conversion(&self, value: Value, type_name: &str) -> DebugResult<Value> {
        if !self.is_assignable(&value, type_name).await? {
            return Err(DebugError::evaluation(format!(
                "Cannot assign {} to {type_name}",
                value.type_name()
            )));
        }
        self.coerce(value, type_name).await
    }

    async fn eval_value(&self, expr: &Expr) -> DebugResult<Value> {
        match self.eval(expr).await? {
            Evaluated::Value(value) => Ok(value),
            Evaluated::Class(class) => Err(DebugError::evaluation(format!(
                "Cannot use class '{}' as a value",
                class.name
            ))),
        }
    }

    #[async_recursion]
    async fn eval(&self, expr: &Expr) -> DebugResult<Evaluated> {
        match expr {
            Expr::Literal(literal) => self.literal(literal).await.map(Evaluated::Value),
            Expr::This => match &self.this {
                Some(this) => Ok(Evaluated::Value(Value::Object(this.clone()))),
                None => Err(DebugError::evaluation(
                    "'this' is not available in a static context",
                )),
            },
            Expr::Variable(name) => self
                .resolve_name(name)
                .await?
                .ok_or_else(|| DebugError::VariableNotFound(name.clone())),
            Expr::FieldAccess { target, name } => {
                if let Some(segments) = expr.dotted_segments() {
                    return match self.resolve_chain(&segments).await? {
                        Some(resolved) => Ok(resolved),
                        None => Err(unresolved_chain(&segments[..segments.len() - 1])),
                    };
                }
                let base = self.eval(target).await?;
                self.member(base, name).await
            }
            Expr::MethodCall { target, name, args } => {
                let args = self.eval_args(args).await?;
                let Some(target) = target else {
                    return self.call_unqualified(name, args).await;
                };
                let receiver = match target.dotted_segments() {
                    Some(segments) => self
                        .resolve_chain(&segments)
                        .await?
                        .ok_or_else(|| unresolved_chain(&segments))?,
                    None => self.eval(target).await?,
                };
                match receiver {
                    Evaluated::Class(class) => {
                        self.call_static(class.id, &class.name, name, args).await
                    }
                    Evaluated::Value(Value::Object(obj)) => self.call_instance(&obj, name, args).await,
                    Evaluated::Value(Value::Null) => Err(DebugError::evaluation(format!(
                        "Cannot invoke method '{name}' on null"
                    ))),
                    Evaluated::Value(other) => Err(DebugError::evaluation(format!(
                        "Cannot invoke method '{name}' on primitive type {}",
                        other.type_name()
                    ))),
                }
            }
            Expr::ArrayAccess { array, index } => {
                let array = self.eval_value(array).await?;
                let index = self.eval_value(index).await?;
                self.array_element(array, index).await.map(Evaluated::Value)
            }
            Expr::Binary { op, left, right } => {
                self.binary(*op, left, right).await.map(Evaluated::Value)
            }
            Expr::Unary { op, operand } => {
                let value = self.eval_value(operand).await?;
                unary(*op, value).map(Evaluated::Value)
            }
            Expr::Cast { type_name, operand } => {
                let value = self.eval_value(operand).await?;
                self.cast(value, type_name).await.map(Evaluated::Value)
            }
            Expr::InstanceOf { operand, type_name } => {
                let value = self.eval_value(operand).await?;
                self.instance_of(value, type_name)
                    .await
                    .map(|b| Evaluated::Value(Value::Boolean(b)))
            }
            Expr::NewObject { type_name, args } => {
                let args = self.eval_args(args).await?;
                self.new_object(type_name, args).await.map(Evaluated::Value)
            }
            Expr::NewArray { element_type, size } => {
                let size = self.eval_value(size).await?;
                self.new_array(element_type, size).await.map(Evaluated::Value)
            }
        }
    }

    async fn literal(&self, literal: &Literal) -> DebugResult<Value> {
        Ok(match literal {
            Literal::Null => Value::Null,
            Literal::Boolean(v) => Value::Boolean(*v),
            Literal::Char(v) => Value::Char(*v),
            Literal::Int(v) => Value::Int(*v),
            Literal::Long(v) => Value::Long(*v),
            Literal::Float(v) => Value::Float(*v),
            Literal::Double(v) => Value::Double(*v),
            Literal::String(text) => Value::Object(self.conn.create_string(text).await?),
        })
    }

    async fn eval_args(&self, args: &[Expr]) -> DebugResult<Vec<Value>> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval_value(arg).await?);
        }
        Ok(values)
    }

    /// A bare identifier: local, then field of `this` (or a static field of
    /// the current class in a static frame), then a loaded class.
    async fn resolve_name(&self, name: &str) -> DebugResult<Option<Evaluated>> {
        if let Some((_, value)) = self.locals.iter().find(|(var, _)| var.name == name) {
            return Ok(Some(Evaluated::Value(value.clone())));
        }

        match &self.this {
            Some(this) => {
                if let Some(field) = self.find_field(this.type_id, name).await? {
                    let value = self.read_field(Some(this), &field).await?;
                    return Ok(Some(Evaluated::Value(value)));
                }
            }
            None => {
                let class = self.frame.location.class_id;
                if let Some(field) = self.find_field(class, name).await? {
                    if field.is_static() {
                        let value = self.conn.get_static_field(class, &field).await?;
                        return Ok(Some(Evaluated::Value(value)));
                    }
                }
            }
        }

        Ok(self.lookup_type(name).await?.map(Evaluated::Class))
    }

    /// Resolve `a.b.c...`: the longest prefix naming a loaded class wins,
    /// otherwise the first segment is resolved as a name. `None` if neither
    /// works.
    async fn resolve_chain(&self, segments: &[&str]) -> DebugResult<Option<Evaluated>> {
        for len in (2..=segments.len()).rev() {
            let class_name = segments[..len].join(".");
            if let Some(class) = self.find_class(&class_name).await? {
                let resolved = self.members(Evaluated::Class(class), &segments[len..]).await?;
                return Ok(Some(resolved));
            }
        }
        let Some(root) = self.resolve_name(segments[0]).await? else {
            return Ok(None);
        };
        self.members(root, &segments[1..]).await.map(Some)
    }

    async fn members(&self, mut current: Evaluated, names: &[&str]) -> DebugResult<Evaluated> {
        for name in names {
            current = self.member(current, name).await?;
        }
        Ok(current)
    }

    /// `base.name` where `base` is already evaluated.
    async fn member(&self, base: Evaluated, name: &str) -> DebugResult<Evaluated> {
        let value = match base {
            Evaluated::Class(class) => {
                let field = self
                    .find_field(class.id, name)
                    .await?
                    .ok_or_else(|| DebugError::VariableNotFound(format!("{}.{name}", class.name)))?;
                if !field.is_static() {
                    return Err(DebugError::evaluation(format!(
                        "Field {name} of {} is not static",
                        class.name
                    )));
                }
                self.conn.get_static_field(class.id, &field).await?
            }
            Evaluated::Value(Value::Object(obj)) => {
                if obj.is_array() && name == "length" {
                    Value::Int(self.conn.array_length(&obj).await?)
                } else {
                    let field = self
                        .find_field(obj.type_id, name)
                        .await?
                        .ok_or_else(|| DebugError::VariableNotFound(name.to_string()))?;
                    self.read_field(Some(&obj), &field).await?
                }
            }
            Evaluated::Value(Value::Null) => {
                return Err(DebugError::evaluation(format!(
                    "Cannot access field '{name}' on null"
                )))
            }
            Evaluated::Value(other) => {
                return Err(DebugError::evaluation(format!(
                    "Cannot access field '{name}' on primitive type {}",
                    other.type_name()
                )))
            }
        };
        Ok(Evaluated::Value(value))
    }

    async fn find_field(&self, class: ReferenceTypeId, name: &str) -> DebugResult<Option<FieldInfo>> {
        let fields = self.conn.fields(class).await?;
        Ok(fields.into_iter().find(|f| f.name == name))
    }

    async fn read_field(&self, object: Option<&ObjectRef>, field: &FieldInfo) -> DebugResult<Value> {
        match object {
            Some(object) if !field.is_static() => Ok(self.conn.get_field(object, field).await?),
            _ => Ok(self.conn.get_static_field(field.declaring_type, field).await?),
        }
    }

    async fn find_class(&self, name: &str) -> DebugResult<Option<TypeInfo>> {
        Ok(self.conn.classes_by_name(name).await?.into_iter().next())
    }

    /// A type name as written in source: fully qualified, or a simple name
    /// from `java.lang`.
    async fn lookup_type(&self, name: &str) -> DebugResult<Option<TypeInfo>> {
        if let Some(class) = self.find_class(name).await? {
            return Ok(Some(class));
        }
        if !name.contains('.') && !is_primitive_type_name(name) {
            return self.find_class(&format!("java.lang.{name}")).await;
        }
        Ok(None)
    }

    async fn call_unqualified(&self, name: &str, args: Vec<Value>) -> DebugResult<Evaluated> {
        if let Some(this) = &self.this {
            return self.call_instance(this, name, args).await;
        }
        let class = self.frame.location.class_id;
        let class_name = self
            .conn
            .location_info(&self.frame.location)
            .await
            .map(|info| info.class_name)
            .unwrap_or_default();
        self.call_static(class, &class_name, name, args).await
    }

    async fn call_instance(
        &self,
        object: &ObjectRef,
        name: &str,
        args: Vec<Value>,
    ) -> DebugResult<Evaluated> {
        let methods = self.conn.methods(object.type_id).await?;
        let candidates = methods.into_iter().filter(|m| m.name == name && !m.is_constructor());
        let method = self
            .select_overload(candidates, &args)
            .await?
            .ok_or_else(|| no_applicable("method", name, &object.runtime_type, &args))?;
        let args = self.coerce_args(&method, args).await?;
        let outcome = if method.is_static() {
            self.conn
                .invoke_static(self.thread, method.declaring_type, &method, &args)
                .await?
        } else {
            self.conn
                .invoke_instance(self.thread, object, &method, &args)
                .await?
        };
        self.returned(outcome).await
    }

    async fn call_static(
        &self,
        class: ReferenceTypeId,
        class_name: &str,
        name: &str,
        args: Vec<Value>,
    ) -> DebugResult<Evaluated> {
        let methods = self.conn.methods(class).await?;
        let candidates = methods.into_iter().filter(|m| m.name == name && !m.is_constructor());
        let method = self
            .select_overload(candidates, &args)
            .await?
            .ok_or_else(|| no_applicable("method", name, class_name, &args))?;
        if !method.is_static() {
            return Err(DebugError::evaluation(format!(
                "Method {name} of {class_name} is not static"
            )));
        }
        let args = self.coerce_args(&method, args).await?;
        let outcome = self
            .conn
            .invoke_static(self.thread, class, &method, &args)
            .await?;
        self.returned(outcome).await
    }

    async fn returned(&self, outcome: InvokeOutcome) -> DebugResult<Evaluated> {
        match outcome {
            InvokeOutcome::Returned(value) => Ok(Evaluated::Value(value)),
            InvokeOutcome::Threw(exception) => Err(self.remote_throw(exception).await),
        }
    }

    async fn remote_throw(&self, exception: ObjectRef) -> DebugError {
        let message = exception_message(self.conn.as_ref(), &exception).await;
        DebugError::RemoteInvocationThrew {
            class_name: exception.runtime_type,
            message,
        }
    }

    /// First candidate with matching arity whose parameters all accept the
    /// corresponding argument. No most-specific tie-breaking.
    async fn select_overload(
        &self,
        candidates: impl Iterator<Item = MethodInfo> + Send,
        args: &[Value],
    ) -> DebugResult<Option<MethodInfo>> {
        let candidates: Vec<MethodInfo> = candidates.collect();
        'candidates: for method in candidates {
            let params = method.argument_type_names();
            if params.len() != args.len() {
                continue;
            }
            for (arg, param) in args.iter().zip(&params) {
                if !self.is_assignable(arg, param).await? {
                    continue 'candidates;
                }
            }
            return Ok(Some(method));
        }
        Ok(None)
    }

    async fn is_assignable(&self, value: &Value, type_name: &str) -> DebugResult<bool> {
        let target_primitive = is_primitive_type_name(type_name);
        Ok(match value {
            Value::Null => !target_primitive,
            Value::Void => false,
            Value::Object(obj) if target_primitive => unboxed_type(&obj.runtime_type)
                .is_some_and(|prim| prim == type_name || widens(prim, type_name)),
            Value::Object(obj) => self.is_subtype(obj, type_name).await?,
            primitive if target_primitive => {
                let from = primitive.type_name();
                from == type_name || widens(from, type_name)
            }
            primitive => boxes_to(primitive.type_name(), type_name),
        })
    }

    async fn is_subtype(&self, obj: &ObjectRef, type_name: &str) -> DebugResult<bool> {
        if obj.runtime_type == type_name || type_name == "java.lang.Object" {
            return Ok(true);
        }
        if obj.is_array() {
            return Ok(matches!(type_name, "java.lang.Cloneable" | "java.io.Serializable"));
        }

        let mut queue = VecDeque::from([(obj.type_id, TypeKind::Class)]);
        let mut seen = HashSet::new();
        while let Some((id, kind)) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            if kind == TypeKind::Class {
                if let Some(superclass) = self.conn.superclass(id).await? {
                    if superclass.name == type_name {
                        return Ok(true);
                    }
                    queue.push_back((superclass.id, superclass.kind));
                }
            }
            for interface in self.conn.interfaces(id).await? {
                if interface.name == type_name {
                    return Ok(true);
                }
                queue.push_back((interface.id, interface.kind));
            }
        }
        Ok(false)
    }

    async fn coerce_args(&self, method: &MethodInfo, args: Vec<Value>) -> DebugResult<Vec<Value>> {
        let params = method.argument_type_names();
        let mut out = Vec::with_capacity(args.len());
        for (arg, param) in args.into_iter().zip(&params) {
            out.push(self.coerce(arg, param).await?);
        }
        Ok(out)
    }

    /// Widen, box or unbox `value` to exactly `type_name`.
    async fn coerce(&self, value: Value, type_name: &str) -> DebugResult<Value> {
        let target_primitive = is_primitive_type_name(type_name);
        match value {
            Value::Object(obj) if target_primitive => {
                let unboxed = self.unbox(&obj).await?;
                convert_primitive(&unboxed, type_name).ok_or_else(|| {
                    DebugError::evaluation(format!("Cannot convert {} to {type_name}", obj.runtime_type))
                })
            }
            primitive if primitive.is_primitive() && target_primitive => {
                convert_primitive(&primitive, type_name).ok_or_else(|| {
                    DebugError::evaluation(format!(
                        "Cannot convert {} to {type_name}",
                        primitive.type_name()
                    ))
                })
            }
            primitive if primitive.is_primitive() => self.box_primitive(primitive).await,
            other => Ok(other),
        }
    }

    async fn unbox(&self, obj: &ObjectRef) -> DebugResult<Value> {
        let primitive = unboxed_type(&obj.runtime_type).ok_or_else(|| {
            DebugError::evaluation(format!("Cannot unbox {}", obj.runtime_type))
        })?;
        let accessor = format!("{primitive}Value");
        let methods = self.conn.methods(obj.type_id).await?;
        let method = methods
            .into_iter()
            .find(|m| m.name == accessor && m.argument_type_names().is_empty() && !m.is_static())
            .ok_or_else(|| no_applicable("method", &accessor, &obj.runtime_type, &[]))?;
        let outcome = self
            .conn
            .invoke_instance(self.thread, obj, &method, &[])
            .await?;
        match self.returned(outcome).await? {
            Evaluated::Value(value) => Ok(value),
            Evaluated::Class(class) => Err(DebugError::evaluation(format!(
                "Unexpected class {} from {accessor}()",
                class.name
            ))),
        }
    }

    async fn box_primitive(&self, value: Value) -> DebugResult<Value> {
        let primitive = value.type_name().to_string();
        let wrapper = wrapper_type(&primitive)
            .ok_or_else(|| DebugError::evaluation(format!("Cannot box {primitive}")))?;
        let class = self
            .find_class(wrapper)
            .await?
            .ok_or_else(|| DebugError::ClassNotLoaded(wrapper.to_string()))?;
        let methods = self.conn.methods(class.id).await?;
        let value_of = methods
            .into_iter()
            .find(|m| m.name == "valueOf" && m.is_static() && m.argument_type_names() == [primitive.as_str()])
            .ok_or_else(|| no_applicable("method", "valueOf", wrapper, std::slice::from_ref(&value)))?;
        let outcome = self
            .conn
            .invoke_static(self.thread, class.id, &value_of, &[value])
            .await?;
        match self.returned(outcome).await? {
            Evaluated::Value(boxed) => Ok(boxed),
            Evaluated::Class(class) => Err(DebugError::evaluation(format!(
                "Unexpected class {} from valueOf()",
                class.name
            ))),
        }
    }

    async fn array_element(&self, array: Value, index: Value) -> DebugResult<Value> {
        let array = match array {
            Value::Object(obj) if obj.is_array() => obj,
            Value::Null => return Err(DebugError::evaluation("Cannot index into null")),
            other => {
                return Err(DebugError::evaluation(format!(
                    "Cannot index into non-array type {}",
                    other.type_name()
                )))
            }
        };
        let index = integral(&index).ok_or_else(|| {
            DebugError::evaluation(format!(
                "Array index must be an integer, got {}",
                index.type_name()
            ))
        })?;
        let length = self.conn.array_length(&array).await?;
        if index < 0 || index >= length {
            return Err(DebugError::evaluation(format!(
                "Array index out of bounds: {index} (length {length})"
            )));
        }
        Ok(self.conn.array_get(&array, index).await?)
    }

    async fn binary(&self, op: BinaryOp, left: &Expr, right: &Expr) -> DebugResult<Value> {
        if matches!(op, BinaryOp::And | BinaryOp::Or) {
            let lhs = expect_boolean(op, self.eval_value(left).await?)?;
            // Short circuit.
            if (op == BinaryOp::And && !lhs) || (op == BinaryOp::Or && lhs) {
                return Ok(Value::Boolean(lhs));
            }
            let rhs = expect_boolean(op, self.eval_value(right).await?)?;
            return Ok(Value::Boolean(rhs));
        }

        let lhs = self.eval_value(left).await?;
        let rhs = self.eval_value(right).await?;
        match op {
            BinaryOp::Eq => Ok(Value::Boolean(values_equal(&lhs, &rhs))),
            BinaryOp::Ne => Ok(Value::Boolean(!values_equal(&lhs, &rhs))),
            BinaryOp::Add if is_string(&lhs) || is_string(&rhs) => self.concat(&lhs, &rhs).await,
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
                arithmetic(op, &lhs, &rhs)
            }
            BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge => compare(op, &lhs, &rhs),
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        }
    }

    async fn concat(&self, lhs: &Value, rhs: &Value) -> DebugResult<Value> {
        let conn = self.conn.as_ref();
        let mut text = value_to_string(conn, self.thread, lhs).await?;
        text.push_str(&value_to_string(conn, self.thread, rhs).await?);
        Ok(Value::Object(conn.create_string(&text).await?))
    }

    async fn cast(&self, value: Value, type_name: &str) -> DebugResult<Value> {
        if is_primitive_type_name(type_name) {
            let primitive = match value {
                Value::Object(obj) if unboxed_type(&obj.runtime_type).is_some() => {
                    self.unbox(&obj).await?
                }
                other => other,
            };
            return convert_primitive(&primitive, type_name).ok_or_else(|| {
                DebugError::evaluation(format!(
                    "Cannot cast {} to {type_name}",
                    primitive.type_name()
                ))
            });
        }
        match value {
            // Reference casts are not checked against the runtime type.
            Value::Null | Value::Object(_) => Ok(value),
            primitive => {
                let wrapper = wrapper_type(primitive.type_name()).unwrap_or_default();
                if names_type(type_name, wrapper) || names_type(type_name, "java.lang.Object") {
                    self.box_primitive(primitive).await
                } else {
                    Err(DebugError::evaluation(format!(
                        "Cannot cast {} to {type_name}",
                        primitive.type_name()
                    )))
                }
            }
        }
    }

    async fn instance_of(&self, value: Value, type_name: &str) -> DebugResult<bool> {
        match value {
            Value::Null => Ok(false),
            Value::Object(obj) => {
                let class = self
                    .lookup_type(type_name)
                    .await?
                    .ok_or_else(|| DebugError::ClassNotLoaded(type_name.to_string()))?;
                self.is_subtype(&obj, &class.name).await
            }
            other => Err(DebugError::evaluation(format!(
                "instanceof requires a reference operand, got {}",
                other.type_name()
            ))),
        }
    }

    async fn new_object(&self, type_name: &str, args: Vec<Value>) -> DebugResult<Value> {
        let class = self
            .lookup_type(type_name)
            .await?
            .ok_or_else(|| DebugError::ClassNotLoaded(type_name.to_string()))?;
        if class.kind != TypeKind::Class {
            return Err(DebugError::evaluation(format!(
                "Cannot instantiate {}: not a class",
                class.name
            )));
        }
        let methods = self.conn.methods(class.id).await?;
        let constructors = methods
            .into_iter()
            .filter(|m| m.is_constructor() && m.declaring_type == class.id);
        let constructor = self
            .select_overload(constructors, &args)
            .await?
            .ok_or_else(|| no_applicable("constructor", &class.name, &class.name, &args))?;
        let args = self.coerce_args(&constructor, args).await?;
        let outcome = self
            .conn
            .new_instance(self.thread, class.id, &constructor, &args)
            .await?;
        match self.returned(outcome).await? {
            Evaluated::Value(value) => Ok(value),
            Evaluated::Class(class) => Err(DebugError::evaluation(format!(
                "Unexpected class {} from constructor",
                class.name
            ))),
        }
    }

    async fn new_array(&self, element_type: &str, size: Value) -> DebugResult<Value> {
        let length = integral(&size).ok_or_else(|| {
            DebugError::evaluation(format!(
                "Array size must be an integer, got {}",
                size.type_name()
            ))
        })?;
        if length < 0 {
            return Err(DebugError::evaluation(format!("Negative array size: {length}")));
        }
        let element = if is_primitive_type_name(element_type) {
            element_type.to_string()
        } else {
            match self.lookup_type(element_type).await? {
                Some(class) => class.name,
                None => element_type.to_string(),
            }
        };
        let array_name = format!("{element}[]");
        let array_type = self
            .find_class(&array_name)
            .await?
            .ok_or(DebugError::ClassNotLoaded(array_name))?;
        let array = self.conn.new_array(array_type.id, length).await?;
        Ok(Value::Object(array))
    }
}

/// Error for an identifier chain nothing could resolve: a class-shaped
/// prefix (`com.foo.Bar`) is reported as an unloaded class, anything else
/// as an unknown variable.
fn unresolved_chain(segments: &[&str]) -> DebugError {
    let class_shaped = segments
        .last()
        .and_then(|s| s.chars().next())
        .is_some_and(char::is_uppercase);
    if class_shaped {
        DebugError::ClassNotLoaded(segments.join("."))
    } else {
        DebugError::VariableNotFound(segments.first().copied().unwrap_or_default().to_string())
    }
}

fn no_applicable(kind: &str, name: &str, owner: &str, args: &[Value]) -> DebugError {
    let types: Vec<&str> = args.iter().map(Value::type_name).collect();
    DebugError::evaluation(format!(
        "No applicable {kind} {name}({}) in {owner}",
        types.join(", ")
    ))
}

fn is_string(value: &Value) -> bool {
    value.as_object().is_some_and(ObjectRef::is_string)
}

fn names_type(written: &str, qualified: &str) -> bool {
    written == qualified || qualified.strip_prefix("java.lang.") == Some(written)
}

fn expect_boolean(op: BinaryOp, value: Value) -> DebugResult<bool> {
    match value {
        Value::Boolean(b) => Ok(b),
        other => Err(DebugError::evaluation(format!(
            "Operator '{op}' expects boolean operands, got {}",
            other.type_name()
        ))),
    }
}

const WRAPPERS: &[(&str, &str)] = &[
    ("boolean", "java.lang.Boolean"),
    ("byte", "java.lang.Byte"),
    ("char", "java.lang.Character"),
    ("short", "java.lang.Short"),
    ("int", "java.lang.Integer"),
    ("long", "java.lang.Long"),
    ("float", "java.lang.Float"),
    ("double", "java.lang.Double"),
];

fn wrapper_type(primitive: &str) -> Option<&'static str> {
    WRAPPERS
        .iter()
        .find(|(p, _)| *p == primitive)
        .map(|(_, w)| *w)
}

fn unboxed_type(wrapper: &str) -> Option<&'static str> {
    WRAPPERS
        .iter()
        .find(|(_, w)| *w == wrapper)
        .map(|(p, _)| *p)
}

/// Boxing conversion followed by reference widening.
fn boxes_to(primitive: &str, type_name: &str) -> bool {
    let Some(wrapper) = wrapper_type(primitive) else {
        return false;
    };
    type_name == wrapper
        || matches!(type_name, "java.lang.Object" | "java.io.Serializable" | "java.lang.Comparable")
        || (type_name == "java.lang.Number" && !matches!(primitive, "boolean" | "char"))
}

/// Primitive widening conversions.
fn widens(from: &str, to: &str) -> bool {
    let targets: &[&str] = match from {
        "byte" => &["short", "int", "long", "float", "double"],
        "short" | "char" => &["int", "long", "float", "double"],
        "int" => &["long", "float", "double"],
        "long" => &["float", "double"],
        "float" => &["double"],
        _ => &[],
    };
    targets.contains(&to)
}

fn integral(value: &Value) -> Option<i32> {
    match *value {
        Value::Byte(v) => Some(i32::from(v)),
        Value::Char(v) => Some(i32::from(v)),
        Value::Short(v) => Some(i32::from(v)),
        Value::Int(v) => Some(v),
        _ => None,
    }
}

/// A numeric operand after unary promotion.
#[derive(Clone, Copy, Debug)]
enum Num {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
}

impl Num {
    fn of(value: &Value) -> Option<Num> {
        Some(match *value {
            Value::Long(v) => Num::Long(v),
            Value::Float(v) => Num::Float(v),
            Value::Double(v) => Num::Double(v),
            _ => Num::Int(integral(value)?),
        })
    }

    fn to_i32(self) -> i32 {
        match self {
            Num::Int(v) => v,
            Num::Long(v) => v as i32,
            Num::Float(v) => v as i32,
            Num::Double(v) => v as i32,
        }
    }

    fn to_i64(self) -> i64 {
        match self {
            Num::Int(v) => i64::from(v),
            Num::Long(v) => v,
            Num::Float(v) => v as i64,
            Num::Double(v) => v as i64,
        }
    }

    fn to_f32(self) -> f32 {
        match self {
            Num::Int(v) => v as f32,
            Num::Long(v) => v as f32,
            Num::Float(v) => v,
            Num::Double(v) => v as f32,
        }
    }

    fn to_f64(self) -> f64 {
        match self {
            Num::Int(v) => f64::from(v),
            Num::Long(v) => v as f64,
            Num::Float(v) => f64::from(v),
            Num::Double(v) => v,
        }
    }
}

/// Both operands converted to the wider of their two representations.
enum Promoted {
    Int(i32, i32),
    Long(i64, i64),
    Float(f32, f32),
    Double(f64, f64),
}

fn promote(a: Num, b: Num) -> Promoted {
    match (a, b) {
        (Num::Double(_), _) | (_, Num::Double(_)) => Promoted::Double(a.to_f64(), b.to_f64()),
        (Num::Float(_), _) | (_, Num::Float(_)) => Promoted::Float(a.to_f32(), b.to_f32()),
        (Num::Long(_), _) | (_, Num::Long(_)) => Promoted::Long(a.to_i64(), b.to_i64()),
        _ => Promoted::Int(a.to_i32(), b.to_i32()),
    }
}

fn numeric_operands(op: BinaryOp, lhs: &Value, rhs: &Value) -> DebugResult<Promoted> {
    match (Num::of(lhs), Num::of(rhs)) {
        (Some(a), Some(b)) => Ok(promote(a, b)),
        _ => Err(DebugError::evaluation(format!(
            "Cannot apply operator '{op}' to {} and {}",
            lhs.type_name(),
            rhs.type_name()
        ))),
    }
}

fn division_by_zero() -> DebugError {
    DebugError::evaluation("Division by zero")
}

fn arithmetic(op: BinaryOp, lhs: &Value, rhs: &Value) -> DebugResult<Value> {
    Ok(match numeric_operands(op, lhs, rhs)? {
        Promoted::Int(a, b) => Value::Int(match op {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            BinaryOp::Div if b == 0 => return Err(division_by_zero()),
            BinaryOp::Div => a.wrapping_div(b),
            BinaryOp::Rem if b == 0 => return Err(division_by_zero()),
            _ => a.wrapping_rem(b),
        }),
        Promoted::Long(a, b) => Value::Long(match op {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            BinaryOp::Div if b == 0 => return Err(division_by_zero()),
            BinaryOp::Div => a.wrapping_div(b),
            BinaryOp::Rem if b == 0 => return Err(division_by_zero()),
            _ => a.wrapping_rem(b),
        }),
        // Floating point division by zero is an error as well, not Infinity/NaN.
        Promoted::Float(a, b) => Value::Float(match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div | BinaryOp::Rem if b == 0.0 => return Err(division_by_zero()),
            BinaryOp::Div => a / b,
            _ => a % b,
        }),
        Promoted::Double(a, b) => Value::Double(match op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div | BinaryOp::Rem if b == 0.0 => return Err(division_by_zero()),
            BinaryOp::Div => a / b,
            _ => a % b,
        }),
    })
}

fn compare(op: BinaryOp, lhs: &Value, rhs: &Value) -> DebugResult<Value> {
    let ordering = match numeric_operands(op, lhs, rhs)? {
        Promoted::Int(a, b) => a.partial_cmp(&b),
        Promoted::Long(a, b) => a.partial_cmp(&b),
        Promoted::Float(a, b) => a.partial_cmp(&b),
        Promoted::Double(a, b) => a.partial_cmp(&b),
    };
    // NaN compares false with everything.
    let result = ordering.is_some_and(|ordering| match op {
        BinaryOp::Lt => ordering == Ordering::Less,
        BinaryOp::Gt => ordering == Ordering::Greater,
        BinaryOp::Le => ordering != Ordering::Greater,
        _ => ordering != Ordering::Less,
    });
    Ok(Value::Boolean(result))
}

/// `==` semantics: identity for references, value for primitives, and
/// `false` for any mixed pair instead of a type error.
fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Null, Value::Null) => true,
        (Value::Object(a), Value::Object(b)) => a.id == b.id,
        (Value::Boolean(a), Value::Boolean(b)) => a == b,
        _ => match (Num::of(lhs), Num::of(rhs)) {
            (Some(a), Some(b)) => match promote(a, b) {
                Promoted::Int(a, b) => a == b,
                Promoted::Long(a, b) => a == b,
                Promoted::Float(a, b) => a == b,
                Promoted::Double(a, b) => a == b,
            },
            _ => false,
        },
    }
}

fn unary(op: UnaryOp, value: Value) -> DebugResult<Value> {
    match op {
        UnaryOp::Not => match value {
            Value::Boolean(b) => Ok(Value::Boolean(!b)),
            other => Err(DebugError::evaluation(format!(
                "Operator '!' expects a boolean operand, got {}",
                other.type_name()
            ))),
        },
        UnaryOp::Neg => match Num::of(&value) {
            Some(Num::Int(v)) => Ok(Value::Int(v.wrapping_neg())),
            Some(Num::Long(v)) => Ok(Value::Long(v.wrapping_neg())),
            Some(Num::Float(v)) => Ok(Value::Float(-v)),
            Some(Num::Double(v)) => Ok(Value::Double(-v)),
            None => Err(DebugError::evaluation(format!(
                "Operator '-' expects a numeric operand, got {}",
                value.type_name()
            ))),
        },
    }
}

/// Java primitive conversion (widening or narrowing) to `type_name`.
fn convert_primitive(value: &Value, type_name: &str) -> Option<Value> {
    if let Value::Boolean(b) = value {
        return (type_name == "boolean").then_some(Value::Boolean(*b));
    }
    let n = Num::of(value)?;
    Some(match type_name {
        "byte" => Value::Byte(n.to_i32() as i8),
        "short" => Value::Short(n.to_i32() as i16),
        "char" => Value::Char(n.to_i32() as u16),
        "int" => Value::Int(n.to_i32()),
        "long" => Value::Long(n.to_i64()),
        "float" => Value::Float(n.to_f32()),
        "double" => Value::Double(n.to_f64()),
        _ => return None,
    })
}
