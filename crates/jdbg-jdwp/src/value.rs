use crate::{ObjectId, ReferenceTypeId};

/// A value living in the target VM.
///
/// Primitives are carried by value; everything else is a handle to a remote
/// object whose state can only be read through a [`crate::TargetConnection`].
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Void,
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Object(ObjectRef),
}

impl Value {
    /// Java type name of the value: `int`, `java.lang.String`, `int[]`, ...
    ///
    /// `null` has no type; `"null"` is returned for display purposes.
    pub fn type_name(&self) -> &str {
        match self {
            Value::Null => "null",
            Value::Void => "void",
            Value::Boolean(_) => "boolean",
            Value::Byte(_) => "byte",
            Value::Char(_) => "char",
            Value::Short(_) => "short",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Object(obj) => &obj.runtime_type,
        }
    }

    pub fn is_primitive(&self) -> bool {
        !matches!(self, Value::Null | Value::Void | Value::Object(_))
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn object_id(&self) -> Option<ObjectId> {
        self.as_object().map(|obj| obj.id)
    }
}

/// Handle to an object in the target VM together with its runtime type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub id: ObjectId,
    pub type_id: ReferenceTypeId,
    /// Runtime type as a Java type name, e.g. `java.util.ArrayList` or `int[]`.
    pub runtime_type: String,
}

impl ObjectRef {
    pub fn is_string(&self) -> bool {
        self.runtime_type == "java.lang.String"
    }

    pub fn is_array(&self) -> bool {
        self.runtime_type.ends_with("[]")
    }
}
