use std::fmt;

#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Null,
    Boolean(bool),
    Char(u16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Gt => ">",
            BinaryOp::Le => "<=",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// Parsed expression. Immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(Literal),
    Variable(String),
    This,
    FieldAccess {
        target: Box<Expr>,
        name: String,
    },
    /// `target` is `None` for an unqualified call such as `foo(1)`.
    MethodCall {
        target: Option<Box<Expr>>,
        name: String,
        args: Vec<Expr>,
    },
    ArrayAccess {
        array: Box<Expr>,
        index: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Cast {
        type_name: String,
        operand: Box<Expr>,
    },
    InstanceOf {
        operand: Box<Expr>,
        type_name: String,
    },
    NewObject {
        type_name: String,
        args: Vec<Expr>,
    },
    NewArray {
        element_type: String,
        size: Box<Expr>,
    },
}

impl Expr {
    /// Segments of a pure identifier chain such as `com.example.Foo.BAR`.
    pub fn dotted_segments(&self) -> Option<Vec<&str>> {
        match self {
            Expr::Variable(name) => Some(vec![name.as_str()]),
            Expr::FieldAccess { target, name } => {
                let mut segments = target.dotted_segments()?;
                segments.push(name.as_str());
                Some(segments)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_segments_stop_at_non_identifiers() {
        let chain = Expr::FieldAccess {
            target: Box::new(Expr::FieldAccess {
                target: Box::new(Expr::Variable("java".into())),
                name: "lang".into(),
            }),
            name: "Math".into(),
        };
        assert_eq!(chain.dotted_segments(), Some(vec!["java", "lang", "Math"]));

        let rooted_at_this = Expr::FieldAccess {
            target: Box::new(Expr::This),
            name: "x".into(),
        };
        assert_eq!(rooted_at_this.dotted_segments(), None);
    }
}
