//! Conversions between JVM type signatures (`[Ljava/lang/String;`) and Java
//! source type names (`java.lang.String[]`).

const PRIMITIVES: &[(char, &str)] = &[
    ('Z', "boolean"),
    ('B', "byte"),
    ('C', "char"),
    ('S', "short"),
    ('I', "int"),
    ('J', "long"),
    ('F', "float"),
    ('D', "double"),
    ('V', "void"),
];

pub fn is_primitive_type_name(name: &str) -> bool {
    name != "void" && PRIMITIVES.iter().any(|(_, n)| *n == name)
}

pub fn signature_to_type_name(signature: &str) -> String {
    let mut sig = signature;
    let mut dims = 0usize;
    while let Some(rest) = sig.strip_prefix('[') {
        dims += 1;
        sig = rest;
    }

    let base = if let Some(class) = sig.strip_prefix('L').and_then(|s| s.strip_suffix(';')) {
        class.replace('/', ".")
    } else {
        sig.chars()
            .next()
            .and_then(|c| PRIMITIVES.iter().find(|(tag, _)| *tag == c))
            .map(|(_, name)| (*name).to_string())
            .unwrap_or_else(|| "<unknown>".to_string())
    };

    let mut out = base;
    for _ in 0..dims {
        out.push_str("[]");
    }
    out
}

/// Convert a Java source type name into a JVM signature.
///
/// `int` becomes `I`, `com.example.Foo` becomes `Lcom/example/Foo;` and
/// `java.lang.String[]` becomes `[Ljava/lang/String;`. Inputs that already
/// look like a class signature are returned unchanged.
pub fn type_name_to_signature(name: &str) -> String {
    if name.starts_with('L') && name.ends_with(';') {
        return name.to_string();
    }

    let mut base = name.trim();
    let mut dims = 0usize;
    while let Some(rest) = base.strip_suffix("[]") {
        dims += 1;
        base = rest.trim_end();
    }

    let mut out = "[".repeat(dims);
    match PRIMITIVES.iter().find(|(_, n)| *n == base) {
        Some((tag, _)) => out.push(*tag),
        None => {
            out.push('L');
            out.push_str(&base.replace('.', "/"));
            out.push(';');
        }
    }
    out
}

/// Split a method signature `(ILjava/lang/String;[J)V` into its argument
/// signatures.
pub fn method_argument_signatures(signature: &str) -> Vec<String> {
    let Some(args) = signature
        .strip_prefix('(')
        .and_then(|rest| rest.split_once(')'))
        .map(|(args, _)| args)
    else {
        return Vec::new();
    };

    let bytes = args.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let start = i;
        while i < bytes.len() && bytes[i] == b'[' {
            i += 1;
        }
        if i < bytes.len() && bytes[i] == b'L' {
            while i < bytes.len() && bytes[i] != b';' {
                i += 1;
            }
        }
        i += 1;
        out.push(args[start..i.min(bytes.len())].to_string());
    }
    out
}

pub fn method_return_signature(signature: &str) -> &str {
    signature
        .split_once(')')
        .map(|(_, ret)| ret)
        .unwrap_or("V")
}

/// Element type name of an array type name (`int[][]` -> `int[]`).
pub fn array_component_type_name(name: &str) -> Option<&str> {
    name.strip_suffix("[]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_convert_to_type_names() {
        assert_eq!(signature_to_type_name("I"), "int");
        assert_eq!(signature_to_type_name("Ljava/lang/String;"), "java.lang.String");
        assert_eq!(signature_to_type_name("[[J"), "long[][]");
        assert_eq!(signature_to_type_name("[Lcom/example/Foo;"), "com.example.Foo[]");
    }

    #[test]
    fn type_names_convert_to_signatures() {
        assert_eq!(type_name_to_signature("boolean"), "Z");
        assert_eq!(type_name_to_signature("com.example.Foo"), "Lcom/example/Foo;");
        assert_eq!(type_name_to_signature("int[]"), "[I");
        assert_eq!(type_name_to_signature("java.lang.String[][]"), "[[Ljava/lang/String;");
        assert_eq!(type_name_to_signature("Lcom/example/Foo;"), "Lcom/example/Foo;");
    }

    #[test]
    fn method_signatures_split_into_arguments() {
        assert_eq!(
            method_argument_signatures("(ILjava/lang/String;[JZ)V"),
            vec!["I", "Ljava/lang/String;", "[J", "Z"]
        );
        assert!(method_argument_signatures("()V").is_empty());
        assert_eq!(method_return_signature("(I)Ljava/lang/Object;"), "Ljava/lang/Object;");
    }

    #[test]
    fn primitive_names_exclude_void() {
        assert!(is_primitive_type_name("int"));
        assert!(!is_primitive_type_name("void"));
        assert!(!is_primitive_type_name("java.lang.Integer"));
    }
}
