use serde::{Deserialize, Serialize};

/// Declared type of a slot: a variable, a parameter, a return value or a
/// field.
///
/// Types are purely syntactic until the VM checks a value against them;
/// `User` names are resolved at check time to a class, interface, enum or a
/// generic parameter bound in the current frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Type {
    Int,
    Float,
    Char,
    Str,
    Bool,

    /// Matches every value.
    Any,

    /// `[T]`
    Array(Box<Type>),

    /// `(T)`
    Tuple(Box<Type>),

    /// `{K : V}`
    Map(Box<Type>, Box<Type>),

    /// `|A, B| -> R`
    Function {
        params: Vec<Type>,
        variadic: Option<Box<Type>>,
        ret: Option<Box<Type>>,
    },

    /// Class, interface, enum or generic parameter name.
    User(String),
}

/// A generic type parameter: `T` or `T: int | float`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generic {
    pub name: String,
    /// Permitted concrete types; empty means unconstrained.
    pub constraint: Vec<Type>,
}

impl Type {
    /// Maps a primitive type name to its type; anything else is a user type.
    pub fn from_name(name: &str) -> Type {
        match name {
            "int" => Type::Int,
            "float" => Type::Float,
            "char" => Type::Char,
            "string" => Type::Str,
            "bool" => Type::Bool,
            "any" => Type::Any,
            other => Type::User(other.to_string()),
        }
    }

    pub fn is_primitive_name(name: &str) -> bool {
        !matches!(Type::from_name(name), Type::User(_))
    }

    /// Name of the kind, as reported by `typeof`.
    pub fn kind_name(&self) -> &str {
        match self {
            Type::Int => "int",
            Type::Float => "float",
            Type::Char => "char",
            Type::Str => "string",
            Type::Bool => "bool",
            Type::Any => "any",
            Type::Array(_) => "array",
            Type::Tuple(_) => "tuple",
            Type::Map(..) => "map",
            Type::Function { .. } => "func",
            Type::User(name) => name,
        }
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Int => write!(f, "<int>"),
            Type::Float => write!(f, "<float>"),
            Type::Char => write!(f, "<char>"),
            Type::Str => write!(f, "<string>"),
            Type::Bool => write!(f, "<bool>"),
            Type::Any => write!(f, "<any>"),
            Type::Array(t) => write!(f, "[{}]", t),
            Type::Tuple(t) => write!(f, "({})", t),
            Type::Map(k, v) => write!(f, "{{{} : {}}}", k, v),
            Type::Function {
                params,
                variadic,
                ret,
            } => {
                write!(f, "<|")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                if let Some(v) = variadic {
                    if !params.is_empty() {
                        write!(f, ", ")?;
                    }
                    write!(f, "...{}", v)?;
                }
                write!(f, "|>")?;
                match ret {
                    Some(r) => write!(f, " -> {}", r),
                    None => write!(f, " -> None"),
                }
            }
            Type::User(name) => write!(f, "<{}>", name),
        }
    }
}

impl std::fmt::Display for Generic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        for (i, t) in self.constraint.iter().enumerate() {
            write!(f, "{}{}", if i == 0 { ": " } else { " | " }, t)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name() {
        assert_eq!(Type::from_name("int"), Type::Int);
        assert_eq!(Type::from_name("string"), Type::Str);
        assert_eq!(Type::from_name("Shape"), Type::User("Shape".to_string()));
        assert!(Type::is_primitive_name("bool"));
        assert!(!Type::is_primitive_name("T"));
    }

    #[test]
    fn test_display_forms() {
        assert_eq!(Type::Int.to_string(), "<int>");
        assert_eq!(Type::Array(Box::new(Type::Int)).to_string(), "[<int>]");
        assert_eq!(Type::Tuple(Box::new(Type::Str)).to_string(), "(<string>)");
        assert_eq!(
            Type::Map(Box::new(Type::Str), Box::new(Type::Float)).to_string(),
            "{<string> : <float>}"
        );
        assert_eq!(Type::User("Box".to_string()).to_string(), "<Box>");
    }

    #[test]
    fn test_function_display() {
        let t = Type::Function {
            params: vec![Type::Int, Type::Int],
            variadic: None,
            ret: Some(Box::new(Type::Int)),
        };
        assert_eq!(t.to_string(), "<|<int>, <int>|> -> <int>");

        let v = Type::Function {
            params: vec![],
            variadic: Some(Box::new(Type::Str)),
            ret: None,
        };
        assert_eq!(v.to_string(), "<|...<string>|> -> None");
    }

    #[test]
    fn test_structural_equality() {
        let a = Type::Map(Box::new(Type::Str), Box::new(Type::Array(Box::new(Type::Int))));
        let b = Type::Map(Box::new(Type::Str), Box::new(Type::Array(Box::new(Type::Int))));
        let c = Type::Map(Box::new(Type::Str), Box::new(Type::Array(Box::new(Type::Float))));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_generic_display() {
        let g = Generic {
            name: "T".to_string(),
            constraint: vec![Type::Int, Type::Float],
        };
        assert_eq!(g.to_string(), "T: <int> | <float>");
    }
}
