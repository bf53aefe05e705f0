use std::fmt;
use std::sync::Arc;

/// Static type of a compiled expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Bool,
    Int,
    Uint,
    Float,
    Complex,
    String,
    /// Accepts any value; comparisons against it are decided at runtime.
    Any,
    Func(Arc<FuncType>),
}

/// Signature of a callable value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FuncType {
    pub params: Vec<Type>,
    pub results: Vec<Type>,
    /// The last parameter collects any remaining arguments.
    pub variadic: bool,
}

impl FuncType {
    pub fn new(params: Vec<Type>, results: Vec<Type>) -> Self {
        Self {
            params,
            results,
            variadic: false,
        }
    }

    pub fn variadic(params: Vec<Type>, results: Vec<Type>) -> Self {
        Self {
            params,
            results,
            variadic: true,
        }
    }
}

impl Type {
    pub fn func(params: Vec<Type>, results: Vec<Type>) -> Type {
        Type::Func(Arc::new(FuncType::new(params, results)))
    }

    pub fn as_func(&self) -> Option<&Arc<FuncType>> {
        match self {
            Type::Func(ft) => Some(ft),
            _ => None,
        }
    }

    /// Whether a value of type `self` may be stored where `target` is expected.
    pub fn assignable_to(&self, target: &Type) -> bool {
        self == target || *target == Type::Any
    }

    /// Whether `==` is defined between two values of this type.
    pub fn is_comparable(&self) -> bool {
        !matches!(self, Type::Func(_))
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Type::Int | Type::Uint | Type::Float | Type::Complex)
    }

    /// Whether `<` is defined.
    pub fn is_ordered(&self) -> bool {
        matches!(self, Type::Int | Type::Uint | Type::Float | Type::String)
    }
}

/// Writes `(a, b)`.
pub(crate) fn write_list(f: &mut fmt::Formatter<'_>, types: &[Type]) -> fmt::Result {
    write!(f, "(")?;
    for (i, ty) in types.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{ty}")?;
    }
    write!(f, ")")
}

/// `(int, string)` rendering used by arity diagnostics.
pub fn type_list(types: &[Type]) -> String {
    struct List<'a>(&'a [Type]);
    impl fmt::Display for List<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write_list(f, self.0)
        }
    }
    List(types).to_string()
}

impl fmt::Display for FuncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "func(")?;
        let last = self.params.len().saturating_sub(1);
        for (i, ty) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if self.variadic && i == last {
                write!(f, "...")?;
            }
            write!(f, "{ty}")?;
        }
        write!(f, ")")?;
        match self.results.as_slice() {
            [] => Ok(()),
            [one] => write!(f, " {one}"),
            many => {
                write!(f, " ")?;
                write_list(f, many)
            }
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Bool => write!(f, "bool"),
            Type::Int => write!(f, "int"),
            Type::Uint => write!(f, "uint"),
            Type::Float => write!(f, "float64"),
            Type::Complex => write!(f, "complex128"),
            Type::String => write!(f, "string"),
            Type::Any => write!(f, "any"),
            Type::Func(ft) => write!(f, "{ft}"),
        }
    }
}
