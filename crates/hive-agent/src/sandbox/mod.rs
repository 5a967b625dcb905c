//! Restricted expression evaluator used by judge rules and step conditions.
//!
//! Expressions read values from a fixed set of bindings and may call a
//! small whitelist of pure functions. There is no assignment, no
//! attribute access beyond JSON fields, and no way to reach the host.
//! Every evaluation runs under [`SandboxLimits`].

mod interp;
mod lexer;
mod parser;

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;

use hive_core::error::HiveError;

pub type Bindings = BTreeMap<String, Value>;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SandboxError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("limit exceeded: {0}")]
    Limit(String),

    #[error("unknown name: {0}")]
    UnknownName(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("type error: {0}")]
    Type(String),
}

impl From<SandboxError> for HiveError {
    fn from(e: SandboxError) -> Self {
        HiveError::Expression(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct SandboxLimits {
    pub max_expression_len: usize,
    pub max_depth: usize,
    pub max_steps: usize,
    pub max_string_len: usize,
    pub max_collection_len: usize,
    pub max_pattern_len: usize,
    pub max_regex_size: usize,
    pub max_duration: Duration,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_expression_len: 1000,
            max_depth: 32,
            max_steps: 10_000,
            max_string_len: 10_000,
            max_collection_len: 1000,
            max_pattern_len: 200,
            max_regex_size: 1 << 20,
            max_duration: Duration::from_millis(100),
        }
    }
}

/// Integral floats become JSON integers so `1 + 1 == 2` prints as `2`.
pub(crate) fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Truthiness: null, false, zero, and empty strings or collections are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

pub fn evaluate(
    expression: &str,
    bindings: &Bindings,
    limits: &SandboxLimits,
) -> Result<Value, SandboxError> {
    if expression.len() > limits.max_expression_len {
        return Err(SandboxError::Limit(format!(
            "expression longer than {} characters",
            limits.max_expression_len
        )));
    }
    let tokens = lexer::tokenize(expression)?;
    let ast = parser::Parser::new(tokens, limits.max_depth).parse()?;
    interp::Interpreter::new(bindings, limits).eval(&ast)
}

/// Evaluate and coerce to a boolean.
pub fn evaluate_bool(
    expression: &str,
    bindings: &Bindings,
    limits: &SandboxLimits,
) -> Result<bool, SandboxError> {
    evaluate(expression, bindings, limits).map(|v| truthy(&v))
}

/// Check that an expression parses, without evaluating it.
pub fn check_syntax(expression: &str, limits: &SandboxLimits) -> Result<(), SandboxError> {
    if expression.len() > limits.max_expression_len {
        return Err(SandboxError::Limit(format!(
            "expression longer than {} characters",
            limits.max_expression_len
        )));
    }
    let tokens = lexer::tokenize(expression)?;
    parser::Parser::new(tokens, limits.max_depth).parse()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env() -> Bindings {
        let mut b = Bindings::new();
        b.insert(
            "output".into(),
            json!({"status": "ok", "items": [1, 2, 3], "name": "Report"}),
        );
        b.insert("success".into(), json!(true));
        b.insert("error".into(), Value::Null);
        b.insert("retry_count".into(), json!(2));
        b
    }

    fn eval(s: &str) -> Result<Value, SandboxError> {
        evaluate(s, &env(), &SandboxLimits::default())
    }

    #[test]
    fn test_arithmetic_and_comparison() {
        assert_eq!(eval("1 + 2 * 3").unwrap(), json!(7));
        assert_eq!(eval("7 / 2").unwrap(), json!(3.5));
        assert_eq!(eval("-retry_count + 5").unwrap(), json!(3));
        assert_eq!(eval("retry_count >= 2").unwrap(), json!(true));
        assert_eq!(eval("2 == 2.0").unwrap(), json!(true));
        assert_eq!(eval("'abc' < 'abd'").unwrap(), json!(true));
    }

    #[test]
    fn test_field_access() {
        assert_eq!(eval("output.status == 'ok'").unwrap(), json!(true));
        assert_eq!(eval("output.items[1]").unwrap(), json!(2));
        assert_eq!(eval("output.items[-1]").unwrap(), json!(3));
        assert_eq!(eval("output.missing").unwrap(), Value::Null);
        assert_eq!(eval("output.items[10]").unwrap(), Value::Null);
        assert_eq!(eval("output['name']").unwrap(), json!("Report"));
    }

    #[test]
    fn test_boolean_logic_short_circuits() {
        assert_eq!(eval("success and error == null").unwrap(), json!(true));
        assert_eq!(eval("not success or retry_count > 1").unwrap(), json!(true));
        // rhs would fail with an unknown name if evaluated
        assert_eq!(eval("success || nope").unwrap(), json!(true));
        assert_eq!(eval("false && nope").unwrap(), json!(false));
    }

    #[test]
    fn test_functions() {
        assert_eq!(eval("len(output.items)").unwrap(), json!(3));
        assert_eq!(eval("contains(output.name, 'port')").unwrap(), json!(true));
        assert_eq!(eval("2 in output.items").unwrap(), json!(true));
        assert_eq!(eval("'status' in output").unwrap(), json!(true));
        assert_eq!(eval("lower(output.name)").unwrap(), json!("report"));
        assert_eq!(eval("starts_with(output.name, 'Re')").unwrap(), json!(true));
        assert_eq!(eval("matches(output.name, '^R.*t$')").unwrap(), json!(true));
        assert_eq!(eval("exists(error)").unwrap(), json!(false));
        assert_eq!(eval("'a' + 'b'").unwrap(), json!("ab"));
        assert_eq!(eval("[1] + [2]").unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_rejects_unknown_names_and_functions() {
        assert!(matches!(eval("secret"), Err(SandboxError::UnknownName(_))));
        assert!(matches!(
            eval("exec('rm -rf /')"),
            Err(SandboxError::UnknownFunction(_))
        ));
        assert!(matches!(eval("__import__('os')"), Err(SandboxError::UnknownFunction(_))));
    }

    #[test]
    fn test_type_errors() {
        assert!(matches!(eval("'a' - 1"), Err(SandboxError::Type(_))));
        assert!(matches!(eval("1 / 0"), Err(SandboxError::Type(_))));
        assert!(matches!(eval("len(1)"), Err(SandboxError::Type(_))));
        assert!(matches!(eval("len()"), Err(SandboxError::Type(_))));
    }

    #[test]
    fn test_limits() {
        let limits = SandboxLimits::default();
        let long = "1 + ".repeat(400) + "1";
        assert!(matches!(
            evaluate(&long, &env(), &limits),
            Err(SandboxError::Limit(_))
        ));

        let tight = SandboxLimits {
            max_steps: 5,
            ..SandboxLimits::default()
        };
        assert!(matches!(
            evaluate("1 + 1 + 1 + 1 + 1", &env(), &tight),
            Err(SandboxError::Limit(_))
        ));

        let small = SandboxLimits {
            max_string_len: 4,
            ..SandboxLimits::default()
        };
        assert!(matches!(
            evaluate("'abc' + 'def'", &env(), &small),
            Err(SandboxError::Limit(_))
        ));
    }

    #[test]
    fn test_truthiness() {
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&json!([])));
        assert!(!truthy(&Value::Null));
        assert!(truthy(&json!("x")));
        assert!(truthy(&json!({"a": 1})));
        assert!(evaluate_bool("output.items", &env(), &SandboxLimits::default()).unwrap());
    }

    #[test]
    fn test_check_syntax() {
        let limits = SandboxLimits::default();
        assert!(check_syntax("a and (b or c)", &limits).is_ok());
        assert!(check_syntax("a and (b or", &limits).is_err());
    }

    #[test]
    fn test_into_hive_error() {
        let err: HiveError = SandboxError::UnknownName("x".into()).into();
        assert!(matches!(err, HiveError::Expression(_)));
    }
}
