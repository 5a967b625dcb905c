use std::time::Instant;

use serde_json::Value;

use super::parser::{BinOp, Expr};
use super::{number, truthy, Bindings, SandboxError, SandboxLimits};

pub(crate) struct Interpreter<'a> {
    bindings: &'a Bindings,
    limits: &'a SandboxLimits,
    started: Instant,
    steps: usize,
    depth: usize,
}

impl<'a> Interpreter<'a> {
    pub(crate) fn new(bindings: &'a Bindings, limits: &'a SandboxLimits) -> Self {
        Self {
            bindings,
            limits,
            started: Instant::now(),
            steps: 0,
            depth: 0,
        }
    }

    fn tick(&mut self) -> Result<(), SandboxError> {
        self.steps += 1;
        if self.steps > self.limits.max_steps {
            return Err(SandboxError::Limit(format!(
                "more than {} evaluation steps",
                self.limits.max_steps
            )));
        }
        if self.started.elapsed() > self.limits.max_duration {
            return Err(SandboxError::Limit(format!(
                "exceeded {}ms",
                self.limits.max_duration.as_millis()
            )));
        }
        Ok(())
    }

    fn check_size(&self, value: Value) -> Result<Value, SandboxError> {
        match &value {
            Value::String(s) if s.len() > self.limits.max_string_len => Err(SandboxError::Limit(
                format!("string longer than {}", self.limits.max_string_len),
            )),
            Value::Array(a) if a.len() > self.limits.max_collection_len => Err(
                SandboxError::Limit(format!("list longer than {}", self.limits.max_collection_len)),
            ),
            _ => Ok(value),
        }
    }

    pub(crate) fn eval(&mut self, expr: &Expr) -> Result<Value, SandboxError> {
        self.tick()?;
        self.depth += 1;
        if self.depth > self.limits.max_depth {
            return Err(SandboxError::Limit(format!(
                "evaluation deeper than {}",
                self.limits.max_depth
            )));
        }
        let result = self.eval_inner(expr);
        self.depth -= 1;
        result
    }

    fn eval_inner(&mut self, expr: &Expr) -> Result<Value, SandboxError> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Name(name) => self
                .bindings
                .get(name)
                .cloned()
                .ok_or_else(|| SandboxError::UnknownName(name.clone())),
            Expr::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item)?);
                }
                self.check_size(Value::Array(out))
            }
            Expr::Member(target, field) => {
                let target = self.eval(target)?;
                Ok(target.get(field).cloned().unwrap_or(Value::Null))
            }
            Expr::Index(target, index) => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                Ok(index_value(&target, &index))
            }
            Expr::Call(name, args) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg)?);
                }
                self.call(name, values)
            }
            Expr::Not(inner) => Ok(Value::Bool(!truthy(&self.eval(inner)?))),
            Expr::Neg(inner) => {
                let v = self.eval(inner)?;
                let n = as_number(&v, "-")?;
                Ok(number(-n))
            }
            Expr::Binary(BinOp::And, lhs, rhs) => {
                if !truthy(&self.eval(lhs)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(truthy(&self.eval(rhs)?)))
            }
            Expr::Binary(BinOp::Or, lhs, rhs) => {
                if truthy(&self.eval(lhs)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(truthy(&self.eval(rhs)?)))
            }
            Expr::Binary(op, lhs, rhs) => {
                let l = self.eval(lhs)?;
                let r = self.eval(rhs)?;
                self.binary(*op, l, r)
            }
        }
    }

    fn binary(&self, op: BinOp, l: Value, r: Value) -> Result<Value, SandboxError> {
        match op {
            BinOp::Eq => Ok(Value::Bool(loose_eq(&l, &r))),
            BinOp::Ne => Ok(Value::Bool(!loose_eq(&l, &r))),
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let ord = compare(&l, &r)?;
                Ok(Value::Bool(match op {
                    BinOp::Lt => ord.is_lt(),
                    BinOp::Le => ord.is_le(),
                    BinOp::Gt => ord.is_gt(),
                    _ => ord.is_ge(),
                }))
            }
            BinOp::In => Ok(Value::Bool(contains(&r, &l)?)),
            BinOp::Add => match (l, r) {
                (Value::String(a), Value::String(b)) => self.check_size(Value::String(a + &b)),
                (Value::Array(mut a), Value::Array(b)) => {
                    a.extend(b);
                    self.check_size(Value::Array(a))
                }
                (a, b) => Ok(number(as_number(&a, "+")? + as_number(&b, "+")?)),
            },
            BinOp::Sub => Ok(number(as_number(&l, "-")? - as_number(&r, "-")?)),
            BinOp::Mul => Ok(number(as_number(&l, "*")? * as_number(&r, "*")?)),
            BinOp::Div | BinOp::Rem => {
                let a = as_number(&l, "/")?;
                let b = as_number(&r, "/")?;
                if b == 0.0 {
                    return Err(SandboxError::Type("division by zero".into()));
                }
                Ok(number(if op == BinOp::Div { a / b } else { a % b }))
            }
            BinOp::And => Ok(Value::Bool(truthy(&l) && truthy(&r))),
            BinOp::Or => Ok(Value::Bool(truthy(&l) || truthy(&r))),
        }
    }

    fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, SandboxError> {
        let arity = |n: usize| -> Result<(), SandboxError> {
            if args.len() != n {
                return Err(SandboxError::Type(format!(
                    "{}() takes {} argument(s), got {}",
                    name,
                    n,
                    args.len()
                )));
            }
            Ok(())
        };
        match name {
            "len" => {
                arity(1)?;
                match &args[0] {
                    Value::String(s) => Ok(Value::from(s.chars().count())),
                    Value::Array(a) => Ok(Value::from(a.len())),
                    Value::Object(o) => Ok(Value::from(o.len())),
                    Value::Null => Ok(Value::from(0)),
                    other => Err(SandboxError::Type(format!("len() of {}", type_name(other)))),
                }
            }
            "contains" => {
                arity(2)?;
                Ok(Value::Bool(contains(&args[0], &args[1])?))
            }
            "exists" => {
                arity(1)?;
                Ok(Value::Bool(!args[0].is_null()))
            }
            "lower" | "upper" => {
                arity(1)?;
                let s = as_str(&args[0], name)?;
                Ok(Value::String(if name == "lower" {
                    s.to_lowercase()
                } else {
                    s.to_uppercase()
                }))
            }
            "starts_with" | "ends_with" => {
                arity(2)?;
                let s = as_str(&args[0], name)?;
                let p = as_str(&args[1], name)?;
                Ok(Value::Bool(if name == "starts_with" {
                    s.starts_with(p)
                } else {
                    s.ends_with(p)
                }))
            }
            "matches" => {
                arity(2)?;
                let s = as_str(&args[0], name)?;
                let pattern = as_str(&args[1], name)?;
                if pattern.len() > self.limits.max_pattern_len {
                    return Err(SandboxError::Limit(format!(
                        "pattern longer than {}",
                        self.limits.max_pattern_len
                    )));
                }
                let re = regex::RegexBuilder::new(pattern)
                    .size_limit(self.limits.max_regex_size)
                    .build()
                    .map_err(|e| SandboxError::Type(format!("bad pattern: {}", e)))?;
                Ok(Value::Bool(re.is_match(s)))
            }
            other => Err(SandboxError::UnknownFunction(other.to_string())),
        }
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn as_number(v: &Value, op: &str) -> Result<f64, SandboxError> {
    v.as_f64()
        .ok_or_else(|| SandboxError::Type(format!("'{}' needs numbers, got {}", op, type_name(v))))
}

fn as_str<'v>(v: &'v Value, func: &str) -> Result<&'v str, SandboxError> {
    v.as_str()
        .ok_or_else(|| SandboxError::Type(format!("{}() needs a string, got {}", func, type_name(v))))
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Result<std::cmp::Ordering, SandboxError> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        _ => {
            let x = as_number(a, "compare")?;
            let y = as_number(b, "compare")?;
            x.partial_cmp(&y)
                .ok_or_else(|| SandboxError::Type("cannot compare NaN".into()))
        }
    }
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool, SandboxError> {
    match haystack {
        Value::String(s) => Ok(s.contains(as_str(needle, "contains")?)),
        Value::Array(items) => Ok(items.iter().any(|i| loose_eq(i, needle))),
        Value::Object(map) => Ok(map.contains_key(as_str(needle, "contains")?)),
        Value::Null => Ok(false),
        other => Err(SandboxError::Type(format!(
            "contains() on {}",
            type_name(other)
        ))),
    }
}

fn index_value(target: &Value, index: &Value) -> Value {
    match (target, index) {
        (Value::Array(items), idx) => match idx.as_f64() {
            Some(i) if i >= 0.0 => items.get(i as usize).cloned().unwrap_or(Value::Null),
            Some(i) => {
                let back = (-i) as usize;
                if back <= items.len() {
                    items[items.len() - back].clone()
                } else {
                    Value::Null
                }
            }
            None => Value::Null,
        },
        (Value::Object(map), Value::String(key)) => map.get(key).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}
