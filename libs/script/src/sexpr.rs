//! Functional dialect: a pure S-expression evaluator
//!
//! The dialect is pure by construction: every builtin is a function of its
//! arguments, there is no I/O surface, and evaluation cannot mutate anything
//! outside its own environment. Truthiness follows the dialect convention:
//! every value except literal `false` is truthy (including `nil`).

use std::collections::BTreeMap;

use argyll_domain::{Args, Dialect, Value};

use crate::ScriptError;

// =============================================================================
// AST
// =============================================================================

/// Parsed S-expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Self-evaluating literal
    Literal(Value),

    /// Symbol resolved against the environment at evaluation time
    Symbol(String),

    /// Function application or special form
    List(Vec<Expr>),
}

// =============================================================================
// Parser
// =============================================================================

fn compile_err(message: impl Into<String>) -> ScriptError {
    ScriptError::Compile {
        dialect: Dialect::Sexpr,
        message: message.into(),
    }
}

fn runtime_err(message: impl Into<String>) -> ScriptError {
    ScriptError::Runtime {
        dialect: Dialect::Sexpr,
        message: message.into(),
    }
}

#[derive(Debug, PartialEq)]
enum Token {
    Open,
    Close,
    Atom(String),
    Str(String),
}

fn tokenize(source: &str) -> Result<Vec<Token>, ScriptError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ';' => {
                // Comment to end of line
                for next in chars.by_ref() {
                    if next == '\n' {
                        break;
                    }
                }
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '"' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => text.push('\n'),
                            Some('t') => text.push('\t'),
                            Some(other) => text.push(other),
                            None => return Err(compile_err("unterminated string escape")),
                        },
                        Some(other) => text.push(other),
                        None => return Err(compile_err("unterminated string literal")),
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            _ => {
                let mut atom = String::new();
                while let Some(&next) = chars.peek() {
                    if next.is_whitespace() || next == '(' || next == ')' || next == ';' {
                        break;
                    }
                    atom.push(next);
                    chars.next();
                }
                tokens.push(Token::Atom(atom));
            }
        }
    }

    Ok(tokens)
}

fn parse_expr(tokens: &[Token], pos: &mut usize) -> Result<Expr, ScriptError> {
    match tokens.get(*pos) {
        None => Err(compile_err("unexpected end of input")),
        Some(Token::Close) => Err(compile_err("unexpected ')'")),
        Some(Token::Str(text)) => {
            *pos += 1;
            Ok(Expr::Literal(Value::Str(text.clone())))
        }
        Some(Token::Atom(atom)) => {
            *pos += 1;
            Ok(parse_atom(atom))
        }
        Some(Token::Open) => {
            *pos += 1;
            let mut items = Vec::new();
            loop {
                match tokens.get(*pos) {
                    Some(Token::Close) => {
                        *pos += 1;
                        return Ok(Expr::List(items));
                    }
                    Some(_) => items.push(parse_expr(tokens, pos)?),
                    None => return Err(compile_err("missing ')'")),
                }
            }
        }
    }
}

fn parse_atom(atom: &str) -> Expr {
    match atom {
        "true" => Expr::Literal(Value::Bool(true)),
        "false" => Expr::Literal(Value::Bool(false)),
        "nil" => Expr::Literal(Value::Null),
        _ => {
            if let Ok(i) = atom.parse::<i64>() {
                Expr::Literal(Value::Int(i))
            } else if let Ok(x) = atom.parse::<f64>() {
                Expr::Literal(Value::Float(x))
            } else {
                Expr::Symbol(atom.to_string())
            }
        }
    }
}

/// Parse a source into a single expression
pub fn parse(source: &str) -> Result<Expr, ScriptError> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(compile_err("empty script"));
    }
    let mut pos = 0;
    let expr = parse_expr(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(compile_err("trailing tokens after expression"));
    }
    Ok(expr)
}

// =============================================================================
// Evaluator
// =============================================================================

struct Env<'a> {
    vars: BTreeMap<String, Value>,
    parent: Option<&'a Env<'a>>,
}

impl Env<'_> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.vars
            .get(name)
            .or_else(|| self.parent.and_then(|p| p.lookup(name)))
    }
}

fn is_truthy(value: &Value) -> bool {
    !matches!(value, Value::Bool(false))
}

/// Evaluate a parsed expression with the given argument bindings
pub fn eval(expr: &Expr, args: &Args) -> Result<Value, ScriptError> {
    let env = Env {
        vars: args.clone(),
        parent: None,
    };
    eval_in(expr, &env)
}

fn eval_in(expr: &Expr, env: &Env<'_>) -> Result<Value, ScriptError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Symbol(name) => env
            .lookup(name)
            .cloned()
            .ok_or_else(|| runtime_err(format!("unbound symbol '{name}'"))),
        Expr::List(items) => {
            let Some((head, rest)) = items.split_first() else {
                return Ok(Value::Null);
            };
            let Expr::Symbol(op) = head else {
                return Err(runtime_err("expression head must be a symbol"));
            };
            match op.as_str() {
                "if" => eval_if(rest, env),
                "let" => eval_let(rest, env),
                "and" => eval_and(rest, env),
                "or" => eval_or(rest, env),
                _ => {
                    let evaluated: Vec<Value> = rest
                        .iter()
                        .map(|e| eval_in(e, env))
                        .collect::<Result<_, _>>()?;
                    apply(op, &evaluated)
                }
            }
        }
    }
}

fn eval_if(rest: &[Expr], env: &Env<'_>) -> Result<Value, ScriptError> {
    match rest {
        [cond, then] => {
            if is_truthy(&eval_in(cond, env)?) {
                eval_in(then, env)
            } else {
                Ok(Value::Null)
            }
        }
        [cond, then, otherwise] => {
            if is_truthy(&eval_in(cond, env)?) {
                eval_in(then, env)
            } else {
                eval_in(otherwise, env)
            }
        }
        _ => Err(runtime_err("if expects (if cond then [else])")),
    }
}

fn eval_let(rest: &[Expr], env: &Env<'_>) -> Result<Value, ScriptError> {
    let [Expr::List(bindings), body] = rest else {
        return Err(runtime_err("let expects (let ((name expr)...) body)"));
    };

    let mut vars = BTreeMap::new();
    for binding in bindings {
        let Expr::List(pair) = binding else {
            return Err(runtime_err("let binding must be (name expr)"));
        };
        let [Expr::Symbol(name), value_expr] = pair.as_slice() else {
            return Err(runtime_err("let binding must be (name expr)"));
        };
        let scope = Env {
            vars: vars.clone(),
            parent: Some(env),
        };
        let value = eval_in(value_expr, &scope)?;
        vars.insert(name.clone(), value);
    }

    let scope = Env {
        vars,
        parent: Some(env),
    };
    eval_in(body, &scope)
}

fn eval_and(rest: &[Expr], env: &Env<'_>) -> Result<Value, ScriptError> {
    let mut last = Value::Bool(true);
    for expr in rest {
        last = eval_in(expr, env)?;
        if !is_truthy(&last) {
            return Ok(last);
        }
    }
    Ok(last)
}

fn eval_or(rest: &[Expr], env: &Env<'_>) -> Result<Value, ScriptError> {
    for expr in rest {
        let value = eval_in(expr, env)?;
        if is_truthy(&value) {
            return Ok(value);
        }
    }
    Ok(Value::Bool(false))
}

// =============================================================================
// Builtins
// =============================================================================

fn apply(op: &str, args: &[Value]) -> Result<Value, ScriptError> {
    match op {
        "+" | "-" | "*" | "/" | "mod" => numeric(op, args),
        "=" => Ok(Value::Bool(args.windows(2).all(|w| w[0] == w[1]))),
        "!=" => Ok(Value::Bool(args.windows(2).all(|w| w[0] != w[1]))),
        "<" | "<=" | ">" | ">=" => compare(op, args),
        "not" => match args {
            [value] => Ok(Value::Bool(!is_truthy(value))),
            _ => Err(runtime_err("not expects one argument")),
        },
        "str" => {
            let joined = args.iter().map(ToString::to_string).collect::<String>();
            Ok(Value::Str(joined))
        }
        "upper" => string_fn(op, args, |s| s.to_uppercase()),
        "lower" => string_fn(op, args, |s| s.to_lowercase()),
        "contains" => contains(args),
        "list" => Ok(Value::Seq(args.to_vec())),
        "len" => match args {
            [Value::Seq(items)] => Ok(Value::Int(items.len() as i64)),
            [Value::Str(s)] => Ok(Value::Int(s.chars().count() as i64)),
            [Value::Map(entries)] => Ok(Value::Int(entries.len() as i64)),
            _ => Err(runtime_err("len expects a list, string, or map")),
        },
        "nth" => match args {
            [Value::Seq(items), Value::Int(index)] => Ok(usize::try_from(*index)
                .ok()
                .and_then(|i| items.get(i))
                .cloned()
                .unwrap_or(Value::Null)),
            _ => Err(runtime_err("nth expects (nth list index)")),
        },
        "first" => match args {
            [Value::Seq(items)] => Ok(items.first().cloned().unwrap_or(Value::Null)),
            _ => Err(runtime_err("first expects a list")),
        },
        "rest" => match args {
            [Value::Seq(items)] => Ok(Value::Seq(items.iter().skip(1).cloned().collect())),
            _ => Err(runtime_err("rest expects a list")),
        },
        "dict" => {
            if args.len() % 2 != 0 {
                return Err(runtime_err("dict expects an even number of arguments"));
            }
            let mut entries = BTreeMap::new();
            for pair in args.chunks(2) {
                let Value::Str(key) = &pair[0] else {
                    return Err(runtime_err("dict keys must be strings"));
                };
                entries.insert(key.clone(), pair[1].clone());
            }
            Ok(Value::Map(entries))
        }
        "get" => match args {
            [Value::Map(entries), Value::Str(key)] => {
                Ok(entries.get(key).cloned().unwrap_or(Value::Null))
            }
            _ => Err(runtime_err("get expects (get map key)")),
        },
        "assoc" => match args {
            [Value::Map(entries), Value::Str(key), value] => {
                let mut next = entries.clone();
                next.insert(key.clone(), value.clone());
                Ok(Value::Map(next))
            }
            _ => Err(runtime_err("assoc expects (assoc map key value)")),
        },
        "keys" => match args {
            [Value::Map(entries)] => Ok(Value::Seq(
                entries.keys().map(|k| Value::Str(k.clone())).collect(),
            )),
            _ => Err(runtime_err("keys expects a map")),
        },
        "nil?" => unary_predicate(args, |v| matches!(v, Value::Null)),
        "number?" => unary_predicate(args, |v| matches!(v, Value::Int(_) | Value::Float(_))),
        "string?" => unary_predicate(args, |v| matches!(v, Value::Str(_))),
        "bool?" => unary_predicate(args, |v| matches!(v, Value::Bool(_))),
        "list?" => unary_predicate(args, |v| matches!(v, Value::Seq(_))),
        "map?" => unary_predicate(args, |v| matches!(v, Value::Map(_))),
        _ => Err(runtime_err(format!("unknown function '{op}'"))),
    }
}

fn unary_predicate(args: &[Value], test: fn(&Value) -> bool) -> Result<Value, ScriptError> {
    match args {
        [value] => Ok(Value::Bool(test(value))),
        _ => Err(runtime_err("predicate expects one argument")),
    }
}

fn string_fn(
    op: &str,
    args: &[Value],
    f: impl Fn(&str) -> String,
) -> Result<Value, ScriptError> {
    match args {
        [Value::Str(s)] => Ok(Value::Str(f(s))),
        _ => Err(runtime_err(format!("{op} expects a string"))),
    }
}

fn contains(args: &[Value]) -> Result<Value, ScriptError> {
    match args {
        [Value::Str(haystack), Value::Str(needle)] => Ok(Value::Bool(haystack.contains(needle))),
        [Value::Seq(items), needle] => Ok(Value::Bool(items.contains(needle))),
        [Value::Map(entries), Value::Str(key)] => Ok(Value::Bool(entries.contains_key(key))),
        _ => Err(runtime_err("contains expects (contains coll item)")),
    }
}

#[derive(Clone, Copy)]
enum Number {
    Int(i64),
    Float(f64),
}

fn as_number(value: &Value) -> Result<Number, ScriptError> {
    match value {
        Value::Int(i) => Ok(Number::Int(*i)),
        Value::Float(x) => Ok(Number::Float(*x)),
        other => Err(runtime_err(format!(
            "expected number, found {}",
            other.type_name()
        ))),
    }
}

fn numeric(op: &str, args: &[Value]) -> Result<Value, ScriptError> {
    let numbers: Vec<Number> = args.iter().map(as_number).collect::<Result<_, _>>()?;
    let Some((&first, rest)) = numbers.split_first() else {
        return Err(runtime_err(format!("{op} expects at least one argument")));
    };

    // Unary minus negates
    if op == "-" && rest.is_empty() {
        return Ok(match first {
            Number::Int(i) => Value::Int(-i),
            Number::Float(x) => Value::Float(-x),
        });
    }

    let mut acc = first;
    for &next in rest {
        acc = combine(op, acc, next)?;
    }
    Ok(match acc {
        Number::Int(i) => Value::Int(i),
        Number::Float(x) => Value::Float(x),
    })
}

fn combine(op: &str, left: Number, right: Number) -> Result<Number, ScriptError> {
    if let (Number::Int(a), Number::Int(b)) = (left, right) {
        return match op {
            "+" => Ok(Number::Int(a.wrapping_add(b))),
            "-" => Ok(Number::Int(a.wrapping_sub(b))),
            "*" => Ok(Number::Int(a.wrapping_mul(b))),
            "/" => {
                if b == 0 {
                    Err(runtime_err("division by zero"))
                } else {
                    Ok(Number::Int(a / b))
                }
            }
            "mod" => {
                if b == 0 {
                    Err(runtime_err("division by zero"))
                } else {
                    Ok(Number::Int(a % b))
                }
            }
            _ => Err(runtime_err(format!("unknown operator '{op}'"))),
        };
    }

    let a = match left {
        Number::Int(i) => i as f64,
        Number::Float(x) => x,
    };
    let b = match right {
        Number::Int(i) => i as f64,
        Number::Float(x) => x,
    };
    match op {
        "+" => Ok(Number::Float(a + b)),
        "-" => Ok(Number::Float(a - b)),
        "*" => Ok(Number::Float(a * b)),
        "/" => Ok(Number::Float(a / b)),
        "mod" => Ok(Number::Float(a % b)),
        _ => Err(runtime_err(format!("unknown operator '{op}'"))),
    }
}

fn compare(op: &str, args: &[Value]) -> Result<Value, ScriptError> {
    let ok = args
        .windows(2)
        .map(|w| {
            let a = as_number(&w[0])?;
            let b = as_number(&w[1])?;
            let (a, b) = match (a, b) {
                (Number::Int(x), Number::Int(y)) => (x as f64, y as f64),
                (Number::Int(x), Number::Float(y)) => (x as f64, y),
                (Number::Float(x), Number::Int(y)) => (x, y as f64),
                (Number::Float(x), Number::Float(y)) => (x, y),
            };
            Ok(match op {
                "<" => a < b,
                "<=" => a <= b,
                ">" => a > b,
                ">=" => a >= b,
                _ => false,
            })
        })
        .collect::<Result<Vec<bool>, ScriptError>>()?;
    Ok(Value::Bool(ok.iter().all(|&b| b)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str, args: &Args) -> Value {
        eval(&parse(source).unwrap(), args).unwrap()
    }

    fn no_args() -> Args {
        Args::new()
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(run("(+ 1 2 3)", &no_args()), Value::Int(6));
        assert_eq!(run("(- 10 4)", &no_args()), Value::Int(6));
        assert_eq!(run("(* 2 3.5)", &no_args()), Value::Float(7.0));
        assert_eq!(run("(- 5)", &no_args()), Value::Int(-5));
    }

    #[test]
    fn test_symbols_resolve_against_args() {
        let args: Args = [("price".to_string(), Value::Int(100))].into_iter().collect();
        assert_eq!(run("(* price 2)", &args), Value::Int(200));
    }

    #[test]
    fn test_unbound_symbol_errors() {
        let result = eval(&parse("(+ missing 1)").unwrap(), &Args::new());
        assert!(matches!(result, Err(ScriptError::Runtime { .. })));
    }

    #[test]
    fn test_if_and_truthiness() {
        assert_eq!(run(r#"(if true "yes" "no")"#, &no_args()), Value::Str("yes".into()));
        assert_eq!(run(r#"(if false "yes" "no")"#, &no_args()), Value::Str("no".into()));
        // nil is truthy in this dialect
        assert_eq!(run(r#"(if nil "yes" "no")"#, &no_args()), Value::Str("yes".into()));
    }

    #[test]
    fn test_let_bindings_shadow() {
        let args: Args = [("x".to_string(), Value::Int(1))].into_iter().collect();
        assert_eq!(run("(let ((x 10) (y (+ x 1))) (+ x y))", &args), Value::Int(21));
    }

    #[test]
    fn test_and_or_short_circuit() {
        assert_eq!(run("(and 1 2 3)", &no_args()), Value::Int(3));
        assert_eq!(run("(and 1 false 3)", &no_args()), Value::Bool(false));
        assert_eq!(run("(or false 7)", &no_args()), Value::Int(7));
        assert_eq!(run("(or false false)", &no_args()), Value::Bool(false));
    }

    #[test]
    fn test_collections() {
        assert_eq!(run("(len (list 1 2 3))", &no_args()), Value::Int(3));
        assert_eq!(run("(nth (list 1 2 3) 1)", &no_args()), Value::Int(2));
        assert_eq!(
            run(r#"(get (dict "a" 1 "b" 2) "b")"#, &no_args()),
            Value::Int(2)
        );
        assert_eq!(
            run(r#"(contains (list 1 2) 2)"#, &no_args()),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_dict_builds_output_maps() {
        let args: Args = [("total".to_string(), Value::Int(5))].into_iter().collect();
        let result = run(r#"(dict "doubled" (* total 2) "ok" true)"#, &args);
        let Value::Map(entries) = result else {
            panic!("expected map");
        };
        assert_eq!(entries.get("doubled"), Some(&Value::Int(10)));
        assert_eq!(entries.get("ok"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse("(+ 1 2"), Err(ScriptError::Compile { .. })));
        assert!(matches!(parse(")"), Err(ScriptError::Compile { .. })));
        assert!(matches!(parse(""), Err(ScriptError::Compile { .. })));
        assert!(matches!(parse("1 2"), Err(ScriptError::Compile { .. })));
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(run("; doubles\n(+ 2 2)", &no_args()), Value::Int(4));
    }

    #[test]
    fn test_comparison_chains() {
        assert_eq!(run("(< 1 2 3)", &no_args()), Value::Bool(true));
        assert_eq!(run("(< 1 3 2)", &no_args()), Value::Bool(false));
        assert_eq!(run("(= 2 2 2)", &no_args()), Value::Bool(true));
    }
}
