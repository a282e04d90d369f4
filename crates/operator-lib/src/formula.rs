//! Sizing formula evaluation
//!
//! Formulas are small arithmetic expressions over a single variable, `n`,
//! bound to the current node count. The grammar is fixed and sandboxed:
//! literals, `n`, arithmetic, comparisons, boolean connectives, a ternary
//! and a handful of numeric builtins. Nothing else is reachable.
//!
//! Integer arithmetic (`+ - * %`) stays integral and is overflow checked.
//! Division always produces a float, so `n / 2` is rejected as a final result
//! unless wrapped in `int()`, `floor()`, `ceil()` or `round()`.

use crate::error::FormulaError;

/// Name of the variable bound to the node count
pub const NODE_COUNT_VAR: &str = "n";

/// Longest formula accepted, in bytes
pub const MAX_FORMULA_LEN: usize = 1024;

/// Deepest nesting of parentheses, unary operators and ternaries
pub const MAX_NESTING: usize = 64;

/// Trait for formula evaluation implementations
pub trait FormulaEvaluator: Send + Sync {
    /// Evaluate `formula` with `n` bound to `node_count`
    fn evaluate(&self, formula: &str, node_count: i64) -> Result<i64, FormulaError>;
}

/// Default evaluator: compiles and evaluates the expression on every call
#[derive(Debug, Clone, Copy, Default)]
pub struct ExprEvaluator;

impl FormulaEvaluator for ExprEvaluator {
    fn evaluate(&self, formula: &str, node_count: i64) -> Result<i64, FormulaError> {
        Formula::compile(formula)?.eval(node_count)
    }
}

/// A compiled formula, reusable across node counts
#[derive(Debug, Clone)]
pub struct Formula {
    source: String,
    root: Expr,
}

impl Formula {
    /// Parse and validate a formula
    pub fn compile(source: &str) -> Result<Self, FormulaError> {
        let compile_err = |reason: String| FormulaError::Compile {
            formula: source.to_string(),
            reason,
        };

        let tokens = tokenize(source).map_err(compile_err)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let root = parser.parse_ternary().map_err(compile_err)?;
        if let Some(tok) = parser.peek() {
            return Err(compile_err(format!("unexpected trailing token {:?}", tok)));
        }

        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    /// Source text of the formula
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a node count, requiring an integer result
    pub fn eval(&self, node_count: i64) -> Result<i64, FormulaError> {
        let value = self
            .root
            .eval(node_count)
            .map_err(|reason| FormulaError::Runtime {
                formula: self.source.clone(),
                reason,
            })?;

        match value {
            Value::Int(v) => Ok(v),
            other => Err(FormulaError::NotInteger {
                formula: self.source.clone(),
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Pow,
    LParen,
    RParen,
    Comma,
    Question,
    Colon,
    Not,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    if src.len() > MAX_FORMULA_LEN {
        return Err(format!(
            "formula is {} bytes, longer than {}",
            src.len(),
            MAX_FORMULA_LEN
        ));
    }
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && next.map_or(false, |d| d.is_ascii_digit())) {
            let start = i;
            let mut is_float = false;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '_') {
                i += 1;
            }
            if i < chars.len() && chars[i] == '.' {
                is_float = true;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().filter(|c| **c != '_').collect();
            let token = if is_float {
                Token::Float(
                    text.parse::<f64>()
                        .map_err(|e| format!("bad number `{}`: {}", text, e))?,
                )
            } else {
                Token::Int(
                    text.parse::<i64>()
                        .map_err(|e| format!("bad number `{}`: {}", text, e))?,
                )
            };
            tokens.push(token);
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            tokens.push(match word.as_str() {
                "and" => Token::And,
                "or" => Token::Or,
                "not" => Token::Not,
                _ => Token::Ident(word),
            });
            continue;
        }

        let (token, width) = match (c, next) {
            ('*', Some('*')) => (Token::Pow, 2),
            ('=', Some('=')) => (Token::EqEq, 2),
            ('!', Some('=')) => (Token::NotEq, 2),
            ('<', Some('=')) => (Token::Le, 2),
            ('>', Some('=')) => (Token::Ge, 2),
            ('&', Some('&')) => (Token::And, 2),
            ('|', Some('|')) => (Token::Or, 2),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            ('^', _) => (Token::Pow, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            (',', _) => (Token::Comma, 1),
            ('?', _) => (Token::Question, 1),
            (':', _) => (Token::Colon, 1),
            ('!', _) => (Token::Not, 1),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            _ => return Err(format!("unexpected character `{}` at offset {}", c, i)),
        };
        tokens.push(token);
        i += width;
    }

    if tokens.is_empty() {
        return Err("empty formula".to_string());
    }
    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Builtin {
    Min,
    Max,
    Abs,
    Int,
    Ceil,
    Floor,
    Round,
}

impl Builtin {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "min" => Some(Builtin::Min),
            "max" => Some(Builtin::Max),
            "abs" => Some(Builtin::Abs),
            "int" => Some(Builtin::Int),
            "ceil" => Some(Builtin::Ceil),
            "floor" => Some(Builtin::Floor),
            "round" => Some(Builtin::Round),
            _ => None,
        }
    }

    fn accepts(&self, argc: usize) -> bool {
        match self {
            Builtin::Min | Builtin::Max => argc >= 1,
            _ => argc == 1,
        }
    }
}

#[derive(Debug, Clone)]
enum Expr {
    Int(i64),
    Float(f64),
    Bool(bool),
    NodeCount,
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(Builtin, Vec<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        match self.advance() {
            Some(tok) if tok == expected => Ok(()),
            Some(tok) => Err(format!("expected {:?}, found {:?}", expected, tok)),
            None => Err(format!("expected {:?}, found end of formula", expected)),
        }
    }

    // every recursive descent passes through here; the depth cap also bounds
    // the recursion of `Expr::eval`
    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, String>,
    ) -> Result<T, String> {
        if self.depth >= MAX_NESTING {
            return Err(format!("formula nested deeper than {}", MAX_NESTING));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn parse_ternary(&mut self) -> Result<Expr, String> {
        self.nested(Self::parse_conditional)
    }

    fn parse_conditional(&mut self) -> Result<Expr, String> {
        let cond = self.parse_or()?;
        if self.eat(&Token::Question) {
            let then = self.parse_ternary()?;
            self.expect(Token::Colon)?;
            let otherwise = self.parse_ternary()?;
            return Ok(Expr::Ternary(
                Box::new(cond),
                Box::new(then),
                Box::new(otherwise),
            ));
        }
        Ok(cond)
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Token::Or) {
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_comparison()?;
        while self.eat(&Token::And) {
            let rhs = self.parse_comparison()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinOp::Eq,
                Some(Token::NotEq) => BinOp::Ne,
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Mod,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        self.nested(Self::parse_prefixed)
    }

    fn parse_prefixed(&mut self) -> Result<Expr, String> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)))
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.parse_unary()
            }
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)))
            }
            _ => self.parse_power(),
        }
    }

    fn parse_power(&mut self) -> Result<Expr, String> {
        let base = self.parse_primary()?;
        if self.eat(&Token::Pow) {
            // right associative: 2 ** 3 ** 2 == 2 ** 9
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::Int(v)) => Ok(Expr::Int(v)),
            Some(Token::Float(v)) => Ok(Expr::Float(v)),
            Some(Token::LParen) => {
                let inner = self.parse_ternary()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => self.parse_identifier(name),
            Some(tok) => Err(format!("unexpected token {:?}", tok)),
            None => Err("unexpected end of formula".to_string()),
        }
    }

    fn parse_identifier(&mut self, name: String) -> Result<Expr, String> {
        match name.as_str() {
            NODE_COUNT_VAR => return Ok(Expr::NodeCount),
            "true" => return Ok(Expr::Bool(true)),
            "false" => return Ok(Expr::Bool(false)),
            _ => {}
        }

        let builtin =
            Builtin::lookup(&name).ok_or_else(|| format!("unknown identifier `{}`", name))?;
        self.expect(Token::LParen)?;

        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                args.push(self.parse_ternary()?);
                if self.eat(&Token::RParen) {
                    break;
                }
                self.expect(Token::Comma)?;
            }
        }

        if !builtin.accepts(args.len()) {
            return Err(format!(
                "{}() does not accept {} argument(s)",
                name,
                args.len()
            ));
        }
        Ok(Expr::Call(builtin, args))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
        }
    }
}

impl Value {
    fn as_f64(&self) -> Result<f64, String> {
        match self {
            Value::Int(v) => Ok(*v as f64),
            Value::Float(v) => Ok(*v),
            Value::Bool(_) => Err("expected a number, found a boolean".to_string()),
        }
    }

    fn as_bool(&self) -> Result<bool, String> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(format!("expected a boolean, found {}", other)),
        }
    }
}

fn float_to_int(v: f64) -> Result<i64, String> {
    if v.is_finite() && v >= i64::MIN as f64 && v < i64::MAX as f64 {
        Ok(v as i64)
    } else {
        Err(format!("{} is out of integer range", v))
    }
}

fn overflow(op: &str) -> String {
    format!("integer overflow in {}", op)
}

impl Expr {
    fn eval(&self, n: i64) -> Result<Value, String> {
        match self {
            Expr::Int(v) => Ok(Value::Int(*v)),
            Expr::Float(v) => Ok(Value::Float(*v)),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::NodeCount => Ok(Value::Int(n)),
            Expr::Unary(op, inner) => {
                let v = inner.eval(n)?;
                match (op, v) {
                    (UnaryOp::Neg, Value::Int(i)) => {
                        i.checked_neg().map(Value::Int).ok_or_else(|| overflow("negation"))
                    }
                    (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
                    (UnaryOp::Not, v) => Ok(Value::Bool(!v.as_bool()?)),
                    (UnaryOp::Neg, Value::Bool(_)) => Err("cannot negate a boolean".to_string()),
                }
            }
            Expr::Binary(BinOp::And, lhs, rhs) => {
                if !lhs.eval(n)?.as_bool()? {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(rhs.eval(n)?.as_bool()?))
            }
            Expr::Binary(BinOp::Or, lhs, rhs) => {
                if lhs.eval(n)?.as_bool()? {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(rhs.eval(n)?.as_bool()?))
            }
            Expr::Binary(op, lhs, rhs) => binary(*op, lhs.eval(n)?, rhs.eval(n)?),
            Expr::Ternary(cond, then, otherwise) => {
                if cond.eval(n)?.as_bool()? {
                    then.eval(n)
                } else {
                    otherwise.eval(n)
                }
            }
            Expr::Call(builtin, args) => {
                let values = args
                    .iter()
                    .map(|a| a.eval(n))
                    .collect::<Result<Vec<_>, _>>()?;
                call(*builtin, &values)
            }
        }
    }
}

fn binary(op: BinOp, lhs: Value, rhs: Value) -> Result<Value, String> {
    use Value::{Bool, Float, Int};

    match op {
        BinOp::Add | BinOp::Sub | BinOp::Mul => match (lhs, rhs) {
            (Int(a), Int(b)) => {
                let result = match op {
                    BinOp::Add => a.checked_add(b),
                    BinOp::Sub => a.checked_sub(b),
                    _ => a.checked_mul(b),
                };
                result.map(Int).ok_or_else(|| overflow("arithmetic"))
            }
            _ => {
                let (a, b) = (lhs.as_f64()?, rhs.as_f64()?);
                Ok(Float(match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    _ => a * b,
                }))
            }
        },
        BinOp::Div => {
            let (a, b) = (lhs.as_f64()?, rhs.as_f64()?);
            if b == 0.0 {
                return Err("division by zero".to_string());
            }
            Ok(Float(a / b))
        }
        BinOp::Mod => match (lhs, rhs) {
            (Int(_), Int(0)) => Err("modulo by zero".to_string()),
            (Int(a), Int(b)) => a.checked_rem(b).map(Int).ok_or_else(|| overflow("modulo")),
            _ => Err("modulo requires integer operands".to_string()),
        },
        BinOp::Pow => match (lhs, rhs) {
            (Int(a), Int(b)) if b >= 0 => {
                let exp = u32::try_from(b).map_err(|_| overflow("power"))?;
                a.checked_pow(exp).map(Int).ok_or_else(|| overflow("power"))
            }
            _ => Ok(Float(lhs.as_f64()?.powf(rhs.as_f64()?))),
        },
        BinOp::Eq | BinOp::Ne => {
            let equal = match (lhs, rhs) {
                (Bool(a), Bool(b)) => a == b,
                (Int(a), Int(b)) => a == b,
                (Bool(_), _) | (_, Bool(_)) => {
                    return Err("cannot compare a boolean with a number".to_string())
                }
                _ => lhs.as_f64()? == rhs.as_f64()?,
            };
            Ok(Bool(if op == BinOp::Eq { equal } else { !equal }))
        }
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = match (lhs, rhs) {
                (Int(a), Int(b)) => a.cmp(&b),
                _ => lhs
                    .as_f64()?
                    .partial_cmp(&rhs.as_f64()?)
                    .ok_or_else(|| "comparison with NaN".to_string())?,
            };
            Ok(Bool(match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        BinOp::And | BinOp::Or => Ok(Bool(if op == BinOp::And {
            lhs.as_bool()? && rhs.as_bool()?
        } else {
            lhs.as_bool()? || rhs.as_bool()?
        })),
    }
}

fn call(builtin: Builtin, args: &[Value]) -> Result<Value, String> {
    match builtin {
        Builtin::Min | Builtin::Max => {
            let pick_max = builtin == Builtin::Max;
            if args.iter().all(|v| matches!(v, Value::Int(_))) {
                let ints = args.iter().filter_map(|v| match v {
                    Value::Int(i) => Some(*i),
                    _ => None,
                });
                let picked = if pick_max { ints.max() } else { ints.min() };
                return picked
                    .map(Value::Int)
                    .ok_or_else(|| "min/max require at least one argument".to_string());
            }
            let mut acc = args[0].as_f64()?;
            for v in &args[1..] {
                let f = v.as_f64()?;
                acc = if pick_max { acc.max(f) } else { acc.min(f) };
            }
            Ok(Value::Float(acc))
        }
        Builtin::Abs => match args[0] {
            Value::Int(i) => i.checked_abs().map(Value::Int).ok_or_else(|| overflow("abs")),
            v => Ok(Value::Float(v.as_f64()?.abs())),
        },
        Builtin::Int | Builtin::Ceil | Builtin::Floor | Builtin::Round => match args[0] {
            Value::Int(i) => Ok(Value::Int(i)),
            v => {
                let f = v.as_f64()?;
                let rounded = match builtin {
                    Builtin::Ceil => f.ceil(),
                    Builtin::Floor => f.floor(),
                    Builtin::Round => f.round(),
                    _ => f.trunc(),
                };
                float_to_int(rounded).map(Value::Int)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(formula: &str, n: i64) -> Result<i64, FormulaError> {
        ExprEvaluator.evaluate(formula, n)
    }

    #[test]
    fn test_linear_formulas() {
        assert_eq!(eval("n*2", 3), Ok(6));
        assert_eq!(eval("n*100", 5), Ok(500));
        assert_eq!(eval("n * 64", 2), Ok(128));
        assert_eq!(eval("100 + n * 10", 4), Ok(140));
        assert_eq!(eval("250", 7), Ok(250));
    }

    #[test]
    fn test_operator_precedence() {
        assert_eq!(eval("2 + 3 * n", 4), Ok(14));
        assert_eq!(eval("(2 + 3) * n", 4), Ok(20));
        assert_eq!(eval("-n + 10", 3), Ok(7));
        assert_eq!(eval("2 ** 3 ** 2", 0), Ok(512));
        assert_eq!(eval("n ^ 2", 5), Ok(25));
        assert_eq!(eval("n % 3", 10), Ok(1));
    }

    #[test]
    fn test_ternary_and_comparisons() {
        let formula = "n > 10 ? 500 : 200";
        assert_eq!(eval(formula, 3), Ok(200));
        assert_eq!(eval(formula, 11), Ok(500));
        assert_eq!(eval("n >= 3 && n <= 5 ? 1 : 2", 4), Ok(1));
        assert_eq!(eval("n == 1 or n == 2 ? 10 : 20", 2), Ok(10));
        assert_eq!(eval("not (n < 3) ? 1 : 0", 2), Ok(0));
    }

    #[test]
    fn test_builtins() {
        assert_eq!(eval("max(100, n * 10)", 3), Ok(100));
        assert_eq!(eval("max(100, n * 10)", 30), Ok(300));
        assert_eq!(eval("min(n, 4, 9)", 7), Ok(4));
        assert_eq!(eval("int(n / 2)", 5), Ok(2));
        assert_eq!(eval("ceil(n / 2)", 5), Ok(3));
        assert_eq!(eval("floor(n * 1.5)", 3), Ok(4));
        assert_eq!(eval("round(n * 1.5)", 3), Ok(5));
        assert_eq!(eval("abs(2 - n)", 10), Ok(8));
    }

    #[test]
    fn test_division_result_is_not_an_integer() {
        assert!(matches!(
            eval("n / 2", 4),
            Err(FormulaError::NotInteger { .. })
        ));
        assert!(matches!(
            eval("n * 1.5", 2),
            Err(FormulaError::NotInteger { .. })
        ));
        assert!(matches!(
            eval("n > 2", 4),
            Err(FormulaError::NotInteger { .. })
        ));
    }

    #[test]
    fn test_runtime_errors() {
        assert!(matches!(eval("n / 0", 4), Err(FormulaError::Runtime { .. })));
        assert!(matches!(eval("n % 0", 4), Err(FormulaError::Runtime { .. })));
        assert!(matches!(
            eval("n * 9223372036854775807", 2),
            Err(FormulaError::Runtime { .. })
        ));
        assert!(matches!(eval("n && true", 1), Err(FormulaError::Runtime { .. })));
    }

    #[test]
    fn test_compile_errors() {
        for bad in ["", "n *", "m * 2", "(n + 1", "n $ 2", "max()", "abs(1, 2)", "n 2"] {
            assert!(
                matches!(eval(bad, 1), Err(FormulaError::Compile { .. })),
                "expected compile error for {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_deep_nesting_is_a_compile_error() {
        let evaluator = ExprEvaluator;
        let parens = format!("{}n{}", "(".repeat(10_000), ")".repeat(10_000));
        let negations = format!("{}n", "-".repeat(5_000));
        let within_length = format!("{}n{}", "(".repeat(200), ")".repeat(200));

        for formula in [parens, negations, within_length] {
            assert!(matches!(
                evaluator.evaluate(&formula, 3),
                Err(FormulaError::Compile { .. })
            ));
        }
    }

    #[test]
    fn test_nesting_within_limit_evaluates() {
        let depth = MAX_NESTING / 2 - 1;
        let formula = format!("{}n{}", "(".repeat(depth), ")".repeat(depth));
        assert_eq!(eval(&formula, 7), Ok(7));
        assert_eq!(eval("--n", 4), Ok(4));
    }

    #[test]
    fn test_long_flat_formula_is_rejected() {
        let formula = vec!["n"; MAX_FORMULA_LEN].join("+");
        assert!(matches!(
            eval(&formula, 1),
            Err(FormulaError::Compile { .. })
        ));
        assert_eq!(eval(&vec!["n"; 100].join("+"), 2), Ok(200));
    }

    #[test]
    fn test_evaluation_is_pure() {
        let evaluator = ExprEvaluator;
        let formulas = ["n*2", "max(50, n*25)", "n > 4 ? n*10 : 40", "n / 0"];

        for formula in formulas {
            for n in 0..20 {
                assert_eq!(
                    evaluator.evaluate(formula, n),
                    evaluator.evaluate(formula, n)
                );
            }
        }
    }

    #[test]
    fn test_compiled_formula_reuse() {
        let formula = Formula::compile("n * 128").unwrap();
        assert_eq!(formula.source(), "n * 128");
        assert_eq!(formula.eval(1), Ok(128));
        assert_eq!(formula.eval(3), Ok(384));
    }
}
