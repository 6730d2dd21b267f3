use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

/// Errors surfaced while compiling or evaluating a step-gate expression
/// (SPEC_FULL.md §4.E). Syntax errors are caught at `compile` time; type and
/// unknown-identifier errors can only be caught once the variable bindings
/// for a specific evaluation are known, so they surface from `eval`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PredicateError {
    #[error("syntax error at position {0}: {1}")]
    Syntax(usize, String),

    #[error("type error: {0}")]
    Type(String),

    #[error("unknown identifier: {0}")]
    UnknownIdentifier(String),
}

/// A value bound to an identifier during evaluation. The grammar only ever
/// produces and consumes these two kinds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i64),
    Bool(bool),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// The fixed set of identifiers a step-gate expression may reference
/// (SPEC_FULL.md §4.E). The runner builds one of these per evaluation from
/// the current item/run state; there is no dynamic variable lookup.
#[derive(Debug, Clone, Default)]
pub struct Bindings(HashMap<&'static str, Value>);

impl Bindings {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn with(mut self, name: &'static str, value: Value) -> Self {
        self.0.insert(name, value);
        self
    }

    fn get(&self, name: &str) -> Option<Value> {
        self.0.get(name).copied()
    }
}

const KNOWN_IDENTIFIERS: &[&str] = &[
    "cycle",
    "active_ticket_count",
    "new_ticket_count",
    "qa_exit_code",
    "fix_exit_code",
    "retest_exit_code",
    "qa_failed",
    "fix_required",
];

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    True,
    False,
    And,
    Or,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
    Eof,
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self { src: src.as_bytes(), pos: 0 }
    }

    fn peek_byte(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek_byte(), Some(b) if b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn tokenize(mut self) -> Result<Vec<(usize, Token)>, PredicateError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace();
            let start = self.pos;
            let Some(b) = self.peek_byte() else {
                tokens.push((start, Token::Eof));
                break;
            };

            match b {
                b'(' => {
                    self.pos += 1;
                    tokens.push((start, Token::LParen));
                }
                b')' => {
                    self.pos += 1;
                    tokens.push((start, Token::RParen));
                }
                b'&' => {
                    self.expect_seq(b"&&", start)?;
                    tokens.push((start, Token::And));
                }
                b'|' => {
                    self.expect_seq(b"||", start)?;
                    tokens.push((start, Token::Or));
                }
                b'!' => {
                    self.pos += 1;
                    if self.peek_byte() == Some(b'=') {
                        self.pos += 1;
                        tokens.push((start, Token::Ne));
                    } else {
                        tokens.push((start, Token::Not));
                    }
                }
                b'=' => {
                    self.expect_seq(b"==", start)?;
                    tokens.push((start, Token::Eq));
                }
                b'<' => {
                    self.pos += 1;
                    if self.peek_byte() == Some(b'=') {
                        self.pos += 1;
                        tokens.push((start, Token::Le));
                    } else {
                        tokens.push((start, Token::Lt));
                    }
                }
                b'>' => {
                    self.pos += 1;
                    if self.peek_byte() == Some(b'=') {
                        self.pos += 1;
                        tokens.push((start, Token::Ge));
                    } else {
                        tokens.push((start, Token::Gt));
                    }
                }
                b'0'..=b'9' => {
                    while matches!(self.peek_byte(), Some(b) if b.is_ascii_digit()) {
                        self.pos += 1;
                    }
                    let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
                    let n: i64 = text
                        .parse()
                        .map_err(|_| PredicateError::Syntax(start, format!("invalid integer literal {text}")))?;
                    tokens.push((start, Token::Int(n)));
                }
                b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                    while matches!(self.peek_byte(), Some(b) if b.is_ascii_alphanumeric() || b == b'_') {
                        self.pos += 1;
                    }
                    let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
                    let token = match text {
                        "true" => Token::True,
                        "false" => Token::False,
                        other => Token::Ident(other.to_string()),
                    };
                    tokens.push((start, token));
                }
                other => {
                    return Err(PredicateError::Syntax(start, format!("unexpected character {:?}", other as char)));
                }
            }
        }
        Ok(tokens)
    }

    fn expect_seq(&mut self, seq: &[u8], start: usize) -> Result<(), PredicateError> {
        if self.src[self.pos..].starts_with(seq) {
            self.pos += seq.len();
            Ok(())
        } else {
            Err(PredicateError::Syntax(start, format!("expected '{}'", std::str::from_utf8(seq).unwrap())))
        }
    }
}

/// Parsed expression tree. Kept deliberately small: the grammar this engine
/// gates on is boolean/comparison only, never string manipulation or
/// function calls (SPEC_FULL.md §4.E Non-goals).
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    IntLit(i64),
    BoolLit(bool),
    Ident(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos].1
    }

    fn peek_pos(&self) -> usize {
        self.tokens[self.pos].0
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos].1.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: &Token) -> Result<(), PredicateError> {
        if self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(PredicateError::Syntax(self.peek_pos(), format!("expected {:?}, found {:?}", expected, self.peek())))
        }
    }

    // Grammar (lowest to highest precedence):
    //   or_expr   := and_expr ('||' and_expr)*
    //   and_expr  := unary ('&&' unary)*
    //   unary     := '!' unary | cmp_expr
    //   cmp_expr  := atom (cmp_op atom)?
    //   atom      := INT | 'true' | 'false' | IDENT | '(' or_expr ')'
    fn parse_or(&mut self) -> Result<Expr, PredicateError> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Token::Or) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, PredicateError> {
        let mut lhs = self.parse_unary()?;
        while matches!(self.peek(), Token::And) {
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, PredicateError> {
        if matches!(self.peek(), Token::Not) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr, PredicateError> {
        let lhs = self.parse_atom()?;
        let op = match self.peek() {
            Token::Eq => CmpOp::Eq,
            Token::Ne => CmpOp::Ne,
            Token::Lt => CmpOp::Lt,
            Token::Le => CmpOp::Le,
            Token::Gt => CmpOp::Gt,
            Token::Ge => CmpOp::Ge,
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.parse_atom()?;
        Ok(Expr::Cmp(op, Box::new(lhs), Box::new(rhs)))
    }

    fn parse_atom(&mut self) -> Result<Expr, PredicateError> {
        match self.advance() {
            Token::Int(n) => Ok(Expr::IntLit(n)),
            Token::True => Ok(Expr::BoolLit(true)),
            Token::False => Ok(Expr::BoolLit(false)),
            Token::Ident(name) => Ok(Expr::Ident(name)),
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            other => Err(PredicateError::Syntax(self.peek_pos(), format!("unexpected token {:?}", other))),
        }
    }
}

/// Compile a step-gate expression into an AST. This only checks syntax —
/// identifiers are resolved at `eval` time against the bindings in scope.
pub fn compile(expr: &str) -> Result<Expr, PredicateError> {
    let tokens = Lexer::new(expr).tokenize()?;
    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser.parse_or()?;
    if !matches!(parser.peek(), Token::Eof) {
        return Err(PredicateError::Syntax(parser.peek_pos(), format!("unexpected trailing token {:?}", parser.peek())));
    }
    Ok(ast)
}

fn eval_expr(expr: &Expr, bindings: &Bindings) -> Result<Value, PredicateError> {
    match expr {
        Expr::IntLit(n) => Ok(Value::Int(*n)),
        Expr::BoolLit(b) => Ok(Value::Bool(*b)),
        Expr::Ident(name) => {
            if !KNOWN_IDENTIFIERS.contains(&name.as_str()) {
                return Err(PredicateError::UnknownIdentifier(name.clone()));
            }
            bindings.get(name).ok_or_else(|| PredicateError::UnknownIdentifier(name.clone()))
        }
        Expr::Not(inner) => match eval_expr(inner, bindings)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(PredicateError::Type(format!("'!' requires bool, found {}", describe(other)))),
        },
        Expr::And(lhs, rhs) => {
            let l = as_bool(eval_expr(lhs, bindings)?)?;
            let r = as_bool(eval_expr(rhs, bindings)?)?;
            Ok(Value::Bool(l && r))
        }
        Expr::Or(lhs, rhs) => {
            let l = as_bool(eval_expr(lhs, bindings)?)?;
            let r = as_bool(eval_expr(rhs, bindings)?)?;
            Ok(Value::Bool(l || r))
        }
        Expr::Cmp(op, lhs, rhs) => {
            let l = eval_expr(lhs, bindings)?;
            let r = eval_expr(rhs, bindings)?;
            eval_cmp(*op, l, r)
        }
    }
}

fn describe(v: Value) -> &'static str {
    match v {
        Value::Int(_) => "int",
        Value::Bool(_) => "bool",
    }
}

fn as_bool(v: Value) -> Result<bool, PredicateError> {
    match v {
        Value::Bool(b) => Ok(b),
        Value::Int(_) => Err(PredicateError::Type("expected bool, found int".to_string())),
    }
}

fn eval_cmp(op: CmpOp, lhs: Value, rhs: Value) -> Result<Value, PredicateError> {
    let result = match (lhs, rhs) {
        (Value::Int(l), Value::Int(r)) => match op {
            CmpOp::Eq => l == r,
            CmpOp::Ne => l != r,
            CmpOp::Lt => l < r,
            CmpOp::Le => l <= r,
            CmpOp::Gt => l > r,
            CmpOp::Ge => l >= r,
        },
        (Value::Bool(l), Value::Bool(r)) => match op {
            CmpOp::Eq => l == r,
            CmpOp::Ne => l != r,
            _ => return Err(PredicateError::Type("bool only supports == and !=".to_string())),
        },
        (l, r) => {
            return Err(PredicateError::Type(format!(
                "cannot compare {} and {}",
                describe(l),
                describe(r)
            )))
        }
    };
    Ok(Value::Bool(result))
}

/// Compile and evaluate an expression against a fixed binding set in one
/// call. This is what the runner calls at each step gate.
pub fn eval(expr: &str, bindings: &Bindings) -> Result<bool, PredicateError> {
    let ast = compile(expr)?;
    as_bool(eval_expr(&ast, bindings)?)
}

/// Result of `simulate_prehook`: surfaces the parsed form and the decision
/// without requiring a live task, for the dry-run Tauri command.
#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub decision: bool,
    pub normalized: String,
}

pub fn simulate(expr: &str, bindings: &Bindings) -> Result<SimulationResult, PredicateError> {
    let ast = compile(expr)?;
    let decision = as_bool(eval_expr(&ast, bindings)?)?;
    Ok(SimulationResult { decision, normalized: format!("{:?}", ast) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings() -> Bindings {
        Bindings::new()
            .with("cycle", Value::Int(1))
            .with("active_ticket_count", Value::Int(0))
            .with("new_ticket_count", Value::Int(2))
            .with("qa_exit_code", Value::Int(1))
            .with("fix_exit_code", Value::Int(0))
            .with("retest_exit_code", Value::Int(0))
            .with("qa_failed", Value::Bool(true))
            .with("fix_required", Value::Bool(true))
    }

    #[test]
    fn simple_comparison() {
        assert!(eval("qa_exit_code == 1", &bindings()).unwrap());
        assert!(!eval("qa_exit_code == 0", &bindings()).unwrap());
    }

    #[test]
    fn boolean_identifier() {
        assert!(eval("qa_failed", &bindings()).unwrap());
        assert!(eval("fix_required", &bindings()).unwrap());
    }

    #[test]
    fn and_or_precedence() {
        assert!(eval("qa_failed && new_ticket_count > 0", &bindings()).unwrap());
        assert!(eval("qa_exit_code == 0 || qa_failed", &bindings()).unwrap());
    }

    #[test]
    fn not_operator() {
        assert!(!eval("!qa_failed", &bindings()).unwrap());
        assert!(eval("!(qa_exit_code == 0)", &bindings()).unwrap());
    }

    #[test]
    fn parenthesized_grouping() {
        assert!(eval("(cycle == 1 || cycle == 2) && qa_failed", &bindings()).unwrap());
    }

    #[test]
    fn unknown_identifier_errors() {
        let err = eval("frobnicate == 1", &bindings()).unwrap_err();
        assert!(matches!(err, PredicateError::UnknownIdentifier(_)));
    }

    #[test]
    fn type_mismatch_errors() {
        let err = eval("qa_failed == 1", &bindings()).unwrap_err();
        assert!(matches!(err, PredicateError::Type(_)));
    }

    #[test]
    fn syntax_error_on_trailing_garbage() {
        let err = compile("qa_failed &&").unwrap_err();
        assert!(matches!(err, PredicateError::Syntax(_, _)));
    }

    #[test]
    fn syntax_error_on_unbalanced_paren() {
        let err = compile("(qa_failed").unwrap_err();
        assert!(matches!(err, PredicateError::Syntax(_, _)));
    }

    #[test]
    fn simulate_reports_decision() {
        let result = simulate("new_ticket_count > 0", &bindings()).unwrap();
        assert!(result.decision);
        assert!(!result.normalized.is_empty());
    }
}
