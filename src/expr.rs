//! Restricted expression sandbox used for row filters, computed columns and
//! integration-rule bodies.
//!
//! Expressions use a small Python-flavoured grammar: arithmetic, boolean and
//! comparison operators, `a if cond else b`, list and dict literals,
//! subscripting, single-level comprehensions (`[x * 2 for x in items if x]`,
//! or `sum(x for x in items)` as a call argument) and calls to a fixed
//! function registry. There is no attribute access, no arbitrary call target
//! and no name lookup outside the supplied bindings, so an expression can only
//! compute a value from the row it is given.
//!
//! [`Expression::compile`] parses once; [`Expression::evaluate`] walks the
//! tree against a set of bindings. The only side effect is the optional trace
//! accumulator fed by `log(...)`.

use std::{collections::BTreeMap, fmt, fmt::Write as _};

use chrono::{Datelike, Duration, Local};
use regex::Regex;
use rust_decimal::{Decimal, prelude::ToPrimitive};
use thiserror::Error;

use crate::{
    data::{Fields, Value, coerce_date, parse_bool, parse_decimal_literal, quantize},
    transform::string_ops,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    #[error("syntax error at offset {position}: {message}")]
    Syntax { position: usize, message: String },
    #[error("disallowed expression construct: {0}")]
    Disallowed(String),
    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),
    #[error("invalid subscript: {0}")]
    Subscript(String),
    #[error("type error: {0}")]
    Type(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("{name}(): {message}")]
    Function { name: String, message: String },
}

type EvalResult<T> = Result<T, ExpressionError>;

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "lambda", "import", "from", "def", "class", "global", "nonlocal", "exec", "eval", "del",
    "with", "yield", "await", "async", "while", "return", "assert", "raise", "try", "except",
    "finally", "is", "pass", "break", "continue", "__import__", "open", "getattr", "setattr",
];

const FUNCTIONS: &[&str] = &[
    "sum", "min", "max", "len", "abs", "round", "any", "all", "str", "int", "decimal", "float",
    "bool", "today", "coalesce", "lower", "upper", "trim", "snake_case", "substring",
    "regex_replace", "replace", "contains", "startswith", "endswith", "split", "join", "date",
    "date_add", "date_diff_days", "date_format", "year", "month", "day", "log",
];

pub fn is_registered_function(name: &str) -> bool {
    FUNCTIONS.contains(&name)
}

/// Parses and evaluates in one step.
pub fn evaluate(expression: &str, bindings: &Fields) -> EvalResult<Value> {
    Expression::compile(expression)?.evaluate(bindings)
}

/// A parsed expression ready for repeated evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    pub fn compile(source: &str) -> EvalResult<Self> {
        let tokens = Lexer::new(source).tokenize()?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.parse_expression()?;
        parser.expect_end()?;
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, bindings: &Fields) -> EvalResult<Value> {
        Interpreter::new(bindings, None).eval(&self.root)
    }

    /// Evaluates while collecting `log(...)` output into `trace`.
    pub fn evaluate_traced(&self, bindings: &Fields, trace: &mut Vec<String>) -> EvalResult<Value> {
        Interpreter::new(bindings, Some(trace)).eval(&self.root)
    }

    pub fn evaluate_to_bool(&self, bindings: &Fields) -> EvalResult<bool> {
        Ok(self.evaluate(bindings)?.truthy())
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(String),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,
    EqEq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Assign,
    Eof,
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    position: usize,
}

struct Lexer<'a> {
    input: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.char_indices().peekable(),
        }
    }

    fn tokenize(mut self) -> EvalResult<Vec<Spanned>> {
        let mut tokens = Vec::new();
        loop {
            let spanned = self.next_token()?;
            let done = spanned.token == Token::Eof;
            tokens.push(spanned);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn bump_if(&mut self, expected: char) -> bool {
        if self.chars.peek().map(|(_, c)| *c) == Some(expected) {
            self.chars.next();
            true
        } else {
            false
        }
    }

    fn next_token(&mut self) -> EvalResult<Spanned> {
        while self.chars.peek().is_some_and(|(_, c)| c.is_whitespace()) {
            self.chars.next();
        }
        let Some((position, ch)) = self.chars.next() else {
            return Ok(Spanned {
                token: Token::Eof,
                position: self.input.len(),
            });
        };
        let token = match ch {
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            ',' => Token::Comma,
            ':' => Token::Colon,
            '.' if !self.chars.peek().is_some_and(|(_, c)| c.is_ascii_digit()) => Token::Dot,
            '+' => Token::Plus,
            '-' => Token::Minus,
            '%' => Token::Percent,
            '*' => {
                if self.bump_if('*') {
                    Token::DoubleStar
                } else {
                    Token::Star
                }
            }
            '/' => {
                if self.bump_if('/') {
                    Token::DoubleSlash
                } else {
                    Token::Slash
                }
            }
            '=' => {
                if self.bump_if('=') {
                    Token::EqEq
                } else {
                    Token::Assign
                }
            }
            '!' => {
                if self.bump_if('=') {
                    Token::NotEq
                } else {
                    return Err(syntax(position, "unexpected '!'"));
                }
            }
            '<' => {
                if self.bump_if('=') {
                    Token::LessEq
                } else {
                    Token::Less
                }
            }
            '>' => {
                if self.bump_if('=') {
                    Token::GreaterEq
                } else {
                    Token::Greater
                }
            }
            '\'' | '"' => Token::Str(self.read_string(position, ch)?),
            c if c.is_ascii_digit() || c == '.' => Token::Number(self.read_number(c)),
            c if c.is_alphabetic() || c == '_' => Token::Ident(self.read_ident(c)),
            other => return Err(syntax(position, &format!("unexpected character '{other}'"))),
        };
        Ok(Spanned { token, position })
    }

    fn read_string(&mut self, start: usize, quote: char) -> EvalResult<String> {
        let mut buf = String::new();
        while let Some((_, ch)) = self.chars.next() {
            match ch {
                c if c == quote => return Ok(buf),
                '\\' => match self.chars.next() {
                    Some((_, 'n')) => buf.push('\n'),
                    Some((_, 't')) => buf.push('\t'),
                    Some((_, 'r')) => buf.push('\r'),
                    Some((_, other)) => buf.push(other),
                    None => break,
                },
                c => buf.push(c),
            }
        }
        Err(syntax(start, "unterminated string literal"))
    }

    fn read_number(&mut self, first: char) -> String {
        let mut buf = String::from(first);
        while let Some((_, c)) = self.chars.peek().copied() {
            if c.is_ascii_digit() || c == '_' || (c == '.' && !buf.contains('.')) {
                buf.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        buf.replace('_', "")
    }

    fn read_ident(&mut self, first: char) -> String {
        let mut buf = String::from(first);
        while let Some((_, c)) = self.chars.peek().copied() {
            if c.is_alphanumeric() || c == '_' {
                buf.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        buf
    }
}

fn syntax(position: usize, message: &str) -> ExpressionError {
    ExpressionError::Syntax {
        position,
        message: message.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnaryOp {
    Negate,
    Plus,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    FloorDivide,
    Modulo,
    Power,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq)]
struct Comprehension {
    element: Expr,
    variable: String,
    iterable: Expr,
    condition: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Name(String),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare {
        first: Box<Expr>,
        rest: Vec<(CompareOp, Expr)>,
    },
    Ternary {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Subscript {
        target: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        function: String,
        args: Vec<Expr>,
    },
    Comprehension(Box<Comprehension>),
}

impl Expr {
    fn contains_comprehension(&self) -> bool {
        match self {
            Expr::Comprehension(_) => true,
            Expr::Literal(_) | Expr::Name(_) => false,
            Expr::Unary { operand, .. } => operand.contains_comprehension(),
            Expr::Binary { left, right, .. } | Expr::And(left, right) | Expr::Or(left, right) => {
                left.contains_comprehension() || right.contains_comprehension()
            }
            Expr::Compare { first, rest } => {
                first.contains_comprehension() || rest.iter().any(|(_, e)| e.contains_comprehension())
            }
            Expr::Ternary {
                condition,
                then,
                otherwise,
            } => {
                condition.contains_comprehension()
                    || then.contains_comprehension()
                    || otherwise.contains_comprehension()
            }
            Expr::List(items) | Expr::Call { args: items, .. } => {
                items.iter().any(Expr::contains_comprehension)
            }
            Expr::Dict(pairs) => pairs
                .iter()
                .any(|(k, v)| k.contains_comprehension() || v.contains_comprehension()),
            Expr::Subscript { target, index } => {
                target.contains_comprehension() || index.contains_comprehension()
            }
        }
    }
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].token
    }

    fn peek_at(&self, offset: usize) -> &Token {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)].token
    }

    fn position(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].position
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Token::Ident(name) if name == keyword)
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.at_keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> EvalResult<()> {
        if *self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(syntax(self.position(), &format!("expected {what}")))
        }
    }

    fn expect_end(&mut self) -> EvalResult<()> {
        match self.peek() {
            Token::Eof => Ok(()),
            Token::Assign => Err(ExpressionError::Disallowed("assignment".into())),
            _ => Err(syntax(self.position(), "unexpected trailing input")),
        }
    }

    fn parse_expression(&mut self) -> EvalResult<Expr> {
        let body = self.parse_or()?;
        if self.eat_keyword("if") {
            let condition = self.parse_or()?;
            if !self.eat_keyword("else") {
                return Err(syntax(self.position(), "expected 'else' in conditional expression"));
            }
            let otherwise = self.parse_expression()?;
            return Ok(Expr::Ternary {
                condition: Box::new(condition),
                then: Box::new(body),
                otherwise: Box::new(otherwise),
            });
        }
        Ok(body)
    }

    fn parse_or(&mut self) -> EvalResult<Expr> {
        let mut left = self.parse_and()?;
        while self.eat_keyword("or") {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> EvalResult<Expr> {
        let mut left = self.parse_not()?;
        while self.eat_keyword("and") {
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> EvalResult<Expr> {
        if self.at_keyword("not") {
            self.advance();
            let operand = self.parse_not()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> EvalResult<Expr> {
        let first = self.parse_additive()?;
        let mut rest = Vec::new();
        loop {
            let (op, width) = match self.peek() {
                Token::EqEq => (CompareOp::Eq, 1),
                Token::NotEq => (CompareOp::NotEq, 1),
                Token::Less => (CompareOp::Less, 1),
                Token::LessEq => (CompareOp::LessEq, 1),
                Token::Greater => (CompareOp::Greater, 1),
                Token::GreaterEq => (CompareOp::GreaterEq, 1),
                Token::Ident(name) if name == "in" => (CompareOp::In, 1),
                Token::Ident(name)
                    if name == "not" && matches!(self.peek_at(1), Token::Ident(next) if next == "in") =>
                {
                    (CompareOp::NotIn, 2)
                }
                Token::Ident(name) if name == "is" => {
                    return Err(ExpressionError::Disallowed("identity comparison 'is'".into()));
                }
                _ => break,
            };
            for _ in 0..width {
                self.advance();
            }
            rest.push((op, self.parse_additive()?));
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare {
                first: Box::new(first),
                rest,
            })
        }
    }

    fn parse_additive(&mut self) -> EvalResult<Expr> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Subtract,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn parse_term(&mut self) -> EvalResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Multiply,
                Token::Slash => BinaryOp::Divide,
                Token::DoubleSlash => BinaryOp::FloorDivide,
                Token::Percent => BinaryOp::Modulo,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn parse_unary(&mut self) -> EvalResult<Expr> {
        let op = match self.peek() {
            Token::Minus => UnaryOp::Negate,
            Token::Plus => UnaryOp::Plus,
            _ => return self.parse_power(),
        };
        self.advance();
        let operand = self.parse_unary()?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn parse_power(&mut self) -> EvalResult<Expr> {
        let base = self.parse_postfix()?;
        if *self.peek() == Token::DoubleStar {
            self.advance();
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary {
                op: BinaryOp::Power,
                left: Box::new(base),
                right: Box::new(exponent),
            });
        }
        Ok(base)
    }

    fn parse_postfix(&mut self) -> EvalResult<Expr> {
        let mut expr = self.parse_atom()?;
        loop {
            match self.peek() {
                Token::LBracket => {
                    self.advance();
                    let index = self.parse_expression()?;
                    self.expect(Token::RBracket, "']'")?;
                    expr = Expr::Subscript {
                        target: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                Token::Dot => {
                    return Err(ExpressionError::Disallowed("attribute access".into()));
                }
                Token::LParen => {
                    let Expr::Name(function) = expr else {
                        return Err(ExpressionError::Disallowed(
                            "calling anything other than a registered function".into(),
                        ));
                    };
                    if !is_registered_function(&function) {
                        return Err(ExpressionError::Disallowed(format!(
                            "function '{function}' is not available"
                        )));
                    }
                    self.advance();
                    let args = self.parse_call_args()?;
                    expr = Expr::Call { function, args };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_call_args(&mut self) -> EvalResult<Vec<Expr>> {
        if *self.peek() == Token::RParen {
            self.advance();
            return Ok(Vec::new());
        }
        let first = self.parse_expression()?;
        if self.at_keyword("for") {
            let generator = self.parse_comprehension_tail(first)?;
            self.expect(Token::RParen, "')' after generator expression")?;
            return Ok(vec![generator]);
        }
        let mut args = vec![first];
        while *self.peek() == Token::Comma {
            self.advance();
            if *self.peek() == Token::RParen {
                break;
            }
            args.push(self.parse_expression()?);
        }
        if *self.peek() == Token::Assign {
            return Err(ExpressionError::Disallowed("keyword arguments".into()));
        }
        self.expect(Token::RParen, "')'")?;
        Ok(args)
    }

    fn parse_comprehension_tail(&mut self, element: Expr) -> EvalResult<Expr> {
        // Caller has seen `for`.
        self.advance();
        let variable = match self.advance() {
            Token::Ident(name) if !is_reserved(&name) => name,
            _ => return Err(syntax(self.position(), "expected a loop variable name")),
        };
        if *self.peek() == Token::Comma {
            return Err(ExpressionError::Disallowed("tuple unpacking in comprehension".into()));
        }
        if !self.eat_keyword("in") {
            return Err(syntax(self.position(), "expected 'in' in comprehension"));
        }
        let iterable = self.parse_or()?;
        let condition = if self.eat_keyword("if") {
            Some(self.parse_or()?)
        } else {
            None
        };
        if self.at_keyword("for") || self.at_keyword("if") {
            return Err(ExpressionError::Disallowed(
                "comprehensions may only have one 'for' and one 'if' clause".into(),
            ));
        }
        let nested = element.contains_comprehension()
            || iterable.contains_comprehension()
            || condition.as_ref().is_some_and(Expr::contains_comprehension);
        if nested {
            return Err(ExpressionError::Disallowed("nested comprehension".into()));
        }
        Ok(Expr::Comprehension(Box::new(Comprehension {
            element,
            variable,
            iterable,
            condition,
        })))
    }

    fn parse_atom(&mut self) -> EvalResult<Expr> {
        let position = self.position();
        match self.advance() {
            Token::Number(text) => parse_number_literal(&text, position).map(Expr::Literal),
            Token::Str(text) => Ok(Expr::Literal(Value::String(text))),
            Token::Ident(name) => match name.as_str() {
                "True" | "true" => Ok(Expr::Literal(Value::Boolean(true))),
                "False" | "false" => Ok(Expr::Literal(Value::Boolean(false))),
                "None" | "null" => Ok(Expr::Literal(Value::Null)),
                keyword if FORBIDDEN_KEYWORDS.contains(&keyword) || keyword.starts_with("__") => {
                    Err(ExpressionError::Disallowed(format!("'{keyword}'")))
                }
                keyword if is_reserved(keyword) => {
                    Err(syntax(position, &format!("unexpected keyword '{keyword}'")))
                }
                _ => Ok(Expr::Name(name)),
            },
            Token::LParen => {
                let inner = self.parse_expression()?;
                if *self.peek() == Token::Comma {
                    return Err(ExpressionError::Disallowed("tuple literal".into()));
                }
                if self.at_keyword("for") {
                    return Err(ExpressionError::Disallowed(
                        "generator expression outside a function call".into(),
                    ));
                }
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::LBracket => self.parse_list(),
            Token::LBrace => self.parse_dict(),
            Token::Eof => Err(syntax(position, "unexpected end of expression")),
            Token::Assign => Err(ExpressionError::Disallowed("assignment".into())),
            other => Err(syntax(position, &format!("unexpected token {other:?}"))),
        }
    }

    fn parse_list(&mut self) -> EvalResult<Expr> {
        if *self.peek() == Token::RBracket {
            self.advance();
            return Ok(Expr::List(Vec::new()));
        }
        let first = self.parse_expression()?;
        if self.at_keyword("for") {
            let comprehension = self.parse_comprehension_tail(first)?;
            self.expect(Token::RBracket, "']' after comprehension")?;
            return Ok(comprehension);
        }
        let mut items = vec![first];
        while *self.peek() == Token::Comma {
            self.advance();
            if *self.peek() == Token::RBracket {
                break;
            }
            items.push(self.parse_expression()?);
        }
        self.expect(Token::RBracket, "']'")?;
        Ok(Expr::List(items))
    }

    fn parse_dict(&mut self) -> EvalResult<Expr> {
        let mut pairs = Vec::new();
        if *self.peek() == Token::RBrace {
            self.advance();
            return Ok(Expr::Dict(pairs));
        }
        loop {
            let key = self.parse_expression()?;
            if *self.peek() != Token::Colon {
                if self.at_keyword("for") {
                    return Err(ExpressionError::Disallowed("dict or set comprehension".into()));
                }
                return Err(ExpressionError::Disallowed("set literal".into()));
            }
            self.advance();
            let value = self.parse_expression()?;
            if self.at_keyword("for") {
                return Err(ExpressionError::Disallowed("dict comprehension".into()));
            }
            pairs.push((key, value));
            if *self.peek() == Token::Comma {
                self.advance();
                if *self.peek() == Token::RBrace {
                    break;
                }
                continue;
            }
            break;
        }
        self.expect(Token::RBrace, "'}'")?;
        Ok(Expr::Dict(pairs))
    }
}

fn is_reserved(name: &str) -> bool {
    matches!(
        name,
        "and" | "or" | "not" | "in" | "if" | "else" | "for" | "True" | "False" | "None"
    ) || FORBIDDEN_KEYWORDS.contains(&name)
}

fn parse_number_literal(text: &str, position: usize) -> EvalResult<Value> {
    if !text.contains('.') {
        if let Ok(i) = text.parse::<i64>() {
            return Ok(Value::Integer(i));
        }
    }
    parse_decimal_literal(text)
        .map(Value::Decimal)
        .map_err(|_| syntax(position, &format!("invalid number literal '{text}'")))
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

struct Interpreter<'a> {
    globals: &'a Fields,
    locals: Vec<(String, Value)>,
    trace: Option<&'a mut Vec<String>>,
}

impl<'a> Interpreter<'a> {
    fn new(globals: &'a Fields, trace: Option<&'a mut Vec<String>>) -> Self {
        Self {
            globals,
            locals: Vec::new(),
            trace,
        }
    }

    fn lookup(&self, name: &str) -> EvalResult<Value> {
        if let Some((_, value)) = self.locals.iter().rev().find(|(local, _)| local == name) {
            return Ok(value.clone());
        }
        self.globals
            .get(name)
            .cloned()
            .ok_or_else(|| ExpressionError::UndefinedVariable(name.to_string()))
    }

    fn eval(&mut self, expr: &Expr) -> EvalResult<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Name(name) => self.lookup(name),
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                eval_unary(*op, value)
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                eval_binary(*op, left, right)
            }
            Expr::And(left, right) => {
                let left = self.eval(left)?;
                if left.truthy() { self.eval(right) } else { Ok(left) }
            }
            Expr::Or(left, right) => {
                let left = self.eval(left)?;
                if left.truthy() { Ok(left) } else { self.eval(right) }
            }
            Expr::Compare { first, rest } => {
                let mut left = self.eval(first)?;
                for (op, operand) in rest {
                    let right = self.eval(operand)?;
                    if !eval_compare(*op, &left, &right)? {
                        return Ok(Value::Boolean(false));
                    }
                    left = right;
                }
                Ok(Value::Boolean(true))
            }
            Expr::Ternary {
                condition,
                then,
                otherwise,
            } => {
                if self.eval(condition)?.truthy() {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expr::List(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<EvalResult<Vec<_>>>()
                .map(Value::List),
            Expr::Dict(pairs) => {
                let mut map = BTreeMap::new();
                for (key, value) in pairs {
                    let key = match self.eval(key)? {
                        Value::String(s) => s,
                        other if !matches!(other, Value::List(_) | Value::Map(_)) => other.as_display(),
                        other => {
                            return Err(ExpressionError::Type(format!(
                                "{} cannot be used as a dict key",
                                other.type_name()
                            )));
                        }
                    };
                    let value = self.eval(value)?;
                    map.insert(key, value);
                }
                Ok(Value::Map(map))
            }
            Expr::Subscript { target, index } => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                eval_subscript(target, &index)
            }
            Expr::Call { function, args } => {
                let values = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<EvalResult<Vec<_>>>()?;
                if function == "log" {
                    return self.log(values);
                }
                call_function(function, values).map_err(|message| ExpressionError::Function {
                    name: function.clone(),
                    message,
                })
            }
            Expr::Comprehension(comprehension) => self.eval_comprehension(comprehension),
        }
    }

    fn eval_comprehension(&mut self, comprehension: &Comprehension) -> EvalResult<Value> {
        let items = match self.eval(&comprehension.iterable)? {
            Value::List(items) => items,
            Value::Map(map) => map.into_keys().map(Value::String).collect(),
            Value::String(s) => s.chars().map(|c| Value::String(c.to_string())).collect(),
            other => {
                return Err(ExpressionError::Type(format!(
                    "cannot iterate over {}",
                    other.type_name()
                )));
            }
        };
        let mut output = Vec::with_capacity(items.len());
        for item in items {
            self.locals.push((comprehension.variable.clone(), item));
            let result = self.eval_comprehension_item(comprehension);
            self.locals.pop();
            if let Some(value) = result? {
                output.push(value);
            }
        }
        Ok(Value::List(output))
    }

    fn eval_comprehension_item(&mut self, comprehension: &Comprehension) -> EvalResult<Option<Value>> {
        if let Some(condition) = &comprehension.condition
            && !self.eval(condition)?.truthy()
        {
            return Ok(None);
        }
        self.eval(&comprehension.element).map(Some)
    }

    fn log(&mut self, values: Vec<Value>) -> EvalResult<Value> {
        let line = values.iter().map(Value::as_display).collect::<Vec<_>>().join(" ");
        log::debug!("expression log: {line}");
        if let Some(trace) = self.trace.as_deref_mut() {
            trace.push(line);
        }
        Ok(values.into_iter().next().unwrap_or(Value::Null))
    }
}

fn eval_unary(op: UnaryOp, value: Value) -> EvalResult<Value> {
    match op {
        UnaryOp::Not => Ok(Value::Boolean(!value.truthy())),
        UnaryOp::Plus if value.is_numeric() => Ok(value),
        UnaryOp::Negate => match value {
            Value::Integer(i) => Ok(i
                .checked_neg()
                .map(Value::Integer)
                .unwrap_or_else(|| Value::Decimal(-Decimal::from(i)))),
            Value::Float(f) => Ok(Value::Float(-f)),
            Value::Decimal(d) => Ok(Value::Decimal(-d)),
            other => Err(ExpressionError::Type(format!("cannot negate {}", other.type_name()))),
        },
        UnaryOp::Plus => Err(ExpressionError::Type(format!(
            "unary '+' on {}",
            value.type_name()
        ))),
    }
}

fn numeric_operands(op: &str, left: &Value, right: &Value) -> EvalResult<(Decimal, Decimal)> {
    match (left.is_numeric().then(|| left.as_decimal()).flatten(), right.is_numeric().then(|| right.as_decimal()).flatten()) {
        (Some(l), Some(r)) => Ok((l, r)),
        _ => Err(ExpressionError::Type(format!(
            "unsupported operands for {op}: {} and {}",
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn overflow() -> ExpressionError {
    ExpressionError::Type("numeric overflow".into())
}

fn eval_binary(op: BinaryOp, left: Value, right: Value) -> EvalResult<Value> {
    match (op, &left, &right) {
        (BinaryOp::Add, Value::String(a), Value::String(b)) => return Ok(Value::String(format!("{a}{b}"))),
        (BinaryOp::Add, Value::List(a), Value::List(b)) => {
            return Ok(Value::List(a.iter().chain(b).cloned().collect()));
        }
        (BinaryOp::Add, Value::Date(d), Value::Integer(days))
        | (BinaryOp::Add, Value::Integer(days), Value::Date(d)) => {
            return Duration::try_days(*days)
                .and_then(|delta| d.checked_add_signed(delta))
                .map(Value::Date)
                .ok_or_else(overflow);
        }
        (BinaryOp::Subtract, Value::Date(d), Value::Integer(days)) => {
            return Duration::try_days(*days)
                .and_then(|delta| d.checked_sub_signed(delta))
                .map(Value::Date)
                .ok_or_else(overflow);
        }
        (BinaryOp::Subtract, Value::Date(a), Value::Date(b)) => {
            return Ok(Value::Integer((*a - *b).num_days()));
        }
        _ => {}
    }

    if let (Value::Integer(a), Value::Integer(b)) = (&left, &right) {
        let (a, b) = (*a, *b);
        let exact = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Subtract => a.checked_sub(b),
            BinaryOp::Multiply => a.checked_mul(b),
            BinaryOp::FloorDivide => a
                .checked_div_euclid(b)
                .map(|q| q - i64::from(b < 0 && a.rem_euclid(b) != 0)),
            BinaryOp::Modulo => a
                .checked_rem_euclid(b)
                .map(|r| if b < 0 && r != 0 { r + b } else { r }),
            BinaryOp::Power if (0..=63).contains(&b) => a.checked_pow(b as u32),
            _ => None,
        };
        if let Some(result) = exact {
            return Ok(Value::Integer(result));
        }
    }

    let symbol = match op {
        BinaryOp::Add => "+",
        BinaryOp::Subtract => "-",
        BinaryOp::Multiply => "*",
        BinaryOp::Divide => "/",
        BinaryOp::FloorDivide => "//",
        BinaryOp::Modulo => "%",
        BinaryOp::Power => "**",
    };
    let (l, r) = numeric_operands(symbol, &left, &right)?;
    let result = match op {
        BinaryOp::Add => l.checked_add(r).ok_or_else(overflow)?,
        BinaryOp::Subtract => l.checked_sub(r).ok_or_else(overflow)?,
        BinaryOp::Multiply => l.checked_mul(r).ok_or_else(overflow)?,
        BinaryOp::Divide => {
            if r.is_zero() {
                return Err(ExpressionError::DivisionByZero);
            }
            l.checked_div(r).ok_or_else(overflow)?
        }
        BinaryOp::FloorDivide => {
            if r.is_zero() {
                return Err(ExpressionError::DivisionByZero);
            }
            l.checked_div(r).ok_or_else(overflow)?.floor()
        }
        BinaryOp::Modulo => {
            if r.is_zero() {
                return Err(ExpressionError::DivisionByZero);
            }
            let rem = l.checked_rem(r).ok_or_else(overflow)?;
            if !rem.is_zero() && (rem.is_sign_negative() != r.is_sign_negative()) {
                rem + r
            } else {
                rem
            }
        }
        BinaryOp::Power => decimal_power(l, r)?,
    };
    Ok(Value::Decimal(result))
}

fn decimal_power(base: Decimal, exponent: Decimal) -> EvalResult<Decimal> {
    if !exponent.fract().is_zero() {
        return Err(ExpressionError::Type("only integer exponents are supported".into()));
    }
    let exponent = exponent.to_i64().ok_or_else(overflow)?;
    // Square-and-multiply: at most 64 rounds whatever the exponent.
    let mut result = Decimal::ONE;
    let mut factor = base;
    let mut remaining = exponent.unsigned_abs();
    while remaining > 0 {
        if remaining & 1 == 1 {
            result = result.checked_mul(factor).ok_or_else(overflow)?;
        }
        remaining >>= 1;
        if remaining > 0 {
            factor = factor.checked_mul(factor).ok_or_else(overflow)?;
        }
    }
    if exponent < 0 {
        if result.is_zero() {
            return Err(ExpressionError::DivisionByZero);
        }
        result = Decimal::ONE.checked_div(result).ok_or_else(overflow)?;
    }
    Ok(result)
}

fn eval_compare(op: CompareOp, left: &Value, right: &Value) -> EvalResult<bool> {
    match op {
        CompareOp::Eq => Ok(left.loose_eq(right)),
        CompareOp::NotEq => Ok(!left.loose_eq(right)),
        CompareOp::In => membership(left, right),
        CompareOp::NotIn => membership(left, right).map(|found| !found),
        ordering => {
            let cmp = left.compare(right).ok_or_else(|| {
                ExpressionError::Type(format!(
                    "cannot order {} and {}",
                    left.type_name(),
                    right.type_name()
                ))
            })?;
            Ok(match ordering {
                CompareOp::Less => cmp.is_lt(),
                CompareOp::LessEq => cmp.is_le(),
                CompareOp::Greater => cmp.is_gt(),
                _ => cmp.is_ge(),
            })
        }
    }
}

fn membership(needle: &Value, haystack: &Value) -> EvalResult<bool> {
    match haystack {
        Value::List(items) => Ok(items.iter().any(|item| item.loose_eq(needle))),
        Value::Map(map) => Ok(map.contains_key(&needle.as_display())),
        Value::String(s) => match needle {
            Value::String(n) => Ok(s.contains(n.as_str())),
            other => Err(ExpressionError::Type(format!(
                "'in <string>' requires a string, got {}",
                other.type_name()
            ))),
        },
        other => Err(ExpressionError::Type(format!(
            "argument of type {} is not a container",
            other.type_name()
        ))),
    }
}

fn eval_subscript(target: Value, index: &Value) -> EvalResult<Value> {
    match target {
        Value::List(items) => {
            let position = resolve_index(index, items.len())?;
            Ok(items[position].clone())
        }
        Value::String(s) => {
            let chars = s.chars().collect::<Vec<_>>();
            let position = resolve_index(index, chars.len())?;
            Ok(Value::String(chars[position].to_string()))
        }
        Value::Map(map) => {
            let key = index.as_display();
            map.get(&key)
                .cloned()
                .ok_or_else(|| ExpressionError::Subscript(format!("key '{key}' not found")))
        }
        other => Err(ExpressionError::Subscript(format!(
            "{} is not subscriptable",
            other.type_name()
        ))),
    }
}

fn resolve_index(index: &Value, len: usize) -> EvalResult<usize> {
    let Value::Integer(raw) = index else {
        return Err(ExpressionError::Subscript(format!(
            "indices must be integers, not {}",
            index.type_name()
        )));
    };
    let resolved = if *raw < 0 { len as i64 + raw } else { *raw };
    if resolved < 0 || resolved as usize >= len {
        return Err(ExpressionError::Subscript(format!("index {raw} out of range")));
    }
    Ok(resolved as usize)
}

// ---------------------------------------------------------------------------
// Function registry
// ---------------------------------------------------------------------------

type FnResult = Result<Value, String>;

fn expect_args(args: &[Value], expected: usize, name: &str) -> Result<(), String> {
    if args.len() != expected {
        return Err(format!(
            "{name} expects {expected} argument(s), got {}",
            args.len()
        ));
    }
    Ok(())
}

fn expect_string<'v>(value: &'v Value, name: &str) -> Result<&'v str, String> {
    value
        .as_str()
        .ok_or_else(|| format!("expected string for {name}, got {}", value.type_name()))
}

fn expect_i64(value: &Value, name: &str) -> Result<i64, String> {
    match value {
        Value::Integer(i) => Ok(*i),
        other => other
            .is_numeric()
            .then(|| other.as_i64())
            .flatten()
            .ok_or_else(|| format!("expected integer for {name}, got {}", other.type_name())),
    }
}

fn expect_date(value: &Value, name: &str) -> Result<chrono::NaiveDate, String> {
    coerce_date(value).ok_or_else(|| format!("expected date for {name}, got '{}'", value.as_display()))
}

/// `f(list)` and `f(a, b, ...)` are both accepted by the aggregation helpers.
fn spread(args: Vec<Value>) -> Vec<Value> {
    match args.as_slice() {
        [Value::List(_)] => match args.into_iter().next() {
            Some(Value::List(items)) => items,
            _ => Vec::new(),
        },
        _ => args,
    }
}

fn call_function(name: &str, args: Vec<Value>) -> FnResult {
    match name {
        "sum" => {
            let mut total = Value::Integer(0);
            for item in spread(args).into_iter().filter(|v| !v.is_null()) {
                if !item.is_numeric() {
                    return Err(format!("cannot sum {}", item.type_name()));
                }
                total = eval_binary(BinaryOp::Add, total, item).map_err(|e| e.to_string())?;
            }
            Ok(total)
        }
        "min" | "max" => {
            let items = spread(args);
            let mut iter = items.into_iter().filter(|v| !v.is_null());
            let mut best = iter.next().ok_or_else(|| format!("{name} of an empty sequence"))?;
            for item in iter {
                let ordering = item
                    .compare(&best)
                    .ok_or_else(|| format!("cannot compare {} and {}", item.type_name(), best.type_name()))?;
                if (name == "min" && ordering.is_lt()) || (name == "max" && ordering.is_gt()) {
                    best = item;
                }
            }
            Ok(best)
        }
        "len" => {
            expect_args(&args, 1, name)?;
            match &args[0] {
                Value::List(items) => Ok(Value::Integer(items.len() as i64)),
                Value::Map(map) => Ok(Value::Integer(map.len() as i64)),
                Value::String(s) => Ok(Value::Integer(s.chars().count() as i64)),
                other => Err(format!("object of type {} has no len()", other.type_name())),
            }
        }
        "abs" => {
            expect_args(&args, 1, name)?;
            match &args[0] {
                Value::Integer(i) => Ok(Value::Integer(i.saturating_abs())),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                Value::Decimal(d) => Ok(Value::Decimal(d.abs())),
                other => Err(format!("bad operand type {}", other.type_name())),
            }
        }
        "round" => {
            if args.is_empty() || args.len() > 2 {
                return Err("round expects 1 or 2 arguments".into());
            }
            let places = match args.get(1) {
                Some(value) => expect_i64(value, "places")?,
                None => 0,
            };
            if !(0..=28).contains(&places) {
                return Err(format!("places must be between 0 and 28, got {places}"));
            }
            let number = args[0]
                .as_decimal()
                .filter(|_| args[0].is_numeric())
                .ok_or_else(|| format!("cannot round {}", args[0].type_name()))?;
            let rounded = quantize(number, places as u32);
            if places == 0 {
                return Ok(rounded.to_i64().map(Value::Integer).unwrap_or(Value::Decimal(rounded)));
            }
            Ok(Value::Decimal(rounded))
        }
        "any" => Ok(Value::Boolean(spread(args).iter().any(Value::truthy))),
        "all" => Ok(Value::Boolean(spread(args).iter().all(Value::truthy))),
        "str" => {
            expect_args(&args, 1, name)?;
            Ok(Value::String(args[0].as_display()))
        }
        "int" => {
            expect_args(&args, 1, name)?;
            match &args[0] {
                Value::Boolean(b) => Ok(Value::Integer(*b as i64)),
                other => other
                    .as_decimal()
                    .and_then(|d| d.trunc().to_i64())
                    .map(Value::Integer)
                    .ok_or_else(|| format!("invalid literal for int(): '{}'", other.as_display())),
            }
        }
        "decimal" | "float" => {
            expect_args(&args, 1, name)?;
            args[0]
                .as_decimal()
                .map(Value::Decimal)
                .ok_or_else(|| format!("could not convert '{}' to a number", args[0].as_display()))
        }
        "bool" => {
            expect_args(&args, 1, name)?;
            let value = &args[0];
            Ok(Value::Boolean(match value {
                Value::String(_) => parse_bool(value).unwrap_or_else(|| value.truthy()),
                other => other.truthy(),
            }))
        }
        "today" => {
            expect_args(&args, 0, name)?;
            Ok(Value::Date(Local::now().date_naive()))
        }
        "coalesce" => Ok(args.into_iter().find(|v| !v.is_blank()).unwrap_or(Value::Null)),
        "lower" => {
            expect_args(&args, 1, name)?;
            Ok(Value::String(expect_string(&args[0], "value")?.to_lowercase()))
        }
        "upper" => {
            expect_args(&args, 1, name)?;
            Ok(Value::String(expect_string(&args[0], "value")?.to_uppercase()))
        }
        "trim" => {
            expect_args(&args, 1, name)?;
            Ok(Value::String(expect_string(&args[0], "value")?.trim().to_string()))
        }
        "snake_case" => {
            expect_args(&args, 1, name)?;
            Ok(Value::String(string_ops::snake_case(expect_string(&args[0], "value")?).into_owned()))
        }
        "substring" => {
            expect_args(&args, 3, name)?;
            let value = expect_string(&args[0], "value")?;
            let start = expect_i64(&args[1], "start")?.max(0) as usize;
            let length = expect_i64(&args[2], "length")?;
            if length <= 0 {
                return Ok(Value::String(String::new()));
            }
            Ok(Value::String(string_ops::substring(value, start, length as usize).into_owned()))
        }
        "regex_replace" => {
            expect_args(&args, 3, name)?;
            let value = expect_string(&args[0], "value")?;
            let pattern = expect_string(&args[1], "pattern")?;
            let replacement = expect_string(&args[2], "replacement")?;
            let regex = Regex::new(pattern).map_err(|err| format!("invalid regex: {err}"))?;
            Ok(Value::String(regex.replace_all(value, replacement).into_owned()))
        }
        "replace" => {
            expect_args(&args, 3, name)?;
            let value = expect_string(&args[0], "value")?;
            let old = expect_string(&args[1], "old")?;
            let new = expect_string(&args[2], "new")?;
            Ok(Value::String(value.replace(old, new)))
        }
        "contains" | "startswith" | "endswith" => {
            expect_args(&args, 2, name)?;
            let haystack = args[0].as_display();
            let needle = args[1].as_display();
            Ok(Value::Boolean(match name {
                "contains" => haystack.contains(&needle),
                "startswith" => haystack.starts_with(&needle),
                _ => haystack.ends_with(&needle),
            }))
        }
        "split" => {
            expect_args(&args, 2, name)?;
            let value = expect_string(&args[0], "value")?;
            let separator = expect_string(&args[1], "separator")?;
            if separator.is_empty() {
                return Err("empty separator".into());
            }
            Ok(Value::List(
                value.split(separator).map(|part| Value::String(part.to_string())).collect(),
            ))
        }
        "join" => {
            expect_args(&args, 2, name)?;
            let separator = expect_string(&args[0], "separator")?;
            let Value::List(items) = &args[1] else {
                return Err(format!("expected list, got {}", args[1].type_name()));
            };
            Ok(Value::String(
                items.iter().map(Value::as_display).collect::<Vec<_>>().join(separator),
            ))
        }
        "date" => {
            expect_args(&args, 1, name)?;
            if args[0].is_blank() {
                return Ok(Value::Null);
            }
            expect_date(&args[0], "value").map(Value::Date)
        }
        "date_add" => {
            expect_args(&args, 2, name)?;
            let date = expect_date(&args[0], "date")?;
            let days = expect_i64(&args[1], "days")?;
            Duration::try_days(days)
                .and_then(|delta| date.checked_add_signed(delta))
                .map(Value::Date)
                .ok_or_else(|| "date_add overflow".to_string())
        }
        "date_diff_days" => {
            expect_args(&args, 2, name)?;
            let end = expect_date(&args[0], "end")?;
            let start = expect_date(&args[1], "start")?;
            Ok(Value::Integer((end - start).num_days()))
        }
        "date_format" => {
            expect_args(&args, 2, name)?;
            let date = expect_date(&args[0], "date")?;
            let fmt = expect_string(&args[1], "format")?;
            let mut rendered = String::new();
            write!(rendered, "{}", date.format(fmt)).map_err(|_| format!("invalid format '{fmt}'"))?;
            Ok(Value::String(rendered))
        }
        "year" | "month" | "day" => {
            expect_args(&args, 1, name)?;
            let date = expect_date(&args[0], "date")?;
            Ok(Value::Integer(match name {
                "year" => i64::from(date.year()),
                "month" => i64::from(date.month()),
                _ => i64::from(date.day()),
            }))
        }
        other => Err(format!("function '{other}' is not available")),
    }
}
