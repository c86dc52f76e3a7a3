// src/runtime/reference/parser.rs
//! Parser for the reference runtime's module language
//!
//! One statement per line:
//!
//! ```text
//! # comment
//! answer = 40 + 2
//! def add(a, b): return a + b
//! ```

use crate::runtime::abi::{RuntimeError, RuntimeResult};
use crate::runtime::value::Value;
use std::sync::Arc;

/// Expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Name(String),
    Call { callee: Box<Expr>, args: Vec<Expr> },
    Attr { target: Box<Expr>, name: String },
    List(Vec<Expr>),
    Add(Box<Expr>, Box<Expr>),
}

/// A user-defined function
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: Expr,
}

/// Top-level statement
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Assign { name: String, value: Expr },
    Def(Arc<FunctionDef>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Dot,
    Plus,
    Eq,
}

/// Parse a whole module
pub fn parse_module(source: &str) -> RuntimeResult<Vec<Stmt>> {
    let mut stmts = Vec::new();

    for (index, line) in source.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let tokens = tokenize(trimmed).map_err(|msg| syntax_error(index + 1, &msg))?;
        let mut parser = Parser { tokens, pos: 0 };
        let stmt = parser
            .statement()
            .map_err(|msg| syntax_error(index + 1, &msg))?;
        stmts.push(stmt);
    }

    Ok(stmts)
}

fn syntax_error(line: usize, message: &str) -> RuntimeError {
    RuntimeError::new("SyntaxError", format!("line {}: {}", line, message))
}

fn tokenize(line: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = line.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '#' => break,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Eq);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".into()),
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            let escaped = match chars.get(i + 1) {
                                Some('n') => '\n',
                                Some('t') => '\t',
                                Some(&other) => other,
                                None => return Err("unterminated string literal".into()),
                            };
                            text.push(escaped);
                            i += 2;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            '0'..='9' | '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                if text == "-" {
                    return Err("unexpected '-'".into());
                }
                if text.contains('.') {
                    let value = text
                        .parse::<f64>()
                        .map_err(|_| format!("invalid number '{}'", text))?;
                    tokens.push(Token::Float(value));
                } else {
                    let value = text
                        .parse::<i64>()
                        .map_err(|_| format!("invalid number '{}'", text))?;
                    tokens.push(Token::Int(value));
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), String> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(format!("expected {:?}, found {:?}", expected, token)),
            None => Err(format!("expected {:?}, found end of line", expected)),
        }
    }

    fn ident(&mut self) -> Result<String, String> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            Some(token) => Err(format!("expected a name, found {:?}", token)),
            None => Err("expected a name, found end of line".into()),
        }
    }

    fn finish(&self) -> Result<(), String> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(format!("unexpected trailing {:?}", token)),
        }
    }

    fn statement(&mut self) -> Result<Stmt, String> {
        let name = self.ident()?;

        if name == "def" {
            let name = self.ident()?;
            self.expect(Token::LParen)?;
            let mut params = Vec::new();
            if self.peek() != Some(&Token::RParen) {
                loop {
                    params.push(self.ident()?);
                    if self.peek() == Some(&Token::Comma) {
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
            }
            self.expect(Token::RParen)?;
            self.expect(Token::Colon)?;
            if self.ident()? != "return" {
                return Err("function body must be 'return <expr>'".into());
            }
            let body = self.expression()?;
            self.finish()?;
            return Ok(Stmt::Def(Arc::new(FunctionDef { name, params, body })));
        }

        self.expect(Token::Eq)?;
        let value = self.expression()?;
        self.finish()?;
        Ok(Stmt::Assign { name, value })
    }

    fn expression(&mut self) -> Result<Expr, String> {
        let mut lhs = self.postfix()?;
        while self.peek() == Some(&Token::Plus) {
            self.pos += 1;
            let rhs = self.postfix()?;
            lhs = Expr::Add(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn postfix(&mut self) -> Result<Expr, String> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::LParen) => {
                    self.pos += 1;
                    let args = self.list_items(Token::RParen)?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                    };
                }
                Some(Token::Dot) => {
                    self.pos += 1;
                    let name = self.ident()?;
                    expr = Expr::Attr {
                        target: Box::new(expr),
                        name,
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Int(i)) => Ok(Expr::Literal(Value::Int(i))),
            Some(Token::Float(x)) => Ok(Expr::Literal(Value::Float(x))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::Str(s))),
            Some(Token::LBracket) => Ok(Expr::List(self.list_items(Token::RBracket)?)),
            Some(Token::LParen) => {
                let inner = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => Ok(match name.as_str() {
                "True" => Expr::Literal(Value::Bool(true)),
                "False" => Expr::Literal(Value::Bool(false)),
                "None" => Expr::Literal(Value::None),
                _ => Expr::Name(name),
            }),
            Some(token) => Err(format!("unexpected {:?}", token)),
            None => Err("unexpected end of line".into()),
        }
    }

    /// Comma-separated expressions up to and including `close`
    fn list_items(&mut self, close: Token) -> Result<Vec<Expr>, String> {
        let mut items = Vec::new();
        if self.peek() == Some(&close) {
            self.pos += 1;
            return Ok(items);
        }
        loop {
            items.push(self.expression()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(token) if token == close => return Ok(items),
                Some(token) => return Err(format!("unexpected {:?} in list", token)),
                None => return Err("unclosed list".into()),
            }
        }
    }
}
