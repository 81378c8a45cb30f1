//! Selector expression lexer and parser

use super::FilterError;

/// Literal values appearing in expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Parsed selector expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    Property(String),
    Neg(Box<Expr>),
    Arith(ArithOp, Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
    Between {
        value: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    In {
        value: Box<Expr>,
        list: Vec<Literal>,
        negated: bool,
    },
    Like {
        value: Box<Expr>,
        pattern: String,
        escape: Option<char>,
        negated: bool,
    },
    IsNull {
        value: Box<Expr>,
        negated: bool,
    },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    LParen,
    RParen,
    Comma,
    Op(&'static str),
    // Keywords
    And,
    Or,
    Not,
    Between,
    In,
    Like,
    Escape,
    Is,
    Null,
    True,
    False,
}

fn keyword(word: &str) -> Option<Token> {
    let token = match word.to_ascii_uppercase().as_str() {
        "AND" => Token::And,
        "OR" => Token::Or,
        "NOT" => Token::Not,
        "BETWEEN" => Token::Between,
        "IN" => Token::In,
        "LIKE" => Token::Like,
        "ESCAPE" => Token::Escape,
        "IS" => Token::Is,
        "NULL" => Token::Null,
        "TRUE" => Token::True,
        "FALSE" => Token::False,
        _ => return None,
    };
    Some(token)
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, FilterError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        match c {
            c if c.is_whitespace() => {
                i += 1;
            }
            '(' => {
                tokens.push((start, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((start, Token::RParen));
                i += 1;
            }
            ',' => {
                tokens.push((start, Token::Comma));
                i += 1;
            }
            '=' | '+' | '-' | '*' | '/' => {
                let op = match c {
                    '=' => "=",
                    '+' => "+",
                    '-' => "-",
                    '*' => "*",
                    _ => "/",
                };
                tokens.push((start, Token::Op(op)));
                i += 1;
            }
            '<' | '>' | '!' => {
                let next = chars.get(i + 1).copied();
                let op = match (c, next) {
                    ('<', Some('>')) => "<>",
                    ('<', Some('=')) => "<=",
                    ('>', Some('=')) => ">=",
                    ('!', Some('=')) => "<>",
                    ('<', _) => "<",
                    ('>', _) => ">",
                    _ => return Err(FilterError::new(start, "unexpected '!'")),
                };
                i += if op.len() == 2 { 2 } else { 1 };
                tokens.push((start, Token::Op(op)));
            }
            '\'' => {
                // Quotes are escaped by doubling them
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(FilterError::new(start, "unterminated string")),
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            value.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            value.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push((start, Token::Str(value)));
            }
            c if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let token = if text.contains(['.', 'e', 'E']) && !text.starts_with("0x") {
                    text.parse::<f64>()
                        .map(Token::Float)
                        .map_err(|_| FilterError::new(start, format!("invalid number '{}'", text)))?
                } else {
                    let digits = text.trim_end_matches(['l', 'L']);
                    digits
                        .parse::<i64>()
                        .map(Token::Int)
                        .map_err(|_| FilterError::new(start, format!("invalid number '{}'", text)))?
                };
                tokens.push((start, token));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = keyword(&word).unwrap_or(Token::Ident(word));
                tokens.push((start, token));
            }
            other => {
                return Err(FilterError::new(
                    start,
                    format!("unexpected character '{}'", other),
                ))
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(o, _)| *o).unwrap_or(self.end)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<(), FilterError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(FilterError::new(self.offset(), format!("expected {}", what)))
        }
    }

    fn parse_or(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.parse_not()?;
        while self.eat(&Token::And) {
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, FilterError> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, FilterError> {
        let left = self.parse_additive()?;

        let op = match self.peek() {
            Some(Token::Op("=")) => Some(CompareOp::Eq),
            Some(Token::Op("<>")) => Some(CompareOp::Ne),
            Some(Token::Op("<")) => Some(CompareOp::Lt),
            Some(Token::Op("<=")) => Some(CompareOp::Le),
            Some(Token::Op(">")) => Some(CompareOp::Gt),
            Some(Token::Op(">=")) => Some(CompareOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let right = self.parse_additive()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }

        if self.eat(&Token::Is) {
            let negated = self.eat(&Token::Not);
            self.expect(&Token::Null, "NULL")?;
            return Ok(Expr::IsNull {
                value: Box::new(left),
                negated,
            });
        }

        let negated = self.eat(&Token::Not);
        match self.peek() {
            Some(Token::Between) => {
                self.pos += 1;
                let low = self.parse_additive()?;
                self.expect(&Token::And, "AND")?;
                let high = self.parse_additive()?;
                Ok(Expr::Between {
                    value: Box::new(left),
                    low: Box::new(low),
                    high: Box::new(high),
                    negated,
                })
            }
            Some(Token::In) => {
                self.pos += 1;
                self.expect(&Token::LParen, "'('")?;
                let mut list = vec![self.parse_literal()?];
                while self.eat(&Token::Comma) {
                    list.push(self.parse_literal()?);
                }
                self.expect(&Token::RParen, "')'")?;
                Ok(Expr::In {
                    value: Box::new(left),
                    list,
                    negated,
                })
            }
            Some(Token::Like) => {
                self.pos += 1;
                let pattern = self.parse_string("LIKE pattern")?;
                let escape = if self.eat(&Token::Escape) {
                    let offset = self.offset();
                    let esc = self.parse_string("ESCAPE character")?;
                    let mut chars = esc.chars();
                    match (chars.next(), chars.next()) {
                        (Some(c), None) => Some(c),
                        _ => {
                            return Err(FilterError::new(
                                offset,
                                "ESCAPE must be a single character",
                            ))
                        }
                    }
                } else {
                    None
                };
                Ok(Expr::Like {
                    value: Box::new(left),
                    pattern,
                    escape,
                    negated,
                })
            }
            _ if negated => Err(FilterError::new(
                self.offset(),
                "expected BETWEEN, IN or LIKE after NOT",
            )),
            _ => Ok(left),
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("+")) => ArithOp::Add,
                Some(Token::Op("-")) => ArithOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Arith(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, FilterError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("*")) => ArithOp::Mul,
                Some(Token::Op("/")) => ArithOp::Div,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Arith(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, FilterError> {
        if self.eat(&Token::Op("-")) {
            return Ok(Expr::Neg(Box::new(self.parse_unary()?)));
        }
        if self.eat(&Token::Op("+")) {
            return self.parse_unary();
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, FilterError> {
        let offset = self.offset();
        match self.advance() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => Ok(Expr::Property(name)),
            Some(Token::Str(s)) => Ok(Expr::Literal(Literal::Str(s))),
            Some(Token::Int(v)) => Ok(Expr::Literal(Literal::Int(v))),
            Some(Token::Float(v)) => Ok(Expr::Literal(Literal::Float(v))),
            Some(Token::True) => Ok(Expr::Literal(Literal::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Literal::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Literal::Null)),
            Some(other) => Err(FilterError::new(
                offset,
                format!("unexpected token {:?}", other),
            )),
            None => Err(FilterError::new(offset, "unexpected end of expression")),
        }
    }

    fn parse_literal(&mut self) -> Result<Literal, FilterError> {
        let offset = self.offset();
        let negative = self.eat(&Token::Op("-"));
        match (self.advance(), negative) {
            (Some(Token::Str(s)), false) => Ok(Literal::Str(s)),
            (Some(Token::Int(v)), neg) => Ok(Literal::Int(if neg { -v } else { v })),
            (Some(Token::Float(v)), neg) => Ok(Literal::Float(if neg { -v } else { v })),
            (Some(Token::True), false) => Ok(Literal::Bool(true)),
            (Some(Token::False), false) => Ok(Literal::Bool(false)),
            _ => Err(FilterError::new(offset, "expected literal")),
        }
    }

    fn parse_string(&mut self, what: &str) -> Result<String, FilterError> {
        let offset = self.offset();
        match self.advance() {
            Some(Token::Str(s)) => Ok(s),
            _ => Err(FilterError::new(offset, format!("expected {}", what))),
        }
    }
}

/// Parse a selector expression into an AST
pub fn parse(input: &str) -> Result<Expr, FilterError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(FilterError::new(0, "empty expression"));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: input.chars().count(),
    };
    let expr = parser.parse_or()?;
    if parser.pos < parser.tokens.len() {
        return Err(FilterError::new(parser.offset(), "trailing input"));
    }
    Ok(expr)
}
