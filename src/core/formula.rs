//! Restricted arithmetic over regex capture groups.
//!
//! Grammar:
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := '-' unary | primary
//! primary := NUMBER | '$' DIGITS | '(' expr ')'
//! ```
//!
//! `$0` is the whole match, `$1..` the numbered groups. The legacy spelling
//! `float(match.group(N))` is accepted as an alias for `$N`.

use crate::core::error::FuzzyflowError;
use regex::Regex;
use std::sync::LazyLock;

static LEGACY_GROUP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*float\(\s*match\.group\(\s*(\d+)\s*\)\s*\)\s*$")
        .expect("legacy formula regex is valid")
});

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Num(f64),
    Group(usize),
    Neg(Box<Expr>),
    Bin(Op, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    expr: Expr,
}

impl Default for Formula {
    fn default() -> Self {
        Self {
            source: "$1".to_string(),
            expr: Expr::Group(1),
        }
    }
}

impl Formula {
    pub fn parse(source: &str) -> Result<Self, FuzzyflowError> {
        if let Some(caps) = LEGACY_GROUP.captures(source) {
            let group = caps[1]
                .parse::<usize>()
                .map_err(|e| FuzzyflowError::FormulaError(e.to_string()))?;
            return Ok(Self {
                source: source.to_string(),
                expr: Expr::Group(group),
            });
        }
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(FuzzyflowError::FormulaError(format!(
                "unexpected trailing input in '{}'",
                source
            )));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Highest capture group index referenced.
    pub fn max_group(&self) -> usize {
        fn walk(e: &Expr) -> usize {
            match e {
                Expr::Num(_) => 0,
                Expr::Group(g) => *g,
                Expr::Neg(inner) => walk(inner),
                Expr::Bin(_, l, r) => walk(l).max(walk(r)),
            }
        }
        walk(&self.expr)
    }

    pub fn eval(&self, groups: &[Option<&str>]) -> Result<f64, FuzzyflowError> {
        eval_expr(&self.expr, groups)
    }
}

fn eval_expr(expr: &Expr, groups: &[Option<&str>]) -> Result<f64, FuzzyflowError> {
    match expr {
        Expr::Num(n) => Ok(*n),
        Expr::Group(g) => {
            let raw = groups.get(*g).copied().flatten().ok_or_else(|| {
                FuzzyflowError::FormulaError(format!("capture group {} did not participate", g))
            })?;
            raw.trim().parse::<f64>().map_err(|_| {
                FuzzyflowError::FormulaError(format!(
                    "capture group {} is not numeric: '{}'",
                    g, raw
                ))
            })
        }
        Expr::Neg(inner) => Ok(-eval_expr(inner, groups)?),
        Expr::Bin(op, l, r) => {
            let a = eval_expr(l, groups)?;
            let b = eval_expr(r, groups)?;
            match op {
                Op::Add => Ok(a + b),
                Op::Sub => Ok(a - b),
                Op::Mul => Ok(a * b),
                Op::Div if b == 0.0 => {
                    Err(FuzzyflowError::FormulaError("division by zero".to_string()))
                }
                Op::Div => Ok(a / b),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Group(usize),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(source: &str) -> Result<Vec<Token>, FuzzyflowError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '$' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end].is_ascii_digit() {
                    end += 1;
                }
                if end == start {
                    return Err(FuzzyflowError::FormulaError(format!(
                        "'$' must be followed by a group number in '{}'",
                        source
                    )));
                }
                let digits: String = chars[start..end].iter().collect();
                let group = digits
                    .parse::<usize>()
                    .map_err(|e| FuzzyflowError::FormulaError(e.to_string()))?;
                tokens.push(Token::Group(group));
                i = end;
            }
            d if d.is_ascii_digit() || d == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let value = literal.parse::<f64>().map_err(|_| {
                    FuzzyflowError::FormulaError(format!("bad number literal '{}'", literal))
                })?;
                tokens.push(Token::Num(value));
            }
            other => {
                return Err(FuzzyflowError::FormulaError(format!(
                    "unexpected character '{}' in '{}'",
                    other, source
                )));
            }
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

    fn expr(&mut self) -> Result<Expr, FuzzyflowError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => Op::Add,
                Some(Token::Minus) => Op::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn term(&mut self) -> Result<Expr, FuzzyflowError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => Op::Mul,
                Some(Token::Slash) => Op::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr, FuzzyflowError> {
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, FuzzyflowError> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::Group(g)) => Ok(Expr::Group(g)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(FuzzyflowError::FormulaError(
                        "missing closing parenthesis".to_string(),
                    )),
                }
            }
            Some(other) => Err(FuzzyflowError::FormulaError(format!(
                "unexpected token {:?}",
                other
            ))),
            None => Err(FuzzyflowError::FormulaError(
                "unexpected end of formula".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence_and_parentheses() {
        let f = Formula::parse("$1 + $2 * 2").unwrap();
        assert_eq!(f.eval(&[None, Some("1"), Some("3")]).unwrap(), 7.0);
        let f = Formula::parse("($1 + $2) * 2").unwrap();
        assert_eq!(f.eval(&[None, Some("1"), Some("3")]).unwrap(), 8.0);
        assert_eq!(f.max_group(), 2);
    }

    #[test]
    fn test_unary_minus_and_division() {
        let f = Formula::parse("-$1 / 4").unwrap();
        assert_eq!(f.eval(&[None, Some("10")]).unwrap(), -2.5);
    }

    #[test]
    fn test_legacy_spelling() {
        let f = Formula::parse("float(match.group(2))").unwrap();
        assert_eq!(f.max_group(), 2);
        assert_eq!(f.eval(&[None, Some("x"), Some(" 42.5 ")]).unwrap(), 42.5);
    }

    #[test]
    fn test_default_is_first_group() {
        let f = Formula::default();
        assert_eq!(f.source(), "$1");
        assert_eq!(f.eval(&[Some("temp=40"), Some("40")]).unwrap(), 40.0);
    }

    #[test]
    fn test_rejects_code_and_garbage() {
        assert!(Formula::parse("__import__('os').system('id')").is_err());
        assert!(Formula::parse("$1 +").is_err());
        assert!(Formula::parse("($1").is_err());
        assert!(Formula::parse("$").is_err());
        assert!(Formula::parse("1 2").is_err());
    }

    #[test]
    fn test_eval_failures() {
        let f = Formula::parse("$1 / $2").unwrap();
        assert!(f.eval(&[None, Some("1"), Some("0")]).is_err());
        assert!(f.eval(&[None, Some("abc"), Some("1")]).is_err());
        assert!(f.eval(&[None, Some("1")]).is_err());
    }
}
