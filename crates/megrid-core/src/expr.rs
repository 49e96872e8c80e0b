//! Expression language for coordinates, weights and selections over table rows.
//!
//! Supports arithmetic (+, -, *, /), comparisons (==, !=, <, <=, >, >=),
//! boolean operators (&&, ||, !), indexed columns (`jet_pt[1]`) and the
//! functions abs, sqrt, log, exp, pow, min, max, sin, cos, tan, atan, atan2.
//! Booleans are 1.0 / 0.0; any value > 0 is true.

use serde::{Deserialize, Serialize};

use crate::error::{GridError, Result};

// --- AST ---

#[derive(Debug, Clone)]
enum Expr {
    Number(f64),
    Var(usize),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    BinOp(BinOp, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
}

#[derive(Debug, Clone, Copy)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy)]
enum Func {
    Abs,
    Sqrt,
    Log,
    Exp,
    Pow,
    Min,
    Max,
    Sin,
    Cos,
    Tan,
    Atan,
    Atan2,
}

impl Func {
    fn lookup(name: &str) -> Option<(Func, usize)> {
        let f = match name {
            "abs" => (Func::Abs, 1),
            "sqrt" => (Func::Sqrt, 1),
            "log" => (Func::Log, 1),
            "exp" => (Func::Exp, 1),
            "pow" => (Func::Pow, 2),
            "min" => (Func::Min, 2),
            "max" => (Func::Max, 2),
            "sin" => (Func::Sin, 1),
            "cos" => (Func::Cos, 1),
            "tan" => (Func::Tan, 1),
            "atan" => (Func::Atan, 1),
            "atan2" => (Func::Atan2, 2),
            _ => return None,
        };
        Some(f)
    }
}

/// A column reference, optionally into a multi-valued column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarRef {
    pub column: String,
    pub index: Option<usize>,
}

impl std::fmt::Display for VarRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.index {
            Some(i) => write!(f, "{}[{i}]", self.column),
            None => write!(f, "{}", self.column),
        }
    }
}

/// Source of column values for one row.
///
/// `None` means the value is unavailable for this row (NULL cell or index
/// past the end of an array); the row is then treated as missing.
pub trait Row {
    fn value(&self, var: &VarRef) -> Option<f64>;
}

// --- Compiled expression ---

/// A compiled expression ready for evaluation.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    source: String,
    ast: Expr,
    /// Columns referenced, ordered by first occurrence.
    pub variables: Vec<VarRef>,
}

impl CompiledExpr {
    pub fn compile(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(GridError::Expression("empty expression".into()));
        }
        let mut parser = Parser::new(&tokens);
        let ast = parser.parse_or()?;
        if parser.pos < parser.tokens.len() {
            return Err(GridError::Expression(format!(
                "unexpected token after expression in '{input}': {:?}",
                parser.tokens[parser.pos]
            )));
        }
        let variables = std::mem::take(&mut parser.variables);
        Ok(CompiledExpr {
            source: input.trim().to_string(),
            ast,
            variables,
        })
    }

    /// A constant expression, used for default unit weights.
    pub fn constant(value: f64) -> Self {
        CompiledExpr {
            source: value.to_string(),
            ast: Expr::Number(value),
            variables: Vec::new(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate with values aligned to `variables`.
    pub fn eval_values(&self, values: &[f64]) -> f64 {
        eval_expr(&self.ast, values)
    }

    /// Evaluate against a row; `None` if any referenced value is missing.
    pub fn eval<R: Row + ?Sized>(&self, row: &R) -> Option<f64> {
        let mut values = Vec::with_capacity(self.variables.len());
        for v in &self.variables {
            values.push(row.value(v)?);
        }
        Some(eval_expr(&self.ast, &values))
    }

    /// Evaluate as a predicate.
    pub fn test<R: Row + ?Sized>(&self, row: &R) -> Option<bool> {
        self.eval(row).map(|v| v > 0.0)
    }
}

// --- Evaluation ---

fn truth(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

fn eval_expr(e: &Expr, vals: &[f64]) -> f64 {
    match e {
        Expr::Number(n) => *n,
        Expr::Var(i) => vals[*i],
        Expr::Neg(a) => -eval_expr(a, vals),
        Expr::Not(a) => truth(eval_expr(a, vals) <= 0.0),
        Expr::BinOp(op, a, b) => {
            let lhs = eval_expr(a, vals);
            let rhs = eval_expr(b, vals);
            match op {
                BinOp::Add => lhs + rhs,
                BinOp::Sub => lhs - rhs,
                BinOp::Mul => lhs * rhs,
                BinOp::Div => lhs / rhs,
                BinOp::Eq => truth((lhs - rhs).abs() < f64::EPSILON),
                BinOp::Ne => truth((lhs - rhs).abs() >= f64::EPSILON),
                BinOp::Lt => truth(lhs < rhs),
                BinOp::Le => truth(lhs <= rhs),
                BinOp::Gt => truth(lhs > rhs),
                BinOp::Ge => truth(lhs >= rhs),
                BinOp::And => truth(lhs > 0.0 && rhs > 0.0),
                BinOp::Or => truth(lhs > 0.0 || rhs > 0.0),
            }
        }
        Expr::Call(f, args) => {
            let a0 = || eval_expr(&args[0], vals);
            let a1 = || eval_expr(&args[1], vals);
            match f {
                Func::Abs => a0().abs(),
                Func::Sqrt => a0().sqrt(),
                Func::Log => a0().ln(),
                Func::Exp => a0().exp(),
                Func::Pow => a0().powf(a1()),
                Func::Min => a0().min(a1()),
                Func::Max => a0().max(a1()),
                Func::Sin => a0().sin(),
                Func::Cos => a0().cos(),
                Func::Tan => a0().tan(),
                Func::Atan => a0().atan(),
                Func::Atan2 => a0().atan2(a1()),
            }
        }
    }
}

// --- Tokenizer ---

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if let Some(&next) = chars.get(i + 1) {
            let tok = match (c, next) {
                ('&', '&') => Some(Token::And),
                ('|', '|') => Some(Token::Or),
                ('=', '=') => Some(Token::Eq),
                ('!', '=') => Some(Token::Ne),
                ('<', '=') => Some(Token::Le),
                ('>', '=') => Some(Token::Ge),
                _ => None,
            };
            if let Some(t) = tok {
                tokens.push(t);
                i += 2;
                continue;
            }
        }

        let single = match c {
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Star),
            '/' => Some(Token::Slash),
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            '[' => Some(Token::LBracket),
            ']' => Some(Token::RBracket),
            ',' => Some(Token::Comma),
            '<' => Some(Token::Lt),
            '>' => Some(Token::Gt),
            '!' => Some(Token::Not),
            _ => None,
        };
        if let Some(t) = single {
            tokens.push(t);
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || c == '.' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_ascii_digit()
                    || chars[i] == '.'
                    || chars[i] == 'e'
                    || chars[i] == 'E'
                    || ((chars[i] == '+' || chars[i] == '-')
                        && i > start
                        && (chars[i - 1] == 'e' || chars[i - 1] == 'E')))
            {
                i += 1;
            }
            let s: String = chars[start..i].iter().collect();
            let n: f64 = s
                .parse()
                .map_err(|_| GridError::Expression(format!("invalid number: '{s}'")))?;
            tokens.push(Token::Num(n));
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else {
            return Err(GridError::Expression(format!(
                "unexpected character '{c}' in '{input}'"
            )));
        }
    }

    Ok(tokens)
}

// --- Parser (recursive descent) ---

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    variables: Vec<VarRef>,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self {
            tokens,
            pos: 0,
            variables: Vec::new(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, expected: &Token) -> Result<()> {
        match self.advance() {
            Some(t) if t == expected => Ok(()),
            other => Err(GridError::Expression(format!(
                "expected {expected:?}, got {other:?}"
            ))),
        }
    }

    fn resolve_var(&mut self, var: VarRef) -> usize {
        if let Some(i) = self.variables.iter().position(|v| *v == var) {
            i
        } else {
            self.variables.push(var);
            self.variables.len() - 1
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::BinOp(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_cmp()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let rhs = self.parse_cmp()?;
            lhs = Expr::BinOp(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> Result<Expr> {
        let lhs = self.parse_add()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Le) => BinOp::Le,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Ge) => BinOp::Ge,
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.parse_add()?;
        Ok(Expr::BinOp(op, Box::new(lhs), Box::new(rhs)))
    }

    fn parse_add(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_mul()?;
            lhs = Expr::BinOp(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::BinOp(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Minus) => {
                self.advance();
                Ok(Expr::Neg(Box::new(self.parse_unary()?)))
            }
            Some(Token::Plus) => {
                self.advance();
                self.parse_unary()
            }
            Some(Token::Not) => {
                self.advance();
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            _ => self.parse_atom(),
        }
    }

    fn parse_atom(&mut self) -> Result<Expr> {
        match self.advance().cloned() {
            Some(Token::Num(n)) => Ok(Expr::Number(n)),
            Some(Token::LParen) => {
                let e = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(e)
            }
            Some(Token::Ident(name)) => match self.peek().cloned() {
                Some(Token::LParen) => {
                    self.advance();
                    let (func, arity) = Func::lookup(&name).ok_or_else(|| {
                        GridError::Expression(format!("unknown function: '{name}'"))
                    })?;
                    let mut args = vec![self.parse_or()?];
                    while matches!(self.peek(), Some(Token::Comma)) {
                        self.advance();
                        args.push(self.parse_or()?);
                    }
                    self.expect(&Token::RParen)?;
                    if args.len() != arity {
                        return Err(GridError::Expression(format!(
                            "{name} takes {arity} argument(s), got {}",
                            args.len()
                        )));
                    }
                    Ok(Expr::Call(func, args))
                }
                Some(Token::LBracket) => {
                    self.advance();
                    let index = match self.advance().cloned() {
                        Some(Token::Num(n)) if n >= 0.0 && n.fract() == 0.0 => n as usize,
                        other => {
                            return Err(GridError::Expression(format!(
                                "index of '{name}' must be a non-negative integer, got {other:?}"
                            )));
                        }
                    };
                    self.expect(&Token::RBracket)?;
                    let idx = self.resolve_var(VarRef {
                        column: name,
                        index: Some(index),
                    });
                    Ok(Expr::Var(idx))
                }
                _ => {
                    let idx = self.resolve_var(VarRef {
                        column: name,
                        index: None,
                    });
                    Ok(Expr::Var(idx))
                }
            },
            other => Err(GridError::Expression(format!(
                "expected number, identifier, or '(', got {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapRow(HashMap<String, Vec<f64>>);

    impl Row for MapRow {
        fn value(&self, var: &VarRef) -> Option<f64> {
            let col = self.0.get(&var.column)?;
            col.get(var.index.unwrap_or(0)).copied()
        }
    }

    fn row(cols: &[(&str, &[f64])]) -> MapRow {
        MapRow(
            cols.iter()
                .map(|(k, v)| (k.to_string(), v.to_vec()))
                .collect(),
        )
    }

    #[test]
    fn test_arithmetic_precedence() {
        let e = CompiledExpr::compile("2 + 3 * 4 - -1").unwrap();
        assert!(e.variables.is_empty());
        assert!((e.eval_values(&[]) - 15.0).abs() < 1e-12);
    }

    #[test]
    fn test_variables_in_first_occurrence_order() {
        let e = CompiledExpr::compile("pt * w + pt").unwrap();
        let names: Vec<_> = e.variables.iter().map(|v| v.to_string()).collect();
        assert_eq!(names, vec!["pt", "w"]);
        assert!((e.eval_values(&[10.0, 0.5]) - 15.0).abs() < 1e-12);
    }

    #[test]
    fn test_indexed_columns() {
        let e = CompiledExpr::compile("jet_pt[0] + jet_pt[1]").unwrap();
        assert_eq!(e.variables.len(), 2);
        assert_eq!(e.variables[1].index, Some(1));

        let r = row(&[("jet_pt", &[40.0, 25.0])]);
        assert_eq!(e.eval(&r), Some(65.0));

        let short = row(&[("jet_pt", &[40.0])]);
        assert_eq!(e.eval(&short), None);
    }

    #[test]
    fn test_selection_predicate() {
        let e = CompiledExpr::compile("njet >= 2 && !(lep_pt < 20)").unwrap();
        assert_eq!(e.test(&row(&[("njet", &[2.0]), ("lep_pt", &[25.0])])), Some(true));
        assert_eq!(e.test(&row(&[("njet", &[1.0]), ("lep_pt", &[25.0])])), Some(false));
        assert_eq!(e.test(&row(&[("njet", &[3.0]), ("lep_pt", &[15.0])])), Some(false));
    }

    #[test]
    fn test_functions() {
        let e = CompiledExpr::compile("atan2(y, x)").unwrap();
        assert!((e.eval_values(&[1.0, 0.0]) - std::f64::consts::FRAC_PI_2).abs() < 1e-12);

        let e = CompiledExpr::compile("sqrt(pow(a, 2) + pow(b, 2))").unwrap();
        assert!((e.eval_values(&[3.0, 4.0]) - 5.0).abs() < 1e-12);

        let e = CompiledExpr::compile("max(a, min(b, 3))").unwrap();
        assert!((e.eval_values(&[1.0, 7.0]) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_scientific_and_division() {
        let e = CompiledExpr::compile("MET / 1.0e3").unwrap();
        assert!((e.eval_values(&[45_000.0]) - 45.0).abs() < 1e-12);
    }

    #[test]
    fn test_errors() {
        assert!(CompiledExpr::compile("").is_err());
        assert!(CompiledExpr::compile("foo(1)").is_err());
        assert!(CompiledExpr::compile("pow(1)").is_err());
        assert!(CompiledExpr::compile("a[1.5]").is_err());
        assert!(CompiledExpr::compile("a +").is_err());
        assert!(CompiledExpr::compile("a $ b").is_err());
        assert!(CompiledExpr::compile("(a + b").is_err());
    }

    #[test]
    fn test_constant() {
        let e = CompiledExpr::constant(1.0);
        assert_eq!(e.eval(&row(&[])), Some(1.0));
    }
}
