//! Arithmetic for the `calculate` tool.
//!
//! A small recursive-descent evaluator over `f64`. Operator precedence follows
//! the usual calculator rules: `**` binds tighter than unary minus, and is
//! right associative.

use std::f64::consts;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CalcError {
    #[error("Error: Division by zero.")]
    DivisionByZero,
    #[error("Invalid expression: {0}")]
    Invalid(String),
}

fn invalid(message: impl Into<String>) -> CalcError {
    CalcError::Invalid(message.into())
}

/// Evaluates `expression` and renders it as `"{expression} = {result}"`.
pub fn calculate(expression: &str) -> Result<String, CalcError> {
    let expression = expression.trim();
    let value = evaluate(expression)?;
    Ok(format!("{expression} = {}", format_number(value)))
}

/// Evaluates a math expression. `^` is accepted for powers and thousands
/// separators such as `2,400` are ignored.
pub fn evaluate(expression: &str) -> Result<f64, CalcError> {
    let cleaned = strip_thousands_separators(&expression.trim().replace('^', "**"));
    let tokens = tokenize(&cleaned)?;
    if tokens.is_empty() {
        return Err(invalid("empty expression"));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.expr()?;
    if let Some(token) = parser.peek() {
        return Err(invalid(format!("unexpected '{token}'")));
    }
    if value.is_nan() {
        return Err(invalid("math domain error"));
    }
    if value.is_infinite() {
        return Err(invalid("result is too large"));
    }
    Ok(value)
}

/// Whole numbers print without decimals; everything else with up to six
/// significant figures.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        return format!("{value:.0}");
    }
    // Round to six significant figures first so the exponent is final.
    let scientific = format!("{value:.5e}");
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((&scientific, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    if !(-4..6).contains(&exponent) {
        let sign = if exponent < 0 { '-' } else { '+' };
        return format!(
            "{}e{sign}{:02}",
            trim_zeros(mantissa),
            exponent.unsigned_abs()
        );
    }
    let decimals = (5 - exponent).max(0) as usize;
    trim_zeros(&format!("{value:.decimals$}")).to_string()
}

fn trim_zeros(number: &str) -> &str {
    if number.contains('.') {
        number.trim_end_matches('0').trim_end_matches('.')
    } else {
        number
    }
}

/// Drops commas that group digits in threes, keeping argument separators.
fn strip_thousands_separators(expression: &str) -> String {
    let chars: Vec<char> = expression.chars().collect();
    let mut out = String::with_capacity(expression.len());
    for (i, &c) in chars.iter().enumerate() {
        if c == ',' {
            let after_digit = i > 0 && chars[i - 1].is_ascii_digit();
            let group = chars.get(i + 1..i + 4).is_some_and(|g| g.iter().all(char::is_ascii_digit));
            let group_ends = chars.get(i + 4).is_none_or(|c| !c.is_ascii_digit());
            if after_digit && group && group_ends {
                continue;
            }
        }
        out.push(c);
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    DoubleSlash,
    Percent,
    Power,
    LParen,
    RParen,
    Comma,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{n}"),
            Token::Ident(name) => write!(f, "{name}"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::DoubleSlash => write!(f, "//"),
            Token::Percent => write!(f, "%"),
            Token::Power => write!(f, "**"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Comma => write!(f, ","),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, CalcError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            _ if c.is_whitespace() => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // Exponent only when digits follow, so `2e` stays `2` then `e`.
                if i < chars.len() && matches!(chars[i], 'e' | 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && matches!(chars[j], '+' | '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let literal: String = chars[start..i].iter().collect();
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| invalid(format!("bad number '{literal}'")))?;
                tokens.push(Token::Number(value));
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            '*' if chars.get(i + 1) == Some(&'*') => {
                tokens.push(Token::Power);
                i += 2;
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                tokens.push(Token::DoubleSlash);
                i += 2;
            }
            _ => {
                let token = match c {
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' => Token::Star,
                    '/' => Token::Slash,
                    '%' => Token::Percent,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    ',' => Token::Comma,
                    other => return Err(invalid(format!("unexpected character '{other}'"))),
                };
                tokens.push(token);
                i += 1;
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

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expr(&mut self) -> Result<f64, CalcError> {
        let mut value = self.term()?;
        loop {
            if self.eat(&Token::Plus) {
                value += self.term()?;
            } else if self.eat(&Token::Minus) {
                value -= self.term()?;
            } else {
                return Ok(value);
            }
        }
    }

    fn term(&mut self) -> Result<f64, CalcError> {
        let mut value = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(op @ (Token::Star | Token::Slash | Token::DoubleSlash | Token::Percent)) => {
                    op.clone()
                }
                _ => return Ok(value),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            value = match op {
                Token::Star => value * rhs,
                _ if rhs == 0.0 => return Err(CalcError::DivisionByZero),
                Token::Slash => value / rhs,
                Token::DoubleSlash => (value / rhs).floor(),
                // Result takes the sign of the divisor.
                _ => value - rhs * (value / rhs).floor(),
            };
        }
    }

    fn unary(&mut self) -> Result<f64, CalcError> {
        if self.eat(&Token::Minus) {
            return Ok(-self.unary()?);
        }
        if self.eat(&Token::Plus) {
            return self.unary();
        }
        self.power()
    }

    fn power(&mut self) -> Result<f64, CalcError> {
        let base = self.atom()?;
        if self.eat(&Token::Power) {
            let exponent = self.unary()?;
            if base == 0.0 && exponent < 0.0 {
                return Err(CalcError::DivisionByZero);
            }
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<f64, CalcError> {
        match self.next() {
            Some(Token::Number(value)) => Ok(value),
            Some(Token::LParen) => {
                let value = self.expr()?;
                if !self.eat(&Token::RParen) {
                    return Err(invalid("missing ')'"));
                }
                Ok(value)
            }
            Some(Token::Ident(name)) => {
                if self.eat(&Token::LParen) {
                    let args = self.arguments()?;
                    return call(&name, &args);
                }
                constant(&name)
            }
            Some(token) => Err(invalid(format!("unexpected '{token}'"))),
            None => Err(invalid("unexpected end of expression")),
        }
    }

    fn arguments(&mut self) -> Result<Vec<f64>, CalcError> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            if self.eat(&Token::RParen) {
                return Ok(args);
            }
            if !self.eat(&Token::Comma) {
                return Err(invalid("missing ')'"));
            }
        }
    }
}

const FUNCTIONS: [&str; 10] = [
    "abs", "round", "sqrt", "ceil", "floor", "log", "log10", "sin", "cos", "tan",
];

fn constant(name: &str) -> Result<f64, CalcError> {
    match name {
        "pi" => Ok(consts::PI),
        "e" => Ok(consts::E),
        _ if FUNCTIONS.contains(&name) => {
            Err(invalid(format!("'{name}' is a function, not a constant")))
        }
        _ => Err(invalid(format!("Unknown variable: {name}"))),
    }
}

fn call(name: &str, args: &[f64]) -> Result<f64, CalcError> {
    let arity = |expected: usize| {
        if args.len() == expected {
            Ok(())
        } else {
            Err(invalid(format!(
                "{name}() takes {expected} argument(s), got {}",
                args.len()
            )))
        }
    };
    match name {
        "round" => match *args {
            [x] => Ok(x.round_ties_even()),
            [x, digits] => {
                let scale = 10f64.powi(digits as i32);
                Ok((x * scale).round_ties_even() / scale)
            }
            _ => Err(invalid("round() takes 1 or 2 arguments")),
        },
        "log" => match *args {
            [x] if x > 0.0 => Ok(x.ln()),
            [x, base] if x > 0.0 && base > 0.0 && base != 1.0 => Ok(x.log(base)),
            [_] | [_, _] => Err(invalid("math domain error")),
            _ => Err(invalid("log() takes 1 or 2 arguments")),
        },
        "abs" | "sqrt" | "ceil" | "floor" | "log10" | "sin" | "cos" | "tan" => {
            arity(1)?;
            let x = args[0];
            match name {
                "abs" => Ok(x.abs()),
                "sqrt" if x < 0.0 => Err(invalid("math domain error")),
                "sqrt" => Ok(x.sqrt()),
                "ceil" => Ok(x.ceil()),
                "floor" => Ok(x.floor()),
                "log10" if x <= 0.0 => Err(invalid("math domain error")),
                "log10" => Ok(x.log10()),
                "sin" => Ok(x.sin()),
                "cos" => Ok(x.cos()),
                _ => Ok(x.tan()),
            }
        }
        _ => Err(invalid(format!("Function '{name}' is not allowed"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic_and_precedence() {
        assert_eq!(evaluate("2 + 3 * 4").unwrap(), 14.0);
        assert_eq!(evaluate("(100 + 50) / 3").unwrap(), 50.0);
        assert_eq!(evaluate("2^10").unwrap(), 1024.0);
        assert_eq!(evaluate("2 ** 3 ** 2").unwrap(), 512.0);
        assert_eq!(evaluate("-2 ** 2").unwrap(), -4.0);
        assert_eq!(evaluate("2 ** -1").unwrap(), 0.5);
        assert_eq!(evaluate("7 // 2").unwrap(), 3.0);
        assert_eq!(evaluate("-7 % 3").unwrap(), 2.0);
        assert_eq!(evaluate("2,400 * 0.15").unwrap(), 360.0);
        assert_eq!(evaluate("1e3 + 1").unwrap(), 1001.0);
    }

    #[test]
    fn test_functions_and_constants() {
        assert_eq!(evaluate("sqrt(144)").unwrap(), 12.0);
        assert_eq!(evaluate("round(2.5)").unwrap(), 2.0);
        assert_eq!(evaluate("round(3.14159, 2)").unwrap(), 3.14);
        assert_eq!(evaluate("abs(-4) + ceil(1.2) + floor(1.8)").unwrap(), 7.0);
        assert_eq!(evaluate("log10(1000)").unwrap(), 3.0);
        assert!((evaluate("2 * pi").unwrap() - std::f64::consts::TAU).abs() < 1e-12);
        assert!((evaluate("log(e)").unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_errors() {
        assert_eq!(evaluate("1 / 0"), Err(CalcError::DivisionByZero));
        assert_eq!(evaluate("5 % 0"), Err(CalcError::DivisionByZero));
        assert!(matches!(evaluate("sqrt(-1)"), Err(CalcError::Invalid(m)) if m == "math domain error"));
        assert!(matches!(evaluate("exec(1)"), Err(CalcError::Invalid(m)) if m.contains("not allowed")));
        assert!(matches!(evaluate("x + 1"), Err(CalcError::Invalid(m)) if m.contains("Unknown variable")));
        assert!(matches!(evaluate("sqrt"), Err(CalcError::Invalid(m)) if m.contains("not a constant")));
        assert!(matches!(evaluate("(1 + 2"), Err(CalcError::Invalid(_))));
        assert!(matches!(evaluate("1 + "), Err(CalcError::Invalid(_))));
        assert!(matches!(evaluate("import os"), Err(CalcError::Invalid(_))));
        assert!(matches!(evaluate(""), Err(CalcError::Invalid(_))));
    }

    #[test]
    fn test_result_formatting() {
        assert_eq!(calculate(" 2400 * 0.15 ").unwrap(), "2400 * 0.15 = 360");
        assert_eq!(calculate("10 / 3").unwrap(), "10 / 3 = 3.33333");
        assert_eq!(calculate("1 / 8").unwrap(), "1 / 8 = 0.125");
        assert_eq!(format_number(123456.7), "123457");
        assert_eq!(format_number(1234567.5), "1.23457e+06");
        assert_eq!(format_number(0.0001234), "0.0001234");
        assert_eq!(format_number(0.00001234), "1.234e-05");
        assert_eq!(format_number(-0.5), "-0.5");
        assert_eq!(
            calculate("1 / 0").unwrap_err().to_string(),
            "Error: Division by zero."
        );
    }
}
