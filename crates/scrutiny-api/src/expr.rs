//! Arithmetic expressions accepted as write values.
//!
//! A client may send a string instead of a number when writing a watchable;
//! the server evaluates it with this grammar before applying the write:
//!
//! ```text
//! expr  := add
//! add   := mul (('+' | '-') mul)*
//! mul   := pow (('*' | '/') pow)*
//! pow   := unary ('^' pow)?
//! unary := '-' unary | '(' expr ')' | number | ident | ident '(' args ')'
//! ```
//!
//! `^` is right associative and unary minus binds tighter than `^`
//! (`-2^2 == 4`). Identifiers are case-insensitive.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("Unexpected end of expression")]
    UnexpectedEnd,

    #[error("Unexpected character '{ch}' at index {index}")]
    UnexpectedChar { ch: char, index: usize },

    #[error("Malformed number at index {index}")]
    BadNumber { index: usize },

    #[error("Unrecognized identifier '{0}'")]
    UnknownIdentifier(String),

    #[error("Function {name} takes {expected} argument(s), got {got}")]
    Arity {
        name: &'static str,
        expected: &'static str,
        got: usize,
    },

    #[error("Division by zero at index {index}")]
    DivisionByZero { index: usize },

    #[error("Expression does not evaluate to a finite number")]
    NotFinite,

    #[error("Expression nests deeper than {limit} levels")]
    TooDeep { limit: usize },
}

/// Deepest nesting of parentheses, unary minus, `^` chains and function
/// arguments accepted before parsing stops.
pub const MAX_DEPTH: usize = 256;

/// Evaluate `input` to a finite number.
pub fn evaluate(input: &str) -> Result<f64, ExprError> {
    let mut parser = Parser {
        src: input.as_bytes(),
        pos: 0,
        depth: 0,
    };
    let value = parser.expr()?;
    parser.skip_ws();
    if let Some(ch) = parser.peek() {
        return Err(ExprError::UnexpectedChar {
            ch: ch as char,
            index: parser.pos,
        });
    }
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ExprError::NotFinite)
    }
}

// ── Parser ───────────────────────────────────────────────────────────

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
    depth: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, expected: u8) -> bool {
        self.skip_ws();
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: u8) -> Result<(), ExprError> {
        if self.eat(expected) {
            return Ok(());
        }
        Err(self.unexpected())
    }

    fn unexpected(&self) -> ExprError {
        match self.peek() {
            Some(ch) => ExprError::UnexpectedChar {
                ch: ch as char,
                index: self.pos,
            },
            None => ExprError::UnexpectedEnd,
        }
    }

    /// Run one level of recursive descent, bounded by [`MAX_DEPTH`].
    fn nested(
        &mut self,
        rule: fn(&mut Self) -> Result<f64, ExprError>,
    ) -> Result<f64, ExprError> {
        if self.depth >= MAX_DEPTH {
            return Err(ExprError::TooDeep { limit: MAX_DEPTH });
        }
        self.depth += 1;
        let value = rule(self);
        self.depth -= 1;
        value
    }

    fn expr(&mut self) -> Result<f64, ExprError> {
        let mut value = self.mul()?;
        loop {
            if self.eat(b'+') {
                value += self.mul()?;
            } else if self.eat(b'-') {
                value -= self.mul()?;
            } else {
                return Ok(value);
            }
        }
    }

    fn mul(&mut self) -> Result<f64, ExprError> {
        let mut value = self.pow()?;
        loop {
            if self.eat(b'*') {
                value *= self.pow()?;
            } else if self.eat(b'/') {
                let index = self.pos - 1;
                let divisor = self.pow()?;
                if divisor == 0.0 {
                    return Err(ExprError::DivisionByZero { index });
                }
                value /= divisor;
            } else {
                return Ok(value);
            }
        }
    }

    fn pow(&mut self) -> Result<f64, ExprError> {
        let base = self.unary()?;
        if self.eat(b'^') {
            let exponent = self.nested(Self::pow)?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn unary(&mut self) -> Result<f64, ExprError> {
        self.skip_ws();
        match self.peek() {
            Some(b'-') => {
                self.pos += 1;
                Ok(-self.nested(Self::unary)?)
            }
            Some(b'(') => {
                self.pos += 1;
                let value = self.nested(Self::expr)?;
                self.expect(b')')?;
                Ok(value)
            }
            Some(b'0'..=b'9' | b'.') => self.number(),
            Some(ch) if ch.is_ascii_alphabetic() || ch == b'_' => self.identifier(),
            _ => Err(self.unexpected()),
        }
    }

    fn number(&mut self) -> Result<f64, ExprError> {
        let start = self.pos;
        let mut seen_dot = false;
        while let Some(ch) = self.peek() {
            match ch {
                b'0'..=b'9' => {}
                b'.' if !seen_dot => seen_dot = true,
                b'.' => return Err(ExprError::BadNumber { index: self.pos }),
                _ => break,
            }
            self.pos += 1;
        }

        // Exponent only when digits follow, so `2e` still reads as `2` then `e`.
        if matches!(self.peek(), Some(b'e' | b'E')) {
            let mut look = self.pos + 1;
            if matches!(self.src.get(look), Some(b'+' | b'-')) {
                look += 1;
            }
            if self.src.get(look).is_some_and(u8::is_ascii_digit) {
                self.pos = look;
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
            }
        }

        std::str::from_utf8(&self.src[start..self.pos])
            .ok()
            .and_then(|text| text.parse::<f64>().ok())
            .ok_or(ExprError::BadNumber { index: start })
    }

    fn identifier(&mut self) -> Result<f64, ExprError> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_')
        {
            self.pos += 1;
        }
        let name = String::from_utf8_lossy(&self.src[start..self.pos]).to_ascii_lowercase();

        if let Some(func) = Function::lookup(&name) {
            let args = self.arguments()?;
            return func.apply(&args);
        }
        match name.as_str() {
            "pi" => Ok(std::f64::consts::PI),
            "e" => Ok(std::f64::consts::E),
            _ => Err(ExprError::UnknownIdentifier(name)),
        }
    }

    fn arguments(&mut self) -> Result<Vec<f64>, ExprError> {
        self.expect(b'(')?;
        let mut args = Vec::new();
        if self.eat(b')') {
            return Ok(args);
        }
        loop {
            args.push(self.nested(Self::expr)?);
            if self.eat(b')') {
                return Ok(args);
            }
            self.expect(b',')?;
        }
    }
}

// ── Functions ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Function {
    Unary(&'static str, fn(f64) -> f64),
    Binary(&'static str, fn(f64, f64) -> f64),
    Log,
}

const FUNCTIONS: &[Function] = &[
    Function::Unary("abs", f64::abs),
    Function::Unary("acos", f64::acos),
    Function::Unary("asin", f64::asin),
    Function::Unary("atan", f64::atan),
    Function::Binary("atan2", f64::atan2),
    Function::Unary("ceil", f64::ceil),
    Function::Unary("cos", f64::cos),
    Function::Unary("cosh", f64::cosh),
    Function::Unary("degrees", f64::to_degrees),
    Function::Unary("exp", f64::exp),
    Function::Unary("fabs", f64::abs),
    Function::Unary("floor", f64::floor),
    Function::Binary("fmod", fmod),
    Function::Binary("hypot", f64::hypot),
    Function::Log,
    Function::Unary("log10", f64::log10),
    Function::Binary("pow", f64::powf),
    Function::Unary("radians", f64::to_radians),
    Function::Unary("sin", f64::sin),
    Function::Unary("sinh", f64::sinh),
    Function::Unary("sqrt", f64::sqrt),
    Function::Unary("tan", f64::tan),
    Function::Unary("tanh", f64::tanh),
];

fn fmod(x: f64, y: f64) -> f64 {
    x % y
}

impl Function {
    fn name(self) -> &'static str {
        match self {
            Self::Unary(name, _) | Self::Binary(name, _) => name,
            Self::Log => "log",
        }
    }

    fn lookup(name: &str) -> Option<Self> {
        FUNCTIONS.iter().copied().find(|f| f.name() == name)
    }

    fn apply(self, args: &[f64]) -> Result<f64, ExprError> {
        match (self, args) {
            (Self::Unary(_, f), [x]) => Ok(f(*x)),
            (Self::Binary(_, f), [x, y]) => Ok(f(*x, *y)),
            (Self::Log, [x]) => Ok(x.ln()),
            (Self::Log, [x, base]) => Ok(x.ln() / base.ln()),
            _ => Err(ExprError::Arity {
                name: self.name(),
                expected: match self {
                    Self::Unary(..) => "1",
                    Self::Binary(..) => "2",
                    Self::Log => "1 or 2",
                },
                got: args.len(),
            }),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
