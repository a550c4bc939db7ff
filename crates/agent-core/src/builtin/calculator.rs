//! Calculator Tool

use async_trait::async_trait;

use crate::error::{AgentError, Result};
use crate::tool::{ParameterSchema, Tool, ToolCall, ToolResult, ToolSchema};

/// Evaluates arithmetic expressions
pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "calculate".into(),
            description: "Evaluate a mathematical expression. Supports + - * / % ^, parentheses, \
                          pi, e and sqrt, abs, sin, cos, tan, ln, log, exp, round, floor, ceil, min, max \
                          (e.g. '2 + 3 * 4', 'sqrt(16)', 'sin(pi / 2)')"
                .into(),
            parameters: vec![ParameterSchema::required(
                "expression",
                "string",
                "Mathematical expression to evaluate",
            )],
            category: Some("math".into()),
            has_side_effects: false,
        }
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolResult> {
        let expr = call
            .str_arg("expression")
            .or_else(|| call.str_arg("input"))
            .ok_or_else(|| AgentError::ToolValidation("Missing expression".into()))?;

        if expr.trim().is_empty() {
            return Ok(ToolResult::failure("calculate", "Expression must not be empty"));
        }

        match evaluate(expr) {
            Ok(value) => {
                tracing::debug!(expression = %expr, value, "Evaluated expression");
                Ok(ToolResult::success("calculate", format_number(value))
                    .with_data(serde_json::json!({ "value": value })))
            }
            Err(e) => Ok(ToolResult::failure("calculate", format!("Calculation failed: {}", e))),
        }
    }
}

/// Render whole numbers without a fractional part
pub fn format_number(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Evaluate an arithmetic expression
pub fn evaluate(expr: &str) -> std::result::Result<f64, String> {
    let mut parser = Parser {
        chars: expr.chars().filter(|c| !c.is_whitespace()).collect(),
        pos: 0,
        depth: 0,
    };
    let value = parser.expression()?;
    match parser.peek() {
        None => Ok(value),
        Some(c) => Err(format!("Unexpected character '{}'", c)),
    }
}

/// Recursive descent over
/// `expr := term (('+'|'-') term)*`,
/// `term := unary (('*'|'/'|'%') unary)*`,
/// `unary := '-' unary | power`,
/// `power := atom (('^'|'**') unary)?`
///
/// Every recursive path passes through `unary`, which bounds the nesting.
struct Parser {
    chars: Vec<char>,
    pos: usize,
    depth: usize,
}

/// Deepest nesting of signs, parentheses, calls and exponents accepted
const MAX_DEPTH: usize = 128;

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expression(&mut self) -> std::result::Result<f64, String> {
        let mut value = self.term()?;
        loop {
            if self.eat('+') {
                value += self.term()?;
            } else if self.eat('-') {
                value -= self.term()?;
            } else {
                return Ok(value);
            }
        }
    }

    fn term(&mut self) -> std::result::Result<f64, String> {
        let mut value = self.unary()?;
        loop {
            if self.peek() == Some('*') && self.chars.get(self.pos + 1) != Some(&'*') {
                self.pos += 1;
                value *= self.unary()?;
            } else if self.eat('/') {
                let rhs = self.unary()?;
                if rhs == 0.0 {
                    return Err("Division by zero".into());
                }
                value /= rhs;
            } else if self.eat('%') {
                let rhs = self.unary()?;
                if rhs == 0.0 {
                    return Err("Modulo by zero".into());
                }
                value %= rhs;
            } else {
                return Ok(value);
            }
        }
    }

    fn unary(&mut self) -> std::result::Result<f64, String> {
        if self.depth >= MAX_DEPTH {
            return Err("Expression nested too deeply".into());
        }
        self.depth += 1;
        let value = if self.eat('-') {
            self.unary().map(|v| -v)
        } else if self.eat('+') {
            self.unary()
        } else {
            self.power()
        };
        self.depth -= 1;
        value
    }

    fn power(&mut self) -> std::result::Result<f64, String> {
        let base = self.atom()?;
        let is_pow = if self.eat('^') {
            true
        } else if self.peek() == Some('*') && self.chars.get(self.pos + 1) == Some(&'*') {
            self.pos += 2;
            true
        } else {
            false
        };
        if is_pow {
            // right-associative
            let exponent = self.unary()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn atom(&mut self) -> std::result::Result<f64, String> {
        match self.peek() {
            Some('(') => {
                self.pos += 1;
                let value = self.expression()?;
                if !self.eat(')') {
                    return Err("Missing closing parenthesis".into());
                }
                Ok(value)
            }
            Some(c) if c.is_ascii_digit() || c == '.' => self.number(),
            Some(c) if c.is_ascii_alphabetic() => self.identifier(),
            Some(c) => Err(format!("Unexpected character '{}'", c)),
            None => Err("Unexpected end of expression".into()),
        }
    }

    fn number(&mut self) -> std::result::Result<f64, String> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit() || c == '.') {
            self.pos += 1;
        }
        // exponent suffix, e.g. 1e-3
        if self.peek() == Some('e')
            && self
                .chars
                .get(self.pos + 1)
                .is_some_and(|c| c.is_ascii_digit() || *c == '-' || *c == '+')
        {
            self.pos += 2;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse::<f64>()
            .map_err(|_| format!("Invalid number '{}'", text))
    }

    fn identifier(&mut self) -> std::result::Result<f64, String> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        let name: String = self.chars[start..self.pos].iter().collect();

        if !self.eat('(') {
            return match name.as_str() {
                "pi" => Ok(std::f64::consts::PI),
                "e" => Ok(std::f64::consts::E),
                "tau" => Ok(std::f64::consts::TAU),
                _ => Err(format!("Unknown name '{}'", name)),
            };
        }

        let mut args = Vec::new();
        if !self.eat(')') {
            loop {
                args.push(self.expression()?);
                if self.eat(')') {
                    break;
                }
                if !self.eat(',') {
                    return Err(format!("Expected ',' or ')' in call to {}", name));
                }
            }
        }

        apply_function(&name, &args)
    }
}

fn apply_function(name: &str, args: &[f64]) -> std::result::Result<f64, String> {
    let unary = |f: fn(f64) -> f64| match args {
        [x] => Ok(f(*x)),
        _ => Err(format!("{} takes exactly one argument", name)),
    };

    match name {
        "sqrt" => match args {
            [x] if *x < 0.0 => Err("Square root of a negative number".into()),
            _ => unary(f64::sqrt),
        },
        "abs" => unary(f64::abs),
        "sin" => unary(f64::sin),
        "cos" => unary(f64::cos),
        "tan" => unary(f64::tan),
        "exp" => unary(f64::exp),
        "floor" => unary(f64::floor),
        "ceil" => unary(f64::ceil),
        "ln" => unary(f64::ln),
        "log" => match args {
            [x] => Ok(x.ln()),
            [x, base] => Ok(x.log(*base)),
            _ => Err("log takes one or two arguments".into()),
        },
        "round" => match args {
            [x] => Ok(x.round()),
            [x, digits] => {
                let factor = 10f64.powi(*digits as i32);
                Ok((x * factor).round() / factor)
            }
            _ => Err("round takes one or two arguments".into()),
        },
        "min" | "max" if args.is_empty() => Err(format!("{} needs at least one argument", name)),
        "min" => Ok(args.iter().copied().fold(f64::INFINITY, f64::min)),
        "max" => Ok(args.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
        _ => Err(format!("Unsupported function '{}'", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn approx(expr: &str, expected: f64) {
        let value = evaluate(expr).unwrap();
        assert!((value - expected).abs() < 1e-9, "{expr} = {value}, expected {expected}");
    }

    #[test]
    fn test_calculator() {
        approx("2 + 2", 4.0);
        approx("10 * 5", 50.0);
        approx("(2 + 3) * 4", 20.0);
        approx("2 ^ 8", 256.0);
        approx("2 ** 3 ** 2", 512.0);
        approx("2 + 3 * 4", 14.0);
        approx("-3 + 5", 2.0);
        approx("10 % 4", 2.0);
        approx("7 - 2 - 1", 4.0);
    }

    #[test]
    fn test_functions_and_constants() {
        approx("sqrt(16)", 4.0);
        approx("sin(pi / 2)", 1.0);
        approx("abs(-2.5)", 2.5);
        approx("round(3.14159, 2)", 3.14);
        approx("max(1, 7, 3)", 7.0);
        approx("log(100, 10)", 2.0);
        approx("exp(0)", 1.0);
        approx("2 * e", 2.0 * std::f64::consts::E);
    }

    #[test]
    fn test_errors() {
        assert_eq!(evaluate("1 / 0").unwrap_err(), "Division by zero");
        assert!(evaluate("(1 + 2").is_err());
        assert!(evaluate("foo(1)").is_err());
        assert!(evaluate("2 +").is_err());
        assert!(evaluate("import os").is_err());
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let signs = format!("{}1", "-".repeat(200_000));
        assert_eq!(evaluate(&signs).unwrap_err(), "Expression nested too deeply");

        let parens = format!("{}1{}", "(".repeat(100_000), ")".repeat(100_000));
        assert_eq!(evaluate(&parens).unwrap_err(), "Expression nested too deeply");

        let calls = format!("{}1{}", "abs(".repeat(50_000), ")".repeat(50_000));
        assert!(evaluate(&calls).is_err());

        let towers = format!("2{}", "^2".repeat(100_000));
        assert!(evaluate(&towers).is_err());

        // ordinary nesting still evaluates
        approx("--1", 1.0);
        approx(&format!("{}1{}", "(".repeat(20), ")".repeat(20)), 1.0);
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(4.0), "4");
        assert_eq!(format_number(2.5), "2.5");
    }

    #[tokio::test]
    async fn test_execute_reports_failure_as_result() {
        let mut args = HashMap::new();
        args.insert("expression".to_string(), serde_json::json!("1 / 0"));
        let result = CalculatorTool.execute(&ToolCall::new("calculate", args)).await.unwrap();
        assert!(!result.success);
        assert!(result.output.contains("Division by zero"));
    }
}
