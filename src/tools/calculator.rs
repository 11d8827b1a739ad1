use serde_json::{json, Value};

use super::{Tool, ToolError};

/// Evaluates arithmetic expressions.
pub struct Calculator;

impl Calculator {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(expression: &str) -> Result<f64, ToolError> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Err(ToolError::Evaluation("empty expression".into()));
        }

        let value = meval::eval_str(expression).map_err(|e| ToolError::Evaluation(e.to_string()))?;
        if !value.is_finite() {
            return Err(ToolError::Evaluation(format!("result is {}", value)));
        }
        Ok(value)
    }

    /// Integral values print without a fractional part.
    fn format_number(value: f64) -> String {
        if value.fract() == 0.0 && value.abs() < 1e15 {
            format!("{}", value as i64)
        } else {
            value.to_string()
        }
    }
}

#[async_trait::async_trait]
impl Tool for Calculator {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Evaluate a simple math expression. Supports +, -, *, /, %, and power (^)."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "expression": {
                    "type": "string",
                    "description": "Math expression, e.g., 2+2*5"
                }
            },
            "required": ["expression"]
        })
    }

    async fn run(&self, args: Value) -> Result<String, ToolError> {
        let expression = match &args {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Object(map) => map
                .get("expression")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| ToolError::InvalidArguments("missing `expression`".into()))?,
            other => return Err(ToolError::InvalidArguments(format!("unexpected input: {}", other))),
        };

        let value = Self::evaluate(&expression)?;
        log::debug!("Calculator: {} = {}", expression, value);
        Ok(Self::format_number(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_basic_arithmetic() {
        let calc = Calculator::new();
        assert_eq!(calc.run(json!({"expression": "2+2*5"})).await.unwrap(), "12");
        assert_eq!(calc.run(json!({"expression": "2^10"})).await.unwrap(), "1024");
        assert_eq!(calc.run(json!({"expression": "10 % 4"})).await.unwrap(), "2");
        assert_eq!(calc.run(json!({"expression": "7 / 2"})).await.unwrap(), "3.5");
        assert_eq!(calc.run(json!("(1 + 2) * 3")).await.unwrap(), "9");
    }

    #[tokio::test]
    async fn test_functions_and_constants() {
        let calc = Calculator::new();
        assert_eq!(calc.run(json!({"expression": "sqrt(16)"})).await.unwrap(), "4");
        let pi: f64 = calc.run(json!({"expression": "pi"})).await.unwrap().parse().unwrap();
        assert!((pi - std::f64::consts::PI).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_malformed_expression() {
        let calc = Calculator::new();
        let err = calc.run(json!({"expression": "2 +* 3"})).await.unwrap_err();
        assert!(err.to_string().starts_with("Could not evaluate expression"));

        let err = calc.run(json!({"expression": "1/0"})).await.unwrap_err();
        assert!(matches!(err, ToolError::Evaluation(_)));

        let err = calc.run(json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
