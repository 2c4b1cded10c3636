use async_trait::async_trait;
use serde_json::{Value, json};

use super::{Tool, ToolContext, ToolError};

pub struct CalculatorTool;

fn number_arg(args: &Value, key: &'static str) -> Result<f64, ToolError> {
    match args.get(key) {
        None | Some(Value::Null) => Err(ToolError::MissingArgument(key)),
        Some(Value::Number(n)) => n.as_f64().ok_or(ToolError::NotANumber(key)),
        Some(Value::String(s)) => s.trim().parse::<f64>().map_err(|_| ToolError::NotANumber(key)),
        Some(_) => Err(ToolError::NotANumber(key)),
    }
}

pub fn calculate(args: &Value) -> Result<f64, ToolError> {
    let first = number_arg(args, "first_num")?;
    let second = number_arg(args, "second_num")?;
    let operation = args.get("operation").and_then(|v| v.as_str()).ok_or(ToolError::MissingArgument("operation"))?;
    let result = match operation {
        "add" => first + second,
        "sub" => first - second,
        "mul" => first * second,
        "div" if second == 0.0 => return Err(ToolError::DivisionByZero),
        "div" => first / second,
        other => return Err(ToolError::UnsupportedOperation(other.to_string())),
    };
    if !result.is_finite() {
        return Err(ToolError::OutOfRange);
    }
    Ok(result)
}

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &'static str { "calculator" }

    fn description(&self) -> &'static str {
        "Perform a basic arithmetic operation on two numbers. Supported operations: add, sub, mul, div."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "first_num": {"type": "number"},
                "second_num": {"type": "number"},
                "operation": {"type": "string", "enum": ["add", "sub", "mul", "div"]},
            },
            "required": ["first_num", "second_num", "operation"],
        })
    }

    async fn run(&self, _ctx: ToolContext<'_>, args: Value) -> anyhow::Result<Value> {
        // Every failure becomes an error payload; nothing escapes to the caller.
        Ok(match calculate(&args) {
            Ok(result) => json!({ "result": result }),
            Err(e) => json!({ "error": e.to_string() }),
        })
    }
}
