//! Lua host for rule evaluations.
//!
//! A rule's `evaluation` source must define `function main(...)` taking one
//! parameter per declared metric and returning a message string and a
//! result code — in either order; the host dispatches on the value types.
//! Scripts see the numeric constants `OK`, `WARNING`/`HIGH_WARNING`,
//! `CRITICAL`/`HIGH_CRITICAL`, `LOW_WARNING`, `LOW_CRITICAL`, the strings
//! `INAME` and `NAME`, and every rule variable as a global.

use mlua::{Lua, LuaOptions, MultiValue, StdLib, Value};
use std::collections::BTreeMap;

/// Errors raised by script compilation or evaluation. The engine collapses
/// all of them into the rule-error sentinel: no alert is emitted and the
/// audit log records `ERROR`.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("Script: compilation failed: {0}")]
    Compile(String),

    /// The rule failed to compile earlier and stays inert until replaced.
    #[error("Script: rule is inert after a failed compilation")]
    Inert,

    #[error("Script: call failed: {0}")]
    Call(String),

    #[error("Script: main() did not return a message and a numeric result")]
    BadReturn,

    /// The returned code is outside the valid set {-2, -1, 0, 1, 2}.
    #[error("Script: result code {0} is out of range")]
    InvalidResult(i64),
}

/// Outcome of a successful evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub code: i32,
    pub message: String,
}

/// A compiled rule script, reused across ticks until the rule is replaced.
pub struct CompiledScript {
    lua: Lua,
}

impl CompiledScript {
    /// Loads the source, checks that it defines `main` and installs the
    /// constant globals and rule variables.
    ///
    /// Scripts get the math, string and table libraries only; there is no
    /// I/O available inside an evaluation.
    pub fn compile(
        source: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<CompiledScript, ScriptError> {
        let lua = Lua::new_with(
            StdLib::MATH | StdLib::STRING | StdLib::TABLE,
            LuaOptions::default(),
        )
        .map_err(|e| ScriptError::Compile(e.to_string()))?;

        lua.load(source)
            .exec()
            .map_err(|e| ScriptError::Compile(e.to_string()))?;

        let globals = lua.globals();
        let main: Value = globals
            .get("main")
            .map_err(|e| ScriptError::Compile(e.to_string()))?;
        if !matches!(main, Value::Function(_)) {
            return Err(ScriptError::Compile("main function not found".into()));
        }

        let constants: [(&str, i32); 7] = [
            ("OK", 0),
            ("WARNING", 1),
            ("HIGH_WARNING", 1),
            ("CRITICAL", 2),
            ("HIGH_CRITICAL", 2),
            ("LOW_WARNING", -1),
            ("LOW_CRITICAL", -2),
        ];
        for (name, value) in constants {
            globals
                .set(name, value)
                .map_err(|e| ScriptError::Compile(e.to_string()))?;
        }
        for (name, value) in variables {
            globals
                .set(name.as_str(), value.as_str())
                .map_err(|e| ScriptError::Compile(e.to_string()))?;
        }

        drop(main);
        drop(globals);
        Ok(CompiledScript { lua })
    }

    /// Calls `main` with the metric values. `INAME` and `NAME` are re-set
    /// before every call so nothing of the previous evaluation leaks in.
    pub fn call(
        &self,
        values: &[String],
        iname: &str,
        display_name: Option<&str>,
    ) -> Result<Evaluation, ScriptError> {
        let globals = self.lua.globals();
        globals
            .set("NAME", display_name.unwrap_or(iname))
            .map_err(|e| ScriptError::Call(e.to_string()))?;
        globals
            .set("INAME", iname)
            .map_err(|e| ScriptError::Call(e.to_string()))?;

        let main: mlua::Function = globals
            .get("main")
            .map_err(|e| ScriptError::Call(e.to_string()))?;

        let mut args = Vec::with_capacity(values.len());
        for value in values {
            let s = self
                .lua
                .create_string(value)
                .map_err(|e| ScriptError::Call(e.to_string()))?;
            args.push(Value::String(s));
        }

        let returned = main
            .call::<_, MultiValue>(MultiValue::from_vec(args))
            .map_err(|e| ScriptError::Call(e.to_string()))?;

        let mut ret = returned.into_iter();
        let first = ret.next();
        let second = ret.next();

        // The result code may come second (message, result) or first
        // (result, message); the numeric value wins.
        let (code, message) = if let Some(code) = second.as_ref().and_then(as_code) {
            (code, as_message(first.as_ref()))
        } else if let Some(code) = first.as_ref().and_then(as_code) {
            (code, as_message(second.as_ref()))
        } else {
            return Err(ScriptError::BadReturn);
        };

        if !(-2..=2).contains(&code) {
            return Err(ScriptError::InvalidResult(code));
        }

        Ok(Evaluation {
            code: code as i32,
            message,
        })
    }
}

fn as_code(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(i) => Some(*i),
        Value::Number(n) => Some(*n as i64),
        _ => None,
    }
}

fn as_message(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.to_str().map(|s| s.to_string()).unwrap_or_default(),
        Some(Value::Integer(i)) => i.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}
