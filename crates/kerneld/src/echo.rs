use std::io::Write;

use kernel_wire::{IsCompleteReply, IsCompleteStatus, LanguageInfo, MimeBundle};
use serde_json::Value;

use crate::kernel::{ExecutionContext, ExecutionEngine, ExecutionError};

/// A minimal engine: prints each cell to stdout and returns it as the result.
///
/// `%input <prompt>` echoes a value read from the frontend instead, and
/// `%error <message>` fails with `message`.
#[derive(Debug, Default)]
pub struct EchoEngine;

impl ExecutionEngine for EchoEngine {
    fn language_info(&self) -> LanguageInfo {
        LanguageInfo {
            name: "echo".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            mimetype: "text/plain".to_string(),
            file_extension: ".txt".to_string(),
            pygments_lexer: None,
            codemirror_mode: None,
        }
    }

    fn banner(&self) -> String {
        "kerneld echo kernel".to_string()
    }

    fn execute(
        &self,
        code: &str,
        ctx: &ExecutionContext<'_>,
    ) -> Result<Option<MimeBundle>, ExecutionError> {
        let write_err = |e: std::io::Error| ExecutionError::new("IOError", e.to_string());

        let text = if let Some(prompt) = code.strip_prefix("%input") {
            ctx.input(prompt.trim(), false).map_err(write_err)?
        } else if let Some(message) = code.strip_prefix("%error") {
            writeln!(ctx.stderr(), "{}", message.trim()).map_err(write_err)?;
            return Err(ExecutionError::new("EchoError", message.trim()));
        } else {
            code.to_string()
        };

        if text.is_empty() {
            return Ok(None);
        }
        writeln!(ctx.stdout(), "{text}").map_err(write_err)?;

        let mut data = MimeBundle::new();
        data.insert("text/plain".to_string(), Value::String(text));
        Ok(Some(data))
    }

    fn is_complete(&self, code: &str) -> IsCompleteReply {
        let status = if code.ends_with('\\') {
            IsCompleteStatus::Incomplete
        } else {
            IsCompleteStatus::Complete
        };
        IsCompleteReply {
            status,
            indent: String::new(),
        }
    }
}
