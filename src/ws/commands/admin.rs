// src/ws/commands/admin.rs
//! Admin-plane commands
//!
//! Configuration inspection and editing plus the reload request. Only the
//! admin server registers these.

use crate::ws::commands::{Command, CommandContext, CommandRegistry, Pusher};
use serde_json::{Value, json};

/// Registers the admin set on a registry
pub fn register_all(registry: &mut CommandRegistry) {
    registry.register(Box::new(ConfigFileCmd));
    registry.register(Box::new(GetRawConfigCmd));
    registry.register(Box::new(SaveRawConfigCmd));
    registry.register(Box::new(ReloadCmd));
}

/// Where the configuration came from and whether it loaded
struct ConfigFileCmd;

impl Command for ConfigFileCmd {
    fn name(&self) -> &'static str {
        "configFile"
    }

    fn call(
        &self,
        _input: &Value,
        ctx: &mut CommandContext,
    ) -> Result<(Value, Option<Box<dyn Pusher>>), String> {
        Ok((
            json!({
                "filename": ctx.config.file.display().to_string(),
                "explicit": ctx.config.specified,
                "redirected": ctx.config.redirected,
                "valid": ctx.config.valid,
            }),
            None,
        ))
    }
}

/// The loaded configuration document, or the syntax error details
struct GetRawConfigCmd;

impl Command for GetRawConfigCmd {
    fn name(&self) -> &'static str {
        "getRawConfig"
    }

    fn call(
        &self,
        _input: &Value,
        ctx: &mut CommandContext,
    ) -> Result<(Value, Option<Box<dyn Pusher>>), String> {
        let reply = match &ctx.config.document {
            Some(document) => {
                let mut reply = serde_json::Map::new();
                reply.insert("configuration".into(), document.clone());
                if !ctx.config.value_errors.is_empty() {
                    reply.insert("errors".into(), json!(ctx.config.value_errors));
                }
                Value::Object(reply)
            }
            None => json!({
                "raw": ctx.config.raw,
                "errorDesc": ctx.config.error_desc,
                "errorOffset": ctx.config.error_offset,
            }),
        };
        Ok((reply, None))
    }
}

/// Writes a configuration document to disk
struct SaveRawConfigCmd;

impl Command for SaveRawConfigCmd {
    fn name(&self) -> &'static str {
        "saveRawConfig"
    }

    fn call(
        &self,
        input: &Value,
        ctx: &mut CommandContext,
    ) -> Result<(Value, Option<Box<dyn Pusher>>), String> {
        let params = input
            .get("params")
            .and_then(Value::as_object)
            .ok_or_else(|| "Missing .params object".to_string())?;
        let target = match params.get("destination").and_then(Value::as_str) {
            Some(path) => std::path::PathBuf::from(path),
            None => ctx.config.file.clone(),
        };
        let configuration = match params.get("configuration").and_then(Value::as_object) {
            Some(configuration) => configuration,
            None => return Ok((json!(false), None)),
        };
        let pretty = serde_json::to_string_pretty(configuration)
            .map_err(|e| format!("could not serialize configuration: {}", e))?;
        std::fs::write(&target, pretty)
            .map_err(|e| format!("could not write {}: {}", target.display(), e))?;
        Ok((json!(true), None))
    }
}

/// Asks the supervisor to shut down cleanly so the config can be re-read
struct ReloadCmd;

impl Command for ReloadCmd {
    fn name(&self) -> &'static str {
        "reload"
    }

    fn call(
        &self,
        _input: &Value,
        ctx: &mut CommandContext,
    ) -> Result<(Value, Option<Box<dyn Pusher>>), String> {
        ctx.runtime.reload_requested = true;
        Ok((json!(true), None))
    }
}
