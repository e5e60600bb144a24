// src/ws/commands/monitor.rs
//! Monitor-plane commands
//!
//! Read-only views over the miner, the pool set and the tracked values,
//! plus the streaming variants browsers subscribe to. Registered on both
//! the monitor and the admin server.

use crate::stratum::session::AuthState;
use crate::ws::commands::{
    Command, CommandContext, CommandRegistry, Pusher, ValuePusher,
};
use serde_json::{Value, json};
use sysinfo::System;

/// Registers the full monitor set on a registry
pub fn register_all(registry: &mut CommandRegistry) {
    registry.register(Box::new(SystemInfoCmd));
    registry.register(Box::new(AlgoCmd));
    registry.register(Box::new(PoolCmd));
    registry.register(Box::new(DeviceConfigCmd));
    registry.register(Box::new(RejectReasonCmd));
    registry.register(Box::new(ConfigInfoCmd));
    registry.register(Box::new(ScanTimeCmd));
    registry.register(Box::new(DeviceSharesCmd));
    registry.register(Box::new(PoolSharesCmd));
    registry.register(Box::new(PoolStatsCmd));
    registry.register(Box::new(UptimeCmd));
    registry.register(Box::new(VersionCmd));
    registry.register(Box::new(ExtensionListCmd));
    registry.register(Box::new(UpgradeCmd));
}

/// Host and compute hardware description
struct SystemInfoCmd;

impl Command for SystemInfoCmd {
    fn name(&self) -> &'static str {
        "systemInfo"
    }

    fn call(
        &self,
        _input: &Value,
        ctx: &mut CommandContext,
    ) -> Result<(Value, Option<Box<dyn Pusher>>), String> {
        let sys = System::new_all();
        let chip = sys
            .cpus()
            .first()
            .map(|cpu| cpu.brand().to_string())
            .unwrap_or_else(|| "unknown CPU".into());
        let clock = sys.cpus().first().map(|cpu| cpu.frequency()).unwrap_or(0);
        let clusters = sys.cpus().len();
        let memory = sys.total_memory();
        let devices: Vec<Value> = (0..ctx.miner.device_count())
            .map(|_| {
                json!({
                    "chip": chip.clone(),
                    "clusters": clusters,
                    "coreClock": clock,
                    "globalMemBytes": memory,
                    "type": "CPU",
                })
            })
            .collect();
        let reply = json!({
            "API": "CPU",
            "platforms": [{
                "name": System::name().unwrap_or_default(),
                "vendor": chip,
                "version": System::kernel_version().unwrap_or_default(),
                "devices": devices,
            }]
        });
        Ok((reply, None))
    }
}

/// Active algorithm and implementation
struct AlgoCmd;

impl Command for AlgoCmd {
    fn name(&self) -> &'static str {
        "algo"
    }

    fn call(
        &self,
        _input: &Value,
        ctx: &mut CommandContext,
    ) -> Result<(Value, Option<Box<dyn Pusher>>), String> {
        let (implementation, version) = ctx.miner.implementation();
        Ok((
            json!({
                "algo": ctx.miner.algo().to_string(),
                "impl": implementation,
                "version": version,
            }),
            None,
        ))
    }
}

/// The pool currently being mined, with worker authorization states
struct PoolCmd;

impl Command for PoolCmd {
    fn name(&self) -> &'static str {
        "pool"
    }

    fn call(
        &self,
        input: &Value,
        ctx: &mut CommandContext,
    ) -> Result<(Value, Option<Box<dyn Pusher>>), String> {
        // One parameter of value "primary" is allowed for future proofing.
        match input.get("params") {
            None | Some(Value::Null) => {}
            Some(Value::String(mode)) if mode == "primary" => {}
            Some(Value::String(mode)) => {
                return Err(format!("\"parameters\" unrecognized value \"{}\"", mode));
            }
            Some(_) => return Err("\"parameters\" specified, but not a valid format".into()),
        }
        let current = match ctx.pools.current() {
            Some(current) => current,
            None => return Ok((Value::Null, None)),
        };
        let authorized = match ctx.pools.session(current).map(|session| session.auth()) {
            Some(AuthState::Accepted) => json!(true),
            Some(AuthState::Failed) => json!(false),
            Some(AuthState::Inferred) => json!("inferred"),
            Some(AuthState::Pending) | None => json!("pending"),
            Some(AuthState::NotRequired) => json!("open"),
        };
        let config = ctx.pools.config(current);
        Ok((
            json!({
                "name": config.name,
                "url": ctx.pools.endpoint(current),
                "users": [{ "login": config.user, "authorized": authorized }],
            }),
            None,
        ))
    }
}

/// Which configuration slot each device runs
struct DeviceConfigCmd;

impl Command for DeviceConfigCmd {
    fn name(&self) -> &'static str {
        "deviceConfig"
    }

    fn call(
        &self,
        _input: &Value,
        ctx: &mut CommandContext,
    ) -> Result<(Value, Option<Box<dyn Pusher>>), String> {
        // A single configuration drives every device of the CPU backend.
        let slots: Vec<Value> = (0..ctx.miner.device_count()).map(|_| json!(0)).collect();
        Ok((Value::Array(slots), None))
    }
}

/// Why devices were left unconfigured; null entries mean "in use"
struct RejectReasonCmd;

impl Command for RejectReasonCmd {
    fn name(&self) -> &'static str {
        "rejectReason"
    }

    fn call(
        &self,
        _input: &Value,
        ctx: &mut CommandContext,
    ) -> Result<(Value, Option<Box<dyn Pusher>>), String> {
        let slots: Vec<Value> = (0..ctx.miner.device_count())
            .map(|_| Value::Null)
            .collect();
        Ok((Value::Array(slots), None))
    }
}

/// Static description of the active configuration
struct ConfigInfoCmd;

impl Command for ConfigInfoCmd {
    fn name(&self) -> &'static str {
        "configInfo"
    }

    fn call(
        &self,
        input: &Value,
        ctx: &mut CommandContext,
    ) -> Result<(Value, Option<Box<dyn Pusher>>), String> {
        let params = input
            .get("params")
            .and_then(Value::as_array)
            .ok_or_else(|| "Parameter array is missing.".to_string())?;
        let wants = |what: &str| params.iter().any(|entry| entry.as_str() == Some(what));
        let settings = ctx.miner.settings();
        let mut entry = serde_json::Map::new();
        if wants("hashCount") {
            entry.insert("hashCount".into(), json!(settings.batch_size));
        }
        if wants("memUsage") {
            entry.insert(
                "resources".into(),
                json!([{
                    "space": "host",
                    "presentation": "header scan buffer",
                    "footprint": settings.batch_size * 80,
                    "accessType": ["ro"],
                }]),
            );
        }
        Ok((json!([entry]), None))
    }
}

fn scan_time_payload(ctx: &CommandContext) -> Value {
    let window = ctx
        .tracking
        .scan
        .first()
        .map(|window| window.window_secs())
        .unwrap_or(0);
    let measurements: Vec<Value> = ctx
        .tracking
        .scan
        .iter()
        .map(|window| match window.last() {
            None => Value::Null,
            Some(last) => json!({
                "min": window.min().unwrap_or_default().as_millis() as u64,
                "max": window.max().unwrap_or_default().as_millis() as u64,
                "avg": window.avg().unwrap_or_default().as_millis() as u64,
                "last": last.as_millis() as u64,
            }),
        })
        .collect();
    json!({ "twindow": window, "measurements": measurements })
}

/// Per-device scan durations, streamed on change
struct ScanTimeCmd;

impl Command for ScanTimeCmd {
    fn name(&self) -> &'static str {
        "scanTime"
    }

    fn max_pushing(&self) -> usize {
        1
    }

    fn call(
        &self,
        _input: &Value,
        ctx: &mut CommandContext,
    ) -> Result<(Value, Option<Box<dyn Pusher>>), String> {
        let mut pusher = ValuePusher::new(scan_time_payload);
        let first = pusher.refresh(ctx).unwrap_or(Value::Null);
        Ok((first, Some(Box::new(pusher))))
    }
}

/// Share counters for a chosen set of devices, streamed on change
struct DeviceSharesCmd;

fn device_shares_payload(devices: &[usize], ctx: &CommandContext) -> Value {
    let mut linear = Vec::new();
    let mut good = Vec::new();
    let mut bad = Vec::new();
    let mut stale = Vec::new();
    let mut last = Vec::new();
    for &device in devices {
        let stats = ctx.tracking.devices.get(device).copied().unwrap_or_default();
        linear.push(device as u64);
        good.push(stats.good);
        bad.push(stats.bad);
        stale.push(stats.stale);
        last.push(stats.last_result);
    }
    json!({
        "linearIndex": linear,
        "good": good,
        "bad": bad,
        "stale": stale,
        "lastResult": last,
    })
}

struct DeviceSharesPusher {
    devices: Vec<usize>,
    last: Option<Value>,
}

impl Pusher for DeviceSharesPusher {
    fn refresh(&mut self, ctx: &CommandContext) -> Option<Value> {
        let fresh = device_shares_payload(&self.devices, ctx);
        if self.last.as_ref() == Some(&fresh) {
            return None;
        }
        self.last = Some(fresh.clone());
        Some(fresh)
    }
}

impl Command for DeviceSharesCmd {
    fn name(&self) -> &'static str {
        "deviceShares"
    }

    fn max_pushing(&self) -> usize {
        1
    }

    fn call(
        &self,
        input: &Value,
        ctx: &mut CommandContext,
    ) -> Result<(Value, Option<Box<dyn Pusher>>), String> {
        let wanted = input
            .get("params")
            .and_then(|params| params.get("devices"))
            .and_then(Value::as_array)
            .ok_or_else(|| "\"devices\" must be an array".to_string())?;
        let mut devices = Vec::with_capacity(wanted.len());
        for (at, entry) in wanted.iter().enumerate() {
            match entry.as_u64() {
                Some(index) => devices.push(index as usize),
                None => return Err(format!("\"devices[{}]\" is not a valid index", at)),
            }
        }
        if devices.is_empty() {
            return Err("\"devices\" must be an array".to_string());
        }
        let mut pusher = DeviceSharesPusher {
            devices,
            last: None,
        };
        let first = pusher.refresh(ctx).unwrap_or(Value::Null);
        Ok((first, Some(Box::new(pusher))))
    }
}

fn pool_shares_payload(ctx: &CommandContext) -> Value {
    let entries: Vec<Value> = ctx
        .tracking
        .pools
        .iter()
        .map(|entry| {
            json!({
                "sent": entry.sent,
                "accepted": entry.accepted,
                "rejected": entry.rejected,
                "active": entry.last_activated,
                "daps": entry.daps,
                "lastSubmitReply": entry.last_submit_reply,
                "lastActivity": entry.last_activity,
                "numActivations": entry.num_activations,
                "cumulatedTime": entry.cumulated_time,
            })
        })
        .collect();
    Value::Array(entries)
}

/// Per-pool share counters, streamed on change
struct PoolSharesCmd;

impl Command for PoolSharesCmd {
    fn name(&self) -> &'static str {
        "poolShares"
    }

    fn max_pushing(&self) -> usize {
        1
    }

    fn call(
        &self,
        _input: &Value,
        ctx: &mut CommandContext,
    ) -> Result<(Value, Option<Box<dyn Pusher>>), String> {
        let mut pusher = ValuePusher::new(pool_shares_payload);
        let first = pusher.refresh(ctx).unwrap_or(Value::Null);
        Ok((first, Some(Box::new(pusher))))
    }
}

fn pool_stats_payload(ctx: &CommandContext) -> Value {
    let entries: Vec<Value> = ctx
        .tracking
        .pools
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            json!({
                "name": ctx.pools.config(index).name,
                "sent": entry.sent,
                "accepted": entry.accepted,
                "rejected": entry.rejected,
                "activated": entry.last_activated,
                "lastConnDown": entry.last_conn_down,
                "daps": entry.daps,
                "lastSubmitReply": entry.last_submit_reply,
                "lastActivity": entry.last_activity,
                "numActivations": entry.num_activations,
                "cumulatedTime": entry.cumulated_time,
            })
        })
        .collect();
    Value::Array(entries)
}

/// Per-pool connection statistics, streamed on change
struct PoolStatsCmd;

impl Command for PoolStatsCmd {
    fn name(&self) -> &'static str {
        "poolStats"
    }

    fn max_pushing(&self) -> usize {
        1
    }

    fn call(
        &self,
        _input: &Value,
        ctx: &mut CommandContext,
    ) -> Result<(Value, Option<Box<dyn Pusher>>), String> {
        let mut pusher = ValuePusher::new(pool_stats_payload);
        let first = pusher.refresh(ctx).unwrap_or(Value::Null);
        Ok((first, Some(Box::new(pusher))))
    }
}

/// Seconds since epoch of program start, hashing start and first nonce
struct UptimeCmd;

impl Command for UptimeCmd {
    fn name(&self) -> &'static str {
        "uptime"
    }

    fn call(
        &self,
        _input: &Value,
        ctx: &mut CommandContext,
    ) -> Result<(Value, Option<Box<dyn Pusher>>), String> {
        let mut reply = serde_json::Map::new();
        let start = ctx.tracking.start;
        for (key, value) in [
            ("program", start.program),
            ("hashing", start.hashing),
            ("nonce", start.first_nonce),
        ] {
            if value != 0 {
                reply.insert(key.into(), json!(value));
            }
        }
        Ok((Value::Object(reply), None))
    }
}

/// Build identity and credits
struct VersionCmd;

impl Command for VersionCmd {
    fn name(&self) -> &'static str {
        "version"
    }

    fn call(
        &self,
        _input: &Value,
        _ctx: &mut CommandContext,
    ) -> Result<(Value, Option<Box<dyn Pusher>>), String> {
        let credits = "<p><h2>oremill - a minimalistic cryptocurrency mining supervisor</h2>\
            <em>Permissively released under MIT license.</em></p>";
        Ok((
            json!({
                "protocol": 4,
                "build": {
                    "version": env!("CARGO_PKG_VERSION"),
                    "msg": credits,
                },
            }),
            None,
        ))
    }
}

/// Descriptions of the loadable web-app extensions
struct ExtensionListCmd;

impl Command for ExtensionListCmd {
    fn name(&self) -> &'static str {
        "extensionList"
    }

    fn call(
        &self,
        _input: &Value,
        ctx: &mut CommandContext,
    ) -> Result<(Value, Option<Box<dyn Pusher>>), String> {
        Ok((json!(ctx.extensions.descriptions()), None))
    }
}

/// Queries or enables extensions by name
struct UpgradeCmd;

impl Command for UpgradeCmd {
    fn name(&self) -> &'static str {
        "upgrade"
    }

    fn call(
        &self,
        input: &Value,
        ctx: &mut CommandContext,
    ) -> Result<(Value, Option<Box<dyn Pusher>>), String> {
        let params = input
            .get("params")
            .and_then(Value::as_object)
            .ok_or_else(|| "\"upgrade\", .parameters must be object".to_string())?;
        let mode = params
            .get("mode")
            .and_then(Value::as_str)
            .ok_or_else(|| "\"upgrade\", parameters.mode must be string".to_string())?;
        let list = params
            .get("list")
            .and_then(Value::as_array)
            .ok_or_else(|| "\"upgrade\", parameters.list must be array".to_string())?;
        let mut names = Vec::with_capacity(list.len());
        for entry in list {
            match entry.as_str() {
                Some(name) => names.push(name),
                None => {
                    return Err("\"upgrade\", parameters.list contains non-string value".into());
                }
            }
        }
        match mode {
            "query" => {
                let mut reply = serde_json::Map::new();
                for name in names {
                    reply.insert(name.into(), json!(ctx.extensions.contains(name)));
                }
                Ok((Value::Object(reply), None))
            }
            "enable" => {
                for name in names {
                    if !ctx.extensions.enable(name) {
                        break;
                    }
                }
                Ok((json!(true), None))
            }
            _ => Err("\"upgrade\", parameters.mode unrecognized value".into()),
        }
    }
}
