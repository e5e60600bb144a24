// src/ws/commands/mod.rs
//! Command handlers for the control plane
//!
//! Every inbound JSON message names a command; handlers are stateless
//! objects looked up by name in a [`CommandRegistry`]. Handlers that stream
//! build a [`Pusher`] whose first forced payload doubles as the command
//! reply; the push manager in the server keeps polling it afterwards.
//!
//! Handlers see the rest of the process only through the capability struct
//! [`CommandContext`], rebuilt from borrows on every tick: they can never
//! extend the lifetime of a provider.

/// Monitor-plane commands, registered on both servers
pub mod monitor;

/// Admin-plane commands, registered on the admin server only
pub mod admin;

use crate::config::ConfigTracker;
use crate::miner::Miner;
use crate::network::pool::PoolSet;
use crate::stats::Tracking;
use serde_json::Value;
use std::collections::BTreeMap;

/// Capability handles a command may consult while producing its reply
pub struct CommandContext<'a> {
    pub pools: &'a PoolSet,
    pub miner: &'a dyn Miner,
    pub tracking: &'a Tracking,
    pub config: &'a ConfigTracker,
    pub extensions: &'a mut ExtensionRegistry,
    pub runtime: &'a mut RuntimeFlags,
}

/// Requests raised by commands for the supervisor to act on
#[derive(Default)]
pub struct RuntimeFlags {
    /// Set by the admin `reload` command; the supervisor begins a clean
    /// shutdown once both planes have drained
    pub reload_requested: bool,
}

/// Generates successive payloads for one push subscription
///
/// `refresh` must be idempotent when nothing changed and can never fail:
/// the wire protocol has no way to tell a push error from a command-reply
/// error.
pub trait Pusher {
    /// Returns the payload when it differs from the last one produced
    fn refresh(&mut self, ctx: &CommandContext) -> Option<Value>;
}

/// A pusher built from a closure, with whole-payload change suppression
///
/// The first refresh always yields (nothing was sent yet); afterwards a
/// payload equal to the previous one is swallowed.
pub struct ValuePusher {
    last: Option<Value>,
    build: Box<dyn Fn(&CommandContext) -> Value>,
}

impl ValuePusher {
    pub fn new(build: impl Fn(&CommandContext) -> Value + 'static) -> Self {
        ValuePusher {
            last: None,
            build: Box::new(build),
        }
    }
}

impl Pusher for ValuePusher {
    fn refresh(&mut self, ctx: &CommandContext) -> Option<Value> {
        let fresh = (self.build)(ctx);
        if self.last.as_ref() == Some(&fresh) {
            return None;
        }
        self.last = Some(fresh.clone());
        Some(fresh)
    }
}

/// One named command of the control plane
pub trait Command {
    /// Stable wire name
    fn name(&self) -> &'static str;

    /// How many pushers one client may hold for this command:
    /// 0 = no pushing, 1 = singleton (stream id suppressed on the wire),
    /// more = multi-stream with server-issued decimal ids
    fn max_pushing(&self) -> usize {
        0
    }

    /// Produces the reply and, for streaming commands, the pusher
    ///
    /// The error string is wrapped into the `!!ERROR: …!!` reply envelope
    /// by the dispatcher.
    fn call(
        &self,
        input: &Value,
        ctx: &mut CommandContext,
    ) -> Result<(Value, Option<Box<dyn Pusher>>), String>;
}

/// Name-keyed set of commands one server dispatches against
pub struct CommandRegistry {
    commands: Vec<Box<dyn Command>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        CommandRegistry {
            commands: Vec::new(),
        }
    }

    pub fn register(&mut self, command: Box<dyn Command>) {
        self.commands.push(command);
    }

    pub fn find(&self, name: &str) -> Option<&dyn Command> {
        self.commands
            .iter()
            .find(|command| command.name() == name)
            .map(|command| command.as_ref())
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The command set served by the monitor plane
pub fn monitor_registry() -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    monitor::register_all(&mut registry);
    registry
}

/// The command set served by the admin plane: monitor plus admin commands
pub fn admin_registry() -> CommandRegistry {
    let mut registry = monitor_registry();
    admin::register_all(&mut registry);
    registry
}

/// State of one loadable web-app extension
pub struct ExtensionState {
    pub desc: String,
    pub enabled: bool,
}

/// Registry backing the `extensionList` and `upgrade` commands
#[derive(Default)]
pub struct ExtensionRegistry {
    entries: BTreeMap<String, ExtensionState>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, desc: &str) {
        self.entries.insert(
            name.to_string(),
            ExtensionState {
                desc: desc.to_string(),
                enabled: false,
            },
        );
    }

    pub fn descriptions(&self) -> Vec<&str> {
        self.entries
            .values()
            .filter(|state| !state.desc.is_empty())
            .map(|state| state.desc.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Enables a known extension; false when the name is unknown
    pub fn enable(&mut self, name: &str) -> bool {
        match self.entries.get_mut(name) {
            Some(state) => {
                state.enabled = true;
                true
            }
            None => false,
        }
    }
}
