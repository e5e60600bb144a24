// src/config/config.rs
use crate::types::{DiffMode, MerkleMode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// How announced difficulty, share difficulty and the difficulty-one
/// constant are scaled for a pool
///
/// All three must be positive; pools disagree wildly on these conventions
/// so they are per-pool configuration rather than per-algorithm constants.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DiffMultipliers {
    pub one: f64,
    pub share: f64,
    pub stratum: f64,
}

/// Configuration for one mining pool, immutable once loaded
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Unique display name; defaults to the entry index in brackets
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Worker login, usually wallet.worker
    pub user: String,
    /// Worker password (often "x" if not required)
    pub pass: String,
    /// Algorithm this pool serves; non-matching pools stay disconnected
    pub algo: String,
    pub diff_multipliers: DiffMultipliers,
    pub merkle_mode: MerkleMode,
    pub diff_mode: DiffMode,
}

/// Main configuration for the supervisor
#[derive(Debug, Clone)]
pub struct Config {
    pub pools: Vec<PoolConfig>,
    /// Active algorithm name
    pub algo: String,
    /// Base reconnect delay in seconds; hard failures wait four times this
    pub reconnect_delay: u64,
    /// Number of compute worker threads (0 = auto-detect)
    pub worker_threads: usize,
    /// Nonces per worker scan
    pub batch_size: u64,
    pub monitor_port: u16,
    pub admin_port: u16,
}

/// Everything the admin plane needs to know about how loading went
///
/// If the file parsed, `document` holds it and `value_errors` lists the
/// semantic complaints. Otherwise `raw`/`error_desc`/`error_offset`
/// describe the syntax failure.
#[derive(Debug, Default)]
pub struct ConfigTracker {
    pub file: PathBuf,
    /// The path came from the command line rather than the default
    pub specified: bool,
    /// A `userConfiguration` redirect was followed
    pub redirected: bool,
    /// A usable configuration came out of the load
    pub valid: bool,
    pub document: Option<Value>,
    pub value_errors: Vec<String>,
    pub raw: String,
    pub error_desc: String,
    pub error_offset: usize,
}

/// At most this much of an unparseable file is retained for the admin plane
const CFG_FILE_MAX_BYTES_ON_ERROR: usize = 4096;

impl Config {
    fn defaults() -> Config {
        Config {
            pools: Vec::new(),
            algo: "sha256d".into(),
            reconnect_delay: 30,
            worker_threads: num_cpus::get(),
            batch_size: 1000,
            monitor_port: 31000,
            admin_port: 31001,
        }
    }

    /// Generates a configuration template string
    ///
    /// # Returns
    /// A ready-to-edit JSON document with one example pool
    pub fn generate_template() -> String {
        let template = serde_json::json!({
            "algo": "sha256d",
            "reconnectDelay": 30,
            "workerThreads": 0,
            "batchSize": 1000,
            "monitorPort": 31000,
            "adminPort": 31001,
            "pools": [{
                "name": "example",
                "host": "pool.example.com",
                "port": 3333,
                "user": "your_wallet_address.worker01",
                "pass": "x",
                "algo": "sha256d",
                "diffMultipliers": { "one": 1, "share": 1, "stratum": 1 },
                "merkleMode": "SHA256D",
                "diffMode": "btc"
            }]
        });
        serde_json::to_string_pretty(&template).unwrap_or_default()
    }
}

/// Loads the configuration, following a `userConfiguration` redirect once
///
/// The redirect is honored only when the bootstrap file was not explicitly
/// specified on the command line, mirroring how the default `init.json`
/// chains to a user-owned file.
///
/// # Returns
/// The tracker (always) and the built configuration when the file parsed.
pub fn load(path: impl Into<PathBuf>, specified: bool) -> (ConfigTracker, Option<Config>) {
    let mut tracker = ConfigTracker {
        file: path.into(),
        specified,
        ..ConfigTracker::default()
    };

    let mut document = match read_document(&mut tracker) {
        Some(document) => document,
        None => return (tracker, None),
    };

    if !specified {
        if let Some(redirect) = document.get("userConfiguration").and_then(Value::as_str) {
            tracker.file = PathBuf::from(redirect);
            tracker.redirected = true;
            tracker.value_errors.clear();
            document = match read_document(&mut tracker) {
                Some(document) => document,
                None => return (tracker, None),
            };
        }
    }

    let config = build_config(&document, &mut tracker.value_errors);
    tracker.document = Some(document);
    tracker.valid = config.is_some();
    (tracker, config)
}

fn read_document(tracker: &mut ConfigTracker) -> Option<Value> {
    let text = match std::fs::read_to_string(&tracker.file) {
        Ok(text) => text,
        Err(e) => {
            tracker.error_desc = format!("failed to read {}: {}", tracker.file.display(), e);
            return None;
        }
    };
    match serde_json::from_str::<Value>(&text) {
        Ok(document) => Some(document),
        Err(e) => {
            tracker.raw = text.chars().take(CFG_FILE_MAX_BYTES_ON_ERROR).collect();
            tracker.error_desc = e.to_string();
            tracker.error_offset = e.column();
            None
        }
    }
}

fn build_config(root: &Value, errors: &mut Vec<String>) -> Option<Config> {
    let root = match root.as_object() {
        Some(root) => root,
        None => {
            errors.push("Valid configurations must be objects.".into());
            return None;
        }
    };
    let mut config = Config::defaults();

    match root.get("pools") {
        None => errors.push("No pools specified in config file.".into()),
        Some(Value::Array(entries)) => {
            for (index, entry) in entries.iter().enumerate() {
                match build_pool(entry, index, &config.pools, errors) {
                    Some(pool) => config.pools.push(pool),
                    None => continue,
                }
            }
            if config.pools.is_empty() {
                errors.push("no valid pool configurations!".into());
            }
        }
        Some(_) => errors.push("Pool list must be an array.".into()),
    }

    if let Some(algo) = root.get("algo") {
        match algo.as_str() {
            Some(algo) => config.algo = algo.to_string(),
            None => errors.push("\"algo\" must be a string.".into()),
        }
    }
    if let Some(delay) = root.get("reconnectDelay") {
        match delay.as_u64() {
            Some(secs) if secs > 0 => config.reconnect_delay = secs,
            _ => errors.push("\"reconnectDelay\" must be a positive integer.".into()),
        }
    }
    if let Some(workers) = root.get("workerThreads").and_then(Value::as_u64) {
        if workers > 0 {
            config.worker_threads = workers as usize;
        }
    }
    if let Some(batch) = root.get("batchSize").and_then(Value::as_u64) {
        if batch > 0 {
            config.batch_size = batch;
        }
    }
    if let Some(port) = root.get("monitorPort").and_then(Value::as_u64) {
        config.monitor_port = port as u16;
    }
    if let Some(port) = root.get("adminPort").and_then(Value::as_u64) {
        config.admin_port = port as u16;
    }
    Some(config)
}

fn build_pool(
    entry: &Value,
    index: usize,
    taken: &[PoolConfig],
    errors: &mut Vec<String>,
) -> Option<PoolConfig> {
    let entry = match entry.as_object() {
        Some(entry) => entry,
        None => {
            errors.push(format!("pools[{}] is not an object. Ignored.", index));
            return None;
        }
    };

    let mut missing = Vec::new();
    let mut req_string = |key: &'static str| -> Option<String> {
        match entry.get(key).and_then(Value::as_str) {
            Some(value) => Some(value.to_string()),
            None => {
                missing.push(key);
                None
            }
        }
    };
    let host = req_string("host");
    let user = req_string("user");
    let pass = req_string("pass");
    let algo = req_string("algo");
    if !missing.is_empty() {
        errors.push(format!(
            "pools[{}] ignored, invalid fields: {}",
            index,
            missing.join(", ")
        ));
        return None;
    }
    let port = match entry.get("port").and_then(Value::as_u64) {
        Some(port) if port > 0 && port < 65536 => port as u16,
        _ => {
            errors.push(format!("pools[{}] ignored, invalid fields: port", index));
            return None;
        }
    };

    let name = match entry.get("name") {
        Some(Value::String(name)) if name.is_empty() => {
            errors.push(format!(
                "pools[{}].name is empty string, not allowed",
                index
            ));
            return None;
        }
        Some(Value::String(name)) => name.clone(),
        _ => format!("[{}]", index),
    };
    if let Some(previous) = taken.iter().position(|pool| pool.name == name) {
        errors.push(format!(
            "pools[{}].name is \"{}\", already taken by pools[{}]",
            index, name, previous
        ));
        return None;
    }

    let diff_multipliers = match entry.get("diffMultipliers") {
        None => {
            errors.push(format!(
                "pools[{}].diffMultipliers not found, old config file?",
                index
            ));
            return None;
        }
        Some(muls) => match parse_multipliers(muls) {
            Ok(muls) => muls,
            Err(which) => {
                errors.push(format!(
                    "pools[{}].diffMultipliers.{} must be number > 0.",
                    index, which
                ));
                return None;
            }
        },
    };

    let merkle_mode = match entry.get("merkleMode").and_then(Value::as_str) {
        None => MerkleMode::Sha256d,
        Some(mode) => match mode.parse() {
            Ok(mode) => mode,
            Err(what) => {
                errors.push(format!("pools[{}]: {}", index, what));
                return None;
            }
        },
    };
    let diff_mode = match entry.get("diffMode").and_then(Value::as_str) {
        None => DiffMode::Btc,
        Some(mode) => match mode.parse() {
            Ok(mode) => mode,
            Err(what) => {
                errors.push(format!("pools[{}]: {}", index, what));
                return None;
            }
        },
    };

    Some(PoolConfig {
        name,
        host: host.unwrap_or_default(),
        port,
        user: user.unwrap_or_default(),
        pass: pass.unwrap_or_default(),
        algo: algo.unwrap_or_default(),
        diff_multipliers,
        merkle_mode,
        diff_mode,
    })
}

fn parse_multipliers(muls: &Value) -> Result<DiffMultipliers, &'static str> {
    let field = |key: &'static str| -> Result<f64, &'static str> {
        match muls.get(key).and_then(Value::as_f64) {
            Some(value) if value > 0.0 => Ok(value),
            _ => Err(key),
        }
    };
    Ok(DiffMultipliers {
        one: field("one")?,
        share: field("share")?,
        stratum: field("stratum")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, contents: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("oremill-cfg-{}-{}", std::process::id(), name));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    const GOOD: &str = r#"{
        "algo": "sha256d",
        "reconnectDelay": 45,
        "pools": [{
            "name": "main",
            "host": "pool.example.com",
            "port": 3333,
            "user": "wallet.w1",
            "pass": "x",
            "algo": "sha256d",
            "diffMultipliers": { "one": 1, "share": 1, "stratum": 1 }
        }]
    }"#;

    #[test]
    fn well_formed_file_builds_a_config() {
        let path = write_temp("good", GOOD);
        let (tracker, config) = load(&path, true);
        let config = config.unwrap();
        assert!(tracker.valid);
        assert!(tracker.value_errors.is_empty());
        assert_eq!(config.pools.len(), 1);
        assert_eq!(config.pools[0].name, "main");
        assert_eq!(config.reconnect_delay, 45);
        assert_eq!(config.pools[0].merkle_mode, MerkleMode::Sha256d);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn bootstrap_redirects_once_when_not_specified() {
        let target = write_temp("target", GOOD);
        let bootstrap = write_temp(
            "boot",
            &format!(r#"{{ "userConfiguration": {:?} }}"#, target.to_str().unwrap()),
        );
        let (tracker, config) = load(&bootstrap, false);
        assert!(tracker.redirected);
        assert_eq!(tracker.file, target);
        assert!(config.is_some());

        // An explicitly specified file must not chain.
        let (tracker, config) = load(&bootstrap, true);
        assert!(!tracker.redirected);
        assert!(config.unwrap().pools.is_empty());
        std::fs::remove_file(target).unwrap();
        std::fs::remove_file(bootstrap).unwrap();
    }

    #[test]
    fn syntax_errors_keep_the_raw_text() {
        let path = write_temp("broken", "{ not json");
        let (tracker, config) = load(&path, true);
        assert!(config.is_none());
        assert!(!tracker.valid);
        assert_eq!(tracker.raw, "{ not json");
        assert!(!tracker.error_desc.is_empty());
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn bad_entries_are_skipped_with_recorded_errors() {
        let text = r#"{
            "pools": [
                { "host": "a", "port": 1, "user": "u", "pass": "p", "algo": "sha256d",
                  "name": "dup", "diffMultipliers": { "one": 1, "share": 1, "stratum": 1 } },
                { "host": "b", "port": 2, "user": "u", "pass": "p", "algo": "sha256d",
                  "name": "dup", "diffMultipliers": { "one": 1, "share": 1, "stratum": 1 } },
                { "host": "c", "port": 3, "user": "u", "pass": "p", "algo": "sha256d",
                  "diffMultipliers": { "one": 0, "share": 1, "stratum": 1 } },
                { "host": "d", "user": "u", "pass": "p", "algo": "sha256d",
                  "diffMultipliers": { "one": 1, "share": 1, "stratum": 1 } }
            ]
        }"#;
        let path = write_temp("entries", text);
        let (tracker, config) = load(&path, true);
        let config = config.unwrap();
        assert_eq!(config.pools.len(), 1);
        assert_eq!(config.pools[0].name, "dup");
        assert_eq!(tracker.value_errors.len(), 3);
        assert!(tracker.value_errors[0].contains("already taken"));
        assert!(tracker.value_errors[1].contains("diffMultipliers.one"));
        assert!(tracker.value_errors[2].contains("port"));
        std::fs::remove_file(path).unwrap();
    }
}
