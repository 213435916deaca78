use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    domain::{DisconnectCode, ProtocolVersion},
    errors::Error,
    session::ReconnectPolicy,
    transport::throttled::ThrottleConfig,
    Result,
};

/// Typed configuration for the bot, read from the environment.
#[derive(Clone, Debug)]
pub struct Config {
    // Identity / credentials
    pub auth_dir: PathBuf,
    pub pairing_number: Option<String>,

    // Bridge process
    pub bridge_path: PathBuf,
    pub bridge_args: Vec<String>,
    pub protocol_version: Option<ProtocolVersion>,

    // Addressing
    pub user_domain: String,
    pub group_suffix: String,

    // Session lifecycle
    pub logged_out_code: DisconnectCode,
    pub reconnect: ReconnectPolicy,

    // Dispatch
    pub call_timeout: Duration,
    pub dispatch_queue_size: usize,
    pub throttle: ThrottleConfig,

    // Audit
    pub audit_log_path: PathBuf,
    pub audit_log_json: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let auth_dir = env_path("AUTH_DIR").unwrap_or_else(|| PathBuf::from("auth_info"));
        let pairing_number = env_str("PAIRING_NUMBER")
            .map(|s| s.trim().to_string())
            .and_then(non_empty);

        let bridge_path = env_path("BRIDGE_PATH").unwrap_or_else(|| PathBuf::from("wa-bridge"));
        let bridge_args = parse_csv(env_str("BRIDGE_ARGS"));
        let protocol_version = match env_str("PROTOCOL_VERSION").and_then(non_empty) {
            Some(v) => Some(
                ProtocolVersion::parse(&v)
                    .map_err(|e| Error::Config(format!("PROTOCOL_VERSION: {e}")))?,
            ),
            None => None,
        };

        let user_domain = env_str("USER_DOMAIN").unwrap_or("s.whatsapp.net".to_string());
        let group_suffix = env_str("GROUP_SUFFIX").unwrap_or("@g.us".to_string());
        if user_domain.trim().is_empty() {
            return Err(Error::Config("USER_DOMAIN must not be empty".to_string()));
        }
        if group_suffix.trim().is_empty() {
            return Err(Error::Config("GROUP_SUFFIX must not be empty".to_string()));
        }

        let logged_out_code = DisconnectCode(env_u16("LOGGED_OUT_CODE").unwrap_or(401));

        let reconnect = ReconnectPolicy {
            initial_delay: Duration::from_millis(
                env_u64("RECONNECT_INITIAL_DELAY_MS").unwrap_or(1000),
            ),
            max_delay: Duration::from_millis(env_u64("RECONNECT_MAX_DELAY_MS").unwrap_or(60_000)),
            // 0 means "retry forever".
            max_attempts: env_u32("RECONNECT_MAX_ATTEMPTS").filter(|n| *n > 0),
        };

        let call_timeout = Duration::from_millis(env_u64("CALL_TIMEOUT_MS").unwrap_or(30_000));
        let dispatch_queue_size = env_usize("DISPATCH_QUEUE_SIZE").unwrap_or(256).max(1);

        let defaults = ThrottleConfig::default();
        let throttle = ThrottleConfig {
            global_min_interval: env_u64("SEND_GLOBAL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.global_min_interval),
            per_chat_min_interval: env_u64("SEND_CHAT_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.per_chat_min_interval),
        };

        let audit_log_path = PathBuf::from(
            env_str("AUDIT_LOG_PATH").unwrap_or("/tmp/wab-audit.log".to_string()),
        );
        let audit_log_json = env_bool("AUDIT_LOG_JSON").unwrap_or(false);

        Ok(Self {
            auth_dir,
            pairing_number,
            bridge_path,
            bridge_args,
            protocol_version,
            user_domain,
            group_suffix,
            logged_out_code,
            reconnect,
            call_timeout,
            dispatch_queue_size,
            throttle,
            audit_log_path,
            audit_log_json,
        })
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let Some((key, val)) = parse_dotenv_line(raw) else {
            continue;
        };
        if env::var_os(&key).is_some() {
            continue; // do not override existing env
        }
        env::set_var(key, val);
    }
}

fn parse_dotenv_line(raw: &str) -> Option<(String, String)> {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let (k, v) = line.split_once('=')?;
    let key = k.trim();
    if key.is_empty() {
        return None;
    }

    let mut val = v.trim().to_string();
    // Strip optional surrounding quotes.
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        val = val[1..val.len() - 1].to_string();
    }

    Some((key.to_string(), val))
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_u16(key: &str) -> Option<u16> {
    env_str(key).and_then(|s| s.trim().parse::<u16>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn parse_csv(v: Option<String>) -> Vec<String> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
