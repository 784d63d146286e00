//! Lua 5.4 host for crawl scripts.
//!
//! [`crate::crawl_script`] runs each script on a blocking thread, so the
//! host functions here do synchronous HTTP and reach the async cache and
//! service layers by blocking on a captured runtime [`Handle`].
//!
//! | Global | Functions |
//! |--------|-----------|
//! | `http` | `get(url, {params, headers, timeout}?)` |
//! | `crypto` | `sha256(text)` |
//! | `log` | `debug`, `info`, `warn`, `error` |
//! | `crawl` | `message(text)` |
//! | `cache` | `get`, `set`, `set_process` (SIMPLE and BATCH only) |
//! | `service` | `call(name, path, opts?)` (when services are configured) |
//!
//! `os`, `io`, `debug`, `loadfile` and `dofile` are not available.

use mlua::prelude::*;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;

use crate::handler::CacheScope;
use crate::service::ServiceCaller;
use crate::task_logger::{LogLevel, TaskLogger};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Host-side state reachable from a script.
pub(crate) struct HostBindings {
    /// Label used on tracing events, e.g. `"crawl:shop_catalog_items"`.
    pub script_name: String,
    pub logger: Option<Arc<dyn TaskLogger>>,
    pub cache: Option<CacheScope>,
    pub services: Option<Arc<dyn ServiceCaller>>,
    pub runtime: Handle,
    /// `crawl.message` texts, drained into the result once the script returns.
    pub messages: Arc<Mutex<Vec<String>>>,
}

pub(crate) fn register_all_host_apis(lua: &Lua, host: &HostBindings) -> LuaResult<()> {
    sandbox_globals(lua)?;
    let globals = lua.globals();
    globals.set("http", fetch_module(lua)?)?;
    globals.set("crypto", crypto_module(lua)?)?;
    globals.set("log", log_module(lua, host)?)?;
    globals.set("crawl", crawl_module(lua, host.messages.clone())?)?;
    if let Some(scope) = &host.cache {
        register_cache_api(lua, scope.clone(), host.runtime.clone())?;
    }
    if let Some(services) = &host.services {
        register_service_api(lua, services.clone(), host.runtime.clone())?;
    }
    Ok(())
}

pub(crate) fn sandbox_globals(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();
    for name in ["os", "io", "debug", "loadfile", "dofile"] {
        globals.set(name, LuaValue::Nil)?;
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: http
// ═══════════════════════════════════════════════════════════════════════

/// Optional second argument of `http.get`.
#[derive(Default)]
struct FetchOptions {
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    timeout: Option<Duration>,
}

impl FetchOptions {
    fn from_lua(opts: Option<LuaTable>) -> LuaResult<Self> {
        let Some(opts) = opts else {
            return Ok(Self::default());
        };
        let pairs = |field: &str| -> LuaResult<Vec<(String, String)>> {
            match opts.get::<Option<LuaTable>>(field)? {
                Some(table) => table.pairs::<String, String>().collect(),
                None => Ok(Vec::new()),
            }
        };
        Ok(Self {
            query: pairs("params")?,
            headers: pairs("headers")?,
            timeout: opts
                .get::<Option<f64>>("timeout")?
                .filter(|secs| *secs > 0.0)
                .map(Duration::from_secs_f64),
        })
    }
}

fn fetch_module(lua: &Lua) -> LuaResult<LuaTable> {
    let client = reqwest::blocking::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .user_agent(concat!("ficus/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(LuaError::external)?;

    let http = lua.create_table()?;
    http.set(
        "get",
        lua.create_function(move |lua, (url, opts): (String, Option<LuaTable>)| {
            let opts = FetchOptions::from_lua(opts)?;
            let mut request = client.get(&url).query(&opts.query);
            for (name, value) in &opts.headers {
                request = request.header(name, value);
            }
            if let Some(timeout) = opts.timeout {
                request = request.timeout(timeout);
            }
            let response = request
                .send()
                .map_err(|e| LuaError::external(anyhow::anyhow!("GET {} failed: {}", url, e)))?;
            response_table(lua, response)
        })?,
    )?;
    Ok(http)
}

/// `{status, ok, headers, body, json?}`; `json` is set when the body parses.
fn response_table(lua: &Lua, response: reqwest::blocking::Response) -> LuaResult<LuaTable> {
    let status = response.status();
    let headers = lua.create_table()?;
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            headers.set(name.as_str(), value)?;
        }
    }
    let body = response
        .text()
        .map_err(|e| LuaError::external(anyhow::anyhow!("reading response body: {}", e)))?;

    let table = lua.create_table()?;
    table.set("status", status.as_u16())?;
    table.set("ok", status.is_success())?;
    table.set("headers", headers)?;
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(&body) {
        table.set("json", json_value_to_lua(lua, &json)?)?;
    }
    table.set("body", body)?;
    Ok(table)
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: crypto, log, crawl
// ═══════════════════════════════════════════════════════════════════════

fn crypto_module(lua: &Lua) -> LuaResult<LuaTable> {
    let crypto = lua.create_table()?;
    crypto.set(
        "sha256",
        lua.create_function(|_, text: LuaString| {
            Ok(hex::encode(Sha256::digest(&*text.as_bytes())))
        })?,
    )?;
    Ok(crypto)
}

fn log_module(lua: &Lua, host: &HostBindings) -> LuaResult<LuaTable> {
    let log = lua.create_table()?;
    for level in [LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error] {
        let script = host.script_name.clone();
        let logger = host.logger.clone();
        let emit = lua.create_function(move |_, message: String| {
            match level {
                LogLevel::Debug => tracing::debug!(script = %script, "{}", message),
                LogLevel::Info => tracing::info!(script = %script, "{}", message),
                LogLevel::Warn => tracing::warn!(script = %script, "{}", message),
                LogLevel::Error => tracing::error!(script = %script, "{}", message),
            }
            if let Some(logger) = &logger {
                logger.log(level, &message, None);
            }
            Ok(())
        })?;
        log.set(level.to_string().to_lowercase(), emit)?;
    }
    Ok(log)
}

fn crawl_module(lua: &Lua, messages: Arc<Mutex<Vec<String>>>) -> LuaResult<LuaTable> {
    let crawl = lua.create_table()?;
    crawl.set(
        "message",
        lua.create_function(move |_, text: String| {
            if let Ok(mut messages) = messages.lock() {
                messages.push(text);
            }
            Ok(())
        })?,
    )?;
    Ok(crawl)
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: cache
// ═══════════════════════════════════════════════════════════════════════

fn register_cache_api(lua: &Lua, scope: CacheScope, runtime: Handle) -> LuaResult<()> {
    let cache = lua.create_table()?;

    // cache.get(key) → value | nil
    let (s, rt) = (scope.clone(), runtime.clone());
    cache.set(
        "get",
        lua.create_function(move |lua, key: String| {
            let value = rt
                .block_on(s.get(&key))
                .map_err(|e| mlua::Error::external(e.context(format!("cache.get '{}'", key))))?;
            match value {
                Some(v) => json_value_to_lua(lua, &v),
                None => Ok(LuaValue::Nil),
            }
        })?,
    )?;

    // cache.set(key, value)
    let (s, rt) = (scope.clone(), runtime.clone());
    cache.set(
        "set",
        lua.create_function(move |_lua, (key, value): (String, LuaValue)| {
            let json = lua_value_to_json(value)?;
            rt.block_on(s.set_task(&key, json))
                .map_err(|e| mlua::Error::external(e.context(format!("cache.set '{}'", key))))
        })?,
    )?;

    // cache.set_process(key, value)
    let (s, rt) = (scope, runtime);
    cache.set(
        "set_process",
        lua.create_function(move |_lua, (key, value): (String, LuaValue)| {
            let json = lua_value_to_json(value)?;
            rt.block_on(s.set_process(&key, json)).map_err(|e| {
                mlua::Error::external(e.context(format!("cache.set_process '{}'", key)))
            })
        })?,
    )?;

    lua.globals().set("cache", cache)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: service
// ═══════════════════════════════════════════════════════════════════════

fn register_service_api(
    lua: &Lua,
    services: Arc<dyn ServiceCaller>,
    runtime: Handle,
) -> LuaResult<()> {
    let service = lua.create_table()?;

    // service.call(name, path, {method=, params=, data=}?) → decoded response
    service.set(
        "call",
        lua.create_function(
            move |lua, (name, path, opts): (String, String, Option<LuaTable>)| {
                let mut method = "GET".to_string();
                let mut params = serde_json::Map::new();
                let mut data = None;
                if let Some(opts) = opts {
                    if let Ok(m) = opts.get::<String>("method") {
                        method = m;
                    }
                    if let serde_json::Value::Object(p) =
                        lua_value_to_json(opts.get::<LuaValue>("params")?)?
                    {
                        params = p;
                    }
                    let body = lua_value_to_json(opts.get::<LuaValue>("data")?)?;
                    if !body.is_null() {
                        data = Some(body);
                    }
                }
                let response = runtime
                    .block_on(services.do_service(&name, &path, &method, &params, data.as_ref()))
                    .map_err(mlua::Error::external)?;
                json_value_to_lua(lua, &response)
            },
        )?,
    )?;

    lua.globals().set("service", service)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Environment expansion
// ═══════════════════════════════════════════════════════════════════════

/// Expand `${VAR_NAME}` patterns in a string from the process environment.
///
/// Unset variables expand to the empty string. Expanded text is not
/// rescanned.
pub(crate) fn expand_env_vars(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start..].find('}') else {
            break;
        };
        result.push_str(&rest[..start]);
        let var_name = &rest[start + 2..start + len];
        result.push_str(&std::env::var(var_name).unwrap_or_default());
        rest = &rest[start + len + 1..];
    }
    result.push_str(rest);
    result
}

/// Expand `${VAR}` in every string inside a JSON value.
pub(crate) fn expand_env_in_value(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(expand_env_vars(s)),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(expand_env_in_value).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), expand_env_in_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Value Conversions: JSON ↔ Lua
// ═══════════════════════════════════════════════════════════════════════

/// Convert a JSON value to a Lua value.
pub(crate) fn json_value_to_lua(lua: &Lua, value: &serde_json::Value) -> LuaResult<LuaValue> {
    match value {
        serde_json::Value::Null => Ok(LuaValue::Nil),
        serde_json::Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(LuaValue::Integer(i))
            } else {
                Ok(LuaValue::Number(n.as_f64().unwrap_or(0.0)))
            }
        }
        serde_json::Value::String(s) => lua.create_string(s).map(LuaValue::String),
        serde_json::Value::Array(arr) => {
            let table = lua.create_table()?;
            for (i, v) in arr.iter().enumerate() {
                table.set(i as i64 + 1, json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
        serde_json::Value::Object(map) => {
            let table = lua.create_table()?;
            for (k, v) in map {
                table.set(k.as_str(), json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
    }
}

/// Convert a Lua value to a JSON value.
pub(crate) fn lua_value_to_json(value: LuaValue) -> LuaResult<serde_json::Value> {
    match value {
        LuaValue::Nil => Ok(serde_json::Value::Null),
        LuaValue::Boolean(b) => Ok(serde_json::Value::Bool(b)),
        LuaValue::Integer(i) => Ok(serde_json::Value::Number(i.into())),
        LuaValue::Number(n) => Ok(serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)),
        LuaValue::String(s) => Ok(serde_json::Value::String(s.to_str()?.to_string())),
        LuaValue::Table(t) => {
            // Heuristic: if raw_len > 0, treat as array; otherwise as object
            let len = t.raw_len();
            if len > 0 {
                let mut arr = Vec::new();
                for i in 1..=len {
                    let v: LuaValue = t.raw_get(i)?;
                    arr.push(lua_value_to_json(v)?);
                }
                Ok(serde_json::Value::Array(arr))
            } else {
                let mut map = serde_json::Map::new();
                for pair in t.pairs::<String, LuaValue>() {
                    let (k, v) = pair?;
                    map.insert(k, lua_value_to_json(v)?);
                }
                Ok(serde_json::Value::Object(map))
            }
        }
        _ => Ok(serde_json::Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_expansion_is_single_pass() {
        std::env::set_var("FICUS_TEST_TOKEN", "${FICUS_TEST_TOKEN}");
        assert_eq!(
            expand_env_vars("Bearer ${FICUS_TEST_TOKEN}!"),
            "Bearer ${FICUS_TEST_TOKEN}!"
        );
        assert_eq!(expand_env_vars("${FICUS_TEST_UNSET_VAR}x"), "x");
        assert_eq!(expand_env_vars("no vars"), "no vars");
    }

    #[test]
    fn json_round_trips_through_lua() {
        let lua = Lua::new();
        let value = serde_json::json!({"id": 3, "tags": ["a", "b"], "price": 1.5});
        let back = lua_value_to_json(json_value_to_lua(&lua, &value).unwrap()).unwrap();
        assert_eq!(back, value);
    }

    #[derive(Default)]
    struct Recorded(Mutex<Vec<(LogLevel, String)>>);

    impl TaskLogger for Recorded {
        fn log(&self, level: LogLevel, message: &str, _error: Option<&anyhow::Error>) {
            self.0.lock().unwrap().push((level, message.to_string()));
        }
    }

    #[test]
    fn scripts_reach_logger_messages_and_digest() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let logger = Arc::new(Recorded::default());
        let host = HostBindings {
            script_name: "crawl:shop_catalog_prices".to_string(),
            logger: Some(logger.clone()),
            cache: None,
            services: None,
            runtime: rt.handle().clone(),
            messages: Arc::new(Mutex::new(Vec::new())),
        };
        let lua = Lua::new();
        register_all_host_apis(&lua, &host).unwrap();

        let digest: String = lua
            .load(
                r#"
                log.warn("price feed is stale")
                crawl.message("3 prices")
                return crypto.sha256("abc")
            "#,
            )
            .eval()
            .unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(*host.messages.lock().unwrap(), vec!["3 prices".to_string()]);
        assert_eq!(
            *logger.0.lock().unwrap(),
            vec![(LogLevel::Warn, "price feed is stale".to_string())]
        );

        // Without a cache scope or services, those globals stay unset.
        for name in ["cache", "service", "os"] {
            let value: LuaValue = lua.globals().get(name).unwrap();
            assert!(value.is_nil(), "{} should be nil", name);
        }
    }

    #[test]
    fn sandbox_removes_os_and_io() {
        let lua = Lua::new();
        sandbox_globals(&lua).unwrap();
        let os: LuaValue = lua.globals().get("os").unwrap();
        assert!(os.is_nil());
        let io: LuaValue = lua.globals().get("io").unwrap();
        assert!(io.is_nil());
    }
}
