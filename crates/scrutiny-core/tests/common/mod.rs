// In-process Scrutiny server for integration tests.
//
// Speaks the real framing over loopback TCP. Holds a small catalog of
// watchables acting as device memory: subscribed values are pushed on a
// short period, writes are evaluated and applied one entry at a time in
// batch order, and each application is confirmed before the next starts.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use scrutiny_api::DatagramCodec;
use scrutiny_core::ClientConfig;

pub const UPDATE_PERIOD: Duration = Duration::from_millis(50);
pub const SERVER_TIME_ZERO: f64 = 1_700_000_000.0;

#[derive(Debug, Clone)]
struct Watchable {
    id: String,
    dtype: &'static str,
    kind: &'static str,
    value: Option<Value>,
    enum_def: Option<Value>,
}

#[derive(Debug, Clone)]
struct DeviceInfo {
    device_status: &'static str,
    session_id: Option<String>,
    sfd: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Push {
    Status,
}

struct State {
    started: Instant,
    catalog: Mutex<BTreeMap<String, Watchable>>,
    device: Mutex<DeviceInfo>,
    subscribe_requests: AtomicUsize,
    writes: Mutex<Vec<(String, Value)>>,
    failing: Mutex<HashSet<String>>,
    hold_completions: AtomicBool,
    next_token: AtomicUsize,
    push: broadcast::Sender<Push>,
    generation: Mutex<CancellationToken>,
}

pub struct EmulatedServer {
    addr: SocketAddr,
    state: Arc<State>,
    cancel: CancellationToken,
}

impl EmulatedServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let (push, _) = broadcast::channel(16);

        let state = Arc::new(State {
            started: Instant::now(),
            catalog: Mutex::new(catalog()),
            device: Mutex::new(DeviceInfo {
                device_status: "connected_ready",
                session_id: Some("session-1".into()),
                sfd: Some("firmware-a".into()),
            }),
            subscribe_requests: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            hold_completions: AtomicBool::new(false),
            next_token: AtomicUsize::new(1),
            push,
            generation: Mutex::new(cancel.child_token()),
        });

        tokio::spawn(accept_loop(listener, Arc::clone(&state), cancel.clone()));
        Self {
            addr,
            state,
            cancel,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn config(&self) -> ClientConfig {
        ClientConfig {
            host: "127.0.0.1".into(),
            port: self.port(),
            request_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(2),
            ..ClientConfig::default()
        }
    }

    /// Number of `subscribe_watchable` requests received.
    pub fn subscribe_requests(&self) -> usize {
        self.state.subscribe_requests.load(Ordering::SeqCst)
    }

    /// Every value applied to device memory, in order.
    pub fn writes(&self) -> Vec<(String, Value)> {
        self.state.writes.lock().unwrap().clone()
    }

    pub fn device_value(&self, path: &str) -> Option<Value> {
        self.state.catalog.lock().unwrap().get(path).and_then(|w| w.value.clone())
    }

    /// Make the device refuse writes to `path`.
    pub fn fail_writes_to(&self, path: &str) {
        self.state.failing.lock().unwrap().insert(path.to_owned());
    }

    /// Acknowledge writes but never confirm them.
    pub fn hold_write_completions(&self) {
        self.state.hold_completions.store(true, Ordering::SeqCst);
    }

    /// A new device session (or none) and an immediate status broadcast.
    pub fn set_device_session(&self, session_id: Option<&str>) {
        {
            let mut device = self.state.device.lock().unwrap();
            device.session_id = session_id.map(str::to_owned);
            device.device_status = if session_id.is_some() {
                "connected_ready"
            } else {
                "disconnected"
            };
        }
        let _ = self.state.push.send(Push::Status);
    }

    pub fn set_loaded_sfd(&self, firmware_id: Option<&str>) {
        self.state.device.lock().unwrap().sfd = firmware_id.map(str::to_owned);
        let _ = self.state.push.send(Push::Status);
    }

    /// Close every open connection; new ones are still accepted.
    pub fn drop_connections(&self) {
        let mut generation = self.state.generation.lock().unwrap();
        generation.cancel();
        *generation = self.cancel.child_token();
    }
}

impl Drop for EmulatedServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn catalog() -> BTreeMap<String, Watchable> {
    let entry = |id: &str, dtype, kind, value: Option<Value>| Watchable {
        id: id.into(),
        dtype,
        kind,
        value,
        enum_def: None,
    };
    let mut catalog = BTreeMap::new();
    catalog.insert("/alias/x".into(), entry("a-x", "float32", "alias", Some(json!(1.5))));
    catalog.insert("/alias/result".into(), entry("a-result", "sint32", "alias", Some(json!(0))));
    catalog.insert(
        "/alias/mode".into(),
        Watchable {
            enum_def: Some(json!({"name": "Mode", "values": {"Off": 0, "Idle": 1, "Run": 2}})),
            ..entry("a-mode", "uint8", "alias", Some(json!(0)))
        },
    );
    catalog.insert(
        "/var/main.c/counter".into(),
        entry("v-counter", "sint32", "var", Some(json!(10))),
    );
    catalog.insert("/var/main.c/silent".into(), entry("v-silent", "float64", "var", None));
    catalog.insert("/rpv/x1000".into(), entry("r-1000", "uint16", "rpv", Some(json!(100))));
    catalog.insert("/rpv/x2000".into(), entry("r-2000", "boolean", "rpv", Some(json!(true))));
    catalog
}

// ── Connection handling ──────────────────────────────────────────────

async fn accept_loop(listener: TcpListener, state: Arc<State>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let Ok((socket, _)) = accepted else { break };
                let generation = state.generation.lock().unwrap().clone();
                tokio::spawn(serve(socket, Arc::clone(&state), generation));
            }
        }
    }
}

async fn serve(socket: TcpStream, state: Arc<State>, cancel: CancellationToken) {
    let mut framed = Framed::new(socket, DatagramCodec::default());
    let mut pushes = state.push.subscribe();
    let mut subscribed: HashSet<String> = HashSet::new();
    let mut ticker = tokio::time::interval(UPDATE_PERIOD);

    let welcome = json!({
        "cmd": "welcome",
        "reqid": null,
        "server_time_zero_timestamp": SERVER_TIME_ZERO,
    });
    if send(&mut framed, &welcome).await.is_err() {
        return;
    }

    loop {
        let outgoing = tokio::select! {
            () = cancel.cancelled() => break,
            frame = framed.next() => match frame {
                Some(Ok(payload)) => handle_request(&state, &mut subscribed, &payload),
                _ => break,
            },
            push = pushes.recv() => match push {
                Ok(Push::Status) => vec![status_message(&state, None)],
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = ticker.tick() => periodic_updates(&state, &subscribed).into_iter().collect(),
        };
        for msg in outgoing {
            if send(&mut framed, &msg).await.is_err() {
                return;
            }
        }
    }
}

async fn send(framed: &mut Framed<TcpStream, DatagramCodec>, msg: &Value) -> Result<(), ()> {
    let payload = Bytes::from(serde_json::to_vec(msg).unwrap());
    framed.send(payload).await.map_err(drop)
}

fn server_time_us(state: &State) -> f64 {
    state.started.elapsed().as_secs_f64() * 1e6
}

fn handle_request(state: &State, subscribed: &mut HashSet<String>, payload: &[u8]) -> Vec<Value> {
    let request: Value = serde_json::from_slice(payload).unwrap();
    let reqid = request["reqid"].clone();
    let cmd = request["cmd"].as_str().unwrap_or_default().to_owned();
    let error = |msg: String| {
        json!({"cmd": "error", "reqid": reqid, "request_cmd": cmd, "msg": msg})
    };

    match cmd.as_str() {
        "get_server_status" => vec![status_message(state, Some(&reqid))],
        "subscribe_watchable" => {
            state.subscribe_requests.fetch_add(1, Ordering::SeqCst);
            let catalog = state.catalog.lock().unwrap();
            let mut response = serde_json::Map::new();
            let mut updates = Vec::new();
            for path in request["watchables"].as_array().unwrap() {
                let path = path.as_str().unwrap();
                let Some(w) = catalog.get(path) else {
                    return vec![error(format!("Cannot subscribe to unknown watchable {path}"))];
                };
                let mut def = json!({"id": w.id, "dtype": w.dtype, "type": w.kind});
                if let Some(enum_def) = &w.enum_def {
                    def["enum"] = enum_def.clone();
                }
                response.insert(path.to_owned(), def);
                subscribed.insert(path.to_owned());
                if let Some(v) = &w.value {
                    updates.push(json!({"id": w.id, "t": server_time_us(state), "v": v}));
                }
            }
            let mut out = vec![json!({
                "cmd": "response_subscribe_watchable",
                "reqid": reqid,
                "subscribed": response,
            })];
            if !updates.is_empty() {
                out.push(json!({"cmd": "watchable_update", "reqid": null, "updates": updates}));
            }
            out
        }
        "unsubscribe_watchable" => {
            let paths: Vec<String> = request["watchables"]
                .as_array()
                .unwrap()
                .iter()
                .map(|p| p.as_str().unwrap().to_owned())
                .collect();
            for path in &paths {
                subscribed.remove(path);
            }
            vec![json!({
                "cmd": "response_unsubscribe_watchable",
                "reqid": reqid,
                "unsubscribed": paths,
            })]
        }
        "write_watchable" => handle_write(state, subscribed, &request, &reqid),
        "get_server_stats" => vec![json!({
            "cmd": "response_get_server_stats",
            "reqid": reqid,
            "uptime": 12.5,
            "invalid_request_count": 0,
            "unexpected_error_count": 0,
            "client_count": 1,
            "to_all_clients_datarate_byte_per_sec": 100.0,
            "from_any_client_datarate_byte_per_sec": 50.0,
            "msg_received": 7,
            "msg_sent": 9,
            "device_session_count": 1,
            "to_device_datarate_byte_per_sec": 10.0,
            "from_device_datarate_byte_per_sec": 20.0,
            "device_request_per_sec": 5.0,
        })],
        "get_watchable_count" => {
            let catalog = state.catalog.lock().unwrap();
            let count = |kind: &str| catalog.values().filter(|w| w.kind == kind).count();
            vec![json!({
                "cmd": "response_get_watchable_count",
                "reqid": reqid,
                "qty": {"alias": count("alias"), "var": count("var"), "rpv": count("rpv")},
            })]
        }
        "get_watchable_list" => watchable_list(state, &request, &reqid),
        "get_installed_sfd" => vec![json!({
            "cmd": "response_get_installed_sfd",
            "reqid": reqid,
            "sfd_list": INSTALLED_SFDS.iter().map(|id| sfd_info(id)).collect::<Vec<_>>(),
        })],
        "get_loaded_sfd" => {
            let loaded = state.device.lock().unwrap().sfd.clone();
            vec![json!({
                "cmd": "response_get_loaded_sfd",
                "reqid": reqid,
                "sfd": loaded.as_deref().map(sfd_info),
            })]
        }
        "get_device_info" => {
            let session = state.device.lock().unwrap().session_id.clone();
            vec![json!({
                "cmd": "response_get_device_info",
                "reqid": reqid,
                "available": session.is_some(),
                "device_info": session.map(|id| device_info(&id)),
            })]
        }
        "set_link_config" => match request["link_type"].as_str() {
            Some("udp" | "tcp" | "serial" | "rtt" | "canbus" | "none") => {
                vec![json!({"cmd": "response_set_link_config", "reqid": reqid})]
            }
            other => vec![error(format!("Unsupported link type {other:?}"))],
        },
        other => vec![error(format!("Unsupported command {other}"))],
    }
}

/// Segments of at most `max_per_response` entries, runtime published
/// values first. A trailing empty segment carries `done` when the last
/// full one could not know it was last.
fn watchable_list(state: &State, request: &Value, reqid: &Value) -> Vec<Value> {
    let max = request["max_per_response"].as_u64().unwrap_or(1000).max(1);
    let max = usize::try_from(max).unwrap();
    let types: Vec<&str> = request["filter"]["type"]
        .as_array()
        .map(|t| t.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let names: Vec<&str> = request["filter"]["name"]
        .as_array()
        .map(|n| n.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let catalog = state.catalog.lock().unwrap();
    let mut entries: Vec<(&str, Value)> = Vec::new();
    for kind in ["rpv", "alias", "var"] {
        if !types.is_empty() && !types.contains(&kind) {
            continue;
        }
        for (path, w) in catalog.iter().filter(|(_, w)| w.kind == kind) {
            if !names.is_empty() && !names.iter().any(|n| glob_match(n, path)) {
                continue;
            }
            let mut def = json!({"path": path, "dtype": w.dtype});
            if let Some(enum_def) = &w.enum_def {
                def["enum"] = enum_def.clone();
            }
            entries.push((kind, def));
        }
    }

    let segment = |chunk: &[(&str, Value)], done: bool| {
        let of = |kind: &str| -> Vec<Value> {
            chunk.iter().filter(|(k, _)| *k == kind).map(|(_, d)| d.clone()).collect()
        };
        let (rpv, alias, var) = (of("rpv"), of("alias"), of("var"));
        json!({
            "cmd": "response_get_watchable_list",
            "reqid": reqid,
            "qty": {"rpv": rpv.len(), "alias": alias.len(), "var": var.len(), "var_factory": 0},
            "content": {"rpv": rpv, "alias": alias, "var": var, "var_factory": []},
            "done": done,
        })
    };
    let chunks: Vec<_> = entries.chunks(max).collect();
    let mut out: Vec<Value> = chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| segment(chunk, i + 1 == chunks.len() && chunk.len() < max))
        .collect();
    if entries.len() % max == 0 {
        out.push(segment(&[], true));
    }
    out
}

/// `*` and `?` wildcards, enough for the patterns the tests use.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn matches(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => matches(&p[1..], t) || (!t.is_empty() && matches(p, &t[1..])),
            (Some(b'?'), Some(_)) => matches(&p[1..], &t[1..]),
            (Some(a), Some(b)) if a == b => matches(&p[1..], &t[1..]),
            _ => false,
        }
    }
    matches(pattern.as_bytes(), text.as_bytes())
}

pub const INSTALLED_SFDS: [&str; 2] = ["firmware-a", "firmware-b"];

fn sfd_info(firmware_id: &str) -> Value {
    json!({
        "firmware_id": firmware_id,
        "metadata": {
            "project_name": format!("project {firmware_id}"),
            "author": "tests",
            "version": "1.0.0",
            "generation_info": {
                "time": 1_700_000_000,
                "python_version": "3.12.1",
                "scrutiny_version": "0.9.0",
                "system_type": "Linux",
            },
        },
        "filesize": 4096,
    })
}

fn device_info(session_id: &str) -> Value {
    json!({
        "session_id": session_id,
        "device_id": "emulated-device",
        "display_name": "Emulated device",
        "max_tx_data_size": 256,
        "max_rx_data_size": 128,
        "max_bitrate_bps": null,
        "rx_timeout_us": 50_000,
        "heartbeat_timeout_us": 5_000_000,
        "address_size_bits": 32,
        "protocol_major": 1,
        "protocol_minor": 0,
        "supported_feature_map": {
            "memory_write": true,
            "datalogging": true,
            "user_command": false,
            "_64bits": true,
        },
        "forbidden_memory_regions": [{"start": 0x2000_0000, "end": 0x2000_0fff, "size": 0x1000}],
        "readonly_memory_regions": [],
        "datalogging_capabilities": null,
    })
}

fn handle_write(
    state: &State,
    subscribed: &HashSet<String>,
    request: &Value,
    reqid: &Value,
) -> Vec<Value> {
    let mut catalog = state.catalog.lock().unwrap();
    let by_id: HashMap<String, String> = catalog
        .iter()
        .map(|(path, w)| (w.id.clone(), path.clone()))
        .collect();

    let updates = request["updates"].as_array().unwrap();
    let mut targets = Vec::new();
    for update in updates {
        let id = update["watchable"].as_str().unwrap();
        let Some(path) = by_id.get(id) else {
            return vec![json!({
                "cmd": "error",
                "reqid": reqid,
                "request_cmd": "write_watchable",
                "msg": format!("Unknown watchable ID {id}"),
            })];
        };
        targets.push((
            update["batch_index"].clone(),
            id.to_owned(),
            path.clone(),
            update["value"].clone(),
        ));
    }

    let token = format!("token-{}", state.next_token.fetch_add(1, Ordering::SeqCst));
    let mut out = vec![json!({
        "cmd": "response_write_watchable",
        "reqid": reqid,
        "count": targets.len(),
        "request_token": token,
    })];
    if state.hold_completions.load(Ordering::SeqCst) {
        return out;
    }

    let failing = state.failing.lock().unwrap();
    for (batch_index, id, path, raw) in targets {
        let watchable = catalog.get_mut(&path).unwrap();
        let applied = if failing.contains(&path) {
            None
        } else {
            coerce(watchable.dtype, &raw)
        };
        let success = applied.is_some();
        if let Some(value) = applied {
            watchable.value = Some(value.clone());
            state.writes.lock().unwrap().push((path.clone(), value.clone()));
            if subscribed.contains(&path) {
                out.push(json!({
                    "cmd": "watchable_update",
                    "reqid": null,
                    "updates": [{"id": id, "t": server_time_us(state), "v": value}],
                }));
            }
        }
        out.push(json!({
            "cmd": "inform_write_completion",
            "reqid": null,
            "request_token": token,
            "batch_index": batch_index,
            "watchable": id,
            "success": success,
            "completion_server_time_us": server_time_us(state),
        }));
        if !success {
            break;
        }
    }
    out
}

/// Convert a written value to what the device would store.
#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
fn coerce(dtype: &str, raw: &Value) -> Option<Value> {
    let number = match raw {
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Number(n) => {
            if dtype != "boolean" && !dtype.starts_with("float") {
                if let Some(i) = n.as_i64() {
                    return Some(json!(i));
                }
            }
            n.as_f64()?
        }
        Value::String(s) => match s.as_str() {
            "true" => 1.0,
            "false" => 0.0,
            expr => scrutiny_api::expr::evaluate(expr).ok()?,
        },
        _ => return None,
    };
    Some(match dtype {
        "boolean" => json!(number != 0.0),
        d if d.starts_with("float") => json!(number),
        _ => json!(number.trunc() as i64),
    })
}

fn periodic_updates(state: &State, subscribed: &HashSet<String>) -> Option<Value> {
    let catalog = state.catalog.lock().unwrap();
    let t = server_time_us(state);
    let updates: Vec<Value> = subscribed
        .iter()
        .filter_map(|path| catalog.get(path))
        .filter_map(|w| w.value.as_ref().map(|v| json!({"id": w.id, "t": t, "v": v})))
        .collect();
    (!updates.is_empty())
        .then(|| json!({"cmd": "watchable_update", "reqid": null, "updates": updates}))
}

fn status_message(state: &State, reqid: Option<&Value>) -> Value {
    let device = state.device.lock().unwrap().clone();
    json!({
        "cmd": "inform_server_status",
        "reqid": reqid.cloned().unwrap_or(Value::Null),
        "device_status": device.device_status,
        "device_session_id": device.session_id,
        "loaded_sfd_firmware_id": device.sfd,
        "datalogging_status": {"datalogging_state": "standby", "completion_ratio": null},
        "device_comm_link": {
            "link_type": "udp",
            "link_config": {"host": "localhost", "port": 12345},
            "link_operational": true,
            "demo_mode": false,
        },
        "supported_features": {
            "memory_write": true,
            "datalogging": true,
            "user_command": false,
            "_64bits": true,
        },
    })
}
