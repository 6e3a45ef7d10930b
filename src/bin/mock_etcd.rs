//! Mock etcd binary for integration testing
//!
//! One binary stands in for every executable a scenario drives:
//! - `mock_etcd grpc-proxy start ...` behaves as the gRPC proxy
//! - `mock_etcd --name ...` behaves as a cluster node
//! - anything else behaves as `etcdctl -w json`
//!
//! The processes share cluster state through a JSON file in the directory
//! named by `MOCK_ETCD_STATE_DIR`. `MOCK_ETCD_FAULTS` injects failures as a
//! comma separated list of `operation:kind:count`, for example
//! `member-remove:unhealthy:2,get:leader-changed:1`. The `resync`
//! operation is special: any entry for it keeps the proxy from ever
//! reporting an endpoint update.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const STATE_ENV: &str = "MOCK_ETCD_STATE_DIR";
const FAULTS_ENV: &str = "MOCK_ETCD_FAULTS";
const CLUSTER_ID: u64 = 14841639068965178418;

const UNAVAILABLE: &str = r#"{"level":"warn","msg":"retrying of unary invoker failed","error":"rpc error: code = DeadlineExceeded desc = latest balancer error: connection error: desc = \"transport: Error while dialing: dial tcp: connect: connection refused\""}
Error: context deadline exceeded"#;

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let state = match std::env::var(STATE_ENV) {
        Ok(dir) => StateDir {
            dir: PathBuf::from(dir),
        },
        Err(_) => {
            eprintln!("Error: {} must be set", STATE_ENV);
            std::process::exit(2);
        }
    };
    let faults = Faults::from_env();

    let code = if args.first().map(String::as_str) == Some("grpc-proxy") {
        run_proxy(&state, &faults, &args[1..])
    } else if args.iter().any(|a| a == "--name" || a.starts_with("--name=")) {
        run_node(&state, &args)
    } else {
        run_ctl(&state, &faults, &args)
    };
    std::process::exit(code);
}

// === Shared state ===

#[derive(Serialize, Deserialize, Default)]
struct Cluster {
    members: Vec<Member>,
    kv: BTreeMap<String, String>,
    revision: u64,
    /// Listen addresses of started proxies
    proxies: Vec<String>,
    /// Injected failures already handed out, per operation
    faults_used: HashMap<String, u32>,
}

#[derive(Serialize, Deserialize, Clone)]
struct Member {
    id: u64,
    /// Empty until the member's node starts
    name: String,
    peer_urls: Vec<String>,
    client_urls: Vec<String>,
    pid: Option<u32>,
}

impl Member {
    fn is_running(&self) -> bool {
        self.pid.map_or(false, process_alive)
    }

    fn to_json(&self) -> Value {
        let mut v = json!({ "ID": self.id, "peerURLs": self.peer_urls });
        if !self.name.is_empty() {
            v["name"] = json!(self.name);
        }
        if !self.client_urls.is_empty() {
            v["clientURLs"] = json!(self.client_urls);
        }
        v
    }
}

struct StateDir {
    dir: PathBuf,
}

struct StateLock {
    path: PathBuf,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = fs::remove_dir(&self.path);
    }
}

impl StateDir {
    fn file(&self) -> PathBuf {
        self.dir.join("cluster.json")
    }

    fn lock(&self) -> StateLock {
        let path = self.dir.join("cluster.lock");
        let started = Instant::now();
        loop {
            match fs::create_dir(&path) {
                Ok(()) => return StateLock { path },
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    // A holder killed mid-update leaves the lock behind
                    if started.elapsed() > Duration::from_secs(2) {
                        let _ = fs::remove_dir(&path);
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("cannot lock {}: {}", path.display(), e),
            }
        }
    }

    fn read(&self) -> Cluster {
        fs::read_to_string(self.file())
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    fn write(&self, cluster: &Cluster) {
        let tmp = self
            .dir
            .join(format!("cluster.json.{}", std::process::id()));
        fs::write(&tmp, serde_json::to_string(cluster).unwrap()).unwrap();
        fs::rename(&tmp, self.file()).unwrap();
    }

    fn update<T>(&self, f: impl FnOnce(&mut Cluster) -> T) -> T {
        let _lock = self.lock();
        let mut cluster = self.read();
        let result = f(&mut cluster);
        self.write(&cluster);
        result
    }
}

// === Fault injection ===

struct Faults(Vec<(String, String, u32)>);

impl Faults {
    fn from_env() -> Self {
        let spec = std::env::var(FAULTS_ENV).unwrap_or_default();
        let faults = spec
            .split(',')
            .filter_map(|entry| {
                let mut parts = entry.trim().splitn(3, ':');
                let op = parts.next()?.to_string();
                let kind = parts.next()?.to_string();
                let count = parts.next()?.parse().ok()?;
                Some((op, kind, count))
            })
            .collect();
        Self(faults)
    }

    fn has(&self, op: &str) -> bool {
        self.0.iter().any(|(o, _, _)| o == op)
    }

    /// Error output for `op` if it still has injected failures left
    fn take(&self, op: &str, cluster: &mut Cluster) -> Option<String> {
        let (_, kind, count) = self.0.iter().find(|(o, _, _)| o == op)?;
        let used = cluster.faults_used.entry(op.to_string()).or_insert(0);
        if *used >= *count {
            return None;
        }
        *used += 1;

        let message = match kind.as_str() {
            "unhealthy" => "Error: etcdserver: unhealthy cluster",
            "leader-changed" => "Error: etcdserver: leader changed",
            "unavailable" => UNAVAILABLE,
            _ => "Error: etcdserver: permission denied",
        };
        Some(message.to_string())
    }
}

// === Node ===

fn run_node(state: &StateDir, args: &[String]) -> i32 {
    let name = flag(args, "--name").unwrap_or_default();
    let client_url = flag(args, "--advertise-client-urls").unwrap_or_default();
    let peer_url = flag(args, "--initial-advertise-peer-urls").unwrap_or_default();
    let cluster_state = flag(args, "--initial-cluster-state").unwrap_or_else(|| "new".to_string());
    let pid = std::process::id();

    log(
        "info",
        "starting an etcd server",
        json!({ "name": name, "initial-cluster-state": cluster_state }),
    );

    let joined = state.update(|c| {
        match c.members.iter_mut().find(|m| m.peer_urls.contains(&peer_url)) {
            Some(m) => {
                m.name = name.clone();
                m.client_urls = vec![client_url.clone()];
                m.pid = Some(pid);
                true
            }
            None if cluster_state == "new" => {
                c.members.push(Member {
                    id: member_id(&peer_url),
                    name: name.clone(),
                    peer_urls: vec![peer_url.clone()],
                    client_urls: vec![client_url.clone()],
                    pid: Some(pid),
                });
                true
            }
            None => false,
        }
    });

    if !joined {
        log(
            "fatal",
            "discovery failed",
            json!({
                "error": format!(
                    "error validating peerURLs {{ClusterID:{:x}}}: member {} has not been added to the cluster",
                    CLUSTER_ID, peer_url
                )
            }),
        );
        return 1;
    }

    if let Some(dir) = flag(args, "--data-dir") {
        let _ = fs::create_dir_all(Path::new(&dir).join("member"));
    }

    log(
        "info",
        "ready to serve client requests",
        json!({ "address": client_url }),
    );

    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}

// === Proxy ===

fn run_proxy(state: &StateDir, faults: &Faults, args: &[String]) -> i32 {
    let listen = flag(args, "--listen-addr").unwrap_or_else(|| "127.0.0.1:23790".to_string());
    let interval = flag(args, "--endpoints-auto-sync-interval")
        .and_then(|s| parse_go_duration(&s))
        .unwrap_or(Duration::from_secs(30));
    let mut current: Vec<String> = flag(args, "--endpoints")
        .map(|e| e.split(',').map(|s| strip_scheme(s).to_string()).collect())
        .unwrap_or_default();
    current.sort();

    state.update(|c| {
        if !c.proxies.contains(&listen) {
            c.proxies.push(listen.clone());
        }
    });

    log(
        "info",
        "listening for gRPC proxy client requests",
        json!({ "address": listen }),
    );
    log_resolver(&current);

    let frozen = faults.has("resync");
    loop {
        thread::sleep(interval);
        if frozen {
            continue;
        }

        let cluster = state.read();
        let mut next: Vec<String> = cluster
            .members
            .iter()
            .flat_map(|m| m.client_urls.iter().map(|u| strip_scheme(u).to_string()))
            .collect();
        next.sort();

        if !next.is_empty() && next != current {
            log_resolver(&next);
            current = next;
        }
    }
}

fn log_resolver(endpoints: &[String]) {
    let addrs: Vec<String> = endpoints
        .iter()
        .map(|e| format!("{{Addr:{}}}", e))
        .collect();
    log(
        "info",
        "Resolver state updated",
        json!({ "state": format!("{{Addresses:[{}]}}", addrs.join(" ")) }),
    );
}

// === etcdctl ===

fn run_ctl(state: &StateDir, faults: &Faults, args: &[String]) -> i32 {
    let mut endpoints = Vec::new();
    let mut command: Vec<&str> = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(list) = arg.strip_prefix("--endpoints=") {
            endpoints = list.split(',').map(|e| strip_scheme(e).to_string()).collect();
        } else if arg == "-w" || arg == "--write-out" {
            iter.next();
        } else if !arg.starts_with("--command-timeout") {
            command.push(arg.as_str());
        }
    }

    let op = match command.as_slice() {
        ["member", sub, ..] => format!("member-{}", sub),
        [cmd, ..] => cmd.to_string(),
        [] => {
            eprintln!("Error: no command given");
            return 1;
        }
    };

    let result = state.update(|c| {
        if let Some(err) = faults.take(&op, c) {
            return Err(err);
        }
        if !reachable(c, &endpoints) {
            return Err(UNAVAILABLE.to_string());
        }
        execute(c, &command)
    });

    match result {
        Ok(response) => {
            println!("{}", response);
            0
        }
        Err(message) => {
            eprintln!("{}", message);
            1
        }
    }
}

/// Whether any endpoint leads to a running member
fn reachable(cluster: &Cluster, endpoints: &[String]) -> bool {
    let running: Vec<&Member> = cluster.members.iter().filter(|m| m.is_running()).collect();
    endpoints.iter().any(|ep| {
        if cluster.proxies.contains(ep) {
            !running.is_empty()
        } else {
            running
                .iter()
                .any(|m| m.client_urls.iter().any(|u| strip_scheme(u) == ep))
        }
    })
}

fn header(cluster: &Cluster) -> Value {
    json!({
        "cluster_id": CLUSTER_ID,
        "member_id": cluster.members.first().map_or(0, |m| m.id),
        "revision": cluster.revision,
        "raft_term": 2,
    })
}

fn execute(c: &mut Cluster, command: &[&str]) -> Result<Value, String> {
    match command {
        ["put", key, value] => {
            c.revision += 1;
            c.kv.insert(key.to_string(), value.to_string());
            Ok(json!({ "header": header(c) }))
        }
        ["get", key] => {
            let mut resp = json!({ "header": header(c) });
            if let Some(value) = c.kv.get(*key) {
                resp["kvs"] = json!([{
                    "key": b64(key),
                    "create_revision": c.revision,
                    "mod_revision": c.revision,
                    "version": 1,
                    "value": b64(value),
                }]);
                resp["count"] = json!(1);
            }
            Ok(resp)
        }
        ["member", "add", _name, rest @ ..] => {
            let peer_urls: Vec<String> = rest
                .iter()
                .find_map(|a| a.strip_prefix("--peer-urls="))
                .map(|urls| urls.split(',').map(str::to_string).collect())
                .ok_or_else(|| "Error: member peer urls not provided".to_string())?;
            if c
                .members
                .iter()
                .any(|m| m.peer_urls.iter().any(|u| peer_urls.contains(u)))
            {
                return Err("Error: etcdserver: Peer URLs already exists".to_string());
            }

            let member = Member {
                id: member_id(&peer_urls[0]),
                name: String::new(),
                peer_urls,
                client_urls: Vec::new(),
                pid: None,
            };
            let added = member.to_json();
            c.members.push(member);
            Ok(json!({
                "header": header(c),
                "member": added,
                "members": c.members.iter().map(Member::to_json).collect::<Vec<_>>(),
            }))
        }
        ["member", "list"] => Ok(json!({
            "header": header(c),
            "members": c.members.iter().map(Member::to_json).collect::<Vec<_>>(),
        })),
        ["member", "remove", id] => {
            let id = u64::from_str_radix(id, 16)
                .map_err(|_| format!("Error: bad member ID arg ({})", id))?;
            let before = c.members.len();
            c.members.retain(|m| m.id != id);
            if c.members.len() == before {
                return Err("Error: etcdserver: member not found".to_string());
            }
            Ok(json!({
                "header": header(c),
                "members": c.members.iter().map(Member::to_json).collect::<Vec<_>>(),
            }))
        }
        _ => Err(format!("Error: unknown command {:?}", command)),
    }
}

// === Helpers ===

fn flag(args: &[String], name: &str) -> Option<String> {
    let prefixed = format!("{}=", name);
    args.iter().enumerate().find_map(|(i, a)| {
        if a == name {
            args.get(i + 1).cloned()
        } else {
            a.strip_prefix(&prefixed).map(str::to_string)
        }
    })
}

fn strip_scheme(url: &str) -> &str {
    url.split_once("://").map_or(url, |(_, rest)| rest)
}

fn parse_go_duration(s: &str) -> Option<Duration> {
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse().ok().map(Duration::from_secs)
    } else {
        None
    }
}

fn member_id(peer_url: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    peer_url.hash(&mut hasher);
    hasher.finish() | 1
}

fn b64(s: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(s)
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

fn log(level: &str, msg: &str, fields: Value) {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    let mut entry = json!({ "level": level, "ts": ts, "caller": "mock_etcd", "msg": msg });
    if let (Some(obj), Value::Object(extra)) = (entry.as_object_mut(), fields) {
        obj.extend(extra);
    }
    eprintln!("{}", entry);
}
