//! Reservation stress bench against an in-process server speaking the
//! JSON-lines protocol. Run with `cargo bench`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use ulid::Ulid;

use parkade::engine::Engine;
use parkade::model::unix_now_ms;
use parkade::wire;

const HOUR: i64 = 3_600_000;
const LOTS: usize = 10;
const SPOTS_PER_LOT: usize = 20;
const RESERVE_OPS: usize = 2_000;
const SEARCH_OPS: usize = 2_000;
const CONTENDERS: usize = 50;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect failed");
        let (read, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer,
        }
    }

    async fn call(&mut self, request: Value) -> Value {
        let line = request.to_string();
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        let mut response = String::new();
        self.reader.read_line(&mut response).await.unwrap();
        serde_json::from_str(&response).unwrap()
    }
}

async fn start_server() -> SocketAddr {
    let wal = std::env::temp_dir().join(format!("parkade_bench_{}.wal", Ulid::new()));
    let engine = Arc::new(Engine::new(wal).expect("engine"));
    engine
        .ensure_admin("bench-admin@parkade.local", "bench", "Bench Admin")
        .await
        .expect("admin bootstrap");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(wire::process_connection(stream, engine.clone()));
        }
    });
    addr
}

async fn setup(client: &mut Client) -> (String, Vec<String>, Vec<String>) {
    let resp = client
        .call(json!({"op": "login", "email": "bench-admin@parkade.local", "password": "bench"}))
        .await;
    let admin = resp["data"]["id"].as_str().unwrap().to_string();

    let mut lots = Vec::new();
    for i in 0..LOTS {
        let resp = client
            .call(json!({
                "user": admin,
                "op": "create_lot",
                "name": format!("Bench Lot {i}"),
                "address": "1 Bench St",
                "city": "Benchville",
                "pincode": format!("5600{i:02}"),
                "area_type": "open",
                "price_per_hour": 30.0,
                "spots": SPOTS_PER_LOT
            }))
            .await;
        assert_eq!(resp["ok"], true, "create_lot: {resp}");
        lots.push(resp["data"]["lot"].as_str().unwrap().to_string());
    }

    let mut users = Vec::new();
    for i in 0..CONTENDERS {
        let resp = client
            .call(json!({
                "op": "register",
                "email": format!("bench-{i}@parkade.local"),
                "password": "pw",
                "name": format!("Bench User {i}")
            }))
            .await;
        assert_eq!(resp["ok"], true, "register: {resp}");
        users.push(resp["data"]["id"].as_str().unwrap().to_string());
    }

    println!("  created {LOTS} lots x {SPOTS_PER_LOT} spots, {CONTENDERS} users");
    (admin, lots, users)
}

/// Sequential reservations spread round-robin over lots and windows.
async fn bench_reserve(addr: SocketAddr, lots: &[String], user: &str) {
    let mut client = Client::connect(addr).await;
    let base = unix_now_ms();
    let mut latencies = Vec::with_capacity(RESERVE_OPS);
    let mut ok = 0usize;
    let mut full = 0usize;

    for i in 0..RESERVE_OPS {
        let lot = &lots[i % lots.len()];
        // Stagger windows so a lot fills up slowly rather than instantly.
        let offset = 1 + (i / lots.len()) as i64 % 200;
        let start = base + offset * HOUR / 10;
        let request = json!({
            "user": user,
            "op": "reserve",
            "lot": lot,
            "start": start,
            "end": start + HOUR / 10,
            "vehicle": format!("BN-{i:05}")
        });
        let t = Instant::now();
        let resp = client.call(request).await;
        latencies.push(t.elapsed());
        if resp["ok"] == true {
            ok += 1;
        } else if resp["error"]["code"] == "no_availability" {
            full += 1;
        } else {
            panic!("unexpected reserve failure: {resp}");
        }
    }

    println!("  reserved={ok}, lot_full={full}");
    print_latency("reserve", &mut latencies);
}

/// Many clients racing for the same explicitly chosen spot.
async fn bench_contention(addr: SocketAddr, lot: &str, users: &[String]) {
    let mut probe = Client::connect(addr).await;
    let base = unix_now_ms();
    let (start, end) = (base + 500 * HOUR / 10, base + 501 * HOUR / 10);
    let resp = probe
        .call(json!({"op": "find_availability", "lot": lot, "start": start, "end": end}))
        .await;
    let spot = resp["data"]["available"][0].as_str().unwrap().to_string();

    let t = Instant::now();
    let mut tasks = Vec::new();
    for user in users {
        let user = user.clone();
        let lot = lot.to_string();
        let spot = spot.clone();
        tasks.push(tokio::spawn(async move {
            let mut client = Client::connect(addr).await;
            let resp = client
                .call(json!({
                    "user": user,
                    "op": "reserve",
                    "lot": lot,
                    "spot": spot,
                    "start": start,
                    "end": end,
                    "vehicle": "RACE-1"
                }))
                .await;
            resp["ok"] == true
        }));
    }

    let mut winners = 0usize;
    for task in tasks {
        if task.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one contender may win the spot");
    println!(
        "  contention: {} clients, 1 winner, {} conflicts, {:.2}ms total",
        users.len(),
        users.len() - 1,
        t.elapsed().as_secs_f64() * 1000.0
    );
}

async fn bench_search(addr: SocketAddr) {
    let mut client = Client::connect(addr).await;
    let mut latencies = Vec::with_capacity(SEARCH_OPS);
    for _ in 0..SEARCH_OPS {
        let t = Instant::now();
        let resp = client
            .call(json!({"op": "search_lots", "query": "benchville"}))
            .await;
        latencies.push(t.elapsed());
        assert_eq!(resp["data"].as_array().unwrap().len(), LOTS);
    }
    print_latency("search_lots", &mut latencies);
}

#[tokio::main]
async fn main() {
    println!("parkade stress bench");
    let addr = start_server().await;
    let mut admin_client = Client::connect(addr).await;
    let (_admin, lots, users) = setup(&mut admin_client).await;

    bench_reserve(addr, &lots, &users[0]).await;
    bench_contention(addr, &lots[0], &users).await;
    bench_search(addr).await;
}
