//! End-to-end tests driving a real `Cluster` over loopback TCP rather than
//! through any internal API, covering the scenarios a client, a server, and
//! an operator would actually exercise.

use lb::config::GlobalConfig;
use lb::{Cluster, Ports};
use std::net::TcpListener as StdTcpListener;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::sleep;

fn free_port() -> u16 {
    StdTcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn test_ports() -> Ports {
    Ports {
        client: free_port(),
        registration: free_port(),
        status: free_port(),
        admin: free_port(),
    }
}

async fn send_line(port: u16, line: &str) -> String {
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    write_half.write_all(format!("{line}\n").as_bytes()).await.unwrap();
    let mut reader = BufReader::new(read_half);
    let mut response = String::new();
    reader.read_line(&mut response).await.unwrap();
    response.trim().to_string()
}

/// Reads response lines until the `END` sentinel, as the admin protocol does.
async fn send_admin(port: u16, line: &str) -> Vec<String> {
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    write_half.write_all(format!("{line}\n").as_bytes()).await.unwrap();
    let mut reader = BufReader::new(read_half);
    let mut lines = Vec::new();
    loop {
        let mut buf = String::new();
        let n = reader.read_line(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        let trimmed = buf.trim().to_string();
        if trimmed == "END" {
            break;
        }
        lines.push(trimmed);
    }
    lines
}

async fn join(port: u16, server_port: u16) {
    let reply = send_line(port, &format!("!join {server_port}")).await;
    assert_eq!(reply, "!ack");
}

#[tokio::test]
async fn empty_cluster_reports_no_server_available() {
    let ports = test_ports();
    let cluster = Cluster::new(GlobalConfig::default());
    cluster.start(ports).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    let reply = send_line(ports.client, "HELLO alice static").await;
    assert_eq!(reply, "NO_SERVER_AVAILABLE");
}

#[tokio::test]
async fn single_server_is_assigned_to_a_dynamic_client() {
    let ports = test_ports();
    let cluster = Cluster::new(GlobalConfig::default());
    cluster.start(ports).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    join(ports.registration, 9001).await;

    // No probe has completed yet, so dynamic selection falls back to static.
    let reply = send_line(ports.client, "HELLO alice dynamic").await;
    assert!(reply.ends_with(":9001"));
}

#[tokio::test]
async fn weighted_static_selection_matches_the_configured_ratio() {
    let ports = test_ports();
    let cluster = Cluster::new(GlobalConfig::default());
    cluster.start(ports).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    join(ports.registration, 9001).await;
    join(ports.registration, 9002).await;

    let servers_before = send_admin(ports.admin, "servers").await;
    let ep_a = servers_before[0].split_whitespace().next().unwrap().to_string();
    let ep_b = servers_before[1].split_whitespace().next().unwrap().to_string();

    send_admin(ports.admin, &format!("setweight {ep_a} 3")).await;
    send_admin(ports.admin, &format!("setweight {ep_b} 1")).await;

    let mut count_a = 0;
    let mut count_b = 0;
    for i in 0..8 {
        let reply = send_line(ports.client, &format!("HELLO client-{i} static")).await;
        if reply == ep_a {
            count_a += 1;
        } else if reply == ep_b {
            count_b += 1;
        }
    }

    assert_eq!(count_a, 6);
    assert_eq!(count_b, 2);
}

#[tokio::test]
async fn sticky_client_follows_drain_to_another_server() {
    let ports = test_ports();
    let cluster = Cluster::new(GlobalConfig::default());
    cluster.start(ports).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    join(ports.registration, 9001).await;

    let first = send_line(ports.client, "HELLO carol sticky").await;
    assert!(first.ends_with(":9001"));

    send_admin(ports.admin, &format!("drain {first}")).await;
    join(ports.registration, 9002).await;

    let second = send_line(ports.client, "HELLO carol sticky").await;
    assert!(second.ends_with(":9002"));
}

#[tokio::test]
async fn admin_evict_sweeps_stale_servers_after_timeout_is_lowered() {
    let ports = test_ports();
    let cluster = Cluster::new(GlobalConfig::default());
    cluster.start(ports).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    join(ports.registration, 9001).await;
    assert_eq!(send_admin(ports.admin, "servers").await.len(), 1);

    send_admin(ports.admin, "set evict 0").await;
    // The evictor sweeps every 5s on a fixed interval; give it one full pass.
    sleep(Duration::from_secs(6)).await;

    assert!(send_admin(ports.admin, "servers").await.is_empty());
}

#[tokio::test]
async fn banned_client_is_rejected_until_unbanned() {
    let ports = test_ports();
    let cluster = Cluster::new(GlobalConfig::default());
    cluster.start(ports).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    join(ports.registration, 9001).await;
    send_admin(ports.admin, "ban name mallory").await;

    let reply = send_line(ports.client, "HELLO mallory static").await;
    assert_eq!(reply, "NO_SERVER_AVAILABLE");

    send_admin(ports.admin, "unban name mallory").await;
    let reply = send_line(ports.client, "HELLO mallory static").await;
    assert!(reply.ends_with(":9001"));
}
