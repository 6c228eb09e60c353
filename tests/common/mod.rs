//! Test utilities for mcbridge integration tests

use mcbridge::wire::HEADER_LEN;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Build a binary wire frame with the given body.
pub fn frame_with_body(body: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; HEADER_LEN];
    frame[0] = 0x80; // request magic
    frame[8..12].copy_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    frame
}

/// Start an upstream that reads one complete frame per request and
/// answers each with `reply`. Returns its address.
pub async fn start_scripted_upstream(reply: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let reply = reply.clone();
            tokio::spawn(async move {
                loop {
                    let mut header = [0u8; HEADER_LEN];
                    if socket.read_exact(&mut header).await.is_err() {
                        break;
                    }
                    let body_len =
                        u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
                    let mut body = vec![0u8; body_len];
                    if socket.read_exact(&mut body).await.is_err() {
                        break;
                    }
                    if socket.write_all(&reply).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// Start an upstream that accepts connections and never answers.
pub async fn start_silent_upstream() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}

/// Wait until the listener reports its bound address.
pub async fn wait_for_bind(listener: &std::sync::Arc<mcbridge::listener::Listener>) -> String {
    for _ in 0..100 {
        if let Some(addr) = listener.bound_address() {
            return addr.to_string();
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("listener never bound");
}
