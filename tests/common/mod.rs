//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use keybase_bot::ipc::{LineTransport, Transport};
use serde_json::Value;
use tokio::io::{duplex, split, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// An in-memory transport and the peer end of its stream.
pub fn duplex_transport() -> (Box<dyn Transport>, DuplexStream) {
    let (ours, peer) = duplex(64 * 1024);
    let (read, write) = split(ours);
    (Box::new(LineTransport::new(BufReader::new(read), write)), peer)
}

/// Read one unframed JSON request from `peer`, buffering leftovers in `pending`.
pub async fn next_request(peer: &mut DuplexStream, pending: &mut Vec<u8>) -> Option<Value> {
    let mut chunk = [0u8; 4096];
    loop {
        let next = {
            let mut stream = serde_json::Deserializer::from_slice(pending).into_iter::<Value>();
            stream
                .next()
                .map(|parsed| parsed.map(|value| (value, stream.byte_offset())))
        };
        match next {
            Some(Ok((value, consumed))) => {
                pending.drain(..consumed);
                return Some(value);
            }
            Some(Err(e)) if !e.is_eof() => return None,
            _ => {}
        }
        match peer.read(&mut chunk).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => pending.extend_from_slice(&chunk[..n]),
        }
    }
}

/// Write one response line.
pub async fn respond(peer: &mut DuplexStream, response: &Value) -> bool {
    let mut line = response.to_string().into_bytes();
    line.push(b'\n');
    peer.write_all(&line).await.is_ok()
}

/// Write an executable shell script named `keybase` into `dir`.
#[cfg(unix)]
pub fn fake_keybase(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("keybase");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}
