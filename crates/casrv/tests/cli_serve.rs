#![cfg(feature = "cli")]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

const VERSION: u16 = 0;
const READ_NOTIFY: u16 = 15;
const CLAIM_CIU: u16 = 18;
const WRITE_NOTIFY: u16 = 19;
const ACCESS_RIGHTS: u16 = 22;
const CLAIM_CIU_FAILED: u16 = 26;
const DBR_DOUBLE: u16 = 6;

struct Server {
    child: Child,
    catalog: PathBuf,
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = std::fs::remove_file(&self.catalog);
    }
}

fn start_server(json: &str) -> (Server, TcpStream) {
    let catalog = std::env::temp_dir().join(format!(
        "casrv-serve-{}-{}.json",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::write(&catalog, json).expect("catalogue should be writable");

    let mut child = Command::new(env!("CARGO_BIN_EXE_casrv"))
        .arg("--format")
        .arg("json")
        .arg("--log-level")
        .arg("error")
        .arg("serve")
        .arg("--bind")
        .arg("127.0.0.1")
        .arg("--port")
        .arg("0")
        .arg("--pvs")
        .arg(&catalog)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("serve should start");

    let stdout = child.stdout.take().expect("stdout should be piped");
    let server = Server { child, catalog };

    let mut line = String::new();
    BufReader::new(stdout)
        .read_line(&mut line)
        .expect("listening line should arrive");
    let announced: serde_json::Value =
        serde_json::from_str(&line).expect("listening line should be json");
    let address = announced["address"]
        .as_str()
        .expect("address should be present")
        .to_string();

    let stream = TcpStream::connect(&address).expect("connect should succeed");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout should apply");
    (server, stream)
}

fn message(command: u16, data_type: u16, count: u16, cid: u32, available: u32, payload: &[u8]) -> Vec<u8> {
    let padded = payload.len().div_ceil(8) * 8;
    let mut out = Vec::with_capacity(16 + padded);
    out.extend_from_slice(&command.to_be_bytes());
    out.extend_from_slice(&(padded as u16).to_be_bytes());
    out.extend_from_slice(&data_type.to_be_bytes());
    out.extend_from_slice(&count.to_be_bytes());
    out.extend_from_slice(&cid.to_be_bytes());
    out.extend_from_slice(&available.to_be_bytes());
    out.extend_from_slice(payload);
    out.resize(16 + padded, 0);
    out
}

struct Reply {
    command: u16,
    data_type: u16,
    cid: u32,
    available: u32,
    payload: Vec<u8>,
}

fn read_reply(stream: &mut TcpStream) -> Reply {
    let mut header = [0u8; 16];
    stream.read_exact(&mut header).expect("reply header should arrive");
    let be16 = |at: usize| u16::from_be_bytes([header[at], header[at + 1]]);
    let be32 = |at: usize| u32::from_be_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);
    let mut payload = vec![0u8; usize::from(be16(2))];
    stream.read_exact(&mut payload).expect("reply payload should arrive");
    Reply {
        command: be16(0),
        data_type: be16(4),
        cid: be32(8),
        available: be32(12),
        payload,
    }
}

fn claim(stream: &mut TcpStream, cid: u32, name: &str) {
    let mut payload = name.as_bytes().to_vec();
    payload.push(0);
    stream
        .write_all(&message(CLAIM_CIU, 0, 0, cid, 13, &payload))
        .expect("claim should send");
}

#[test]
fn serve_claims_writes_and_reads_back() {
    let (_server, mut stream) =
        start_server(r#"{"pvs":[{"name":"tempA","type":"double","value":21.5}]}"#);

    assert_eq!(read_reply(&mut stream).command, VERSION);

    claim(&mut stream, 1, "tempA");
    let rights = read_reply(&mut stream);
    assert_eq!(rights.command, ACCESS_RIGHTS);
    assert_eq!(rights.available, 3);
    let confirm = read_reply(&mut stream);
    assert_eq!(confirm.command, CLAIM_CIU);
    assert_eq!(confirm.data_type, DBR_DOUBLE);

    stream
        .write_all(&message(READ_NOTIFY, DBR_DOUBLE, 1, 1, 7, &[]))
        .expect("read should send");
    let read = read_reply(&mut stream);
    assert_eq!(read.command, READ_NOTIFY);
    assert_eq!(read.cid, 1, "status should be normal");
    assert_eq!(read.available, 7);
    assert_eq!(&read.payload[..8], &21.5f64.to_be_bytes());

    stream
        .write_all(&message(WRITE_NOTIFY, DBR_DOUBLE, 1, 1, 8, &4.0f64.to_be_bytes()))
        .expect("write should send");
    let written = read_reply(&mut stream);
    assert_eq!(written.command, WRITE_NOTIFY);
    assert_eq!(written.cid, 1);
    assert_eq!(written.available, 8);

    stream
        .write_all(&message(READ_NOTIFY, DBR_DOUBLE, 1, 1, 9, &[]))
        .expect("read should send");
    let read = read_reply(&mut stream);
    assert_eq!(&read.payload[..8], &4.0f64.to_be_bytes());
}

#[test]
fn serve_rejects_unknown_name() {
    let (_server, mut stream) = start_server(r#"{"pvs":[]}"#);
    assert_eq!(read_reply(&mut stream).command, VERSION);

    claim(&mut stream, 5, "missing");
    let failed = read_reply(&mut stream);
    assert_eq!(failed.command, CLAIM_CIU_FAILED);
    assert_eq!(failed.cid, 5);
}
