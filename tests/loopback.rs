//! End-to-end tests against an in-process fake switch on 127.0.0.1.

use hmac::{Hmac, Mac};
use pretty_assertions::assert_eq;
use rand::RngCore;
use serde_json::{Value, json};
use sha2::Sha256;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tuyaswitch::crypto::TuyaCipher;
use tuyaswitch::device::{TuyaDevice, derive_session_key};
use tuyaswitch::error::TuyaError;
use tuyaswitch::protocol::{
    CommandType, TuyaMessage, Version, header_len, pack_message, parse_header, unpack_message,
};
use tuyaswitch::transport::{DeviceConfig, SwitchTransport};

const DEV_ID: &str = "bf0123456789abcdef01";
const KEY: &str = "0123456789abcdef";

/// Behaviour knobs for the fake switch.
#[derive(Clone)]
struct FakeSwitch {
    version: Version,
    key: Vec<u8>,
    /// Push an unsolicited status frame before acknowledging a write.
    push_on_control: bool,
    /// Hang up after every reply.
    close_after_reply: bool,
}

impl FakeSwitch {
    fn new(version: Version) -> Self {
        Self {
            version,
            key: KEY.as_bytes().to_vec(),
            push_on_control: false,
            close_after_reply: false,
        }
    }

    /// Starts serving on an ephemeral port. Returns the port and a connection counter.
    async fn spawn(self) -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = connections.clone();
        let state = Arc::new(tokio::sync::Mutex::new(json!({"1": false, "9": "white"})));

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let fake = self.clone();
                let state = state.clone();
                tokio::spawn(async move {
                    let _ = fake.serve(stream, state).await;
                });
            }
        });
        (port, connections)
    }

    async fn serve(
        &self,
        mut stream: TcpStream,
        state: Arc<tokio::sync::Mutex<Value>>,
    ) -> Option<()> {
        let mut session_key: Option<Vec<u8>> = None;
        let mut local_nonce = Vec::new();
        let mut remote_nonce = [0u8; 16];
        let mut seqno = 100;

        loop {
            let frame = read_frame(&mut stream).await?;
            let key = session_key.clone().unwrap_or_else(|| self.key.clone());
            let frame_key = self.version.negotiates_session().then_some(key.as_slice());
            let request = unpack_message(&frame, frame_key, false).ok()?;
            let body = self.open(&key, &request.payload)?;

            let mut replies = Vec::new();
            match request.cmd {
                0x03 => {
                    local_nonce = body;
                    rand::rng().fill_bytes(&mut remote_nonce);
                    let mut payload = remote_nonce.to_vec();
                    payload.extend(hmac(&self.key, &local_nonce));
                    replies.push((0x04, payload));
                }
                0x05 => {
                    if body != hmac(&self.key, &remote_nonce) {
                        return None;
                    }
                    session_key = Some(
                        derive_session_key(self.version, &self.key, &local_nonce, &remote_nonce)
                            .ok()?,
                    );
                    continue;
                }
                0x0a | 0x10 => {
                    serde_json::from_slice::<Value>(&body).ok()?;
                    let dps = state.lock().await.clone();
                    let reply = json!({"devId": DEV_ID, "dps": dps});
                    replies.push((request.cmd, reply.to_string().into_bytes()));
                }
                0x07 | 0x0d => {
                    let sent: Value = serde_json::from_slice(&body).ok()?;
                    let update = sent
                        .get("dps")
                        .or_else(|| sent.get("data").and_then(|d| d.get("dps")))?
                        .as_object()?
                        .clone();
                    let mut dps = state.lock().await;
                    for (dp, value) in update {
                        dps[dp.as_str()] = value;
                    }
                    if self.push_on_control {
                        let push = json!({"devId": DEV_ID, "dps": dps.clone()});
                        replies.push((0x08, push.to_string().into_bytes()));
                    }
                    replies.push((request.cmd, Vec::new()));
                }
                _ => return None,
            }

            for (cmd, payload) in replies {
                let msg = TuyaMessage {
                    seqno,
                    cmd,
                    retcode: Some(0),
                    payload: self.seal(&key, cmd, payload)?,
                    prefix: self.version.prefix(),
                    ..Default::default()
                };
                seqno += 1;
                let packed = pack_message(&msg, frame_key).ok()?;
                stream.write_all(&packed).await.ok()?;
            }
            if self.close_after_reply && request.cmd != CommandType::SessKeyNegStart as u32 {
                return Some(());
            }
        }
    }

    fn open(&self, key: &[u8], payload: &[u8]) -> Option<Vec<u8>> {
        let cipher = TuyaCipher::new(key).ok()?;
        match self.version {
            Version::V3_3 => cipher.decrypt_ecb(self.version.strip_header(payload)).ok(),
            Version::V3_4 => {
                let plain = cipher.decrypt_ecb(payload).ok()?;
                Some(self.version.strip_header(&plain).to_vec())
            }
            Version::V3_5 => Some(self.version.strip_header(payload).to_vec()),
            _ => None,
        }
    }

    fn seal(&self, key: &[u8], cmd: u32, payload: Vec<u8>) -> Option<Vec<u8>> {
        if payload.is_empty() {
            return Some(payload);
        }
        let cipher = TuyaCipher::new(key).ok()?;
        match self.version {
            Version::V3_3 if cmd == CommandType::Status as u32 => {
                let mut out = self.version.header().to_vec();
                out.extend(cipher.encrypt_ecb(&payload, true).ok()?);
                Some(out)
            }
            Version::V3_3 | Version::V3_4 => cipher.encrypt_ecb(&payload, true).ok(),
            _ => Some(payload),
        }
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

async fn read_frame(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut frame = vec![0u8; 4];
    stream.read_exact(&mut frame).await.ok()?;
    let prefix = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
    frame.resize(header_len(prefix), 0);
    stream.read_exact(&mut frame[4..]).await.ok()?;
    let header = parse_header(&frame).ok()?;
    let read = frame.len();
    frame.resize(header.total_length as usize, 0);
    stream.read_exact(&mut frame[read..]).await.ok()?;
    Some(frame)
}

fn client(version: Version, port: u16) -> TuyaDevice {
    let config = DeviceConfig::new(DEV_ID, "127.0.0.1", KEY)
        .version(version)
        .port(port);
    let mut device = TuyaDevice::connect(config).unwrap();
    device.set_persistent(true);
    device
}

async fn switch_on_and_read_back(version: Version, fake: FakeSwitch) {
    let (port, connections) = fake.spawn().await;
    let mut device = client(version, port);

    let before = device.status().await.unwrap();
    assert_eq!(before.dps_json(), r#"{"1":false,"9":"white"}"#);
    assert!(!before.is_on());

    device.set_value("1", json!(true)).await.unwrap();
    let after = device.status().await.unwrap();
    assert!(after.is_on());
    assert_eq!(after.get("9"), Some(&json!("white")));

    assert!(device.is_connected());
    assert_eq!(connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_v33_status_and_control() {
    let mut fake = FakeSwitch::new(Version::V3_3);
    fake.push_on_control = true;
    switch_on_and_read_back(Version::V3_3, fake).await;
}

#[tokio::test]
async fn test_v34_negotiates_session() {
    switch_on_and_read_back(Version::V3_4, FakeSwitch::new(Version::V3_4)).await;
}

#[tokio::test]
async fn test_v35_gcm_frames() {
    let mut fake = FakeSwitch::new(Version::V3_5);
    fake.push_on_control = true;
    switch_on_and_read_back(Version::V3_5, fake).await;
}

#[tokio::test]
async fn test_full_status_response() {
    let (port, _) = FakeSwitch::new(Version::V3_3).spawn().await;
    let mut device = client(Version::V3_3, port);
    let status = device.status().await.unwrap();
    assert_eq!(
        status.to_string(),
        format!(r#"{{"devId":"{DEV_ID}","dps":{{"1":false,"9":"white"}}}}"#)
    );
}

#[tokio::test]
async fn test_reconnects_after_device_hangs_up() {
    let mut fake = FakeSwitch::new(Version::V3_3);
    fake.close_after_reply = true;
    let (port, connections) = fake.spawn().await;
    let mut device = client(Version::V3_3, port);

    device.status().await.unwrap();
    let status = device.status().await.unwrap();
    assert!(!status.is_on());
    assert_eq!(connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_wrong_key_reports_key_or_version() {
    let mut fake = FakeSwitch::new(Version::V3_3);
    fake.key = b"fedcba9876543210".to_vec();
    let (port, _) = fake.spawn().await;
    let mut device = client(Version::V3_3, port);

    let err = device.status().await.unwrap_err();
    assert_eq!(err, TuyaError::KeyOrVersionError);
    assert_eq!(err.code(), 914);
    assert!(!device.is_connected());
}

#[tokio::test]
async fn test_wrong_key_fails_v34_handshake() {
    let mut fake = FakeSwitch::new(Version::V3_4);
    fake.key = b"fedcba9876543210".to_vec();
    let (port, _) = fake.spawn().await;
    let mut device = client(Version::V3_4, port);

    let err = device.status().await.unwrap_err();
    assert_eq!(err, TuyaError::KeyOrVersionError);
}
