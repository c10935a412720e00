//! Single Tuya device client.
//! Handles the TCP connection, session key negotiation (v3.4+), and
//! request/response exchanges for status queries and data point writes.

use crate::crypto::TuyaCipher;
use crate::error::{Result, TuyaError};
use crate::protocol::{
    CommandType, NO_PROTOCOL_HEADER_CMDS, PREFIX_55AA, PREFIX_6699, TuyaMessage, Version,
    header_len, pack_message, parse_header, unpack_message,
};
use crate::transport::{DeviceConfig, StatusSnapshot, SwitchTransport};
use hmac::{Hmac, Mac};
use log::{debug, info, warn};
use rand::RngCore;
use serde_json::{Value, json};
use sha2::Sha256;
use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Frames read while waiting for a reply before giving up.
const MAX_FRAMES_PER_REPLY: usize = 8;
/// Bytes skipped while resynchronising on a frame prefix.
const MAX_PREFIX_SCAN: usize = 1024;

const NONCE_LEN: usize = 16;
const NEG_RESP_LEN: usize = NONCE_LEN + 32;

const KEY_DPS: &str = "dps";
const KEY_T: &str = "t";
const KEY_DATA: &str = "data";
const KEY_PROTOCOL: &str = "protocol";
const KEY_GW_ID: &str = "gwId";
const KEY_DEV_ID: &str = "devId";
const KEY_UID: &str = "uid";

type HmacSha256 = Hmac<Sha256>;

/// Derives the session key from both nonces (v3.4/v3.5 handshake).
///
/// The XOR of the nonces is encrypted with the local key: ECB for v3.4,
/// GCM keyed on the local nonce for v3.5 (ciphertext bytes only).
pub fn derive_session_key(
    version: Version,
    local_key: &[u8],
    local_nonce: &[u8],
    remote_nonce: &[u8],
) -> Result<Vec<u8>> {
    if local_nonce.len() < NONCE_LEN || remote_nonce.len() < NONCE_LEN {
        return Err(TuyaError::HandshakeFailed);
    }
    let mixed: Vec<u8> = local_nonce[..NONCE_LEN]
        .iter()
        .zip(&remote_nonce[..NONCE_LEN])
        .map(|(a, b)| a ^ b)
        .collect();

    let cipher = TuyaCipher::new(local_key)?;
    if version == Version::V3_5 {
        let sealed = cipher.encrypt_gcm(&mixed, &local_nonce[..12], &[])?;
        Ok(sealed[12..12 + NONCE_LEN].to_vec())
    } else {
        cipher.encrypt_ecb(&mixed, false)
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| TuyaError::EncryptionFailed)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// A Tuya switch reached over the local network.
///
/// One request is in flight at a time. With persistence on, the socket and
/// its session key survive between requests.
pub struct TuyaDevice {
    id: String,
    address: String,
    local_key: Vec<u8>,
    port: u16,
    connection_timeout: std::time::Duration,
    version: Version,
    persist: bool,
    stream: Option<TcpStream>,
    session_key: Option<Vec<u8>>,
    seqno: u32,
}

impl TuyaDevice {
    pub fn new(config: DeviceConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            id: config.id,
            address: config.address,
            local_key: config.local_key.into_bytes(),
            port: config.port,
            connection_timeout: config.timeout,
            version: config.version,
            persist: false,
            stream: None,
            session_key: None,
            seqno: 1,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Sends a request and returns the decrypted reply payload.
    ///
    /// A reused persistent socket that turns out to be dead is reopened once.
    pub async fn request(&mut self, command: CommandType, data: Option<Value>) -> Result<Vec<u8>> {
        let reused = self.stream.is_some();
        match self.request_once(command, data.clone()).await {
            Err(e) if reused && e.is_connection_loss() => {
                info!(
                    "Persistent connection to {} was lost ({}), reconnecting",
                    self.id, e
                );
                self.request_once(command, data).await
            }
            result => result,
        }
    }

    /// Drops the socket and its session key.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("Closing connection to device {}", self.id);
        }
        self.session_key = None;
    }

    async fn request_once(&mut self, command: CommandType, data: Option<Value>) -> Result<Vec<u8>> {
        let (mut stream, fresh) = match self.stream.take() {
            Some(stream) => (stream, false),
            None => (self.connect_and_handshake().await?, true),
        };

        let result = self.exchange(&mut stream, command, data).await;
        match &result {
            Ok(_) if self.persist => self.stream = Some(stream),
            _ => {
                drop(stream);
                self.session_key = None;
            }
        }

        result.map_err(|e| match e {
            // A fresh socket closed before the first reply is how devices reject a bad key.
            TuyaError::ConnectionClosed if fresh => {
                warn!(
                    "Device {} closed the connection, possibly a key or version mismatch",
                    self.id
                );
                TuyaError::KeyOrVersionError
            }
            other => other,
        })
    }

    async fn exchange(
        &mut self,
        stream: &mut TcpStream,
        command: CommandType,
        data: Option<Value>,
    ) -> Result<Vec<u8>> {
        let (cmd, payload) = self.generate_payload(command, data);
        debug!("request: cmd=0x{:02X}, payload={}", cmd, payload);
        self.send_message(stream, cmd, serde_json::to_vec(&payload)?)
            .await?;

        let is_query = matches!(command, CommandType::DpQuery);
        for _ in 0..MAX_FRAMES_PER_REPLY {
            let msg = self.read_message(stream).await?;
            if msg.cmd != cmd {
                debug!(
                    "Skipping unsolicited frame cmd=0x{:02X} ({:?}) from {}",
                    msg.cmd,
                    CommandType::from_u32(msg.cmd),
                    self.id
                );
                continue;
            }
            if is_query && msg.payload.is_empty() {
                debug!("Empty ack for status query, waiting for data");
                continue;
            }
            return Ok(msg.payload);
        }
        Err(TuyaError::InvalidPayload(format!(
            "no reply to command 0x{:02X}",
            cmd
        )))
    }

    /// Builds the JSON body for a command, handling v3.4+ command overrides.
    fn generate_payload(&self, command: CommandType, data: Option<Value>) -> (u32, Value) {
        let cmd = if self.version.negotiates_session() {
            match command {
                CommandType::Control => CommandType::ControlNew,
                CommandType::DpQuery => CommandType::DpQueryNew,
                other => other,
            }
        } else {
            command
        };

        let t = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let payload = if cmd == CommandType::ControlNew {
            let mut inner = serde_json::Map::new();
            if let Some(d) = data {
                inner.insert(KEY_DPS.into(), d);
            }
            json!({ KEY_PROTOCOL: 5, KEY_T: t, KEY_DATA: inner })
        } else {
            let mut payload = serde_json::Map::new();
            payload.insert(KEY_GW_ID.into(), self.id.clone().into());
            payload.insert(KEY_DEV_ID.into(), self.id.clone().into());
            payload.insert(KEY_UID.into(), self.id.clone().into());
            payload.insert(KEY_T.into(), t.to_string().into());
            if let Some(d) = data {
                payload.insert(KEY_DPS.into(), d);
            }
            Value::Object(payload)
        };

        (cmd as u32, payload)
    }

    async fn connect_and_handshake(&mut self) -> Result<TcpStream> {
        self.session_key = None;
        self.seqno = 1;

        info!(
            "Connecting to device {} at {}:{} (v{})",
            self.id, self.address, self.port, self.version
        );
        let mut stream = timeout(
            self.connection_timeout,
            TcpStream::connect((self.address.as_str(), self.port)),
        )
        .await
        .map_err(|_| TuyaError::Timeout)?
        .map_err(|e| TuyaError::ConnectionFailed(e.to_string()))?;
        stream.set_nodelay(true)?;

        if self.version.negotiates_session() {
            self.negotiate_session_key(&mut stream).await?;
        }
        Ok(stream)
    }

    async fn negotiate_session_key(&mut self, stream: &mut TcpStream) -> Result<()> {
        debug!("Starting session key negotiation with {}", self.id);

        let mut local_nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut local_nonce);
        self.send_message(
            stream,
            CommandType::SessKeyNegStart as u32,
            local_nonce.to_vec(),
        )
        .await?;

        let resp = self.read_message(stream).await.map_err(|e| match e {
            TuyaError::ConnectionClosed | TuyaError::HmacMismatch | TuyaError::DecryptionFailed => {
                TuyaError::KeyOrVersionError
            }
            other => other,
        })?;
        if resp.cmd != CommandType::SessKeyNegResp as u32 || resp.payload.len() < NEG_RESP_LEN {
            return Err(TuyaError::HandshakeFailed);
        }

        let remote_nonce = &resp.payload[..NONCE_LEN];
        let remote_hmac = &resp.payload[NONCE_LEN..NEG_RESP_LEN];
        if hmac_sha256(&self.local_key, &local_nonce)? != remote_hmac {
            return Err(TuyaError::KeyOrVersionError);
        }

        let finish = hmac_sha256(&self.local_key, remote_nonce)?;
        self.send_message(stream, CommandType::SessKeyNegFinish as u32, finish)
            .await?;

        let session_key =
            derive_session_key(self.version, &self.local_key, &local_nonce, remote_nonce)?;
        self.session_key = Some(session_key);
        debug!("Session key negotiated with {}", self.id);
        Ok(())
    }

    fn cipher_key(&self) -> &[u8] {
        self.session_key.as_deref().unwrap_or(&self.local_key)
    }

    /// Key handed to the framing layer: HMAC for v3.4, GCM for v3.5.
    fn frame_key(&self) -> Option<&[u8]> {
        self.version
            .negotiates_session()
            .then(|| self.cipher_key())
    }

    /// Encrypts a JSON or handshake body according to the protocol version.
    fn seal_payload(&self, cmd: u32, payload: Vec<u8>) -> Result<Vec<u8>> {
        let cipher = TuyaCipher::new(self.cipher_key())?;
        let with_header = !NO_PROTOCOL_HEADER_CMDS.contains(&cmd);
        let prepend_header = |body: Vec<u8>| {
            if with_header {
                let mut out = self.version.header().to_vec();
                out.extend_from_slice(&body);
                out
            } else {
                body
            }
        };

        match self.version {
            Version::V3_1 if cmd == CommandType::Control as u32 => cipher.seal_v31(&payload),
            Version::V3_1 => Ok(payload),
            Version::V3_2 | Version::V3_3 => Ok(prepend_header(cipher.encrypt_ecb(&payload, true)?)),
            Version::V3_4 => cipher.encrypt_ecb(&prepend_header(payload), true),
            // The 6699 framing encrypts the whole body.
            Version::V3_5 => Ok(prepend_header(payload)),
        }
    }

    /// Reverses [`seal_payload`](Self::seal_payload) for a received frame.
    fn open_payload(&self, prefix: u32, payload: Vec<u8>) -> Result<Vec<u8>> {
        if payload.is_empty() {
            return Ok(payload);
        }
        let cipher = TuyaCipher::new(self.cipher_key())?;

        match self.version {
            Version::V3_1 if payload.starts_with(b"3.1") => cipher.open_v31(&payload),
            Version::V3_1 => Ok(payload),
            Version::V3_2 | Version::V3_3 => {
                let body = self.version.strip_header(&payload);
                match cipher.decrypt_ecb(body) {
                    Ok(plain) => Ok(plain),
                    // Errors such as "data unvalid" come back unencrypted.
                    Err(_) if body.first() == Some(&b'{') => Ok(body.to_vec()),
                    Err(_) => Err(TuyaError::InvalidPayload(
                        String::from_utf8_lossy(body).into_owned(),
                    )),
                }
            }
            _ => {
                let plain = if prefix == PREFIX_55AA {
                    cipher.decrypt_ecb(&payload)?
                } else {
                    payload
                };
                Ok(self.version.strip_header(&plain).to_vec())
            }
        }
    }

    async fn send_message(&mut self, stream: &mut TcpStream, cmd: u32, payload: Vec<u8>) -> Result<()> {
        let msg = TuyaMessage {
            seqno: self.seqno,
            cmd,
            payload: self.seal_payload(cmd, payload)?,
            prefix: self.version.prefix(),
            ..Default::default()
        };
        self.seqno = self.seqno.wrapping_add(1);
        debug!(
            "Sending message: cmd=0x{:02X}, seqno={}, payload_len={}",
            msg.cmd,
            msg.seqno,
            msg.payload.len()
        );

        let packed = pack_message(&msg, self.frame_key())?;
        self.io(stream.write_all(&packed)).await
    }

    async fn read_message(&self, stream: &mut TcpStream) -> Result<TuyaMessage> {
        let mut frame = self.scan_for_prefix(stream).await?.to_vec();
        let prefix = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);

        frame.resize(header_len(prefix), 0);
        self.io(stream.read_exact(&mut frame[4..])).await?;
        let header = parse_header(&frame)?;

        let read = frame.len();
        frame.resize(header.total_length as usize, 0);
        self.io(stream.read_exact(&mut frame[read..])).await?;
        debug!("Received packet (hex): {}", hex::encode(&frame));

        let mut msg = unpack_message(&frame, self.frame_key(), true)?;
        msg.payload = self.open_payload(msg.prefix, msg.payload)?;
        debug!(
            "Received message: cmd=0x{:02X}, retcode={:?}, payload={}",
            msg.cmd,
            msg.retcode,
            String::from_utf8_lossy(&msg.payload)
        );
        Ok(msg)
    }

    async fn scan_for_prefix(&self, stream: &mut TcpStream) -> Result<[u8; 4]> {
        let mut buf = [0u8; 4];
        self.io(stream.read_exact(&mut buf)).await?;

        for _ in 0..MAX_PREFIX_SCAN {
            let val = u32::from_be_bytes(buf);
            if val == PREFIX_55AA || val == PREFIX_6699 {
                return Ok(buf);
            }
            buf.rotate_left(1);
            buf[3] = self.io(stream.read_u8()).await?;
        }
        Err(TuyaError::InvalidHeader)
    }

    /// Applies the connection timeout to a socket operation.
    async fn io<T>(&self, op: impl Future<Output = std::io::Result<T>>) -> Result<T> {
        timeout(self.connection_timeout, op)
            .await
            .map_err(|_| TuyaError::Timeout)?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => TuyaError::ConnectionClosed,
                _ => TuyaError::from(e),
            })
    }
}

impl SwitchTransport for TuyaDevice {
    fn connect(config: DeviceConfig) -> Result<Self> {
        Self::new(config)
    }

    fn set_version(&mut self, version: Version) {
        if version != self.version {
            self.close();
            self.version = version;
        }
    }

    fn set_persistent(&mut self, persistent: bool) {
        self.persist = persistent;
        if !persistent {
            self.close();
        }
    }

    async fn status(&mut self) -> Result<StatusSnapshot> {
        let payload = self.request(CommandType::DpQuery, None).await?;
        StatusSnapshot::from_payload(&payload)
    }

    async fn set_value(&mut self, dp: &str, value: Value) -> Result<()> {
        let reply = self
            .request(CommandType::Control, Some(json!({ dp: value })))
            .await?;
        if !reply.is_empty() {
            debug!("Control reply: {}", String::from_utf8_lossy(&reply));
        }
        Ok(())
    }
}
