//! Tuya wire protocol implementation.
//! Handles packet framing, header parsing, and CRC/HMAC/GCM verification.

use crate::crypto::{GCM_IV_LEN, GCM_TAG_LEN, TuyaCipher};
use crate::error::{Result, TuyaError};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use crc::{CRC_32_ISO_HDLC, Crc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::io::Cursor;

pub const PREFIX_55AA: u32 = 0x000055AA;
pub const PREFIX_6699: u32 = 0x00006699;
pub const SUFFIX_55AA: u32 = 0x0000AA55;
pub const SUFFIX_6699: u32 = 0x00009966;

/// Header sizes: 55AA is prefix/seq/cmd/len, 6699 adds two reserved bytes.
pub const HEADER_LEN_55AA: usize = 16;
pub const HEADER_LEN_6699: usize = 18;

const SUFFIX_LEN: usize = 4;
const CRC_LEN: usize = 4;
const HMAC_LEN: usize = 32;
const RETCODE_LEN: usize = 4;

/// Upper bound on a declared frame body; switches never send more than a few hundred bytes.
pub const MAX_PAYLOAD_LEN: u32 = 0x10000;

/// `"3.x"` followed by twelve zero bytes, in front of most v3.2+ payloads.
pub const VERSION_HEADER_LEN: usize = 15;

type HmacSha256 = Hmac<Sha256>;

define_command_type! {
    SessKeyNegStart = 0x03,
    SessKeyNegResp = 0x04,
    SessKeyNegFinish = 0x05,
    Control = 0x07,
    Status = 0x08,
    HeartBeat = 0x09,
    DpQuery = 0x0a,
    ControlNew = 0x0d,
    DpQueryNew = 0x10,
}

define_version! {
    V3_1 = ("3.1", 3.1),
    V3_2 = ("3.2", 3.2),
    V3_3 = ("3.3", 3.3),
    V3_4 = ("3.4", 3.4),
    V3_5 = ("3.5", 3.5),
}

impl Version {
    /// v3.4 and later negotiate a per-connection session key.
    pub fn negotiates_session(&self) -> bool {
        self.val() >= 3.4
    }

    /// Frame prefix used by this version.
    pub fn prefix(&self) -> u32 {
        if *self == Version::V3_5 {
            PREFIX_6699
        } else {
            PREFIX_55AA
        }
    }

    /// The 15-byte header (`"3.x"` + 12 zero bytes).
    pub fn header(&self) -> [u8; VERSION_HEADER_LEN] {
        let mut header = [0u8; VERSION_HEADER_LEN];
        header[..3].copy_from_slice(self.as_bytes());
        header
    }

    /// Removes the version header from `payload` when present.
    pub fn strip_header<'a>(&self, payload: &'a [u8]) -> &'a [u8] {
        if payload.len() >= VERSION_HEADER_LEN && payload.starts_with(self.as_bytes()) {
            &payload[VERSION_HEADER_LEN..]
        } else {
            payload
        }
    }
}

/// Commands whose payload never carries the version header.
pub const NO_PROTOCOL_HEADER_CMDS: &[u32] = &[
    CommandType::DpQuery as u32,
    CommandType::DpQueryNew as u32,
    CommandType::HeartBeat as u32,
    CommandType::SessKeyNegStart as u32,
    CommandType::SessKeyNegResp as u32,
    CommandType::SessKeyNegFinish as u32,
];

/// Tuya protocol message structure
#[derive(Debug, Clone, PartialEq)]
pub struct TuyaMessage {
    /// Sequence number
    pub seqno: u32,
    /// Command code
    pub cmd: u32,
    /// Return code, present on frames sent by the device
    pub retcode: Option<u32>,
    /// Frame payload (plaintext for 6699 after unpacking)
    pub payload: Vec<u8>,
    /// Protocol prefix (0x55AA or 0x6699)
    pub prefix: u32,
    /// GCM IV for 6699 frames; random when `None` on pack
    pub iv: Option<[u8; GCM_IV_LEN]>,
}

impl Default for TuyaMessage {
    fn default() -> Self {
        Self {
            seqno: 0,
            cmd: 0,
            retcode: None,
            payload: Vec::new(),
            prefix: PREFIX_55AA,
            iv: None,
        }
    }
}

/// Tuya protocol header structure
#[derive(Debug, Clone, PartialEq)]
pub struct TuyaHeader {
    pub prefix: u32,
    pub seqno: u32,
    pub cmd: u32,
    /// Length field as sent (everything after the header)
    pub payload_len: u32,
    /// Header + body + suffix
    pub total_length: u32,
}

impl TuyaHeader {
    pub fn header_len(&self) -> usize {
        header_len(self.prefix)
    }
}

/// Header length for a frame prefix; 0x6699 frames carry two extra bytes.
pub fn header_len(prefix: u32) -> usize {
    if prefix == PREFIX_6699 {
        HEADER_LEN_6699
    } else {
        HEADER_LEN_55AA
    }
}

fn checksum(data: &[u8], hmac_key: Option<&[u8]>) -> Result<Vec<u8>> {
    match hmac_key {
        Some(key) => {
            let mut mac =
                HmacSha256::new_from_slice(key).map_err(|_| TuyaError::EncryptionFailed)?;
            mac.update(data);
            Ok(mac.finalize().into_bytes().to_vec())
        }
        None => Ok(Crc::<u32>::new(&CRC_32_ISO_HDLC)
            .checksum(data)
            .to_be_bytes()
            .to_vec()),
    }
}

/// Pack a message into a frame.
///
/// For 55AA frames `key` selects HMAC-SHA256 (v3.4) over CRC32.
/// For 6699 frames `key` is the AES-GCM key and is required.
pub fn pack_message(msg: &TuyaMessage, key: Option<&[u8]>) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(RETCODE_LEN + msg.payload.len());
    if let Some(rc) = msg.retcode {
        body.write_u32::<BigEndian>(rc)?;
    }
    body.extend_from_slice(&msg.payload);

    let mut data = Vec::new();
    match msg.prefix {
        PREFIX_55AA => {
            let trailer = (if key.is_some() { HMAC_LEN } else { CRC_LEN }) + SUFFIX_LEN;
            data.write_u32::<BigEndian>(PREFIX_55AA)?;
            data.write_u32::<BigEndian>(msg.seqno)?;
            data.write_u32::<BigEndian>(msg.cmd)?;
            data.write_u32::<BigEndian>((body.len() + trailer) as u32)?;
            data.extend_from_slice(&body);
            let sum = checksum(&data, key)?;
            data.extend_from_slice(&sum);
            data.write_u32::<BigEndian>(SUFFIX_55AA)?;
        }
        PREFIX_6699 => {
            let key = key.ok_or(TuyaError::EncryptionFailed)?;
            data.write_u32::<BigEndian>(PREFIX_6699)?;
            data.write_u16::<BigEndian>(0)?;
            data.write_u32::<BigEndian>(msg.seqno)?;
            data.write_u32::<BigEndian>(msg.cmd)?;
            data.write_u32::<BigEndian>((GCM_IV_LEN + body.len() + GCM_TAG_LEN) as u32)?;

            let iv = msg.iv.unwrap_or_else(|| {
                let mut iv = [0u8; GCM_IV_LEN];
                rand::rng().fill_bytes(&mut iv);
                iv
            });
            let sealed = TuyaCipher::new(key)?.encrypt_gcm(&body, &iv, &data[4..])?;
            data.extend_from_slice(&sealed);
            data.write_u32::<BigEndian>(SUFFIX_6699)?;
        }
        _ => return Err(TuyaError::InvalidHeader),
    }
    Ok(data)
}

/// Parse the frame header at the start of `data`.
pub fn parse_header(data: &[u8]) -> Result<TuyaHeader> {
    if data.len() < HEADER_LEN_55AA {
        return Err(TuyaError::DecodeError("Header too short".into()));
    }

    let mut cursor = Cursor::new(data);
    let prefix = cursor.read_u32::<BigEndian>()?;
    match prefix {
        PREFIX_55AA => {}
        PREFIX_6699 => {
            if data.len() < HEADER_LEN_6699 {
                return Err(TuyaError::DecodeError("6699 header too short".into()));
            }
            let _reserved = cursor.read_u16::<BigEndian>()?;
        }
        _ => return Err(TuyaError::InvalidHeader),
    }

    let seqno = cursor.read_u32::<BigEndian>()?;
    let cmd = cursor.read_u32::<BigEndian>()?;
    let payload_len = cursor.read_u32::<BigEndian>()?;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(TuyaError::InvalidHeader);
    }

    // 55AA counts checksum and suffix in the length field, 6699 leaves the suffix out.
    let total_length = match prefix {
        PREFIX_6699 => payload_len + (HEADER_LEN_6699 + SUFFIX_LEN) as u32,
        _ => payload_len + HEADER_LEN_55AA as u32,
    };

    Ok(TuyaHeader {
        prefix,
        seqno,
        cmd,
        payload_len,
        total_length,
    })
}

/// Unpack a complete frame.
///
/// `key` has the same meaning as in [`pack_message`]. `with_retcode` is true for
/// frames sent by a device, which put a 4-byte return code before the payload.
pub fn unpack_message(data: &[u8], key: Option<&[u8]>, with_retcode: bool) -> Result<TuyaMessage> {
    let header = parse_header(data)?;
    let total = header.total_length as usize;
    if data.len() < total {
        return Err(TuyaError::DecodeError("Data shorter than expected".into()));
    }
    let header_len = header.header_len();

    let (body, iv) = match header.prefix {
        PREFIX_55AA => {
            let trailer = (if key.is_some() { HMAC_LEN } else { CRC_LEN }) + SUFFIX_LEN;
            if total < header_len + trailer {
                return Err(TuyaError::DecodeError("Frame shorter than its trailer".into()));
            }
            let body_end = total - trailer;
            let expected = checksum(&data[..body_end], key)?;
            if data[body_end..body_end + expected.len()] != expected[..] {
                return Err(if key.is_some() {
                    TuyaError::HmacMismatch
                } else {
                    TuyaError::CrcMismatch
                });
            }
            if BigEndian::read_u32(&data[total - SUFFIX_LEN..total]) != SUFFIX_55AA {
                return Err(TuyaError::InvalidHeader);
            }
            (data[header_len..body_end].to_vec(), None)
        }
        _ => {
            let key = key.ok_or(TuyaError::DecryptionFailed)?;
            let sealed = &data[header_len..total - SUFFIX_LEN];
            if sealed.len() < GCM_IV_LEN + GCM_TAG_LEN {
                return Err(TuyaError::InvalidPayload("6699 frame too short".into()));
            }
            let (iv, ciphertext) = sealed.split_at(GCM_IV_LEN);
            let plain = TuyaCipher::new(key)?.decrypt_gcm(ciphertext, iv, &data[4..header_len])?;
            let mut iv_buf = [0u8; GCM_IV_LEN];
            iv_buf.copy_from_slice(iv);
            (plain, Some(iv_buf))
        }
    };

    let (retcode, payload) = if with_retcode && body.len() >= RETCODE_LEN {
        (
            Some(BigEndian::read_u32(&body[..RETCODE_LEN])),
            body[RETCODE_LEN..].to_vec(),
        )
    } else {
        (None, body)
    };

    Ok(TuyaMessage {
        seqno: header.seqno,
        cmd: header.cmd,
        retcode,
        payload,
        prefix: header.prefix,
        iv,
    })
}
