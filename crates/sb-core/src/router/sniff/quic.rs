//! QUIC Initial packet sniffing (RFC 9000 / RFC 9001 / RFC 9369).
//!
//! Initial packets are protected with keys every observer can derive from
//! the destination connection ID. The detector removes header protection,
//! opens the AEAD payload, collects CRYPTO frames, reassembles them by
//! offset into one TLS handshake record and hands that to the ClientHello
//! parser.
//!
//! Once a payload decrypted and CRYPTO data was seen, parse problems still
//! report protocol `quic` (without a domain) rather than failing.
use super::{read_varint, tls, SniffedMetadata};
use crate::error::SniffError;
use hkdf::Hkdf;
use sb_types::protocol;
use sha2::Sha256;

const VERSION_DRAFT29: u32 = 0xff00_001d;
const VERSION_1: u32 = 0x0000_0001;
const VERSION_2: u32 = 0x6b33_43cf;

const SALT_DRAFT29: [u8; 20] = [
    0xaf, 0xbf, 0xec, 0x28, 0x99, 0x93, 0xd2, 0x4c, 0x9e, 0x97, 0x86, 0xf1, 0x9c, 0x61, 0x11, 0xe0,
    0x43, 0x90, 0xa8, 0x99,
];
const SALT_V1: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c, 0xad,
    0xcc, 0xbb, 0x7f, 0x0a,
];
const SALT_V2: [u8; 20] = [
    0x0d, 0xed, 0xe3, 0xde, 0xf7, 0x00, 0xa6, 0xdb, 0x81, 0x93, 0x81, 0xbe, 0x6e, 0x26, 0x9d, 0xcb,
    0xf9, 0xbd, 0x2e, 0xd9,
];

const MAX_CID_LEN: usize = 20;
const SAMPLE_LEN: usize = 16;

const FRAME_PADDING: u8 = 0x00;
const FRAME_PING: u8 = 0x01;
const FRAME_ACK: u8 = 0x02;
const FRAME_ACK_ECN: u8 = 0x03;
const FRAME_CRYPTO: u8 = 0x06;
const FRAME_CONNECTION_CLOSE: u8 = 0x1c;

struct InitialKeys {
    key: [u8; 16],
    iv: [u8; 12],
    hp: [u8; 16],
}

/// Packet detector for QUIC Initial packets.
pub fn sniff_quic(packet: &[u8]) -> Result<SniffedMetadata, SniffError> {
    let first = *packet.first().ok_or(SniffError::InvalidInput)?;
    if first & 0x40 == 0 {
        return Err(SniffError::InvalidInput);
    }
    let version = match packet.get(1..5) {
        Some(&[a, b, c, d]) => u32::from_be_bytes([a, b, c, d]),
        _ => return Err(SniffError::InvalidInput),
    };
    if !matches!(version, VERSION_DRAFT29 | VERSION_1 | VERSION_2) {
        return Err(SniffError::InvalidInput);
    }
    // v2 renumbers long-header types: Initial is 1 there, 0 elsewhere.
    let packet_type = (first & 0x30) >> 4;
    if (packet_type == 0 && version == VERSION_2)
        || (packet_type == 2 && version != VERSION_2)
        || packet_type > 2
    {
        return Err(SniffError::InvalidInput);
    }

    let mut p = 5;
    let dcid_len = *packet.get(p).ok_or(SniffError::InvalidInput)? as usize;
    p += 1;
    if dcid_len == 0 || dcid_len > MAX_CID_LEN {
        return Err(SniffError::InvalidInput);
    }
    let dcid = packet.get(p..p + dcid_len).ok_or(SniffError::InvalidInput)?;
    p += dcid_len;
    let scid_len = *packet.get(p).ok_or(SniffError::InvalidInput)? as usize;
    p += 1 + scid_len;
    let (token_len, n) = varint_at(packet, p)?;
    p = p
        .checked_add(n)
        .and_then(|p| p.checked_add(usize::try_from(token_len).ok()?))
        .ok_or(SniffError::InvalidInput)?;
    let (payload_len, n) = varint_at(packet, p)?;
    let hdr_len = p + n;
    let end = usize::try_from(payload_len)
        .ok()
        .and_then(|l| hdr_len.checked_add(l))
        .filter(|end| *end <= packet.len())
        .ok_or(SniffError::InvalidInput)?;
    let sample = packet
        .get(hdr_len + 4..hdr_len + 4 + SAMPLE_LEN)
        .ok_or(SniffError::InvalidInput)?;

    let keys = derive_initial_keys(dcid, version)?;
    let mask = header_protection_mask(&keys.hp, sample)?;

    let mut unprotected = packet[..end].to_vec();
    unprotected[0] ^= mask[0] & 0x0f;
    let pn_len = (unprotected[0] & 0x03) as usize + 1;
    if hdr_len + pn_len > end {
        return Err(SniffError::InvalidInput);
    }
    let mut packet_number = 0u64;
    for i in 0..pn_len {
        unprotected[hdr_len + i] ^= mask[1 + i];
        packet_number = (packet_number << 8) | u64::from(unprotected[hdr_len + i]);
    }
    let (aad, ciphertext) = unprotected.split_at(hdr_len + pn_len);
    let plaintext = open_payload(&keys, packet_number, aad, ciphertext)?;

    let fragments = collect_crypto_frames(&plaintext)?;
    Ok(client_hello_metadata(&fragments))
}

fn varint_at(packet: &[u8], at: usize) -> Result<(u64, usize), SniffError> {
    packet
        .get(at..)
        .and_then(read_varint)
        .ok_or(SniffError::InvalidInput)
}

fn derive_initial_keys(dcid: &[u8], version: u32) -> Result<InitialKeys, SniffError> {
    let (salt, prefix): (&[u8], &str) = match version {
        VERSION_1 => (&SALT_V1, "quic"),
        VERSION_2 => (&SALT_V2, "quicv2"),
        _ => (&SALT_DRAFT29, "quic"),
    };
    let initial = Hkdf::<Sha256>::new(Some(salt), dcid);
    let mut client_secret = [0u8; 32];
    expand_label(&initial, "client in", &mut client_secret)?;

    let client = Hkdf::<Sha256>::from_prk(&client_secret).map_err(|_| SniffError::InvalidInput)?;
    let mut keys = InitialKeys {
        key: [0u8; 16],
        iv: [0u8; 12],
        hp: [0u8; 16],
    };
    expand_label(&client, &format!("{prefix} key"), &mut keys.key)?;
    expand_label(&client, &format!("{prefix} iv"), &mut keys.iv)?;
    expand_label(&client, &format!("{prefix} hp"), &mut keys.hp)?;
    Ok(keys)
}

// HkdfLabel { length: u16, label: "tls13 " + label, context: "" }
fn expand_label(prk: &Hkdf<Sha256>, label: &str, out: &mut [u8]) -> Result<(), SniffError> {
    let full = format!("tls13 {label}");
    let mut info = Vec::with_capacity(4 + full.len());
    info.extend_from_slice(&(out.len() as u16).to_be_bytes());
    info.push(full.len() as u8);
    info.extend_from_slice(full.as_bytes());
    info.push(0);
    prk.expand(&info, out).map_err(|_| SniffError::InvalidInput)
}

fn header_protection_mask(hp: &[u8; 16], sample: &[u8]) -> Result<[u8; 16], SniffError> {
    use aes::cipher::{BlockEncrypt, KeyInit};

    let cipher = aes::Aes128::new_from_slice(hp).map_err(|_| SniffError::InvalidInput)?;
    let mut block = aes::Block::clone_from_slice(sample);
    cipher.encrypt_block(&mut block);
    let mut mask = [0u8; 16];
    mask.copy_from_slice(&block);
    Ok(mask)
}

fn open_payload(
    keys: &InitialKeys,
    packet_number: u64,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, SniffError> {
    use aes_gcm::aead::{Aead, KeyInit, Payload};
    use aes_gcm::{Aes128Gcm, Nonce};

    let mut nonce = keys.iv;
    for (n, b) in nonce[4..].iter_mut().zip(packet_number.to_be_bytes()) {
        *n ^= b;
    }
    let cipher = Aes128Gcm::new_from_slice(&keys.key).map_err(|_| SniffError::InvalidInput)?;
    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| SniffError::InvalidInput)
}

/// CRYPTO frame contents with their stream offsets. `broken` marks a CRYPTO
/// frame whose header or data was cut short.
struct CryptoFragments<'a> {
    fragments: Vec<(u64, &'a [u8])>,
    broken: bool,
}

fn take_varint(payload: &[u8], p: &mut usize) -> Result<u64, SniffError> {
    let (v, n) = varint_at(payload, *p)?;
    *p += n;
    Ok(v)
}

fn collect_crypto_frames(payload: &[u8]) -> Result<CryptoFragments<'_>, SniffError> {
    let mut out = CryptoFragments {
        fragments: Vec::new(),
        broken: false,
    };
    let mut p = 0usize;
    while p < payload.len() {
        let frame_type = payload[p];
        p += 1;
        match frame_type {
            FRAME_PADDING | FRAME_PING => {}
            FRAME_ACK | FRAME_ACK_ECN => {
                take_varint(payload, &mut p)?; // largest acknowledged
                take_varint(payload, &mut p)?; // ack delay
                let ranges = take_varint(payload, &mut p)?;
                take_varint(payload, &mut p)?; // first range
                for _ in 0..ranges {
                    take_varint(payload, &mut p)?; // gap
                    take_varint(payload, &mut p)?; // range length
                }
                if frame_type == FRAME_ACK_ECN {
                    for _ in 0..3 {
                        take_varint(payload, &mut p)?;
                    }
                }
            }
            FRAME_CRYPTO => {
                let (Ok(offset), Ok(length)) =
                    (take_varint(payload, &mut p), take_varint(payload, &mut p))
                else {
                    out.broken = true;
                    return Ok(out);
                };
                let data = usize::try_from(length)
                    .ok()
                    .and_then(|l| payload.get(p..p.checked_add(l)?));
                let Some(data) = data else {
                    out.broken = true;
                    return Ok(out);
                };
                p += data.len();
                out.fragments.push((offset, data));
            }
            FRAME_CONNECTION_CLOSE => {
                take_varint(payload, &mut p)?; // error code
                take_varint(payload, &mut p)?; // frame type
                let reason = take_varint(payload, &mut p)?;
                p = usize::try_from(reason)
                    .ok()
                    .and_then(|r| p.checked_add(r))
                    .filter(|p| *p <= payload.len())
                    .ok_or(SniffError::InvalidInput)?;
            }
            _ => return Err(SniffError::InvalidInput),
        }
    }
    Ok(out)
}

fn client_hello_metadata(crypto: &CryptoFragments<'_>) -> SniffedMetadata {
    let partial = SniffedMetadata::new(protocol::QUIC);
    if crypto.broken {
        tracing::trace!(target: "sb_core::sniff", "malformed quic crypto frame");
        return partial;
    }
    let total: usize = crypto.fragments.iter().map(|(_, d)| d.len()).sum();
    let mut record = Vec::with_capacity(5 + total);
    record.push(0x16);
    record.extend_from_slice(&[0x03, 0x03]);
    record.extend_from_slice(&(total as u16).to_be_bytes());

    let mut index = 0u64;
    for _ in 0..crypto.fragments.len() {
        let Some((offset, data)) = crypto.fragments.iter().find(|(o, _)| *o == index) else {
            tracing::trace!(target: "sb_core::sniff", "quic crypto fragments have gaps");
            return partial;
        };
        record.extend_from_slice(data);
        index = offset + data.len() as u64;
    }

    match tls::sniff_tls_client_hello(&record) {
        Ok(info) => SniffedMetadata::with_domain(protocol::QUIC, info.sni.unwrap_or_default()),
        Err(e) => {
            tracing::trace!(target: "sb_core::sniff", error = %e, "quic client hello");
            partial
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::sniff::tls::tests::client_hello_handshake;

    fn varint(v: u64) -> Vec<u8> {
        match v {
            0..=63 => vec![v as u8],
            64..=16383 => ((v as u16) | 0x4000).to_be_bytes().to_vec(),
            _ => ((v as u32) | 0x8000_0000).to_be_bytes().to_vec(),
        }
    }

    fn crypto_frame(offset: u64, data: &[u8]) -> Vec<u8> {
        let mut f = vec![FRAME_CRYPTO];
        f.extend(varint(offset));
        f.extend(varint(data.len() as u64));
        f.extend_from_slice(data);
        f
    }

    /// Protect `frames` the way a client would send them in an Initial packet.
    fn seal_initial(version: u32, dcid: &[u8], pn: u8, frames: &[u8]) -> Vec<u8> {
        use aes_gcm::aead::{Aead, KeyInit, Payload};
        use aes_gcm::{Aes128Gcm, Nonce};

        let keys = derive_initial_keys(dcid, version).unwrap();
        let initial_type = if version == VERSION_2 { 1 } else { 0 };
        let mut packet = vec![0xc0 | (initial_type << 4)]; // pn length 1
        packet.extend_from_slice(&version.to_be_bytes());
        packet.push(dcid.len() as u8);
        packet.extend_from_slice(dcid);
        packet.push(0); // scid
        packet.push(0); // token
        let length = 1 + frames.len() + 16;
        packet.extend_from_slice(&((length as u16) | 0x4000).to_be_bytes());
        let hdr_len = packet.len();
        packet.push(pn);

        let mut nonce = keys.iv;
        nonce[11] ^= pn;
        let cipher = Aes128Gcm::new_from_slice(&keys.key).unwrap();
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: frames,
                    aad: &packet,
                },
            )
            .unwrap();
        packet.extend_from_slice(&sealed);

        let mask =
            header_protection_mask(&keys.hp, &packet[hdr_len + 4..hdr_len + 4 + SAMPLE_LEN])
                .unwrap();
        packet[0] ^= mask[0] & 0x0f;
        packet[hdr_len] ^= mask[1];
        packet
    }

    const DCID: [u8; 8] = [0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08];

    #[test]
    fn rfc9001_client_keys() {
        let keys = derive_initial_keys(&DCID, VERSION_1).unwrap();
        assert_eq!(
            keys.key,
            [
                0x1f, 0x36, 0x96, 0x13, 0xdd, 0x76, 0xd5, 0x46, 0x77, 0x30, 0xef, 0xcb, 0xe3, 0xb1,
                0xa2, 0x2d
            ]
        );
        assert_eq!(
            keys.iv,
            [0xfa, 0x04, 0x4b, 0x2f, 0x42, 0xa3, 0xfd, 0x3b, 0x46, 0xfb, 0x25, 0x5c]
        );
        assert_eq!(
            keys.hp,
            [
                0x9f, 0x50, 0x44, 0x9e, 0x04, 0xa0, 0xe8, 0x10, 0x28, 0x3a, 0x1e, 0x99, 0x33, 0xad,
                0xed, 0xd2
            ]
        );
    }

    #[test]
    fn v1_initial_sni() {
        let hello = client_hello_handshake("quic.example.com", "h3");
        let mut frames = crypto_frame(0, &hello);
        frames.extend_from_slice(&[FRAME_PADDING; 32]);
        let packet = seal_initial(VERSION_1, &DCID, 0, &frames);
        let m = sniff_quic(&packet).unwrap();
        assert_eq!(m.protocol, protocol::QUIC);
        assert_eq!(m.domain, "quic.example.com");
    }

    #[test]
    fn v2_and_draft29_initials() {
        let hello = client_hello_handshake("v2.example.com", "h3");
        let frames = crypto_frame(0, &hello);
        let m = sniff_quic(&seal_initial(VERSION_2, &DCID, 3, &frames)).unwrap();
        assert_eq!(m.domain, "v2.example.com");
        let m = sniff_quic(&seal_initial(VERSION_DRAFT29, &DCID, 1, &frames)).unwrap();
        assert_eq!(m.domain, "v2.example.com");
    }

    #[test]
    fn out_of_order_crypto_fragments() {
        let hello = client_hello_handshake("split.example.com", "h3");
        let (a, b) = hello.split_at(40);
        let mut frames = vec![FRAME_PING];
        frames.extend(crypto_frame(40, b));
        frames.extend(crypto_frame(0, a));
        let m = sniff_quic(&seal_initial(VERSION_1, &DCID, 0, &frames)).unwrap();
        assert_eq!(m.domain, "split.example.com");
    }

    #[test]
    fn gap_in_fragments_reports_quic_without_domain() {
        let hello = client_hello_handshake("gap.example.com", "h3");
        let mut frames = crypto_frame(10, &hello[10..]);
        frames.extend_from_slice(&[FRAME_PADDING; 8]);
        let m = sniff_quic(&seal_initial(VERSION_1, &DCID, 0, &frames)).unwrap();
        assert_eq!(m, SniffedMetadata::new(protocol::QUIC));
    }

    #[test]
    fn tampered_payload_is_invalid() {
        let hello = client_hello_handshake("x.example.com", "h3");
        let mut packet = seal_initial(VERSION_1, &DCID, 0, &crypto_frame(0, &hello));
        let last = packet.len() - 1;
        packet[last] ^= 0x01;
        assert!(matches!(sniff_quic(&packet), Err(SniffError::InvalidInput)));
    }

    #[test]
    fn unknown_frame_is_invalid() {
        let packet = seal_initial(VERSION_1, &DCID, 0, &[0x08, 0, 0, 0]);
        assert!(sniff_quic(&packet).is_err());
    }

    #[test]
    fn header_validation() {
        // fixed bit clear
        assert!(sniff_quic(&[0x80, 0, 0, 0, 1]).is_err());
        // unknown version
        assert!(sniff_quic(&[0xc0, 0, 0, 0, 2, 8]).is_err());
        // type 2 is only an Initial on v2
        assert!(sniff_quic(&[0xe0, 0, 0, 0, 1, 8]).is_err());
        // empty dcid
        assert!(sniff_quic(&[0xc0, 0, 0, 0, 1, 0]).is_err());
    }
}
