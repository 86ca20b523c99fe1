//! OCB2-AES128 encryption for the UDP voice channel.
//!
//! Mumble's UDP datagrams are protected by the OCB2 mode over AES-128 with a
//! truncated 3-byte tag and a rolling per-direction IV. OCB2 has published
//! weaknesses, but the construction is fixed by the wire protocol; this
//! module reproduces it bit for bit so the client can interoperate with
//! stock servers. Do not reuse it for anything else.

use std::time::{Duration, Instant};

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use thiserror::Error;

pub const BLOCK_SIZE: usize = 16;

/// 1 byte of IV echo plus 3 bytes of tag in front of every datagram.
pub const HEADER_SIZE: usize = 4;

/// How far behind the current decrypt IV a packet may arrive and still be
/// accepted as "late".
const LATE_WINDOW: i32 = 30;

/// Silence interval after which a decrypt failure asks the server for an IV
/// resync, and the minimum spacing between such requests.
const RESYNC_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error, Eq, PartialEq)]
pub enum CryptError {
    #[error("datagram too short")]
    TooShort,
    #[error("duplicate or repeated IV")]
    Duplicate,
    #[error("IV outside the accepted window")]
    OutOfWindow,
    #[error("replayed packet")]
    Replay,
    #[error("authentication tag mismatch")]
    TagMismatch,
}

/// Per-connection cipher state. The encrypt half is advanced on every send,
/// the decrypt half follows the server's IV with a tolerance window for
/// reordered and lost datagrams.
pub struct CryptState {
    cipher: Aes128,
    encrypt_iv: [u8; BLOCK_SIZE],
    decrypt_iv: [u8; BLOCK_SIZE],
    decrypt_history: [u8; 0x100],
    pub good: u32,
    pub late: u32,
    pub lost: u32,
    pub resync: u32,
    last_good: Instant,
    last_request: Instant,
    request: bool,
}

impl CryptState {
    pub fn new(
        key: &[u8; BLOCK_SIZE],
        encrypt_iv: &[u8; BLOCK_SIZE],
        decrypt_iv: &[u8; BLOCK_SIZE],
    ) -> Self {
        let now = Instant::now();

        CryptState {
            cipher: Aes128::new(GenericArray::from_slice(key)),
            encrypt_iv: *encrypt_iv,
            decrypt_iv: *decrypt_iv,
            decrypt_history: [0; 0x100],
            good: 0,
            late: 0,
            lost: 0,
            resync: 0,
            last_good: now,
            last_request: now,
            request: false,
        }
    }

    pub fn encrypt_iv(&self) -> &[u8; BLOCK_SIZE] {
        &self.encrypt_iv
    }

    /// Rebases the receive IV from a CryptSetup resync answer.
    pub fn set_decrypt_iv(&mut self, iv: &[u8; BLOCK_SIZE]) {
        self.decrypt_iv = *iv;
        self.resync += 1;
    }

    /// True once, when persistent decrypt failures warrant asking the server
    /// for a resync.
    pub fn take_resync_request(&mut self) -> bool {
        std::mem::take(&mut self.request)
    }

    /// Encrypts `plain` into a datagram: 4-byte header (IV echo + truncated
    /// tag) followed by the ciphertext.
    pub fn encrypt(&mut self, plain: &[u8]) -> Vec<u8> {
        for b in self.encrypt_iv.iter_mut() {
            *b = b.wrapping_add(1);
            if *b != 0 {
                break;
            }
        }

        let (cipher_text, tag) = ocb_encrypt(&self.cipher, plain, &self.encrypt_iv);

        let mut dst = Vec::with_capacity(HEADER_SIZE + plain.len());
        dst.push(self.encrypt_iv[0]);
        dst.extend_from_slice(&tag[..3]);
        dst.extend_from_slice(&cipher_text);
        dst
    }

    /// Decrypts a received datagram, updating the IV according to how the
    /// echoed IV byte relates to the expected one. The IV is restored on any
    /// failure and after accepting a late packet.
    pub fn decrypt(&mut self, src: &[u8]) -> Result<Vec<u8>, CryptError> {
        if src.len() <= HEADER_SIZE {
            return Err(CryptError::TooShort);
        }

        let save_iv = self.decrypt_iv;
        let iv = src[0];
        let mut restore = false;
        let mut late = 0u32;
        let mut lost = 0u32;

        if self.decrypt_iv[0].wrapping_add(1) == iv {
            // expected next packet
            if iv > self.decrypt_iv[0] {
                self.decrypt_iv[0] = iv;
            } else if iv < self.decrypt_iv[0] {
                // byte 0 wrapped, carry into the rest
                self.decrypt_iv[0] = iv;
                carry_add(&mut self.decrypt_iv[1..]);
            } else {
                return Err(self.fail(CryptError::Duplicate));
            }
        } else {
            let mut diff = iv as i32 - self.decrypt_iv[0] as i32;
            if diff > 128 {
                diff -= 256;
            } else if diff < -128 {
                diff += 256;
            }

            if iv < self.decrypt_iv[0] && diff > -LATE_WINDOW && diff < 0 {
                // late packet from the current IV epoch
                late = 1;
                self.decrypt_iv[0] = iv;
                restore = true;
            } else if iv > self.decrypt_iv[0] && diff > -LATE_WINDOW && diff < 0 {
                // late packet from before the last byte-0 wrap
                late = 1;
                self.decrypt_iv[0] = iv;
                borrow_sub(&mut self.decrypt_iv[1..]);
                restore = true;
            } else if iv > self.decrypt_iv[0] && diff > 0 {
                // packets were dropped in between
                lost = (iv - self.decrypt_iv[0] - 1) as u32;
                self.decrypt_iv[0] = iv;
            } else if iv < self.decrypt_iv[0] && diff > 0 {
                // dropped packets across a byte-0 wrap
                lost = (0x100 - self.decrypt_iv[0] as u32) + iv as u32 - 1;
                self.decrypt_iv[0] = iv;
                carry_add(&mut self.decrypt_iv[1..]);
            } else {
                return Err(self.fail(CryptError::OutOfWindow));
            }

            if self.decrypt_history[self.decrypt_iv[0] as usize] == self.decrypt_iv[1] {
                self.decrypt_iv = save_iv;
                return Err(self.fail(CryptError::Replay));
            }
        }

        let (plain, tag) =
            ocb_decrypt(&self.cipher, &src[HEADER_SIZE..], &self.decrypt_iv);

        if tag[..3] != src[1..4] {
            self.decrypt_iv = save_iv;
            return Err(self.fail(CryptError::TagMismatch));
        }

        self.decrypt_history[self.decrypt_iv[0] as usize] = self.decrypt_iv[1];

        if restore {
            self.decrypt_iv = save_iv;
        }

        self.good += 1;
        self.late += late;
        self.lost += lost;
        self.last_good = Instant::now();

        Ok(plain)
    }

    fn fail(&mut self, e: CryptError) -> CryptError {
        if self.last_good.elapsed() > RESYNC_INTERVAL
            && self.last_request.elapsed() > RESYNC_INTERVAL
        {
            self.last_request = Instant::now();
            self.request = true;
        }

        e
    }
}

fn carry_add(bytes: &mut [u8]) {
    for b in bytes.iter_mut() {
        *b = b.wrapping_add(1);
        if *b != 0 {
            break;
        }
    }
}

fn borrow_sub(bytes: &mut [u8]) {
    for b in bytes.iter_mut() {
        let old = *b;
        *b = old.wrapping_sub(1);
        if old != 0 {
            break;
        }
    }
}

// The OCB2 core below works on whole 128-bit limbs so the delta/checksum
// arithmetic is identical on every architecture; byte order is flipped only
// at the block boundary.

fn aes_enc(cipher: &Aes128, x: u128) -> u128 {
    let mut block = GenericArray::clone_from_slice(&x.to_be_bytes());
    cipher.encrypt_block(&mut block);
    let mut out = [0; BLOCK_SIZE];
    out.copy_from_slice(&block);
    u128::from_be_bytes(out)
}

fn aes_dec(cipher: &Aes128, x: u128) -> u128 {
    let mut block = GenericArray::clone_from_slice(&x.to_be_bytes());
    cipher.decrypt_block(&mut block);
    let mut out = [0; BLOCK_SIZE];
    out.copy_from_slice(&block);
    u128::from_be_bytes(out)
}

/// Doubling in GF(2^128) with the 0x87 feedback polynomial.
fn s2(block: u128) -> u128 {
    let carry = block >> 127;
    (block << 1) ^ (carry * 0x87)
}

/// Tripling, used for the final tag delta.
fn s3(block: u128) -> u128 {
    block ^ s2(block)
}

fn ocb_encrypt(cipher: &Aes128, plain: &[u8], nonce: &[u8; BLOCK_SIZE]) -> (Vec<u8>, [u8; BLOCK_SIZE]) {
    let mut delta = aes_enc(cipher, u128::from_be_bytes(*nonce));
    let mut checksum = 0u128;
    let mut out = Vec::with_capacity(plain.len());

    let mut rest = plain;
    while rest.len() > BLOCK_SIZE {
        delta = s2(delta);
        let pt = u128::from_be_bytes(rest[..BLOCK_SIZE].try_into().expect("block"));
        let tmp = aes_enc(cipher, delta ^ pt);
        out.extend_from_slice(&(delta ^ tmp).to_be_bytes());
        checksum ^= pt;
        rest = &rest[BLOCK_SIZE..];
    }

    // final block: length-padded and encrypted as a pad
    delta = s2(delta);
    let pad = aes_enc(cipher, (rest.len() as u128 * 8) ^ delta);

    let mut tail = pad.to_be_bytes();
    tail[..rest.len()].copy_from_slice(rest);
    let tmp = u128::from_be_bytes(tail);
    checksum ^= tmp;
    out.extend_from_slice(&(pad ^ tmp).to_be_bytes()[..rest.len()]);

    delta = s3(delta);
    let tag = aes_enc(cipher, delta ^ checksum);

    (out, tag.to_be_bytes())
}

fn ocb_decrypt(cipher: &Aes128, encrypted: &[u8], nonce: &[u8; BLOCK_SIZE]) -> (Vec<u8>, [u8; BLOCK_SIZE]) {
    let mut delta = aes_enc(cipher, u128::from_be_bytes(*nonce));
    let mut checksum = 0u128;
    let mut out = Vec::with_capacity(encrypted.len());

    let mut rest = encrypted;
    while rest.len() > BLOCK_SIZE {
        delta = s2(delta);
        let ct = u128::from_be_bytes(rest[..BLOCK_SIZE].try_into().expect("block"));
        let tmp = aes_dec(cipher, delta ^ ct);
        let pt = delta ^ tmp;
        out.extend_from_slice(&pt.to_be_bytes());
        checksum ^= pt;
        rest = &rest[BLOCK_SIZE..];
    }

    delta = s2(delta);
    let pad = aes_enc(cipher, (rest.len() as u128 * 8) ^ delta);

    let mut tail = [0; BLOCK_SIZE];
    tail[..rest.len()].copy_from_slice(rest);
    let tmp = u128::from_be_bytes(tail) ^ pad;
    checksum ^= tmp;
    out.extend_from_slice(&tmp.to_be_bytes()[..rest.len()]);

    delta = s3(delta);
    let tag = aes_enc(cipher, delta ^ checksum);

    (out, tag.to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = *b"0123456789abcdef";

    fn state_pair() -> (CryptState, CryptState) {
        // nonces mirrored between the two ends, byte 1 nonzero so the
        // replay history distinguishes fresh packets from the zero fill
        let client_nonce = [0x55; 16];
        let server_nonce = [0xAA; 16];
        (
            CryptState::new(&KEY, &client_nonce, &server_nonce),
            CryptState::new(&KEY, &server_nonce, &client_nonce),
        )
    }

    #[test]
    fn roundtrip_all_tail_lengths() {
        let (mut tx, mut rx) = state_pair();

        for len in 1..=64 {
            let plain: Vec<u8> = (0..len as u8).collect();
            let datagram = tx.encrypt(&plain);
            assert_eq!(datagram.len(), plain.len() + HEADER_SIZE);
            let out = rx.decrypt(&datagram).unwrap();
            assert_eq!(out, plain);
        }

        assert_eq!(rx.good, 64);
        assert_eq!(rx.late, 0);
        assert_eq!(rx.lost, 0);
    }

    #[test]
    fn tamper_fails_and_restores() {
        let (mut tx, mut rx) = state_pair();

        let plain = b"a few blocks worth of audio data..".to_vec();
        let mut datagram = tx.encrypt(&plain);

        for i in 0..datagram.len() {
            let mut bad = datagram.clone();
            bad[i] ^= 0x01;
            assert!(rx.decrypt(&bad).is_err(), "byte {} accepted", i);
        }

        // state was restored every time, the original still decrypts
        assert_eq!(rx.decrypt(&datagram).unwrap(), plain);

        // and a bit flip in the *next* packet does not poison the one after
        datagram = tx.encrypt(&plain);
        datagram[5] ^= 0xFF;
        assert!(rx.decrypt(&datagram).is_err());
        let datagram = tx.encrypt(&plain);
        assert_eq!(rx.decrypt(&datagram).unwrap(), plain);
    }

    #[test]
    fn reorder_and_replay_window() {
        let (mut tx, mut rx) = state_pair();

        // pre-encrypt packets 1..=5 (IV byte echoes 1,2,3,4,5)
        let packets: Vec<Vec<u8>> = (0u8..5).map(|i| tx.encrypt(&[i])).collect();

        assert!(rx.decrypt(&packets[0]).is_ok()); // 1
        assert!(rx.decrypt(&packets[1]).is_ok()); // 2
        assert!(rx.decrypt(&packets[2]).is_ok()); // 3
        assert!(rx.decrypt(&packets[4]).is_ok()); // 5, skipping 4
        assert_eq!(rx.lost, 1);
        assert_eq!(rx.late, 0);

        // 4 arrives late: accepted, lost stays as counted
        assert!(rx.decrypt(&packets[3]).is_ok());
        assert_eq!(rx.late, 1);
        assert_eq!(rx.lost, 1);

        // 4 again: replay
        assert_eq!(rx.decrypt(&packets[3]), Err(CryptError::Replay));

        // 2 again: too old, already seen
        assert_eq!(rx.decrypt(&packets[1]), Err(CryptError::Replay));

        assert_eq!(rx.good, 5);
    }

    #[test]
    fn duplicate_of_current_iv_rejected() {
        let (mut tx, mut rx) = state_pair();

        let datagram = tx.encrypt(&[1, 2, 3]);
        assert!(rx.decrypt(&datagram).is_ok());
        assert_eq!(rx.decrypt(&datagram), Err(CryptError::OutOfWindow));
    }

    #[test]
    fn iv_wraps_across_byte_boundary() {
        let (mut tx, mut rx) = state_pair();

        for i in 0..300u32 {
            let plain = i.to_be_bytes();
            let datagram = tx.encrypt(&plain);
            assert_eq!(rx.decrypt(&datagram).unwrap(), plain, "packet {}", i);
        }

        assert_eq!(rx.good, 300);
    }

    #[test]
    fn short_datagram_rejected() {
        let (_, mut rx) = state_pair();
        assert_eq!(rx.decrypt(&[0; 4]), Err(CryptError::TooShort));
    }

    #[test]
    fn resync_requested_after_silence() {
        let (mut tx, mut rx) = state_pair();

        let mut datagram = tx.encrypt(&[0; 8]);
        datagram[2] ^= 0xFF;

        // recent last_good suppresses the request
        assert!(rx.decrypt(&datagram).is_err());
        assert!(!rx.take_resync_request());

        // pretend five seconds of silence
        rx.last_good = Instant::now() - Duration::from_secs(6);
        rx.last_request = Instant::now() - Duration::from_secs(6);
        assert!(rx.decrypt(&datagram).is_err());
        assert!(rx.take_resync_request());
        assert!(!rx.take_resync_request());

        // a second failure right after does not re-arm it
        assert!(rx.decrypt(&datagram).is_err());
        assert!(!rx.take_resync_request());
    }
}
