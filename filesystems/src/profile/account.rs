// Encrypted account record found in every profile container
// 404 bytes: a 16-byte HMAC seed followed by an RC4-encrypted body. The RC4
// key is the first 16 bytes of HMAC-SHA1(console key, seed).
//
// Decrypted body layout:
//   0x00 flags (bit 5 set for Live accounts)
//   0x01 passcode, four button codes
//   0x10 gamertag, UTF-16BE, 15 characters
//   0x30 XUID, 8 bytes
//   0x39 membership tier
//   0x3C account type, "PROD" or "PART"

use hmac::{Hmac, Mac};
use log::debug;
use serde::Serialize;
use sha1::Sha1;
use x360_core::{Result, X360Error};

use crate::strings::{ascii, utf16_be};

pub const ACCOUNT_RECORD_SIZE: usize = 404;
const SEED_LEN: usize = 16;

const RETAIL_KEY: [u8; 16] = [
    0xE1, 0xBC, 0x15, 0x9C, 0x73, 0xB1, 0xEA, 0xE9, 0xAB, 0x31, 0x70, 0xF3, 0xAD, 0x47, 0xEB, 0xF3,
];
const DEVKIT_KEY: [u8; 16] = [
    0xDA, 0xB6, 0x9A, 0xD9, 0x8E, 0x28, 0x76, 0x4F, 0x97, 0x7E, 0xE2, 0x48, 0x7E, 0x4F, 0x3F, 0x68,
];

/// Which console key the record was encrypted with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccountKey {
    #[default]
    Retail,
    Devkit,
}

impl AccountKey {
    fn bytes(&self) -> &'static [u8; 16] {
        match self {
            AccountKey::Retail => &RETAIL_KEY,
            AccountKey::Devkit => &DEVKIT_KEY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Membership {
    Silver,
    Gold,
    Offline,
}

impl From<u8> for Membership {
    fn from(value: u8) -> Self {
        match value {
            0x30 => Membership::Silver,
            0x60 => Membership::Gold,
            _ => Membership::Offline,
        }
    }
}

/// Decoded account record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountInfo {
    pub gamertag: String,
    pub live_account: bool,
    /// Hex, only for Live accounts
    pub xuid: Option<String>,
    /// Button names, `None` when any code is unrecognised
    pub passcode: Option<Vec<String>>,
    pub membership: Membership,
    pub console_type: String,
}

/// Decrypt and decode a record with the retail key
pub fn decrypt_account(raw: &[u8]) -> Result<AccountInfo> {
    decrypt_account_with(raw, AccountKey::Retail)
}

pub fn decrypt_account_with(raw: &[u8], key: AccountKey) -> Result<AccountInfo> {
    let data = decrypt_record(raw, key)?;
    let info = AccountInfo::decode(&data);
    debug!("Account {:?}: live={} {:?}", info.gamertag, info.live_account, info.membership);
    Ok(info)
}

/// Decrypt the body of a record; the result is 388 bytes
pub fn decrypt_record(raw: &[u8], key: AccountKey) -> Result<Vec<u8>> {
    if raw.len() != ACCOUNT_RECORD_SIZE {
        return Err(X360Error::RecordLength {
            what: "account record",
            expected: ACCOUNT_RECORD_SIZE,
            actual: raw.len(),
        });
    }

    let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key.bytes())
        .map_err(|e| X360Error::InvalidInput(format!("account HMAC key: {}", e)))?;
    mac.update(&raw[..SEED_LEN]);
    let digest = mac.finalize().into_bytes();

    let mut body = raw[SEED_LEN..].to_vec();
    Rc4::new(&digest[..16]).apply(&mut body);
    Ok(body)
}

impl AccountInfo {
    /// Decode fields from a decrypted body
    fn decode(data: &[u8]) -> Self {
        let live_account = data[0] >> 5 & 1 == 1;
        Self {
            gamertag: utf16_be(&data[0x10..0x2E]),
            live_account,
            xuid: live_account.then(|| hex::encode(&data[0x30..0x38])),
            passcode: data[1..5]
                .iter()
                .map(|&b| passcode_button(b).map(str::to_string))
                .collect(),
            membership: Membership::from(data[0x39]),
            console_type: ascii(&data[0x3C..0x40]),
        }
    }
}

fn passcode_button(code: u8) -> Option<&'static str> {
    Some(match code {
        0x00 => "Null",
        0x01 => "Up",
        0x02 => "Down",
        0x03 => "Left",
        0x04 => "Right",
        0x05 => "X",
        0x06 => "Y",
        0x07 => "A?",
        0x08 => "B?",
        0x09 => "Left Trigger",
        0x0A => "Right Trigger",
        0x0B => "Left Bumper",
        0x0C => "Right Bumper",
        _ => return None,
    })
}

/// RC4 keystream
struct Rc4 {
    state: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    fn new(key: &[u8]) -> Self {
        let mut state = [0u8; 256];
        for (i, s) in state.iter_mut().enumerate() {
            *s = i as u8;
        }
        let mut j = 0u8;
        for i in 0..256 {
            j = j.wrapping_add(state[i]).wrapping_add(key[i % key.len()]);
            state.swap(i, j as usize);
        }
        Self { state, i: 0, j: 0 }
    }

    fn apply(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.state[self.i as usize]);
            self.state.swap(self.i as usize, self.j as usize);
            let k = self.state[self.state[self.i as usize].wrapping_add(self.state[self.j as usize]) as usize];
            *byte ^= k;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Encrypt a body the way the console does
    pub(crate) fn encrypt_record(seed: [u8; 16], body: &[u8]) -> Vec<u8> {
        let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(&RETAIL_KEY).unwrap();
        mac.update(&seed);
        let key = mac.finalize().into_bytes();
        let mut out = body.to_vec();
        Rc4::new(&key[..16]).apply(&mut out);
        let mut record = seed.to_vec();
        record.extend(out);
        record
    }

    pub(crate) fn sample_body() -> Vec<u8> {
        let mut body = vec![0u8; ACCOUNT_RECORD_SIZE - SEED_LEN];
        body[0] = 0x20;
        body[1..5].copy_from_slice(&[0x01, 0x05, 0x0A, 0x0C]);
        let tag: Vec<u8> = "Major Nelson".encode_utf16().flat_map(|u| u.to_be_bytes()).collect();
        body[0x10..0x10 + tag.len()].copy_from_slice(&tag);
        body[0x30..0x38].copy_from_slice(&[0x00, 0x09, 0x00, 0x00, 0x01, 0x23, 0x45, 0x67]);
        body[0x39] = 0x60;
        body[0x3C..0x40].copy_from_slice(b"PROD");
        body
    }

    #[test]
    fn test_rc4_known_vector() {
        let mut data = b"Plaintext".to_vec();
        Rc4::new(b"Key").apply(&mut data);
        assert_eq!(hex::encode(&data), "bbf316e8d940af0ad3");
    }

    #[test]
    fn test_decrypt_live_account() {
        let record = encrypt_record([0x5A; 16], &sample_body());
        let info = decrypt_account(&record).unwrap();
        assert_eq!(info.gamertag, "Major Nelson");
        assert!(info.live_account);
        assert_eq!(info.xuid.as_deref(), Some("0009000001234567"));
        assert_eq!(
            info.passcode,
            Some(vec![
                "Up".to_string(),
                "X".to_string(),
                "Right Trigger".to_string(),
                "Right Bumper".to_string()
            ])
        );
        assert_eq!(info.membership, Membership::Gold);
        assert_eq!(info.console_type, "PROD");
    }

    #[test]
    fn test_offline_account_has_no_xuid() {
        let mut body = sample_body();
        body[0] = 0;
        body[1] = 0x42;
        body[0x39] = 0;
        let info = decrypt_account(&encrypt_record([1; 16], &body)).unwrap();
        assert!(!info.live_account);
        assert!(info.xuid.is_none());
        assert!(info.passcode.is_none());
        assert_eq!(info.membership, Membership::Offline);
    }

    #[test]
    fn test_wrong_key_garbles_record() {
        let record = encrypt_record([0x5A; 16], &sample_body());
        let info = decrypt_account_with(&record, AccountKey::Devkit).unwrap();
        assert_ne!(info.gamertag, "Major Nelson");
    }

    #[test]
    fn test_record_must_be_exact_size() {
        for len in [403, 405] {
            assert!(matches!(
                decrypt_account(&vec![0u8; len]),
                Err(X360Error::RecordLength { expected: 404, .. })
            ));
        }
    }
}
