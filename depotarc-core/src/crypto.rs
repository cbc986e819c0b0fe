use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use anyhow::{anyhow, bail, Context, Result};
use rand::RngCore;
use std::fmt;
use std::fs;
use std::path::Path;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const IV_LEN: usize = 16;

/// Per-depot 256-bit symmetric key.
#[derive(Clone, PartialEq, Eq)]
pub struct DepotKey([u8; 32]);

impl DepotKey {
    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        if b.len() != 32 {
            bail!("depot key must be 32 bytes, got {}", b.len());
        }
        let mut k = [0u8; 32];
        k.copy_from_slice(b);
        Ok(DepotKey(k))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s.trim()).context("depot key is not valid hex")?;
        Self::from_bytes(&raw)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for DepotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DepotKey(..)")
    }
}

/// Decrypt a depot payload: ECB-wrapped IV followed by CBC/PKCS7 ciphertext.
pub fn symmetric_decrypt(data: &[u8], key: &DepotKey) -> Result<Vec<u8>> {
    if data.len() < IV_LEN * 2 || (data.len() - IV_LEN) % IV_LEN != 0 {
        bail!("ciphertext length {} is not a whole number of blocks", data.len());
    }
    let ecb = aes::Aes256::new_from_slice(&key.0).map_err(|e| anyhow!("aes key: {e}"))?;
    let mut iv = aes::Block::clone_from_slice(&data[..IV_LEN]);
    ecb.decrypt_block(&mut iv);
    Aes256CbcDec::new_from_slices(&key.0, &iv)
        .map_err(|e| anyhow!("aes-cbc init: {e}"))?
        .decrypt_padded_vec_mut::<Pkcs7>(&data[IV_LEN..])
        .map_err(|_| anyhow!("bad padding (wrong key?)"))
}

/// Encrypt with a fresh random IV.
pub fn symmetric_encrypt(data: &[u8], key: &DepotKey) -> Result<Vec<u8>> {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    symmetric_encrypt_with_iv(data, key, &iv)
}

pub fn symmetric_encrypt_with_iv(data: &[u8], key: &DepotKey, iv: &[u8; IV_LEN]) -> Result<Vec<u8>> {
    let ecb = aes::Aes256::new_from_slice(&key.0).map_err(|e| anyhow!("aes key: {e}"))?;
    let mut wrapped = aes::Block::clone_from_slice(iv);
    ecb.encrypt_block(&mut wrapped);
    let body = Aes256CbcEnc::new_from_slices(&key.0, iv)
        .map_err(|e| anyhow!("aes-cbc init: {e}"))?
        .encrypt_padded_vec_mut::<Pkcs7>(data);
    let mut out = Vec::with_capacity(IV_LEN + body.len());
    out.extend_from_slice(&wrapped);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Resolve a depot key from the archive root: `depots/<d>/<d>.depotkey`,
/// then `keys/<d>.depotkey`, then `depot_keys.txt`.
pub fn find_depot_key(root: &Path, depot: u32) -> Result<Option<DepotKey>> {
    let candidates = [
        root.join("depots").join(depot.to_string()).join(format!("{depot}.depotkey")),
        root.join("keys").join(format!("{depot}.depotkey")),
    ];
    for p in &candidates {
        if p.is_file() {
            let raw = fs::read(p).with_context(|| format!("read {:?}", p))?;
            log::debug!("depot {depot}: key from {}", p.display());
            return DepotKey::from_bytes(&raw).map(Some);
        }
    }
    let list = root.join("depot_keys.txt");
    if list.is_file() {
        let text = fs::read_to_string(&list).with_context(|| format!("read {:?}", list))?;
        return lookup_key_list(&text, depot);
    }
    Ok(None)
}

/// Parse `depot \t \t key-hex [\t name]` lines; unparseable lines are skipped.
pub fn lookup_key_list(text: &str, depot: u32) -> Result<Option<DepotKey>> {
    for line in text.lines() {
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() < 3 {
            continue;
        }
        match cols[0].trim().parse::<u32>() {
            Ok(d) if d == depot => return DepotKey::from_hex(cols[2]).map(Some),
            _ => continue,
        }
    }
    Ok(None)
}
