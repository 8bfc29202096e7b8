//! Encrypted append-only container backing the secret vault.
//!
//! File layout:
//!
//! ```text
//! [b"SVH1"][16-byte argon2 salt]
//! [u16 LE ct_len][12-byte nonce][ct_len bytes ciphertext]  (repeated)
//! ```
//!
//! Every mutation is a whole-frame append, so a crash can only ever leave a
//! partial trailing frame. On open that tail is dropped and the file is
//! truncated back to the last complete entry; a frame that is complete but
//! fails authentication is an integrity error and fatal.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::warn;

use crate::types::{Result, SafeError};

use super::crypto::{
    derive_vault_key, open_entry, random_bytes, seal_entry, VaultKey, NONCE_LEN, SALT_LEN, TAG_LEN,
};

const MAGIC: &[u8; 4] = b"SVH1";
const HEADER_LEN: usize = MAGIC.len() + SALT_LEN;

/// Largest plaintext entry; the sealed frame's length prefix is a u16 and
/// sealing adds the auth tag.
pub const MAX_ENTRY: usize = u16::MAX as usize - TAG_LEN;

/// Raw encrypted entry store. [`Vault`](super::Vault) layers the record
/// semantics on top.
pub struct VaultFile {
    file: File,
    key: VaultKey,
    /// Decrypted entries in file order, populated at open.
    pub entries: Vec<Vec<u8>>,
    /// True when open created a fresh vault.
    pub created: bool,
}

impl VaultFile {
    /// Open the vault at `path`, creating it when absent or empty.
    ///
    /// Replays every stored entry through authenticated decryption; a wrong
    /// passphrase surfaces as `SafeError::Integrity` on the first entry.
    pub fn open(passphrase: &str, path: &Path) -> Result<VaultFile> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        if len == 0 {
            let salt: [u8; SALT_LEN] = random_bytes();
            let key = derive_vault_key(passphrase.as_bytes(), &salt)?;
            file.write_all(MAGIC)?;
            file.write_all(&salt)?;
            file.sync_all()?;
            return Ok(VaultFile {
                file,
                key,
                entries: Vec::new(),
                created: true,
            });
        }

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        if data.len() < HEADER_LEN || &data[..MAGIC.len()] != MAGIC {
            return Err(SafeError::Integrity("not a vault file".into()));
        }
        let key = derive_vault_key(passphrase.as_bytes(), &data[MAGIC.len()..HEADER_LEN])?;

        let mut entries = Vec::new();
        let mut pos = HEADER_LEN;
        let mut valid_end = pos as u64;
        while pos < data.len() {
            if data.len() - pos < 2 {
                break; // partial length prefix from an interrupted write
            }
            let ct_len = u16::from_le_bytes([data[pos], data[pos + 1]]) as usize;
            let frame_len = 2 + NONCE_LEN + ct_len;
            if data.len() - pos < frame_len {
                break; // partial trailing frame
            }
            let mut nonce = [0u8; NONCE_LEN];
            nonce.copy_from_slice(&data[pos + 2..pos + 2 + NONCE_LEN]);
            let ciphertext = &data[pos + 2 + NONCE_LEN..pos + frame_len];
            entries.push(open_entry(&key, &nonce, ciphertext)?);
            pos += frame_len;
            valid_end = pos as u64;
        }
        if valid_end < len {
            warn!(
                dropped = len - valid_end,
                "vault has a truncated trailing entry, discarding"
            );
            file.set_len(valid_end)?;
        }

        Ok(VaultFile {
            file,
            key,
            entries,
            created: false,
        })
    }

    /// Seal and append one entry. Entries beyond [`MAX_ENTRY`] are
    /// rejected before any byte is written; a silently truncated length
    /// prefix would desynchronize every frame behind it.
    pub fn append(&mut self, plaintext: &[u8]) -> Result<()> {
        if plaintext.len() > MAX_ENTRY {
            return Err(SafeError::PayloadTooLarge(plaintext.len()));
        }
        let (nonce, ciphertext) = seal_entry(&self.key, plaintext)?;
        let mut frame = Vec::with_capacity(2 + NONCE_LEN + ciphertext.len());
        frame.extend_from_slice(&(ciphertext.len() as u16).to_le_bytes());
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&ciphertext);

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&frame)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Flush and release the backing file.
    pub fn close(self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
        dir.path().join("test.vault")
    }

    #[test]
    fn test_create_append_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir);

        let mut vault = VaultFile::open("passphrase", &path).unwrap();
        assert!(vault.created);
        vault.append(b"first").unwrap();
        vault.append(b"second").unwrap();
        vault.close().unwrap();

        let vault = VaultFile::open("passphrase", &path).unwrap();
        assert!(!vault.created);
        assert_eq!(vault.entries, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn test_wrong_passphrase_is_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir);

        let mut vault = VaultFile::open("correct", &path).unwrap();
        vault.append(b"entry").unwrap();
        vault.close().unwrap();

        let result = VaultFile::open("wrong", &path);
        assert!(matches!(result, Err(SafeError::Integrity(_))));
    }

    #[test]
    fn test_garbage_file_is_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir);
        std::fs::write(&path, b"definitely not a vault").unwrap();

        let result = VaultFile::open("passphrase", &path);
        assert!(matches!(result, Err(SafeError::Integrity(_))));
    }

    #[test]
    fn test_oversized_entry_rejected_and_file_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir);

        let mut vault = VaultFile::open("passphrase", &path).unwrap();
        vault.append(b"first").unwrap();
        let len_before = std::fs::metadata(&path).unwrap().len();

        let oversized = vec![0u8; MAX_ENTRY + 1];
        let result = vault.append(&oversized);
        assert!(matches!(result, Err(SafeError::PayloadTooLarge(_))));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len_before);

        // Every stored entry is still readable afterwards.
        vault.append(b"second").unwrap();
        vault.close().unwrap();
        let vault = VaultFile::open("passphrase", &path).unwrap();
        assert_eq!(vault.entries, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn test_truncated_trailing_entry_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir);

        let mut vault = VaultFile::open("passphrase", &path).unwrap();
        vault.append(b"first").unwrap();
        vault.append(b"second").unwrap();
        vault.close().unwrap();

        // Chop into the middle of the last frame, as a crash mid-write would.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();
        drop(file);

        let mut vault = VaultFile::open("passphrase", &path).unwrap();
        assert_eq!(vault.entries, vec![b"first".to_vec()]);

        // The file was truncated to the last good frame, so appends land
        // cleanly after it.
        vault.append(b"third").unwrap();
        vault.close().unwrap();
        let vault = VaultFile::open("passphrase", &path).unwrap();
        assert_eq!(vault.entries, vec![b"first".to_vec(), b"third".to_vec()]);
    }
}
