use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tidewallet_sdk::EncryptedMnemonic;

const WALLET_FILE: &str = "wallet_encrypted.json";

#[derive(Error, Debug)]
pub enum WalletPersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Stores the sealed seed. The file is shared by every network; accounts
/// are derived per network on unlock.
pub struct MnemonicPersister {
    file_path: PathBuf,
}

impl MnemonicPersister {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            file_path: data_dir.join(WALLET_FILE),
        }
    }

    pub fn exists(&self) -> bool {
        self.file_path.exists()
    }

    pub fn save(&self, sealed: &EncryptedMnemonic) -> Result<(), WalletPersistError> {
        if let Some(parent) = self.file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(sealed)?;
        fs::write(&self.file_path, json)?;
        Ok(())
    }

    pub fn load(&self) -> Result<EncryptedMnemonic, WalletPersistError> {
        let contents = fs::read_to_string(&self.file_path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn delete(&self) -> Result<(), WalletPersistError> {
        if self.exists() {
            fs::remove_file(&self.file_path)?;
        }
        Ok(())
    }
}
