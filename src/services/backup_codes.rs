use std::collections::HashSet;

use data_encoding::HEXUPPER;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// バックアップコード1つあたりのランダムバイト数（8桁の16進数）
const CODE_BYTES: usize = 4;

/// 発行したバックアップコード
///
/// codes は平文（利用者に一度だけ返す）、hashes は保存用
#[derive(Debug, Clone)]
pub struct BackupCodeSet {
    pub codes: Vec<String>,
    pub hashes: Vec<String>,
}

/// バックアップコードを count 個生成
///
/// 同じセット内でハッシュが重複しないよう、衝突した場合は引き直す
pub fn generate_backup_codes(count: usize) -> BackupCodeSet {
    let mut codes = Vec::with_capacity(count);
    let mut hashes = Vec::with_capacity(count);
    let mut seen = HashSet::with_capacity(count);

    while codes.len() < count {
        let mut bytes = [0u8; CODE_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let code = HEXUPPER.encode(&bytes);
        let hash = hash_backup_code(&code);

        if seen.insert(hash.clone()) {
            codes.push(code);
            hashes.push(hash);
        }
    }

    BackupCodeSet { codes, hashes }
}

/// 入力の正規化（空白・ハイフン除去、大文字化）
pub fn normalize_backup_code(candidate: &str) -> String {
    candidate
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// 正規化済みコードの SHA-256（16進小文字）
pub fn hash_backup_code(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// バックアップコードが発行済みセットに含まれるか
///
/// 使用済みかどうかは判定しない（消費は BackupCodeLedger で行う）
pub fn verify_backup_code(candidate: &str, stored_hashes: &[String]) -> bool {
    let normalized = normalize_backup_code(candidate);
    if normalized.is_empty() {
        return false;
    }
    let hash = hash_backup_code(&normalized);

    let mut found = false;
    for stored in stored_hashes {
        found |= bool::from(stored.as_bytes().ct_eq(hash.as_bytes()));
    }
    found
}
