use bitcoin::{
    opcodes,
    script::{Instruction, PushBytesBuf},
    Script, ScriptBuf, Transaction, TxOut,
};

use crate::error::BuildError;

/// Leading byte of a data-embedding (memo) output script.
pub const MEMO_MARKER: u8 = 0x6a; // OP_RETURN

const COMPRESSED_KEY_LEN: u8 = 33;

/// Spending-script shapes the verifying contract can check on its own.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptShape {
    /// A 33-byte key push (`0x21`) sitting 38 bytes from the end.
    Pkh,
    /// `0x16 0x00 0x14 <20 bytes>`: redeem script of a nested P2WPKH.
    P2shP2wpkh,
    Unknown(Vec<u8>),
}

impl ScriptShape {
    pub fn classify(script_sig: &Script) -> Self {
        let b = script_sig.as_bytes();
        match b.len() {
            23 if b.starts_with(&[0x16, 0x00, 0x14]) => ScriptShape::P2shP2wpkh,
            n if n >= 38 && b[n - 38] == COMPRESSED_KEY_LEN => ScriptShape::Pkh,
            _ => ScriptShape::Unknown(b.to_vec()),
        }
    }

    /// True when the contract needs no dependency transaction to recover the
    /// spending key.
    pub fn is_self_contained(&self) -> bool {
        !matches!(self, ScriptShape::Unknown(_))
    }
}

/// Offset of the public key inside a `<sig> <pubkey>` script_sig, or 0 when
/// the push after the signature is not a compressed key.
pub fn pubkey_pos(script_sig: &Script) -> usize {
    let b = script_sig.as_bytes();
    let Some(&sig_len) = b.first() else {
        return 0;
    };
    let sig_len = sig_len as usize;
    match b.get(sig_len + 1) {
        Some(&COMPRESSED_KEY_LEN) => sig_len + 2,
        _ => 0,
    }
}

pub fn is_memo_script(script: &Script) -> bool {
    script.as_bytes().first() == Some(&MEMO_MARKER)
}

pub fn memo_index(outputs: &[TxOut]) -> Option<usize> {
    outputs.iter().position(|o| is_memo_script(&o.script_pubkey))
}

pub fn has_memo(tx: &Transaction) -> bool {
    memo_index(&tx.output).is_some()
}

/// Data pushed right after `OP_RETURN`.
pub fn memo_payload(script: &Script) -> Option<&[u8]> {
    let mut instructions = script.instructions();
    match instructions.next()?.ok()? {
        Instruction::Op(opcodes::all::OP_RETURN) => {}
        _ => return None,
    }
    match instructions.next()?.ok()? {
        Instruction::PushBytes(bytes) => Some(bytes.as_bytes()),
        _ => None,
    }
}

pub fn find_memo(tx: &Transaction) -> Option<String> {
    let i = memo_index(&tx.output)?;
    let payload = memo_payload(&tx.output[i].script_pubkey)?;
    Some(String::from_utf8_lossy(payload).into_owned())
}

/// The brand is the memo text up to its first space: `"endur.io x2"` gives
/// `"endur.io"`.
pub fn guess_brand(tx: &Transaction) -> Option<String> {
    let memo = find_memo(tx)?;
    match memo.find(' ') {
        Some(i) if i > 0 => Some(memo[..i].to_string()),
        _ => Some(memo),
    }
}

pub fn memo_script(text: &str) -> Result<ScriptBuf, BuildError> {
    let push = PushBytesBuf::try_from(text.as_bytes().to_vec())
        .map_err(|_| BuildError::InvalidMemo(text.to_string()))?;
    Ok(ScriptBuf::builder()
        .push_opcode(opcodes::all::OP_RETURN)
        .push_slice(push)
        .into_script())
}
