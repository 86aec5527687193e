// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Nostr Custody Agent Developers

//! Transaction construction and signing.
//!
//! Builds a P2PKH value transfer from a set of snapshot UTXOs: greedy
//! coin selection, fee/change convergence against the fixed byte-cost
//! model, BIP143-style replay-protected sighash preimages, deterministic
//! low-S ECDSA and wire serialization.
//!
//! Signing is pure CPU work; [`build_and_sign_offloaded`] runs it on the
//! blocking pool and hands the result back over a oneshot channel so a
//! large input set never stalls the event loop.

use hmac::{Hmac, Mac};
use k256::elliptic_curve::ops::Reduce;
use k256::elliptic_curve::point::AffineCoordinates;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::elliptic_curve::PrimeField;
use k256::{FieldBytes, ProjectivePoint, Scalar, U256};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::chain::{address, Utxo, DUST_LIMIT};
use crate::error::AgentError;

type HmacSha256 = Hmac<Sha256>;

/// Transaction format version used for all built transactions.
pub const TX_VERSION: u32 = 2;

/// Final sequence number (no relative locktime).
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

/// SIGHASH_ALL with the replay-protection fork flag.
pub const SIGHASH_ALL_FORKID: u32 = 0x41;

/// Byte-cost model: fixed overhead plus per-input and per-output costs.
pub const TX_OVERHEAD_BYTES: u64 = 10;
pub const INPUT_BYTES: u64 = 148;
pub const OUTPUT_BYTES: u64 = 34;

/// Upper bound on fee/change recomputation rounds.
const MAX_FEE_ITERATIONS: u32 = 3;

/// Domain-separation tag mixed into deterministic nonce derivation.
const NONCE_TAG: &[u8; 16] = b"ECDSA+SHA256    ";

/// floor(n / 2) for the secp256k1 group order, big-endian. Signatures with
/// s above this bound are negated to the canonical low-S form.
const HALF_ORDER: [u8; 32] = [
    0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0x5d, 0x57, 0x6e, 0x73, 0x57, 0xa4, 0x50, 0x1d, 0xdf, 0xe9, 0x2f, 0x46, 0x68, 0x1b,
    0x20, 0xa0,
];

// =============================================================================
// Keys
// =============================================================================

/// Chain-side signing key: the secret scalar plus its compressed public key.
///
/// Nostr keys are x-only, so the scalar is normalized to the even-parity
/// representative before any chain use; the compressed key therefore always
/// starts with `0x02` and matches the address other parties derive from the
/// x-only key.
#[derive(Clone)]
pub struct ChainKey {
    scalar: Scalar,
    compressed: [u8; 33],
}

impl ChainKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, AgentError> {
        let scalar = Option::<Scalar>::from(Scalar::from_repr(FieldBytes::clone_from_slice(bytes)))
            .filter(|s| !bool::from(s.is_zero()))
            .ok_or_else(|| AgentError::Crypto("secret key out of range".to_string()))?;

        let point = (ProjectivePoint::GENERATOR * scalar).to_affine();
        let encoded = point.to_encoded_point(true);
        let scalar = if encoded.as_bytes()[0] == 0x03 {
            -scalar
        } else {
            scalar
        };

        let point = (ProjectivePoint::GENERATOR * scalar).to_affine();
        let mut compressed = [0u8; 33];
        compressed.copy_from_slice(point.to_encoded_point(true).as_bytes());
        Ok(Self { scalar, compressed })
    }

    pub fn compressed_public_key(&self) -> &[u8; 33] {
        &self.compressed
    }

    pub fn pubkey_hash(&self) -> [u8; 20] {
        hash160(&self.compressed)
    }

    /// CashAddr for this key on the default network.
    pub fn address(&self) -> String {
        address::encode(
            address::DEFAULT_PREFIX,
            address::VERSION_P2PKH,
            &self.pubkey_hash(),
        )
    }
}

// =============================================================================
// Transaction model
// =============================================================================

#[derive(Debug, Clone)]
pub struct TxInput {
    /// Outpoint hash in wire order (reversed txid).
    pub prev_txid_le: [u8; 32],
    pub vout: u32,
    pub value: u64,
    pub sequence: u32,
    pub unlock_script: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct TxOutput {
    pub value: u64,
    pub lock_script: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub locktime: u32,
}

impl Transaction {
    pub fn total_input(&self) -> u64 {
        self.inputs.iter().map(|i| i.value).sum()
    }

    pub fn total_output(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }
}

// =============================================================================
// Hash and script helpers
// =============================================================================

pub fn sha256d(data: &[u8]) -> [u8; 32] {
    Sha256::digest(Sha256::digest(data)).into()
}

pub fn hash160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(Sha256::digest(data)).into()
}

/// `OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG`
pub fn p2pkh_script(pubkey_hash: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(0x76);
    script.push(0xa9);
    script.push(0x14);
    script.extend_from_slice(pubkey_hash);
    script.push(0x88);
    script.push(0xac);
    script
}

fn varint(value: u64) -> Vec<u8> {
    if value < 0xfd {
        vec![value as u8]
    } else if value <= 0xffff {
        let mut out = vec![0xfd];
        out.extend_from_slice(&(value as u16).to_le_bytes());
        out
    } else if value <= 0xffff_ffff {
        let mut out = vec![0xfe];
        out.extend_from_slice(&(value as u32).to_le_bytes());
        out
    } else {
        let mut out = vec![0xff];
        out.extend_from_slice(&value.to_le_bytes());
        out
    }
}

fn estimated_size(inputs: usize, outputs: usize) -> u64 {
    TX_OVERHEAD_BYTES + INPUT_BYTES * inputs as u64 + OUTPUT_BYTES * outputs as u64
}

pub fn fee_for(inputs: usize, outputs: usize, fee_rate: u64) -> u64 {
    estimated_size(inputs, outputs) * fee_rate
}

/// Parse a display-order txid into wire (reversed) byte order.
fn txid_to_wire(txid: &str) -> Result<[u8; 32], AgentError> {
    let bytes = hex::decode(txid)
        .map_err(|e| AgentError::Serialization(format!("invalid utxo txid: {e}")))?;
    if bytes.len() != 32 {
        return Err(AgentError::Serialization(format!(
            "invalid utxo txid length: {}",
            bytes.len()
        )));
    }
    let mut wire = [0u8; 32];
    for (i, b) in bytes.iter().rev().enumerate() {
        wire[i] = *b;
    }
    Ok(wire)
}

// =============================================================================
// UTXO selection
// =============================================================================

/// Greedy largest-first selection.
///
/// Dust inputs are discarded up front; candidates are accumulated until the
/// running total covers the amount plus the estimated fee for the current
/// input count (two outputs assumed while leftover exceeds dust).
pub fn select_utxos(
    utxos: Vec<Utxo>,
    amount: u64,
    fee_rate: u64,
) -> Result<Vec<Utxo>, AgentError> {
    let mut candidates: Vec<Utxo> = utxos.into_iter().filter(|u| u.value >= DUST_LIMIT).collect();
    candidates.sort_by(|a, b| b.value.cmp(&a.value));

    let mut selected = Vec::new();
    let mut total: u64 = 0;
    for utxo in candidates {
        total = total.saturating_add(utxo.value);
        selected.push(utxo);
        let est_outputs = if total.saturating_sub(amount) > DUST_LIMIT {
            2
        } else {
            1
        };
        let est_fee = fee_for(selected.len(), est_outputs, fee_rate);
        if total >= amount.saturating_add(est_fee) {
            return Ok(selected);
        }
    }
    Err(AgentError::InsufficientFunds(
        "insufficient funds after UTXO selection".to_string(),
    ))
}

// =============================================================================
// Assembly
// =============================================================================

/// Select inputs and settle the output set and fee.
///
/// The change output is dropped (its value surrendered to fee) when it
/// would land below the dust limit. The include-change decision can only
/// flip from true to false, so the loop settles within the iteration cap;
/// exhausting it anyway is a bug surfaced as a convergence failure.
fn assemble(
    key: &ChainKey,
    utxos: Vec<Utxo>,
    destination: &str,
    amount: u64,
    fee_rate: u64,
) -> Result<(Transaction, u64), AgentError> {
    let (_, version, dest_hash) = address::decode(destination)
        .map_err(|e| AgentError::InvalidRecipient(e.to_string()))?;
    if version != address::VERSION_P2PKH {
        return Err(AgentError::InvalidRecipient(format!(
            "unsupported address version {version}"
        )));
    }
    let dest_script = p2pkh_script(&dest_hash);
    let change_script = p2pkh_script(&key.pubkey_hash());

    let selected = select_utxos(utxos, amount, fee_rate)?;
    let total: u64 = selected.iter().map(|u| u.value).sum();

    let mut include_change = true;
    for _ in 0..MAX_FEE_ITERATIONS {
        let n_outputs = if include_change { 2 } else { 1 };
        let fee = fee_for(selected.len(), n_outputs, fee_rate);
        let Some(leftover) = total.checked_sub(amount.saturating_add(fee)) else {
            if include_change {
                include_change = false;
                continue;
            }
            return Err(AgentError::InsufficientFunds(
                "insufficient funds after fee calculation".to_string(),
            ));
        };
        if include_change && leftover < DUST_LIMIT {
            include_change = false;
            continue;
        }

        let mut outputs = vec![TxOutput {
            value: amount,
            lock_script: dest_script.clone(),
        }];
        let fee = if include_change {
            outputs.push(TxOutput {
                value: leftover,
                lock_script: change_script.clone(),
            });
            fee
        } else {
            // Sub-dust leftover is surrendered to miners.
            total - amount
        };

        let inputs = selected
            .iter()
            .map(|utxo| {
                Ok(TxInput {
                    prev_txid_le: txid_to_wire(&utxo.txid)?,
                    vout: utxo.vout,
                    value: utxo.value,
                    sequence: SEQUENCE_FINAL,
                    unlock_script: Vec::new(),
                })
            })
            .collect::<Result<Vec<_>, AgentError>>()?;

        return Ok((
            Transaction {
                version: TX_VERSION,
                inputs,
                outputs,
                locktime: 0,
            },
            fee,
        ));
    }

    Err(AgentError::Convergence(
        "fee calculation did not stabilize".to_string(),
    ))
}

// =============================================================================
// Sighash
// =============================================================================

/// Transaction-wide digests shared by every input's preimage.
struct SighashParts {
    prevouts: [u8; 32],
    sequences: [u8; 32],
    outputs: [u8; 32],
}

impl SighashParts {
    fn compute(tx: &Transaction) -> Self {
        let mut prevouts = Vec::with_capacity(tx.inputs.len() * 36);
        let mut sequences = Vec::with_capacity(tx.inputs.len() * 4);
        for input in &tx.inputs {
            prevouts.extend_from_slice(&input.prev_txid_le);
            prevouts.extend_from_slice(&input.vout.to_le_bytes());
            sequences.extend_from_slice(&input.sequence.to_le_bytes());
        }
        let mut outputs = Vec::new();
        for output in &tx.outputs {
            outputs.extend_from_slice(&output.value.to_le_bytes());
            outputs.extend_from_slice(&varint(output.lock_script.len() as u64));
            outputs.extend_from_slice(&output.lock_script);
        }
        Self {
            prevouts: sha256d(&prevouts),
            sequences: sha256d(&sequences),
            outputs: sha256d(&outputs),
        }
    }
}

/// Per-input message hash: BIP143 layout with the fork flag in the
/// sighash-type field, double-SHA-256.
fn sighash(tx: &Transaction, parts: &SighashParts, index: usize, cover_script: &[u8]) -> [u8; 32] {
    let input = &tx.inputs[index];
    let mut preimage = Vec::with_capacity(156 + cover_script.len());
    preimage.extend_from_slice(&tx.version.to_le_bytes());
    preimage.extend_from_slice(&parts.prevouts);
    preimage.extend_from_slice(&parts.sequences);
    preimage.extend_from_slice(&input.prev_txid_le);
    preimage.extend_from_slice(&input.vout.to_le_bytes());
    preimage.extend_from_slice(&varint(cover_script.len() as u64));
    preimage.extend_from_slice(cover_script);
    preimage.extend_from_slice(&input.value.to_le_bytes());
    preimage.extend_from_slice(&input.sequence.to_le_bytes());
    preimage.extend_from_slice(&parts.outputs);
    preimage.extend_from_slice(&tx.locktime.to_le_bytes());
    preimage.extend_from_slice(&SIGHASH_ALL_FORKID.to_le_bytes());
    sha256d(&preimage)
}

// =============================================================================
// Deterministic signing
// =============================================================================

fn hmac_concat(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC-SHA256 accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// RFC6979 HMAC-DRBG seeded with the secret key, message hash and the
/// domain-separation tag as additional data.
struct NonceGenerator {
    k: [u8; 32],
    v: [u8; 32],
}

impl NonceGenerator {
    fn new(secret: &[u8; 32], message: &[u8; 32]) -> Self {
        let mut k = [0u8; 32];
        let mut v = [1u8; 32];
        k = hmac_concat(&k, &[&v, &[0u8], secret, message, NONCE_TAG]);
        v = hmac_concat(&k, &[&v]);
        k = hmac_concat(&k, &[&v, &[1u8], secret, message, NONCE_TAG]);
        v = hmac_concat(&k, &[&v]);
        Self { k, v }
    }

    fn next(&mut self) -> [u8; 32] {
        self.v = hmac_concat(&self.k, &[&self.v]);
        let candidate = self.v;
        // Pre-advance the state so a rejected candidate retries correctly.
        self.k = hmac_concat(&self.k, &[&self.v, &[0u8]]);
        self.v = hmac_concat(&self.k, &[&self.v]);
        candidate
    }
}

fn is_high(s: &Scalar) -> bool {
    let bytes: [u8; 32] = s.to_bytes().into();
    bytes.as_slice() > HALF_ORDER.as_slice()
}

/// DER-encode one positive integer: strip leading zeros, re-pad with a
/// single zero byte when the top bit is set.
fn der_integer(bytes: &[u8; 32]) -> Vec<u8> {
    let mut trimmed: &[u8] = bytes;
    while trimmed.len() > 1 && trimmed[0] == 0 {
        trimmed = &trimmed[1..];
    }
    let mut out = Vec::with_capacity(trimmed.len() + 3);
    out.push(0x02);
    if trimmed[0] & 0x80 != 0 {
        out.push(trimmed.len() as u8 + 1);
        out.push(0x00);
    } else {
        out.push(trimmed.len() as u8);
    }
    out.extend_from_slice(trimmed);
    out
}

fn encode_der(r: &[u8; 32], s: &[u8; 32]) -> Vec<u8> {
    let r_enc = der_integer(r);
    let s_enc = der_integer(s);
    let mut out = Vec::with_capacity(2 + r_enc.len() + s_enc.len());
    out.push(0x30);
    out.push((r_enc.len() + s_enc.len()) as u8);
    out.extend_from_slice(&r_enc);
    out.extend_from_slice(&s_enc);
    out
}

/// Deterministic low-S ECDSA over the message hash, DER-encoded.
pub fn sign_ecdsa_der(key: &ChainKey, message: &[u8; 32]) -> Result<Vec<u8>, AgentError> {
    let secret: [u8; 32] = key.scalar.to_bytes().into();
    let z = <Scalar as Reduce<U256>>::reduce_bytes(&FieldBytes::clone_from_slice(message));
    let mut nonces = NonceGenerator::new(&secret, message);

    // The rejection probability per round is negligible; the bound exists
    // so a logic error cannot spin forever.
    for _ in 0..128 {
        let candidate = nonces.next();
        let Some(k) =
            Option::<Scalar>::from(Scalar::from_repr(FieldBytes::clone_from_slice(&candidate)))
                .filter(|k| !bool::from(k.is_zero()))
        else {
            continue;
        };

        let r_point = (ProjectivePoint::GENERATOR * k).to_affine();
        let r = <Scalar as Reduce<U256>>::reduce_bytes(&r_point.x());
        if bool::from(r.is_zero()) {
            continue;
        }

        let k_inv = Option::<Scalar>::from(k.invert())
            .ok_or_else(|| AgentError::Crypto("nonce not invertible".to_string()))?;
        let mut s = k_inv * (z + r * key.scalar);
        if bool::from(s.is_zero()) {
            continue;
        }
        if is_high(&s) {
            s = -s;
        }

        let r_bytes: [u8; 32] = r.to_bytes().into();
        let s_bytes: [u8; 32] = s.to_bytes().into();
        return Ok(encode_der(&r_bytes, &s_bytes));
    }

    Err(AgentError::Crypto(
        "deterministic nonce generation failed".to_string(),
    ))
}

// =============================================================================
// Build + sign + serialize
// =============================================================================

/// Serialize to wire bytes: version, varint-counted inputs and outputs,
/// locktime, all little-endian.
pub fn serialize(tx: &Transaction) -> Vec<u8> {
    let mut out = Vec::with_capacity(estimated_size(tx.inputs.len(), tx.outputs.len()) as usize);
    out.extend_from_slice(&tx.version.to_le_bytes());
    out.extend_from_slice(&varint(tx.inputs.len() as u64));
    for input in &tx.inputs {
        out.extend_from_slice(&input.prev_txid_le);
        out.extend_from_slice(&input.vout.to_le_bytes());
        out.extend_from_slice(&varint(input.unlock_script.len() as u64));
        out.extend_from_slice(&input.unlock_script);
        out.extend_from_slice(&input.sequence.to_le_bytes());
    }
    out.extend_from_slice(&varint(tx.outputs.len() as u64));
    for output in &tx.outputs {
        out.extend_from_slice(&output.value.to_le_bytes());
        out.extend_from_slice(&varint(output.lock_script.len() as u64));
        out.extend_from_slice(&output.lock_script);
    }
    out.extend_from_slice(&tx.locktime.to_le_bytes());
    out
}

/// Build, sign and serialize a payment of `amount` to `destination`.
pub fn build_and_sign(
    key: &ChainKey,
    utxos: Vec<Utxo>,
    destination: &str,
    amount: u64,
    fee_rate: u64,
) -> Result<Vec<u8>, AgentError> {
    let (mut tx, _fee) = assemble(key, utxos, destination, amount, fee_rate)?;

    let parts = SighashParts::compute(&tx);
    let cover_script = p2pkh_script(&key.pubkey_hash());
    for index in 0..tx.inputs.len() {
        let message = sighash(&tx, &parts, index, &cover_script);
        let mut sig = sign_ecdsa_der(key, &message)?;
        sig.push(SIGHASH_ALL_FORKID as u8);

        let mut unlock = Vec::with_capacity(sig.len() + 35);
        unlock.push(sig.len() as u8);
        unlock.extend_from_slice(&sig);
        unlock.push(key.compressed.len() as u8);
        unlock.extend_from_slice(&key.compressed);
        tx.inputs[index].unlock_script = unlock;
    }

    Ok(serialize(&tx))
}

/// Run [`build_and_sign`] on the blocking pool.
///
/// The caller awaits exactly one reply on a dedicated channel; the task is
/// torn down after replying. Cancellation abandons the await, it does not
/// interrupt the signing work.
pub async fn build_and_sign_offloaded(
    key: ChainKey,
    utxos: Vec<Utxo>,
    destination: String,
    amount: u64,
    fee_rate: u64,
    cancel: CancellationToken,
) -> Result<Vec<u8>, AgentError> {
    let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
    tokio::task::spawn_blocking(move || {
        let result = build_and_sign(&key, utxos, &destination, amount, fee_rate);
        let _ = reply_tx.send(result);
    });

    tokio::select! {
        _ = cancel.cancelled() => Err(AgentError::Crypto("signing abandoned at shutdown".to_string())),
        reply = reply_rx => {
            reply.map_err(|_| AgentError::Crypto("signing task dropped its reply".to_string()))?
        }
    }
}
