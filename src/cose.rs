//! COSE Sign1 / CBOR (C8 in the component table). The specification treats
//! this as an external collaborator with an `encode`/`decode`/`sign`/`verify`
//! boundary; this crate provides the one concrete implementation it ships
//! with, using `coset` for the CBOR/COSE structures and `p256` for ES256.
//!
//! [`crate::registrar::Registrar`] and [`crate::checkpoint::CheckpointSigner`]
//! depend only on the functions in this module, never on `coset`/`p256`
//! directly, so a different signing backend could replace this file without
//! touching either caller.

use coset::cbor::value::Value;
use coset::{iana, CborSerializable, CoseSign1, CoseSign1Builder, HeaderBuilder, Label, TaggedCborSerializable};
use ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::errors::LogError;
use crate::hash::Hash;

pub const VDS_RFC9162_SHA256: &str = "RFC9162_SHA256";

const LABEL_VDS: &str = "vds";
const LABEL_TREE_SIZE: &str = "tree_size";
const LABEL_SUBJECT_ID: &str = "subject_id";
const LABEL_PAYLOAD_HASH_ALG: &str = "payload_hash_alg";

/// Everything the registration pipeline needs out of a submitted statement's
/// protected header, before the signature itself has been checked (spec §3,
/// §4.6 step 1).
#[derive(Debug, Clone)]
pub struct DecodedStatement {
    pub kid: Option<Vec<u8>>,
    pub subject_id: Option<String>,
    pub content_type: Option<String>,
    pub payload: Vec<u8>,
}

/// Parse a submitted COSE Sign1 and check it declares `alg = ES256` and a
/// hash-envelope claim, without checking the signature. Returns both the
/// parsed structure (needed for [`verify_statement`]) and the extracted
/// metadata.
pub fn decode_statement(bytes: &[u8]) -> Result<(CoseSign1, DecodedStatement), LogError> {
    let sign1 = parse_sign1(bytes)?;

    let alg = sign1
        .protected
        .header
        .alg
        .as_ref()
        .ok_or_else(|| LogError::InvalidCose("missing alg header".into()))?;
    if !matches!(
        alg,
        coset::RegisteredLabelWithPrivate::Assigned(iana::Algorithm::ES256)
    ) {
        return Err(LogError::UnsupportedAlgorithm(format!(
            "statement alg {alg:?} is not ES256"
        )));
    }

    if !has_text_label(&sign1.protected.header.rest, LABEL_PAYLOAD_HASH_ALG) {
        return Err(LogError::UnsupportedAlgorithm(
            "missing payload_hash_alg hash-envelope claim".into(),
        ));
    }

    let kid = (!sign1.protected.header.key_id.is_empty()).then(|| sign1.protected.header.key_id.clone());
    let subject_id = find_text_value(&sign1.protected.header.rest, LABEL_SUBJECT_ID);
    let content_type = sign1.protected.header.content_type.as_ref().map(|ct| match ct {
        coset::ContentType::Uint(u) => u.to_string(),
        coset::ContentType::Tstr(s) => s.clone(),
    });
    let payload = sign1
        .payload
        .clone()
        .ok_or_else(|| LogError::InvalidCose("missing payload".into()))?;

    Ok((
        sign1,
        DecodedStatement {
            kid,
            subject_id,
            content_type,
            payload,
        },
    ))
}

/// Verify a decoded statement's signature against the resolved issuer key
/// (spec §4.6 step 1, `COSE.verify`).
pub fn verify_statement(sign1: &CoseSign1, verifying_key: &VerifyingKey) -> Result<(), LogError> {
    sign1
        .verify_signature(&[], |sig, data| verify_es256(verifying_key, sig, data))
        .map_err(|_| LogError::InvalidSignature)
}

fn parse_sign1(bytes: &[u8]) -> Result<CoseSign1, LogError> {
    CoseSign1::from_tagged_slice(bytes)
        .or_else(|_| CoseSign1::from_slice(bytes))
        .map_err(|e| LogError::InvalidCose(e.to_string()))
}

fn has_text_label(rest: &[(Label, Value)], label: &str) -> bool {
    rest.iter().any(|(l, _)| matches!(l, Label::Text(t) if t == label))
}

fn find_text_value(rest: &[(Label, Value)], label: &str) -> Option<String> {
    rest.iter().find_map(|(l, v)| match (l, v) {
        (Label::Text(t), Value::Text(s)) if t == label => Some(s.clone()),
        _ => None,
    })
}

/// The checkpoint payload (spec §3, §6.1): deterministic CBOR map over four
/// fields, signed as-is with no extra wrapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointPayload {
    pub origin: String,
    pub tree_size: u64,
    pub root_hash: Hash,
    pub timestamp: u64,
}

/// The receipt payload (spec §3, §6.1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptPayload {
    pub leaf_index: u64,
    pub inclusion_path: Vec<Hash>,
}

/// Signs checkpoints and receipts with the service's ES256 key. The same key
/// backs both (spec §4.5: "the issuing service signs the receipt with the
/// same key used for checkpoints").
pub struct CoseSigner {
    signing_key: SigningKey,
    kid: Vec<u8>,
}

impl CoseSigner {
    pub fn new(signing_key: SigningKey, kid: Vec<u8>) -> Self {
        Self { signing_key, kid }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        *self.signing_key.verifying_key()
    }

    /// Build and sign a checkpoint COSE Sign1 (spec §4.5 `make_checkpoint`).
    pub fn sign_checkpoint(&self, payload: &CheckpointPayload) -> Result<Vec<u8>, LogError> {
        let protected = HeaderBuilder::new()
            .algorithm(iana::Algorithm::ES256)
            .key_id(self.kid.clone())
            .text_value(LABEL_VDS.to_string(), Value::Text(VDS_RFC9162_SHA256.to_string()))
            .build();
        let payload_bytes = encode_cbor(payload)?;
        self.sign(protected, payload_bytes)
    }

    /// Build and sign a receipt COSE Sign1 (spec §4.6 step 3). `tree_size` is
    /// the size the inclusion proof was computed against.
    pub fn sign_receipt(&self, tree_size: u64, payload: &ReceiptPayload) -> Result<Vec<u8>, LogError> {
        let protected = HeaderBuilder::new()
            .algorithm(iana::Algorithm::ES256)
            .key_id(self.kid.clone())
            .text_value(LABEL_VDS.to_string(), Value::Text(VDS_RFC9162_SHA256.to_string()))
            .text_value(LABEL_TREE_SIZE.to_string(), Value::from(tree_size))
            .build();
        let payload_bytes = encode_cbor(payload)?;
        self.sign(protected, payload_bytes)
    }

    fn sign(&self, protected: coset::Header, payload: Vec<u8>) -> Result<Vec<u8>, LogError> {
        let sign1 = CoseSign1Builder::new()
            .protected(protected)
            .payload(payload)
            .create_signature(&[], |data| sign_es256(&self.signing_key, data))
            .build();
        sign1
            .to_tagged_vec()
            .map_err(|e| LogError::InvalidCose(format!("encoding signed structure: {e}")))
    }
}

fn sign_es256(signing_key: &SigningKey, data: &[u8]) -> Vec<u8> {
    let signature: Signature = signing_key.sign(data);
    signature.to_bytes().to_vec()
}

fn verify_es256(verifying_key: &VerifyingKey, sig_bytes: &[u8], data: &[u8]) -> Result<(), LogError> {
    let signature = Signature::from_slice(sig_bytes).map_err(|_| LogError::InvalidSignature)?;
    verifying_key
        .verify(data, &signature)
        .map_err(|_| LogError::InvalidSignature)
}

/// Verify and decode a checkpoint COSE Sign1 (spec §4.5 `verify_checkpoint`).
pub fn verify_checkpoint(bytes: &[u8], verifying_key: &VerifyingKey) -> Result<CheckpointPayload, LogError> {
    let sign1 = parse_sign1(bytes)?;
    require_vds(&sign1)?;
    sign1
        .verify_signature(&[], |sig, data| verify_es256(verifying_key, sig, data))
        .map_err(|_| LogError::InvalidSignature)?;
    let payload = sign1.payload.ok_or_else(|| LogError::InvalidCose("missing payload".into()))?;
    decode_cbor(&payload)
}

/// Verify and decode a receipt COSE Sign1, also returning the `tree_size`
/// the proof was computed against.
pub fn verify_receipt(bytes: &[u8], verifying_key: &VerifyingKey) -> Result<(u64, ReceiptPayload), LogError> {
    let sign1 = parse_sign1(bytes)?;
    require_vds(&sign1)?;
    let tree_size = rest_uint(&sign1.protected.header.rest, LABEL_TREE_SIZE)
        .ok_or_else(|| LogError::InvalidCose("missing tree_size header".into()))?;
    sign1
        .verify_signature(&[], |sig, data| verify_es256(verifying_key, sig, data))
        .map_err(|_| LogError::InvalidSignature)?;
    let payload = sign1.payload.ok_or_else(|| LogError::InvalidCose("missing payload".into()))?;
    Ok((tree_size, decode_cbor(&payload)?))
}

fn require_vds(sign1: &CoseSign1) -> Result<(), LogError> {
    let alg = sign1
        .protected
        .header
        .alg
        .as_ref()
        .ok_or_else(|| LogError::InvalidCose("missing alg header".into()))?;
    if !matches!(
        alg,
        coset::RegisteredLabelWithPrivate::Assigned(iana::Algorithm::ES256)
    ) {
        return Err(LogError::UnsupportedAlgorithm(format!("{alg:?} is not ES256")));
    }
    match find_text_value(&sign1.protected.header.rest, LABEL_VDS) {
        Some(vds) if vds == VDS_RFC9162_SHA256 => Ok(()),
        Some(other) => Err(LogError::UnsupportedAlgorithm(format!(
            "unrecognized verifiable-data-structure {other}"
        ))),
        None => Err(LogError::InvalidCose("missing vds header".into())),
    }
}

fn rest_uint(rest: &[(Label, Value)], label: &str) -> Option<u64> {
    rest.iter().find_map(|(l, v)| match (l, v) {
        (Label::Text(t), Value::Integer(i)) if t == label => u64::try_from(*i).ok(),
        _ => None,
    })
}

fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, LogError> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| LogError::InvalidCose(format!("encoding CBOR payload: {e}")))?;
    Ok(buf)
}

fn decode_cbor<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, LogError> {
    ciborium::de::from_reader(bytes).map_err(|e| LogError::InvalidCose(format!("decoding CBOR payload: {e}")))
}
