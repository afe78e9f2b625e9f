//! Payment message signing
//!
//! The payment contract recomputes
//!
//! ```text
//! keccak256(address ‖ uint256 number ‖ uint8 method ‖ uint256 amount)
//! ```
//!
//! (the `abi.encodePacked` layout, 85 bytes) and checks it against the signer's
//! address. With `prefixed` set, the hash is wrapped in the personal-message
//! envelope `"\x19Ethereum Signed Message:\n32" ‖ hash` and hashed again before
//! signing. `v` is returned as 27/28.
//!
//! Signing is deterministic (RFC 6979), so identical inputs always produce the
//! same `(hash, r, s, v)`.

use k256::ecdsa::{RecoveryId, Signature, SigningKey};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

use crate::types::{Result, TollgateError};

/// Length of the packed payment message
pub const PACKED_LEN: usize = 20 + 32 + 1 + 32;

const PERSONAL_MESSAGE_PREFIX: &[u8] = b"\x19Ethereum Signed Message:\n32";

/// 20-byte account address
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(pub [u8; 20]);

impl FromStr for Address {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        let raw = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
        let bytes = hex::decode(raw)
            .map_err(|e| TollgateError::BadRequest(format!("invalid address '{}': {}", s, e)))?;
        let array: [u8; 20] = bytes
            .try_into()
            .map_err(|_| TollgateError::BadRequest(format!("address '{}' is not 20 bytes", s)))?;
        Ok(Self(array))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// What the payer sends to the contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    /// The platform's own token
    Token = 0,
    /// The chain's native coin
    Ether = 1,
}

impl PaymentMethod {
    pub fn tag(&self) -> u8 {
        *self as u8
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::Token),
            1 => Ok(Self::Ether),
            other => Err(TollgateError::InvalidPaymentMethod(format!(
                "unknown payment type {}",
                other
            ))),
        }
    }
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// Left-pad an unsigned value into a 32-byte big-endian word
fn word(value: u128) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[16..].copy_from_slice(&value.to_be_bytes());
    out
}

/// `abi.encodePacked(address, uint256 number, uint8 method, uint256 amount)`
pub fn pack_payment(address: &Address, number: u64, method: PaymentMethod, amount: u128) -> [u8; PACKED_LEN] {
    let mut packed = [0u8; PACKED_LEN];
    packed[..20].copy_from_slice(&address.0);
    packed[20..52].copy_from_slice(&word(u128::from(number)));
    packed[52] = method.tag();
    packed[53..].copy_from_slice(&word(amount));
    packed
}

pub fn payment_hash(address: &Address, number: u64, method: PaymentMethod, amount: u128) -> [u8; 32] {
    keccak256(&pack_payment(address, number, method, amount))
}

/// Personal-message hash of a 32-byte digest
pub fn prefixed_hash(hash: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(PERSONAL_MESSAGE_PREFIX);
    hasher.update(hash);
    hasher.finalize().into()
}

/// Convert a decimal amount into integer base units (`decimals` places),
/// truncating anything finer
pub fn to_base_units(amount: Decimal, decimals: u32) -> Result<u128> {
    if amount.is_sign_negative() {
        return Err(TollgateError::BadRequest(format!("negative amount {}", amount)));
    }
    let scale = Decimal::from_i128_with_scale(10_i128.pow(decimals), 0);
    amount
        .checked_mul(scale)
        .and_then(|units| units.trunc().to_u128())
        .ok_or_else(|| TollgateError::BadRequest(format!("amount {} out of range", amount)))
}

/// Signature over a payment message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPaymentMessage {
    /// Digest that was signed (prefixed if requested)
    pub hash: [u8; 32],
    pub r: [u8; 32],
    pub s: [u8; 32],
    /// Recovery id in the 27/28 convention
    pub v: u8,
    pub prefixed: bool,
}

/// Hex view of a signature, as the contract caller needs it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormattedSignature {
    pub h: String,
    pub r: String,
    pub s: String,
    pub v: u8,
}

impl SignedPaymentMessage {
    pub fn formatted(&self) -> FormattedSignature {
        FormattedSignature {
            h: format!("0x{}", hex::encode(self.hash)),
            r: format!("0x{}", hex::encode(self.r)),
            s: format!("0x{}", hex::encode(self.s)),
            v: self.v,
        }
    }
}

/// Holds the service key that payment contracts trust
pub struct PaymentSigner {
    key: SigningKey,
}

impl PaymentSigner {
    /// Load a key from hex (with or without `0x`)
    pub fn from_hex(key_hex: &str) -> Result<Self> {
        let trimmed = key_hex.trim();
        let raw = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let bytes = Zeroizing::new(
            hex::decode(raw).map_err(|e| TollgateError::Config(format!("SIGNER_KEY is not hex: {}", e)))?,
        );
        let key = SigningKey::from_slice(&bytes)
            .map_err(|e| TollgateError::Config(format!("SIGNER_KEY is not a valid secp256k1 key: {}", e)))?;
        Ok(Self { key })
    }

    /// Fresh random key, for dev mode only
    pub fn random() -> Self {
        Self {
            key: SigningKey::random(&mut rand::rngs::OsRng),
        }
    }

    /// Address the contract checks signatures against
    pub fn address(&self) -> Address {
        let point = self.key.verifying_key().to_encoded_point(false);
        let digest = keccak256(&point.as_bytes()[1..]);
        let mut address = [0u8; 20];
        address.copy_from_slice(&digest[12..]);
        Address(address)
    }

    pub fn sign(
        &self,
        address: &Address,
        number: u64,
        method: PaymentMethod,
        amount: u128,
        prefixed: bool,
    ) -> Result<SignedPaymentMessage> {
        let mut hash = payment_hash(address, number, method, amount);
        if prefixed {
            hash = prefixed_hash(&hash);
        }
        let (signature, recovery): (Signature, RecoveryId) = self.key.sign_prehash_recoverable(&hash)?;
        Ok(SignedPaymentMessage {
            hash,
            r: signature.r().to_bytes().into(),
            s: signature.s().to_bytes().into(),
            v: recovery.to_byte() + 27,
            prefixed,
        })
    }
}

impl fmt::Debug for PaymentSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaymentSigner")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::VerifyingKey;

    const KEY_ONE: &str = "0x0000000000000000000000000000000000000000000000000000000000000001";

    fn payer() -> Address {
        "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf".parse().unwrap()
    }

    #[test]
    fn test_keccak_empty() {
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_address_of_key_one() {
        let signer = PaymentSigner::from_hex(KEY_ONE).unwrap();
        assert_eq!(signer.address(), payer());
        assert_eq!(
            signer.address().to_string(),
            "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
    }

    #[test]
    fn test_packed_layout() {
        let packed = pack_payment(&payer(), 5, PaymentMethod::Ether, 0x0102);
        assert_eq!(packed.len(), 85);
        assert_eq!(&packed[..20], &payer().0);
        assert_eq!(packed[51], 5);
        assert!(packed[20..51].iter().all(|b| *b == 0));
        assert_eq!(packed[52], 1);
        assert_eq!(&packed[83..], &[0x01, 0x02]);
    }

    #[test]
    fn test_signing_is_deterministic() {
        let signer = PaymentSigner::from_hex(KEY_ONE).unwrap();
        let a = signer.sign(&payer(), 7, PaymentMethod::Token, 1_000, true).unwrap();
        let b = signer.sign(&payer(), 7, PaymentMethod::Token, 1_000, true).unwrap();
        assert_eq!(a, b);
        assert!(a.v == 27 || a.v == 28);
    }

    #[test]
    fn test_each_input_changes_hash() {
        let base = payment_hash(&payer(), 7, PaymentMethod::Token, 1_000);
        let other: Address = "0x0000000000000000000000000000000000000001".parse().unwrap();
        assert_ne!(base, payment_hash(&other, 7, PaymentMethod::Token, 1_000));
        assert_ne!(base, payment_hash(&payer(), 8, PaymentMethod::Token, 1_000));
        assert_ne!(base, payment_hash(&payer(), 7, PaymentMethod::Ether, 1_000));
        assert_ne!(base, payment_hash(&payer(), 7, PaymentMethod::Token, 1_001));
    }

    #[test]
    fn test_signature_recovers_signer() {
        let signer = PaymentSigner::from_hex(KEY_ONE).unwrap();
        for prefixed in [false, true] {
            let signed = signer.sign(&payer(), 3, PaymentMethod::Ether, 42, prefixed).unwrap();

            let mut rs = [0u8; 64];
            rs[..32].copy_from_slice(&signed.r);
            rs[32..].copy_from_slice(&signed.s);
            let signature = Signature::from_slice(&rs).unwrap();
            let recovery = RecoveryId::from_byte(signed.v - 27).unwrap();

            let recovered = VerifyingKey::recover_from_prehash(&signed.hash, &signature, recovery).unwrap();
            assert_eq!(&recovered, signer.key.verifying_key());
        }
    }

    #[test]
    fn test_prefixed_hash_differs() {
        let hash = payment_hash(&payer(), 1, PaymentMethod::Token, 1);
        assert_ne!(hash, prefixed_hash(&hash));
    }

    #[test]
    fn test_formatted_hex() {
        let signer = PaymentSigner::from_hex(KEY_ONE).unwrap();
        let formatted = signer.sign(&payer(), 1, PaymentMethod::Token, 1, true).unwrap().formatted();
        assert!(formatted.h.starts_with("0x"));
        assert_eq!(formatted.r.len(), 66);
        assert_eq!(formatted.s.len(), 66);
    }

    #[test]
    fn test_base_units() {
        assert_eq!(to_base_units(Decimal::new(15, 1), 18).unwrap(), 1_500_000_000_000_000_000);
        assert_eq!(to_base_units(Decimal::new(1, 8), 8).unwrap(), 1);
        assert!(to_base_units(Decimal::from(-1), 18).is_err());
    }

    #[test]
    fn test_bad_keys() {
        assert!(PaymentSigner::from_hex("zz").is_err());
        assert!(PaymentSigner::from_hex("0x00").is_err());
        assert!(PaymentMethod::from_tag(2).is_err());
    }
}
