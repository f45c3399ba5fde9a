/*!
 * Key type and signing algorithm mapping
 *
 * Translates between the caller's key-type vocabulary and the key-custody
 * backend's key specifications, and picks the backend signing algorithm for a
 * key type and the caller's signing options.
 */

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{error_codes, KmsError, KmsResult};

/// Key types a caller can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    /// No key type given
    Unspecified,

    /// RSA 1024, recognized but never generated
    Rsa1024,

    /// RSA 2048
    Rsa2048,

    /// RSA 4096
    Rsa4096,

    /// ECDSA on NIST P-256
    EcP256,

    /// ECDSA on NIST P-384
    EcP384,
}

impl KeyType {
    /// Key types the backend can hold
    pub const SUPPORTED: [KeyType; 4] = [
        KeyType::Rsa2048,
        KeyType::Rsa4096,
        KeyType::EcP256,
        KeyType::EcP384,
    ];

    pub fn is_rsa(self) -> bool {
        matches!(self, KeyType::Rsa1024 | KeyType::Rsa2048 | KeyType::Rsa4096)
    }

    pub fn is_ec(self) -> bool {
        matches!(self, KeyType::EcP256 | KeyType::EcP384)
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyType::Unspecified => "UNSPECIFIED",
            KeyType::Rsa1024 => "RSA-1024",
            KeyType::Rsa2048 => "RSA-2048",
            KeyType::Rsa4096 => "RSA-4096",
            KeyType::EcP256 => "EC-P256",
            KeyType::EcP384 => "EC-P384",
        };
        f.write_str(name)
    }
}

/// Key specifications as named by the backend
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeySpec {
    Rsa2048,
    Rsa3072,
    Rsa4096,
    EccNistP256,
    EccNistP384,
    EccNistP521,
    EccSecgP256k1,
    SymmetricDefault,
    /// A spec this crate has no name for
    Other(String),
}

impl KeySpec {
    /// Canonical backend name
    pub fn as_str(&self) -> &str {
        match self {
            KeySpec::Rsa2048 => "RSA_2048",
            KeySpec::Rsa3072 => "RSA_3072",
            KeySpec::Rsa4096 => "RSA_4096",
            KeySpec::EccNistP256 => "ECC_NIST_P256",
            KeySpec::EccNistP384 => "ECC_NIST_P384",
            KeySpec::EccNistP521 => "ECC_NIST_P521",
            KeySpec::EccSecgP256k1 => "ECC_SECG_P256K1",
            KeySpec::SymmetricDefault => "SYMMETRIC_DEFAULT",
            KeySpec::Other(name) => name,
        }
    }
}

impl fmt::Display for KeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeySpec {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "RSA_2048" => KeySpec::Rsa2048,
            "RSA_3072" => KeySpec::Rsa3072,
            "RSA_4096" => KeySpec::Rsa4096,
            "ECC_NIST_P256" => KeySpec::EccNistP256,
            "ECC_NIST_P384" => KeySpec::EccNistP384,
            "ECC_NIST_P521" => KeySpec::EccNistP521,
            "ECC_SECG_P256K1" => KeySpec::EccSecgP256k1,
            "SYMMETRIC_DEFAULT" => KeySpec::SymmetricDefault,
            other => KeySpec::Other(other.to_string()),
        })
    }
}

/// Permitted use of a backend key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUsage {
    SignVerify,
    EncryptDecrypt,
}

impl KeyUsage {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyUsage::SignVerify => "SIGN_VERIFY",
            KeyUsage::EncryptDecrypt => "ENCRYPT_DECRYPT",
        }
    }
}

/// Map a backend key spec to the caller's key type
pub fn key_type_from_spec(spec: &KeySpec) -> KmsResult<KeyType> {
    match spec {
        KeySpec::Rsa2048 => Ok(KeyType::Rsa2048),
        KeySpec::Rsa4096 => Ok(KeyType::Rsa4096),
        KeySpec::EccNistP256 => Ok(KeyType::EcP256),
        KeySpec::EccNistP384 => Ok(KeyType::EcP384),
        other => Err(KmsError::unsupported(
            other.as_str(),
            "backend key spec has no matching key type",
            error_codes::UNSUPPORTED_KEY_SPEC,
        )),
    }
}

/// Map the caller's key type to a backend key spec
pub fn spec_from_key_type(key_type: KeyType) -> KmsResult<KeySpec> {
    match key_type {
        KeyType::Rsa1024 => Err(KmsError::unsupported(
            "RSA-1024",
            "RSA-1024 keys are too weak and are not supported",
            error_codes::UNSUPPORTED_KEY_TYPE,
        )),
        KeyType::Rsa2048 => Ok(KeySpec::Rsa2048),
        KeyType::Rsa4096 => Ok(KeySpec::Rsa4096),
        KeyType::EcP256 => Ok(KeySpec::EccNistP256),
        KeyType::EcP384 => Ok(KeySpec::EccNistP384),
        KeyType::Unspecified => Err(KmsError::unsupported(
            "UNSPECIFIED",
            "unknown and unsupported key type",
            error_codes::UNSUPPORTED_KEY_TYPE,
        )),
    }
}

/// Hash functions a caller may have applied to the digest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// Output size in bytes
    pub fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }
}

/// How the caller wants the digest signed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignerOpts {
    /// PKCS#1 v1.5 for RSA keys, ECDSA for EC keys
    Hash(HashAlgorithm),

    /// RSASSA-PSS; RSA keys only
    Pss {
        hash: HashAlgorithm,
        salt_length: i32,
    },
}

impl SignerOpts {
    pub fn hash(&self) -> HashAlgorithm {
        match self {
            SignerOpts::Hash(hash) => *hash,
            SignerOpts::Pss { hash, .. } => *hash,
        }
    }
}

impl Default for SignerOpts {
    fn default() -> Self {
        SignerOpts::Hash(HashAlgorithm::Sha256)
    }
}

/// Backend signing algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SigningAlgorithm {
    RsassaPssSha256,
    RsassaPssSha384,
    RsassaPssSha512,
    RsassaPkcs1V15Sha256,
    RsassaPkcs1V15Sha384,
    RsassaPkcs1V15Sha512,
    EcdsaSha256,
    EcdsaSha384,
    EcdsaSha512,
}

impl SigningAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            SigningAlgorithm::RsassaPssSha256 => "RSASSA_PSS_SHA_256",
            SigningAlgorithm::RsassaPssSha384 => "RSASSA_PSS_SHA_384",
            SigningAlgorithm::RsassaPssSha512 => "RSASSA_PSS_SHA_512",
            SigningAlgorithm::RsassaPkcs1V15Sha256 => "RSASSA_PKCS1_V1_5_SHA_256",
            SigningAlgorithm::RsassaPkcs1V15Sha384 => "RSASSA_PKCS1_V1_5_SHA_384",
            SigningAlgorithm::RsassaPkcs1V15Sha512 => "RSASSA_PKCS1_V1_5_SHA_512",
            SigningAlgorithm::EcdsaSha256 => "ECDSA_SHA_256",
            SigningAlgorithm::EcdsaSha384 => "ECDSA_SHA_384",
            SigningAlgorithm::EcdsaSha512 => "ECDSA_SHA_512",
        }
    }

    /// Hash the digest must have been produced with
    pub fn hash(self) -> HashAlgorithm {
        match self {
            SigningAlgorithm::RsassaPssSha256
            | SigningAlgorithm::RsassaPkcs1V15Sha256
            | SigningAlgorithm::EcdsaSha256 => HashAlgorithm::Sha256,
            SigningAlgorithm::RsassaPssSha384
            | SigningAlgorithm::RsassaPkcs1V15Sha384
            | SigningAlgorithm::EcdsaSha384 => HashAlgorithm::Sha384,
            SigningAlgorithm::RsassaPssSha512
            | SigningAlgorithm::RsassaPkcs1V15Sha512
            | SigningAlgorithm::EcdsaSha512 => HashAlgorithm::Sha512,
        }
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Select the backend signing algorithm for a key type and signing options
///
/// RSA keys take any of the three hashes with either padding scheme. EC keys
/// only sign with the ECDSA variant matching their curve, so a P-256 key needs
/// a SHA-256 digest and a P-384 key a SHA-384 digest.
pub fn signing_algorithm(key_type: KeyType, opts: &SignerOpts) -> KmsResult<SigningAlgorithm> {
    let mismatch = || {
        KmsError::unsupported(
            &format!("{:?} with {}", opts, key_type),
            "signing options are not compatible with the key type",
            error_codes::UNSUPPORTED_SIGNING_OPTIONS,
        )
    };

    match (key_type, *opts) {
        (KeyType::Rsa2048 | KeyType::Rsa4096, SignerOpts::Hash(hash)) => Ok(match hash {
            HashAlgorithm::Sha256 => SigningAlgorithm::RsassaPkcs1V15Sha256,
            HashAlgorithm::Sha384 => SigningAlgorithm::RsassaPkcs1V15Sha384,
            HashAlgorithm::Sha512 => SigningAlgorithm::RsassaPkcs1V15Sha512,
        }),
        (KeyType::Rsa2048 | KeyType::Rsa4096, SignerOpts::Pss { hash, .. }) => Ok(match hash {
            HashAlgorithm::Sha256 => SigningAlgorithm::RsassaPssSha256,
            HashAlgorithm::Sha384 => SigningAlgorithm::RsassaPssSha384,
            HashAlgorithm::Sha512 => SigningAlgorithm::RsassaPssSha512,
        }),
        (KeyType::EcP256, SignerOpts::Hash(HashAlgorithm::Sha256)) => {
            Ok(SigningAlgorithm::EcdsaSha256)
        }
        (KeyType::EcP384, SignerOpts::Hash(HashAlgorithm::Sha384)) => {
            Ok(SigningAlgorithm::EcdsaSha384)
        }
        (KeyType::EcP256 | KeyType::EcP384, _) => Err(mismatch()),
        (KeyType::Rsa1024 | KeyType::Unspecified, _) => {
            Err(spec_from_key_type(key_type).err().unwrap_or_else(mismatch))
        }
    }
}
