use std::sync::Arc;

use crate::error::{Error, Result};

/// Algorithm suite a local user is created with, pinned for its lifetime.
///
/// The numeric codes are stored in databases and exchanged with
/// key-distribution servers; they must never be renumbered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CurveId {
    /// X25519 / Ed25519
    C25519 = 1,
    /// X448 / Ed448
    C448 = 2,
    /// X25519 / Ed25519 hybridised with the Kyber512 KEM
    C25519K512 = 3,
    /// X25519 / Ed25519 hybridised with ML-KEM-512
    C25519Mlk512 = 4,
    /// X448 / Ed448 hybridised with ML-KEM-1024
    C448Mlk1024 = 5,
}

impl CurveId {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::C25519),
            2 => Ok(Self::C448),
            3 => Ok(Self::C25519K512),
            4 => Ok(Self::C25519Mlk512),
            5 => Ok(Self::C448Mlk1024),
            other => Err(Error::InvalidArgument(format!(
                "unknown algorithm id {other}"
            ))),
        }
    }

    /// Whether this build can instantiate users on this algorithm.
    pub fn is_supported(self) -> bool {
        match self {
            Self::C25519 => true,
            #[cfg(feature = "pq")]
            Self::C25519Mlk512 => true,
            _ => false,
        }
    }

    /// True for the KEM-augmented suites.
    pub(crate) fn is_kem(self) -> bool {
        matches!(self, Self::C25519K512 | Self::C25519Mlk512 | Self::C448Mlk1024)
    }

    /// Size of a public identity (signature) key on the wire.
    pub(crate) fn ik_size(self) -> usize {
        match self {
            Self::C25519 | Self::C25519K512 | Self::C25519Mlk512 => 32,
            Self::C448 | Self::C448Mlk1024 => 57,
        }
    }

    /// Size of a Diffie-Hellman public key on the wire, including the KEM
    /// public key for the hybrid suites.
    pub(crate) fn x_pub_size(self) -> usize {
        match self {
            Self::C25519 => 32,
            Self::C448 => 56,
            Self::C25519K512 | Self::C25519Mlk512 => 832,
            Self::C448Mlk1024 => 1624,
        }
    }

    /// Size of an identity signature on the wire.
    pub(crate) fn sig_size(self) -> usize {
        match self {
            Self::C25519 | Self::C25519K512 | Self::C25519Mlk512 => 64,
            Self::C448 | Self::C448Mlk1024 => 114,
        }
    }

    /// Size of a KEM ciphertext on the wire, zero for the pure-EC suites.
    pub(crate) fn kem_ct_size(self) -> usize {
        match self {
            Self::C25519 | Self::C448 => 0,
            Self::C25519K512 | Self::C25519Mlk512 => 768,
            Self::C448Mlk1024 => 1568,
        }
    }
}

/// Trust the local user places in a peer device.
///
/// `Unknown` and `Fail` are query results only, never stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerDeviceStatus {
    /// Peer device not present in the local store.
    Unknown,
    /// Known device whose identity key has not been verified out of band.
    Untrusted,
    /// Identity key verified by the user.
    Trusted,
    /// Flagged compromised; only an explicit trust restore clears it.
    Unsafe,
    /// The requested operation failed for this device.
    Fail,
}

impl PeerDeviceStatus {
    /// Combined status of a set of devices: the minimum in the lattice
    /// unsafe < unknown < untrusted < trusted.
    pub fn combine(statuses: impl IntoIterator<Item = PeerDeviceStatus>) -> PeerDeviceStatus {
        let mut combined = PeerDeviceStatus::Trusted;
        for status in statuses {
            let rank = |s: PeerDeviceStatus| match s {
                PeerDeviceStatus::Unsafe | PeerDeviceStatus::Fail => 0,
                PeerDeviceStatus::Unknown => 1,
                PeerDeviceStatus::Untrusted => 2,
                PeerDeviceStatus::Trusted => 3,
            };
            if rank(status) < rank(combined) {
                combined = status;
            }
        }
        combined
    }
}

/// How the plaintext is carried in the output of `encrypt`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncryptionPolicy {
    /// The plaintext is encrypted separately inside every recipient's
    /// Double Ratchet message; `cipher_message` stays empty.
    DRMessage,
    /// The plaintext is encrypted once under a random key into
    /// `cipher_message`; each Double Ratchet message carries the key.
    CipherMessage,
    /// Pick whichever of the two minimises the uploaded size. Default.
    OptimizeUploadSize,
    /// Pick whichever minimises the total network footprint, counting every
    /// recipient's download of `cipher_message`.
    OptimizeGlobalBandwidth,
}

/// Outcome reported by asynchronous operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackReturn {
    Success,
    Fail,
}

/// Completion callback for operations that may involve the server.
pub type Callback = Box<dyn FnOnce(CallbackReturn, String) + Send + 'static>;

/// Handed to the transport with each post; the transport must invoke it
/// with the HTTP status code and response body, on any thread.
pub type ResponseProcess = Box<dyn FnOnce(u16, Vec<u8>) + Send + 'static>;

/// Posts a request to the key-distribution server:
/// `(url, from_device_id, body, response)`.
pub type ServerPost = Arc<dyn Fn(&str, &str, Vec<u8>, ResponseProcess) + Send + Sync>;

/// One recipient device of an `encrypt` call. `status` and `dr_message`
/// are filled in by the library before the completion callback runs.
#[derive(Debug)]
pub struct RecipientData {
    pub device_id: String,
    pub status: PeerDeviceStatus,
    pub dr_message: Vec<u8>,
}

impl RecipientData {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            status: PeerDeviceStatus::Unknown,
            dr_message: Vec::new(),
        }
    }
}

/// In/out parameter block of an `encrypt` call.
pub struct EncryptionContext {
    /// Intended recipient user; bound into the AEAD associated data.
    pub recipient_user_id: String,
    pub recipients: Vec<RecipientData>,
    pub plaintext: Vec<u8>,
    /// Output of the cipher-message scheme, empty under the direct scheme.
    pub cipher_message: Vec<u8>,
    pub policy: EncryptionPolicy,
}

impl EncryptionContext {
    pub fn new(
        recipient_user_id: impl Into<String>,
        recipients: Vec<RecipientData>,
        plaintext: Vec<u8>,
    ) -> Self {
        Self {
            recipient_user_id: recipient_user_id.into(),
            recipients,
            plaintext,
            cipher_message: Vec::new(),
            policy: EncryptionPolicy::OptimizeUploadSize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_picks_lattice_minimum() {
        use PeerDeviceStatus::*;
        assert_eq!(PeerDeviceStatus::combine([Trusted, Trusted]), Trusted);
        assert_eq!(PeerDeviceStatus::combine([Trusted, Untrusted]), Untrusted);
        assert_eq!(PeerDeviceStatus::combine([Untrusted, Unknown]), Unknown);
        assert_eq!(PeerDeviceStatus::combine([Unknown, Unsafe]), Unsafe);
        assert_eq!(PeerDeviceStatus::combine([]), Trusted);
    }

    #[test]
    fn curve_codes_are_stable() {
        assert_eq!(CurveId::C25519 as u8, 1);
        assert_eq!(CurveId::C448 as u8, 2);
        assert_eq!(CurveId::C25519K512 as u8, 3);
        assert_eq!(CurveId::C25519Mlk512 as u8, 4);
        assert_eq!(CurveId::C448Mlk1024 as u8, 5);
        assert!(CurveId::from_u8(0).is_err());
        assert!(CurveId::from_u8(6).is_err());
    }
}
