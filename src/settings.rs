//! Library-wide constants.
//!
//! Constants marked *frozen* are part of the wire protocol or the on-disk
//! database layout: changing them breaks compatibility with existing
//! databases and key-distribution servers. The rest are tunables.

/// Version byte of the Double Ratchet message header. Frozen.
pub(crate) const DR_PROTOCOL_VERSION: u8 = 0x01;

/// Version byte of the key-distribution server protocol. Frozen.
pub(crate) const X3DH_PROTOCOL_VERSION: u8 = 0x01;

/// On-disk schema version, encoded 0xMMmmpp. Frozen.
pub(crate) const DB_MODULE_VERSION: i64 = 0x00_03_00;

/// Bit set in the local user `curveId` column while the user has not yet
/// been confirmed by the server. Frozen.
pub(crate) const DB_INACTIVE_USER_BIT: i64 = 0x0100;
/// Mask extracting the algorithm code from the `curveId` column. Frozen.
pub(crate) const DB_CURVE_ID_BYTE: i64 = 0x00ff;

/// Root, chain and message keys are all 32 bytes.
pub(crate) const DR_CHAIN_KEY_SIZE: usize = 32;
/// A message key is a 32-byte AEAD key followed by a 12-byte nonce.
pub(crate) const DR_MESSAGE_KEY_SIZE: usize = 44;
/// Random seed carried in each recipient's payload under the
/// cipher-message scheme.
pub(crate) const DR_RANDOM_SEED_SIZE: usize = 32;
/// Skipped receiving chains are indexed by a 96-bit hash of the peer
/// ratchet public key. Frozen (persisted in skipped-key rows).
pub(crate) const DR_PK_INDEX_SIZE: usize = 12;

/// HKDF info for the root key ratchet.
pub(crate) const HKDF_RK_INFO: &[u8] = b"DR Root Chain Key Derivation";
/// HKDF info turning a cipher-message random seed into key material.
pub(crate) const HKDF_SEED_INFO: &[u8] = b"DR Message Key Derivation";
/// HKDF info for the X3DH shared secret.
pub(crate) const HKDF_SK_INFO: &[u8] = b"cachet";
/// HKDF info for the session associated data.
pub(crate) const HKDF_AD_INFO: &[u8] = b"X3DH Associated Data";

/// Messages sent on one chain without any reply before the session is
/// abandoned and a fresh key agreement is forced.
pub(crate) const MAX_SENDING_CHAIN: u32 = 1000;
/// Largest forward jump the receiving chain will bridge in one message.
pub(crate) const MAX_MESSAGE_SKIP: u32 = 1024;
/// Skipped message keys retained per session; the oldest is evicted first.
pub(crate) const MAX_MESSAGES_AFTER_SKIP: u32 = 128;

/// Active signed prekey lifetime before rotation.
pub(crate) const SPK_LIFETIME_DAYS: i64 = 7;
/// Retired signed prekeys are kept this long to serve late key agreements.
pub(crate) const SPK_LIMBO_DAYS: i64 = 30;
/// Dispatched one-time prekeys are kept this long waiting for their
/// initiation message.
pub(crate) const OPK_LIMBO_DAYS: i64 = 30;
/// Stale sessions are kept this long to decrypt late messages.
pub(crate) const DR_SESSION_LIMBO_DAYS: i64 = 30;
/// Skipped keys whose receiving chain is older than this are swept.
pub(crate) const MK_LIMBO_DAYS: i64 = 30;

/// One-time prekeys uploaded when a user is first published.
pub(crate) const OPK_INITIAL_BATCH_SIZE: u16 = 25;
/// One-time prekeys uploaded per replenishment.
pub(crate) const OPK_BATCH_SIZE: u16 = 25;
/// Replenish when the server holds fewer one-time prekeys than this.
pub(crate) const OPK_SERVER_LOW_LIMIT: u16 = 100;

/// Outbound messages on one chain before a KEM ratchet is forced.
#[cfg(feature = "pq")]
pub(crate) const KEM_RATCHET_CHAIN_SIZE: u32 = 50;
/// Seconds since the last KEM ratchet before one is forced.
#[cfg(feature = "pq")]
pub(crate) const MAX_KEM_RATCHET_PERIOD: i64 = 86_400;

/// Crossover constants selecting between the direct and cipher-message
/// encryption schemes: the direct scheme is used while
/// `plaintext_len * (recipients - 1) < c * recipients + t`.
pub(crate) const POLICY_UPLOAD_CROSSOVER: (usize, usize) = (48, 16);
pub(crate) const POLICY_GLOBAL_CROSSOVER: (usize, usize) = (112, 16);

pub(crate) const SECONDS_PER_DAY: i64 = 86_400;
