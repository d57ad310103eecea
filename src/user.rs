//! Per-user orchestrator.
//!
//! Each local user owns a cache of active Double Ratchet sessions, a FIFO
//! of encryption requests waiting on a key-bundle fetch, and one mutex
//! guarding both. The mutex is never held across a server post or a user
//! callback: an encrypt that needs bundles returns immediately and
//! completes later on the transport thread, draining the queue in order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::crypto::{aead_open, aead_seal, generate_random_seed, hkdf_sha512, IdentityKey};
use crate::error::{Error, Result};
use crate::ratchet::DrSession;
use crate::settings;
use crate::store::{LocalUserRecord, Store, PEER_STATUS_UNTRUSTED};
use crate::types::{
    Callback, CallbackReturn, CurveId, EncryptionContext, EncryptionPolicy, PeerDeviceStatus,
    ServerPost,
};
use crate::wire::{DrHeader, PeerBundle};
use crate::x3dh;

/// An encrypt call parked behind an in-flight bundle fetch.
pub(crate) struct PendingEncrypt {
    pub(crate) ctx: Arc<Mutex<EncryptionContext>>,
    pub(crate) callback: Callback,
}

struct UserState {
    cache: HashMap<String, DrSession>,
    queue: VecDeque<PendingEncrypt>,
    /// A bundle fetch is in flight; new encrypts must queue behind it.
    ongoing: bool,
}

pub(crate) struct UserHandle {
    pub(crate) uid: i64,
    pub(crate) device_id: String,
    pub(crate) curve: CurveId,
    pub(crate) identity: IdentityKey,
    pub(crate) server_url: Mutex<String>,
    pub(crate) store: Arc<Store>,
    pub(crate) post: ServerPost,
    state: Mutex<UserState>,
}

impl UserHandle {
    pub(crate) fn new(record: LocalUserRecord, store: Arc<Store>, post: ServerPost) -> Result<Self> {
        let identity = IdentityKey::from_blob(&record.ik_blob)?;
        Ok(Self {
            uid: record.uid,
            device_id: record.device_id,
            curve: record.curve,
            identity,
            server_url: Mutex::new(record.server_url),
            store,
            post,
            state: Mutex::new(UserState {
                cache: HashMap::new(),
                queue: VecDeque::new(),
                ongoing: false,
            }),
        })
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, UserState>> {
        self.state
            .lock()
            .map_err(|_| Error::StorageFail("user state lock poisoned".to_string()))
    }

    /* ---------------------------- encrypt ---------------------------- */

    pub(crate) fn encrypt(self: &Arc<Self>, ctx: Arc<Mutex<EncryptionContext>>, callback: Callback) {
        let missing = {
            let mut state = match self.lock_state() {
                Ok(state) => state,
                Err(err) => {
                    callback(CallbackReturn::Fail, err.to_string());
                    return;
                }
            };
            let mut ctx_guard = match lock_ctx(&ctx) {
                Ok(guard) => guard,
                Err(err) => {
                    drop(state);
                    callback(CallbackReturn::Fail, err.to_string());
                    return;
                }
            };
            mark_duplicates(&mut ctx_guard);

            match self.gather_sessions(&mut state, &mut ctx_guard) {
                Err(err) => {
                    drop(ctx_guard);
                    drop(state);
                    callback(CallbackReturn::Fail, err.to_string());
                    return;
                }
                Ok(missing) if missing.is_empty() => {
                    let (status, detail) = self.run_encryption(&mut state, &mut ctx_guard);
                    drop(ctx_guard);
                    drop(state);
                    callback(status, detail);
                    self.pump_queue();
                    return;
                }
                Ok(missing) => {
                    if state.ongoing {
                        // Someone is already waiting on the server; keep
                        // strict arrival order behind them.
                        state.queue.push_back(PendingEncrypt {
                            ctx: ctx.clone(),
                            callback,
                        });
                        return;
                    }
                    state.ongoing = true;
                    missing
                }
            }
        };
        x3dh::fetch_peer_bundles(self.clone(), missing, PendingEncrypt { ctx, callback });
    }

    /// Resolves a session for every non-failed recipient from cache or
    /// store, snapshots trust statuses, and lists the devices that still
    /// need a key bundle.
    fn gather_sessions(
        &self,
        state: &mut UserState,
        ctx: &mut EncryptionContext,
    ) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for recipient in ctx.recipients.iter_mut() {
            if recipient.status == PeerDeviceStatus::Fail {
                continue;
            }

            let mut have_session = false;
            if let Some(session) = state.cache.get_mut(&recipient.device_id) {
                if session.active && !session.sending_chain_exhausted() {
                    have_session = true;
                } else {
                    if session.sending_chain_exhausted() {
                        // Sent too long with no reply: force a fresh key
                        // agreement.
                        session.active = false;
                        self.store.update_session(&session.to_row())?;
                    }
                    state.cache.remove(&recipient.device_id);
                }
            }

            let peer = self.store.load_peer(&recipient.device_id)?;
            recipient.status = peer
                .as_ref()
                .map(|p| p.trust_status())
                .unwrap_or(PeerDeviceStatus::Unknown);

            if !have_session {
                if let Some(peer) = &peer {
                    if let Some(row) = self.store.load_active_session(self.uid, peer.did)? {
                        let session =
                            DrSession::from_row(row, self.curve, &recipient.device_id)?;
                        if session.sending_chain_exhausted() {
                            self.store.stale_session(session.id)?;
                        } else {
                            state.cache.insert(recipient.device_id.clone(), session);
                            have_session = true;
                        }
                    }
                }
            }
            if !have_session {
                missing.push(recipient.device_id.clone());
            }
        }
        Ok(missing)
    }

    /// Encrypts for every recipient holding an active cached session;
    /// recipients without one fail individually.
    fn run_encryption(
        &self,
        state: &mut UserState,
        ctx: &mut EncryptionContext,
    ) -> (CallbackReturn, String) {
        let mut eligible = Vec::new();
        for (index, recipient) in ctx.recipients.iter_mut().enumerate() {
            if recipient.status == PeerDeviceStatus::Fail {
                continue;
            }
            match state.cache.get(&recipient.device_id) {
                Some(session) if session.active => eligible.push(index),
                _ => recipient.status = PeerDeviceStatus::Fail,
            }
        }

        if eligible.is_empty() {
            return (
                CallbackReturn::Fail,
                "all recipients failed to provide a usable session".to_string(),
            );
        }

        let direct = choose_direct_scheme(ctx.policy, eligible.len(), ctx.plaintext.len());
        debug!(
            device = %self.device_id,
            recipients = eligible.len(),
            direct,
            "encrypting"
        );

        let mut payload = ctx.plaintext.clone();
        ctx.cipher_message.clear();
        if !direct {
            let seed = match generate_random_seed() {
                Ok(seed) => seed,
                Err(err) => return (CallbackReturn::Fail, err.to_string()),
            };
            match seal_cipher_message(
                &seed,
                &ctx.plaintext,
                &ctx.recipient_user_id,
                &self.device_id,
            ) {
                Ok(sealed) => ctx.cipher_message = sealed,
                Err(err) => return (CallbackReturn::Fail, err.to_string()),
            }
            payload = seed.to_vec();
        }

        let aad_user = ctx.recipient_user_id.clone().into_bytes();
        let mut any_success = false;
        for index in eligible {
            let recipient = &mut ctx.recipients[index];
            let session = state
                .cache
                .get_mut(&recipient.device_id)
                .expect("session gathered above");
            let outcome = session.encrypt(&payload, direct, &aad_user).and_then(|message| {
                self.store.update_session(&session.to_row())?;
                Ok(message)
            });
            match outcome {
                Ok(message) => {
                    recipient.dr_message = message;
                    any_success = true;
                }
                Err(err) => {
                    warn!(device = %self.device_id, peer = %recipient.device_id, %err,
                          "per-recipient encryption failed");
                    recipient.status = PeerDeviceStatus::Fail;
                }
            }
        }
        payload.zeroize();

        if any_success {
            (CallbackReturn::Success, String::new())
        } else {
            ctx.cipher_message.clear();
            (
                CallbackReturn::Fail,
                "all recipients failed to provide a usable session".to_string(),
            )
        }
    }

    /// Runs on the transport thread once the bundle fetch answered (or
    /// failed): builds sessions, finishes the waiting encrypt, then
    /// drains the queue.
    pub(crate) fn complete_fetch(
        self: &Arc<Self>,
        missing: Vec<String>,
        result: Result<Vec<PeerBundle>>,
        pending: PendingEncrypt,
    ) {
        let mut built = Vec::new();
        let mut failures: Vec<String> = Vec::new();

        match result {
            Ok(bundles) => {
                let answered: HashSet<&String> =
                    bundles.iter().map(|b| &b.device_id).collect();
                for device in &missing {
                    if !answered.contains(device) {
                        failures.push(device.clone());
                    }
                }
                for bundle in &bundles {
                    let session = x3dh::build_initiator_session(self, bundle)
                        .and_then(|mut session| {
                            session.id = self.store.insert_session(&session.to_row())?;
                            Ok(session)
                        });
                    match session {
                        Ok(session) => built.push(session),
                        Err(err) => {
                            warn!(device = %self.device_id, peer = %bundle.device_id, %err,
                                  "session establishment failed");
                            failures.push(bundle.device_id.clone());
                        }
                    }
                }
            }
            Err(err) => {
                warn!(device = %self.device_id, %err, "bundle fetch failed");
                failures = missing;
            }
        }

        let finish = (|| -> Result<(CallbackReturn, String)> {
            let mut state = self.lock_state()?;
            let mut ctx = lock_ctx(&pending.ctx)?;
            for session in built.drain(..) {
                state.cache.insert(session.peer_device_id.clone(), session);
            }
            for device in &failures {
                for recipient in ctx.recipients.iter_mut() {
                    if &recipient.device_id == device {
                        recipient.status = PeerDeviceStatus::Fail;
                    }
                }
            }
            Ok(self.run_encryption(&mut state, &mut ctx))
        })();

        let (status, detail) = match finish {
            Ok(outcome) => outcome,
            Err(err) => (CallbackReturn::Fail, err.to_string()),
        };
        (pending.callback)(status, detail);

        if let Ok(mut state) = self.lock_state() {
            state.ongoing = false;
        }
        self.pump_queue();
    }

    fn pump_queue(self: &Arc<Self>) {
        loop {
            let pending = {
                let Ok(mut state) = self.lock_state() else { return };
                if state.ongoing {
                    return;
                }
                match state.queue.pop_front() {
                    Some(pending) => pending,
                    None => return,
                }
            };
            self.encrypt(pending.ctx, pending.callback);
        }
    }

    /* ---------------------------- decrypt ---------------------------- */

    /// Tries the cached session, then every stored session for the peer,
    /// then a fresh responder session if the message carries an X3DH
    /// initiation. Returns the sender's trust status as observed when
    /// decryption succeeded, or `Fail` with no plaintext produced.
    pub(crate) fn decrypt(
        &self,
        recipient_user_id: &str,
        sender_device_id: &str,
        dr_message: &[u8],
        cipher_message: &[u8],
        plaintext: &mut Vec<u8>,
    ) -> Result<PeerDeviceStatus> {
        let Ok((header, header_len)) = DrHeader::parse(dr_message) else {
            return Ok(PeerDeviceStatus::Fail);
        };
        if header.curve != self.curve {
            return Ok(PeerDeviceStatus::Fail);
        }

        // Snapshot before any side effect: a first contact reports
        // `unknown` even though success inserts the peer row.
        let snapshot = self
            .store
            .load_peer(sender_device_id)?
            .map(|p| p.trust_status())
            .unwrap_or(PeerDeviceStatus::Unknown);

        let mut state = self.lock_state()?;

        let mut cached_id = 0;
        if let Some(session) = state.cache.get_mut(sender_device_id) {
            cached_id = session.id;
            match session.decrypt(
                &self.store,
                dr_message,
                &header,
                header_len,
                recipient_user_id.as_bytes(),
            ) {
                Ok(payload) => {
                    self.store.update_session(&session.to_row())?;
                    drop(state);
                    return self.unwrap_payload(
                        &header,
                        payload,
                        cipher_message,
                        recipient_user_id,
                        sender_device_id,
                        snapshot,
                        plaintext,
                    );
                }
                Err(_) => {
                    // The stored copy is untouched; some other session may
                    // match, so drop the cache entry and keep looking.
                    state.cache.remove(sender_device_id);
                }
            }
        }

        if let Some(peer) = self.store.load_peer(sender_device_id)? {
            for row in self.store.load_sessions(self.uid, peer.did, cached_id)? {
                let was_active = row.active;
                let Ok(mut session) = DrSession::from_row(row, self.curve, sender_device_id)
                else {
                    continue;
                };
                let attempt = session.decrypt(
                    &self.store,
                    dr_message,
                    &header,
                    header_len,
                    recipient_user_id.as_bytes(),
                );
                if let Ok(payload) = attempt {
                    // The winning session becomes the active one; any
                    // previously active session for this peer goes stale.
                    if !was_active {
                        self.store.stale_sessions(self.uid, peer.did)?;
                        session.active = true;
                    }
                    self.store.update_session(&session.to_row())?;
                    state.cache.insert(sender_device_id.to_string(), session);
                    drop(state);
                    return self.unwrap_payload(
                        &header,
                        payload,
                        cipher_message,
                        recipient_user_id,
                        sender_device_id,
                        snapshot,
                        plaintext,
                    );
                }
            }
        }

        // Last resort: a fresh responder session from the X3DH payload. A
        // failure here discards the transient session without persisting
        // anything.
        if let Some(init) = &header.x3dh_init {
            match x3dh::build_responder_session(self, init, sender_device_id) {
                Err(err) => {
                    debug!(device = %self.device_id, peer = %sender_device_id, %err,
                           "cannot build responder session");
                }
                Ok(mut session) => {
                    if let Ok(payload) = session.decrypt(
                        &self.store,
                        dr_message,
                        &header,
                        header_len,
                        recipient_user_id.as_bytes(),
                    ) {
                        session.did = match self.store.load_peer(sender_device_id)? {
                            Some(peer) => {
                                if peer.ik.is_empty() {
                                    self.store.fill_peer_ik(peer.did, &init.ik)?;
                                }
                                peer.did
                            }
                            None => self.store.insert_peer(
                                sender_device_id,
                                &init.ik,
                                PEER_STATUS_UNTRUSTED,
                                self.curve as u8,
                            )?,
                        };
                        session.id = self.store.insert_session(&session.to_row())?;
                        session.flush_pending_skipped(&self.store)?;
                        // The one-time prekey served its single use.
                        if let Some(opk_id) = init.opk_id {
                            self.store.delete_opk(self.uid, opk_id)?;
                        }
                        state.cache.insert(sender_device_id.to_string(), session);
                        drop(state);
                        return self.unwrap_payload(
                            &header,
                            payload,
                            cipher_message,
                            recipient_user_id,
                            sender_device_id,
                            snapshot,
                            plaintext,
                        );
                    }
                }
            }
        }

        Ok(PeerDeviceStatus::Fail)
    }

    /// Turns the session payload into the plaintext: either it is the
    /// plaintext, or it seeds the key unsealing the shared cipher message.
    #[allow(clippy::too_many_arguments)]
    fn unwrap_payload(
        &self,
        header: &DrHeader,
        payload: Vec<u8>,
        cipher_message: &[u8],
        recipient_user_id: &str,
        sender_device_id: &str,
        snapshot: PeerDeviceStatus,
        plaintext: &mut Vec<u8>,
    ) -> Result<PeerDeviceStatus> {
        if header.payload_direct {
            *plaintext = payload;
            return Ok(snapshot);
        }
        let seed: [u8; settings::DR_RANDOM_SEED_SIZE] = match payload.as_slice().try_into() {
            Ok(seed) => seed,
            Err(_) => return Ok(PeerDeviceStatus::Fail),
        };
        match open_cipher_message(&seed, cipher_message, recipient_user_id, sender_device_id) {
            Ok(opened) => {
                *plaintext = opened;
                Ok(snapshot)
            }
            Err(_) => Ok(PeerDeviceStatus::Fail),
        }
    }

    /* ------------------------- session control ------------------------ */

    /// Marks every active session with the peer stale; the next encrypt
    /// will run a fresh key agreement.
    pub(crate) fn stale_peer_sessions(&self, peer_device_id: &str) -> Result<()> {
        if let Some(peer) = self.store.load_peer(peer_device_id)? {
            self.store.stale_sessions(self.uid, peer.did)?;
        }
        if let Ok(mut state) = self.lock_state() {
            state.cache.remove(peer_device_id);
        }
        Ok(())
    }

    /// Drops a peer's cached session, e.g. after the peer row was deleted.
    pub(crate) fn forget_peer(&self, peer_device_id: &str) {
        if let Ok(mut state) = self.lock_state() {
            state.cache.remove(peer_device_id);
        }
    }

    pub(crate) fn set_server_url(&self, url: &str) -> Result<()> {
        self.store.set_user_server_url(self.uid, url)?;
        if let Ok(mut guard) = self.server_url.lock() {
            *guard = url.to_string();
        }
        Ok(())
    }
}

fn lock_ctx(ctx: &Arc<Mutex<EncryptionContext>>) -> Result<MutexGuard<'_, EncryptionContext>> {
    ctx.lock()
        .map_err(|_| Error::StorageFail("encryption context lock poisoned".to_string()))
}

/// Later occurrences of an already-listed device fail outright.
fn mark_duplicates(ctx: &mut EncryptionContext) {
    let mut seen = HashSet::new();
    for recipient in ctx.recipients.iter_mut() {
        if !seen.insert(recipient.device_id.clone()) {
            recipient.status = PeerDeviceStatus::Fail;
        }
    }
}

/// The direct scheme wins while per-recipient duplication of the payload
/// stays below the cipher-message overhead for the policy's cost model.
fn choose_direct_scheme(policy: EncryptionPolicy, recipients: usize, plaintext_len: usize) -> bool {
    let crossover = match policy {
        EncryptionPolicy::DRMessage => return true,
        EncryptionPolicy::CipherMessage => return false,
        EncryptionPolicy::OptimizeUploadSize => settings::POLICY_UPLOAD_CROSSOVER,
        EncryptionPolicy::OptimizeGlobalBandwidth => settings::POLICY_GLOBAL_CROSSOVER,
    };
    plaintext_len * (recipients.saturating_sub(1)) < crossover.0 * recipients + crossover.1
}

fn cipher_message_ad(recipient_user_id: &str, sender_device_id: &str) -> Vec<u8> {
    let mut ad = Vec::with_capacity(recipient_user_id.len() + sender_device_id.len());
    ad.extend_from_slice(recipient_user_id.as_bytes());
    ad.extend_from_slice(sender_device_id.as_bytes());
    ad
}

fn seed_key_material(seed: &[u8; settings::DR_RANDOM_SEED_SIZE]) -> Result<([u8; 32], [u8; 12])> {
    let mut okm = [0u8; settings::DR_MESSAGE_KEY_SIZE];
    hkdf_sha512(&[0u8; 64], seed, settings::HKDF_SEED_INFO, &mut okm)?;
    let key: [u8; 32] = okm[..32].try_into().expect("fixed split");
    let nonce: [u8; 12] = okm[32..].try_into().expect("fixed split");
    okm.zeroize();
    Ok((key, nonce))
}

fn seal_cipher_message(
    seed: &[u8; settings::DR_RANDOM_SEED_SIZE],
    plaintext: &[u8],
    recipient_user_id: &str,
    sender_device_id: &str,
) -> Result<Vec<u8>> {
    let (mut key, nonce) = seed_key_material(seed)?;
    let sealed = aead_seal(
        &key,
        &nonce,
        &cipher_message_ad(recipient_user_id, sender_device_id),
        plaintext,
    );
    key.zeroize();
    sealed
}

fn open_cipher_message(
    seed: &[u8; settings::DR_RANDOM_SEED_SIZE],
    cipher_message: &[u8],
    recipient_user_id: &str,
    sender_device_id: &str,
) -> Result<Vec<u8>> {
    let (mut key, nonce) = seed_key_material(seed)?;
    let opened = aead_open(
        &key,
        &nonce,
        &cipher_message_ad(recipient_user_id, sender_device_id),
        cipher_message,
    );
    key.zeroize();
    opened
}
