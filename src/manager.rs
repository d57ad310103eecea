//! Process-wide entry point.
//!
//! A `Manager` owns one key-store database and a map from (device id,
//! algorithm) to the per-user orchestrator. Map lookups share a read
//! lock; user creation and deletion take it exclusively. Server dialogues
//! keep only weak handles to orchestrators, so deleting a user drops any
//! in-flight completion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tracing::info;

use crate::error::{Error, Result};
use crate::crypto::IdentityKey;
use crate::settings;
use crate::store::Store;
use crate::types::{
    Callback, CallbackReturn, CurveId, EncryptionContext, PeerDeviceStatus, ServerPost,
};
use crate::user::UserHandle;
use crate::wire::DrHeader;
use crate::x3dh;

type UserMap = Arc<RwLock<HashMap<(String, u8), Arc<UserHandle>>>>;

pub struct Manager {
    store: Arc<Store>,
    post: ServerPost,
    users: UserMap,
}

impl Manager {
    /// Opens (creating or migrating as needed) the key-store database and
    /// wires in the transport used to reach key-distribution servers.
    pub fn new(db_path: &str, post: ServerPost) -> Result<Self> {
        Ok(Self {
            store: Arc::new(Store::open(db_path)?),
            post,
            users: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    fn get_user(&self, device_id: &str, curve: CurveId) -> Result<Arc<UserHandle>> {
        let key = (device_id.to_string(), curve as u8);
        if let Ok(users) = self.users.read() {
            if let Some(handle) = users.get(&key) {
                return Ok(handle.clone());
            }
        }

        let record = self
            .store
            .load_user(device_id, curve, false)?
            .ok_or_else(|| Error::NotFound(format!("user {device_id}")))?;
        let handle = Arc::new(UserHandle::new(record, self.store.clone(), self.post.clone())?);

        let mut users = self
            .users
            .write()
            .map_err(|_| Error::StorageFail("user map lock poisoned".to_string()))?;
        Ok(users.entry(key).or_insert(handle).clone())
    }

    fn get_first_user(&self, device_id: &str, curves: &[CurveId]) -> Result<Arc<UserHandle>> {
        for curve in curves {
            match self.get_user(device_id, *curve) {
                Ok(handle) => return Ok(handle),
                Err(Error::NotFound(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(Error::NotFound(format!("user {device_id}")))
    }

    /* ------------------------- user lifecycle ------------------------- */

    /// Creates one local user per listed algorithm and publishes them on
    /// the key-distribution server. The callback fires once, after every
    /// publication settled; any failure makes the whole call fail.
    ///
    /// A user left inactive by an unanswered earlier publication is
    /// retried with its stored identity key.
    pub fn create_user(
        &self,
        device_id: &str,
        curves: &[CurveId],
        server_url: &str,
        initial_opk_batch_size: Option<u16>,
        callback: Callback,
    ) -> Result<()> {
        if curves.is_empty() {
            return Err(Error::InvalidArgument("no algorithm given".to_string()));
        }
        for curve in curves {
            if !curve.is_supported() {
                return Err(Error::InvalidArgument(format!(
                    "algorithm {} is not available in this build",
                    *curve as u8
                )));
            }
        }
        let batch = initial_opk_batch_size.unwrap_or(settings::OPK_INITIAL_BATCH_SIZE);
        let aggregate = Aggregate::new(callback, curves.len());

        for curve in curves {
            let done = aggregate.done();
            if let Err(err) = self.create_one_user(device_id, *curve, server_url, batch, done) {
                aggregate.done()(CallbackReturn::Fail, err.to_string());
            }
        }
        Ok(())
    }

    fn create_one_user(
        &self,
        device_id: &str,
        curve: CurveId,
        server_url: &str,
        batch: u16,
        done: x3dh::Done,
    ) -> Result<()> {
        let record = match self.store.load_user(device_id, curve, true)? {
            Some(record) if record.active => {
                return Err(Error::InvalidArgument(format!(
                    "user {device_id} already exists"
                )));
            }
            Some(record) => {
                // Unconfirmed leftover of an earlier attempt: publish
                // again with the stored identity key.
                info!(device = %device_id, "retrying unconfirmed publication");
                record
            }
            None => {
                let identity = IdentityKey::generate()?;
                let uid =
                    self.store
                        .create_user(device_id, curve, server_url, &identity.to_blob())?;
                self.store
                    .load_user(device_id, curve, true)?
                    .ok_or_else(|| Error::StorageFail(format!("user {uid} vanished")))?
            }
        };

        let handle = Arc::new(UserHandle::new(record, self.store.clone(), self.post.clone())?);
        let users = self.users.clone();
        let key = (device_id.to_string(), curve as u8);
        let map_handle = handle.clone();
        x3dh::publish_user(
            handle,
            batch,
            true,
            Box::new(move |status, detail| {
                if status == CallbackReturn::Success {
                    if let Ok(mut users) = users.write() {
                        users.insert(key, map_handle);
                    }
                }
                done(status, detail);
            }),
        );
        Ok(())
    }

    /// Deletes the user locally (cascading to its keys and sessions) and
    /// from the server; the callback carries the server-side outcome.
    pub fn delete_user(&self, device_id: &str, curve: CurveId, callback: Callback) -> Result<()> {
        let handle = self.get_user(device_id, curve)?;
        if let Ok(mut users) = self.users.write() {
            users.remove(&(device_id.to_string(), curve as u8));
        }
        self.store.delete_user(handle.uid)?;
        info!(device = %device_id, "user deleted");
        x3dh::server_delete_user(handle, callback);
        Ok(())
    }

    /// Whether an active local user exists for at least one of the listed
    /// algorithms.
    pub fn is_user(&self, device_id: &str, curves: &[CurveId]) -> Result<bool> {
        for curve in curves {
            if self.store.load_user(device_id, *curve, false)?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Daily maintenance: rotates the signed prekey when due, replenishes
    /// one-time prekeys when the server runs low, and sweeps expired
    /// prekeys, stale sessions and old skipped message keys.
    pub fn update(
        &self,
        device_id: &str,
        curves: &[CurveId],
        callback: Callback,
        opk_server_low_limit: Option<u16>,
        opk_batch_size: Option<u16>,
    ) -> Result<()> {
        let low = opk_server_low_limit
            .unwrap_or(settings::OPK_SERVER_LOW_LIMIT)
            .max(1);
        let batch = opk_batch_size.unwrap_or(settings::OPK_BATCH_SIZE);

        let mut handles = Vec::new();
        for curve in curves {
            match self.get_user(device_id, *curve) {
                Ok(handle) => handles.push(handle),
                Err(Error::NotFound(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        if handles.is_empty() {
            return Err(Error::NotFound(format!("user {device_id}")));
        }

        let aggregate = Aggregate::new(callback, handles.len());
        for handle in handles {
            let uid = handle.uid;
            handle.store.delete_expired_spks(uid)?;
            handle.store.delete_expired_opks(uid)?;
            handle.store.delete_expired_sessions(uid)?;
            handle.store.delete_old_skipped_chains(uid)?;
            handle.store.touch_user(uid)?;

            let done = aggregate.done();
            let opk_handle = handle.clone();
            x3dh::update_spk(
                handle,
                Box::new(move |status, detail| {
                    if status == CallbackReturn::Fail {
                        done(status, detail);
                        return;
                    }
                    x3dh::update_opk(opk_handle, low, batch, done);
                }),
            );
        }
        Ok(())
    }

    /* -------------------------- encrypt/decrypt ----------------------- */

    /// Encrypts the context's plaintext to every listed recipient device,
    /// using the first listed algorithm this device has a user for. The
    /// call returns immediately; completion (possibly after a key-bundle
    /// fetch) arrives through the callback.
    pub fn encrypt(
        &self,
        device_id: &str,
        curves: &[CurveId],
        context: Arc<Mutex<EncryptionContext>>,
        callback: Callback,
    ) -> Result<()> {
        let handle = self.get_first_user(device_id, curves)?;
        handle.encrypt(context, callback);
        Ok(())
    }

    /// Decrypts a message addressed to `device_id`. On success the
    /// plaintext is written to `plaintext` and the sender's trust status
    /// is returned; `Fail` means no plaintext was produced.
    pub fn decrypt(
        &self,
        device_id: &str,
        recipient_user_id: &str,
        sender_device_id: &str,
        dr_message: &[u8],
        cipher_message: &[u8],
        plaintext: &mut Vec<u8>,
    ) -> Result<PeerDeviceStatus> {
        let Ok((header, _)) = DrHeader::parse(dr_message) else {
            return Ok(PeerDeviceStatus::Fail);
        };
        let handle = self.get_user(device_id, header.curve)?;
        let status = handle.decrypt(
            recipient_user_id,
            sender_device_id,
            dr_message,
            cipher_message,
            plaintext,
        )?;
        // Another device of a local account is implicitly trusted.
        if status != PeerDeviceStatus::Fail
            && !self.store.load_device_users(sender_device_id)?.is_empty()
        {
            return Ok(PeerDeviceStatus::Trusted);
        }
        Ok(status)
    }

    /* --------------------------- trust model -------------------------- */

    /// Public identity keys of this device, one per algorithm it has an
    /// active user for.
    pub fn get_self_identity_keys(
        &self,
        device_id: &str,
        curves: &[CurveId],
    ) -> Result<HashMap<CurveId, Vec<u8>>> {
        let mut keys = HashMap::new();
        for curve in curves {
            if let Some(record) = self.store.load_user(device_id, *curve, false)? {
                let identity = IdentityKey::from_blob(&record.ik_blob)?;
                keys.insert(*curve, identity.public_bytes().to_vec());
            }
        }
        if keys.is_empty() {
            return Err(Error::NotFound(format!("user {device_id}")));
        }
        Ok(keys)
    }

    /// Sets the trust state of a peer device, pinning `ik` when one is
    /// given. See the trust lattice: `unsafe` sticks, `trusted` requires a
    /// matching identity key, stored keys are never overwritten.
    pub fn set_peer_device_status(
        &self,
        peer_device_id: &str,
        curve: Option<CurveId>,
        ik: Option<&[u8]>,
        status: PeerDeviceStatus,
    ) -> Result<()> {
        self.store.set_peer_status(peer_device_id, curve, ik, status)
    }

    /// List form of [`Self::set_peer_device_status`]; stops at the first
    /// rejected transition.
    pub fn set_peer_devices_status(
        &self,
        entries: &[(String, Option<CurveId>, Option<Vec<u8>>, PeerDeviceStatus)],
    ) -> Result<()> {
        for (device_id, curve, ik, status) in entries {
            self.store
                .set_peer_status(device_id, *curve, ik.as_deref(), *status)?;
        }
        Ok(())
    }

    pub fn get_peer_device_status(&self, peer_device_id: &str) -> Result<PeerDeviceStatus> {
        if !self.store.load_device_users(peer_device_id)?.is_empty() {
            return Ok(PeerDeviceStatus::Trusted);
        }
        Ok(self
            .store
            .load_peer(peer_device_id)?
            .map(|peer| peer.trust_status())
            .unwrap_or(PeerDeviceStatus::Unknown))
    }

    /// Combined status of a set of peers: the minimum in the lattice
    /// unsafe < unknown < untrusted < trusted.
    pub fn get_peer_devices_status(&self, peer_device_ids: &[String]) -> Result<PeerDeviceStatus> {
        let mut statuses = Vec::with_capacity(peer_device_ids.len());
        for device_id in peer_device_ids {
            statuses.push(self.get_peer_device_status(device_id)?);
        }
        Ok(PeerDeviceStatus::combine(statuses))
    }

    /// Forgets a peer device entirely: its pinned identity, trust state
    /// and every session with it.
    pub fn delete_peer_device(&self, peer_device_id: &str) -> Result<()> {
        self.store.delete_peer(peer_device_id)?;
        if let Ok(users) = self.users.read() {
            for handle in users.values() {
                handle.forget_peer(peer_device_id);
            }
        }
        Ok(())
    }

    /// Marks every active session with the peer stale; the next outbound
    /// message will run a fresh key agreement.
    pub fn stale_sessions(
        &self,
        device_id: &str,
        curves: &[CurveId],
        peer_device_id: &str,
    ) -> Result<()> {
        let mut found = false;
        for curve in curves {
            match self.get_user(device_id, *curve) {
                Ok(handle) => {
                    handle.stale_peer_sessions(peer_device_id)?;
                    found = true;
                }
                Err(Error::NotFound(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        if !found {
            return Err(Error::NotFound(format!("user {device_id}")));
        }
        Ok(())
    }

    /* ----------------------------- server ----------------------------- */

    pub fn get_x3dh_server_url(&self, device_id: &str, curves: &[CurveId]) -> Result<String> {
        let handle = self.get_first_user(device_id, curves)?;
        handle
            .server_url
            .lock()
            .map(|url| url.clone())
            .map_err(|_| Error::StorageFail("server url lock poisoned".to_string()))
    }

    pub fn set_x3dh_server_url(
        &self,
        device_id: &str,
        curves: &[CurveId],
        url: &str,
    ) -> Result<()> {
        let mut found = false;
        for curve in curves {
            match self.get_user(device_id, *curve) {
                Ok(handle) => {
                    handle.set_server_url(url)?;
                    found = true;
                }
                Err(Error::NotFound(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        if !found {
            return Err(Error::NotFound(format!("user {device_id}")));
        }
        Ok(())
    }
}

/// Fans one user callback out over several per-algorithm operations:
/// fires once when the last completes, failing if any failed.
struct Aggregate {
    inner: Arc<Mutex<AggregateInner>>,
}

struct AggregateInner {
    remaining: usize,
    failed: bool,
    detail: String,
    callback: Option<Callback>,
}

impl Aggregate {
    fn new(callback: Callback, count: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(AggregateInner {
                remaining: count,
                failed: false,
                detail: String::new(),
                callback: Some(callback),
            })),
        }
    }

    fn done(&self) -> x3dh::Done {
        let inner = self.inner.clone();
        Box::new(move |status, detail| {
            let callback = {
                let Ok(mut inner) = inner.lock() else { return };
                if status == CallbackReturn::Fail {
                    inner.failed = true;
                    if inner.detail.is_empty() {
                        inner.detail = detail;
                    }
                }
                inner.remaining = inner.remaining.saturating_sub(1);
                if inner.remaining == 0 {
                    inner.callback.take().map(|cb| {
                        let status = if inner.failed {
                            CallbackReturn::Fail
                        } else {
                            CallbackReturn::Success
                        };
                        (cb, status, std::mem::take(&mut inner.detail))
                    })
                } else {
                    None
                }
            };
            if let Some((callback, status, detail)) = callback {
                callback(status, detail);
            }
        })
    }
}
