//! X3DH key agreement engine.
//!
//! Owns the prekey lifecycle of a local user (publication, signed-prekey
//! rotation, one-time-prekey replenishment) and turns fetched peer bundles
//! or received initiation payloads into Double Ratchet sessions. Every
//! server dialogue is asynchronous: requests go out through the caller's
//! transport and completion arrives on whatever thread runs the response.

mod keys;

pub(crate) use keys::{OneTimePreKey, SignedPreKey};

use std::sync::Arc;

use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::crypto::{
    hkdf_sha512, identity_dh_public, verify_identity_signature, X25519KeyPair, X25519PublicKey,
};
use crate::error::{Error, Result};
use crate::ratchet::{DrSession, InitiatorKeys, ResponderKeys};
use crate::settings;
use crate::store::{PEER_STATUS_UNSAFE, PEER_STATUS_UNTRUSTED};
use crate::types::{CallbackReturn, CurveId, ResponseProcess};
use crate::user::{PendingEncrypt, UserHandle};
use crate::wire::x3dh::{self as codec, error_codes, MessageType, Response};
use crate::wire::{BundleFlag, PeerBundle, X3dhInit};

/// Internal completion for one server dialogue.
pub(crate) type Done = Box<dyn FnOnce(CallbackReturn, String) + Send + 'static>;

/// X3DH prepends 32 bytes of 0xFF to the key material, domain-separating
/// the identity-signature and key-agreement uses of the identity key.
const X3DH_F_PREFIX: [u8; 32] = [0xff; 32];

fn x3dh_salt() -> [u8; 64] {
    [0u8; 64]
}

/// Associated data binding a session to both identities and device ids,
/// initiator first.
fn derive_ad(
    ik_initiator: &[u8],
    ik_responder: &[u8],
    initiator_device: &str,
    responder_device: &str,
) -> Result<Vec<u8>> {
    let mut ikm = Vec::with_capacity(
        ik_initiator.len() + ik_responder.len() + initiator_device.len() + responder_device.len(),
    );
    ikm.extend_from_slice(ik_initiator);
    ikm.extend_from_slice(ik_responder);
    ikm.extend_from_slice(initiator_device.as_bytes());
    ikm.extend_from_slice(responder_device.as_bytes());

    let mut ad = vec![0u8; 32];
    hkdf_sha512(&x3dh_salt(), &ikm, settings::HKDF_AD_INFO, &mut ad)?;
    Ok(ad)
}

/// `SK = HKDF(F || DH1 || DH2 || DH3 [|| DH4] [|| KEM ss])`
fn derive_sk(dh_outputs: &[&[u8]], kem_ss: Option<&[u8]>) -> Result<Box<[u8; 32]>> {
    let mut ikm = X3DH_F_PREFIX.to_vec();
    for dh in dh_outputs {
        ikm.extend_from_slice(dh);
    }
    if let Some(ss) = kem_ss {
        ikm.extend_from_slice(ss);
    }

    let mut sk = Box::new([0u8; 32]);
    hkdf_sha512(&x3dh_salt(), &ikm, settings::HKDF_SK_INFO, sk.as_mut_slice())?;
    ikm.zeroize();
    Ok(sk)
}

fn generate_opk_batch(curve: CurveId, count: u16) -> Result<Vec<OneTimePreKey>> {
    (0..count).map(|_| OneTimePreKey::generate(curve)).collect()
}

/// Publishes (or re-publishes) a user's key material: identity key, a
/// fresh signed prekey and a one-time prekey batch. On a non-200 answer
/// during first publication, the local user row is removed so a later
/// creation starts from scratch.
pub(crate) fn publish_user(user: Arc<UserHandle>, batch_size: u16, fresh_user: bool, done: Done) {
    let result = (|| -> Result<Vec<u8>> {
        let spk = SignedPreKey::generate(user.curve)?;
        let signature = spk.sign(&user.identity);
        let opks = generate_opk_batch(user.curve, batch_size)?;

        let opk_rows: Vec<(u32, Vec<u8>)> = opks.iter().map(|o| (o.id(), o.to_blob())).collect();
        if fresh_user {
            user.store
                .insert_initial_keys(user.uid, spk.id(), &spk.to_blob(), &opk_rows)?;
        } else {
            user.store.rotate_spk(user.uid, spk.id(), &spk.to_blob())?;
            user.store.insert_opks(user.uid, &opk_rows)?;
        }

        let opk_entries: Vec<(Vec<u8>, u32)> =
            opks.iter().map(|o| (o.public_bytes(), o.id())).collect();
        Ok(codec::build_register_user(
            user.curve,
            &user.identity.public_bytes(),
            &spk.public_bytes(),
            &signature.to_bytes(),
            spk.id(),
            &opk_entries,
        ))
    })();

    let message = match result {
        Ok(message) => message,
        Err(err) => {
            done(CallbackReturn::Fail, err.to_string());
            return;
        }
    };

    info!(device = %user.device_id, "publishing user");
    let post_user = user.clone();
    post_to_server(
        &user,
        message,
        Box::new(move |code, body| {
            let outcome = server_ack(post_user.curve, code, &body, MessageType::RegisterUser);
            match outcome {
                Ok(()) => {
                    if let Err(err) = post_user.store.activate_user(post_user.uid) {
                        done(CallbackReturn::Fail, err.to_string());
                        return;
                    }
                    info!(device = %post_user.device_id, "user published");
                    done(CallbackReturn::Success, String::new());
                }
                Err(err) => {
                    warn!(device = %post_user.device_id, %err, "publication refused");
                    if fresh_user {
                        // Publication failed: the half-created user must
                        // not survive locally.
                        let _ = post_user.store.delete_user(post_user.uid);
                    }
                    done(CallbackReturn::Fail, err.to_string());
                }
            }
        }),
    );
}

/// Removes the user from the key-distribution server.
pub(crate) fn server_delete_user(user: Arc<UserHandle>, done: Done) {
    let message = codec::build_delete_user(user.curve);
    let curve = user.curve;
    post_to_server(
        &user,
        message,
        Box::new(move |code, body| {
            match server_ack(curve, code, &body, MessageType::DeleteUser) {
                Ok(()) => done(CallbackReturn::Success, String::new()),
                Err(err) => done(CallbackReturn::Fail, err.to_string()),
            }
        }),
    );
}

/// Rotates the signed prekey when its lifetime elapsed, uploading the new
/// public entry.
pub(crate) fn update_spk(user: Arc<UserHandle>, done: Done) {
    let due = match user.store.active_spk(user.uid) {
        Err(err) => {
            done(CallbackReturn::Fail, err.to_string());
            return;
        }
        Ok(None) => {
            done(
                CallbackReturn::Fail,
                "user has no active signed prekey".to_string(),
            );
            return;
        }
        Ok(Some((_, _, created))) => {
            crate::store::now_ts() - created
                >= settings::SPK_LIFETIME_DAYS * settings::SECONDS_PER_DAY
        }
    };
    if !due {
        done(CallbackReturn::Success, String::new());
        return;
    }

    let result = (|| -> Result<Vec<u8>> {
        let spk = SignedPreKey::generate(user.curve)?;
        let signature = spk.sign(&user.identity);
        user.store.rotate_spk(user.uid, spk.id(), &spk.to_blob())?;
        debug!(device = %user.device_id, spk_id = spk.id(), "rotating signed prekey");
        Ok(codec::build_post_spk(
            user.curve,
            &spk.public_bytes(),
            &signature.to_bytes(),
            spk.id(),
        ))
    })();
    let message = match result {
        Ok(message) => message,
        Err(err) => {
            done(CallbackReturn::Fail, err.to_string());
            return;
        }
    };

    let curve = user.curve;
    post_to_server(
        &user,
        message,
        Box::new(move |code, body| {
            match server_ack(curve, code, &body, MessageType::PostSpk) {
                Ok(()) => done(CallbackReturn::Success, String::new()),
                Err(err) => done(CallbackReturn::Fail, err.to_string()),
            }
        }),
    );
}

/// Asks the server how many one-time prekeys it still holds, marks the
/// handed-out ones dispatched, and uploads a new batch when the server
/// runs low. A user the server no longer knows is re-published.
pub(crate) fn update_opk(user: Arc<UserHandle>, server_low_limit: u16, batch_size: u16, done: Done) {
    let message = codec::build_get_self_opks(user.curve);
    let post_user = user.clone();
    post_to_server(
        &user,
        message,
        Box::new(move |code, body| {
            if code != 200 {
                done(
                    CallbackReturn::Fail,
                    format!("server answered {code} to the prekey count request"),
                );
                return;
            }
            match codec::parse_response(post_user.curve, &body) {
                Ok(Response::SelfOpkIds(server_ids)) => {
                    handle_self_opks(post_user, server_ids, server_low_limit, batch_size, done);
                }
                Ok(_) => done(
                    CallbackReturn::Fail,
                    "unexpected answer to the prekey count request".to_string(),
                ),
                Err(Error::ServerFail { code, .. })
                    if code == error_codes::USER_NOT_FOUND as u16 =>
                {
                    // The server lost us (wipe, migration): publish again
                    // with the stored identity key.
                    info!(device = %post_user.device_id, "unknown to server, re-publishing");
                    publish_user(post_user, batch_size, false, done);
                }
                Err(err) => done(CallbackReturn::Fail, err.to_string()),
            }
        }),
    );
}

fn handle_self_opks(
    user: Arc<UserHandle>,
    server_ids: Vec<u32>,
    server_low_limit: u16,
    batch_size: u16,
    done: Done,
) {
    let result = (|| -> Result<Option<Vec<u8>>> {
        let local = user.store.opk_ids(user.uid)?;
        let handed_out: Vec<u32> = local
            .iter()
            .filter(|(id, dispatched)| !dispatched && !server_ids.contains(id))
            .map(|(id, _)| *id)
            .collect();
        if !handed_out.is_empty() {
            debug!(
                device = %user.device_id,
                count = handed_out.len(),
                "one-time prekeys dispatched by server"
            );
            user.store.dispatch_opks(user.uid, &handed_out)?;
        }
        user.store.delete_expired_opks(user.uid)?;

        if (server_ids.len() as u16) < server_low_limit {
            let opks = generate_opk_batch(user.curve, batch_size)?;
            let rows: Vec<(u32, Vec<u8>)> = opks.iter().map(|o| (o.id(), o.to_blob())).collect();
            user.store.insert_opks(user.uid, &rows)?;
            let entries: Vec<(Vec<u8>, u32)> =
                opks.iter().map(|o| (o.public_bytes(), o.id())).collect();
            Ok(Some(codec::build_post_opks(user.curve, &entries)))
        } else {
            Ok(None)
        }
    })();

    match result {
        Err(err) => done(CallbackReturn::Fail, err.to_string()),
        Ok(None) => done(CallbackReturn::Success, String::new()),
        Ok(Some(message)) => {
            let curve = user.curve;
            post_to_server(
                &user,
                message,
                Box::new(move |code, body| {
                    match server_ack(curve, code, &body, MessageType::PostOpks) {
                        Ok(()) => done(CallbackReturn::Success, String::new()),
                        Err(err) => done(CallbackReturn::Fail, err.to_string()),
                    }
                }),
            );
        }
    }
}

/// Fetches key bundles for every listed device in one request, builds the
/// initiator sessions, then resumes the encryption that was waiting.
pub(crate) fn fetch_peer_bundles(user: Arc<UserHandle>, missing: Vec<String>, pending: PendingEncrypt) {
    debug!(device = %user.device_id, peers = missing.len(), "fetching peer bundles");
    let message = codec::build_get_peer_bundles(user.curve, &missing);
    let weak = Arc::downgrade(&user);
    post_to_server(
        &user,
        message,
        Box::new(move |code, body| {
            // The manager keeps the strong handle; a deleted user just
            // drops the response.
            let Some(user) = weak.upgrade() else { return };
            let result = if code != 200 {
                Err(Error::ServerFail {
                    code,
                    detail: "bundle fetch failed".to_string(),
                })
            } else {
                match codec::parse_response(user.curve, &body) {
                    Ok(Response::PeerBundles(bundles)) => Ok(bundles),
                    Ok(_) => Err(Error::SerializationFail(
                        "unexpected answer to the bundle request".to_string(),
                    )),
                    Err(err) => Err(err),
                }
            };
            UserHandle::complete_fetch(&user, missing, result, pending);
        }),
    );
}

/// Sends one request through the caller-supplied transport. No lock is
/// held here: the response may arrive reentrantly, on any thread.
fn post_to_server(user: &UserHandle, message: Vec<u8>, respond: ResponseProcess) {
    let url = user
        .server_url
        .lock()
        .map(|guard| guard.clone())
        .unwrap_or_default();
    (user.post.as_ref())(&url, &user.device_id, message, respond);
}

fn server_ack(curve: CurveId, code: u16, body: &[u8], expected: MessageType) -> Result<()> {
    if code != 200 {
        return Err(Error::ServerFail {
            code,
            detail: String::new(),
        });
    }
    match codec::parse_response(curve, body)? {
        Response::Ack(message_type) if message_type == expected => Ok(()),
        _ => Err(Error::SerializationFail(
            "unexpected server acknowledgement".to_string(),
        )),
    }
}

/* ------------------------- session construction ------------------------ */

/// Builds an outbound session from a fetched bundle: verifies the prekey
/// signature, enforces identity pinning, runs the initiator side of the
/// key agreement and attaches the initiation payload.
pub(crate) fn build_initiator_session(user: &UserHandle, bundle: &PeerBundle) -> Result<DrSession> {
    if bundle.flag == BundleFlag::NoBundle {
        return Err(Error::NotFound(format!(
            "no key bundle for {}",
            bundle.device_id
        )));
    }
    verify_identity_signature(&bundle.ik, &bundle.spk_pub, &bundle.spk_sig)?;

    // Identity pinning: a stored key never changes, and only an `unsafe`
    // peer may keep talking through a key the bundle contradicts.
    let did = match user.store.load_peer(&bundle.device_id)? {
        Some(peer) => {
            if peer.ik.is_empty() {
                user.store.fill_peer_ik(peer.did, &bundle.ik)?;
            } else if peer.ik != bundle.ik && peer.status != PEER_STATUS_UNSAFE {
                return Err(Error::IdentityMismatch(bundle.device_id.clone()));
            }
            peer.did
        }
        None => user.store.insert_peer(
            &bundle.device_id,
            &bundle.ik,
            PEER_STATUS_UNTRUSTED,
            user.curve as u8,
        )?,
    };

    let spk_x = X25519PublicKey::from_slice(&bundle.spk_pub[..32])?;
    let spk_kem: Option<Vec<u8>> = if user.curve.is_kem() {
        Some(bundle.spk_pub[32..].to_vec())
    } else {
        None
    };

    let ephemeral = X25519KeyPair::generate()?;
    let dh1 = user.identity.dh(&spk_x);
    let dh2 = ephemeral.dh(&identity_dh_public(&bundle.ik)?);
    let dh3 = ephemeral.dh(&spk_x);
    let dh4 = match &bundle.opk {
        Some((opk_pub, _)) => Some(ephemeral.dh(&X25519PublicKey::from_slice(&opk_pub[..32])?)),
        None => None,
    };

    let (kem_ct, kem_ss, kem_pair) = match &spk_kem {
        Some(ek) => {
            let (ct, ss) = kem_x3dh_encapsulate(ek)?;
            let pair = kem_session_pair()?;
            (Some(ct), Some(ss), Some(pair))
        }
        None => (None, None, None),
    };

    let mut dh_outputs: Vec<&[u8]> = vec![dh1.as_bytes(), dh2.as_bytes(), dh3.as_bytes()];
    if let Some(dh4) = &dh4 {
        dh_outputs.push(dh4.as_bytes());
    }
    let shared_secret = derive_sk(&dh_outputs, kem_ss.as_deref())?;

    let ad = derive_ad(
        &user.identity.public_bytes(),
        &bundle.ik,
        &user.device_id,
        &bundle.device_id,
    )?;

    let x3dh_init = X3dhInit {
        ik: user.identity.public_bytes().to_vec(),
        ek_pub: ephemeral.public_key().to_bytes(),
        kem_ek: kem_pair.as_ref().map(|(_, ek)| ek.clone()),
        kem_ct,
        spk_id: bundle.spk_id,
        opk_id: bundle.opk.as_ref().map(|(_, id)| *id),
    };

    DrSession::new_initiator(
        user.curve,
        user.uid,
        did,
        &bundle.device_id,
        InitiatorKeys {
            shared_secret,
            peer_spk_pub: spk_x,
            peer_spk_kem: spk_kem,
            kem_pair,
        },
        ad,
        x3dh_init,
    )
}

/// Builds an inbound session from a received initiation payload. The
/// one-time prekey, when referenced, is looked up but only consumed once
/// the first message actually decrypts.
pub(crate) fn build_responder_session(
    user: &UserHandle,
    init: &X3dhInit,
    sender_device_id: &str,
) -> Result<DrSession> {
    let spk_blob = user
        .store
        .get_spk(user.uid, init.spk_id)?
        .ok_or_else(|| Error::NotFound(format!("signed prekey {}", init.spk_id)))?;
    let spk = SignedPreKey::from_blob(user.curve, init.spk_id, &spk_blob)?;

    let opk = match init.opk_id {
        None => None,
        Some(opk_id) => {
            let blob = user
                .store
                .get_opk(user.uid, opk_id)?
                .ok_or_else(|| Error::NotFound(format!("one-time prekey {opk_id}")))?;
            Some(OneTimePreKey::from_blob(user.curve, opk_id, &blob)?)
        }
    };

    // Identity pinning holds on the responder side too. The peer row
    // itself is only created once the first message actually decrypts, so
    // a forged initiation leaves no trace.
    let peer = user.store.load_peer(sender_device_id)?;
    if let Some(peer) = &peer {
        if !peer.ik.is_empty() && peer.ik != init.ik && peer.status != PEER_STATUS_UNSAFE {
            return Err(Error::IdentityMismatch(sender_device_id.to_string()));
        }
    }
    let did = peer.map(|peer| peer.did).unwrap_or(0);

    let ek = X25519PublicKey::from(init.ek_pub);
    let dh1 = spk.pair().dh(&identity_dh_public(&init.ik)?);
    let dh2 = user.identity.dh(&ek);
    let dh3 = spk.pair().dh(&ek);
    let dh4 = opk.as_ref().map(|opk| opk.pair().dh(&ek));

    let kem_ss = match (spk.kem_pair(), &init.kem_ct) {
        (Some((dk, _)), Some(ct)) => Some(kem_x3dh_decapsulate(dk, ct)?),
        (Some(_), None) => {
            return Err(Error::SerializationFail(
                "initiation payload is missing its encapsulation".to_string(),
            ))
        }
        _ => None,
    };

    let mut dh_outputs: Vec<&[u8]> = vec![dh1.as_bytes(), dh2.as_bytes(), dh3.as_bytes()];
    if let Some(dh4) = &dh4 {
        dh_outputs.push(dh4.as_bytes());
    }
    let shared_secret = derive_sk(&dh_outputs, kem_ss.as_deref())?;

    let ad = derive_ad(
        &init.ik,
        &user.identity.public_bytes(),
        sender_device_id,
        &user.device_id,
    )?;

    Ok(DrSession::new_responder(
        user.curve,
        user.uid,
        did,
        sender_device_id,
        ResponderKeys {
            shared_secret,
            spk_pair: spk.pair().clone(),
            spk_kem_pair: spk.kem_pair().cloned(),
            peer_kem_ek: init.kem_ek.clone(),
        },
        ad,
    ))
}

#[cfg(feature = "pq")]
fn kem_session_pair() -> Result<(Vec<u8>, Vec<u8>)> {
    let (dk, ek) = crate::crypto::kem_generate();
    Ok((dk.to_vec(), ek.to_vec()))
}

#[cfg(not(feature = "pq"))]
fn kem_session_pair() -> Result<(Vec<u8>, Vec<u8>)> {
    Err(Error::InvalidArgument(
        "KEM suites are not enabled in this build".to_string(),
    ))
}

#[cfg(feature = "pq")]
fn kem_x3dh_encapsulate(peer_ek: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let (ct, ss) = crate::crypto::kem_encapsulate(peer_ek)?;
    Ok((ct.to_vec(), ss.to_vec()))
}

#[cfg(not(feature = "pq"))]
fn kem_x3dh_encapsulate(_peer_ek: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    Err(Error::InvalidArgument(
        "KEM suites are not enabled in this build".to_string(),
    ))
}

#[cfg(feature = "pq")]
fn kem_x3dh_decapsulate(dk: &[u8], ct: &[u8]) -> Result<Vec<u8>> {
    Ok(crate::crypto::kem_decapsulate(dk, ct)?.to_vec())
}

#[cfg(not(feature = "pq"))]
fn kem_x3dh_decapsulate(_dk: &[u8], _ct: &[u8]) -> Result<Vec<u8>> {
    Err(Error::InvalidArgument(
        "KEM suites are not enabled in this build".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_secret_separates_inputs() {
        let dh1 = [1u8; 32];
        let dh2 = [2u8; 32];
        let dh3 = [3u8; 32];
        let dh4 = [4u8; 32];

        let without_opk = derive_sk(&[&dh1, &dh2, &dh3], None).unwrap();
        let with_opk = derive_sk(&[&dh1, &dh2, &dh3, &dh4], None).unwrap();
        assert_ne!(without_opk, with_opk);

        let with_kem = derive_sk(&[&dh1, &dh2, &dh3], Some(&[5u8; 32])).unwrap();
        assert_ne!(without_opk, with_kem);
    }

    #[test]
    fn associated_data_is_direction_bound() {
        let ik_a = [1u8; 32];
        let ik_b = [2u8; 32];
        let ab = derive_ad(&ik_a, &ik_b, "alice@d1", "bob@d1").unwrap();
        let ba = derive_ad(&ik_b, &ik_a, "bob@d1", "alice@d1").unwrap();
        assert_eq!(ab.len(), 32);
        assert_ne!(ab, ba);

        // Both ends of one session must agree.
        let again = derive_ad(&ik_a, &ik_b, "alice@d1", "bob@d1").unwrap();
        assert_eq!(ab, again);
    }
}
