//! End-to-end scenarios over an in-process key-distribution server.
//!
//! Each simulated device runs its own `Manager` over its own database
//! file; all of them talk to one mock server implementing the X3DH wire
//! protocol. The mock can defer responses to exercise the encryption
//! queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cachet::{
    Callback, CallbackReturn, CurveId, EncryptionContext, EncryptionPolicy, Manager,
    PeerDeviceStatus, RecipientData, ResponseProcess, ServerPost,
};

const CURVE: CurveId = CurveId::C25519;
const VERSION: u8 = 0x01;

const TYPE_DELETE_USER: u8 = 0x02;
const TYPE_POST_SPK: u8 = 0x03;
const TYPE_POST_OPKS: u8 = 0x04;
const TYPE_GET_PEER_BUNDLE: u8 = 0x05;
const TYPE_PEER_BUNDLE: u8 = 0x06;
const TYPE_GET_SELF_OPKS: u8 = 0x07;
const TYPE_SELF_OPKS: u8 = 0x08;
const TYPE_REGISTER_USER: u8 = 0x09;
const TYPE_ERROR: u8 = 0xff;

const ERR_USER_ALREADY_IN: u8 = 0x05;
const ERR_USER_NOT_FOUND: u8 = 0x06;

#[derive(Clone)]
struct ServerUser {
    ik: Vec<u8>,
    spk_pub: Vec<u8>,
    spk_sig: Vec<u8>,
    spk_id: u32,
    opks: VecDeque<(Vec<u8>, u32)>,
}

#[derive(Default)]
struct MockServer {
    users: Mutex<HashMap<String, ServerUser>>,
    pending: Mutex<VecDeque<(String, Vec<u8>, ResponseProcess)>>,
    defer: AtomicBool,
}

impl MockServer {
    fn new() -> Arc<Self> {
        Arc::default()
    }

    fn post(self: &Arc<Self>) -> ServerPost {
        let server = self.clone();
        Arc::new(move |_url, from, body, respond| {
            if server.defer.load(Ordering::SeqCst) {
                server
                    .pending
                    .lock()
                    .unwrap()
                    .push_back((from.to_string(), body, respond));
            } else {
                let (code, response) = server.handle(from, &body);
                respond(code, response);
            }
        })
    }

    fn set_defer(&self, defer: bool) {
        self.defer.store(defer, Ordering::SeqCst);
    }

    fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    fn deliver_one(&self) {
        let next = self.pending.lock().unwrap().pop_front();
        let (from, body, respond) = next.expect("a pending request");
        let (code, response) = self.handle(&from, &body);
        respond(code, response);
    }

    fn opk_count(&self, device_id: &str) -> usize {
        self.users
            .lock()
            .unwrap()
            .get(device_id)
            .map(|u| u.opks.len())
            .unwrap_or(0)
    }

    fn spk_id(&self, device_id: &str) -> Option<u32> {
        self.users.lock().unwrap().get(device_id).map(|u| u.spk_id)
    }

    fn drop_user(&self, device_id: &str) {
        self.users.lock().unwrap().remove(device_id);
    }

    fn ack(response_type: u8) -> (u16, Vec<u8>) {
        (200, vec![VERSION, response_type, CURVE as u8])
    }

    fn error(code: u8, detail: &str) -> (u16, Vec<u8>) {
        let mut body = vec![VERSION, TYPE_ERROR, CURVE as u8, code];
        body.extend_from_slice(detail.as_bytes());
        (200, body)
    }

    fn handle(&self, from: &str, body: &[u8]) -> (u16, Vec<u8>) {
        assert!(body.len() >= 3, "request shorter than its header");
        assert_eq!(body[0], VERSION);
        assert_eq!(body[2], CURVE as u8);
        let message_type = body[1];
        let payload = &body[3..];

        match message_type {
            TYPE_REGISTER_USER => {
                let ik = payload[..32].to_vec();
                let spk_pub = payload[32..64].to_vec();
                let spk_sig = payload[64..128].to_vec();
                let spk_id = u32::from_be_bytes(payload[128..132].try_into().unwrap());
                let count = u16::from_be_bytes(payload[132..134].try_into().unwrap()) as usize;
                let mut opks = VecDeque::new();
                let mut at = 134;
                for _ in 0..count {
                    let opk = payload[at..at + 32].to_vec();
                    let id = u32::from_be_bytes(payload[at + 32..at + 36].try_into().unwrap());
                    opks.push_back((opk, id));
                    at += 36;
                }

                let mut users = self.users.lock().unwrap();
                if let Some(existing) = users.get(from) {
                    if existing.ik != ik {
                        return Self::error(ERR_USER_ALREADY_IN, "user exists with other keys");
                    }
                }
                users.insert(
                    from.to_string(),
                    ServerUser {
                        ik,
                        spk_pub,
                        spk_sig,
                        spk_id,
                        opks,
                    },
                );
                Self::ack(TYPE_REGISTER_USER)
            }
            TYPE_DELETE_USER => {
                self.users.lock().unwrap().remove(from);
                Self::ack(TYPE_DELETE_USER)
            }
            TYPE_POST_SPK => {
                let mut users = self.users.lock().unwrap();
                let Some(user) = users.get_mut(from) else {
                    return Self::error(ERR_USER_NOT_FOUND, "unknown user");
                };
                user.spk_pub = payload[..32].to_vec();
                user.spk_sig = payload[32..96].to_vec();
                user.spk_id = u32::from_be_bytes(payload[96..100].try_into().unwrap());
                Self::ack(TYPE_POST_SPK)
            }
            TYPE_POST_OPKS => {
                let mut users = self.users.lock().unwrap();
                let Some(user) = users.get_mut(from) else {
                    return Self::error(ERR_USER_NOT_FOUND, "unknown user");
                };
                let count = u16::from_be_bytes(payload[..2].try_into().unwrap()) as usize;
                let mut at = 2;
                for _ in 0..count {
                    let opk = payload[at..at + 32].to_vec();
                    let id = u32::from_be_bytes(payload[at + 32..at + 36].try_into().unwrap());
                    user.opks.push_back((opk, id));
                    at += 36;
                }
                Self::ack(TYPE_POST_OPKS)
            }
            TYPE_GET_PEER_BUNDLE => {
                let count = u16::from_be_bytes(payload[..2].try_into().unwrap()) as usize;
                let mut at = 2;
                let mut requested = Vec::new();
                for _ in 0..count {
                    let len =
                        u16::from_be_bytes(payload[at..at + 2].try_into().unwrap()) as usize;
                    at += 2;
                    requested
                        .push(String::from_utf8(payload[at..at + len].to_vec()).unwrap());
                    at += len;
                }

                let mut users = self.users.lock().unwrap();
                let mut body = vec![VERSION, TYPE_PEER_BUNDLE, CURVE as u8];
                body.extend_from_slice(&(requested.len() as u16).to_be_bytes());
                for device_id in &requested {
                    body.extend_from_slice(&(device_id.len() as u16).to_be_bytes());
                    body.extend_from_slice(device_id.as_bytes());
                    match users.get_mut(device_id) {
                        None => body.push(2), // no bundle
                        Some(user) => {
                            let opk = user.opks.pop_front();
                            body.push(if opk.is_some() { 1 } else { 0 });
                            body.extend_from_slice(&user.ik);
                            body.extend_from_slice(&user.spk_pub);
                            body.extend_from_slice(&user.spk_sig);
                            body.extend_from_slice(&user.spk_id.to_be_bytes());
                            if let Some((opk_pub, opk_id)) = opk {
                                body.extend_from_slice(&opk_pub);
                                body.extend_from_slice(&opk_id.to_be_bytes());
                            }
                        }
                    }
                }
                (200, body)
            }
            TYPE_GET_SELF_OPKS => {
                let users = self.users.lock().unwrap();
                let Some(user) = users.get(from) else {
                    return Self::error(ERR_USER_NOT_FOUND, "unknown user");
                };
                let mut body = vec![VERSION, TYPE_SELF_OPKS, CURVE as u8];
                body.extend_from_slice(&(user.opks.len() as u16).to_be_bytes());
                for (_, id) in &user.opks {
                    body.extend_from_slice(&id.to_be_bytes());
                }
                (200, body)
            }
            other => panic!("mock server got unknown message type {other:#04x}"),
        }
    }
}

/* ----------------------------- test fixture ---------------------------- */

static DB_COUNTER: AtomicU64 = AtomicU64::new(0);

struct Device {
    manager: Manager,
    id: String,
    db_path: String,
}

impl Device {
    fn new(server: &Arc<MockServer>, device_id: &str) -> Self {
        let db_path = std::env::temp_dir()
            .join(format!(
                "cachet-test-{}-{}-{}.sqlite3",
                std::process::id(),
                DB_COUNTER.fetch_add(1, Ordering::SeqCst),
                device_id.replace(['@', ':'], "_"),
            ))
            .to_string_lossy()
            .into_owned();
        let manager = Manager::new(&db_path, server.post()).unwrap();
        Self {
            manager,
            id: device_id.to_string(),
            db_path,
        }
    }

    fn create_user(&self, initial_opk_batch: Option<u16>) {
        let watch = Watch::new();
        self.manager
            .create_user(
                &self.id,
                &[CURVE],
                "https://keys.example.com",
                initial_opk_batch,
                watch.callback(),
            )
            .unwrap();
        assert_eq!(watch.wait(), CallbackReturn::Success);
    }

    fn encrypt(
        &self,
        recipient_user_id: &str,
        recipients: &[&str],
        plaintext: &[u8],
        policy: EncryptionPolicy,
    ) -> (CallbackReturn, Vec<(String, PeerDeviceStatus, Vec<u8>)>, Vec<u8>) {
        let ctx = self.encrypt_async(recipient_user_id, recipients, plaintext, policy);
        let (status, outputs, cipher) = ctx.finish();
        (status, outputs, cipher)
    }

    fn encrypt_async(
        &self,
        recipient_user_id: &str,
        recipients: &[&str],
        plaintext: &[u8],
        policy: EncryptionPolicy,
    ) -> PendingEncryption {
        let mut context = EncryptionContext::new(
            recipient_user_id,
            recipients.iter().map(|r| RecipientData::new(*r)).collect(),
            plaintext.to_vec(),
        );
        context.policy = policy;
        let ctx = Arc::new(Mutex::new(context));
        let watch = Watch::new();
        self.manager
            .encrypt(&self.id, &[CURVE], ctx.clone(), watch.callback())
            .unwrap();
        PendingEncryption { ctx, watch }
    }

    fn decrypt(
        &self,
        recipient_user_id: &str,
        sender_device_id: &str,
        dr_message: &[u8],
        cipher_message: &[u8],
    ) -> (PeerDeviceStatus, Vec<u8>) {
        let mut plaintext = Vec::new();
        let status = self
            .manager
            .decrypt(
                &self.id,
                recipient_user_id,
                sender_device_id,
                dr_message,
                cipher_message,
                &mut plaintext,
            )
            .unwrap();
        (status, plaintext)
    }

    fn update(&self, low: Option<u16>, batch: Option<u16>) -> CallbackReturn {
        let watch = Watch::new();
        self.manager
            .update(&self.id, &[CURVE], watch.callback(), low, batch)
            .unwrap();
        watch.wait()
    }

    /// Shifts signed-prekey creation times into the past, as a calendar
    /// would.
    fn age_spks(&self, days: i64) {
        let conn = rusqlite::Connection::open(&self.db_path).unwrap();
        conn.execute(
            "UPDATE X3DH_SPK SET timeStamp = timeStamp - ?1",
            [days * 86_400],
        )
        .unwrap();
    }

    fn spk_count(&self) -> (i64, i64) {
        let conn = rusqlite::Connection::open(&self.db_path).unwrap();
        let active: i64 = conn
            .query_row("SELECT COUNT(*) FROM X3DH_SPK WHERE Status = 1", [], |r| {
                r.get(0)
            })
            .unwrap();
        let retired: i64 = conn
            .query_row("SELECT COUNT(*) FROM X3DH_SPK WHERE Status = 0", [], |r| {
                r.get(0)
            })
            .unwrap();
        (active, retired)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.db_path);
    }
}

struct PendingEncryption {
    ctx: Arc<Mutex<EncryptionContext>>,
    watch: Watch,
}

impl PendingEncryption {
    fn finish(self) -> (CallbackReturn, Vec<(String, PeerDeviceStatus, Vec<u8>)>, Vec<u8>) {
        let status = self.watch.wait();
        let ctx = self.ctx.lock().unwrap();
        let outputs = ctx
            .recipients
            .iter()
            .map(|r| (r.device_id.clone(), r.status, r.dr_message.clone()))
            .collect();
        (status, outputs, ctx.cipher_message.clone())
    }
}

/// Captures a one-shot callback result; the mock server is synchronous so
/// `wait` only asserts the callback actually ran.
struct Watch {
    slot: Arc<Mutex<Option<(CallbackReturn, String)>>>,
}

impl Watch {
    fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    fn callback(&self) -> Callback {
        let slot = self.slot.clone();
        Box::new(move |status, detail| {
            *slot.lock().unwrap() = Some((status, detail));
        })
    }

    fn wait(&self) -> CallbackReturn {
        self.slot
            .lock()
            .unwrap()
            .take()
            .expect("callback never fired")
            .0
    }
}

/* ------------------------------ scenarios ------------------------------ */

#[test]
fn basic_exchange() {
    let server = MockServer::new();
    let alice = Device::new(&server, "alice@d1");
    let bob = Device::new(&server, "bob@d1");
    alice.create_user(None);
    bob.create_user(None);

    let (status, outputs, cipher) = alice.encrypt(
        "bob",
        &["bob@d1"],
        b"hello",
        EncryptionPolicy::OptimizeUploadSize,
    );
    assert_eq!(status, CallbackReturn::Success);
    assert_eq!(outputs[0].1, PeerDeviceStatus::Unknown);
    assert!(cipher.is_empty(), "single short message goes direct");

    let (status, plaintext) = bob.decrypt("bob", "alice@d1", &outputs[0].2, &cipher);
    assert_eq!(status, PeerDeviceStatus::Unknown);
    assert_eq!(plaintext, b"hello");

    let (status, outputs, cipher) = bob.encrypt(
        "alice",
        &["alice@d1"],
        b"hi",
        EncryptionPolicy::OptimizeUploadSize,
    );
    assert_eq!(status, CallbackReturn::Success);
    // Bob met Alice through her message: she is known but unverified.
    assert_eq!(outputs[0].1, PeerDeviceStatus::Untrusted);

    let (status, plaintext) = alice.decrypt("alice", "bob@d1", &outputs[0].2, &cipher);
    assert_eq!(status, PeerDeviceStatus::Untrusted);
    assert_eq!(plaintext, b"hi");
}

#[test]
fn duplicate_recipient_fails_after_first() {
    let server = MockServer::new();
    let alice = Device::new(&server, "alice@d1");
    let bob = Device::new(&server, "bob@d1");
    alice.create_user(None);
    bob.create_user(None);

    let (status, outputs, cipher) = alice.encrypt(
        "bob",
        &["bob@d1", "bob@d1"],
        b"hello",
        EncryptionPolicy::CipherMessage,
    );
    assert_eq!(status, CallbackReturn::Success);
    assert_eq!(outputs[0].1, PeerDeviceStatus::Unknown);
    assert_eq!(outputs[1].1, PeerDeviceStatus::Fail);
    assert!(outputs[1].2.is_empty());

    let (_, plaintext) = bob.decrypt("bob", "alice@d1", &outputs[0].2, &cipher);
    assert_eq!(plaintext, b"hello");
}

#[test]
fn cipher_message_policy_round_trip() {
    let server = MockServer::new();
    let alice = Device::new(&server, "alice@d1");
    let bob = Device::new(&server, "bob@d1");
    let carol = Device::new(&server, "carol@d1");
    alice.create_user(None);
    bob.create_user(None);
    carol.create_user(None);

    let plaintext = vec![0x42u8; 2048];
    let (status, outputs, cipher) = alice.encrypt(
        "friends",
        &["bob@d1", "carol@d1"],
        &plaintext,
        EncryptionPolicy::OptimizeUploadSize,
    );
    assert_eq!(status, CallbackReturn::Success);
    assert!(
        !cipher.is_empty(),
        "a large two-recipient payload switches to the cipher-message scheme"
    );

    let (_, opened) = bob.decrypt("friends", "alice@d1", &outputs[0].2, &cipher);
    assert_eq!(opened, plaintext);
    let (_, opened) = carol.decrypt("friends", "alice@d1", &outputs[1].2, &cipher);
    assert_eq!(opened, plaintext);
}

#[test]
fn empty_plaintext_is_success_not_failure() {
    let server = MockServer::new();
    let alice = Device::new(&server, "alice@d1");
    let bob = Device::new(&server, "bob@d1");
    alice.create_user(None);
    bob.create_user(None);

    let (status, outputs, cipher) =
        alice.encrypt("bob", &["bob@d1"], b"", EncryptionPolicy::DRMessage);
    assert_eq!(status, CallbackReturn::Success);

    let (status, plaintext) = bob.decrypt("bob", "alice@d1", &outputs[0].2, &cipher);
    assert_ne!(status, PeerDeviceStatus::Fail);
    assert!(plaintext.is_empty());
}

#[test]
fn spk_rotation_on_update() {
    let server = MockServer::new();
    let alice = Device::new(&server, "alice@d1");
    alice.create_user(None);

    assert_eq!(alice.spk_count(), (1, 0));
    let before = server.spk_id("alice@d1").unwrap();

    // Fresh prekey: update leaves it alone.
    assert_eq!(alice.update(None, None), CallbackReturn::Success);
    assert_eq!(alice.spk_count(), (1, 0));
    assert_eq!(server.spk_id("alice@d1").unwrap(), before);

    // Past its lifetime: update rotates and republishes.
    alice.age_spks(8);
    assert_eq!(alice.update(None, None), CallbackReturn::Success);
    assert_eq!(alice.spk_count(), (1, 1));
    let after = server.spk_id("alice@d1").unwrap();
    assert_ne!(before, after);

    // Another lifetime-and-limbo later the original prekey is dropped;
    // the sweep runs before the rotation, so only the newest retiree
    // remains in limbo.
    alice.age_spks(31);
    assert_eq!(alice.update(None, None), CallbackReturn::Success);
    assert_eq!(alice.spk_count(), (1, 1));
    assert_ne!(server.spk_id("alice@d1").unwrap(), after);
}

#[test]
fn opk_depletion_serves_last_fetcher_without_opk() {
    let server = MockServer::new();
    let alice = Device::new(&server, "alice@d1");
    alice.create_user(Some(2));
    assert_eq!(server.opk_count("alice@d1"), 2);

    let fetchers: Vec<Device> = (0..3)
        .map(|i| {
            let device = Device::new(&server, &format!("peer{i}@d1"));
            device.create_user(None);
            device
        })
        .collect();

    for (i, fetcher) in fetchers.iter().enumerate() {
        let text = format!("hello {i}");
        let (status, outputs, cipher) = fetcher.encrypt(
            "alice",
            &["alice@d1"],
            text.as_bytes(),
            EncryptionPolicy::DRMessage,
        );
        assert_eq!(status, CallbackReturn::Success);
        let (status, plaintext) = alice.decrypt("alice", &fetcher.id, &outputs[0].2, &cipher);
        assert_ne!(status, PeerDeviceStatus::Fail, "fetcher {i} must decrypt");
        assert_eq!(plaintext, text.as_bytes());
    }
    assert_eq!(server.opk_count("alice@d1"), 0);
}

#[test]
fn identity_theft_is_blocked_until_marked_unsafe() {
    let server = MockServer::new();
    let alice = Device::new(&server, "alice@d1");
    let bob = Device::new(&server, "bob@d1");
    alice.create_user(None);
    bob.create_user(None);

    // One exchange pins Bob's identity key at Alice's.
    let (_, outputs, cipher) =
        alice.encrypt("bob", &["bob@d1"], b"hello", EncryptionPolicy::DRMessage);
    bob.decrypt("bob", "alice@d1", &outputs[0].2, &cipher);

    // Bob wipes his account and reappears under the same device id with a
    // new identity key.
    let watch = Watch::new();
    bob.manager
        .delete_user(&bob.id, CURVE, watch.callback())
        .unwrap();
    assert_eq!(watch.wait(), CallbackReturn::Success);
    bob.create_user(None);

    // Alice forces a fresh key agreement; the fetched bundle contradicts
    // the pinned key.
    alice
        .manager
        .stale_sessions(&alice.id, &[CURVE], "bob@d1")
        .unwrap();
    let (status, outputs, _) =
        alice.encrypt("bob", &["bob@d1"], b"are you there?", EncryptionPolicy::DRMessage);
    assert_eq!(status, CallbackReturn::Fail);
    assert_eq!(outputs[0].1, PeerDeviceStatus::Fail);

    // Explicitly flagging the device unsafe lets traffic resume, marked.
    alice
        .manager
        .set_peer_device_status(
            "bob@d1",
            Some(CURVE),
            None,
            PeerDeviceStatus::Unsafe,
        )
        .unwrap();
    let (status, outputs, cipher) =
        alice.encrypt("bob", &["bob@d1"], b"still me", EncryptionPolicy::DRMessage);
    assert_eq!(status, CallbackReturn::Success);
    assert_eq!(outputs[0].1, PeerDeviceStatus::Unsafe);

    let (_, plaintext) = bob.decrypt("bob", "alice@d1", &outputs[0].2, &cipher);
    assert_eq!(plaintext, b"still me");
}

#[test]
fn unsafe_is_sticky_against_untrusted() {
    let server = MockServer::new();
    let alice = Device::new(&server, "alice@d1");
    alice.create_user(None);

    alice
        .manager
        .set_peer_device_status("mallory@d1", Some(CURVE), None, PeerDeviceStatus::Unsafe)
        .unwrap();
    alice
        .manager
        .set_peer_device_status("mallory@d1", Some(CURVE), None, PeerDeviceStatus::Untrusted)
        .unwrap();
    assert_eq!(
        alice.manager.get_peer_device_status("mallory@d1").unwrap(),
        PeerDeviceStatus::Unsafe
    );
}

#[test]
fn group_status_is_the_lattice_minimum() {
    let server = MockServer::new();
    let alice = Device::new(&server, "alice@d1");
    let bob = Device::new(&server, "bob@d1");
    alice.create_user(None);
    bob.create_user(None);

    // Talking to Bob makes him untrusted; Carol stays unknown.
    let (_, outputs, cipher) =
        alice.encrypt("bob", &["bob@d1"], b"x", EncryptionPolicy::DRMessage);
    bob.decrypt("bob", "alice@d1", &outputs[0].2, &cipher);

    // A local device is trusted as a peer of itself.
    assert_eq!(
        alice.manager.get_peer_device_status("alice@d1").unwrap(),
        PeerDeviceStatus::Trusted
    );
    assert_eq!(
        alice.manager.get_peer_device_status("bob@d1").unwrap(),
        PeerDeviceStatus::Untrusted
    );
    assert_eq!(
        alice
            .manager
            .get_peer_devices_status(&["alice@d1".into(), "bob@d1".into()])
            .unwrap(),
        PeerDeviceStatus::Untrusted
    );
    assert_eq!(
        alice
            .manager
            .get_peer_devices_status(&["bob@d1".into(), "carol@d1".into()])
            .unwrap(),
        PeerDeviceStatus::Unknown
    );
}

#[test]
fn queued_encryptions_drain_in_order() {
    let server = MockServer::new();
    let alice = Device::new(&server, "alice@d1");
    let bob = Device::new(&server, "bob@d1");
    alice.create_user(None);
    bob.create_user(None);

    // Hold the bundle fetch: the first encrypt parks, the second queues
    // behind it.
    server.set_defer(true);
    let first = alice.encrypt_async("bob", &["bob@d1"], b"first", EncryptionPolicy::DRMessage);
    let second = alice.encrypt_async("bob", &["bob@d1"], b"second", EncryptionPolicy::DRMessage);
    assert_eq!(server.pending_count(), 1, "one fetch covers both requests");

    server.set_defer(false);
    server.deliver_one();

    let (status, outputs_first, cipher_first) = first.finish();
    assert_eq!(status, CallbackReturn::Success);
    let (status, outputs_second, cipher_second) = second.finish();
    assert_eq!(status, CallbackReturn::Success);

    // Delivery order matches submission order.
    let (_, plaintext) = bob.decrypt("bob", "alice@d1", &outputs_first[0].2, &cipher_first);
    assert_eq!(plaintext, b"first");
    let (_, plaintext) = bob.decrypt("bob", "alice@d1", &outputs_second[0].2, &cipher_second);
    assert_eq!(plaintext, b"second");
}

#[test]
fn out_of_order_delivery_and_skipped_key_eviction() {
    let server = MockServer::new();
    let alice = Device::new(&server, "alice@d1");
    let bob = Device::new(&server, "bob@d1");
    alice.create_user(None);
    bob.create_user(None);

    // One more message than the skipped-key budget (128).
    let mut messages = Vec::new();
    for i in 0..130u32 {
        let text = format!("m{i}");
        let (status, outputs, _) =
            alice.encrypt("bob", &["bob@d1"], text.as_bytes(), EncryptionPolicy::DRMessage);
        assert_eq!(status, CallbackReturn::Success);
        messages.push(outputs[0].2.clone());
    }

    // Newest first: 129 keys get skipped, one over budget, so the oldest
    // (message 0) is evicted.
    let (status, plaintext) = bob.decrypt("bob", "alice@d1", &messages[129], &[]);
    assert_ne!(status, PeerDeviceStatus::Fail);
    assert_eq!(plaintext, b"m129");

    let (status, _) = bob.decrypt("bob", "alice@d1", &messages[0], &[]);
    assert_eq!(status, PeerDeviceStatus::Fail, "evicted key is gone for good");

    let (status, plaintext) = bob.decrypt("bob", "alice@d1", &messages[1], &[]);
    assert_ne!(status, PeerDeviceStatus::Fail);
    assert_eq!(plaintext, b"m1");
}

#[test]
fn sending_chain_overflow_forces_fresh_key_agreement() {
    let server = MockServer::new();
    let alice = Device::new(&server, "alice@d1");
    let bob = Device::new(&server, "bob@d1");
    alice.create_user(None);
    bob.create_user(None);

    let opks_before = server.opk_count("alice@d1");

    // The whole sending chain, with no reply from Bob.
    let mut messages = Vec::new();
    for i in 0..1000u32 {
        let (status, outputs, _) = alice.encrypt(
            "bob",
            &["bob@d1"],
            format!("m{i}").as_bytes(),
            EncryptionPolicy::DRMessage,
        );
        assert_eq!(status, CallbackReturn::Success);
        messages.push(outputs[0].2.clone());
    }

    // The next one must come from a brand-new session.
    let bob_opks_before = server.opk_count("bob@d1");
    let (status, outputs, _) = alice.encrypt(
        "bob",
        &["bob@d1"],
        b"fresh start",
        EncryptionPolicy::DRMessage,
    );
    assert_eq!(status, CallbackReturn::Success);
    assert_eq!(
        server.opk_count("bob@d1"),
        bob_opks_before - 1,
        "a new key agreement consumed a bundle"
    );
    assert_eq!(server.opk_count("alice@d1"), opks_before);

    // Bob follows both sessions and the conversation converges.
    for (i, message) in messages.iter().enumerate().take(5) {
        let (_, plaintext) = bob.decrypt("bob", "alice@d1", message, &[]);
        assert_eq!(plaintext, format!("m{i}").as_bytes());
    }
    let (status, plaintext) = bob.decrypt("bob", "alice@d1", &outputs[0].2, &[]);
    assert_ne!(status, PeerDeviceStatus::Fail);
    assert_eq!(plaintext, b"fresh start");

    let (_, outputs, cipher) =
        bob.encrypt("alice", &["alice@d1"], b"caught up", EncryptionPolicy::DRMessage);
    let (status, plaintext) = alice.decrypt("alice", "bob@d1", &outputs[0].2, &cipher);
    assert_ne!(status, PeerDeviceStatus::Fail);
    assert_eq!(plaintext, b"caught up");
}

#[test]
fn opk_replenishment_and_republish_after_server_wipe() {
    let server = MockServer::new();
    let alice = Device::new(&server, "alice@d1");
    alice.create_user(Some(4));
    assert_eq!(server.opk_count("alice@d1"), 4);

    // Server holds plenty relative to a low limit of 1: no upload.
    assert_eq!(alice.update(Some(1), Some(5)), CallbackReturn::Success);
    assert_eq!(server.opk_count("alice@d1"), 4);

    // Low limit above the held count: a batch goes up.
    assert_eq!(alice.update(Some(10), Some(5)), CallbackReturn::Success);
    assert_eq!(server.opk_count("alice@d1"), 9);

    // The server lost the user entirely: update re-publishes it with the
    // stored identity key.
    server.drop_user("alice@d1");
    assert_eq!(alice.update(Some(10), Some(5)), CallbackReturn::Success);
    assert!(server.spk_id("alice@d1").is_some());

    // And the republished identity still serves new sessions.
    let bob = Device::new(&server, "bob@d1");
    bob.create_user(None);
    let (status, outputs, cipher) =
        bob.encrypt("alice", &["alice@d1"], b"hello again", EncryptionPolicy::DRMessage);
    assert_eq!(status, CallbackReturn::Success);
    let (_, plaintext) = alice.decrypt("alice", "bob@d1", &outputs[0].2, &cipher);
    assert_eq!(plaintext, b"hello again");
}

#[test]
fn recreating_an_existing_user_fails_cleanly() {
    let server = MockServer::new();
    let alice = Device::new(&server, "alice@d1");
    alice.create_user(None);

    let watch = Watch::new();
    let result = alice.manager.create_user(
        &alice.id,
        &[CURVE],
        "https://keys.example.com",
        None,
        watch.callback(),
    );
    // The duplicate surfaces either synchronously or via the callback.
    match result {
        Err(_) => {}
        Ok(()) => assert_eq!(watch.wait(), CallbackReturn::Fail),
    }
    assert!(alice.manager.is_user(&alice.id, &[CURVE]).unwrap());
}

#[test]
fn server_urls_are_per_user_and_mutable() {
    let server = MockServer::new();
    let alice = Device::new(&server, "alice@d1");
    alice.create_user(None);

    assert_eq!(
        alice
            .manager
            .get_x3dh_server_url(&alice.id, &[CURVE])
            .unwrap(),
        "https://keys.example.com"
    );
    alice
        .manager
        .set_x3dh_server_url(&alice.id, &[CURVE], "https://keys2.example.com")
        .unwrap();
    assert_eq!(
        alice
            .manager
            .get_x3dh_server_url(&alice.id, &[CURVE])
            .unwrap(),
        "https://keys2.example.com"
    );

    let keys = alice
        .manager
        .get_self_identity_keys(&alice.id, &[CURVE])
        .unwrap();
    assert_eq!(keys.get(&CURVE).map(|k| k.len()), Some(32));
}

#[test]
fn deleting_a_peer_device_unpins_its_identity() {
    let server = MockServer::new();
    let alice = Device::new(&server, "alice@d1");
    let bob = Device::new(&server, "bob@d1");
    alice.create_user(None);
    bob.create_user(None);

    let (_, outputs, cipher) =
        alice.encrypt("bob", &["bob@d1"], b"x", EncryptionPolicy::DRMessage);
    bob.decrypt("bob", "alice@d1", &outputs[0].2, &cipher);
    assert_eq!(
        alice.manager.get_peer_device_status("bob@d1").unwrap(),
        PeerDeviceStatus::Untrusted
    );

    alice.manager.delete_peer_device("bob@d1").unwrap();
    assert_eq!(
        alice.manager.get_peer_device_status("bob@d1").unwrap(),
        PeerDeviceStatus::Unknown
    );

    // With the pin gone, a new identity for the device is acceptable.
    let watch = Watch::new();
    bob.manager
        .delete_user(&bob.id, CURVE, watch.callback())
        .unwrap();
    assert_eq!(watch.wait(), CallbackReturn::Success);
    bob.create_user(None);

    let (status, outputs, cipher) =
        alice.encrypt("bob", &["bob@d1"], b"fresh", EncryptionPolicy::DRMessage);
    assert_eq!(status, CallbackReturn::Success);
    let (_, plaintext) = bob.decrypt("bob", "alice@d1", &outputs[0].2, &cipher);
    assert_eq!(plaintext, b"fresh");
}
