//! Persistent key store.
//!
//! One SQLite database holds every long-lived secret: local users, peer
//! devices, signed and one-time prekeys, Double Ratchet sessions and their
//! skipped message keys. All writes belonging to one logical operation run
//! in a single transaction; deleting a user or a session cascades to the
//! rows it owns.

use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::error::{Error, Result};
use crate::settings;
use crate::types::{CurveId, PeerDeviceStatus};

pub(crate) const PEER_STATUS_UNTRUSTED: i64 = 0;
pub(crate) const PEER_STATUS_TRUSTED: i64 = 1;
pub(crate) const PEER_STATUS_UNSAFE: i64 = 2;

pub(crate) const SESSION_STALE: i64 = 0;
pub(crate) const SESSION_ACTIVE: i64 = 1;

pub(crate) const SPK_RETIRED: i64 = 0;
pub(crate) const SPK_ACTIVE: i64 = 1;

pub(crate) const OPK_AVAILABLE: i64 = 0;
pub(crate) const OPK_DISPATCHED: i64 = 1;

/// Seconds since the Unix epoch.
pub(crate) fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub(crate) struct LocalUserRecord {
    pub(crate) uid: i64,
    pub(crate) device_id: String,
    pub(crate) curve: CurveId,
    pub(crate) server_url: String,
    pub(crate) active: bool,
    pub(crate) ik_blob: Vec<u8>,
}

pub(crate) struct PeerDeviceRecord {
    pub(crate) did: i64,
    pub(crate) ik: Vec<u8>,
    pub(crate) status: i64,
}

impl PeerDeviceRecord {
    pub(crate) fn trust_status(&self) -> PeerDeviceStatus {
        match self.status {
            PEER_STATUS_TRUSTED => PeerDeviceStatus::Trusted,
            PEER_STATUS_UNSAFE => PeerDeviceStatus::Unsafe,
            _ => PeerDeviceStatus::Untrusted,
        }
    }
}

/// Raw persisted form of a Double Ratchet session.
pub(crate) struct SessionRow {
    pub(crate) id: i64,
    pub(crate) uid: i64,
    pub(crate) did: i64,
    pub(crate) ns: u32,
    pub(crate) nr: u32,
    pub(crate) pn: u32,
    pub(crate) dhr: Option<Vec<u8>>,
    pub(crate) dhr_status: i64,
    pub(crate) dhs: Vec<u8>,
    pub(crate) rk: Vec<u8>,
    pub(crate) cks: Option<Vec<u8>>,
    pub(crate) ckr: Option<Vec<u8>>,
    pub(crate) ad: Vec<u8>,
    pub(crate) active: bool,
    pub(crate) x3dh_init: Option<Vec<u8>>,
}

pub(crate) struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub(crate) fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA synchronous = NORMAL;")?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::StorageFail("database lock poisoned".to_string()))
    }

    /* ---------------------------- schema ---------------------------- */

    fn migrate(&self) -> Result<()> {
        let mut conn = self.lock()?;

        let has_version_table: bool = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='db_module_version'",
            [],
            |row| row.get::<_, i64>(0).map(|n| n > 0),
        )?;

        if !has_version_table {
            let tx = conn.transaction()?;
            Self::create_schema(&tx)?;
            tx.execute(
                "INSERT INTO db_module_version(version) VALUES (?1)",
                params![settings::DB_MODULE_VERSION],
            )?;
            tx.commit()?;
            return Ok(());
        }

        let mut version: i64 =
            conn.query_row("SELECT version FROM db_module_version", [], |row| row.get(0))?;

        if version > settings::DB_MODULE_VERSION {
            return Err(Error::StorageFail(format!(
                "database version {version:#08x} is newer than this library"
            )));
        }

        // Forward-only migrations, one transaction per step.
        if version < 0x00_01_00 {
            let tx = conn.transaction()?;
            tx.execute_batch(
                "ALTER TABLE LocalUsers ADD COLUMN updateTs INTEGER NOT NULL DEFAULT 0;",
            )?;
            tx.execute("UPDATE db_module_version SET version = ?1", params![0x00_01_00])?;
            tx.commit()?;
            version = 0x00_01_00;
        }

        if version < 0x00_02_00 {
            let tx = conn.transaction()?;
            tx.execute_batch(
                "ALTER TABLE DR_sessions ADD COLUMN DHrStatus INTEGER NOT NULL DEFAULT 0;",
            )?;
            tx.execute("UPDATE db_module_version SET version = ?1", params![0x00_02_00])?;
            tx.commit()?;
            version = 0x00_02_00;
        }

        if version < 0x00_03_00 {
            let tx = conn.transaction()?;
            tx.execute_batch(
                "ALTER TABLE PeerDevices ADD COLUMN curve_id INTEGER NOT NULL DEFAULT 0;
                 ALTER TABLE PeerDevices ADD COLUMN active INTEGER NOT NULL DEFAULT 1;",
            )?;
            // Databases below 0x000300 hold a single user; its algorithm
            // seeds the new peer-device column.
            tx.execute(
                "UPDATE PeerDevices SET curve_id =
                     COALESCE((SELECT curveId & ?1 FROM LocalUsers LIMIT 1), 0)",
                params![settings::DB_CURVE_ID_BYTE],
            )?;
            tx.execute("UPDATE db_module_version SET version = ?1", params![0x00_03_00])?;
            tx.commit()?;
        }

        Ok(())
    }

    fn create_schema(tx: &Transaction<'_>) -> Result<()> {
        tx.execute_batch(
            "CREATE TABLE db_module_version (
                version INTEGER NOT NULL
             );
             CREATE TABLE LocalUsers (
                Uid INTEGER PRIMARY KEY AUTOINCREMENT,
                UserId TEXT NOT NULL,
                Ik BLOB NOT NULL,
                server TEXT NOT NULL,
                curveId INTEGER NOT NULL DEFAULT 0,
                updateTs INTEGER NOT NULL DEFAULT 0
             );
             CREATE TABLE PeerDevices (
                Did INTEGER PRIMARY KEY AUTOINCREMENT,
                DeviceId TEXT NOT NULL,
                Ik BLOB NOT NULL,
                Status INTEGER NOT NULL DEFAULT 0,
                curve_id INTEGER NOT NULL DEFAULT 0,
                active INTEGER NOT NULL DEFAULT 1
             );
             CREATE TABLE X3DH_SPK (
                SPKid INTEGER NOT NULL,
                SPK BLOB NOT NULL,
                timeStamp INTEGER NOT NULL,
                Status INTEGER NOT NULL DEFAULT 1,
                Uid INTEGER NOT NULL,
                FOREIGN KEY(Uid) REFERENCES LocalUsers(Uid) ON DELETE CASCADE
             );
             CREATE TABLE X3DH_OPK (
                OPKid INTEGER NOT NULL,
                OPK BLOB NOT NULL,
                Status INTEGER NOT NULL DEFAULT 0,
                timeStamp INTEGER NOT NULL,
                Uid INTEGER NOT NULL,
                FOREIGN KEY(Uid) REFERENCES LocalUsers(Uid) ON DELETE CASCADE
             );
             CREATE TABLE DR_sessions (
                sessionId INTEGER PRIMARY KEY AUTOINCREMENT,
                Did INTEGER NOT NULL,
                Uid INTEGER NOT NULL,
                Ns INTEGER NOT NULL DEFAULT 0,
                Nr INTEGER NOT NULL DEFAULT 0,
                PN INTEGER NOT NULL DEFAULT 0,
                DHr BLOB,
                DHrStatus INTEGER NOT NULL DEFAULT 0,
                DHs BLOB NOT NULL,
                RK BLOB NOT NULL,
                CKs BLOB,
                CKr BLOB,
                AD BLOB NOT NULL,
                Status INTEGER NOT NULL DEFAULT 1,
                timeStamp INTEGER NOT NULL,
                X3DHInit BLOB,
                FOREIGN KEY(Did) REFERENCES PeerDevices(Did) ON DELETE CASCADE,
                FOREIGN KEY(Uid) REFERENCES LocalUsers(Uid) ON DELETE CASCADE
             );
             CREATE TABLE DR_MSk_DHr (
                DHid INTEGER PRIMARY KEY AUTOINCREMENT,
                sessionId INTEGER NOT NULL,
                DHr BLOB NOT NULL,
                received INTEGER NOT NULL DEFAULT 0,
                timeStamp INTEGER NOT NULL,
                FOREIGN KEY(sessionId) REFERENCES DR_sessions(sessionId) ON DELETE CASCADE
             );
             CREATE TABLE DR_MSk_MK (
                DHid INTEGER NOT NULL,
                Nr INTEGER NOT NULL,
                MK BLOB NOT NULL,
                PRIMARY KEY(DHid, Nr),
                FOREIGN KEY(DHid) REFERENCES DR_MSk_DHr(DHid) ON DELETE CASCADE
             ) WITHOUT ROWID;",
        )?;
        Ok(())
    }

    /* ------------------------- local users --------------------------- */

    /// Inserts a new, not yet published user. Fails if the (device id,
    /// algorithm) pair already exists.
    pub(crate) fn create_user(
        &self,
        device_id: &str,
        curve: CurveId,
        server_url: &str,
        ik_blob: &[u8],
    ) -> Result<i64> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let existing: Option<i64> = tx
            .query_row(
                "SELECT Uid FROM LocalUsers WHERE UserId = ?1 AND (curveId & ?2) = ?3",
                params![device_id, settings::DB_CURVE_ID_BYTE, curve as i64],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(Error::InvalidArgument(format!(
                "user {device_id} already exists"
            )));
        }
        tx.execute(
            "INSERT INTO LocalUsers(UserId, Ik, server, curveId, updateTs)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                device_id,
                ik_blob,
                server_url,
                curve as i64 | settings::DB_INACTIVE_USER_BIT,
                now_ts()
            ],
        )?;
        let uid = tx.last_insert_rowid();
        tx.commit()?;
        Ok(uid)
    }

    pub(crate) fn activate_user(&self, uid: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE LocalUsers SET curveId = curveId & ?1 WHERE Uid = ?2",
            params![settings::DB_CURVE_ID_BYTE, uid],
        )?;
        Ok(())
    }

    pub(crate) fn load_user(
        &self,
        device_id: &str,
        curve: CurveId,
        allow_inactive: bool,
    ) -> Result<Option<LocalUserRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT Uid, UserId, Ik, server, curveId FROM LocalUsers
                 WHERE UserId = ?1 AND (curveId & ?2) = ?3",
                params![device_id, settings::DB_CURVE_ID_BYTE, curve as i64],
                |row| {
                    let stored_curve: i64 = row.get(4)?;
                    Ok(LocalUserRecord {
                        uid: row.get(0)?,
                        device_id: row.get(1)?,
                        ik_blob: row.get(2)?,
                        server_url: row.get(3)?,
                        curve,
                        active: stored_curve & settings::DB_INACTIVE_USER_BIT == 0,
                    })
                },
            )
            .optional()?;
        Ok(record.filter(|r| r.active || allow_inactive))
    }

    /// All active users registered under a device id, one per algorithm.
    pub(crate) fn load_device_users(&self, device_id: &str) -> Result<Vec<LocalUserRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT Uid, UserId, Ik, server, curveId FROM LocalUsers
             WHERE UserId = ?1 AND (curveId & ?2) = 0",
        )?;
        let rows = stmt.query_map(
            params![device_id, settings::DB_INACTIVE_USER_BIT],
            |row| {
                let stored_curve: i64 = row.get(4)?;
                Ok((
                    LocalUserRecord {
                        uid: row.get(0)?,
                        device_id: row.get(1)?,
                        ik_blob: row.get(2)?,
                        server_url: row.get(3)?,
                        curve: CurveId::C25519,
                        active: true,
                    },
                    stored_curve,
                ))
            },
        )?;
        let mut users = Vec::new();
        for row in rows {
            let (mut user, stored_curve) = row?;
            if let Ok(curve) = CurveId::from_u8((stored_curve & settings::DB_CURVE_ID_BYTE) as u8) {
                user.curve = curve;
                users.push(user);
            }
        }
        Ok(users)
    }

    pub(crate) fn delete_user(&self, uid: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM LocalUsers WHERE Uid = ?1", params![uid])?;
        Ok(())
    }

    pub(crate) fn set_user_server_url(&self, uid: i64, url: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE LocalUsers SET server = ?1 WHERE Uid = ?2",
            params![url, uid],
        )?;
        Ok(())
    }

    pub(crate) fn touch_user(&self, uid: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE LocalUsers SET updateTs = ?1 WHERE Uid = ?2",
            params![now_ts(), uid],
        )?;
        Ok(())
    }

    /* ------------------------ signed prekeys ------------------------- */

    /// Persists the initial key material of a user being published: the
    /// first signed prekey and the initial one-time prekey batch.
    pub(crate) fn insert_initial_keys(
        &self,
        uid: i64,
        spk_id: u32,
        spk_blob: &[u8],
        opks: &[(u32, Vec<u8>)],
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let ts = now_ts();
        // A re-publication starts from a clean slate: whatever an earlier
        // unconfirmed attempt left behind was never served to anyone.
        tx.execute("DELETE FROM X3DH_SPK WHERE Uid = ?1", params![uid])?;
        tx.execute("DELETE FROM X3DH_OPK WHERE Uid = ?1", params![uid])?;
        tx.execute(
            "INSERT INTO X3DH_SPK(SPKid, SPK, timeStamp, Status, Uid)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![spk_id, spk_blob, ts, SPK_ACTIVE, uid],
        )?;
        for (opk_id, opk_blob) in opks {
            tx.execute(
                "INSERT INTO X3DH_OPK(OPKid, OPK, Status, timeStamp, Uid)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![opk_id, opk_blob, OPK_AVAILABLE, ts, uid],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Atomically retires the active signed prekey and installs a new one.
    pub(crate) fn rotate_spk(&self, uid: i64, spk_id: u32, spk_blob: &[u8]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE X3DH_SPK SET Status = ?1 WHERE Uid = ?2 AND Status = ?3",
            params![SPK_RETIRED, uid, SPK_ACTIVE],
        )?;
        tx.execute(
            "INSERT INTO X3DH_SPK(SPKid, SPK, timeStamp, Status, Uid)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![spk_id, spk_blob, now_ts(), SPK_ACTIVE, uid],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub(crate) fn active_spk(&self, uid: i64) -> Result<Option<(u32, Vec<u8>, i64)>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT SPKid, SPK, timeStamp FROM X3DH_SPK WHERE Uid = ?1 AND Status = ?2",
            params![uid, SPK_ACTIVE],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .map_err(Error::from)
    }

    pub(crate) fn get_spk(&self, uid: i64, spk_id: u32) -> Result<Option<Vec<u8>>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT SPK FROM X3DH_SPK WHERE Uid = ?1 AND SPKid = ?2",
            params![uid, spk_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(Error::from)
    }

    /// Drops retired prekeys past their limbo window.
    pub(crate) fn delete_expired_spks(&self, uid: i64) -> Result<usize> {
        let conn = self.lock()?;
        let cutoff = now_ts() - settings::SPK_LIMBO_DAYS * settings::SECONDS_PER_DAY;
        Ok(conn.execute(
            "DELETE FROM X3DH_SPK WHERE Uid = ?1 AND Status = ?2 AND timeStamp < ?3",
            params![uid, SPK_RETIRED, cutoff],
        )?)
    }

    /* ------------------------ one-time prekeys ----------------------- */

    pub(crate) fn insert_opks(&self, uid: i64, opks: &[(u32, Vec<u8>)]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let ts = now_ts();
        for (opk_id, opk_blob) in opks {
            tx.execute(
                "INSERT INTO X3DH_OPK(OPKid, OPK, Status, timeStamp, Uid)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![opk_id, opk_blob, OPK_AVAILABLE, ts, uid],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub(crate) fn get_opk(&self, uid: i64, opk_id: u32) -> Result<Option<Vec<u8>>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT OPK FROM X3DH_OPK WHERE Uid = ?1 AND OPKid = ?2",
            params![uid, opk_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(Error::from)
    }

    pub(crate) fn delete_opk(&self, uid: i64, opk_id: u32) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM X3DH_OPK WHERE Uid = ?1 AND OPKid = ?2",
            params![uid, opk_id],
        )?;
        Ok(())
    }

    pub(crate) fn opk_ids(&self, uid: i64) -> Result<Vec<(u32, bool)>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT OPKid, Status FROM X3DH_OPK WHERE Uid = ?1")?;
        let rows = stmt.query_map(params![uid], |row| {
            let status: i64 = row.get(1)?;
            Ok((row.get::<_, u32>(0)?, status == OPK_DISPATCHED))
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    /// Marks keys the server no longer holds as dispatched, restarting
    /// their limbo clock.
    pub(crate) fn dispatch_opks(&self, uid: i64, opk_ids: &[u32]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let ts = now_ts();
        for opk_id in opk_ids {
            tx.execute(
                "UPDATE X3DH_OPK SET Status = ?1, timeStamp = ?2
                 WHERE Uid = ?3 AND OPKid = ?4 AND Status = ?5",
                params![OPK_DISPATCHED, ts, uid, opk_id, OPK_AVAILABLE],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub(crate) fn delete_expired_opks(&self, uid: i64) -> Result<usize> {
        let conn = self.lock()?;
        let cutoff = now_ts() - settings::OPK_LIMBO_DAYS * settings::SECONDS_PER_DAY;
        Ok(conn.execute(
            "DELETE FROM X3DH_OPK WHERE Uid = ?1 AND Status = ?2 AND timeStamp < ?3",
            params![uid, OPK_DISPATCHED, cutoff],
        )?)
    }

    /* -------------------------- peer devices ------------------------- */

    pub(crate) fn load_peer(&self, device_id: &str) -> Result<Option<PeerDeviceRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT Did, Ik, Status FROM PeerDevices WHERE DeviceId = ?1",
            params![device_id],
            |row| {
                Ok(PeerDeviceRecord {
                    did: row.get(0)?,
                    ik: row.get(1)?,
                    status: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    pub(crate) fn insert_peer(
        &self,
        device_id: &str,
        ik: &[u8],
        status: i64,
        curve: u8,
    ) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO PeerDevices(DeviceId, Ik, Status, curve_id, active)
             VALUES (?1, ?2, ?3, ?4, 1)",
            params![device_id, ik, status, curve as i64],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub(crate) fn delete_peer(&self, device_id: &str) -> Result<usize> {
        let conn = self.lock()?;
        Ok(conn.execute(
            "DELETE FROM PeerDevices WHERE DeviceId = ?1",
            params![device_id],
        )?)
    }

    /// Applies a caller-requested trust transition, enforcing the trust
    /// lattice: `unsafe` is sticky against `untrusted`, `trusted` requires
    /// an identity key matching any pinned one, and a pinned key is never
    /// overwritten (only an empty placeholder is filled in).
    pub(crate) fn set_peer_status(
        &self,
        device_id: &str,
        curve: Option<CurveId>,
        ik: Option<&[u8]>,
        status: PeerDeviceStatus,
    ) -> Result<()> {
        let code = match status {
            PeerDeviceStatus::Untrusted => PEER_STATUS_UNTRUSTED,
            PeerDeviceStatus::Trusted => PEER_STATUS_TRUSTED,
            PeerDeviceStatus::Unsafe => PEER_STATUS_UNSAFE,
            PeerDeviceStatus::Unknown | PeerDeviceStatus::Fail => {
                return Err(Error::InvalidArgument(
                    "unknown and fail are not storable trust states".to_string(),
                ))
            }
        };

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let existing: Option<(i64, Vec<u8>, i64)> = tx
            .query_row(
                "SELECT Did, Ik, Status FROM PeerDevices WHERE DeviceId = ?1",
                params![device_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match existing {
            None => match status {
                // No row and nothing worth pinning: ignore.
                PeerDeviceStatus::Untrusted => {}
                PeerDeviceStatus::Trusted => {
                    let ik = ik.ok_or_else(|| {
                        Error::InvalidArgument(
                            "trusting an unknown device requires its identity key".to_string(),
                        )
                    })?;
                    tx.execute(
                        "INSERT INTO PeerDevices(DeviceId, Ik, Status, curve_id, active)
                         VALUES (?1, ?2, ?3, ?4, 1)",
                        params![
                            device_id,
                            ik,
                            PEER_STATUS_TRUSTED,
                            curve.map(|c| c as i64).unwrap_or(0)
                        ],
                    )?;
                }
                PeerDeviceStatus::Unsafe => {
                    tx.execute(
                        "INSERT INTO PeerDevices(DeviceId, Ik, Status, curve_id, active)
                         VALUES (?1, ?2, ?3, ?4, 1)",
                        params![
                            device_id,
                            &[] as &[u8],
                            PEER_STATUS_UNSAFE,
                            curve.map(|c| c as i64).unwrap_or(0)
                        ],
                    )?;
                }
                _ => unreachable!(),
            },
            Some((did, stored_ik, stored_status)) => match status {
                PeerDeviceStatus::Untrusted => {
                    // Unsafe is a sink; only an explicit trust restore exits.
                    if stored_status != PEER_STATUS_UNSAFE {
                        tx.execute(
                            "UPDATE PeerDevices SET Status = ?1 WHERE Did = ?2",
                            params![PEER_STATUS_UNTRUSTED, did],
                        )?;
                    }
                }
                PeerDeviceStatus::Trusted => {
                    let ik = ik.ok_or_else(|| {
                        Error::InvalidArgument(
                            "trusting a device requires its identity key".to_string(),
                        )
                    })?;
                    if stored_ik.is_empty() {
                        tx.execute(
                            "UPDATE PeerDevices SET Ik = ?1, Status = ?2 WHERE Did = ?3",
                            params![ik, PEER_STATUS_TRUSTED, did],
                        )?;
                    } else if stored_ik != ik {
                        return Err(Error::IdentityMismatch(device_id.to_string()));
                    } else {
                        tx.execute(
                            "UPDATE PeerDevices SET Status = ?1 WHERE Did = ?2",
                            params![PEER_STATUS_TRUSTED, did],
                        )?;
                    }
                }
                PeerDeviceStatus::Unsafe => {
                    tx.execute(
                        "UPDATE PeerDevices SET Status = ?1 WHERE Did = ?2",
                        params![PEER_STATUS_UNSAFE, did],
                    )?;
                }
                _ => unreachable!(),
            },
        }
        tx.commit()?;
        Ok(())
    }

    /// Fills the empty identity placeholder of an `unsafe` row.
    pub(crate) fn fill_peer_ik(&self, did: i64, ik: &[u8]) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE PeerDevices SET Ik = ?1 WHERE Did = ?2 AND length(Ik) = 0",
            params![ik, did],
        )?;
        Ok(())
    }

    /* ------------------------- DR sessions --------------------------- */

    /// Persists a freshly established session as the active one for its
    /// peer, staling any currently active session in the same transaction.
    pub(crate) fn insert_session(&self, row: &SessionRow) -> Result<i64> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE DR_sessions SET Status = ?1 WHERE Uid = ?2 AND Did = ?3 AND Status = ?4",
            params![SESSION_STALE, row.uid, row.did, SESSION_ACTIVE],
        )?;
        tx.execute(
            "INSERT INTO DR_sessions(Did, Uid, Ns, Nr, PN, DHr, DHrStatus, DHs, RK, CKs, CKr,
                                     AD, Status, timeStamp, X3DHInit)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                row.did,
                row.uid,
                row.ns,
                row.nr,
                row.pn,
                row.dhr,
                row.dhr_status,
                row.dhs,
                row.rk,
                row.cks,
                row.ckr,
                row.ad,
                SESSION_ACTIVE,
                now_ts(),
                row.x3dh_init,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    pub(crate) fn update_session(&self, row: &SessionRow) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE DR_sessions SET Ns = ?1, Nr = ?2, PN = ?3, DHr = ?4, DHrStatus = ?5,
                    DHs = ?6, RK = ?7, CKs = ?8, CKr = ?9, Status = ?10, timeStamp = ?11,
                    X3DHInit = ?12
             WHERE sessionId = ?13",
            params![
                row.ns,
                row.nr,
                row.pn,
                row.dhr,
                row.dhr_status,
                row.dhs,
                row.rk,
                row.cks,
                row.ckr,
                if row.active { SESSION_ACTIVE } else { SESSION_STALE },
                now_ts(),
                row.x3dh_init,
                row.id,
            ],
        )?;
        Ok(())
    }

    pub(crate) fn load_active_session(&self, uid: i64, did: i64) -> Result<Option<SessionRow>> {
        let rows = self.load_sessions_where(
            "Uid = ?1 AND Did = ?2 AND Status = 1",
            params![uid, did],
        )?;
        Ok(rows.into_iter().next())
    }

    /// Every session with a peer except `exclude`, active first, then by
    /// most recent activity.
    pub(crate) fn load_sessions(
        &self,
        uid: i64,
        did: i64,
        exclude: i64,
    ) -> Result<Vec<SessionRow>> {
        self.load_sessions_where(
            "Uid = ?1 AND Did = ?2 AND sessionId != ?3",
            params![uid, did, exclude],
        )
    }

    fn load_sessions_where(
        &self,
        predicate: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<SessionRow>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT sessionId, Did, Uid, Ns, Nr, PN, DHr, DHrStatus, DHs, RK, CKs, CKr, AD,
                    Status, X3DHInit
             FROM DR_sessions WHERE {predicate}
             ORDER BY Status DESC, timeStamp DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(args, |row| {
            let status: i64 = row.get(13)?;
            Ok(SessionRow {
                id: row.get(0)?,
                did: row.get(1)?,
                uid: row.get(2)?,
                ns: row.get(3)?,
                nr: row.get(4)?,
                pn: row.get(5)?,
                dhr: row.get(6)?,
                dhr_status: row.get(7)?,
                dhs: row.get(8)?,
                rk: row.get(9)?,
                cks: row.get(10)?,
                ckr: row.get(11)?,
                ad: row.get(12)?,
                active: status == SESSION_ACTIVE,
                x3dh_init: row.get(14)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    pub(crate) fn stale_sessions(&self, uid: i64, did: i64) -> Result<usize> {
        let conn = self.lock()?;
        Ok(conn.execute(
            "UPDATE DR_sessions SET Status = ?1 WHERE Uid = ?2 AND Did = ?3 AND Status = ?4",
            params![SESSION_STALE, uid, did, SESSION_ACTIVE],
        )?)
    }

    pub(crate) fn delete_expired_sessions(&self, uid: i64) -> Result<usize> {
        let conn = self.lock()?;
        let cutoff = now_ts() - settings::DR_SESSION_LIMBO_DAYS * settings::SECONDS_PER_DAY;
        Ok(conn.execute(
            "DELETE FROM DR_sessions
             WHERE Uid = ?1 AND Status = ?2 AND timeStamp < ?3",
            params![uid, SESSION_STALE, cutoff],
        )?)
    }

    /// Deletes a session that was never worth keeping (e.g. a transient
    /// responder session whose first message failed to decrypt is simply
    /// not persisted, so this is only used for the sending-chain overflow).
    pub(crate) fn stale_session(&self, session_id: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE DR_sessions SET Status = ?1 WHERE sessionId = ?2",
            params![SESSION_STALE, session_id],
        )?;
        Ok(())
    }

    /* ----------------------- skipped message keys -------------------- */

    /// Stores message keys skipped over on a receiving chain, enforcing the
    /// per-session retention cap by evicting the oldest keys first.
    pub(crate) fn store_skipped_keys(
        &self,
        session_id: i64,
        dhr_index: &[u8],
        keys: &[(u32, [u8; settings::DR_MESSAGE_KEY_SIZE])],
    ) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let dh_id: Option<i64> = tx
            .query_row(
                "SELECT DHid FROM DR_MSk_DHr WHERE sessionId = ?1 AND DHr = ?2",
                params![session_id, dhr_index],
                |row| row.get(0),
            )
            .optional()?;
        let dh_id = match dh_id {
            Some(id) => id,
            None => {
                tx.execute(
                    "INSERT INTO DR_MSk_DHr(sessionId, DHr, received, timeStamp)
                     VALUES (?1, ?2, 0, ?3)",
                    params![session_id, dhr_index, now_ts()],
                )?;
                tx.last_insert_rowid()
            }
        };

        for (nr, mk) in keys {
            tx.execute(
                "INSERT OR REPLACE INTO DR_MSk_MK(DHid, Nr, MK) VALUES (?1, ?2, ?3)",
                params![dh_id, nr, mk.as_slice()],
            )?;
        }
        tx.execute(
            "UPDATE DR_MSk_DHr SET received = received + ?1 WHERE DHid = ?2",
            params![keys.len() as i64, dh_id],
        )?;

        // Retention cap: evict oldest keys (oldest chain first, lowest
        // message number first) beyond the per-session budget.
        let count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM DR_MSk_MK
             WHERE DHid IN (SELECT DHid FROM DR_MSk_DHr WHERE sessionId = ?1)",
            params![session_id],
            |row| row.get(0),
        )?;
        let excess = count - settings::MAX_MESSAGES_AFTER_SKIP as i64;
        if excess > 0 {
            tx.execute(
                "DELETE FROM DR_MSk_MK WHERE (DHid, Nr) IN (
                     SELECT mk.DHid, mk.Nr FROM DR_MSk_MK mk
                     JOIN DR_MSk_DHr dh ON dh.DHid = mk.DHid
                     WHERE dh.sessionId = ?1
                     ORDER BY mk.DHid ASC, mk.Nr ASC
                     LIMIT ?2)",
                params![session_id, excess],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub(crate) fn get_skipped_key(
        &self,
        session_id: i64,
        dhr_index: &[u8],
        nr: u32,
    ) -> Result<Option<[u8; settings::DR_MESSAGE_KEY_SIZE]>> {
        let conn = self.lock()?;
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT mk.MK FROM DR_MSk_MK mk
                 JOIN DR_MSk_DHr dh ON dh.DHid = mk.DHid
                 WHERE dh.sessionId = ?1 AND dh.DHr = ?2 AND mk.Nr = ?3",
                params![session_id, dhr_index, nr],
                |row| row.get(0),
            )
            .optional()?;
        match blob {
            None => Ok(None),
            Some(bytes) => {
                let mk: [u8; settings::DR_MESSAGE_KEY_SIZE] = bytes.try_into().map_err(|_| {
                    Error::StorageFail("stored message key has a bad length".to_string())
                })?;
                Ok(Some(mk))
            }
        }
    }

    /// Removes a consumed skipped key, dropping its chain row once empty.
    pub(crate) fn delete_skipped_key(
        &self,
        session_id: i64,
        dhr_index: &[u8],
        nr: u32,
    ) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM DR_MSk_MK WHERE Nr = ?1 AND DHid IN (
                 SELECT DHid FROM DR_MSk_DHr WHERE sessionId = ?2 AND DHr = ?3)",
            params![nr, session_id, dhr_index],
        )?;
        tx.execute(
            "DELETE FROM DR_MSk_DHr WHERE sessionId = ?1 AND DHr = ?2
             AND DHid NOT IN (SELECT DISTINCT DHid FROM DR_MSk_MK)",
            params![session_id, dhr_index],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Update-sweep deletion of skipped keys attached to receiving chains
    /// older than the message-key limbo window.
    pub(crate) fn delete_old_skipped_chains(&self, uid: i64) -> Result<usize> {
        let conn = self.lock()?;
        let cutoff = now_ts() - settings::MK_LIMBO_DAYS * settings::SECONDS_PER_DAY;
        Ok(conn.execute(
            "DELETE FROM DR_MSk_DHr WHERE timeStamp < ?1 AND sessionId IN (
                 SELECT sessionId FROM DR_sessions WHERE Uid = ?2)",
            params![cutoff, uid],
        )?)
    }

    /// Test hook shifting a signed prekey's creation time into the past.
    #[cfg(test)]
    pub(crate) fn age_spk(&self, uid: i64, days: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE X3DH_SPK SET timeStamp = timeStamp - ?1 WHERE Uid = ?2",
            params![days * settings::SECONDS_PER_DAY, uid],
        )?;
        Ok(())
    }
}
